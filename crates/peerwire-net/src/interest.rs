//! Interest masks

use mio::Interest;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Which operations a handler wants to be told about.
///
/// Bit values follow the classic selector constants. Read and accept map to
/// readable readiness, write and connect to writable readiness.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct InterestOps(u8);

impl InterestOps {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1);
    pub const WRITE: Self = Self(1 << 2);
    pub const CONNECT: Self = Self(1 << 3);
    pub const ACCEPT: Self = Self(1 << 4);

    const ALL: u8 = Self::READ.0 | Self::WRITE.0 | Self::CONNECT.0 | Self::ACCEPT.0;

    /// Build from raw bits, dropping unknown ones
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ALL)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Poller interest, or `None` for an empty mask
    pub fn to_mio(self) -> Option<Interest> {
        let readable = self.0 & (Self::READ.0 | Self::ACCEPT.0) != 0;
        let writable = self.0 & (Self::WRITE.0 | Self::CONNECT.0) != 0;
        match (readable, writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

impl BitOr for InterestOps {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for InterestOps {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for InterestOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let names = [
            (Self::READ, "READ"),
            (Self::WRITE, "WRITE"),
            (Self::CONNECT, "CONNECT"),
            (Self::ACCEPT, "ACCEPT"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(op, _)| self.contains(*op))
            .map(|(_, name)| *name)
            .collect();
        f.write_str(&set.join("|"))
    }
}
