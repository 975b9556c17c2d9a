//! Per-commit flag bits, stored in the walker's slot arena rather than on
//! commit objects, so a walk can be reset by clearing one vector.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// A small bitset of walk flags.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitFlags(u8);

impl CommitFlags {
    /// No flags.
    pub const EMPTY: Self = Self(0);
    /// Commit has entered the pending queue.
    pub const SEEN: Self = Self(1 << 0);
    /// Commit (and transitively its ancestors) must not be emitted.
    pub const UNINTERESTING: Self = Self(1 << 1);
    /// Interesting commit with an uninteresting parent edge.
    pub const BOUNDARY: Self = Self(1 << 2);
    /// Explicit start point supplied by the caller.
    pub const ADDED: Self = Self(1 << 3);
    /// First user bit; the walker never touches this or higher bits.
    pub const USER_1: Self = Self(1 << 4);
    /// Second user bit.
    pub const USER_2: Self = Self(1 << 5);

    /// True when every bit of `other` is set here.
    #[inline]
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when no bits are set.
    #[inline]
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for CommitFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for CommitFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for CommitFlags {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for CommitFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        for (bit, name) in [
            (Self::SEEN, "SEEN"),
            (Self::UNINTERESTING, "UNINTERESTING"),
            (Self::BOUNDARY, "BOUNDARY"),
            (Self::ADDED, "ADDED"),
            (Self::USER_1, "USER_1"),
            (Self::USER_2, "USER_2"),
        ] {
            if self.contains(bit) {
                names.push(name);
            }
        }
        write!(f, "CommitFlags({})", names.join("|"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_test() {
        let mut flags = CommitFlags::EMPTY;
        assert!(flags.is_empty());
        flags |= CommitFlags::SEEN;
        flags |= CommitFlags::UNINTERESTING;
        assert!(flags.contains(CommitFlags::SEEN));
        assert!(flags.contains(CommitFlags::SEEN | CommitFlags::UNINTERESTING));
        assert!(!flags.contains(CommitFlags::BOUNDARY));
    }
}
