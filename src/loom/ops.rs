use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// The mode in which a replica is requested from a [`TensorArray`](super::array::TensorArray).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Access {
    /// The replica is brought up to date and handed out read-only.
    ReadOnly,
    /// The replica is brought up to date and becomes the master.
    ReadWrite,
    /// The replica becomes the master without being brought up to date.
    /// Its contents are unspecified until the caller overwrites them.
    WriteOnly,
}

impl Access {
    /// Returns `true` if the access moves the master replica.
    #[inline]
    pub fn is_mutable(self) -> bool {
        !matches!(self, Access::ReadOnly)
    }

    /// Returns `true` if the access needs the replica's current contents.
    #[inline]
    pub fn is_readable(self) -> bool {
        !matches!(self, Access::WriteOnly)
    }
}
