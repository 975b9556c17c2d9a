//! Ref update commands and their per-ref results.

use std::fmt;

use crate::object::id::ObjectId;

/// One requested ref change.
///
/// `expected_old` is compared against the ref's current value under the
/// lock: [`ObjectId::ZERO`] means the ref must not exist, anything else
/// must equal the stored id. `new_id` of zero deletes the ref.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefCommand {
    /// Full ref name.
    pub name: String,
    /// Required current value (zero id: must be absent).
    pub expected_old: ObjectId,
    /// New value (zero id: delete).
    pub new_id: ObjectId,
    /// Reflog message.
    pub message: String,
}

impl RefCommand {
    /// Creates a command.
    #[must_use]
    pub fn new(name: &str, expected_old: ObjectId, new_id: ObjectId, message: &str) -> Self {
        Self {
            name: name.to_owned(),
            expected_old,
            new_id,
            message: message.to_owned(),
        }
    }

    /// True when this command deletes the ref.
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.new_id.is_zero()
    }
}

/// Per-ref outcome of an update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateStatus {
    /// The ref now holds the new value.
    Ok,
    /// The lock could not be acquired within the retry bound.
    LockFailure,
    /// The stored value did not match `expected_old`.
    RejectedStale { actual: Option<ObjectId> },
    /// The ref name is not a valid refname.
    RejectedBadName,
    /// Rejected by a policy hook (server-side push).
    RejectedByHook { reason: String },
    /// Storage failed mid-update.
    IoFailure { detail: String },
}

impl UpdateStatus {
    /// True for [`UpdateStatus::Ok`].
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Wire-facing failure word for `report-status` (`ng <reason>`).
    #[must_use]
    pub fn reject_reason(&self) -> Option<String> {
        match self {
            Self::Ok => None,
            Self::LockFailure => Some("failed to lock".to_owned()),
            Self::RejectedStale { .. } => Some("stale info".to_owned()),
            Self::RejectedBadName => Some("funny refname".to_owned()),
            Self::RejectedByHook { reason } => Some(reason.clone()),
            Self::IoFailure { detail } => Some(detail.clone()),
        }
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reject_reason() {
            None => write!(f, "ok"),
            Some(reason) => write!(f, "ng {reason}"),
        }
    }
}
