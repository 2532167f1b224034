//! Stored lifecycle status of a saga instance.

use serde::{Deserialize, Serialize};

use crate::context::TransitionKind;

/// The status of a persisted saga instance.
///
/// Status transitions:
/// ```text
/// Active ──┬──► Completed
///          └──► Failed
/// ```
/// `Continue` and `Compensate` keep the saga `Active`; `Retry` leaves the
/// stored record untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SagaStatus {
    /// The saga accepts further step and compensate messages.
    #[default]
    Active,

    /// The saga finished successfully (terminal state).
    Completed,

    /// The saga gave up after an explicit `Fail` transition (terminal state).
    Failed,
}

impl SagaStatus {
    /// Returns the status a transition leaves the saga in.
    ///
    /// Returns None for `Retry`, which does not advance the saga.
    pub fn after(kind: TransitionKind) -> Option<Self> {
        match kind {
            TransitionKind::Continue | TransitionKind::Compensate => Some(SagaStatus::Active),
            TransitionKind::Complete => Some(SagaStatus::Completed),
            TransitionKind::Fail => Some(SagaStatus::Failed),
            TransitionKind::Retry => None,
        }
    }

    /// Returns true if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaStatus::Completed | SagaStatus::Failed)
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Active => "Active",
            SagaStatus::Completed => "Completed",
            SagaStatus::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
