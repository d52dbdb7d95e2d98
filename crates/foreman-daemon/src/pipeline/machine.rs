//! Step transition table.

use crate::storage::Role;

/// How one step ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded { report: Option<String> },
    Failed { reason: String },
}

impl StepOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

/// What the run does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Start the next role.
    Advance(Role),
    /// Run the same role again.
    Retry(Role),
    /// Every role succeeded.
    Complete,
    /// The role failed on its last attempt.
    Fail(Role),
}

/// Attempts per role: the first try plus one retry.
pub const MAX_ATTEMPTS: u32 = 2;

/// Decide the transition after `role` finished its `attempt` (1-based).
pub const fn transition(role: Role, succeeded: bool, attempt: u32) -> Transition {
    match (succeeded, role.next()) {
        (true, Some(next)) => Transition::Advance(next),
        (true, None) => Transition::Complete,
        (false, _) if attempt < MAX_ATTEMPTS => Transition::Retry(role),
        (false, _) => Transition::Fail(role),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_advances_through_roles() {
        assert_eq!(transition(Role::Architect, true, 1), Transition::Advance(Role::Coder));
        assert_eq!(transition(Role::Coder, true, 2), Transition::Advance(Role::Reviewer));
        assert_eq!(transition(Role::Reviewer, true, 1), Transition::Advance(Role::Tester));
        assert_eq!(transition(Role::Tester, true, 1), Transition::Complete);
    }

    #[test]
    fn failure_retries_once_then_fails() {
        assert_eq!(transition(Role::Coder, false, 1), Transition::Retry(Role::Coder));
        assert_eq!(transition(Role::Coder, false, 2), Transition::Fail(Role::Coder));
        assert_eq!(transition(Role::Tester, false, 2), Transition::Fail(Role::Tester));
        assert_eq!(transition(Role::Architect, false, 3), Transition::Fail(Role::Architect));
    }
}
