//! Transition rules for the task state machine.
//!
//! Terminal states are absorbing: once a work item is `done`, `failed`,
//! or `cancelled` nothing moves it again except a crash-recovery reset,
//! which only ever touches `in_progress`/`review` rows. `blocked` can
//! only be entered through the store's compound block operation, which
//! records the reason atomically with the status change.

use crate::core::types::TaskStatus;

/// True for states with no outbound transitions.
pub fn is_terminal(status: TaskStatus) -> bool {
    matches!(
        status,
        TaskStatus::Done | TaskStatus::Failed | TaskStatus::Cancelled
    )
}

/// Whether a plain status update from `from` to `to` is legal.
///
/// Entering `blocked` is never legal here; callers must use the compound
/// block operation so `blocked_reason` is set in the same write.
pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
    if from == to {
        return true;
    }
    if is_terminal(from) {
        return false;
    }
    to != TaskStatus::Blocked
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_absorbing() {
        for from in [TaskStatus::Done, TaskStatus::Failed, TaskStatus::Cancelled] {
            for to in [
                TaskStatus::Backlog,
                TaskStatus::InProgress,
                TaskStatus::Review,
                TaskStatus::Done,
                TaskStatus::Failed,
            ] {
                if from == to {
                    continue;
                }
                assert!(!can_transition(from, to), "{from} -> {to} must be rejected");
            }
        }
    }

    #[test]
    fn fix_loop_transitions_are_legal() {
        assert!(can_transition(TaskStatus::Backlog, TaskStatus::InProgress));
        assert!(can_transition(TaskStatus::InProgress, TaskStatus::Review));
        assert!(can_transition(TaskStatus::Review, TaskStatus::Done));
        assert!(can_transition(TaskStatus::Review, TaskStatus::Backlog));
        assert!(can_transition(TaskStatus::Review, TaskStatus::InProgress));
        assert!(can_transition(TaskStatus::InProgress, TaskStatus::Failed));
        assert!(can_transition(TaskStatus::Blocked, TaskStatus::Cancelled));
        assert!(can_transition(TaskStatus::Blocked, TaskStatus::Backlog));
    }

    #[test]
    fn blocked_requires_the_compound_operation() {
        assert!(!can_transition(TaskStatus::Backlog, TaskStatus::Blocked));
        assert!(!can_transition(TaskStatus::InProgress, TaskStatus::Blocked));
    }

    #[test]
    fn same_state_is_a_no_op() {
        assert!(can_transition(TaskStatus::Done, TaskStatus::Done));
        assert!(can_transition(TaskStatus::Backlog, TaskStatus::Backlog));
    }
}
