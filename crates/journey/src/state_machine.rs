use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Stages a trigger passes through on its way to a scheduled sequence.
///
/// Handling ends at `Scheduled` or `SkippedDuplicate`. Completion happens
/// later, when the final step is sent, and is tracked on the record as
/// `SequenceStatus::Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationState {
    Received,
    Classified,
    SkippedDuplicate,
    Created,
    Scheduled,
}

/// Describes a single valid state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: OrchestrationState,
    pub to: OrchestrationState,
    pub trigger: String,
}

/// Guards the trigger lifecycle by enforcing a finite set of valid
/// state transitions.
#[derive(Debug, Clone)]
pub struct OrchestrationStateMachine {
    pub state: OrchestrationState,
    pub transitions: Vec<StateTransition>,
}

impl OrchestrationStateMachine {
    /// Starts in `Received` with all valid transitions pre-configured.
    pub fn new() -> Self {
        use OrchestrationState::*;

        let transitions = [
            (Received, Classified, "classified"),
            (Received, SkippedDuplicate, "active_sequence_found"),
            (Classified, SkippedDuplicate, "active_sequence_found"),
            (Classified, Created, "record_created"),
            (Created, Scheduled, "steps_scheduled"),
            // Re-scheduling steps a previous trigger failed to queue.
            (SkippedDuplicate, Scheduled, "pending_steps_rescheduled"),
        ]
        .into_iter()
        .map(|(from, to, trigger)| StateTransition {
            from,
            to,
            trigger: trigger.to_string(),
        })
        .collect();

        Self {
            state: Received,
            transitions,
        }
    }

    /// Returns `true` if the given transition is allowed.
    pub fn can_transition(&self, from: &OrchestrationState, to: &OrchestrationState) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.to == *to)
    }

    /// Attempts to move the state machine to `to`. Returns an error if the
    /// transition is not permitted.
    pub fn transition(&mut self, to: OrchestrationState) -> Result<()> {
        if self.can_transition(&self.state, &to) {
            self.state = to;
            Ok(())
        } else {
            Err(anyhow!(
                "Invalid state transition from {:?} to {:?}",
                self.state,
                to
            ))
        }
    }
}

impl Default for OrchestrationStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
