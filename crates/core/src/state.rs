//! Stage state machine.
//!
//! ```text
//! registered → categorizing → queued → staging → separating → reconstructing → organizing → completed
//!      └──────────────┴────────────┴─────────┴───────────┴──────────────┴────────────┴──→ failed
//! failed → queued (retry, bounded by the attempt ceiling) | failed-terminal
//! failed-terminal → queued (operator override only)
//! * → cancelling → failed-terminal | deleted      (operator)
//! * → deleted                                     (operator)
//! ```
//!
//! The retry loop is bounded: every pass through a working stage increments
//! its attempt counter and `failed → queued` is refused at the ceiling.

use serde::{Deserialize, Serialize};

/// Current node of a job in the stage state machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Registered,
    Categorizing,
    Queued,
    Staging,
    Separating,
    Reconstructing,
    Organizing,
    Completed,
    Failed,
    #[serde(rename = "failed-terminal")]
    FailedTerminal,
    Cancelling,
    Deleted,
}

/// Who performs a transition. Recorded in `stage_history`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "id")]
pub enum Actor {
    /// Registrar creating the record.
    Registrar,
    /// Stage router (admission, dispatch, automatic retry).
    Router,
    /// A stage worker committing through the handoff protocol.
    Worker(String),
    /// Recovery sweeper converting silence into explicit errors.
    Sweeper,
    /// Operator / compliance action.
    Operator,
}

impl Actor {
    pub fn is_operator(&self) -> bool {
        matches!(self, Actor::Operator)
    }
}

impl core::fmt::Display for Actor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Actor::Registrar => f.write_str("registrar"),
            Actor::Router => f.write_str("router"),
            Actor::Worker(id) => write!(f, "worker:{id}"),
            Actor::Sweeper => f.write_str("sweeper"),
            Actor::Operator => f.write_str("operator"),
        }
    }
}

impl JobState {
    pub const ALL: [JobState; 12] = [
        JobState::Registered,
        JobState::Categorizing,
        JobState::Queued,
        JobState::Staging,
        JobState::Separating,
        JobState::Reconstructing,
        JobState::Organizing,
        JobState::Completed,
        JobState::Failed,
        JobState::FailedTerminal,
        JobState::Cancelling,
        JobState::Deleted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Registered => "registered",
            JobState::Categorizing => "categorizing",
            JobState::Queued => "queued",
            JobState::Staging => "staging",
            JobState::Separating => "separating",
            JobState::Reconstructing => "reconstructing",
            JobState::Organizing => "organizing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::FailedTerminal => "failed-terminal",
            JobState::Cancelling => "cancelling",
            JobState::Deleted => "deleted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::FailedTerminal | JobState::Deleted
        )
    }

    /// Working stage associated with this state, if any.
    pub fn stage(self) -> Option<Stage> {
        Stage::ALL.into_iter().find(|s| s.state() == self)
    }

    /// Whether `self → to` is an edge of the state machine for `actor`.
    ///
    /// Preconditions (classification present, attempt ceiling, fencing) are
    /// checked by the job record, not here.
    pub fn can_transition(self, to: JobState, actor: &Actor) -> bool {
        use JobState::*;

        if self == Deleted {
            return false;
        }
        // Operator-only edges.
        if to == Deleted {
            return actor.is_operator() || (self == Cancelling);
        }
        if to == Cancelling {
            return actor.is_operator() && !self.is_terminal() && self != Cancelling;
        }
        if self == FailedTerminal {
            return to == Queued && actor.is_operator();
        }

        match (self, to) {
            (Registered, Categorizing)
            | (Categorizing, Queued)
            | (Queued, Staging)
            | (Staging, Separating)
            | (Separating, Reconstructing)
            | (Reconstructing, Organizing)
            | (Organizing, Completed) => true,
            (Failed, Queued) | (Failed, FailedTerminal) => true,
            (Cancelling, FailedTerminal) => true,
            (from, Failed) => !from.is_terminal() && from != Failed && from != Cancelling,
            _ => false,
        }
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A working stage: a state in which an external worker performs work under
/// an advisory lock and commits through the handoff protocol.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Categorizing,
    Staging,
    Separating,
    Reconstructing,
    Organizing,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Categorizing,
        Stage::Staging,
        Stage::Separating,
        Stage::Reconstructing,
        Stage::Organizing,
    ];

    pub fn state(self) -> JobState {
        match self {
            Stage::Categorizing => JobState::Categorizing,
            Stage::Staging => JobState::Staging,
            Stage::Separating => JobState::Separating,
            Stage::Reconstructing => JobState::Reconstructing,
            Stage::Organizing => JobState::Organizing,
        }
    }

    /// State a successful handoff advances to.
    pub fn next_state(self) -> JobState {
        match self {
            Stage::Categorizing => JobState::Queued,
            Stage::Staging => JobState::Separating,
            Stage::Separating => JobState::Reconstructing,
            Stage::Reconstructing => JobState::Organizing,
            Stage::Organizing => JobState::Completed,
        }
    }

    /// Stage whose committed output is this stage's input (`None` = source artifact).
    pub fn input_stage(self) -> Option<Stage> {
        match self {
            Stage::Categorizing | Stage::Staging => None,
            Stage::Separating => Some(Stage::Staging),
            Stage::Reconstructing => Some(Stage::Separating),
            Stage::Organizing => Some(Stage::Reconstructing),
        }
    }

    /// Whether a successful handoff must publish an output artifact.
    pub fn produces_output(self) -> bool {
        !matches!(self, Stage::Categorizing)
    }

    pub fn as_str(self) -> &'static str {
        self.state().as_str()
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }
}

impl core::fmt::Display for Stage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker() -> Actor {
        Actor::Worker("w1".into())
    }

    #[test]
    fn happy_path_edges_are_legal() {
        let path = [
            JobState::Registered,
            JobState::Categorizing,
            JobState::Queued,
            JobState::Staging,
            JobState::Separating,
            JobState::Reconstructing,
            JobState::Organizing,
            JobState::Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition(pair[1], &worker()), "{pair:?}");
        }
    }

    #[test]
    fn skipping_stages_is_illegal() {
        assert!(!JobState::Registered.can_transition(JobState::Queued, &worker()));
        assert!(!JobState::Staging.can_transition(JobState::Completed, &worker()));
        assert!(!JobState::Queued.can_transition(JobState::Registered, &Actor::Operator));
    }

    #[test]
    fn failed_is_reachable_from_every_working_state() {
        for state in JobState::ALL {
            let expected = !state.is_terminal()
                && state != JobState::Failed
                && state != JobState::Cancelling;
            assert_eq!(
                state.can_transition(JobState::Failed, &Actor::Sweeper),
                expected,
                "{state}"
            );
        }
    }

    #[test]
    fn terminal_retry_requires_operator() {
        assert!(!JobState::FailedTerminal.can_transition(JobState::Queued, &Actor::Router));
        assert!(JobState::FailedTerminal.can_transition(JobState::Queued, &Actor::Operator));
        assert!(JobState::Failed.can_transition(JobState::Queued, &Actor::Router));
    }

    #[test]
    fn deletion_and_cancellation_are_operator_actions() {
        assert!(JobState::Completed.can_transition(JobState::Deleted, &Actor::Operator));
        assert!(!JobState::Completed.can_transition(JobState::Deleted, &worker()));
        assert!(JobState::Separating.can_transition(JobState::Cancelling, &Actor::Operator));
        assert!(!JobState::Separating.can_transition(JobState::Cancelling, &worker()));
        assert!(JobState::Cancelling.can_transition(JobState::FailedTerminal, &worker()));
        assert!(!JobState::Deleted.can_transition(JobState::Queued, &Actor::Operator));
    }

    #[test]
    fn stages_chain_into_each_other() {
        for stage in Stage::ALL {
            if let Some(input) = stage.input_stage() {
                assert_eq!(input.next_state(), stage.state());
            }
            assert_eq!(stage.state().stage(), Some(stage));
        }
        assert_eq!(JobState::parse("failed-terminal"), Some(JobState::FailedTerminal));
        assert_eq!(Stage::parse("separating"), Some(Stage::Separating));
    }
}
