//! Per-request pipeline state machine.
//!
//! The orchestrator never branches on ad hoc flags. It feeds
//! [`PipelineEvent`]s into a [`StateMachine`], which rejects any transition
//! that is not in the table below:
//!
//! ```text
//! Received ──Stored──▶ Stored ──Extracted──▶ Extracted ──Analyzed──▶ Analyzed
//!                                                 │                     │
//!                                          AnalysisSkipped        Rendered │ AudioSkipped
//!                                                 ▼                     ▼
//!                                            AudioSkipped ◀──────  Rendered
//!                                                 └──Finished──▶ Completed ◀──Finished──┘
//!
//! any non-terminal state ──StageFailed(next stage)──▶ Failed(stage, reason)
//! ```

use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::schema::FailureReason;

/// The external-facing stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Storage,
    Extraction,
    Analysis,
    Speech,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Storage => "storage",
            Stage::Extraction => "extraction",
            Stage::Analysis => "analysis",
            Stage::Speech => "speech",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineState {
    Received,
    Stored,
    Extracted,
    Analyzed,
    Rendered,
    AudioSkipped,
    Completed,
    Failed { stage: Stage, reason: FailureReason },
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. })
    }

    /// The stage whose outcome moves the machine out of this state.
    pub fn pending_stage(&self) -> Option<Stage> {
        match self {
            Self::Received => Some(Stage::Storage),
            Self::Stored => Some(Stage::Extraction),
            Self::Extracted => Some(Stage::Analysis),
            Self::Analyzed => Some(Stage::Speech),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Stored => "stored",
            Self::Extracted => "extracted",
            Self::Analyzed => "analyzed",
            Self::Rendered => "rendered",
            Self::AudioSkipped => "audio_skipped",
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    Stored,
    Extracted,
    Analyzed,
    AnalysisSkipped,
    Rendered,
    AudioSkipped,
    Finished,
    StageFailed { stage: Stage, reason: FailureReason },
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid transition from {from} on {event:?}")]
pub struct TransitionError {
    pub from: &'static str,
    pub event: PipelineEvent,
}

/// The current state plus every state visited, for reporting.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: PipelineState,
    history: Vec<PipelineState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: PipelineState::Received,
            history: vec![PipelineState::Received],
        }
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    pub fn apply(&mut self, event: PipelineEvent) -> Result<&PipelineState, TransitionError> {
        use PipelineEvent as E;
        use PipelineState as S;

        let next = match (&self.state, &event) {
            (S::Received, E::Stored) => Some(S::Stored),
            (S::Stored, E::Extracted) => Some(S::Extracted),
            (S::Extracted, E::Analyzed) => Some(S::Analyzed),
            (S::Extracted, E::AnalysisSkipped) => Some(S::AudioSkipped),
            (S::Analyzed, E::Rendered) => Some(S::Rendered),
            (S::Analyzed, E::AudioSkipped) => Some(S::AudioSkipped),
            (S::Rendered | S::AudioSkipped, E::Finished) => Some(S::Completed),
            (current, E::StageFailed { stage, reason })
                if current.pending_stage() == Some(*stage) =>
            {
                Some(S::Failed {
                    stage: *stage,
                    reason: reason.clone(),
                })
            }
            _ => None,
        };

        let Some(next) = next else {
            return Err(TransitionError {
                from: self.state.label(),
                event,
            });
        };

        self.state = next;
        self.history.push(self.state.clone());
        Ok(&self.state)
    }

    pub fn into_parts(self) -> (PipelineState, Vec<PipelineState>) {
        (self.state, self.history)
    }
}
