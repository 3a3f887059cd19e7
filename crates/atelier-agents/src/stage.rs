//! Typed stage tracker with legal-transition guards.
//!
//! The orchestrator advances through stages via [`StageTracker::advance`];
//! an illegal transition is a bug, not an input error, so it surfaces as a
//! typed error the orchestrator treats as internal. The transition log makes
//! run traces auditable after the fact.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Pipeline stages in lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Init,
    Requirements,
    Architecture,
    Implementer,
    Review,
    Repair,
    Completed,
    Failed,
}

impl PipelineStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Self::Init => "init",
            Self::Requirements => "requirements",
            Self::Architecture => "architecture",
            Self::Implementer => "implementer",
            Self::Review => "review",
            Self::Repair => "repair",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{tag}")
    }
}

/// Legal edges of the stage graph.
///
/// ```text
/// Init → Requirements | Implementer (resume with architecture override)
/// Requirements → Architecture
/// Architecture → Implementer
/// Implementer → Review
/// Review → Repair | Completed
/// Repair → Completed
/// any non-terminal → Failed
/// ```
fn is_legal_transition(from: PipelineStage, to: PipelineStage) -> bool {
    use PipelineStage::*;

    if to == Failed && !from.is_terminal() {
        return true;
    }
    matches!(
        (from, to),
        (Init, Requirements)
            | (Init, Implementer)
            | (Requirements, Architecture)
            | (Architecture, Implementer)
            | (Implementer, Review)
            | (Review, Repair)
            | (Review, Completed)
            | (Repair, Completed)
    )
}

/// A recorded transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTransition {
    pub from: PipelineStage,
    pub to: PipelineStage,
    pub elapsed_ms: u64,
}

/// Error for a transition outside the stage graph.
#[derive(Debug, Clone)]
pub struct IllegalTransition {
    pub from: PipelineStage,
    pub to: PipelineStage,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal stage transition: {} → {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

/// Tracks the current stage and the full transition log of a run.
#[derive(Debug)]
pub struct StageTracker {
    current: PipelineStage,
    created_at: Instant,
    transitions: Vec<StageTransition>,
}

impl StageTracker {
    pub fn new() -> Self {
        Self {
            current: PipelineStage::Init,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> PipelineStage {
        self.current
    }

    pub fn advance(&mut self, to: PipelineStage) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalTransition {
                from: self.current,
                to,
            });
        }
        tracing::debug!(from = %self.current, to = %to, "stage transition");
        self.transitions.push(StageTransition {
            from: self.current,
            to,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
        });
        self.current = to;
        Ok(())
    }

    pub fn fail(&mut self) {
        // Always legal from non-terminal stages; a double failure is a no-op.
        let _ = self.advance(PipelineStage::Failed);
    }

    pub fn transitions(&self) -> &[StageTransition] {
        &self.transitions
    }

    pub fn summary(&self) -> String {
        let path: Vec<String> = std::iter::once(PipelineStage::Init.to_string())
            .chain(self.transitions.iter().map(|t| t.to.to_string()))
            .collect();
        path.join(" → ")
    }
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}
