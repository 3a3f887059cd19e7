//! Typed pipeline event stream.
//!
//! Every run produces a totally ordered sequence of events ending in exactly
//! one terminal event (`completed` or `error`). The external surface
//! serializes each event as one JSON object whose `status` field carries the
//! stage tag.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// One pipeline progress event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PipelineEvent {
    Starting {
        message: String,
    },
    Requirements {
        message: String,
    },
    RequirementsDone {
        artifact: Value,
    },
    Architecture {
        message: String,
    },
    ArchitectureDone {
        artifact: Value,
    },
    Implementer {
        message: String,
    },
    ImplementerDone {
        files_count: usize,
        artifact: Value,
    },
    Reviewer {
        message: String,
    },
    ReviewPass {
        attempt: u32,
        approved: bool,
        security_score: u8,
    },
    Revision {
        message: String,
        attempt: u32,
        issues_count: usize,
        affected_files: Vec<String>,
    },
    ReviewerDone {
        message: String,
        artifact: Value,
    },
    Repairer {
        message: String,
    },
    RepairRevision {
        attempt: u32,
        message: String,
        affected_files: Vec<String>,
    },
    RepairerDone {
        message: String,
        artifact: Value,
    },
    Completed {
        message: String,
        approved: bool,
        artifact: Value,
    },
    Error {
        message: String,
    },
}

impl PipelineEvent {
    /// The `status` tag this event serializes under.
    pub fn status(&self) -> &'static str {
        match self {
            Self::Starting { .. } => "starting",
            Self::Requirements { .. } => "requirements",
            Self::RequirementsDone { .. } => "requirements_done",
            Self::Architecture { .. } => "architecture",
            Self::ArchitectureDone { .. } => "architecture_done",
            Self::Implementer { .. } => "implementer",
            Self::ImplementerDone { .. } => "implementer_done",
            Self::Reviewer { .. } => "reviewer",
            Self::ReviewPass { .. } => "review_pass",
            Self::Revision { .. } => "revision",
            Self::ReviewerDone { .. } => "reviewer_done",
            Self::Repairer { .. } => "repairer",
            Self::RepairRevision { .. } => "repair_revision",
            Self::RepairerDone { .. } => "repairer_done",
            Self::Completed { .. } => "completed",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Error { .. })
    }
}

/// The caller hung up; the run must stop at the next suspension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Sending half of a run's event stream.
///
/// A failed send means the sole reader dropped the receiver: the run treats
/// that as cancellation.
#[derive(Clone)]
pub struct EventSink {
    sender: mpsc::Sender<PipelineEvent>,
}

impl EventSink {
    pub fn new(sender: mpsc::Sender<PipelineEvent>) -> Self {
        Self { sender }
    }

    pub async fn emit(&self, event: PipelineEvent) -> Result<(), Cancelled> {
        self.sender.send(event).await.map_err(|_| Cancelled)
    }

    /// Whether the reader is still attached.
    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_tags_match_serialization() {
        let events = vec![
            PipelineEvent::Starting {
                message: "Initializing pipeline...".into(),
            },
            PipelineEvent::RequirementsDone {
                artifact: json!({}),
            },
            PipelineEvent::ReviewPass {
                attempt: 1,
                approved: false,
                security_score: 5,
            },
            PipelineEvent::RepairRevision {
                attempt: 2,
                message: "patching".into(),
                affected_files: vec!["app/routes.py".into()],
            },
            PipelineEvent::Completed {
                message: "done".into(),
                approved: true,
                artifact: json!({}),
            },
        ];
        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["status"], event.status(), "mismatch for {event:?}");
        }
    }

    #[test]
    fn test_terminal_detection() {
        assert!(PipelineEvent::Completed {
            message: String::new(),
            approved: false,
            artifact: json!(null),
        }
        .is_terminal());
        assert!(PipelineEvent::Error {
            message: String::new()
        }
        .is_terminal());
        assert!(!PipelineEvent::Reviewer {
            message: String::new()
        }
        .is_terminal());
    }

    #[tokio::test]
    async fn test_sink_reports_cancellation_when_receiver_drops() {
        let (tx, rx) = mpsc::channel(4);
        let sink = EventSink::new(tx);
        drop(rx);
        assert!(!sink.is_open());
        assert_eq!(
            sink.emit(PipelineEvent::Starting {
                message: "x".into()
            })
            .await,
            Err(Cancelled)
        );
    }

    #[test]
    fn test_event_roundtrip() {
        let event = PipelineEvent::Revision {
            message: "regenerating".into(),
            attempt: 2,
            issues_count: 3,
            affected_files: vec!["app/routes.py".into()],
        };
        let json = serde_json::to_string(&event).unwrap();
        let restored: PipelineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.status(), "revision");
    }
}
