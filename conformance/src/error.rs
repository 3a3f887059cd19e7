//! Error taxonomy for the generation pipeline.
//!
//! Earlier stages (requirements, architecture, implementer) propagate these
//! as terminal failures; later stages (review, repair) degrade gracefully and
//! report the error inside the completion artifact instead. Validator output
//! is a signal, not an error, and never appears here.

use thiserror::Error;

/// Result alias used across the pipeline crates.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Pipeline error taxonomy.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Charter missing entities/endpoints, unsupported start stage, or a
    /// resume request without the required architecture override.
    #[error("invalid pipeline input: {0}")]
    InputInvalid(String),

    /// Structured LLM output could not be recovered after the retry pass.
    #[error("unusable structured LLM output: {0}")]
    LlmOutputInvalid(String),

    /// Container CLI missing, port range exhausted, or the container never
    /// became ready.
    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    /// Run/artifact persistence failed.
    #[error("persistence failure: {0}")]
    Store(String),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failure: {0}")]
    Serde(#[from] serde_json::Error),

    /// Unexpected failure inside a stage.
    #[error("internal pipeline failure: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn input(msg: impl Into<String>) -> Self {
        Self::InputInvalid(msg.into())
    }

    pub fn llm_output(msg: impl Into<String>) -> Self {
        Self::LlmOutputInvalid(msg.into())
    }

    pub fn sandbox(msg: impl Into<String>) -> Self {
        Self::SandboxUnavailable(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error is terminal for the whole run when raised by an
    /// early stage.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::SandboxUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PipelineError::input("charter has no entities");
        assert_eq!(
            err.to_string(),
            "invalid pipeline input: charter has no entities"
        );
    }

    #[test]
    fn test_sandbox_errors_are_not_terminal() {
        assert!(!PipelineError::sandbox("no free ports").is_terminal());
        assert!(PipelineError::input("bad start stage").is_terminal());
        assert!(PipelineError::llm_output("not json").is_terminal());
    }
}
