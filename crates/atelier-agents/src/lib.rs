//! LLM agent layer and streaming orchestrator for the backend generation
//! pipeline.
//!
//! The deterministic subsystems (validator, normalizers, sandbox harness,
//! test runner, persistence) live in the `conformance` crate; this crate
//! owns everything that talks to a language model and the orchestrator that
//! sequences the stages into a typed event stream.

pub mod agents;
pub mod config;
pub mod events;
pub mod llm;
pub mod orchestrator;
pub mod prompts;
pub mod repair;
pub mod stage;

pub use agents::architecture::ArchitectureAgent;
pub use agents::implementer::{
    architecture_mentions_auth, default_plan, FilePlan, ImplementationPlan, ImplementerAgent,
};
pub use agents::requirements::RequirementsAgent;
pub use agents::reviewer::ReviewerAgent;
pub use agents::AgentSet;
pub use config::{LlmEndpoint, PipelineConfig};
pub use events::{Cancelled, EventSink, PipelineEvent};
pub use llm::{generate_structured, LanguageModel, OpenAiCompatClient};
pub use orchestrator::{Pipeline, PipelineOptions, RuntimeMode, StartStage};
pub use repair::{RepairAgent, RepairContext};
pub use stage::{PipelineStage, StageTracker};
