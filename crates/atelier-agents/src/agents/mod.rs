//! Pipeline agents.
//!
//! Each agent wraps one LLM responsibility behind a typed artifact contract.
//! The [`AgentSet`] ties them together: production builds one OpenAI-spec
//! client per configured endpoint; tests inject a scripted model.

pub mod architecture;
pub mod implementer;
pub mod requirements;
pub mod reviewer;

use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::llm::{LanguageModel, OpenAiCompatClient};
use architecture::ArchitectureAgent;
use implementer::ImplementerAgent;
use requirements::RequirementsAgent;
use reviewer::ReviewerAgent;

/// The full agent roster for one pipeline.
pub struct AgentSet {
    pub requirements: RequirementsAgent,
    pub architecture: ArchitectureAgent,
    pub implementer: ImplementerAgent,
    pub reviewer: ReviewerAgent,
}

impl AgentSet {
    /// Build agents against the configured endpoints.
    pub fn from_config(config: &PipelineConfig) -> Self {
        let structured: Arc<dyn LanguageModel> = Arc::new(
            OpenAiCompatClient::new(
                &config.structured.base_url,
                &config.structured.api_key,
                &config.structured.model,
            )
            .with_timeout(config.llm_timeout),
        );
        let reviewer: Arc<dyn LanguageModel> = Arc::new(
            OpenAiCompatClient::new(
                &config.reviewer.base_url,
                &config.reviewer.api_key,
                &config.reviewer.model,
            )
            .with_timeout(config.llm_timeout),
        );
        let implementer: Arc<dyn LanguageModel> = Arc::new(
            OpenAiCompatClient::new(
                &config.implementer.base_url,
                &config.implementer.api_key,
                &config.implementer.model,
            )
            .with_timeout(config.llm_timeout),
        );

        Self {
            requirements: RequirementsAgent::new(structured.clone()),
            architecture: ArchitectureAgent::new(structured),
            implementer: ImplementerAgent::new(implementer),
            reviewer: ReviewerAgent::new(reviewer),
        }
    }

    /// Build every agent over one shared model (tests, single-endpoint CLIs).
    pub fn with_model(model: Arc<dyn LanguageModel>) -> Self {
        Self {
            requirements: RequirementsAgent::new(model.clone()),
            architecture: ArchitectureAgent::new(model.clone()),
            implementer: ImplementerAgent::new(model.clone()),
            reviewer: ReviewerAgent::new(model),
        }
    }
}
