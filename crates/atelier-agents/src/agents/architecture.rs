//! Architecture agent: [`ProjectCharter`] → [`SystemArchitecture`].

use std::sync::Arc;

use conformance::{normalize_mermaid, PipelineResult, ProjectCharter, SystemArchitecture};

use crate::llm::{generate_structured, LanguageModel};
use crate::prompts::ARCHITECTURE_SYSTEM_PROMPT;

/// Designs the system for a charter. The mermaid diagram is always
/// normalized before the artifact leaves this agent.
pub struct ArchitectureAgent {
    model: Arc<dyn LanguageModel>,
}

impl ArchitectureAgent {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    pub async fn run(&self, charter: &ProjectCharter) -> PipelineResult<SystemArchitecture> {
        let prompt = format!(
            "Project charter:\n{}",
            serde_json::to_string_pretty(charter)?
        );
        let mut architecture: SystemArchitecture =
            generate_structured(&*self.model, ARCHITECTURE_SYSTEM_PROMPT, &prompt).await?;
        architecture.mermaid_diagram = normalize_mermaid(&architecture.mermaid_diagram);
        Ok(architecture)
    }
}
