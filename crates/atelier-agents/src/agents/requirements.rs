//! Requirements agent: prompt → [`ProjectCharter`].

use std::sync::Arc;

use conformance::{PipelineError, PipelineResult, ProjectCharter};

use crate::llm::{generate_structured, LanguageModel};
use crate::prompts::REQUIREMENTS_SYSTEM_PROMPT;

/// Extracts a structured charter from the user's raw prompt.
pub struct RequirementsAgent {
    model: Arc<dyn LanguageModel>,
}

impl RequirementsAgent {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// A charter without entities or endpoints is rejected; there is nothing
    /// the downstream stages could generate from it.
    pub async fn run(&self, prompt: &str) -> PipelineResult<ProjectCharter> {
        let charter: ProjectCharter =
            generate_structured(&*self.model, REQUIREMENTS_SYSTEM_PROMPT, prompt).await?;
        charter.validate().map_err(PipelineError::input)?;
        Ok(charter)
    }
}
