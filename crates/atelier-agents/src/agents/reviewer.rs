//! Reviewer agent: [`GeneratedCode`] → [`ReviewReport`].
//!
//! The reviewer's subjective judgment is always combined with the
//! deterministic validator by the orchestrator; this agent only produces the
//! LLM side of the report.

use std::sync::Arc;

use conformance::{GeneratedCode, PipelineResult, ReviewReport};

use crate::llm::{generate_structured, LanguageModel};
use crate::prompts::REVIEWER_SYSTEM_PROMPT;

pub struct ReviewerAgent {
    model: Arc<dyn LanguageModel>,
}

impl ReviewerAgent {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    pub async fn run(&self, code: &GeneratedCode) -> PipelineResult<ReviewReport> {
        let mut prompt = String::from("Files to review:\n");
        for file in &code.files {
            prompt.push_str(&format!("\n--- {} ---\n{}\n", file.path, file.content));
        }
        prompt.push_str(&format!(
            "\nDeclared dependencies: {}\n",
            code.dependencies.join(", ")
        ));

        let mut report: ReviewReport =
            generate_structured(&*self.model, REVIEWER_SYSTEM_PROMPT, &prompt).await?;
        report.security_score = report.security_score.clamp(1, 10);
        if let Some(final_code) = &report.final_code {
            if final_code.is_empty() {
                report.final_code = None;
            }
        }
        Ok(report)
    }
}
