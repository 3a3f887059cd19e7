//! LLM collaborator contract and the OpenAI-spec HTTP client.
//!
//! The pipeline depends on exactly two capabilities: schema-guided structured
//! generation and plain text generation. Providers routinely wrap JSON in
//! markdown fences or prose, so structured parsing goes through a best-effort
//! recovery layer (fenced block, raw text, `json:` prefix, first balanced
//! object/array) and retries once with stricter instructions before giving
//! up.

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{info, warn};

use conformance::{PipelineError, PipelineResult};

/// Abstract language-model capability the agents are written against.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Generate a JSON value conforming to the given JSON Schema.
    async fn generate_value(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        schema: &Value,
    ) -> PipelineResult<Value>;

    /// Generate plain text (used for per-file code generation to avoid giant
    /// JSON payloads).
    async fn generate_text(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f32,
    ) -> PipelineResult<String>;
}

/// Typed structured generation: builds the schema for `T`, delegates to the
/// model, and decodes the recovered value.
pub async fn generate_structured<T: DeserializeOwned + JsonSchema>(
    model: &dyn LanguageModel,
    system_prompt: &str,
    user_prompt: &str,
) -> PipelineResult<T> {
    let schema = serde_json::to_value(schemars::schema_for!(T))?;
    let value = model
        .generate_value(system_prompt, user_prompt, &schema)
        .await?;
    serde_json::from_value(value).map_err(|err| {
        PipelineError::llm_output(format!("structured response did not match schema: {err}"))
    })
}

/// First fenced code block in the text, if any.
fn extract_fenced_block(text: &str) -> Option<String> {
    let fence = Regex::new(r"(?is)```(?:json)?\s*(.*?)\s*```").unwrap();
    fence
        .captures(text)
        .map(|caps| caps[1].trim().to_string())
        .filter(|block| !block.is_empty())
}

/// Strip a single wrapping code fence from a whole response.
pub fn strip_code_fences(text: &str) -> String {
    let fence = Regex::new(r"(?s)^\s*```[a-zA-Z0-9_-]*\s*(.*?)\s*```\s*$").unwrap();
    match fence.captures(text) {
        Some(caps) => caps[1].trim().to_string(),
        None => text.trim().to_string(),
    }
}

/// Best-effort extraction of the first balanced top-level JSON object/array.
fn extract_balanced_json_span(text: &str) -> Option<&str> {
    let first_obj = text.find('{');
    let first_arr = text.find('[');
    let (start, open, close) = match (first_obj, first_arr) {
        (Some(o), Some(a)) if o < a => (o, b'{', b'}'),
        (Some(o), None) => (o, b'{', b'}'),
        (_, Some(a)) => (a, b'[', b']'),
        (None, None) => return None,
    };

    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape = false;
    for (idx, &byte) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escape {
                escape = false;
            } else if byte == b'\\' {
                escape = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b if b == open => depth += 1,
            b if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=idx]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse candidates for a structured response, in preference order.
pub fn structured_candidates(raw: &str) -> Vec<String> {
    let text = raw.trim();
    if text.is_empty() {
        return Vec::new();
    }

    let mut candidates: Vec<String> = Vec::new();
    if let Some(fenced) = extract_fenced_block(text) {
        candidates.push(fenced);
    }
    candidates.push(text.to_string());
    if let Some(balanced) = extract_balanced_json_span(text) {
        candidates.push(balanced.to_string());
    }

    // Some models emit a leading "json" token before the object.
    if text.len() > 4 && text.get(..4).is_some_and(|head| head.eq_ignore_ascii_case("json")) {
        let trimmed = text[4..].trim_start_matches([':', ' ', '\n', '\r', '\t']);
        if !trimmed.is_empty() {
            candidates.push(trimmed.to_string());
            if let Some(balanced) = extract_balanced_json_span(trimmed) {
                candidates.push(balanced.to_string());
            }
        }
    }

    let mut seen = std::collections::HashSet::new();
    candidates
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty() && seen.insert(c.clone()))
        .collect()
}

/// First candidate that parses as JSON.
pub fn recover_json(raw: &str) -> Option<Value> {
    structured_candidates(raw)
        .into_iter()
        .find_map(|candidate| serde_json::from_str(&candidate).ok())
}

/// Provider-agnostic client for OpenAI-spec `chat/completions` endpoints.
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    request_timeout: Duration,
}

impl OpenAiCompatClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            request_timeout: Duration::from_secs(180),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn chat(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f32,
    ) -> PipelineResult<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
            "temperature": temperature,
        });

        let mut request = self.http.post(&url).timeout(self.request_timeout).json(&body);
        if !self.api_key.is_empty() && self.api_key != "not-needed" {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| PipelineError::internal(format!("LLM request failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::internal(format!(
                "LLM provider returned {status}: {}",
                body.chars().take(400).collect::<String>()
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|err| PipelineError::internal(format!("LLM response unreadable: {err}")))?;
        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();
        if content.trim().is_empty() {
            return Err(PipelineError::llm_output("model returned empty content"));
        }
        Ok(content)
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatClient {
    async fn generate_value(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        schema: &Value,
    ) -> PipelineResult<Value> {
        let augmented = format!(
            "{system_prompt}\n\n\
             CRITICAL: respond with ONLY valid JSON matching the following JSON Schema. \
             Do not include markdown code blocks or any conversational text around the JSON.\n\n\
             EXPECTED SCHEMA:\n{}",
            serde_json::to_string(schema)?
        );
        let attempts = [
            (augmented.clone(), 0.2f32),
            (
                format!(
                    "{augmented}\n\n\
                     RETRY INSTRUCTIONS: your previous response was invalid or incomplete. \
                     Return ONLY a single JSON object/array matching the schema, with no prose, \
                     headings, markdown fences, or explanations."
                ),
                0.0,
            ),
        ];

        let mut last_error: Option<PipelineError> = None;
        for (attempt_idx, (system, temperature)) in attempts.iter().enumerate() {
            info!(
                model = %self.model,
                attempt = attempt_idx + 1,
                "issuing structured request"
            );
            match self.chat(system, user_prompt, *temperature).await {
                Ok(text) => match recover_json(&text) {
                    Some(value) => return Ok(value),
                    None => {
                        warn!(
                            model = %self.model,
                            attempt = attempt_idx + 1,
                            "structured parse failed, retrying"
                        );
                        last_error = Some(PipelineError::llm_output(
                            "no JSON candidate parsed from model output",
                        ));
                    }
                },
                Err(err) => {
                    warn!(model = %self.model, attempt = attempt_idx + 1, error = %err, "LLM call failed");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| PipelineError::llm_output("structured generation failed")))
    }

    async fn generate_text(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f32,
    ) -> PipelineResult<String> {
        let attempts = [
            (system_prompt.to_string(), temperature),
            (
                format!(
                    "{system_prompt}\n\n\
                     RETRY INSTRUCTIONS: return only the final file contents with no markdown \
                     fences and no explanation."
                ),
                0.0,
            ),
        ];

        let mut last_error: Option<PipelineError> = None;
        for (attempt_idx, (system, temperature)) in attempts.iter().enumerate() {
            match self.chat(system, user_prompt, *temperature).await {
                Ok(text) => {
                    let stripped = strip_code_fences(&text);
                    if !stripped.is_empty() {
                        return Ok(stripped);
                    }
                    last_error = Some(PipelineError::llm_output("model returned empty content"));
                }
                Err(err) => {
                    warn!(model = %self.model, attempt = attempt_idx + 1, error = %err, "text generation failed");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| PipelineError::llm_output("text generation failed")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemars::JsonSchema;
    use serde::Deserialize;

    #[test]
    fn test_extract_fenced_block() {
        let text = "Here:\n```json\n{\"a\": 1}\n```\nDone.";
        assert_eq!(extract_fenced_block(text).as_deref(), Some("{\"a\": 1}"));
        assert!(extract_fenced_block("no fences").is_none());
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```python\nx = 1\n```"), "x = 1");
        assert_eq!(strip_code_fences("plain text"), "plain text");
    }

    #[test]
    fn test_balanced_span_extraction() {
        assert_eq!(
            extract_balanced_json_span("Result: {\"a\": {\"b\": 2}} trailing"),
            Some("{\"a\": {\"b\": 2}}")
        );
        assert_eq!(
            extract_balanced_json_span("list [1, 2, 3] end"),
            Some("[1, 2, 3]")
        );
        assert_eq!(extract_balanced_json_span("no json"), None);
        // Braces inside strings must not unbalance the scan.
        assert_eq!(
            extract_balanced_json_span(r#"{"a": "}{"}"#),
            Some(r#"{"a": "}{"}"#)
        );
    }

    #[test]
    fn test_structured_candidates_ordering_and_dedup() {
        let raw = "```json\n{\"a\": 1}\n```";
        let candidates = structured_candidates(raw);
        assert_eq!(candidates[0], "{\"a\": 1}");
        // The fenced block and the balanced span coincide; no duplicates.
        assert_eq!(
            candidates.iter().filter(|c| *c == "{\"a\": 1}").count(),
            1
        );
    }

    #[test]
    fn test_recover_json_accepts_json_prefix() {
        let value = recover_json("json: {\"ok\": true}").unwrap();
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn test_recover_json_rejects_prose() {
        assert!(recover_json("I could not produce an answer.").is_none());
        assert!(recover_json("").is_none());
    }

    #[derive(Debug, Deserialize, JsonSchema, PartialEq)]
    struct Probe {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn test_generate_structured_decodes_via_mock() {
        let mut mock = MockLanguageModel::new();
        mock.expect_generate_value()
            .returning(|_, _, _| Ok(json!({"name": "todo", "count": 3})));
        let probe: Probe = generate_structured(&mock, "system", "user").await.unwrap();
        assert_eq!(
            probe,
            Probe {
                name: "todo".into(),
                count: 3
            }
        );
    }

    #[tokio::test]
    async fn test_generate_structured_surfaces_schema_mismatch() {
        let mut mock = MockLanguageModel::new();
        mock.expect_generate_value()
            .returning(|_, _, _| Ok(json!({"unexpected": true})));
        let result: PipelineResult<Probe> = generate_structured(&mock, "system", "user").await;
        assert!(matches!(
            result.unwrap_err(),
            PipelineError::LlmOutputInvalid(_)
        ));
    }
}
