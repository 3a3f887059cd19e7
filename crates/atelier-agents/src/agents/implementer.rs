//! Implementer agent: [`SystemArchitecture`] → [`GeneratedCode`], plus the
//! targeted per-file patch operation the review and repair loops depend on.
//!
//! Generation is two-step: a structured implementation plan, then one text
//! generation per planned file. A malformed plan response falls back to the
//! deterministic default plan so a flaky planner never kills the run.

use std::collections::HashMap;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use conformance::{
    sanitize_path, CodeFile, FilePatchRequest, GeneratedCode, PipelineResult, SystemArchitecture,
};

use crate::llm::{generate_structured, LanguageModel};
use crate::prompts::{
    FILE_GENERATION_SYSTEM_PROMPT, FILE_PATCH_SYSTEM_PROMPT, IMPLEMENTATION_PLAN_SYSTEM_PROMPT,
};

/// Keywords in the architecture text that mean the bundle needs an auth
/// module.
pub const AUTH_KEYWORDS: &[&str] = &["auth", "login", "jwt", "password", "signup", "token"];

/// Extra dependencies an auth module needs: password hashing and tokens.
const AUTH_DEPENDENCIES: &[&str] = &["passlib[bcrypt]", "python-jose[cryptography]"];

/// Core module set every generated service ships.
const CORE_PLAN_PATHS: &[(&str, &str)] = &[
    ("app/main.py", "FastAPI application entrypoint wiring routers and startup"),
    ("app/database.py", "Engine construction, session dependency, schema bootstrap"),
    ("app/models.py", "SQLModel table classes"),
    ("app/schemas.py", "Request/response models"),
    ("app/routes.py", "APIRouter with every endpoint handler"),
];

/// One planned file.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FilePlan {
    pub path: String,
    pub purpose: String,
}

/// Structured output of the planning step.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ImplementationPlan {
    pub files: Vec<FilePlan>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Whether the architecture text calls for authentication.
pub fn architecture_mentions_auth(architecture: &SystemArchitecture) -> bool {
    let text = architecture.combined_text().to_lowercase();
    AUTH_KEYWORDS.iter().any(|keyword| text.contains(keyword))
}

/// Deterministic fallback plan used when the planner response is malformed.
pub fn default_plan(architecture: &SystemArchitecture) -> ImplementationPlan {
    let mut files: Vec<FilePlan> = CORE_PLAN_PATHS
        .iter()
        .map(|(path, purpose)| FilePlan {
            path: (*path).to_string(),
            purpose: (*purpose).to_string(),
        })
        .collect();
    let mut dependencies: Vec<String> = Vec::new();
    if architecture_mentions_auth(architecture) {
        files.push(FilePlan {
            path: "app/auth.py".to_string(),
            purpose: "Password hashing, JWT issuance, current-user dependency".to_string(),
        });
        dependencies.extend(AUTH_DEPENDENCIES.iter().map(|dep| dep.to_string()));
    }
    ImplementationPlan {
        files,
        dependencies,
    }
}

/// Force a planned path into bundle shape: sanitized, under `app/`.
fn plan_path(raw: &str) -> String {
    let path = sanitize_path(raw);
    if path.starts_with("app/") {
        path
    } else {
        format!("app/{path}")
    }
}

/// Generates and patches code bundles.
#[derive(Clone)]
pub struct ImplementerAgent {
    model: Arc<dyn LanguageModel>,
}

impl ImplementerAgent {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    async fn plan(&self, architecture: &SystemArchitecture) -> PipelineResult<ImplementationPlan> {
        let prompt = format!(
            "System architecture:\n{}",
            serde_json::to_string_pretty(architecture)?
        );
        let planned = generate_structured::<ImplementationPlan>(
            &*self.model,
            IMPLEMENTATION_PLAN_SYSTEM_PROMPT,
            &prompt,
        )
        .await;

        let mut plan = match planned {
            Ok(plan) if !plan.files.is_empty() => plan,
            Ok(_) => {
                warn!("planner returned an empty file list, using the default plan");
                default_plan(architecture)
            }
            Err(err) => {
                warn!(error = %err, "planner output malformed, using the default plan");
                default_plan(architecture)
            }
        };

        let mut seen = std::collections::HashSet::new();
        plan.files = plan
            .files
            .into_iter()
            .map(|file| FilePlan {
                path: plan_path(&file.path),
                purpose: file.purpose,
            })
            .filter(|file| file.path.ends_with(".py") && seen.insert(file.path.clone()))
            .collect();
        if plan.files.is_empty() {
            plan = default_plan(architecture);
        }
        Ok(plan)
    }

    /// Generate the full bundle: plan, then one file at a time.
    pub async fn generate(
        &self,
        architecture: &SystemArchitecture,
    ) -> PipelineResult<GeneratedCode> {
        let plan = self.plan(architecture).await?;
        let planned_paths: Vec<String> = plan.files.iter().map(|f| f.path.clone()).collect();
        info!(files = plan.files.len(), "generating planned files");

        let mut files: Vec<CodeFile> = Vec::with_capacity(plan.files.len());
        for file_plan in &plan.files {
            let prompt = format!(
                "System architecture:\n{}\n\nPlanned modules: {}\n\nGenerate `{}`: {}",
                serde_json::to_string_pretty(architecture)?,
                planned_paths.join(", "),
                file_plan.path,
                file_plan.purpose,
            );
            let content = self
                .model
                .generate_text(FILE_GENERATION_SYSTEM_PROMPT, &prompt, 0.2)
                .await?;
            files.push(CodeFile::new(file_plan.path.clone(), ensure_trailing_newline(content)));
        }

        let mut dependencies = plan.dependencies;
        if planned_paths.iter().any(|p| p == "app/auth.py") {
            for dep in AUTH_DEPENDENCIES {
                if !dependencies.iter().any(|d| d == dep) {
                    dependencies.push((*dep).to_string());
                }
            }
        }
        Ok(GeneratedCode::new(files, dependencies))
    }

    /// Regenerate only the requested files.
    ///
    /// Invariants enforced here: unpatched files keep their original order,
    /// any new path lands under `app/`, and dependencies never shrink below
    /// the baseline.
    pub async fn patch_files(
        &self,
        architecture: &SystemArchitecture,
        current_code: &GeneratedCode,
        patch_requests: &[FilePatchRequest],
        issues_by_file: &HashMap<String, Vec<String>>,
    ) -> PipelineResult<GeneratedCode> {
        let mut files = current_code.files.clone();

        for request in patch_requests {
            if !request.is_actionable() {
                continue;
            }
            let path = plan_path(&request.path);
            let existing = files
                .iter()
                .find(|f| f.path == path)
                .map(|f| f.content.clone())
                .unwrap_or_default();

            let mut prompt = format!(
                "System architecture summary:\n{}\n\nFile to rewrite: `{path}`\n\
                 Reason: {}\n\nInstructions:\n",
                architecture.design_document, request.reason,
            );
            for instruction in &request.instructions {
                prompt.push_str(&format!("- {instruction}\n"));
            }
            if let Some(issues) = issues_by_file.get(&path) {
                prompt.push_str("\nReviewer issues for this file:\n");
                for issue in issues {
                    prompt.push_str(&format!("- {issue}\n"));
                }
            }
            if existing.is_empty() {
                prompt.push_str("\nThe file does not exist yet; create it from scratch.\n");
            } else {
                prompt.push_str(&format!("\nCurrent contents:\n{existing}"));
            }

            let content = self
                .model
                .generate_text(FILE_PATCH_SYSTEM_PROMPT, &prompt, 0.2)
                .await?;
            let content = ensure_trailing_newline(content);

            match files.iter_mut().find(|f| f.path == path) {
                Some(file) => file.content = content,
                None => files.push(CodeFile::new(path, content)),
            }
            info!(path = %request.path, "patched file");
        }

        Ok(GeneratedCode::new(
            files,
            current_code.dependencies.clone(),
        ))
    }
}

fn ensure_trailing_newline(mut content: String) -> String {
    if !content.ends_with('\n') {
        content.push('\n');
    }
    content
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLanguageModel;
    use conformance::{PipelineError, BASELINE_DEPENDENCIES};
    use serde_json::json;

    fn architecture(design: &str) -> SystemArchitecture {
        SystemArchitecture {
            design_document: design.into(),
            mermaid_diagram: "flowchart TD".into(),
            components: vec![],
            data_model_summary: vec![],
            endpoint_summary: vec![],
        }
    }

    #[test]
    fn test_auth_keyword_detection() {
        assert!(architecture_mentions_auth(&architecture(
            "Users login with JWT tokens"
        )));
        assert!(!architecture_mentions_auth(&architecture(
            "A plain todo service"
        )));
    }

    #[test]
    fn test_default_plan_core_modules() {
        let plan = default_plan(&architecture("A plain todo service"));
        let paths: Vec<&str> = plan.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "app/main.py",
                "app/database.py",
                "app/models.py",
                "app/schemas.py",
                "app/routes.py"
            ]
        );
        assert!(plan.dependencies.is_empty());
    }

    #[test]
    fn test_default_plan_adds_auth_module() {
        let plan = default_plan(&architecture("Signup and login endpoints"));
        assert!(plan.files.iter().any(|f| f.path == "app/auth.py"));
        assert!(plan.dependencies.iter().any(|d| d.contains("passlib")));
        assert!(plan.dependencies.iter().any(|d| d.contains("jose")));
    }

    #[tokio::test]
    async fn test_generate_falls_back_to_default_plan() {
        let mut mock = MockLanguageModel::new();
        // Planner returns something that is not a plan at all.
        mock.expect_generate_value()
            .returning(|_, _, _| Ok(json!({"nonsense": true})));
        mock.expect_generate_text()
            .returning(|_, prompt, _| {
                // Make each file identifiable by its planned path.
                let path = prompt
                    .split('`')
                    .nth(1)
                    .unwrap_or("unknown")
                    .to_string();
                Ok(format!("# {path}\napp = None"))
            });

        let agent = ImplementerAgent::new(Arc::new(mock));
        let code = agent.generate(&architecture("A plain todo service")).await.unwrap();
        assert_eq!(code.files.len(), 5);
        assert!(code.has_file("app/main.py"));
        assert!(!code.has_file("app/auth.py"));
        for dep in BASELINE_DEPENDENCIES {
            assert!(code.dependencies.iter().any(|d| d == dep));
        }
        // Generated content got its trailing newline.
        assert!(code.files[0].content.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_generate_uses_planner_output_when_valid() {
        let mut mock = MockLanguageModel::new();
        mock.expect_generate_value().returning(|_, _, _| {
            Ok(json!({
                "files": [
                    {"path": "app/main.py", "purpose": "entrypoint"},
                    {"path": "models.py", "purpose": "tables"},
                    {"path": "app/notes.txt", "purpose": "not python"}
                ],
                "dependencies": ["httpx"]
            }))
        });
        mock.expect_generate_text()
            .returning(|_, _, _| Ok("app = None\n".to_string()));

        let agent = ImplementerAgent::new(Arc::new(mock));
        let code = agent.generate(&architecture("service")).await.unwrap();
        // Non-python entries are dropped, bare paths forced under app/.
        assert_eq!(code.file_paths(), vec!["app/main.py", "app/models.py"]);
        assert!(code.dependencies.iter().any(|d| d == "httpx"));
    }

    #[tokio::test]
    async fn test_patch_files_preserves_order_and_baseline() {
        let mut mock = MockLanguageModel::new();
        mock.expect_generate_text()
            .returning(|_, _, _| Ok("patched = True\n".to_string()));
        let agent = ImplementerAgent::new(Arc::new(mock));

        let current = GeneratedCode::new(
            vec![
                CodeFile::new("app/main.py", "app = None\n"),
                CodeFile::new("app/routes.py", "router = None\n"),
                CodeFile::new("app/models.py", "class Todo:\n    pass\n"),
            ],
            vec!["fastapi".into()],
        );
        let requests = vec![
            FilePatchRequest {
                path: "app/routes.py".into(),
                reason: "broken handler".into(),
                instructions: vec!["Fix the handler".into()],
            },
            FilePatchRequest {
                path: "app/service.py".into(),
                reason: "missing module".into(),
                instructions: vec!["Create the service layer".into()],
            },
            FilePatchRequest {
                path: "app/ignored.py".into(),
                reason: "no instructions".into(),
                instructions: vec![],
            },
        ];

        let patched = agent
            .patch_files(
                &architecture("service"),
                &current,
                &requests,
                &HashMap::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            patched.file_paths(),
            vec![
                "app/main.py",
                "app/routes.py",
                "app/models.py",
                "app/service.py"
            ]
        );
        assert_eq!(
            patched.file("app/routes.py").unwrap().content,
            "patched = True\n"
        );
        // Untouched files keep their contents.
        assert_eq!(patched.file("app/main.py").unwrap().content, "app = None\n");
        // The request without instructions was ignored.
        assert!(!patched.has_file("app/ignored.py"));
        for dep in BASELINE_DEPENDENCIES {
            assert!(patched.dependencies.iter().any(|d| d == dep));
        }
    }

    #[tokio::test]
    async fn test_patch_files_sanitizes_new_paths() {
        let mut mock = MockLanguageModel::new();
        mock.expect_generate_text()
            .returning(|_, _, _| Ok("ok = True\n".to_string()));
        let agent = ImplementerAgent::new(Arc::new(mock));

        let current = GeneratedCode::new(vec![CodeFile::new("app/main.py", "app = None\n")], vec![]);
        let requests = vec![FilePatchRequest {
            path: "..\\evil\\service.py".into(),
            reason: "path traversal attempt".into(),
            instructions: vec!["Create it".into()],
        }];
        let patched = agent
            .patch_files(&architecture("svc"), &current, &requests, &HashMap::new())
            .await
            .unwrap();
        assert!(patched.has_file("app/evil/service.py"));
        assert!(patched.file_paths().iter().all(|p| p.starts_with("app/")));
    }

    #[tokio::test]
    async fn test_generate_propagates_file_generation_errors() {
        let mut mock = MockLanguageModel::new();
        mock.expect_generate_value()
            .returning(|_, _, _| Ok(json!({"files": [{"path": "app/main.py", "purpose": "x"}], "dependencies": []})));
        mock.expect_generate_text()
            .returning(|_, _, _| Err(PipelineError::llm_output("empty")));
        let agent = ImplementerAgent::new(Arc::new(mock));
        assert!(agent.generate(&architecture("svc")).await.is_err());
    }
}
