//! Deterministic post-generation checks.
//!
//! Scope: Python syntax compilation of generated files, then (when a project
//! id is available and the bundle ships `app/main.py`) a live sandbox check:
//! materialize the bundle, launch the container, wait for readiness, fetch
//! the OpenAPI document, and smoke-probe a bounded number of routes.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::artifacts::{
    CheckKind, CodeFile, FilePatchRequest, GeneratedCode, TestFailure, TestRunReport,
};
use crate::python;
use crate::sandbox::{openapi_looks_like_fallback, SandboxHarness, SandboxMode};

/// Reason attached to runner-synthesized patch requests.
pub const RUNNER_PATCH_REASON: &str = "Deterministic tests failed for this file";

/// Readiness deadline for the repair loop's evaluate step.
const SANDBOX_READY_DEADLINE: Duration = Duration::from_secs(45);
/// Upper bound on endpoint smoke probes per evaluation.
const MAX_ENDPOINT_PROBES: usize = 12;

const PROBE_METHODS: &[&str] = &["get", "post", "put", "patch", "delete"];

/// Runtime evaluation contract consumed by the repair loop.
///
/// The production implementation is [`TestRunner`]; tests substitute scripted
/// evaluators so repair behavior is exercised without a container runtime.
#[async_trait]
pub trait RuntimeEvaluator: Send + Sync {
    /// Evaluate a bundle, optionally against a live per-project sandbox.
    async fn evaluate(&self, code: &GeneratedCode, project_id: Option<&str>) -> TestRunReport;

    /// Whether the project's sandbox container is currently serving.
    async fn is_live(&self, project_id: &str) -> bool;
}

/// Deterministic test runner over the sandbox harness.
pub struct TestRunner {
    harness: SandboxHarness,
}

impl TestRunner {
    pub fn new(harness: SandboxHarness) -> Self {
        Self { harness }
    }

    pub fn harness(&self) -> &SandboxHarness {
        &self.harness
    }

    fn syntax_check(files: &[CodeFile]) -> Vec<TestFailure> {
        let mut failures = Vec::new();
        for file in files {
            if !file.path.ends_with(".py") {
                continue;
            }
            if let Some(line) = python::first_syntax_error_line(&file.content) {
                failures.push(TestFailure::syntax(
                    "invalid syntax",
                    file.path.clone(),
                    line,
                ));
            }
        }
        failures
    }

    async fn live_sandbox_check(
        &self,
        project_id: &str,
        code: &GeneratedCode,
    ) -> (Vec<TestFailure>, Vec<String>) {
        let mut failures: Vec<TestFailure> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();

        let launch = async {
            self.harness
                .write_bundle(project_id, code, SandboxMode::Normalized)?;
            self.harness.launch(project_id, SandboxMode::Normalized).await
        }
        .await;
        if let Err(err) = launch {
            failures.push(
                TestFailure::import_smoke(format!("Failed to launch sandbox container: {err}"))
                    .patchable(),
            );
            return (failures, warnings);
        }

        let ready = self
            .harness
            .wait_until_ready(project_id, SANDBOX_READY_DEADLINE)
            .await;
        let logs = self.harness.logs(project_id).await;

        if !ready {
            let mut message =
                "Sandbox container crashed or timed out during startup.".to_string();
            if let Some(logs) = &logs {
                message.push_str(&format!("\n\nContainer Logs:\n{logs}"));
            }
            failures.push(TestFailure::import_smoke(message).patchable());
            return (failures, warnings);
        }

        let Some(port) = self.harness.read_runtime(project_id).map(|r| r.port) else {
            warnings.push("Sandbox is live but port is unknown".to_string());
            return (failures, warnings);
        };

        let openapi = match self.harness.fetch_openapi(port).await {
            Ok(spec) => spec,
            Err(err) => {
                failures.push(TestFailure::endpoint_smoke(err.to_string()).patchable());
                return (failures, warnings);
            }
        };

        if openapi_looks_like_fallback(&openapi) {
            let mut message =
                "Live sandbox started a fallback shell app because generated API routes failed \
                 to load."
                    .to_string();
            if logs
                .as_deref()
                .is_some_and(|l| l.to_lowercase().contains("does not expose a router"))
            {
                message.push_str(
                    " app.routes did not expose router, api_router, or get_router().",
                );
            }
            failures.push(
                TestFailure::endpoint_smoke(message)
                    .at("app/routes.py", Some(1))
                    .patchable(),
            );
            return (failures, warnings);
        }

        failures.extend(self.probe_routes(port, &openapi).await);

        if let (Some(first), Some(logs)) = (failures.first_mut(), logs) {
            first.message.push_str(&format!("\n\n--- Sandbox Logs ---\n{logs}"));
        }

        (failures, warnings)
    }

    /// Best-effort smoke probes against a bounded number of served routes.
    /// Path parameters are blanked out; anything under HTTP 500 counts as
    /// alive.
    async fn probe_routes(&self, port: u16, openapi: &Value) -> Vec<TestFailure> {
        let mut failures = Vec::new();
        let Some(paths) = openapi.get("paths").and_then(Value::as_object) else {
            return failures;
        };

        let mut checked = 0usize;
        'outer: for (path, path_item) in paths {
            if checked >= MAX_ENDPOINT_PROBES {
                break;
            }
            let Some(path_item) = path_item.as_object() else {
                continue;
            };
            for method in PROBE_METHODS {
                if !path_item
                    .get(*method)
                    .map(Value::is_object)
                    .unwrap_or(false)
                {
                    continue;
                }
                let resolved = path.replace(['{', '}'], "");
                match self.harness.probe_endpoint(port, method, &resolved).await {
                    Ok((status, body)) if status >= 500 => {
                        let mut message = format!(
                            "{} {path} returned {status} in the sandbox.",
                            method.to_uppercase()
                        );
                        if !body.is_empty() {
                            message.push_str(&format!("\n\nResponse:\n{body}"));
                        }
                        failures.push(TestFailure::endpoint_smoke(message).patchable());
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(method, path, error = %err, "endpoint probe failed");
                        failures.push(
                            TestFailure::endpoint_smoke(format!(
                                "{} {path} could not be reached in the sandbox: {err}",
                                method.to_uppercase()
                            ))
                            .patchable(),
                        );
                    }
                }
                checked += 1;
                if checked >= MAX_ENDPOINT_PROBES {
                    break 'outer;
                }
            }
        }
        failures
    }

    /// Synthesize one patch request per patchable failing file.
    pub fn build_patch_requests(failures: &[TestFailure]) -> Vec<FilePatchRequest> {
        let mut order: Vec<String> = Vec::new();
        let mut by_path: HashMap<String, Vec<String>> = HashMap::new();
        for failure in failures {
            if !failure.patchable {
                continue;
            }
            let Some(path) = failure.file_path.as_deref() else {
                continue;
            };
            let loc = failure
                .line_number
                .map(|line| format!(" (line {line})"))
                .unwrap_or_default();
            if !by_path.contains_key(path) {
                order.push(path.to_string());
            }
            by_path
                .entry(path.to_string())
                .or_default()
                .push(format!("Fix {} failure{loc}: {}", failure.check, failure.message));
        }
        order
            .into_iter()
            .map(|path| {
                let instructions = by_path.remove(&path).unwrap_or_default();
                FilePatchRequest {
                    path,
                    reason: RUNNER_PATCH_REASON.to_string(),
                    instructions,
                }
            })
            .collect()
    }

    /// Run the evaluate step: syntax gate, then the live sandbox check when
    /// the bundle has an app entrypoint and a project id is available.
    pub async fn run(&self, code: &GeneratedCode, project_id: Option<&str>) -> TestRunReport {
        let mut checks_run = vec!["syntax".to_string()];
        let mut warnings: Vec<String> = Vec::new();
        let mut failures = Self::syntax_check(&code.files);

        if let Some(project_id) = project_id {
            if code.has_file("app/main.py") {
                checks_run.push("import_smoke".to_string());
                checks_run.push("endpoint_smoke".to_string());
                let (runtime_failures, runtime_warnings) =
                    self.live_sandbox_check(project_id, code).await;
                failures.extend(runtime_failures);
                warnings.extend(runtime_warnings);
            }
        }

        let patch_requests = Self::build_patch_requests(&failures);
        let passed = failures
            .iter()
            .all(|f| !f.patchable && f.check != CheckKind::Syntax);

        TestRunReport {
            passed,
            checks_run,
            failures,
            warnings,
            patch_requests,
        }
    }
}

#[async_trait]
impl RuntimeEvaluator for TestRunner {
    async fn evaluate(&self, code: &GeneratedCode, project_id: Option<&str>) -> TestRunReport {
        self.run(code, project_id).await
    }

    async fn is_live(&self, project_id: &str) -> bool {
        self.harness.is_live(project_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxConfig;

    fn runner() -> TestRunner {
        let dir = tempfile::tempdir().unwrap();
        let config = SandboxConfig {
            host_root: dir.path().to_path_buf(),
            ..SandboxConfig::default()
        };
        TestRunner::new(SandboxHarness::new(config))
    }

    #[tokio::test]
    async fn test_syntax_failures_block() {
        let code = GeneratedCode::new(
            vec![CodeFile::new("app/main.py", "def broken(:\n    pass\n")],
            vec![],
        );
        let report = runner().run(&code, None).await;
        assert!(!report.passed);
        assert_eq!(report.failures[0].check, CheckKind::Syntax);
        assert_eq!(report.failures[0].file_path.as_deref(), Some("app/main.py"));
        assert_eq!(report.checks_run, vec!["syntax"]);
    }

    #[tokio::test]
    async fn test_clean_bundle_without_project_passes_syntax_only() {
        let code = GeneratedCode::new(
            vec![CodeFile::new("app/main.py", "app = None\n")],
            vec![],
        );
        let report = runner().run(&code, None).await;
        assert!(report.passed);
        assert_eq!(report.checks_run, vec!["syntax"]);
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn test_bundle_without_entrypoint_skips_sandbox() {
        // Even with a project id, a bundle with no app/main.py never touches
        // the container runtime.
        let code = GeneratedCode::new(
            vec![CodeFile::new("app/routes.py", "router = None\n")],
            vec![],
        );
        let report = runner().run(&code, Some("proj-1")).await;
        assert!(report.passed);
        assert_eq!(report.checks_run, vec!["syntax"]);
    }

    #[test]
    fn test_patch_request_synthesis_groups_by_file() {
        let failures = vec![
            TestFailure::syntax("invalid syntax", "app/routes.py", 3),
            TestFailure::endpoint_smoke("GET /todos returned 500 in the sandbox.")
                .at("app/routes.py", None)
                .patchable(),
            TestFailure::import_smoke("not patchable, no file"),
        ];
        let requests = TestRunner::build_patch_requests(&failures);
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.path, "app/routes.py");
        assert_eq!(request.reason, RUNNER_PATCH_REASON);
        assert_eq!(request.instructions.len(), 2);
        assert!(request.instructions[0].contains("syntax failure (line 3)"));
        assert!(request.instructions[1].contains("endpoint_smoke failure"));
    }

    #[test]
    fn test_non_blocking_failures_do_not_gate() {
        let report = TestRunReport {
            passed: true,
            checks_run: vec!["syntax".into()],
            failures: vec![TestFailure::import_smoke("informational")],
            warnings: vec![],
            patch_requests: vec![],
        };
        // Informational (non-patchable, non-syntax) failures never block.
        assert!(report.blocking_failures().is_empty());
    }
}
