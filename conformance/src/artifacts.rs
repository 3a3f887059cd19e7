//! Typed stage artifacts and their invariants.
//!
//! Every pipeline stage consumes the prior stage's artifact and produces
//! exactly one new artifact kind. Artifacts are immutable once persisted;
//! the code bundle is the only entity that is replaced across stages, and
//! every replacement produces a new artifact record.
//!
//! All artifact types derive `JsonSchema` so the LLM collaborator can be
//! handed a schema descriptor for structured output.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Packages every generated bundle must carry: the HTTP framework, the ORM,
/// and the ASGI runner.
pub const BASELINE_DEPENDENCIES: &[&str] = &["fastapi", "sqlmodel", "uvicorn[standard]"];

/// HTTP methods the charter may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum HttpMethod {
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "POST")]
    Post,
    #[serde(rename = "PUT")]
    Put,
    #[serde(rename = "PATCH")]
    Patch,
    #[serde(rename = "DELETE")]
    Delete,
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
            Self::Put => write!(f, "PUT"),
            Self::Patch => write!(f, "PATCH"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

/// A single field on a charter entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EntityField {
    /// Field name (e.g. "title", "price").
    pub name: String,
    /// Type hint (e.g. "str", "int", "datetime", "bool").
    pub field_type: String,
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

/// A data entity extracted from the requirements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Entity {
    pub name: String,
    pub fields: Vec<EntityField>,
}

/// A REST endpoint requested by the charter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Endpoint {
    pub method: HttpMethod,
    pub path: String,
    pub description: String,
}

/// Structured requirements artifact produced by the requirements agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProjectCharter {
    pub project_name: String,
    pub description: String,
    pub entities: Vec<Entity>,
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub business_rules: Vec<String>,
    #[serde(default)]
    pub auth_required: bool,
}

impl ProjectCharter {
    /// A charter with no entities or no endpoints cannot drive generation.
    pub fn validate(&self) -> Result<(), String> {
        if self.project_name.trim().is_empty() {
            return Err("charter has an empty project name".into());
        }
        if self.entities.is_empty() {
            return Err("charter extracted no entities".into());
        }
        if self.endpoints.is_empty() {
            return Err("charter extracted no endpoints".into());
        }
        Ok(())
    }
}

/// Design artifact produced by the architecture agent.
///
/// `mermaid_diagram` is always a normalized top-down flowchart by the time it
/// is persisted (see [`crate::mermaid::normalize_mermaid`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SystemArchitecture {
    /// Markdown design document.
    pub design_document: String,
    /// Normalized top-down mermaid flowchart.
    pub mermaid_diagram: String,
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default)]
    pub data_model_summary: Vec<String>,
    #[serde(default)]
    pub endpoint_summary: Vec<String>,
}

impl SystemArchitecture {
    /// Flattened text used for keyword scans (e.g. auth detection in the
    /// implementer's fallback plan).
    pub fn combined_text(&self) -> String {
        let mut text = self.design_document.clone();
        for section in [
            &self.components,
            &self.data_model_summary,
            &self.endpoint_summary,
        ] {
            for line in section {
                text.push('\n');
                text.push_str(line);
            }
        }
        text
    }
}

/// One generated source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CodeFile {
    /// Relative forward-slash path, e.g. "app/models.py".
    pub path: String,
    /// Complete UTF-8 source text.
    pub content: String,
}

impl CodeFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Code bundle artifact produced by the implementer agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GeneratedCode {
    pub files: Vec<CodeFile>,
    pub dependencies: Vec<String>,
}

impl GeneratedCode {
    pub fn new(files: Vec<CodeFile>, dependencies: Vec<String>) -> Self {
        let mut code = Self {
            files,
            dependencies,
        };
        code.ensure_baseline_dependencies();
        code
    }

    /// Add any missing baseline dependency, preserving existing order.
    pub fn ensure_baseline_dependencies(&mut self) {
        for dep in BASELINE_DEPENDENCIES {
            if !self.dependencies.iter().any(|d| d == dep) {
                self.dependencies.push((*dep).to_string());
            }
        }
    }

    pub fn file(&self, path: &str) -> Option<&CodeFile> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.file(path).is_some()
    }

    pub fn file_paths(&self) -> Vec<String> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }
}

/// Severity of a reviewer issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// A single reviewer or validator issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Issue {
    pub severity: Severity,
    pub description: String,
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<usize>,
}

/// File-scoped regeneration instruction.
///
/// A request only influences the repair loop once it carries at least one
/// instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FilePatchRequest {
    pub path: String,
    pub reason: String,
    pub instructions: Vec<String>,
}

impl FilePatchRequest {
    pub fn is_actionable(&self) -> bool {
        !self.path.trim().is_empty() && !self.instructions.is_empty()
    }
}

/// Review artifact produced by the reviewer agent (and enriched with the
/// deterministic validator's findings).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReviewReport {
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    /// Security/trust score from 1 to 10.
    pub security_score: u8,
    pub approved: bool,
    #[serde(default)]
    pub affected_files: Vec<String>,
    #[serde(default)]
    pub patch_requests: Vec<FilePatchRequest>,
    /// Reviewer-rewritten bundle, when the reviewer chose to fix code itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_code: Option<Vec<CodeFile>>,
}

/// Deterministic check families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Syntax,
    ImportSmoke,
    EndpointSmoke,
}

impl std::fmt::Display for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Syntax => write!(f, "syntax"),
            Self::ImportSmoke => write!(f, "import_smoke"),
            Self::EndpointSmoke => write!(f, "endpoint_smoke"),
        }
    }
}

/// One deterministic check failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TestFailure {
    pub check: CheckKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<usize>,
    #[serde(default)]
    pub patchable: bool,
}

impl TestFailure {
    pub fn syntax(message: impl Into<String>, path: impl Into<String>, line: usize) -> Self {
        Self {
            check: CheckKind::Syntax,
            message: message.into(),
            file_path: Some(path.into()),
            line_number: Some(line),
            patchable: true,
        }
    }

    pub fn import_smoke(message: impl Into<String>) -> Self {
        Self {
            check: CheckKind::ImportSmoke,
            message: message.into(),
            file_path: None,
            line_number: None,
            patchable: false,
        }
    }

    pub fn endpoint_smoke(message: impl Into<String>) -> Self {
        Self {
            check: CheckKind::EndpointSmoke,
            message: message.into(),
            file_path: None,
            line_number: None,
            patchable: false,
        }
    }

    pub fn at(mut self, path: impl Into<String>, line: Option<usize>) -> Self {
        self.file_path = Some(path.into());
        self.line_number = line;
        self
    }

    pub fn patchable(mut self) -> Self {
        self.patchable = true;
        self
    }
}

/// Outcome of one deterministic evaluation pass over a bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TestRunReport {
    pub passed: bool,
    #[serde(default)]
    pub checks_run: Vec<String>,
    #[serde(default)]
    pub failures: Vec<TestFailure>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub patch_requests: Vec<FilePatchRequest>,
}

impl TestRunReport {
    /// Failures that block release: everything patchable plus syntax errors.
    pub fn blocking_failures(&self) -> Vec<&TestFailure> {
        self.failures
            .iter()
            .filter(|f| f.patchable || f.check == CheckKind::Syntax)
            .collect()
    }
}

/// Outcome of the bounded runtime repair loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RepairReport {
    /// Whether the final evaluation passed.
    pub passed: bool,
    /// Passed with no residual warnings.
    pub fully_validated: bool,
    /// Whether any patch pass ran at all.
    pub repaired: bool,
    /// Total implementer invocations consumed.
    pub attempts: u32,
    #[serde(default)]
    pub affected_files: Vec<String>,
    #[serde(default)]
    pub failures: Vec<TestFailure>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub patch_requests: Vec<FilePatchRequest>,
    pub final_code: Vec<CodeFile>,
    pub summary: String,
}

/// Sanitize a bundle-relative path.
///
/// Backslashes become forward slashes, leading slashes are dropped, `.` and
/// `..` segments are removed, repeated slashes collapse, and any trailing
/// slash is stripped. Idempotent.
pub fn sanitize_path(raw: &str) -> String {
    raw.replace('\\', "/")
        .split('/')
        .filter(|seg| !seg.is_empty() && *seg != "." && *seg != "..")
        .collect::<Vec<_>>()
        .join("/")
}
