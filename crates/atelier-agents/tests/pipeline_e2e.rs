//! End-to-end pipeline runs against a scripted language model.
//!
//! These tests drive the full orchestrator (events, persistence, review
//! loop, validator merge) without a network or a container runtime: the
//! model is a queue of canned responses and the runtime evaluator is a
//! syntax-only stub.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use atelier_agents::{
    AgentSet, LanguageModel, Pipeline, PipelineEvent, PipelineOptions, RuntimeMode, StartStage,
};
use conformance::{
    FsRunStore, GeneratedCode, PipelineError, PipelineResult, RunStatus, RunStore,
    RuntimeEvaluator, TestRunReport,
};

/// Scripted model: structured responses pop in order; file contents are
/// looked up by the path mentioned in the prompt.
struct ScriptedModel {
    structured: Mutex<VecDeque<Value>>,
    files: HashMap<String, String>,
    patches: Mutex<HashMap<String, VecDeque<String>>>,
}

impl ScriptedModel {
    fn new(structured: Vec<Value>, files: Vec<(&str, &str)>) -> Self {
        Self {
            structured: Mutex::new(structured.into_iter().collect()),
            files: files
                .into_iter()
                .map(|(path, content)| (path.to_string(), content.to_string()))
                .collect(),
            patches: Mutex::new(HashMap::new()),
        }
    }

    fn with_patch(self, path: &str, content: &str) -> Self {
        self.patches
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(content.to_string());
        self
    }

    fn path_from_prompt(prompt: &str) -> Option<(bool, String)> {
        if let Some(rest) = prompt.split("File to rewrite: `").nth(1) {
            return rest.split('`').next().map(|p| (true, p.to_string()));
        }
        if let Some(rest) = prompt.split("Generate `").nth(1) {
            return rest.split('`').next().map(|p| (false, p.to_string()));
        }
        None
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn generate_value(
        &self,
        _system_prompt: &str,
        _user_prompt: &str,
        _schema: &Value,
    ) -> PipelineResult<Value> {
        self.structured
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| PipelineError::llm_output("script exhausted"))
    }

    async fn generate_text(
        &self,
        _system_prompt: &str,
        user_prompt: &str,
        _temperature: f32,
    ) -> PipelineResult<String> {
        let Some((is_patch, path)) = Self::path_from_prompt(user_prompt) else {
            return Ok("app = None\n".to_string());
        };
        if is_patch {
            if let Some(queue) = self.patches.lock().unwrap().get_mut(&path) {
                if let Some(content) = queue.pop_front() {
                    return Ok(content);
                }
            }
        }
        Ok(self
            .files
            .get(&path)
            .cloned()
            .unwrap_or_else(|| "app = None\n".to_string()))
    }
}

/// Syntax-only evaluator; never touches a container.
struct SyntaxOnlyEvaluator;

#[async_trait]
impl RuntimeEvaluator for SyntaxOnlyEvaluator {
    async fn evaluate(&self, _code: &GeneratedCode, _project_id: Option<&str>) -> TestRunReport {
        TestRunReport {
            passed: true,
            checks_run: vec!["syntax".into()],
            ..Default::default()
        }
    }

    async fn is_live(&self, _project_id: &str) -> bool {
        false
    }
}

fn charter_value() -> Value {
    json!({
        "project_name": "todo-api",
        "description": "A todo API",
        "entities": [{"name": "Todo", "fields": [
            {"name": "title", "field_type": "str", "required": true}
        ]}],
        "endpoints": [{"method": "GET", "path": "/todos", "description": "List todos"}],
        "business_rules": [],
        "auth_required": false
    })
}

fn architecture_value(design: &str) -> Value {
    json!({
        "design_document": design,
        "mermaid_diagram": "flowchart TD\n  A[Client] --> B[API]",
        "components": ["api"],
        "data_model_summary": ["Todo table"],
        "endpoint_summary": ["GET /todos"]
    })
}

fn approving_review() -> Value {
    json!({
        "issues": [],
        "suggestions": [],
        "security_score": 9,
        "approved": true,
        "affected_files": [],
        "patch_requests": []
    })
}

fn clean_core_files() -> Vec<(&'static str, &'static str)> {
    vec![
        (
            "app/main.py",
            "from fastapi import FastAPI\nfrom app.routes import router\n\napp = FastAPI()\napp.include_router(router)\n",
        ),
        (
            "app/database.py",
            "engine = None\n\n\ndef get_session():\n    return None\n",
        ),
        ("app/models.py", "class Todo:\n    pass\n"),
        ("app/schemas.py", "class TodoRead:\n    pass\n"),
        (
            "app/routes.py",
            "from fastapi import APIRouter\n\nrouter = APIRouter()\n",
        ),
    ]
}

struct RunOutcome {
    events: Vec<PipelineEvent>,
    store: Arc<FsRunStore>,
}

impl RunOutcome {
    fn statuses(&self) -> Vec<&'static str> {
        self.events.iter().map(PipelineEvent::status).collect()
    }

    fn completed(&self) -> (&str, bool, &Value) {
        for event in &self.events {
            if let PipelineEvent::Completed {
                message,
                approved,
                artifact,
            } = event
            {
                return (message, *approved, artifact);
            }
        }
        panic!("no completed event in {:?}", self.statuses());
    }

    fn final_paths(&self) -> Vec<String> {
        let (_, _, artifact) = self.completed();
        artifact["final_code"]
            .as_array()
            .expect("completion artifact carries final_code")
            .iter()
            .map(|f| f["path"].as_str().unwrap().to_string())
            .collect()
    }
}

async fn run_to_completion(model: ScriptedModel, run_id: &str) -> RunOutcome {
    let agents = AgentSet::with_model(Arc::new(model));
    let store = Arc::new(FsRunStore::new(tempfile::tempdir().unwrap().into_path()).unwrap());
    let pipeline = Arc::new(Pipeline::new(
        agents,
        Arc::new(SyntaxOnlyEvaluator),
        store.clone(),
    ));
    let opts = PipelineOptions {
        runtime_mode: RuntimeMode::LocalCli,
        start_stage: StartStage::Requirements,
        charter_override: None,
        architecture_override: None,
    };
    let mut rx = pipeline.run("proj-e2e".into(), run_id.into(), "Build a todo API.".into(), opts);
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    RunOutcome { events, store }
}

#[tokio::test]
async fn test_happy_path_produces_core_bundle() {
    let model = ScriptedModel::new(
        vec![
            charter_value(),
            architecture_value("A plain todo service with list endpoints."),
            json!({"bogus": true}), // malformed plan → deterministic default plan
            approving_review(),
        ],
        clean_core_files(),
    );

    let outcome = run_to_completion(model, "run-happy").await;
    assert_eq!(
        outcome.statuses(),
        vec![
            "starting",
            "requirements",
            "requirements_done",
            "architecture",
            "architecture_done",
            "implementer",
            "implementer_done",
            "reviewer",
            "review_pass",
            "reviewer_done",
            "completed",
        ]
    );

    let (message, approved, _) = outcome.completed();
    assert!(approved);
    assert!(message.contains("skipped"), "message: {message}");

    let paths = outcome.final_paths();
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
    assert!(!paths.iter().any(|p| p == "app/auth.py"));

    // Persistence: run completed, stage artifacts in order, code offloaded.
    let record = outcome.store.load_run("run-happy").await.unwrap();
    assert_eq!(record.status, RunStatus::Completed);
    let stages: Vec<&str> = record.artifacts.iter().map(|a| a.stage.as_str()).collect();
    assert_eq!(
        stages,
        vec!["requirements", "architecture", "implementer", "reviewer_pass_1"]
    );
    let implementer = &record.artifacts[2].content;
    let handle = implementer["bundle_ref"].as_str().expect("bundle offloaded");
    let bundle = outcome.store.load_code_bundle(handle).await.unwrap();
    assert_eq!(bundle.files.len(), 5);
    for dep in ["fastapi", "sqlmodel", "uvicorn[standard]"] {
        assert!(bundle.dependencies.iter().any(|d| d == dep), "missing {dep}");
    }
}

#[tokio::test]
async fn test_auth_keywords_add_auth_module_and_dependencies() {
    let mut files = clean_core_files();
    files.push((
        "app/auth.py",
        "def hash_password(password):\n    return password\n",
    ));
    let model = ScriptedModel::new(
        vec![
            charter_value(),
            architecture_value("Users signup and login; issue JWT tokens for each session."),
            json!({"bogus": true}), // malformed plan → default plan with auth module
            approving_review(),
        ],
        files,
    );

    let outcome = run_to_completion(model, "run-auth").await;
    let paths = outcome.final_paths();
    assert!(paths.iter().any(|p| p == "app/auth.py"));

    let record = outcome.store.load_run("run-auth").await.unwrap();
    let implementer = &record.artifacts[2].content;
    let handle = implementer["bundle_ref"].as_str().unwrap();
    let bundle = outcome.store.load_code_bundle(handle).await.unwrap();
    assert!(bundle.dependencies.iter().any(|d| d.contains("passlib")));
    assert!(bundle.dependencies.iter().any(|d| d.contains("jose")));
}

#[tokio::test]
async fn test_validator_drift_forces_patch_and_second_pass() {
    // routes.py calls service.list_todos with keywords the service does not
    // declare; the reviewer itself approves, but the merged report must not.
    let plan = json!({
        "files": [
            {"path": "app/main.py", "purpose": "entrypoint"},
            {"path": "app/database.py", "purpose": "engine"},
            {"path": "app/models.py", "purpose": "tables"},
            {"path": "app/schemas.py", "purpose": "schemas"},
            {"path": "app/routes.py", "purpose": "handlers"},
            {"path": "app/service.py", "purpose": "service layer"}
        ],
        "dependencies": []
    });
    let mut files = clean_core_files();
    files.retain(|(path, _)| *path != "app/routes.py");
    files.push((
        "app/routes.py",
        "from fastapi import APIRouter\n\nfrom app import service\n\nrouter = APIRouter()\n\n\ndef handler(session):\n    return service.list_todos(session=session, due_date_before=None)\n",
    ));
    files.push((
        "app/service.py",
        "def list_todos(*, db, due_before=None):\n    return []\n",
    ));

    let model = ScriptedModel::new(
        vec![
            charter_value(),
            architecture_value("A plain todo service with a dedicated service layer."),
            plan,
            approving_review(), // pass 1: overridden by the validator
            approving_review(), // pass 2: bundle is clean now
        ],
        files,
    )
    .with_patch(
        "app/routes.py",
        "from fastapi import APIRouter\n\nfrom app import service\n\nrouter = APIRouter()\n\n\ndef handler(session):\n    return service.list_todos(db=session, due_before=None)\n",
    );

    let outcome = run_to_completion(model, "run-drift").await;
    assert_eq!(
        outcome.statuses(),
        vec![
            "starting",
            "requirements",
            "requirements_done",
            "architecture",
            "architecture_done",
            "implementer",
            "implementer_done",
            "reviewer",
            "review_pass",
            "revision",
            "reviewer",
            "review_pass",
            "reviewer_done",
            "completed",
        ]
    );

    // First pass: validator forced rejection despite reviewer approval.
    let passes: Vec<(u32, bool, u8)> = outcome
        .events
        .iter()
        .filter_map(|event| match event {
            PipelineEvent::ReviewPass {
                attempt,
                approved,
                security_score,
            } => Some((*attempt, *approved, *security_score)),
            _ => None,
        })
        .collect();
    assert_eq!(passes.len(), 2);
    assert!(!passes[0].1, "validator must force approved=false");
    assert!(passes[0].2 <= 6, "validator must cap the score");
    assert!(passes[1].1, "patched bundle passes review");

    // The revision targeted the file the validator complained about.
    let revision_files: Vec<String> = outcome
        .events
        .iter()
        .filter_map(|event| match event {
            PipelineEvent::Revision { affected_files, .. } => Some(affected_files.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    assert!(revision_files.contains(&"app/routes.py".to_string()));

    // The persisted first-pass report carries the drift issue text.
    let record = outcome.store.load_run("run-drift").await.unwrap();
    let pass_1 = record
        .artifacts
        .iter()
        .find(|a| a.stage == "reviewer_pass_1")
        .unwrap();
    let issues = pass_1.content["issues"].as_array().unwrap();
    assert!(issues.iter().any(|issue| {
        let description = issue["description"].as_str().unwrap_or("");
        description.contains("session") && description.contains("due_date_before")
    }));

    let (_, approved, _) = outcome.completed();
    assert!(approved);
}

#[tokio::test]
async fn test_reviewer_failure_degrades_to_completed() {
    // The reviewer's structured call fails every time; the pipeline must
    // still end in `completed` with the implementer's bundle.
    let model = ScriptedModel::new(
        vec![
            charter_value(),
            architecture_value("A plain todo service."),
            json!({"bogus": true}),
            // No review response: the script runs dry at the reviewer.
        ],
        clean_core_files(),
    );

    let outcome = run_to_completion(model, "run-reviewer-down").await;
    let statuses = outcome.statuses();
    assert_eq!(statuses.last(), Some(&"completed"));
    assert!(statuses.contains(&"reviewer_done"));

    let (_, approved, artifact) = outcome.completed();
    assert!(!approved);
    assert_eq!(artifact["final_code"].as_array().unwrap().len(), 5);

    let record = outcome.store.load_run("run-reviewer-down").await.unwrap();
    assert_eq!(record.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_empty_charter_is_a_terminal_error() {
    let mut empty_charter = charter_value();
    empty_charter["entities"] = json!([]);
    let model = ScriptedModel::new(vec![empty_charter], clean_core_files());

    let outcome = run_to_completion(model, "run-empty-charter").await;
    assert_eq!(outcome.statuses(), vec!["starting", "requirements", "error"]);

    let record = outcome.store.load_run("run-empty-charter").await.unwrap();
    assert_eq!(record.status, RunStatus::Failed);
}

#[tokio::test]
async fn test_exactly_one_terminal_event_and_stage_ordering() {
    let model = ScriptedModel::new(
        vec![
            charter_value(),
            architecture_value("A plain todo service."),
            json!({"bogus": true}),
            approving_review(),
        ],
        clean_core_files(),
    );
    let outcome = run_to_completion(model, "run-ordering").await;

    let terminals = outcome
        .events
        .iter()
        .filter(|event| event.is_terminal())
        .count();
    assert_eq!(terminals, 1);
    assert!(outcome.events.last().unwrap().is_terminal());

    // Stage N's done event appears strictly before any stage N+1 event.
    let statuses = outcome.statuses();
    let position = |status: &str| statuses.iter().position(|s| *s == status).unwrap();
    assert!(position("requirements_done") < position("architecture"));
    assert!(position("architecture_done") < position("implementer"));
    assert!(position("implementer_done") < position("reviewer"));
    assert!(position("reviewer_done") < position("completed"));
}
