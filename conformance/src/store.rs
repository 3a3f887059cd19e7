//! Run and artifact persistence.
//!
//! A run owns an ordered list of artifact records, one per stage production.
//! Large code bundles are offloaded to a content-addressed store and
//! referenced by handle so run records stay small enough to serve inline.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::artifacts::CodeFile;
use crate::error::{PipelineError, PipelineResult};

/// Stored prompts are truncated to this many characters.
pub const PROMPT_CHAR_BUDGET: usize = 2000;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One persisted stage artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub stage: String,
    pub content: Value,
    pub created_at: DateTime<Utc>,
}

/// A persisted run with its ordered artifact records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub project_id: String,
    pub status: RunStatus,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRecord>,
}

/// Handle referencing an offloaded code bundle.
pub type BundleHandle = String;

/// A code bundle loaded back from the content-addressed store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredBundle {
    pub files: Vec<CodeFile>,
    pub dependencies: Vec<String>,
}

/// Persistence contract for runs, artifacts, and offloaded bundles.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, run_id: &str, project_id: &str, prompt: &str)
        -> PipelineResult<()>;
    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> PipelineResult<()>;
    async fn create_artifact(&self, run_id: &str, stage: &str, content: Value)
        -> PipelineResult<()>;
    async fn store_code_bundle(
        &self,
        run_id: &str,
        stage: &str,
        files: &[CodeFile],
        dependencies: &[String],
    ) -> PipelineResult<BundleHandle>;
    async fn load_code_bundle(&self, handle: &str) -> PipelineResult<StoredBundle>;
    async fn load_run(&self, run_id: &str) -> PipelineResult<RunRecord>;
}

/// Filesystem-backed store: `runs/<run_id>.json` plus
/// `bundles/<blake3-hex>.json`.
pub struct FsRunStore {
    root: PathBuf,
    // Serializes read-modify-write cycles on run records.
    write_lock: Mutex<()>,
}

impl FsRunStore {
    pub fn new(root: impl Into<PathBuf>) -> PipelineResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("runs"))?;
        std::fs::create_dir_all(root.join("bundles"))?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        let safe: String = run_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect();
        self.root.join("runs").join(format!("{safe}.json"))
    }

    fn bundle_path(&self, handle: &str) -> PipelineResult<PathBuf> {
        if handle.is_empty() || !handle.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(PipelineError::store(format!(
                "malformed bundle handle: {handle}"
            )));
        }
        Ok(self.root.join("bundles").join(format!("{handle}.json")))
    }

    fn read_run(&self, run_id: &str) -> PipelineResult<RunRecord> {
        let path = self.run_path(run_id);
        let text = std::fs::read_to_string(&path)
            .map_err(|err| PipelineError::store(format!("run {run_id} not found: {err}")))?;
        Ok(serde_json::from_str(&text)?)
    }

    fn write_run(&self, record: &RunRecord) -> PipelineResult<()> {
        std::fs::write(
            self.run_path(&record.run_id),
            serde_json::to_string_pretty(record)?,
        )?;
        Ok(())
    }
}

#[async_trait]
impl RunStore for FsRunStore {
    async fn create_run(
        &self,
        run_id: &str,
        project_id: &str,
        prompt: &str,
    ) -> PipelineResult<()> {
        let record = RunRecord {
            run_id: run_id.to_string(),
            project_id: project_id.to_string(),
            status: RunStatus::Pending,
            prompt: prompt.chars().take(PROMPT_CHAR_BUDGET).collect(),
            created_at: Utc::now(),
            artifacts: Vec::new(),
        };
        let _guard = self.write_lock.lock().unwrap();
        self.write_run(&record)
    }

    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> PipelineResult<()> {
        let _guard = self.write_lock.lock().unwrap();
        let mut record = self.read_run(run_id)?;
        record.status = status;
        self.write_run(&record)
    }

    async fn create_artifact(
        &self,
        run_id: &str,
        stage: &str,
        content: Value,
    ) -> PipelineResult<()> {
        let _guard = self.write_lock.lock().unwrap();
        let mut record = self.read_run(run_id)?;
        record.artifacts.push(ArtifactRecord {
            stage: stage.to_string(),
            content,
            created_at: Utc::now(),
        });
        self.write_run(&record)
    }

    async fn store_code_bundle(
        &self,
        run_id: &str,
        stage: &str,
        files: &[CodeFile],
        dependencies: &[String],
    ) -> PipelineResult<BundleHandle> {
        let payload = serde_json::to_vec(&StoredBundle {
            files: files.to_vec(),
            dependencies: dependencies.to_vec(),
        })?;
        let handle = blake3::hash(&payload).to_hex().to_string();
        let path = self.bundle_path(&handle)?;
        std::fs::write(path, payload)?;
        debug!(run_id, stage, handle = %handle, "stored code bundle");
        Ok(handle)
    }

    async fn load_code_bundle(&self, handle: &str) -> PipelineResult<StoredBundle> {
        let path = self.bundle_path(handle)?;
        let text = std::fs::read_to_string(&path)
            .map_err(|err| PipelineError::store(format!("bundle {handle} not found: {err}")))?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn load_run(&self, run_id: &str) -> PipelineResult<RunRecord> {
        self.read_run(run_id)
    }
}

/// Rewrite an artifact that carries a large inline `final_code` list:
/// the file list is offloaded to the bundle store and replaced by a
/// `bundle_ref` handle plus a summary of paths and sizes.
pub async fn offload_final_code(
    store: &dyn RunStore,
    run_id: &str,
    stage: &str,
    mut content: Value,
) -> PipelineResult<Value> {
    let Some(files_value) = content.get("final_code") else {
        return Ok(content);
    };
    let files: Vec<CodeFile> = match serde_json::from_value(files_value.clone()) {
        Ok(files) => files,
        Err(_) => return Ok(content),
    };
    if files.is_empty() {
        return Ok(content);
    }
    let dependencies: Vec<String> = content
        .get("dependencies")
        .and_then(|deps| serde_json::from_value(deps.clone()).ok())
        .unwrap_or_default();

    let handle = store
        .store_code_bundle(run_id, stage, &files, &dependencies)
        .await?;
    let total_bytes: usize = files.iter().map(|f| f.content.len()).sum();
    let paths: Vec<String> = files.iter().map(|f| f.path.clone()).collect();

    if let Some(object) = content.as_object_mut() {
        object.remove("final_code");
        object.insert("bundle_ref".to_string(), json!(handle));
        object.insert(
            "final_code_summary".to_string(),
            json!({
                "files_count": files.len(),
                "file_paths": paths,
                "total_bytes": total_bytes,
            }),
        );
    }
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::CodeFile;

    fn store() -> (tempfile::TempDir, FsRunStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRunStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_run_lifecycle() {
        let (_dir, store) = store();
        store.create_run("run-1", "proj-1", "Build a todo API").await.unwrap();

        let record = store.load_run("run-1").await.unwrap();
        assert_eq!(record.status, RunStatus::Pending);
        assert_eq!(record.prompt, "Build a todo API");
        assert!(record.artifacts.is_empty());

        store
            .update_run_status("run-1", RunStatus::Running)
            .await
            .unwrap();
        store
            .create_artifact("run-1", "requirements", serde_json::json!({"ok": true}))
            .await
            .unwrap();
        store
            .update_run_status("run-1", RunStatus::Completed)
            .await
            .unwrap();

        let record = store.load_run("run-1").await.unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.artifacts.len(), 1);
        assert_eq!(record.artifacts[0].stage, "requirements");
    }

    #[tokio::test]
    async fn test_prompt_is_truncated_to_budget() {
        let (_dir, store) = store();
        let long_prompt = "x".repeat(PROMPT_CHAR_BUDGET * 2);
        store.create_run("run-2", "proj-1", &long_prompt).await.unwrap();
        let record = store.load_run("run-2").await.unwrap();
        assert_eq!(record.prompt.chars().count(), PROMPT_CHAR_BUDGET);
    }

    #[tokio::test]
    async fn test_bundle_store_roundtrip() {
        let (_dir, store) = store();
        let files = vec![
            CodeFile::new("app/main.py", "app = None\n"),
            CodeFile::new("app/models.py", "class Todo:\n    pass\n"),
        ];
        let deps = vec!["fastapi".to_string(), "sqlmodel".to_string()];

        let handle = store
            .store_code_bundle("run-3", "implementer", &files, &deps)
            .await
            .unwrap();
        let bundle = store.load_code_bundle(&handle).await.unwrap();
        assert_eq!(bundle.files, files);
        assert_eq!(bundle.dependencies, deps);
    }

    #[tokio::test]
    async fn test_bundle_handles_are_content_addressed() {
        let (_dir, store) = store();
        let files = vec![CodeFile::new("app/main.py", "app = None\n")];
        let a = store
            .store_code_bundle("run-a", "implementer", &files, &[])
            .await
            .unwrap();
        let b = store
            .store_code_bundle("run-b", "reviewer_pass_1", &files, &[])
            .await
            .unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_malformed_handle_is_rejected() {
        let (_dir, store) = store();
        let err = store.load_code_bundle("../escape").await.unwrap_err();
        assert!(matches!(err, PipelineError::Store(_)));
    }

    #[tokio::test]
    async fn test_offload_final_code_rewrites_artifact() {
        let (_dir, store) = store();
        let content = serde_json::json!({
            "approved": true,
            "final_code": [
                {"path": "app/main.py", "content": "app = None\n"},
            ],
            "dependencies": ["fastapi"],
        });
        let rewritten = offload_final_code(&store, "run-4", "reviewer_pass_1", content)
            .await
            .unwrap();

        assert!(rewritten.get("final_code").is_none());
        let handle = rewritten["bundle_ref"].as_str().unwrap().to_string();
        let summary = &rewritten["final_code_summary"];
        assert_eq!(summary["files_count"], 1);
        assert_eq!(summary["file_paths"][0], "app/main.py");

        let bundle = store.load_code_bundle(&handle).await.unwrap();
        assert_eq!(bundle.files[0].path, "app/main.py");
        assert_eq!(bundle.dependencies, vec!["fastapi".to_string()]);
    }

    #[tokio::test]
    async fn test_offload_leaves_small_artifacts_alone() {
        let (_dir, store) = store();
        let content = serde_json::json!({"approved": false, "issues": []});
        let rewritten = offload_final_code(&store, "run-5", "reviewer_pass_1", content.clone())
            .await
            .unwrap();
        assert_eq!(rewritten, content);
    }

    #[test]
    fn test_run_record_json_roundtrip() {
        let record = RunRecord {
            run_id: "run-9".into(),
            project_id: "proj-9".into(),
            status: RunStatus::Running,
            prompt: "Build an expense tracker".into(),
            created_at: Utc::now(),
            artifacts: vec![ArtifactRecord {
                stage: "architecture".into(),
                content: serde_json::json!({"design_document": "# Design"}),
                created_at: Utc::now(),
            }],
        };
        let json = serde_json::to_string(&record).unwrap();
        let restored: RunRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.run_id, record.run_id);
        assert_eq!(restored.status, RunStatus::Running);
        assert_eq!(restored.artifacts.len(), 1);
        assert_eq!(restored.artifacts[0].stage, "architecture");
    }
}
