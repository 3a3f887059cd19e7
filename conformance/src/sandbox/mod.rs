//! Per-project ephemeral sandbox harness.
//!
//! Each project gets its own container and host port so concurrent runs do
//! not overwrite each other. The host directory layout is the source of
//! truth: `<root>/<project_id>/` holds the normalized source tree,
//! `requirements.txt`, an `.env` with per-run random SQLite paths, a POSIX
//! entrypoint script, a `.sandbox-runtime.json` metadata file, and the
//! bootstrap log. In-memory state is rebuilt by scanning that layout.

pub mod docker;

use std::collections::BTreeSet;
use std::net::TcpListener;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::artifacts::{sanitize_path, GeneratedCode, BASELINE_DEPENDENCIES};
use crate::error::{PipelineError, PipelineResult};
use crate::normalizer;
use docker::DockerCli;

/// Port the app listens on inside the container.
const CONTAINER_APP_PORT: u16 = 9000;
/// Bounded tail applied to combined sandbox logs.
const LOG_TAIL_CHARS: usize = 4000;

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn env_port(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Sandbox host/runtime configuration, environment-driven with defaults.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Host directory that holds one subdirectory per project.
    pub host_root: PathBuf,
    /// Workdir the host directory is mounted at inside the container.
    pub container_workdir: String,
    /// Container image used to run generated apps.
    pub image: String,
    /// Host name probes and swagger URLs are built against.
    pub public_host: String,
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// Per docker-command timeout.
    pub docker_timeout: Duration,
    /// Default readiness deadline for `wait_until_ready`.
    pub ready_timeout: Duration,
    /// Timeout for OpenAPI/docs probes.
    pub probe_timeout: Duration,
    /// Timeout for individual endpoint smoke probes.
    pub endpoint_timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            host_root: PathBuf::from(env_or("ATELIER_SANDBOX_ROOT", ".sandbox_data")),
            container_workdir: env_or("ATELIER_CONTAINER_WORKDIR", "/workspace"),
            image: env_or("ATELIER_SANDBOX_IMAGE", "python:3.12-slim"),
            public_host: env_or("ATELIER_PUBLIC_HOST", "localhost"),
            port_range_start: env_port("ATELIER_PORT_RANGE_START", 9100),
            port_range_end: env_port("ATELIER_PORT_RANGE_END", 9199),
            docker_timeout: Duration::from_secs(10),
            ready_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            endpoint_timeout: Duration::from_secs(5),
        }
    }
}

/// Whether bundle sources are normalized before being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxMode {
    Normalized,
    Raw,
}

impl SandboxMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normalized => "normalized",
            Self::Raw => "raw",
        }
    }
}

/// Per-project runtime metadata persisted beside the bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRuntime {
    pub project_id: String,
    pub container_name: String,
    pub port: u16,
    pub mode: String,
    pub host_dir: String,
    pub started_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
}

/// Typed registry over the sandbox host root plus the container CLI.
#[derive(Debug, Clone)]
pub struct SandboxHarness {
    config: SandboxConfig,
    docker: DockerCli,
    http: reqwest::Client,
}

impl SandboxHarness {
    pub fn new(config: SandboxConfig) -> Self {
        let docker = DockerCli::new(config.docker_timeout);
        Self {
            config,
            docker,
            http: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn host_dir(&self, project_id: &str) -> PathBuf {
        self.config.host_root.join(project_id)
    }

    fn runtime_path(&self, project_id: &str) -> PathBuf {
        self.host_dir(project_id).join(".sandbox-runtime.json")
    }

    fn bootstrap_log_path(&self, project_id: &str) -> PathBuf {
        self.host_dir(project_id).join("sandbox.log")
    }

    fn container_name(project_id: &str) -> String {
        let prefix: String = project_id.chars().filter(|c| c.is_ascii_alphanumeric()).take(12).collect();
        format!(
            "atelier-sandbox-{prefix}-{}",
            &Uuid::new_v4().simple().to_string()[..6]
        )
    }

    pub fn base_url(&self, port: u16) -> String {
        format!("http://{}:{port}", self.config.public_host)
    }

    pub fn docs_url(&self, port: u16) -> String {
        format!("{}/docs", self.base_url(port))
    }

    pub fn openapi_url(&self, port: u16) -> String {
        format!("{}/openapi.json", self.base_url(port))
    }

    pub fn read_runtime(&self, project_id: &str) -> Option<SandboxRuntime> {
        let text = std::fs::read_to_string(self.runtime_path(project_id)).ok()?;
        serde_json::from_str(&text).ok()
    }

    fn write_runtime(&self, runtime: &SandboxRuntime) -> PipelineResult<()> {
        let path = self.runtime_path(&runtime.project_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(runtime)?)?;
        Ok(())
    }

    fn delete_runtime(&self, project_id: &str) {
        let _ = std::fs::remove_file(self.runtime_path(project_id));
    }

    /// Scan the host root and rebuild every project's runtime metadata.
    pub fn read_all_runtimes(&self) -> Vec<SandboxRuntime> {
        let mut runtimes = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.config.host_root) else {
            return runtimes;
        };
        for entry in entries.flatten() {
            let runtime_path = entry.path().join(".sandbox-runtime.json");
            let Ok(text) = std::fs::read_to_string(runtime_path) else {
                continue;
            };
            if let Ok(runtime) = serde_json::from_str::<SandboxRuntime>(&text) {
                runtimes.push(runtime);
            }
        }
        runtimes
    }

    fn is_host_port_available(port: u16) -> bool {
        TcpListener::bind(("127.0.0.1", port)).is_ok()
    }

    /// Allocate a host port for a project.
    ///
    /// Reuses the project's previously-bound port when it is still free,
    /// otherwise scans the configured range skipping ports reserved by any
    /// other project's runtime metadata and ports the OS refuses to bind.
    pub fn allocate_port(&self, project_id: &str) -> PipelineResult<u16> {
        if let Some(existing) = self.read_runtime(project_id) {
            if Self::is_host_port_available(existing.port) {
                return Ok(existing.port);
            }
        }

        let reserved: BTreeSet<u16> = self
            .read_all_runtimes()
            .into_iter()
            .filter(|runtime| runtime.project_id != project_id)
            .map(|runtime| runtime.port)
            .collect();

        for port in self.config.port_range_start..=self.config.port_range_end {
            if reserved.contains(&port) {
                continue;
            }
            if Self::is_host_port_available(port) {
                return Ok(port);
            }
        }
        Err(PipelineError::sandbox("no free sandbox ports are available"))
    }

    /// Write the bundle (normalized unless raw mode) plus requirements,
    /// env file, and entrypoint script into the project's host directory.
    pub fn write_bundle(
        &self,
        project_id: &str,
        code: &GeneratedCode,
        mode: SandboxMode,
    ) -> PipelineResult<()> {
        let sandbox_dir = self.host_dir(project_id);
        if sandbox_dir.exists() {
            std::fs::remove_dir_all(&sandbox_dir)?;
        }
        std::fs::create_dir_all(&sandbox_dir)?;

        let mut bundle = code.clone();
        if mode == SandboxMode::Normalized {
            normalizer::normalize_bundle(&mut bundle);
        }

        for file in &bundle.files {
            let relative = sanitize_path(&file.path);
            if relative.is_empty() {
                continue;
            }
            let file_path = sandbox_dir.join(&relative);
            if let Some(parent) = file_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&file_path, &file.content)?;
            info!(path = %file_path.display(), "wrote sandbox file");
        }

        let mut requirements: BTreeSet<String> = BASELINE_DEPENDENCIES
            .iter()
            .map(|dep| dep.to_string())
            .collect();
        requirements.extend(
            bundle
                .dependencies
                .iter()
                .map(|dep| dep.trim().to_string())
                .filter(|dep| !dep.is_empty()),
        );
        if mode == SandboxMode::Normalized {
            let uses_email_str = bundle.files.iter().any(|f| f.content.contains("EmailStr"));
            let has_email_dep = requirements
                .iter()
                .any(|dep| dep == "email-validator" || dep.starts_with("pydantic[email]"));
            if uses_email_str && !has_email_dep {
                requirements.insert("email-validator".to_string());
            }
        }
        std::fs::write(
            sandbox_dir.join("requirements.txt"),
            requirements.into_iter().collect::<Vec<_>>().join("\n"),
        )?;

        let db_token = &Uuid::new_v4().simple().to_string()[..8];
        std::fs::write(
            sandbox_dir.join(".env"),
            format!(
                "PORT={CONTAINER_APP_PORT}\n\
                 DATABASE_URL=sqlite:////tmp/sandbox-{project_id}-{db_token}.db\n\
                 AUTH_DATABASE_URL=sqlite:////tmp/auth-{project_id}-{db_token}.db\n\
                 SECRET_KEY=sandbox-secret-key\n\
                 ACCESS_TOKEN_EXPIRE_MINUTES=60\n"
            ),
        )?;

        let workdir = &self.config.container_workdir;
        let entrypoint = sandbox_dir.join("container_entrypoint.sh");
        std::fs::write(
            &entrypoint,
            format!(
                "#!/bin/sh\n\
                 set -e\n\
                 echo \"Preparing sandbox for project {project_id}\"\n\
                 cd \"{workdir}\"\n\
                 set -a\n\
                 [ -f \".env\" ] && . \"./.env\"\n\
                 set +a\n\
                 python -m pip install -q -r requirements.txt\n\
                 \n\
                 if [ -f \"app/main.py\" ]; then\n\
                 \x20   MODULE=\"app.main:app\"\n\
                 elif [ -f \"main.py\" ]; then\n\
                 \x20   MODULE=\"main:app\"\n\
                 else\n\
                 \x20   MODULE=$(grep -rl \"FastAPI()\" . --include=\"*.py\" | head -1 | sed 's|^./||;s|/|.|g;s|.py$||'):app\n\
                 fi\n\
                 \n\
                 echo \"Launching uvicorn module $MODULE\"\n\
                 exec uvicorn \"$MODULE\" --host 0.0.0.0 --port \"${{PORT:-{CONTAINER_APP_PORT}}}\"\n"
            ),
        )?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&entrypoint, std::fs::Permissions::from_mode(0o755))?;
        }

        Ok(())
    }

    /// Force-remove the project's container, if any.
    pub async fn stop(&self, project_id: &str) {
        let container_name = self
            .read_runtime(project_id)
            .map(|runtime| runtime.container_name)
            .unwrap_or_else(|| Self::container_name(project_id));
        self.docker.force_remove(&container_name).await;
    }

    /// Launch (or relaunch) the project's container.
    ///
    /// Any prior container is force-removed first; stale metadata must never
    /// block a restart.
    pub async fn launch(&self, project_id: &str, mode: SandboxMode) -> PipelineResult<()> {
        let sandbox_dir = self
            .host_dir(project_id)
            .canonicalize()
            .map_err(|err| PipelineError::sandbox(format!("sandbox dir missing: {err}")))?;
        let container_name = Self::container_name(project_id);
        self.stop(project_id).await;
        self.docker.force_remove(&container_name).await;
        let port = self.allocate_port(project_id)?;

        let mut runtime = SandboxRuntime {
            project_id: project_id.to_string(),
            container_name: container_name.clone(),
            port,
            mode: mode.as_str().to_string(),
            host_dir: sandbox_dir.display().to_string(),
            started_at: chrono::Utc::now().timestamp(),
            container_id: None,
        };
        self.write_runtime(&runtime)?;

        let publish = format!("{port}:{CONTAINER_APP_PORT}");
        let mount = format!("{}:{}", sandbox_dir.display(), self.config.container_workdir);
        let entrypoint = format!("{}/container_entrypoint.sh", self.config.container_workdir);
        let run_args = [
            "run",
            "-d",
            "--name",
            &container_name,
            "-p",
            &publish,
            "-v",
            &mount,
            "-w",
            &self.config.container_workdir,
            &self.config.image,
            "sh",
            &entrypoint,
        ];

        let mut output = self.docker.run(&run_args).await?;
        if !output.success && output.error_text().contains("is already in use") {
            self.docker.force_remove(&container_name).await;
            output = self.docker.run(&run_args).await?;
        }
        if !output.success {
            self.delete_runtime(project_id);
            return Err(PipelineError::sandbox(output.error_text()));
        }

        runtime.container_id = Some(output.stdout.trim().to_string());
        self.write_runtime(&runtime)?;
        info!(project_id, container = %container_name, port, "sandbox container started");
        Ok(())
    }

    /// Whether the sandbox answers its docs endpoint with a 2xx/3xx.
    pub async fn is_live(&self, project_id: &str) -> bool {
        let Some(runtime) = self.read_runtime(project_id) else {
            return false;
        };
        let response = self
            .http
            .get(self.docs_url(runtime.port))
            .timeout(Duration::from_secs(3))
            .send()
            .await;
        match response {
            Ok(resp) => {
                let status = resp.status().as_u16();
                (200..400).contains(&status)
            }
            Err(_) => false,
        }
    }

    /// Poll the sandbox until it is live or the deadline elapses.
    pub async fn wait_until_ready(&self, project_id: &str, deadline: Duration) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < deadline {
            if self.is_live(project_id).await {
                return true;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        false
    }

    /// Combined container + bootstrap logs, bounded to a tail.
    pub async fn logs(&self, project_id: &str) -> Option<String> {
        let container_name = self
            .read_runtime(project_id)
            .map(|runtime| runtime.container_name)
            .unwrap_or_else(|| Self::container_name(project_id));
        let container_logs = self.docker.logs_tail(&container_name, 200).await;

        let file_logs = std::fs::read_to_string(self.bootstrap_log_path(project_id))
            .map(|text| tail_chars(text.trim(), LOG_TAIL_CHARS))
            .unwrap_or_default();

        let parts: Vec<&str> = [container_logs.trim(), file_logs.trim()]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect();
        if parts.is_empty() {
            return None;
        }
        Some(tail_chars(&parts.join("\n\n"), LOG_TAIL_CHARS))
    }

    /// Fetch the served OpenAPI document.
    pub async fn fetch_openapi(&self, port: u16) -> PipelineResult<Value> {
        let response = self
            .http
            .get(self.openapi_url(port))
            .timeout(self.config.probe_timeout)
            .send()
            .await
            .map_err(|err| PipelineError::sandbox(format!("failed to fetch /openapi.json: {err}")))?;
        if !response.status().is_success() {
            return Err(PipelineError::sandbox(format!(
                "/openapi.json returned {}",
                response.status().as_u16()
            )));
        }
        response
            .json::<Value>()
            .await
            .map_err(|err| PipelineError::sandbox(format!("failed to parse /openapi.json: {err}")))
    }

    /// Best-effort HTTP probe against one sandbox endpoint. Returns the
    /// status code, or an error string on a connection-level failure.
    pub async fn probe_endpoint(
        &self,
        port: u16,
        method: &str,
        path: &str,
    ) -> Result<(u16, String), String> {
        let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|err| err.to_string())?;
        let url = format!("{}{}", self.base_url(port), path);
        let response = self
            .http
            .request(method, url)
            .timeout(self.config.endpoint_timeout)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok((status, body))
    }
}

fn tail_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars()
        .skip(text.chars().count() - max_chars)
        .collect()
}

/// Whether a served OpenAPI spec is the runner's fallback shell app.
///
/// A fallback spec means the generated routes failed to import; the runner
/// served a bare app with only health endpoints. This is release-blocking.
pub fn openapi_looks_like_fallback(spec: &Value) -> bool {
    let Some(paths) = spec.get("paths").and_then(Value::as_object) else {
        return true;
    };
    let meaningful = paths
        .keys()
        .map(|path| path.trim())
        .filter(|path| !path.is_empty() && !matches!(*path, "/" | "/health" | "/ready"))
        .count();
    meaningful == 0
}
