//! `atelier-agents` CLI: drive a generation run or validate a bundle.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use atelier_agents::{Pipeline, PipelineConfig, PipelineOptions, RuntimeMode, StartStage};
use conformance::{validate_bundle, CodeFile, GeneratedCode};

#[derive(Parser)]
#[command(name = "atelier-agents", about = "Backend code generation pipeline")]
struct Cli {
    /// Optional TOML config file overlaying the environment defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full pipeline for a prompt, streaming events as JSON lines.
    Run {
        /// Natural-language description of the desired backend.
        #[arg(long)]
        prompt: String,
        /// Project scope for sandbox isolation; generated when omitted.
        #[arg(long)]
        project_id: Option<String>,
        /// Run identifier; generated when omitted.
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long, value_enum, default_value = "sandbox")]
        runtime_mode: RuntimeMode,
        #[arg(long, value_enum, default_value = "requirements")]
        start_stage: StartStage,
    },
    /// Run the deterministic validator over a directory of Python sources.
    Validate {
        /// Directory holding the bundle (paths are taken relative to it).
        #[arg(long)]
        dir: PathBuf,
    },
}

fn collect_python_files(root: &Path, dir: &Path, files: &mut Vec<CodeFile>) -> Result<()> {
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_python_files(root, &path, files)?;
        } else if path.extension().is_some_and(|ext| ext == "py") {
            let relative = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            files.push(CodeFile::new(relative, content));
        }
    }
    Ok(())
}

async fn run_pipeline(
    config: PipelineConfig,
    prompt: String,
    project_id: Option<String>,
    run_id: Option<String>,
    runtime_mode: RuntimeMode,
    start_stage: StartStage,
) -> Result<()> {
    let project_id = project_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let run_id = run_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    info!(project_id = %project_id, run_id = %run_id, "starting pipeline run");

    let pipeline = Arc::new(Pipeline::from_config(&config)?);
    let opts = PipelineOptions {
        runtime_mode,
        start_stage,
        charter_override: None,
        architecture_override: None,
    };

    let mut rx = pipeline.run(project_id, run_id, prompt, opts);
    let mut failed = false;
    while let Some(event) = rx.recv().await {
        if matches!(event, atelier_agents::PipelineEvent::Error { .. }) {
            failed = true;
        }
        println!("{}", serde_json::to_string(&event)?);
    }
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn validate_dir(dir: &Path) -> Result<()> {
    let mut files = Vec::new();
    collect_python_files(dir, dir, &mut files)?;
    files.sort_by(|a, b| a.path.cmp(&b.path));
    anyhow::ensure!(!files.is_empty(), "no .py files under {}", dir.display());

    let code = GeneratedCode::new(files, vec![]);
    let report = validate_bundle(&code);
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.passed {
        std::process::exit(1);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => PipelineConfig::from_toml_file(path)?,
        None => PipelineConfig::default(),
    };

    match cli.command {
        Command::Run {
            prompt,
            project_id,
            run_id,
            runtime_mode,
            start_stage,
        } => {
            run_pipeline(config, prompt, project_id, run_id, runtime_mode, start_stage).await
        }
        Command::Validate { dir } => validate_dir(&dir),
    }
}
