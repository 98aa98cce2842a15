//! Seams to the collaborators that do the heavy lifting: the learning
//! pipeline and the content-addressed store.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::ledger::JobId;

/// Everything the pipeline needs to work on one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub job: JobId,
    pub kernel: PathBuf,
    pub dataset: PathBuf,
    /// Index of this worker among the job's workers.
    pub batch: usize,
    /// Where compute output must be written.
    pub output: PathBuf,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no {0} command configured")]
    NotConfigured(&'static str),

    #[error("cannot run {stage} command: {source}")]
    Spawn {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{stage} command failed with {status}")]
    Failed { stage: &'static str, status: String },

    #[error("compute finished without writing {0}")]
    MissingOutput(PathBuf),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("content store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("content store returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("content store I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected content store response: {0}")]
    Decode(String),
}

/// Callbacks from the pipeline into the node.
pub trait PipelineDelegate: Send + Sync {
    fn on_validation_complete(&self, success: bool);
    /// `result` is the content reference of the uploaded output.
    fn on_compute_complete(&self, success: bool, result: Option<String>);
    fn on_training_progress(&self, percent: u8);
}

pub trait CognitivePipeline: Send + Sync + 'static {
    /// Checks that kernel and dataset can be loaded together.
    fn validate(&self, spec: &JobSpec) -> impl Future<Output = Result<(), PipelineError>> + Send;

    /// Runs the job, reporting progress, and returns the output file.
    fn compute(
        &self,
        spec: &JobSpec,
        progress: &dyn PipelineDelegate,
    ) -> impl Future<Output = Result<PathBuf, PipelineError>> + Send;
}

pub trait ContentStore: Send + Sync + 'static {
    /// Fetches `reference` into `dir` and returns the local path.
    fn download(
        &self,
        reference: &str,
        dir: &Path,
    ) -> impl Future<Output = Result<PathBuf, StoreError>> + Send;

    fn upload(&self, path: &Path) -> impl Future<Output = Result<String, StoreError>> + Send;
}

/// Runs external programs for validation and compute.
///
/// Paths and the batch number are passed as `COGNODE_KERNEL`,
/// `COGNODE_DATASET`, `COGNODE_BATCH` and `COGNODE_OUTPUT`. Lines of the form
/// `progress <percent>` on stdout are reported as training progress.
pub struct CommandPipeline {
    config: PipelineConfig,
}

fn parse_progress(line: &str) -> Option<u8> {
    let value = line.trim().strip_prefix("progress")?.trim();
    value.parse::<u8>().ok().filter(|p| *p <= 100)
}

impl CommandPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    async fn run(
        &self,
        stage: &'static str,
        argv: &[String],
        spec: &JobSpec,
        progress: Option<&dyn PipelineDelegate>,
    ) -> Result<(), PipelineError> {
        let (program, args) = argv.split_first().ok_or(PipelineError::NotConfigured(stage))?;
        info!(stage, job = %spec.job, program, "starting pipeline command");

        let mut child = Command::new(program)
            .args(args)
            .env("COGNODE_KERNEL", &spec.kernel)
            .env("COGNODE_DATASET", &spec.dataset)
            .env("COGNODE_BATCH", spec.batch.to_string())
            .env("COGNODE_OUTPUT", &spec.output)
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PipelineError::Spawn { stage, source })?;

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match (parse_progress(&line), progress) {
                        (Some(percent), Some(delegate)) => delegate.on_training_progress(percent),
                        _ => debug!(stage, "{line}"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!(stage, error = %e, "cannot read command output");
                        break;
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|source| PipelineError::Spawn { stage, source })?;
        if !status.success() {
            return Err(PipelineError::Failed {
                stage,
                status: status.to_string(),
            });
        }
        Ok(())
    }
}

impl CognitivePipeline for CommandPipeline {
    async fn validate(&self, spec: &JobSpec) -> Result<(), PipelineError> {
        self.run("validate", &self.config.validate_command, spec, None)
            .await
    }

    async fn compute(
        &self,
        spec: &JobSpec,
        progress: &dyn PipelineDelegate,
    ) -> Result<PathBuf, PipelineError> {
        self.run("compute", &self.config.compute_command, spec, Some(progress))
            .await?;
        if !spec.output.exists() {
            return Err(PipelineError::MissingOutput(spec.output.clone()));
        }
        Ok(spec.output.clone())
    }
}
