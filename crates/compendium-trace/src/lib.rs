//! Tracer adapter (component B).
//!
//! Wraps an external syscall tracer — the tracer itself is an opaque
//! collaborator, so this crate only defines the contract (`Tracer`) and a
//! trace record shape, plus one real implementation that shells out to a
//! configurable tracer binary and one test double.

use std::collections::HashMap;
use std::process::Command as StdCommand;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum TracerError {
    #[error("tracer binary could not be started: {0}")]
    TracerUnavailable(String),
    #[error("traced program exited non-zero: {exit_code}")]
    TraceAborted { exit_code: i32 },
    #[error("failed to read trace output at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse trace record: {0}")]
    Malformed(String),
}

impl compendium_types::Classify for TracerError {
    fn classify(&self) -> compendium_types::ErrorClassification {
        use compendium_types::ErrorClassification::*;
        match self {
            TracerError::TracerUnavailable(_) | TracerError::TraceAborted { .. } => External,
            TracerError::Io { .. } => Io,
            TracerError::Malformed(_) => Io,
        }
    }
}

/// One recorded run inside a trace: its argument vector and environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub argv: Vec<String>,
    pub environ: HashMap<String, String>,
}

/// One observed file, with which runs read and wrote it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputOutputEntry {
    pub path: Utf8PathBuf,
    pub read_by_runs: Vec<usize>,
    pub written_by_runs: Vec<usize>,
}

/// The tracer adapter's structured observation of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub inputs_outputs: Vec<InputOutputEntry>,
    pub runs: Vec<Run>,
    pub other_files: Vec<Utf8PathBuf>,
    /// The tracer's mutable on-disk layout; the builder may rewrite files
    /// under this directory before sealing.
    pub root_dir: Utf8PathBuf,
}

/// Contract a tracer implementation must satisfy.
pub trait Tracer {
    fn trace(&self, argv: &[String], output_dir: &Utf8Path) -> Result<TraceRecord, TracerError>;
}

/// Shells out to an external tracer binary, grounded on
/// `turborepo-process::Command` for building the child invocation and on
/// `reprozip_execute_script`'s `trace.trace(binary, args, dir)` pattern for
/// the external-tool contract: run the tracer, then read back a trace
/// record it wrote to `output_dir`.
pub struct ExternalCommandTracer {
    tracer_binary: String,
}

impl ExternalCommandTracer {
    pub fn new(tracer_binary: impl Into<String>) -> Self {
        Self {
            tracer_binary: tracer_binary.into(),
        }
    }
}

impl Tracer for ExternalCommandTracer {
    #[tracing::instrument(skip(self), fields(tracer = %self.tracer_binary))]
    fn trace(&self, argv: &[String], output_dir: &Utf8Path) -> Result<TraceRecord, TracerError> {
        std::fs::create_dir_all(output_dir).map_err(|source| TracerError::Io {
            path: output_dir.to_string(),
            source,
        })?;

        let mut command = StdCommand::new(&self.tracer_binary);
        command.arg("trace").arg("--output").arg(output_dir.as_str());
        command.args(argv);

        let status = command
            .status()
            .map_err(|e| TracerError::TracerUnavailable(e.to_string()))?;

        if !status.success() {
            return Err(TracerError::TraceAborted {
                exit_code: status.code().unwrap_or(-1),
            });
        }

        let record_path = output_dir.join("trace-record.json");
        let raw = std::fs::read_to_string(&record_path).map_err(|source| TracerError::Io {
            path: record_path.to_string(),
            source,
        })?;

        serde_json::from_str(&raw).map_err(|e| TracerError::Malformed(e.to_string()))
    }
}

/// Returns a preset [`TraceRecord`] without touching the filesystem or
/// spawning a process — used by builder/graph tests so they don't depend
/// on a real tracer binary being installed, grounded on
/// `turborepo-task-executor`'s dry-run execution path.
pub struct NullTracer {
    record: TraceRecord,
}

impl NullTracer {
    pub fn new(record: TraceRecord) -> Self {
        Self { record }
    }
}

impl Tracer for NullTracer {
    fn trace(&self, _argv: &[String], _output_dir: &Utf8Path) -> Result<TraceRecord, TracerError> {
        Ok(self.record.clone())
    }
}
