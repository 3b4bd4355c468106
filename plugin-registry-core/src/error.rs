//! Error taxonomy for the build-and-publish pipeline.
//!
//! Build-phase failures ([`CompileError`]) abort the whole run before anything
//! is published. Per-artifact failures ([`LoadError`], and transport failures
//! surfaced through [`crate::contract::StoreError`]) are collected by the
//! publisher and reflected in the final status.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// One bundler or transform diagnostic, attributed to an original source file.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Diagnostic {
    pub file: Option<PathBuf>,
    pub line: Option<usize>,
    pub column: Option<usize>,
    pub message: String,
}

impl Diagnostic {
    pub fn for_file(file: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            file: Some(file.into()),
            line: None,
            column: None,
            message: message.into(),
        }
    }

    pub fn at(mut self, line: usize, column: usize) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.file, self.line, self.column) {
            (Some(file), Some(line), Some(col)) => {
                write!(f, "{}:{}:{}: {}", file.display(), line, col, self.message)
            }
            (Some(file), _, _) => write!(f, "{}: {}", file.display(), self.message),
            (None, _, _) => write!(f, "{}", self.message),
        }
    }
}

/// The batch failed to compile. No artifact from this run is valid.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("bundler reported {} diagnostic(s): {}", .0.len(), render_diagnostics(.0))]
    Diagnostics(Vec<Diagnostic>),

    #[error("failed to launch bundler `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("output directory {} contains the source {}", .output_dir.display(), .source_path.display())]
    OutputContainsSource {
        output_dir: PathBuf,
        source_path: PathBuf,
    },

    #[error("bundler did not produce expected artifact {}", .0.display())]
    MissingArtifact(PathBuf),

    #[error("io error during compilation: {0}")]
    Io(#[from] std::io::Error),
}

impl CompileError {
    /// Per-file diagnostics, empty for launch and IO failures.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            CompileError::Diagnostics(d) => d,
            _ => &[],
        }
    }
}

fn render_diagnostics(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// A compiled artifact could not be turned into a registry entry.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("artifact {} is missing or empty", .0.display())]
    MissingArtifact(PathBuf),

    #[error("no plugin metadata declared for artifact {}", .0.display())]
    MissingManifest(PathBuf),

    #[error("malformed manifest {}: {reason}", .path.display())]
    MalformedManifest { path: PathBuf, reason: String },

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("plugin {name} does not declare required capability `{capability}`")]
    MissingCapability { name: String, capability: String },

    #[error("duplicate release {name}@{version}, already produced by {first}")]
    DuplicateRelease {
        name: String,
        version: String,
        first: String,
    },

    #[error("loading timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("io error while loading: {0}")]
    Io(#[from] std::io::Error),
}

/// Fatal build-phase failure for a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("compilation failed: {0}")]
    Compile(#[from] CompileError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("output directory {} would remove base directory {}", .output_dir.display(), .base_dir.display())]
    UnsafeOutputDir { output_dir: PathBuf, base_dir: PathBuf },
}
