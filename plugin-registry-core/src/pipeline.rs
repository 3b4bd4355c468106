//! High-level pipeline: orchestrates select → compile → publish for one run.
//!
//! # Phases
//!   - [`select::resolve`] turns configured patterns into an ordered file list.
//!     An empty selection ends the run successfully without touching the
//!     output directory or calling the bundler.
//!   - [`compile::compile`] rewrites and bundles every input into a fresh output
//!     directory. Any diagnostic aborts the run before anything is published.
//!   - [`publish::publish`] loads, uploads and records every artifact, then
//!     writes the registry document.
//!
//! # Error Handling
//! Build-phase failures come back as [`PipelineError`]. Publish-phase failures
//! are per artifact and live in the [`PublishReport`]; check
//! [`PipelineOutcome::is_success`] for the overall status.
//!
//! # Callable From
//! Used by the CLI crate and integration tests. Both inject a [`Bundler`]; the
//! [`ObjectStore`] is `None` for local-only runs.

use tracing::{error, info};

use crate::compile;
use crate::config::{PipelineConfig, RegistryMode};
use crate::contract::{Bundler, ObjectStore};
use crate::error::PipelineError;
use crate::publish::{self, PublishReport};
use crate::registry;
use crate::select;

#[derive(Debug)]
pub enum PipelineOutcome {
    /// No configured pattern matched a file. `missing` lists the patterns.
    NothingToBuild { missing: Vec<String> },
    Completed(PublishReport),
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        match self {
            PipelineOutcome::NothingToBuild { .. } => true,
            PipelineOutcome::Completed(report) => !report.has_failures(),
        }
    }

    pub fn report(&self) -> Option<&PublishReport> {
        match self {
            PipelineOutcome::Completed(report) => Some(report),
            PipelineOutcome::NothingToBuild { .. } => None,
        }
    }
}

pub async fn run_pipeline<B>(
    config: &PipelineConfig,
    bundler: &B,
    store: Option<&dyn ObjectStore>,
) -> Result<PipelineOutcome, PipelineError>
where
    B: Bundler + ?Sized,
{
    config.trace_loaded();

    let selection = select::resolve(&config.sources, &config.base_dir);
    if selection.is_empty() {
        info!(patterns = config.sources.len(), "[PIPELINE] No files to build");
        return Ok(PipelineOutcome::NothingToBuild {
            missing: selection.missing,
        });
    }

    ensure_output_outside_base(config).await?;

    // Compilation wipes the output directory, so a local merge reads the old registry first.
    let previous_local = match (config.publish.registry_mode, store) {
        (RegistryMode::Merge, None) => registry::read_local(
            &config.output_dir.join(&config.publish.registry_file),
        ),
        _ => None,
    };

    let artifacts = compile::compile(&selection.inputs, &config.output_dir, bundler).await?;
    info!(artifacts = artifacts.len(), "[PIPELINE] Compilation finished");

    let report = publish::publish(
        &config.publish,
        &config.output_dir,
        artifacts,
        store,
        previous_local,
    )
    .await;
    info!(
        records = report.records.len(),
        failures = report.failures().count(),
        "[PIPELINE] Publication finished"
    );
    Ok(PipelineOutcome::Completed(report))
}

/// Refuses an output directory that is, or contains, the base directory.
async fn ensure_output_outside_base(config: &PipelineConfig) -> Result<(), PipelineError> {
    if !config.output_dir.exists() {
        return Ok(());
    }
    let output_dir = tokio::fs::canonicalize(&config.output_dir).await?;
    let base_dir = tokio::fs::canonicalize(&config.base_dir).await?;
    if base_dir.starts_with(&output_dir) {
        error!(output_dir = %output_dir.display(), base_dir = %base_dir.display(), "[PIPELINE][ERROR] Output directory would remove the base directory");
        return Err(PipelineError::UnsafeOutputDir {
            output_dir,
            base_dir,
        });
    }
    Ok(())
}
