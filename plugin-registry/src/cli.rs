///
/// This module implements the CLI interface for plugin-registry: command parsing,
/// the publication trigger gate, and the end-of-run summary.
///
/// All pipeline logic (selection, compilation, publication) lives in the
/// [`plugin-registry-core`] crate. This module is strictly CLI glue.
///
/// ## How To Use
/// - For command-line users: `plugin-registry build --help`.
/// - For programmatic/integration use: call [`run`] with a constructed [`Cli`].
///
/// ## Exit status
/// [`run`] returns `Err` whenever the run failed: a compile error, any failed
/// artifact, or a failed registry write. `main` turns that into a non-zero exit.
///
/// [`plugin-registry-core`]: ../../plugin-registry-core/
use crate::load_config::{load_config, CliConfig};
use crate::upload::S3Client;
use anyhow::Result;
use clap::{Parser, Subcommand};
use plugin_registry_core::compile::EsbuildBundler;
use plugin_registry_core::contract::ObjectStore;
use plugin_registry_core::pipeline::{run_pipeline, PipelineOutcome};
use std::path::PathBuf;

/// CLI for plugin-registry: build plugin bundles and publish them to the registry.
#[derive(Parser, Debug)]
#[clap(
    name = "plugin-registry",
    version,
    about = "Compile plugin sources into bundles and publish them to the plugin registry"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compile the selected sources and publish the results
    Build {
        /// Source files or glob patterns; replaces the configured sources
        #[clap(long, num_args = 1..)]
        file: Vec<String>,
        /// Build into the dry-run directory and never contact object storage
        #[clap(long)]
        dryrun: bool,
        /// Path to an optional YAML config file
        #[clap(long)]
        config: Option<PathBuf>,
    },
}

/// Where a run's artifacts end up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishTarget {
    DryRun,
    LocalOnly,
    Remote,
}

impl PublishTarget {
    pub fn decide(dryrun: bool, config: &CliConfig) -> Self {
        if dryrun {
            PublishTarget::DryRun
        } else if config.trigger.is_fired() {
            PublishTarget::Remote
        } else {
            PublishTarget::LocalOnly
        }
    }
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Build {
            file,
            dryrun,
            config,
        } => build(file, dryrun, config).await,
    }
}

async fn build(file: Vec<String>, dryrun: bool, config_path: Option<PathBuf>) -> Result<()> {
    let mut config = load_config(config_path.as_deref())?;
    if !file.is_empty() {
        config.pipeline.sources = file;
    }

    let target = PublishTarget::decide(dryrun, &config);
    match target {
        PublishTarget::DryRun => {
            tracing::info!(output_dir = %config.dryrun_dir.display(), "Dry run: building without publishing");
            config.pipeline.output_dir = config.dryrun_dir.clone();
        }
        PublishTarget::LocalOnly => {
            tracing::info!(
                trigger_env = %config.trigger.env,
                "Skipping push to object storage"
            );
        }
        PublishTarget::Remote => {
            tracing::info!(bucket = %config.pipeline.publish.bucket, "Publishing to object storage");
        }
    }

    let store = match target {
        PublishTarget::Remote => Some(S3Client::new_from_env(&config.pipeline.publish)?),
        _ => None,
    };
    let bundler = EsbuildBundler::new(config.pipeline.bundler.clone());

    tracing::info!(command = "build", ?target, "Starting build");
    let outcome = run_pipeline(
        &config.pipeline,
        &bundler,
        store.as_ref().map(|s| s as &dyn ObjectStore),
    )
    .await;

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(command = "build", error = %e, "Build failed");
            return Err(e.into());
        }
    };

    print_summary(&outcome);
    if outcome.is_success() {
        tracing::info!(command = "build", "Build complete");
        Ok(())
    } else {
        let failures = outcome.report().map_or(0, |r| r.failures().count());
        tracing::error!(command = "build", failures, "Build finished with failures");
        Err(anyhow::anyhow!("build finished with {failures} failed artifact(s)"))
    }
}

fn print_summary(outcome: &PipelineOutcome) {
    match outcome {
        PipelineOutcome::NothingToBuild { missing } => {
            println!("nothing to build");
            for pattern in missing {
                println!("no match: {pattern}");
            }
        }
        PipelineOutcome::Completed(report) => {
            for line in report.outcomes.iter().map(|o| o.summary_line()) {
                println!("{line}");
            }
            if let Some(path) = &report.registry_path {
                println!("registry: {} ({} records)", path.display(), report.records.len());
            }
            if let Some(error) = &report.registry_error {
                println!("registry failed: {error}");
            }
        }
    }
}
