/// `load_config` module: Loads an optional static YAML config file and overlays environment settings.
///
/// This module is the only place where untrusted YAML is parsed into the strongly-typed
/// [`PipelineConfig`] the core crate runs on.
///
/// # Responsibilities
/// - Parse the user-supplied YAML file. Every key has a default, so no file at all is valid.
/// - Overlay `AWS_REGION` and `S3_ENDPOINT` from the environment onto the publish section.
/// - Hold the CLI-only settings: the dry-run output directory and the publication trigger.
///
/// Credentials are never read from the file. The S3 client takes them from the environment.
///
/// # Errors
/// All errors use `anyhow::Error` with the config path attached, and surface at the CLI boundary.
use anyhow::{Context, Result};
use plugin_registry_core::config::PipelineConfig;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};

pub const REGION_ENV: &str = "AWS_REGION";
pub const ENDPOINT_ENV: &str = "S3_ENDPOINT";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    #[serde(flatten)]
    pub pipeline: PipelineConfig,
    /// Output directory used instead of `output_dir` for `--dryrun`.
    pub dryrun_dir: PathBuf,
    pub trigger: TriggerConfig,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            dryrun_dir: PathBuf::from("./dryrun"),
            trigger: TriggerConfig::default(),
        }
    }
}

/// Remote publication only happens when `env` holds exactly `value`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub env: String,
    pub value: String,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            env: "CODEBUILD_WEBHOOK_EVENT".to_string(),
            value: "PULL_REQUEST_MERGED".to_string(),
        }
    }
}

impl TriggerConfig {
    pub fn is_fired(&self) -> bool {
        env::var(&self.env).is_ok_and(|v| v == self.value)
    }
}

/// Load `path` if given, defaults otherwise, then apply environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<CliConfig> {
    let mut config = match path {
        Some(path) => read_config_file(path)?,
        None => {
            info!("No config file given, using defaults");
            CliConfig::default()
        }
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

fn read_config_file(path: &Path) -> Result<CliConfig> {
    info!(config_path = ?path, "Loading configuration from file");
    let content = fs::read_to_string(path)
        .inspect_err(|e| error!(error = ?e, config_path = ?path, "Failed to read config file"))
        .with_context(|| format!("Failed to read config file {path:?}"))?;

    // An empty file deserializes to unit, not to a mapping.
    if content.trim().is_empty() {
        return Ok(CliConfig::default());
    }

    let config: CliConfig = serde_yaml::from_str(&content)
        .inspect_err(|e| error!(error = ?e, config_path = ?path, "Failed to parse config YAML"))
        .with_context(|| format!("Failed to parse config YAML {path:?}"))?;
    info!(config_path = ?path, "Parsed config YAML successfully");
    Ok(config)
}

fn apply_env_overrides(config: &mut CliConfig) {
    let publish = &mut config.pipeline.publish;
    if let Some(region) = non_empty_env(REGION_ENV) {
        info!(region = %region, "Region overridden from environment");
        publish.region = region;
    }
    if let Some(endpoint) = non_empty_env(ENDPOINT_ENV) {
        info!(endpoint = %endpoint, "Endpoint overridden from environment");
        publish.endpoint = Some(endpoint);
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}
