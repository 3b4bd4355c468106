use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// Everything one pipeline run needs, after file, flag and env layering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Ordered source patterns: literal paths or globs.
    pub sources: Vec<String>,
    /// Directory relative patterns are resolved against.
    pub base_dir: PathBuf,
    pub output_dir: PathBuf,
    pub bundler: BundlerConfig,
    pub publish: PublishConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sources: vec!["./src/*.ts".to_string()],
            base_dir: PathBuf::from("."),
            output_dir: PathBuf::from("./dist"),
            bundler: BundlerConfig::default(),
            publish: PublishConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn trace_loaded(&self) {
        info!(
            output_dir = %self.output_dir.display(),
            sources_count = self.sources.len(),
            bundler = %self.bundler.command,
            registry_mode = ?self.publish.registry_mode,
            local_layout = ?self.publish.local_layout,
            "Loaded PipelineConfig"
        );
        debug!(?self, "PipelineConfig loaded (full debug)");
    }
}

/// How the external bundler is invoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BundlerConfig {
    pub command: String,
    /// Arguments placed before the entry points, e.g. `["esbuild"]` when `command` is `npx`.
    pub args: Vec<String>,
    pub platform: String,
    pub format: String,
}

impl Default for BundlerConfig {
    fn default() -> Self {
        Self {
            command: "esbuild".to_string(),
            args: Vec::new(),
            platform: "node".to_string(),
            format: "esm".to_string(),
        }
    }
}

/// Whether the registry document replaces or extends the previously published one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryMode {
    #[default]
    Replace,
    Merge,
}

/// Where artifacts end up in the local output directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocalLayout {
    /// `<output_dir>/<file>.js`, as produced by the bundler.
    #[default]
    Flat,
    /// `<output_dir>/<name>/<version>/<file>.js`
    Versioned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub bucket: String,
    pub region: String,
    /// Object-store endpoint; `None` means the regional AWS endpoint.
    pub endpoint: Option<String>,
    /// Public prefix for `downloadUrl`; `None` derives it from bucket and region.
    pub download_base_url: Option<String>,
    pub registry_file: String,
    pub registry_mode: RegistryMode,
    pub local_layout: LocalLayout,
    pub keep_local_artifacts: bool,
    pub required_capabilities: Vec<String>,
    pub max_concurrency: usize,
    pub upload_timeout_secs: u64,
    pub load_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            bucket: "fdo-plugins".to_string(),
            region: "us-east-1".to_string(),
            endpoint: None,
            download_base_url: None,
            registry_file: "registry.json".to_string(),
            registry_mode: RegistryMode::Replace,
            local_layout: LocalLayout::Flat,
            keep_local_artifacts: true,
            required_capabilities: vec!["init".to_string(), "render".to_string()],
            max_concurrency: 4,
            upload_timeout_secs: 30,
            load_timeout_secs: 10,
            max_retries: 3,
            retry_base_delay_ms: 200,
        }
    }
}

impl PublishConfig {
    pub fn download_base_url(&self) -> String {
        match &self.download_base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://{}.s3.{}.amazonaws.com", self.bucket, self.region),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.max_concurrency.max(1)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }

    /// Backoff before retry number `attempt` (zero-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(1u64 << attempt.min(16)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_download_base_url_derives_from_bucket_and_region() {
        let config = PublishConfig::default();
        assert_eq!(
            config.download_base_url(),
            "https://fdo-plugins.s3.us-east-1.amazonaws.com"
        );
    }

    #[test]
    fn explicit_download_base_url_drops_trailing_slash() {
        let config = PublishConfig {
            download_base_url: Some("https://cdn.example.com/plugins/".into()),
            ..PublishConfig::default()
        };
        assert_eq!(config.download_base_url(), "https://cdn.example.com/plugins");
    }

    #[test]
    fn retry_delay_doubles_per_attempt() {
        let config = PublishConfig {
            retry_base_delay_ms: 100,
            ..PublishConfig::default()
        };
        assert_eq!(config.retry_delay(0), Duration::from_millis(100));
        assert_eq!(config.retry_delay(3), Duration::from_millis(800));
    }

    #[test]
    fn zero_concurrency_is_clamped() {
        let config = PublishConfig {
            max_concurrency: 0,
            ..PublishConfig::default()
        };
        assert_eq!(config.concurrency(), 1);
    }
}
