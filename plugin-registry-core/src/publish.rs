//! Registry publication: turn compiled artifacts into registry records.
//!
//! For every [`CompiledArtifact`] the publisher:
//!   - loads its sidecar manifest (bounded concurrency, per-artifact timeout),
//!   - validates metadata and required capabilities, rejecting duplicate releases,
//!   - derives the canonical key `<name>/<version>/<file>`,
//!   - uploads it with a create-only precondition when a store is configured,
//!   - optionally moves it into `<output_dir>/<name>/<version>/`,
//!   - and contributes one [`RegistryRecord`].
//!
//! # Failure policy
//! Collect-and-continue: a failing artifact is recorded in the report and the
//! rest of the batch is still published. [`PublishReport::has_failures`] tells
//! the caller whether the run as a whole failed.
//!
//! "Already published" (a failed create-only precondition) is not a failure.
//! Transport errors are retried with exponential backoff; precondition
//! failures never are.

use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::compile::CompiledArtifact;
use crate::config::{LocalLayout, PublishConfig, RegistryMode};
use crate::contract::{ObjectStore, PutObjectRequest, StoreError};
use crate::error::LoadError;
use crate::manifest::{read_manifest, PluginManifest, PluginMetadata};
use crate::registry::{self, RegistryRecord};

pub const ARTIFACT_CONTENT_TYPE: &str = "application/javascript";
pub const REGISTRY_CONTENT_TYPE: &str = "application/json";

#[derive(Debug)]
pub enum ArtifactStatus {
    /// Uploaded under `key` by this run.
    Published { key: String },
    /// An object already existed under `key`; nothing was written.
    AlreadyPublished { key: String },
    /// Local-only run; the artifact stays at `path`.
    Local { path: PathBuf },
    LoadFailed(LoadError),
    UploadFailed { key: String, error: StoreError },
}

#[derive(Debug)]
pub struct ArtifactOutcome {
    pub artifact: String,
    pub source: PathBuf,
    pub metadata: Option<PluginMetadata>,
    pub status: ArtifactStatus,
    /// The versioned local layout could not be applied. Not a failure once
    /// the artifact is in object storage.
    pub layout_error: Option<String>,
}

impl ArtifactOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self.status,
            ArtifactStatus::LoadFailed(_) | ArtifactStatus::UploadFailed { .. }
        )
    }

    /// One human-readable line for the end-of-run summary.
    pub fn summary_line(&self) -> String {
        let release = self
            .metadata
            .as_ref()
            .map(|m| format!("{}@{}", m.name, m.version))
            .unwrap_or_else(|| self.artifact.clone());
        let line = match &self.status {
            ArtifactStatus::Published { key } => format!("published {release} -> {key}"),
            ArtifactStatus::AlreadyPublished { .. } => {
                format!("skipped {release} (already published)")
            }
            ArtifactStatus::Local { path } => format!("local {release} -> {}", path.display()),
            ArtifactStatus::LoadFailed(e) => format!("failed {}: {e}", self.artifact),
            ArtifactStatus::UploadFailed { error, .. } => {
                format!("failed {}: {error}", self.artifact)
            }
        };
        match &self.layout_error {
            Some(e) => format!("{line}; local layout not applied: {e}"),
            None => line,
        }
    }
}

#[derive(Debug, Default)]
pub struct PublishReport {
    /// Sorted by artifact file name.
    pub outcomes: Vec<ArtifactOutcome>,
    /// The registry exactly as written.
    pub records: Vec<RegistryRecord>,
    pub registry_path: Option<PathBuf>,
    pub registry_uploaded: bool,
    pub registry_error: Option<String>,
}

impl PublishReport {
    pub fn has_failures(&self) -> bool {
        self.registry_error.is_some() || self.outcomes.iter().any(ArtifactOutcome::is_failure)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ArtifactOutcome> {
        self.outcomes.iter().filter(|o| o.is_failure())
    }
}

/// Publish a compiled batch.
///
/// `store` is `None` for local-only runs. `previous_local` is the registry that
/// was on disk before compilation, used by [`RegistryMode::Merge`] when there is
/// no store to fetch the published registry from.
pub async fn publish(
    config: &PublishConfig,
    output_dir: &Path,
    artifacts: Vec<CompiledArtifact>,
    store: Option<&dyn ObjectStore>,
    previous_local: Option<Vec<RegistryRecord>>,
) -> PublishReport {
    info!(
        artifacts = artifacts.len(),
        remote = store.is_some(),
        "[PUBLISH] Starting publication"
    );

    let loaded = load_all(config, artifacts).await;
    let (ready, mut outcomes) = reject_duplicates(loaded);

    let released: Vec<(ArtifactOutcome, Option<RegistryRecord>)> = stream::iter(ready)
        .map(|(artifact, manifest)| release(config, output_dir, store, artifact, manifest))
        .buffer_unordered(config.concurrency())
        .collect()
        .await;

    let mut records = Vec::new();
    for (outcome, record) in released {
        outcomes.push(outcome);
        records.extend(record);
    }
    outcomes.sort_by(|a, b| a.artifact.cmp(&b.artifact));

    let mut report = PublishReport {
        outcomes,
        ..PublishReport::default()
    };
    write_registry(config, output_dir, store, previous_local, records, &mut report).await;

    for outcome in &report.outcomes {
        if outcome.is_failure() {
            error!(artifact = %outcome.artifact, "[PUBLISH][ERROR] {}", outcome.summary_line());
        } else {
            info!(artifact = %outcome.artifact, "[PUBLISH] {}", outcome.summary_line());
        }
    }
    report
}

async fn load_all(
    config: &PublishConfig,
    artifacts: Vec<CompiledArtifact>,
) -> Vec<(CompiledArtifact, Result<PluginManifest, LoadError>)> {
    let timeout = config.load_timeout();
    stream::iter(artifacts)
        .map(|artifact| async move {
            let result =
                match tokio::time::timeout(timeout, load_artifact(&artifact, &config.required_capabilities))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(LoadError::Timeout(timeout)),
                };
            (artifact, result)
        })
        .buffer_unordered(config.concurrency())
        .collect()
        .await
}

/// Check the artifact exists and its manifest describes a valid plugin.
pub async fn load_artifact(
    artifact: &CompiledArtifact,
    required_capabilities: &[String],
) -> Result<PluginManifest, LoadError> {
    match tokio::fs::metadata(&artifact.output_path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => {}
        _ => return Err(LoadError::MissingArtifact(artifact.output_path.clone())),
    }
    let manifest = match read_manifest(&artifact.manifest_path).await {
        Err(LoadError::MissingManifest(_)) => {
            return Err(LoadError::MissingManifest(artifact.source_path.clone()))
        }
        other => other?,
    };
    manifest.metadata.validate()?;
    if let Some(capability) = manifest.missing_capability(required_capabilities) {
        return Err(LoadError::MissingCapability {
            name: manifest.metadata.name.clone(),
            capability: capability.to_string(),
        });
    }
    debug!(
        artifact = %artifact.output_path.display(),
        name = %manifest.metadata.name,
        version = %manifest.metadata.version,
        "[PUBLISH] Loaded plugin manifest"
    );
    Ok(manifest)
}

/// Split loaded artifacts into publishable ones and failures, in file-name
/// order. The first artifact claiming a (name, version) wins.
fn reject_duplicates(
    mut loaded: Vec<(CompiledArtifact, Result<PluginManifest, LoadError>)>,
) -> (Vec<(CompiledArtifact, PluginManifest)>, Vec<ArtifactOutcome>) {
    loaded.sort_by(|(a, _), (b, _)| a.file_name().cmp(&b.file_name()));

    let mut claimed: HashMap<(String, String), String> = HashMap::new();
    let mut ready = Vec::new();
    let mut failed = Vec::new();

    for (artifact, result) in loaded {
        let manifest = match result {
            Ok(m) => m,
            Err(e) => {
                failed.push(ArtifactOutcome {
                    artifact: artifact.file_name(),
                    source: artifact.source_path.clone(),
                    metadata: None,
                    status: ArtifactStatus::LoadFailed(e),
                    layout_error: None,
                });
                continue;
            }
        };
        let id = (manifest.metadata.name.clone(), manifest.metadata.version.clone());
        if let Some(first) = claimed.get(&id) {
            warn!(name = %id.0, version = %id.1, first = %first, artifact = %artifact.file_name(), "[PUBLISH] Duplicate release in batch");
            failed.push(ArtifactOutcome {
                artifact: artifact.file_name(),
                source: artifact.source_path.clone(),
                status: ArtifactStatus::LoadFailed(LoadError::DuplicateRelease {
                    name: id.0,
                    version: id.1,
                    first: first.clone(),
                }),
                metadata: Some(manifest.metadata),
                layout_error: None,
            });
            continue;
        }
        claimed.insert(id, artifact.file_name());
        ready.push((artifact, manifest));
    }
    (ready, failed)
}

async fn release(
    config: &PublishConfig,
    output_dir: &Path,
    store: Option<&dyn ObjectStore>,
    artifact: CompiledArtifact,
    manifest: PluginManifest,
) -> (ArtifactOutcome, Option<RegistryRecord>) {
    let file_name = artifact.file_name();
    let metadata = manifest.metadata;
    let key = registry::object_key(&metadata, &file_name);
    let mut record = RegistryRecord::new(
        &metadata,
        registry::download_url(&config.download_base_url(), &key),
    );
    let mut outcome = ArtifactOutcome {
        artifact: file_name.clone(),
        source: artifact.source_path.clone(),
        metadata: Some(metadata.clone()),
        status: ArtifactStatus::Local {
            path: artifact.output_path.clone(),
        },
        layout_error: None,
    };

    if let Some(store) = store {
        let body = match tokio::fs::read(&artifact.output_path).await {
            Ok(body) => body,
            Err(e) => {
                outcome.status = ArtifactStatus::LoadFailed(LoadError::Io(e));
                return (outcome, None);
            }
        };
        let request = PutObjectRequest {
            key: key.clone(),
            body,
            content_type: ARTIFACT_CONTENT_TYPE.to_string(),
            if_none_match: true,
        };
        outcome.status = match put_with_retry(store, request, config).await {
            Ok(()) => {
                info!(key = %key, "[PUBLISH] Upload successful");
                ArtifactStatus::Published { key: key.clone() }
            }
            Err(StoreError::PreconditionFailed(_)) => {
                info!(key = %key, "[PUBLISH] Object already exists at this location");
                ArtifactStatus::AlreadyPublished { key: key.clone() }
            }
            Err(error) => {
                error!(key = %key, error = %error, "[PUBLISH][ERROR] Upload failed");
                outcome.status = ArtifactStatus::UploadFailed { key, error };
                return (outcome, None);
            }
        };

        match store.head_object(&key).await {
            Ok(Some(info)) => {
                record.last_modified = info.last_modified;
                record.content_length = info.content_length;
            }
            Ok(None) => warn!(key = %key, "[PUBLISH] Uploaded object not visible to HEAD"),
            Err(e) => warn!(key = %key, error = %e, "[PUBLISH] Could not read remote object metadata"),
        }

        if !config.keep_local_artifacts {
            if let Err(e) = tokio::fs::remove_file(&artifact.output_path).await {
                warn!(path = %artifact.output_path.display(), error = %e, "[PUBLISH] Could not remove local artifact");
            }
            return (outcome, Some(record));
        }
    }

    if config.local_layout == LocalLayout::Versioned {
        let dir = output_dir.join(&metadata.name).join(&metadata.version);
        let target = dir.join(&file_name);
        let moved = async {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::rename(&artifact.output_path, &target).await
        }
        .await;
        match moved {
            Ok(()) => {
                debug!(from = %artifact.output_path.display(), to = %target.display(), "[PUBLISH] Moved artifact into versioned layout");
                if let ArtifactStatus::Local { path } = &mut outcome.status {
                    *path = target;
                }
            }
            Err(e) => {
                error!(path = %artifact.output_path.display(), error = %e, "[PUBLISH][ERROR] Could not move artifact");
                if store.is_none() {
                    outcome.status = ArtifactStatus::LoadFailed(LoadError::Io(e));
                    return (outcome, None);
                }
                outcome.layout_error = Some(e.to_string());
            }
        }
    }

    (outcome, Some(record))
}

/// Conditional or unconditional put with bounded retries on transport errors.
pub async fn put_with_retry(
    store: &dyn ObjectStore,
    request: PutObjectRequest,
    config: &PublishConfig,
) -> Result<(), StoreError> {
    let timeout = config.upload_timeout();
    let mut attempt = 0;
    loop {
        let result = match tokio::time::timeout(timeout, store.put_object(request.clone())).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Transport(format!(
                "upload of {} timed out after {timeout:?}",
                request.key
            ))),
        };
        match result {
            Err(StoreError::Transport(msg)) if attempt < config.max_retries => {
                let delay = config.retry_delay(attempt);
                warn!(key = %request.key, attempt = attempt + 1, ?delay, error = %msg, "[PUBLISH] Retrying upload");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

async fn write_registry(
    config: &PublishConfig,
    output_dir: &Path,
    store: Option<&dyn ObjectStore>,
    previous_local: Option<Vec<RegistryRecord>>,
    records: Vec<RegistryRecord>,
    report: &mut PublishReport,
) {
    let mut upload_allowed = store.is_some();
    let previous = match (config.registry_mode, store) {
        (RegistryMode::Replace, _) => None,
        (RegistryMode::Merge, None) => previous_local,
        (RegistryMode::Merge, Some(store)) => match store.get_object(&config.registry_file).await {
            Ok(Some(bytes)) => match registry::from_json(&bytes) {
                Ok(previous) => Some(previous),
                Err(e) => {
                    warn!(error = %e, "[REGISTRY] Published registry is malformed; merging with nothing");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                error!(error = %e, "[REGISTRY][ERROR] Could not fetch published registry for merge");
                report.registry_error = Some(format!("fetching published registry: {e}"));
                upload_allowed = false;
                None
            }
        },
    };

    report.records = registry::assemble(config.registry_mode, previous, records);
    let bytes = match registry::to_json(&report.records) {
        Ok(bytes) => bytes,
        Err(e) => {
            report.registry_error = Some(format!("serializing registry: {e}"));
            return;
        }
    };

    match registry::write_atomic(output_dir, &config.registry_file, &bytes) {
        Ok(path) => report.registry_path = Some(path),
        Err(e) => {
            error!(error = %e, "[REGISTRY][ERROR] Could not write registry document");
            report.registry_error = Some(format!("writing registry: {e}"));
            return;
        }
    }

    if let (true, Some(store)) = (upload_allowed, store) {
        let request = PutObjectRequest {
            key: config.registry_file.clone(),
            body: bytes,
            content_type: REGISTRY_CONTENT_TYPE.to_string(),
            if_none_match: false,
        };
        match put_with_retry(store, request, config).await {
            Ok(()) => {
                info!(key = %config.registry_file, records = report.records.len(), "[REGISTRY] Uploaded registry");
                report.registry_uploaded = true;
            }
            Err(e) => {
                error!(error = %e, "[REGISTRY][ERROR] Registry upload failed");
                report.registry_error = Some(format!("uploading registry: {e}"));
            }
        }
    }
}
