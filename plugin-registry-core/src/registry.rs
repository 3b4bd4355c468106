//! The registry document: one record per published (name, version).
//!
//! Records are always sorted (name, then version) before serialization so the
//! document is byte-identical across runs over the same inputs, whatever order
//! artifacts finished in.

use serde::{Deserialize, Serialize};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::RegistryMode;
use crate::manifest::PluginMetadata;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryRecord {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub download_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub versions: Option<Vec<String>>,
}

impl RegistryRecord {
    pub fn new(metadata: &PluginMetadata, download_url: String) -> Self {
        Self {
            name: metadata.name.clone(),
            version: metadata.version.clone(),
            author: metadata.author.clone(),
            description: metadata.description.clone(),
            icon: metadata.icon.clone(),
            download_url,
            last_modified: None,
            content_length: None,
            versions: None,
        }
    }
}

/// Canonical object key: `<name>/<version>/<artifact file name>`.
pub fn object_key(metadata: &PluginMetadata, file_name: &str) -> String {
    format!("{}/{}/{}", metadata.name, metadata.version, file_name)
}

/// Everything except RFC 3986 unreserved bytes and the `/` separator.
const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Percent-encode every key segment, keeping `/` and RFC 3986 unreserved bytes.
pub fn encode_key(key: &str) -> String {
    utf8_percent_encode(key, KEY_ENCODE_SET).to_string()
}

pub fn download_url(base_url: &str, key: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), encode_key(key))
}

/// Sort key giving a total order: semver-parsable versions first, in semver
/// order, then everything else in plain string order.
fn version_key(version: &str) -> (bool, Option<semver::Version>, &str) {
    let parsed = semver::Version::parse(version).ok();
    (parsed.is_none(), parsed, version)
}

pub fn compare_versions(a: &str, b: &str) -> Ordering {
    version_key(a).cmp(&version_key(b))
}

pub fn sort_records(records: &mut [RegistryRecord]) {
    records.sort_by(|a, b| {
        a.name
            .cmp(&b.name)
            .then_with(|| compare_versions(&a.version, &b.version))
            .then_with(|| a.download_url.cmp(&b.download_url))
    });
}

/// Combine this run's records with a previous registry according to `mode`.
///
/// `Merge` keeps previous records for (name, version) pairs not rebuilt in this
/// run and gives every record the sorted list of all known versions of its name.
pub fn assemble(
    mode: RegistryMode,
    previous: Option<Vec<RegistryRecord>>,
    current: Vec<RegistryRecord>,
) -> Vec<RegistryRecord> {
    let mut records = match mode {
        RegistryMode::Replace => current,
        RegistryMode::Merge => {
            let rebuilt: HashSet<(String, String)> = current
                .iter()
                .map(|r| (r.name.clone(), r.version.clone()))
                .collect();
            let kept: Vec<RegistryRecord> = previous
                .unwrap_or_default()
                .into_iter()
                .filter(|r| !rebuilt.contains(&(r.name.clone(), r.version.clone())))
                .collect();
            debug!(kept = kept.len(), rebuilt = rebuilt.len(), "[REGISTRY] Merging with previous registry");

            let mut merged = current;
            merged.extend(kept);

            let mut versions: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for r in &merged {
                let list = versions.entry(r.name.clone()).or_default();
                if !list.contains(&r.version) {
                    list.push(r.version.clone());
                }
            }
            for list in versions.values_mut() {
                list.sort_by(|a, b| compare_versions(a, b));
            }
            for r in &mut merged {
                r.versions = versions.get(&r.name).cloned();
            }
            merged
        }
    };
    sort_records(&mut records);
    records
}

pub fn to_json(records: &[RegistryRecord]) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec_pretty(records)?;
    bytes.push(b'\n');
    Ok(bytes)
}

pub fn from_json(bytes: &[u8]) -> Result<Vec<RegistryRecord>, serde_json::Error> {
    serde_json::from_slice(bytes)
}

/// Replace `<dir>/<file_name>` in one rename so readers never see a partial document.
pub fn write_atomic(dir: &Path, file_name: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let target = dir.join(file_name);
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(&target).map_err(|e| e.error)?;
    info!(path = %target.display(), bytes = bytes.len(), "[REGISTRY] Wrote registry document");
    Ok(target)
}

/// Load a registry file if one exists. Unreadable or malformed files count as absent.
pub fn read_local(path: &Path) -> Option<Vec<RegistryRecord>> {
    let bytes = std::fs::read(path).ok()?;
    match from_json(&bytes) {
        Ok(records) => Some(records),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "[REGISTRY] Ignoring malformed previous registry");
            None
        }
    }
}
