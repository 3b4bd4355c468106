//! # contract: seams between the pipeline and its external collaborators
//!
//! The pipeline never talks to the bundler or the object store directly. It goes
//! through two traits defined here:
//!
//! - [`Bundler`]: turns a set of (already rewritten) entry points into one
//!   JavaScript module each, in a given output directory.
//! - [`ObjectStore`]: conditional and unconditional object writes plus
//!   metadata/content reads, keyed by string.
//!
//! Both are annotated for `mockall`, so tests drive the full pipeline with
//! `MockBundler` and `MockObjectStore` instead of a real toolchain or bucket.

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;

use crate::error::CompileError;

/// One bundler invocation covering the whole batch.
#[derive(Debug, Clone)]
pub struct BundleRequest {
    /// Entry points in build order. These are staged, rewritten copies.
    pub entry_points: Vec<PathBuf>,
    /// Directory the bundler must write `<stem>.js` files into.
    pub out_dir: PathBuf,
}

/// What the bundler wrote, in entry-point order.
#[derive(Debug, Clone, Default)]
pub struct BundleOutput {
    pub outputs: Vec<PathBuf>,
}

/// External source-to-artifact bundler.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Bundler: Send + Sync {
    /// Bundle every entry point, or fail the whole batch with diagnostics.
    async fn bundle(&self, request: &BundleRequest) -> Result<BundleOutput, CompileError>;
}

/// A single object write.
#[derive(Debug, Clone)]
pub struct PutObjectRequest {
    pub key: String,
    pub body: Vec<u8>,
    pub content_type: String,
    /// When set, the write fails with [`StoreError::PreconditionFailed`]
    /// instead of replacing an existing object.
    pub if_none_match: bool,
}

/// Remote-object metadata reported after an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub last_modified: Option<String>,
    pub content_length: Option<u64>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// An object already exists at the key of a conditional write.
    #[error("object already exists at {0}")]
    PreconditionFailed(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Remote object storage.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, request: PutObjectRequest) -> Result<(), StoreError>;

    /// `Ok(None)` when no object exists at `key`.
    async fn head_object(&self, key: &str) -> Result<Option<ObjectInfo>, StoreError>;

    /// `Ok(None)` when no object exists at `key`.
    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
}
