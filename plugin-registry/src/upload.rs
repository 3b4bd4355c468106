#![doc = "Object-store integration for the CLI: an S3-compatible client implementing the core ObjectStore trait."]
//
//! # S3 Client (CLI <-> Core)
//!
//! This module wires the [`ObjectStore`] seam from `plugin-registry-core` to a real
//! S3-compatible bucket over HTTP.
//!
//! - Path-style URLs: `<endpoint>/<bucket>/<key>`.
//! - Every request is signed with AWS Signature Version 4.
//! - Conditional writes use `If-None-Match: *`. A `412` answer becomes
//!   [`StoreError::PreconditionFailed`].
//! - On `HEAD`/`GET`, `404` means "no such object" and maps to `Ok(None)`.
//! - Every other non-2xx answer, and every network error, is a [`StoreError::Transport`].
//!
//! ## Client Usage
//!
//! Construct [`S3Client`] with [`S3Client::new_from_env`], which reads
//! `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and optionally `AWS_SESSION_TOKEN`.
//! Timeouts and retries are the publisher's job; this client makes one attempt per call.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use plugin_registry_core::config::PublishConfig;
use plugin_registry_core::contract::{ObjectInfo, ObjectStore, PutObjectRequest, StoreError};
use plugin_registry_core::registry::encode_key;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::{Method, StatusCode, Url};
use sha2::{Digest, Sha256};
use std::env;

type HmacSha256 = Hmac<Sha256>;

const SERVICE: &str = "s3";

#[derive(Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Credentials {
    pub fn from_env() -> anyhow::Result<Self> {
        let read = |key: &str| {
            env::var(key)
                .ok()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    tracing::error!(variable = key, "Missing credential in environment");
                    anyhow::anyhow!("{key} missing in environment")
                })
        };
        Ok(Self {
            access_key_id: read("AWS_ACCESS_KEY_ID")?,
            secret_access_key: read("AWS_SECRET_ACCESS_KEY")?,
            session_token: env::var("AWS_SESSION_TOKEN").ok().filter(|v| !v.is_empty()),
        })
    }
}

#[derive(Debug)]
pub struct S3Client {
    http: reqwest::Client,
    endpoint: Url,
    bucket: String,
    region: String,
    credentials: Credentials,
}

impl S3Client {
    pub fn new(config: &PublishConfig, credentials: Credentials) -> anyhow::Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", config.region));
        let endpoint = Url::parse(endpoint.trim_end_matches('/'))
            .map_err(|e| anyhow::anyhow!("Invalid object-store endpoint {endpoint:?}: {e}"))?;
        tracing::info!(
            endpoint = %endpoint,
            bucket = %config.bucket,
            region = %config.region,
            session_token = credentials.session_token.is_some(),
            "Initialized S3Client"
        );
        Ok(Self {
            http: reqwest::Client::new(),
            endpoint,
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            credentials,
        })
    }

    pub fn new_from_env(config: &PublishConfig) -> anyhow::Result<Self> {
        Self::new(config, Credentials::from_env()?)
    }

    fn object_url(&self, key: &str) -> Result<Url, StoreError> {
        let base = self.endpoint.as_str().trim_end_matches('/');
        let raw = format!("{base}/{}/{}", encode_key(&self.bucket), encode_key(key));
        Url::parse(&raw).map_err(|e| StoreError::Transport(format!("invalid object url {raw}: {e}")))
    }

    fn request(
        &self,
        method: Method,
        key: &str,
        body: Vec<u8>,
    ) -> Result<reqwest::RequestBuilder, StoreError> {
        let url = self.object_url(key)?;
        let payload_hash = hex::encode(Sha256::digest(&body));
        let headers = sign(
            &self.credentials,
            &self.region,
            method.as_str(),
            &url,
            &payload_hash,
            Utc::now(),
        )?;
        let mut builder = self.http.request(method, url);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        if !body.is_empty() {
            builder = builder.body(body);
        }
        Ok(builder)
    }
}

async fn send(builder: reqwest::RequestBuilder) -> Result<reqwest::Response, StoreError> {
    builder
        .send()
        .await
        .map_err(|e| StoreError::Transport(e.to_string()))
}

async fn unexpected(action: &str, key: &str, response: reqwest::Response) -> StoreError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    tracing::error!(action, key, status = status.as_u16(), body = %body, "Unexpected object-store response");
    StoreError::Transport(format!("{action} {key}: {status} {}", body.trim()))
}

fn header_str(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[async_trait]
impl ObjectStore for S3Client {
    async fn put_object(&self, request: PutObjectRequest) -> Result<(), StoreError> {
        tracing::info!(
            key = %request.key,
            bytes = request.body.len(),
            conditional = request.if_none_match,
            "Uploading object"
        );
        let mut builder = self
            .request(Method::PUT, &request.key, request.body)?
            .header(CONTENT_TYPE, &request.content_type);
        if request.if_none_match {
            builder = builder.header(IF_NONE_MATCH, "*");
        }
        let response = send(builder).await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::PRECONDITION_FAILED => Err(StoreError::PreconditionFailed(request.key)),
            _ => Err(unexpected("PUT", &request.key, response).await),
        }
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectInfo>, StoreError> {
        let response = send(self.request(Method::HEAD, key, Vec::new())?).await?;
        match response.status() {
            s if s.is_success() => Ok(Some(ObjectInfo {
                last_modified: header_str(&response, LAST_MODIFIED),
                content_length: header_str(&response, CONTENT_LENGTH).and_then(|v| v.parse().ok()),
            })),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(unexpected("HEAD", key, response).await),
        }
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let response = send(self.request(Method::GET, key, Vec::new())?).await?;
        match response.status() {
            s if s.is_success() => response
                .bytes()
                .await
                .map(|b| Some(b.to_vec()))
                .map_err(|e| StoreError::Transport(e.to_string())),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(unexpected("GET", key, response).await),
        }
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| StoreError::Transport(format!("request signing failed: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// AWS Signature Version 4 headers for a request without query parameters.
pub(crate) fn sign(
    credentials: &Credentials,
    region: &str,
    method: &str,
    url: &Url,
    payload_hash: &str,
    now: DateTime<Utc>,
) -> Result<Vec<(&'static str, String)>, StoreError> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();
    let host = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => return Err(StoreError::Transport(format!("object url has no host: {url}"))),
    };

    let mut headers = vec![
        ("host", host),
        ("x-amz-content-sha256", payload_hash.to_string()),
        ("x-amz-date", amz_date.clone()),
    ];
    if let Some(token) = &credentials.session_token {
        headers.push(("x-amz-security-token", token.clone()));
    }
    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{name}:{}\n", value.trim()))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = format!(
        "{method}\n{}\n\n{canonical_headers}\n{signed_headers}\n{payload_hash}",
        url.path()
    );
    let scope = format!("{date_stamp}/{region}/{SERVICE}/aws4_request");
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let k_date = hmac(
        format!("AWS4{}", credentials.secret_access_key).as_bytes(),
        date_stamp.as_bytes(),
    )?;
    let k_region = hmac(&k_date, region.as_bytes())?;
    let k_service = hmac(&k_region, SERVICE.as_bytes())?;
    let k_signing = hmac(&k_service, b"aws4_request")?;
    let signature = hex::encode(hmac(&k_signing, string_to_sign.as_bytes())?);

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
        credentials.access_key_id
    );

    // reqwest derives Host from the URL.
    headers.retain(|(name, _)| *name != "host");
    headers.push(("authorization", authorization));
    Ok(headers)
}
