use std::fmt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials as AwsCredentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_REGION: &str = "us-east-1";
const LIST_PAGE_SIZE: i32 = 1000;
const CREDENTIALS_PROVIDER: &str = "strata";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid endpoint: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid connection descriptor: {0}")]
    InvalidConnection(String),
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error("backend rejected request ({code}): {message}")]
    Rejected { code: String, message: String },
    #[error("failed to read object body: {0}")]
    Body(String),
    #[error("failed to read local file: {0}")]
    Local(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Auth,
    Transient,
    Permanent,
}

impl StorageError {
    pub fn classification(&self) -> ErrorClass {
        match self {
            StorageError::Unreachable(_) | StorageError::Body(_) => ErrorClass::Transient,
            StorageError::Rejected { code, .. } => classify_error_code(code),
            _ => ErrorClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.classification() == ErrorClass::Transient
    }
}

fn classify_error_code(code: &str) -> ErrorClass {
    match code {
        "AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch" | "ExpiredToken" => {
            ErrorClass::Auth
        }
        "SlowDown" | "InternalError" | "ServiceUnavailable" | "RequestTimeout"
        | "RequestTimeTooSkewed" | "OperationAborted" | "Throttling" => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

const MEMORY_SCHEME: &str = "memory://";

/// Non-secret connection descriptor of an S3-compatible backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub endpoint: String,
    #[serde(default)]
    pub region: Option<String>,
    pub bucket: String,
    #[serde(default = "default_use_ssl")]
    pub use_ssl: bool,
}

fn default_use_ssl() -> bool {
    true
}

impl ConnectionInfo {
    /// Builds the endpoint URL. The TLS flag decides the scheme even when the
    /// endpoint string carries one.
    pub fn endpoint_url(&self) -> Result<Url, StorageError> {
        let raw = self.endpoint.trim();
        if raw.is_empty() {
            return Err(StorageError::InvalidConnection("endpoint is empty".into()));
        }
        if self.bucket.trim().is_empty() {
            return Err(StorageError::InvalidConnection("bucket is empty".into()));
        }
        let scheme = if self.use_ssl { "https" } else { "http" };
        let mut url = if raw.contains("://") {
            Url::parse(raw)?
        } else {
            Url::parse(&format!("{scheme}://{raw}"))?
        };
        if url.scheme() != scheme {
            url.set_scheme(scheme).map_err(|_| {
                StorageError::InvalidConnection(format!("unsupported endpoint scheme in {raw}"))
            })?;
        }
        if url.host_str().is_none() {
            return Err(StorageError::InvalidConnection(format!(
                "endpoint {raw} has no host"
            )));
        }
        Ok(url)
    }

    /// `memory://` endpoints select the in-process store instead of S3.
    pub fn is_memory(&self) -> bool {
        self.endpoint.trim().starts_with(MEMORY_SCHEME)
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        if self.is_memory() {
            if self.bucket.trim().is_empty() {
                return Err(StorageError::InvalidConnection("bucket is empty".into()));
            }
            return Ok(());
        }
        self.endpoint_url().map(|_| ())
    }

    pub fn region_or_default(&self) -> &str {
        self.region
            .as_deref()
            .filter(|region| !region.trim().is_empty())
            .unwrap_or(DEFAULT_REGION)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size: i64,
    #[serde(default)]
    pub etag: Option<String>,
    /// Unix seconds.
    #[serde(default)]
    pub modified: Option<i64>,
    #[serde(default)]
    pub is_dir: bool,
}

/// An object body delivered chunk by chunk.
pub type ObjectBody = BoxStream<'static, Result<Bytes, StorageError>>;

/// Minimal object-storage surface used by the agent. Keys ending in `/` are
/// directory markers.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError>;
    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, StorageError>;
    async fn get(&self, key: &str) -> Result<ObjectBody, StorageError>;
    /// Small in-memory payloads: empty files and directory markers.
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<ObjectInfo, StorageError>;
    /// Streams a local file, reading `chunk_size` bytes at a time.
    async fn put_file(
        &self,
        key: &str,
        path: &Path,
        chunk_size: usize,
    ) -> Result<ObjectInfo, StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

#[derive(Clone)]
pub struct S3Client {
    inner: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Client {
    pub fn new(connection: &ConnectionInfo, credentials: &Credentials) -> Result<Self, StorageError> {
        let endpoint = connection.endpoint_url()?;
        let config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(connection.region_or_default().to_string()))
            .endpoint_url(endpoint.as_str().trim_end_matches('/'))
            .credentials_provider(AwsCredentials::new(
                credentials.access_key.clone(),
                credentials.secret_key.clone(),
                None,
                None,
                CREDENTIALS_PROVIDER,
            ))
            .force_path_style(true)
            .build();
        Ok(Self {
            inner: aws_sdk_s3::Client::from_conf(config),
            bucket: connection.bucket.clone(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ObjectStore for S3Client {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let response = self
                .inner
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .max_keys(LIST_PAGE_SIZE)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(map_sdk_error)?;
            for object in response.contents() {
                let Some(key) = object.key() else {
                    continue;
                };
                objects.push(ObjectInfo {
                    key: key.to_string(),
                    size: object.size().unwrap_or(0),
                    etag: object.e_tag().map(normalize_etag),
                    modified: object.last_modified().map(|ts| ts.secs()),
                    is_dir: key.ends_with('/'),
                });
            }
            match response.next_continuation_token() {
                Some(token) if response.is_truncated() == Some(true) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }
        Ok(objects)
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, StorageError> {
        let result = self
            .inner
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;
        match result {
            Ok(output) => Ok(Some(ObjectInfo {
                key: key.to_string(),
                size: output.content_length().unwrap_or(0),
                etag: output.e_tag().map(normalize_etag),
                modified: output.last_modified().map(|ts| ts.secs()),
                is_dir: key.ends_with('/'),
            })),
            Err(SdkError::ServiceError(err)) if err.err().is_not_found() => Ok(None),
            Err(err) => Err(map_sdk_error(err)),
        }
    }

    async fn get(&self, key: &str) -> Result<ObjectBody, StorageError> {
        let output = self
            .inner
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| match err {
                SdkError::ServiceError(ref service) if service.err().is_no_such_key() => {
                    StorageError::NotFound(key.to_string())
                }
                other => map_sdk_error(other),
            })?;
        let chunks = futures_util::stream::unfold(output.body, |mut body| async move {
            let chunk = body.next().await?;
            Some((chunk.map_err(|err| StorageError::Body(err.to_string())), body))
        });
        Ok(chunks.boxed())
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<ObjectInfo, StorageError> {
        let size = data.len() as i64;
        let output = self
            .inner
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(ObjectInfo {
            key: key.to_string(),
            size,
            etag: output.e_tag().map(normalize_etag),
            modified: Some(unix_now()),
            is_dir: key.ends_with('/'),
        })
    }

    async fn put_file(
        &self,
        key: &str,
        path: &Path,
        chunk_size: usize,
    ) -> Result<ObjectInfo, StorageError> {
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|err| StorageError::Local(format!("{}: {err}", path.display())))?
            .len() as i64;
        let body = ByteStream::read_from()
            .path(path)
            .buffer_size(chunk_size)
            .build()
            .await
            .map_err(|err| StorageError::Local(format!("{}: {err}", path.display())))?;
        let output = self
            .inner
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_length(size)
            .body(body)
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(ObjectInfo {
            key: key.to_string(),
            size,
            etag: output.e_tag().map(normalize_etag),
            modified: Some(unix_now()),
            is_dir: key.ends_with('/'),
        })
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(())
    }
}

fn map_sdk_error<E, R>(err: SdkError<E, R>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: fmt::Debug,
{
    match &err {
        SdkError::ServiceError(service) => {
            let inner = service.err();
            StorageError::Rejected {
                code: inner.code().unwrap_or("Unknown").to_string(),
                message: inner.message().unwrap_or_default().to_string(),
            }
        }
        SdkError::ConstructionFailure(_) => {
            StorageError::InvalidConnection(DisplayErrorContext(&err).to_string())
        }
        _ => StorageError::Unreachable(DisplayErrorContext(&err).to_string()),
    }
}

pub(crate) fn normalize_etag(raw: &str) -> String {
    raw.trim_matches('"').to_string()
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
