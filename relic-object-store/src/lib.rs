//! S3 object store adapter.
//!
//! All bucket traffic funnels through [ObjectStore]: simple and multipart
//! uploads with post-upload size verification, downloads, listings, and
//! deletes. Every call passes the token-bucket rate limiter, the circuit
//! breaker and the jittered retry policy; terminal upload failures can
//! spill into a local fallback spool without masking the error.

use std::path::{Path, PathBuf};

use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{ServerSideEncryption, StorageClass};
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use relic_api_types::{ArchiveKey, EncryptionMode};
use relic_config::S3Config;

mod breaker;
mod cleanup;
mod fallback;
mod multipart;
mod rate_limit;
mod retry;

pub use breaker::CircuitBreaker;
pub use cleanup::OrphanedUpload;
pub use fallback::LocalFallback;
pub use multipart::{calculate_part_size, UploadState, MAX_PARTS, MIN_PART_SIZE};
pub use rate_limit::RateLimiter;
pub use retry::RetryConfig;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Connection-class, throttling or 5xx failure; retried with backoff.
    #[error("transient object store error: {0}")]
    Transient(String),
    #[error("object store error: {0}")]
    Fatal(String),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("circuit breaker open")]
    CircuitOpen,
    #[error("upload verification failed for '{key}': size mismatch (expected {expected}, got {actual})")]
    SizeMismatch { key: String, expected: u64, actual: u64 },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_) | StoreError::CircuitOpen)
    }
}

const TRANSIENT_CODES: &[&str] = &[
    "InternalError",
    "ServiceUnavailable",
    "SlowDown",
    "RequestTimeout",
    "Throttling",
    "ThrottlingException",
    "TooManyRequests",
];

pub(crate) fn classify_sdk_error<E, R>(err: SdkError<E, R>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let text = format!("{}", DisplayErrorContext(&err));
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StoreError::Transient(text)
        }
        SdkError::ServiceError(ctx) => {
            let code = ctx.err().code().unwrap_or_default();
            if TRANSIENT_CODES.contains(&code) {
                StoreError::Transient(text)
            } else {
                StoreError::Fatal(text)
            }
        }
        _ => StoreError::Fatal(text),
    }
}

#[derive(Clone, Debug)]
pub struct PutResult {
    pub key: String,
    pub etag: String,
    pub size: u64,
}

#[derive(Clone, Debug)]
pub struct HeadResult {
    pub size: u64,
    pub etag: String,
}

#[derive(Clone, Debug)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

pub struct ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
    storage_class: StorageClass,
    encryption: EncryptionMode,
    /// Encryption headers are only sent to real AWS; S3-compatible
    /// endpoints often reject them.
    is_aws: bool,
    multipart_threshold: u64,
    multipart_state_dir: PathBuf,
    retry: RetryConfig,
    breaker: CircuitBreaker,
    limiter: Option<RateLimiter>,
    fallback: Option<LocalFallback>,
}

impl ObjectStore {
    pub async fn new(config: &S3Config) -> Result<Self, StoreError> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));
        if let Some((key, secret)) = config.credentials()? {
            loader = loader.credentials_provider(Credentials::new(
                key,
                secret,
                None,
                None,
                "relic-config",
            ));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = aws_sdk_s3::Client::from_conf(builder.build());

        let fallback = match &config.local_fallback_dir {
            Some(dir) => Some(LocalFallback::new(
                PathBuf::from(dir),
                config.local_fallback_retention_days,
            )?),
            None => None,
        };

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            prefix: config.prefix.trim_end_matches('/').to_string(),
            storage_class: StorageClass::from(config.storage_class.as_str()),
            encryption: config.encryption,
            is_aws: config.endpoint.is_none(),
            multipart_threshold: config.multipart_threshold_mb * 1024 * 1024,
            multipart_state_dir: PathBuf::from(".multipart_uploads"),
            retry: RetryConfig::default(),
            breaker: CircuitBreaker::new(5, std::time::Duration::from_secs(60)),
            limiter: config.rate_limit_requests_per_second.map(RateLimiter::new),
            fallback,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Join the configured prefix onto a key without doubling it.
    pub fn full_key(&self, key: &str) -> String {
        let key = key.trim_start_matches('/');
        if self.prefix.is_empty() || key.starts_with(&format!("{}/", self.prefix)) {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    async fn guarded<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        self.breaker.check()?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            if let Some(limiter) = &self.limiter {
                limiter.acquire().await;
            }
            match op().await {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(StoreError::NotFound(key)) => return Err(StoreError::NotFound(key)),
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts => {
                    self.breaker.record_failure();
                    let delay = self.retry.delay(attempt);
                    log::warn!(
                        "{} failed (attempt {}/{}), retrying in {:.1}s - {}",
                        what,
                        attempt,
                        self.retry.max_attempts,
                        delay.as_secs_f64(),
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    self.breaker.record_failure();
                    return Err(err);
                }
            }
        }
    }

    /// Check the bucket exists and is writable by storing and removing a
    /// probe object.
    pub async fn validate_bucket(&self) -> Result<(), StoreError> {
        self.client
            .head_bucket()
            .bucket(self.bucket.as_str())
            .send()
            .await
            .map_err(classify_sdk_error)?;

        let probe_key = self.full_key(&format!(
            "test_write_permission_{}.tmp",
            Utc::now().timestamp()
        ));
        self.client
            .put_object()
            .bucket(self.bucket.as_str())
            .key(probe_key.as_str())
            .body(ByteStream::from_static(b"test"))
            .send()
            .await
            .map_err(classify_sdk_error)?;
        self.client
            .delete_object()
            .bucket(self.bucket.as_str())
            .key(probe_key.as_str())
            .send()
            .await
            .map_err(classify_sdk_error)?;
        Ok(())
    }

    fn apply_storage_options(
        &self,
        mut request: aws_sdk_s3::operation::put_object::builders::PutObjectFluentBuilder,
    ) -> aws_sdk_s3::operation::put_object::builders::PutObjectFluentBuilder {
        request = request.storage_class(self.storage_class.clone());
        if self.is_aws {
            match self.encryption {
                EncryptionMode::SseS3 => {
                    request = request.server_side_encryption(ServerSideEncryption::Aes256)
                }
                EncryptionMode::SseKms => {
                    request = request.server_side_encryption(ServerSideEncryption::AwsKms)
                }
                EncryptionMode::None => {}
            }
        }
        request
    }

    async fn put_simple(&self, full_key: &str, data: Vec<u8>) -> Result<PutResult, StoreError> {
        let size = data.len() as u64;
        let response = self
            .guarded("upload", || {
                let request = self
                    .apply_storage_options(
                        self.client
                            .put_object()
                            .bucket(self.bucket.as_str())
                            .key(full_key),
                    )
                    .body(ByteStream::from(data.clone()));
                async move { request.send().await.map_err(classify_sdk_error) }
            })
            .await?;
        Ok(PutResult {
            key: full_key.to_string(),
            etag: response.e_tag().unwrap_or_default().to_string(),
            size,
        })
    }

    /// Upload a byte payload. Large payloads are spilled to a temp file
    /// and go through the resumable multipart path. The upload is
    /// verified with a `head` call afterwards; on terminal failure the
    /// payload lands in the local fallback spool (when configured) and
    /// the error still propagates.
    pub async fn put(&self, key: &str, data: Vec<u8>) -> Result<PutResult, StoreError> {
        let full_key = self.full_key(key);
        let size = data.len() as u64;

        let result = if size > self.multipart_threshold {
            let tmp = tempfile::NamedTempFile::new()
                .map_err(|err| StoreError::Fatal(format!("unable to create temp file: {}", err)))?;
            tokio::fs::write(tmp.path(), &data)
                .await
                .map_err(|err| StoreError::Fatal(format!("unable to write temp file: {}", err)))?;
            self.put_multipart(&full_key, tmp.path()).await
        } else {
            self.put_simple(&full_key, data.clone()).await
        };

        let result = match result {
            Ok(result) => self.verify_upload(&full_key, size).await.map(|_| result),
            Err(err) => Err(err),
        };

        if let Err(err) = &result {
            if let Some(fallback) = &self.fallback {
                match fallback.save_failed_upload(&full_key, &data, &err.to_string()) {
                    Ok(path) => log::warn!(
                        "upload of '{}' failed, payload spooled to {:?}",
                        full_key,
                        path
                    ),
                    Err(spool_err) => log::error!(
                        "upload of '{}' failed and fallback spooling failed too - {}",
                        full_key,
                        spool_err
                    ),
                }
            }
        }

        result
    }

    /// Upload a file from disk, choosing simple or resumable multipart by
    /// size.
    pub async fn put_file(&self, key: &str, path: &Path) -> Result<PutResult, StoreError> {
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|err| StoreError::Fatal(format!("unable to stat {:?}: {}", path, err)))?
            .len();
        let full_key = self.full_key(key);
        let result = if size > self.multipart_threshold {
            self.put_multipart(&full_key, path).await?
        } else {
            let data = tokio::fs::read(path)
                .await
                .map_err(|err| StoreError::Fatal(format!("unable to read {:?}: {}", path, err)))?;
            self.put_simple(&full_key, data).await?
        };
        self.verify_upload(&full_key, size).await?;
        Ok(result)
    }

    async fn verify_upload(&self, full_key: &str, expected: u64) -> Result<(), StoreError> {
        let head = self.head_full(full_key).await?;
        if head.size != expected {
            return Err(StoreError::SizeMismatch {
                key: full_key.to_string(),
                expected,
                actual: head.size,
            });
        }
        Ok(())
    }

    pub async fn head(&self, key: &str) -> Result<HeadResult, StoreError> {
        let full_key = self.full_key(key);
        self.head_full(&full_key).await
    }

    async fn head_full(&self, full_key: &str) -> Result<HeadResult, StoreError> {
        let response = self
            .guarded("head", || {
                let request = self
                    .client
                    .head_object()
                    .bucket(self.bucket.as_str())
                    .key(full_key);
                let key = full_key.to_string();
                async move {
                    request.send().await.map_err(|err| {
                        if let SdkError::ServiceError(ctx) = &err {
                            if ctx.err().is_not_found() {
                                return StoreError::NotFound(key.clone());
                            }
                        }
                        classify_sdk_error(err)
                    })
                }
            })
            .await?;
        Ok(HeadResult {
            size: response.content_length().unwrap_or_default() as u64,
            etag: response.e_tag().unwrap_or_default().to_string(),
        })
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        match self.head(key).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let full_key = self.full_key(key);
        let response = self
            .guarded("download", || {
                let request = self
                    .client
                    .get_object()
                    .bucket(self.bucket.as_str())
                    .key(full_key.as_str());
                let key = full_key.clone();
                async move {
                    request.send().await.map_err(|err| {
                        if let SdkError::ServiceError(ctx) = &err {
                            if ctx.err().is_no_such_key() {
                                return StoreError::NotFound(key.clone());
                            }
                        }
                        classify_sdk_error(err)
                    })
                }
            })
            .await?;
        let data = response
            .body
            .collect()
            .await
            .map_err(|err| StoreError::Transient(format!("body read failed: {}", err)))?;
        Ok(data.to_vec())
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let full_key = self.full_key(key);
        self.guarded("delete", || {
            let request = self
                .client
                .delete_object()
                .bucket(self.bucket.as_str())
                .key(full_key.as_str());
            async move {
                request.send().await.map_err(classify_sdk_error)?;
                Ok(())
            }
        })
        .await
    }

    /// List all objects under a prefix (the configured bucket prefix is
    /// applied on top).
    pub async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StoreError> {
        let full_prefix = self.full_key(prefix);
        let mut result = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let token = continuation.clone();
            let response = self
                .guarded("list", || {
                    let mut request = self
                        .client
                        .list_objects_v2()
                        .bucket(self.bucket.as_str())
                        .prefix(full_prefix.as_str());
                    if let Some(token) = &token {
                        request = request.continuation_token(token.as_str());
                    }
                    async move { request.send().await.map_err(classify_sdk_error) }
                })
                .await?;
            for object in response.contents() {
                result.push(ObjectInfo {
                    key: object.key().unwrap_or_default().to_string(),
                    size: object.size().unwrap_or_default() as u64,
                    last_modified: object
                        .last_modified()
                        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts.secs(), 0)),
                });
            }
            match response.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(result)
    }

    /// List archive data keys under a prefix, optionally constrained to a
    /// partition-date window.
    pub async fn list_archives(
        &self,
        prefix: &str,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> Result<Vec<String>, StoreError> {
        let objects = self.list(prefix).await?;
        let mut keys: Vec<String> = objects
            .into_iter()
            .map(|object| object.key)
            .filter(|key| key.ends_with(relic_api_types::DATA_SUFFIX))
            .filter(|key| match ArchiveKey::parse(key) {
                Ok(parsed) => {
                    let date = parsed.partition_date();
                    start_date.map_or(true, |start| date >= start)
                        && end_date.map_or(true, |end| date <= end)
                }
                // unparseable keys only pass with no window requested
                Err(_) => start_date.is_none() && end_date.is_none(),
            })
            .collect();
        keys.sort();
        Ok(keys)
    }

    pub(crate) fn client(&self) -> &aws_sdk_s3::Client {
        &self.client
    }

    pub(crate) fn storage_options(&self) -> (StorageClass, Option<ServerSideEncryption>) {
        let sse = if self.is_aws {
            match self.encryption {
                EncryptionMode::SseS3 => Some(ServerSideEncryption::Aes256),
                EncryptionMode::SseKms => Some(ServerSideEncryption::AwsKms),
                EncryptionMode::None => None,
            }
        } else {
            None
        };
        (self.storage_class.clone(), sse)
    }

    pub(crate) fn multipart_state_dir(&self) -> &Path {
        &self.multipart_state_dir
    }

    /// Override the multipart state directory (one file per key lives
    /// there while an upload is in flight).
    pub fn set_multipart_state_dir(&mut self, dir: PathBuf) {
        self.multipart_state_dir = dir;
    }

    /// Remove expired entries from the local fallback spool.
    pub fn sweep_fallback(&self) -> Result<usize, StoreError> {
        match &self.fallback {
            Some(fallback) => Ok(fallback.sweep()?),
            None => Ok(0),
        }
    }
}
