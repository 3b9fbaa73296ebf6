//! Cleanup of orphaned multipart uploads.
//!
//! A crashed process can leave initiated-but-never-completed uploads
//! accumulating invisible storage. Only uploads older than the caller's
//! threshold are touched, so a live peer's in-flight upload is never
//! raced.

use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use chrono::{DateTime, Duration, Utc};

use crate::{classify_sdk_error, ObjectStore, StoreError};

#[derive(Clone, Debug)]
pub struct OrphanedUpload {
    pub key: String,
    pub upload_id: String,
    pub initiated: DateTime<Utc>,
}

impl ObjectStore {
    /// List in-progress multipart uploads older than `max_age`, optionally
    /// restricted to a key prefix.
    pub async fn list_orphaned_uploads(
        &self,
        prefix: Option<&str>,
        max_age: Duration,
    ) -> Result<Vec<OrphanedUpload>, StoreError> {
        let threshold = Utc::now() - max_age;
        let full_prefix = prefix.map(|p| self.full_key(p));

        let mut orphaned = Vec::new();
        let mut key_marker: Option<String> = None;
        let mut upload_id_marker: Option<String> = None;
        loop {
            let mut request = self.client().list_multipart_uploads().bucket(self.bucket());
            if let Some(prefix) = &full_prefix {
                request = request.prefix(prefix.as_str());
            }
            if let Some(marker) = &key_marker {
                request = request.key_marker(marker.as_str());
            }
            if let Some(marker) = &upload_id_marker {
                request = request.upload_id_marker(marker.as_str());
            }
            let response = request.send().await.map_err(classify_sdk_error)?;

            for upload in response.uploads() {
                let initiated = match upload.initiated() {
                    Some(ts) => match DateTime::<Utc>::from_timestamp(ts.secs(), 0) {
                        Some(dt) => dt,
                        None => continue,
                    },
                    None => continue,
                };
                if initiated < threshold {
                    orphaned.push(OrphanedUpload {
                        key: upload.key().unwrap_or_default().to_string(),
                        upload_id: upload.upload_id().unwrap_or_default().to_string(),
                        initiated,
                    });
                }
            }

            if response.is_truncated().unwrap_or(false) {
                key_marker = response.next_key_marker().map(String::from);
                upload_id_marker = response.next_upload_id_marker().map(String::from);
            } else {
                break;
            }
        }
        Ok(orphaned)
    }

    /// Abort one multipart upload; a concurrently finished upload is not
    /// an error.
    pub async fn abort_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StoreError> {
        let result = self
            .client()
            .abort_multipart_upload()
            .bucket(self.bucket())
            .key(key)
            .upload_id(upload_id)
            .send()
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError(ctx))
                if ctx.err().meta().code() == Some("NoSuchUpload") =>
            {
                log::debug!("multipart upload '{}' already cleaned up", upload_id);
                Ok(())
            }
            Err(err) => Err(classify_sdk_error(err)),
        }
    }

    /// Abort every orphaned upload under a prefix; returns
    /// `(aborted, failed)` counts. Failures are logged, never fatal.
    pub async fn cleanup_orphaned_uploads(
        &self,
        prefix: Option<&str>,
        max_age: Duration,
    ) -> Result<(usize, usize), StoreError> {
        let orphaned = self.list_orphaned_uploads(prefix, max_age).await?;
        let mut aborted = 0;
        let mut failed = 0;
        for upload in orphaned {
            match self.abort_multipart_upload(&upload.key, &upload.upload_id).await {
                Ok(()) => {
                    aborted += 1;
                    log::info!(
                        "aborted orphaned multipart upload of '{}' (initiated {})",
                        upload.key,
                        upload.initiated
                    );
                }
                Err(err) => {
                    failed += 1;
                    log::warn!(
                        "unable to abort multipart upload of '{}' - {}",
                        upload.key,
                        err
                    );
                }
            }
        }
        Ok((aborted, failed))
    }
}
