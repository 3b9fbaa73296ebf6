//! Resumable multipart uploads.
//!
//! Upload progress is persisted to a local state file (one per key) so a
//! crashed process re-enumerates the remaining parts and continues
//! instead of re-sending the whole payload.

use std::path::{Path, PathBuf};

use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::{classify_sdk_error, ObjectStore, PutResult, StoreError};

/// Part size floor (S3 rejects smaller parts except the last).
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;
pub const DEFAULT_PART_SIZE: u64 = 10 * 1024 * 1024;
pub const MAX_PARTS: u64 = 10_000;

/// Pick a part size: start at the default and grow until the part count
/// fits the S3 limit, rounding up to whole MiB.
pub fn calculate_part_size(file_size: u64) -> u64 {
    let mut part_size = DEFAULT_PART_SIZE;
    if file_size.div_ceil(part_size) > MAX_PARTS {
        part_size = file_size.div_ceil(MAX_PARTS);
        part_size = part_size.div_ceil(1024 * 1024) * (1024 * 1024);
        part_size = part_size.max(MIN_PART_SIZE);
    }
    part_size.min(MAX_PART_SIZE)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadedPart {
    pub part_number: i32,
    pub etag: String,
}

/// Persisted state of one in-flight multipart upload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadState {
    pub upload_id: String,
    pub key: String,
    pub file_path: String,
    pub part_size: u64,
    pub total_parts: u64,
    pub uploaded_parts: Vec<UploadedPart>,
}

impl UploadState {
    pub fn save(&self, state_file: &Path) -> Result<(), StoreError> {
        if let Some(parent) = state_file.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| StoreError::Fatal(format!("unable to create state dir: {}", err)))?;
        }
        let data = serde_json::to_vec_pretty(self)
            .map_err(|err| StoreError::Fatal(format!("unable to encode upload state: {}", err)))?;
        std::fs::write(state_file, data)
            .map_err(|err| StoreError::Fatal(format!("unable to write upload state: {}", err)))?;
        Ok(())
    }

    pub fn load(state_file: &Path) -> Option<Self> {
        let data = std::fs::read(state_file).ok()?;
        serde_json::from_slice(&data).ok()
    }

    /// Part numbers still missing, in ascending order.
    pub fn remaining_parts(&self) -> Vec<i32> {
        (1..=self.total_parts as i32)
            .filter(|n| !self.uploaded_parts.iter().any(|p| p.part_number == *n))
            .collect()
    }
}

pub(crate) fn state_file_name(key: &str) -> String {
    format!("{}.json", key.replace(['/', '\\'], "_"))
}

impl ObjectStore {
    pub(crate) async fn put_multipart(
        &self,
        full_key: &str,
        path: &Path,
    ) -> Result<PutResult, StoreError> {
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|err| StoreError::Fatal(format!("unable to stat {:?}: {}", path, err)))?
            .len();
        let part_size = calculate_part_size(size);
        let total_parts = size.div_ceil(part_size).max(1);
        let state_file: PathBuf = self.multipart_state_dir().join(state_file_name(full_key));

        let mut state = match UploadState::load(&state_file) {
            Some(state)
                if state.key == full_key
                    && state.part_size == part_size
                    && state.total_parts == total_parts =>
            {
                log::info!(
                    "resuming multipart upload of '{}' ({}/{} parts done)",
                    full_key,
                    state.uploaded_parts.len(),
                    state.total_parts
                );
                state
            }
            _ => {
                let (storage_class, sse) = self.storage_options();
                let mut request = self
                    .client()
                    .create_multipart_upload()
                    .bucket(self.bucket())
                    .key(full_key)
                    .storage_class(storage_class);
                if let Some(sse) = sse {
                    request = request.server_side_encryption(sse);
                }
                let response = request.send().await.map_err(classify_sdk_error)?;
                let upload_id = response
                    .upload_id()
                    .ok_or_else(|| {
                        StoreError::Fatal("multipart initiation returned no upload id".into())
                    })?
                    .to_string();
                let state = UploadState {
                    upload_id,
                    key: full_key.to_string(),
                    file_path: path.to_string_lossy().into_owned(),
                    part_size,
                    total_parts,
                    uploaded_parts: Vec::new(),
                };
                state.save(&state_file)?;
                state
            }
        };

        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|err| StoreError::Fatal(format!("unable to open {:?}: {}", path, err)))?;

        for part_number in state.remaining_parts() {
            let offset = (part_number as u64 - 1) * part_size;
            let len = part_size.min(size - offset) as usize;
            let mut buffer = vec![0u8; len];
            file.seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(|err| StoreError::Fatal(format!("seek failed: {}", err)))?;
            file.read_exact(&mut buffer)
                .await
                .map_err(|err| StoreError::Fatal(format!("part read failed: {}", err)))?;

            let etag = self
                .guarded("upload part", || {
                    let request = self
                        .client()
                        .upload_part()
                        .bucket(self.bucket())
                        .key(full_key)
                        .upload_id(state.upload_id.as_str())
                        .part_number(part_number)
                        .body(aws_sdk_s3::primitives::ByteStream::from(buffer.clone()));
                    async move {
                        let response = request.send().await.map_err(classify_sdk_error)?;
                        Ok(response.e_tag().unwrap_or_default().to_string())
                    }
                })
                .await?;

            state.uploaded_parts.push(UploadedPart { part_number, etag });
            state.save(&state_file)?;
            log::debug!(
                "uploaded part {}/{} of '{}'",
                state.uploaded_parts.len(),
                state.total_parts,
                full_key
            );
        }

        let mut parts = state.uploaded_parts.clone();
        parts.sort_by_key(|p| p.part_number);
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .into_iter()
                    .map(|p| {
                        CompletedPart::builder()
                            .part_number(p.part_number)
                            .e_tag(p.etag)
                            .build()
                    })
                    .collect(),
            ))
            .build();

        let response = self
            .client()
            .complete_multipart_upload()
            .bucket(self.bucket())
            .key(full_key)
            .upload_id(state.upload_id.as_str())
            .multipart_upload(completed)
            .send()
            .await
            .map_err(classify_sdk_error)?;

        if let Err(err) = std::fs::remove_file(&state_file) {
            log::warn!("unable to remove upload state file {:?}: {}", state_file, err);
        }

        Ok(PutResult {
            key: full_key.to_string(),
            etag: response.e_tag().unwrap_or_default().to_string(),
            size,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_part_size_for_small_files() {
        assert_eq!(calculate_part_size(1), DEFAULT_PART_SIZE);
        assert_eq!(calculate_part_size(100 * 1024 * 1024), DEFAULT_PART_SIZE);
    }

    #[test]
    fn part_size_grows_to_respect_the_part_limit() {
        // 200 GiB at 10 MiB/part would be 20480 parts
        let size = 200 * 1024 * 1024 * 1024u64;
        let part_size = calculate_part_size(size);
        assert!(size.div_ceil(part_size) <= MAX_PARTS);
        assert_eq!(part_size % (1024 * 1024), 0);
        assert!(part_size >= MIN_PART_SIZE);
        assert!(part_size <= MAX_PART_SIZE);
    }

    #[test]
    fn remaining_parts_excludes_uploaded() {
        let state = UploadState {
            upload_id: "u".into(),
            key: "k".into(),
            file_path: "/tmp/f".into(),
            part_size: MIN_PART_SIZE,
            total_parts: 4,
            uploaded_parts: vec![
                UploadedPart { part_number: 1, etag: "a".into() },
                UploadedPart { part_number: 3, etag: "b".into() },
            ],
        };
        assert_eq!(state.remaining_parts(), vec![2, 4]);
    }

    #[test]
    fn state_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join(state_file_name("app/t/file.jsonl.gz"));
        let state = UploadState {
            upload_id: "upload-1".into(),
            key: "app/t/file.jsonl.gz".into(),
            file_path: "/tmp/batch".into(),
            part_size: DEFAULT_PART_SIZE,
            total_parts: 2,
            uploaded_parts: vec![UploadedPart { part_number: 1, etag: "e1".into() }],
        };
        state.save(&state_file).unwrap();
        let loaded = UploadState::load(&state_file).unwrap();
        assert_eq!(loaded.upload_id, "upload-1");
        assert_eq!(loaded.remaining_parts(), vec![2]);
    }
}
