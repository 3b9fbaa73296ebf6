//! Distributed locks serializing write access to a database.
//!
//! The preferred backend is a session-level advisory lock in the source
//! database itself; a JSON lock file on shared storage is the fallback
//! for setups where the archiver must not write to the source outside
//! the archival transaction. Backends implement the same acquire /
//! heartbeat / release contract, so further ones can be plugged in
//! behind [LockKind].

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::format_err;
use chrono::Utc;
use thiserror::Error;

use relic_api_types::{LockKind, LockRecord};
use relic_config::DefaultsConfig;
use relic_source::{lock as pg_lock, SourcePool};

#[derive(Error, Debug)]
pub enum LockError {
    /// Another live holder owns the lock; the affected database is
    /// skipped, not failed.
    #[error("lock '{0}' is already held")]
    Busy(String),
    /// Re-acquisition from the same process; prevented locally so an
    /// advisory lock cannot self-deadlock through its own session.
    #[error("lock '{0}' is already held by this process")]
    HeldLocally(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

enum HeldBackend {
    Postgres {
        client: Arc<relic_source::Client>,
        lock_id: i32,
    },
    File {
        path: PathBuf,
    },
}

/// A successfully acquired lock; keeps the backing resources (and the
/// heartbeat task) alive until released.
pub struct LockHandle {
    key: String,
    record: Arc<Mutex<LockRecord>>,
    backend: HeldBackend,
    heartbeat: Option<tokio::task::JoinHandle<()>>,
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner(&self) -> String {
        self.record.lock().unwrap().owner.clone()
    }
}

pub struct LockManager {
    kind: LockKind,
    ttl: Duration,
    heartbeat_interval: Duration,
    file_dir: Option<PathBuf>,
    owner: String,
    held: Mutex<HashSet<String>>,
}

impl LockManager {
    pub fn new(defaults: &DefaultsConfig) -> Self {
        Self {
            kind: defaults.lock_type,
            ttl: Duration::from_secs(defaults.lock_ttl_seconds),
            heartbeat_interval: Duration::from_secs(defaults.lock_heartbeat_seconds),
            file_dir: defaults.lock_file_dir.as_ref().map(PathBuf::from),
            owner: format!("archiver_{}_{}", std::process::id(), Utc::now().timestamp()),
            held: Mutex::new(HashSet::new()),
        }
    }

    fn new_record(&self, key: &str) -> LockRecord {
        let now = Utc::now();
        LockRecord {
            lock_key: key.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::from_std(self.ttl).unwrap(),
            owner: self.owner.clone(),
        }
    }

    /// Non-blocking acquire. A live lock elsewhere fails with
    /// [LockError::Busy]; the heartbeat task starts immediately and
    /// keeps `expires_at` fresh until release.
    pub async fn acquire(
        &self,
        key: &str,
        pool: Option<&Arc<SourcePool>>,
    ) -> Result<LockHandle, LockError> {
        if self.held.lock().unwrap().contains(key) {
            return Err(LockError::HeldLocally(key.to_string()));
        }

        let record = Arc::new(Mutex::new(self.new_record(key)));
        let backend = match self.kind {
            LockKind::Postgresql => {
                let pool = pool.ok_or_else(|| {
                    format_err!("postgresql lock backend needs a database pool")
                })?;
                // the advisory lock lives on this session, so the client
                // is held until release
                let client = Arc::new(pool.client().await.map_err(|err| {
                    LockError::Other(format_err!("unable to get lock connection - {}", err))
                })?);
                let lock_id = pg_lock::advisory_lock_id(key);
                let acquired = pg_lock::try_advisory_lock(&client, lock_id)
                    .await
                    .map_err(|err| LockError::Other(err.into()))?;
                if !acquired {
                    return Err(LockError::Busy(key.to_string()));
                }
                HeldBackend::Postgres { client, lock_id }
            }
            LockKind::File => {
                let dir = self
                    .file_dir
                    .as_ref()
                    .ok_or_else(|| format_err!("file lock backend needs lock_file_dir"))?;
                let path = dir.join(format!("{}.lock", key.replace([':', '/'], "_")));
                acquire_file_lock(&path, &record.lock().unwrap().clone())?;
                HeldBackend::File { path }
            }
            LockKind::Redis => {
                return Err(LockError::Other(format_err!(
                    "lock backend 'redis' is not built in"
                )))
            }
        };

        self.held.lock().unwrap().insert(key.to_string());
        log::debug!("lock '{}' acquired by {}", key, self.owner);

        let heartbeat = self.spawn_heartbeat(&backend, Arc::clone(&record));
        Ok(LockHandle {
            key: key.to_string(),
            record,
            backend,
            heartbeat: Some(heartbeat),
        })
    }

    fn spawn_heartbeat(
        &self,
        backend: &HeldBackend,
        record: Arc<Mutex<LockRecord>>,
    ) -> tokio::task::JoinHandle<()> {
        let interval = self.heartbeat_interval;
        let ttl = chrono::Duration::from_std(self.ttl).unwrap();
        let backend = match backend {
            HeldBackend::Postgres { client, .. } => {
                HeartbeatBackend::Postgres { client: Arc::clone(client) }
            }
            HeldBackend::File { path } => HeartbeatBackend::File { path: path.clone() },
        };

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let expires_at = Utc::now() + ttl;
                let payload = {
                    let mut record = record.lock().unwrap();
                    record.expires_at = expires_at;
                    record.clone()
                };
                match &backend {
                    HeartbeatBackend::Postgres { client } => {
                        // the session keeps the advisory lock; the probe
                        // detects a lost connection early
                        if let Err(err) = client.simple_query("SELECT 1").await {
                            log::error!(
                                "lock heartbeat for '{}' failed - {}",
                                payload.lock_key,
                                err
                            );
                        }
                    }
                    HeartbeatBackend::File { path } => {
                        if let Err(err) = write_lock_file(path, &payload) {
                            log::error!(
                                "lock heartbeat for '{}' failed - {}",
                                payload.lock_key,
                                err
                            );
                        }
                    }
                }
                log::debug!(
                    "lock heartbeat sent for '{}' (expires {})",
                    payload.lock_key,
                    payload.expires_at
                );
            }
        })
    }

    /// Best-effort, idempotent release. A crashed holder's lock clears
    /// naturally once its TTL expires.
    pub async fn release(&self, mut handle: LockHandle) {
        if let Some(heartbeat) = handle.heartbeat.take() {
            heartbeat.abort();
        }
        match &handle.backend {
            HeldBackend::Postgres { client, lock_id } => {
                match pg_lock::advisory_unlock(client, *lock_id).await {
                    Ok(true) => log::debug!("lock '{}' released", handle.key),
                    Ok(false) => {
                        log::warn!("lock '{}' was not held at release time", handle.key)
                    }
                    Err(err) => log::warn!("unable to release lock '{}' - {}", handle.key, err),
                }
            }
            HeldBackend::File { path } => match std::fs::remove_file(path) {
                Ok(()) => log::debug!("lock '{}' released", handle.key),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    log::warn!("lock file for '{}' already gone", handle.key)
                }
                Err(err) => log::warn!("unable to release lock '{}' - {}", handle.key, err),
            },
        }
        self.held.lock().unwrap().remove(&handle.key);
    }
}

fn write_lock_file(path: &PathBuf, record: &LockRecord) -> Result<(), anyhow::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(record)?)?;
    Ok(())
}

fn acquire_file_lock(path: &PathBuf, record: &LockRecord) -> Result<(), LockError> {
    if let Ok(data) = std::fs::read(path) {
        match serde_json::from_slice::<LockRecord>(&data) {
            Ok(existing) if !existing.is_expired(Utc::now()) => {
                return Err(LockError::Busy(record.lock_key.clone()));
            }
            Ok(existing) => {
                log::warn!(
                    "reclaiming stale lock file {:?} (expired {}, owner {})",
                    path,
                    existing.expires_at,
                    existing.owner
                );
                let _ = std::fs::remove_file(path);
            }
            Err(err) => {
                log::warn!("removing invalid lock file {:?} - {}", path, err);
                let _ = std::fs::remove_file(path);
            }
        }
    }
    write_lock_file(path, record).map_err(LockError::Other)
}

enum HeartbeatBackend {
    Postgres { client: Arc<relic_source::Client> },
    File { path: PathBuf },
}

#[cfg(test)]
mod test {
    use super::*;
    use relic_api_types::LockKind;

    fn file_manager(dir: &std::path::Path) -> LockManager {
        let defaults = DefaultsConfig {
            lock_type: LockKind::File,
            lock_file_dir: Some(dir.to_string_lossy().into_owned()),
            ..Default::default()
        };
        LockManager::new(&defaults)
    }

    #[tokio::test]
    async fn file_lock_blocks_second_acquirer() {
        let dir = tempfile::tempdir().unwrap();
        let manager_a = file_manager(dir.path());
        let manager_b = file_manager(dir.path());

        let handle = manager_a.acquire("database:app", None).await.unwrap();
        match manager_b.acquire("database:app", None).await {
            Err(LockError::Busy(key)) => assert_eq!(key, "database:app"),
            other => panic!("expected Busy, got {:?}", other.map(|h| h.key().to_string())),
        }

        manager_a.release(handle).await;
        let handle = manager_b.acquire("database:app", None).await.unwrap();
        manager_b.release(handle).await;
    }

    #[tokio::test]
    async fn reacquisition_from_the_same_process_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = file_manager(dir.path());
        let handle = manager.acquire("database:app", None).await.unwrap();
        assert!(matches!(
            manager.acquire("database:app", None).await,
            Err(LockError::HeldLocally(_))
        ));
        manager.release(handle).await;
    }

    #[tokio::test]
    async fn stale_lock_files_are_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database_app.lock");
        let stale = LockRecord {
            lock_key: "database:app".into(),
            acquired_at: Utc::now() - chrono::Duration::hours(3),
            expires_at: Utc::now() - chrono::Duration::hours(2),
            owner: "archiver_dead_1".into(),
        };
        std::fs::write(&path, serde_json::to_vec(&stale).unwrap()).unwrap();

        let manager = file_manager(dir.path());
        let handle = manager.acquire("database:app", None).await.unwrap();
        assert_ne!(handle.owner(), "archiver_dead_1");
        manager.release(handle).await;
    }

    #[tokio::test]
    async fn release_is_idempotent_about_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let manager = file_manager(dir.path());
        let handle = manager.acquire("database:app", None).await.unwrap();
        std::fs::remove_file(dir.path().join("database_app.lock")).unwrap();
        manager.release(handle).await;
    }
}
