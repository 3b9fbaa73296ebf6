//! Append-only audit trail.
//!
//! Events are buffered in memory during the run and flushed to the
//! object store afterwards. The trail is observability, not control
//! flow: a failed flush is logged and never fails the run.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use relic_config::AuditStorageKind;
use relic_object_store::ObjectStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    ArchiveStart,
    ArchiveSuccess,
    ArchiveFailure,
    ArchiveSkipped,
    RestoreStart,
    RestoreSuccess,
    RestoreFailure,
    SchemaDrift,
    SampleVerificationFailure,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub timestamp: DateTime<Utc>,
    pub database: String,
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, database: &str, table: &str, status: &str) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            database: database.to_string(),
            table: table.to_string(),
            schema: None,
            batch_number: None,
            record_count: None,
            duration_seconds: None,
            status: status.to_string(),
            error: None,
        }
    }

    pub fn schema(mut self, schema: &str) -> Self {
        self.schema = Some(schema.to_string());
        self
    }

    pub fn batch(mut self, batch_number: u32) -> Self {
        self.batch_number = Some(batch_number);
        self
    }

    pub fn records(mut self, count: u64) -> Self {
        self.record_count = Some(count);
        self
    }

    pub fn duration(mut self, seconds: f64) -> Self {
        self.duration_seconds = Some(seconds);
        self
    }

    pub fn error(mut self, error: impl std::fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

pub struct AuditTrail {
    storage: AuditStorageKind,
    run_id: String,
    events: Mutex<Vec<AuditEvent>>,
}

impl AuditTrail {
    pub fn new(storage: AuditStorageKind) -> Self {
        Self {
            storage,
            run_id: format!("{}_{}", Utc::now().format("%Y%m%dT%H%M%SZ"), std::process::id()),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn record(&self, event: AuditEvent) {
        log::debug!(
            "audit: {:?} {}.{} status={}",
            event.event_type,
            event.database,
            event.table,
            event.status
        );
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Flush the buffered events as one JSONL object under
    /// `audit/{YYYYMMDD}/{run_id}.jsonl`. Best-effort.
    pub async fn flush(&self, store: &ObjectStore) {
        let events = self.events.lock().unwrap().clone();
        if events.is_empty() {
            return;
        }
        if self.storage == AuditStorageKind::Log {
            for event in &events {
                log::info!("audit event: {}", serde_json::to_string(event).unwrap_or_default());
            }
            return;
        }

        let mut data = Vec::new();
        for event in &events {
            match serde_json::to_vec(event) {
                Ok(line) => {
                    data.extend_from_slice(&line);
                    data.push(b'\n');
                }
                Err(err) => log::warn!("unable to encode audit event - {}", err),
            }
        }
        let key = format!("audit/{}/{}.jsonl", Utc::now().format("%Y%m%d"), self.run_id);
        if let Err(err) = store.put(&key, data).await {
            log::warn!("unable to flush audit trail to '{}' - {}", key, err);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn events_accumulate_with_context() {
        let trail = AuditTrail::new(AuditStorageKind::Log);
        trail.record(
            AuditEvent::new(AuditEventType::ArchiveFailure, "app", "audit_logs", "failed")
                .schema("public")
                .batch(5)
                .records(400)
                .error("upload failed"),
        );
        let events = trail.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].batch_number, Some(5));
        assert_eq!(events[0].error.as_deref(), Some("upload failed"));
        assert_eq!(events[0].status, "failed");
    }
}
