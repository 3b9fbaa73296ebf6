//! Policy gates evaluated before a table is archived: legal holds,
//! retention bounds and the encryption requirement for critical tables.

use anyhow::{bail, Error};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use relic_api_types::EncryptionMode;
use relic_config::{ComplianceConfig, LegalHoldConfig, S3Config, TableConfig};
use relic_source::SourcePool;

/// An active or scheduled legal hold on a table.
#[derive(Clone, Debug, Deserialize)]
pub struct LegalHold {
    pub reason: String,
    pub requestor: String,
    pub start_date: DateTime<Utc>,
    #[serde(default)]
    pub expiration_date: Option<DateTime<Utc>>,
}

impl LegalHold {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        if now < self.start_date {
            return false;
        }
        match self.expiration_date {
            Some(expiration) => now < expiration,
            None => true,
        }
    }
}

/// Looks up legal holds in a designated database table and/or an HTTP
/// endpoint. Lookup failures are logged and treated as no-hold; the
/// hold system being down must not silently freeze archival forever.
pub struct LegalHoldChecker {
    config: LegalHoldConfig,
    http: Option<reqwest::Client>,
}

#[derive(Deserialize)]
struct HoldApiResponse {
    active: bool,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    requestor: Option<String>,
    #[serde(default)]
    start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    expiration_date: Option<DateTime<Utc>>,
}

impl LegalHoldChecker {
    pub fn new(config: Option<LegalHoldConfig>) -> Self {
        let config = config.unwrap_or(LegalHoldConfig {
            enabled: false,
            ..Default::default()
        });
        let http = if config.enabled && config.api_endpoint.is_some() {
            reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(config.api_timeout))
                .build()
                .ok()
        } else {
            None
        };
        Self { config, http }
    }

    pub async fn check(
        &self,
        pool: &SourcePool,
        database: &str,
        table: &str,
        schema: &str,
    ) -> Option<LegalHold> {
        if !self.config.enabled {
            return None;
        }

        if let Some(check_table) = &self.config.check_table {
            match self.check_database_table(pool, check_table, database, table, schema).await {
                Ok(Some(hold)) => return Some(hold),
                Ok(None) => {}
                Err(err) => log::warn!(
                    "legal hold lookup in '{}' failed for {}.{} - {}",
                    check_table,
                    database,
                    table,
                    err
                ),
            }
        }

        if self.config.api_endpoint.is_some() {
            match self.check_api(database, table, schema).await {
                Ok(Some(hold)) => return Some(hold),
                Ok(None) => {}
                Err(err) => log::warn!(
                    "legal hold API lookup failed for {}.{} - {}",
                    database,
                    table,
                    err
                ),
            }
        }

        None
    }

    async fn check_database_table(
        &self,
        pool: &SourcePool,
        check_table: &str,
        database: &str,
        table: &str,
        schema: &str,
    ) -> Result<Option<LegalHold>, Error> {
        let (hold_schema, hold_table) = match check_table.split_once('.') {
            Some((s, t)) => (s, t),
            None => ("public", check_table),
        };
        let sql = format!(
            "SELECT reason, requestor, start_date, expiration_date FROM {} \
             WHERE table_name = $1 AND schema_name = $2 \
               AND (database_name = $3 OR database_name IS NULL)",
            relic_source::quote_qualified(hold_schema, hold_table),
        );
        let client = pool.client().await?;
        let rows = client.query(&sql, &[&table, &schema, &database]).await?;

        let now = Utc::now();
        for row in rows {
            let hold = LegalHold {
                reason: row.get("reason"),
                requestor: row.get("requestor"),
                start_date: row.get("start_date"),
                expiration_date: row.get("expiration_date"),
            };
            if hold.is_active(now) {
                return Ok(Some(hold));
            }
        }
        Ok(None)
    }

    async fn check_api(
        &self,
        database: &str,
        table: &str,
        schema: &str,
    ) -> Result<Option<LegalHold>, Error> {
        let (http, endpoint) = match (&self.http, &self.config.api_endpoint) {
            (Some(http), Some(endpoint)) => (http, endpoint),
            _ => return Ok(None),
        };
        let response = http
            .get(endpoint)
            .query(&[("database", database), ("table", table), ("schema", schema)])
            .send()
            .await?
            .error_for_status()?
            .json::<HoldApiResponse>()
            .await?;

        if !response.active {
            return Ok(None);
        }
        let hold = LegalHold {
            reason: response.reason.unwrap_or_else(|| "unspecified".to_string()),
            requestor: response.requestor.unwrap_or_else(|| "unknown".to_string()),
            start_date: response.start_date.unwrap_or_else(Utc::now),
            expiration_date: response.expiration_date,
        };
        Ok(Some(hold))
    }
}

/// Validates per-table retention against the compliance window.
pub struct RetentionEnforcer {
    compliance: Option<ComplianceConfig>,
}

impl RetentionEnforcer {
    pub fn new(compliance: Option<ComplianceConfig>) -> Self {
        Self { compliance }
    }

    pub fn validate(&self, table: &TableConfig, retention_days: u32) -> Result<(), Error> {
        let compliance = match &self.compliance {
            Some(compliance) => compliance,
            None => return Ok(()),
        };
        if retention_days < compliance.min_retention_days {
            bail!(
                "table '{}': retention of {} days is below the compliance minimum of {}",
                table.name,
                retention_days,
                compliance.min_retention_days
            );
        }
        if retention_days > compliance.max_retention_days {
            bail!(
                "table '{}': retention of {} days exceeds the compliance maximum of {}",
                table.name,
                retention_days,
                compliance.max_retention_days
            );
        }
        Ok(())
    }
}

/// Critical tables must not be archived unencrypted when the compliance
/// policy enforces encryption.
pub fn check_encryption_gate(
    table: &TableConfig,
    s3: &S3Config,
    compliance: Option<&ComplianceConfig>,
) -> Result<(), Error> {
    let enforce = compliance.map(|c| c.enforce_encryption).unwrap_or(false);
    if enforce && table.critical && s3.encryption == EncryptionMode::None {
        bail!(
            "table '{}' is marked critical but s3.encryption is 'none'",
            table.name
        );
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Duration;

    fn table(critical: bool) -> TableConfig {
        TableConfig {
            name: "audit_logs".into(),
            schema_name: "public".into(),
            timestamp_column: "created_at".into(),
            primary_key: "id".into(),
            retention_days: None,
            batch_size: None,
            critical,
        }
    }

    fn s3(encryption: EncryptionMode) -> S3Config {
        let config = relic_config::parse_config(
            r#"
version: "1.0"
s3:
  bucket: b
databases:
  - name: app
    host: h
    user: u
    password_env: X
    tables:
      - name: t
        timestamp_column: ts
        primary_key: id
"#,
        )
        .unwrap();
        let mut s3 = config.s3;
        s3.encryption = encryption;
        s3
    }

    #[test]
    fn hold_activity_window() {
        let now = Utc::now();
        let hold = LegalHold {
            reason: "litigation".into(),
            requestor: "legal".into(),
            start_date: now - Duration::days(1),
            expiration_date: Some(now + Duration::days(1)),
        };
        assert!(hold.is_active(now));
        assert!(!hold.is_active(now - Duration::days(2)));
        assert!(!hold.is_active(now + Duration::days(2)));

        let indefinite = LegalHold { expiration_date: None, ..hold };
        assert!(indefinite.is_active(now + Duration::days(3650)));
    }

    #[test]
    fn retention_window_is_enforced() {
        let enforcer = RetentionEnforcer::new(Some(ComplianceConfig {
            min_retention_days: 7,
            max_retention_days: 365,
            enforce_encryption: false,
            data_classifications: None,
        }));
        assert!(enforcer.validate(&table(false), 90).is_ok());
        assert!(enforcer.validate(&table(false), 3).is_err());
        assert!(enforcer.validate(&table(false), 400).is_err());

        let unbounded = RetentionEnforcer::new(None);
        assert!(unbounded.validate(&table(false), 1).is_ok());
    }

    #[test]
    fn encryption_gate_only_bites_critical_tables() {
        let compliance = ComplianceConfig {
            enforce_encryption: true,
            ..Default::default()
        };
        let unencrypted = s3(EncryptionMode::None);
        assert!(check_encryption_gate(&table(false), &unencrypted, Some(&compliance)).is_ok());
        assert!(check_encryption_gate(&table(true), &unencrypted, Some(&compliance)).is_err());

        let encrypted = s3(EncryptionMode::SseS3);
        assert!(check_encryption_gate(&table(true), &encrypted, Some(&compliance)).is_ok());
        assert!(check_encryption_gate(&table(true), &unencrypted, None).is_ok());
    }
}
