//! Configuration loading for the archiver and restore binaries.
//!
//! Configuration is a single YAML document. Every string value supports
//! `${VAR}` / `${VAR:-default}` environment substitution, applied before
//! parsing. Global `defaults.*` values are merged onto tables that carry
//! no override, and all ranges are validated eagerly so a bad config
//! aborts the run before any I/O.

use std::path::Path;

use anyhow::{bail, format_err, Context, Error};
use serde::{Deserialize, Serialize};

use relic_api_types::{
    CheckpointStorageKind, EncryptionMode, LockKind, RestoreWatermarkStorageKind, VacuumStrategy,
    WatermarkStorageKind,
};

mod env_subst;
pub use env_subst::substitute_env;

pub const SUPPORTED_VERSIONS: &[&str] = &["1.0", "2.0"];

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct S3Config {
    /// Custom endpoint for S3-compatible storage; unset means AWS S3.
    #[serde(default)]
    pub endpoint: Option<String>,
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_storage_class")]
    pub storage_class: String,
    #[serde(default)]
    pub encryption: EncryptionMode,
    #[serde(default = "default_multipart_threshold_mb")]
    pub multipart_threshold_mb: u64,
    #[serde(default)]
    pub rate_limit_requests_per_second: Option<f64>,
    #[serde(default)]
    pub local_fallback_dir: Option<String>,
    #[serde(default = "default_local_fallback_retention_days")]
    pub local_fallback_retention_days: u32,
    #[serde(default, alias = "aws_access_key_id")]
    pub access_key_id: Option<String>,
    #[serde(default, alias = "aws_secret_access_key")]
    pub secret_access_key: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_storage_class() -> String {
    "STANDARD_IA".to_string()
}
fn default_multipart_threshold_mb() -> u64 {
    10
}
fn default_local_fallback_retention_days() -> u32 {
    7
}

impl S3Config {
    /// Resolve static credentials. Environment variables win; credentials
    /// in the config file work but are warned about. `None` means the
    /// default provider chain (instance role, profile, ...) applies.
    pub fn credentials(&self) -> Result<Option<(String, String)>, Error> {
        let config_key = self.access_key_id.clone();
        let config_secret = self.secret_access_key.clone();

        let env_key = std::env::var("AWS_ACCESS_KEY_ID").ok();
        let env_secret = std::env::var("AWS_SECRET_ACCESS_KEY").ok();

        if let (Some(key), Some(secret)) = (env_key, env_secret) {
            return Ok(Some((key, secret)));
        }

        match (config_key, config_secret) {
            (Some(key), Some(secret)) => {
                log::warn!(
                    "using AWS credentials from the config file - prefer \
                     AWS_ACCESS_KEY_ID/AWS_SECRET_ACCESS_KEY in production"
                );
                Ok(Some((key, secret)))
            }
            (None, None) => Ok(None),
            _ => bail!(
                "access_key_id and secret_access_key must be provided together \
                 (or via environment variables)"
            ),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TableConfig {
    pub name: String,
    #[serde(default = "default_schema", rename = "schema")]
    pub schema_name: String,
    pub timestamp_column: String,
    pub primary_key: String,
    #[serde(default)]
    pub retention_days: Option<u32>,
    #[serde(default)]
    pub batch_size: Option<u32>,
    /// Critical tables get additional safety checks (encryption gate).
    #[serde(default)]
    pub critical: bool,
}

fn default_schema() -> String {
    "public".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    /// Environment variable holding the password (preferred).
    #[serde(default)]
    pub password_env: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub read_replica: Option<String>,
    #[serde(default)]
    pub connection_pool_size: Option<u32>,
    pub tables: Vec<TableConfig>,
}

fn default_port() -> u16 {
    5432
}

impl DatabaseConfig {
    pub fn resolve_password(&self) -> Result<String, Error> {
        if let Some(var) = &self.password_env {
            return std::env::var(var)
                .map_err(|_| format_err!("environment variable {} not set", var));
        }
        if let Some(password) = &self.password {
            log::warn!(
                "using password from config file for database '{}' - prefer password_env",
                self.name
            );
            return Ok(password.clone());
        }
        bail!("no password source configured for database '{}'", self.name);
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub retention_days: u32,
    pub batch_size: u32,
    /// Inter-batch pacing in seconds.
    pub sleep_between_batches: u64,
    pub vacuum_after: bool,
    pub vacuum_strategy: VacuumStrategy,
    pub parallel_databases: bool,
    pub max_parallel_databases: u32,
    pub connection_pool_size: u32,
    pub compression_level: u32,
    pub fail_on_schema_drift: bool,
    pub lock_type: LockKind,
    pub lock_ttl_seconds: u64,
    pub lock_heartbeat_seconds: u64,
    pub lock_file_dir: Option<String>,
    pub watermark_storage_type: WatermarkStorageKind,
    pub checkpoint_storage_type: CheckpointStorageKind,
    pub checkpoint_interval: u32,
    pub checkpoint_local_dir: Option<String>,
    pub audit_trail_storage_type: AuditStorageKind,
    pub safety_buffer_days: u32,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            retention_days: 90,
            batch_size: 10_000,
            sleep_between_batches: 2,
            vacuum_after: true,
            vacuum_strategy: VacuumStrategy::Standard,
            parallel_databases: false,
            max_parallel_databases: 3,
            connection_pool_size: 5,
            compression_level: 6,
            fail_on_schema_drift: false,
            lock_type: LockKind::Postgresql,
            lock_ttl_seconds: 3600,
            lock_heartbeat_seconds: 30,
            lock_file_dir: None,
            watermark_storage_type: WatermarkStorageKind::S3,
            checkpoint_storage_type: CheckpointStorageKind::S3,
            checkpoint_interval: 10,
            checkpoint_local_dir: None,
            audit_trail_storage_type: AuditStorageKind::S3,
            safety_buffer_days: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStorageKind {
    #[default]
    S3,
    Log,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LegalHoldConfig {
    pub enabled: bool,
    /// Table holding legal hold rows, `schema.table` or bare name.
    pub check_table: Option<String>,
    pub check_database: Option<String>,
    pub api_endpoint: Option<String>,
    pub api_timeout: u64,
}

impl Default for LegalHoldConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_table: None,
            check_database: None,
            api_endpoint: None,
            api_timeout: 5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplianceConfig {
    pub min_retention_days: u32,
    pub max_retention_days: u32,
    pub enforce_encryption: bool,
    pub data_classifications: Option<std::collections::BTreeMap<String, u32>>,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            min_retention_days: 7,
            max_retention_days: 2555,
            enforce_encryption: false,
            data_classifications: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreWatermarkConfig {
    pub enabled: bool,
    pub storage_type: RestoreWatermarkStorageKind,
    pub update_after_each_archive: bool,
}

impl Default for RestoreWatermarkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            storage_type: RestoreWatermarkStorageKind::S3,
            update_after_each_archive: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchiverConfig {
    pub version: String,
    pub s3: S3Config,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    pub databases: Vec<DatabaseConfig>,
    #[serde(default)]
    pub legal_holds: Option<LegalHoldConfig>,
    #[serde(default)]
    pub compliance: Option<ComplianceConfig>,
    #[serde(default)]
    pub restore_watermark: RestoreWatermarkConfig,
}

impl ArchiverConfig {
    /// Effective batch size for a table.
    pub fn batch_size(&self, table: &TableConfig) -> u32 {
        table.batch_size.unwrap_or(self.defaults.batch_size)
    }

    /// Effective retention for a table.
    pub fn retention_days(&self, table: &TableConfig) -> u32 {
        table.retention_days.unwrap_or(self.defaults.retention_days)
    }

    /// Effective pool size for a database.
    pub fn pool_size(&self, database: &DatabaseConfig) -> u32 {
        database
            .connection_pool_size
            .unwrap_or(self.defaults.connection_pool_size)
    }

    fn validate(&self) -> Result<(), Error> {
        if !SUPPORTED_VERSIONS.contains(&self.version.as_str()) {
            bail!("unsupported configuration version: {}", self.version);
        }
        if self.s3.bucket.is_empty() {
            bail!("s3.bucket must not be empty");
        }
        if self.s3.multipart_threshold_mb < 1 {
            bail!("s3.multipart_threshold_mb must be at least 1");
        }
        if let Some(rate) = self.s3.rate_limit_requests_per_second {
            if !(rate > 0.0) {
                bail!("s3.rate_limit_requests_per_second must be positive");
            }
        }
        if self.s3.local_fallback_retention_days < 1 {
            bail!("s3.local_fallback_retention_days must be at least 1");
        }

        let defaults = &self.defaults;
        if !(1..=9).contains(&defaults.compression_level) {
            bail!("defaults.compression_level must be between 1 and 9");
        }
        if !(1..=10).contains(&defaults.max_parallel_databases) {
            bail!("defaults.max_parallel_databases must be between 1 and 10");
        }
        if !(1..=50).contains(&defaults.connection_pool_size) {
            bail!("defaults.connection_pool_size must be between 1 and 50");
        }
        if defaults.checkpoint_interval < 1 {
            bail!("defaults.checkpoint_interval must be at least 1");
        }
        if defaults.batch_size == 0 {
            bail!("defaults.batch_size must be positive");
        }
        if defaults.retention_days == 0 || defaults.retention_days >= 36_500 {
            bail!("defaults.retention_days out of range");
        }
        if defaults.lock_ttl_seconds == 0 || defaults.lock_heartbeat_seconds == 0 {
            bail!("lock TTL and heartbeat interval must be positive");
        }
        if defaults.lock_type == LockKind::File && defaults.lock_file_dir.is_none() {
            bail!("defaults.lock_file_dir is required for lock_type 'file'");
        }
        if defaults.checkpoint_storage_type == CheckpointStorageKind::Local
            && defaults.checkpoint_local_dir.is_none()
        {
            bail!("defaults.checkpoint_local_dir is required for checkpoint_storage_type 'local'");
        }

        if self.databases.is_empty() {
            bail!("at least one database must be configured");
        }
        for database in &self.databases {
            if database.tables.is_empty() {
                bail!("database '{}' has no tables configured", database.name);
            }
            match (&database.password_env, &database.password) {
                (None, None) => bail!(
                    "database '{}': either password_env or password is required",
                    database.name
                ),
                (Some(_), Some(_)) => bail!(
                    "database '{}': password_env and password are mutually exclusive",
                    database.name
                ),
                _ => {}
            }
            if let Some(size) = database.connection_pool_size {
                if !(1..=50).contains(&size) {
                    bail!(
                        "database '{}': connection_pool_size must be between 1 and 50",
                        database.name
                    );
                }
            }
            for table in &database.tables {
                if table.timestamp_column.is_empty() || table.primary_key.is_empty() {
                    bail!(
                        "table '{}.{}': timestamp_column and primary_key are required",
                        database.name,
                        table.name
                    );
                }
                if let Some(days) = table.retention_days {
                    if days == 0 || days >= 36_500 {
                        bail!(
                            "table '{}.{}': retention_days out of range",
                            database.name,
                            table.name
                        );
                    }
                }
                if let Some(size) = table.batch_size {
                    if size == 0 {
                        bail!(
                            "table '{}.{}': batch_size must be positive",
                            database.name,
                            table.name
                        );
                    }
                }
            }
        }

        if let Some(holds) = &self.legal_holds {
            if holds.api_timeout == 0 || holds.api_timeout > 60 {
                bail!("legal_holds.api_timeout must be between 1 and 60 seconds");
            }
        }
        if let Some(compliance) = &self.compliance {
            if compliance.min_retention_days == 0 {
                bail!("compliance.min_retention_days must be positive");
            }
            if compliance.max_retention_days >= 36_500
                || compliance.max_retention_days < compliance.min_retention_days
            {
                bail!("compliance.max_retention_days out of range");
            }
        }

        Ok(())
    }

    /// Merge global defaults onto per-table settings.
    fn apply_defaults(&mut self) {
        for database in &mut self.databases {
            for table in &mut database.tables {
                if table.retention_days.is_none() {
                    table.retention_days = Some(self.defaults.retention_days);
                }
                if table.batch_size.is_none() {
                    table.batch_size = Some(self.defaults.batch_size);
                }
            }
        }
    }
}

/// Load, substitute, parse and validate a configuration file.
pub fn load_config(path: &Path) -> Result<ArchiverConfig, Error> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| format_err!("unable to read config file {:?} - {}", path, err))?;
    parse_config(&raw).with_context(|| format!("invalid configuration in {:?}", path))
}

/// Parse a configuration document from a string.
pub fn parse_config(raw: &str) -> Result<ArchiverConfig, Error> {
    let document: serde_yaml::Value =
        serde_yaml::from_str(raw).map_err(|err| format_err!("invalid YAML - {}", err))?;
    if document.is_null() {
        bail!("configuration file is empty");
    }
    let document = substitute_env(document)?;
    let mut config: ArchiverConfig = serde_yaml::from_value(document)
        .map_err(|err| format_err!("configuration validation failed - {}", err))?;
    config.validate()?;
    config.apply_defaults();
    Ok(config)
}

#[cfg(test)]
mod test;
