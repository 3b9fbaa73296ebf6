//! PostgreSQL source store adapter.
//!
//! Everything the archiver does against the source database goes through
//! this crate: pooled connections, cursor-ordered batch selection with
//! row locks, the verify-then-delete transaction, advisory locks, schema
//! introspection, the reserved watermark tables, and the restore-side
//! bulk inserts.

use std::time::Duration;

use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use thiserror::Error;
use tokio_postgres::NoTls;

pub mod batch;
pub mod introspect;
pub mod lock;
pub mod restore;
pub mod row;
pub mod state_tables;

mod ident;
pub use ident::{quote_ident, quote_qualified};

pub use deadpool_postgres::{Client, Transaction};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
    #[error("database error: {0}")]
    Db(#[from] tokio_postgres::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SourceError {
    /// Connection-class failures are retried from the cursor; everything
    /// else fails the batch.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Pool(_) => true,
            SourceError::Db(err) => {
                if err.is_closed() {
                    return true;
                }
                match err.code() {
                    // class 08 (connection), class 57 (operator intervention),
                    // serialization/deadlock failures
                    Some(code) => {
                        let code = code.code();
                        code.starts_with("08")
                            || code.starts_with("57")
                            || code == "40001"
                            || code == "40P01"
                    }
                    None => false,
                }
            }
            SourceError::Other(_) => false,
        }
    }
}

/// Connection pool for one source database.
pub struct SourcePool {
    pool: Pool,
    database: String,
}

impl SourcePool {
    pub fn new(config: &relic_config::DatabaseConfig, pool_size: u32) -> Result<Self, SourceError> {
        let password = config.resolve_password().map_err(SourceError::Other)?;

        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(&config.host)
            .port(config.port)
            .user(&config.user)
            .password(password)
            .dbname(&config.name)
            .application_name("relic-archiver")
            .connect_timeout(Duration::from_secs(10));

        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig { recycling_method: RecyclingMethod::Fast },
        );
        let pool = Pool::builder(manager)
            .max_size(pool_size as usize)
            .build()
            .map_err(|err| SourceError::Other(err.into()))?;

        Ok(Self { pool, database: config.name.clone() })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub async fn client(&self) -> Result<Client, SourceError> {
        Ok(self.pool.get().await?)
    }

    /// Verify connectivity before any table work starts.
    pub async fn check(&self) -> Result<(), SourceError> {
        let client = self.client().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }
}
