pub mod alpha_source_repo;
pub mod deployment_repo;
pub mod integrity_repo;
pub mod intent_repo;
pub mod memory;
pub mod position_repo;
pub mod settlement_repo;
pub mod signal_repo;
pub mod wallet_repo;

pub use alpha_source_repo::AlphaSourceRepo;
pub use deployment_repo::DeploymentRepo;
pub use integrity_repo::IntegrityRepo;
pub use intent_repo::IntentRepo;
pub use memory::MemoryStore;
pub use position_repo::{Attribution, PositionRepo};
pub use settlement_repo::{ReputationAggregate, SettlementRepo};
pub use signal_repo::SignalRepo;
pub use wallet_repo::WalletRepo;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Database(sqlx::Error),
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation(_))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    pub(crate) fn corrupt(column: &str, value: impl std::fmt::Display) -> Self {
        StoreError::Corrupt(format!("unexpected {column} value '{value}'"))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::UniqueViolation(db.message().to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(e.to_string())
            }
            other => StoreError::Database(other),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[async_trait]
pub trait StoreHealth: Send + Sync {
    /// Connectivity check for the health endpoint.
    async fn ping(&self) -> StoreResult<()>;
}

/// Every repository the pipeline needs, behind one object-safe handle.
pub trait Store:
    AlphaSourceRepo
    + SignalRepo
    + IntegrityRepo
    + DeploymentRepo
    + IntentRepo
    + PositionRepo
    + SettlementRepo
    + WalletRepo
    + StoreHealth
{
}

impl<T> Store for T where
    T: AlphaSourceRepo
        + SignalRepo
        + IntegrityRepo
        + DeploymentRepo
        + IntentRepo
        + PositionRepo
        + SettlementRepo
        + WalletRepo
        + StoreHealth
{
}

/// Postgres-backed store. Cloning shares the pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl StoreHealth for PgStore {
    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

pub async fn init_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    // Verify connectivity
    sqlx::query("SELECT 1").execute(&pool).await?;

    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
