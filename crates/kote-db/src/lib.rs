use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr};
use std::env;
use std::time::Duration;

pub mod entities;
pub mod store;

/// Re-export for convenience
pub use sea_orm;

pub use store::{
    AliasRecord, PermissionLevel, StorageKind, StorageScope, Store, StoreError, SETTING_ENABLED,
    SETTING_PREFIX,
};

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub connect_timeout_secs: u64,
    /// How long SQLite waits on a locked database before failing a write.
    pub busy_timeout_ms: u64,
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        let url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://kote.db?mode=rwc".to_string());

        Self {
            url,
            connect_timeout_secs: env::var("DB_CONNECT_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),
            busy_timeout_ms: env::var("DB_BUSY_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10_000),
        }
    }

    /// Private in-memory database, used by tests.
    pub fn in_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            connect_timeout_secs: 8,
            busy_timeout_ms: 10_000,
        }
    }
}

/// Connect to the database.
///
/// The pool holds exactly one connection: every reader and writer in the
/// process shares it, and the pragmas below are applied to it once.
pub async fn connect(config: &DatabaseConfig) -> Result<DatabaseConnection, DbErr> {
    let mut opt = ConnectOptions::new(&config.url);
    opt.max_connections(1)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);

    let db = Database::connect(opt).await?;

    db.execute_unprepared("PRAGMA journal_mode=WAL;").await?;
    db.execute_unprepared("PRAGMA synchronous=NORMAL;").await?;
    db.execute_unprepared(&format!("PRAGMA busy_timeout={};", config.busy_timeout_ms))
        .await?;

    Ok(db)
}
