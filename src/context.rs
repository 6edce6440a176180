//! Process-wide context.
//!
//! The configuration, the connection pool, the stores, and the room registry
//! are each long-lived; instead of hiding them behind globals they are built
//! once here and passed down explicitly.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use thiserror::Error;

use crate::compactor::{CompactError, Compactor};
use crate::config::{Config, ConfigError};
use crate::registry::RoomRegistry;
use crate::storage::{BaselineStore, MetadataStore, OperationLog, StorageError};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database unreachable: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Compact(#[from] CompactError),
}

/// Everything a session or worker needs, built once at startup.
pub struct Context {
    pub config: Config,
    pub oplog: Arc<OperationLog>,
    pub baselines: Arc<BaselineStore>,
    pub metadata: Arc<MetadataStore>,
    pub compactor: Arc<Compactor>,
    pub registry: Arc<RoomRegistry>,
}

impl Context {
    /// Production wiring: Postgres pool (with migrations) and S3. Any
    /// failure here is fatal to the process.
    pub async fn connect(config: Config) -> Result<Arc<Self>, StartupError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url())
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        let oplog = Arc::new(OperationLog::postgres(pool.clone()));
        let baselines = Arc::new(
            BaselineStore::s3(
                config.bucket.clone(),
                config.region.clone(),
                config.cache_dir.clone(),
            )
            .await?,
        );
        let metadata = Arc::new(MetadataStore::postgres(pool));

        Self::assemble(config, oplog, baselines, metadata).await
    }

    /// Wire up a context over caller-provided stores. Runs compaction-intent
    /// recovery and starts the background workers.
    pub async fn assemble(
        config: Config,
        oplog: Arc<OperationLog>,
        baselines: Arc<BaselineStore>,
        metadata: Arc<MetadataStore>,
    ) -> Result<Arc<Self>, StartupError> {
        let compactor = Arc::new(
            Compactor::new(
                oplog.clone(),
                baselines.clone(),
                metadata.clone(),
                config.cache_dir.join("intents"),
            )
            .await?,
        );

        let recovered = compactor.recover().await?;
        if recovered > 0 {
            log::info!("recovered {recovered} interrupted compactions");
        }

        let registry = RoomRegistry::new(
            oplog.clone(),
            metadata.clone(),
            compactor.clone(),
            config.liveness_interval,
        );
        registry.spawn_workers();

        Ok(Arc::new(Self {
            config,
            oplog,
            baselines,
            metadata,
            compactor,
            registry,
        }))
    }
}
