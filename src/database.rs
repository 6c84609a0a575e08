//! Database facade
//!
//! Wires storage, statistics, the catalogue, the transaction manager, the
//! worker pools and the background services of one database instance.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::catalogue::{Catalogue, CatalogueContext, DatabaseError};
use crate::config::{Config, ConfigError};
use crate::execution::{ExecutionError, ExecutionManager, Scheduler};
use crate::fail_point::FailPoints;
use crate::observability::MetricsRegistry;
use crate::services::{
    AutoAnalyzer, AutoRebuilder, ServiceContext, Services, StatisticsChangeTracker, StatisticsPersister,
};
use crate::statistics::StatisticsManager;
use crate::storage::{Environment, StorageError};
use crate::transaction::{Transaction, TransactionManager, TransactionResult, TransactionType};

/// Errors raised while opening a database
#[derive(Debug, Error)]
pub enum OpenError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl OpenError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(e) => e.code(),
            Self::Execution(e) => e.code(),
            Self::Database(e) => e.code(),
            Self::Storage(e) => e.code(),
        }
    }
}

/// One open database
pub struct Database {
    id: Uuid,
    config: Config,
    environment: Arc<Environment>,
    owns_environment: bool,
    execution: ExecutionManager,
    metrics: Arc<MetricsRegistry>,
    fail_points: Arc<FailPoints>,
    catalogue: Arc<Catalogue>,
    transactions: TransactionManager,
    services: Mutex<Services>,
    closed: AtomicBool,
}

impl Database {
    /// Open an empty database; services run on the service pool
    pub fn open(config: Config) -> Result<Self, OpenError> {
        Self::build(Environment::new(), true, config, None)
    }

    /// Open an empty database whose services run on `scheduler`
    pub fn with_scheduler(config: Config, scheduler: Arc<dyn Scheduler>) -> Result<Self, OpenError> {
        Self::build(Environment::new(), true, config, Some(scheduler))
    }

    /// Open the database stored in `environment`.
    ///
    /// The environment stays open when this database shuts down.
    pub fn open_with(
        environment: Arc<Environment>,
        config: Config,
        scheduler: Option<Arc<dyn Scheduler>>,
    ) -> Result<Self, OpenError> {
        Self::build(environment, false, config, scheduler)
    }

    fn build(
        environment: Arc<Environment>,
        owns_environment: bool,
        config: Config,
        scheduler: Option<Arc<dyn Scheduler>>,
    ) -> Result<Self, OpenError> {
        config.validate()?;
        let id = Uuid::new_v4();
        let execution = ExecutionManager::new(&config.execution)?;
        let metrics = Arc::new(MetricsRegistry::new());
        let fail_points = Arc::new(FailPoints::new());

        let statistics = Arc::new(StatisticsManager::new());
        {
            let mut storage = environment.begin(true)?;
            statistics.load(&mut storage)?;
            storage.abort();
        }
        let ctx = CatalogueContext::new(statistics, Arc::clone(&fail_points), config.rebuilder.grid_buckets);
        let catalogue = Catalogue::load(ctx, &environment)?;

        let transactions = TransactionManager::new(
            Arc::clone(&environment),
            Arc::clone(execution.dispatcher()),
            Arc::clone(&metrics),
            &config.execution,
        );
        let scheduler =
            scheduler.unwrap_or_else(|| Arc::clone(execution.services()) as Arc<dyn Scheduler>);
        let service_ctx = ServiceContext {
            manager: transactions.clone(),
            catalogue: Arc::clone(&catalogue),
            scheduler,
            metrics: Arc::clone(&metrics),
            task_delay: config.services.task_delay(),
        };
        let services = Services::start(&service_ctx, &config);

        info!(database = %id, "database opened");
        Ok(Self {
            id,
            config,
            environment,
            owns_environment,
            execution,
            metrics,
            fail_points,
            catalogue,
            transactions,
            services: Mutex::new(services),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Begin a transaction of the given kind
    pub fn begin(&self, kind: TransactionType) -> TransactionResult<Transaction> {
        self.transactions.begin(kind)
    }

    pub fn catalogue(&self) -> &Arc<Catalogue> {
        &self.catalogue
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub fn statistics(&self) -> &Arc<StatisticsManager> {
        self.catalogue.statistics()
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn fail_points(&self) -> &Arc<FailPoints> {
        &self.fail_points
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.environment
    }

    pub fn analyzer(&self) -> Option<Arc<AutoAnalyzer>> {
        self.services.lock().analyzer.clone()
    }

    pub fn rebuilder(&self) -> Option<Arc<AutoRebuilder>> {
        self.services.lock().rebuilder.clone()
    }

    pub fn tracker(&self) -> Option<Arc<StatisticsChangeTracker>> {
        self.services.lock().tracker.clone()
    }

    pub fn persister(&self) -> Option<Arc<StatisticsPersister>> {
        self.services.lock().persister.clone()
    }

    /// Stop the services, kill live transactions and stop the pools
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.services.lock().stop(&self.transactions);
        self.transactions.shutdown();
        self.execution.shutdown();
        if self.owns_environment {
            self.environment.close();
        }
        info!(database = %self.id, metrics = %self.metrics.to_json(), "database shut down");
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.shutdown();
    }
}
