//! Stateless initialization for the review gate
//!
//! Builds an Application from configuration: pool, ledger, registries, the
//! completion handler and the dispatcher, all sharing one pool.

use anyhow::{Context, Result};
use sqlx::PgPool;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::clients::{PgReviewFlows, PgWorkflows};
use crate::config::Config;
use crate::db;
use crate::dispatch::ReviewDispatcher;
use crate::handler::CompletionHandler;
use crate::ledger::{execution_status, ExecutionStatus, PgLedger};

/// The review gate with all services wired
pub struct Application {
    pub config: Config,
    pub pool: PgPool,
    pub ledger: Arc<PgLedger>,
    pub review_flows: Arc<PgReviewFlows>,
    pub workflows: Arc<PgWorkflows>,
    pub handler: CompletionHandler,
    pub dispatcher: ReviewDispatcher,
}

impl Application {
    /// Pure instantiation, no I/O
    pub fn new(config: Config, pool: PgPool) -> Result<Self> {
        let ledger = Arc::new(PgLedger::new(pool.clone(), &config.ledger.table)?);
        let review_flows = Arc::new(PgReviewFlows::new(pool.clone()));
        let workflows = Arc::new(PgWorkflows::new(pool.clone()));

        let handler = CompletionHandler::new(
            ledger.clone(),
            review_flows.clone(),
            workflows.clone(),
            config.handler.clone(),
        )?;
        let dispatcher = ReviewDispatcher::new(
            ledger.clone(),
            review_flows.clone(),
            workflows.clone(),
            config.handler.clone(),
        )?;

        Ok(Self {
            config,
            pool,
            ledger,
            review_flows,
            workflows,
            handler,
            dispatcher,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run migrations and create the ledger table
    pub async fn migrate(&self) -> Result<()> {
        db::migrate(&self.pool).await?;
        self.ledger
            .ensure_table()
            .await
            .with_context(|| format!("Failed to create ledger table '{}'", self.ledger.table()))?;
        info!(table = self.ledger.table(), "Database ready");
        Ok(())
    }

    pub async fn status(&self, execution_id: &str) -> Result<ExecutionStatus> {
        execution_status(
            self.ledger.as_ref(),
            execution_id,
            self.config.handler.page_size,
        )
        .await
        .with_context(|| format!("Failed to read ledger for execution '{}'", execution_id))
    }
}

/// Options for initializing the review gate
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Database URL (overrides config file and env vars)
    pub database_url: Option<String>,

    /// Config file path (overrides default search)
    pub config_path: Option<PathBuf>,

    /// Whether to run migrations during initialization
    pub auto_migrate: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            database_url: None,
            config_path: None,
            auto_migrate: true,
        }
    }
}

/// Builder for constructing InitOptions
pub struct InitBuilder {
    options: InitOptions,
}

impl InitBuilder {
    pub fn new() -> Self {
        Self {
            options: InitOptions::default(),
        }
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.options.database_url = Some(url.into());
        self
    }

    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn auto_migrate(mut self, auto: bool) -> Self {
        self.options.auto_migrate = auto;
        self
    }

    pub async fn init(self) -> Result<Application> {
        initialize(self.options).await
    }
}

impl Default for InitBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Load configuration, connect, and optionally migrate
pub async fn initialize(options: InitOptions) -> Result<Application> {
    let config = Config::builder()
        .database_url(options.database_url)
        .config_path(options.config_path)
        .build()?;

    initialize_with(config, options.auto_migrate).await
}

/// Same as `initialize`, for an already loaded configuration
pub async fn initialize_with(config: Config, auto_migrate: bool) -> Result<Application> {
    let pool = db::create_pool(&config).await?;
    let app = Application::new(config, pool)?;

    if auto_migrate {
        app.migrate().await?;
    }

    Ok(app)
}
