//! Layered configuration
//!
//! Sources, lowest precedence first:
//! 1. Built-in defaults
//! 2. TOML file (`--config`, `REVIEWGATE_CONFIG_PATH`, or `./reviewgate.toml`)
//! 3. Environment (`REVIEWGATE_<SECTION>__<KEY>`, plus `REVIEWGATE_DATABASE_URL`)
//! 4. Explicit builder overrides

use anyhow::{anyhow, bail, Context, Result};
use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "REVIEWGATE";
const DEFAULT_CONFIG_FILE: &str = "reviewgate.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub ledger: LedgerConfig,
    pub handler: HandlerConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 20,
            min_connections: 2,
            acquire_timeout_secs: 10,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Table holding subtask and sentinel records
    pub table: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            table: "review_ledger".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// Single character between execution id and subtask suffix
    pub separator: String,
    /// Records fetched per page while checking for outstanding subtasks
    pub page_size: u32,
    /// Review resource name is `<resource_prefix><execution_id>`
    pub resource_prefix: String,
    pub call_timeout_secs: u64,
    pub teardown_attempts: u32,
    pub resume_attempts: u32,
    /// Whole-notification attempts when a retryable error comes back
    pub delivery_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            separator: "-".to_string(),
            page_size: 2,
            resource_prefix: "flow-".to_string(),
            call_timeout_secs: 10,
            teardown_attempts: 3,
            resume_attempts: 3,
            delivery_attempts: 3,
            retry_backoff_ms: 200,
        }
    }
}

impl HandlerConfig {
    /// First character of `separator`; `validate` guarantees there is exactly one
    pub fn separator(&self) -> char {
        self.separator.chars().next().unwrap_or_default()
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn resource_name(&self, execution_id: &str) -> String {
        format!("{}{}", self.resource_prefix, execution_id)
    }

    pub fn validate(&self) -> Result<()> {
        if self.separator.chars().count() != 1 {
            bail!(
                "handler.separator must be exactly one character, got '{}'",
                self.separator
            );
        }
        if self.page_size == 0 {
            bail!("handler.page_size must be at least 1");
        }
        if self.call_timeout_secs == 0 {
            bail!("handler.call_timeout_secs must be at least 1");
        }
        if self.teardown_attempts == 0 || self.resume_attempts == 0 || self.delivery_attempts == 0
        {
            bail!(
                "handler.teardown_attempts, handler.resume_attempts and \
                handler.delivery_attempts must be at least 1"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Load from the default sources with no overrides
    pub fn load() -> Result<Self> {
        Self::builder().build()
    }

    pub fn database_url(&self) -> Result<&str> {
        self.database.url.as_deref().ok_or_else(|| {
            anyhow!(
                "No database URL configured\n\n\
                Set one of:\n  \
                --database-url <url>\n  \
                REVIEWGATE_DATABASE_URL=<url>\n  \
                [database] url = \"<url>\" in {}",
                DEFAULT_CONFIG_FILE
            )
        })
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration")
    }

    fn validate(&self) -> Result<()> {
        validate_identifier(&self.ledger.table).context("Invalid ledger.table")?;
        self.handler.validate()?;
        if self.database.min_connections > self.database.max_connections {
            bail!("database.min_connections cannot exceed database.max_connections");
        }
        Ok(())
    }
}

/// Accepts plain SQL identifiers only, since the ledger table name is spliced into queries
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') || name.len() > 63 {
        bail!("'{}' is not a valid table name", name);
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    database_url: Option<String>,
    config_path: Option<PathBuf>,
    log_level: Option<String>,
}

impl ConfigBuilder {
    pub fn database_url(mut self, url: Option<String>) -> Self {
        self.database_url = url;
        self
    }

    pub fn config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    pub fn log_level(mut self, level: Option<String>) -> Self {
        self.log_level = level;
        self
    }

    pub fn build(self) -> Result<Config> {
        // A missing .env file is fine
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder().add_source(
            config::Config::try_from(&Config::default()).context("Failed to seed defaults")?,
        );

        let explicit_path = self
            .config_path
            .or_else(|| env::var(format!("{}_CONFIG_PATH", ENV_PREFIX)).ok().map(PathBuf::from));

        match explicit_path {
            Some(path) => {
                if !path.exists() {
                    bail!("Config file not found: {}", path.display());
                }
                builder = builder.add_source(toml_file(&path, true));
            }
            None => {
                builder = builder.add_source(toml_file(Path::new(DEFAULT_CONFIG_FILE), false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        if let Ok(url) = env::var(format!("{}_DATABASE_URL", ENV_PREFIX)) {
            builder = builder.set_override("database.url", url)?;
        }
        if let Some(url) = self.database_url {
            builder = builder.set_override("database.url", url)?;
        }
        if let Some(level) = self.log_level {
            builder = builder.set_override("log.level", level)?;
        }

        let config: Config = builder
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }
}

fn toml_file(path: &Path, required: bool) -> File<config::FileSourceFile, FileFormat> {
    File::from(path).format(FileFormat::Toml).required(required)
}
