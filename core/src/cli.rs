use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::application::{initialize_with, Application};
use crate::config::Config;
use crate::dispatch::{Dispatch, SubtaskSpec};
use crate::handler::CompletionHandler;
use crate::logging;
use crate::notification::CompletionNotification;

#[derive(Parser)]
#[command(name = "reviewgate")]
#[command(about = "Reviewgate - Completion barrier for fan-out human review", long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default search)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Database URL (overrides config file and env vars)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run migrations and create the ledger table
    Migrate,

    /// Process one completion notification
    Handle {
        /// Notification JSON, or a bare subtask identifier
        notification: String,
    },

    /// Process JSON-lines notifications from stdin until EOF
    Listen,

    /// Open the review phase of an execution
    Open {
        /// Execution ID
        execution_id: String,

        /// Continuation token (generated when omitted)
        #[arg(short = 't', long = "token")]
        token: Option<String>,

        /// Number of subtasks, identified by 1-based index
        #[arg(short = 'n', long = "subtasks", conflicts_with = "suffix")]
        subtasks: Option<usize>,

        /// Explicit subtask suffix (repeatable)
        #[arg(short = 's', long = "suffix")]
        suffix: Vec<String>,
    },

    /// Show outstanding subtasks of an execution
    Status {
        /// Execution ID to query
        execution_id: String,
    },

    /// Print the effective configuration
    Config,
}

/// Run the CLI by parsing process arguments
pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    run_cli_with_args(cli).await
}

/// Run the CLI with provided arguments
pub async fn run_cli_from_args(args: Vec<String>) -> Result<()> {
    let cli = Cli::parse_from(args);
    run_cli_with_args(cli).await
}

async fn run_cli_with_args(cli: Cli) -> Result<()> {
    // Load and validate configuration before any command runs
    let config = Config::builder()
        .database_url(cli.database_url)
        .config_path(cli.config)
        .build()?;
    logging::init(&config.log.level);

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }

        Commands::Migrate => {
            initialize_with(config, true).await?;
            println!("✓ Migrations completed");
        }

        Commands::Handle { notification } => {
            let app = initialize_with(config, false).await?;
            let notification = CompletionNotification::from_input(&notification)?;
            let outcome = app.handler.handle(&notification).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }

        Commands::Listen => {
            // One database connection per in-flight notification at most
            let max_in_flight = config.database.max_connections as usize;
            let app = initialize_with(config, false).await?;
            let summary = listen(&app.handler, BufReader::new(tokio::io::stdin()), max_in_flight)
                .await?;
            if !summary.failed.is_empty() {
                bail!(
                    "{} notification(s) failed: {}",
                    summary.failed.len(),
                    summary.failed.join(", ")
                );
            }
        }

        Commands::Open {
            execution_id,
            token,
            subtasks,
            suffix,
        } => {
            let app = initialize_with(config, false).await?;
            open(&app, &execution_id, token, subtasks, suffix).await?;
        }

        Commands::Status { execution_id } => {
            let app = initialize_with(config, false).await?;
            let status = app.status(&execution_id).await?;

            if status.is_closed() {
                println!("Execution {} has nothing outstanding", execution_id);
                return Ok(());
            }

            println!("Execution: {}", status.execution_id);
            println!("Awaiting resume: {}", status.awaiting_resume);
            println!("Outstanding subtasks: {}", status.outstanding.len());
            for id in &status.outstanding {
                println!("  {}", id);
            }
        }
    }

    Ok(())
}

async fn open(
    app: &Application,
    execution_id: &str,
    token: Option<String>,
    subtasks: Option<usize>,
    suffixes: Vec<String>,
) -> Result<()> {
    let specs: Vec<SubtaskSpec> = match subtasks {
        Some(count) => (0..count).map(|_| SubtaskSpec::new(json!({}))).collect(),
        None if suffixes.is_empty() => bail!("Pass --subtasks <N> or at least one --suffix"),
        None => suffixes
            .into_iter()
            .map(|s| SubtaskSpec::with_suffix(s, json!({})))
            .collect(),
    };
    let token = token.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    match app.dispatcher.open_review(execution_id, &token, specs).await? {
        Dispatch::Opened(ids) => {
            println!("✓ Review opened for {} (token {})", execution_id, token);
            for id in ids {
                println!("  {}", id);
            }
        }
        Dispatch::Skipped => {
            println!("✓ No subtasks, workflow {} resumed", execution_id);
        }
    }
    Ok(())
}

/// Notifications processed by `listen`
#[derive(Debug, Default)]
pub struct ListenSummary {
    pub processed: usize,
    /// Subtask identifiers whose handling still failed after retries
    pub failed: Vec<String>,
}

/// One task per line, at most `max_in_flight` at a time
///
/// Retryable failures are retried in-process; anything still failing is
/// reported by subtask identifier. Returns once input is exhausted and every
/// task has finished.
pub async fn listen<R>(
    handler: &CompletionHandler,
    input: R,
    max_in_flight: usize,
) -> Result<ListenSummary>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let permits = Arc::new(Semaphore::new(max_in_flight.max(1)));
    let mut tasks = JoinSet::new();
    let mut summary = ListenSummary::default();
    let mut input_open = true;

    info!(max_in_flight, "Listening for notifications");

    while input_open || !tasks.is_empty() {
        tokio::select! {
            line = lines.next_line(), if input_open => {
                match line.context("Failed to read input")? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => match CompletionNotification::from_input(&line) {
                        Ok(notification) => {
                            let permit = permits
                                .clone()
                                .acquire_owned()
                                .await
                                .context("Concurrency limit closed")?;
                            let handler = handler.clone();
                            tasks.spawn(async move {
                                let result = handler.handle_retrying(&notification).await;
                                drop(permit);
                                (notification.subtask_id, result)
                            });
                        }
                        Err(err) => warn!(error = %err, "Skipping malformed notification"),
                    },
                    None => input_open = false,
                }
            }
            Some(joined) = tasks.join_next() => {
                summary.processed += 1;
                match joined {
                    Ok((_, Ok(outcome))) => println!("{}", serde_json::to_string(&outcome)?),
                    Ok((subtask_id, Err(err))) => {
                        error!(
                            subtask_id,
                            retryable = err.is_retryable(),
                            error = %err,
                            "Notification failed"
                        );
                        summary.failed.push(subtask_id);
                    }
                    Err(err) => error!(error = %err, "Handler task panicked"),
                }
            }
        }
    }

    if summary.failed.is_empty() {
        info!(processed = summary.processed, "Input closed, all notifications processed");
    } else {
        warn!(
            processed = summary.processed,
            failed = summary.failed.len(),
            "Input closed, some notifications need redelivery"
        );
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_open_with_suffixes() {
        let cli = Cli::parse_from([
            "reviewgate", "open", "exec-1", "--token", "t1", "-s", "a", "-s", "b",
        ]);
        match cli.command {
            Commands::Open {
                execution_id,
                token,
                subtasks,
                suffix,
            } => {
                assert_eq!(execution_id, "exec-1");
                assert_eq!(token.as_deref(), Some("t1"));
                assert_eq!(subtasks, None);
                assert_eq!(suffix, vec!["a", "b"]);
            }
            _ => panic!("expected open"),
        }
    }

    #[test]
    fn test_subtasks_conflicts_with_suffix() {
        let result = Cli::try_parse_from([
            "reviewgate", "open", "exec-1", "--subtasks", "2", "--suffix", "a",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "reviewgate",
            "handle",
            "exec-1-a",
            "--database-url",
            "postgres://localhost/review",
        ]);
        assert_eq!(cli.database_url.as_deref(), Some("postgres://localhost/review"));
        assert!(matches!(cli.command, Commands::Handle { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_listen_reports_failures_by_subtask() {
        use crate::ledger::MemoryLedger;
        use crate::test_helpers::*;

        let memory = MemoryLedger::new();
        seed_execution(&memory, "E1", &["a", "b"], "token-E1").await;
        seed_execution(&memory, "E2", &["a"], "token-E2").await;
        let ledger = FlakyLedger::new(memory.clone());
        let resumer = RecordingResumer::new();
        let handler = handler_with(ledger.clone(), RecordingReviewService::new(), resumer.clone());

        let input = concat!(
            "{\"subtaskIdentifier\": \"E1-a\"}\n",
            "\n",
            "E1-b\n",
            "{\"detail\": {\"humanLoopName\": \"E2-a\"}}\n",
            "{not json\n",
            "no_separator\n",
        );
        let summary = listen(&handler, input.as_bytes(), 2).await.unwrap();

        assert_eq!(summary.processed, 4);
        assert_eq!(summary.failed, vec!["no_separator"]);
        assert_eq!(resumer.delivered().len(), 2);
        assert!(memory.is_empty().await);
    }

    #[tokio::test]
    async fn test_listen_names_subtasks_that_exhaust_retries() {
        use crate::ledger::MemoryLedger;
        use crate::test_helpers::*;

        let memory = MemoryLedger::new();
        seed_execution(&memory, "E1", &["a", "b"], "token-E1").await;
        let ledger = FlakyLedger::new(memory.clone());
        ledger.fail_scans(true);
        let handler = handler_with(
            ledger.clone(),
            RecordingReviewService::new(),
            RecordingResumer::new(),
        );

        let summary = listen(&handler, "E1-a\nE1-b\n".as_bytes(), 1).await.unwrap();

        assert_eq!(summary.processed, 2);
        let mut failed = summary.failed;
        failed.sort();
        assert_eq!(failed, vec!["E1-a", "E1-b"]);
    }
}
