pub mod application;
pub mod cli;
pub mod clients;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod ledger;
pub mod logging;
pub mod notification;
pub mod types;

#[cfg(test)]
mod test_helpers;

// Re-export main types
pub use types::*;

pub use application::{initialize, Application, InitBuilder, InitOptions};
pub use dispatch::{Dispatch, ReviewDispatcher, SubtaskSpec};
pub use error::{BarrierError, ClientError, LedgerError};
pub use handler::{CompletionHandler, HandleOutcome};
pub use notification::{CompletionNotification, SubtaskId};
