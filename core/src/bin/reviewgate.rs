/// Reviewgate CLI
///
/// Opens review phases, feeds completion notifications to the handler and
/// inspects the ledger without any surrounding service.

use reviewgate_core::cli;

#[tokio::main]
async fn main() {
    if let Err(e) = cli::run_cli().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
