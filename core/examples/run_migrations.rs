use reviewgate_core::InitBuilder;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("Running database migrations...");

    let app = InitBuilder::new().auto_migrate(true).init().await?;

    println!("✓ Migrations completed, ledger table '{}'", app.ledger.table());
    Ok(())
}
