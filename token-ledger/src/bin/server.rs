//! Token ledger server binary

use std::sync::Arc;
use token_ledger::{ChannelSubscriber, Config, Ledger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting token ledger server");

    // Load configuration
    let config = Config::from_env()?;

    // Open ledger
    let ledger = Ledger::open(config).await?;
    tracing::info!("Ledger opened successfully");

    // Wire the downstream collaborators; the transport layer owns the real
    // cache and leaderboard consumers, this process just drains the feed.
    let (subscriber, mut updates) = ChannelSubscriber::new("balance-feed", 1024);
    ledger.subscribe(Arc::new(subscriber));

    let feed = tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            tracing::info!(
                account_id = %update.account_id,
                balance = %update.balance,
                version = update.version,
                "Balance changed"
            );
        }
    });

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down token ledger server");
    ledger.shutdown().await;
    feed.abort();

    Ok(())
}
