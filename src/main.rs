//! adcaster: multi-tenant Telegram ad broadcaster.

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::run().await
}
