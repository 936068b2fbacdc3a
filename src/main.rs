use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use paycore::bootstrap;
use paycore::config::Config;

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,paycore=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!("starting settlement worker");

    dotenv::dotenv().ok();
    let config = Config::from_env()?;

    let context = bootstrap::initialize_worker(config).await?;
    let handles = context.scheduler.start();
    info!("settlement worker running");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping background loops");
    for handle in handles {
        handle.abort();
    }

    Ok(())
}
