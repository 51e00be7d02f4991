use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use l4proxier::config::{Args, SeedFile};
use l4proxier::{LoadBalancer, Proxier};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let balancer = Arc::new(LoadBalancer::new());
    let proxier = Proxier::new(args.bind_address, Arc::clone(&balancer));

    if let Some(seed_path) = &args.seed {
        info!("Loading seed file from {:?}", seed_path);
        let seed = SeedFile::load(seed_path)?;

        balancer.on_update(seed.endpoints_by_service());
        proxier.on_update(seed.services()).await?;

        info!(
            "Applied seed: {} service(s) now active",
            proxier.active_service_count()
        );
    } else {
        info!("No --seed file given; Proxier and LoadBalancer are idle. Drive them via the public API.");
    }

    info!("l4proxier running, waiting for shutdown signal");
    shutdown_signal().await;
    info!("Shutdown signal received, exiting");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
