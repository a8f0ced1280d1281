use clap::Parser;
use link_preview::{load_config, setup_logging, Cli, CliRunner};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Cli::parse();

    // Invalid configuration is fatal before anything else runs
    let config = match load_config(&args).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("link-preview: {e}");
            std::process::exit(1);
        }
    };

    setup_logging(config.log_stats, args.verbose)?;

    info!("Starting link-preview v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Preview format: {}, max concurrent screenshots: {}, navigation timeout: {:?}",
        config.preview_image_format,
        config.max_concurrent_screenshots,
        config.navigation_timeout()
    );

    // Setup graceful shutdown
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx.clone());

    let cli_runner = CliRunner::new(Arc::new(config), shutdown_tx);

    if let Err(e) = cli_runner.run(args.command).await {
        error!("Application error: {:#}", e);
        eprintln!("link-preview: {e:#}");
        std::process::exit(1);
    }

    info!("link-preview stopped");
    Ok(())
}

fn setup_shutdown_handler(
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(());
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("Failed to create SIGTERM handler: {}", e);
            let _ = signal::ctrl_c().await;
            info!("Received SIGINT");
            return;
        }
    };

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = signal::ctrl_c().await;
    info!("Received SIGINT");
}
