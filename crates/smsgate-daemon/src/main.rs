//! smsgate entry point

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use smsgate_daemon::{app, config::Config, telegram::TelegramSink};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_logging(&config.log_level)?;
    config.validate()?;

    info!(
        serial_port = %config.serial_port,
        baud_rate = config.baud_rate,
        chat_ids = ?config.chat_ids,
        dry_run = config.dry_run,
        multipart_max_age = ?config.multipart_max_age(),
        telegram_send_timeout = ?config.telegram_send_timeout(),
        network_reg_grace = ?config.network_reg_grace(),
        "starting SMS to Telegram forwarder"
    );
    if config.dry_run {
        warn!("dry-run mode: nothing will be sent to Telegram or deleted from the SIM");
    }

    let sink = TelegramSink::new(&config.telegram_token, config.telegram_send_timeout());

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    app::run(&config, &sink, &cancel).await;
    info!("shut down cleanly");
    Ok(())
}

fn init_logging(filter: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(filter)
        .with_context(|| format!("invalid log level {filter:?}"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    Ok(())
}

/// Trip the cancellation token on SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("received interrupt signal"),
                        _ = sigterm.recv() => info!("received terminate signal"),
                    }
                }
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                    info!("received interrupt signal");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("received interrupt signal");
        }
        info!("shutting down");
        cancel.cancel();
    });
}
