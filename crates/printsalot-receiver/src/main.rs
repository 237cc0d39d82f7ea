//! PrintsAlot receiver
//!
//! Links a local receipt printer to the PrintsAlot relay and prints the jobs
//! it pushes.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{info, warn};

use printsalot_core::tracing_init::{LogOptions, init_tracing};
use printsalot_core::{ConfigStore, DeviceConfig};
use printsalot_receiver::content::ContentResolver;
use printsalot_receiver::job::JobDispatcher;
use printsalot_receiver::printer::{DeviceConnector, EscPosConnector, PrinterSink};
use printsalot_receiver::relay::{RelayClient, RelayConfig, RelayEvent, RelayHandle, SocketIoConnector};
use printsalot_receiver::version::{CURRENT_VERSION, check_for_updates};

#[derive(Parser, Debug)]
#[command(name = "printsalot-receiver")]
#[command(version, about = "PrintsAlot receiver - prints relay jobs on a local receipt printer")]
struct Args {
    /// Config file (default: ~/.printsalot/config.json).
    #[arg(long, env = "PRINTSALOT_CONFIG")]
    config: Option<PathBuf>,

    /// Relay URL for this run; overrides `RELAY_URL` and the config file.
    #[arg(long)]
    relay_url: Option<String>,

    /// Printer to use, saved to the config: `file:/dev/usb/lp0` or
    /// `tcp:192.168.1.50:9100`.
    #[arg(long, env = "PRINTSALOT_DEVICE")]
    device: Option<DeviceConfig>,

    #[arg(long, default_value = "info", env = "PRINTSALOT_LOG_LEVEL")]
    log_level: String,

    #[arg(long, env = "PRINTSALOT_LOG_JSON")]
    log_json: bool,

    /// Append logs to this file instead of stdout.
    #[arg(long, env = "PRINTSALOT_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Check the relay for a newer release and exit.
    #[arg(long)]
    check_update: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_tracing(&LogOptions {
        default_filter: format!(
            "printsalot_receiver={0},printsalot_core={0}",
            args.log_level
        ),
        json: args.log_json,
        file: args.log_file.clone(),
    })?;

    info!(version = CURRENT_VERSION, "Starting printsalot-receiver");

    let config_path = match args.config {
        Some(path) => path,
        None => ConfigStore::default_path()
            .ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?,
    };
    info!(path = %config_path.display(), "Opening config");
    let store = Arc::new(ConfigStore::open(&config_path)?.with_relay_override(args.relay_url));
    if let Some(device) = args.device {
        info!(device = %device, "Saving printer device");
        store.set_device(device)?;
    }

    let http = printsalot_receiver::http_client()?;
    let relay_url = store.relay_url();

    if args.check_update {
        let update = check_for_updates(&http, &relay_url, CURRENT_VERSION).await;
        info!(
            update_available = update.update_available,
            current = %update.current_version,
            latest = ?update.latest_version,
            download_url = ?update.download_url,
            github_url = ?update.github_url,
            is_prerelease = update.is_prerelease,
            "Update check finished"
        );
        return Ok(());
    }

    let connector: Arc<dyn DeviceConnector> = Arc::new(EscPosConnector::new(Arc::clone(&store)));
    let sink = Arc::new(tokio::task::spawn_blocking(move || PrinterSink::new(connector)).await?);

    let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
    let (client, relay) = RelayClient::new(
        SocketIoConnector,
        Arc::clone(&store),
        RelayConfig::default(),
        jobs_tx,
    );
    let dispatcher = JobDispatcher::new(ContentResolver::new(http.clone()), sink, relay.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let relay_task = tokio::spawn(client.run(shutdown_rx));
    let dispatcher_task = tokio::spawn(dispatcher.run(jobs_rx));
    let display_task = tokio::spawn(log_session_events(relay.subscribe(), relay.clone()));

    let update_http = http.clone();
    let update_relay = relay_url.clone();
    tokio::spawn(async move {
        check_for_updates(&update_http, &update_relay, CURRENT_VERSION).await;
    });

    info!(relay_url = %relay_url, linked = store.token().is_some(), "Connecting to relay");
    relay.connect().await?;

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    if let Err(e) = relay.disconnect().await {
        warn!(error = %e, "Disconnect during shutdown failed");
    }
    let _ = shutdown_tx.send(true);
    let _ = relay_task.await;
    // The dispatcher finishes once the relay client has dropped its job
    // sender and every in-flight job is done.
    let _ = dispatcher_task.await;
    display_task.abort();

    info!("Receiver stopped");
    Ok(())
}

/// Surface session changes an operator needs to see, most importantly the
/// pairing code.
async fn log_session_events(mut events: broadcast::Receiver<RelayEvent>, relay: RelayHandle) {
    loop {
        match events.recv().await {
            Ok(RelayEvent::Welcome {
                code: Some(code),
                linked: false,
            }) => {
                info!(code = %code, "Not linked yet. Enter this pairing code in PrintsAlot to link the printer");
            }
            Ok(RelayEvent::Welcome { linked: true, .. } | RelayEvent::TokenIssued) => {
                info!("Printer is linked");
            }
            Ok(RelayEvent::Disconnected) => {
                let state = relay.state();
                if state.should_reconnect {
                    info!(
                        retry_in_secs = state.reconnect_delay.as_secs(),
                        "Relay connection lost"
                    );
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Session event display fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
