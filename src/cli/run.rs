use crate::config::load_config;
use crate::delivery::{random_client_id, DeliveryClient, ZmqTransport};
use crate::pipeline::{request_handoff, watermark_channel, Control, PipelineMessage, Sender, Spooler};
use crate::source::monitor::{monitor_commands, DirectoryMonitor, MonitorCommand, MonitorError};
use crate::storage::StateStore;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("monitor error: {0}")]
    Monitor(#[from] MonitorError),

    #[error("signal handler error: {0}")]
    Signal(#[from] std::io::Error),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub async fn run(
    config_path: Option<PathBuf>,
    state_file: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = match config_path {
        Some(path) => path,
        None => {
            eprintln!("Error: config not found");
            eprintln!("Searched locations:");
            eprintln!("  ~/.config/logship/config.yml");
            eprintln!("  /etc/logship/config.yml");
            eprintln!("\nUse --config <path> to specify a config file, or run 'logship config init' to generate one.");
            std::process::exit(1);
        }
    };

    run_agent(&config_path, state_file).await.map_err(|e| e.into())
}

async fn run_agent(config_path: &Path, state_file: Option<PathBuf>) -> Result<(), RunError> {
    info!(config_path = %config_path.display(), "Loading configuration");
    let mut settings = load_config(config_path)?;
    if let Some(state_file) = state_file {
        settings.state_file = state_file;
    }

    info!(path = %settings.state_file.display(), "Loading state");
    let state = StateStore::load(&settings.state_file);

    let (queue_tx, queue_rx) = watermark_channel(settings.spool.queue_high, settings.spool.queue_low);
    let (request_tx, request_rx) = request_handoff();
    let shutdown = CancellationToken::new();

    let client_id = settings
        .network
        .client_id
        .clone()
        .unwrap_or_else(random_client_id);
    info!(client_id = %client_id, host = %settings.hostname, "Starting delivery client");
    let transport = ZmqTransport::new(settings.network.servers.clone(), client_id);
    let client = DeliveryClient::new(
        transport,
        settings.network.clone(),
        settings.hostname.clone(),
        state.clone(),
        shutdown.clone(),
    );
    let client_handle = tokio::spawn(client.run(request_rx).instrument(info_span!("delivery")));

    let spooler = Spooler::new(settings.spool.clone(), queue_rx, request_tx);
    let spooler_handle = tokio::spawn(spooler.run().instrument(info_span!("spooler")));

    info!(files = settings.files.len(), "Starting collectors");
    let monitor = DirectoryMonitor::start(settings.files, queue_tx.clone(), state)?;
    let (commands, command_rx) = monitor_commands();
    let monitor_handle = tokio::spawn(monitor.run(command_rx).instrument(info_span!("monitor")));

    info!("logship started, press Ctrl+C to shutdown");
    wait_for_shutdown(&commands, &queue_tx).await?;

    info!("Shutdown signal received");
    // From here on a request that cannot be delivered is abandoned after one
    // attempt, so the spooler keeps draining even with the broker down
    shutdown.cancel();
    let _ = commands.send(MonitorCommand::Stop);
    monitor_handle.await?;

    let _ = queue_tx.send(PipelineMessage::Control(Control::Stop)).await;
    drop(queue_tx);
    if let Err(e) = spooler_handle.await? {
        warn!(error = %e, "spooler stopped early");
    }
    client_handle.await?;

    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM. SIGUSR1 flushes held multiline events and the
/// spool buffer without stopping.
#[cfg(unix)]
async fn wait_for_shutdown(
    commands: &UnboundedSender<MonitorCommand>,
    queue: &Sender<PipelineMessage>,
) -> Result<(), RunError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut flush = signal(SignalKind::user_defined1())?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => return result.map_err(RunError::from),
            _ = terminate.recv() => return Ok(()),
            _ = flush.recv() => request_flush(commands, queue),
        }
    }
}

/// Ask collectors and the spooler to emit what they hold. Never waits on the
/// queue, so a stalled pipeline cannot keep the signal loop from seeing Ctrl+C.
#[cfg(unix)]
fn request_flush(commands: &UnboundedSender<MonitorCommand>, queue: &Sender<PipelineMessage>) {
    use tokio::sync::mpsc::error::TrySendError;

    info!("Flush requested");
    let _ = commands.send(MonitorCommand::Flush);
    if let Err(TrySendError::Full(_)) = queue.try_send(PipelineMessage::Control(Control::Flush)) {
        tracing::debug!("event queue full, skipping spooler flush");
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(
    _commands: &UnboundedSender<MonitorCommand>,
    _queue: &Sender<PipelineMessage>,
) -> Result<(), RunError> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
