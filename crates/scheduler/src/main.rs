mod cli;
mod shutdown;

use std::sync::Arc;

use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use taskforge_engine::{start_engine, EngineEvent};

use crate::cli::Cli;
use crate::shutdown::{spawn_ctrl_c_handler, ShutdownController, ShutdownSignal};

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::Started | EngineEvent::Stopped | EngineEvent::StopRequested => {}
        EngineEvent::WorkerConnected { worker_id } => {
            debug!(worker_id, "worker connected");
        }
        EngineEvent::WorkerRegistered { worker_id, pid } => {
            info!(worker_id, pid, "worker registered");
        }
        EngineEvent::WorkerDied {
            worker_id,
            lost_task,
        } => match lost_task {
            Some(task_id) => warn!(worker_id, %task_id, "worker died holding a task"),
            None => info!(worker_id, "worker departed"),
        },
        EngineEvent::TaskSubmitted { task_id } => debug!(%task_id, "task submitted"),
        EngineEvent::TaskAssigned { task_id, worker_id } => {
            debug!(%task_id, worker_id, "task assigned");
        }
        EngineEvent::TaskFinished { task_id } => debug!(%task_id, "task finished"),
        EngineEvent::TaskLost { task_id } => warn!(%task_id, "task lost"),
        EngineEvent::FetchRequested { object_id } => {
            debug!(%object_id, "fetch requested for remote object");
        }
        EngineEvent::ReconstructionStarted { object_id, task_id } => {
            info!(%object_id, %task_id, "reconstructing lost object");
        }
        EngineEvent::Warning { message } => warn!("{message}"),
        EngineEvent::Error { message } => error!("{message}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.engine_config();
    if config.num_workers > 0 && config.worker_command.is_empty() {
        anyhow::bail!("--num-workers > 0 requires --worker-command");
    }
    if let Some(parent) = config.worker_socket.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Fatal initialization failures (socket bind, metadata store
    // unreachable) surface here and exit non-zero.
    let engine = start_engine(config).await?;
    let mut events = engine.subscribe();

    let shutdown = Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel();
    spawn_ctrl_c_handler(shutdown, shutdown_tx);

    loop {
        tokio::select! {
            signal = shutdown_rx.recv() => match signal {
                Some(ShutdownSignal::Graceful) => {
                    info!("stop requested; terminating workers before exit (interrupt again to exit immediately)");
                    engine.request_stop();
                }
                Some(ShutdownSignal::Immediate) => {
                    warn!("second interrupt; exiting immediately");
                    std::process::exit(130);
                }
                None => {}
            },
            event = events.recv() => {
                match event {
                    Ok(EngineEvent::Stopped) => break,
                    Ok(event) => log_event(&event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    engine.wait().await?;
    Ok(())
}
