mod cli;
mod shutdown;

use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;

use codetracer_rr_dispatcher_core::{ControlOp, Direction, Task, TaskId, TaskKind};
use codetracer_rr_dispatcher_engine::dispatcher;
use codetracer_rr_dispatcher_engine::{intake, WorkerPool};

use crate::cli::Cli;
use crate::shutdown::{spawn_ctrl_c_handler, ShutdownController, ShutdownEvent};

/// Channel depth for intake/outbound; bounded so a slow client applies
/// real backpressure rather than growing memory without limit.
const CHANNEL_CAPACITY: usize = 256;

fn init_tracing() {
    let filter = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    init_tracing();

    let config = match cli.router_config() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            return std::process::ExitCode::from(2);
        }
    };

    match run(cli, config).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("fatal: {err:#}");
            std::process::ExitCode::from(3)
        }
    }
}

async fn run(cli: Cli, config: codetracer_rr_dispatcher_core::RouterConfig) -> anyhow::Result<()> {
    let rr_binary = dispatcher::resolve_rr_binary();
    tracing::info!(rr_binary = %rr_binary, trace_path = %cli.trace_path.display(), "starting dispatcher");

    let (task_tx, task_rx) = mpsc::channel::<Task>(CHANNEL_CAPACITY);
    let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (worker_events_tx, worker_events_rx) = mpsc::unbounded_channel();

    let pool = WorkerPool::new(worker_events_tx, rr_binary, cli.trace_path.clone());
    let dispatcher_task = dispatcher::spawn_dispatcher(pool, config, task_rx, worker_events_rx, outbound_tx.clone());

    let shutdown = Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_ctrl_c_handler(shutdown.clone(), shutdown_tx);

    let shutdown_task_tx = task_tx.clone();
    let ctrl_c_forwarder = tokio::spawn(async move {
        match shutdown_rx.recv().await {
            Some(ShutdownEvent::Graceful) => {
                tracing::info!("ctrl-c received; requesting graceful shutdown");
                let shutdown_task = Task::new(TaskId(0), TaskKind::Control(ControlOp::Shutdown), Direction::Forward);
                let _ = shutdown_task_tx.send(shutdown_task).await;
            }
            Some(ShutdownEvent::Immediate) => std::process::exit(130),
            None => {}
        }
    });

    if cli.socket.is_some() {
        run_unix_socket_transport(&cli, task_tx, outbound_tx, outbound_rx).await?;
    } else {
        run_stdio_transport(task_tx, outbound_tx, outbound_rx).await;
    }

    ctrl_c_forwarder.abort();
    dispatcher_task.await.map_err(|err| anyhow::anyhow!("dispatcher task panicked: {err}"))?;
    Ok(())
}

async fn run_stdio_transport(
    task_tx: mpsc::Sender<Task>,
    outbound_tx: mpsc::Sender<codetracer_rr_dispatcher_core::OutboundEvent>,
    outbound_rx: mpsc::Receiver<codetracer_rr_dispatcher_core::OutboundEvent>,
) {
    let inbound = intake::run_inbound(tokio::io::stdin(), task_tx, outbound_tx);
    let outbound = intake::run_outbound(tokio::io::stdout(), outbound_rx);
    let _ = tokio::join!(inbound, outbound);
}

#[cfg(unix)]
async fn run_unix_socket_transport(
    cli: &Cli,
    task_tx: mpsc::Sender<Task>,
    outbound_tx: mpsc::Sender<codetracer_rr_dispatcher_core::OutboundEvent>,
    outbound_rx: mpsc::Receiver<codetracer_rr_dispatcher_core::OutboundEvent>,
) -> anyhow::Result<()> {
    let path = cli.socket.as_ref().expect("checked by caller");
    let _ = std::fs::remove_file(path);
    let listener = tokio::net::UnixListener::bind(path)?;
    tracing::info!(path = %path.display(), "listening on unix socket");
    let (stream, _addr) = listener.accept().await?;
    let (reader, writer) = stream.into_split();
    let inbound = intake::run_inbound(reader, task_tx, outbound_tx);
    let outbound = intake::run_outbound(writer, outbound_rx);
    let _ = tokio::join!(inbound, outbound);
    Ok(())
}

#[cfg(not(unix))]
async fn run_unix_socket_transport(
    _cli: &Cli,
    _task_tx: mpsc::Sender<Task>,
    _outbound_tx: mpsc::Sender<codetracer_rr_dispatcher_core::OutboundEvent>,
    _outbound_rx: mpsc::Receiver<codetracer_rr_dispatcher_core::OutboundEvent>,
) -> anyhow::Result<()> {
    anyhow::bail!("--socket is only supported on unix platforms")
}
