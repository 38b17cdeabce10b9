//! C4: one proxy per `rr` replay worker process.
//!
//! A bounded command channel feeds a dedicated writer task, and a shared
//! unbounded event channel the pool drains centrally. Capacity 1 on the
//! command channel is what enforces "pipelining is not permitted" — a
//! second `send` simply waits for the first to be taken off the channel.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use codetracer_rr_dispatcher_core::{DispatchError, WorkerId};

/// One line of worker output, after parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerLine {
    Event { tag: String, body: serde_json::Value },
    Ok,
    Err(String),
    Interrupted,
}

fn parse_worker_line(line: &str) -> Result<WorkerLine, DispatchError> {
    let line = line.trim_end();
    if line == "OK" {
        return Ok(WorkerLine::Ok);
    }
    if line == "INTERRUPTED" {
        return Ok(WorkerLine::Interrupted);
    }
    if let Some(rest) = line.strip_prefix("ERR ") {
        return Ok(WorkerLine::Err(rest.to_string()));
    }
    if let Some(rest) = line.strip_prefix("EVT ") {
        let (tag, json) = rest
            .split_once(' ')
            .ok_or_else(|| DispatchError::MalformedFraming(format!("malformed EVT line: {line}")))?;
        let body: serde_json::Value = serde_json::from_str(json)
            .map_err(|err| DispatchError::MalformedFraming(format!("bad EVT json: {err}")))?;
        return Ok(WorkerLine::Event { tag: tag.to_string(), body });
    }
    Err(DispatchError::MalformedFraming(format!("unrecognized worker line: {line}")))
}

/// An event produced by one worker process, tagged with its source so the
/// pool can demultiplex a single shared channel.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Ready { worker: WorkerId },
    Line { worker: WorkerId, line: WorkerLine },
    /// The worker's output was malformed, or a pipe failed outright — the
    /// dispatcher treats either as a fatal worker error.
    ProtocolError { worker: WorkerId, message: String },
    Exited { worker: WorkerId },
}

enum ProxyCommand {
    Send(String),
    Terminate,
}

/// A live handle to a spawned `rr` worker process.
pub struct WorkerProxy {
    pub id: WorkerId,
    cmd_tx: mpsc::Sender<ProxyCommand>,
    pid: u32,
}

/// Scoped ownership wrapper around a [`WorkerProxy`]: `Drop` sends SIGKILL
/// if the handle was never explicitly released, so a worker can't outlive
/// every code path that's supposed to tear it down. `terminate_all` calls
/// `release()` for the graceful SIGTERM-then-SIGKILL sequence; an early
/// `?` return or a panic unwinding through `pool.rs` instead falls through
/// to `Drop`, which only guarantees the process is gone, not gracefully.
pub struct WorkerProxyGuard {
    proxy: Option<WorkerProxy>,
}

impl WorkerProxyGuard {
    pub fn new(proxy: WorkerProxy) -> Self {
        Self { proxy: Some(proxy) }
    }

    pub fn get(&self) -> &WorkerProxy {
        self.proxy.as_ref().expect("guard used after release")
    }

    /// Normal teardown: sends SIGTERM, waits for the writer to drain, then
    /// SIGKILL if the grace period lapses. Consumes the guard so `Drop`
    /// has nothing left to do.
    pub async fn release(mut self, kill_timeout: Duration) {
        if let Some(proxy) = self.proxy.take() {
            proxy.terminate(kill_timeout).await;
        }
    }
}

impl Drop for WorkerProxyGuard {
    fn drop(&mut self) {
        if let Some(proxy) = self.proxy.take() {
            tracing::warn!(worker = %proxy.id, "worker proxy dropped without explicit release; sending SIGKILL");
            unsafe {
                libc::kill(proxy.pid as libc::pid_t, libc::SIGKILL);
            }
        }
    }
}

/// Spawns one worker process and its reader/writer tasks, returning once
/// the worker signals readiness or `start_timeout` elapses.
pub async fn spawn_worker(
    id: WorkerId,
    rr_binary: &str,
    trace_path: &std::path::Path,
    start_timeout: Duration,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
) -> Result<WorkerProxy, DispatchError> {
    let mut child = Command::new(rr_binary)
        .arg("replay")
        .arg(trace_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| DispatchError::WorkerSpawnFailed(err.to_string()))?;

    let pid = child
        .id()
        .ok_or_else(|| DispatchError::WorkerSpawnFailed("child exited before pid was observable".into()))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| DispatchError::WorkerSpawnFailed("no stdin pipe".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| DispatchError::WorkerSpawnFailed("no stdout pipe".into()))?;

    let (cmd_tx, cmd_rx) = mpsc::channel::<ProxyCommand>(1);
    let (ready_tx, ready_rx) = oneshot::channel::<()>();

    tokio::spawn(run_writer(id, stdin, cmd_rx, child));
    tokio::spawn(run_reader(id, stdout, events_tx, ready_tx));

    timeout(start_timeout, ready_rx)
        .await
        .map_err(|_| DispatchError::WorkerSpawnFailed(format!("worker {id} did not become ready in time")))?
        .map_err(|_| DispatchError::WorkerSpawnFailed(format!("worker {id} exited before becoming ready")))?;

    Ok(WorkerProxy { id, cmd_tx, pid })
}

async fn run_reader(
    id: WorkerId,
    stdout: tokio::process::ChildStdout,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    ready_tx: oneshot::Sender<()>,
) {
    let mut reader = BufReader::new(stdout).lines();
    let mut ready_tx = Some(ready_tx);

    loop {
        match reader.next_line().await {
            Ok(Some(line)) => {
                if line.trim() == "READY" {
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(());
                    }
                    let _ = events_tx.send(WorkerEvent::Ready { worker: id });
                    continue;
                }
                match parse_worker_line(&line) {
                    Ok(parsed) => {
                        let _ = events_tx.send(WorkerEvent::Line { worker: id, line: parsed });
                    }
                    Err(err) => {
                        let _ = events_tx.send(WorkerEvent::ProtocolError {
                            worker: id,
                            message: err.to_string(),
                        });
                        break;
                    }
                }
            }
            Ok(None) => break,
            Err(err) => {
                let _ = events_tx.send(WorkerEvent::ProtocolError {
                    worker: id,
                    message: err.to_string(),
                });
                break;
            }
        }
    }
    let _ = events_tx.send(WorkerEvent::Exited { worker: id });
}

async fn run_writer(
    _id: WorkerId,
    mut stdin: tokio::process::ChildStdin,
    mut cmd_rx: mpsc::Receiver<ProxyCommand>,
    mut child: Child,
) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            ProxyCommand::Send(line) => {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
            ProxyCommand::Terminate => {
                drop(stdin);
                break;
            }
        }
    }
    let _ = child.wait().await;
}

impl WorkerProxy {
    /// Serializes one command line to the worker. A second call before the
    /// first is drained simply waits, which is how the one-outstanding-
    /// command rule is enforced.
    pub async fn send(&self, command: &str) -> Result<(), DispatchError> {
        self.cmd_tx
            .send(ProxyCommand::Send(command.to_string()))
            .await
            .map_err(|_| DispatchError::WorkerFailed {
                worker: self.id,
                task_id: codetracer_rr_dispatcher_core::TaskId(0),
                message: "worker writer task is gone".to_string(),
            })
    }

    /// Sends SIGTERM and waits up to `kill_timeout` before SIGKILL.
    pub async fn terminate(&self, kill_timeout: Duration) {
        unsafe {
            libc::kill(self.pid as libc::pid_t, libc::SIGTERM);
        }
        let _ = timeout(kill_timeout, self.cmd_tx.send(ProxyCommand::Terminate)).await;
        unsafe {
            libc::kill(self.pid as libc::pid_t, libc::SIGKILL);
        }
    }

    /// Attempts a graceful interrupt by sending SIGINT; the caller awaits
    /// the worker's `INTERRUPTED`/`OK` line on the shared event channel
    /// with its own `cancel_timeout_ms` grace period.
    pub fn interrupt(&self) {
        unsafe {
            libc::kill(self.pid as libc::pid_t, libc::SIGINT);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_terminal_lines() {
        assert_eq!(parse_worker_line("OK").unwrap(), WorkerLine::Ok);
        assert_eq!(parse_worker_line("INTERRUPTED").unwrap(), WorkerLine::Interrupted);
        assert_eq!(
            parse_worker_line("ERR bad location").unwrap(),
            WorkerLine::Err("bad location".to_string())
        );
    }

    #[test]
    fn parses_event_lines() {
        let parsed = parse_worker_line(r#"EVT location {"file":"a.rs","line":3}"#).unwrap();
        match parsed {
            WorkerLine::Event { tag, body } => {
                assert_eq!(tag, "location");
                assert_eq!(body["line"], 3);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn rejects_unrecognized_line() {
        assert!(parse_worker_line("garbage").is_err());
    }

    #[tokio::test]
    async fn spawn_worker_fails_fast_on_missing_binary() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = spawn_worker(
            WorkerId(1),
            "/nonexistent/rr-binary-for-tests",
            std::path::Path::new("/tmp"),
            Duration::from_millis(200),
            tx,
        )
        .await;
        assert!(result.is_err());
    }
}
