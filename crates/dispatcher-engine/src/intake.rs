//! C1: the two single-direction pipelines between the client transport
//! and the dispatcher. Neither loop touches pool state — they only move
//! bytes and hand off fully-formed values over channels.

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;

use codetracer_rr_dispatcher_core::{DispatchError, OutboundEvent, Task, TaskId};

use crate::protocol::{self, RequestFrame};

/// Reads framed requests until EOF or a transport error, converting each
/// into a [`Task`] and handing it to `task_tx`. Malformed framing or
/// unparseable JSON is logged and the frame dropped; a
/// recognized-but-invalid command gets an immediate failed response
/// instead of being silently dropped, since it names a `seq` the client
/// is waiting on.
pub async fn run_inbound<R>(
    reader: R,
    task_tx: mpsc::Sender<Task>,
    outbound_tx: mpsc::Sender<OutboundEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    loop {
        let body = match protocol::read_frame(&mut reader).await {
            Ok(Some(body)) => body,
            Ok(None) => {
                tracing::info!("client closed the connection; ending intake");
                break;
            }
            Err(err) => {
                tracing::warn!(error = %err, "dropping malformed frame");
                continue;
            }
        };

        let request: RequestFrame = match protocol::parse_request(&body) {
            Ok(req) => req,
            Err(err) => {
                tracing::warn!(error = %err, "dropping unparseable request");
                continue;
            }
        };

        match protocol::task_from_request(&request) {
            Ok(task) => {
                if task_tx.send(task).await.is_err() {
                    tracing::warn!("dispatcher loop gone; ending intake");
                    break;
                }
            }
            Err(err) => {
                let _ = outbound_tx
                    .send(OutboundEvent::Error {
                        task_id: TaskId(request.seq),
                        message: err.to_string(),
                    })
                    .await;
            }
        }
    }
}

/// Drains `events_rx` and writes each as a framed response/event, in the
/// order received. Ordering is per-producer, not global: the dispatcher
/// is responsible for serializing its own sends onto this one channel in
/// the order it wants the client to see them.
pub async fn run_outbound<W>(mut writer: W, mut events_rx: mpsc::Receiver<OutboundEvent>) -> Result<(), DispatchError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = events_rx.recv().await {
        let bytes = protocol::encode_outbound(&event)
            .map_err(|err| DispatchError::Fatal(format!("failed to encode outbound event: {err}")))?;
        protocol::write_frame(&mut writer, &bytes)
            .await
            .map_err(|err| DispatchError::Fatal(format!("client write failed: {err}")))?;
    }
    Ok(())
}
