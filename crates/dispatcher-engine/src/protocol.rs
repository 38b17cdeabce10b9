//! C1's wire format: `Content-Length: N\r\n\r\n` framed JSON.
//!
//! Two free functions do the framing, independent of the dispatcher's
//! control flow.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use codetracer_rr_dispatcher_core::{
    ControlOp, Direction, DispatchError, JumpOp, InfoOp, OutboundEvent, StepOp, Task, TaskId,
    TaskKind, TargetLocation, TracepointOp,
};

const HEADER_PREFIX: &str = "Content-Length: ";

/// An incoming request frame: carries `seq`, `command`, and `arguments`.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestFrame {
    pub seq: u64,
    pub command: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// An outgoing response frame ("responses carry `request_seq`, `success`,
/// `message?`, `body?`").
#[derive(Debug, Clone, Serialize)]
pub struct ResponseFrame {
    pub request_seq: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

/// An outgoing event frame ("events carry `event` and `body`").
#[derive(Debug, Clone, Serialize)]
pub struct EventFrame {
    pub event: String,
    pub body: serde_json::Value,
}

/// Reads exactly one `Content-Length`-framed body from `reader`.
///
/// Returns `Ok(None)` on a clean EOF before any header bytes are read
/// (the normal way intake learns the client hung up); any other failure
/// is a [`DispatchError::MalformedFraming`].
pub async fn read_frame<R>(reader: &mut BufReader<R>) -> Result<Option<Vec<u8>>, DispatchError>
where
    R: AsyncRead + Unpin,
{
    let mut header_line = String::new();
    loop {
        header_line.clear();
        let n = reader
            .read_line(&mut header_line)
            .await
            .map_err(|err| DispatchError::MalformedFraming(err.to_string()))?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = header_line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            // A bare blank line before any header is not valid framing,
            // but we tolerate it between frames defensively.
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix(HEADER_PREFIX) {
            let len: usize = rest
                .trim()
                .parse()
                .map_err(|_| DispatchError::MalformedFraming(format!("bad Content-Length: {rest}")))?;

            // Consume the blank line separating header from body.
            let mut blank = String::new();
            reader
                .read_line(&mut blank)
                .await
                .map_err(|err| DispatchError::MalformedFraming(err.to_string()))?;
            if !blank.trim_end_matches(['\r', '\n']).is_empty() {
                return Err(DispatchError::MalformedFraming(
                    "expected blank line after Content-Length header".to_string(),
                ));
            }

            let mut body = vec![0u8; len];
            reader
                .read_exact(&mut body)
                .await
                .map_err(|err| DispatchError::MalformedFraming(err.to_string()))?;
            return Ok(Some(body));
        }
        return Err(DispatchError::MalformedFraming(format!(
            "unrecognized header line: {trimmed}"
        )));
    }
}

/// Writes one framed body to `writer`.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = format!("{HEADER_PREFIX}{}\r\n\r\n", body.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

/// Parses a raw frame body into a [`RequestFrame`].
pub fn parse_request(body: &[u8]) -> Result<RequestFrame, DispatchError> {
    serde_json::from_slice(body).map_err(|err| DispatchError::ParseError(err.to_string()))
}

fn arg_str(args: &serde_json::Value, key: &str) -> Option<String> {
    args.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn arg_u64(args: &serde_json::Value, key: &str) -> Option<u64> {
    args.get(key).and_then(|v| v.as_u64())
}

fn arg_bool(args: &serde_json::Value, key: &str, default: bool) -> bool {
    args.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
}

/// Converts one request frame into a [`Task`]. The client's own `seq`
/// becomes the task's id directly — unique per connection and monotone,
/// which is all `task_id` requires; internal reserve/reposition tasks get
/// ids from a disjoint range allocated by the pool (`pool::is_internal_task_id`).
pub fn task_from_request(req: &RequestFrame) -> Result<Task, DispatchError> {
    let task_id = TaskId(req.seq);
    let args = &req.arguments;

    let reverse_prefix = "reverse-";
    let (command, reverse) = if let Some(stripped) = req.command.strip_prefix(reverse_prefix) {
        (stripped, true)
    } else {
        (req.command.as_str(), false)
    };

    let direction = if reverse {
        Direction::Reverse
    } else {
        Direction::Forward
    };

    let kind = match command {
        "step-in" => TaskKind::Step { op: StepOp::StepIn, reverse },
        "step-over" => TaskKind::Step { op: StepOp::StepOver, reverse },
        "step-out" => TaskKind::Step { op: StepOp::StepOut, reverse },
        "next" => TaskKind::Step { op: StepOp::Next, reverse },
        "continue" => TaskKind::Step { op: StepOp::Continue, reverse },

        "goto-tick" => TaskKind::Jump(JumpOp::GotoTick),
        "goto-location" => TaskKind::Jump(JumpOp::GotoLocation),
        "run-to-entry" => TaskKind::Jump(JumpOp::RunToEntry),

        "locals" => TaskKind::Info(InfoOp::Locals),
        "stack-trace" => TaskKind::Info(InfoOp::StackTrace),
        "evaluate" => TaskKind::Info(InfoOp::Evaluate),
        "read-source" => TaskKind::Info(InfoOp::ReadSource),
        "calltrace-window" => TaskKind::Info(InfoOp::CalltraceWindow),
        "events-window" => TaskKind::Info(InfoOp::EventsWindow),
        "flow" => TaskKind::Info(InfoOp::Flow),

        "set-tracepoint" => TaskKind::Tracepoint(TracepointOp::SetTracepoint),
        "clear-tracepoint" => TaskKind::Tracepoint(TracepointOp::ClearTracepoint),
        "run-tracepoints" => TaskKind::Tracepoint(TracepointOp::RunTracepoints),

        "configure" => TaskKind::Control(ControlOp::Configure),
        "full-reset" => TaskKind::Control(ControlOp::FullReset {
            reset_last_location: arg_bool(args, "reset_last_location", false),
        }),
        "cancel" => {
            let target = arg_u64(args, "task_id")
                .ok_or_else(|| DispatchError::InvalidArguments("cancel requires task_id".into()))?;
            TaskKind::Control(ControlOp::Cancel { task_id: TaskId(target) })
        }
        "shutdown" => TaskKind::Control(ControlOp::Shutdown),

        other => return Err(DispatchError::UnknownCommand(other.to_string())),
    };

    let target_location = if let Some(tick) = arg_u64(args, "tick") {
        Some(TargetLocation::Tick(tick))
    } else if let (Some(file), Some(line)) = (arg_str(args, "file"), arg_u64(args, "line")) {
        Some(TargetLocation::FileLine { file, line: line as u32 })
    } else {
        arg_u64(args, "byte_offset").map(TargetLocation::ByteOffset)
    };

    let mut task = Task::new(task_id, kind, direction);
    task.target_location = target_location;
    if !args.is_null() {
        task.payload = Some(serde_json::to_vec(args).unwrap_or_default());
    }
    Ok(task)
}

/// Renders an [`OutboundEvent`] as the wire frame bytes to send to the
/// client: terminal/task-correlated events become a `ResponseFrame`,
/// unsolicited and fatal events become an `EventFrame`.
pub fn encode_outbound(event: &OutboundEvent) -> Result<Vec<u8>, serde_json::Error> {
    match event {
        OutboundEvent::TaskOk { task_id, body } => serde_json::to_vec(&ResponseFrame {
            request_seq: task_id.0,
            success: true,
            message: None,
            body: Some(body.clone()),
        }),
        OutboundEvent::Cancelled { task_id } => serde_json::to_vec(&ResponseFrame {
            request_seq: task_id.0,
            success: false,
            message: Some("Cancelled".to_string()),
            body: None,
        }),
        OutboundEvent::WorkerFailed { task_id, message } => serde_json::to_vec(&ResponseFrame {
            request_seq: task_id.0,
            success: false,
            message: Some(format!("WorkerFailed: {message}")),
            body: None,
        }),
        OutboundEvent::Error { task_id, message } => serde_json::to_vec(&ResponseFrame {
            request_seq: task_id.0,
            success: false,
            message: Some(message.clone()),
            body: None,
        }),
        OutboundEvent::Progress { task_id, message } => serde_json::to_vec(&EventFrame {
            event: "progress".to_string(),
            body: serde_json::json!({ "task_id": task_id.0, "message": message }),
        }),
        OutboundEvent::Unsolicited { synthetic_id, tag, body } => serde_json::to_vec(&EventFrame {
            event: tag.clone(),
            body: serde_json::json!({ "synthetic_id": synthetic_id, "body": body }),
        }),
        OutboundEvent::Fatal { message } => serde_json::to_vec(&EventFrame {
            event: "fatal".to_string(),
            body: serde_json::json!({ "message": message }),
        }),
    }
}
