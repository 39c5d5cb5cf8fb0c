//! IPC frames between the pool and its worker processes
//!
//! Frames are length-prefixed JSON (4-byte big-endian length, then the
//! serialized message) flowing over the worker's stdio pipes: requests down
//! stdin, replies up stdout. The parent side reads and writes
//! asynchronously; the worker side uses blocking std I/O.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::context::ResponseMeta;
use crate::execution::ExecutionError;
use crate::protocol::AlgorithmContext;

/// Upper bound for one frame; anything larger is a protocol violation.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Message sent from the pool into a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum WorkerRequest {
    /// Execute one task
    Task(TaskMessage),
    /// Drain and exit cleanly
    Stop,
}

/// One task as shipped across the process boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TaskMessage {
    pub task_id: u64,
    /// Entrypoint reference: registry key, resolved in the worker
    pub name: String,
    pub version: String,
    pub payload: Value,
    pub hyperparams: Option<Value>,
    pub request_id: String,
    pub trace_id: Option<String>,
    pub context: Option<AlgorithmContext>,
    pub request_datetime: DateTime<Utc>,
    /// Reuse a cached instance in the worker
    pub stateful: bool,
}

/// Message sent from a worker back to the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum WorkerReply {
    /// Startup handshake; the worker is ready to claim tasks
    Ready(ReadyMessage),
    /// Terminal outcome for one task
    Result(TaskResultMessage),
}

/// Worker readiness handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ReadyMessage {
    pub pid: u32,
}

/// Terminal outcome of one task, produced inside the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TaskResultMessage {
    pub task_id: u64,
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<ExecutionError>,
    pub response_meta: Option<ResponseMeta>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub pid: u32,
}

/// Write one frame to an async pipe.
pub(crate) async fn write_frame_async<T, W>(writer: &mut W, message: &T) -> std::io::Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(message)?;
    let len = u32::try_from(body.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too large"))?;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too large",
        ));
    }
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

/// Read one frame from an async pipe; `Ok(None)` on clean EOF.
pub(crate) async fn read_frame_async<T, R>(reader: &mut R) -> std::io::Result<Option<T>>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too large",
        ));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Write one frame to a blocking pipe (worker side).
pub(crate) fn write_frame<T, W>(writer: &mut W, message: &T) -> std::io::Result<()>
where
    T: Serialize,
    W: std::io::Write,
{
    let body = serde_json::to_vec(message)?;
    let len = u32::try_from(body.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too large"))?;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too large",
        ));
    }
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()
}

/// Read one frame from a blocking pipe (worker side); `Ok(None)` on EOF.
pub(crate) fn read_frame<T, R>(reader: &mut R) -> std::io::Result<Option<T>>
where
    T: DeserializeOwned,
    R: std::io::Read,
{
    let mut len_buf = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut len_buf) {
        return if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Ok(None)
        } else {
            Err(e)
        };
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too large",
        ));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sync_frames_roundtrip_and_signal_eof() {
        let message = WorkerRequest::Task(TaskMessage {
            task_id: 7,
            name: "double".into(),
            version: "v1".into(),
            payload: json!({"value": 21}),
            hyperparams: None,
            request_id: "r1".into(),
            trace_id: Some("t1".into()),
            context: None,
            request_datetime: Utc::now(),
            stateful: false,
        });

        let mut buf = Vec::new();
        write_frame(&mut buf, &message).unwrap();
        write_frame(&mut buf, &WorkerRequest::Stop).unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        match read_frame::<WorkerRequest, _>(&mut cursor).unwrap() {
            Some(WorkerRequest::Task(task)) => {
                assert_eq!(task.task_id, 7);
                assert_eq!(task.payload, json!({"value": 21}));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(matches!(
            read_frame::<WorkerRequest, _>(&mut cursor).unwrap(),
            Some(WorkerRequest::Stop)
        ));
        assert!(read_frame::<WorkerRequest, _>(&mut cursor)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn async_reader_accepts_sync_writer_output() {
        let mut buf = Vec::new();
        write_frame(
            &mut buf,
            &WorkerReply::Ready(ReadyMessage { pid: 1234 }),
        )
        .unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let frame = read_frame_async::<WorkerReply, _>(&mut cursor).await.unwrap();
        assert!(matches!(
            frame,
            Some(WorkerReply::Ready(ReadyMessage { pid: 1234 }))
        ));
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &WorkerRequest::Stop).unwrap();
        buf.truncate(buf.len() - 1);

        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame::<WorkerRequest, _>(&mut cursor).is_err());
    }
}
