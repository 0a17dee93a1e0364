//! Wire protocol shared by worker and object-store sockets.
//!
//! Every frame is `{type: u8, length: u64 LE, payload}`. Payloads are either
//! raw object-id bytes, a serialized [`TaskSpec`], or a small JSON record;
//! the frame type decides which. Ids and specs are validated on decode — a
//! malformed frame surfaces as a [`FrameError`] and the peer is treated as
//! dead by the engine.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::ids::{ActorId, ObjectId, ID_LEN};
use crate::task::TaskSpec;

/// Upper bound on a single frame's payload. Larger frames are rejected
/// without being read.
pub const MAX_FRAME_LEN: u64 = 16 * 1024 * 1024;

const HEADER_LEN: usize = 1 + 8;

/// Frame type tags. Workers send the first block, the engine emits the
/// second, and the object store speaks the third.
pub mod kind {
    /// Worker → engine: registration (pid, optional actor id).
    pub const REGISTER_WORKER: u8 = 1;
    /// Worker → engine: submit a task spec.
    pub const SUBMIT_TASK: u8 = 2;
    /// Worker → engine: idle, blocked until an assignment arrives.
    pub const GET_TASK: u8 = 3;
    /// Worker → engine: current task finished.
    pub const TASK_DONE: u8 = 4;
    /// Worker → engine: an input object could not be fetched.
    pub const RECONSTRUCT_OBJECT: u8 = 5;
    /// Worker → engine: no longer blocked on a missing object.
    pub const NOTIFY_UNBLOCKED: u8 = 6;
    /// Worker → engine: clean departure.
    pub const DISCONNECT: u8 = 7;

    /// Engine → worker: execute this spec.
    pub const EXECUTE_TASK: u8 = 8;
    /// Engine → worker: finish up and exit (graceful kill).
    pub const TERMINATE_WORKER: u8 = 9;

    /// Object store → engine: object became resident on this node.
    pub const OBJECT_SEALED: u8 = 16;
    /// Object store → engine: object was evicted from this node.
    pub const OBJECT_EVICTED: u8 = 17;
    /// Engine → object store manager: pull a remote copy.
    pub const FETCH_OBJECT: u8 = 18;
}

/// Decode/transport failure on a framed socket.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Closed,
    /// Transport error.
    #[error("i/o error: {0}")]
    Io(std::io::Error),
    /// The advertised payload length exceeds [`MAX_FRAME_LEN`].
    #[error("frame payload of {0} bytes exceeds limit")]
    Oversized(u64),
    /// The frame type is not valid for this channel.
    #[error("unknown or unexpected message type {0}")]
    UnknownType(u8),
    /// The payload did not parse for the given frame type.
    #[error("malformed {kind} payload: {reason}")]
    Malformed {
        /// Human-readable frame kind.
        kind: &'static str,
        /// Parse failure detail.
        reason: String,
    },
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::Closed
        } else {
            FrameError::Io(err)
        }
    }
}

/// A message that can be carried in a single frame.
pub trait Message: Sized {
    /// Frame type tag and payload bytes.
    fn encode(&self) -> (u8, Vec<u8>);
    /// Parse a frame of the given type.
    fn decode(kind: u8, payload: &[u8]) -> Result<Self, FrameError>;
}

/// Read one raw frame: `(type, payload)`.
pub async fn read_frame<R>(reader: &mut R) -> Result<(u8, Vec<u8>), FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let kind = header[0];
    let len = u64::from_le_bytes(header[1..].try_into().expect("8-byte length"));
    if len > MAX_FRAME_LEN {
        return Err(FrameError::Oversized(len));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok((kind, payload))
}

/// Write one raw frame.
pub async fn write_frame<W>(writer: &mut W, kind: u8, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.push(kind);
    buf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    buf.extend_from_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and decode one typed message.
pub async fn read_message<R, M>(reader: &mut R) -> Result<M, FrameError>
where
    R: AsyncRead + Unpin,
    M: Message,
{
    let (kind, payload) = read_frame(reader).await?;
    M::decode(kind, &payload)
}

/// Encode and write one typed message.
pub async fn write_message<W, M>(writer: &mut W, message: &M) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    M: Message,
{
    let (kind, payload) = message.encode();
    write_frame(writer, kind, &payload).await
}

fn parse_oid(kind: &'static str, payload: &[u8]) -> Result<ObjectId, FrameError> {
    let bytes: [u8; ID_LEN] = payload.try_into().map_err(|_| FrameError::Malformed {
        kind,
        reason: format!("expected {ID_LEN} id bytes, got {}", payload.len()),
    })?;
    Ok(ObjectId::from_bytes(bytes))
}

fn parse_spec(kind: &'static str, payload: &[u8]) -> Result<TaskSpec, FrameError> {
    TaskSpec::from_bytes(payload).map_err(|err| FrameError::Malformed {
        kind,
        reason: err.to_string(),
    })
}

#[derive(Serialize, Deserialize)]
struct RegisterPayload {
    pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    actor: Option<ActorId>,
}

/// Messages a worker sends to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerRequest {
    /// Registration carrying the worker's pid and optional actor binding.
    Register {
        /// OS process id of the worker.
        pid: u32,
        /// Actor this worker hosts, if any.
        actor: Option<ActorId>,
    },
    /// Submit a task for scheduling.
    Submit(TaskSpec),
    /// The worker is idle and waits for an assignment.
    GetTask,
    /// The current assignment finished (successfully or not).
    TaskDone,
    /// An input object could not be fetched; trigger reconstruction.
    Reconstruct(ObjectId),
    /// The worker is no longer blocked on a missing object.
    NotifyUnblocked,
    /// Clean departure.
    Disconnect,
}

impl Message for WorkerRequest {
    fn encode(&self) -> (u8, Vec<u8>) {
        match self {
            WorkerRequest::Register { pid, actor } => {
                let payload = RegisterPayload {
                    pid: *pid,
                    actor: *actor,
                };
                (
                    kind::REGISTER_WORKER,
                    serde_json::to_vec(&payload).expect("register payload"),
                )
            }
            WorkerRequest::Submit(spec) => (kind::SUBMIT_TASK, spec.to_bytes()),
            WorkerRequest::GetTask => (kind::GET_TASK, Vec::new()),
            WorkerRequest::TaskDone => (kind::TASK_DONE, Vec::new()),
            WorkerRequest::Reconstruct(oid) => {
                (kind::RECONSTRUCT_OBJECT, oid.as_bytes().to_vec())
            }
            WorkerRequest::NotifyUnblocked => (kind::NOTIFY_UNBLOCKED, Vec::new()),
            WorkerRequest::Disconnect => (kind::DISCONNECT, Vec::new()),
        }
    }

    fn decode(frame_kind: u8, payload: &[u8]) -> Result<Self, FrameError> {
        match frame_kind {
            kind::REGISTER_WORKER => {
                let parsed: RegisterPayload =
                    serde_json::from_slice(payload).map_err(|err| FrameError::Malformed {
                        kind: "register",
                        reason: err.to_string(),
                    })?;
                Ok(WorkerRequest::Register {
                    pid: parsed.pid,
                    actor: parsed.actor,
                })
            }
            kind::SUBMIT_TASK => Ok(WorkerRequest::Submit(parse_spec("submit", payload)?)),
            kind::GET_TASK => Ok(WorkerRequest::GetTask),
            kind::TASK_DONE => Ok(WorkerRequest::TaskDone),
            kind::RECONSTRUCT_OBJECT => {
                Ok(WorkerRequest::Reconstruct(parse_oid("reconstruct", payload)?))
            }
            kind::NOTIFY_UNBLOCKED => Ok(WorkerRequest::NotifyUnblocked),
            kind::DISCONNECT => Ok(WorkerRequest::Disconnect),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

/// Messages the engine sends to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineMessage {
    /// Execute this spec; reply with `TASK_DONE`.
    Execute(TaskSpec),
    /// Finish up and exit.
    Terminate,
}

impl Message for EngineMessage {
    fn encode(&self) -> (u8, Vec<u8>) {
        match self {
            EngineMessage::Execute(spec) => (kind::EXECUTE_TASK, spec.to_bytes()),
            EngineMessage::Terminate => (kind::TERMINATE_WORKER, Vec::new()),
        }
    }

    fn decode(frame_kind: u8, payload: &[u8]) -> Result<Self, FrameError> {
        match frame_kind {
            kind::EXECUTE_TASK => Ok(EngineMessage::Execute(parse_spec("execute", payload)?)),
            kind::TERMINATE_WORKER => Ok(EngineMessage::Terminate),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

/// Notifications the object store delivers to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreNotice {
    /// Object is now resident on this node.
    Sealed(ObjectId),
    /// Object was evicted from this node.
    Evicted(ObjectId),
}

impl Message for StoreNotice {
    fn encode(&self) -> (u8, Vec<u8>) {
        match self {
            StoreNotice::Sealed(oid) => (kind::OBJECT_SEALED, oid.as_bytes().to_vec()),
            StoreNotice::Evicted(oid) => (kind::OBJECT_EVICTED, oid.as_bytes().to_vec()),
        }
    }

    fn decode(frame_kind: u8, payload: &[u8]) -> Result<Self, FrameError> {
        match frame_kind {
            kind::OBJECT_SEALED => Ok(StoreNotice::Sealed(parse_oid("sealed", payload)?)),
            kind::OBJECT_EVICTED => Ok(StoreNotice::Evicted(parse_oid("evicted", payload)?)),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

/// Requests the engine sends to the object store manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreRequest {
    /// Pull a remote copy of the object to this node.
    Fetch(ObjectId),
}

impl Message for StoreRequest {
    fn encode(&self) -> (u8, Vec<u8>) {
        match self {
            StoreRequest::Fetch(oid) => (kind::FETCH_OBJECT, oid.as_bytes().to_vec()),
        }
    }

    fn decode(frame_kind: u8, payload: &[u8]) -> Result<Self, FrameError> {
        match frame_kind {
            kind::FETCH_OBJECT => Ok(StoreRequest::Fetch(parse_oid("fetch", payload)?)),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ResourceVector;

    #[tokio::test]
    async fn register_frame_carries_pid_and_actor() {
        let actor = ActorId::from_bytes([4u8; ID_LEN]);
        let msg = WorkerRequest::Register {
            pid: 4242,
            actor: Some(actor),
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &msg).await.expect("write");

        let mut cursor = buf.as_slice();
        let parsed: WorkerRequest = read_message(&mut cursor).await.expect("read");
        assert_eq!(parsed, msg);
    }

    #[tokio::test]
    async fn execute_frame_revalidates_the_spec() {
        let spec = TaskSpec::new(b"go".to_vec(), vec![], 1, ResourceVector::new(1, 0), None);
        let msg = EngineMessage::Execute(spec.clone());

        let mut buf = Vec::new();
        write_message(&mut buf, &msg).await.expect("write");

        let mut cursor = buf.as_slice();
        match read_message::<_, EngineMessage>(&mut cursor).await.expect("read") {
            EngineMessage::Execute(parsed) => assert_eq!(parsed.id(), spec.id()),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn truncated_header_reads_as_closed() {
        let mut cursor: &[u8] = &[kind::GET_TASK, 0, 0];
        match read_frame(&mut cursor).await {
            Err(FrameError::Closed) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_before_reading_payload() {
        let mut header = vec![kind::SUBMIT_TASK];
        header.extend_from_slice(&(MAX_FRAME_LEN + 1).to_le_bytes());
        let mut cursor = header.as_slice();
        match read_frame(&mut cursor).await {
            Err(FrameError::Oversized(len)) => assert_eq!(len, MAX_FRAME_LEN + 1),
            other => panic!("expected Oversized, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_type_and_short_oid_are_malformed() {
        let mut buf = Vec::new();
        write_frame(&mut buf, 250, &[]).await.expect("write");
        let mut cursor = buf.as_slice();
        match read_message::<_, WorkerRequest>(&mut cursor).await {
            Err(FrameError::UnknownType(250)) => {}
            other => panic!("expected UnknownType, got {other:?}"),
        }

        let mut buf = Vec::new();
        write_frame(&mut buf, kind::RECONSTRUCT_OBJECT, &[1, 2, 3])
            .await
            .expect("write");
        let mut cursor = buf.as_slice();
        match read_message::<_, WorkerRequest>(&mut cursor).await {
            Err(FrameError::Malformed { kind: "reconstruct", .. }) => {}
            other => panic!("expected Malformed, got {other:?}"),
        }
    }
}
