use tern_proto::frame::FrameError;
use thiserror::Error;

/// Errors that can occur while running a node or one of its sessions.
#[derive(Error, Debug)]
pub enum NodeError {
    /// A frame failed to encode or decode.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    /// Underlying I/O error, on the socket or in the spool.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A spool queue file could not be read or written as JSON.
    #[error("queue file error: {0}")]
    Queue(#[from] serde_json::Error),
    /// The peer failed authentication, or offered credentials we do not accept.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// The peer violated the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// None of the peer's advertised addresses matched a configured link.
    #[error("no configured link for any peer address")]
    Unlinked,
    /// The peer sent BSY; the session may be retried later.
    #[error("peer busy: {0}")]
    PeerBusy(String),
    /// The peer sent a terminal ERR diagnostic.
    #[error("peer error: {0}")]
    PeerError(String),
    /// A session channel closed underneath its user; the session is ending.
    #[error("session closed")]
    SessionClosed,
    /// The frame decoder skipped too many consecutive frames.
    #[error("too many consecutive bad frames")]
    TooManyBadFrames,
}
