//! Per-connection session engine.
//!
//! Exactly two tasks touch the stream: a reader that decodes frames onto a
//! bounded channel and a writer that drains a write channel onto the socket.
//! Everything else (the handshake and transfer state machines) talks to
//! them through channels, which confines all concurrency hazards to this
//! module.
//!
//! The writer additionally watches an urgent-error channel with priority
//! over ordinary writes: delivering a terminal ERR frame flushes the stream
//! and ends the writer.

use crate::config::{Config, Link};
use crate::error::NodeError;
use std::io;
use std::sync::Arc;
use tern_proto::address::Address;
use tern_proto::cram::HashKind;
use tern_proto::frame::{Frame, MAX_FRAME_SIZE};
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Capacity of the frame channels; bounds per-session memory and provides
/// transfer backpressure when the socket is slower than the spool.
pub(crate) const FRAME_CHANNEL_CAPACITY: usize = 16;

/// How many consecutive skipped frames the reader tolerates before assuming
/// the peer is feeding us garbage.
const MAX_CONSECUTIVE_BAD_FRAMES: usize = 1000;

/// Socket buffer size, a few full-sized frames on either side.
const SOCKET_BUFFER_SIZE: usize = (MAX_FRAME_SIZE + 2) * 4;

/// An instruction to the writer task.
pub(crate) enum WriteCmd {
    /// Encode and buffer a frame.
    Frame(Frame),
    /// Flush everything buffered so far to the socket, then acknowledge.
    /// The acknowledgment is what lets a state machine order wire effects
    /// before the durability effects that depend on them.
    Flush(oneshot::Sender<()>),
}

/// A clonable handle for queueing frames to the writer task.
#[derive(Clone)]
pub struct WriteHandle {
    write_tx: mpsc::Sender<WriteCmd>,
    urgent_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl WriteHandle {
    /// Queues one frame for transmission.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::SessionClosed`] when the session is cancelled
    /// or the writer has exited.
    pub async fn write_frame(&self, frame: Frame) -> Result<(), NodeError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(NodeError::SessionClosed),
            sent = self.write_tx.send(WriteCmd::Frame(frame)) => {
                sent.map_err(|_| NodeError::SessionClosed)
            }
        }
    }

    /// Queues a sequence of frames in order.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::SessionClosed`] when the session is ending.
    pub async fn write_frames(&self, frames: Vec<Frame>) -> Result<(), NodeError> {
        for frame in frames {
            self.write_frame(frame).await?;
        }
        Ok(())
    }

    /// Flushes the writer's buffer to the socket, returning once the bytes
    /// have actually been pushed down the stream.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::SessionClosed`] when the session is ending.
    pub async fn flush(&self) -> Result<(), NodeError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        tokio::select! {
            _ = self.cancel.cancelled() => return Err(NodeError::SessionClosed),
            sent = self.write_tx.send(WriteCmd::Flush(ack_tx)) => {
                sent.map_err(|_| NodeError::SessionClosed)?;
            }
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(NodeError::SessionClosed),
            acked = ack_rx => acked.map_err(|_| NodeError::SessionClosed),
        }
    }

    /// Queues one frame and flushes.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::SessionClosed`] when the session is ending.
    pub async fn write_sync_frame(&self, frame: Frame) -> Result<(), NodeError> {
        self.write_frame(frame).await?;
        self.flush().await
    }

    /// Queues a sequence of frames and flushes.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::SessionClosed`] when the session is ending.
    pub async fn write_sync_frames(&self, frames: Vec<Frame>) -> Result<(), NodeError> {
        self.write_frames(frames).await?;
        self.flush().await
    }

    /// Dispatches a terminal ERR frame through the urgent channel. Best
    /// effort: if the writer is already gone there is nobody left to tell.
    pub async fn send_error(&self, text: &str) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.urgent_tx.send(text.to_string()) => {}
        }
    }
}

/// Per-connection state threaded through the handshake and transfer
/// machinery.
pub struct Session {
    pub(crate) config: Arc<Config>,
    pub(crate) link: Option<Link>,
    pub(crate) remote_addrs: Vec<Address>,
    pub(crate) hash: HashKind,
    pub(crate) challenge: Option<Vec<u8>>,
    pub(crate) frames: mpsc::Receiver<Frame>,
    pub(crate) wire: WriteHandle,
    pub(crate) cancel: CancellationToken,
}

impl Session {
    /// Builds a session over `stream`, spawning its reader and writer
    /// tasks. Returns the session, the I/O task set, and the cancellation
    /// token that tears everything down.
    pub(crate) fn start<S>(
        config: Arc<Config>,
        stream: S,
    ) -> (Self, JoinSet<Result<(), NodeError>>, CancellationToken)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let (read_half, write_half) = tokio::io::split(stream);
        let (frames_tx, frames) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let (write_tx, write_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let (urgent_tx, urgent_rx) = mpsc::channel(1);

        let mut io_tasks = JoinSet::new();
        io_tasks.spawn(read_frames(
            read_half,
            frames_tx,
            urgent_tx.clone(),
            cancel.clone(),
        ));
        io_tasks.spawn(write_frames(write_half, write_rx, urgent_rx, cancel.clone()));

        let wire = WriteHandle {
            write_tx,
            urgent_tx,
            cancel: cancel.clone(),
        };
        let session = Self {
            config,
            link: None,
            remote_addrs: Vec::new(),
            hash: HashKind::default(),
            challenge: None,
            frames,
            wire,
            cancel: cancel.clone(),
        };
        (session, io_tasks, cancel)
    }

    /// Receives the next inbound frame. `Ok(None)` means the session was
    /// cancelled and the caller should wind down quietly.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::SessionClosed`] when the peer closed the stream
    /// mid-conversation.
    pub(crate) async fn next_frame(&mut self) -> Result<Option<Frame>, NodeError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Ok(None),
            frame = self.frames.recv() => match frame {
                Some(frame) => Ok(Some(frame)),
                None => Err(NodeError::SessionClosed),
            },
        }
    }

    /// Records the peer's advertised addresses and looks for a configured
    /// link matching any of them, keeping the first match.
    pub(crate) fn link_addresses(&mut self, addrs: Vec<Address>) -> Option<&Link> {
        self.remote_addrs = addrs;
        for addr in &self.remote_addrs {
            if let Some(link) = self.config.link_for(addr) {
                self.link = Some(link.clone());
                break;
            }
        }
        self.link.as_ref()
    }
}

/// Waits for every I/O task to finish and reports the first failure.
pub(crate) async fn drain_tasks(
    mut tasks: JoinSet<Result<(), NodeError>>,
) -> Result<(), NodeError> {
    let mut first_err = None;
    while let Some(joined) = tasks.join_next().await {
        let result = match joined {
            Ok(result) => result,
            Err(e) => Err(NodeError::Protocol(format!("session task failed: {e}"))),
        };
        if let Err(e) = result {
            if first_err.is_none() {
                first_err = Some(e);
            }
        }
    }
    first_err.map_or(Ok(()), Err)
}

/// The reader task: decodes frames off the socket into the frame channel.
/// On an I/O or decode error it dispatches an ERR frame to the peer through
/// the urgent channel and fails; on clean end-of-stream it closes its
/// channel and exits.
async fn read_frames<S>(
    read_half: ReadHalf<S>,
    frames_tx: mpsc::Sender<Frame>,
    urgent_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
) -> Result<(), NodeError>
where
    S: AsyncRead + Send + 'static,
{
    let mut reader = BufReader::with_capacity(SOCKET_BUFFER_SIZE, read_half);
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = next_wire_frame(&mut reader) => match next {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(e) => {
                    let msg = format!("Error reading frame: {e}");
                    let _ = urgent_tx.send(msg.clone()).await;
                    return Err(NodeError::Protocol(msg));
                }
            },
        };
        trace!("received {}", frame.kind());
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            sent = frames_tx.send(frame) => {
                if sent.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// Reads frames until one decodes to something usable. `Ok(None)` is clean
/// end-of-stream, which is only legal on a frame boundary. A decoder that
/// keeps yielding nothing must not be allowed to spin forever.
async fn next_wire_frame<R>(reader: &mut R) -> Result<Option<Frame>, NodeError>
where
    R: AsyncRead + Unpin,
{
    for _ in 0..MAX_CONSECUTIVE_BAD_FRAMES {
        let first = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let second = reader.read_u8().await.map_err(|e| {
            NodeError::Io(io::Error::new(e.kind(), format!("short header read: {e}")))
        })?;

        let is_command = first & 0x80 != 0;
        let length = usize::from(first & 0x7f) << 8 | usize::from(second);
        if length == 0 {
            return Err(tern_proto::frame::FrameError::Empty.into());
        }
        let mut payload = vec![0u8; length];
        reader.read_exact(&mut payload).await.map_err(|e| {
            NodeError::Io(io::Error::new(e.kind(), format!("short data read: {e}")))
        })?;

        if let Some(frame) = Frame::decode_body(is_command, &payload)? {
            return Ok(Some(frame));
        }
        trace!("skipping undecodable frame of {length} bytes");
    }
    Err(NodeError::TooManyBadFrames)
}

/// The writer task. Urgent errors take priority over ordinary writes:
/// emitting the ERR frame flushes the stream and ends the task. An ordinary
/// [`WriteCmd::Flush`] pushes buffered frames to the socket. Closed input
/// channels and cancellation both exit cleanly.
async fn write_frames<S>(
    write_half: WriteHalf<S>,
    mut write_rx: mpsc::Receiver<WriteCmd>,
    mut urgent_rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) -> Result<(), NodeError>
where
    S: AsyncWrite + Send + 'static,
{
    let mut writer = BufWriter::with_capacity(SOCKET_BUFFER_SIZE, write_half);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // An ERR queued just before cancellation still owes the peer
                // a diagnostic; deliver it on the way out.
                if let Ok(text) = urgent_rx.try_recv() {
                    writer.write_all(&Frame::Err(text).encode()?).await?;
                    writer.flush().await?;
                }
                return Ok(());
            }
            urgent = urgent_rx.recv() => {
                let Some(text) = urgent else { return Ok(()) };
                trace!("sending urgent ERR: {text}");
                writer.write_all(&Frame::Err(text).encode()?).await?;
                writer.flush().await?;
                return Ok(());
            }
            cmd = write_rx.recv() => match cmd {
                None => return Ok(()),
                Some(WriteCmd::Flush(ack)) => {
                    writer.flush().await?;
                    let _ = ack.send(());
                }
                Some(WriteCmd::Frame(frame)) => {
                    trace!("sending {}", frame.kind());
                    writer.write_all(&frame.encode()?).await?;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_proto::frame::FileId;

    async fn collect_frames(bytes: Vec<u8>) -> Vec<Frame> {
        let mut reader = std::io::Cursor::new(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = next_wire_frame(&mut reader).await.unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn reads_back_to_back_frames() {
        let mut bytes = Frame::Nul("SYS Test".to_string()).encode().unwrap();
        bytes.extend(Frame::Eob.encode().unwrap());
        bytes.extend(Frame::Data(vec![1, 2, 3]).encode().unwrap());
        let frames = collect_frames(bytes).await;
        assert_eq!(
            frames,
            vec![
                Frame::Nul("SYS Test".to_string()),
                Frame::Eob,
                Frame::Data(vec![1, 2, 3]),
            ]
        );
    }

    #[tokio::test]
    async fn clean_eof_is_not_an_error() {
        assert!(collect_frames(Vec::new()).await.is_empty());
    }

    #[tokio::test]
    async fn short_header_is_an_error() {
        let mut reader = std::io::Cursor::new(vec![0x80u8]);
        assert!(next_wire_frame(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn short_body_is_an_error() {
        let mut reader = std::io::Cursor::new(vec![0x80u8, 0x05, 0x00, b'a']);
        assert!(next_wire_frame(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn empty_frame_is_an_error() {
        let mut reader = std::io::Cursor::new(vec![0x00u8, 0x00]);
        assert!(next_wire_frame(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn skipped_frames_do_not_hide_later_ones() {
        // A non-UTF-8 informational NUL decodes to nothing; the reader
        // should move on to the GOT that follows it.
        let mut bytes = vec![0x80, 0x03, 0x00, 0xff, 0xfe];
        bytes.extend(
            Frame::Got(FileId {
                name: "a.pkt".to_string(),
                size: 1,
                mtime: 2,
            })
            .encode()
            .unwrap(),
        );
        let frames = collect_frames(bytes).await;
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Frame::Got(_)));
    }

    #[tokio::test]
    async fn too_many_skipped_frames_give_up() {
        let mut bytes = Vec::new();
        for _ in 0..=MAX_CONSECUTIVE_BAD_FRAMES {
            bytes.extend([0x80, 0x03, 0x00, 0xff, 0xfe]);
        }
        let mut reader = std::io::Cursor::new(bytes);
        assert!(matches!(
            next_wire_frame(&mut reader).await,
            Err(NodeError::TooManyBadFrames)
        ));
    }

    #[tokio::test]
    async fn writer_prefers_urgent_errors() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (_read_half, write_half) = tokio::io::split(server);
        let (write_tx, write_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let (urgent_tx, urgent_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let writer = tokio::spawn(write_frames(write_half, write_rx, urgent_rx, cancel));

        urgent_tx.send("boom".to_string()).await.unwrap();
        writer.await.unwrap().unwrap();
        drop(write_tx);

        let (mut client_read, _client_write) = tokio::io::split(client);
        let frame = next_wire_frame(&mut client_read).await.unwrap().unwrap();
        assert_eq!(frame, Frame::Err("boom".to_string()));
    }

    #[tokio::test]
    async fn writer_flushes_on_sentinel_and_exits_on_close() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (_read_half, write_half) = tokio::io::split(server);
        let (write_tx, write_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let (urgent_tx, urgent_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let writer = tokio::spawn(write_frames(write_half, write_rx, urgent_rx, cancel));

        write_tx
            .send(WriteCmd::Frame(Frame::Ok("secure".to_string())))
            .await
            .unwrap();
        let (ack_tx, ack_rx) = oneshot::channel();
        write_tx.send(WriteCmd::Flush(ack_tx)).await.unwrap();
        ack_rx.await.unwrap();

        let (mut client_read, _client_write) = tokio::io::split(client);
        let frame = next_wire_frame(&mut client_read).await.unwrap().unwrap();
        assert_eq!(frame, Frame::Ok("secure".to_string()));

        drop(write_tx);
        drop(urgent_tx);
        writer.await.unwrap().unwrap();
    }
}
