//! The file receiver state machine.
//!
//! For each FILE offer the receiver opens a locked temp file in the inbound
//! spool, appends arriving data frames at the declared offset, and on
//! completion publishes the payload and acknowledges with GOT. EOB ends the
//! batch cleanly. Spool failures abort the temp file and fail the session;
//! a partially received file is never published.

use crate::error::NodeError;
use crate::session::WriteHandle;
use crate::spool::{Spool, SpoolKey};
use std::fs::File;
use std::os::unix::fs::FileExt;
use tern_proto::frame::{FileId, FileOffer, Frame};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// An inbound transfer in progress.
struct RecvTransfer {
    id: FileId,
    offset: u64,
    spool: Spool,
    spool_key: SpoolKey,
    file: File,
}

impl RecvTransfer {
    /// Fsyncs, closes and publishes the received payload. Any failure
    /// before publication aborts the temp file.
    fn publish(self) -> Result<(), NodeError> {
        if let Err(e) = self.file.sync_all() {
            self.abort();
            return Err(e.into());
        }
        let Self {
            spool,
            spool_key,
            file,
            ..
        } = self;
        drop(file);
        spool.publish(&spool_key)
    }

    /// Discards the transfer, releasing the temp file.
    fn abort(self) {
        let Self {
            spool,
            spool_key,
            file,
            ..
        } = self;
        drop(file);
        spool.abort(&spool_key);
    }
}

enum RecvState {
    WaitForFile,
    RecvFileData,
    GotFile,
    Done,
}

pub(super) async fn run(
    frames: mpsc::Receiver<Frame>,
    done: mpsc::Sender<()>,
    wire: WriteHandle,
    spool: Spool,
    cancel: CancellationToken,
) -> Result<(), NodeError> {
    // Dropping the sender on exit is the done signal the router watches.
    let _done = done;
    let mut receiver = Receiver {
        frames,
        wire,
        spool,
        cancel,
        request: None,
    };
    let result = receiver.run().await;
    // A transfer still active at exit can never be completed: inbound
    // offsets are not persisted, so the peer will offer the file again.
    if let Some(request) = receiver.request.take() {
        request.abort();
    }
    debug!("file receiver exiting");
    result
}

struct Receiver {
    frames: mpsc::Receiver<Frame>,
    wire: WriteHandle,
    spool: Spool,
    cancel: CancellationToken,
    request: Option<RecvTransfer>,
}

impl Receiver {
    async fn run(&mut self) -> Result<(), NodeError> {
        let mut state = RecvState::WaitForFile;
        loop {
            state = match state {
                RecvState::WaitForFile => self.wait_for_file().await?,
                RecvState::RecvFileData => self.recv_file_data().await?,
                RecvState::GotFile => self.got_file().await?,
                RecvState::Done => return Ok(()),
            };
        }
    }

    /// Receives the next routed frame; `Ok(None)` when the session is
    /// cancelled.
    async fn next(&mut self) -> Result<Option<Frame>, NodeError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Ok(None),
            frame = self.frames.recv() => match frame {
                Some(frame) => Ok(Some(frame)),
                None => Err(NodeError::SessionClosed),
            },
        }
    }

    async fn wait_for_file(&mut self) -> Result<RecvState, NodeError> {
        match self.next().await? {
            None => Ok(RecvState::Done),
            Some(Frame::File(offer)) => self.file_requested(offer).await,
            Some(Frame::Eob) => Ok(RecvState::Done),
            Some(Frame::Data(data)) => {
                trace!("ignoring {} data bytes with no transfer in progress", data.len());
                Ok(RecvState::WaitForFile)
            }
            Some(other) => self.invalid_frame(&other).await,
        }
    }

    /// Sets up the spool temp file for a fresh FILE offer.
    async fn file_requested(&mut self, offer: FileOffer) -> Result<RecvState, NodeError> {
        debug!(
            "receiving {} from offset {} ({} bytes)",
            offer.id.name, offer.offset, offer.id.size
        );
        if self.has_file(&offer) {
            // Already spooled; acknowledge without a second transfer.
            self.send_got(offer.id).await?;
            return Ok(RecvState::WaitForFile);
        }
        let (spool_key, file) = match self.spool.temp_file_for(&offer.id) {
            Ok(created) => created,
            Err(e) => return self.spool_failed(e.into()).await,
        };
        let complete = offer.offset >= offer.id.size;
        self.request = Some(RecvTransfer {
            id: offer.id,
            offset: offer.offset,
            spool: self.spool.clone(),
            spool_key,
            file,
        });
        if complete {
            // Nothing left to transfer (an empty file, or a resume at the
            // end); no data frames will follow.
            return Ok(RecvState::GotFile);
        }
        Ok(RecvState::RecvFileData)
    }

    /// Whether the spool already holds the offered file.
    // TODO: match the offer against previously published FileIds so a
    // re-offered file can be acknowledged without transferring it again.
    #[allow(clippy::unused_self)]
    fn has_file(&self, _offer: &FileOffer) -> bool {
        false
    }

    async fn recv_file_data(&mut self) -> Result<RecvState, NodeError> {
        match self.next().await? {
            None => Ok(RecvState::Done),
            Some(Frame::Data(data)) => self.write_data(&data).await,
            Some(Frame::File(offer)) => {
                if let Some(request) = self.request.take() {
                    warn!(
                        "FILE {} received while {} was incomplete; aborting the old transfer",
                        offer.id.name, request.id.name
                    );
                    request.abort();
                }
                self.file_requested(offer).await
            }
            Some(other) => {
                if let Some(request) = self.request.take() {
                    request.abort();
                }
                self.invalid_frame(&other).await
            }
        }
    }

    async fn write_data(&mut self, data: &[u8]) -> Result<RecvState, NodeError> {
        let Some(request) = self.request.as_mut() else {
            return Err(NodeError::Protocol(
                "data frame with no transfer in progress".to_string(),
            ));
        };
        let data_len = data.len() as u64;
        if request.offset + data_len > request.id.size {
            // Compression options we do not implement can legitimately
            // overshoot the declared size; note it and keep writing.
            warn!(
                "long write on {}: offset {} + {} exceeds size {}",
                request.id.name, request.offset, data_len, request.id.size
            );
        }
        if let Err(e) = request.file.write_all_at(data, request.offset) {
            error!("error writing received file {}: {e}", request.id.name);
            if let Some(request) = self.request.take() {
                request.abort();
            }
            return self.spool_failed(e.into()).await;
        }
        request.offset += data_len;
        if request.offset >= request.id.size {
            Ok(RecvState::GotFile)
        } else {
            Ok(RecvState::RecvFileData)
        }
    }

    /// Publishes the completed transfer and acknowledges it. GOT goes on
    /// the wire strictly after publication succeeds.
    async fn got_file(&mut self) -> Result<RecvState, NodeError> {
        let Some(request) = self.request.take() else {
            return Err(NodeError::Protocol(
                "transfer completion with no transfer in progress".to_string(),
            ));
        };
        let id = request.id.clone();
        if let Err(e) = request.publish() {
            error!("spool publish error for {}: {e}", id.name);
            return self.spool_failed(e).await;
        }
        self.send_got(id).await?;
        Ok(RecvState::WaitForFile)
    }

    async fn send_got(&self, id: FileId) -> Result<(), NodeError> {
        self.wire.write_sync_frame(Frame::Got(id)).await
    }

    /// A spool failure is not the peer's fault, but it ends the session;
    /// the simplest recoverable unit is the session.
    async fn spool_failed(&self, e: NodeError) -> Result<RecvState, NodeError> {
        self.wire.send_error("internal server error").await;
        Err(e)
    }

    async fn invalid_frame(&self, frame: &Frame) -> Result<RecvState, NodeError> {
        warn!("unexpected {} frame while receiving", frame.kind());
        self.wire.send_error("Invalid received frame").await;
        Err(NodeError::Protocol(format!(
            "unexpected {} frame while receiving",
            frame.kind()
        )))
    }
}
