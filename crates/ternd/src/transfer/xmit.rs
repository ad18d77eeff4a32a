//! The file transmitter state machine.
//!
//! On start the transmitter folds freshly published work into the durable
//! outbound queue, then streams each pending file to the peer: a FILE offer
//! followed by data frames of up to one frame-payload each. Between chunks
//! it polls for GET/GOT/SKIP without blocking; a command naming the current
//! file takes effect immediately, anything else at the next queue
//! re-evaluation. At end of batch it writes EOB and persists the residual
//! queue, which excludes everything the peer confirmed.
//!
//! Backpressure comes from the bounded writer channel: a slow socket blocks
//! the chunk loop, so no more than a few frames are ever in flight.

use super::QueueCmd;
use crate::error::NodeError;
use crate::session::WriteHandle;
use crate::spool::{Spool, SpoolKey};
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Seek, SeekFrom};
use tern_proto::frame::{FileId, FileOffer, Frame, MAX_FRAME_SIZE};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueStatus {
    Pending,
    Skipped,
    Done,
}

struct QueueEntry {
    spool_key: SpoolKey,
    status: QueueStatus,
}

/// An outbound transfer: where in the spool the payload lives and how far
/// transmission has progressed.
struct XmitTransfer {
    spool_key: SpoolKey,
    offset: u64,
}

enum XmitState {
    Start,
    SendNextRequest,
    WaitForRequest,
    Send,
    End,
}

pub(super) async fn run(
    frames: mpsc::Receiver<QueueCmd>,
    done: mpsc::Sender<()>,
    wire: WriteHandle,
    spool: Spool,
    cancel: CancellationToken,
) -> Result<(), NodeError> {
    // Dropping the sender on exit is the done signal the router watches.
    let _done = done;
    let mut transmitter = Transmitter {
        frames,
        wire,
        spool,
        cancel,
        lookup: HashMap::new(),
        queue: Vec::new(),
        active: VecDeque::new(),
        pending: 0,
        request: None,
    };
    let result = transmitter.run().await;
    debug!("file transmitter exiting");
    result
}

struct Transmitter {
    frames: mpsc::Receiver<QueueCmd>,
    wire: WriteHandle,
    spool: Spool,
    cancel: CancellationToken,
    /// Status of every queued file, keyed by wire identity.
    lookup: HashMap<FileId, QueueEntry>,
    /// The queue as loaded, in order; the residual save filters this.
    queue: Vec<SpoolKey>,
    /// Transfers not yet sent this session, front first.
    active: VecDeque<XmitTransfer>,
    /// Number of entries still awaiting a GOT or SKIP.
    pending: usize,
    /// The transfer currently on the wire.
    request: Option<XmitTransfer>,
}

impl Transmitter {
    async fn run(&mut self) -> Result<(), NodeError> {
        let mut state = XmitState::Start;
        loop {
            state = match state {
                XmitState::Start => {
                    self.load_queue()?;
                    XmitState::SendNextRequest
                }
                XmitState::SendNextRequest => self.send_next_request(),
                XmitState::WaitForRequest => self.wait_for_request().await,
                XmitState::Send => self.send().await?,
                XmitState::End => {
                    self.end().await?;
                    return Ok(());
                }
            };
        }
    }

    /// Folds newly published work into the durable outbound queue and loads
    /// it: every entry starts pending, with a transfer descriptor at
    /// offset 0.
    fn load_queue(&mut self) -> Result<(), NodeError> {
        self.spool
            .consume_and_concat_queues("new", "Queue", "cur", "Queue")?;
        let queue = self.spool.read_queue("cur", "Queue")?;
        debug!("outbound queue holds {} entries", queue.len());
        self.pending = queue.len();
        for entry in queue {
            self.lookup.insert(
                entry.file.clone(),
                QueueEntry {
                    spool_key: entry.clone(),
                    status: QueueStatus::Pending,
                },
            );
            self.active.push_back(XmitTransfer {
                spool_key: entry.clone(),
                offset: 0,
            });
            self.queue.push(entry);
        }
        Ok(())
    }

    fn send_next_request(&mut self) -> XmitState {
        if self.pending == 0 {
            return XmitState::End;
        }
        match self.active.pop_front() {
            None => XmitState::WaitForRequest,
            Some(transfer) => {
                self.request = Some(transfer);
                XmitState::Send
            }
        }
    }

    /// Everything sent, something still unconfirmed: block until the peer's
    /// next queue command arrives.
    async fn wait_for_request(&mut self) -> XmitState {
        tokio::select! {
            _ = self.cancel.cancelled() => XmitState::End,
            cmd = self.frames.recv() => match cmd {
                None => XmitState::End,
                Some(cmd) => {
                    self.apply(cmd);
                    XmitState::SendNextRequest
                }
            }
        }
    }

    fn apply(&mut self, cmd: QueueCmd) {
        match cmd {
            QueueCmd::Get { id, offset } => self.apply_get(&id, offset),
            QueueCmd::Got(id) => self.apply_got(&id),
            QueueCmd::Skip(id) => self.apply_skip(&id),
        }
    }

    /// GET re-queues the file as pending with a fresh descriptor at the
    /// requested offset.
    fn apply_get(&mut self, id: &FileId, offset: u64) {
        debug!("remote GET: {id} offset {offset}");
        let Some(entry) = self.lookup.get_mut(id) else {
            warn!("queue entry not found for {id}");
            return;
        };
        if entry.status != QueueStatus::Pending {
            self.pending += 1;
        }
        entry.status = QueueStatus::Pending;
        let spool_key = entry.spool_key.clone();
        self.remove_from_active(id);
        self.active.push_back(XmitTransfer { spool_key, offset });
    }

    /// GOT marks the file done and removes its payload from the spool; the
    /// residual queue will no longer carry it.
    fn apply_got(&mut self, id: &FileId) {
        debug!("remote GOT: {id}");
        let Some(entry) = self.lookup.get_mut(id) else {
            warn!("queue entry not found for {id}");
            return;
        };
        if entry.status == QueueStatus::Pending {
            self.pending -= 1;
        }
        if entry.status != QueueStatus::Done {
            if let Err(e) = self.spool.remove("cur", &entry.spool_key) {
                debug!("could not remove confirmed payload {:?}: {e}", entry.spool_key.name);
            }
        }
        entry.status = QueueStatus::Done;
        self.remove_from_active(id);
    }

    /// SKIP leaves the file queued for a later session.
    fn apply_skip(&mut self, id: &FileId) {
        debug!("remote SKIP: {id}");
        let Some(entry) = self.lookup.get_mut(id) else {
            warn!("queue entry not found for {id}");
            return;
        };
        if entry.status == QueueStatus::Pending {
            self.pending -= 1;
        }
        entry.status = QueueStatus::Skipped;
        self.remove_from_active(id);
    }

    fn remove_from_active(&mut self, id: &FileId) {
        self.active.retain(|transfer| &transfer.spool_key.file != id);
    }

    /// Streams the current request: FILE offer, then data chunks
    /// interleaved with non-blocking polls of the queue channel.
    async fn send(&mut self) -> Result<XmitState, NodeError> {
        let Some(mut request) = self.request.take() else {
            return Err(NodeError::Protocol("no transfer selected".to_string()));
        };
        let id = request.spool_key.file.clone();

        let path = self.spool.file_name("cur", &request.spool_key.name);
        let mut file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(e) => {
                // Published-then-gone between sessions: the payload was
                // already delivered but the queue rewrite did not survive.
                // Treat it as a GOT.
                debug!("cannot open spooled file {:?}: {e}", request.spool_key.name);
                self.apply_got(&id);
                return Ok(XmitState::SendNextRequest);
            }
        };
        file.seek(SeekFrom::Start(request.offset))?;

        debug!("sending {} from offset {} ({} bytes)", id.name, request.offset, id.size);
        self.wire
            .write_frame(Frame::File(FileOffer {
                id: id.clone(),
                offset: request.offset,
                crc: 0,
                flags: Vec::new(),
            }))
            .await?;

        while request.offset < id.size {
            if self.cancel.is_cancelled() {
                return Ok(XmitState::End);
            }
            match self.frames.try_recv() {
                Ok(cmd) => {
                    let refers_to_current = cmd.id() == &id;
                    self.apply(cmd);
                    if refers_to_current {
                        // The peer redirected or finished this very file.
                        break;
                    }
                }
                Err(TryRecvError::Empty) => {
                    let remaining = (id.size - request.offset).min(MAX_FRAME_SIZE as u64);
                    let mut chunk = vec![0u8; remaining as usize];
                    let n = file.read(&mut chunk)?;
                    if n == 0 {
                        error!(
                            "spooled file {:?} is shorter than its declared size {}",
                            request.spool_key.name, id.size
                        );
                        break;
                    }
                    chunk.truncate(n);
                    request.offset += n as u64;
                    self.wire.write_frame(Frame::Data(chunk)).await?;
                }
                Err(TryRecvError::Disconnected) => return Ok(XmitState::End),
            }
        }

        self.wire.flush().await?;
        Ok(XmitState::SendNextRequest)
    }

    /// End of batch: EOB to the peer (best effort; the session may already
    /// be tearing down) and the residual queue to disk.
    async fn end(&mut self) -> Result<(), NodeError> {
        if let Err(e) = self.wire.write_sync_frame(Frame::Eob).await {
            debug!("could not send EOB: {e}");
        }
        self.save_residual()
    }

    /// Persists the queue minus everything the peer confirmed.
    fn save_residual(&self) -> Result<(), NodeError> {
        let residual: Vec<SpoolKey> = self
            .queue
            .iter()
            .filter(|key| {
                self.lookup
                    .get(&key.file)
                    .is_some_and(|entry| entry.status != QueueStatus::Done)
            })
            .cloned()
            .collect();
        self.spool.save_queue("cur", "Queue", &residual)
    }
}
