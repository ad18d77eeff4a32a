//! The concurrent transfer sub-protocol.
//!
//! After authentication the session splits into three cooperating tasks: a
//! router that demultiplexes inbound frames, a receiver that writes offered
//! files into the inbound spool, and a transmitter that streams the
//! outbound queue to the peer. The first task to fail cancels the rest.

mod recv;
mod router;
mod xmit;

use crate::error::NodeError;
use crate::session::{Session, FRAME_CHANNEL_CAPACITY};
use tern_proto::frame::FileId;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// The frames that mutate the transmit queue, routed to the transmitter.
#[derive(Debug, Clone)]
pub(crate) enum QueueCmd {
    /// Peer asks for a file starting at an offset.
    Get {
        /// Identity of the requested file.
        id: FileId,
        /// Offset to resume from.
        offset: u64,
    },
    /// Peer confirms complete receipt of a file.
    Got(FileId),
    /// Peer asks us to omit a file this session.
    Skip(FileId),
}

impl QueueCmd {
    /// The file the command refers to.
    pub(crate) fn id(&self) -> &FileId {
        match self {
            Self::Get { id, .. } | Self::Got(id) | Self::Skip(id) => id,
        }
    }
}

/// Runs the transfer phase to completion, consuming the authenticated
/// session. Both directions run concurrently; the call returns when the
/// router, receiver and transmitter have all finished, reporting the first
/// error any of them hit.
pub(crate) async fn start(session: Session) -> Result<(), NodeError> {
    let link = session
        .link
        .clone()
        .ok_or_else(|| NodeError::Protocol("transfer started without a linked peer".to_string()))?;
    let Session {
        frames,
        wire,
        cancel,
        ..
    } = session;

    let (recvr_tx, recvr_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
    let (xmitr_tx, xmitr_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
    // Done signals: each side task owns the sender and drops it on exit.
    let (recvr_done_tx, recvr_done_rx) = mpsc::channel::<()>(1);
    let (xmitr_done_tx, xmitr_done_rx) = mpsc::channel::<()>(1);

    let mut tasks: JoinSet<Result<(), NodeError>> = JoinSet::new();
    tasks.spawn(router::run(
        frames,
        recvr_tx,
        xmitr_tx,
        recvr_done_rx,
        xmitr_done_rx,
        wire.clone(),
        cancel.clone(),
    ));
    tasks.spawn(recv::run(
        recvr_rx,
        recvr_done_tx,
        wire.clone(),
        link.in_spool.clone(),
        cancel.clone(),
    ));
    tasks.spawn(xmit::run(
        xmitr_rx,
        xmitr_done_tx,
        wire,
        link.out_spool,
        cancel.clone(),
    ));

    let mut first_err = None;
    while let Some(joined) = tasks.join_next().await {
        let result = match joined {
            Ok(result) => result,
            Err(e) => Err(NodeError::Protocol(format!("transfer task failed: {e}"))),
        };
        if let Err(e) = result {
            if first_err.is_none() {
                cancel.cancel();
                first_err = Some(e);
            }
        }
    }
    first_err.map_or(Ok(()), Err)
}
