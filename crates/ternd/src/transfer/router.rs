//! Frame router for the transfer phase.
//!
//! Dispatches each inbound frame to the receiver or transmitter. While both
//! sides are active, FILE/EOB/data go to the receiver and GET/GOT/SKIP to
//! the transmitter. When one side finishes (its done channel closes) the
//! router narrows to routing for the other; when both are done it exits.

use super::QueueCmd;
use crate::error::NodeError;
use crate::session::WriteHandle;
use tern_proto::frame::Frame;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

enum RouterState {
    Both,
    XmitOnly,
    RecvOnly,
}

pub(super) async fn run(
    mut frames: mpsc::Receiver<Frame>,
    recvr_tx: mpsc::Sender<Frame>,
    xmitr_tx: mpsc::Sender<QueueCmd>,
    mut recvr_done: mpsc::Receiver<()>,
    mut xmitr_done: mpsc::Receiver<()>,
    wire: WriteHandle,
    cancel: CancellationToken,
) -> Result<(), NodeError> {
    let mut state = RouterState::Both;
    loop {
        state = match state {
            RouterState::Both => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = recvr_done.recv() => RouterState::XmitOnly,
                    _ = xmitr_done.recv() => RouterState::RecvOnly,
                    frame = frames.recv() => {
                        // On a closed channel the reader is gone; exiting
                        // drops the side channels, and whichever sub-machine
                        // was still mid-work reports the failure.
                        let Some(frame) = frame else { break };
                        route_both(frame, &recvr_tx, &xmitr_tx, &wire).await?
                    }
                }
            }
            RouterState::XmitOnly => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = xmitr_done.recv() => break,
                    frame = frames.recv() => {
                        let Some(frame) = frame else { break };
                        match route_half(frame, &xmitr_tx, &wire).await? {
                            HalfOutcome::Continue => RouterState::XmitOnly,
                            HalfOutcome::Finished => break,
                        }
                    }
                }
            }
            RouterState::RecvOnly => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = recvr_done.recv() => break,
                    frame = frames.recv() => {
                        let Some(frame) = frame else { break };
                        match route_recv_half(frame, &recvr_tx, &wire).await? {
                            HalfOutcome::Continue => RouterState::RecvOnly,
                            HalfOutcome::Finished => break,
                        }
                    }
                }
            }
        }
    }
    debug!("frame router exiting");
    Ok(())
}

/// Routing while both sides are active. BSY/ERR are logged but not
/// forwarded here; the handshake already succeeded and the sub-machines
/// wind down through their own channels.
async fn route_both(
    frame: Frame,
    recvr_tx: &mpsc::Sender<Frame>,
    xmitr_tx: &mpsc::Sender<QueueCmd>,
    wire: &WriteHandle,
) -> Result<RouterState, NodeError> {
    match frame {
        Frame::File(_) | Frame::Eob | Frame::Data(_) => {
            if recvr_tx.send(frame).await.is_err() {
                // The receiver finished while this frame was in flight.
                return Ok(RouterState::XmitOnly);
            }
        }
        Frame::Get { id, offset } => {
            if xmitr_tx.send(QueueCmd::Get { id, offset }).await.is_err() {
                return Ok(RouterState::RecvOnly);
            }
        }
        Frame::Got(id) => {
            if xmitr_tx.send(QueueCmd::Got(id)).await.is_err() {
                return Ok(RouterState::RecvOnly);
            }
        }
        Frame::Skip(id) => {
            if xmitr_tx.send(QueueCmd::Skip(id)).await.is_err() {
                return Ok(RouterState::RecvOnly);
            }
        }
        Frame::Nul(text) => trace!("received NUL: {text}"),
        Frame::Opt(options) => trace!("received OPT: {options:?}"),
        Frame::Bsy(text) => warn!("received BSY: {text}"),
        Frame::Err(text) => warn!("received ERR: {text}"),
        other => return Err(invalid_frame(&other, wire).await),
    }
    Ok(RouterState::Both)
}

enum HalfOutcome {
    Continue,
    Finished,
}

/// Routing after the receiver has finished: only queue traffic remains
/// legal, and a terminal BSY/ERR ends the router.
async fn route_half(
    frame: Frame,
    xmitr_tx: &mpsc::Sender<QueueCmd>,
    wire: &WriteHandle,
) -> Result<HalfOutcome, NodeError> {
    let cmd = match frame {
        Frame::Get { id, offset } => QueueCmd::Get { id, offset },
        Frame::Got(id) => QueueCmd::Got(id),
        Frame::Skip(id) => QueueCmd::Skip(id),
        Frame::Nul(text) => {
            trace!("received NUL: {text}");
            return Ok(HalfOutcome::Continue);
        }
        Frame::Opt(options) => {
            trace!("received OPT: {options:?}");
            return Ok(HalfOutcome::Continue);
        }
        Frame::Bsy(text) => {
            warn!("received BSY: {text}");
            return Ok(HalfOutcome::Finished);
        }
        Frame::Err(text) => {
            warn!("received ERR: {text}");
            return Ok(HalfOutcome::Finished);
        }
        other => return Err(invalid_frame(&other, wire).await),
    };
    if xmitr_tx.send(cmd).await.is_err() {
        return Ok(HalfOutcome::Finished);
    }
    Ok(HalfOutcome::Continue)
}

/// Routing after the transmitter has finished: only receiver traffic
/// remains legal.
async fn route_recv_half(
    frame: Frame,
    recvr_tx: &mpsc::Sender<Frame>,
    wire: &WriteHandle,
) -> Result<HalfOutcome, NodeError> {
    match frame {
        Frame::File(_) | Frame::Eob | Frame::Data(_) => {
            if recvr_tx.send(frame).await.is_err() {
                return Ok(HalfOutcome::Finished);
            }
            Ok(HalfOutcome::Continue)
        }
        Frame::Nul(text) => {
            trace!("received NUL: {text}");
            Ok(HalfOutcome::Continue)
        }
        Frame::Opt(options) => {
            trace!("received OPT: {options:?}");
            Ok(HalfOutcome::Continue)
        }
        Frame::Bsy(text) => {
            warn!("received BSY: {text}");
            Ok(HalfOutcome::Finished)
        }
        Frame::Err(text) => {
            warn!("received ERR: {text}");
            Ok(HalfOutcome::Finished)
        }
        other => Err(invalid_frame(&other, wire).await),
    }
}

async fn invalid_frame(frame: &Frame, wire: &WriteHandle) -> NodeError {
    warn!("unexpected {} frame during transfer", frame.kind());
    wire.send_error("Invalid received frame").await;
    NodeError::Protocol(format!("unexpected {} frame during transfer", frame.kind()))
}
