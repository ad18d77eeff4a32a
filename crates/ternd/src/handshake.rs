//! Role-specific session negotiation.
//!
//! The listener (answering) side opens with a CRAM challenge, identity
//! metadata and its addresses, then demands a CRAM response for the link
//! matching the peer's ADR. The dialer (originating) side sends the same
//! metadata, captures the challenge from the peer's OPT, answers it, and
//! waits for OK. Both machines hand authenticated sessions to the transfer
//! engine.
//!
//! Each machine is a small state enum stepped by a total `match`; a step
//! either yields the next state, finishes, or fails the session.

use crate::config::Config;
use crate::error::NodeError;
use crate::session::{drain_tasks, Session};
use crate::transfer;
use chrono::Utc;
use std::sync::Arc;
use tern_proto::cram;
use tern_proto::frame::Frame;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

const VERSION_LINE: &str = concat!("ternd/", env!("CARGO_PKG_VERSION"), " binkp/1.0");

/// Runs a full session in the listener (answering) role over `stream`.
///
/// # Errors
///
/// Returns the first error reported by the handshake, the transfer engine
/// or the session I/O tasks.
pub async fn run_listener<S>(config: Arc<Config>, stream: S) -> Result<(), NodeError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (session, io_tasks, cancel) = Session::start(config, stream);
    let result = drive(session, Role::Listener).await;
    cancel.cancel();
    let io_result = drain_tasks(io_tasks).await;
    root_cause(result, io_result)
}

/// Runs a full session in the dialer (originating) role over `stream`.
///
/// # Errors
///
/// Returns the first error reported by the handshake, the transfer engine
/// or the session I/O tasks.
pub async fn run_dialer<S>(config: Arc<Config>, stream: S) -> Result<(), NodeError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (session, io_tasks, cancel) = Session::start(config, stream);
    let result = drive(session, Role::Dialer).await;
    cancel.cancel();
    let io_result = drain_tasks(io_tasks).await;
    root_cause(result, io_result)
}

enum Role {
    Listener,
    Dialer,
}

/// Picks the error to report for the session. A state machine that died
/// because its channels closed is a symptom; the I/O task that closed them
/// holds the cause.
fn root_cause(
    result: Result<(), NodeError>,
    io_result: Result<(), NodeError>,
) -> Result<(), NodeError> {
    match (&result, &io_result) {
        (Err(NodeError::SessionClosed), Err(_)) => io_result,
        (Err(_), _) => result,
        (Ok(()), _) => io_result,
    }
}

async fn drive(mut session: Session, role: Role) -> Result<(), NodeError> {
    let authenticated = match role {
        Role::Listener => listener_handshake(&mut session).await?,
        Role::Dialer => dialer_handshake(&mut session).await?,
    };
    if !authenticated {
        // Cancelled mid-handshake; someone else holds the error, if any.
        return Ok(());
    }
    transfer::start(session).await
}

/// Identity metadata sent by both roles at session start.
fn metadata_frames(config: &Config) -> Vec<Frame> {
    vec![
        Frame::Nul(format!("SYS {}", config.system)),
        Frame::Nul(format!("ZYZ {}", config.admin)),
        Frame::Nul(format!("LOC {}", config.location)),
        Frame::Nul(format!("VER {VERSION_LINE}")),
        Frame::Nul(format!("TIME {}", Utc::now().to_rfc2822())),
        Frame::Adr(config.addresses()),
    ]
}

enum ListenerState {
    Start,
    WaitForAddress,
    WaitForPasswd,
}

/// Drives the listener handshake to authentication. Returns `false` when
/// the session was cancelled before completing.
async fn listener_handshake(session: &mut Session) -> Result<bool, NodeError> {
    let mut state = ListenerState::Start;
    loop {
        state = match state {
            ListenerState::Start => {
                let challenge = cram::generate_challenge();
                let mut frames = vec![Frame::challenge(
                    session.hash.as_str(),
                    &cram::challenge_to_hex(&challenge),
                )];
                frames.extend(metadata_frames(&session.config));
                session.challenge = Some(challenge.to_vec());
                session.wire.write_sync_frames(frames).await?;
                ListenerState::WaitForAddress
            }
            ListenerState::WaitForAddress => {
                let Some(frame) = session.next_frame().await? else {
                    return Ok(false);
                };
                match frame {
                    Frame::Adr(addrs) => {
                        debug!("received ADR: {addrs:?}");
                        let Some(link) = session.link_addresses(addrs) else {
                            warn!("no link matches any peer address");
                            return Err(NodeError::Unlinked);
                        };
                        debug!("linked session with {}", link.address);
                        ListenerState::WaitForPasswd
                    }
                    Frame::Nul(text) => {
                        debug!("received NUL: {text}");
                        ListenerState::WaitForAddress
                    }
                    Frame::Opt(options) => {
                        debug!("received OPT: {options:?}");
                        ListenerState::WaitForAddress
                    }
                    Frame::Err(text) => return Err(NodeError::PeerError(text)),
                    Frame::Bsy(text) => return Err(NodeError::PeerBusy(text)),
                    other => return unexpected_frame(session, &other).await,
                }
            }
            ListenerState::WaitForPasswd => {
                let Some(frame) = session.next_frame().await? else {
                    return Ok(false);
                };
                match frame {
                    Frame::Pwd(password) => {
                        check_password(session, &password).await?;
                        info!("peer authenticated");
                        return Ok(true);
                    }
                    Frame::Nul(text) => {
                        debug!("received NUL: {text}");
                        ListenerState::WaitForPasswd
                    }
                    Frame::Opt(options) => {
                        debug!("received OPT: {options:?}");
                        ListenerState::WaitForPasswd
                    }
                    Frame::Err(text) => return Err(NodeError::PeerError(text)),
                    Frame::Bsy(text) => return Err(NodeError::PeerBusy(text)),
                    other => return unexpected_frame(session, &other).await,
                }
            }
        }
    }
}

/// Validates the peer's PWD frame against the matched link's secret. Only
/// CRAM responses are acceptable; empty and cleartext passwords are
/// rejected outright.
async fn check_password(session: &mut Session, password: &str) -> Result<(), NodeError> {
    if password == "-" {
        session.wire.send_error("Empty passwords are unsupported").await;
        return Err(NodeError::Auth("unsupported empty password".to_string()));
    }
    if !password.starts_with("CRAM-") {
        session
            .wire
            .send_error("Cleartext passwords are unsupported")
            .await;
        return Err(NodeError::Auth("unsupported cleartext password".to_string()));
    }
    let fields: Vec<&str> = password.split('-').collect();
    if fields.len() != 3 {
        session.wire.send_error("Malformed challenge response").await;
        return Err(NodeError::Auth(format!(
            "malformed challenge response: {password:?}"
        )));
    }

    let Some(challenge) = session.challenge.as_deref() else {
        return Err(NodeError::Auth("no challenge outstanding".to_string()));
    };
    let Some(link) = session.link.as_ref() else {
        return Err(NodeError::Auth("no link matched".to_string()));
    };
    let valid = fields[1].parse().is_ok_and(|hash| {
        cram::validate_response(hash, challenge, fields[2], &link.password)
    });
    if !valid {
        session.wire.send_error("Invalid password").await;
        return Err(NodeError::Auth("password validation failed".to_string()));
    }

    session
        .wire
        .write_sync_frame(Frame::Ok("secure".to_string()))
        .await?;
    Ok(())
}

enum DialerState {
    Start,
    WaitForAddress,
    SendResponse,
    WaitForOk,
}

/// Drives the dialer handshake to authentication. Returns `false` when the
/// session was cancelled before completing.
async fn dialer_handshake(session: &mut Session) -> Result<bool, NodeError> {
    let mut state = DialerState::Start;
    loop {
        state = match state {
            DialerState::Start => {
                session
                    .wire
                    .write_sync_frames(metadata_frames(&session.config))
                    .await?;
                DialerState::WaitForAddress
            }
            DialerState::WaitForAddress => {
                let Some(frame) = session.next_frame().await? else {
                    return Ok(false);
                };
                match frame {
                    Frame::Adr(addrs) => {
                        debug!("received ADR: {addrs:?}");
                        if session.link_addresses(addrs).is_none() {
                            warn!("no link matches any peer address");
                            return Err(NodeError::Unlinked);
                        }
                        DialerState::SendResponse
                    }
                    Frame::Opt(options) => {
                        debug!("received OPT: {options:?}");
                        if let Some(text) = options.iter().find(|o| o.starts_with("CRAM-")) {
                            save_challenge(session, text).await?;
                        }
                        DialerState::WaitForAddress
                    }
                    Frame::Nul(text) => {
                        debug!("received NUL: {text}");
                        DialerState::WaitForAddress
                    }
                    Frame::Err(text) => return Err(NodeError::PeerError(text)),
                    Frame::Bsy(text) => return Err(NodeError::PeerBusy(text)),
                    other => return unexpected_frame(session, &other).await,
                }
            }
            DialerState::SendResponse => {
                let Some(challenge) = session.challenge.as_deref() else {
                    // Plaintext fallback is a non-goal; without a challenge
                    // there is nothing we are willing to send.
                    session.wire.send_error("No CRAM challenge offered").await;
                    return Err(NodeError::Auth("peer offered no CRAM challenge".to_string()));
                };
                let Some(link) = session.link.as_ref() else {
                    return Err(NodeError::Auth("no link matched".to_string()));
                };
                let response = cram::generate_response(session.hash, challenge, &link.password);
                session
                    .wire
                    .write_sync_frame(Frame::cram_response(session.hash.as_str(), &response))
                    .await?;
                DialerState::WaitForOk
            }
            DialerState::WaitForOk => {
                let Some(frame) = session.next_frame().await? else {
                    return Ok(false);
                };
                match frame {
                    Frame::Ok(text) => {
                        info!("authenticated to peer: {text}");
                        return Ok(true);
                    }
                    Frame::Nul(text) => {
                        debug!("received NUL: {text}");
                        DialerState::WaitForOk
                    }
                    Frame::Opt(options) => {
                        debug!("received OPT: {options:?}");
                        DialerState::WaitForOk
                    }
                    Frame::Err(text) => return Err(NodeError::PeerError(text)),
                    Frame::Bsy(text) => return Err(NodeError::PeerBusy(text)),
                    other => return unexpected_frame(session, &other).await,
                }
            }
        }
    }
}

/// Captures the hash kind and challenge bytes out of a `CRAM-<hash>-<hex>`
/// option token.
async fn save_challenge(session: &mut Session, text: &str) -> Result<(), NodeError> {
    let fields: Vec<&str> = text.split('-').collect();
    if fields.len() != 3 {
        session.wire.send_error("Malformed challenge").await;
        return Err(NodeError::Auth(format!("malformed challenge: {text:?}")));
    }
    let hash = match fields[1].parse() {
        Ok(hash) => hash,
        Err(e) => {
            session.wire.send_error("Unsupported challenge hash").await;
            return Err(NodeError::Auth(format!("challenge hash: {e}")));
        }
    };
    let challenge = match cram::decode_challenge(fields[2]) {
        Ok(challenge) => challenge,
        Err(e) => {
            session.wire.send_error("Challenge decode failed").await;
            return Err(NodeError::Auth(format!(
                "failed to decode challenge {text:?}: {e}"
            )));
        }
    };
    session.hash = hash;
    session.challenge = Some(challenge);
    Ok(())
}

/// Reports a frame no handshake state accepts and fails the session.
async fn unexpected_frame(session: &Session, frame: &Frame) -> Result<bool, NodeError> {
    warn!("unexpected {} frame during handshake", frame.kind());
    session.wire.send_error("Invalid received frame").await;
    Err(NodeError::Protocol(format!(
        "unexpected {} frame during handshake",
        frame.kind()
    )))
}
