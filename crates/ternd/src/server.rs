//! TCP surface of the node: the accept loop and the dial-out path.

use crate::config::Config;
use crate::error::NodeError;
use crate::handshake;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

/// The well-known BinkP port.
pub const BINKP_PORT: u16 = 24554;

/// Accepts inbound connections forever, answering each with a listener-role
/// session in its own task.
///
/// # Errors
///
/// Returns an error only if the listener's local address cannot be read;
/// per-connection failures are logged and do not stop the loop.
pub async fn run(listener: TcpListener, config: Arc<Config>) -> Result<(), NodeError> {
    let local_addr = listener.local_addr()?;
    info!("listening on {local_addr}");

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("answering session from {addr}");
                let config = Arc::clone(&config);
                tokio::spawn(async move {
                    match handshake::run_listener(config, stream).await {
                        Ok(()) => info!("session with {addr} successful"),
                        Err(e) => warn!("session with {addr} failed: {e}"),
                    }
                });
            }
            Err(e) => {
                error!("failed to accept connection: {e}");
            }
        }
    }
}

/// Dials `host` (port defaulting to [`BINKP_PORT`]) and runs one
/// dialer-role session against it.
///
/// # Errors
///
/// Returns an error if the dial fails or the session does.
pub async fn poll(config: Arc<Config>, host: &str) -> Result<(), NodeError> {
    let target = if host.contains(':') {
        host.to_string()
    } else {
        format!("{host}:{BINKP_PORT}")
    };
    info!("polling {target}");
    let stream = TcpStream::connect(&target).await?;
    handshake::run_dialer(config, stream).await
}
