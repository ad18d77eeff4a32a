//! ternd — a BinkP store-and-forward mailer node.
//!
//! The node listens for inbound TCP sessions on the BinkP port and can dial
//! peers on demand. Each session negotiates identity, authenticates the
//! peer with CRAM, then concurrently receives and transmits a batch of
//! files against a durable on-disk spool.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Configuration file parsing and the link index.
pub mod config;
/// Error types for node operation.
pub mod error;
/// Listener- and dialer-role session entry points.
pub mod handshake;
mod maildir;
/// The TCP accept loop and dial-out path.
pub mod server;
/// Per-connection frame I/O tasks and session state.
pub mod session;
/// The crash-safe maildir spool.
pub mod spool;
mod transfer;
