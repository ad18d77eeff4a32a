//! Wire-level building blocks shared by the tern BinkP node.
//!
//! This crate provides:
//! - FTN address parsing and rendering ([`address`])
//! - The BinkP binary frame model and codec ([`frame`])
//! - CRAM challenge-response authentication ([`cram`])
//!
//! Nothing here touches a socket; the session engine in `ternd` drives the
//! codec over TCP.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod address;
pub mod cram;
pub mod frame;

pub use address::Address;
pub use frame::Frame;
