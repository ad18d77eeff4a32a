//! Node configuration.
//!
//! The configuration file is JSON5 text naming the operator, the networks
//! this node has joined, and for each network the links it exchanges files
//! with. Links carry the shared CRAM secret and the inbound/outbound spool
//! directories, and are indexed by peer address for O(1) lookup when an ADR
//! frame arrives.

use crate::spool::Spool;
use serde::de;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tern_proto::Address;
use thiserror::Error;

/// Errors surfaced while loading the configuration. These are fatal at
/// startup; no session exists yet.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("error reading configuration file: {0}")]
    Io(#[from] std::io::Error),
    /// The file was not valid JSON5 or failed field validation.
    #[error("error parsing configuration: {0}")]
    Parse(#[from] json5::Error),
}

/// The system's configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Operator name, exchanged as the ZYZ handshake line.
    #[serde(default)]
    pub admin: String,
    /// System name, exchanged as the SYS handshake line.
    #[serde(default)]
    pub system: String,
    /// Physical location, exchanged as the LOC handshake line.
    #[serde(default)]
    pub location: String,
    /// Networks this node has joined.
    #[serde(default)]
    pub nets: Vec<Net>,
    #[serde(skip)]
    links: HashMap<Address, Link>,
}

/// A network this node has joined.
#[derive(Debug, Clone, Deserialize)]
pub struct Net {
    /// Human-readable network name.
    pub name: String,
    /// Our address within the network.
    pub address: Address,
    /// Peers we exchange files with on this network.
    #[serde(default)]
    pub links: Vec<Link>,
}

/// A configured peer.
#[derive(Debug, Clone, Deserialize)]
pub struct Link {
    /// The peer's address.
    pub address: Address,
    /// Shared secret for CRAM authentication.
    pub password: String,
    /// Spool that receives files from this peer.
    #[serde(rename = "in")]
    pub in_spool: Spool,
    /// Spool holding files queued for this peer.
    #[serde(rename = "out")]
    pub out_spool: Spool,
    /// How often to poll the peer, e.g. `"4h"`.
    #[serde(default)]
    pub poll: Option<PollInterval>,
}

/// A poll interval, written in the config as a duration string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollInterval(pub Duration);

impl<'de> Deserialize<'de> for PollInterval {
    fn deserialize<D: de::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text)
            .map(PollInterval)
            .map_err(de::Error::custom)
    }
}

impl Config {
    /// Parses a configuration from JSON5 text and builds the link index.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the text is not valid JSON5 or a
    /// field fails to parse.
    pub fn parse_str(data: &str) -> Result<Self, ConfigError> {
        let mut config: Self = json5::from_str(data)?;
        config.links = config
            .nets
            .iter()
            .flat_map(|net| net.links.iter())
            .map(|link| (link.address.clone(), link.clone()))
            .collect();
        Ok(config)
    }

    /// Reads and parses the configuration file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read or parsed.
    pub fn parse_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Self::parse_str(&data)
    }

    /// Looks up the link configured for a peer address.
    #[must_use]
    pub fn link_for(&self, address: &Address) -> Option<&Link> {
        self.links.get(address)
    }

    /// All configured links, across every net.
    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.nets.iter().flat_map(|net| net.links.iter())
    }

    /// Our own addresses, one per joined net, in configuration order.
    /// These are advertised in the handshake ADR frame.
    #[must_use]
    pub fn addresses(&self) -> Vec<Address> {
        self.nets.iter().map(|net| net.address.clone()).collect()
    }
}
