//! CRAM challenge-response authentication.
//!
//! The answering side of a session generates a random 128-bit challenge and
//! advertises it as `CRAM-<hash>-<hex>`; the originating side responds with
//! `CRAM-<hash>-<hex(HMAC(password, challenge))>`. Validation recomputes the
//! HMAC and compares in constant time.

use hmac::{Hmac, Mac};
use md5::Md5;
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Length in bytes of a generated challenge.
pub const CHALLENGE_LEN: usize = 16;

/// HMAC hash functions usable in a CRAM exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashKind {
    /// HMAC-MD5, the baseline every BinkP implementation speaks.
    #[default]
    Md5,
    /// HMAC-SHA1.
    Sha1,
    /// HMAC-SHA256.
    Sha256,
}

/// Errors produced by the CRAM helpers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CramError {
    /// The hash name in a `CRAM-<hash>-<hex>` token is not supported.
    #[error("unknown hash type {0:?}")]
    UnknownHash(String),
    /// Challenge text was not valid hexadecimal.
    #[error("invalid hex in challenge")]
    InvalidHex,
}

impl HashKind {
    /// The canonical name used in `CRAM-<hash>-...` tokens.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
        }
    }
}

impl fmt::Display for HashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashKind {
    type Err = CramError;

    /// Hash names are matched case-insensitively; peers differ on the case
    /// they advertise.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            _ => Err(CramError::UnknownHash(s.to_string())),
        }
    }
}

/// Generates a cryptographically random 128-bit challenge.
#[must_use]
pub fn generate_challenge() -> [u8; CHALLENGE_LEN] {
    let mut challenge = [0u8; CHALLENGE_LEN];
    OsRng.fill_bytes(&mut challenge);
    challenge
}

/// Renders challenge bytes as the lowercase hex used on the wire.
#[must_use]
pub fn challenge_to_hex(challenge: &[u8]) -> String {
    hex::encode(challenge)
}

/// Decodes the hex form of a challenge back into bytes.
///
/// # Errors
///
/// Returns [`CramError::InvalidHex`] when the text is not valid hex.
pub fn decode_challenge(challenge: &str) -> Result<Vec<u8>, CramError> {
    hex::decode(challenge).map_err(|_| CramError::InvalidHex)
}

fn hmac_digest(hash: HashKind, challenge: &[u8], password: &str) -> Vec<u8> {
    // HMAC accepts keys of any length, so construction cannot fail.
    match hash {
        HashKind::Md5 => {
            let mut mac =
                Hmac::<Md5>::new_from_slice(password.as_bytes()).expect("HMAC takes any key size");
            mac.update(challenge);
            mac.finalize().into_bytes().to_vec()
        }
        HashKind::Sha1 => {
            let mut mac =
                Hmac::<Sha1>::new_from_slice(password.as_bytes()).expect("HMAC takes any key size");
            mac.update(challenge);
            mac.finalize().into_bytes().to_vec()
        }
        HashKind::Sha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(password.as_bytes())
                .expect("HMAC takes any key size");
            mac.update(challenge);
            mac.finalize().into_bytes().to_vec()
        }
    }
}

/// Computes the lowercase-hex response to `challenge` keyed by `password`.
#[must_use]
pub fn generate_response(hash: HashKind, challenge: &[u8], password: &str) -> String {
    hex::encode(hmac_digest(hash, challenge, password))
}

/// Returns true iff `response` (lowercase or uppercase hex) is a correct
/// reply to `challenge` under `password`.
///
/// The MAC comparison is constant-time; an attacker cannot learn a prefix of
/// the expected response from timing.
#[must_use]
pub fn validate_response(hash: HashKind, challenge: &[u8], response: &str, password: &str) -> bool {
    let Ok(response) = hex::decode(response) else {
        return false;
    };
    let expected = hmac_digest(hash, challenge, password);
    response.len() == expected.len() && bool::from(response.ct_eq(&expected))
}
