//! FTN ("Fidonet Technology Network") addresses.
//!
//! An address has up to five dimensions: `zone:net/node.point@domain`.
//! Zone, point and domain are optional in the textual forms; a missing zone
//! parses as 0, a `.0` point renders (and therefore canonicalizes) to no
//! point at all, and an empty domain is omitted.

use serde::de::{self, Deserialize, Deserializer, Visitor};
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A five-dimensional FTN address.
///
/// Two addresses are equal when all five components are equal; a parsed
/// `21:100/198.0` therefore equals a parsed `21:100/198`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    zone: u32,
    net: u32,
    node: u32,
    point: u32,
    domain: String,
}

/// Errors produced when parsing the textual form of an address.
///
/// Each variant carries the full input so log lines identify the offending
/// address, matching the granularity callers report at.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    /// The zone component was empty or not an unsigned decimal number.
    #[error("invalid zone in {0:?}")]
    InvalidZone(String),
    /// The net component was empty or not an unsigned decimal number.
    #[error("invalid net in {0:?}")]
    InvalidNet(String),
    /// The node component was empty or not an unsigned decimal number.
    #[error("invalid node in {0:?}")]
    InvalidNode(String),
    /// The point component was empty or not an unsigned decimal number.
    #[error("invalid point in {0:?}")]
    InvalidPoint(String),
    /// An `@` was present but the domain after it was empty.
    #[error("invalid domain in {0:?}")]
    InvalidDomain(String),
}

impl Address {
    /// Creates an address from its five components. Pass `0` for a missing
    /// zone or point and `""` for a missing domain.
    #[must_use]
    pub fn new(zone: u32, net: u32, node: u32, point: u32, domain: impl Into<String>) -> Self {
        Self {
            zone,
            net,
            node,
            point,
            domain: domain.into(),
        }
    }

    /// The zone component, 0 when absent.
    #[must_use]
    pub const fn zone(&self) -> u32 {
        self.zone
    }

    /// The net component.
    #[must_use]
    pub const fn net(&self) -> u32 {
        self.net
    }

    /// The node component.
    #[must_use]
    pub const fn node(&self) -> u32 {
        self.node
    }

    /// The point component, 0 when absent.
    #[must_use]
    pub const fn point(&self) -> u32 {
        self.point
    }

    /// The domain component, empty when absent.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

/// Splits `s` at the first occurrence of `sep`. Returns the token before
/// the separator, the remainder after it, and whether the separator was
/// found at all (so an empty remainder can be told apart from a missing
/// separator).
fn split_on(s: &str, sep: char) -> (&str, &str, bool) {
    match s.find(sep) {
        Some(i) => (&s[..i], &s[i + sep.len_utf8()..], true),
        None => (s, "", false),
    }
}

impl FromStr for Address {
    type Err = AddressError;

    /// Parses any of the accepted syntaxes:
    ///
    /// ```text
    /// zone:net/node.point@domain   (5d)
    /// zone:net/node@domain         (5d, no point)
    /// zone:net/node.point          (4d)
    /// zone:net/node                (3d)
    /// net/node                     (2d)
    /// ```
    ///
    /// The input splits on `:`, `/`, `.` and `@` in that order: without a
    /// `:` the leading token is the net, a point is only recognized after
    /// `.`, and the domain follows the `@` of the point when one is present
    /// and of the node otherwise.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        let (zone_str, rest, has_zone) = split_on(input, ':');
        let addr = if has_zone { rest } else { zone_str };
        let (net_str, addr, _) = split_on(addr, '/');
        let (node_str, point_str, has_point) = split_on(addr, '.');

        let (node_str, point_str, domain, has_domain) = if has_point {
            let (point_str, domain, has_domain) = split_on(point_str, '@');
            (node_str, point_str, domain, has_domain)
        } else {
            let (node_str, domain, has_domain) = split_on(node_str, '@');
            (node_str, "", domain, has_domain)
        };

        let zone = if has_zone {
            zone_str
                .parse()
                .map_err(|_| AddressError::InvalidZone(s.to_string()))?
        } else {
            0
        };
        let net = net_str
            .parse()
            .map_err(|_| AddressError::InvalidNet(s.to_string()))?;
        let node = node_str
            .parse()
            .map_err(|_| AddressError::InvalidNode(s.to_string()))?;
        let point = if has_point {
            point_str
                .parse()
                .map_err(|_| AddressError::InvalidPoint(s.to_string()))?
        } else {
            0
        };
        if has_domain && domain.is_empty() {
            return Err(AddressError::InvalidDomain(s.to_string()));
        }

        Ok(Self::new(zone, net, node, point, domain))
    }
}

impl fmt::Display for Address {
    /// Renders the canonical textual form, omitting a zero zone, a zero
    /// point and an empty domain.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.zone != 0 {
            write!(f, "{}:", self.zone)?;
        }
        write!(f, "{}/{}", self.net, self.node)?;
        if self.point != 0 {
            write!(f, ".{}", self.point)?;
        }
        if !self.domain.is_empty() {
            write!(f, "@{}", self.domain)?;
        }
        Ok(())
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AddressVisitor;

        impl Visitor<'_> for AddressVisitor {
            type Value = Address;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an FTN address string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Address, E> {
                v.parse().map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_str(AddressVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(input: &str, expected: &str) {
        let addr: Address = input.parse().unwrap_or_else(|e| panic!("{input:?}: {e}"));
        assert_eq!(addr.to_string(), expected, "rendering {input:?}");
    }

    fn rejects(input: &str) {
        assert!(
            input.parse::<Address>().is_err(),
            "unexpected success parsing {input:?}"
        );
    }

    #[test]
    fn renders_each_dimension() {
        assert_eq!(
            Address::new(21, 100, 198, 0, "fsxnet").to_string(),
            "21:100/198@fsxnet"
        );
        assert_eq!(
            Address::new(21, 100, 198, 1, "fsxnet").to_string(),
            "21:100/198.1@fsxnet"
        );
        assert_eq!(Address::new(21, 100, 198, 1, "").to_string(), "21:100/198.1");
        assert_eq!(Address::new(21, 100, 198, 0, "").to_string(), "21:100/198");
        assert_eq!(Address::new(0, 100, 198, 0, "").to_string(), "100/198");
    }

    #[test]
    fn parses_five_dimensions() {
        roundtrip("21:100/198.1@fsxnet", "21:100/198.1@fsxnet");
        roundtrip("21:100/198.0@fsxnet", "21:100/198@fsxnet");
        roundtrip("21:100/198@fsxnet", "21:100/198@fsxnet");
        roundtrip("21:1/100@fsxnet", "21:1/100@fsxnet");
        roundtrip("21:1/0@fsxnet", "21:1/0@fsxnet");
        roundtrip("21:0/0@fsxnet", "21:0/0@fsxnet");
    }

    #[test]
    fn parses_four_and_fewer_dimensions() {
        roundtrip("21:100/198.1", "21:100/198.1");
        roundtrip("21:100/198.0", "21:100/198");
        roundtrip("21:100/198", "21:100/198");
        roundtrip("100/198", "100/198");
    }

    #[test]
    fn point_zero_equals_no_point() {
        let a: Address = "21:100/198.0".parse().unwrap();
        let b: Address = "21:100/198".parse().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn surrounding_whitespace_is_ignored() {
        roundtrip("  21:1/100@fsxnet  ", "21:1/100@fsxnet");
    }

    #[test]
    fn rejects_invalid_zone() {
        rejects(":100/198@fsxnet");
        rejects(":100/198.1@fsxnet");
        rejects("aaa:100/198@fsxnet");
    }

    #[test]
    fn rejects_invalid_net() {
        rejects("21:/198@fsxnet");
        rejects("21:aaa/198");
        rejects("aaa/198");
    }

    #[test]
    fn rejects_invalid_node() {
        rejects("21:100/");
        rejects("21:100/.0@fsxnet");
        rejects("21:100/.1");
        rejects("21:100/aaa.0");
        rejects("100/");
        rejects("100/.123");
    }

    #[test]
    fn rejects_invalid_point() {
        rejects("21:100/198.");
        rejects("21:100/198.aaa");
        rejects("21:100/198.@fsxnet");
        rejects("21:100/198.aaa@fsxnet");
        rejects("100/198.aaa@fsxnet");
    }

    #[test]
    fn rejects_missing_separators() {
        rejects("21:.0");
        rejects("21:100.0");
        rejects("21:100@fsxnet");
        rejects("21:@fsxnet");
        rejects("@");
    }

    #[test]
    fn rejects_empty_domain() {
        rejects("21:100/198@");
        rejects("21:100/198.1@");
    }

    #[test]
    fn rejects_negative_components() {
        rejects("-1:100/198");
        rejects("21:100/-198");
    }

    #[test]
    fn serde_uses_the_textual_form() {
        let addr: Address = "21:1/100@fsxnet".parse().unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"21:1/100@fsxnet\"");
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
