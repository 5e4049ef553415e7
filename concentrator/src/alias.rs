// SPDX-License-Identifier: Apache-2.0
// Copyright Cloud Concentrator Authors

//! Durable device aliases.
//!
//! The alias attribute on a kernel device is the only state that survives a
//! concentrator restart, so it must carry the full logical identity of the
//! device: `br_<ip>+<len>` for a subnet bridge, `gre_<ip>+<len>##<peer>` for
//! a subnet tunnel. Subnets are truncated to their network address on both
//! encode and decode, so every alias has exactly one canonical spelling.

use core::fmt::{Display, Formatter};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// Alias prefix for tenant-subnet bridges.
pub const BRIDGE_PREFIX: &str = "br_";
/// Alias prefix for subnet tunnels.
pub const TUNNEL_PREFIX: &str = "gre_";
/// Separates the encoded subnet from the peer address in a tunnel alias.
const PEER_SEPARATOR: &str = "##";

/// Render a subnet for embedding in an alias (`/` becomes `+`).
#[must_use]
pub fn encode_subnet(subnet: Ipv4Net) -> String {
    subnet.trunc().to_string().replace('/', "+")
}

/// Decode a subnet embedded in an alias.
///
/// # Errors
///
/// Returns [`AliasError::Subnet`] if `text` is not an encoded IPv4 CIDR.
pub fn decode_subnet(text: &str) -> Result<Ipv4Net, AliasError> {
    text.replace('+', "/")
        .parse::<Ipv4Net>()
        .map(|subnet| subnet.trunc())
        .map_err(|_| AliasError::Subnet(text.to_string()))
}

/// Failures decoding an alias found on a kernel device.
#[derive(Clone, Debug, Eq, PartialEq, Hash, thiserror::Error)]
pub enum AliasError {
    #[error("{0} does not carry a recognized alias prefix")]
    Prefix(String),
    #[error("{0} is not an encoded IPv4 subnet")]
    Subnet(String),
    #[error("{0} does not name a peer address")]
    Peer(String),
}

/// The durable identity of a tenant-subnet bridge.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct BridgeAlias {
    subnet: Ipv4Net,
    text: String,
}

impl BridgeAlias {
    #[must_use]
    pub fn new(subnet: Ipv4Net) -> Self {
        let subnet = subnet.trunc();
        Self {
            text: format!("{BRIDGE_PREFIX}{}", encode_subnet(subnet)),
            subnet,
        }
    }

    /// Decode an alias read back from a kernel device.
    ///
    /// # Errors
    ///
    /// Returns an [`AliasError`] when the prefix or the embedded subnet is
    /// not recognized.
    pub fn parse(text: &str) -> Result<Self, AliasError> {
        let encoded = text
            .strip_prefix(BRIDGE_PREFIX)
            .ok_or_else(|| AliasError::Prefix(text.to_string()))?;
        Ok(Self::new(decode_subnet(encoded)?))
    }

    #[must_use]
    pub fn subnet(&self) -> Ipv4Net {
        self.subnet
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl Display for BridgeAlias {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.text)
    }
}

impl AsRef<str> for BridgeAlias {
    fn as_ref(&self) -> &str {
        &self.text
    }
}

/// The durable identity of a subnet tunnel: the subnet it carries and the
/// remote compute node it reaches.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct TunnelAlias {
    subnet: Ipv4Net,
    peer: Ipv4Addr,
    text: String,
}

impl TunnelAlias {
    #[must_use]
    pub fn new(subnet: Ipv4Net, peer: Ipv4Addr) -> Self {
        let subnet = subnet.trunc();
        Self {
            text: format!(
                "{TUNNEL_PREFIX}{}{PEER_SEPARATOR}{peer}",
                encode_subnet(subnet)
            ),
            subnet,
            peer,
        }
    }

    /// Decode an alias read back from a kernel device.
    ///
    /// # Errors
    ///
    /// Returns an [`AliasError`] when the prefix, the embedded subnet, or
    /// the peer address is not recognized.
    pub fn parse(text: &str) -> Result<Self, AliasError> {
        let body = text
            .strip_prefix(TUNNEL_PREFIX)
            .ok_or_else(|| AliasError::Prefix(text.to_string()))?;
        let (encoded, peer) = body
            .split_once(PEER_SEPARATOR)
            .ok_or_else(|| AliasError::Peer(text.to_string()))?;
        let subnet = decode_subnet(encoded)?;
        let peer = peer
            .parse::<Ipv4Addr>()
            .map_err(|_| AliasError::Peer(text.to_string()))?;
        Ok(Self::new(subnet, peer))
    }

    /// The alias of the bridge this tunnel belongs to.
    #[must_use]
    pub fn bridge_alias(&self) -> BridgeAlias {
        BridgeAlias::new(self.subnet)
    }

    #[must_use]
    pub fn subnet(&self) -> Ipv4Net {
        self.subnet
    }

    #[must_use]
    pub fn peer(&self) -> Ipv4Addr {
        self.peer
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl Display for TunnelAlias {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.text)
    }
}

impl AsRef<str> for TunnelAlias {
    fn as_ref(&self) -> &str {
        &self.text
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bridge_alias_spelling() {
        let alias = BridgeAlias::new("192.168.8.0/21".parse().unwrap());
        assert_eq!(alias.as_str(), "br_192.168.8.0+21");
    }

    #[test]
    fn tunnel_alias_spelling() {
        let alias = TunnelAlias::new(
            "192.168.8.0/21".parse().unwrap(),
            "10.0.0.5".parse().unwrap(),
        );
        assert_eq!(alias.as_str(), "gre_192.168.8.0+21##10.0.0.5");
        assert_eq!(alias.bridge_alias().as_str(), "br_192.168.8.0+21");
    }

    #[test]
    fn host_bits_are_truncated() {
        let alias = BridgeAlias::new("10.1.0.77/24".parse().unwrap());
        assert_eq!(alias.as_str(), "br_10.1.0.0+24");
        assert_eq!(alias.subnet(), "10.1.0.0/24".parse::<Ipv4Net>().unwrap());
    }

    #[test]
    fn bridge_alias_round_trips() {
        bolero::check!().with_type().for_each(|alias: &BridgeAlias| {
            let parsed = BridgeAlias::parse(alias.as_str()).unwrap();
            assert_eq!(*alias, parsed);
        });
    }

    #[test]
    fn tunnel_alias_round_trips() {
        bolero::check!().with_type().for_each(|alias: &TunnelAlias| {
            let parsed = TunnelAlias::parse(alias.as_str()).unwrap();
            assert_eq!(*alias, parsed);
        });
    }

    #[test]
    fn foreign_aliases_rejected() {
        assert!(matches!(
            BridgeAlias::parse("vnic_10.1.0.0+24"),
            Err(AliasError::Prefix(_))
        ));
        assert!(matches!(
            BridgeAlias::parse("br_not-a-subnet"),
            Err(AliasError::Subnet(_))
        ));
        assert!(matches!(
            TunnelAlias::parse("gre_10.1.0.0+24"),
            Err(AliasError::Peer(_))
        ));
        assert!(matches!(
            TunnelAlias::parse("gre_10.1.0.0+24##nope"),
            Err(AliasError::Peer(_))
        ));
    }
}
