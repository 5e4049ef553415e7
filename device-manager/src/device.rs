// SPDX-License-Identifier: Apache-2.0
// Copyright Cloud Concentrator Authors

//! Typed adapters over [`Netlink`] for the device kinds the overlay is
//! built from.
//!
//! Each adapter is a thin description of one intended device; the kernel
//! mutations themselves are idempotence-agnostic — the topology store above
//! decides whether an operation needs to run. Errors carry the device's
//! durable identity (its alias) so a failure can be traced back to the
//! subnet or peer that owns the device.

use crate::netlink::{LinkRecord, Netlink, NetlinkError};
use net::{InterfaceIndex, InterfaceName, TunnelKey};
use std::net::Ipv4Addr;

/// Failures from a device adapter, tagged with the device kind and alias.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("bridge {alias}")]
    Bridge {
        alias: String,
        #[source]
        source: NetlinkError,
    },
    #[error("subnet tunnel {alias}")]
    GreTap {
        alias: String,
        #[source]
        source: NetlinkError,
    },
    #[error("peer tunnel {name}")]
    GreTun {
        name: InterfaceName,
        #[source]
        source: NetlinkError,
    },
    #[error("device {alias}")]
    Vnic {
        alias: String,
        #[source]
        source: NetlinkError,
    },
}

/// A tenant-subnet bridge.
#[derive(Clone, Debug)]
pub struct BridgeSpec {
    /// Durable alias (`br_<subnet>`).
    pub alias: String,
    /// Kernel device name.
    pub name: InterfaceName,
}

impl BridgeSpec {
    fn err(&self, source: NetlinkError) -> DeviceError {
        DeviceError::Bridge {
            alias: self.alias.clone(),
            source,
        }
    }

    /// Create the bridge and report its kernel index.
    pub async fn create<N: Netlink>(&self, nl: &N) -> Result<InterfaceIndex, DeviceError> {
        nl.bridge_create(&self.name, &self.alias)
            .await
            .map_err(|source| self.err(source))?;
        let record = nl
            .link_by_name(&self.name)
            .await
            .map_err(|source| self.err(source))?
            .ok_or_else(|| self.err(NetlinkError::NotFound(self.name.to_string())))?;
        Ok(record.index)
    }

    pub async fn enable<N: Netlink>(
        &self,
        nl: &N,
        index: InterfaceIndex,
    ) -> Result<(), DeviceError> {
        nl.link_enable(index).await.map_err(|source| self.err(source))
    }

    /// Populate identity from the kernel by alias, if the device exists.
    pub async fn get_device<N: Netlink>(&self, nl: &N) -> Result<Option<LinkRecord>, DeviceError> {
        nl.link_by_alias(&self.alias)
            .await
            .map_err(|source| self.err(source))
    }

    pub async fn destroy<N: Netlink>(
        &self,
        nl: &N,
        index: InterfaceIndex,
    ) -> Result<(), DeviceError> {
        nl.link_destroy(index).await.map_err(|source| self.err(source))
    }
}

/// An L2 GRE endpoint stitching one remote node into a tenant subnet.
#[derive(Clone, Debug)]
pub struct GreTapSpec {
    /// Durable alias (`gre_<subnet>##<peer>`).
    pub alias: String,
    /// Kernel device name.
    pub name: InterfaceName,
    /// Local (compute network) endpoint address.
    pub local: Ipv4Addr,
    /// Remote compute node address.
    pub remote: Ipv4Addr,
    /// GRE key carrying the subnet identity.
    pub key: TunnelKey,
}

impl GreTapSpec {
    fn err(&self, source: NetlinkError) -> DeviceError {
        DeviceError::GreTap {
            alias: self.alias.clone(),
            source,
        }
    }

    pub async fn create<N: Netlink>(&self, nl: &N) -> Result<InterfaceIndex, DeviceError> {
        nl.gretap_create(&self.name, &self.alias, self.local, self.remote, self.key)
            .await
            .map_err(|source| self.err(source))?;
        let record = nl
            .link_by_name(&self.name)
            .await
            .map_err(|source| self.err(source))?
            .ok_or_else(|| self.err(NetlinkError::NotFound(self.name.to_string())))?;
        Ok(record.index)
    }

    pub async fn enable<N: Netlink>(
        &self,
        nl: &N,
        index: InterfaceIndex,
    ) -> Result<(), DeviceError> {
        nl.link_enable(index).await.map_err(|source| self.err(source))
    }

    /// Enslave this tunnel to its bridge. Traffic flows once this returns.
    pub async fn attach<N: Netlink>(
        &self,
        nl: &N,
        index: InterfaceIndex,
        bridge: InterfaceIndex,
    ) -> Result<(), DeviceError> {
        nl.link_attach(index, bridge)
            .await
            .map_err(|source| self.err(source))
    }

    pub async fn get_device<N: Netlink>(&self, nl: &N) -> Result<Option<LinkRecord>, DeviceError> {
        nl.link_by_alias(&self.alias)
            .await
            .map_err(|source| self.err(source))
    }

    pub async fn destroy<N: Netlink>(
        &self,
        nl: &N,
        index: InterfaceIndex,
    ) -> Result<(), DeviceError> {
        nl.link_destroy(index).await.map_err(|source| self.err(source))
    }
}

/// The point-to-multipoint L3 GRE tunnel reaching peer concentrators.
///
/// A single instance exists per concentrator; it is addressed by name, not
/// alias.
#[derive(Clone, Debug)]
pub struct GreTunSpec {
    pub name: InterfaceName,
    /// Local physical endpoint address.
    pub local: Ipv4Addr,
    /// GRE key carrying the tenant identity.
    pub key: TunnelKey,
}

impl GreTunSpec {
    fn err(&self, source: NetlinkError) -> DeviceError {
        DeviceError::GreTun {
            name: self.name.clone(),
            source,
        }
    }

    pub async fn create<N: Netlink>(&self, nl: &N) -> Result<InterfaceIndex, DeviceError> {
        nl.gretun_create(&self.name, self.local, self.key)
            .await
            .map_err(|source| self.err(source))?;
        let record = nl
            .link_by_name(&self.name)
            .await
            .map_err(|source| self.err(source))?
            .ok_or_else(|| self.err(NetlinkError::NotFound(self.name.to_string())))?;
        Ok(record.index)
    }

    pub async fn enable<N: Netlink>(
        &self,
        nl: &N,
        index: InterfaceIndex,
    ) -> Result<(), DeviceError> {
        nl.link_enable(index).await.map_err(|source| self.err(source))
    }

    pub async fn get_device<N: Netlink>(&self, nl: &N) -> Result<Option<LinkRecord>, DeviceError> {
        nl.link_by_name(&self.name)
            .await
            .map_err(|source| self.err(source))
    }

    pub async fn destroy<N: Netlink>(
        &self,
        nl: &N,
        index: InterfaceIndex,
    ) -> Result<(), DeviceError> {
        nl.link_destroy(index).await.map_err(|source| self.err(source))
    }
}

/// A generic by-alias handle to a link of any kind.
///
/// Shutdown tears devices down through this after the store has forgotten
/// what kind they were. The concentrator never creates VNICs — compute-node
/// agents own that — so this adapter only looks up, adjusts and destroys.
#[derive(Clone, Debug)]
pub struct VnicRef {
    pub alias: String,
}

impl VnicRef {
    fn err(&self, source: NetlinkError) -> DeviceError {
        DeviceError::Vnic {
            alias: self.alias.clone(),
            source,
        }
    }

    pub async fn get_device<N: Netlink>(&self, nl: &N) -> Result<Option<LinkRecord>, DeviceError> {
        nl.link_by_alias(&self.alias)
            .await
            .map_err(|source| self.err(source))
    }

    pub async fn enable<N: Netlink>(
        &self,
        nl: &N,
        index: InterfaceIndex,
    ) -> Result<(), DeviceError> {
        nl.link_enable(index).await.map_err(|source| self.err(source))
    }

    pub async fn attach<N: Netlink>(
        &self,
        nl: &N,
        index: InterfaceIndex,
        controller: InterfaceIndex,
    ) -> Result<(), DeviceError> {
        nl.link_attach(index, controller)
            .await
            .map_err(|source| self.err(source))
    }

    pub async fn destroy<N: Netlink>(
        &self,
        nl: &N,
        index: InterfaceIndex,
    ) -> Result<(), DeviceError> {
        nl.link_destroy(index).await.map_err(|source| self.err(source))
    }
}
