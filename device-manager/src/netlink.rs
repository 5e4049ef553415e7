// SPDX-License-Identifier: Apache-2.0
// Copyright Cloud Concentrator Authors

//! The kernel-facing contract consumed by the topology core.

use ipnet::Ipv4Net;
use net::{InterfaceIndex, InterfaceName, TunnelKey};
use std::future::Future;
use std::net::Ipv4Addr;

/// The kind of a kernel link, as far as the overlay cares.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum LinkKind {
    /// A physical device (no link-info kind reported).
    Physical,
    /// The loopback device.
    Loopback,
    /// A software bridge.
    Bridge,
    /// An L2-over-GRE tunnel endpoint.
    GreTap,
    /// An L3 GRE tunnel endpoint.
    GreTun,
    /// Anything else (veth, vlan, ...).
    Other,
}

/// One observed kernel link.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LinkRecord {
    pub index: InterfaceIndex,
    pub name: InterfaceName,
    /// The durable alias attribute, if one is set.
    pub alias: Option<String>,
    pub kind: LinkKind,
    /// The controller (bridge) this link is enslaved to, if any.
    pub controller: Option<InterfaceIndex>,
}

/// One IPv4 address assigned to a link.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AddressRecord {
    pub address: Ipv4Addr,
    pub prefix_len: u8,
}

/// One IPv4 neighbor table entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NeighborRecord {
    pub link: InterfaceIndex,
    pub destination: Ipv4Addr,
    /// For NBMA tunnels the link-layer address is itself an IPv4 address.
    pub lladdr: Option<Ipv4Addr>,
    pub permanent: bool,
}

/// One IPv4 route.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RouteRecord {
    pub link: Option<InterfaceIndex>,
    /// `None` is the default route.
    pub destination: Option<Ipv4Net>,
    pub gateway: Option<Ipv4Addr>,
}

/// Errors surfaced by a [`Netlink`] backend.
#[derive(Debug, thiserror::Error)]
pub enum NetlinkError {
    #[error("netlink request failed")]
    Request(#[source] rtnetlink::Error),
    #[error("no kernel entry found for {0}")]
    NotFound(String),
    #[error("device name {0} is already in use")]
    NameInUse(InterfaceName),
    #[error("failed to write {path}")]
    Sysctl {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[cfg(any(test, feature = "testing"))]
    #[error("injected fault for {0}")]
    Injected(String),
}

impl From<rtnetlink::Error> for NetlinkError {
    fn from(source: rtnetlink::Error) -> Self {
        NetlinkError::Request(source)
    }
}

/// Kernel operations the overlay needs.
///
/// Implementations must be callable from concurrent tasks; every method takes
/// `&self` and returns a `Send` future. All operations address links by
/// index once created; creation and lookup go by name or by the durable
/// alias attribute.
pub trait Netlink: Send + Sync {
    /// Enumerate every link in the namespace.
    fn link_list(&self) -> impl Future<Output = Result<Vec<LinkRecord>, NetlinkError>> + Send;

    /// Look a link up by kernel name.
    fn link_by_name(
        &self,
        name: &InterfaceName,
    ) -> impl Future<Output = Result<Option<LinkRecord>, NetlinkError>> + Send;

    /// Look a link up by its alias attribute.
    fn link_by_alias(
        &self,
        alias: &str,
    ) -> impl Future<Output = Result<Option<LinkRecord>, NetlinkError>> + Send;

    /// Create a bridge carrying the given alias.
    fn bridge_create(
        &self,
        name: &InterfaceName,
        alias: &str,
    ) -> impl Future<Output = Result<(), NetlinkError>> + Send;

    /// Create an L2 GRE tunnel endpoint carrying the given alias.
    fn gretap_create(
        &self,
        name: &InterfaceName,
        alias: &str,
        local: Ipv4Addr,
        remote: Ipv4Addr,
        key: TunnelKey,
    ) -> impl Future<Output = Result<(), NetlinkError>> + Send;

    /// Create the point-to-multipoint L3 GRE tunnel.
    fn gretun_create(
        &self,
        name: &InterfaceName,
        local: Ipv4Addr,
        key: TunnelKey,
    ) -> impl Future<Output = Result<(), NetlinkError>> + Send;

    /// Set a link administratively up.
    fn link_enable(
        &self,
        index: InterfaceIndex,
    ) -> impl Future<Output = Result<(), NetlinkError>> + Send;

    /// Enslave `port` to `controller`.
    fn link_attach(
        &self,
        port: InterfaceIndex,
        controller: InterfaceIndex,
    ) -> impl Future<Output = Result<(), NetlinkError>> + Send;

    /// Delete a link.
    fn link_destroy(
        &self,
        index: InterfaceIndex,
    ) -> impl Future<Output = Result<(), NetlinkError>> + Send;

    /// IPv4 addresses currently assigned to a link.
    fn address_list(
        &self,
        link: InterfaceIndex,
    ) -> impl Future<Output = Result<Vec<AddressRecord>, NetlinkError>> + Send;

    fn address_add(
        &self,
        link: InterfaceIndex,
        address: Ipv4Addr,
        prefix_len: u8,
    ) -> impl Future<Output = Result<(), NetlinkError>> + Send;

    fn address_del(
        &self,
        link: InterfaceIndex,
        address: Ipv4Addr,
        prefix_len: u8,
    ) -> impl Future<Output = Result<(), NetlinkError>> + Send;

    /// IPv4 neighbor entries on a link.
    fn neighbor_list(
        &self,
        link: InterfaceIndex,
    ) -> impl Future<Output = Result<Vec<NeighborRecord>, NetlinkError>> + Send;

    fn neighbor_add(
        &self,
        entry: &NeighborRecord,
    ) -> impl Future<Output = Result<(), NetlinkError>> + Send;

    fn neighbor_del(
        &self,
        entry: &NeighborRecord,
    ) -> impl Future<Output = Result<(), NetlinkError>> + Send;

    /// IPv4 routes egressing a link.
    fn route_list(
        &self,
        link: InterfaceIndex,
    ) -> impl Future<Output = Result<Vec<RouteRecord>, NetlinkError>> + Send;

    fn route_add(
        &self,
        route: &RouteRecord,
    ) -> impl Future<Output = Result<(), NetlinkError>> + Send;

    fn route_del(
        &self,
        route: &RouteRecord,
    ) -> impl Future<Output = Result<(), NetlinkError>> + Send;

    /// Platform hook to enable IPv4 forwarding. A no-op by default.
    fn enable_forwarding(&self) -> impl Future<Output = Result<(), NetlinkError>> + Send {
        async { Ok(()) }
    }
}
