// SPDX-License-Identifier: Apache-2.0
// Copyright Cloud Concentrator Authors

//! The rtnetlink-backed [`Netlink`] implementation.

use crate::gre;
use crate::netlink::{
    AddressRecord, LinkKind, LinkRecord, NeighborRecord, Netlink, NetlinkError, RouteRecord,
};
use futures::TryStreamExt;
use ipnet::Ipv4Net;
use net::{InterfaceIndex, InterfaceName, TunnelKey};
use rtnetlink::packet_route::address::AddressAttribute;
use rtnetlink::packet_route::link::{
    InfoData, InfoKind, LinkAttribute, LinkFlags, LinkInfo, LinkMessage,
};
use rtnetlink::packet_route::neighbour::{
    NeighbourAddress, NeighbourAttribute, NeighbourMessage, NeighbourState,
};
use rtnetlink::packet_route::route::{RouteAttribute, RouteAddress};
use rtnetlink::packet_route::AddressFamily;
use rtnetlink::{Handle, LinkBridge, LinkUnspec, RouteMessageBuilder};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tracing::debug;

const IP_FORWARD_SYSCTL: &str = "/proc/sys/net/ipv4/ip_forward";

/// Kernel backend over a shared rtnetlink handle.
#[derive(Clone, Debug)]
pub struct RtNetlink {
    handle: Arc<Handle>,
}

impl RtNetlink {
    #[must_use]
    pub fn new(handle: Arc<Handle>) -> Self {
        RtNetlink { handle }
    }

    /// Open a netlink connection on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an [`std::io::Error`] if the netlink socket cannot be opened.
    pub fn connect() -> Result<Self, std::io::Error> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);
        Ok(Self::new(Arc::new(handle)))
    }
}

fn record_from_message(message: &LinkMessage) -> Option<LinkRecord> {
    let index = InterfaceIndex::try_new(message.header.index).ok()?;
    let mut name = None;
    let mut alias = None;
    let mut controller = None;
    let mut info_kind = None;
    for attr in &message.attributes {
        match attr {
            LinkAttribute::IfName(value) => name = InterfaceName::try_from(value.as_str()).ok(),
            LinkAttribute::IfAlias(value) => alias = Some(value.clone()),
            LinkAttribute::Controller(value) => controller = InterfaceIndex::try_new(*value).ok(),
            LinkAttribute::LinkInfo(infos) => {
                for info in infos {
                    if let LinkInfo::Kind(kind) = info {
                        info_kind = Some(kind.clone());
                    }
                }
            }
            _ => {}
        }
    }
    let kind = match info_kind {
        Some(InfoKind::Bridge) => LinkKind::Bridge,
        Some(InfoKind::GreTap) => LinkKind::GreTap,
        Some(InfoKind::GreTun) => LinkKind::GreTun,
        Some(_) => LinkKind::Other,
        None if message.header.flags.contains(LinkFlags::Loopback) => LinkKind::Loopback,
        None => LinkKind::Physical,
    };
    Some(LinkRecord {
        index,
        name: name?,
        alias,
        kind,
        controller,
    })
}

impl Netlink for RtNetlink {
    async fn link_list(&self) -> Result<Vec<LinkRecord>, NetlinkError> {
        let mut records = Vec::new();
        let mut req = self.handle.link().get().execute();
        while let Some(message) = req.try_next().await.map_err(NetlinkError::from)? {
            match record_from_message(&message) {
                Some(record) => records.push(record),
                None => debug!("skipping unusable link {}", message.header.index),
            }
        }
        Ok(records)
    }

    async fn link_by_name(&self, name: &InterfaceName) -> Result<Option<LinkRecord>, NetlinkError> {
        Ok(self
            .link_list()
            .await?
            .into_iter()
            .find(|record| record.name == *name))
    }

    async fn link_by_alias(&self, alias: &str) -> Result<Option<LinkRecord>, NetlinkError> {
        Ok(self
            .link_list()
            .await?
            .into_iter()
            .find(|record| record.alias.as_deref() == Some(alias)))
    }

    async fn bridge_create(&self, name: &InterfaceName, alias: &str) -> Result<(), NetlinkError> {
        let mut message = LinkBridge::new(name.as_ref()).build();
        message
            .attributes
            .push(LinkAttribute::IfAlias(alias.to_string()));
        self.handle
            .link()
            .add(message)
            .execute()
            .await
            .map_err(NetlinkError::from)
    }

    async fn gretap_create(
        &self,
        name: &InterfaceName,
        alias: &str,
        local: Ipv4Addr,
        remote: Ipv4Addr,
        key: TunnelKey,
    ) -> Result<(), NetlinkError> {
        let mut message = LinkMessage::default();
        message
            .attributes
            .push(LinkAttribute::IfName(name.to_string()));
        message
            .attributes
            .push(LinkAttribute::IfAlias(alias.to_string()));
        message.attributes.push(LinkAttribute::LinkInfo(vec![
            LinkInfo::Kind(InfoKind::GreTap),
            LinkInfo::Data(InfoData::GreTap(gre::gretap_info_data(local, remote, key))),
        ]));
        self.handle
            .link()
            .add(message)
            .execute()
            .await
            .map_err(NetlinkError::from)
    }

    async fn gretun_create(
        &self,
        name: &InterfaceName,
        local: Ipv4Addr,
        key: TunnelKey,
    ) -> Result<(), NetlinkError> {
        let mut message = LinkMessage::default();
        message
            .attributes
            .push(LinkAttribute::IfName(name.to_string()));
        message.attributes.push(LinkAttribute::LinkInfo(vec![
            LinkInfo::Kind(InfoKind::GreTun),
            LinkInfo::Data(InfoData::GreTun(gre::gretun_info_data(local, key))),
        ]));
        self.handle
            .link()
            .add(message)
            .execute()
            .await
            .map_err(NetlinkError::from)
    }

    async fn link_enable(&self, index: InterfaceIndex) -> Result<(), NetlinkError> {
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index.to_u32()).up().build())
            .execute()
            .await
            .map_err(NetlinkError::from)
    }

    async fn link_attach(
        &self,
        port: InterfaceIndex,
        controller: InterfaceIndex,
    ) -> Result<(), NetlinkError> {
        self.handle
            .link()
            .set_port(
                LinkUnspec::new_with_index(port.to_u32())
                    .controller(controller.to_u32())
                    .build(),
            )
            .execute()
            .await
            .map_err(NetlinkError::from)
    }

    async fn link_destroy(&self, index: InterfaceIndex) -> Result<(), NetlinkError> {
        self.handle
            .link()
            .del(index.to_u32())
            .execute()
            .await
            .map_err(NetlinkError::from)
    }

    async fn address_list(&self, link: InterfaceIndex) -> Result<Vec<AddressRecord>, NetlinkError> {
        let mut records = Vec::new();
        let mut req = self
            .handle
            .address()
            .get()
            .set_link_index_filter(link.to_u32())
            .execute();
        while let Some(message) = req.try_next().await.map_err(NetlinkError::from)? {
            if message.header.family != AddressFamily::Inet {
                continue;
            }
            for attr in &message.attributes {
                if let AddressAttribute::Address(IpAddr::V4(address)) = attr {
                    records.push(AddressRecord {
                        address: *address,
                        prefix_len: message.header.prefix_len,
                    });
                }
            }
        }
        Ok(records)
    }

    async fn address_add(
        &self,
        link: InterfaceIndex,
        address: Ipv4Addr,
        prefix_len: u8,
    ) -> Result<(), NetlinkError> {
        self.handle
            .address()
            .add(link.to_u32(), IpAddr::V4(address), prefix_len)
            .execute()
            .await
            .map_err(NetlinkError::from)
    }

    async fn address_del(
        &self,
        link: InterfaceIndex,
        address: Ipv4Addr,
        prefix_len: u8,
    ) -> Result<(), NetlinkError> {
        let mut req = self
            .handle
            .address()
            .get()
            .set_link_index_filter(link.to_u32())
            .execute();
        while let Some(message) = req.try_next().await.map_err(NetlinkError::from)? {
            if message.header.prefix_len != prefix_len {
                continue;
            }
            let matches = message.attributes.iter().any(
                |attr| matches!(attr, AddressAttribute::Address(IpAddr::V4(a)) if *a == address),
            );
            if matches {
                return self
                    .handle
                    .address()
                    .del(message)
                    .execute()
                    .await
                    .map_err(NetlinkError::from);
            }
        }
        Err(NetlinkError::NotFound(format!("{address}/{prefix_len}")))
    }

    async fn neighbor_list(
        &self,
        link: InterfaceIndex,
    ) -> Result<Vec<NeighborRecord>, NetlinkError> {
        let mut records = Vec::new();
        let mut req = self.handle.neighbours().get().execute();
        while let Some(message) = req.try_next().await.map_err(NetlinkError::from)? {
            if message.header.ifindex != link.to_u32()
                || message.header.family != AddressFamily::Inet
            {
                continue;
            }
            let mut destination = None;
            let mut lladdr = None;
            for attr in &message.attributes {
                match attr {
                    NeighbourAttribute::Destination(NeighbourAddress::Inet(address)) => {
                        destination = Some(*address);
                    }
                    NeighbourAttribute::LinkLocalAddress(bytes) if bytes.len() == 4 => {
                        lladdr = Some(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]));
                    }
                    _ => {}
                }
            }
            if let Some(destination) = destination {
                records.push(NeighborRecord {
                    link,
                    destination,
                    lladdr,
                    permanent: message.header.state == NeighbourState::Permanent,
                });
            }
        }
        Ok(records)
    }

    async fn neighbor_add(&self, entry: &NeighborRecord) -> Result<(), NetlinkError> {
        let mut request = self
            .handle
            .neighbours()
            .add(entry.link.to_u32(), IpAddr::V4(entry.destination));
        if entry.permanent {
            request = request.state(NeighbourState::Permanent);
        }
        if let Some(lladdr) = entry.lladdr {
            request = request.link_local_address(&lladdr.octets());
        }
        request.execute().await.map_err(NetlinkError::from)
    }

    async fn neighbor_del(&self, entry: &NeighborRecord) -> Result<(), NetlinkError> {
        let mut message = NeighbourMessage::default();
        message.header.family = AddressFamily::Inet;
        message.header.ifindex = entry.link.to_u32();
        message
            .attributes
            .push(NeighbourAttribute::Destination(NeighbourAddress::Inet(
                entry.destination,
            )));
        self.handle
            .neighbours()
            .del(message)
            .execute()
            .await
            .map_err(NetlinkError::from)
    }

    async fn route_list(&self, link: InterfaceIndex) -> Result<Vec<RouteRecord>, NetlinkError> {
        let mut records = Vec::new();
        let mut req = self
            .handle
            .route()
            .get(RouteMessageBuilder::<Ipv4Addr>::default().build())
            .execute();
        while let Some(message) = req.try_next().await.map_err(NetlinkError::from)? {
            let mut oif = None;
            let mut destination = None;
            let mut gateway = None;
            for attr in &message.attributes {
                match attr {
                    RouteAttribute::Oif(value) => oif = InterfaceIndex::try_new(*value).ok(),
                    RouteAttribute::Destination(RouteAddress::Inet(address)) => {
                        destination =
                            Ipv4Net::new(*address, message.header.destination_prefix_length).ok();
                    }
                    RouteAttribute::Gateway(RouteAddress::Inet(address)) => {
                        gateway = Some(*address);
                    }
                    _ => {}
                }
            }
            if oif != Some(link) {
                continue;
            }
            records.push(RouteRecord {
                link: oif,
                destination,
                gateway,
            });
        }
        Ok(records)
    }

    async fn route_add(&self, route: &RouteRecord) -> Result<(), NetlinkError> {
        self.handle
            .route()
            .add(build_route_message(route))
            .execute()
            .await
            .map_err(NetlinkError::from)
    }

    async fn route_del(&self, route: &RouteRecord) -> Result<(), NetlinkError> {
        self.handle
            .route()
            .del(build_route_message(route))
            .execute()
            .await
            .map_err(NetlinkError::from)
    }

    async fn enable_forwarding(&self) -> Result<(), NetlinkError> {
        tokio::fs::write(IP_FORWARD_SYSCTL, "1\n")
            .await
            .map_err(|source| NetlinkError::Sysctl {
                path: IP_FORWARD_SYSCTL.to_string(),
                source,
            })
    }
}

fn build_route_message(
    route: &RouteRecord,
) -> rtnetlink::packet_route::route::RouteMessage {
    let mut builder = RouteMessageBuilder::<Ipv4Addr>::default();
    if let Some(destination) = route.destination {
        builder = builder.destination_prefix(destination.addr(), destination.prefix_len());
    }
    if let Some(link) = route.link {
        builder = builder.output_interface(link.to_u32());
    }
    if let Some(gateway) = route.gateway {
        builder = builder.gateway(gateway);
    }
    builder.build()
}
