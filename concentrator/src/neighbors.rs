// SPDX-License-Identifier: Apache-2.0
// Copyright Cloud Concentrator Authors

//! The peer mesh: one point-to-multipoint GRE tunnel reaching every other
//! concentrator of this tenant, with a PERMANENT neighbor entry and a pair
//! of routes per peer.

use crate::cnci::Cnci;
use crate::error::{CnciError, InputError};
use device_manager::{GreTunSpec, NeighborRecord, Netlink, RouteRecord};
use dhcp::DhcpService;
use ipnet::Ipv4Net;
use net::{InterfaceIndex, InterfaceName, TunnelKey};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use tracing::{info, warn};

/// Kernel name of the peer tunnel. A single instance exists, so no alias is
/// needed to recover it.
pub(crate) const PEER_TUNNEL_NAME: &str = "cncitun";
/// Prefix length of the tunnel overlay network.
const PEER_TUNNEL_PREFIX_LEN: u8 = 18;

#[allow(clippy::expect_used)] // the name is a static, legal constant
fn peer_tunnel_name() -> InterfaceName {
    InterfaceName::try_from(PEER_TUNNEL_NAME).expect("static tunnel name is legal")
}

/// A peer concentrator of this tenant, as reported by the controller.
///
/// The entry whose `physical_ip` matches this concentrator's primary
/// compute address describes the local end of the mesh.
#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Neighbor {
    /// Routable address of the peer's compute interface.
    pub physical_ip: Ipv4Addr,
    /// Tenant subnet hosted behind the peer.
    pub subnet: Ipv4Net,
    /// The peer's address inside the tunnel overlay.
    pub tunnel_ip: Ipv4Addr,
    /// Tenant-wide GRE key.
    pub tunnel_id: TunnelKey,
}

impl<K: Netlink, D: DhcpService> Cnci<K, D> {
    /// Drive the peer mesh to match `neighbors`.
    ///
    /// Confirms the tunnel device and its single overlay address, confirms
    /// a PERMANENT neighbor entry and a host + subnet route pair for every
    /// remote peer, and reaps entries and routes for peers that are no
    /// longer listed. Converges: repeating a call with the same input
    /// mutates nothing.
    ///
    /// # Errors
    ///
    /// The input must contain this concentrator's own entry; tunnel,
    /// address and neighbor installation failures surface as kernel
    /// errors. Stale-entry deletion is best-effort and only logged.
    pub async fn update_neighbors(&self, neighbors: &[Neighbor]) -> Result<(), CnciError> {
        let local_ip = self.primary_compute()?.address;
        let local = neighbors
            .iter()
            .find(|neighbor| neighbor.physical_ip == local_ip)
            .ok_or(InputError::NoLocalNeighbor)?;

        // must come first: everything else needs the tunnel's link index
        let tunnel = self.confirm_tunnel(local).await?;

        let existing = self.netlink.neighbor_list(tunnel).await?;
        let mut confirmed = Vec::new();
        for neighbor in neighbors
            .iter()
            .filter(|neighbor| neighbor.physical_ip != local_ip)
        {
            let entry = self.confirm_neighbor(tunnel, neighbor, &existing).await?;
            confirmed.push(entry);
        }

        self.confirm_routes(tunnel, &confirmed, &existing).await
    }

    /// Ensure the peer tunnel exists and holds exactly one overlay address.
    async fn confirm_tunnel(&self, local: &Neighbor) -> Result<InterfaceIndex, CnciError> {
        let spec = GreTunSpec {
            name: peer_tunnel_name(),
            local: local.physical_ip,
            key: local.tunnel_id,
        };
        let index = match spec.get_device(&self.netlink).await? {
            Some(record) => record.index,
            None => {
                let index = spec.create(&self.netlink).await?;
                spec.enable(&self.netlink, index).await?;
                info!(key = %local.tunnel_id, "created peer tunnel {PEER_TUNNEL_NAME}");
                index
            }
        };

        let mut present = false;
        for record in self.netlink.address_list(index).await? {
            if record.address == local.tunnel_ip && record.prefix_len == PEER_TUNNEL_PREFIX_LEN {
                present = true;
            } else {
                // there is only ever one address on the tunnel
                self.netlink
                    .address_del(index, record.address, record.prefix_len)
                    .await?;
            }
        }
        if !present {
            self.netlink
                .address_add(index, local.tunnel_ip, PEER_TUNNEL_PREFIX_LEN)
                .await?;
        }
        Ok(index)
    }

    /// Ensure one peer's neighbor entry and routes are installed.
    async fn confirm_neighbor(
        &self,
        tunnel: InterfaceIndex,
        neighbor: &Neighbor,
        existing: &[NeighborRecord],
    ) -> Result<NeighborRecord, CnciError> {
        let entry = NeighborRecord {
            link: tunnel,
            destination: neighbor.tunnel_ip,
            lladdr: Some(neighbor.physical_ip),
            permanent: true,
        };
        let already = existing.iter().any(|candidate| {
            candidate.destination == entry.destination
                && candidate.lladdr == entry.lladdr
                && candidate.permanent
        });
        if !already {
            self.netlink.neighbor_add(&entry).await?;
            self.netlink
                .route_add(&RouteRecord {
                    link: Some(tunnel),
                    destination: Some(Ipv4Net::from(neighbor.tunnel_ip)),
                    gateway: None,
                })
                .await?;
            self.netlink
                .route_add(&RouteRecord {
                    link: Some(tunnel),
                    destination: Some(neighbor.subnet.trunc()),
                    gateway: Some(neighbor.tunnel_ip),
                })
                .await?;
            info!(
                peer = %neighbor.physical_ip,
                tunnel_ip = %neighbor.tunnel_ip,
                subnet = %neighbor.subnet,
                "installed peer"
            );
        }
        Ok(entry)
    }

    /// Reap neighbors (and their routes) that are no longer listed.
    /// Deletion is best-effort: reconciliation failures are logged and
    /// skipped.
    async fn confirm_routes(
        &self,
        tunnel: InterfaceIndex,
        confirmed: &[NeighborRecord],
        existing: &[NeighborRecord],
    ) -> Result<(), CnciError> {
        let routes = self.netlink.route_list(tunnel).await?;
        let stale = existing.iter().filter(|candidate| {
            !confirmed.iter().any(|kept| {
                kept.destination == candidate.destination && kept.lladdr == candidate.lladdr
            })
        });
        for neighbor in stale {
            if let Err(err) = self.netlink.neighbor_del(neighbor).await {
                warn!(
                    "unable to delete stale neighbor {}: {err}",
                    neighbor.destination
                );
            }
            let doomed = routes.iter().filter(|route| {
                route.destination.map(|net| net.addr()) == Some(neighbor.destination)
                    || route.gateway == Some(neighbor.destination)
            });
            for route in doomed {
                if let Err(err) = self.netlink.route_del(route).await {
                    warn!("unable to delete stale route {route:?}: {err}");
                }
            }
        }
        Ok(())
    }
}
