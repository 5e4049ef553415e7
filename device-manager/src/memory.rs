// SPDX-License-Identifier: Apache-2.0
// Copyright Cloud Concentrator Authors

//! An in-memory kernel namespace.
//!
//! Implements [`Netlink`] over plain maps so the topology core can be
//! exercised without privileges. Mirrors the kernel behaviors the core
//! depends on: names are unique, deleting a link drops its addresses,
//! neighbors and routes, and create/enable/destroy calls are counted so
//! idempotence can be asserted. Specific operations can be made to fail by
//! name to drive error paths.

use crate::netlink::{
    AddressRecord, LinkKind, LinkRecord, NeighborRecord, Netlink, NetlinkError, RouteRecord,
};
use net::{InterfaceIndex, InterfaceName, TunnelKey};
use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};

/// GRE parameters recorded for a simulated tunnel device.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct GreTunnel {
    pub local: Ipv4Addr,
    pub remote: Option<Ipv4Addr>,
    pub key: TunnelKey,
}

/// Counters for the mutating kernel calls.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct OpCounts {
    pub link_create: usize,
    pub link_enable: usize,
    pub link_attach: usize,
    pub link_destroy: usize,
    pub neighbor_add: usize,
    pub neighbor_del: usize,
    pub route_add: usize,
    pub route_del: usize,
}

#[derive(Clone, Debug)]
struct MemoryLink {
    record: LinkRecord,
    up: bool,
    addresses: Vec<AddressRecord>,
    gre: Option<GreTunnel>,
}

#[derive(Debug, Default)]
struct Namespace {
    next_index: u32,
    links: BTreeMap<u32, MemoryLink>,
    neighbors: Vec<NeighborRecord>,
    routes: Vec<RouteRecord>,
    counts: OpCounts,
    fail_create: HashSet<String>,
    fail_destroy: HashSet<String>,
    forwarding: bool,
}

impl Namespace {
    fn insert_link(
        &mut self,
        name: &InterfaceName,
        alias: Option<String>,
        kind: LinkKind,
        gre: Option<GreTunnel>,
    ) -> Result<InterfaceIndex, NetlinkError> {
        if self.fail_create.contains(name.as_ref()) {
            return Err(NetlinkError::Injected(name.to_string()));
        }
        if self.links.values().any(|link| link.record.name == *name) {
            return Err(NetlinkError::NameInUse(name.clone()));
        }
        self.next_index += 1;
        self.counts.link_create += 1;
        let index = InterfaceIndex::try_new(self.next_index)
            .map_err(|_| NetlinkError::NotFound(name.to_string()))?;
        self.links.insert(
            self.next_index,
            MemoryLink {
                record: LinkRecord {
                    index,
                    name: name.clone(),
                    alias,
                    kind,
                    controller: None,
                },
                up: false,
                addresses: Vec::new(),
                gre,
            },
        );
        Ok(index)
    }

    fn link_mut(&mut self, index: InterfaceIndex) -> Result<&mut MemoryLink, NetlinkError> {
        self.links
            .get_mut(&index.to_u32())
            .ok_or_else(|| NetlinkError::NotFound(index.to_string()))
    }
}

/// A shareable simulated namespace. Clones observe the same state.
#[derive(Clone, Debug, Default)]
pub struct MemoryNetlink {
    state: Arc<Mutex<Namespace>>,
}

impl MemoryNetlink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::expect_used)] // lock poisoning in a test backend is fatal anyway
    fn lock(&self) -> MutexGuard<'_, Namespace> {
        self.state.lock().expect("memory namespace poisoned")
    }

    /// Seed a physical link carrying the given addresses.
    pub fn seed_physical(
        &self,
        name: &InterfaceName,
        addresses: &[(Ipv4Addr, u8)],
    ) -> InterfaceIndex {
        let mut ns = self.lock();
        #[allow(clippy::expect_used)] // seeding with a duplicate name is a test bug
        let index = ns
            .insert_link(name, None, LinkKind::Physical, None)
            .expect("failed to seed physical link");
        ns.counts.link_create -= 1; // seeding is not a kernel mutation under test
        let link = ns.links.get_mut(&index.to_u32());
        if let Some(link) = link {
            link.up = true;
            link.addresses = addresses
                .iter()
                .map(|(address, prefix_len)| AddressRecord {
                    address: *address,
                    prefix_len: *prefix_len,
                })
                .collect();
        }
        index
    }

    /// Seed a bridge with its alias already set, as a crashed process would
    /// have left it.
    pub fn seed_bridge(&self, name: &InterfaceName, alias: &str) -> InterfaceIndex {
        let mut ns = self.lock();
        #[allow(clippy::expect_used)]
        let index = ns
            .insert_link(name, Some(alias.to_string()), LinkKind::Bridge, None)
            .expect("failed to seed bridge");
        ns.counts.link_create -= 1;
        index
    }

    /// Seed a gretap with its alias already set.
    pub fn seed_gretap(
        &self,
        name: &InterfaceName,
        alias: &str,
        local: Ipv4Addr,
        remote: Ipv4Addr,
        key: TunnelKey,
    ) -> InterfaceIndex {
        let mut ns = self.lock();
        #[allow(clippy::expect_used)]
        let index = ns
            .insert_link(
                name,
                Some(alias.to_string()),
                LinkKind::GreTap,
                Some(GreTunnel {
                    local,
                    remote: Some(remote),
                    key,
                }),
            )
            .expect("failed to seed gretap");
        ns.counts.link_create -= 1;
        index
    }

    /// Make future creates of the named device fail.
    pub fn fail_create_of(&self, name: &str) {
        self.lock().fail_create.insert(name.to_string());
    }

    /// Make future destroys of the named device fail.
    pub fn fail_destroy_of(&self, name: &str) {
        self.lock().fail_destroy.insert(name.to_string());
    }

    #[must_use]
    pub fn counts(&self) -> OpCounts {
        self.lock().counts
    }

    #[must_use]
    pub fn has_link_named(&self, name: &str) -> bool {
        self.lock()
            .links
            .values()
            .any(|link| link.record.name.as_ref() == name)
    }

    #[must_use]
    pub fn link_count(&self) -> usize {
        self.lock().links.len()
    }

    #[must_use]
    pub fn controller_of(&self, name: &str) -> Option<InterfaceIndex> {
        self.lock()
            .links
            .values()
            .find(|link| link.record.name.as_ref() == name)
            .and_then(|link| link.record.controller)
    }

    #[must_use]
    pub fn gre_of(&self, name: &str) -> Option<GreTunnel> {
        self.lock()
            .links
            .values()
            .find(|link| link.record.name.as_ref() == name)
            .and_then(|link| link.gre)
    }

    #[must_use]
    pub fn is_up(&self, name: &str) -> bool {
        self.lock()
            .links
            .values()
            .any(|link| link.record.name.as_ref() == name && link.up)
    }

    #[must_use]
    pub fn addresses_of(&self, name: &str) -> Vec<AddressRecord> {
        self.lock()
            .links
            .values()
            .find(|link| link.record.name.as_ref() == name)
            .map(|link| link.addresses.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn neighbor_records(&self) -> Vec<NeighborRecord> {
        self.lock().neighbors.clone()
    }

    #[must_use]
    pub fn route_records(&self) -> Vec<RouteRecord> {
        self.lock().routes.clone()
    }

    #[must_use]
    pub fn forwarding_enabled(&self) -> bool {
        self.lock().forwarding
    }
}

impl Netlink for MemoryNetlink {
    async fn link_list(&self) -> Result<Vec<LinkRecord>, NetlinkError> {
        Ok(self
            .lock()
            .links
            .values()
            .map(|link| link.record.clone())
            .collect())
    }

    async fn link_by_name(&self, name: &InterfaceName) -> Result<Option<LinkRecord>, NetlinkError> {
        Ok(self
            .lock()
            .links
            .values()
            .find(|link| link.record.name == *name)
            .map(|link| link.record.clone()))
    }

    async fn link_by_alias(&self, alias: &str) -> Result<Option<LinkRecord>, NetlinkError> {
        Ok(self
            .lock()
            .links
            .values()
            .find(|link| link.record.alias.as_deref() == Some(alias))
            .map(|link| link.record.clone()))
    }

    async fn bridge_create(&self, name: &InterfaceName, alias: &str) -> Result<(), NetlinkError> {
        // widen the race window for concurrent callers, as the kernel would
        tokio::task::yield_now().await;
        self.lock()
            .insert_link(name, Some(alias.to_string()), LinkKind::Bridge, None)
            .map(|_| ())
    }

    async fn gretap_create(
        &self,
        name: &InterfaceName,
        alias: &str,
        local: Ipv4Addr,
        remote: Ipv4Addr,
        key: TunnelKey,
    ) -> Result<(), NetlinkError> {
        tokio::task::yield_now().await;
        self.lock()
            .insert_link(
                name,
                Some(alias.to_string()),
                LinkKind::GreTap,
                Some(GreTunnel {
                    local,
                    remote: Some(remote),
                    key,
                }),
            )
            .map(|_| ())
    }

    async fn gretun_create(
        &self,
        name: &InterfaceName,
        local: Ipv4Addr,
        key: TunnelKey,
    ) -> Result<(), NetlinkError> {
        tokio::task::yield_now().await;
        self.lock()
            .insert_link(
                name,
                None,
                LinkKind::GreTun,
                Some(GreTunnel {
                    local,
                    remote: None,
                    key,
                }),
            )
            .map(|_| ())
    }

    async fn link_enable(&self, index: InterfaceIndex) -> Result<(), NetlinkError> {
        let mut ns = self.lock();
        ns.counts.link_enable += 1;
        ns.link_mut(index)?.up = true;
        Ok(())
    }

    async fn link_attach(
        &self,
        port: InterfaceIndex,
        controller: InterfaceIndex,
    ) -> Result<(), NetlinkError> {
        let mut ns = self.lock();
        if !ns.links.contains_key(&controller.to_u32()) {
            return Err(NetlinkError::NotFound(controller.to_string()));
        }
        ns.counts.link_attach += 1;
        ns.link_mut(port)?.record.controller = Some(controller);
        Ok(())
    }

    async fn link_destroy(&self, index: InterfaceIndex) -> Result<(), NetlinkError> {
        let mut ns = self.lock();
        let name = ns
            .links
            .get(&index.to_u32())
            .ok_or_else(|| NetlinkError::NotFound(index.to_string()))?
            .record
            .name
            .clone();
        if ns.fail_destroy.contains(name.as_ref()) {
            return Err(NetlinkError::Injected(name.to_string()));
        }
        ns.counts.link_destroy += 1;
        ns.links.remove(&index.to_u32());
        // the kernel drops ports, neighbors and routes with the device
        for link in ns.links.values_mut() {
            if link.record.controller == Some(index) {
                link.record.controller = None;
            }
        }
        ns.neighbors.retain(|entry| entry.link != index);
        ns.routes.retain(|route| route.link != Some(index));
        Ok(())
    }

    async fn address_list(&self, link: InterfaceIndex) -> Result<Vec<AddressRecord>, NetlinkError> {
        let mut ns = self.lock();
        Ok(ns.link_mut(link)?.addresses.clone())
    }

    async fn address_add(
        &self,
        link: InterfaceIndex,
        address: Ipv4Addr,
        prefix_len: u8,
    ) -> Result<(), NetlinkError> {
        let mut ns = self.lock();
        let entry = AddressRecord {
            address,
            prefix_len,
        };
        let addresses = &mut ns.link_mut(link)?.addresses;
        if !addresses.contains(&entry) {
            addresses.push(entry);
        }
        Ok(())
    }

    async fn address_del(
        &self,
        link: InterfaceIndex,
        address: Ipv4Addr,
        prefix_len: u8,
    ) -> Result<(), NetlinkError> {
        let mut ns = self.lock();
        let addresses = &mut ns.link_mut(link)?.addresses;
        let before = addresses.len();
        addresses.retain(|entry| !(entry.address == address && entry.prefix_len == prefix_len));
        if addresses.len() == before {
            return Err(NetlinkError::NotFound(format!("{address}/{prefix_len}")));
        }
        Ok(())
    }

    async fn neighbor_list(
        &self,
        link: InterfaceIndex,
    ) -> Result<Vec<NeighborRecord>, NetlinkError> {
        Ok(self
            .lock()
            .neighbors
            .iter()
            .filter(|entry| entry.link == link)
            .copied()
            .collect())
    }

    async fn neighbor_add(&self, entry: &NeighborRecord) -> Result<(), NetlinkError> {
        let mut ns = self.lock();
        ns.counts.neighbor_add += 1;
        ns.neighbors
            .retain(|existing| !(existing.link == entry.link && existing.destination == entry.destination));
        ns.neighbors.push(*entry);
        Ok(())
    }

    async fn neighbor_del(&self, entry: &NeighborRecord) -> Result<(), NetlinkError> {
        let mut ns = self.lock();
        let before = ns.neighbors.len();
        ns.neighbors
            .retain(|existing| !(existing.link == entry.link && existing.destination == entry.destination));
        if ns.neighbors.len() == before {
            return Err(NetlinkError::NotFound(entry.destination.to_string()));
        }
        ns.counts.neighbor_del += 1;
        Ok(())
    }

    async fn route_list(&self, link: InterfaceIndex) -> Result<Vec<RouteRecord>, NetlinkError> {
        Ok(self
            .lock()
            .routes
            .iter()
            .filter(|route| route.link == Some(link))
            .copied()
            .collect())
    }

    async fn route_add(&self, route: &RouteRecord) -> Result<(), NetlinkError> {
        let mut ns = self.lock();
        ns.counts.route_add += 1;
        if !ns.routes.contains(route) {
            ns.routes.push(*route);
        }
        Ok(())
    }

    async fn route_del(&self, route: &RouteRecord) -> Result<(), NetlinkError> {
        let mut ns = self.lock();
        let before = ns.routes.len();
        ns.routes.retain(|existing| {
            !(existing.destination == route.destination && existing.gateway == route.gateway)
        });
        if ns.routes.len() == before {
            return Err(NetlinkError::NotFound(format!("{route:?}")));
        }
        ns.counts.route_del += 1;
        Ok(())
    }

    async fn enable_forwarding(&self) -> Result<(), NetlinkError> {
        self.lock().forwarding = true;
        Ok(())
    }
}
