// SPDX-License-Identifier: Apache-2.0
// Copyright Cloud Concentrator Authors

//! The concentrator itself: subnet operations, rebuild, shutdown, init.

use crate::alias::{BRIDGE_PREFIX, BridgeAlias, TUNNEL_PREFIX, TunnelAlias};
use crate::config::NetworkConfig;
use crate::error::{CnciError, ConfigError, InputError};
use crate::gate::{DeviceGate, GateError};
use crate::topology::{BridgeState, LinkEntry, Topology, TopologySnapshot, lock_slot};
use cnci_id::{Concentrator, Id, Tenant};
use device_manager::{BridgeSpec, GreTapSpec, LinkKind, Netlink, VnicRef};
use dhcp::DhcpService;
use ipnet::Ipv4Net;
use net::{InterfaceIndex, InterfaceName, TunnelKey};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// One IPv4 address on a discovered physical interface.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PhyAddress {
    pub link: InterfaceIndex,
    pub name: InterfaceName,
    pub address: Ipv4Addr,
    pub prefix_len: u8,
}

/// A per-tenant concentrator.
///
/// One instance serves one tenant. `K` reaches the kernel, `D` supervises
/// the per-bridge DHCP instances. All subnet and peer operations take
/// `&self` and are safe to call from concurrent tasks; [`Cnci::init`] runs
/// once, before the instance is shared.
pub struct Cnci<K, D: DhcpService> {
    pub(crate) netlink: K,
    dhcp: D,
    config: NetworkConfig,
    tenant: Id<Tenant>,
    id: Id<Concentrator>,
    api_timeout: Duration,
    management: Vec<PhyAddress>,
    pub(crate) compute: Vec<PhyAddress>,
    public_ips: Vec<Ipv4Addr>,
    public_ip_map: HashMap<String, Ipv4Addr>,
    topology: Mutex<Topology<D::Handle>>,
    initialized: bool,
}

fn check_subnet_and_peer(subnet: Ipv4Net, peer: Ipv4Addr) -> Result<(), InputError> {
    if subnet.prefix_len() == 0 || subnet.network().is_unspecified() {
        return Err(InputError::UnspecifiedSubnet);
    }
    if peer.is_unspecified() || peer.is_broadcast() {
        return Err(InputError::UnspecifiedPeer);
    }
    Ok(())
}

fn gate_error(err: GateError, alias: &str) -> CnciError {
    match err {
        GateError::Timeout => CnciError::DeviceTimeout {
            alias: alias.to_string(),
        },
        GateError::Failed => CnciError::DeviceFailed {
            alias: alias.to_string(),
        },
    }
}

impl<K: Netlink, D: DhcpService> Cnci<K, D> {
    pub fn new(
        tenant: Id<Tenant>,
        id: Id<Concentrator>,
        config: NetworkConfig,
        netlink: K,
        dhcp: D,
    ) -> Self {
        let api_timeout = config.api_timeout;
        Self {
            netlink,
            dhcp,
            tenant,
            id,
            api_timeout,
            config,
            management: Vec::new(),
            compute: Vec::new(),
            public_ips: Vec::new(),
            public_ip_map: HashMap::new(),
            topology: Mutex::new(Topology::new()),
            initialized: false,
        }
    }

    #[must_use]
    pub fn tenant(&self) -> Id<Tenant> {
        self.tenant
    }

    #[must_use]
    pub fn id(&self) -> Id<Concentrator> {
        self.id
    }

    #[must_use]
    pub fn management_addresses(&self) -> &[PhyAddress] {
        &self.management
    }

    #[must_use]
    pub fn compute_addresses(&self) -> &[PhyAddress] {
        &self.compute
    }

    #[must_use]
    pub fn public_ips(&self) -> &[Ipv4Addr] {
        &self.public_ips
    }

    /// Record a public address assigned to this concentrator and the tenant
    /// instance it forwards to.
    pub fn record_public_ip(&mut self, public: Ipv4Addr, instance: Ipv4Addr) {
        if !self.public_ips.contains(&public) {
            self.public_ips.push(public);
        }
        self.public_ip_map.insert(public.to_string(), instance);
    }

    #[must_use]
    pub fn instance_for_public_ip(&self, public: &str) -> Option<Ipv4Addr> {
        self.public_ip_map.get(public).copied()
    }

    pub(crate) fn primary_compute(&self) -> Result<&PhyAddress, CnciError> {
        self.compute.first().ok_or(CnciError::NotInitialized)
    }

    /// Discover physical interfaces, classify them, rebuild the topology
    /// from live kernel state and enable forwarding.
    ///
    /// Idempotent per process: a second call is a no-op.
    ///
    /// # Errors
    ///
    /// Fails when no management or compute interface can be found, when the
    /// classification would be ambiguous, or when the kernel cannot be
    /// read.
    pub async fn init(&mut self) -> Result<(), CnciError> {
        if self.initialized {
            debug!("concentrator {} already initialized", self.id);
            return Ok(());
        }
        self.api_timeout = self.config.api_timeout;
        self.find_phy_interfaces().await?;
        self.topology.lock().await.reinit();
        self.rebuild_inner().await?;
        self.netlink.enable_forwarding().await?;
        self.initialized = true;
        info!(
            tenant = %self.tenant,
            concentrator = %self.id,
            "concentrator initialized"
        );
        Ok(())
    }

    async fn find_phy_interfaces(&mut self) -> Result<(), CnciError> {
        let links = self.netlink.link_list().await?;
        self.management.clear();
        self.compute.clear();
        let mut candidates = 0usize;

        for link in links {
            if link.kind != LinkKind::Physical {
                continue;
            }
            // links without addresses may simply not have acquired one yet
            let Ok(addresses) = self.netlink.address_list(link.index).await else {
                continue;
            };
            if addresses.is_empty() {
                continue;
            }
            candidates += 1;
            for record in addresses {
                let phy = PhyAddress {
                    link: link.index,
                    name: link.name.clone(),
                    address: record.address,
                    prefix_len: record.prefix_len,
                };
                if self.config.management_nets.is_empty()
                    || self
                        .config
                        .management_nets
                        .iter()
                        .any(|net| net.contains(&record.address))
                {
                    self.management.push(phy.clone());
                }
                if self.config.compute_nets.is_empty()
                    || self
                        .config
                        .compute_nets
                        .iter()
                        .any(|net| net.contains(&record.address))
                {
                    self.compute.push(phy);
                }
            }
        }

        if self.management.is_empty() {
            return Err(ConfigError::NoManagementInterface.into());
        }
        if self.compute.is_empty() {
            return Err(ConfigError::NoComputeInterface.into());
        }
        // auto-configuration needs an unambiguous host
        if (self.config.management_nets.is_empty() || self.config.compute_nets.is_empty())
            && candidates > 1
        {
            return Err(ConfigError::AmbiguousAutoConfig {
                interfaces: candidates,
            }
            .into());
        }
        Ok(())
    }

    /// Bind a remote subnet to its local bridge through a keyed GRE tap.
    ///
    /// Creates the bridge (and its DHCP instance) on first reference to the
    /// subnet. Returns the bridge's kernel name when this call created the
    /// bridge, or when bridge and tunnel were both already present;
    /// `Ok(None)` means the bridge pre-existed and only the tunnel was
    /// added — an existing-subnet outcome, not a failure.
    ///
    /// # Errors
    ///
    /// Invalid inputs are rejected before any state changes. Kernel and
    /// DHCP failures roll the reservation back so the call can be retried.
    pub async fn add_remote_subnet(
        &self,
        subnet: Ipv4Net,
        key: TunnelKey,
        peer: Ipv4Addr,
    ) -> Result<Option<InterfaceName>, CnciError> {
        check_subnet_and_peer(subnet, peer)?;
        let local = self.primary_compute()?.address;
        let bridge_alias = BridgeAlias::new(subnet);
        let tunnel_alias = TunnelAlias::new(subnet, peer);

        let reservation = self
            .topology
            .lock()
            .await
            .reserve_subnet(&bridge_alias, &tunnel_alias)?;
        if reservation.settled() {
            return Ok(Some(reservation.bridge_name));
        }

        let bridge_dev = BridgeSpec {
            alias: bridge_alias.as_str().to_string(),
            name: reservation.bridge_name.clone(),
        };
        let tunnel_dev = GreTapSpec {
            alias: tunnel_alias.as_str().to_string(),
            name: reservation.gre_name.clone(),
            local,
            remote: peer,
            key,
        };

        if reservation.bridge_created {
            match self.create_bridge(&bridge_dev, &bridge_alias, subnet).await {
                Ok((index, handle)) => {
                    // the slot is shared with the store, so no lock is
                    // needed between creation and gate release
                    *lock_slot(&reservation.dhcp_slot) = Some(handle);
                    reservation.bridge_gate.complete(index);
                }
                Err(err) => {
                    // unblock waiters on both gates, then retreat so a retry
                    // starts clean
                    reservation.bridge_gate.fail();
                    reservation.gre_gate.fail();
                    self.topology.lock().await.rollback_subnet(
                        &bridge_alias,
                        &tunnel_alias,
                        &reservation,
                    );
                    return Err(err);
                }
            }
        }

        if reservation.gre_created {
            match self.create_tunnel(&tunnel_dev).await {
                Ok(index) => reservation.gre_gate.complete(index),
                Err(err) => {
                    reservation.gre_gate.fail();
                    self.topology
                        .lock()
                        .await
                        .rollback_tunnel(&bridge_alias, &tunnel_alias);
                    return Err(err);
                }
            }
        }

        // uniform path: read final identities through the gates even when
        // this call did the work itself
        let bridge_index = reservation
            .bridge_gate
            .wait(self.api_timeout)
            .await
            .map_err(|err| gate_error(err, bridge_alias.as_str()))?;
        let gre_index = reservation
            .gre_gate
            .wait(self.api_timeout)
            .await
            .map_err(|err| gate_error(err, tunnel_alias.as_str()))?;

        // traffic starts to flow here; last step on purpose
        tunnel_dev
            .attach(&self.netlink, gre_index, bridge_index)
            .await?;

        if reservation.bridge_created {
            info!(%subnet, %peer, bridge = %reservation.bridge_name, "attached remote subnet to new bridge");
            Ok(Some(reservation.bridge_name))
        } else {
            info!(%subnet, %peer, "attached remote subnet to existing bridge");
            Ok(None)
        }
    }

    async fn create_bridge(
        &self,
        dev: &BridgeSpec,
        alias: &BridgeAlias,
        subnet: Ipv4Net,
    ) -> Result<(InterfaceIndex, D::Handle), CnciError> {
        let index = dev.create(&self.netlink).await?;
        let settled: Result<D::Handle, CnciError> = async {
            dev.enable(&self.netlink, index).await?;
            let handle = self
                .dhcp
                .start_or_attach(&dev.name, alias.as_str(), self.tenant, subnet)
                .await?;
            Ok(handle)
        }
        .await;
        match settled {
            Ok(handle) => Ok((index, handle)),
            Err(err) => {
                if let Err(cleanup) = dev.destroy(&self.netlink, index).await {
                    warn!("failed to remove half-made bridge {}: {cleanup}", dev.alias);
                }
                Err(err)
            }
        }
    }

    async fn create_tunnel(&self, dev: &GreTapSpec) -> Result<InterfaceIndex, CnciError> {
        let index = dev.create(&self.netlink).await?;
        if let Err(err) = dev.enable(&self.netlink, index).await {
            if let Err(cleanup) = dev.destroy(&self.netlink, index).await {
                warn!("failed to remove half-made tunnel {}: {cleanup}", dev.alias);
            }
            return Err(err.into());
        }
        Ok(index)
    }

    /// Detach a remote subnet: destroy its GRE tap.
    ///
    /// The bridge and its DHCP instance are deliberately retained — instance
    /// churn inside a subnet is frequent, and restarting DHCP flaps leases.
    /// Deleting a tunnel that is already gone succeeds.
    ///
    /// # Errors
    ///
    /// Invalid inputs are rejected before any state changes; kernel
    /// failures surface after the store entry is removed.
    pub async fn del_remote_subnet(
        &self,
        subnet: Ipv4Net,
        key: TunnelKey,
        peer: Ipv4Addr,
    ) -> Result<(), CnciError> {
        check_subnet_and_peer(subnet, peer)?;
        let local = self.primary_compute()?.address;
        let bridge_alias = BridgeAlias::new(subnet);
        let tunnel_alias = TunnelAlias::new(subnet, peer);

        let mut topology = self.topology.lock().await;
        let Some(entry) = topology.link_map.get(tunnel_alias.as_str()).cloned() else {
            debug!("tunnel {tunnel_alias} is already gone");
            return Ok(());
        };
        match topology.bridge_map.get_mut(bridge_alias.as_str()) {
            Some(state) => state.tunnels = state.tunnels.saturating_sub(1),
            // tolerated: a rebuild after a crash may have lost the bridge
            None => warn!("no bridge recorded for tunnel {tunnel_alias}"),
        }
        let index = entry
            .gate
            .wait(self.api_timeout)
            .await
            .map_err(|err| gate_error(err, tunnel_alias.as_str()))?;
        topology.forget_tunnel_entry(&tunnel_alias);
        drop(topology);

        let dev = GreTapSpec {
            alias: tunnel_alias.as_str().to_string(),
            name: entry.name,
            local,
            remote: peer,
            key,
        };
        dev.destroy(&self.netlink, index).await?;
        info!(%subnet, %peer, "detached remote subnet");
        Ok(())
    }

    /// Reconstruct the topology store from live kernel state.
    ///
    /// The aliases persisted on kernel devices are the only input; no
    /// external state is consulted. Bridges re-acquire (or restart) their
    /// DHCP instances; tunnel refcounts are re-derived by counting.
    ///
    /// # Errors
    ///
    /// A tunnel whose bridge is missing is fatal for the call
    /// ([`CnciError::MissingBridge`]).
    pub async fn rebuild_topology(&self) -> Result<(), CnciError> {
        if !self.initialized {
            return Err(CnciError::NotInitialized);
        }
        self.rebuild_inner().await
    }

    async fn rebuild_inner(&self) -> Result<(), CnciError> {
        let mut topology = self.topology.lock().await;
        let links = self.netlink.link_list().await?;
        topology.reinit();

        // every aliased link is adopted first, so the link map is complete
        // even if a later pass fails
        for link in &links {
            let Some(alias) = link.alias.as_deref() else {
                continue;
            };
            if alias.is_empty() {
                continue;
            }
            topology.adopt_link(
                alias,
                LinkEntry {
                    name: link.name.clone(),
                    gate: Arc::new(DeviceGate::ready(link.index)),
                },
            );
        }

        for link in &links {
            if link.kind != LinkKind::Bridge {
                continue;
            }
            let Some(alias) = link.alias.as_deref() else {
                continue;
            };
            if !alias.starts_with(BRIDGE_PREFIX) {
                continue;
            }
            let bridge_alias = BridgeAlias::parse(alias)?;
            // the instance may have survived the crash; attach before
            // resorting to a restart
            let handle = self
                .dhcp
                .start_or_attach(&link.name, alias, self.tenant, bridge_alias.subnet())
                .await?;
            topology
                .bridge_map
                .insert(alias.to_string(), BridgeState::with_dhcp(handle));
        }

        for link in &links {
            if link.kind != LinkKind::GreTap {
                continue;
            }
            let Some(alias) = link.alias.as_deref() else {
                continue;
            };
            if !alias.starts_with(TUNNEL_PREFIX) {
                continue;
            }
            let tunnel_alias = TunnelAlias::parse(alias)?;
            let bridge_alias = tunnel_alias.bridge_alias();
            if !topology.link_map.contains_key(bridge_alias.as_str()) {
                return Err(CnciError::MissingBridge {
                    alias: alias.to_string(),
                });
            }
            let Some(state) = topology.bridge_map.get_mut(bridge_alias.as_str()) else {
                return Err(CnciError::MissingBridge {
                    alias: alias.to_string(),
                });
            };
            state.tunnels += 1;
        }

        info!(
            links = topology.link_map.len(),
            bridges = topology.bridge_map.len(),
            "rebuilt topology from device aliases"
        );
        Ok(())
    }

    /// Stop every DHCP instance and destroy every device the store knows.
    ///
    /// Teardown continues past failures so as much as possible is cleaned
    /// up; the last failure seen is returned.
    ///
    /// # Errors
    ///
    /// The last DHCP or device error encountered, if any.
    pub async fn shutdown(&self) -> Result<(), CnciError> {
        let mut topology = self.topology.lock().await;
        let mut last_error = None;

        let bridge_aliases: Vec<String> = topology.bridge_map.keys().cloned().collect();
        for alias in bridge_aliases {
            let Some(slot) = topology.bridge_map.get(&alias).map(|state| state.dhcp.clone())
            else {
                continue;
            };
            let handle = lock_slot(&slot).take();
            match handle {
                Some(handle) => {
                    if let Err(err) = self.dhcp.stop(&handle).await {
                        warn!("failed to stop dhcp for {alias}: {err}");
                        *lock_slot(&slot) = Some(handle);
                        last_error = Some(CnciError::from(err));
                        continue;
                    }
                    topology.bridge_map.remove(&alias);
                }
                None => {
                    warn!("bridge {alias} has no dhcp instance to stop");
                    last_error = Some(CnciError::MissingDhcp {
                        alias: alias.clone(),
                    });
                }
            }
        }

        let entries: Vec<(String, LinkEntry)> = topology
            .link_map
            .iter()
            .map(|(alias, entry)| (alias.clone(), entry.clone()))
            .collect();
        for (alias, entry) in entries {
            let index = match entry.gate.wait(self.api_timeout).await {
                Ok(index) => index,
                Err(err) => {
                    warn!("device {alias} never became ready");
                    last_error = Some(gate_error(err, &alias));
                    continue;
                }
            };
            let device = VnicRef {
                alias: alias.clone(),
            };
            if let Err(err) = device.destroy(&self.netlink, index).await {
                warn!("failed to destroy {alias}: {err}");
                last_error = Some(err.into());
                continue;
            }
            if let Some(entry) = topology.link_map.remove(&alias) {
                topology.name_map.remove(&entry.name);
            }
        }

        match last_error {
            Some(err) => Err(err),
            None => {
                info!("concentrator {} shut down", self.id);
                Ok(())
            }
        }
    }

    /// A diagnostic view of the store, taken under its lock.
    pub async fn topology_snapshot(&self) -> TopologySnapshot {
        self.topology.lock().await.snapshot()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zero_prefix_subnet_rejected() {
        let err = check_subnet_and_peer(
            "0.0.0.0/0".parse().unwrap(),
            "10.0.0.5".parse().unwrap(),
        )
        .unwrap_err();
        assert_eq!(err, InputError::UnspecifiedSubnet);
    }

    #[test]
    fn unspecified_peer_rejected() {
        let err = check_subnet_and_peer(
            "10.1.0.0/24".parse().unwrap(),
            Ipv4Addr::UNSPECIFIED,
        )
        .unwrap_err();
        assert_eq!(err, InputError::UnspecifiedPeer);
        let err = check_subnet_and_peer(
            "10.1.0.0/24".parse().unwrap(),
            Ipv4Addr::BROADCAST,
        )
        .unwrap_err();
        assert_eq!(err, InputError::UnspecifiedPeer);
    }

    #[test]
    fn sound_inputs_accepted() {
        check_subnet_and_peer("10.1.0.0/24".parse().unwrap(), "10.0.0.5".parse().unwrap())
            .unwrap();
    }
}
