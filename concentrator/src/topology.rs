// SPDX-License-Identifier: Apache-2.0
// Copyright Cloud Concentrator Authors

//! The concurrency-safe topology store.
//!
//! Three tables behind one mutex: `link_map` (alias to reserved link),
//! `name_map` (kernel names in use), `bridge_map` (per-bridge tunnel
//! refcount and DHCP handle). The mutex guards reservations only; kernel
//! work happens outside it, coordinated per-entry through
//! [`DeviceGate`]s.
//!
//! Invariants:
//! - every `bridge_map` key is also a `link_map` key;
//! - every live entry's kernel name is present in `name_map`;
//! - a bridge's `tunnels` count equals the number of tunnel aliases in
//!   `link_map` that decode to its subnet.

use crate::alias::{BridgeAlias, TunnelAlias};
use crate::error::CnciError;
use crate::gate::DeviceGate;
use crate::names::{BRIDGE_DEV_PREFIX, NameGenerator, TUNNEL_DEV_PREFIX};
use net::InterfaceName;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone, Debug)]
pub(crate) struct LinkEntry {
    pub(crate) name: InterfaceName,
    pub(crate) gate: Arc<DeviceGate>,
}

/// Lock a DHCP slot, surviving poisoning (a panicked holder cannot corrupt
/// an `Option`).
pub(crate) fn lock_slot<H>(slot: &Mutex<Option<H>>) -> MutexGuard<'_, Option<H>> {
    match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug)]
pub(crate) struct BridgeState<H> {
    pub(crate) tunnels: u32,
    /// Shared slot for the bridge's DHCP handle. A creator fills it after
    /// the (slow) instance start, without re-entering the store lock.
    pub(crate) dhcp: Arc<Mutex<Option<H>>>,
}

impl<H> BridgeState<H> {
    fn empty() -> Self {
        Self {
            tunnels: 0,
            dhcp: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn with_dhcp(handle: H) -> Self {
        Self {
            tunnels: 0,
            dhcp: Arc::new(Mutex::new(Some(handle))),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Topology<H> {
    pub(crate) link_map: HashMap<String, LinkEntry>,
    pub(crate) name_map: HashSet<InterfaceName>,
    pub(crate) bridge_map: HashMap<String, BridgeState<H>>,
    names: NameGenerator,
}

/// What [`Topology::reserve_subnet`] decided: which devices this caller must
/// create, under which kernel names, and the gates coordinating both.
pub(crate) struct SubnetReservation<H> {
    pub(crate) bridge_created: bool,
    pub(crate) gre_created: bool,
    pub(crate) bridge_name: InterfaceName,
    pub(crate) gre_name: InterfaceName,
    pub(crate) bridge_gate: Arc<DeviceGate>,
    pub(crate) gre_gate: Arc<DeviceGate>,
    pub(crate) dhcp_slot: Arc<Mutex<Option<H>>>,
}

impl<H> SubnetReservation<H> {
    /// Both devices were already reserved; nothing to create.
    pub(crate) fn settled(&self) -> bool {
        !self.bridge_created && !self.gre_created
    }
}

impl<H> Topology<H> {
    pub(crate) fn new() -> Self {
        Self {
            link_map: HashMap::new(),
            name_map: HashSet::new(),
            bridge_map: HashMap::new(),
            names: NameGenerator::default(),
        }
    }

    /// Drop every table, as rebuild does before repopulating.
    pub(crate) fn reinit(&mut self) {
        self.link_map.clear();
        self.name_map.clear();
        self.bridge_map.clear();
    }

    /// Insert an entry observed live in the kernel (rebuild path). The gate
    /// is born settled.
    pub(crate) fn adopt_link(&mut self, alias: &str, entry: LinkEntry) {
        self.name_map.insert(entry.name.clone());
        self.link_map.insert(alias.to_string(), entry);
    }

    /// Atomically reserve the bridge and tunnel for one remote subnet.
    ///
    /// Missing entries are created with fresh kernel names and pending
    /// gates, and the bridge's tunnel refcount is bumped for a new tunnel.
    /// On any failure the store is left exactly as it was found.
    pub(crate) fn reserve_subnet(
        &mut self,
        bridge: &BridgeAlias,
        gre: &TunnelAlias,
    ) -> Result<SubnetReservation<H>, CnciError> {
        let existing_bridge = self.link_map.get(bridge.as_str()).cloned();
        let existing_gre = self.link_map.get(gre.as_str()).cloned();

        let (bridge_name, bridge_gate, bridge_created) = match existing_bridge {
            Some(entry) => {
                if !self.bridge_map.contains_key(bridge.as_str()) {
                    return Err(CnciError::MissingBridge {
                        alias: bridge.as_str().to_string(),
                    });
                }
                (entry.name, entry.gate, false)
            }
            None => {
                let name = self.names.next_free(BRIDGE_DEV_PREFIX, &self.name_map)?;
                self.name_map.insert(name.clone());
                let gate = Arc::new(DeviceGate::pending());
                self.link_map.insert(
                    bridge.as_str().to_string(),
                    LinkEntry {
                        name: name.clone(),
                        gate: gate.clone(),
                    },
                );
                self.bridge_map
                    .insert(bridge.as_str().to_string(), BridgeState::empty());
                (name, gate, true)
            }
        };
        #[allow(clippy::expect_used)] // inserted two statements up at the latest
        let dhcp_slot = self
            .bridge_map
            .get(bridge.as_str())
            .expect("bridge state reserved above")
            .dhcp
            .clone();

        let (gre_name, gre_gate, gre_created) = match existing_gre {
            Some(entry) => (entry.name, entry.gate, false),
            None => {
                let name = match self.names.next_free(TUNNEL_DEV_PREFIX, &self.name_map) {
                    Ok(name) => name,
                    Err(err) => {
                        if bridge_created {
                            self.forget_bridge(bridge);
                        }
                        return Err(err.into());
                    }
                };
                self.name_map.insert(name.clone());
                let gate = Arc::new(DeviceGate::pending());
                self.link_map.insert(
                    gre.as_str().to_string(),
                    LinkEntry {
                        name: name.clone(),
                        gate: gate.clone(),
                    },
                );
                if let Some(state) = self.bridge_map.get_mut(bridge.as_str()) {
                    state.tunnels += 1;
                }
                (name, gate, true)
            }
        };

        Ok(SubnetReservation {
            bridge_created,
            gre_created,
            bridge_name,
            gre_name,
            bridge_gate,
            gre_gate,
            dhcp_slot,
        })
    }

    /// Undo exactly what `reserve_subnet` reserved for a failed call.
    pub(crate) fn rollback_subnet(
        &mut self,
        bridge: &BridgeAlias,
        gre: &TunnelAlias,
        reservation: &SubnetReservation<H>,
    ) {
        if reservation.gre_created {
            if let Some(entry) = self.link_map.remove(gre.as_str()) {
                self.name_map.remove(&entry.name);
            }
            if !reservation.bridge_created {
                if let Some(state) = self.bridge_map.get_mut(bridge.as_str()) {
                    state.tunnels = state.tunnels.saturating_sub(1);
                }
            }
        }
        if reservation.bridge_created {
            self.forget_bridge(bridge);
        }
    }

    /// Drop a bridge reservation (entry, name, bridge state).
    pub(crate) fn forget_bridge(&mut self, bridge: &BridgeAlias) {
        if let Some(entry) = self.link_map.remove(bridge.as_str()) {
            self.name_map.remove(&entry.name);
        }
        self.bridge_map.remove(bridge.as_str());
    }

    /// Drop a tunnel entry and release its kernel name.
    pub(crate) fn forget_tunnel_entry(&mut self, gre: &TunnelAlias) {
        if let Some(entry) = self.link_map.remove(gre.as_str()) {
            self.name_map.remove(&entry.name);
        }
    }

    /// Undo a tunnel reservation whose device never materialized. The
    /// bridge (live, possibly pre-existing) keeps its entry; only the
    /// refcount the reservation took is returned.
    pub(crate) fn rollback_tunnel(&mut self, bridge: &BridgeAlias, gre: &TunnelAlias) {
        self.forget_tunnel_entry(gre);
        if let Some(state) = self.bridge_map.get_mut(bridge.as_str()) {
            state.tunnels = state.tunnels.saturating_sub(1);
        }
    }

    pub(crate) fn snapshot(&self) -> TopologySnapshot {
        let mut links: Vec<_> = self
            .link_map
            .iter()
            .map(|(alias, entry)| LinkSnapshot {
                alias: alias.clone(),
                name: entry.name.clone(),
            })
            .collect();
        links.sort_by(|a, b| a.alias.cmp(&b.alias));
        let mut bridges: Vec<_> = self
            .bridge_map
            .iter()
            .map(|(alias, state)| BridgeSnapshot {
                alias: alias.clone(),
                tunnels: state.tunnels,
                dhcp_running: lock_slot(&state.dhcp).is_some(),
            })
            .collect();
        bridges.sort_by(|a, b| a.alias.cmp(&b.alias));
        let mut names: Vec<_> = self.name_map.iter().cloned().collect();
        names.sort();
        TopologySnapshot {
            links,
            bridges,
            names,
        }
    }
}

/// One reserved link, as reported by [`TopologySnapshot`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LinkSnapshot {
    pub alias: String,
    pub name: InterfaceName,
}

/// One bridge, as reported by [`TopologySnapshot`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BridgeSnapshot {
    pub alias: String,
    pub tunnels: u32,
    pub dhcp_running: bool,
}

/// A diagnostic view of the store, taken under its lock.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TopologySnapshot {
    pub links: Vec<LinkSnapshot>,
    pub bridges: Vec<BridgeSnapshot>,
    pub names: Vec<InterfaceName>,
}

impl TopologySnapshot {
    /// Find a link by alias.
    #[must_use]
    pub fn link(&self, alias: &str) -> Option<&LinkSnapshot> {
        self.links.iter().find(|link| link.alias == alias)
    }

    /// Find a bridge by alias.
    #[must_use]
    pub fn bridge(&self, alias: &str) -> Option<&BridgeSnapshot> {
        self.bridges.iter().find(|bridge| bridge.alias == alias)
    }
}
