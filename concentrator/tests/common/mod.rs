// SPDX-License-Identifier: Apache-2.0
// Copyright Cloud Concentrator Authors

//! Shared fixtures: a seeded in-memory kernel, a recording DHCP mock, and
//! an initialized concentrator.

// each test binary uses a different slice of this module
#![allow(dead_code)]

use cnci_id::{Id, Tenant};
use concentrator::alias::TunnelAlias;
use concentrator::config::NetworkConfigBuilder;
use concentrator::{Cnci, TopologySnapshot};
use device_manager::memory::MemoryNetlink;
use dhcp::{DhcpError, DhcpService};
use ipnet::Ipv4Net;
use net::InterfaceName;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// One recorded `start_or_attach` outcome.
#[derive(Clone, Debug)]
pub struct MockDhcpHandle {
    pub bridge: InterfaceName,
    pub bridge_id: String,
    pub subnet: Ipv4Net,
}

#[derive(Default)]
struct MockDhcpState {
    started: Mutex<Vec<MockDhcpHandle>>,
    stopped: AtomicUsize,
    fail_start: AtomicBool,
}

/// A recording [`DhcpService`] with injectable start failures.
#[derive(Clone, Default)]
pub struct MockDhcp {
    state: Arc<MockDhcpState>,
}

impl MockDhcp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.state.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn start_count(&self) -> usize {
        self.state.started.lock().unwrap().len()
    }

    pub fn stop_count(&self) -> usize {
        self.state.stopped.load(Ordering::SeqCst)
    }

    #[allow(dead_code)]
    pub fn started(&self) -> Vec<MockDhcpHandle> {
        self.state.started.lock().unwrap().clone()
    }
}

impl DhcpService for MockDhcp {
    type Handle = MockDhcpHandle;

    async fn start_or_attach(
        &self,
        bridge: &InterfaceName,
        bridge_id: &str,
        _tenant: Id<Tenant>,
        subnet: Ipv4Net,
    ) -> Result<MockDhcpHandle, DhcpError> {
        if self.state.fail_start.load(Ordering::SeqCst) {
            return Err(DhcpError::NotRunning {
                bridge: bridge.clone(),
            });
        }
        let handle = MockDhcpHandle {
            bridge: bridge.clone(),
            bridge_id: bridge_id.to_string(),
            subnet,
        };
        self.state.started.lock().unwrap().push(handle.clone());
        Ok(handle)
    }

    async fn stop(&self, _handle: &MockDhcpHandle) -> Result<(), DhcpError> {
        self.state.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct Harness {
    pub cnci: Arc<Cnci<MemoryNetlink, MockDhcp>>,
    pub netlink: MemoryNetlink,
    pub dhcp: MockDhcp,
}

pub fn name(s: &str) -> InterfaceName {
    InterfaceName::try_from(s).unwrap()
}

/// The harness's compute/management address.
pub const HOST_ADDRESS: &str = "10.0.0.1";

/// An initialized concentrator over a kernel holding one physical link
/// (`eth0`, `10.0.0.1/24`).
pub async fn harness() -> Harness {
    let netlink = MemoryNetlink::new();
    netlink.seed_physical(
        &name("eth0"),
        &[(HOST_ADDRESS.parse::<Ipv4Addr>().unwrap(), 24)],
    );
    harness_with(netlink).await
}

/// An initialized concentrator over a pre-seeded kernel.
pub async fn harness_with(netlink: MemoryNetlink) -> Harness {
    let dhcp = MockDhcp::new();
    let config = NetworkConfigBuilder::default()
        .management_nets(vec!["10.0.0.0/24".parse().unwrap()])
        .compute_nets(vec!["10.0.0.0/24".parse().unwrap()])
        .build()
        .unwrap();
    let mut cnci = Cnci::new(Id::new(), Id::new(), config, netlink.clone(), dhcp.clone());
    cnci.init().await.unwrap();
    Harness {
        cnci: Arc::new(cnci),
        netlink,
        dhcp,
    }
}

/// Check the store invariants: unique kernel names, every name reserved,
/// bridges backed by link entries, refcounts matching the tunnel aliases
/// actually present.
pub fn assert_invariants(snapshot: &TopologySnapshot) {
    let distinct: HashSet<_> = snapshot.links.iter().map(|link| &link.name).collect();
    assert_eq!(
        distinct.len(),
        snapshot.links.len(),
        "kernel names are not unique: {snapshot:?}"
    );
    for link in &snapshot.links {
        assert!(
            snapshot.names.contains(&link.name),
            "name {} not reserved: {snapshot:?}",
            link.name
        );
    }
    for bridge in &snapshot.bridges {
        assert!(
            snapshot.link(&bridge.alias).is_some(),
            "bridge {} missing from the link map: {snapshot:?}",
            bridge.alias
        );
        let tunnels = snapshot
            .links
            .iter()
            .filter(|link| {
                TunnelAlias::parse(&link.alias)
                    .map(|alias| alias.bridge_alias().as_str() == bridge.alias)
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(
            bridge.tunnels as usize, tunnels,
            "refcount mismatch for {}: {snapshot:?}",
            bridge.alias
        );
    }
}
