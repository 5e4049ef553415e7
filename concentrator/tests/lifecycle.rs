// SPDX-License-Identifier: Apache-2.0
// Copyright Cloud Concentrator Authors

//! Init, rebuild and shutdown against the in-memory kernel.

mod common;

use cnci_id::Id;
use common::{MockDhcp, assert_invariants, harness, harness_with, name};
use concentrator::config::NetworkConfigBuilder;
use concentrator::{Cnci, CnciError, ConfigError};
use device_manager::DeviceError;
use device_manager::memory::MemoryNetlink;
use net::TunnelKey;
use std::net::Ipv4Addr;
use tracing_test::traced_test;

fn key() -> TunnelKey {
    TunnelKey::new_checked(99).unwrap()
}

fn crashed_kernel() -> MemoryNetlink {
    // what a crashed concentrator leaves behind: one subnet bridge with its
    // tunnel, both carrying their aliases
    let netlink = MemoryNetlink::new();
    netlink.seed_physical(&name("eth0"), &[("10.0.0.1".parse().unwrap(), 24)]);
    netlink.seed_bridge(&name("cnbr7"), "br_10.1.0.0+24");
    netlink.seed_gretap(
        &name("cngre9"),
        "gre_10.1.0.0+24##10.0.0.7",
        "10.0.0.1".parse().unwrap(),
        "10.0.0.7".parse().unwrap(),
        key(),
    );
    netlink
}

#[tokio::test]
async fn init_classifies_physical_addresses() {
    let h = harness().await;
    let management = h.cnci.management_addresses();
    let compute = h.cnci.compute_addresses();
    assert_eq!(management.len(), 1);
    assert_eq!(compute.len(), 1);
    assert_eq!(management[0].name, name("eth0"));
    assert_eq!(compute[0].address, "10.0.0.1".parse::<Ipv4Addr>().unwrap());
    assert!(h.netlink.forwarding_enabled());
}

#[tokio::test]
async fn init_is_idempotent_per_process() {
    let h = harness().await;
    let starts = h.dhcp.start_count();
    // the harness shares the Cnci behind an Arc, so re-init goes through a
    // fresh instance over the same kernel
    let mut again = Cnci::new(
        Id::new(),
        Id::new(),
        NetworkConfigBuilder::default()
            .management_nets(vec!["10.0.0.0/24".parse().unwrap()])
            .compute_nets(vec!["10.0.0.0/24".parse().unwrap()])
            .build()
            .unwrap(),
        h.netlink.clone(),
        h.dhcp.clone(),
    );
    again.init().await.unwrap();
    again.init().await.unwrap();
    assert_eq!(h.dhcp.start_count(), starts);
}

#[tokio::test]
async fn init_fails_without_a_compute_interface() {
    let netlink = MemoryNetlink::new();
    netlink.seed_physical(&name("eth0"), &[("10.0.0.1".parse().unwrap(), 24)]);
    let config = NetworkConfigBuilder::default()
        .compute_nets(vec!["192.168.0.0/24".parse().unwrap()])
        .build()
        .unwrap();
    let mut cnci = Cnci::new(Id::new(), Id::new(), config, netlink, MockDhcp::new());
    let err = cnci.init().await.unwrap_err();
    assert!(matches!(
        err,
        CnciError::Config(ConfigError::NoComputeInterface)
    ));
}

#[tokio::test]
async fn init_refuses_ambiguous_autoconfiguration() {
    let netlink = MemoryNetlink::new();
    netlink.seed_physical(&name("eth0"), &[("10.0.0.1".parse().unwrap(), 24)]);
    netlink.seed_physical(&name("eth1"), &[("192.168.0.1".parse().unwrap(), 24)]);
    let config = NetworkConfigBuilder::default().build().unwrap();
    let mut cnci = Cnci::new(Id::new(), Id::new(), config, netlink, MockDhcp::new());
    let err = cnci.init().await.unwrap_err();
    assert!(matches!(
        err,
        CnciError::Config(ConfigError::AmbiguousAutoConfig { interfaces: 2 })
    ));
}

#[tokio::test]
async fn rebuild_recovers_the_store_from_aliases() {
    let h = harness_with(crashed_kernel()).await;

    let snapshot = h.cnci.topology_snapshot().await;
    assert_eq!(snapshot.links.len(), 2);
    assert_eq!(snapshot.names.len(), 2);
    assert_eq!(snapshot.bridges.len(), 1);
    let bridge = snapshot.bridge("br_10.1.0.0+24").unwrap();
    assert_eq!(bridge.tunnels, 1);
    assert!(bridge.dhcp_running);
    assert_eq!(snapshot.link("br_10.1.0.0+24").unwrap().name, name("cnbr7"));
    assert_eq!(
        snapshot.link("gre_10.1.0.0+24##10.0.0.7").unwrap().name,
        name("cngre9")
    );
    // DHCP was re-attached, not left for dead
    assert_eq!(h.dhcp.start_count(), 1);
    assert_invariants(&snapshot);

    // the recovered tunnel is deletable like any other
    h.cnci
        .del_remote_subnet(
            "10.1.0.0/24".parse().unwrap(),
            key(),
            "10.0.0.7".parse().unwrap(),
        )
        .await
        .unwrap();
    let snapshot = h.cnci.topology_snapshot().await;
    assert!(snapshot.link("gre_10.1.0.0+24##10.0.0.7").is_none());
    assert_eq!(snapshot.bridge("br_10.1.0.0+24").unwrap().tunnels, 0);
    assert!(!h.netlink.has_link_named("cngre9"));
    assert_invariants(&snapshot);
}

#[tokio::test]
async fn rebuild_rejects_a_tunnel_without_its_bridge() {
    let netlink = MemoryNetlink::new();
    netlink.seed_physical(&name("eth0"), &[("10.0.0.1".parse().unwrap(), 24)]);
    netlink.seed_gretap(
        &name("cngre9"),
        "gre_10.1.0.0+24##10.0.0.7",
        "10.0.0.1".parse().unwrap(),
        "10.0.0.7".parse().unwrap(),
        key(),
    );
    let config = NetworkConfigBuilder::default()
        .management_nets(vec!["10.0.0.0/24".parse().unwrap()])
        .compute_nets(vec!["10.0.0.0/24".parse().unwrap()])
        .build()
        .unwrap();
    let mut cnci = Cnci::new(Id::new(), Id::new(), config, netlink, MockDhcp::new());
    let err = cnci.init().await.unwrap_err();
    assert!(matches!(err, CnciError::MissingBridge { alias } if alias.contains("gre_10.1.0.0+24")));
}

#[tokio::test]
async fn shutdown_after_rebuild_reaches_the_fixpoint() {
    let h = harness_with(crashed_kernel()).await;
    h.cnci.shutdown().await.unwrap();

    let snapshot = h.cnci.topology_snapshot().await;
    assert!(snapshot.links.is_empty());
    assert!(snapshot.bridges.is_empty());
    assert!(snapshot.names.is_empty());
    assert_eq!(h.dhcp.stop_count(), 1);
    // only the physical link survives
    assert_eq!(h.netlink.link_count(), 1);
    assert!(h.netlink.has_link_named("eth0"));
}

#[tokio::test]
#[traced_test]
async fn shutdown_continues_past_a_failing_destroy() {
    let h = harness().await;
    h.cnci
        .add_remote_subnet(
            "10.4.0.0/24".parse().unwrap(),
            key(),
            "10.0.0.7".parse().unwrap(),
        )
        .await
        .unwrap();
    let snapshot = h.cnci.topology_snapshot().await;
    let tunnel_name = snapshot.link("gre_10.4.0.0+24##10.0.0.7").unwrap().name.clone();
    let bridge_name = snapshot.link("br_10.4.0.0+24").unwrap().name.clone();
    h.netlink.fail_destroy_of(tunnel_name.as_ref());

    let err = h.cnci.shutdown().await.unwrap_err();
    assert!(matches!(
        err,
        CnciError::Device(DeviceError::Vnic { ref alias, .. }) if alias == "gre_10.4.0.0+24##10.0.0.7"
    ));

    // the bridge teardown still happened; only the tunnel lingers
    assert!(!h.netlink.has_link_named(bridge_name.as_ref()));
    assert!(h.netlink.has_link_named(tunnel_name.as_ref()));
    assert_eq!(h.dhcp.stop_count(), 1);
    let snapshot = h.cnci.topology_snapshot().await;
    assert!(snapshot.bridges.is_empty());
    assert_eq!(snapshot.links.len(), 1);
    assert!(snapshot.link("gre_10.4.0.0+24##10.0.0.7").is_some());
}

#[tokio::test]
async fn rebuild_on_demand_requires_init() {
    let netlink = MemoryNetlink::new();
    netlink.seed_physical(&name("eth0"), &[("10.0.0.1".parse().unwrap(), 24)]);
    let cnci = Cnci::new(
        Id::new(),
        Id::new(),
        NetworkConfigBuilder::default().build().unwrap(),
        netlink,
        MockDhcp::new(),
    );
    assert!(matches!(
        cnci.rebuild_topology().await.unwrap_err(),
        CnciError::NotInitialized
    ));
}

#[tokio::test]
async fn rebuild_on_demand_resets_the_store() {
    let h = harness().await;
    h.cnci
        .add_remote_subnet(
            "10.4.0.0/24".parse().unwrap(),
            key(),
            "10.0.0.7".parse().unwrap(),
        )
        .await
        .unwrap();

    // a rebuild derives the same store from the kernel alone
    let before = h.cnci.topology_snapshot().await;
    h.cnci.rebuild_topology().await.unwrap();
    let after = h.cnci.topology_snapshot().await;
    assert_eq!(before.links, after.links);
    assert_eq!(before.names, after.names);
    assert_eq!(before.bridges.len(), after.bridges.len());
    assert_eq!(
        before.bridge("br_10.4.0.0+24").unwrap().tunnels,
        after.bridge("br_10.4.0.0+24").unwrap().tunnels
    );
    assert_invariants(&after);
}