// SPDX-License-Identifier: Apache-2.0
// Copyright Cloud Concentrator Authors

//! Privileged integration checks for the rtnetlink backend.
//!
//! These run against a scratch network namespace and need CAP_SYS_ADMIN and
//! CAP_NET_ADMIN, so they are ignored by default:
//! `cargo test -p cnci-device-manager -- --ignored` as root.

use device_manager::{BridgeSpec, GreTapSpec, LinkKind, Netlink, RtNetlink};
use device_manager::netns::in_netns;
use net::{InterfaceName, TunnelKey};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;

const NETNS: &str = "cnci-devmgr-test";

fn with_scratch_netns<T: Send + 'static>(
    body: impl FnOnce() -> T + Send + 'static,
) -> T {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .unwrap();
    runtime.block_on(async {
        rtnetlink::NetworkNamespace::add(NETNS.to_string())
            .await
            .unwrap();
    });
    let outcome = catch_unwind(AssertUnwindSafe(body));
    runtime.block_on(async {
        rtnetlink::NetworkNamespace::del(NETNS.to_string())
            .await
            .unwrap();
    });
    outcome.unwrap()
}

#[test]
#[ignore = "requires CAP_SYS_ADMIN and CAP_NET_ADMIN"]
fn bridge_and_tunnel_round_trip() {
    with_scratch_netns(|| {
        in_netns(Path::new("/run/netns/cnci-devmgr-test"), || async {
            let nl = RtNetlink::connect().unwrap();

            let bridge = BridgeSpec {
                alias: "br_172.16.0.0+21".to_string(),
                name: InterfaceName::try_from("cnbr1").unwrap(),
            };
            let bridge_index = bridge.create(&nl).await.unwrap();
            bridge.enable(&nl, bridge_index).await.unwrap();

            let tap = GreTapSpec {
                alias: "gre_172.16.0.0+21##10.0.0.5".to_string(),
                name: InterfaceName::try_from("cngre1").unwrap(),
                local: "10.0.0.1".parse().unwrap(),
                remote: "10.0.0.5".parse().unwrap(),
                key: TunnelKey::new_checked(42).unwrap(),
            };
            let tap_index = tap.create(&nl).await.unwrap();
            tap.enable(&nl, tap_index).await.unwrap();
            tap.attach(&nl, tap_index, bridge_index).await.unwrap();

            let links = nl.link_list().await.unwrap();
            let observed_bridge = links
                .iter()
                .find(|record| record.alias.as_deref() == Some("br_172.16.0.0+21"))
                .expect("bridge alias not visible");
            assert_eq!(observed_bridge.kind, LinkKind::Bridge);
            assert_eq!(observed_bridge.index, bridge_index);

            let observed_tap = links
                .iter()
                .find(|record| record.alias.as_deref() == Some("gre_172.16.0.0+21##10.0.0.5"))
                .expect("tunnel alias not visible");
            assert_eq!(observed_tap.kind, LinkKind::GreTap);
            assert_eq!(observed_tap.controller, Some(bridge_index));

            tap.destroy(&nl, tap_index).await.unwrap();
            bridge.destroy(&nl, bridge_index).await.unwrap();
            assert!(tap.get_device(&nl).await.unwrap().is_none());
            assert!(bridge.get_device(&nl).await.unwrap().is_none());
        })
    });
}
