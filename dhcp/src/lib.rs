// SPDX-License-Identifier: Apache-2.0
// Copyright Cloud Concentrator Authors

//! Per-bridge DHCP/DNS supervision.
//!
//! Every tenant bridge owns at most one DHCP instance. The
//! [`DhcpService`] trait is the seam the topology core calls through;
//! [`dnsmasq::Dnsmasq`] is the production supervisor.

#![deny(
    unsafe_code,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod dnsmasq;

pub use dnsmasq::{Dnsmasq, DnsmasqHandle};

use cnci_id::{Id, Tenant};
use ipnet::Ipv4Net;
use net::InterfaceName;
use std::future::Future;
use std::path::PathBuf;

/// Failures from a DHCP supervisor.
#[derive(Debug, thiserror::Error)]
pub enum DhcpError {
    #[error("dhcp instance for {bridge} is not running")]
    NotRunning { bridge: InterfaceName },
    #[error("subnet {subnet} is too small to serve leases")]
    SubnetTooSmall { subnet: Ipv4Net },
    #[error("failed to write dhcp state under {path}")]
    State {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to launch dnsmasq for {bridge}")]
    Launch {
        bridge: InterfaceName,
        #[source]
        source: std::io::Error,
    },
    #[error("dnsmasq for {bridge} exited with {status}")]
    Exited {
        bridge: InterfaceName,
        status: std::process::ExitStatus,
    },
    #[error("failed to signal dnsmasq pid {pid}")]
    Signal {
        pid: i32,
        #[source]
        source: nix::Error,
    },
}

/// Supervision of per-bridge DHCP/DNS instances.
///
/// Implementations guarantee at most one live instance per bridge: a second
/// `start_or_attach` for the same bridge attaches to the running instance
/// rather than spawning another.
pub trait DhcpService: Send + Sync {
    /// Opaque reference to one running (or adopted) instance.
    type Handle: Send + Sync;

    /// Attach to the instance serving `bridge` if one is alive, otherwise
    /// (re)start it for `subnet`.
    fn start_or_attach(
        &self,
        bridge: &InterfaceName,
        bridge_id: &str,
        tenant: Id<Tenant>,
        subnet: Ipv4Net,
    ) -> impl Future<Output = Result<Self::Handle, DhcpError>> + Send;

    /// Terminate the instance behind `handle`.
    fn stop(&self, handle: &Self::Handle) -> impl Future<Output = Result<(), DhcpError>> + Send;
}
