// SPDX-License-Identifier: Apache-2.0
// Copyright Cloud Concentrator Authors

//! Kernel device adapters for the concentrator overlay.
//!
//! The [`netlink::Netlink`] trait is the contract the topology core consumes:
//! link enumeration, address / neighbor / route manipulation, and typed
//! creation of the bridge and GRE devices the overlay is made of.
//! [`rtnl::RtNetlink`] implements it against the live kernel;
//! [`memory::MemoryNetlink`] (feature `testing`) implements it against an
//! in-memory namespace for unprivileged tests.

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

pub mod device;
mod gre;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod netlink;
pub mod netns;
pub mod rtnl;

pub use device::{BridgeSpec, DeviceError, GreTapSpec, GreTunSpec, VnicRef};
pub use netlink::{
    AddressRecord, LinkKind, LinkRecord, NeighborRecord, Netlink, NetlinkError, RouteRecord,
};
pub use rtnl::RtNetlink;
