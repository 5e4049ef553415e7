// SPDX-License-Identifier: Apache-2.0
// Copyright Cloud Concentrator Authors

//! Per-tenant overlay topology core.
//!
//! A concentrator owns every subnet of one tenant: a local bridge with an
//! attached DHCP instance per subnet, point-to-point GRE taps stitching
//! remote compute nodes into those bridges, and one point-to-multipoint GRE
//! tunnel reaching peer concentrators. This crate is the in-memory model of
//! that graph and the idempotent, concurrency-safe operations over it; the
//! kernel itself is reached through the adapter contract in
//! [`device_manager`].
//!
//! Logical identity is durable: every bridge and subnet tunnel carries an
//! alias attribute on the kernel device, and [`Cnci::rebuild_topology`]
//! reconstructs the whole model from those aliases after a crash.

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

pub mod alias;
mod cnci;
pub mod config;
pub mod error;
mod gate;
mod names;
mod neighbors;
mod topology;

pub use cnci::{Cnci, PhyAddress};
pub use config::NetworkConfig;
pub use error::{CnciError, ConfigError, InputError};
pub use names::NameError;
pub use neighbors::Neighbor;
pub use topology::{BridgeSnapshot, LinkSnapshot, TopologySnapshot};
