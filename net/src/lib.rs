// SPDX-License-Identifier: Apache-2.0
// Copyright Cloud Concentrator Authors

//! Strongly typed building blocks for describing kernel network devices and
//! GRE tunnels.

#![deny(
    unsafe_code,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::must_use_candidate)]

pub mod interface;
pub mod tunnel;

pub use interface::{IllegalInterfaceName, InterfaceIndex, InterfaceIndexError, InterfaceName};
pub use tunnel::{InvalidTunnelKey, TunnelKey};
