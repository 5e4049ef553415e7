// SPDX-License-Identifier: Apache-2.0
// Copyright Cloud Concentrator Authors

//! The concentrator's error surface.
//!
//! Validation failures ([`InputError`]) mean the request itself is wrong and
//! retrying is pointless; kernel failures mean the request was sound and may
//! be retried. The two are never conflated.

use crate::alias::AliasError;
use crate::names::NameError;
use device_manager::{DeviceError, NetlinkError};
use dhcp::DhcpError;

/// A request that can never succeed as given.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum InputError {
    #[error("peer address must be a specific unicast host")]
    UnspecifiedPeer,
    #[error("subnet must name a tenant network")]
    UnspecifiedSubnet,
    #[error("neighbor list does not contain this concentrator")]
    NoLocalNeighbor,
}

/// Init could not make sense of the host's interfaces.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to associate any interface with the management networks")]
    NoManagementInterface,
    #[error("unable to associate any interface with the compute networks")]
    NoComputeInterface,
    #[error("cannot autoconfigure with {interfaces} candidate physical interfaces")]
    AmbiguousAutoConfig { interfaces: usize },
}

/// Every failure a concentrator operation can surface.
#[derive(Debug, thiserror::Error)]
pub enum CnciError {
    #[error("invalid input: {0}")]
    InvalidInput(#[from] InputError),
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Netlink(#[from] NetlinkError),
    #[error(transparent)]
    Dhcp(#[from] DhcpError),
    #[error(transparent)]
    Names(#[from] NameError),
    #[error(transparent)]
    Alias(#[from] AliasError),
    /// A tunnel references a bridge the store does not know.
    #[error("tunnel {alias} has no matching bridge")]
    MissingBridge { alias: String },
    /// A bridge entry carries no DHCP instance where one is required.
    #[error("bridge {alias} has no dhcp instance")]
    MissingDhcp { alias: String },
    /// A bounded wait on a device's readiness gate elapsed.
    #[error("timed out waiting on device {alias}")]
    DeviceTimeout { alias: String },
    /// The device's creator released its gate without a device behind it.
    #[error("device {alias} failed to materialize")]
    DeviceFailed { alias: String },
    #[error("concentrator is not initialized")]
    NotInitialized,
}
