// SPDX-License-Identifier: Apache-2.0
// Copyright Cloud Concentrator Authors

//! Configuration consumed at [`Cnci::init`](crate::Cnci::init).

use derive_builder::Builder;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_api_timeout() -> Duration {
    Duration::from_secs(6)
}

/// Network configuration handed to the concentrator by its agent.
///
/// Physical interfaces whose addresses fall inside `management_nets` carry
/// control traffic; those inside `compute_nets` carry tenant traffic. Either
/// set may be empty, in which case every discovered interface qualifies for
/// that role — but only when the host has a single candidate interface, so
/// the classification stays unambiguous.
#[derive(Builder, Clone, Debug, Deserialize, Serialize)]
pub struct NetworkConfig {
    /// Subnets of the management network.
    #[builder(default)]
    #[serde(default)]
    pub management_nets: Vec<Ipv4Net>,
    /// Subnets of the compute network.
    #[builder(default)]
    #[serde(default)]
    pub compute_nets: Vec<Ipv4Net>,
    /// Bound on waits for concurrently created devices.
    #[builder(default = "default_api_timeout()")]
    #[serde(default = "default_api_timeout")]
    pub api_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            management_nets: Vec::new(),
            compute_nets: Vec::new(),
            api_timeout: default_api_timeout(),
        }
    }
}
