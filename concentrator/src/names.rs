// SPDX-License-Identifier: Apache-2.0
// Copyright Cloud Concentrator Authors

//! Kernel device name generation.
//!
//! Kernel names only need to be unique on this host; logical identity lives
//! in the alias. The generator probes deterministically from a counter so
//! that the core never reaches for process-global randomness.

use net::InterfaceName;
use std::collections::HashSet;

/// Name prefix for generated bridge devices.
pub(crate) const BRIDGE_DEV_PREFIX: &str = "cnbr";
/// Name prefix for generated subnet-tunnel devices.
pub(crate) const TUNNEL_DEV_PREFIX: &str = "cngre";

const NAME_RETRY_LIMIT: usize = 512;

/// Failure to find an unused kernel device name.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum NameError {
    #[error("no unused device name with prefix {prefix} after {NAME_RETRY_LIMIT} attempts")]
    Exhausted { prefix: String },
}

#[derive(Debug, Default)]
pub(crate) struct NameGenerator {
    counter: u64,
}

impl NameGenerator {
    /// The first unused name `prefix<hex>` not present in `reserved`.
    ///
    /// The caller is responsible for inserting the returned name into the
    /// reserved set before requesting another.
    pub(crate) fn next_free(
        &mut self,
        prefix: &str,
        reserved: &HashSet<InterfaceName>,
    ) -> Result<InterfaceName, NameError> {
        for _ in 0..NAME_RETRY_LIMIT {
            self.counter += 1;
            let Ok(candidate) = InterfaceName::try_from(format!("{prefix}{:x}", self.counter))
            else {
                break;
            };
            if !reserved.contains(&candidate) {
                return Ok(candidate);
            }
        }
        Err(NameError::Exhausted {
            prefix: prefix.to_string(),
        })
    }
}
