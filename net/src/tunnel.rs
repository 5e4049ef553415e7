// SPDX-License-Identifier: Apache-2.0
// Copyright Cloud Concentrator Authors

//! GRE tunnel key type.

use core::fmt::{Display, Formatter};
use core::num::NonZero;
use serde::{Deserialize, Serialize};

/// A GRE tunnel key ([RFC2890]).
///
/// The key is a 32-bit value carried in the GRE header to distinguish tenant
/// subnets that share a physical path. Zero is refused: the concentrator uses
/// "no key" and "key zero" interchangeably on the wire, so accepting zero
/// here would make two different configurations indistinguishable.
///
/// `#[repr(transparent)]` over [`NonZero<u32>`] keeps `Option<TunnelKey>` the
/// size of a plain `u32`.
///
/// [RFC2890]: https://datatracker.ietf.org/doc/html/rfc2890
#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct TunnelKey(NonZero<u32>);

impl TunnelKey {
    /// Validate a raw `u32` as a tunnel key.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTunnelKey::ReservedZero`] for zero.
    pub fn new_checked(raw: u32) -> Result<Self, InvalidTunnelKey> {
        NonZero::new(raw)
            .map(TunnelKey)
            .ok_or(InvalidTunnelKey::ReservedZero)
    }

    /// The key as a plain `u32`.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0.get()
    }
}

impl Display for TunnelKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0.get())
    }
}

/// Errors produced when validating a tunnel key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, thiserror::Error)]
pub enum InvalidTunnelKey {
    /// Zero cannot be distinguished from "unkeyed" on the wire.
    #[error("zero is not a usable GRE key")]
    ReservedZero,
}

impl TryFrom<u32> for TunnelKey {
    type Error = InvalidTunnelKey;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        Self::new_checked(raw)
    }
}

impl From<TunnelKey> for u32 {
    fn from(key: TunnelKey) -> u32 {
        key.as_u32()
    }
}

#[cfg(any(test, feature = "bolero"))]
mod contract {
    use crate::tunnel::TunnelKey;
    use bolero::{Driver, TypeGenerator};

    impl TypeGenerator for TunnelKey {
        fn generate<D: Driver>(driver: &mut D) -> Option<Self> {
            Some(TunnelKey(driver.produce()?))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zero_rejected() {
        assert_eq!(
            TunnelKey::new_checked(0).unwrap_err(),
            InvalidTunnelKey::ReservedZero
        );
    }

    #[test]
    fn full_range_accepted() {
        assert_eq!(TunnelKey::new_checked(1).unwrap().as_u32(), 1);
        assert_eq!(
            TunnelKey::new_checked(u32::MAX).unwrap().as_u32(),
            u32::MAX
        );
    }

    #[test]
    fn round_trips() {
        bolero::check!().with_type().for_each(|key: &TunnelKey| {
            assert_eq!(*key, TunnelKey::new_checked(key.as_u32()).unwrap());
            assert_eq!(u32::from(*key), key.as_u32());
            assert_ne!(key.as_u32(), 0);
        });
    }
}
