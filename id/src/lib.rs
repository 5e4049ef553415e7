// SPDX-License-Identifier: Apache-2.0
// Copyright Cloud Concentrator Authors

//! Typed [UUID] identifiers for the concentrator.
//!
//! The controller addresses every tenant and every concentrator by UUID. This
//! crate tags those UUIDs with a zero-sized marker so that a tenant id cannot
//! be handed to an API expecting a concentrator id (or vice versa) without the
//! compiler objecting.
//!
//! [UUID]: https://en.wikipedia.org/wiki/Universally_unique_identifier

use core::fmt::{Debug, Display, Formatter};
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;
use core::str::FromStr;
use uuid::Uuid;

/// Marker for tenant identifiers.
pub enum Tenant {}

/// Marker for concentrator identifiers.
pub enum Concentrator {}

/// A [`Uuid`] tagged at compile time with the kind of object it names.
///
/// The tag consumes no space and has no runtime cost; its only job is to keep
/// distinct id kinds from being conflated.
///
/// ```
/// use cnci_id::{Concentrator, Id, Tenant};
///
/// let tenant: Id<Tenant> = Id::new();
/// let cnci: Id<Concentrator> = Id::new();
/// // tenant = cnci; // does not compile, which is the point
/// ```
#[repr(transparent)]
pub struct Id<T: ?Sized>(Uuid, PhantomData<*const T>);

// The marker is never stored or shared; only the Uuid is.
#[allow(unsafe_code)]
unsafe impl<T: ?Sized> Send for Id<T> {}
#[allow(unsafe_code)]
unsafe impl<T: ?Sized> Sync for Id<T> {}

impl<T: ?Sized> Id<T> {
    /// Generate a fresh random (version 4) id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4(), PhantomData)
    }

    /// Tag the provided [`Uuid`].
    ///
    /// Use this only where the surrounding context conclusively determines
    /// what the UUID names (e.g. a field the controller documents as the
    /// tenant id). Do not use it to convert between id kinds.
    #[must_use]
    pub const fn from_raw(uuid: Uuid) -> Self {
        Self(uuid, PhantomData)
    }

    /// Strip the tag and return the wrapped [`Uuid`].
    #[must_use]
    pub const fn into_raw(self) -> Uuid {
        self.0
    }

    /// Borrow the wrapped (untyped) [`Uuid`].
    #[must_use]
    pub const fn as_raw(&self) -> &Uuid {
        &self.0
    }
}

impl<T: ?Sized> Default for Id<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> Copy for Id<T> {}

impl<T: ?Sized> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T: ?Sized> Eq for Id<T> {}

impl<T: ?Sized> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: ?Sized> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl<T: ?Sized> Hash for Id<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl<T: ?Sized> Display for Id<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        Display::fmt(self.0.as_hyphenated(), f)
    }
}

impl<T: ?Sized> Debug for Id<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        Debug::fmt(self.0.as_hyphenated(), f)
    }
}

impl<T: ?Sized> FromStr for Id<T> {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_raw(Uuid::from_str(s)?))
    }
}

impl<T: ?Sized> From<Uuid> for Id<T> {
    fn from(value: Uuid) -> Self {
        Self::from_raw(value)
    }
}

impl<T: ?Sized> From<Id<T>> for Uuid {
    fn from(value: Id<T>) -> Self {
        value.into_raw()
    }
}

impl<T: ?Sized> serde::Serialize for Id<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de, T: ?Sized> serde::Deserialize<'de> for Id<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self::from_raw(Uuid::deserialize(deserializer)?))
    }
}

#[cfg(any(test, feature = "bolero"))]
mod contract {
    use crate::Id;
    use bolero::{Driver, TypeGenerator};

    impl<T: 'static + ?Sized> TypeGenerator for Id<T> {
        fn generate<D: Driver>(driver: &mut D) -> Option<Self> {
            let bytes = driver.produce::<[u8; 16]>()?;
            Some(Id::from_raw(
                uuid::Builder::from_random_bytes(bytes).into_uuid(),
            ))
        }
    }
}
