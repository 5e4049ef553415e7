// SPDX-License-Identifier: Apache-2.0
// Copyright Cloud Concentrator Authors

//! Types for naming and indexing kernel network interfaces.

use core::fmt::{Debug, Display, Formatter};
use core::num::NonZero;
use serde::{Deserialize, Serialize};

/// A kernel interface index (ifindex).
///
/// Assigned by the kernel; never zero; meaningless across reboots or between
/// hosts. The concentrator treats it as an opaque handle to a live device.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct InterfaceIndex(NonZero<u32>);

impl InterfaceIndex {
    /// Wrap an already non-zero index.
    #[must_use]
    pub const fn new(raw: NonZero<u32>) -> Self {
        Self(raw)
    }

    /// Validate a raw `u32` as an interface index.
    ///
    /// # Errors
    ///
    /// Returns [`InterfaceIndexError::Zero`] for zero, which the kernel never
    /// assigns.
    pub fn try_new(raw: u32) -> Result<Self, InterfaceIndexError> {
        raw.try_into()
    }

    /// The index as a plain `u32`.
    #[must_use]
    pub const fn to_u32(self) -> u32 {
        self.0.get()
    }
}

impl Debug for InterfaceIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl Display for InterfaceIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum InterfaceIndexError {
    /// The kernel never assigns index zero.
    #[error("interface index must not be zero")]
    Zero,
}

impl TryFrom<u32> for InterfaceIndex {
    type Error = InterfaceIndexError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        NonZero::new(value)
            .map(InterfaceIndex::new)
            .ok_or(InterfaceIndexError::Zero)
    }
}

impl From<InterfaceIndex> for u32 {
    fn from(value: InterfaceIndex) -> Self {
        value.to_u32()
    }
}

/// A string validated to be a legal linux interface name.
///
/// At most 15 bytes of alphanumeric ASCII plus `.`, `-` and `_`; never empty,
/// never `.` or `..`, no interior NUL (the kernel appends the terminator).
#[repr(transparent)]
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InterfaceName(String);

impl InterfaceName {
    /// Maximum length in bytes, excluding the kernel's trailing NUL.
    pub const MAX_LEN: usize = 15;
}

/// Reasons a string cannot serve as a kernel interface name.
#[derive(Clone, Debug, Eq, PartialEq, Hash, thiserror::Error)]
pub enum IllegalInterfaceName {
    #[error("interface name must not be empty")]
    Empty,
    #[error("interface name must not be . or ..")]
    Dots,
    #[error("interface name {0} exceeds {max} bytes", max = InterfaceName::MAX_LEN)]
    TooLong(String),
    #[error("interface name {0} contains a NUL byte")]
    InteriorNul(String),
    #[error("interface name {0} contains characters outside alphanumeric ASCII and .-_")]
    IllegalCharacters(String),
}

impl TryFrom<String> for InterfaceName {
    type Error = IllegalInterfaceName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Err(IllegalInterfaceName::Empty);
        }
        if value == "." || value == ".." {
            return Err(IllegalInterfaceName::Dots);
        }
        if value.contains('\0') {
            return Err(IllegalInterfaceName::InteriorNul(value));
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        {
            return Err(IllegalInterfaceName::IllegalCharacters(value));
        }
        if value.len() > Self::MAX_LEN {
            return Err(IllegalInterfaceName::TooLong(value));
        }
        Ok(Self(value))
    }
}

impl TryFrom<&str> for InterfaceName {
    type Error = IllegalInterfaceName;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_string())
    }
}

impl core::str::FromStr for InterfaceName {
    type Err = IllegalInterfaceName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s)
    }
}

impl From<InterfaceName> for String {
    fn from(value: InterfaceName) -> Self {
        value.0
    }
}

impl AsRef<str> for InterfaceName {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for InterfaceName {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(any(test, feature = "bolero"))]
mod contract {
    use crate::interface::{InterfaceIndex, InterfaceName};
    use bolero::{Driver, TypeGenerator};

    impl TypeGenerator for InterfaceIndex {
        fn generate<D: Driver>(driver: &mut D) -> Option<Self> {
            Some(Self(driver.produce()?))
        }
    }

    impl TypeGenerator for InterfaceName {
        fn generate<D: Driver>(driver: &mut D) -> Option<Self> {
            const ALPHABET: &[u8] =
                b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789._-";
            let len = 1 + (driver.produce::<u8>()? as usize) % InterfaceName::MAX_LEN;
            let mut name = String::with_capacity(len + 1);
            for _ in 0..len {
                let pick = (driver.produce::<u8>()? as usize) % ALPHABET.len();
                name.push(char::from(ALPHABET[pick]));
            }
            if name == "." || name == ".." {
                name.push('_');
            }
            #[allow(clippy::unwrap_used)] // generated from the legal alphabet
            Some(InterfaceName::try_from(name).unwrap())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn index_zero_rejected() {
        assert_eq!(
            InterfaceIndex::try_new(0).unwrap_err(),
            InterfaceIndexError::Zero
        );
    }

    #[test]
    fn index_round_trips() {
        bolero::check!().with_type().for_each(|idx: &InterfaceIndex| {
            assert_eq!(*idx, InterfaceIndex::try_new(idx.to_u32()).unwrap());
        });
    }

    #[test]
    fn generated_names_validate() {
        bolero::check!()
            .with_type()
            .cloned()
            .for_each(|name: InterfaceName| {
                InterfaceName::try_from(name.0).unwrap();
            });
    }

    #[test]
    fn slash_rejected() {
        bolero::check!().with_type().for_each(|name: &InterfaceName| {
            let mut bad = name.0.clone();
            bad.push('/');
            assert!(matches!(
                InterfaceName::try_from(bad.as_str()),
                Err(IllegalInterfaceName::IllegalCharacters(_))
            ));
        });
    }

    #[test]
    fn nul_rejected() {
        assert!(matches!(
            InterfaceName::try_from("eth\0"),
            Err(IllegalInterfaceName::InteriorNul(_))
        ));
    }

    #[test]
    fn empty_and_dots_rejected() {
        assert_eq!(
            InterfaceName::try_from("").unwrap_err(),
            IllegalInterfaceName::Empty
        );
        assert_eq!(
            InterfaceName::try_from(".").unwrap_err(),
            IllegalInterfaceName::Dots
        );
        assert_eq!(
            InterfaceName::try_from("..").unwrap_err(),
            IllegalInterfaceName::Dots
        );
    }

    #[test]
    fn overlong_rejected() {
        assert!(matches!(
            InterfaceName::try_from("abcdefghijklmnop"),
            Err(IllegalInterfaceName::TooLong(_))
        ));
    }
}
