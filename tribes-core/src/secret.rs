// SPDX-License-Identifier: MIT OR Apache-2.0

#[cfg(not(test))]
use std::fmt;

use rand::{CryptoRng, Rng};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::ZeroizeOnDrop;

use crate::serde::{deserialize_fixed, serialize_hex};

/// Size of symmetric group secrets.
pub const GROUP_SECRET_LEN: usize = 32;

/// Symmetric key of one group epoch.
///
/// Zeroised on drop, hidden in debug output outside of tests and compared in constant time.
/// Equality is always by value: two epochs carrying the same bytes carry the same key.
#[derive(Clone, Eq, ZeroizeOnDrop)]
#[cfg_attr(test, derive(Debug))]
pub struct GroupSecret([u8; GROUP_SECRET_LEN]);

impl GroupSecret {
    pub fn from_bytes(bytes: [u8; GROUP_SECRET_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh secret from the given random source.
    pub fn generate<R: Rng + CryptoRng>(rng: &mut R) -> Self {
        Self(rng.random())
    }

    pub fn as_bytes(&self) -> &[u8; GROUP_SECRET_LEN] {
        &self.0
    }

    /// Lowercase hex representation.
    ///
    /// Concurrent epochs with equal membership are ordered by this string, all peers need to
    /// arrive at the same order.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl PartialEq for GroupSecret {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.0.ct_eq(&other.0))
    }
}

#[cfg(not(test))]
impl fmt::Debug for GroupSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GroupSecret").field(&"***").finish()
    }
}

impl Serialize for GroupSecret {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serialize_hex(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for GroupSecret {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = deserialize_fixed::<D, GROUP_SECRET_LEN>(deserializer, "group secret")?;
        Ok(Self(bytes))
    }
}
