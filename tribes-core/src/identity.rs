// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ed25519 identities of feeds.
//!
//! Every append-only log ("feed") is identified by the public half of an Ed25519 key pair. A peer
//! usually runs several feeds (one root identity plus purpose-specific sub-feeds), the mapping
//! between them is managed outside of this crate.
use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH, SigningKey, VerifyingKey};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::serde::{deserialize_fixed, serialize_hex};

/// Public key identifying a feed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedId([u8; PUBLIC_KEY_LENGTH]);

impl FeedId {
    /// Parse and validate the bytes of an Ed25519 public key.
    pub fn from_bytes(bytes: &[u8; PUBLIC_KEY_LENGTH]) -> Result<Self, IdentityError> {
        VerifyingKey::from_bytes(bytes).map_err(|_| IdentityError::InvalidPublicKey)?;
        Ok(Self(*bytes))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<VerifyingKey> for FeedId {
    fn from(value: VerifyingKey) -> Self {
        Self(value.to_bytes())
    }
}

impl FromStr for FeedId {
    type Err = IdentityError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(value)?;
        let len = bytes.len();
        let bytes: [u8; PUBLIC_KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidLength(len, PUBLIC_KEY_LENGTH))?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        f.debug_tuple("FeedId").field(&&hex[..8]).finish()
    }
}

impl Serialize for FeedId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serialize_hex(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for FeedId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = deserialize_fixed::<D, PUBLIC_KEY_LENGTH>(deserializer, "feed id")?;
        FeedId::from_bytes(&bytes).map_err(|err| serde::de::Error::custom(err.to_string()))
    }
}

/// Private Ed25519 key of a feed.
#[derive(Clone)]
pub struct PrivateKey(SigningKey);

impl PrivateKey {
    /// Generates a new private key seeded by the thread-local CSPRNG.
    pub fn new() -> Self {
        let bytes: [u8; SECRET_KEY_LENGTH] = rand::rng().random();
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self(SigningKey::from_bytes(bytes))
    }

    pub fn feed_id(&self) -> FeedId {
        self.0.verifying_key().into()
    }
}

impl Default for PrivateKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PrivateKey").field(&"***").finish()
    }
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("invalid public key length {0} bytes, expected {1} bytes")]
    InvalidLength(usize, usize),

    #[error("bytes do not represent a valid ed25519 public key")]
    InvalidPublicKey,

    #[error("invalid hex encoding in feed id string")]
    InvalidHexEncoding(#[from] hex::FromHexError),
}
