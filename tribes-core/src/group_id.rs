// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::hash::{Hash, HashError};
use crate::secret::GroupSecret;

/// Public identifier of a private group.
///
/// The id is "cloaked": it is a keyed hash of the group's root message id under the secret of the
/// root epoch. Only peers who were given that secret can link the id to the root message.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(Hash);

impl GroupId {
    pub fn cloak(root: &Hash, root_secret: &GroupSecret) -> Self {
        Self(Hash::keyed(root_secret.as_bytes(), root.as_bytes()))
    }

    pub fn as_hash(&self) -> &Hash {
        &self.0
    }
}

impl From<Hash> for GroupId {
    fn from(value: Hash) -> Self {
        Self(value)
    }
}

impl FromStr for GroupId {
    type Err = HashError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(Self(value.parse()?))
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.0.to_hex();
        f.debug_tuple("GroupId").field(&&hex[..8]).finish()
    }
}
