// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core data-types for private groups living on append-only logs.
//!
//! Messages published to a group are linked to each other by explicit `previous` pointers,
//! forming "tangles": directed acyclic graphs which give us causal ordering without any global
//! sequence number. [`TangleGraph`] assembles such a graph from messages arriving in any order and
//! computes its current frontier (the "tips").
//!
//! Next to that this crate offers the identifiers and key material every other layer speaks:
//! BLAKE3 [`Hash`]es identifying messages, Ed25519 [`FeedId`]s identifying feeds, 32-byte
//! [`GroupSecret`]s and the cloaked [`GroupId`] derived from them.
pub mod cbor;
pub mod group_id;
pub mod hash;
pub mod identity;
pub mod secret;
mod serde;
pub mod tangle;

pub use group_id::GroupId;
pub use hash::{Hash, HashError};
pub use identity::{FeedId, IdentityError, PrivateKey};
pub use secret::{GROUP_SECRET_LEN, GroupSecret};
pub use tangle::{NodeId, TangleError, TangleGraph, TangleNode};

/// Identifier of a message in the append-only log store.
pub type MessageId = Hash;
