// SPDX-License-Identifier: MIT OR Apache-2.0

//! Membership and key epochs of private groups, resolved without any coordination.
//!
//! A private group lives on the append-only logs of its members. Its administrative history is
//! a tangle of "epochs": every epoch carries its own symmetric key and its own members tangle of
//! add and exclude events. Excluding somebody forks a new epoch with a fresh key, which is only
//! handed out to the remaining members.
//!
//! Members may exclude others concurrently while being partitioned from each other, so the epoch
//! tangle can fork. Every peer resolves such forks locally and deterministically: given the same
//! set of replicated messages, in whatever order they arrived, all peers pick the same preferred
//! epoch and with that the same key to encrypt new messages to. Forks which can't be resolved by
//! comparing memberships are reconciled lazily, by a randomly delayed exclusion which creates a
//! new common epoch.
//!
//! The message store, key registry and identity management are external collaborators, see the
//! [`traits`] module for the interfaces this crate expects from them.
pub mod cache;
pub mod config;
pub mod epoch;
pub mod error;
pub mod manager;
pub mod membership;
pub mod message;
pub mod missing;
pub mod preferred;
pub mod publish;
pub mod reconcile;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
#[cfg(test)]
mod tests;
pub mod traits;

pub use config::Config;
pub use epoch::{Epoch, EpochGraph};
pub use error::{GroupsError, Stage};
pub use manager::{Groups, ManagerError};
pub use membership::{Members, MembershipAccumulator};
pub use message::{ContentType, GroupContent, GroupMessage, MessageError};
pub use missing::MissingMembers;
pub use preferred::{SelectError, Selection};
pub use reconcile::{Fork, ReconcileScheduler};
