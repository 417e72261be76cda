// SPDX-License-Identifier: MIT OR Apache-2.0

//! Epoch tangle of a group.
//!
//! Every epoch is started by a `group/init` (the root epoch) or `group/init-epoch` message and
//! carries its own key and members tangle. Epoch messages point at the epochs they follow, two
//! epochs created concurrently form a fork in this graph.
use std::collections::{BTreeSet, HashMap};

use tracing::{debug, warn};
use tribes_core::{FeedId, GroupSecret, MessageId, TangleGraph, TangleNode};

use crate::membership::{Members, MembershipAccumulator, is_members_event};
use crate::message::{GroupContent, GroupMessage, MessageError, TangleName};

/// An epoch with its key and resolved membership.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Epoch {
    /// Id of the message which started this epoch.
    pub id: MessageId,

    /// Epochs this one follows, empty for the root epoch.
    pub previous: Vec<MessageId>,

    /// Root identity of the author.
    pub author: FeedId,

    pub secret: GroupSecret,

    pub members: Members,
}

#[derive(Clone, Debug)]
struct EpochNode {
    author: FeedId,
    secret: GroupSecret,
}

/// Epochs of one group and the membership of each of them.
#[derive(Clone, Debug)]
pub struct EpochGraph {
    group_root: MessageId,
    tangle: TangleGraph<MessageId, EpochNode>,
    accumulators: HashMap<MessageId, MembershipAccumulator>,
}

impl EpochGraph {
    pub fn new(group_root: MessageId) -> Self {
        Self {
            group_root,
            tangle: TangleGraph::new(),
            accumulators: HashMap::new(),
        }
    }

    /// Id of the `group/init` message.
    pub fn root(&self) -> MessageId {
        self.group_root
    }

    /// Add a `group/init` or `group/init-epoch` message.
    ///
    /// `author` is the resolved root identity of the publishing feed. Epochs we've created
    /// ourselves take their secret from the message content, epochs learned from others from the
    /// key the message was decrypted with.
    pub fn insert_epoch(
        &mut self,
        message: &GroupMessage,
        author: FeedId,
        local_root: &FeedId,
    ) -> Result<bool, MessageError> {
        message.content.validate()?;

        let (group_key, previous) = match &message.content {
            GroupContent::Init(content) => {
                if message.id != self.group_root {
                    return Err(MessageError::ForeignRoot(message.id, self.group_root));
                }
                (&content.group_key, Vec::new())
            }
            GroupContent::InitEpoch(content) => {
                if content.tangles.epoch.root != Some(self.group_root) {
                    return Err(MessageError::ForeignRoot(message.id, self.group_root));
                }
                let previous = content.tangles.epoch.previous.clone().unwrap_or_default();
                (&content.group_key, previous)
            }
            _ => {
                return Err(MessageError::UnexpectedType {
                    expected: "group/init or group/init-epoch",
                    actual: message.content.content_type(),
                });
            }
        };

        let secret = if &author == local_root {
            group_key.clone()
        } else {
            message
                .read_key
                .clone()
                .ok_or(MessageError::MissingReadKey(message.id))?
        };

        let node = TangleNode::new(message.id, previous, EpochNode { author, secret });
        if !self.tangle.add_node(node)? {
            return Ok(false);
        }

        self.accumulators
            .entry(message.id)
            .or_insert_with(|| MembershipAccumulator::new(message.id))
            .add_message(message)?;

        debug!(group_root = %self.group_root, epoch = %message.id, "insert epoch");
        Ok(true)
    }

    /// Add an add-member or exclude-member message to the members tangle of its epoch.
    ///
    /// Returns `true` if the membership of that epoch grew.
    pub fn insert_members(&mut self, message: &GroupMessage) -> Result<bool, MessageError> {
        if !is_members_event(message) {
            return Err(MessageError::UnexpectedType {
                expected: "group/add-member or group/exclude-member",
                actual: message.content.content_type(),
            });
        }

        // Only the root is checked here, validation happens in the accumulator.
        let Some(epoch_id) = message
            .content
            .tangle(TangleName::Members)
            .and_then(|links| links.root)
        else {
            return Err(MessageError::InvalidTangle(
                message.content.content_type(),
                "members tangle needs root and previous",
            ));
        };

        self.accumulators
            .entry(epoch_id)
            .or_insert_with(|| MembershipAccumulator::new(epoch_id))
            .add_message(message)
    }

    /// Add any group message, logging and skipping invalid ones.
    ///
    /// Returns `true` if the message changed epochs or their membership.
    pub fn insert(&mut self, message: &GroupMessage, author: FeedId, local_root: &FeedId) -> bool {
        let result = if is_members_event(message) {
            self.insert_members(message)
        } else {
            self.insert_epoch(message, author, local_root)
        };

        match result {
            Ok(changed) => changed,
            Err(err) => {
                warn!(
                    group_root = %self.group_root,
                    id = %message.id,
                    "skip invalid group message: {err}"
                );
                false
            }
        }
    }

    fn to_epoch(&self, id: &MessageId) -> Option<Epoch> {
        let node = self.tangle.get(id)?;
        let members = self
            .accumulators
            .get(id)
            .map(|accumulator| accumulator.members().clone())
            .unwrap_or_default();

        Some(Epoch {
            id: node.id,
            previous: node.previous.clone(),
            author: node.payload.author,
            secret: node.payload.secret.clone(),
            members,
        })
    }

    pub fn epoch(&self, id: &MessageId) -> Option<Epoch> {
        self.to_epoch(id)
    }

    /// All connected epochs in causal order.
    pub fn epochs(&self) -> Vec<Epoch> {
        self.tangle
            .nodes()
            .into_iter()
            .filter_map(|node| self.to_epoch(&node.id))
            .collect()
    }

    pub fn tip_ids(&self) -> Vec<MessageId> {
        self.tangle.tips().iter().copied().collect()
    }

    /// Epochs no other epoch follows yet.
    pub fn tip_epochs(&self) -> Vec<Epoch> {
        self.tangle
            .tips()
            .iter()
            .filter_map(|id| self.to_epoch(id))
            .collect()
    }

    /// Ancestors of an epoch in causal order, without epochs from concurrent branches.
    pub fn predecessor_epochs(&self, id: &MessageId) -> Vec<Epoch> {
        let Some(history) = self.tangle.history(id) else {
            return Vec::new();
        };

        self.tangle
            .nodes()
            .into_iter()
            .filter(|node| history.contains(&node.id))
            .filter_map(|node| self.to_epoch(&node.id))
            .collect()
    }

    /// Tips of the members tangle of an epoch.
    pub fn members_tips(&self, id: &MessageId) -> Vec<MessageId> {
        self.accumulators
            .get(id)
            .map(MembershipAccumulator::tips)
            .unwrap_or_default()
    }

    /// Everybody about to be excluded in any ancestor of the epoch, the epoch itself included.
    pub fn excluded_in_ancestry(&self, id: &MessageId) -> BTreeSet<FeedId> {
        let mut excluded = BTreeSet::new();
        for epoch in self.predecessor_epochs(id).into_iter().chain(self.to_epoch(id)) {
            excluded.extend(epoch.members.to_exclude);
        }
        excluded
    }

    /// Returns `true` if the feed has been excluded by the given epoch or one of its ancestors
    /// and was not added back.
    pub fn is_excluded(&self, id: &MessageId, feed_id: &FeedId) -> bool {
        let Some(epoch) = self.to_epoch(id) else {
            return false;
        };

        if epoch.members.to_exclude.contains(feed_id) {
            return true;
        }

        !epoch.members.added.contains(feed_id)
            && self
                .predecessor_epochs(id)
                .iter()
                .any(|ancestor| ancestor.members.to_exclude.contains(feed_id))
    }

    /// Number of connected epochs.
    pub fn len(&self) -> usize {
        self.tangle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tangle.is_empty()
    }
}
