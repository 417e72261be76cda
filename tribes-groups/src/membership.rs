// SPDX-License-Identifier: MIT OR Apache-2.0

//! Membership of a single epoch, accumulated from its members tangle.
use std::collections::BTreeSet;
use std::future;

use futures_util::{Stream, StreamExt};
use tracing::warn;
use tribes_core::{FeedId, MessageId, TangleGraph, TangleNode};

use crate::message::{ContentType, GroupContent, GroupMessage, MessageError, TangleName};

/// Members of an epoch.
///
/// Both sets only ever grow. Somebody listed in `to_exclude` is still in `added`, their
/// exclusion takes effect in the next epoch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Members {
    pub added: BTreeSet<FeedId>,
    pub to_exclude: BTreeSet<FeedId>,
}

impl Members {
    /// Members which have been added and are not about to be excluded.
    pub fn current(&self) -> BTreeSet<FeedId> {
        self.added.difference(&self.to_exclude).copied().collect()
    }

    fn size(&self) -> (usize, usize) {
        (self.added.len(), self.to_exclude.len())
    }
}

/// Membership change carried by one node of the members tangle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MembershipEvent {
    pub added: Vec<FeedId>,
    pub excluded: Vec<FeedId>,
}

/// Folds the add and exclude events of one epoch into its [`Members`].
///
/// Only events connected to the epoch message through their `previous` links count, events
/// arriving ahead of their ancestors are held back.
#[derive(Clone, Debug)]
pub struct MembershipAccumulator {
    epoch_id: MessageId,
    tangle: TangleGraph<MessageId, MembershipEvent>,
    members: Members,
}

impl MembershipAccumulator {
    pub fn new(epoch_id: MessageId) -> Self {
        Self {
            epoch_id,
            tangle: TangleGraph::new(),
            members: Members::default(),
        }
    }

    pub fn epoch_id(&self) -> MessageId {
        self.epoch_id
    }

    /// Add a message of this epoch's members tangle.
    ///
    /// Returns `true` if `added` or `to_exclude` grew by it. Re-adding known messages is a no-op.
    pub fn add_message(&mut self, message: &GroupMessage) -> Result<bool, MessageError> {
        if message.tangle_root(TangleName::Members) != Some(self.epoch_id) {
            return Err(MessageError::ForeignRoot(message.id, self.epoch_id));
        }

        message.content.validate()?;

        let event = match &message.content {
            GroupContent::Init(_) | GroupContent::InitEpoch(_) => MembershipEvent::default(),
            GroupContent::AddMember(_) => MembershipEvent {
                added: message.added().into_iter().flatten().collect(),
                excluded: Vec::new(),
            },
            GroupContent::ExcludeMember(content) => MembershipEvent {
                added: Vec::new(),
                excluded: content.excludes.clone(),
            },
        };

        let previous = message
            .tangle_previous(TangleName::Members)
            .unwrap_or_default();

        if !self
            .tangle
            .add_node(TangleNode::new(message.id, previous, event))?
        {
            return Ok(false);
        }

        let before = self.members.size();
        self.recompute();
        Ok(self.members.size() != before)
    }

    /// Add many messages, skipping invalid ones. Returns `true` if membership grew.
    pub fn add_messages<'a>(&mut self, messages: impl IntoIterator<Item = &'a GroupMessage>) -> bool {
        let mut grew = false;
        for message in messages {
            match self.add_message(message) {
                Ok(changed) => grew |= changed,
                Err(err) => warn!(
                    epoch = %self.epoch_id,
                    id = %message.id,
                    "skip invalid members message: {err}"
                ),
            }
        }
        grew
    }

    // Pending events are only part of the tangle and the sets once connected, after a new node
    // got connected we fold over everything again.
    fn recompute(&mut self) {
        let mut members = Members::default();
        for node in self.tangle.nodes() {
            members.added.extend(node.payload.added.iter().copied());
            members.to_exclude.extend(node.payload.excluded.iter().copied());
        }
        self.members = members;
    }

    pub fn members(&self) -> &Members {
        &self.members
    }

    /// Current tips of the members tangle, `previous` of the next add or exclude message.
    pub fn tips(&self) -> Vec<MessageId> {
        self.tangle.tips().iter().copied().collect()
    }

    /// Turn a live stream of members tangle messages into a stream of membership snapshots.
    ///
    /// A snapshot is only emitted when one of the sets actually grew.
    pub fn live(
        self,
        messages: impl Stream<Item = GroupMessage>,
    ) -> impl Stream<Item = Members> {
        messages
            .scan(self, |accumulator, message| {
                let grew = match accumulator.add_message(&message) {
                    Ok(grew) => grew,
                    Err(err) => {
                        warn!(id = %message.id, "skip invalid members message: {err}");
                        false
                    }
                };
                future::ready(Some(grew.then(|| accumulator.members().clone())))
            })
            .filter_map(future::ready)
    }
}

/// Returns `true` if the message takes part in a members tangle.
pub(crate) fn is_members_event(message: &GroupMessage) -> bool {
    matches!(
        message.content.content_type(),
        ContentType::AddMember | ContentType::ExcludeMember
    )
}
