// SPDX-License-Identifier: MIT OR Apache-2.0

//! Registry of the tangles we append to, to know their tips without re-reading the store.
use std::collections::HashMap;

use tracing::trace;
use tribes_core::{GroupId, MessageId, TangleGraph, TangleNode};

use crate::message::{GroupMessage, TangleName};

/// Tangle node carrying no payload, only the links matter for computing tips.
pub type LinkNode = TangleNode<MessageId, ()>;

/// Build the node of a message in the given tangle, `None` if it is not part of it.
pub fn link_node(message: &GroupMessage, name: TangleName) -> Option<(MessageId, LinkNode)> {
    let root = message.tangle_root(name)?;
    let previous = message.tangle_previous(name)?;
    Some((root, TangleNode::new(message.id, previous, ())))
}

/// Cached tangles per group, keyed by tangle name and root.
///
/// The root epoch's members tangle and the epoch tangle share the same root, the name tells them
/// apart.
///
/// Tangles are created lazily on first access and kept until the group gets evicted.
#[derive(Debug, Default)]
pub struct TangleCache {
    groups: HashMap<GroupId, HashMap<(TangleName, MessageId), TangleGraph<MessageId, ()>>>,
}

impl TangleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, group_id: &GroupId, name: TangleName, root: MessageId) -> bool {
        self.groups
            .get(group_id)
            .is_some_and(|tangles| tangles.contains_key(&(name, root)))
    }

    /// Tips of a cached tangle.
    pub fn tips(
        &self,
        group_id: &GroupId,
        name: TangleName,
        root: MessageId,
    ) -> Option<Vec<MessageId>> {
        let tangle = self.groups.get(group_id)?.get(&(name, root))?;
        Some(tangle.tips().iter().copied().collect())
    }

    /// Create the tangle if it is not cached yet and add the given nodes to it.
    pub fn load(
        &mut self,
        group_id: GroupId,
        name: TangleName,
        root: MessageId,
        nodes: impl IntoIterator<Item = LinkNode>,
    ) -> Vec<MessageId> {
        let tangle = self
            .groups
            .entry(group_id)
            .or_default()
            .entry((name, root))
            .or_default();
        let added = tangle.add_nodes(nodes);
        trace!(%group_id, %root, ?name, added, "load tangle into cache");
        tangle.tips().iter().copied().collect()
    }

    /// Add a node to a tangle, only if that tangle is already cached.
    ///
    /// Returns `true` if the node was new.
    pub fn insert(
        &mut self,
        group_id: &GroupId,
        name: TangleName,
        root: MessageId,
        node: LinkNode,
    ) -> bool {
        let Some(tangle) = self
            .groups
            .get_mut(group_id)
            .and_then(|tangles| tangles.get_mut(&(name, root)))
        else {
            return false;
        };
        tangle.add_nodes([node]) > 0
    }

    /// Add a message to every cached tangle of the group it is part of.
    pub fn insert_message(&mut self, group_id: &GroupId, message: &GroupMessage) {
        for name in [TangleName::Epoch, TangleName::Members] {
            if let Some((root, node)) = link_node(message, name) {
                self.insert(group_id, name, root, node);
            }
        }
    }

    /// Drop all tangles of a group.
    pub fn evict(&mut self, group_id: &GroupId) -> bool {
        self.groups.remove(group_id).is_some()
    }

    pub fn clear(&mut self) {
        self.groups.clear();
    }

    /// Number of groups with cached tangles.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use tribes_core::{GroupId, GroupSecret, Hash};

    use super::{TangleCache, link_node};
    use crate::message::TangleName;
    use crate::test_utils::messages::{add_member, feed, init};

    #[test]
    fn lazily_created_and_evicted() {
        let alice = feed(1);
        let root = init(alice, [1; 32]);
        let group_id = GroupId::cloak(&root.id, &GroupSecret::from_bytes([1; 32]));
        let add = add_member(alice, &root, [1; 32], root.id, &[root.id], &[alice]);

        let mut cache = TangleCache::new();
        assert!(cache.tips(&group_id, TangleName::Members, root.id).is_none());

        // Nothing happens for tangles which are not cached.
        cache.insert_message(&group_id, &add);
        assert!(!cache.contains(&group_id, TangleName::Members, root.id));

        let nodes = [&root].into_iter().filter_map(|message| link_node(message, TangleName::Members));
        let tips = cache.load(
            group_id,
            TangleName::Members,
            root.id,
            nodes.map(|(_, node)| node),
        );
        assert_eq!(tips, vec![root.id]);

        cache.insert_message(&group_id, &add);
        assert_eq!(
            cache.tips(&group_id, TangleName::Members, root.id),
            Some(vec![add.id])
        );
        // The epoch tangle shares the root but is cached separately.
        assert!(cache.tips(&group_id, TangleName::Epoch, root.id).is_none());
        assert_eq!(cache.len(), 1);

        assert!(cache.evict(&group_id));
        assert!(cache.is_empty());
        assert!(!cache.evict(&group_id));
        assert!(
            cache
                .tips(&group_id, TangleName::Members, Hash::new("other"))
                .is_none()
        );
    }
}
