// SPDX-License-Identifier: MIT OR Apache-2.0

//! Detection of members an epoch should carry over but doesn't.
//!
//! When an exclusion forks a new epoch, everybody else should be added to it again. Concurrent
//! additions in another branch, or an author going offline halfway, can leave members behind.
use std::collections::BTreeSet;

use tribes_core::{FeedId, GroupSecret, MessageId};

use crate::epoch::{Epoch, EpochGraph};

/// Members missing in one epoch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MissingMembers {
    pub epoch: MessageId,
    pub secret: GroupSecret,
    pub missing: BTreeSet<FeedId>,
}

/// Members which should be present in the epoch.
///
/// That is everybody added anywhere in its ancestry or the epoch itself, minus everybody an
/// ancestor was about to exclude. Exclusions announced in the epoch itself take effect in the
/// next one.
pub fn should_be_present(graph: &EpochGraph, epoch: &Epoch) -> BTreeSet<FeedId> {
    let ancestors = graph.predecessor_epochs(&epoch.id);

    let mut added: BTreeSet<FeedId> = epoch.members.added.clone();
    let mut excluded = BTreeSet::new();
    for ancestor in ancestors {
        added.extend(ancestor.members.added);
        excluded.extend(ancestor.members.to_exclude);
    }

    added.difference(&excluded).copied().collect()
}

/// Find every epoch which lacks members it should have, epochs with nothing missing are omitted.
pub fn find_missing_members(graph: &EpochGraph) -> Vec<MissingMembers> {
    graph
        .epochs()
        .into_iter()
        .filter_map(|epoch| {
            let missing: BTreeSet<FeedId> = should_be_present(graph, &epoch)
                .difference(&epoch.members.added)
                .copied()
                .collect();

            if missing.is_empty() {
                None
            } else {
                Some(MissingMembers {
                    epoch: epoch.id,
                    secret: epoch.secret,
                    missing,
                })
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::{find_missing_members, should_be_present};
    use crate::epoch::EpochGraph;
    use crate::test_utils::messages::{add_member, exclude_member, feed, init, init_epoch};

    #[test]
    fn nothing_missing_after_clean_exclusion() {
        let (alice, bob, carol) = (feed(1), feed(2), feed(3));

        let root = init(alice, [1; 32]);
        let add = add_member(alice, &root, [1; 32], root.id, &[root.id], &[alice, bob, carol]);
        let exclude = exclude_member(alice, &root, [1; 32], root.id, &[add.id], &[carol]);
        let epoch = init_epoch(alice, [2; 32], root.id, &[root.id]);
        let re_add = add_member(alice, &root, [2; 32], epoch.id, &[epoch.id], &[alice, bob]);

        let mut graph = EpochGraph::new(root.id);
        for message in [&root, &add, &exclude, &epoch, &re_add] {
            graph.insert(message, alice, &alice);
        }

        let new_epoch = graph.epoch(&epoch.id).unwrap();
        assert_eq!(
            should_be_present(&graph, &new_epoch),
            BTreeSet::from([alice, bob])
        );
        assert!(find_missing_members(&graph).is_empty());
    }

    #[test]
    fn member_added_concurrently_is_missing() {
        let (alice, bob, carol, dave) = (feed(1), feed(2), feed(3), feed(4));

        let root = init(alice, [1; 32]);
        let add = add_member(alice, &root, [1; 32], root.id, &[root.id], &[alice, bob, carol]);
        let exclude = exclude_member(alice, &root, [1; 32], root.id, &[add.id], &[carol]);
        // Bob adds Dave to the root epoch while Alice is forking the new one.
        let add_dave = add_member(bob, &root, [1; 32], root.id, &[add.id], &[dave]);
        let epoch = init_epoch(alice, [2; 32], root.id, &[root.id]);
        let re_add = add_member(alice, &root, [2; 32], epoch.id, &[epoch.id], &[alice, bob]);

        let mut graph = EpochGraph::new(root.id);
        for message in [&root, &add, &exclude, &add_dave, &epoch, &re_add] {
            graph.insert(message, alice, &alice);
        }

        let missing = find_missing_members(&graph);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].epoch, epoch.id);
        assert_eq!(missing[0].missing, BTreeSet::from([dave]));
        assert_eq!(missing[0].secret.as_bytes(), &[2; 32]);
    }

    #[test]
    fn empty_epoch_misses_everybody() {
        let (alice, bob) = (feed(1), feed(2));

        let root = init(alice, [1; 32]);
        let add = add_member(alice, &root, [1; 32], root.id, &[root.id], &[alice, bob]);
        let epoch = init_epoch(alice, [2; 32], root.id, &[root.id]);

        let mut graph = EpochGraph::new(root.id);
        for message in [&root, &add, &epoch] {
            graph.insert(message, alice, &alice);
        }

        let missing = find_missing_members(&graph);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].missing, BTreeSet::from([alice, bob]));
    }
}
