// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeSet;
use std::time::Duration;

use assert_matches::assert_matches;
use futures_util::StreamExt;
use tribes_core::cbor::encoded_size;
use tribes_core::{FeedId, GroupId, GroupSecret, Hash};

use crate::config::Config;
use crate::error::GroupsError;
use crate::message::GroupContent;
use crate::preferred::Selection;
use crate::publish::publish_with_retry;
use crate::test_utils::messages::feed;
use crate::test_utils::{Directory, MemoryStore, TestIdentity, TestPeer, setup_logging};
use crate::traits::KeyRegistry;

fn members(feed_ids: &[FeedId]) -> BTreeSet<FeedId> {
    feed_ids.iter().copied().collect()
}

async fn write_key(peer: &TestPeer, group_id: &GroupId) -> GroupSecret {
    peer.store
        .group_info(group_id)
        .await
        .unwrap()
        .expect("group is registered")
        .write_key
}

/// Wait until the condition holds, checking every 20ms for up to two seconds.
async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn create_group() {
    setup_logging();

    let directory = Directory::new();
    let alice = TestPeer::new(1, &directory);

    let info = alice.groups.create().await.unwrap();
    assert_eq!(alice.groups.list_groups().await.unwrap(), vec![info.id]);
    assert_eq!(
        alice.groups.list_members(&info.id).await.unwrap(),
        members(&[alice.root()])
    );

    let epochs = alice.groups.epochs(&info.id).await.unwrap();
    assert_eq!(epochs.len(), 1);
    assert_eq!(epochs[0].id, info.root);
    assert_eq!(epochs[0].author, alice.root());
    assert_eq!(info.write_key, epochs[0].secret);
    assert_eq!(info.id, GroupId::cloak(&info.root, &epochs[0].secret));
}

#[tokio::test]
async fn add_member_and_join() {
    setup_logging();

    let directory = Directory::new();
    let alice = TestPeer::new(1, &directory);
    let bob = TestPeer::new(2, &directory);

    let group_id = alice.groups.create().await.unwrap().id;
    let added = alice
        .groups
        .add_members(&group_id, &[bob.root(), bob.root()])
        .await
        .unwrap();
    assert_eq!(added.len(), 1);

    let epochs = alice.groups.epochs(&group_id).await.unwrap();
    assert_eq!(epochs.len(), 1);
    assert_eq!(
        epochs[0].members.added,
        members(&[alice.root(), bob.root()])
    );
    assert!(
        alice
            .groups
            .fix_missing_members(&group_id)
            .await
            .unwrap()
            .is_empty()
    );

    // Bob only knows about the group after receiving the invitation.
    assert_matches!(
        bob.groups.list_members(&group_id).await,
        Err(GroupsError::UnknownGroup(_))
    );

    bob.sync_from(&alice).await.unwrap();
    assert_eq!(bob.groups.list_groups().await.unwrap(), vec![group_id]);
    assert_eq!(
        bob.groups.list_members(&group_id).await.unwrap(),
        members(&[alice.root(), bob.root()])
    );
    assert_eq!(
        bob.groups.preferred_epoch(&group_id).await.unwrap(),
        alice.groups.preferred_epoch(&group_id).await.unwrap()
    );
    assert_eq!(
        write_key(&bob, &group_id).await,
        write_key(&alice, &group_id).await
    );
}

#[tokio::test]
async fn exclusion_rotates_keys() {
    setup_logging();

    let directory = Directory::new();
    let alice = TestPeer::new(1, &directory);
    let bob = TestPeer::new(2, &directory);
    let carol = TestPeer::new(3, &directory);

    let info = alice.groups.create().await.unwrap();
    let group_id = info.id;
    alice
        .groups
        .add_members(&group_id, &[bob.root(), carol.root()])
        .await
        .unwrap();
    bob.sync_from(&alice).await.unwrap();
    carol.sync_from(&alice).await.unwrap();

    assert_matches!(
        alice.groups.exclude_members(&group_id, &[alice.root()]).await,
        Err(GroupsError::ExcludeSelf(_))
    );

    let epoch_id = alice
        .groups
        .exclude_members(&group_id, &[bob.root()])
        .await
        .unwrap();
    let preferred = alice.groups.preferred_epoch(&group_id).await.unwrap();
    assert_eq!(preferred.id, epoch_id);
    assert_eq!(preferred.previous, vec![info.root]);
    assert_eq!(preferred.members.added, members(&[alice.root(), carol.root()]));
    assert_ne!(preferred.secret, info.write_key);
    assert_eq!(write_key(&alice, &group_id).await, preferred.secret);

    // The old epoch keeps the exclusion, it takes effect in the new one.
    let root_epoch = &alice.groups.epochs(&group_id).await.unwrap()[0];
    assert_eq!(root_epoch.members.to_exclude, members(&[bob.root()]));

    carol.sync_from(&alice).await.unwrap();
    assert_eq!(
        carol.groups.preferred_epoch(&group_id).await.unwrap().id,
        epoch_id
    );
    assert_eq!(write_key(&carol, &group_id).await, preferred.secret);
    assert_eq!(
        carol.groups.list_members(&group_id).await.unwrap(),
        members(&[alice.root(), carol.root()])
    );

    // Bob can't read the new epoch and learns about the exclusion from the old one.
    bob.sync_from(&alice).await.unwrap();
    assert!(bob.groups.list_groups().await.unwrap().is_empty());
    assert!(bob.store.group_info(&group_id).await.unwrap().unwrap().excluded);
    assert_matches!(
        bob.groups.add_members(&group_id, &[feed(9)]).await,
        Err(GroupsError::Excluded(_))
    );
    assert_matches!(
        bob.groups.sync_group(&group_id).await,
        Err(GroupsError::Excluded(_))
    );
}

#[tokio::test]
async fn new_member_reads_epoch_history() {
    setup_logging();

    let directory = Directory::new();
    let alice = TestPeer::new(1, &directory);
    let bob = TestPeer::new(2, &directory);
    let dave = TestPeer::new(4, &directory);

    let group_id = alice.groups.create().await.unwrap().id;
    alice
        .groups
        .add_members(&group_id, &[bob.root()])
        .await
        .unwrap();
    let epoch_id = alice
        .groups
        .exclude_members(&group_id, &[bob.root()])
        .await
        .unwrap();
    alice
        .groups
        .add_members(&group_id, &[dave.root()])
        .await
        .unwrap();

    // Dave is only added to the latest epoch but receives the secrets of the ones before.
    dave.sync_from(&alice).await.unwrap();
    let epochs = dave.groups.epochs(&group_id).await.unwrap();
    assert_eq!(epochs.len(), 2);
    assert_eq!(epochs[1].id, epoch_id);
    assert_eq!(
        dave.groups.list_members(&group_id).await.unwrap(),
        members(&[alice.root(), dave.root()])
    );
    assert_eq!(
        write_key(&dave, &group_id).await,
        write_key(&alice, &group_id).await
    );
}

#[tokio::test]
async fn concurrent_exclusions_get_reconciled() {
    setup_logging();

    let directory = Directory::new();
    let slow = Config::default()
        .with_reconcile_delay(Duration::from_secs(3600), Duration::from_secs(3600));
    let fast = Config::default()
        .with_reconcile_delay(Duration::from_millis(50), Duration::from_millis(100));

    let alice = TestPeer::new_with_config(1, &directory, slow);
    let bob = TestPeer::new(2, &directory);
    let carol = TestPeer::new(3, &directory);
    let dave = TestPeer::new_with_config(4, &directory, fast);

    let group_id = alice.groups.create().await.unwrap().id;
    alice
        .groups
        .add_members(&group_id, &[bob.root(), carol.root(), dave.root()])
        .await
        .unwrap();
    for peer in [&bob, &carol, &dave] {
        peer.sync_from(&alice).await.unwrap();
    }

    // Partitioned from each other, Alice excludes Bob while Dave excludes Carol.
    alice
        .groups
        .exclude_members(&group_id, &[bob.root()])
        .await
        .unwrap();
    dave.groups
        .exclude_members(&group_id, &[carol.root()])
        .await
        .unwrap();

    alice.sync_from(&dave).await.unwrap();
    dave.sync_from(&alice).await.unwrap();

    let selection = alice.groups.selection(&group_id).await.unwrap();
    assert_matches!(selection, Selection::Overlapping { .. });
    assert_eq!(selection, dave.groups.selection(&group_id).await.unwrap());

    let fork = selection.fork().expect("overlapping epochs form a fork");
    assert!(alice.groups.is_reconciling(&fork).await);
    assert!(dave.groups.is_reconciling(&fork).await);

    // Dave's timer fires first and joins both epochs into one with the common members.
    assert!(
        eventually(|| async {
            matches!(
                dave.groups.selection(&group_id).await,
                Ok(Selection::Single(_))
            )
        })
        .await
    );

    let reconciled = dave.groups.preferred_epoch(&group_id).await.unwrap();
    let (a, b) = fork.epochs();
    assert_eq!(
        reconciled.previous.iter().copied().collect::<BTreeSet<_>>(),
        BTreeSet::from([a, b])
    );
    assert_eq!(
        reconciled.members.current(),
        members(&[alice.root(), dave.root()])
    );

    alice.sync_from(&dave).await.unwrap();
    assert_eq!(
        alice.groups.preferred_epoch(&group_id).await.unwrap().id,
        reconciled.id
    );
    assert_eq!(
        write_key(&alice, &group_id).await,
        write_key(&dave, &group_id).await
    );

    // Alice's own timer is still pending but would find the fork gone.
    assert_eq!(
        alice.groups.reconcile(&group_id, fork).await.unwrap(),
        None
    );

    alice.groups.shutdown().await;
    dave.groups.shutdown().await;
    assert!(!alice.groups.is_reconciling(&fork).await);
}

#[tokio::test]
async fn missing_members_are_added_again() {
    setup_logging();

    let directory = Directory::new();
    let alice = TestPeer::new(1, &directory);
    let bob = TestPeer::new(2, &directory);
    let carol = TestPeer::new(3, &directory);
    let dave = TestPeer::new(4, &directory);

    let group_id = alice.groups.create().await.unwrap().id;
    alice
        .groups
        .add_members(&group_id, &[bob.root(), carol.root()])
        .await
        .unwrap();
    carol.sync_from(&alice).await.unwrap();

    // Carol adds Dave to the root epoch while Alice concurrently excludes Bob.
    let epoch_id = alice
        .groups
        .exclude_members(&group_id, &[bob.root()])
        .await
        .unwrap();
    carol
        .groups
        .add_members(&group_id, &[dave.root()])
        .await
        .unwrap();

    alice.sync_from(&carol).await.unwrap();
    assert_eq!(
        alice.groups.list_members(&group_id).await.unwrap(),
        members(&[alice.root(), carol.root()])
    );

    let repaired = alice.groups.fix_missing_members(&group_id).await.unwrap();
    assert_eq!(repaired.len(), 1);
    assert_eq!(
        alice.groups.list_members(&group_id).await.unwrap(),
        members(&[alice.root(), carol.root(), dave.root()])
    );
    assert!(
        alice
            .groups
            .fix_missing_members(&group_id)
            .await
            .unwrap()
            .is_empty()
    );

    dave.sync_from(&alice).await.unwrap();
    assert_eq!(
        dave.groups.preferred_epoch(&group_id).await.unwrap().id,
        epoch_id
    );
}

#[tokio::test]
async fn missing_members_are_repaired_in_background() {
    setup_logging();

    let directory = Directory::new();
    let fast = Config::default()
        .with_reconcile_delay(Duration::from_millis(20), Duration::from_millis(50));
    let alice = TestPeer::new_with_config(1, &directory, fast);
    let bob = TestPeer::new(2, &directory);
    let carol = TestPeer::new(3, &directory);
    let dave = TestPeer::new(4, &directory);

    let group_id = alice.groups.create().await.unwrap().id;
    alice
        .groups
        .add_members(&group_id, &[bob.root(), carol.root()])
        .await
        .unwrap();
    carol.sync_from(&alice).await.unwrap();

    let epoch_id = alice
        .groups
        .exclude_members(&group_id, &[bob.root()])
        .await
        .unwrap();
    carol
        .groups
        .add_members(&group_id, &[dave.root()])
        .await
        .unwrap();

    // Nobody asks Alice to repair, she notices Dave missing when Carol's addition arrives.
    let handle = alice.groups.start().await.unwrap();
    alice.store.replicate_from(&carol.store).await;

    assert!(
        eventually(|| async {
            alice.groups.list_members(&group_id).await.ok()
                == Some(members(&[alice.root(), carol.root(), dave.root()]))
        })
        .await
    );
    assert_eq!(
        alice.groups.preferred_epoch(&group_id).await.unwrap().id,
        epoch_id
    );

    dave.sync_from(&alice).await.unwrap();
    assert_eq!(
        dave.groups.preferred_epoch(&group_id).await.unwrap().id,
        epoch_id
    );

    alice.groups.shutdown().await;
    handle.await.unwrap();
}

#[tokio::test]
async fn catch_up_syncs_groups_after_a_failing_one() {
    setup_logging();

    let directory = Directory::new();
    let alice = TestPeer::new(1, &directory);
    let bob = TestPeer::new(2, &directory);
    let carol = TestPeer::new(3, &directory);
    let dave = TestPeer::new(4, &directory);

    let forked = alice.groups.create().await.unwrap().id;
    alice
        .groups
        .add_members(
            &forked,
            &[bob.root(), carol.root(), feed(7), feed(8), feed(9)],
        )
        .await
        .unwrap();
    bob.sync_from(&alice).await.unwrap();
    carol.sync_from(&alice).await.unwrap();

    let healthy = bob.groups.create().await.unwrap().id;
    bob.groups
        .add_members(&healthy, &[alice.root(), dave.root()])
        .await
        .unwrap();
    alice.sync_from(&bob).await.unwrap();
    assert_eq!(
        write_key(&alice, &healthy).await,
        write_key(&bob, &healthy).await
    );

    // Three concurrent exclusions leave the first group with three tip epochs.
    alice
        .groups
        .exclude_members(&forked, &[feed(7)])
        .await
        .unwrap();
    bob.groups
        .exclude_members(&forked, &[feed(8)])
        .await
        .unwrap();
    carol
        .groups
        .exclude_members(&forked, &[feed(9)])
        .await
        .unwrap();

    // Dave leaves the second group, which has to rotate its key on Alice's side.
    let rotated = bob
        .groups
        .exclude_members(&healthy, &[dave.root()])
        .await
        .unwrap();
    bob.store.replicate_from(&carol.store).await;

    assert_matches!(
        alice.sync_from(&bob).await,
        Err(GroupsError::UnresolvedFork { .. })
    );
    assert_eq!(
        alice.groups.preferred_epoch(&healthy).await.unwrap().id,
        rotated
    );
    assert_eq!(
        write_key(&alice, &healthy).await,
        write_key(&bob, &healthy).await
    );
    assert_eq!(
        alice.groups.list_members(&healthy).await.unwrap(),
        members(&[alice.root(), bob.root()])
    );
}

#[tokio::test]
async fn additions_are_batched() {
    setup_logging();

    let directory = Directory::new();
    let config = Config::default().with_max_recipients(4);
    let alice = TestPeer::new_with_config(1, &directory, config);

    let group_id = alice.groups.create().await.unwrap().id;
    let feed_ids: Vec<FeedId> = (10..17).map(feed).collect();
    let added = alice
        .groups
        .add_members(&group_id, &feed_ids)
        .await
        .unwrap();

    // Three feeds per message, the group id takes the fourth recipient slot.
    assert_eq!(added.len(), 3);
    assert_eq!(
        alice.groups.list_members(&group_id).await.unwrap().len(),
        feed_ids.len() + 1
    );
}

#[tokio::test]
async fn unknown_group() {
    let directory = Directory::new();
    let alice = TestPeer::new(1, &directory);
    let group_id = GroupId::from(Hash::new(b"nobody knows"));

    assert_matches!(
        alice.groups.add_members(&group_id, &[feed(2)]).await,
        Err(GroupsError::UnknownGroup(id)) if id == group_id
    );
    assert_matches!(
        alice.groups.sync_group(&group_id).await,
        Err(err) if err.stage().is_none()
    );
}

#[tokio::test]
async fn store_rejection_halves_previous() {
    let directory = Directory::new();
    let identity = TestIdentity::new(1, &directory);
    let store = MemoryStore::new(identity.clone());

    let root = Hash::new(b"root");
    let secret = GroupSecret::from_bytes([7; 32]);
    let group_id = GroupId::cloak(&root, &secret);
    let previous: Vec<Hash> = (0..64u32).map(|i| Hash::new(i.to_be_bytes())).collect();

    let content = |previous: &[Hash]| {
        GroupContent::exclude_member(group_id, vec![feed(2)], root, previous.to_vec())
    };
    let limit = encoded_size(&content(&previous[..8])).unwrap();
    store.set_max_content_size(Some(limit)).await;

    let (_, published) = publish_with_retry(&store, &identity.root(), content(&previous), &secret)
        .await
        .unwrap();
    let GroupContent::ExcludeMember(published) = published else {
        panic!("expected exclude-member content");
    };
    assert_eq!(published.tangles.members.previous.map(|p| p.len()), Some(8));
    assert_eq!(store.len().await, 1);

    // Even a single entry does not fit anymore.
    store.set_max_content_size(Some(10)).await;
    assert!(
        publish_with_retry(&store, &identity.root(), content(&previous), &secret)
            .await
            .is_err()
    );
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn live_members() {
    setup_logging();

    let directory = Directory::new();
    let alice = TestPeer::new(1, &directory);
    let bob = TestPeer::new(2, &directory);

    let info = alice.groups.create().await.unwrap();
    let mut stream = alice.groups.live_members(info.root).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.added, members(&[alice.root()]));

    alice
        .groups
        .add_members(&info.id, &[bob.root()])
        .await
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.added, members(&[alice.root(), bob.root()]));

    alice.groups.shutdown().await;
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn live_preferred_epoch() {
    setup_logging();

    let directory = Directory::new();
    let alice = TestPeer::new(1, &directory);
    let bob = TestPeer::new(2, &directory);

    let info = alice.groups.create().await.unwrap();
    alice
        .groups
        .add_members(&info.id, &[bob.root()])
        .await
        .unwrap();

    let mut stream = alice.groups.live_preferred_epoch(&info.id).await.unwrap();
    let current = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.id, info.root);

    let epoch_id = alice
        .groups
        .exclude_members(&info.id, &[bob.root()])
        .await
        .unwrap();
    let next = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.id, epoch_id);

    alice.groups.shutdown().await;
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn background_processing() {
    setup_logging();

    let directory = Directory::new();
    let alice = TestPeer::new(1, &directory);
    let bob = TestPeer::new(2, &directory);

    let handle = bob.groups.start().await.unwrap();

    let group_id = alice.groups.create().await.unwrap().id;
    alice
        .groups
        .add_members(&group_id, &[bob.root()])
        .await
        .unwrap();
    bob.store.replicate_from(&alice.store).await;

    assert!(
        eventually(|| async {
            bob.groups.list_members(&group_id).await.ok()
                == Some(members(&[alice.root(), bob.root()]))
        })
        .await
    );

    bob.groups.shutdown().await;
    handle.await.unwrap();
}
