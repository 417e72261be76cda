// SPDX-License-Identifier: MIT OR Apache-2.0

//! Builders for decrypted group messages, bypassing any store.
use tribes_core::cbor::encode_cbor;
use tribes_core::{FeedId, GroupId, GroupSecret, Hash, MessageId, PrivateKey};

use crate::message::{GroupContent, GroupMessage};

/// Deterministic feed id for the given seed.
pub fn feed(seed: u8) -> FeedId {
    PrivateKey::from_bytes(&[seed; 32]).feed_id()
}

/// Wrap content into a message, its id is derived from author and content.
pub fn message(author: FeedId, content: GroupContent, read_key: Option<GroupSecret>) -> GroupMessage {
    let bytes = encode_cbor(&(author, &content)).expect("encode test message");
    GroupMessage {
        id: Hash::new(bytes),
        author,
        content,
        read_key,
    }
}

/// Group id of the group started by the given `group/init` message.
pub fn group_id(root: &GroupMessage) -> GroupId {
    match &root.content {
        GroupContent::Init(content) => GroupId::cloak(&root.id, &content.group_key),
        _ => GroupId::from(root.id),
    }
}

pub fn init(author: FeedId, secret: [u8; 32]) -> GroupMessage {
    let secret = GroupSecret::from_bytes(secret);
    message(author, GroupContent::init(secret.clone()), Some(secret))
}

pub fn init_epoch(
    author: FeedId,
    secret: [u8; 32],
    root: MessageId,
    previous: &[MessageId],
) -> GroupMessage {
    let secret = GroupSecret::from_bytes(secret);
    message(
        author,
        GroupContent::init_epoch(secret.clone(), root, previous.to_vec()),
        Some(secret),
    )
}

/// Add members to an epoch, `secret` is the key of that epoch.
pub fn add_member(
    author: FeedId,
    root: &GroupMessage,
    secret: [u8; 32],
    epoch: MessageId,
    previous: &[MessageId],
    members: &[FeedId],
) -> GroupMessage {
    let content = GroupContent::add_member(
        group_id(root),
        root.id,
        GroupSecret::from_bytes(secret),
        members,
        epoch,
        previous.to_vec(),
    );
    message(author, content, Some(GroupSecret::from_bytes(secret)))
}

pub fn exclude_member(
    author: FeedId,
    root: &GroupMessage,
    secret: [u8; 32],
    epoch: MessageId,
    previous: &[MessageId],
    excludes: &[FeedId],
) -> GroupMessage {
    let content =
        GroupContent::exclude_member(group_id(root), excludes.to_vec(), epoch, previous.to_vec());
    message(author, content, Some(GroupSecret::from_bytes(secret)))
}
