// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interfaces of the external collaborators: message store, key registry and identity management.
//!
//! This crate never encrypts, decrypts or persists anything itself. It only reads decrypted group
//! messages, decides which keys should be used and asks these collaborators to act on that.
use std::error::Error as StdError;
use std::future::Future;

use futures_util::stream::BoxStream;
use tribes_core::{FeedId, GroupId, GroupSecret, MessageId};

use crate::message::{ContentType, GroupContent, GroupMessage, TangleName};

/// Filter for reading group messages from the store.
///
/// Stores only ever hand out messages they were able to decrypt.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Query {
    pub content_type: Option<ContentType>,
    pub author: Option<FeedId>,

    /// Only messages belonging to the tangle with this name and root.
    pub tangle: Option<(TangleName, MessageId)>,
}

impl Query {
    /// Every decrypted group message.
    pub fn all() -> Self {
        Self::default()
    }

    /// `group/init` and `group/init-epoch` messages of the group with the given root.
    pub fn epochs(group_root: MessageId) -> Self {
        Self {
            tangle: Some((TangleName::Epoch, group_root)),
            ..Default::default()
        }
    }

    /// The epoch message itself and all add and exclude messages of its members tangle.
    pub fn members(epoch_id: MessageId) -> Self {
        Self {
            tangle: Some((TangleName::Members, epoch_id)),
            ..Default::default()
        }
    }

    pub fn content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = Some(content_type);
        self
    }

    pub fn author(mut self, author: FeedId) -> Self {
        self.author = Some(author);
        self
    }

    pub fn matches(&self, message: &GroupMessage) -> bool {
        if self
            .content_type
            .is_some_and(|content_type| content_type != message.content.content_type())
        {
            return false;
        }

        if self.author.is_some_and(|author| author != message.author) {
            return false;
        }

        match self.tangle {
            Some((name, root)) => message.tangle_root(name) == Some(root),
            None => true,
        }
    }
}

/// Append-only log store holding the encrypted messages of all feeds.
pub trait MessageStore {
    type Error: StdError + Send + Sync + 'static;

    /// One-shot query over all currently decrypted messages.
    fn query(
        &self,
        query: &Query,
    ) -> impl Future<Output = Result<Vec<GroupMessage>, Self::Error>> + Send;

    /// Live query, yielding all matching messages already known and then every new one.
    ///
    /// Messages becoming readable after a reindex are delivered as well. Messages of one feed
    /// arrive in append order, there's no order across feeds.
    fn subscribe(
        &self,
        query: &Query,
    ) -> impl Future<Output = Result<BoxStream<'static, GroupMessage>, Self::Error>> + Send;

    /// Append a message to the given local feed.
    ///
    /// The envelope is encrypted to `key` and additionally to every feed listed in the message
    /// recipients.
    fn publish(
        &self,
        author: &FeedId,
        content: &GroupContent,
        key: &GroupSecret,
    ) -> impl Future<Output = Result<MessageId, Self::Error>> + Send;
}

/// Keys and metadata the local peer knows about a group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupInfo {
    pub id: GroupId,

    /// Id of the `group/init` message.
    pub root: MessageId,

    /// Key new messages to the group get encrypted with.
    pub write_key: GroupSecret,

    /// Every epoch key we know of, used to decrypt messages.
    pub read_keys: Vec<GroupSecret>,

    /// Set after we learned that we've been excluded from the group.
    pub excluded: bool,
}

impl GroupInfo {
    pub fn has_read_key(&self, secret: &GroupSecret) -> bool {
        self.read_keys.iter().any(|key| key == secret)
    }
}

/// Key registry of the envelope encryption layer.
pub trait KeyRegistry {
    type Error: StdError + Send + Sync + 'static;

    fn group_info(
        &self,
        group_id: &GroupId,
    ) -> impl Future<Output = Result<Option<GroupInfo>, Self::Error>> + Send;

    /// Register a group we've just created or have been invited to.
    ///
    /// The secret becomes read and write key. For already registered groups it is only added as
    /// read key.
    fn add_group_info(
        &self,
        group_id: &GroupId,
        root: MessageId,
        secret: GroupSecret,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn add_group_key(
        &self,
        group_id: &GroupId,
        secret: GroupSecret,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn pick_group_write_key(
        &self,
        group_id: &GroupId,
        secret: GroupSecret,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Mark a group as left, its keys are kept for reading old messages.
    fn exclude_group_info(
        &self,
        group_id: &GroupId,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Ids of all groups we're currently a member of.
    fn list_group_ids(&self) -> impl Future<Output = Result<Vec<GroupId>, Self::Error>> + Send;

    /// Retry decrypting stored messages with the current set of keys.
    fn reindex_encrypted(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Multi-device identity: one root identity per person, publishing through purpose-specific
/// sub-feeds.
pub trait IdentityProvider {
    type Error: StdError + Send + Sync + 'static;

    fn find_or_create_root(&self) -> impl Future<Output = Result<FeedId, Self::Error>> + Send;

    /// Root identity the given feed belongs to. Root feeds resolve to themselves.
    fn resolve_root(
        &self,
        feed_id: &FeedId,
    ) -> impl Future<Output = Result<FeedId, Self::Error>> + Send;

    /// Local sub-feeds created for the given purpose.
    fn sub_feeds(
        &self,
        purpose: &str,
    ) -> impl Future<Output = Result<Vec<FeedId>, Self::Error>> + Send;

    fn create_sub_feed(
        &self,
        purpose: &str,
    ) -> impl Future<Output = Result<FeedId, Self::Error>> + Send;
}

#[cfg(test)]
mod tests {
    use tribes_core::{GroupId, GroupSecret, Hash, PrivateKey};

    use super::Query;
    use crate::message::{ContentType, GroupContent, GroupMessage};

    fn message(id: &str, content: GroupContent) -> GroupMessage {
        GroupMessage {
            id: Hash::new(id),
            author: PrivateKey::from_bytes(&[1; 32]).feed_id(),
            content,
            read_key: None,
        }
    }

    #[test]
    fn query_by_tangle_root() {
        let secret = GroupSecret::from_bytes([1; 32]);
        let init = message("init", GroupContent::init(secret.clone()));
        let root = init.id;
        let epoch = message(
            "epoch",
            GroupContent::init_epoch(secret.clone(), root, vec![root]),
        );

        assert!(Query::epochs(root).matches(&init));
        assert!(Query::epochs(root).matches(&epoch));
        assert!(Query::members(root).matches(&init));
        assert!(!Query::members(root).matches(&epoch));
        assert!(Query::members(epoch.id).matches(&epoch));

        let group_id = GroupId::cloak(&root, &secret);
        let member = PrivateKey::from_bytes(&[2; 32]).feed_id();
        let add = message(
            "add",
            GroupContent::add_member(group_id, root, secret, &[member], epoch.id, vec![epoch.id]),
        );
        assert!(Query::members(epoch.id).matches(&add));
        assert!(!Query::epochs(root).matches(&add));
    }

    #[test]
    fn query_by_type_and_author() {
        let init = message("init", GroupContent::init(GroupSecret::from_bytes([1; 32])));
        assert!(Query::all().matches(&init));
        assert!(Query::all().content_type(ContentType::Init).matches(&init));
        assert!(!Query::all().content_type(ContentType::AddMember).matches(&init));
        assert!(Query::all().author(init.author).matches(&init));
        assert!(
            !Query::all()
                .author(PrivateKey::from_bytes(&[3; 32]).feed_id())
                .matches(&init)
        );
    }
}
