// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use futures_channel::mpsc;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use thiserror::Error;
use tokio::sync::RwLock;
use tribes_core::cbor::{EncodeError, encode_cbor, encoded_size};
use tribes_core::{FeedId, GroupId, GroupSecret, Hash, MessageId};

use crate::message::{GroupContent, GroupMessage, Recipient};
use crate::test_utils::identity::TestIdentity;
use crate::traits::{GroupInfo, KeyRegistry, MessageStore, Query};

/// Message as it sits in the log, encrypted.
#[derive(Clone, Debug)]
struct Envelope {
    id: MessageId,
    author: FeedId,
    content: GroupContent,
    key: GroupSecret,
}

struct Subscriber {
    query: Query,
    sender: mpsc::UnboundedSender<GroupMessage>,
    delivered: HashSet<MessageId>,
}

struct MemoryStoreInner {
    log: Vec<Envelope>,
    ids: HashSet<MessageId>,
    groups: BTreeMap<GroupId, GroupInfo>,
    subscribers: Vec<Subscriber>,
    max_content_size: Option<usize>,
    reindexed: usize,
}

/// In-memory log store and key registry of one peer.
///
/// Messages are readable when authored by one of the peer's feeds, when encrypted to a group
/// key the peer knows or when the peer's root is listed as recipient.
#[derive(Clone)]
pub struct MemoryStore {
    identity: TestIdentity,
    inner: Arc<RwLock<MemoryStoreInner>>,
}

impl MemoryStore {
    pub fn new(identity: TestIdentity) -> Self {
        Self {
            identity,
            inner: Arc::new(RwLock::new(MemoryStoreInner {
                log: Vec::new(),
                ids: HashSet::new(),
                groups: BTreeMap::new(),
                subscribers: Vec::new(),
                max_content_size: None,
                reindexed: 0,
            })),
        }
    }

    /// Reject publishing messages larger than this.
    pub async fn set_max_content_size(&self, max: Option<usize>) {
        self.inner.write().await.max_content_size = max;
    }

    /// Copy every message of the other store we don't have yet, in its log order.
    pub async fn replicate_from(&self, other: &MemoryStore) -> usize {
        let envelopes = other.inner.read().await.log.clone();

        let mut inner = self.inner.write().await;
        let mut copied = 0;
        for envelope in envelopes {
            if inner.ids.insert(envelope.id) {
                inner.log.push(envelope);
                copied += 1;
            }
        }
        inner.flush(&self.identity);
        copied
    }

    /// Number of times the key registry was asked to reindex.
    pub async fn reindexed(&self) -> usize {
        self.inner.read().await.reindexed
    }

    /// Number of messages in the log, readable or not.
    pub async fn len(&self) -> usize {
        self.inner.read().await.log.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.log.is_empty()
    }
}

impl MemoryStoreInner {
    fn open(&self, envelope: &Envelope, identity: &TestIdentity) -> Option<GroupMessage> {
        let known_key = self
            .groups
            .values()
            .any(|info| info.has_read_key(&envelope.key));

        let read_key = if identity.is_local(&envelope.author) || known_key {
            Some(envelope.key.clone())
        } else if envelope.content.recipients().iter().any(
            |recp| matches!(recp, Recipient::Feed(feed_id) if identity.is_local(feed_id)),
        ) {
            None
        } else {
            return None;
        };

        Some(GroupMessage {
            id: envelope.id,
            author: envelope.author,
            content: envelope.content.clone(),
            read_key,
        })
    }

    fn query(&self, query: &Query, identity: &TestIdentity) -> Vec<GroupMessage> {
        self.log
            .iter()
            .filter_map(|envelope| self.open(envelope, identity))
            .filter(|message| query.matches(message))
            .collect()
    }

    /// Deliver everything readable and not yet delivered to live subscribers.
    fn flush(&mut self, identity: &TestIdentity) {
        let mut subscribers = std::mem::take(&mut self.subscribers);
        subscribers.retain(|subscriber| !subscriber.sender.is_closed());

        for subscriber in subscribers.iter_mut() {
            for message in self.query(&subscriber.query, identity) {
                if subscriber.delivered.insert(message.id) {
                    let _ = subscriber.sender.unbounded_send(message);
                }
            }
        }

        self.subscribers = subscribers;
    }
}

impl MessageStore for MemoryStore {
    type Error = MemoryStoreError;

    async fn query(&self, query: &Query) -> Result<Vec<GroupMessage>, Self::Error> {
        let inner = self.inner.read().await;
        Ok(inner.query(query, &self.identity))
    }

    async fn subscribe(
        &self,
        query: &Query,
    ) -> Result<BoxStream<'static, GroupMessage>, Self::Error> {
        let (sender, receiver) = mpsc::unbounded();

        let mut inner = self.inner.write().await;
        inner.subscribers.push(Subscriber {
            query: query.clone(),
            sender,
            delivered: HashSet::new(),
        });
        inner.flush(&self.identity);

        Ok(receiver.boxed())
    }

    async fn publish(
        &self,
        author: &FeedId,
        content: &GroupContent,
        key: &GroupSecret,
    ) -> Result<MessageId, Self::Error> {
        let mut inner = self.inner.write().await;

        if let Some(max) = inner.max_content_size {
            let size = encoded_size(content)?;
            if size > max {
                return Err(MemoryStoreError::TooLarge { size, max });
            }
        }

        let sequence = inner.log.len() as u64;
        let id = Hash::new(encode_cbor(&(author, sequence, content))?);
        inner.ids.insert(id);
        inner.log.push(Envelope {
            id,
            author: *author,
            content: content.clone(),
            key: key.clone(),
        });
        inner.flush(&self.identity);

        Ok(id)
    }
}

impl KeyRegistry for MemoryStore {
    type Error = MemoryStoreError;

    async fn group_info(&self, group_id: &GroupId) -> Result<Option<GroupInfo>, Self::Error> {
        Ok(self.inner.read().await.groups.get(group_id).cloned())
    }

    async fn add_group_info(
        &self,
        group_id: &GroupId,
        root: MessageId,
        secret: GroupSecret,
    ) -> Result<(), Self::Error> {
        let mut inner = self.inner.write().await;
        let info = inner
            .groups
            .entry(*group_id)
            .or_insert_with(|| GroupInfo {
                id: *group_id,
                root,
                write_key: secret.clone(),
                read_keys: Vec::new(),
                excluded: false,
            });
        if !info.has_read_key(&secret) {
            info.read_keys.push(secret);
        }
        Ok(())
    }

    async fn add_group_key(
        &self,
        group_id: &GroupId,
        secret: GroupSecret,
    ) -> Result<(), Self::Error> {
        let mut inner = self.inner.write().await;
        let info = inner
            .groups
            .get_mut(group_id)
            .ok_or(MemoryStoreError::UnknownGroup(*group_id))?;
        if !info.has_read_key(&secret) {
            info.read_keys.push(secret);
        }
        Ok(())
    }

    async fn pick_group_write_key(
        &self,
        group_id: &GroupId,
        secret: GroupSecret,
    ) -> Result<(), Self::Error> {
        let mut inner = self.inner.write().await;
        let info = inner
            .groups
            .get_mut(group_id)
            .ok_or(MemoryStoreError::UnknownGroup(*group_id))?;
        if !info.has_read_key(&secret) {
            return Err(MemoryStoreError::UnknownKey(*group_id));
        }
        info.write_key = secret;
        Ok(())
    }

    async fn exclude_group_info(&self, group_id: &GroupId) -> Result<(), Self::Error> {
        let mut inner = self.inner.write().await;
        let info = inner
            .groups
            .get_mut(group_id)
            .ok_or(MemoryStoreError::UnknownGroup(*group_id))?;
        info.excluded = true;
        Ok(())
    }

    async fn list_group_ids(&self) -> Result<Vec<GroupId>, Self::Error> {
        let inner = self.inner.read().await;
        Ok(inner
            .groups
            .values()
            .filter(|info| !info.excluded)
            .map(|info| info.id)
            .collect())
    }

    async fn reindex_encrypted(&self) -> Result<(), Self::Error> {
        let mut inner = self.inner.write().await;
        inner.reindexed += 1;
        inner.flush(&self.identity);
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum MemoryStoreError {
    #[error("content of {size} bytes exceeds store limit of {max} bytes")]
    TooLarge { size: usize, max: usize },

    #[error("group {0} is not registered")]
    UnknownGroup(GroupId),

    #[error("write key for group {0} was never registered as read key")]
    UnknownKey(GroupId),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}
