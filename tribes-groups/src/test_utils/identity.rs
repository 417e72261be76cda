// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use thiserror::Error;
use tribes_core::{FeedId, PrivateKey};

use crate::traits::IdentityProvider;

/// Shared lookup of sub-feeds to their root identity, standing in for replicated feed
/// announcements.
#[derive(Clone, Debug, Default)]
pub struct Directory {
    roots: Arc<RwLock<HashMap<FeedId, FeedId>>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    fn announce(&self, feed_id: FeedId, root: FeedId) {
        self.roots.write().unwrap().insert(feed_id, root);
    }

    fn root_of(&self, feed_id: &FeedId) -> Option<FeedId> {
        self.roots.read().unwrap().get(feed_id).copied()
    }
}

#[derive(Debug)]
struct IdentityInner {
    rng: ChaCha20Rng,
    sub_feeds: BTreeMap<String, Vec<FeedId>>,
}

/// Root identity with deterministic sub-feeds.
#[derive(Clone, Debug)]
pub struct TestIdentity {
    root: FeedId,
    directory: Directory,
    inner: Arc<RwLock<IdentityInner>>,
}

impl TestIdentity {
    pub fn new(seed: u8, directory: &Directory) -> Self {
        let mut rng = ChaCha20Rng::from_seed([seed; 32]);
        let root = Self::generate(&mut rng);
        directory.announce(root, root);

        Self {
            root,
            directory: directory.clone(),
            inner: Arc::new(RwLock::new(IdentityInner {
                rng,
                sub_feeds: BTreeMap::new(),
            })),
        }
    }

    fn generate(rng: &mut ChaCha20Rng) -> FeedId {
        let mut bytes = [0; 32];
        rng.fill_bytes(&mut bytes);
        PrivateKey::from_bytes(&bytes).feed_id()
    }

    pub fn root(&self) -> FeedId {
        self.root
    }

    /// Returns `true` if the feed is our root or one of our sub-feeds.
    pub fn is_local(&self, feed_id: &FeedId) -> bool {
        *feed_id == self.root
            || self
                .inner
                .read()
                .unwrap()
                .sub_feeds
                .values()
                .any(|feeds| feeds.contains(feed_id))
    }
}

impl IdentityProvider for TestIdentity {
    type Error = TestIdentityError;

    async fn find_or_create_root(&self) -> Result<FeedId, Self::Error> {
        Ok(self.root)
    }

    async fn resolve_root(&self, feed_id: &FeedId) -> Result<FeedId, Self::Error> {
        self.directory
            .root_of(feed_id)
            .ok_or(TestIdentityError::UnknownFeed(*feed_id))
    }

    async fn sub_feeds(&self, purpose: &str) -> Result<Vec<FeedId>, Self::Error> {
        let inner = self.inner.read().unwrap();
        Ok(inner.sub_feeds.get(purpose).cloned().unwrap_or_default())
    }

    async fn create_sub_feed(&self, purpose: &str) -> Result<FeedId, Self::Error> {
        let feed_id = {
            let mut inner = self.inner.write().unwrap();
            let feed_id = Self::generate(&mut inner.rng);
            inner
                .sub_feeds
                .entry(purpose.to_string())
                .or_default()
                .push(feed_id);
            feed_id
        };
        self.directory.announce(feed_id, self.root);
        Ok(feed_id)
    }
}

#[derive(Debug, Error)]
pub enum TestIdentityError {
    #[error("feed {0} was never announced")]
    UnknownFeed(FeedId),
}
