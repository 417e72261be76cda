// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory collaborators and helpers for testing group resolution with several peers.
mod identity;
pub mod messages;
mod store;

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tribes_core::FeedId;

use crate::config::Config;
use crate::error::GroupsError;
use crate::manager::Groups;

pub use identity::{Directory, TestIdentity, TestIdentityError};
pub use store::{MemoryStore, MemoryStoreError};

pub type TestGroups = Groups<MemoryStore, MemoryStore, TestIdentity>;

pub type TestGroupsError = GroupsError<MemoryStoreError, MemoryStoreError, TestIdentityError>;

/// One peer with its own store, key registry and identity.
///
/// All peers created with the same [`Directory`] can resolve each other's sub-feeds.
pub struct TestPeer {
    pub groups: TestGroups,
    pub store: MemoryStore,
    pub identity: TestIdentity,
}

impl TestPeer {
    pub fn new(seed: u8, directory: &Directory) -> Self {
        Self::new_with_config(seed, directory, Config::default())
    }

    pub fn new_with_config(seed: u8, directory: &Directory, config: Config) -> Self {
        let identity = TestIdentity::new(seed, directory);
        let store = MemoryStore::new(identity.clone());
        let rng = ChaCha20Rng::from_seed([seed; 32]);
        let groups = Groups::new(config, store.clone(), store.clone(), identity.clone(), rng);

        Self {
            groups,
            store,
            identity,
        }
    }

    pub fn root(&self) -> FeedId {
        self.identity.root()
    }

    /// Fetch everything the other peer has and process it.
    pub async fn sync_from(&self, other: &TestPeer) -> Result<(), TestGroupsError> {
        self.store.replicate_from(&other.store).await;
        self.groups.catch_up().await
    }
}

pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}
