// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use tribes_core::{FeedId, GroupId, GroupSecret, Hash, MessageId};

use crate::cache::{TangleCache, link_node};
use crate::config::Config;
use crate::epoch::{Epoch, EpochGraph};
use crate::error::{GroupsError, Stage};
use crate::membership::{Members, MembershipAccumulator, is_members_event};
use crate::message::{GroupContent, GroupMessage, TangleName};
use crate::missing::find_missing_members;
use crate::preferred::{SelectError, Selection, select_preferred, skip_until_caught_up};
use crate::publish::{PublishError, batch_members, prune_previous, publish_with_retry};
use crate::reconcile::{Fork, ReconcileScheduler, Task};
use crate::traits::{GroupInfo, IdentityProvider, KeyRegistry, MessageStore, Query};

/// Purpose of the sub-feed publishing `group/add-member` messages.
pub const ADDITIONS_FEED_PURPOSE: &str = "group/additions";

/// Errors of the [`Groups`] manager for the given collaborators.
pub type ManagerError<S, K, I> = GroupsError<
    <S as MessageStore>::Error,
    <K as KeyRegistry>::Error,
    <I as IdentityProvider>::Error,
>;

/// Create, join and administrate private groups.
///
/// Every operation reads the administrative messages of a group from the store and resolves its
/// epochs from scratch, the only state kept in memory are the tips of the tangles we append to
/// and the pending reconciliation timers.
///
/// The handle is cheap to clone, all clones share the same state. Only one instance per local
/// root identity should exist.
pub struct Groups<S, K, I> {
    inner: Arc<GroupsInner<S, K, I>>,
}

struct GroupsInner<S, K, I> {
    config: Config,
    store: S,
    keys: K,
    identity: I,
    cache: RwLock<TangleCache>,
    rng: Mutex<ChaCha20Rng>,
    scheduler: ReconcileScheduler,
    shutdown: CancellationToken,
    local_root: OnceCell<FeedId>,
}

impl<S, K, I> Clone for Groups<S, K, I> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, K, I> Groups<S, K, I>
where
    S: MessageStore + Send + Sync + 'static,
    K: KeyRegistry + Send + Sync + 'static,
    I: IdentityProvider + Send + Sync + 'static,
{
    /// Secrets and reconciliation delays are drawn from `rng`, seed it from the OS outside of
    /// tests.
    pub fn new(config: Config, store: S, keys: K, identity: I, mut rng: ChaCha20Rng) -> Self {
        let shutdown = CancellationToken::new();
        let (min_delay, max_delay) = config.reconcile_delay();
        let scheduler = ReconcileScheduler::new(
            min_delay,
            max_delay,
            ChaCha20Rng::from_rng(&mut rng),
            shutdown.clone(),
        );

        Self {
            inner: Arc::new(GroupsInner {
                config,
                store,
                keys,
                identity,
                cache: RwLock::new(TangleCache::new()),
                rng: Mutex::new(rng),
                scheduler,
                shutdown,
                local_root: OnceCell::new(),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Create a new group with ourselves as the only member.
    pub async fn create(&self) -> Result<GroupInfo, ManagerError<S, K, I>> {
        let local_root = self.local_root().await?;
        let secret = self.generate_secret().await;
        let feed_id = self.group_feed(&secret).await?;

        let root = self
            .inner
            .store
            .publish(&feed_id, &GroupContent::init(secret.clone()), &secret)
            .await
            .map_err(Self::store_error(Stage::PublishInit))?;
        let group_id = GroupId::cloak(&root, &secret);

        self.inner
            .keys
            .add_group_info(&group_id, root, secret)
            .await
            .map_err(Self::keys_error(Stage::RegisterGroup))?;
        debug!(%group_id, %root, "created group");

        self.add_members(&group_id, &[local_root]).await?;
        self.group_info(&group_id).await
    }

    /// Add members to the preferred epoch of the group.
    ///
    /// Returns the ids of the published `group/add-member` messages, more than one if the members
    /// did not fit into a single message.
    pub async fn add_members(
        &self,
        group_id: &GroupId,
        feed_ids: &[FeedId],
    ) -> Result<Vec<MessageId>, ManagerError<S, K, I>> {
        let info = self.active_group_info(group_id).await?;
        let graph = self.load_epochs(info.root).await?;
        let preferred = self
            .select(&graph, Stage::SelectPreferredEpoch)?
            .into_preferred();

        let mut seen = HashSet::new();
        let feed_ids: Vec<FeedId> = feed_ids
            .iter()
            .copied()
            .filter(|feed_id| seen.insert(*feed_id))
            .collect();
        if feed_ids.is_empty() {
            return Ok(Vec::new());
        }

        let old_secrets = ancestor_secrets(&graph, &preferred.id);
        self.add_to_epoch(
            &info,
            &preferred,
            old_secrets,
            &feed_ids,
            Stage::PublishAddMember,
        )
        .await
    }

    /// Exclude members from the group.
    ///
    /// The exclusion is announced in the preferred epoch, followed by a new epoch with a fresh
    /// key which all remaining members get added to. Returns the id of the new epoch, or the
    /// preferred epoch if there was nobody to exclude.
    pub async fn exclude_members(
        &self,
        group_id: &GroupId,
        feed_ids: &[FeedId],
    ) -> Result<MessageId, ManagerError<S, K, I>> {
        let local_root = self.local_root().await?;
        if feed_ids.contains(&local_root) {
            return Err(GroupsError::ExcludeSelf(*group_id));
        }

        let info = self.active_group_info(group_id).await?;
        let graph = self.load_epochs(info.root).await?;
        let preferred = self
            .select(&graph, Stage::SelectPreferredEpoch)?
            .into_preferred();

        let excludes: BTreeSet<FeedId> = feed_ids.iter().copied().collect();
        if excludes.is_empty() {
            return Ok(preferred.id);
        }

        self.exclude_from_epoch(&info, &graph, &preferred, &excludes).await
    }

    /// Recompute the preferred epoch of a group and bring the key registry in line with it.
    ///
    /// Registers every epoch secret as read key, switches the write key over to the preferred
    /// epoch and schedules a reconciliation if the epoch tangle forked with overlapping
    /// membership. Without a fork, re-adding members missing in the preferred epoch is scheduled
    /// instead. Marks the group as left and returns [`GroupsError::Excluded`] if we've been
    /// excluded.
    pub async fn sync_group(&self, group_id: &GroupId) -> Result<Epoch, ManagerError<S, K, I>> {
        let local_root = self.local_root().await?;
        let info = self.active_group_info(group_id).await?;
        let graph = self.load_epochs(info.root).await?;

        let mut keys_changed = false;
        for epoch in graph.epochs() {
            if !info.has_read_key(&epoch.secret) {
                self.inner
                    .keys
                    .add_group_key(group_id, epoch.secret)
                    .await
                    .map_err(Self::keys_error(Stage::RotateKeys))?;
                keys_changed = true;
            }
        }

        let selection = self.select(&graph, Stage::SelectPreferredEpoch)?;
        let fork = selection.fork();
        let preferred = selection.into_preferred();

        if graph.is_excluded(&preferred.id, &local_root) {
            self.inner
                .keys
                .exclude_group_info(group_id)
                .await
                .map_err(Self::keys_error(Stage::RotateKeys))?;
            self.inner.cache.write().await.evict(group_id);
            debug!(%group_id, epoch = %preferred.id, "we have been excluded from group");
            return Err(GroupsError::Excluded(*group_id));
        }

        if info.write_key != preferred.secret {
            self.inner
                .keys
                .pick_group_write_key(group_id, preferred.secret.clone())
                .await
                .map_err(Self::keys_error(Stage::RotateKeys))?;
            debug!(%group_id, epoch = %preferred.id, "switched write key to preferred epoch");
            keys_changed = true;
        }

        if keys_changed {
            self.reindex(Stage::RotateKeys).await?;
        }

        match fork {
            Some(fork) => {
                debug!(%group_id, %fork, "epoch fork with overlapping members");
                self.schedule_reconcile(*group_id, fork).await;
            }
            None => {
                // Repairs wait until no fork is left.
                if !missing_in_preferred(&graph, &preferred).is_empty() {
                    self.schedule_repair(*group_id, preferred.id).await;
                }
            }
        }

        Ok(preferred)
    }

    /// Reconcile an overlapping fork of the epoch tangle, if it still exists.
    ///
    /// Everybody who is not a member of both forked epochs gets excluded from the preferred one.
    /// The resulting epoch follows all current tips, which joins the fork. Returns the id of the
    /// new epoch, `None` if the tangle moved on since the fork was detected or we're not a member
    /// of both epochs.
    pub async fn reconcile(
        &self,
        group_id: &GroupId,
        fork: Fork,
    ) -> Result<Option<MessageId>, ManagerError<S, K, I>> {
        let local_root = self.local_root().await?;
        let info = self.active_group_info(group_id).await?;
        let graph = self.load_epochs(info.root).await?;

        if !fork.matches(&graph.tip_ids()) {
            debug!(%group_id, %fork, "epoch tips changed, skip reconciliation");
            return Ok(None);
        }

        let Selection::Overlapping { preferred, other } = self.select(&graph, Stage::Reconcile)?
        else {
            debug!(%group_id, %fork, "fork resolved itself, skip reconciliation");
            return Ok(None);
        };

        let common: BTreeSet<FeedId> = preferred
            .members
            .added
            .intersection(&other.members.added)
            .copied()
            .collect();
        if !common.contains(&local_root) {
            debug!(%group_id, %fork, "not a member of both epochs, skip reconciliation");
            return Ok(None);
        }

        let excludes: BTreeSet<FeedId> = preferred
            .members
            .added
            .difference(&common)
            .copied()
            .collect();
        debug!(
            %group_id,
            %fork,
            excludes = excludes.len(),
            "reconcile epoch fork"
        );

        let epoch_id = self
            .exclude_from_epoch(&info, &graph, &preferred, &excludes)
            .await?;
        Ok(Some(epoch_id))
    }

    /// Re-add members which should have been carried over into later epochs but weren't.
    ///
    /// Members are added to the preferred epoch, unless they are already part of it or have been
    /// excluded on its way.
    pub async fn fix_missing_members(
        &self,
        group_id: &GroupId,
    ) -> Result<Vec<MessageId>, ManagerError<S, K, I>> {
        let info = self.active_group_info(group_id).await?;
        let graph = self.load_epochs(info.root).await?;
        let preferred = self.select(&graph, Stage::RepairMissing)?.into_preferred();

        let missing = missing_in_preferred(&graph, &preferred);
        if missing.is_empty() {
            trace!(%group_id, "no missing members");
            return Ok(Vec::new());
        }

        debug!(%group_id, missing = missing.len(), "re-add missing members");
        let missing: Vec<FeedId> = missing.into_iter().collect();
        let old_secrets = ancestor_secrets(&graph, &preferred.id);
        self.add_to_epoch(&info, &preferred, old_secrets, &missing, Stage::RepairMissing)
            .await
    }

    /// Current members of the group, as seen in its preferred epoch.
    pub async fn list_members(
        &self,
        group_id: &GroupId,
    ) -> Result<BTreeSet<FeedId>, ManagerError<S, K, I>> {
        Ok(self.preferred_epoch(group_id).await?.members.current())
    }

    /// Ids of all groups we're a member of.
    pub async fn list_groups(&self) -> Result<Vec<GroupId>, ManagerError<S, K, I>> {
        self.inner
            .keys
            .list_group_ids()
            .await
            .map_err(Self::keys_error(Stage::LoadGroupInfo))
    }

    pub async fn preferred_epoch(&self, group_id: &GroupId) -> Result<Epoch, ManagerError<S, K, I>> {
        Ok(self.selection(group_id).await?.into_preferred())
    }

    /// Preferred epoch of the group, along with the rule which picked it.
    pub async fn selection(&self, group_id: &GroupId) -> Result<Selection, ManagerError<S, K, I>> {
        let info = self.group_info(group_id).await?;
        let graph = self.load_epochs(info.root).await?;
        self.select(&graph, Stage::SelectPreferredEpoch)
    }

    /// All epochs of the group we can read, in causal order.
    pub async fn epochs(&self, group_id: &GroupId) -> Result<Vec<Epoch>, ManagerError<S, K, I>> {
        let info = self.group_info(group_id).await?;
        Ok(self.load_epochs(info.root).await?.epochs())
    }

    /// Returns `true` if a reconciliation of the fork is waiting to fire.
    pub async fn is_reconciling(&self, fork: &Fork) -> bool {
        self.inner.scheduler.is_scheduled(*fork).await
    }

    /// Handle one incoming group message.
    ///
    /// Joins groups we've been invited to and registers keys handed to us. Returns the id of the
    /// group the message belongs to, `None` if it is invalid or of a group we're not part of.
    pub async fn process(
        &self,
        message: &GroupMessage,
    ) -> Result<Option<GroupId>, ManagerError<S, K, I>> {
        if let Err(err) = message.content.validate() {
            warn!(id = %message.id, "skip invalid group message: {err}");
            return Ok(None);
        }

        let group_id = match &message.content {
            GroupContent::AddMember(content) => {
                let Some(group_id) = message.group_id() else {
                    return Ok(None);
                };
                let secrets = std::iter::once(&content.secret).chain(content.old_secrets.iter());

                let info = self
                    .inner
                    .keys
                    .group_info(&group_id)
                    .await
                    .map_err(Self::keys_error(Stage::RegisterGroup))?;

                match info {
                    None => {
                        let local_root = self.local_root().await?;
                        let mut added = message.added().into_iter().flatten();
                        if !added.any(|feed_id| feed_id == local_root) {
                            return Ok(None);
                        }

                        self.inner
                            .keys
                            .add_group_info(&group_id, content.root, content.secret.clone())
                            .await
                            .map_err(Self::keys_error(Stage::RegisterGroup))?;
                        for secret in secrets.skip(1) {
                            self.inner
                                .keys
                                .add_group_key(&group_id, secret.clone())
                                .await
                                .map_err(Self::keys_error(Stage::RegisterGroup))?;
                        }
                        self.reindex(Stage::RegisterGroup).await?;
                        debug!(%group_id, root = %content.root, "joined group");
                    }
                    Some(info) if info.excluded => {
                        trace!(%group_id, id = %message.id, "ignore message of left group");
                        return Ok(None);
                    }
                    Some(info) => {
                        let mut keys_changed = false;
                        for secret in secrets {
                            if !info.has_read_key(secret) {
                                self.inner
                                    .keys
                                    .add_group_key(&group_id, secret.clone())
                                    .await
                                    .map_err(Self::keys_error(Stage::RegisterGroup))?;
                                keys_changed = true;
                            }
                        }
                        if keys_changed {
                            self.reindex(Stage::RegisterGroup).await?;
                        }
                    }
                }
                group_id
            }
            GroupContent::ExcludeMember(_) => {
                let Some(group_id) = message.group_id() else {
                    return Ok(None);
                };
                group_id
            }
            GroupContent::Init(content) => GroupId::cloak(&message.id, &content.group_key),
            GroupContent::InitEpoch(_) => {
                let Some(root) = message.tangle_root(TangleName::Epoch) else {
                    return Ok(None);
                };
                match self.group_by_root(&root).await? {
                    Some(group_id) => group_id,
                    None => return Ok(None),
                }
            }
        };

        self.inner
            .cache
            .write()
            .await
            .insert_message(&group_id, message);
        trace!(
            %group_id,
            id = %message.id,
            content_type = %message.content.content_type(),
            "processed group message"
        );

        Ok(Some(group_id))
    }

    /// Process every message in the store until nothing new becomes readable, then sync all
    /// groups we're part of.
    ///
    /// Every group is synced even if some of them fail, the first failure is returned afterwards.
    pub async fn catch_up(&self) -> Result<(), ManagerError<S, K, I>> {
        let mut seen = HashSet::new();
        loop {
            let messages = self
                .inner
                .store
                .query(&Query::all())
                .await
                .map_err(Self::store_error(Stage::Ingest))?;

            let fresh: Vec<GroupMessage> = messages
                .into_iter()
                .filter(|message| seen.insert(message.id))
                .collect();
            if fresh.is_empty() {
                break;
            }

            for message in &fresh {
                self.process(message).await?;
            }
        }

        // A group failing to sync must not hold back key rotation in the others.
        let mut failed = None;
        for group_id in self.list_groups().await? {
            match self.sync_group(&group_id).await {
                Ok(_) => (),
                Err(GroupsError::Excluded(_)) => debug!(%group_id, "left group after exclusion"),
                Err(err) => {
                    warn!(%group_id, "syncing group failed: {err}");
                    failed.get_or_insert(err);
                }
            }
        }

        match failed {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Process incoming group messages in a background task until shut down.
    pub async fn start(&self) -> Result<JoinHandle<()>, ManagerError<S, K, I>> {
        let mut messages = self
            .inner
            .store
            .subscribe(&Query::all())
            .await
            .map_err(Self::store_error(Stage::Subscribe))?;

        let groups = self.clone();
        let shutdown = self.inner.shutdown.clone();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    message = messages.next() => {
                        let Some(message) = message else {
                            break;
                        };
                        groups.ingest(&message).await;
                    }
                }
            }
            trace!("stopped processing group messages");
        }))
    }

    async fn ingest(&self, message: &GroupMessage) {
        let group_id = match self.process(message).await {
            Ok(Some(group_id)) => group_id,
            Ok(None) => return,
            Err(err) => {
                warn!(id = %message.id, "processing group message failed: {err}");
                return;
            }
        };

        match self.sync_group(&group_id).await {
            Ok(_) => (),
            Err(GroupsError::Excluded(_)) => debug!(%group_id, "left group after exclusion"),
            Err(err) => warn!(%group_id, "syncing group failed: {err}"),
        }
    }

    /// Membership snapshots of an epoch, emitted whenever it grows.
    pub async fn live_members(
        &self,
        epoch_id: MessageId,
    ) -> Result<BoxStream<'static, Members>, ManagerError<S, K, I>> {
        let messages = self
            .inner
            .store
            .subscribe(&Query::members(epoch_id))
            .await
            .map_err(Self::store_error(Stage::Subscribe))?;

        Ok(MembershipAccumulator::new(epoch_id)
            .live(messages)
            .take_until(self.inner.shutdown.clone().cancelled_owned())
            .boxed())
    }

    /// The preferred epoch of a group, starting with the current one and followed by every
    /// change of it.
    pub async fn live_preferred_epoch(
        &self,
        group_id: &GroupId,
    ) -> Result<BoxStream<'static, Epoch>, ManagerError<S, K, I>> {
        let local_root = self.local_root().await?;
        let info = self.group_info(group_id).await?;
        let current = self.preferred_epoch(group_id).await?;
        let messages = self
            .inner
            .store
            .subscribe(&Query::all())
            .await
            .map_err(Self::store_error(Stage::Subscribe))?;

        let (group_id, group_root) = (info.id, info.root);
        let state = (messages, EpochGraph::new(group_root), self.clone());
        let updates = stream::unfold(state, move |(mut messages, mut graph, groups)| async move {
            loop {
                let message = messages.next().await?;
                let belongs = if is_members_event(&message) {
                    message.group_id() == Some(group_id)
                } else {
                    message.tangle_root(TangleName::Epoch) == Some(group_root)
                };
                if !belongs {
                    continue;
                }

                let author = match groups.inner.identity.resolve_root(&message.author).await {
                    Ok(author) => author,
                    Err(err) => {
                        warn!(%group_id, id = %message.id, "can't resolve author: {err}");
                        continue;
                    }
                };
                if !graph.insert(&message, author, &local_root) {
                    continue;
                }

                match select_preferred(&graph.tip_epochs()) {
                    Ok(selection) => {
                        return Some((selection.into_preferred(), (messages, graph, groups)));
                    }
                    Err(err) => trace!(%group_id, "no preferred epoch yet: {err}"),
                }
            }
        });

        Ok(skip_until_caught_up(current.id, updates)
            .take_until(self.inner.shutdown.clone().cancelled_owned())
            .boxed())
    }

    /// Cancel all pending reconciliations and live streams and drop cached tangles.
    pub async fn shutdown(&self) {
        self.inner.scheduler.shutdown().await;
        self.inner.cache.write().await.clear();
        debug!("groups shut down");
    }

    async fn local_root(&self) -> Result<FeedId, ManagerError<S, K, I>> {
        let local_root = self
            .inner
            .local_root
            .get_or_try_init(|| async {
                self.inner
                    .identity
                    .find_or_create_root()
                    .await
                    .map_err(Self::identity_error(Stage::LocalIdentity))
            })
            .await?;
        Ok(*local_root)
    }

    async fn group_info(&self, group_id: &GroupId) -> Result<GroupInfo, ManagerError<S, K, I>> {
        let info = self
            .inner
            .keys
            .group_info(group_id)
            .await
            .map_err(Self::keys_error(Stage::LoadGroupInfo))?;
        info.ok_or(GroupsError::UnknownGroup(*group_id))
    }

    /// Group info of a group we have not been excluded from.
    async fn active_group_info(
        &self,
        group_id: &GroupId,
    ) -> Result<GroupInfo, ManagerError<S, K, I>> {
        let info = self.group_info(group_id).await?;
        if info.excluded {
            return Err(GroupsError::Excluded(*group_id));
        }
        Ok(info)
    }

    async fn group_by_root(
        &self,
        root: &MessageId,
    ) -> Result<Option<GroupId>, ManagerError<S, K, I>> {
        for group_id in self.list_groups().await? {
            if self.group_info(&group_id).await?.root == *root {
                return Ok(Some(group_id));
            }
        }
        Ok(None)
    }

    async fn generate_secret(&self) -> GroupSecret {
        let mut rng = self.inner.rng.lock().await;
        GroupSecret::generate(&mut *rng)
    }

    async fn find_or_create_feed(&self, purpose: &str) -> Result<FeedId, ManagerError<S, K, I>> {
        let feeds = self
            .inner
            .identity
            .sub_feeds(purpose)
            .await
            .map_err(Self::identity_error(Stage::CreateFeed))?;
        if let Some(feed_id) = feeds.first() {
            return Ok(*feed_id);
        }

        trace!(purpose, "create sub-feed");
        self.inner
            .identity
            .create_sub_feed(purpose)
            .await
            .map_err(Self::identity_error(Stage::CreateFeed))
    }

    /// Sub-feed publishing the epoch messages and exclusions of the epoch with the given secret.
    async fn group_feed(&self, secret: &GroupSecret) -> Result<FeedId, ManagerError<S, K, I>> {
        let purpose = format!("group/epoch/{}", Hash::new(secret.as_bytes()).to_hex());
        self.find_or_create_feed(&purpose).await
    }

    async fn reindex(&self, stage: Stage) -> Result<(), ManagerError<S, K, I>> {
        self.inner
            .keys
            .reindex_encrypted()
            .await
            .map_err(Self::keys_error(stage))
    }

    /// Read all epochs of a group and their members tangles from the store.
    async fn load_epochs(&self, group_root: MessageId) -> Result<EpochGraph, ManagerError<S, K, I>> {
        let local_root = self.local_root().await?;
        let epoch_messages = self
            .inner
            .store
            .query(&Query::epochs(group_root))
            .await
            .map_err(Self::store_error(Stage::LoadEpochs))?;

        let mut graph = EpochGraph::new(group_root);
        for message in &epoch_messages {
            let author = self
                .inner
                .identity
                .resolve_root(&message.author)
                .await
                .map_err(Self::identity_error(Stage::ResolveAuthor))?;
            graph.insert(message, author, &local_root);
        }

        for epoch_message in &epoch_messages {
            let members = self
                .inner
                .store
                .query(&Query::members(epoch_message.id))
                .await
                .map_err(Self::store_error(Stage::LoadMembers))?;
            for message in members.iter().filter(|message| is_members_event(message)) {
                if let Err(err) = graph.insert_members(message) {
                    warn!(%group_root, id = %message.id, "skip invalid members message: {err}");
                }
            }
        }

        trace!(%group_root, epochs = graph.len(), "loaded epochs");
        Ok(graph)
    }

    fn select(
        &self,
        graph: &EpochGraph,
        stage: Stage,
    ) -> Result<Selection, ManagerError<S, K, I>> {
        select_preferred(&graph.tip_epochs()).map_err(Self::fork_error(stage))
    }

    /// Tips of a tangle of the group, read from the store once and cached afterwards.
    async fn tangle_tips(
        &self,
        group_id: &GroupId,
        name: TangleName,
        root: MessageId,
    ) -> Result<Vec<MessageId>, ManagerError<S, K, I>> {
        if let Some(tips) = self.inner.cache.read().await.tips(group_id, name, root) {
            if !tips.is_empty() {
                return Ok(tips);
            }
        }

        let messages = self
            .inner
            .store
            .query(&Query {
                tangle: Some((name, root)),
                ..Default::default()
            })
            .await
            .map_err(Self::store_error(Stage::LoadTangle))?;

        let nodes = messages
            .iter()
            .filter_map(|message| link_node(message, name))
            .map(|(_, node)| node);
        Ok(self
            .inner
            .cache
            .write()
            .await
            .load(*group_id, name, root, nodes))
    }

    /// Fit the content into the size budget, publish it and record it in the cached tangles.
    async fn publish(
        &self,
        group_id: &GroupId,
        author: &FeedId,
        mut content: GroupContent,
        key: &GroupSecret,
        stage: Stage,
    ) -> Result<MessageId, ManagerError<S, K, I>> {
        let budget = self.inner.config.size_budget().for_content(&content);
        let removed = {
            let mut rng = self.inner.rng.lock().await;
            prune_previous(&mut content, budget, &mut *rng).map_err(Self::publish_error(stage))?
        };
        if removed > 0 {
            debug!(%group_id, removed, budget, "pruned previous to fit size budget");
        }

        let (id, content) = publish_with_retry(&self.inner.store, author, content, key)
            .await
            .map_err(Self::store_error(stage))?;

        let message = GroupMessage {
            id,
            author: *author,
            content,
            read_key: Some(key.clone()),
        };
        self.inner
            .cache
            .write()
            .await
            .insert_message(group_id, &message);
        trace!(%group_id, %id, content_type = %message.content.content_type(), "published");

        Ok(id)
    }

    /// Publish `group/add-member` messages into the epoch, batched to fit the envelope.
    async fn add_to_epoch(
        &self,
        info: &GroupInfo,
        epoch: &Epoch,
        old_secrets: Vec<GroupSecret>,
        feed_ids: &[FeedId],
        stage: Stage,
    ) -> Result<Vec<MessageId>, ManagerError<S, K, I>> {
        let build = |batch: &[FeedId], previous: Vec<MessageId>| {
            GroupContent::add_member(
                info.id,
                info.root,
                epoch.secret.clone(),
                batch,
                epoch.id,
                previous,
            )
            .with_old_secrets(old_secrets.clone())
        };

        let budget = self.inner.config.size_budget();
        let max_feeds = self.inner.config.max_recipients().saturating_sub(1);
        let batches = batch_members(feed_ids, max_feeds, &budget, |batch| {
            build(batch, vec![epoch.id])
        })
        .map_err(Self::publish_error(stage))?;

        let author = self.find_or_create_feed(ADDITIONS_FEED_PURPOSE).await?;
        let mut ids = Vec::with_capacity(batches.len());
        for batch in batches {
            let previous = self
                .tangle_tips(&info.id, TangleName::Members, epoch.id)
                .await?;
            let id = self
                .publish(&info.id, &author, build(&batch, previous), &epoch.secret, stage)
                .await?;
            debug!(group_id = %info.id, epoch = %epoch.id, members = batch.len(), "added members");
            ids.push(id);
        }

        Ok(ids)
    }

    /// Announce the exclusion in the epoch, then start a new epoch without the excluded members.
    async fn exclude_from_epoch(
        &self,
        info: &GroupInfo,
        graph: &EpochGraph,
        epoch: &Epoch,
        excludes: &BTreeSet<FeedId>,
    ) -> Result<MessageId, ManagerError<S, K, I>> {
        let local_root = self.local_root().await?;

        let feed_id = self.group_feed(&epoch.secret).await?;
        let previous = self
            .tangle_tips(&info.id, TangleName::Members, epoch.id)
            .await?;
        let content = GroupContent::exclude_member(
            info.id,
            excludes.iter().copied().collect(),
            epoch.id,
            previous,
        );
        self.publish(
            &info.id,
            &feed_id,
            content,
            &epoch.secret,
            Stage::PublishExcludeMember,
        )
        .await?;

        let secret = self.generate_secret().await;
        let feed_id = self.group_feed(&secret).await?;
        let tips = graph.tip_ids();
        let content = GroupContent::init_epoch(secret.clone(), info.root, tips.clone());
        let epoch_id = self
            .publish(
                &info.id,
                &feed_id,
                content,
                &secret,
                Stage::PublishInitEpoch,
            )
            .await?;

        self.inner
            .keys
            .add_group_key(&info.id, secret.clone())
            .await
            .map_err(Self::keys_error(Stage::RotateKeys))?;
        self.inner
            .keys
            .pick_group_write_key(&info.id, secret.clone())
            .await
            .map_err(Self::keys_error(Stage::RotateKeys))?;
        self.reindex(Stage::RotateKeys).await?;
        debug!(
            group_id = %info.id,
            from = %epoch.id,
            to = %epoch_id,
            excluded = excludes.len(),
            "started new epoch"
        );

        let new_epoch = Epoch {
            id: epoch_id,
            previous: tips,
            author: local_root,
            secret,
            members: Members::default(),
        };
        let remaining: Vec<FeedId> = epoch
            .members
            .current()
            .difference(excludes)
            .copied()
            .collect();
        // Everything connected is an ancestor of the new epoch.
        let old_secrets = graph
            .epochs()
            .into_iter()
            .map(|ancestor| ancestor.secret)
            .collect();
        self.add_to_epoch(
            info,
            &new_epoch,
            old_secrets,
            &remaining,
            Stage::PublishAddMember,
        )
        .await?;

        Ok(epoch_id)
    }

    async fn schedule_reconcile(&self, group_id: GroupId, fork: Fork) {
        let groups = self.clone();
        let scheduled = self
            .inner
            .scheduler
            .schedule(fork, move || async move {
                match groups.reconcile(&group_id, fork).await {
                    Ok(Some(epoch_id)) => {
                        debug!(%group_id, %fork, epoch = %epoch_id, "reconciled epoch fork")
                    }
                    Ok(None) => (),
                    Err(err) => warn!(%group_id, %fork, "reconciliation failed: {err}"),
                }
            })
            .await;

        if !scheduled {
            trace!(%group_id, %fork, "reconciliation not scheduled");
        }
    }

    async fn schedule_repair(&self, group_id: GroupId, epoch: MessageId) {
        let groups = self.clone();
        let scheduled = self
            .inner
            .scheduler
            .schedule(Task::RepairMissing { group_id, epoch }, move || async move {
                match groups.fix_missing_members(&group_id).await {
                    Ok(ids) if !ids.is_empty() => {
                        debug!(%group_id, %epoch, messages = ids.len(), "repaired missing members")
                    }
                    Ok(_) | Err(GroupsError::Excluded(_)) => (),
                    Err(err) => {
                        warn!(%group_id, %epoch, "repairing missing members failed: {err}")
                    }
                }
            })
            .await;

        if !scheduled {
            trace!(%group_id, %epoch, "repair not scheduled");
        }
    }

    fn store_error(stage: Stage) -> impl FnOnce(S::Error) -> ManagerError<S, K, I> {
        ManagerError::<S, K, I>::store(stage)
    }

    fn keys_error(stage: Stage) -> impl FnOnce(K::Error) -> ManagerError<S, K, I> {
        ManagerError::<S, K, I>::keys(stage)
    }

    fn identity_error(stage: Stage) -> impl FnOnce(I::Error) -> ManagerError<S, K, I> {
        ManagerError::<S, K, I>::identity(stage)
    }

    fn fork_error(stage: Stage) -> impl FnOnce(SelectError) -> ManagerError<S, K, I> {
        ManagerError::<S, K, I>::fork(stage)
    }

    fn publish_error(stage: Stage) -> impl FnOnce(PublishError) -> ManagerError<S, K, I> {
        ManagerError::<S, K, I>::publish(stage)
    }
}

/// Members which should be part of the preferred epoch but were never added to it.
///
/// Members excluded anywhere on the way to the preferred epoch stay out.
fn missing_in_preferred(graph: &EpochGraph, preferred: &Epoch) -> BTreeSet<FeedId> {
    let excluded = graph.excluded_in_ancestry(&preferred.id);
    find_missing_members(graph)
        .into_iter()
        .flat_map(|missing| missing.missing)
        .filter(|feed_id| {
            !preferred.members.added.contains(feed_id) && !excluded.contains(feed_id)
        })
        .collect()
}

/// Secrets of every epoch preceding the given one.
fn ancestor_secrets(graph: &EpochGraph, epoch_id: &MessageId) -> Vec<GroupSecret> {
    graph
        .predecessor_epochs(epoch_id)
        .into_iter()
        .map(|epoch| epoch.secret)
        .collect()
}
