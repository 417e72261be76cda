// SPDX-License-Identifier: MIT OR Apache-2.0

//! Randomly delayed reconciliation of overlapping epoch forks and repair of missing members.
//!
//! All members observing such a fork could issue the corrective exclusion themselves. Waiting a
//! random time first gives the message of whoever fires first the chance to replicate, so
//! usually only one member publishes the reconciling epoch. Re-adding members left out of an
//! epoch is delayed the same way.
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rand_chacha::ChaCha20Rng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use tribes_core::{GroupId, MessageId};

/// Two concurrent tip epochs, independent of the order they were named in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fork(MessageId, MessageId);

impl Fork {
    pub fn new(a: MessageId, b: MessageId) -> Self {
        if a <= b { Self(a, b) } else { Self(b, a) }
    }

    pub fn epochs(&self) -> (MessageId, MessageId) {
        (self.0, self.1)
    }

    /// Returns `true` if the given tips are exactly the two epochs of this fork.
    pub fn matches(&self, tips: &[MessageId]) -> bool {
        match tips {
            [a, b] => Fork::new(*a, *b) == *self,
            _ => false,
        }
    }
}

impl fmt::Display for Fork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.0, self.1)
    }
}

/// Corrective action waiting for its timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Task {
    /// Join two overlapping tip epochs.
    Reconcile(Fork),

    /// Re-add members missing in the preferred epoch of a group.
    RepairMissing { group_id: GroupId, epoch: MessageId },
}

impl From<Fork> for Task {
    fn from(fork: Fork) -> Self {
        Task::Reconcile(fork)
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Reconcile(fork) => write!(f, "reconcile {fork}"),
            Task::RepairMissing { group_id, epoch } => {
                write!(f, "repair {group_id} in epoch {epoch}")
            }
        }
    }
}

struct SchedulerInner {
    rng: ChaCha20Rng,
    min_delay: Duration,
    max_delay: Duration,
    timers: HashMap<Task, JoinHandle<()>>,
}

/// Single-shot timers, one per task, all tied to one cancellation token.
#[derive(Clone)]
pub struct ReconcileScheduler {
    inner: Arc<Mutex<SchedulerInner>>,
    shutdown: CancellationToken,
}

impl ReconcileScheduler {
    pub fn new(
        min_delay: Duration,
        max_delay: Duration,
        rng: ChaCha20Rng,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SchedulerInner {
                rng,
                min_delay,
                max_delay,
                timers: HashMap::new(),
            })),
            shutdown,
        }
    }

    /// Run `run` for the task after a random delay.
    ///
    /// Returns `false` without doing anything if a timer for this task is still running or the
    /// scheduler has been shut down.
    pub async fn schedule<F, Fut>(&self, task: impl Into<Task>, run: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = task.into();
        if self.shutdown.is_cancelled() {
            return false;
        }

        let mut inner = self.inner.lock().await;
        inner.timers.retain(|_, handle| !handle.is_finished());
        if inner.timers.contains_key(&task) {
            trace!(%task, "already scheduled");
            return false;
        }

        let delay = inner.random_delay();
        debug!(%task, delay_ms = delay.as_millis(), "schedule task");

        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    trace!(%task, "task cancelled");
                }
                _ = async {
                    tokio::time::sleep(delay).await;
                    run().await;
                } => {}
            }
        });
        inner.timers.insert(task, handle);
        true
    }

    /// Returns `true` if a timer for the task is waiting or running.
    pub async fn is_scheduled(&self, task: impl Into<Task>) -> bool {
        let task = task.into();
        let inner = self.inner.lock().await;
        inner
            .timers
            .get(&task)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Cancel all timers, none of them fires afterwards.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut inner = self.inner.lock().await;
        for (_, handle) in inner.timers.drain() {
            handle.abort();
        }
    }
}

impl SchedulerInner {
    fn random_delay(&mut self) -> Duration {
        if self.min_delay >= self.max_delay {
            return self.min_delay;
        }

        let millis = self
            .rng
            .random_range::<u128, _>(self.min_delay.as_millis()..=self.max_delay.as_millis());
        Duration::from_millis(millis as u64)
    }
}
