// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deterministic choice of one preferred epoch among the tips of the epoch tangle.
//!
//! Every peer holding the same epochs arrives at the same choice, no matter in which order the
//! messages were received:
//!
//! - One tip is preferred as is.
//! - Two tips with equal membership: the one whose secret sorts first as lowercase hex wins.
//! - Two tips where one membership is a strict subset of the other: the subset wins.
//! - Two tips with overlapping membership: the secret tie-break picks an interim winner, the fork
//!   needs to be reconciled by a new epoch.
//! - Two tips without any common member, or more than two tips, can't be resolved.
use std::cmp::Ordering;
use std::future;

use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tribes_core::MessageId;

use crate::epoch::Epoch;
use crate::reconcile::Fork;

/// Outcome of the preferred epoch selection, naming the rule which decided it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selection {
    Single(Epoch),
    SameMembers { preferred: Epoch, other: Epoch },
    Subset { preferred: Epoch, other: Epoch },
    Overlapping { preferred: Epoch, other: Epoch },
}

impl Selection {
    pub fn preferred(&self) -> &Epoch {
        match self {
            Selection::Single(preferred)
            | Selection::SameMembers { preferred, .. }
            | Selection::Subset { preferred, .. }
            | Selection::Overlapping { preferred, .. } => preferred,
        }
    }

    pub fn into_preferred(self) -> Epoch {
        match self {
            Selection::Single(preferred)
            | Selection::SameMembers { preferred, .. }
            | Selection::Subset { preferred, .. }
            | Selection::Overlapping { preferred, .. } => preferred,
        }
    }

    /// The fork which needs a reconciling epoch, if any.
    pub fn fork(&self) -> Option<Fork> {
        match self {
            Selection::Overlapping { preferred, other } => Some(Fork::new(preferred.id, other.id)),
            _ => None,
        }
    }

    pub fn needs_reconciliation(&self) -> bool {
        matches!(self, Selection::Overlapping { .. })
    }
}

/// Pick the preferred epoch among the given tip epochs.
pub fn select_preferred(tips: &[Epoch]) -> Result<Selection, SelectError> {
    let (a, b) = match tips {
        [] => return Err(SelectError::NoTips),
        [single] => return Ok(Selection::Single(single.clone())),
        [a, b] => (a, b),
        _ => return Err(SelectError::TooManyTips(tips.len())),
    };

    let (a_members, b_members) = (&a.members.added, &b.members.added);

    if a_members == b_members {
        let (preferred, other) = tie_break(a, b);
        return Ok(Selection::SameMembers { preferred, other });
    }

    if a_members.is_subset(b_members) {
        return Ok(Selection::Subset {
            preferred: a.clone(),
            other: b.clone(),
        });
    }

    if b_members.is_subset(a_members) {
        return Ok(Selection::Subset {
            preferred: b.clone(),
            other: a.clone(),
        });
    }

    if a_members.is_disjoint(b_members) {
        return Err(SelectError::DisjointMembership(a.id, b.id));
    }

    let (preferred, other) = tie_break(a, b);
    Ok(Selection::Overlapping { preferred, other })
}

/// Order two epochs by the hex representation of their secrets.
///
/// Equal secrets fall back to the epoch id so the order stays total.
fn tie_break(a: &Epoch, b: &Epoch) -> (Epoch, Epoch) {
    let order = a
        .secret
        .to_hex()
        .cmp(&b.secret.to_hex())
        .then_with(|| a.id.cmp(&b.id));

    match order {
        Ordering::Greater => (b.clone(), a.clone()),
        Ordering::Less | Ordering::Equal => (a.clone(), b.clone()),
    }
}

/// Suppress replayed preferred epochs of a live stream until it reached the current one.
///
/// Live stores replay all history first, which would yield every past transition to a late
/// subscriber. `current` is the preferred epoch computed at subscription time, it is the first
/// item coming out of this stream. Afterwards an item is only yielded when the preferred epoch
/// changes.
pub fn skip_until_caught_up(
    current: MessageId,
    updates: impl Stream<Item = Epoch>,
) -> impl Stream<Item = Epoch> {
    updates
        .skip_while(move |epoch| future::ready(epoch.id != current))
        .scan(None, |last: &mut Option<MessageId>, epoch| {
            let changed = *last != Some(epoch.id);
            *last = Some(epoch.id);
            future::ready(Some(changed.then_some(epoch)))
        })
        .filter_map(future::ready)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectError {
    #[error("epoch tangle has no tips")]
    NoTips,

    #[error("can't resolve fork of {0} concurrent epochs")]
    TooManyTips(usize),

    #[error("can't resolve fork of epochs {0} and {1} without common members")]
    DisjointMembership(MessageId, MessageId),
}
