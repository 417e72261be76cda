// SPDX-License-Identifier: MIT OR Apache-2.0

//! Keeping outgoing group messages within the size limit of the encrypted envelope.
//!
//! Tangle-linked messages may point at many tips when lots of members wrote concurrently. Their
//! `previous` list is shuffled and cut down until the message fits, shuffling spreads the merged
//! tips over all writers so the tangle still converges. Should the store reject the message
//! anyhow, `previous` gets halved until it is accepted.
use rand::Rng;
use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::{debug, trace};
use tribes_core::cbor::{EncodeError, encoded_size};
use tribes_core::{FeedId, GroupSecret, MessageId};

use crate::message::GroupContent;
use crate::traits::MessageStore;

/// Size limits of the encrypted envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeBudget {
    many: usize,
    one: usize,
}

impl SizeBudget {
    pub fn new(many: usize, one: usize) -> Self {
        Self { many, one }
    }

    /// Maximum encoded content size for a message with the given number of recipients.
    pub fn for_recipients(&self, recipients: usize) -> usize {
        if recipients > 1 { self.many } else { self.one }
    }

    pub fn for_content(&self, content: &GroupContent) -> usize {
        self.for_recipients(content.recipients_len())
    }
}

/// Remove the minimal number of `previous` entries so the content fits the budget.
///
/// Returns the number of removed entries. At least one entry is always kept, if even that does
/// not fit the content is rejected.
pub fn prune_previous<R: Rng>(
    content: &mut GroupContent,
    budget: usize,
    rng: &mut R,
) -> Result<usize, PublishError> {
    let size = encoded_size(&*content)?;
    if size <= budget {
        return Ok(0);
    }

    let Some(previous) = content.previous_mut() else {
        return Err(PublishError::TooLarge { size, budget });
    };
    previous.shuffle(rng);
    let all = std::mem::take(previous);
    let total = all.len();

    if total == 0 || !fits_with(content, &all[..1], budget)? {
        set_previous(content, &all[..total.min(1)]);
        let size = encoded_size(&*content)?;
        return Err(PublishError::TooLarge { size, budget });
    }

    // Size grows with the number of kept entries, search for the longest prefix which fits.
    let (mut low, mut high) = (1, total);
    while low < high {
        let mid = (low + high).div_ceil(2);
        if fits_with(content, &all[..mid], budget)? {
            low = mid;
        } else {
            high = mid - 1;
        }
    }

    set_previous(content, &all[..low]);
    trace!(
        kept = low,
        removed = total - low,
        budget,
        "pruned previous of {}",
        content.content_type()
    );
    Ok(total - low)
}

fn fits_with(
    content: &mut GroupContent,
    previous: &[MessageId],
    budget: usize,
) -> Result<bool, PublishError> {
    set_previous(content, previous);
    Ok(encoded_size(&*content)? <= budget)
}

fn set_previous(content: &mut GroupContent, previous: &[MessageId]) {
    if let Some(current) = content.previous_mut() {
        current.clear();
        current.extend_from_slice(previous);
    }
}

/// Cut `previous` in half. Returns `false` if it can't get any shorter without becoming empty.
pub fn halve_previous(content: &mut GroupContent) -> bool {
    match content.previous_mut() {
        Some(previous) if previous.len() > 1 => {
            let keep = previous.len() / 2;
            previous.truncate(keep);
            true
        }
        _ => false,
    }
}

/// Publish through the store, halving `previous` whenever the store rejects the message.
///
/// Returns the id of the message and the content as it was finally published. The last store
/// error is returned once `previous` can't be shortened any further.
pub async fn publish_with_retry<S: MessageStore>(
    store: &S,
    author: &FeedId,
    mut content: GroupContent,
    key: &GroupSecret,
) -> Result<(MessageId, GroupContent), S::Error> {
    loop {
        match store.publish(author, &content, key).await {
            Ok(id) => return Ok((id, content)),
            Err(err) => {
                if !halve_previous(&mut content) {
                    return Err(err);
                }
                debug!(
                    content_type = %content.content_type(),
                    "store rejected message, retry with halved previous: {err}"
                );
            }
        }
    }
}

/// Split members into batches fitting one add-member message each.
///
/// A batch holds at most `max_feeds` feeds and `build` applied to it has to fit into the budget.
pub fn batch_members<F>(
    members: &[FeedId],
    max_feeds: usize,
    budget: &SizeBudget,
    build: F,
) -> Result<Vec<Vec<FeedId>>, PublishError>
where
    F: Fn(&[FeedId]) -> GroupContent,
{
    let max_feeds = max_feeds.max(1);
    let mut batches = Vec::new();
    let mut batch: Vec<FeedId> = Vec::new();

    for member in members {
        batch.push(*member);
        if batch.len() > max_feeds || !fits(&build(&batch), budget)? {
            batch.pop();
            if batch.is_empty() {
                let content = build(&[*member]);
                let size = encoded_size(&content)?;
                return Err(PublishError::TooLarge {
                    size,
                    budget: budget.for_content(&content),
                });
            }
            batches.push(std::mem::take(&mut batch));
            batch.push(*member);
        }
    }

    if !batch.is_empty() {
        batches.push(batch);
    }
    Ok(batches)
}

fn fits(content: &GroupContent, budget: &SizeBudget) -> Result<bool, PublishError> {
    Ok(encoded_size(&*content)? <= budget.for_content(content))
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("message of {size} bytes does not fit into {budget} bytes")]
    TooLarge { size: usize, budget: usize },

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use tribes_core::cbor::encoded_size;
    use tribes_core::{FeedId, GroupId, GroupSecret, Hash, MessageId};

    use super::{SizeBudget, batch_members, halve_previous, prune_previous};
    use crate::config::{MAX_CONTENT_SIZE_MANY_RECPS, MAX_RECIPIENTS};
    use crate::message::GroupContent;
    use crate::test_utils::messages::feed;

    fn add_member(previous: Vec<MessageId>, members: &[FeedId]) -> GroupContent {
        let root = Hash::new("root");
        let secret = GroupSecret::from_bytes([1; 32]);
        GroupContent::add_member(
            GroupId::cloak(&root, &secret),
            root,
            secret,
            members,
            root,
            previous,
        )
    }

    fn previous_len(content: &mut GroupContent) -> usize {
        content.previous_mut().map(|previous| previous.len()).unwrap_or(0)
    }

    #[test]
    fn prunes_thousands_of_previous() {
        let members: Vec<FeedId> = (1..MAX_RECIPIENTS as u8).map(feed).collect();
        let mut content = add_member(vec![Hash::new("tip"); 4000], &members);
        assert_eq!(content.recipients_len(), 16);

        let mut rng = ChaCha20Rng::from_seed([1; 32]);
        let removed = prune_previous(&mut content, MAX_CONTENT_SIZE_MANY_RECPS, &mut rng).unwrap();

        let kept = previous_len(&mut content);
        assert!(kept > 0);
        assert_eq!(kept + removed, 4000);
        assert!(encoded_size(&content).unwrap() <= MAX_CONTENT_SIZE_MANY_RECPS);

        // Keeping a single entry more would not fit anymore.
        let one_more = add_member(vec![Hash::new("tip"); kept + 1], &members);
        assert!(encoded_size(&one_more).unwrap() > MAX_CONTENT_SIZE_MANY_RECPS);
    }

    #[test]
    fn small_messages_stay_untouched() {
        let previous: Vec<MessageId> = (0..5).map(|i: u8| Hash::new([i])).collect();
        let mut content = add_member(previous.clone(), &[feed(1)]);

        let mut rng = ChaCha20Rng::from_seed([1; 32]);
        assert_eq!(prune_previous(&mut content, 6_041, &mut rng).unwrap(), 0);
        assert_eq!(content.previous_mut().cloned(), Some(previous));
    }

    #[test]
    fn keeps_at_least_one_previous() {
        let mut content = add_member(vec![Hash::new("tip"); 10], &[feed(1)]);
        let mut rng = ChaCha20Rng::from_seed([1; 32]);
        assert!(prune_previous(&mut content, 10, &mut rng).is_err());
        assert_eq!(previous_len(&mut content), 1);
    }

    #[test]
    fn halving() {
        let mut content = add_member(vec![Hash::new("tip"); 5], &[feed(1)]);
        assert!(halve_previous(&mut content));
        assert_eq!(previous_len(&mut content), 2);
        assert!(halve_previous(&mut content));
        assert_eq!(previous_len(&mut content), 1);
        assert!(!halve_previous(&mut content));

        let mut init = GroupContent::init(GroupSecret::from_bytes([1; 32]));
        assert!(!halve_previous(&mut init));
    }

    #[test]
    fn batches_by_recipient_limit() {
        let members: Vec<FeedId> = (1..=40).map(feed).collect();
        let budget = SizeBudget::new(MAX_CONTENT_SIZE_MANY_RECPS, 6_041);

        let batches = batch_members(&members, MAX_RECIPIENTS - 1, &budget, |batch| {
            add_member(vec![Hash::new("tip")], batch)
        })
        .unwrap();

        assert_eq!(
            batches.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![15, 15, 10]
        );
        assert_eq!(batches.concat(), members);
    }

    #[test]
    fn batches_by_size() {
        let members: Vec<FeedId> = (1..=6).map(feed).collect();
        let single = encoded_size(&add_member(vec![Hash::new("tip")], &members[..2])).unwrap();
        let budget = SizeBudget::new(single, single);

        let batches = batch_members(&members, 15, &budget, |batch| {
            add_member(vec![Hash::new("tip")], batch)
        })
        .unwrap();
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|batch| batch.len() == 2));
    }
}
