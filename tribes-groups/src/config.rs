// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::publish::SizeBudget;

/// Maximum encoded content size of a message addressed to more than one recipient.
pub const MAX_CONTENT_SIZE_MANY_RECPS: usize = 5_546;

/// Maximum encoded content size of a message addressed to exactly one recipient.
pub const MAX_CONTENT_SIZE_ONE_RECP: usize = 6_041;

/// Maximum number of recipients of one encrypted envelope, group id included.
pub const MAX_RECIPIENTS: usize = 16;

/// Configuration of a groups instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Lower bound of the random delay before an overlapping fork gets reconciled.
    pub(crate) reconcile_min_delay: Duration,

    /// Upper bound of the random delay before an overlapping fork gets reconciled.
    ///
    /// Peers observing the same fork pick different delays from this range, so usually only one
    /// of them issues the corrective exclusion.
    pub(crate) reconcile_max_delay: Duration,

    /// Content size limit when a message has more than one recipient.
    pub(crate) max_content_size_many: usize,

    /// Content size limit when a message has exactly one recipient.
    pub(crate) max_content_size_one: usize,

    /// Recipient limit of the envelope, group id included.
    pub(crate) max_recipients: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reconcile_min_delay: Duration::from_secs(10),
            reconcile_max_delay: Duration::from_secs(120),
            max_content_size_many: MAX_CONTENT_SIZE_MANY_RECPS,
            max_content_size_one: MAX_CONTENT_SIZE_ONE_RECP,
            max_recipients: MAX_RECIPIENTS,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the range the reconciliation delay is drawn from.
    ///
    /// Bounds given in the wrong order are swapped.
    pub fn with_reconcile_delay(mut self, min: Duration, max: Duration) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        self.reconcile_min_delay = min;
        self.reconcile_max_delay = max;
        self
    }

    pub fn with_max_recipients(mut self, max_recipients: usize) -> Self {
        // The group id itself always takes one slot.
        self.max_recipients = max_recipients.max(2);
        self
    }

    pub fn reconcile_delay(&self) -> (Duration, Duration) {
        (self.reconcile_min_delay, self.reconcile_max_delay)
    }

    /// Recipient limit, never below two even if deserialized from a smaller value.
    pub fn max_recipients(&self) -> usize {
        self.max_recipients.max(2)
    }

    pub fn size_budget(&self) -> SizeBudget {
        SizeBudget::new(self.max_content_size_many, self.max_content_size_one)
    }
}
