// SPDX-License-Identifier: MIT OR Apache-2.0

//! Message content types for group administration and their shape validation.
//!
//! Four message types make up the administrative history of a group:
//!
//! - `group/init` creates the group. Its id is the group root and also the id of the root epoch.
//! - `group/init-epoch` creates a new epoch with a fresh key, linked into the epoch tangle.
//! - `group/add-member` hands the epoch key to new members, linked into the members tangle of
//!   that epoch.
//! - `group/exclude-member` announces who is about to be excluded from an epoch, also linked into
//!   its members tangle.
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tribes_core::{FeedId, GroupId, GroupSecret, MessageId, TangleError};

/// Type tag of group administration messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentType {
    #[serde(rename = "group/init")]
    Init,
    #[serde(rename = "group/init-epoch")]
    InitEpoch,
    #[serde(rename = "group/add-member")]
    AddMember,
    #[serde(rename = "group/exclude-member")]
    ExcludeMember,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Init => "group/init",
            ContentType::InitEpoch => "group/init-epoch",
            ContentType::AddMember => "group/add-member",
            ContentType::ExcludeMember => "group/exclude-member",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Names of the tangles group messages can be part of.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TangleName {
    Group,
    Epoch,
    Members,
}

/// Position of a message in one tangle.
///
/// Both fields are `None` for the message starting the tangle.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TangleLinks {
    pub root: Option<MessageId>,
    pub previous: Option<Vec<MessageId>>,
}

impl TangleLinks {
    /// Links of the message starting a tangle.
    pub fn start() -> Self {
        Self::default()
    }

    pub fn new(root: MessageId, previous: Vec<MessageId>) -> Self {
        Self {
            root: Some(root),
            previous: Some(previous),
        }
    }

    fn is_start(&self) -> bool {
        self.root.is_none() && self.previous.is_none()
    }

    fn is_linked(&self) -> bool {
        self.root.is_some() && self.previous.as_ref().is_some_and(|previous| !previous.is_empty())
    }
}

/// Recipient of an encrypted group message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recipient {
    Group(GroupId),
    Feed(FeedId),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitTangles {
    pub group: TangleLinks,
    pub epoch: TangleLinks,
    pub members: TangleLinks,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitContent {
    #[serde(rename = "groupKey")]
    pub group_key: GroupSecret,
    pub tangles: InitTangles,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitEpochTangles {
    pub epoch: TangleLinks,
    pub members: TangleLinks,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitEpochContent {
    #[serde(rename = "groupKey")]
    pub group_key: GroupSecret,
    pub tangles: InitEpochTangles,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembersTangles {
    pub members: TangleLinks,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddMemberContent {
    pub recps: Vec<Recipient>,
    pub secret: GroupSecret,
    /// Root message of the group.
    pub root: MessageId,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub text: Option<String>,
    /// Secrets of the epochs preceding the one the members are added to.
    ///
    /// Without them new members could not read the epoch history and connect their epoch to the
    /// group root.
    #[serde(rename = "oldSecrets", skip_serializing_if = "Vec::is_empty", default)]
    pub old_secrets: Vec<GroupSecret>,
    pub tangles: MembersTangles,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludeMemberContent {
    pub excludes: Vec<FeedId>,
    pub recps: Vec<Recipient>,
    pub tangles: MembersTangles,
}

/// Content of a group administration message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GroupContent {
    #[serde(rename = "group/init")]
    Init(InitContent),
    #[serde(rename = "group/init-epoch")]
    InitEpoch(InitEpochContent),
    #[serde(rename = "group/add-member")]
    AddMember(AddMemberContent),
    #[serde(rename = "group/exclude-member")]
    ExcludeMember(ExcludeMemberContent),
}

impl GroupContent {
    pub fn init(group_key: GroupSecret) -> Self {
        GroupContent::Init(InitContent {
            group_key,
            tangles: InitTangles {
                group: TangleLinks::start(),
                epoch: TangleLinks::start(),
                members: TangleLinks::start(),
            },
        })
    }

    pub fn init_epoch(group_key: GroupSecret, root: MessageId, previous: Vec<MessageId>) -> Self {
        GroupContent::InitEpoch(InitEpochContent {
            group_key,
            tangles: InitEpochTangles {
                epoch: TangleLinks::new(root, previous),
                members: TangleLinks::start(),
            },
        })
    }

    pub fn add_member(
        group_id: GroupId,
        root: MessageId,
        secret: GroupSecret,
        members: &[FeedId],
        epoch: MessageId,
        previous: Vec<MessageId>,
    ) -> Self {
        let mut recps = Vec::with_capacity(members.len() + 1);
        recps.push(Recipient::Group(group_id));
        recps.extend(members.iter().copied().map(Recipient::Feed));

        GroupContent::AddMember(AddMemberContent {
            recps,
            secret,
            root,
            text: None,
            old_secrets: Vec::new(),
            tangles: MembersTangles {
                members: TangleLinks::new(epoch, previous),
            },
        })
    }

    pub fn exclude_member(
        group_id: GroupId,
        excludes: Vec<FeedId>,
        epoch: MessageId,
        previous: Vec<MessageId>,
    ) -> Self {
        GroupContent::ExcludeMember(ExcludeMemberContent {
            excludes,
            recps: vec![Recipient::Group(group_id)],
            tangles: MembersTangles {
                members: TangleLinks::new(epoch, previous),
            },
        })
    }

    /// Hand the secrets of preceding epochs to the added members, no-op for other content.
    pub fn with_old_secrets(mut self, secrets: Vec<GroupSecret>) -> Self {
        if let GroupContent::AddMember(content) = &mut self {
            content.old_secrets = secrets;
        }
        self
    }

    pub fn content_type(&self) -> ContentType {
        match self {
            GroupContent::Init(_) => ContentType::Init,
            GroupContent::InitEpoch(_) => ContentType::InitEpoch,
            GroupContent::AddMember(_) => ContentType::AddMember,
            GroupContent::ExcludeMember(_) => ContentType::ExcludeMember,
        }
    }

    /// Links of this message in the given tangle, if it is part of it.
    pub fn tangle(&self, name: TangleName) -> Option<&TangleLinks> {
        match (self, name) {
            (GroupContent::Init(content), TangleName::Group) => Some(&content.tangles.group),
            (GroupContent::Init(content), TangleName::Epoch) => Some(&content.tangles.epoch),
            (GroupContent::Init(content), TangleName::Members) => Some(&content.tangles.members),
            (GroupContent::InitEpoch(content), TangleName::Epoch) => Some(&content.tangles.epoch),
            (GroupContent::InitEpoch(content), TangleName::Members) => {
                Some(&content.tangles.members)
            }
            (GroupContent::AddMember(content), TangleName::Members) => {
                Some(&content.tangles.members)
            }
            (GroupContent::ExcludeMember(content), TangleName::Members) => {
                Some(&content.tangles.members)
            }
            _ => None,
        }
    }

    /// The `previous` list the size pruner shrinks.
    pub(crate) fn previous_mut(&mut self) -> Option<&mut Vec<MessageId>> {
        let links = match self {
            GroupContent::Init(_) => return None,
            GroupContent::InitEpoch(content) => &mut content.tangles.epoch,
            GroupContent::AddMember(content) => &mut content.tangles.members,
            GroupContent::ExcludeMember(content) => &mut content.tangles.members,
        };
        links.previous.as_mut()
    }

    pub fn recipients(&self) -> &[Recipient] {
        match self {
            GroupContent::AddMember(content) => &content.recps,
            GroupContent::ExcludeMember(content) => &content.recps,
            GroupContent::Init(_) | GroupContent::InitEpoch(_) => &[],
        }
    }

    /// Number of recipients the envelope of this message is encrypted to.
    ///
    /// Epoch messages are encrypted to the epoch key only, which counts as one recipient.
    pub fn recipients_len(&self) -> usize {
        self.recipients().len().max(1)
    }

    /// Check the message against the shape expected for its type.
    pub fn validate(&self) -> Result<(), MessageError> {
        match self {
            GroupContent::Init(content) => {
                let tangles = &content.tangles;
                if !(tangles.group.is_start() && tangles.epoch.is_start())
                    || !tangles.members.is_start()
                {
                    return Err(MessageError::InvalidTangle(
                        ContentType::Init,
                        "all tangles need to start here",
                    ));
                }
            }
            GroupContent::InitEpoch(content) => {
                if !content.tangles.epoch.is_linked() {
                    return Err(MessageError::InvalidTangle(
                        ContentType::InitEpoch,
                        "epoch tangle needs root and previous",
                    ));
                }
                if !content.tangles.members.is_start() {
                    return Err(MessageError::InvalidTangle(
                        ContentType::InitEpoch,
                        "members tangle needs to start here",
                    ));
                }
            }
            GroupContent::AddMember(content) => {
                if !content.tangles.members.is_linked() {
                    return Err(MessageError::InvalidTangle(
                        ContentType::AddMember,
                        "members tangle needs root and previous",
                    ));
                }
                match content.recps.split_first() {
                    Some((Recipient::Group(_), feeds))
                        if !feeds.is_empty()
                            && feeds
                                .iter()
                                .all(|recp| matches!(recp, Recipient::Feed(_))) => {}
                    _ => return Err(MessageError::InvalidRecipients(ContentType::AddMember)),
                }
            }
            GroupContent::ExcludeMember(content) => {
                if !content.tangles.members.is_linked() {
                    return Err(MessageError::InvalidTangle(
                        ContentType::ExcludeMember,
                        "members tangle needs root and previous",
                    ));
                }
                if !matches!(content.recps.as_slice(), [Recipient::Group(_)]) {
                    return Err(MessageError::InvalidRecipients(ContentType::ExcludeMember));
                }
                if content.excludes.is_empty() {
                    return Err(MessageError::NoExcludes);
                }
            }
        }

        Ok(())
    }
}

/// Decrypted group message as delivered by the message store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupMessage {
    pub id: MessageId,

    /// Feed which published the message, not necessarily a root identity.
    pub author: FeedId,

    pub content: GroupContent,

    /// Key the envelope of this message was opened with, if it was encrypted to a group key.
    pub read_key: Option<GroupSecret>,
}

impl GroupMessage {
    /// Root of the given tangle this message is part of.
    ///
    /// Messages starting a tangle are its root.
    pub fn tangle_root(&self, name: TangleName) -> Option<MessageId> {
        self.content
            .tangle(name)
            .map(|links| links.root.unwrap_or(self.id))
    }

    /// `previous` of this message in the given tangle, empty when it starts the tangle.
    pub fn tangle_previous(&self, name: TangleName) -> Option<Vec<MessageId>> {
        self.content
            .tangle(name)
            .map(|links| links.previous.clone().unwrap_or_default())
    }

    /// Group id this message is addressed to, if it names one.
    pub fn group_id(&self) -> Option<GroupId> {
        self.content.recipients().iter().find_map(|recp| match recp {
            Recipient::Group(group_id) => Some(*group_id),
            Recipient::Feed(_) => None,
        })
    }

    /// Feed ids which were added by this message, `None` if it is not an add-member message.
    pub fn added(&self) -> Option<impl Iterator<Item = FeedId> + '_> {
        match &self.content {
            GroupContent::AddMember(content) => {
                Some(content.recps.iter().filter_map(|recp| match recp {
                    Recipient::Feed(feed_id) => Some(*feed_id),
                    Recipient::Group(_) => None,
                }))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("invalid tangles in {0} message: {1}")]
    InvalidTangle(ContentType, &'static str),

    #[error("{0} message needs the group id as first and only feed ids as other recipients")]
    InvalidRecipients(ContentType),

    #[error("exclude-member message does not exclude anyone")]
    NoExcludes,

    #[error("expected {expected} message, got {actual}")]
    UnexpectedType {
        expected: &'static str,
        actual: ContentType,
    },

    #[error("message {0} does not belong to tangle rooted at {1}")]
    ForeignRoot(MessageId, MessageId),

    #[error("message {0} by a peer carries no read key")]
    MissingReadKey(MessageId),

    #[error(transparent)]
    Tangle(#[from] TangleError<MessageId>),
}
