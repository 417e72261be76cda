// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

use thiserror::Error;
use tribes_core::GroupId;

use crate::preferred::SelectError;
use crate::publish::PublishError;

/// Step of group resolution an error occurred in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    LocalIdentity,
    LoadGroupInfo,
    RegisterGroup,
    LoadEpochs,
    LoadMembers,
    LoadTangle,
    ResolveAuthor,
    SelectPreferredEpoch,
    CreateFeed,
    PublishInit,
    PublishInitEpoch,
    PublishAddMember,
    PublishExcludeMember,
    RotateKeys,
    Reconcile,
    RepairMissing,
    Subscribe,
    Ingest,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            Stage::LocalIdentity => "finding local root identity",
            Stage::LoadGroupInfo => "loading group info",
            Stage::RegisterGroup => "registering group keys",
            Stage::LoadEpochs => "loading epochs",
            Stage::LoadMembers => "loading epoch members",
            Stage::LoadTangle => "loading tangle tips",
            Stage::ResolveAuthor => "resolving epoch author",
            Stage::SelectPreferredEpoch => "selecting preferred epoch",
            Stage::CreateFeed => "finding or creating group feed",
            Stage::PublishInit => "publishing group/init",
            Stage::PublishInitEpoch => "publishing group/init-epoch",
            Stage::PublishAddMember => "publishing group/add-member",
            Stage::PublishExcludeMember => "publishing group/exclude-member",
            Stage::RotateKeys => "rotating group keys",
            Stage::Reconcile => "reconciling epoch fork",
            Stage::RepairMissing => "re-adding missing members",
            Stage::Subscribe => "subscribing to group messages",
            Stage::Ingest => "ingesting group messages",
        };
        write!(f, "{stage}")
    }
}

/// Errors of group operations, generic over the errors of message store (`S`), key registry
/// (`K`) and identity provider (`I`).
#[derive(Debug, Error)]
pub enum GroupsError<S, K, I> {
    #[error("unknown group {0}")]
    UnknownGroup(GroupId),

    #[error("excluded from group {0}")]
    Excluded(GroupId),

    #[error("can't exclude ourselves from group {0}")]
    ExcludeSelf(GroupId),

    #[error("message store failed while {stage}")]
    Store {
        stage: Stage,
        #[source]
        source: S,
    },

    #[error("key registry failed while {stage}")]
    Keys {
        stage: Stage,
        #[source]
        source: K,
    },

    #[error("identity provider failed while {stage}")]
    Identity {
        stage: Stage,
        #[source]
        source: I,
    },

    #[error("unresolved fork while {stage}")]
    UnresolvedFork {
        stage: Stage,
        #[source]
        source: SelectError,
    },

    #[error("can't publish while {stage}")]
    Publish {
        stage: Stage,
        #[source]
        source: PublishError,
    },
}

impl<S, K, I> GroupsError<S, K, I> {
    /// Stage the error occurred in, `None` for plain outcomes like an unknown group.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            GroupsError::UnknownGroup(_)
            | GroupsError::Excluded(_)
            | GroupsError::ExcludeSelf(_) => None,
            GroupsError::Store { stage, .. }
            | GroupsError::Keys { stage, .. }
            | GroupsError::Identity { stage, .. }
            | GroupsError::UnresolvedFork { stage, .. }
            | GroupsError::Publish { stage, .. } => Some(*stage),
        }
    }

    pub(crate) fn store(stage: Stage) -> impl FnOnce(S) -> Self {
        move |source| GroupsError::Store { stage, source }
    }

    pub(crate) fn keys(stage: Stage) -> impl FnOnce(K) -> Self {
        move |source| GroupsError::Keys { stage, source }
    }

    pub(crate) fn identity(stage: Stage) -> impl FnOnce(I) -> Self {
        move |source| GroupsError::Identity { stage, source }
    }

    pub(crate) fn fork(stage: Stage) -> impl FnOnce(SelectError) -> Self {
        move |source| GroupsError::UnresolvedFork { stage, source }
    }

    pub(crate) fn publish(stage: Stage) -> impl FnOnce(PublishError) -> Self {
        move |source| GroupsError::Publish { stage, source }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use tribes_core::Hash;

    use super::{GroupsError, Stage};
    use crate::preferred::SelectError;

    type TestError = GroupsError<io::Error, io::Error, io::Error>;

    #[test]
    fn errors_name_their_stage() {
        let err: TestError = GroupsError::store(Stage::LoadEpochs)(io::Error::other("offline"));
        assert_eq!(err.stage(), Some(Stage::LoadEpochs));
        assert_eq!(err.to_string(), "message store failed while loading epochs");

        let err: TestError = GroupsError::fork(Stage::SelectPreferredEpoch)(
            SelectError::DisjointMembership(Hash::new("a"), Hash::new("b")),
        );
        assert_eq!(err.stage(), Some(Stage::SelectPreferredEpoch));

        let err: TestError = GroupsError::UnknownGroup(Hash::new("group").into());
        assert_eq!(err.stage(), None);
    }
}
