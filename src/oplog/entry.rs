//! Operation Log Entry Types
//!
//! Defines the structured operation descriptors that are written to the
//! operation log and replicated to every peer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Position of an entry in a node's operation log
pub type Sequence = u64;

/// Version byte stamped on every log record and wire frame carrying entries.
/// Bump when the encoding of [`Operation`] changes incompatibly.
pub const OPERATION_FORMAT_VERSION: u8 = 1;

/// A registered user account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

/// A forum post
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRecord {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub author_id: i64,
    pub anonymous: bool,
    pub upvotes: i64,
    pub downvotes: i64,
    pub created_at: DateTime<Utc>,
}

/// A comment on a post, optionally nested under another comment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentRecord {
    pub id: i64,
    pub post_id: i64,
    pub parent_id: Option<i64>,
    pub author_id: i64,
    pub content: String,
    pub anonymous: bool,
    pub upvotes: i64,
    pub downvotes: i64,
    pub created_at: DateTime<Utc>,
}

/// What a vote applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoteTarget {
    Post(i64),
    Comment(i64),
}

/// A single up- or downvote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub id: i64,
    pub user_id: i64,
    pub target: VoteTarget,
    pub is_upvote: bool,
}

/// One state mutation, replayed on every node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    UserRegistered(UserRecord),
    PostCreated(PostRecord),
    /// Soft delete, the row stays but is hidden
    PostDeleted { post_id: i64 },
    CommentCreated(CommentRecord),
    CommentDeleted { comment_id: i64 },
    /// Replaces any existing vote with the same id
    VoteCast(VoteRecord),
    VoteDeleted { vote_id: i64 },
}

/// Discriminant of an [`Operation`], used for logging and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    UserRegistered,
    PostCreated,
    PostDeleted,
    CommentCreated,
    CommentDeleted,
    VoteCast,
    VoteDeleted,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OperationKind::UserRegistered => "user_registered",
            OperationKind::PostCreated => "post_created",
            OperationKind::PostDeleted => "post_deleted",
            OperationKind::CommentCreated => "comment_created",
            OperationKind::CommentDeleted => "comment_deleted",
            OperationKind::VoteCast => "vote_cast",
            OperationKind::VoteDeleted => "vote_deleted",
        };
        f.write_str(name)
    }
}

impl Operation {
    /// Get the kind of this operation
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::UserRegistered(_) => OperationKind::UserRegistered,
            Operation::PostCreated(_) => OperationKind::PostCreated,
            Operation::PostDeleted { .. } => OperationKind::PostDeleted,
            Operation::CommentCreated(_) => OperationKind::CommentCreated,
            Operation::CommentDeleted { .. } => OperationKind::CommentDeleted,
            Operation::VoteCast(_) => OperationKind::VoteCast,
            Operation::VoteDeleted { .. } => OperationKind::VoteDeleted,
        }
    }
}

/// An operation together with its position in the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationEntry {
    pub sequence: Sequence,
    pub operation: Operation,
}

impl OperationEntry {
    pub fn new(sequence: Sequence, operation: Operation) -> Self {
        Self { sequence, operation }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a small post operation for tests
    pub(crate) fn post(id: i64, title: &str) -> Operation {
        Operation::PostCreated(PostRecord {
            id,
            title: title.to_string(),
            content: format!("content of {}", title),
            author_id: 1,
            anonymous: false,
            upvotes: 0,
            downvotes: 0,
            created_at: Utc::now(),
        })
    }

    #[test]
    fn test_operation_kind() {
        assert_eq!(post(1, "op1").kind(), OperationKind::PostCreated);
        assert_eq!(
            Operation::VoteDeleted { vote_id: 3 }.kind().to_string(),
            "vote_deleted"
        );
    }

    #[test]
    fn test_operation_json_shape() {
        let op = Operation::PostDeleted { post_id: 7 };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["post_deleted"]["post_id"], 7);
    }
}
