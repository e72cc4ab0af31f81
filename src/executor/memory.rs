//! In-Memory State Store

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ApplyError, StateStore};
use crate::oplog::{CommentRecord, Operation, OperationKind, PostRecord, UserRecord, VoteRecord};

#[derive(Default)]
struct Tables {
    users: HashMap<i64, UserRecord>,
    posts: HashMap<i64, PostRecord>,
    comments: HashMap<i64, CommentRecord>,
    votes: HashMap<i64, VoteRecord>,
    deleted_posts: HashSet<i64>,
    deleted_comments: HashSet<i64>,
    /// Most recent operations applied, oldest first
    recent: VecDeque<Operation>,
    applied: usize,
}

/// Number of applied operations kept for inspection
const RECENT_LIMIT: usize = 1024;

/// State store holding the forum tables in memory
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    reject: Option<OperationKind>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that fails every operation of `kind`
    pub fn rejecting(kind: OperationKind) -> Self {
        Self {
            tables: RwLock::default(),
            reject: Some(kind),
        }
    }

    /// The most recent operations applied (up to 1024), in application order
    pub async fn history(&self) -> Vec<Operation> {
        self.tables.read().await.recent.iter().cloned().collect()
    }

    /// Number of operations applied
    pub async fn applied(&self) -> usize {
        self.tables.read().await.applied
    }

    /// Look up a post that has not been deleted
    pub async fn post(&self, id: i64) -> Option<PostRecord> {
        let tables = self.tables.read().await;
        if tables.deleted_posts.contains(&id) {
            return None;
        }
        tables.posts.get(&id).cloned()
    }

    /// Number of votes currently stored
    pub async fn vote_count(&self) -> usize {
        self.tables.read().await.votes.len()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn apply(&self, operation: &Operation) -> std::result::Result<(), ApplyError> {
        if self.reject == Some(operation.kind()) {
            return Err(ApplyError::Rejected(format!("{} is not accepted", operation.kind())));
        }

        let mut tables = self.tables.write().await;
        match operation {
            Operation::UserRegistered(user) => {
                tables.users.insert(user.id, user.clone());
            }
            Operation::PostCreated(post) => {
                tables.posts.insert(post.id, post.clone());
            }
            Operation::PostDeleted { post_id } => {
                tables.deleted_posts.insert(*post_id);
            }
            Operation::CommentCreated(comment) => {
                tables.comments.insert(comment.id, comment.clone());
            }
            Operation::CommentDeleted { comment_id } => {
                tables.deleted_comments.insert(*comment_id);
            }
            Operation::VoteCast(vote) => {
                tables.votes.insert(vote.id, vote.clone());
            }
            Operation::VoteDeleted { vote_id } => {
                tables.votes.remove(vote_id);
            }
        }
        if tables.recent.len() == RECENT_LIMIT {
            tables.recent.pop_front();
        }
        tables.recent.push_back(operation.clone());
        tables.applied += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::entry::tests::post;

    #[tokio::test]
    async fn test_memory_store_apply() {
        let store = MemoryStore::new();
        store.apply(&post(1, "kept")).await.unwrap();
        store.apply(&post(2, "removed")).await.unwrap();
        store.apply(&Operation::PostDeleted { post_id: 2 }).await.unwrap();

        assert_eq!(store.post(1).await.unwrap().title, "kept");
        assert!(store.post(2).await.is_none());
        assert_eq!(store.applied().await, 3);
    }

    #[tokio::test]
    async fn test_rejecting_store() {
        let store = MemoryStore::rejecting(OperationKind::PostCreated);
        assert!(matches!(
            store.apply(&post(1, "no")).await,
            Err(ApplyError::Rejected(_))
        ));
        assert!(store.apply(&Operation::PostDeleted { post_id: 1 }).await.is_ok());
        assert_eq!(store.applied().await, 1);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let store = MemoryStore::new();
        let total = RECENT_LIMIT + 10;
        for id in 0..total as i64 {
            store.apply(&Operation::PostDeleted { post_id: id }).await.unwrap();
        }

        assert_eq!(store.applied().await, total);
        let history = store.history().await;
        assert_eq!(history.len(), RECENT_LIMIT);
        assert_eq!(history[0], Operation::PostDeleted { post_id: 10 });
        assert_eq!(
            history[RECENT_LIMIT - 1],
            Operation::PostDeleted { post_id: total as i64 - 1 }
        );
    }
}
