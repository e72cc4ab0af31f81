//! SQLite State Store
//!
//! Forum tables kept in a local SQLite database. Creates are upserts and
//! votes are replaced by id, so the last writer wins and replays are
//! harmless.

use std::path::Path;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use super::{ApplyError, StateStore};
use crate::error::Result;
use crate::oplog::{CommentRecord, Operation, PostRecord, UserRecord, VoteRecord, VoteTarget};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS user (
    id INTEGER PRIMARY KEY,
    username TEXT NOT NULL,
    password_hash TEXT NOT NULL,
    date_created TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS post (
    id INTEGER PRIMARY KEY,
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    author_id INTEGER NOT NULL,
    anonymous INTEGER NOT NULL DEFAULT 0,
    upvotes INTEGER NOT NULL DEFAULT 0,
    downvotes INTEGER NOT NULL DEFAULT 0,
    date_posted TEXT NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS comment (
    id INTEGER PRIMARY KEY,
    post_id INTEGER NOT NULL,
    parent_id INTEGER,
    author_id INTEGER NOT NULL,
    content TEXT NOT NULL,
    anonymous INTEGER NOT NULL DEFAULT 0,
    upvotes INTEGER NOT NULL DEFAULT 0,
    downvotes INTEGER NOT NULL DEFAULT 0,
    date_posted TEXT NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_comment_post ON comment(post_id);

CREATE TABLE IF NOT EXISTS vote (
    id INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL,
    post_id INTEGER,
    comment_id INTEGER,
    is_upvote INTEGER NOT NULL
);
"#;

/// Row counts per table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableCounts {
    pub users: u64,
    pub posts: u64,
    pub comments: u64,
    pub votes: u64,
}

/// State store backed by SQLite
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open the store database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!("Opened SQLite store at {:?}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create a store that lives only in memory
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Number of rows in each table
    pub async fn counts(&self) -> Result<TableCounts> {
        let conn = self.conn.lock().await;
        let count = |table: &str| -> rusqlite::Result<u64> {
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n as u64)
        };

        Ok(TableCounts {
            users: count("user")?,
            posts: count("post")?,
            comments: count("comment")?,
            votes: count("vote")?,
        })
    }

    /// Title and deleted flag of a post
    pub async fn post(&self, id: i64) -> Result<Option<(String, bool)>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT title, deleted FROM post WHERE id = ?1",
                params![id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?)),
            )
            .optional()?;
        Ok(row)
    }
}

fn insert_user(conn: &Connection, user: &UserRecord) -> rusqlite::Result<usize> {
    conn.execute(
        r#"
        INSERT INTO user (id, username, password_hash, date_created)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(id) DO UPDATE SET
            username = excluded.username,
            password_hash = excluded.password_hash,
            date_created = excluded.date_created
        "#,
        params![
            user.id,
            user.username,
            user.password_hash,
            user.created_at.to_rfc3339()
        ],
    )
}

fn insert_post(conn: &Connection, post: &PostRecord) -> rusqlite::Result<usize> {
    // The deleted flag is left alone so a replayed create cannot undelete
    conn.execute(
        r#"
        INSERT INTO post (id, title, content, author_id, anonymous, upvotes, downvotes, date_posted)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            content = excluded.content,
            author_id = excluded.author_id,
            anonymous = excluded.anonymous,
            upvotes = excluded.upvotes,
            downvotes = excluded.downvotes,
            date_posted = excluded.date_posted
        "#,
        params![
            post.id,
            post.title,
            post.content,
            post.author_id,
            post.anonymous,
            post.upvotes,
            post.downvotes,
            post.created_at.to_rfc3339()
        ],
    )
}

fn insert_comment(conn: &Connection, comment: &CommentRecord) -> rusqlite::Result<usize> {
    conn.execute(
        r#"
        INSERT INTO comment (id, post_id, parent_id, author_id, content, anonymous, upvotes, downvotes, date_posted)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(id) DO UPDATE SET
            post_id = excluded.post_id,
            parent_id = excluded.parent_id,
            author_id = excluded.author_id,
            content = excluded.content,
            anonymous = excluded.anonymous,
            upvotes = excluded.upvotes,
            downvotes = excluded.downvotes,
            date_posted = excluded.date_posted
        "#,
        params![
            comment.id,
            comment.post_id,
            comment.parent_id,
            comment.author_id,
            comment.content,
            comment.anonymous,
            comment.upvotes,
            comment.downvotes,
            comment.created_at.to_rfc3339()
        ],
    )
}

fn replace_vote(conn: &Connection, vote: &VoteRecord) -> rusqlite::Result<usize> {
    let (post_id, comment_id) = match vote.target {
        VoteTarget::Post(id) => (Some(id), None),
        VoteTarget::Comment(id) => (None, Some(id)),
    };
    conn.execute(
        "REPLACE INTO vote (id, user_id, post_id, comment_id, is_upvote) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![vote.id, vote.user_id, post_id, comment_id, vote.is_upvote],
    )
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn apply(&self, operation: &Operation) -> std::result::Result<(), ApplyError> {
        let conn = self.conn.lock().await;

        let rows = match operation {
            Operation::UserRegistered(user) => insert_user(&conn, user)?,
            Operation::PostCreated(post) => insert_post(&conn, post)?,
            Operation::PostDeleted { post_id } => {
                conn.execute("UPDATE post SET deleted = 1 WHERE id = ?1", params![post_id])?
            }
            Operation::CommentCreated(comment) => insert_comment(&conn, comment)?,
            Operation::CommentDeleted { comment_id } => conn.execute(
                "UPDATE comment SET deleted = 1 WHERE id = ?1",
                params![comment_id],
            )?,
            Operation::VoteCast(vote) => replace_vote(&conn, vote)?,
            Operation::VoteDeleted { vote_id } => {
                conn.execute("DELETE FROM vote WHERE id = ?1", params![vote_id])?
            }
        };

        tracing::trace!("Applied {} ({} rows)", operation.kind(), rows);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::entry::tests::post;
    use chrono::Utc;
    use tempfile::tempdir;

    fn vote(id: i64, post_id: i64, is_upvote: bool) -> Operation {
        Operation::VoteCast(VoteRecord {
            id,
            user_id: 1,
            target: VoteTarget::Post(post_id),
            is_upvote,
        })
    }

    #[tokio::test]
    async fn test_apply_forum_operations() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("store.db")).unwrap();

        store
            .apply(&Operation::UserRegistered(UserRecord {
                id: 1,
                username: "alice".into(),
                password_hash: "hash".into(),
                created_at: Utc::now(),
            }))
            .await
            .unwrap();
        store.apply(&post(10, "hello")).await.unwrap();
        store
            .apply(&Operation::CommentCreated(CommentRecord {
                id: 100,
                post_id: 10,
                parent_id: None,
                author_id: 1,
                content: "first".into(),
                anonymous: true,
                upvotes: 0,
                downvotes: 0,
                created_at: Utc::now(),
            }))
            .await
            .unwrap();
        store.apply(&vote(5, 10, true)).await.unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(
            counts,
            TableCounts {
                users: 1,
                posts: 1,
                comments: 1,
                votes: 1
            }
        );
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let op = post(1, "twice");

        store.apply(&op).await.unwrap();
        store.apply(&op).await.unwrap();

        assert_eq!(store.counts().await.unwrap().posts, 1);
    }

    #[tokio::test]
    async fn test_soft_delete_survives_replayed_create() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.apply(&post(1, "gone")).await.unwrap();
        store.apply(&Operation::PostDeleted { post_id: 1 }).await.unwrap();
        store.apply(&post(1, "gone")).await.unwrap();

        assert_eq!(store.post(1).await.unwrap(), Some(("gone".to_string(), true)));
        assert_eq!(store.post(2).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_vote_last_writer_wins() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.apply(&vote(7, 1, true)).await.unwrap();
        store.apply(&vote(7, 1, false)).await.unwrap();
        assert_eq!(store.counts().await.unwrap().votes, 1);

        store.apply(&Operation::VoteDeleted { vote_id: 7 }).await.unwrap();
        store.apply(&Operation::VoteDeleted { vote_id: 7 }).await.unwrap();
        assert_eq!(store.counts().await.unwrap().votes, 0);
    }
}
