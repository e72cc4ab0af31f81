//! Operation Log Module
//!
//! Durable, append-only log of (sequence, operation) pairs. It is the source
//! of truth for replay and for serving catch-up to joining peers.

pub mod entry;
mod log;
mod reader;
mod record;

pub use entry::{
    CommentRecord, Operation, OperationEntry, OperationKind, PostRecord, Sequence, UserRecord,
    VoteRecord, VoteTarget, OPERATION_FORMAT_VERSION,
};
pub use log::{LogGuard, OperationLog, LOG_FILE_NAME};
pub use reader::LogIterator;
