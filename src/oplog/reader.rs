//! Operation Log Reader
//!
//! Sequential, lazy reading of the operation log. Entries are decoded one at
//! a time from disk so serving a catch-up stream never holds the whole log
//! in memory.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use super::entry::{OperationEntry, Sequence};
use super::record;
use crate::error::Result;

/// Iterator over log entries with sequence above a starting point.
///
/// Bounded by the committed length of the log at creation time, so it is
/// finite even while appends continue.
pub struct LogIterator {
    reader: BufReader<File>,
    offset: u64,
    end: u64,
    after: Sequence,
    failed: bool,
}

impl LogIterator {
    pub(super) fn open(path: &Path, after: Sequence, end: u64) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            offset: 0,
            end,
            after,
            failed: false,
        })
    }

    /// Turn this iterator into an async stream.
    ///
    /// Decoding runs on the blocking pool and hands entries over through a
    /// single-slot channel, so at most one decoded entry waits for the
    /// consumer. Dropping the stream stops the reader.
    pub fn into_stream(self) -> BoxStream<'static, Result<OperationEntry>> {
        let (tx, rx) = mpsc::channel(1);

        tokio::task::spawn_blocking(move || {
            for item in self {
                if tx.blocking_send(item).is_err() {
                    tracing::trace!("Log stream consumer went away");
                    break;
                }
            }
        });

        Box::pin(ReceiverStream::new(rx).fuse())
    }
}

impl Iterator for LogIterator {
    type Item = Result<OperationEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.failed && self.offset < self.end {
            match record::read_record(&mut self.reader, self.offset) {
                Ok(Some((entry, size))) => {
                    self.offset += size;
                    if entry.sequence > self.after {
                        return Some(Ok(entry));
                    }
                }
                Ok(None) => return None,
                Err(e) => {
                    // Stop iteration on error
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}
