//! Operation Log Writer
//!
//! Durable, append-only log of this node's accepted operations. A single
//! writer is serialized behind an async mutex; the same mutex is the node's
//! sequence lock, so callers that must compare-and-append atomically hold a
//! [`LogGuard`] across the whole step.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use futures::stream::BoxStream;
use tokio::sync::{Mutex, MutexGuard};

use super::entry::{Operation, OperationEntry, Sequence};
use super::reader::LogIterator;
use super::record;
use crate::config::LogConfig;
use crate::error::{Error, Result};

/// Log file name inside the data directory
pub const LOG_FILE_NAME: &str = "oplog.log";

/// Durable operation log for one node
pub struct OperationLog {
    /// Log file path
    path: PathBuf,
    /// Configuration
    config: LogConfig,
    /// The single writer
    writer: Mutex<LogWriter>,
    /// Highest sequence durably appended
    watermark: AtomicU64,
    /// Number of entries in the log
    entries: AtomicU64,
    /// Byte length of fully written records, readers never go past it
    committed: AtomicU64,
}

/// File handle and write position
struct LogWriter {
    file: File,
    len: u64,
    /// Fail the next write after this many bytes reached the file
    #[cfg(test)]
    fail_after: Option<usize>,
}

/// Exclusive access to the append path.
///
/// While a guard is alive no other append can happen, so the watermark it
/// reports is stable.
pub struct LogGuard<'a> {
    log: &'a OperationLog,
    writer: MutexGuard<'a, LogWriter>,
}

/// What recovery found in an existing log file
struct Recovered {
    watermark: Sequence,
    entries: u64,
    valid_len: u64,
    /// Why the bytes after `valid_len` were rejected, if there are any
    torn_tail: Option<String>,
}

impl OperationLog {
    /// Open or create the log in `data_dir`, recovering the watermark
    pub fn open(data_dir: &Path, config: LogConfig) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(LOG_FILE_NAME);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let recovered = Self::recover(&mut file)?;
        if let Some(tail) = &recovered.torn_tail {
            let file_len = file.metadata()?.len();
            tracing::warn!(
                "Truncating torn tail of {:?}: {} trailing bytes after offset {} ({})",
                path,
                file_len - recovered.valid_len,
                recovered.valid_len,
                tail
            );
            file.set_len(recovered.valid_len)?;
            file.sync_all()?;
        }

        tracing::info!(
            "Operation log opened at {:?}: {} entries, watermark {}",
            path,
            recovered.entries,
            recovered.watermark
        );

        Ok(Self {
            path,
            config,
            writer: Mutex::new(LogWriter {
                file,
                len: recovered.valid_len,
                #[cfg(test)]
                fail_after: None,
            }),
            watermark: AtomicU64::new(recovered.watermark),
            entries: AtomicU64::new(recovered.entries),
            committed: AtomicU64::new(recovered.valid_len),
        })
    }

    /// Scan every record.
    ///
    /// Only the last record may be damaged, which is what an interrupted
    /// append leaves behind. A bad record with valid records after it fails
    /// the open and the file is left as it is.
    fn recover(file: &mut File) -> Result<Recovered> {
        let file_len = file.metadata()?.len();
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&*file);
        let mut recovered = Recovered {
            watermark: 0,
            entries: 0,
            valid_len: 0,
            torn_tail: None,
        };

        loop {
            match record::read_record(&mut reader, recovered.valid_len) {
                Ok(Some((entry, size))) => {
                    if entry.sequence <= recovered.watermark {
                        return Err(Error::LogCorrupted {
                            offset: recovered.valid_len,
                            reason: format!(
                                "Sequence {} does not follow {}",
                                entry.sequence, recovered.watermark
                            ),
                        });
                    }
                    recovered.watermark = entry.sequence;
                    recovered.entries += 1;
                    recovered.valid_len += size;
                }
                Ok(None) => break,
                Err(Error::LogCorrupted { offset, reason }) => {
                    drop(reader);
                    if !Self::is_last_record(file, offset, file_len)? {
                        tracing::error!("Operation log corrupted at offset {}: {}", offset, reason);
                        return Err(Error::LogCorrupted { offset, reason });
                    }
                    recovered.torn_tail = Some(reason);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(recovered)
    }

    /// Check whether the record at `offset` runs to the end of the file
    fn is_last_record(file: &mut File, offset: u64, file_len: u64) -> Result<bool> {
        let mut header = [0u8; record::RECORD_HEADER_SIZE];
        file.seek(SeekFrom::Start(offset))?;
        if file.read_exact(&mut header).is_err() {
            // Not even a whole header left
            return Ok(true);
        }

        let data_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as u64;
        if data_len > record::MAX_RECORD_SIZE as u64 {
            return Ok(false);
        }
        let end = offset
            + record::RECORD_HEADER_SIZE as u64
            + data_len
            + record::RECORD_TRAILER_SIZE as u64;
        Ok(end >= file_len)
    }

    /// Take the sequence lock
    pub async fn lock(&self) -> LogGuard<'_> {
        LogGuard {
            log: self,
            writer: self.writer.lock().await,
        }
    }

    /// Append a locally originated operation at `watermark + 1`
    pub async fn append(&self, operation: Operation) -> Result<OperationEntry> {
        self.lock().await.append(operation)
    }

    /// Highest sequence durably appended
    pub fn watermark(&self) -> Sequence {
        self.watermark.load(Ordering::Acquire)
    }

    /// Number of entries in the log
    pub fn len(&self) -> u64 {
        self.entries.load(Ordering::Acquire)
    }

    /// Check if the log has no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lazily read every entry with a sequence strictly greater than `after`.
    ///
    /// The iterator stops at the end of the log as it was when this was
    /// called; appends made afterwards are not observed.
    pub fn read_from(&self, after: Sequence) -> Result<LogIterator> {
        let end = self.committed.load(Ordering::Acquire);
        LogIterator::open(&self.path, after, end)
    }

    /// Async stream of entries above `after`, decoded on the blocking pool
    pub fn stream_from(&self, after: Sequence) -> Result<BoxStream<'static, Result<OperationEntry>>> {
        Ok(self.read_from(after)?.into_stream())
    }
}

impl LogWriter {
    fn write_at(&mut self, offset: u64, bytes: &[u8], fsync: bool) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;

        #[cfg(test)]
        if let Some(limit) = self.fail_after.take() {
            self.file.write_all(&bytes[..limit.min(bytes.len())])?;
            self.file.flush()?;
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "injected write failure"));
        }

        self.file.write_all(bytes)?;
        self.file.flush()?;
        if fsync {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

#[cfg(test)]
impl OperationLog {
    /// Make the next append fail once `written` bytes of its record are on disk
    pub(crate) async fn fail_next_write(&self, written: usize) {
        self.writer.lock().await.fail_after = Some(written);
    }
}

impl LogGuard<'_> {
    /// Watermark under the lock
    pub fn watermark(&self) -> Sequence {
        self.log.watermark()
    }

    /// Append a locally originated operation at `watermark + 1`
    pub fn append(&mut self, operation: Operation) -> Result<OperationEntry> {
        let sequence = self.watermark() + 1;
        self.write(OperationEntry::new(sequence, operation))
    }

    /// Append a replicated operation at the sequence it carried.
    ///
    /// The sequence must be above the current watermark; the watermark
    /// becomes `sequence`.
    pub fn append_at(&mut self, sequence: Sequence, operation: Operation) -> Result<OperationEntry> {
        let watermark = self.watermark();
        if sequence <= watermark {
            return Err(Error::SequenceRegression { sequence, watermark });
        }
        self.write(OperationEntry::new(sequence, operation))
    }

    fn write(&mut self, entry: OperationEntry) -> Result<OperationEntry> {
        let bytes = record::encode(&entry, self.log.config.compression)?;
        let start = self.writer.len;
        let fsync = self.log.config.fsync;

        let writer = &mut *self.writer;
        let written = writer.write_at(start, &bytes, fsync);

        if let Err(e) = written {
            // Drop whatever part of the record reached the file
            if let Err(truncate_err) = writer.file.set_len(start) {
                tracing::error!(
                    "Failed to roll back partial record at offset {}: {}",
                    start,
                    truncate_err
                );
            }
            tracing::error!("Operation log write failed for sequence {}: {}", entry.sequence, e);
            return Err(Error::Io(e));
        }

        writer.len = start + bytes.len() as u64;
        self.log.committed.store(writer.len, Ordering::Release);
        self.log.watermark.store(entry.sequence, Ordering::Release);
        self.log.entries.fetch_add(1, Ordering::AcqRel);

        tracing::trace!("Appended entry {} ({})", entry.sequence, entry.operation.kind());
        Ok(entry)
    }
}
