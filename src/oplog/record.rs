//! Operation Log Record Encoding
//!
//! Each entry is stored as one self-delimiting record:
//!
//! ```text
//! [length: u32][version: u8][flags: u8][data: length bytes][checksum: u32]
//! ```
//!
//! `data` is the bincode encoding of an [`OperationEntry`], LZ4-compressed when
//! the compression flag is set. The checksum is CRC32 over `data`. Because the
//! payload is length-prefixed, no byte sequence inside it needs escaping.

use std::io::{self, Read};

use super::entry::{OperationEntry, OPERATION_FORMAT_VERSION};
use crate::error::{Error, Result};

/// Bytes before the record data
pub const RECORD_HEADER_SIZE: usize = 6;

/// Bytes after the record data
pub const RECORD_TRAILER_SIZE: usize = 4;

/// Upper bound on a single record body, guards against garbage lengths
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

const FLAG_COMPRESSED: u8 = 0b0000_0001;

/// Encode an entry into a complete record
pub fn encode(entry: &OperationEntry, compression: bool) -> Result<Vec<u8>> {
    let serialized = bincode::serialize(entry)?;

    let (data, flags) = if compression {
        (lz4_flex::compress_prepend_size(&serialized), FLAG_COMPRESSED)
    } else {
        (serialized, 0)
    };

    if data.len() > MAX_RECORD_SIZE {
        return Err(Error::Log(format!(
            "Entry {} too large: {} bytes",
            entry.sequence,
            data.len()
        )));
    }

    let checksum = crc32fast::hash(&data);
    let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + data.len() + RECORD_TRAILER_SIZE);
    record.extend_from_slice(&(data.len() as u32).to_le_bytes());
    record.push(OPERATION_FORMAT_VERSION);
    record.push(flags);
    record.extend_from_slice(&data);
    record.extend_from_slice(&checksum.to_le_bytes());
    Ok(record)
}

/// Read the next record starting at `offset`.
///
/// Returns `Ok(None)` on a clean end of input, and the decoded entry together
/// with the record's size in bytes otherwise. A record cut short by the end
/// of input is reported as [`Error::LogCorrupted`].
pub fn read_record<R: Read>(reader: &mut R, offset: u64) -> Result<Option<(OperationEntry, u64)>> {
    let mut header = [0u8; RECORD_HEADER_SIZE];
    if !read_exact_or_eof(reader, &mut header).map_err(|e| torn(offset, e))? {
        return Ok(None);
    }

    let data_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let version = header[4];
    let flags = header[5];

    if version != OPERATION_FORMAT_VERSION {
        return Err(Error::LogCorrupted {
            offset,
            reason: format!("Unsupported record version: {}", version),
        });
    }
    if data_len > MAX_RECORD_SIZE {
        return Err(Error::LogCorrupted {
            offset,
            reason: format!("Record length {} exceeds limit", data_len),
        });
    }

    let mut data = vec![0u8; data_len];
    reader.read_exact(&mut data).map_err(|e| torn(offset, e))?;

    let mut trailer = [0u8; RECORD_TRAILER_SIZE];
    reader.read_exact(&mut trailer).map_err(|e| torn(offset, e))?;
    let stored_checksum = u32::from_le_bytes(trailer);

    if crc32fast::hash(&data) != stored_checksum {
        return Err(Error::LogCorrupted {
            offset,
            reason: "Checksum mismatch".into(),
        });
    }

    let serialized = if flags & FLAG_COMPRESSED != 0 {
        lz4_flex::decompress_size_prepended(&data).map_err(|e| Error::LogCorrupted {
            offset,
            reason: format!("Decompression failed: {}", e),
        })?
    } else {
        data
    };

    let entry: OperationEntry = bincode::deserialize(&serialized)?;
    let size = (RECORD_HEADER_SIZE + data_len + RECORD_TRAILER_SIZE) as u64;
    Ok(Some((entry, size)))
}

/// Like `read_exact`, but reports a clean EOF before the first byte as `false`
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

fn torn(offset: u64, e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::LogCorrupted {
            offset,
            reason: "Truncated record".into(),
        }
    } else {
        Error::Io(e)
    }
}
