//! Container operation log
//!
//! Append-only file of container metadata operations with:
//! - The container sequence number carried by every record
//! - CRC32C checksums per record
//! - Replay that stops at the first torn or corrupt record
//! - Truncation below a checkpoint
//!
//! Record format:
//! ```text
//! +--------+----------+--------+---------+--------+
//! | Magic  | Sequence | Length | Payload | CRC32C |
//! | 4B     | 8B       | 4B     | var     | 4B     |
//! +--------+----------+--------+---------+--------+
//! ```

use crate::error::{ContainerError, ContainerResult};
use crate::metadata::MetadataSnapshot;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Record magic number
const LOG_MAGIC: u32 = 0x5242_4F4C; // "RBOL"

/// Record header size (magic + sequence + length)
const RECORD_HEADER_SIZE: usize = 16;

/// Trailing checksum size
const CRC_SIZE: usize = 4;

/// A container metadata operation as persisted in the log
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOperation {
    /// Map a segment name to an id, optionally under a parent
    MapSegment {
        name: String,
        segment_id: u64,
        parent_id: Option<u64>,
    },
    UpdateLength {
        segment_id: u64,
        length: u64,
    },
    SealSegment {
        segment_id: u64,
    },
    /// Delete a segment and all of its children
    DeleteSegment {
        name: String,
    },
    /// Full directory image; replay may start here
    Checkpoint(MetadataSnapshot),
}

/// A single log record
#[derive(Debug)]
pub struct LogRecord {
    pub sequence: u64,
    pub payload: Vec<u8>,
}

impl LogRecord {
    /// Serialize record to bytes
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + self.payload.len() + CRC_SIZE);
        buf.extend_from_slice(&LOG_MAGIC.to_le_bytes());
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        #[allow(clippy::cast_possible_truncation)]
        let payload_len = self.payload.len() as u32;
        buf.extend_from_slice(&payload_len.to_le_bytes());
        buf.extend_from_slice(&self.payload);

        // CRC over everything except the CRC itself
        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parse one record from the front of `data`; returns it with its encoded size
    pub fn from_bytes(data: &[u8], offset: u64) -> ContainerResult<(Self, usize)> {
        let corrupt = |reason: &str| ContainerError::Corrupt {
            offset,
            reason: reason.to_string(),
        };
        if data.len() < RECORD_HEADER_SIZE + CRC_SIZE {
            return Err(corrupt("record too small"));
        }
        if read_u32(&data[0..4]) != LOG_MAGIC {
            return Err(corrupt("invalid magic"));
        }
        let sequence = read_u64(&data[4..12]);
        let payload_len = read_u32(&data[12..16]) as usize;

        let total = RECORD_HEADER_SIZE + payload_len + CRC_SIZE;
        if data.len() < total {
            return Err(corrupt("record truncated"));
        }
        let body_end = RECORD_HEADER_SIZE + payload_len;
        if crc32c::crc32c(&data[..body_end]) != read_u32(&data[body_end..total]) {
            return Err(ContainerError::CrcMismatch { sequence });
        }

        Ok((
            Self {
                sequence,
                payload: data[RECORD_HEADER_SIZE..body_end].to_vec(),
            },
            total,
        ))
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

/// Append-only operation log of one container
pub struct OperationLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    sync_on_write: bool,
}

impl OperationLog {
    /// Open the log at `path`, creating it if absent
    pub fn open(path: impl AsRef<Path>, sync_on_write: bool) -> ContainerResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
            sync_on_write,
        })
    }

    /// Append an operation stamped with `sequence`
    pub fn append(&self, sequence: u64, op: &LogOperation) -> ContainerResult<()> {
        let record = LogRecord {
            sequence,
            payload: bincode::serialize(op)?,
        };
        let bytes = record.to_bytes();

        let mut writer = self.writer.lock();
        writer.write_all(&bytes)?;
        if self.sync_on_write {
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Flush buffered records and fsync
    pub fn sync(&self) -> ContainerResult<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Replay every intact record in order.
    ///
    /// A torn or corrupt tail ends the replay and is cut off the file, so
    /// later appends follow the last intact record. Returns the last
    /// replayed sequence number (0 for an empty log).
    pub fn replay<F>(&self, mut callback: F) -> ContainerResult<u64>
    where
        F: FnMut(u64, LogOperation) -> riverbed_common::Result<()>,
    {
        let mut writer = self.writer.lock();
        writer.flush()?;
        let data = std::fs::read(&self.path)?;
        let mut offset = 0usize;
        let mut last = 0u64;

        while offset < data.len() {
            match LogRecord::from_bytes(&data[offset..], offset as u64) {
                Ok((record, size)) => {
                    let op: LogOperation = bincode::deserialize(&record.payload)?;
                    callback(record.sequence, op).map_err(|e| ContainerError::Corrupt {
                        offset: offset as u64,
                        reason: e.to_string(),
                    })?;
                    last = record.sequence;
                    offset += size;
                }
                Err(e) => {
                    warn!(
                        "Stopping replay of {} at offset {}, dropping {} byte(s): {}",
                        self.path.display(),
                        offset,
                        data.len() - offset,
                        e
                    );
                    let file = writer.get_ref();
                    file.set_len(offset as u64)?;
                    file.sync_all()?;
                    break;
                }
            }
        }
        Ok(last)
    }

    /// Rewrite the log keeping only records with sequence >= `sequence`
    pub fn truncate_before(&self, sequence: u64) -> ContainerResult<usize> {
        let new_path = self.path.with_extension("log.new");
        let mut writer = self.writer.lock();
        writer.flush()?;

        let data = std::fs::read(&self.path)?;
        let mut kept = Vec::with_capacity(data.len());
        let mut dropped = 0usize;
        let mut offset = 0usize;
        while offset < data.len() {
            let Ok((record, size)) = LogRecord::from_bytes(&data[offset..], offset as u64) else {
                break;
            };
            if record.sequence >= sequence {
                kept.extend_from_slice(&data[offset..offset + size]);
            } else {
                dropped += 1;
            }
            offset += size;
        }

        {
            let mut file = File::create(&new_path)?;
            file.write_all(&kept)?;
            file.sync_all()?;
        }

        // Atomic rename
        std::fs::rename(&new_path, &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        *writer = BufWriter::new(file);

        debug!(
            "Truncated {} record(s) below sequence {} from {}",
            dropped,
            sequence,
            self.path.display()
        );
        Ok(dropped)
    }

    /// Current size of the log file in bytes
    pub fn size(&self) -> ContainerResult<u64> {
        self.writer.lock().flush()?;
        Ok(std::fs::metadata(&self.path)?.len())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
