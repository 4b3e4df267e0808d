//! Durable storage backend: an append-only JSON-lines commit journal.
//!
//! Each successful [`Commit`] becomes exactly one line of
//! `<dir>/commits.jsonl` holding the committed events and the tracking
//! record, so a commit is on disk entirely or not at all. On open the
//! journal is replayed into an in-memory [`EventIndex`] that serves reads.
//!
//! # Recovery
//!
//! - A damaged **last** line (a torn write) is truncated with a warning.
//! - A damaged line **followed by** intact lines is
//!   [`StorageError::Corrupt`]; nothing is truncated.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use uuid::Uuid;

use crate::error::StorageError;
use crate::event::StoredEvent;
use crate::storage::{Commit, CommitReceipt, CommitRecord, EventIndex, EventStorage};

/// File name of the journal inside the data directory.
pub const JOURNAL_FILE: &str = "commits.jsonl";

/// Append handle plus the byte length of the last complete commit.
#[derive(Debug)]
struct Writer {
    file: File,
    len: u64,
}

/// File-backed [`EventStorage`] that survives restarts.
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    /// Serializes committers; held across prepare, write, and apply.
    writer: Mutex<Writer>,
    index: RwLock<EventIndex>,
}

impl FileJournal {
    /// Open (or create) the journal in `dir`, replaying existing commits.
    ///
    /// # Arguments
    ///
    /// * `dir` - Data directory. Created if missing.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Io`] if the directory or file cannot be created,
    ///   read, or truncated.
    /// - [`StorageError::Corrupt`] if a damaged record is followed by intact
    ///   ones, or records do not chain positions and versions.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(JOURNAL_FILE);

        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let (index, valid_len) = recover(&data)?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        if valid_len < data.len() as u64 {
            tracing::warn!(
                path = %path.display(),
                offset = valid_len,
                dropped_bytes = data.len() as u64 - valid_len,
                "truncating torn trailing commit record"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        tracing::debug!(
            path = %path.display(),
            head_position = index.head_position(),
            "opened commit journal"
        );

        Ok(Self {
            path,
            writer: Mutex::new(Writer {
                file,
                len: valid_len,
            }),
            index: RwLock::new(index),
        })
    }

    /// Path of the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Rebuild the index from journal bytes.
///
/// Returns the index and the byte length of the intact prefix.
fn recover(data: &[u8]) -> Result<(EventIndex, u64), StorageError> {
    let mut index = EventIndex::default();
    let mut offset = 0usize;
    let mut line_no = 0usize;

    while offset < data.len() {
        line_no += 1;
        let rest = &data[offset..];
        let Some(newline) = rest.iter().position(|&b| b == b'\n') else {
            // No terminator: the last write never completed.
            return Ok((index, offset as u64));
        };
        let line = &rest[..newline];
        let next = offset + newline + 1;

        match serde_json::from_slice::<CommitRecord>(line) {
            Ok(record) => {
                index
                    .apply(record)
                    .map_err(|detail| StorageError::Corrupt {
                        line: line_no,
                        detail,
                    })?;
            }
            Err(e) => {
                let trailing = data[next..].iter().all(u8::is_ascii_whitespace);
                if trailing {
                    return Ok((index, offset as u64));
                }
                return Err(StorageError::Corrupt {
                    line: line_no,
                    detail: e.to_string(),
                });
            }
        }
        offset = next;
    }

    Ok((index, offset as u64))
}

impl EventStorage for FileJournal {
    fn commit(&self, commit: Commit) -> Result<CommitReceipt, StorageError> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let record = self
            .index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .prepare(commit)?;
        if record.is_empty() {
            return Ok(CommitReceipt::default());
        }

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let written = writer
            .file
            .write_all(&line)
            .and_then(|()| writer.file.sync_data());
        if let Err(e) = written {
            // Drop whatever part of the line reached the file.
            let len = writer.len;
            if let Err(rollback) = writer.file.set_len(len) {
                tracing::error!(
                    path = %self.path.display(),
                    error = %rollback,
                    "failed to roll back partial commit record"
                );
            }
            return Err(e.into());
        }
        writer.len += line.len() as u64;

        let receipt = CommitReceipt {
            events: record.events.clone(),
        };
        self.index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(record)
            .map_err(|detail| StorageError::Corrupt { line: 0, detail })?;
        Ok(receipt)
    }

    fn read_stream(
        &self,
        stream_id: Uuid,
        after_version: u64,
    ) -> Result<Vec<StoredEvent>, StorageError> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        Ok(index.read_stream(&stream_id, after_version))
    }

    fn stream_version(&self, stream_id: Uuid) -> Result<u64, StorageError> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        Ok(index.stream_version(&stream_id))
    }

    fn read_notifications(
        &self,
        after_position: u64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StorageError> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        Ok(index.read_notifications(after_position, limit))
    }

    fn head_position(&self) -> Result<u64, StorageError> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        Ok(index.head_position())
    }

    fn tracking_position(&self, downstream: &str, upstream: &str) -> Result<u64, StorageError> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        Ok(index.tracking_position(downstream, upstream))
    }
}
