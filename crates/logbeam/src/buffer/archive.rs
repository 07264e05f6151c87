// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable, batched staging for the archive channel.
//!
//! Records are appended to an open batch, persisted as a file named after the
//! batch id. Once the open batch reaches the configured size it is sealed and
//! a new one begins. Sealed batches are handed out oldest first and their file
//! is deleted when the dispatcher confirms delivery. Batches found on disk at
//! startup are treated as sealed.
//!
//! Ids are `{sequence:016x}-{uuid}`: the sequence keeps creation order across
//! restarts when ids are sorted by name.
//!
//! A write failure never loses the record for the running process: the batch
//! is kept in memory and only its durability is lost.

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::buffer::{Buffer, BufferKind};
use crate::errors::StorageError;
use crate::record::{Batch, BatchId, LogRecord};
use crate::wire;

pub const DEFAULT_ARCHIVE_BATCH_SIZE: usize = 100;
const BATCH_EXTENSION: &str = "batch";
const CORRUPT_EXTENSION: &str = "corrupt";

#[derive(Debug)]
struct SealedBatch {
    id: BatchId,
    /// Held only when the batch could not be written to disk.
    records: Option<Vec<LogRecord>>,
}

#[derive(Debug)]
struct OpenBatch {
    id: BatchId,
    records: Vec<LogRecord>,
    persisted: bool,
}

#[derive(Debug)]
pub struct ArchiveBuffer {
    dir: PathBuf,
    batch_size: usize,
    next_sequence: u64,
    sealed: VecDeque<SealedBatch>,
    open: OpenBatch,
    in_flight: Option<Batch>,
}

impl ArchiveBuffer {
    /// Opens (creating if needed) the archive directory and picks up every
    /// batch a previous process left behind.
    pub fn open(dir: impl Into<PathBuf>, batch_size: usize) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut ids: Vec<BatchId> = fs::read_dir(&dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == BATCH_EXTENSION))
            .filter_map(|path| path.file_stem()?.to_str().map(str::to_string))
            .collect();
        ids.sort();

        let next_sequence = ids
            .iter()
            .filter_map(|id| parse_sequence(id))
            .max()
            .map_or(0, |max| max + 1);

        debug!(
            "Archive buffer opened at {} with {} persisted batches",
            dir.display(),
            ids.len()
        );

        let sealed = ids
            .into_iter()
            .map(|id| SealedBatch { id, records: None })
            .collect();

        let mut buffer = ArchiveBuffer {
            dir,
            batch_size: batch_size.max(1),
            next_sequence,
            sealed,
            open: OpenBatch {
                id: String::new(),
                records: Vec::new(),
                persisted: true,
            },
            in_flight: None,
        };
        buffer.open.id = buffer.new_batch_id();
        Ok(buffer)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Sealed batches plus the open batch when it holds records.
    pub fn pending_batches(&self) -> usize {
        self.sealed.len() + usize::from(!self.open.records.is_empty())
    }

    fn new_batch_id(&mut self) -> BatchId {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        format!("{sequence:016x}-{}", Uuid::new_v4().simple())
    }

    fn batch_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{BATCH_EXTENSION}"))
    }

    fn append(&self, record: &LogRecord) -> io::Result<()> {
        let mut frame = Vec::new();
        wire::encode_record_frame(record, &mut frame);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.batch_path(&self.open.id))?;
        file.write_all(&frame)
    }

    fn seal(&mut self) {
        let id = self.new_batch_id();
        let open = std::mem::replace(
            &mut self.open,
            OpenBatch {
                id,
                records: Vec::new(),
                persisted: true,
            },
        );
        debug!(
            "Sealed archive batch {} with {} records",
            open.id,
            open.records.len()
        );
        self.sealed.push_back(SealedBatch {
            id: open.id,
            records: if open.persisted {
                None
            } else {
                Some(open.records)
            },
        });
    }

    /// Loads the front sealed batch. `Err` means the file could not be read
    /// right now and the batch stays queued.
    fn load_front(&mut self) -> Result<Option<Batch>, StorageError> {
        loop {
            let Some(front) = self.sealed.front() else {
                return Ok(None);
            };
            if let Some(records) = &front.records {
                return Ok(Some(Batch::new(front.id.clone(), records.clone())));
            }

            let id = front.id.clone();
            let path = self.batch_path(&id);
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!("Archive batch {id} vanished from disk, skipping it");
                    self.sealed.pop_front();
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let (records, damage) = wire::decode_record_frames(&bytes);
            if let Some(e) = damage {
                warn!(
                    "Archive batch {id} is damaged, keeping {} intact records: {e}",
                    records.len()
                );
                if records.is_empty() {
                    // Nothing salvageable; move it aside so it stops blocking the queue.
                    let aside = path.with_extension(CORRUPT_EXTENSION);
                    if let Err(e) = fs::rename(&path, &aside) {
                        error!("Failed to set aside damaged archive batch {id}: {e}");
                    }
                    self.sealed.pop_front();
                    continue;
                }
            }
            return Ok(Some(Batch::new(id, records)));
        }
    }
}

fn parse_sequence(id: &str) -> Option<u64> {
    let (sequence, _) = id.split_once('-')?;
    u64::from_str_radix(sequence, 16).ok()
}

impl Buffer for ArchiveBuffer {
    fn kind(&self) -> BufferKind {
        BufferKind::Archive
    }

    fn add(&mut self, record: LogRecord) {
        if self.open.persisted {
            if let Err(e) = self.append(&record) {
                error!(
                    "Failed to persist archive batch {}, keeping it in memory only: {e}",
                    self.open.id
                );
                self.open.persisted = false;
            }
        }
        self.open.records.push(record);
        if self.open.records.len() >= self.batch_size {
            self.seal();
        }
    }

    fn next_batch(&mut self) -> Option<Batch> {
        if let Some(batch) = &self.in_flight {
            return Some(batch.clone());
        }
        let mut loaded = self.load_front();
        if matches!(loaded, Ok(None)) && !self.open.records.is_empty() {
            self.seal();
            loaded = self.load_front();
        }
        match loaded {
            Ok(batch) => {
                self.in_flight.clone_from(&batch);
                batch
            }
            Err(e) => {
                error!("Failed to read archive batch: {e}");
                None
            }
        }
    }

    fn remove_batch(&mut self, batch_id: &str) {
        if self
            .in_flight
            .as_ref()
            .is_some_and(|batch| batch.id == batch_id)
        {
            self.in_flight = None;
        }
        let Some(index) = self.sealed.iter().position(|b| b.id == batch_id) else {
            return;
        };
        self.sealed.remove(index);
        match fs::remove_file(self.batch_path(batch_id)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => error!("Failed to delete delivered archive batch {batch_id}: {e}"),
        }
    }

    fn is_empty(&self) -> bool {
        self.sealed.is_empty() && self.open.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::LogLevel;
    use tracing_test::traced_test;

    fn record(position: u64) -> LogRecord {
        LogRecord {
            position,
            timestamp: 1_700_000_000.0,
            level: LogLevel::Info,
            message: format!("record {position}"),
            label: "archive".to_string(),
            meta: None,
            source: None,
        }
    }

    fn positions(batch: &Batch) -> Vec<u64> {
        batch.records.iter().map(|r| r.position).collect()
    }

    fn drain(buffer: &mut ArchiveBuffer) -> Vec<Vec<u64>> {
        let mut out = Vec::new();
        while let Some(batch) = buffer.next_batch() {
            out.push(positions(&batch));
            buffer.remove_batch(&batch.id);
        }
        out
    }

    #[test]
    fn test_seals_at_threshold_in_creation_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut buffer = ArchiveBuffer::open(dir.path(), 3).expect("open");
        for position in 0..7 {
            buffer.add(record(position));
        }
        assert_eq!(buffer.pending_batches(), 3);
        assert_eq!(
            drain(&mut buffer),
            vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_next_batch_is_stable_while_records_flow() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut buffer = ArchiveBuffer::open(dir.path(), 2).expect("open");
        buffer.add(record(0));
        let first = buffer.next_batch().expect("batch");
        assert_eq!(positions(&first), vec![0]);

        buffer.add(record(1));
        buffer.add(record(2));
        assert_eq!(buffer.next_batch(), Some(first.clone()));

        buffer.remove_batch(&first.id);
        assert_eq!(drain(&mut buffer), vec![vec![1, 2]]);
    }

    #[test]
    fn test_batches_survive_restart_and_removal_is_durable() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let mut buffer = ArchiveBuffer::open(dir.path(), 3).expect("open");
            for position in 0..7 {
                buffer.add(record(position));
            }
            let first = buffer.next_batch().expect("batch");
            assert_eq!(positions(&first), vec![0, 1, 2]);
            buffer.remove_batch(&first.id);
        }

        let mut buffer = ArchiveBuffer::open(dir.path(), 3).expect("reopen");
        assert_eq!(buffer.pending_batches(), 2);
        buffer.add(record(7));
        assert_eq!(drain(&mut buffer), vec![vec![3, 4, 5], vec![6], vec![7]]);

        let leftover = fs::read_dir(dir.path()).expect("read_dir").count();
        assert_eq!(leftover, 0);
    }

    #[test]
    #[traced_test]
    fn test_write_failure_keeps_records_in_memory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive_dir = dir.path().join("archive");
        let mut buffer = ArchiveBuffer::open(&archive_dir, 2).expect("open");
        fs::remove_dir_all(&archive_dir).expect("remove dir");

        buffer.add(record(0));
        buffer.add(record(1));
        buffer.add(record(2));

        assert!(logs_contain("Failed to persist archive batch"));
        assert_eq!(drain(&mut buffer), vec![vec![0, 1], vec![2]]);
    }

    #[test]
    fn test_unreadable_batch_is_set_aside() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("0000000000000000-bad.batch"), [0xff, 0xff, 0xff]).expect("write");
        let mut buffer = ArchiveBuffer::open(dir.path(), 3).expect("open");
        buffer.add(record(9));

        assert_eq!(drain(&mut buffer), vec![vec![9]]);
        assert!(dir.path().join("0000000000000000-bad.corrupt").exists());
    }

    #[test]
    fn test_sequence_resumes_after_existing_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("00000000000000a0-x.batch"), []).expect("write");
        let buffer = ArchiveBuffer::open(dir.path(), 3).expect("open");
        assert_eq!(parse_sequence(&buffer.open.id), Some(0xa1));
    }
}
