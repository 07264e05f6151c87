// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Allocation of strictly increasing record positions that survive restarts.
//!
//! With a persist interval of `n`, the sequencer writes a reservation `n`
//! positions ahead instead of writing on every allocation. A restart resumes
//! past the reservation, so positions never repeat even though some are
//! skipped.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

use crate::errors::StorageError;

pub trait PositionStore: Send + Sync {
    fn load(&self) -> Result<Option<u64>, StorageError>;

    fn save(&self, position: u64) -> Result<(), StorageError>;
}

/// Keeps the last persisted position in a single small file.
#[derive(Debug, Clone)]
pub struct FilePositionStore {
    path: PathBuf,
}

impl FilePositionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PositionStore for FilePositionStore {
    fn load(&self) -> Result<Option<u64>, StorageError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        raw.trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| StorageError::Invalid(format!("position file: {e}")))
    }

    fn save(&self, position: u64) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Write-then-rename keeps the previous value intact if we crash mid-write.
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(position.to_string().as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryPositionStore {
    value: Mutex<Option<u64>>,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PositionStore for MemoryPositionStore {
    fn load(&self) -> Result<Option<u64>, StorageError> {
        Ok(*self.value.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn save(&self, position: u64) -> Result<(), StorageError> {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = Some(position);
        Ok(())
    }
}

struct SequencerState {
    /// Last position handed out, `None` before the first allocation.
    last: Option<u64>,
    /// Highest position covered by the persisted value.
    reserved: Option<u64>,
}

pub struct PositionSequencer {
    store: Box<dyn PositionStore>,
    persist_interval: u64,
    state: Mutex<SequencerState>,
}

impl PositionSequencer {
    /// Loads the last persisted position. A store that cannot be read is
    /// treated as empty; the failure is logged.
    pub fn new(store: Box<dyn PositionStore>, persist_interval: u64) -> Self {
        let last = match store.load() {
            Ok(last) => last,
            Err(e) => {
                warn!("Failed to load persisted position, starting from 0: {e}");
                None
            }
        };
        debug!("Position sequencer resuming after {last:?}");
        Self {
            store,
            persist_interval: persist_interval.max(1),
            state: Mutex::new(SequencerState {
                last,
                reserved: last,
            }),
        }
    }

    pub fn next(&self) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (position, wrapped) = match state.last {
            Some(last) => last.overflowing_add(1),
            None => (0, false),
        };
        state.last = Some(position);

        let covered = !wrapped && state.reserved.is_some_and(|reserved| position <= reserved);
        if !covered {
            let reservation = position.saturating_add(self.persist_interval - 1);
            match self.store.save(reservation) {
                Ok(()) => state.reserved = Some(reservation),
                Err(e) => warn!("Failed to persist position {reservation}: {e}"),
            }
        }
        position
    }

    pub fn last(&self) -> Option<u64> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last
    }
}
