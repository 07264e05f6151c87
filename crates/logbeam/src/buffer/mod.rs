// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Staging areas between the redaction step and the transport.
//!
//! Every buffer hands out batches through [`Buffer::next_batch`] and only forgets
//! them on [`Buffer::remove_batch`]. Asking again before removal yields the same
//! batch, so a send that is still in flight can never be duplicated by a sweep.

pub mod archive;
pub mod live;

use std::fmt;

use crate::record::{Batch, LogRecord};

pub use archive::ArchiveBuffer;
pub use live::LiveBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Live,
    Archive,
    Null,
}

impl fmt::Display for BufferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferKind::Live => f.write_str("live"),
            BufferKind::Archive => f.write_str("archive"),
            BufferKind::Null => f.write_str("null"),
        }
    }
}

pub trait Buffer: Send {
    fn kind(&self) -> BufferKind;

    /// Never fails; may evict (live) or seal and persist (archive).
    fn add(&mut self, record: LogRecord);

    /// The oldest batch not yet removed, or `None` when there is nothing to send.
    fn next_batch(&mut self) -> Option<Batch>;

    fn remove_batch(&mut self, batch_id: &str);

    fn is_empty(&self) -> bool;
}

/// Stands in for a disabled channel: drops everything it is given.
#[derive(Debug, Default)]
pub struct NullBuffer;

impl Buffer for NullBuffer {
    fn kind(&self) -> BufferKind {
        BufferKind::Null
    }

    fn add(&mut self, _record: LogRecord) {}

    fn next_batch(&mut self) -> Option<Batch> {
        None
    }

    fn remove_batch(&mut self, _batch_id: &str) {}

    fn is_empty(&self) -> bool {
        true
    }
}
