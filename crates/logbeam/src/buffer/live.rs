// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;

use tracing::warn;

use crate::buffer::{Buffer, BufferKind};
use crate::record::{Batch, LogRecord};

pub const DEFAULT_LIVE_CAPACITY: usize = 1000;

/// In-memory ring for the live channel. When full the oldest record is
/// dropped; losing records here is acceptable.
///
/// `next_batch` moves the whole ring into an in-flight slot so records added
/// while the batch is on the wire start a fresh ring.
#[derive(Debug)]
pub struct LiveBuffer {
    ring: VecDeque<LogRecord>,
    capacity: usize,
    in_flight: Option<Batch>,
    next_id: u64,
    dropped: u64,
}

impl LiveBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: VecDeque::with_capacity(capacity),
            capacity,
            in_flight: None,
            next_id: 0,
            dropped: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.ring.len() + self.in_flight.as_ref().map_or(0, Batch::len)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Default for LiveBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LIVE_CAPACITY)
    }
}

impl Buffer for LiveBuffer {
    fn kind(&self) -> BufferKind {
        BufferKind::Live
    }

    fn add(&mut self, record: LogRecord) {
        if self.ring.len() >= self.capacity {
            self.ring.pop_front();
            self.dropped += 1;
            if self.dropped.is_power_of_two() {
                warn!("Live buffer full, {} records dropped so far", self.dropped);
            }
        }
        self.ring.push_back(record);
    }

    fn next_batch(&mut self) -> Option<Batch> {
        if let Some(batch) = &self.in_flight {
            return Some(batch.clone());
        }
        if self.ring.is_empty() {
            return None;
        }
        let id = format!("live-{}", self.next_id);
        self.next_id += 1;
        let batch = Batch::new(id, self.ring.drain(..).collect());
        self.in_flight = Some(batch.clone());
        Some(batch)
    }

    fn remove_batch(&mut self, batch_id: &str) {
        if self
            .in_flight
            .as_ref()
            .is_some_and(|batch| batch.id == batch_id)
        {
            self.in_flight = None;
        }
    }

    fn is_empty(&self) -> bool {
        self.ring.is_empty() && self.in_flight.is_none()
    }
}
