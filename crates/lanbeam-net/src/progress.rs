//! Percent-complete and throughput accounting.
//!
//! Every method takes the current [`Instant`] explicitly so the sampling
//! window can be exercised deterministically.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;

use lanbeam_shared::constants::PROGRESS_SAMPLE_MS;
use lanbeam_shared::format::format_file_size;
use lanbeam_shared::types::TransferId;

/// Last computed throughput.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "value")]
pub enum Rate {
    BytesPerSecond(u64),
    Complete,
}

impl std::fmt::Display for Rate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rate::BytesPerSecond(bps) => write!(f, "{}/s", format_file_size(*bps)),
            Rate::Complete => f.write_str("Complete"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub transfer_id: TransferId,
    pub percent: u8,
    pub rate: Rate,
}

#[derive(Debug, Clone)]
struct ProgressRecord {
    start_time: Instant,
    last_sample_time: Instant,
    /// Bytes moved over the whole transfer at the last rate sample.
    bytes_at_last_sample: u64,
    /// Size of the current file.
    total_bytes: u64,
    /// Bytes of the files finished before the current one.
    completed_bytes: u64,
    /// Bytes of the current file moved so far.
    file_bytes: u64,
    percent: u8,
    rate: Rate,
}

impl ProgressRecord {
    fn new(total_bytes: u64, now: Instant) -> Self {
        Self {
            start_time: now,
            last_sample_time: now,
            bytes_at_last_sample: 0,
            total_bytes,
            completed_bytes: 0,
            file_bytes: 0,
            percent: 0,
            rate: Rate::BytesPerSecond(0),
        }
    }
}

/// `floor(bytes / total * 100)`, zero when `total` is zero, clamped to 100.
pub fn percent_of(bytes: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (bytes as u128 * 100) / total as u128;
    pct.min(100) as u8
}

/// Progress records keyed by transfer id.
#[derive(Debug)]
pub struct ProgressTracker {
    records: HashMap<TransferId, ProgressRecord>,
    sample_window: Duration,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(Duration::from_millis(PROGRESS_SAMPLE_MS))
    }
}

impl ProgressTracker {
    pub fn new(sample_window: Duration) -> Self {
        Self {
            records: HashMap::new(),
            sample_window,
        }
    }

    /// Begin (or restart) tracking `id` toward `total_bytes`.
    pub fn start(&mut self, id: TransferId, total_bytes: u64, now: Instant) {
        self.records.insert(id, ProgressRecord::new(total_bytes, now));
    }

    /// Move on to the next file of `id`, starting the record on the first
    /// file. Percent restarts for the new file; the sampling clock and the
    /// last rate carry over.
    pub fn begin_file(&mut self, id: TransferId, total_bytes: u64, now: Instant) {
        match self.records.get_mut(&id) {
            Some(record) => {
                record.completed_bytes += record.file_bytes;
                record.file_bytes = 0;
                record.total_bytes = total_bytes;
                record.percent = 0;
            }
            None => self.start(id, total_bytes, now),
        }
    }

    /// Record that `bytes` of `total` have moved.
    ///
    /// The rate is only recomputed once more than the sample window has
    /// elapsed since the previous sample; otherwise the last rate is kept.
    pub fn update(
        &mut self,
        id: TransferId,
        bytes: u64,
        total: u64,
        now: Instant,
    ) -> Option<ProgressSnapshot> {
        let record = self.records.get_mut(&id)?;
        record.total_bytes = total;
        record.file_bytes = bytes;
        record.percent = percent_of(bytes, total);

        let elapsed = now.saturating_duration_since(record.last_sample_time);
        if elapsed > self.sample_window {
            let moved_total = record.completed_bytes + bytes;
            let elapsed_ms = elapsed.as_millis().max(1) as u64;
            let moved = moved_total.saturating_sub(record.bytes_at_last_sample);
            record.rate = Rate::BytesPerSecond(moved.saturating_mul(1000) / elapsed_ms);
            record.last_sample_time = now;
            record.bytes_at_last_sample = moved_total;
        }

        Some(ProgressSnapshot {
            transfer_id: id,
            percent: record.percent,
            rate: record.rate,
        })
    }

    /// Pin the current file at 100 %, keeping the last rate.
    pub fn finish_file(&mut self, id: TransferId) -> Option<ProgressSnapshot> {
        let record = self.records.get_mut(&id)?;
        record.percent = 100;
        record.file_bytes = record.total_bytes;
        Some(ProgressSnapshot {
            transfer_id: id,
            percent: 100,
            rate: record.rate,
        })
    }

    /// Mark the whole transfer complete. The caller schedules [`remove`]
    /// after the cleanup delay.
    ///
    /// [`remove`]: ProgressTracker::remove
    pub fn complete(&mut self, id: TransferId) -> Option<ProgressSnapshot> {
        let record = self.records.get_mut(&id)?;
        record.percent = 100;
        record.rate = Rate::Complete;
        Some(ProgressSnapshot {
            transfer_id: id,
            percent: 100,
            rate: Rate::Complete,
        })
    }

    /// Time since tracking of `id` began.
    pub fn elapsed(&self, id: &TransferId, now: Instant) -> Option<Duration> {
        self.records
            .get(id)
            .map(|r| now.saturating_duration_since(r.start_time))
    }

    pub fn remove(&mut self, id: &TransferId) -> bool {
        self.records.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
