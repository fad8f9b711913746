//! Chunk-level progress accounting for export and import.

use crate::kv::EntryCounts;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ChunkProgress {
    start_time: Instant,
    pub chunks_total: usize,
    pub chunks_done: usize,
    pub counts: EntryCounts,
}

impl ChunkProgress {
    /// `already_done` chunks were satisfied before this run, e.g. by a checkpoint.
    pub fn new(chunks_total: usize, already_done: usize) -> Self {
        Self {
            start_time: Instant::now(),
            chunks_total,
            chunks_done: already_done.min(chunks_total),
            counts: EntryCounts::default(),
        }
    }

    pub fn complete_chunk(&mut self, counts: &EntryCounts) {
        self.chunks_done = (self.chunks_done + 1).min(self.chunks_total);
        self.counts.add(counts);
    }

    /// Fraction completed; an empty job is complete.
    pub fn fraction(&self) -> f64 {
        if self.chunks_total == 0 {
            1.0
        } else {
            self.chunks_done as f64 / self.chunks_total as f64
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Bytes per second since start.
    pub fn average_speed(&self) -> u64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (self.counts.data_size as f64 / elapsed) as u64
        } else {
            0
        }
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fraction_counts_checkpointed_chunks() {
        let mut progress = ChunkProgress::new(4, 1);
        assert!((progress.fraction() - 0.25).abs() < 1e-9);
        progress.complete_chunk(&EntryCounts {
            data_size: 100,
            rows: 2,
            index_entries: 0,
        });
        assert!((progress.fraction() - 0.5).abs() < 1e-9);
        assert_eq!(progress.counts.rows, 2);
    }

    #[test]
    fn test_empty_job_is_complete() {
        assert_eq!(ChunkProgress::new(0, 0).fraction(), 1.0);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1_048_576), "1.00 MB");
        assert_eq!(format_speed(2048), "2.00 KB/s");
    }
}
