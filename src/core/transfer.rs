//! Transfer records and progress accounting.

use serde::Serialize;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::core::config::PROGRESS_INTERVAL;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// One logical file movement, in either direction.
#[derive(Debug, Clone, Serialize)]
pub struct TransferRecord {
    pub id: Uuid,
    pub direction: Direction,
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub peer_id: String,
    /// UI aggregation hint for fan-out sends; never sent on the wire.
    pub group_id: Option<Uuid>,
    pub progress: u8,
    pub status: TransferStatus,
}

impl TransferRecord {
    pub fn new(
        id: Uuid,
        direction: Direction,
        peer_id: impl Into<String>,
        file_name: impl Into<String>,
        file_size: u64,
        file_type: impl Into<String>,
    ) -> Self {
        Self {
            id,
            direction,
            file_name: file_name.into(),
            file_size,
            file_type: file_type.into(),
            peer_id: peer_id.into(),
            group_id: None,
            progress: 0,
            status: TransferStatus::Pending,
        }
    }

    /// Raise progress; values below the current one are ignored.
    pub fn advance(&mut self, percent: u8) -> u8 {
        self.progress = self.progress.max(percent.min(100));
        self.progress
    }
}

/// `min(100, done / total * 100)`, with an empty file counting as done.
pub fn progress_percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (done.saturating_mul(100) / total).min(100) as u8
}

/// Rate limiter for progress events: at most one per interval, except the
/// final update which always passes. Emitted values never decrease.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last_emit: Option<Instant>,
    last_percent: Option<u8>,
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(PROGRESS_INTERVAL)
    }
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            last_percent: None,
        }
    }

    /// Returns the value to publish, if any.
    pub fn update(&mut self, percent: u8, is_final: bool) -> Option<u8> {
        if let Some(last) = self.last_percent
            && (percent < last || (percent == last && !is_final))
        {
            return None;
        }
        let due = self
            .last_emit
            .is_none_or(|at| at.elapsed() >= self.interval);
        if !is_final && !due {
            return None;
        }
        self.last_emit = Some(Instant::now());
        self.last_percent = Some(percent);
        Some(percent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_is_capped_and_floors() {
        assert_eq!(progress_percent(0, 200_000), 0);
        assert_eq!(progress_percent(65_536, 200_000), 32);
        assert_eq!(progress_percent(200_000, 200_000), 100);
        assert_eq!(progress_percent(300_000, 200_000), 100);
        assert_eq!(progress_percent(0, 0), 100);
    }

    #[test]
    fn record_progress_never_decreases() {
        let mut record =
            TransferRecord::new(Uuid::new_v4(), Direction::Incoming, "PEER01", "a.bin", 10, "x");
        assert_eq!(record.advance(40), 40);
        assert_eq!(record.advance(20), 40);
        assert_eq!(record.advance(250), 100);
    }

    #[test]
    fn throttle_limits_rate_but_passes_final() {
        let mut throttle = ProgressThrottle::new(Duration::from_secs(3600));
        assert_eq!(throttle.update(10, false), Some(10));
        assert_eq!(throttle.update(20, false), None);
        assert_eq!(throttle.update(100, true), Some(100));
        assert_eq!(throttle.update(100, true), Some(100));
    }

    #[test]
    fn throttle_rejects_regressions() {
        let mut throttle = ProgressThrottle::new(Duration::ZERO);
        assert_eq!(throttle.update(50, false), Some(50));
        assert_eq!(throttle.update(30, false), None);
        assert_eq!(throttle.update(30, true), None);
        assert_eq!(throttle.update(60, false), Some(60));
    }
}
