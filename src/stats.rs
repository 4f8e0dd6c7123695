//! Persisted hit counters with hourly, daily and monthly rollups.
//!
//! The ledger keeps a rolling window per tier: 24 hours, 31 days and
//! 12 months, each cell holding `(hits, bytes)`. Rollover is lazy: every
//! mutation first compares the stored head stamps against the current UTC
//! wall clock and zeroes any buckets that went stale in between. The
//! on-disk form is a single bincode file under `data/`, written atomically
//! via a sibling temp file and rename.

use crate::error::Result;
use chrono::{DateTime, Datelike, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::warn;

const HOURS: usize = 24;
const DAYS: usize = 31;
const MONTHS: usize = 12;

const STATS_FILE: &str = "stats";
const STATS_TMP: &str = "stats.tmp";

/// One rollup cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatCell {
    pub hits: i64,
    pub bytes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StatsData {
    hour_stamp: i64,
    day_stamp: i64,
    month_stamp: i64,
    hours: Vec<StatCell>,
    days: Vec<StatCell>,
    months: Vec<StatCell>,
}

impl StatsData {
    fn empty_at(now: DateTime<Utc>) -> Self {
        Self {
            hour_stamp: hour_stamp(now),
            day_stamp: day_stamp(now),
            month_stamp: month_stamp(now),
            hours: vec![StatCell::default(); HOURS],
            days: vec![StatCell::default(); DAYS],
            months: vec![StatCell::default(); MONTHS],
        }
    }

    fn rotate(&mut self, now: DateTime<Utc>) {
        rotate_tier(&mut self.hours, &mut self.hour_stamp, hour_stamp(now));
        rotate_tier(&mut self.days, &mut self.day_stamp, day_stamp(now));
        rotate_tier(&mut self.months, &mut self.month_stamp, month_stamp(now));
    }
}

fn hour_stamp(t: DateTime<Utc>) -> i64 {
    t.timestamp().div_euclid(3600)
}

fn day_stamp(t: DateTime<Utc>) -> i64 {
    t.timestamp().div_euclid(86400)
}

fn month_stamp(t: DateTime<Utc>) -> i64 {
    (t.year() as i64) * 12 + (t.month0() as i64)
}

/// Zero every bucket between the stored stamp and `cur`, then advance the
/// head. Jumps larger than the window wipe the whole tier.
fn rotate_tier(cells: &mut [StatCell], stamp: &mut i64, cur: i64) {
    if cur == *stamp {
        return;
    }
    let len = cells.len() as i64;
    let gap = (cur - *stamp).clamp(0, len);
    for i in 1..=gap {
        let idx = (*stamp + i).rem_euclid(len) as usize;
        cells[idx] = StatCell::default();
    }
    *stamp = cur;
}

/// Persisted hit/byte counters shared by the lifecycle and the frontend.
pub struct StatsLedger {
    inner: Mutex<StatsData>,
}

impl StatsLedger {
    /// Start with empty counters at the current wall time.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatsData::empty_at(Utc::now())),
        }
    }

    /// Load persisted counters from `dir/stats`.
    ///
    /// A missing or corrupt file is not fatal: the ledger starts empty and
    /// a warning is surfaced.
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(STATS_FILE);
        let data = match fs::read(&path) {
            Ok(raw) => match bincode::deserialize::<StatsData>(&raw) {
                Ok(mut data) => {
                    // Stored vectors may come from a foreign build; normalise
                    // lengths before indexing into them.
                    data.hours.resize(HOURS, StatCell::default());
                    data.days.resize(DAYS, StatCell::default());
                    data.months.resize(MONTHS, StatCell::default());
                    data
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "stats file corrupt, starting empty");
                    StatsData::empty_at(Utc::now())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StatsData::empty_at(Utc::now()),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read stats file, starting empty");
                StatsData::empty_at(Utc::now())
            }
        };
        Self {
            inner: Mutex::new(data),
        }
    }

    /// Fold a batch of served hits into the head buckets of every tier.
    pub fn add_hits(&self, hits: i64, bytes: i64) {
        self.add_hits_at(hits, bytes, Utc::now());
    }

    fn add_hits_at(&self, hits: i64, bytes: i64, now: DateTime<Utc>) {
        let mut data = self.inner.lock();
        data.rotate(now);

        let hour = data.hour_stamp.rem_euclid(HOURS as i64) as usize;
        data.hours[hour].hits += hits;
        data.hours[hour].bytes += bytes;

        let day = data.day_stamp.rem_euclid(DAYS as i64) as usize;
        data.days[day].hits += hits;
        data.days[day].bytes += bytes;

        let month = data.month_stamp.rem_euclid(MONTHS as i64) as usize;
        data.months[month].hits += hits;
        data.months[month].bytes += bytes;
    }

    /// Write the counters to `dir/stats` atomically.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let raw = {
            let data = self.inner.lock();
            bincode::serialize(&*data)?
        };
        let tmp = dir.join(STATS_TMP);
        fs::write(&tmp, &raw)?;
        fs::rename(&tmp, dir.join(STATS_FILE))?;
        Ok(())
    }

    /// Snapshot of every tier, head bucket first.
    pub fn snapshot(&self) -> StatsSnapshot {
        let data = self.inner.lock();
        StatsSnapshot {
            hours: reorder(&data.hours, data.hour_stamp),
            days: reorder(&data.days, data.day_stamp),
            months: reorder(&data.months, data.month_stamp),
        }
    }
}

impl Default for StatsLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn reorder(cells: &[StatCell], stamp: i64) -> Vec<StatCell> {
    let len = cells.len() as i64;
    (0..len)
        .map(|back| cells[(stamp - back).rem_euclid(len) as usize])
        .collect()
}

/// Point-in-time view of the rollups, newest bucket first.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub hours: Vec<StatCell>,
    pub days: Vec<StatCell>,
    pub months: Vec<StatCell>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, 30, 0).unwrap()
    }

    #[test]
    fn test_add_and_snapshot() {
        let ledger = StatsLedger::new();
        ledger.add_hits(3, 300);
        ledger.add_hits(2, 200);
        let snap = ledger.snapshot();
        assert_eq!(snap.hours[0], StatCell { hits: 5, bytes: 500 });
        assert_eq!(snap.days[0], StatCell { hits: 5, bytes: 500 });
        assert_eq!(snap.months[0], StatCell { hits: 5, bytes: 500 });
    }

    #[test]
    fn test_hour_rollover_zeroes_intermediates() {
        let ledger = StatsLedger::new();
        let t0 = at(2024, 5, 10, 8);
        ledger.add_hits_at(1, 10, t0);
        // Three hours later the two skipped buckets must be zero.
        let t1 = at(2024, 5, 10, 11);
        ledger.add_hits_at(4, 40, t1);
        let snap = ledger.snapshot();
        assert_eq!(snap.hours[0], StatCell { hits: 4, bytes: 40 });
        assert_eq!(snap.hours[1], StatCell::default());
        assert_eq!(snap.hours[2], StatCell::default());
        assert_eq!(snap.hours[3], StatCell { hits: 1, bytes: 10 });
        // Same day, so the day bucket accumulates both.
        assert_eq!(snap.days[0], StatCell { hits: 5, bytes: 50 });
    }

    #[test]
    fn test_stale_buckets_cleared_after_window() {
        let ledger = StatsLedger::new();
        ledger.add_hits_at(7, 70, at(2024, 5, 10, 8));
        // More than 24 hours later every hour bucket except the head is zero.
        ledger.add_hits_at(1, 10, at(2024, 5, 12, 8));
        let snap = ledger.snapshot();
        assert_eq!(snap.hours[0], StatCell { hits: 1, bytes: 10 });
        for cell in &snap.hours[1..] {
            assert_eq!(*cell, StatCell::default());
        }
    }

    #[test]
    fn test_month_rollover() {
        let ledger = StatsLedger::new();
        ledger.add_hits_at(2, 20, at(2024, 11, 15, 0));
        ledger.add_hits_at(3, 30, at(2025, 1, 15, 0));
        let snap = ledger.snapshot();
        assert_eq!(snap.months[0], StatCell { hits: 3, bytes: 30 });
        assert_eq!(snap.months[1], StatCell::default());
        assert_eq!(snap.months[2], StatCell { hits: 2, bytes: 20 });
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = StatsLedger::new();
        ledger.add_hits(9, 900);
        ledger.save(dir.path()).unwrap();
        assert!(dir.path().join("stats").exists());
        assert!(!dir.path().join("stats.tmp").exists());

        let restored = StatsLedger::load(dir.path());
        let snap = restored.snapshot();
        assert_eq!(snap.hours[0], StatCell { hits: 9, bytes: 900 });
    }

    #[test]
    fn test_load_corrupt_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("stats"), b"not a ledger").unwrap();
        let ledger = StatsLedger::load(dir.path());
        let snap = ledger.snapshot();
        assert!(snap.hours.iter().all(|c| *c == StatCell::default()));
    }

    #[test]
    fn test_load_missing_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = StatsLedger::load(dir.path());
        assert!(ledger
            .snapshot()
            .months
            .iter()
            .all(|c| *c == StatCell::default()));
    }
}
