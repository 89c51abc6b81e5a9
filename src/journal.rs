// =============================================================================
// Trade journal — append-only record of completed exits
// =============================================================================
//
// One JSON line per completed exit cycle (partial and full exits each get
// their own record). The dashboard derives realized P&L and aggregate stats
// from the file; the engine itself never reads it back on the hot path.
// =============================================================================

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::ExitSignal;

/// One completed exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: String,
    pub entry_time: Option<NaiveDateTime>,
    pub entry_price: f64,
    /// Total value received for the exit (sum of fill quantity × price).
    pub exit_value: f64,
    /// Position size at the moment the exit order was placed.
    pub original_size: u64,
    pub exit_signal: ExitSignal,
    pub closed_at: NaiveDateTime,
}

impl TradeRecord {
    /// Realized profit of this exit cycle.
    pub fn realized_pnl(&self) -> f64 {
        self.exit_value - self.entry_price * self.original_size as f64
    }
}

/// Aggregate statistics over the journal, shown on the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct JournalStats {
    pub total_trades: usize,
    pub wins: usize,
    pub win_rate: f64,
    pub total_realized_pnl: f64,
}

/// Append-only journal writer. Appends are serialized by a mutex so two
/// symbol workers closing at the same moment cannot interleave lines.
pub struct TradeJournal {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl TradeJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn append(&self, record: &TradeRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("failed to serialize trade record")?;

        let _guard = self.write_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open trade journal {}", self.path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("failed to append to trade journal {}", self.path.display()))?;
        Ok(())
    }

    /// Read every record. Unparseable lines are skipped with a warning so a
    /// single corrupt line never hides the rest of the history.
    pub fn read_all(&self) -> Result<Vec<TradeRecord>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to open trade journal {}", self.path.display())
                })
            }
        };

        let mut records = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.context("failed to read trade journal line")?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TradeRecord>(&line) {
                Ok(rec) => records.push(rec),
                Err(e) => warn!(line = idx + 1, error = %e, "skipping malformed journal line"),
            }
        }
        Ok(records)
    }

    pub fn stats(&self) -> Result<JournalStats> {
        let records = self.read_all()?;
        let total_trades = records.len();
        let wins = records.iter().filter(|r| r.realized_pnl() > 0.0).count();
        let total_realized_pnl = records.iter().map(TradeRecord::realized_pnl).sum();
        let win_rate = if total_trades > 0 {
            wins as f64 / total_trades as f64
        } else {
            0.0
        };
        Ok(JournalStats {
            total_trades,
            wins,
            win_rate,
            total_realized_pnl,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
