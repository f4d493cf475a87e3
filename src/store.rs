//! Idempotent persistence of indicator rows keyed by `(symbol, ts_ms)`.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::indicators::{IndicatorRecord, IndicatorValues};

const REQUIRED_COLUMNS: [&str; 19] = [
    "symbol",
    "ts_ms",
    "sample_count",
    "sma_20",
    "sma_50",
    "ema_12",
    "ema_26",
    "rsi_14",
    "macd_line",
    "macd_signal",
    "macd_histogram",
    "bb_upper",
    "bb_middle",
    "bb_lower",
    "stoch_k",
    "stoch_d",
    "atr_14",
    "volatility_20",
    "computed_at_ms",
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("incompatible indicator_records schema: missing column {0}")]
    IncompatibleSchema(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub rows: u64,
    /// SHA-256 over the exact values written, in write order.
    pub digest: String,
}

/// Write side of a derived series. Writers of one key are last-write-wins.
pub trait RecordStore: Send + Sync + 'static {
    type Record;

    fn latest_ts(&self, symbol: &str) -> Result<Option<i64>, StoreError>;

    fn latest_ts_any(&self) -> Result<Option<i64>, StoreError>;

    /// Oldest of the per-symbol latest timestamps, i.e. the most lagging
    /// series. `None` only when nothing is persisted.
    fn stalest_latest_ts(&self) -> Result<Option<i64>, StoreError>;

    /// All rows are written in one transaction or not at all.
    fn upsert(&self, records: &[Self::Record]) -> Result<UpsertOutcome, StoreError>;
}

/// SQLite-backed indicator table.
///
/// The per-call transaction is the only atomicity boundary. Two processes
/// racing on one symbol may both recompute, which is harmless because the
/// rows they write are identical for identical input.
pub struct SqliteIndicatorStore {
    conn: Mutex<Connection>,
}

impl SqliteIndicatorStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
            PRAGMA busy_timeout=5000;
            ",
        )?;
        ensure_schema(&conn)?;

        info!(
            component = "store",
            event = "store.open",
            path = %path.display()
        );
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn records_for(&self, symbol: &str) -> Result<Vec<IndicatorRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "
            SELECT
                symbol, ts_ms, sample_count,
                sma_20, sma_50, ema_12, ema_26, rsi_14,
                macd_line, macd_signal, macd_histogram,
                bb_upper, bb_middle, bb_lower,
                stoch_k, stoch_d, atr_14, volatility_20,
                computed_at_ms
            FROM indicator_records
            WHERE symbol = ?1
            ORDER BY ts_ms ASC
            ",
        )?;
        let rows = stmt.query_map(params![symbol], record_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = self.lock().query_row(
            "SELECT COUNT(*) FROM indicator_records",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .expect("sqlite connection lock should not be poisoned")
    }
}

impl RecordStore for SqliteIndicatorStore {
    type Record = IndicatorRecord;

    fn latest_ts(&self, symbol: &str) -> Result<Option<i64>, StoreError> {
        let latest: Option<i64> = self.lock().query_row(
            "SELECT MAX(ts_ms) FROM indicator_records WHERE symbol = ?1",
            params![symbol],
            |row| row.get(0),
        )?;
        Ok(latest)
    }

    fn latest_ts_any(&self) -> Result<Option<i64>, StoreError> {
        let latest: Option<i64> =
            self.lock()
                .query_row("SELECT MAX(ts_ms) FROM indicator_records", [], |row| {
                    row.get(0)
                })?;
        Ok(latest)
    }

    fn stalest_latest_ts(&self) -> Result<Option<i64>, StoreError> {
        let stalest: Option<i64> = self.lock().query_row(
            "
            SELECT MIN(latest) FROM (
                SELECT MAX(ts_ms) AS latest FROM indicator_records GROUP BY symbol
            )
            ",
            [],
            |row| row.get(0),
        )?;
        Ok(stalest)
    }

    fn upsert(&self, records: &[IndicatorRecord]) -> Result<UpsertOutcome, StoreError> {
        if records.is_empty() {
            return Ok(UpsertOutcome {
                rows: 0,
                digest: hex::encode(Sha256::new().finalize()),
            });
        }

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut hasher = Sha256::new();
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO indicator_records (
                    symbol, ts_ms, sample_count,
                    sma_20, sma_50, ema_12, ema_26, rsi_14,
                    macd_line, macd_signal, macd_histogram,
                    bb_upper, bb_middle, bb_lower,
                    stoch_k, stoch_d, atr_14, volatility_20,
                    computed_at_ms
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                    ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19
                )
                ON CONFLICT(symbol, ts_ms) DO UPDATE SET
                    sample_count = excluded.sample_count,
                    sma_20 = excluded.sma_20,
                    sma_50 = excluded.sma_50,
                    ema_12 = excluded.ema_12,
                    ema_26 = excluded.ema_26,
                    rsi_14 = excluded.rsi_14,
                    macd_line = excluded.macd_line,
                    macd_signal = excluded.macd_signal,
                    macd_histogram = excluded.macd_histogram,
                    bb_upper = excluded.bb_upper,
                    bb_middle = excluded.bb_middle,
                    bb_lower = excluded.bb_lower,
                    stoch_k = excluded.stoch_k,
                    stoch_d = excluded.stoch_d,
                    atr_14 = excluded.atr_14,
                    volatility_20 = excluded.volatility_20,
                    computed_at_ms = excluded.computed_at_ms
                ",
            )?;

            for record in records {
                let v = &record.values;
                stmt.execute(params![
                    record.symbol,
                    record.ts_ms_utc,
                    record.sample_count,
                    v.sma_20,
                    v.sma_50,
                    v.ema_12,
                    v.ema_26,
                    v.rsi_14,
                    v.macd_line,
                    v.macd_signal,
                    v.macd_histogram,
                    v.bb_upper,
                    v.bb_middle,
                    v.bb_lower,
                    v.stoch_k,
                    v.stoch_d,
                    v.atr_14,
                    v.volatility_20,
                    record.computed_at_ms_utc,
                ])?;
                hash_record(&mut hasher, record);
            }
        }
        tx.commit()?;

        let outcome = UpsertOutcome {
            rows: records.len() as u64,
            digest: hex::encode(hasher.finalize()),
        };
        debug!(
            component = "store",
            event = "store.upsert",
            symbol = %records[0].symbol,
            rows = outcome.rows,
            digest = %outcome.digest
        );
        Ok(outcome)
    }
}

fn hash_record(hasher: &mut Sha256, record: &IndicatorRecord) {
    let v = &record.values;
    hasher.update(record.symbol.as_bytes());
    hasher.update([0u8]);
    hasher.update(record.ts_ms_utc.to_le_bytes());
    hasher.update(record.sample_count.to_le_bytes());
    for value in [
        v.sma_20,
        v.sma_50,
        v.ema_12,
        v.ema_26,
        v.rsi_14,
        v.macd_line,
        v.macd_signal,
        v.macd_histogram,
        v.bb_upper,
        v.bb_middle,
        v.bb_lower,
        v.stoch_k,
        v.stoch_d,
        v.atr_14,
        v.volatility_20,
    ] {
        hasher.update(value.to_bits().to_le_bytes());
    }
    hasher.update(record.computed_at_ms_utc.to_le_bytes());
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<IndicatorRecord> {
    Ok(IndicatorRecord {
        symbol: row.get(0)?,
        ts_ms_utc: row.get(1)?,
        sample_count: row.get(2)?,
        values: IndicatorValues {
            sma_20: row.get(3)?,
            sma_50: row.get(4)?,
            ema_12: row.get(5)?,
            ema_26: row.get(6)?,
            rsi_14: row.get(7)?,
            macd_line: row.get(8)?,
            macd_signal: row.get(9)?,
            macd_histogram: row.get(10)?,
            bb_upper: row.get(11)?,
            bb_middle: row.get(12)?,
            bb_lower: row.get(13)?,
            stoch_k: row.get(14)?,
            stoch_d: row.get(15)?,
            atr_14: row.get(16)?,
            volatility_20: row.get(17)?,
        },
        computed_at_ms_utc: row.get(18)?,
    })
}

fn ensure_schema(conn: &Connection) -> Result<(), StoreError> {
    if !table_exists(conn, "indicator_records")? {
        conn.execute_batch(
            "
            CREATE TABLE indicator_records (
                symbol TEXT NOT NULL,
                ts_ms INTEGER NOT NULL,
                sample_count INTEGER NOT NULL,
                sma_20 REAL NOT NULL,
                sma_50 REAL NOT NULL,
                ema_12 REAL NOT NULL,
                ema_26 REAL NOT NULL,
                rsi_14 REAL NOT NULL,
                macd_line REAL NOT NULL,
                macd_signal REAL NOT NULL,
                macd_histogram REAL NOT NULL,
                bb_upper REAL NOT NULL,
                bb_middle REAL NOT NULL,
                bb_lower REAL NOT NULL,
                stoch_k REAL NOT NULL,
                stoch_d REAL NOT NULL,
                atr_14 REAL NOT NULL,
                volatility_20 REAL NOT NULL,
                computed_at_ms INTEGER NOT NULL,
                PRIMARY KEY(symbol, ts_ms)
            ) WITHOUT ROWID;
            ",
        )?;
        return Ok(());
    }

    for column in REQUIRED_COLUMNS {
        if !table_has_column(conn, "indicator_records", column)? {
            return Err(StoreError::IncompatibleSchema(column.to_string()));
        }
    }
    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool, StoreError> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1 LIMIT 1",
            params![table],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    Ok(exists)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, StoreError> {
    let pragma = format!("PRAGMA table_info({table})");
    let mut stmt = conn.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
