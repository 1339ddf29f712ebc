//! Partitioned SQLite store: source bars in, feature partitions out.
//!
//! Source bars live in monthly tables `bars_<pair>_<YYYY>_<MM>`. Each feature
//! partition is a `WITHOUT ROWID` table keyed on `ts`, registered in the
//! `feature_partitions` catalog and exposed through a per-pair parent view.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{
    params, params_from_iter, Connection, ErrorCode, OptionalExtension, TransactionBehavior,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::calendar::{months_overlapping, CalendarError, YearMonth};
use crate::family::{FamilyKind, FeatureSchema};
use crate::pairs::Pair;

pub const DEFAULT_DATABASE_PATH: &str = "data/forex.sqlite";
const BASELINE_TABLE: &str = "baseline_rates";
/// How far back a lookback pad may reach across missing or sparse months.
const LOOKBACK_MAX_MONTHS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_DATABASE_PATH),
            busy_timeout_ms: 5_000,
            max_retries: 3,
            retry_backoff_ms: 200,
        }
    }
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_ms: self.retry_backoff_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl RetryPolicy {
    /// Exponential delay before retry number `attempt` (1-based).
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let shift = attempt.saturating_sub(1).min(10);
        self.backoff_ms.saturating_mul(1u64 << shift)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable after {attempts} attempt(s): {message}")]
    Unavailable { attempts: u32, message: String },
    #[error("schema mismatch on {table}: missing columns {missing:?}")]
    SchemaMismatch { table: String, missing: Vec<String> },
    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),
    #[error("cannot decode {table}.{column} at ts {ts_ms_utc}: {detail}")]
    Decode {
        table: String,
        column: String,
        ts_ms_utc: i64,
        detail: String,
    },
    #[error("row at ts {ts_ms_utc} has {found} values, schema has {expected}")]
    RowWidth {
        ts_ms_utc: i64,
        expected: usize,
        found: usize,
    },
    #[error("row at ts {ts_ms_utc} lies outside partition {table}")]
    OutOfPartition { table: String, ts_ms_utc: i64 },
    #[error("calendar error: {0}")]
    Calendar(#[from] CalendarError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        if is_transient(&err) {
            Self::Unavailable {
                attempts: 1,
                message: err.to_string(),
            }
        } else {
            Self::Sqlite(err)
        }
    }
}

fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(
            ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::FileLockingProtocolFailed
        )
    )
}

/// Retries `f` while it fails with [`StoreError::Unavailable`].
pub fn retry<T>(
    policy: &RetryPolicy,
    op: &'static str,
    mut f: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let mut attempt: u32 = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(StoreError::Unavailable { message, .. }) if attempt >= policy.max_retries => {
                return Err(StoreError::Unavailable {
                    attempts: attempt + 1,
                    message,
                })
            }
            Err(err) if err.is_unavailable() => {
                attempt = attempt.saturating_add(1);
                let sleep_ms = policy.delay_ms(attempt);
                warn!(
                    component = "store",
                    event = "store.retry",
                    op,
                    attempt,
                    sleep_ms,
                    error = %err
                );
                std::thread::sleep(Duration::from_millis(sleep_ms));
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceColumn {
    Rate,
    High,
    Low,
    Open,
    Volume,
}

impl SourceColumn {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rate => "rate",
            Self::High => "high",
            Self::Low => "low",
            Self::Open => "open",
            Self::Volume => "volume",
        }
    }
}

/// One per-minute source bar. `rate` is the minute close.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceBar {
    pub ts_ms_utc: i64,
    pub rate: f64,
    pub high: f64,
    pub low: f64,
    pub open: f64,
    pub volume: f64,
}

/// Table family a lookback pad is measured in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesSource {
    Bars,
    Family(FamilyKind),
}

impl SeriesSource {
    pub fn table(self, pair: Pair, month: YearMonth) -> String {
        match self {
            Self::Bars => source_table(pair, month),
            Self::Family(kind) => kind.partition_table(pair, month),
        }
    }
}

pub fn source_table(pair: Pair, month: YearMonth) -> String {
    format!("bars_{}_{}", pair.as_str(), month.table_suffix())
}

/// Dense, `ts`-ascending columns read from the store. Nulls are `NaN`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesFrame {
    pub ts_ms_utc: Vec<i64>,
    pub columns: Vec<(String, Vec<f64>)>,
}

impl SeriesFrame {
    fn with_columns<S: AsRef<str>>(names: &[S]) -> Self {
        Self {
            ts_ms_utc: Vec::new(),
            columns: names
                .iter()
                .map(|name| (name.as_ref().to_string(), Vec::new()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.ts_ms_utc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ts_ms_utc.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, values)| values.as_slice())
    }
}

/// One output row; `values` follow the family schema column order.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub ts_ms_utc: i64,
    pub values: Vec<Option<f64>>,
}

/// Row keys of a feature partition that have no counterpart on the other side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnmatchedTs {
    pub missing_from_partition: u64,
    pub absent_from_source: u64,
}

/// The store operations a partition job depends on.
pub trait FeatureStore {
    fn read_source_window(
        &mut self,
        pair: Pair,
        range_start_ms: i64,
        range_end_ms_exclusive: i64,
        columns: &[SourceColumn],
    ) -> Result<SeriesFrame, StoreError>;

    fn read_feature_window(
        &mut self,
        family: FamilyKind,
        pair: Pair,
        range_start_ms: i64,
        range_end_ms_exclusive: i64,
        columns: &[String],
    ) -> Result<SeriesFrame, StoreError>;

    /// Timestamp of the `rows`-th row strictly before `before_ts_ms`, or of
    /// the earliest such row when fewer exist. `None` when there are none.
    fn lookback_start(
        &mut self,
        source: SeriesSource,
        pair: Pair,
        before_ts_ms: i64,
        rows: usize,
    ) -> Result<Option<i64>, StoreError>;

    fn ensure_output_partition(
        &mut self,
        schema: &FeatureSchema,
        pair: Pair,
        month: YearMonth,
    ) -> Result<(), StoreError>;

    fn upsert_rows(
        &mut self,
        schema: &FeatureSchema,
        pair: Pair,
        month: YearMonth,
        rows: &[FeatureRow],
    ) -> Result<usize, StoreError>;

    fn analyze(&mut self, family: FamilyKind, pair: Pair) -> Result<(), StoreError>;
}

pub struct SqliteStore {
    conn: Connection,
    retry: RetryPolicy,
}

impl SqliteStore {
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let policy = config.retry_policy();
        let conn = retry(&policy, "open", || {
            open_connection(&config.path, config.busy_timeout_ms)
        })?;
        Ok(Self {
            conn,
            retry: policy,
        })
    }

    fn with_retry<T>(
        &mut self,
        op: &'static str,
        mut f: impl FnMut(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let policy = self.retry;
        let conn = &mut self.conn;
        retry(&policy, op, || f(&mut *conn))
    }

    /// Upserts bars into their monthly source tables, creating tables as needed.
    pub fn ingest_source_bars(
        &mut self,
        pair: Pair,
        bars: &[SourceBar],
    ) -> Result<usize, StoreError> {
        if bars.is_empty() {
            return Ok(0);
        }

        let mut by_month: BTreeMap<YearMonth, Vec<&SourceBar>> = BTreeMap::new();
        for bar in bars {
            by_month
                .entry(YearMonth::from_ts_ms(bar.ts_ms_utc)?)
                .or_default()
                .push(bar);
        }

        self.with_retry("ingest_source_bars", |conn| {
            let tx = conn.transaction()?;
            for (month, rows) in &by_month {
                let table = quote_ident(&source_table(pair, *month))?;
                tx.execute_batch(&format!(
                    "
                    CREATE TABLE IF NOT EXISTS {table} (
                        ts INTEGER NOT NULL PRIMARY KEY,
                        rate NUMERIC,
                        high NUMERIC,
                        low NUMERIC,
                        open NUMERIC,
                        volume NUMERIC
                    ) WITHOUT ROWID;
                    "
                ))?;
                let mut stmt = tx.prepare(&format!(
                    "
                    INSERT INTO {table} (ts, rate, high, low, open, volume)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    ON CONFLICT(ts) DO UPDATE SET
                        rate = excluded.rate,
                        high = excluded.high,
                        low = excluded.low,
                        open = excluded.open,
                        volume = excluded.volume
                    "
                ))?;
                for bar in rows {
                    stmt.execute(params![
                        bar.ts_ms_utc,
                        sql_real(bar.rate),
                        sql_real(bar.high),
                        sql_real(bar.low),
                        sql_real(bar.open),
                        sql_real(bar.volume),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(bars.len())
        })
    }

    pub fn source_row_count(&mut self, pair: Pair, month: YearMonth) -> Result<u64, StoreError> {
        let table = source_table(pair, month);
        self.with_retry("source_row_count", |conn| count_rows(conn, &table))
    }

    pub fn partition_exists(
        &mut self,
        family: FamilyKind,
        pair: Pair,
        month: YearMonth,
    ) -> Result<bool, StoreError> {
        let table = family.partition_table(pair, month);
        self.with_retry("partition_exists", |conn| table_exists(conn, &table))
    }

    /// `(name, declared type)` of every column, `ts` included.
    pub fn partition_columns(
        &mut self,
        family: FamilyKind,
        pair: Pair,
        month: YearMonth,
    ) -> Result<Vec<(String, String)>, StoreError> {
        let table = family.partition_table(pair, month);
        self.with_retry("partition_columns", |conn| table_columns(conn, &table))
    }

    /// Schema version and fingerprint recorded when the partition was created.
    pub fn catalog_schema(
        &mut self,
        family: FamilyKind,
        pair: Pair,
        month: YearMonth,
    ) -> Result<Option<(u32, String)>, StoreError> {
        self.with_retry("catalog_schema", |conn| {
            let recorded = conn
                .query_row(
                    "
                    SELECT schema_version, schema_fingerprint FROM feature_partitions
                    WHERE family = ?1 AND pair = ?2 AND year = ?3 AND month = ?4
                    ",
                    params![family.as_str(), pair.as_str(), month.year, month.month],
                    |row| Ok((row.get::<_, u32>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()?;
            Ok(recorded)
        })
    }

    pub fn partition_row_count(
        &mut self,
        family: FamilyKind,
        pair: Pair,
        month: YearMonth,
    ) -> Result<u64, StoreError> {
        let table = family.partition_table(pair, month);
        self.with_retry("partition_row_count", |conn| count_rows(conn, &table))
    }

    /// Rows after the first `skip_rows` (by `ts`) with a null in any of `columns`.
    pub fn count_null_rows_after(
        &mut self,
        family: FamilyKind,
        pair: Pair,
        month: YearMonth,
        columns: &[String],
        skip_rows: usize,
    ) -> Result<u64, StoreError> {
        if columns.is_empty() {
            return Ok(0);
        }
        let table = quote_ident(&family.partition_table(pair, month))?;
        let predicate = columns
            .iter()
            .map(|column| quote_ident(column).map(|quoted| format!("{quoted} IS NULL")))
            .collect::<Result<Vec<_>, _>>()?
            .join(" OR ");
        let sql = format!(
            "
            SELECT COUNT(*) FROM (SELECT * FROM {table} ORDER BY ts LIMIT -1 OFFSET ?1)
            WHERE {predicate}
            "
        );
        self.with_retry("count_null_rows_after", |conn| {
            let count: i64 = conn.query_row(&sql, params![skip_rows as i64], |row| row.get(0))?;
            Ok(count as u64)
        })
    }

    pub fn ts_bounds(
        &mut self,
        family: FamilyKind,
        pair: Pair,
        month: YearMonth,
    ) -> Result<Option<(i64, i64)>, StoreError> {
        let table = quote_ident(&family.partition_table(pair, month))?;
        let sql = format!("SELECT MIN(ts), MAX(ts) FROM {table}");
        self.with_retry("ts_bounds", |conn| {
            let bounds: (Option<i64>, Option<i64>) =
                conn.query_row(&sql, [], |row| Ok((row.get(0)?, row.get(1)?)))?;
            Ok(match bounds {
                (Some(min), Some(max)) => Some((min, max)),
                _ => None,
            })
        })
    }

    /// Up to `limit` randomly chosen rows, projected onto `columns`.
    pub fn sample_rows(
        &mut self,
        family: FamilyKind,
        pair: Pair,
        month: YearMonth,
        columns: &[String],
        limit: usize,
    ) -> Result<Vec<FeatureRow>, StoreError> {
        let table = family.partition_table(pair, month);
        let sql = format!(
            "SELECT ts, {} FROM {} ORDER BY random() LIMIT ?1",
            quote_list(columns)?,
            quote_ident(&table)?
        );
        self.with_retry("sample_rows", |conn| {
            query_feature_rows(conn, &sql, params![limit as i64], &table, columns)
        })
    }

    /// Every row of one partition in `ts` order, projected onto the schema.
    pub fn read_partition_rows(
        &mut self,
        schema: &FeatureSchema,
        pair: Pair,
        month: YearMonth,
    ) -> Result<Vec<FeatureRow>, StoreError> {
        let table = schema.family.partition_table(pair, month);
        let columns: Vec<String> = schema.columns.iter().map(|c| c.name.clone()).collect();
        let sql = format!(
            "SELECT ts, {} FROM {} ORDER BY ts",
            quote_list(&columns)?,
            quote_ident(&table)?
        );
        self.with_retry("read_partition_rows", |conn| {
            query_feature_rows(conn, &sql, params![], &table, &columns)
        })
    }

    /// Compares the partition's `ts` set with the source month's.
    pub fn count_unmatched_ts(
        &mut self,
        family: FamilyKind,
        pair: Pair,
        month: YearMonth,
    ) -> Result<UnmatchedTs, StoreError> {
        let partition = family.partition_table(pair, month);
        let source = source_table(pair, month);
        self.with_retry("count_unmatched_ts", |conn| {
            let has_partition = table_exists(conn, &partition)?;
            let has_source = table_exists(conn, &source)?;
            let (p, s) = (quote_ident(&partition)?, quote_ident(&source)?);
            let mut unmatched = UnmatchedTs::default();
            match (has_partition, has_source) {
                (false, false) => {}
                (false, true) => unmatched.missing_from_partition = count_rows(conn, &source)?,
                (true, false) => unmatched.absent_from_source = count_rows(conn, &partition)?,
                (true, true) => {
                    let missing: i64 = conn.query_row(
                        &format!(
                            "
                            SELECT COUNT(*) FROM {s}
                            WHERE NOT EXISTS (SELECT 1 FROM {p} WHERE {p}.ts = {s}.ts)
                            "
                        ),
                        [],
                        |row| row.get(0),
                    )?;
                    let absent: i64 = conn.query_row(
                        &format!(
                            "
                            SELECT COUNT(*) FROM {p}
                            WHERE NOT EXISTS (SELECT 1 FROM {s} WHERE {s}.ts = {p}.ts)
                            "
                        ),
                        [],
                        |row| row.get(0),
                    )?;
                    unmatched.missing_from_partition = missing as u64;
                    unmatched.absent_from_source = absent as u64;
                }
            }
            Ok(unmatched)
        })
    }

    /// First bar with a non-null rate in `[start, end)`.
    pub fn first_bar_between(
        &mut self,
        pair: Pair,
        start_ms: i64,
        end_ms_exclusive: i64,
    ) -> Result<Option<(i64, f64)>, StoreError> {
        let months = months_overlapping(start_ms, end_ms_exclusive)?;
        self.with_retry("first_bar_between", |conn| {
            for month in &months {
                let table = source_table(pair, *month);
                if !table_exists(conn, &table)? {
                    continue;
                }
                let sql = format!(
                    "
                    SELECT ts, rate FROM {}
                    WHERE ts >= ?1 AND ts < ?2 AND rate IS NOT NULL
                    ORDER BY ts LIMIT 1
                    ",
                    quote_ident(&table)?
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params![start_ms, end_ms_exclusive])?;
                if let Some(row) = rows.next()? {
                    let ts: i64 = row.get(0)?;
                    let rate = decode_f64(row.get_ref(1)?).map_err(|detail| StoreError::Decode {
                        table: table.clone(),
                        column: "rate".to_string(),
                        ts_ms_utc: ts,
                        detail,
                    })?;
                    return Ok(Some((ts, rate)));
                }
            }
            Ok(None)
        })
    }

    /// Returns false when the pair already has a baseline; existing rows are never touched.
    pub fn insert_baseline(
        &mut self,
        pair: Pair,
        baseline_ts_ms: i64,
        rate: f64,
    ) -> Result<bool, StoreError> {
        self.with_retry("insert_baseline", |conn| {
            let inserted = conn.execute(
                "
                INSERT OR IGNORE INTO baseline_rates (pair, baseline_ts, rate)
                VALUES (?1, ?2, ?3)
                ",
                params![pair.as_str(), baseline_ts_ms, rate],
            )?;
            Ok(inserted > 0)
        })
    }

    /// `(pair code, baseline ts, rate)` rows as stored.
    pub fn load_baseline_rows(&mut self) -> Result<Vec<(String, i64, f64)>, StoreError> {
        self.with_retry("load_baseline_rows", |conn| {
            let mut stmt =
                conn.prepare("SELECT pair, baseline_ts, rate FROM baseline_rates ORDER BY pair")?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let pair: String = row.get(0)?;
                let ts: i64 = row.get(1)?;
                let rate = decode_f64(row.get_ref(2)?).map_err(|detail| StoreError::Decode {
                    table: BASELINE_TABLE.to_string(),
                    column: "rate".to_string(),
                    ts_ms_utc: ts,
                    detail,
                })?;
                out.push((pair, ts, rate));
            }
            Ok(out)
        })
    }
}

impl FeatureStore for SqliteStore {
    fn read_source_window(
        &mut self,
        pair: Pair,
        range_start_ms: i64,
        range_end_ms_exclusive: i64,
        columns: &[SourceColumn],
    ) -> Result<SeriesFrame, StoreError> {
        let names: Vec<&str> = columns.iter().map(|c| c.as_str()).collect();
        let months = months_overlapping(range_start_ms, range_end_ms_exclusive)?;
        self.with_retry("read_source_window", |conn| {
            let mut frame = SeriesFrame::with_columns(&names);
            for month in &months {
                let table = source_table(pair, *month);
                if table_exists(conn, &table)? {
                    read_range(
                        conn,
                        &table,
                        &names,
                        range_start_ms,
                        range_end_ms_exclusive,
                        &mut frame,
                    )?;
                }
            }
            Ok(frame)
        })
    }

    fn read_feature_window(
        &mut self,
        family: FamilyKind,
        pair: Pair,
        range_start_ms: i64,
        range_end_ms_exclusive: i64,
        columns: &[String],
    ) -> Result<SeriesFrame, StoreError> {
        let names: Vec<&str> = columns.iter().map(String::as_str).collect();
        let months = months_overlapping(range_start_ms, range_end_ms_exclusive)?;
        self.with_retry("read_feature_window", |conn| {
            let mut frame = SeriesFrame::with_columns(&names);
            for month in &months {
                let table = family.partition_table(pair, *month);
                if !table_exists(conn, &table)? {
                    continue;
                }
                let existing = table_columns(conn, &table)?;
                let missing = missing_columns(&existing, names.iter().copied());
                if !missing.is_empty() {
                    return Err(StoreError::SchemaMismatch { table, missing });
                }
                read_range(
                    conn,
                    &table,
                    &names,
                    range_start_ms,
                    range_end_ms_exclusive,
                    &mut frame,
                )?;
            }
            Ok(frame)
        })
    }

    fn lookback_start(
        &mut self,
        source: SeriesSource,
        pair: Pair,
        before_ts_ms: i64,
        rows: usize,
    ) -> Result<Option<i64>, StoreError> {
        if rows == 0 {
            return Ok(None);
        }
        let first_month = YearMonth::from_ts_ms(before_ts_ms - 1)?;
        self.with_retry("lookback_start", |conn| {
            let mut collected = 0usize;
            let mut earliest = None;
            let mut month = first_month;
            for _ in 0..LOOKBACK_MAX_MONTHS {
                let table = source.table(pair, month);
                if table_exists(conn, &table)? {
                    let sql = format!(
                        "SELECT ts FROM {} WHERE ts < ?1 ORDER BY ts DESC LIMIT ?2",
                        quote_ident(&table)?
                    );
                    let mut stmt = conn.prepare(&sql)?;
                    let found = stmt
                        .query_map(params![before_ts_ms, (rows - collected) as i64], |row| {
                            row.get::<_, i64>(0)
                        })?
                        .collect::<Result<Vec<_>, _>>()?;
                    collected += found.len();
                    if let Some(ts) = found.last() {
                        earliest = Some(*ts);
                    }
                    if collected >= rows {
                        break;
                    }
                }
                month = month.prev();
            }
            Ok(earliest)
        })
    }

    fn ensure_output_partition(
        &mut self,
        schema: &FeatureSchema,
        pair: Pair,
        month: YearMonth,
    ) -> Result<(), StoreError> {
        let table = schema.family.partition_table(pair, month);
        let created = self.with_retry("ensure_output_partition", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let created = if table_exists(&tx, &table)? {
                let existing = table_columns(&tx, &table)?;
                let missing =
                    missing_columns(&existing, schema.columns.iter().map(|c| c.name.as_str()));
                if !missing.is_empty() {
                    return Err(StoreError::SchemaMismatch {
                        table: table.clone(),
                        missing,
                    });
                }
                false
            } else {
                tx.execute_batch(&create_partition_sql(&table, schema)?)?;
                true
            };

            let registered = tx.execute(
                "
                INSERT INTO feature_partitions (
                    family, pair, year, month, table_name,
                    schema_version, schema_fingerprint, created_at_ms
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(family, pair, year, month) DO NOTHING
                ",
                params![
                    schema.family.as_str(),
                    pair.as_str(),
                    month.year,
                    month.month,
                    table,
                    schema.version,
                    schema.fingerprint,
                    Utc::now().timestamp_millis(),
                ],
            )? > 0;

            if created || registered {
                rebuild_parent_view(&tx, schema, pair)?;
            }
            tx.commit()?;
            Ok(created)
        })?;

        debug!(
            component = "store",
            event = "store.partition.ensured",
            table = %table,
            created
        );
        Ok(())
    }

    fn upsert_rows(
        &mut self,
        schema: &FeatureSchema,
        pair: Pair,
        month: YearMonth,
        rows: &[FeatureRow],
    ) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let table = schema.family.partition_table(pair, month);
        let width = schema.columns.len();
        for row in rows {
            if row.values.len() != width {
                return Err(StoreError::RowWidth {
                    ts_ms_utc: row.ts_ms_utc,
                    expected: width,
                    found: row.values.len(),
                });
            }
            if !month.contains(row.ts_ms_utc) {
                return Err(StoreError::OutOfPartition {
                    table,
                    ts_ms_utc: row.ts_ms_utc,
                });
            }
        }

        let columns: Vec<String> = schema.columns.iter().map(|c| c.name.clone()).collect();
        let sql = upsert_sql(&table, &columns)?;
        self.with_retry("upsert_rows", |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(&sql)?;
                let mut values: Vec<Value> = Vec::with_capacity(width + 1);
                for row in rows {
                    values.clear();
                    values.push(Value::Integer(row.ts_ms_utc));
                    values.extend(row.values.iter().map(|v| match v {
                        Some(x) => sql_real(*x),
                        None => Value::Null,
                    }));
                    stmt.execute(params_from_iter(values.iter()))?;
                }
            }
            tx.commit()?;
            Ok(rows.len())
        })
    }

    fn analyze(&mut self, family: FamilyKind, pair: Pair) -> Result<(), StoreError> {
        self.with_retry("analyze", |conn| {
            let tables = registered_partitions(conn, family, pair)?;
            for table in tables {
                if table_exists(conn, &table)? {
                    conn.execute_batch(&format!("ANALYZE {};", quote_ident(&table)?))?;
                }
            }
            Ok(())
        })
    }
}

fn open_connection(path: &Path, busy_timeout_ms: u64) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_millis(busy_timeout_ms))?;
    conn.execute_batch(
        "
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA temp_store=MEMORY;
        ",
    )?;
    ensure_catalog(&conn)?;
    Ok(conn)
}

fn ensure_catalog(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS feature_partitions (
            family TEXT NOT NULL,
            pair TEXT NOT NULL,
            year INTEGER NOT NULL,
            month INTEGER NOT NULL,
            table_name TEXT NOT NULL,
            schema_version INTEGER NOT NULL,
            schema_fingerprint TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL,
            PRIMARY KEY(family, pair, year, month)
        ) WITHOUT ROWID;

        CREATE TABLE IF NOT EXISTS baseline_rates (
            pair TEXT NOT NULL PRIMARY KEY,
            baseline_ts INTEGER NOT NULL,
            rate REAL NOT NULL
        ) WITHOUT ROWID;
        ",
    )?;
    Ok(())
}

/// Converts any numeric storage class to `f64`. Null becomes `NaN`.
pub fn decode_f64(value: ValueRef<'_>) -> Result<f64, String> {
    match value {
        ValueRef::Null => Ok(f64::NAN),
        ValueRef::Integer(v) => Ok(v as f64),
        ValueRef::Real(v) => Ok(v),
        ValueRef::Text(bytes) => {
            let text = std::str::from_utf8(bytes).map_err(|err| err.to_string())?;
            text.trim()
                .parse::<f64>()
                .map_err(|_| format!("not a decimal: {text:?}"))
        }
        ValueRef::Blob(_) => Err("blob is not numeric".to_string()),
    }
}

fn decode_nullable(value: ValueRef<'_>) -> Result<Option<f64>, String> {
    match value {
        ValueRef::Null => Ok(None),
        other => decode_f64(other).map(|v| v.is_finite().then_some(v)),
    }
}

/// Non-finite values are stored as NULL.
fn sql_real(value: f64) -> Value {
    if value.is_finite() {
        Value::Real(value)
    } else {
        Value::Null
    }
}

fn quote_ident(name: &str) -> Result<String, StoreError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid {
        return Err(StoreError::InvalidIdentifier(name.to_string()));
    }
    Ok(format!("\"{name}\""))
}

fn quote_list<S: AsRef<str>>(names: &[S]) -> Result<String, StoreError> {
    Ok(names
        .iter()
        .map(|name| quote_ident(name.as_ref()))
        .collect::<Result<Vec<_>, _>>()?
        .join(", "))
}

fn read_range(
    conn: &Connection,
    table: &str,
    columns: &[&str],
    start_ms: i64,
    end_ms_exclusive: i64,
    frame: &mut SeriesFrame,
) -> Result<(), StoreError> {
    let sql = if columns.is_empty() {
        format!(
            "SELECT ts FROM {} WHERE ts >= ?1 AND ts < ?2 ORDER BY ts",
            quote_ident(table)?
        )
    } else {
        format!(
            "SELECT ts, {} FROM {} WHERE ts >= ?1 AND ts < ?2 ORDER BY ts",
            quote_list(columns)?,
            quote_ident(table)?
        )
    };
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![start_ms, end_ms_exclusive])?;
    while let Some(row) = rows.next()? {
        let ts: i64 = row.get(0)?;
        frame.ts_ms_utc.push(ts);
        for (k, (name, values)) in frame.columns.iter_mut().enumerate() {
            let value = decode_f64(row.get_ref(k + 1)?).map_err(|detail| StoreError::Decode {
                table: table.to_string(),
                column: name.clone(),
                ts_ms_utc: ts,
                detail,
            })?;
            values.push(value);
        }
    }
    Ok(())
}

fn query_feature_rows<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    table: &str,
    columns: &[String],
) -> Result<Vec<FeatureRow>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let ts: i64 = row.get(0)?;
        let mut values = Vec::with_capacity(columns.len());
        for (k, column) in columns.iter().enumerate() {
            let value = decode_nullable(row.get_ref(k + 1)?).map_err(|detail| StoreError::Decode {
                table: table.to_string(),
                column: column.clone(),
                ts_ms_utc: ts,
                detail,
            })?;
            values.push(value);
        }
        out.push(FeatureRow {
            ts_ms_utc: ts,
            values,
        });
    }
    Ok(out)
}

fn create_partition_sql(table: &str, schema: &FeatureSchema) -> Result<String, StoreError> {
    let mut ddl = format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    ts INTEGER NOT NULL PRIMARY KEY",
        quote_ident(table)?
    );
    for column in &schema.columns {
        ddl.push_str(&format!(
            ",\n    {} {}",
            quote_ident(&column.name)?,
            column.dtype.sql_type()
        ));
    }
    ddl.push_str("\n) WITHOUT ROWID;");
    Ok(ddl)
}

fn upsert_sql(table: &str, columns: &[String]) -> Result<String, StoreError> {
    let placeholders = (1..=columns.len() + 1)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let conflict = if columns.is_empty() {
        "DO NOTHING".to_string()
    } else {
        let updates = columns
            .iter()
            .map(|column| quote_ident(column).map(|q| format!("{q} = excluded.{q}")))
            .collect::<Result<Vec<_>, _>>()?
            .join(", ");
        format!("DO UPDATE SET {updates}")
    };
    let column_list = if columns.is_empty() {
        String::new()
    } else {
        format!(", {}", quote_list(columns)?)
    };
    Ok(format!(
        "INSERT INTO {} (ts{column_list}) VALUES ({placeholders}) ON CONFLICT(ts) {conflict}",
        quote_ident(table)?
    ))
}

fn registered_partitions(
    conn: &Connection,
    family: FamilyKind,
    pair: Pair,
) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare(
        "
        SELECT table_name FROM feature_partitions
        WHERE family = ?1 AND pair = ?2
        ORDER BY year, month
        ",
    )?;
    let tables = stmt
        .query_map(params![family.as_str(), pair.as_str()], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(tables)
}

/// Recreates `<family>_<pair>` as a UNION ALL over the registered partitions.
/// Partitions missing a current column contribute NULL for it.
fn rebuild_parent_view(
    conn: &Connection,
    schema: &FeatureSchema,
    pair: Pair,
) -> Result<(), StoreError> {
    let view = quote_ident(&schema.family.parent_table(pair))?;
    let mut selects = Vec::new();
    for table in registered_partitions(conn, schema.family, pair)? {
        if !table_exists(conn, &table)? {
            continue;
        }
        let existing = table_columns(conn, &table)?;
        let mut projection = vec!["ts".to_string()];
        for column in &schema.columns {
            let quoted = quote_ident(&column.name)?;
            if existing.iter().any(|(name, _)| *name == column.name) {
                projection.push(quoted);
            } else {
                projection.push(format!("NULL AS {quoted}"));
            }
        }
        selects.push(format!(
            "SELECT {} FROM {}",
            projection.join(", "),
            quote_ident(&table)?
        ));
    }

    conn.execute_batch(&format!("DROP VIEW IF EXISTS {view};"))?;
    if !selects.is_empty() {
        conn.execute_batch(&format!(
            "CREATE VIEW {view} AS {};",
            selects.join(" UNION ALL ")
        ))?;
    }
    Ok(())
}

fn missing_columns<'a>(
    existing: &[(String, String)],
    wanted: impl Iterator<Item = &'a str>,
) -> Vec<String> {
    wanted
        .filter(|name| !existing.iter().any(|(column, _)| column == name))
        .map(str::to_string)
        .collect()
}

fn count_rows(conn: &Connection, table: &str) -> Result<u64, StoreError> {
    if !table_exists(conn, table)? {
        return Ok(0);
    }
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", quote_ident(table)?),
        [],
        |row| row.get(0),
    )?;
    Ok(count as u64)
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

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<(String, String)>, StoreError> {
    let pragma = format!("PRAGMA table_info({})", quote_ident(table)?);
    let mut stmt = conn.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        let decl: String = row.get(2)?;
        columns.push((name, decl));
    }
    Ok(columns)
}
