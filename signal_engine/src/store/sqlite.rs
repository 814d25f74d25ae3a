use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use serde::de::DeserializeOwned;
use sqlx::{Row, Sqlite, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use super::{from_millis, DecisionReceipt, DecisionRecord, Store, Watermark};
use crate::error::{ScanError, ScanResult};
use crate::models::{Direction, Signal, Timeframe, Warning};
use crate::paper::{ExitReason, PaperPosition, PositionStatus};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS signals (
        id          TEXT PRIMARY KEY,
        symbol      TEXT NOT NULL,
        timeframe   TEXT NOT NULL,
        direction   TEXT NOT NULL,
        score       REAL NOT NULL,
        confidence  REAL NOT NULL,
        entry_price REAL NOT NULL,
        stop_loss   REAL NOT NULL,
        take_profit REAL NOT NULL,
        reasons     TEXT NOT NULL,
        regime      TEXT NOT NULL,
        candle_ts   INTEGER NOT NULL,
        status      TEXT NOT NULL,
        created_at  INTEGER NOT NULL,
        metadata    TEXT
    );",
    "CREATE INDEX IF NOT EXISTS idx_signals_symbol_created ON signals (symbol, created_at);",
    "CREATE TABLE IF NOT EXISTS risk_decisions (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        signal_id       TEXT NOT NULL REFERENCES signals (id),
        symbol          TEXT NOT NULL,
        status          TEXT NOT NULL,
        reason          TEXT NOT NULL,
        violation       TEXT,
        correlations    TEXT NOT NULL,
        avg_correlation REAL NOT NULL,
        created_at      INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS paper_positions (
        id               TEXT PRIMARY KEY,
        signal_id        TEXT NOT NULL,
        symbol           TEXT NOT NULL,
        side             TEXT NOT NULL,
        size_r           REAL NOT NULL,
        entry_price      REAL NOT NULL,
        entry_time       INTEGER NOT NULL,
        stop_loss        REAL NOT NULL,
        take_profit      REAL NOT NULL,
        risk_per_unit    REAL NOT NULL,
        current_price    REAL NOT NULL,
        max_price        REAL NOT NULL,
        min_price        REAL NOT NULL,
        max_drawdown_pct REAL NOT NULL,
        fees_paid_r      REAL NOT NULL,
        unrealized_r     REAL NOT NULL,
        exit_price       REAL,
        exit_time        INTEGER,
        exit_reason      TEXT,
        pnl_r            REAL NOT NULL,
        pnl_percent      REAL NOT NULL,
        duration_hours   REAL,
        status           TEXT NOT NULL
    );",
    "CREATE INDEX IF NOT EXISTS idx_positions_status ON paper_positions (status);",
    "CREATE TABLE IF NOT EXISTS warnings (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        severity        TEXT NOT NULL,
        kind            TEXT NOT NULL,
        symbol          TEXT,
        message         TEXT NOT NULL,
        triggered_value REAL NOT NULL,
        threshold       REAL NOT NULL,
        action_taken    TEXT NOT NULL,
        created_at      INTEGER NOT NULL,
        metadata        TEXT
    );",
    "CREATE TABLE IF NOT EXISTS processed_candles (
        symbol         TEXT NOT NULL,
        timeframe      TEXT NOT NULL,
        last_closed_ts INTEGER NOT NULL,
        updated_at     INTEGER NOT NULL,
        PRIMARY KEY (symbol, timeframe)
    );",
];

const UPSERT_POSITION: &str = "
    INSERT INTO paper_positions (
        id, signal_id, symbol, side, size_r, entry_price, entry_time, stop_loss,
        take_profit, risk_per_unit, current_price, max_price, min_price,
        max_drawdown_pct, fees_paid_r, unrealized_r, exit_price, exit_time,
        exit_reason, pnl_r, pnl_percent, duration_hours, status
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (id) DO UPDATE SET
        current_price    = excluded.current_price,
        max_price        = excluded.max_price,
        min_price        = excluded.min_price,
        max_drawdown_pct = excluded.max_drawdown_pct,
        fees_paid_r      = excluded.fees_paid_r,
        unrealized_r     = excluded.unrealized_r,
        exit_price       = excluded.exit_price,
        exit_time        = excluded.exit_time,
        exit_reason      = excluded.exit_reason,
        pnl_r            = excluded.pnl_r,
        pnl_percent      = excluded.pnl_percent,
        duration_hours   = excluded.duration_hours,
        status           = excluded.status";

/// SQLite-backed store (WAL journal, one transaction per decision).
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database file at `path`.
    pub async fn open(path: &str) -> ScanResult<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10))
            .synchronous(SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        info!(path, "sqlite store ready");
        Ok(store)
    }

    /// Private in-memory database on a single connection.
    pub async fn in_memory() -> ScanResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> ScanResult<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        debug!("schema ensured");
        Ok(())
    }

    async fn insert_decision(
        tx: &mut Transaction<'_, Sqlite>,
        record: &DecisionRecord,
    ) -> ScanResult<()> {
        let s = &record.signal;
        let d = &record.decision;

        sqlx::query(
            "INSERT INTO signals (
                id, symbol, timeframe, direction, score, confidence, entry_price,
                stop_loss, take_profit, reasons, regime, candle_ts, status,
                created_at, metadata
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(s.id.to_string())
        .bind(&s.symbol)
        .bind(s.timeframe.as_str())
        .bind(s.direction.as_str())
        .bind(s.score)
        .bind(s.confidence)
        .bind(s.entry_price)
        .bind(s.stop_loss)
        .bind(s.take_profit)
        .bind(serde_json::to_string(&s.reasons)?)
        .bind(&s.regime)
        .bind(s.candle_ts)
        .bind(d.status.as_str())
        .bind(s.created_at.timestamp_millis())
        .bind(serde_json::to_string(&s.metadata)?)
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            "INSERT INTO risk_decisions (
                signal_id, symbol, status, reason, violation, correlations,
                avg_correlation, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(s.id.to_string())
        .bind(&s.symbol)
        .bind(d.status.as_str())
        .bind(&d.reason)
        .bind(d.violation.map(|v| v.as_str()))
        .bind(serde_json::to_string(&d.correlations)?)
        .bind(d.avg_correlation)
        .bind(s.created_at.timestamp_millis())
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

fn bind_position<'q>(
    query: sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    p: &'q PaperPosition,
) -> sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(p.id.to_string())
        .bind(p.signal_id.to_string())
        .bind(&p.symbol)
        .bind(p.side.as_str())
        .bind(p.size_r)
        .bind(p.entry_price)
        .bind(p.entry_time.timestamp_millis())
        .bind(p.stop_loss)
        .bind(p.take_profit)
        .bind(p.risk_per_unit)
        .bind(p.current_price)
        .bind(p.max_price)
        .bind(p.min_price)
        .bind(p.max_drawdown_pct)
        .bind(p.fees_paid_r)
        .bind(p.unrealized_r)
        .bind(p.exit_price)
        .bind(p.exit_time.map(|t| t.timestamp_millis()))
        .bind(p.exit_reason.map(|r| r.as_str()))
        .bind(p.pnl_r)
        .bind(p.pnl_percent)
        .bind(p.duration_hours)
        .bind(p.status.as_str())
}

fn parse_uuid(raw: &str) -> ScanResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| ScanError::Persistence(format!("bad uuid '{raw}': {e}")))
}

/// Status-style labels are stored as their serde names.
fn parse_label<T: DeserializeOwned>(raw: String) -> ScanResult<T> {
    Ok(serde_json::from_value(serde_json::Value::String(raw))?)
}

fn parse_json(raw: Option<String>) -> ScanResult<serde_json::Value> {
    match raw {
        Some(text) => Ok(serde_json::from_str(&text)?),
        None => Ok(serde_json::Value::Null),
    }
}

fn signal_from_row(row: &SqliteRow) -> ScanResult<Signal> {
    let timeframe: String = row.try_get("timeframe")?;
    let direction: String = row.try_get("direction")?;
    let reasons: String = row.try_get("reasons")?;

    Ok(Signal {
        id:          parse_uuid(row.try_get("id")?)?,
        symbol:      row.try_get("symbol")?,
        timeframe:   timeframe.parse::<Timeframe>()?,
        direction:   direction.parse::<Direction>()?,
        score:       row.try_get("score")?,
        confidence:  row.try_get("confidence")?,
        entry_price: row.try_get("entry_price")?,
        stop_loss:   row.try_get("stop_loss")?,
        take_profit: row.try_get("take_profit")?,
        reasons:     serde_json::from_str(&reasons)?,
        regime:      row.try_get("regime")?,
        candle_ts:   row.try_get("candle_ts")?,
        created_at:  from_millis(row.try_get("created_at")?)?,
        metadata:    parse_json(row.try_get("metadata")?)?,
    })
}

fn warning_from_row(row: &SqliteRow) -> ScanResult<Warning> {
    Ok(Warning {
        severity:        parse_label(row.try_get("severity")?)?,
        kind:            parse_label(row.try_get("kind")?)?,
        symbol:          row.try_get("symbol")?,
        message:         row.try_get("message")?,
        triggered_value: row.try_get("triggered_value")?,
        threshold:       row.try_get("threshold")?,
        action_taken:    parse_label(row.try_get("action_taken")?)?,
        created_at:      from_millis(row.try_get("created_at")?)?,
        metadata:        parse_json(row.try_get("metadata")?)?,
    })
}

fn position_from_row(row: &SqliteRow) -> ScanResult<PaperPosition> {
    let side: String = row.try_get("side")?;
    let status: String = row.try_get("status")?;
    let exit_reason: Option<String> = row.try_get("exit_reason")?;
    let exit_time: Option<i64> = row.try_get("exit_time")?;

    let exit_reason = match exit_reason.as_deref() {
        None => None,
        Some("STOP_LOSS") => Some(ExitReason::StopLoss),
        Some("TAKE_PROFIT") => Some(ExitReason::TakeProfit),
        Some("MANUAL") => Some(ExitReason::Manual),
        Some(other) => {
            return Err(ScanError::Persistence(format!("unknown exit reason '{other}'")))
        }
    };
    let status = match status.as_str() {
        "OPEN" => PositionStatus::Open,
        "CLOSED" => PositionStatus::Closed,
        other => return Err(ScanError::Persistence(format!("unknown position status '{other}'"))),
    };

    Ok(PaperPosition {
        id:               parse_uuid(row.try_get("id")?)?,
        signal_id:        parse_uuid(row.try_get("signal_id")?)?,
        symbol:           row.try_get("symbol")?,
        side:             side.parse::<Direction>()?,
        size_r:           row.try_get("size_r")?,
        entry_price:      row.try_get("entry_price")?,
        entry_time:       from_millis(row.try_get("entry_time")?)?,
        stop_loss:        row.try_get("stop_loss")?,
        take_profit:      row.try_get("take_profit")?,
        risk_per_unit:    row.try_get("risk_per_unit")?,
        current_price:    row.try_get("current_price")?,
        max_price:        row.try_get("max_price")?,
        min_price:        row.try_get("min_price")?,
        max_drawdown_pct: row.try_get("max_drawdown_pct")?,
        fees_paid_r:      row.try_get("fees_paid_r")?,
        unrealized_r:     row.try_get("unrealized_r")?,
        exit_price:       row.try_get("exit_price")?,
        exit_time:        exit_time.map(from_millis).transpose()?,
        exit_reason,
        pnl_r:            row.try_get("pnl_r")?,
        pnl_percent:      row.try_get("pnl_percent")?,
        duration_hours:   row.try_get("duration_hours")?,
        status,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn open_positions(&self) -> ScanResult<Vec<PaperPosition>> {
        let rows = sqlx::query("SELECT * FROM paper_positions WHERE status = 'OPEN'")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(position_from_row).collect()
    }

    async fn closed_positions(&self) -> ScanResult<Vec<PaperPosition>> {
        let rows = sqlx::query(
            "SELECT * FROM paper_positions WHERE status = 'CLOSED' ORDER BY exit_time ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(position_from_row).collect()
    }

    async fn approved_signals_since(&self, since: DateTime<Utc>) -> ScanResult<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM signals WHERE status = 'APPROVED' AND created_at >= ?",
        )
        .bind(since.timestamp_millis())
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u32)
    }

    async fn realized_pnl_since(&self, since: DateTime<Utc>) -> ScanResult<f64> {
        let total: Option<f64> = sqlx::query_scalar(
            "SELECT SUM(pnl_r) FROM paper_positions WHERE status = 'CLOSED' AND exit_time >= ?",
        )
        .bind(since.timestamp_millis())
        .fetch_one(&self.pool)
        .await?;
        Ok(total.unwrap_or(0.0))
    }

    async fn signals_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ScanResult<Vec<Signal>> {
        let rows = sqlx::query(
            "SELECT * FROM signals WHERE created_at >= ? AND created_at < ? ORDER BY created_at ASC",
        )
        .bind(from.timestamp_millis())
        .bind(to.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(signal_from_row).collect()
    }

    async fn warnings_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ScanResult<Vec<Warning>> {
        let rows = sqlx::query(
            "SELECT * FROM warnings WHERE created_at >= ? AND created_at < ? ORDER BY created_at ASC",
        )
        .bind(from.timestamp_millis())
        .bind(to.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(warning_from_row).collect()
    }

    async fn last_signal_time(&self, symbol: &str) -> ScanResult<Option<DateTime<Utc>>> {
        let ts: Option<i64> =
            sqlx::query_scalar("SELECT MAX(created_at) FROM signals WHERE symbol = ?")
                .bind(symbol)
                .fetch_one(&self.pool)
                .await?;
        ts.map(from_millis).transpose()
    }

    async fn record_decision(&self, record: &DecisionRecord) -> ScanResult<DecisionReceipt> {
        let mut tx = self.pool.begin().await?;
        Self::insert_decision(&mut tx, record).await?;
        if let Some(position) = &record.position {
            bind_position(sqlx::query(UPSERT_POSITION), position)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(DecisionReceipt::recorded(&record.signal))
    }

    async fn save_position(&self, position: &PaperPosition) -> ScanResult<()> {
        bind_position(sqlx::query(UPSERT_POSITION), position)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_warning(&self, w: &Warning) -> ScanResult<()> {
        sqlx::query(
            "INSERT INTO warnings (
                severity, kind, symbol, message, triggered_value, threshold,
                action_taken, created_at, metadata
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(w.severity.as_str())
        .bind(w.kind.as_str())
        .bind(w.symbol.as_deref())
        .bind(&w.message)
        .bind(w.triggered_value)
        .bind(w.threshold)
        .bind(w.action_taken.as_str())
        .bind(w.created_at.timestamp_millis())
        .bind(serde_json::to_string(&w.metadata)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_watermarks(&self) -> ScanResult<Vec<Watermark>> {
        let rows = sqlx::query("SELECT symbol, timeframe, last_closed_ts FROM processed_candles")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> ScanResult<Watermark> {
                let timeframe: String = row.try_get("timeframe")?;
                Ok(Watermark {
                    symbol:         row.try_get("symbol")?,
                    timeframe:      timeframe.parse::<Timeframe>()?,
                    last_closed_ts: row.try_get("last_closed_ts")?,
                })
            })
            .collect()
    }

    async fn commit_watermark(&self, receipt: &DecisionReceipt) -> ScanResult<()> {
        sqlx::query(
            "INSERT INTO processed_candles (symbol, timeframe, last_closed_ts, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (symbol, timeframe) DO UPDATE SET
                 last_closed_ts = MAX(last_closed_ts, excluded.last_closed_ts),
                 updated_at     = excluded.updated_at",
        )
        .bind(receipt.symbol())
        .bind(receipt.timeframe().as_str())
        .bind(receipt.candle_ts())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
