//! Persistence contract for signals, risk decisions, paper positions,
//! warnings and candle watermarks.
//!
//! A decision (signal + risk decision + optional opening position) is
//! written in one transaction and answered with a [`DecisionReceipt`].
//! Watermark commits take that receipt, so a watermark can only move after
//! its candle's decision is durable.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{ScanError, ScanResult};
use crate::models::{RiskDecision, Signal, Timeframe, Warning};
use crate::paper::PaperPosition;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Everything recorded for one candidate signal.
#[derive(Debug, Clone)]
pub struct DecisionRecord {
    pub signal:   Signal,
    pub decision: RiskDecision,
    pub position: Option<PaperPosition>,
}

/// Proof that the decision for `(symbol, timeframe, candle_ts)` is durable
/// (or that the candle was explicitly skipped). Only stores and
/// [`DecisionReceipt::no_signal`] can mint one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionReceipt {
    symbol:    String,
    timeframe: Timeframe,
    candle_ts: i64,
    signal_id: Option<Uuid>,
}

impl DecisionReceipt {
    pub(crate) fn recorded(signal: &Signal) -> Self {
        Self {
            symbol:    signal.symbol.clone(),
            timeframe: signal.timeframe,
            candle_ts: signal.candle_ts,
            signal_id: Some(signal.id),
        }
    }

    /// Receipt for a closed candle that produced no candidate signal.
    pub fn no_signal(symbol: impl Into<String>, timeframe: Timeframe, candle_ts: i64) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            candle_ts,
            signal_id: None,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn candle_ts(&self) -> i64 {
        self.candle_ts
    }

    pub fn signal_id(&self) -> Option<Uuid> {
        self.signal_id
    }
}

/// Stored watermark row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watermark {
    pub symbol:         String,
    pub timeframe:      Timeframe,
    pub last_closed_ts: i64,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Positions with status OPEN.
    async fn open_positions(&self) -> ScanResult<Vec<PaperPosition>>;

    /// Closed positions, oldest exit first.
    async fn closed_positions(&self) -> ScanResult<Vec<PaperPosition>>;

    /// Number of approved signals created at or after `since`.
    async fn approved_signals_since(&self, since: DateTime<Utc>) -> ScanResult<u32>;

    /// Sum of realised R on positions closed at or after `since`.
    async fn realized_pnl_since(&self, since: DateTime<Utc>) -> ScanResult<f64>;

    /// Signals of any status created in `[from, to)`, oldest first.
    async fn signals_between(&self, from: DateTime<Utc>, to: DateTime<Utc>)
        -> ScanResult<Vec<Signal>>;

    /// Warnings raised in `[from, to)`, oldest first.
    async fn warnings_between(&self, from: DateTime<Utc>, to: DateTime<Utc>)
        -> ScanResult<Vec<Warning>>;

    /// Creation time of the newest persisted signal for `symbol`, any status.
    async fn last_signal_time(&self, symbol: &str) -> ScanResult<Option<DateTime<Utc>>>;

    /// Atomically persist a decision. On error nothing is written.
    async fn record_decision(&self, record: &DecisionRecord) -> ScanResult<DecisionReceipt>;

    /// Insert or update a paper position (mark-to-market, close).
    async fn save_position(&self, position: &PaperPosition) -> ScanResult<()>;

    async fn insert_warning(&self, warning: &Warning) -> ScanResult<()>;

    async fn load_watermarks(&self) -> ScanResult<Vec<Watermark>>;

    /// Advance the receipt's watermark. Never moves a watermark backwards.
    async fn commit_watermark(&self, receipt: &DecisionReceipt) -> ScanResult<()>;
}

pub(crate) fn from_millis(ms: i64) -> ScanResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| ScanError::Persistence(format!("invalid timestamp {ms}")))
}
