/// models.rs — Domain types shared across the pipeline
///
/// Candles flow in from the market data source oldest-first; the final
/// element of a freshly fetched window is the candle that is still forming.
/// Everything downstream (indicators, regime, scoring) works on the closed
/// prefix only.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ScanError;

// ── Candles ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time, Unix milliseconds
    pub timestamp: i64,
    pub open:      f64,
    pub high:      f64,
    pub low:       f64,
    pub close:     f64,
    pub volume:    f64,
}

/// Column view of a candle window, the shape every indicator consumes.
#[derive(Debug, Clone, Default)]
pub struct Ohlcv {
    pub timestamps: Vec<i64>,
    pub opens:      Vec<f64>,
    pub highs:      Vec<f64>,
    pub lows:       Vec<f64>,
    pub closes:     Vec<f64>,
    pub volumes:    Vec<f64>,
}

impl Ohlcv {
    pub fn from_candles(candles: &[Candle]) -> Self {
        let n = candles.len();
        let mut out = Ohlcv {
            timestamps: Vec::with_capacity(n),
            opens:      Vec::with_capacity(n),
            highs:      Vec::with_capacity(n),
            lows:       Vec::with_capacity(n),
            closes:     Vec::with_capacity(n),
            volumes:    Vec::with_capacity(n),
        };
        for c in candles {
            out.timestamps.push(c.timestamp);
            out.opens.push(c.open);
            out.highs.push(c.high);
            out.lows.push(c.low);
            out.closes.push(c.close);
            out.volumes.push(c.volume);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.closes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.closes.is_empty()
    }

    pub fn last_close(&self) -> Option<f64> {
        self.closes.last().copied()
    }
}

/// Drop the still-forming last candle of a fetched window.
pub fn closed_candles(candles: &[Candle]) -> &[Candle] {
    match candles.len() {
        0 => candles,
        n => &candles[..n - 1],
    }
}

// ── Timeframes ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    /// Binance kline interval string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H2 => "2h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }

    pub const fn duration_ms(&self) -> i64 {
        let minutes = match self {
            Self::M1 => 1,
            Self::M5 => 5,
            Self::M15 => 15,
            Self::M30 => 30,
            Self::H1 => 60,
            Self::H2 => 120,
            Self::H4 => 240,
            Self::D1 => 1440,
        };
        minutes * 60_000
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1m" => Ok(Self::M1),
            "5m" => Ok(Self::M5),
            "15m" => Ok(Self::M15),
            "30m" => Ok(Self::M30),
            "1h" => Ok(Self::H1),
            "2h" => Ok(Self::H2),
            "4h" => Ok(Self::H4),
            "1d" => Ok(Self::D1),
            other => Err(ScanError::Config(format!("unsupported timeframe '{other}'"))),
        }
    }
}

// ── Direction ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Long,
    Short,
    Neutral,
}

impl Direction {
    /// +1 for long, −1 for short, 0 for neutral.
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
            Direction::Neutral => 0.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
            Direction::Neutral => "NEUTRAL",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LONG" => Ok(Direction::Long),
            "SHORT" => Ok(Direction::Short),
            "NEUTRAL" => Ok(Direction::Neutral),
            other => Err(ScanError::Data(format!("unknown direction '{other}'"))),
        }
    }
}

// ── Signal ────────────────────────────────────────────────────────────────

/// A scored, confluence-adjusted trade idea for one closed candle.
/// Immutable once persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id:          Uuid,
    pub symbol:      String,
    pub timeframe:   Timeframe,
    pub direction:   Direction,
    /// Final score after the confluence penalty, 0–10
    pub score:       f64,
    pub confidence:  f64,
    pub entry_price: f64,
    pub stop_loss:   f64,
    pub take_profit: f64,
    pub reasons:     Vec<String>,
    pub regime:      String,
    /// Open time of the closed candle this signal was generated on
    pub candle_ts:   i64,
    pub created_at:  DateTime<Utc>,
    /// Free-form payload (indicator snapshot, components, confluence)
    pub metadata:    serde_json::Value,
}

// ── Risk decisions ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskStatus {
    Approved,
    Rejected,
}

impl RiskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskStatus::Approved => "APPROVED",
            RiskStatus::Rejected => "REJECTED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Violation {
    MaxAlertsReached,
    CooldownViolation,
    DailyLossLimitReached,
    HighCorrelation,
}

impl Violation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Violation::MaxAlertsReached => "MAX_ALERTS_REACHED",
            Violation::CooldownViolation => "COOLDOWN_VIOLATION",
            Violation::DailyLossLimitReached => "DAILY_LOSS_LIMIT_REACHED",
            Violation::HighCorrelation => "HIGH_CORRELATION",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskDecision {
    pub status:    RiskStatus,
    pub reason:    String,
    pub violation: Option<Violation>,
    /// Correlation of the candidate with each open-position symbol
    pub correlations: Vec<(String, f64)>,
    pub avg_correlation: f64,
}

impl RiskDecision {
    pub fn is_approved(&self) -> bool {
        self.status == RiskStatus::Approved
    }
}

// ── Warnings ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningKind {
    ReferenceShock,
    BreadthCollapse,
    CorrelationSpike,
}

impl WarningKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WarningKind::ReferenceShock => "REFERENCE_SHOCK",
            WarningKind::BreadthCollapse => "BREADTH_COLLAPSE",
            WarningKind::CorrelationSpike => "CORRELATION_SPIKE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionTaken {
    Monitoring,
    PausedSignals,
}

impl ActionTaken {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionTaken::Monitoring => "MONITORING",
            ActionTaken::PausedSignals => "PAUSED_SIGNALS",
        }
    }
}

/// Append-only anomaly record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Warning {
    pub severity:        Severity,
    pub kind:            WarningKind,
    pub symbol:          Option<String>,
    pub message:         String,
    pub triggered_value: f64,
    pub threshold:       f64,
    pub action_taken:    ActionTaken,
    pub created_at:      DateTime<Utc>,
    pub metadata:        serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_round_trips_binance_strings() {
        for tf in ["1m", "5m", "15m", "30m", "1h", "2h", "4h", "1d"] {
            let parsed: Timeframe = tf.parse().unwrap();
            assert_eq!(parsed.as_str(), tf);
        }
        assert!("3h".parse::<Timeframe>().is_err());
    }

    #[test]
    fn closed_candles_drops_forming_bar() {
        let c = Candle { timestamp: 0, open: 1.0, high: 1.0, low: 1.0, close: 1.0, volume: 1.0 };
        let window = vec![c, Candle { timestamp: 1, ..c }, Candle { timestamp: 2, ..c }];
        let closed = closed_candles(&window);
        assert_eq!(closed.len(), 2);
        assert_eq!(closed.last().unwrap().timestamp, 1);
        assert!(closed_candles(&[]).is_empty());
    }

    #[test]
    fn direction_serializes_upper_case() {
        let json = serde_json::to_string(&Direction::Long).unwrap();
        assert_eq!(json, "\"LONG\"");
        assert_eq!(Violation::HighCorrelation.as_str(), "HIGH_CORRELATION");
    }
}
