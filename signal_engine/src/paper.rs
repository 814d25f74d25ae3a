/// paper.rs — Virtual position ledger in R units
///
/// ─────────────────────────────────────────────────────────────────────────
/// MATHEMATICAL SPECIFICATION
/// ─────────────────────────────────────────────────────────────────────────
///
/// RISK UNIT
///   risk = |entry − stop|            (must be > 0)
///   size = 1 R per trade
///
/// FEES (taker, both legs)
///   fee_R(price) = price × fee_pct / risk
///   fees_R       = fee_R(entry) + fee_R(exit)
///
/// REALISED P&L
///   d      = +1 LONG, −1 SHORT
///   pnl_R  = (exit − entry) / risk × d × size − fees_R
///   pnl_%  = (exit − entry) / entry × d × 100 − fees_R × risk / entry × 100
///
/// ADVERSE EXCURSION (percent, from the best price seen since entry)
///   LONG : dd = (max_price − price) / max_price × 100
///   SHORT: dd = (price − min_price) / min_price × 100
///   max_drawdown = max over all marks
///
/// EXITS
///   Stop is checked before target; the touched level is the exit price.
/// ─────────────────────────────────────────────────────────────────────────
use ahash::AHashMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ScanError, ScanResult};
use crate::models::{Direction, Signal};

/// Binance taker fee, charged on entry and exit.
pub const DEFAULT_FEE_PCT: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "OPEN",
            PositionStatus::Closed => "CLOSED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Manual,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::TakeProfit => "TAKE_PROFIT",
            ExitReason::Manual => "MANUAL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperPosition {
    pub id:               Uuid,
    pub signal_id:        Uuid,
    pub symbol:           String,
    pub side:             Direction,
    /// Position size in R units
    pub size_r:           f64,
    pub entry_price:      f64,
    pub entry_time:       DateTime<Utc>,
    pub stop_loss:        f64,
    pub take_profit:      f64,
    pub risk_per_unit:    f64,
    pub current_price:    f64,
    pub max_price:        f64,
    pub min_price:        f64,
    /// Worst adverse excursion from the best price seen, percent
    pub max_drawdown_pct: f64,
    pub fees_paid_r:      f64,
    pub unrealized_r:     f64,
    pub exit_price:       Option<f64>,
    pub exit_time:        Option<DateTime<Utc>>,
    pub exit_reason:      Option<ExitReason>,
    pub pnl_r:            f64,
    pub pnl_percent:      f64,
    pub duration_hours:   Option<f64>,
    pub status:           PositionStatus,
}

impl PaperPosition {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    fn mark(&mut self, price: f64) {
        self.current_price = price;
        self.max_price = self.max_price.max(price);
        self.min_price = self.min_price.min(price);

        let dd = match self.side {
            Direction::Short if self.min_price > 0.0 => {
                (price - self.min_price) / self.min_price * 100.0
            }
            Direction::Long if self.max_price > 0.0 => {
                (self.max_price - price) / self.max_price * 100.0
            }
            _ => 0.0,
        };
        self.max_drawdown_pct = self.max_drawdown_pct.max(dd);
        self.unrealized_r =
            (price - self.entry_price) / self.risk_per_unit * self.side.sign() * self.size_r;
    }

    /// Exit level touched by `price`, stop first.
    fn triggered_exit(&self, price: f64) -> Option<(f64, ExitReason)> {
        match self.side {
            Direction::Long if price <= self.stop_loss => Some((self.stop_loss, ExitReason::StopLoss)),
            Direction::Short if price >= self.stop_loss => Some((self.stop_loss, ExitReason::StopLoss)),
            Direction::Long if price >= self.take_profit => {
                Some((self.take_profit, ExitReason::TakeProfit))
            }
            Direction::Short if price <= self.take_profit => {
                Some((self.take_profit, ExitReason::TakeProfit))
            }
            _ => None,
        }
    }
}

/// In-memory view of open paper positions, one per symbol.
///
/// The ledger never touches storage itself. `prepare_open` validates and
/// builds a position that the caller persists together with its signal;
/// only then is it `insert`ed. Price updates and closes return the changed
/// positions so the caller can save them.
#[derive(Debug)]
pub struct PaperLedger {
    max_concurrent: usize,
    fee_pct:        f64,
    open:           AHashMap<String, PaperPosition>,
}

impl PaperLedger {
    pub fn new(max_concurrent: usize, fee_pct: f64) -> Self {
        Self {
            max_concurrent,
            fee_pct,
            open: AHashMap::new(),
        }
    }

    /// Rebuild from persisted open positions.
    pub fn with_positions(max_concurrent: usize, fee_pct: f64, positions: Vec<PaperPosition>) -> Self {
        let mut ledger = Self::new(max_concurrent, fee_pct);
        for p in positions.into_iter().filter(PaperPosition::is_open) {
            ledger.open.insert(p.symbol.clone(), p);
        }
        ledger
    }

    fn fee_r(&self, price: f64, risk_per_unit: f64) -> f64 {
        price * self.fee_pct / risk_per_unit
    }

    /// Validate and build a new position for `signal` without registering it.
    pub fn prepare_open(&self, signal: &Signal, now: DateTime<Utc>) -> ScanResult<PaperPosition> {
        if self.open.contains_key(&signal.symbol) {
            return Err(ScanError::Position(format!(
                "position already open for {}",
                signal.symbol
            )));
        }
        if self.open.len() >= self.max_concurrent {
            return Err(ScanError::Position(format!(
                "max concurrent positions ({}) reached, cannot open {}",
                self.max_concurrent, signal.symbol
            )));
        }
        if signal.direction == Direction::Neutral {
            return Err(ScanError::Position(format!(
                "cannot open a NEUTRAL position for {}",
                signal.symbol
            )));
        }
        let entry = signal.entry_price;
        let risk_per_unit = (entry - signal.stop_loss).abs();
        if risk_per_unit <= 0.0 || !risk_per_unit.is_finite() || entry <= 0.0 {
            return Err(ScanError::Position(format!(
                "stop loss equals entry price for {}",
                signal.symbol
            )));
        }

        Ok(PaperPosition {
            id:               Uuid::new_v4(),
            signal_id:        signal.id,
            symbol:           signal.symbol.clone(),
            side:             signal.direction,
            size_r:           1.0,
            entry_price:      entry,
            entry_time:       now,
            stop_loss:        signal.stop_loss,
            take_profit:      signal.take_profit,
            risk_per_unit,
            current_price:    entry,
            max_price:        entry,
            min_price:        entry,
            max_drawdown_pct: 0.0,
            fees_paid_r:      self.fee_r(entry, risk_per_unit),
            unrealized_r:     0.0,
            exit_price:       None,
            exit_time:        None,
            exit_reason:      None,
            pnl_r:            0.0,
            pnl_percent:      0.0,
            duration_hours:   None,
            status:           PositionStatus::Open,
        })
    }

    /// Register a position previously built by `prepare_open` and persisted.
    pub fn insert(&mut self, position: PaperPosition) {
        info!(
            symbol = %position.symbol,
            side = %position.side,
            entry = position.entry_price,
            stop = position.stop_loss,
            target = position.take_profit,
            "paper position opened"
        );
        self.open.insert(position.symbol.clone(), position);
    }

    pub fn open(&mut self, signal: &Signal, now: DateTime<Utc>) -> ScanResult<PaperPosition> {
        let position = self.prepare_open(signal, now)?;
        self.insert(position.clone());
        Ok(position)
    }

    /// Close the symbol's open position at `exit_price`. Closing a symbol
    /// with nothing open is a logged no-op.
    pub fn close(
        &mut self,
        symbol: &str,
        exit_price: f64,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> Option<PaperPosition> {
        let Some(mut pos) = self.open.remove(symbol) else {
            warn!(symbol, "no open position to close");
            return None;
        };

        pos.fees_paid_r += self.fee_r(exit_price, pos.risk_per_unit);
        let d = pos.side.sign();
        pos.pnl_r = (exit_price - pos.entry_price) / pos.risk_per_unit * d * pos.size_r - pos.fees_paid_r;
        pos.pnl_percent = (exit_price - pos.entry_price) / pos.entry_price * d * 100.0
            - pos.fees_paid_r * pos.risk_per_unit / pos.entry_price * 100.0;
        pos.duration_hours = Some((now - pos.entry_time).num_milliseconds() as f64 / 3_600_000.0);
        pos.current_price = exit_price;
        pos.unrealized_r = 0.0;
        pos.exit_price = Some(exit_price);
        pos.exit_time = Some(now);
        pos.exit_reason = Some(reason);
        pos.status = PositionStatus::Closed;

        info!(
            symbol,
            side = %pos.side,
            exit = exit_price,
            pnl_r = pos.pnl_r,
            pnl_pct = pos.pnl_percent,
            reason = reason.as_str(),
            "paper position closed"
        );
        Some(pos)
    }

    /// Mark open positions to market and auto-close on stop or target.
    /// Returns every position that changed, closed ones included.
    pub fn update_prices(&mut self, prices: &AHashMap<String, f64>, now: DateTime<Utc>) -> Vec<PaperPosition> {
        let mut changed = Vec::new();
        let mut exits = Vec::new();

        for (symbol, pos) in self.open.iter_mut() {
            let Some(&price) = prices.get(symbol) else {
                continue;
            };
            pos.mark(price);
            match pos.triggered_exit(price) {
                Some((level, reason)) => exits.push((symbol.clone(), level, reason)),
                None => changed.push(pos.clone()),
            }
        }

        for (symbol, level, reason) in exits {
            if let Some(closed) = self.close(&symbol, level, reason, now) {
                changed.push(closed);
            }
        }
        changed
    }

    pub fn get(&self, symbol: &str) -> Option<&PaperPosition> {
        self.open.get(symbol)
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &PaperPosition> {
        self.open.values()
    }

    pub fn open_symbols(&self) -> Vec<String> {
        self.open.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn signal(symbol: &str, direction: Direction, entry: f64, stop: f64, target: f64) -> Signal {
        Signal {
            id: Uuid::new_v4(),
            symbol: symbol.into(),
            timeframe: crate::models::Timeframe::M15,
            direction,
            score: 8.0,
            confidence: 0.8,
            entry_price: entry,
            stop_loss: stop,
            take_profit: target,
            reasons: vec![],
            regime: "BULLISH_NORMAL_BULLISH".into(),
            candle_ts: 0,
            created_at: t0(),
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn open_rejects_zero_risk() {
        let mut ledger = PaperLedger::new(5, 0.0);
        let err = ledger
            .open(&signal("BTCUSDT", Direction::Long, 100.0, 100.0, 110.0), t0())
            .unwrap_err();
        assert!(matches!(err, ScanError::Position(_)));
        assert!(ledger.is_empty());
    }

    #[test]
    fn one_position_per_symbol_and_concurrency_cap() {
        let mut ledger = PaperLedger::new(2, DEFAULT_FEE_PCT);
        ledger.open(&signal("A", Direction::Long, 100.0, 95.0, 110.0), t0()).unwrap();
        assert!(ledger.open(&signal("A", Direction::Long, 100.0, 95.0, 110.0), t0()).is_err());
        ledger.open(&signal("B", Direction::Short, 50.0, 52.0, 46.0), t0()).unwrap();
        assert!(ledger.open(&signal("C", Direction::Long, 10.0, 9.0, 12.0), t0()).is_err());
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn long_winner_and_fee_drag() {
        let mut gross = PaperLedger::new(5, 0.0);
        gross.open(&signal("A", Direction::Long, 100.0, 95.0, 120.0), t0()).unwrap();
        let no_fee = gross.close("A", 110.0, ExitReason::Manual, t0()).unwrap();
        assert!((no_fee.pnl_r - 2.0).abs() < 1e-12);
        assert!((no_fee.pnl_percent - 10.0).abs() < 1e-12);

        let mut net = PaperLedger::new(5, DEFAULT_FEE_PCT);
        net.open(&signal("A", Direction::Long, 100.0, 95.0, 120.0), t0()).unwrap();
        let with_fee = net.close("A", 110.0, ExitReason::Manual, t0()).unwrap();
        // (100 + 110) × 0.001 / 5
        assert!((with_fee.fees_paid_r - 0.042).abs() < 1e-12);
        assert!(with_fee.pnl_r < no_fee.pnl_r);
        assert!(with_fee.pnl_r > 0.0);
    }

    #[test]
    fn short_pnl_is_mirrored() {
        let mut ledger = PaperLedger::new(5, 0.0);
        ledger.open(&signal("A", Direction::Short, 100.0, 104.0, 90.0), t0()).unwrap();
        let closed = ledger.close("A", 96.0, ExitReason::Manual, t0()).unwrap();
        assert!((closed.pnl_r - 1.0).abs() < 1e-12);
    }

    #[test]
    fn closing_unknown_symbol_is_noop() {
        let mut ledger = PaperLedger::new(5, 0.0);
        assert!(ledger.close("NOPE", 1.0, ExitReason::Manual, t0()).is_none());
    }

    #[test]
    fn update_prices_hits_stop_before_target_and_records_duration() {
        let mut ledger = PaperLedger::new(5, 0.0);
        ledger.open(&signal("A", Direction::Long, 100.0, 95.0, 110.0), t0()).unwrap();

        let mut prices = AHashMap::new();
        prices.insert("A".to_string(), 104.0);
        let changed = ledger.update_prices(&prices, t0() + Duration::hours(1));
        assert_eq!(changed.len(), 1);
        assert!(changed[0].is_open());
        assert!((changed[0].unrealized_r - 0.8).abs() < 1e-12);

        prices.insert("A".to_string(), 93.0);
        let changed = ledger.update_prices(&prices, t0() + Duration::hours(3));
        let closed = &changed[0];
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.exit_reason, Some(ExitReason::StopLoss));
        assert_eq!(closed.exit_price, Some(95.0));
        assert!((closed.pnl_r + 1.0).abs() < 1e-12);
        assert_eq!(closed.duration_hours, Some(3.0));
        // best 104, worst mark 93
        assert!((closed.max_drawdown_pct - (104.0 - 93.0) / 104.0 * 100.0).abs() < 1e-9);
        assert!(ledger.is_empty());
    }

    #[test]
    fn short_take_profit_uses_target_level() {
        let mut ledger = PaperLedger::new(5, 0.0);
        ledger.open(&signal("A", Direction::Short, 100.0, 105.0, 90.0), t0()).unwrap();
        let mut prices = AHashMap::new();
        prices.insert("A".to_string(), 88.0);
        let changed = ledger.update_prices(&prices, t0());
        assert_eq!(changed[0].exit_reason, Some(ExitReason::TakeProfit));
        assert_eq!(changed[0].exit_price, Some(90.0));
        assert!((changed[0].pnl_r - 2.0).abs() < 1e-12);
    }
}
