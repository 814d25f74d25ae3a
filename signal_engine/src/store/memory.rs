use std::sync::{Mutex, MutexGuard};
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::AHashMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{DecisionReceipt, DecisionRecord, Store, Watermark};
use crate::error::{ScanError, ScanResult};
use crate::models::{RiskDecision, Signal, Timeframe, Warning};
use crate::paper::{PaperPosition, PositionStatus};

#[derive(Debug, Default)]
struct Tables {
    signals:    Vec<(Signal, RiskDecision)>,
    positions:  Vec<PaperPosition>,
    warnings:   Vec<Warning>,
    watermarks: AHashMap<(String, Timeframe), i64>,
}

/// Process-local store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    #[cfg(test)]
    fail_decisions: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.lock().signals.iter().map(|(s, _)| s.clone()).collect()
    }

    pub fn decisions(&self) -> Vec<RiskDecision> {
        self.lock().signals.iter().map(|(_, d)| d.clone()).collect()
    }

    pub fn positions(&self) -> Vec<PaperPosition> {
        self.lock().positions.clone()
    }

    pub fn warnings(&self) -> Vec<Warning> {
        self.lock().warnings.clone()
    }

    pub fn watermark(&self, symbol: &str, timeframe: Timeframe) -> Option<i64> {
        self.lock()
            .watermarks
            .get(&(symbol.to_owned(), timeframe))
            .copied()
    }

    /// Seed a historical row, bypassing the decision path.
    pub fn push_signal(&self, signal: Signal, decision: RiskDecision) {
        self.lock().signals.push((signal, decision));
    }

    #[cfg(test)]
    pub(crate) fn fail_decisions(&self, fail: bool) {
        self.fail_decisions.store(fail, Ordering::SeqCst);
    }

    fn upsert_position(tables: &mut Tables, position: &PaperPosition) {
        match tables.positions.iter_mut().find(|p| p.id == position.id) {
            Some(existing) => *existing = position.clone(),
            None => tables.positions.push(position.clone()),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn open_positions(&self) -> ScanResult<Vec<PaperPosition>> {
        Ok(self
            .lock()
            .positions
            .iter()
            .filter(|p| p.status == PositionStatus::Open)
            .cloned()
            .collect())
    }

    async fn closed_positions(&self) -> ScanResult<Vec<PaperPosition>> {
        let mut closed: Vec<PaperPosition> = self
            .lock()
            .positions
            .iter()
            .filter(|p| p.status == PositionStatus::Closed)
            .cloned()
            .collect();
        closed.sort_by_key(|p| p.exit_time);
        Ok(closed)
    }

    async fn approved_signals_since(&self, since: DateTime<Utc>) -> ScanResult<u32> {
        let count = self
            .lock()
            .signals
            .iter()
            .filter(|(s, d)| d.is_approved() && s.created_at >= since)
            .count();
        Ok(count as u32)
    }

    async fn realized_pnl_since(&self, since: DateTime<Utc>) -> ScanResult<f64> {
        Ok(self
            .lock()
            .positions
            .iter()
            .filter(|p| p.status == PositionStatus::Closed)
            .filter(|p| p.exit_time.is_some_and(|t| t >= since))
            .map(|p| p.pnl_r)
            .sum())
    }

    async fn signals_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ScanResult<Vec<Signal>> {
        let mut signals: Vec<Signal> = self
            .lock()
            .signals
            .iter()
            .map(|(s, _)| s)
            .filter(|s| s.created_at >= from && s.created_at < to)
            .cloned()
            .collect();
        signals.sort_by_key(|s| s.created_at);
        Ok(signals)
    }

    async fn warnings_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ScanResult<Vec<Warning>> {
        let mut warnings: Vec<Warning> = self
            .lock()
            .warnings
            .iter()
            .filter(|w| w.created_at >= from && w.created_at < to)
            .cloned()
            .collect();
        warnings.sort_by_key(|w| w.created_at);
        Ok(warnings)
    }

    async fn last_signal_time(&self, symbol: &str) -> ScanResult<Option<DateTime<Utc>>> {
        Ok(self
            .lock()
            .signals
            .iter()
            .filter(|(s, _)| s.symbol == symbol)
            .map(|(s, _)| s.created_at)
            .max())
    }

    async fn record_decision(&self, record: &DecisionRecord) -> ScanResult<DecisionReceipt> {
        #[cfg(test)]
        if self.fail_decisions.load(Ordering::SeqCst) {
            return Err(ScanError::Persistence("injected decision failure".into()));
        }
        let mut tables = self.lock();
        if tables.signals.iter().any(|(s, _)| s.id == record.signal.id) {
            return Err(ScanError::Persistence(format!(
                "duplicate signal id {}",
                record.signal.id
            )));
        }
        tables
            .signals
            .push((record.signal.clone(), record.decision.clone()));
        if let Some(position) = &record.position {
            Self::upsert_position(&mut tables, position);
        }
        Ok(DecisionReceipt::recorded(&record.signal))
    }

    async fn save_position(&self, position: &PaperPosition) -> ScanResult<()> {
        Self::upsert_position(&mut self.lock(), position);
        Ok(())
    }

    async fn insert_warning(&self, warning: &Warning) -> ScanResult<()> {
        self.lock().warnings.push(warning.clone());
        Ok(())
    }

    async fn load_watermarks(&self) -> ScanResult<Vec<Watermark>> {
        Ok(self
            .lock()
            .watermarks
            .iter()
            .map(|((symbol, timeframe), ts)| Watermark {
                symbol:         symbol.clone(),
                timeframe:      *timeframe,
                last_closed_ts: *ts,
            })
            .collect())
    }

    async fn commit_watermark(&self, receipt: &DecisionReceipt) -> ScanResult<()> {
        let mut tables = self.lock();
        let slot = tables
            .watermarks
            .entry((receipt.symbol().to_owned(), receipt.timeframe()))
            .or_insert(receipt.candle_ts());
        *slot = (*slot).max(receipt.candle_ts());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn watermark_never_moves_backwards() {
        let store = MemoryStore::new();
        store
            .commit_watermark(&DecisionReceipt::no_signal("BTCUSDT", Timeframe::M15, 2_000))
            .await
            .unwrap();
        store
            .commit_watermark(&DecisionReceipt::no_signal("BTCUSDT", Timeframe::M15, 1_000))
            .await
            .unwrap();
        assert_eq!(store.watermark("BTCUSDT", Timeframe::M15), Some(2_000));
        assert_eq!(store.watermark("BTCUSDT", Timeframe::H1), None);
        assert_eq!(store.load_watermarks().await.unwrap().len(), 1);
    }
}
