//! Closed-candle watermarks per (symbol, timeframe).
//!
//! A fetched window ends with the candle that is still forming, so the
//! newest *closed* candle is the second-to-last one. A candle is processed
//! once: `should_process` compares against the watermark, and the
//! watermark only moves through `commit`, which requires the receipt of a
//! durable decision for that candle.

use std::sync::{Mutex, MutexGuard};

use ahash::AHashMap;
use tracing::{debug, warn};

use crate::error::{ScanError, ScanResult};
use crate::models::{Candle, Timeframe};
use crate::store::{DecisionReceipt, Watermark};

type Key = (String, Timeframe);

#[derive(Debug, Default)]
pub struct CandleStateTracker {
    watermarks: Mutex<AHashMap<Key, i64>>,
}

impl CandleStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from persisted watermarks at startup.
    pub fn from_watermarks(marks: impl IntoIterator<Item = Watermark>) -> Self {
        let tracker = Self::new();
        {
            let mut map = tracker.lock();
            for m in marks {
                let slot = map.entry((m.symbol, m.timeframe)).or_insert(m.last_closed_ts);
                *slot = (*slot).max(m.last_closed_ts);
            }
        }
        tracker
    }

    fn lock(&self) -> MutexGuard<'_, AHashMap<Key, i64>> {
        self.watermarks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open time of the newest closed candle in a freshly fetched window.
    pub fn last_closed(candles: &[Candle]) -> ScanResult<i64> {
        match candles.len() {
            n if n >= 2 => Ok(candles[n - 2].timestamp),
            n => Err(ScanError::insufficient("last closed candle", 2, n)),
        }
    }

    pub fn watermark(&self, symbol: &str, timeframe: Timeframe) -> Option<i64> {
        self.lock().get(&(symbol.to_owned(), timeframe)).copied()
    }

    /// True when `candle_ts` is strictly newer than the stored watermark.
    pub fn should_process(&self, symbol: &str, timeframe: Timeframe, candle_ts: i64) -> bool {
        match self.watermark(symbol, timeframe) {
            Some(last) => candle_ts > last,
            None => true,
        }
    }

    /// Advance the watermark named by `receipt`. A receipt older than the
    /// stored watermark leaves it unchanged.
    pub fn commit(&self, receipt: &DecisionReceipt) {
        let mut map = self.lock();
        let key = (receipt.symbol().to_owned(), receipt.timeframe());
        let ts = receipt.candle_ts();
        match map.get(&key).copied() {
            Some(last) if ts < last => {
                warn!(
                    symbol = receipt.symbol(),
                    timeframe = %receipt.timeframe(),
                    stored = last,
                    attempted = ts,
                    "ignoring watermark regression"
                );
            }
            _ => {
                debug!(symbol = receipt.symbol(), timeframe = %receipt.timeframe(), ts, "watermark committed");
                map.insert(key, ts);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(ts: i64) -> Candle {
        Candle { timestamp: ts, open: 1.0, high: 1.0, low: 1.0, close: 1.0, volume: 1.0 }
    }

    #[test]
    fn last_closed_is_second_to_last() {
        let window = [candle(100), candle(200), candle(300)];
        assert_eq!(CandleStateTracker::last_closed(&window).unwrap(), 200);
        assert!(CandleStateTracker::last_closed(&[candle(1)]).is_err());
        assert!(CandleStateTracker::last_closed(&[]).is_err());
    }

    #[test]
    fn commit_blocks_same_candle_and_admits_next() {
        let tracker = CandleStateTracker::new();
        assert!(tracker.should_process("BTCUSDT", Timeframe::M15, 1_000));

        tracker.commit(&DecisionReceipt::no_signal("BTCUSDT", Timeframe::M15, 1_000));
        assert!(!tracker.should_process("BTCUSDT", Timeframe::M15, 1_000));
        assert!(tracker.should_process("BTCUSDT", Timeframe::M15, 1_001));
    }

    #[test]
    fn keys_are_independent() {
        let tracker = CandleStateTracker::new();
        tracker.commit(&DecisionReceipt::no_signal("BTCUSDT", Timeframe::M15, 5_000));
        assert!(tracker.should_process("BTCUSDT", Timeframe::H1, 1));
        assert!(tracker.should_process("ETHUSDT", Timeframe::M15, 1));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn watermark_is_monotonic() {
        let tracker = CandleStateTracker::new();
        tracker.commit(&DecisionReceipt::no_signal("BTCUSDT", Timeframe::M15, 5_000));
        tracker.commit(&DecisionReceipt::no_signal("BTCUSDT", Timeframe::M15, 4_000));
        assert_eq!(tracker.watermark("BTCUSDT", Timeframe::M15), Some(5_000));
    }

    #[test]
    fn seeded_from_store_rows() {
        let tracker = CandleStateTracker::from_watermarks(vec![Watermark {
            symbol: "SOLUSDT".into(),
            timeframe: Timeframe::M15,
            last_closed_ts: 9_000,
        }]);
        assert!(!tracker.should_process("SOLUSDT", Timeframe::M15, 9_000));
        assert!(tracker.should_process("SOLUSDT", Timeframe::M15, 9_001));
    }
}
