//! Per-symbol bounded window of recent candles.

use std::sync::{Mutex, MutexGuard};

use ahash::AHashMap;
use chrono::{DateTime, Utc};

use crate::models::{Candle, Ohlcv};

/// Thread-safe candle cache keyed by symbol. Each entry is kept sorted
/// oldest-first, unique by timestamp and at most `capacity` long.
#[derive(Debug)]
pub struct MarketDataCache {
    capacity: usize,
    windows:  Mutex<AHashMap<String, Vec<Candle>>>,
}

impl MarketDataCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            windows:  Mutex::new(AHashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AHashMap<String, Vec<Candle>>> {
        self.windows.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Merge `candles` into the symbol's window. Incoming candles replace
    /// cached ones with the same timestamp (the forming bar gets refreshed).
    pub fn add(&self, symbol: &str, candles: &[Candle]) {
        if candles.is_empty() {
            return;
        }
        let mut windows = self.lock();
        let window = windows.entry(symbol.to_owned()).or_default();

        let mut merged: AHashMap<i64, Candle> =
            window.iter().map(|c| (c.timestamp, *c)).collect();
        for c in candles {
            merged.insert(c.timestamp, *c);
        }
        let mut next: Vec<Candle> = merged.into_values().collect();
        next.sort_by_key(|c| c.timestamp);
        if next.len() > self.capacity {
            next.drain(..next.len() - self.capacity);
        }
        *window = next;
    }

    pub fn candles(&self, symbol: &str) -> Vec<Candle> {
        self.lock().get(symbol).cloned().unwrap_or_default()
    }

    pub fn ohlcv(&self, symbol: &str) -> Option<Ohlcv> {
        let windows = self.lock();
        windows
            .get(symbol)
            .filter(|w| !w.is_empty())
            .map(|w| Ohlcv::from_candles(w))
    }

    pub fn latest_price(&self, symbol: &str) -> Option<f64> {
        self.lock()
            .get(symbol)
            .and_then(|w| w.last())
            .map(|c| c.close)
    }

    /// True when the newest cached candle is younger than `max_age_minutes`.
    pub fn has_fresh_data(&self, symbol: &str, max_age_minutes: i64, now: DateTime<Utc>) -> bool {
        let Some(ts) = self.lock().get(symbol).and_then(|w| w.last()).map(|c| c.timestamp) else {
            return false;
        };
        let age_ms = now.timestamp_millis() - ts;
        age_ms < max_age_minutes * 60_000
    }

    pub fn clear_symbol(&self, symbol: &str) {
        self.lock().remove(symbol);
    }

    pub fn clear_all(&self) {
        self.lock().clear();
    }

    /// Number of symbols with a cached window.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
