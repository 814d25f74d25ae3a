/// anomaly.rs — Market anomaly detector (circuit breaker input)
///
/// ─────────────────────────────────────────────────────────────────────────
/// MATHEMATICAL SPECIFICATION
/// ─────────────────────────────────────────────────────────────────────────
///
/// All checks use 1h closes; the last element is the forming candle.
///
/// REFERENCE SHOCK
///   Δ = (P_t − P_{t−1}) / P_{t−1}           (reference asset)
///   |Δ| > 8% → CRITICAL,  |Δ| > 5% → WARNING
///
/// BREADTH COLLAPSE
///   dir(s) = UP if Δ_s > +0.5%, DOWN if Δ_s < −0.5%, else none
///   The reference must itself have a direction.
///   against = #{s : dir(s) opposes dir(ref)} / #{s : dir(s) defined}
///   against > 50% → CRITICAL,  > 40% → WARNING
///
/// CORRELATION SPIKE   (per symbol, reference excluded)
///   r_t    = percent returns
///   ρ_now  = Pearson over the last 24 closes of both series
///   ρ_prev = Pearson over the 24 closes before those (0 without 48 closes)
///   |ρ_now − ρ_prev| > 50% → CRITICAL,  > 30% → WARNING
///
/// Every CRITICAL warning pauses signal emission until an explicit resume.
/// ─────────────────────────────────────────────────────────────────────────
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::data::{fetch_with_retry, MarketDataSource, RetryPolicy};
use crate::error::ScanResult;
use crate::indicators::{pct_returns, pearson};
use crate::models::{ActionTaken, Direction, Severity, Timeframe, Warning, WarningKind};
use crate::notify::Notifier;
use crate::pause::PauseState;
use crate::store::Store;

/// Minimum 1h move for a symbol to count as directional.
pub const DIRECTION_THRESHOLD: f64 = 0.005;
/// Closes per correlation window.
pub const CORRELATION_WINDOW: usize = 24;
const HISTORY_LIMIT: usize = 2 * CORRELATION_WINDOW;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnomalyThresholds {
    pub shock_warning:        f64,
    pub shock_critical:       f64,
    pub breadth_warning:      f64,
    pub breadth_critical:     f64,
    pub correlation_warning:  f64,
    pub correlation_critical: f64,
}

impl Default for AnomalyThresholds {
    fn default() -> Self {
        Self {
            shock_warning:        0.05,
            shock_critical:       0.08,
            breadth_warning:      0.40,
            breadth_critical:     0.50,
            correlation_warning:  0.30,
            correlation_critical: 0.50,
        }
    }
}

/// Severity of `value` against a warning/critical pair, with the threshold
/// that fired. Both comparisons are strict.
fn grade(value: f64, warning: f64, critical: f64) -> Option<(Severity, f64)> {
    if value > critical {
        Some((Severity::Critical, critical))
    } else if value > warning {
        Some((Severity::Warning, warning))
    } else {
        None
    }
}

fn hourly_change(closes: &[f64]) -> Option<f64> {
    match closes {
        [.., prev, last] if *prev > 0.0 => Some((last - prev) / prev),
        _ => None,
    }
}

/// UP/DOWN from the last 1h change; `None` inside the ±0.5% band.
pub fn hourly_direction(closes: &[f64]) -> Option<Direction> {
    let change = hourly_change(closes)?;
    if change > DIRECTION_THRESHOLD {
        Some(Direction::Long)
    } else if change < -DIRECTION_THRESHOLD {
        Some(Direction::Short)
    } else {
        None
    }
}

#[allow(clippy::too_many_arguments)]
fn warning(
    severity: Severity,
    kind: WarningKind,
    symbol: Option<String>,
    message: String,
    triggered_value: f64,
    threshold: f64,
    now: DateTime<Utc>,
    metadata: serde_json::Value,
) -> Warning {
    Warning {
        severity,
        kind,
        symbol,
        message,
        triggered_value,
        threshold,
        action_taken: ActionTaken::Monitoring,
        created_at: now,
        metadata,
    }
}

// ── Pure checks ───────────────────────────────────────────────────────────

pub fn detect_reference_shock(
    reference: &str,
    closes: &[f64],
    th: &AnomalyThresholds,
    now: DateTime<Utc>,
) -> Option<Warning> {
    let change = hourly_change(closes)?;
    let magnitude = change.abs();
    let (severity, threshold) = grade(magnitude, th.shock_warning, th.shock_critical)?;
    let direction = if change > 0.0 { "up" } else { "down" };
    Some(warning(
        severity,
        WarningKind::ReferenceShock,
        Some(reference.to_owned()),
        format!("{reference} price {direction} by {:.2}% in 1 hour", magnitude * 100.0),
        magnitude,
        threshold,
        now,
        json!({
            "direction": direction,
            "current_price": closes[closes.len() - 1],
            "previous_price": closes[closes.len() - 2],
        }),
    ))
}

pub fn detect_breadth_collapse(
    reference: &str,
    reference_direction: Option<Direction>,
    directions: &[Option<Direction>],
    th: &AnomalyThresholds,
    now: DateTime<Utc>,
) -> Option<Warning> {
    let reference_direction = reference_direction?;
    let up = directions.iter().filter(|d| **d == Some(Direction::Long)).count();
    let down = directions.iter().filter(|d| **d == Some(Direction::Short)).count();
    let directional = up + down;
    if directional == 0 {
        return None;
    }
    let against = match reference_direction {
        Direction::Long => down,
        _ => up,
    };
    let share = against as f64 / directional as f64;
    let (severity, threshold) = grade(share, th.breadth_warning, th.breadth_critical)?;
    Some(warning(
        severity,
        WarningKind::BreadthCollapse,
        None,
        format!("{:.1}% of symbols moving against {reference} trend", share * 100.0),
        share,
        threshold,
        now,
        json!({
            "reference_direction": reference_direction.as_str(),
            "up": up,
            "down": down,
            "neutral": directions.len() - directional,
        }),
    ))
}

fn window_correlation(a: &[f64], b: &[f64]) -> f64 {
    pearson(&pct_returns(a), &pct_returns(b))
}

pub fn detect_correlation_spike(
    reference: &str,
    symbol: &str,
    reference_closes: &[f64],
    symbol_closes: &[f64],
    th: &AnomalyThresholds,
    now: DateTime<Utc>,
) -> Option<Warning> {
    if symbol == reference || reference_closes.len() < 2 || symbol_closes.len() < 2 {
        return None;
    }
    let tail = |s: &[f64]| s[s.len().saturating_sub(CORRELATION_WINDOW)..].to_vec();
    let current = window_correlation(&tail(reference_closes), &tail(symbol_closes));

    let previous = if reference_closes.len() >= HISTORY_LIMIT && symbol_closes.len() >= HISTORY_LIMIT {
        let prev = |s: &[f64]| s[s.len() - HISTORY_LIMIT..s.len() - CORRELATION_WINDOW].to_vec();
        window_correlation(&prev(reference_closes), &prev(symbol_closes))
    } else {
        0.0
    };

    let change = (current - previous).abs();
    let (severity, threshold) = grade(change, th.correlation_warning, th.correlation_critical)?;
    Some(warning(
        severity,
        WarningKind::CorrelationSpike,
        Some(symbol.to_owned()),
        format!("{symbol} correlation with {reference} changed by {:.2}%", change * 100.0),
        change,
        threshold,
        now,
        json!({
            "previous_correlation": previous,
            "current_correlation": current,
        }),
    ))
}

// ── Detector ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectorStats {
    pub checks_run:         u64,
    pub warnings_generated: u64,
    pub errors:             u64,
    pub api_calls:          u64,
    pub last_check_time:    Option<DateTime<Utc>>,
}

pub struct AnomalyDetector {
    data:       Arc<dyn MarketDataSource>,
    store:      Arc<dyn Store>,
    pause:      Arc<PauseState>,
    notifier:   Arc<dyn Notifier>,
    reference:  String,
    universe:   RwLock<Vec<String>>,
    thresholds: AnomalyThresholds,
    batch_size: usize,
    retry:      RetryPolicy,
    stats:      Mutex<DetectorStats>,
}

impl AnomalyDetector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        data: Arc<dyn MarketDataSource>,
        store: Arc<dyn Store>,
        pause: Arc<PauseState>,
        notifier: Arc<dyn Notifier>,
        reference: impl Into<String>,
        universe: Vec<String>,
        thresholds: AnomalyThresholds,
        batch_size: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            data,
            store,
            pause,
            notifier,
            reference: reference.into(),
            universe: RwLock::new(universe),
            thresholds,
            batch_size: batch_size.max(1),
            retry,
            stats: Mutex::new(DetectorStats::default()),
        }
    }

    fn stats_mut(&self) -> MutexGuard<'_, DetectorStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stats(&self) -> DetectorStats {
        self.stats_mut().clone()
    }

    pub fn universe(&self) -> Vec<String> {
        self.universe.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the symbols checked for breadth and correlation.
    pub fn set_universe(&self, symbols: Vec<String>) {
        *self.universe.write().unwrap_or_else(|e| e.into_inner()) = symbols;
    }

    async fn closes(&self, symbol: &str) -> ScanResult<Vec<f64>> {
        self.stats_mut().api_calls += 1;
        let candles =
            fetch_with_retry(self.data.as_ref(), symbol, Timeframe::H1, HISTORY_LIMIT, &self.retry).await?;
        Ok(candles.iter().map(|c| c.close).collect())
    }

    /// Run all three checks once and handle whatever they raise.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Vec<Warning> {
        let started = Instant::now();
        let mut errors = 0u64;

        let reference_closes = match self.closes(&self.reference).await {
            Ok(c) => c,
            Err(e) => {
                error!(reference = %self.reference, error = %e, "reference fetch failed, skipping anomaly check");
                let mut stats = self.stats_mut();
                stats.checks_run += 1;
                stats.errors += 1;
                stats.last_check_time = Some(now);
                return Vec::new();
            }
        };

        let universe = self.universe();
        let symbols: Vec<&str> = universe
            .iter()
            .map(String::as_str)
            .filter(|s| *s != self.reference)
            .collect();
        let mut histories: Vec<(&str, Vec<f64>)> = Vec::with_capacity(symbols.len());
        for batch in symbols.chunks(self.batch_size) {
            let results = join_all(batch.iter().map(|s| self.closes(s))).await;
            for (symbol, result) in batch.iter().zip(results) {
                match result {
                    Ok(closes) => histories.push((symbol, closes)),
                    Err(e) => {
                        errors += 1;
                        debug!(symbol, error = %e, "anomaly fetch failed");
                    }
                }
            }
        }

        let th = &self.thresholds;
        let mut raised = Vec::new();
        raised.extend(detect_reference_shock(&self.reference, &reference_closes, th, now));

        let directions: Vec<Option<Direction>> =
            histories.iter().map(|(_, closes)| hourly_direction(closes)).collect();
        raised.extend(detect_breadth_collapse(
            &self.reference,
            hourly_direction(&reference_closes),
            &directions,
            th,
            now,
        ));

        for (symbol, closes) in &histories {
            raised.extend(detect_correlation_spike(&self.reference, symbol, &reference_closes, closes, th, now));
        }

        let mut handled = Vec::with_capacity(raised.len());
        for w in raised {
            match self.handle(w).await {
                Ok(w) => handled.push(w),
                Err(e) => {
                    errors += 1;
                    error!(error = %e, "failed to persist warning");
                }
            }
        }

        {
            let mut stats = self.stats_mut();
            stats.checks_run += 1;
            stats.warnings_generated += handled.len() as u64;
            stats.errors += errors;
            stats.last_check_time = Some(now);
        }
        info!(
            symbols = histories.len(),
            warnings = handled.len(),
            errors,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "anomaly check complete"
        );
        handled
    }

    /// Pause on CRITICAL, persist, then notify.
    async fn handle(&self, mut w: Warning) -> ScanResult<Warning> {
        if w.severity == Severity::Critical {
            self.pause
                .pause(format!("CRITICAL_WARNING: {} - {}", w.kind.as_str(), w.message));
            w.action_taken = ActionTaken::PausedSignals;
        }
        warn!(
            kind = w.kind.as_str(),
            severity = w.severity.as_str(),
            value = w.triggered_value,
            threshold = w.threshold,
            "{}",
            w.message
        );
        self.store.insert_warning(&w).await?;
        if !self.notifier.send_warning(&w).await {
            warn!(kind = w.kind.as_str(), "warning notification not delivered");
        }
        Ok(w)
    }

    /// Check immediately, then every `interval` until cancelled.
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        info!(reference = %self.reference, symbols = self.universe().len(), "anomaly detector started");
        loop {
            self.run_cycle(Utc::now()).await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.cancelled() => {
                    info!("anomaly detector shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::StaticMarketData;
    use crate::models::Candle;
    use crate::notify::LogNotifier;
    use crate::store::MemoryStore;

    fn th() -> AnomalyThresholds {
        AnomalyThresholds::default()
    }

    fn hourly(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle { timestamp: i as i64 * 3_600_000, open: c, high: c, low: c, close: c, volume: 1.0 })
            .collect()
    }

    #[test]
    fn shock_grades_by_magnitude() {
        let now = Utc::now();
        assert!(detect_reference_shock("BTCUSDT", &[100.0, 104.0], &th(), now).is_none());

        let w = detect_reference_shock("BTCUSDT", &[100.0, 94.0], &th(), now).unwrap();
        assert_eq!(w.severity, Severity::Warning);
        assert_eq!(w.threshold, 0.05);
        assert_eq!(w.message, "BTCUSDT price down by 6.00% in 1 hour");

        let w = detect_reference_shock("BTCUSDT", &[100.0, 109.0], &th(), now).unwrap();
        assert_eq!(w.severity, Severity::Critical);
        assert!(detect_reference_shock("BTCUSDT", &[100.0], &th(), now).is_none());
    }

    #[test]
    fn breadth_counts_only_directional_symbols() {
        let now = Utc::now();
        let up = Some(Direction::Long);
        let down = Some(Direction::Short);
        // 3 of 5 directional symbols oppose an up-moving reference
        let dirs = [up, up, down, down, down, None, None];
        let w = detect_breadth_collapse("BTCUSDT", up, &dirs, &th(), now).unwrap();
        assert_eq!(w.severity, Severity::Critical);
        assert!((w.triggered_value - 0.6).abs() < 1e-12);

        // 2 of 5 is exactly the warning threshold, which is not exceeded
        let dirs = [up, up, up, down, down];
        assert!(detect_breadth_collapse("BTCUSDT", up, &dirs, &th(), now).is_none());

        assert!(detect_breadth_collapse("BTCUSDT", None, &dirs, &th(), now).is_none());
    }

    #[test]
    fn direction_band_is_half_a_percent() {
        assert_eq!(hourly_direction(&[100.0, 100.6]), Some(Direction::Long));
        assert_eq!(hourly_direction(&[100.0, 99.4]), Some(Direction::Short));
        assert_eq!(hourly_direction(&[100.0, 100.4]), None);
    }

    #[test]
    fn correlation_spike_compares_consecutive_windows() {
        let now = Utc::now();
        let reference: Vec<f64> = (0..48).map(|i| 100.0 + (i as f64 * 0.9).sin() * 2.0).collect();
        // first 24 closes move against the reference, last 24 move with it
        let symbol: Vec<f64> = reference
            .iter()
            .enumerate()
            .map(|(i, p)| if i < 24 { 200.0 - p } else { *p * 2.0 })
            .collect();
        let w = detect_correlation_spike("BTCUSDT", "ETHUSDT", &reference, &symbol, &th(), now).unwrap();
        assert_eq!(w.severity, Severity::Critical);
        assert_eq!(w.symbol.as_deref(), Some("ETHUSDT"));

        let steady: Vec<f64> = reference.iter().map(|p| p * 3.0).collect();
        assert!(detect_correlation_spike("BTCUSDT", "SOLUSDT", &reference, &steady, &th(), now).is_none());
        assert!(detect_correlation_spike("BTCUSDT", "BTCUSDT", &reference, &reference, &th(), now).is_none());
    }

    #[tokio::test]
    async fn critical_shock_pauses_and_persists() {
        let data = Arc::new(StaticMarketData::new());
        let mut btc = vec![100.0; 47];
        btc.push(90.0);
        data.set("BTCUSDT", Timeframe::H1, hourly(&btc));
        data.set("ETHUSDT", Timeframe::H1, hourly(&vec![50.0; 48]));
        let store = Arc::new(MemoryStore::new());
        let pause = Arc::new(PauseState::new());

        let detector = AnomalyDetector::new(
            data.clone(),
            store.clone(),
            pause.clone(),
            Arc::new(LogNotifier),
            "BTCUSDT",
            vec!["BTCUSDT".into(), "ETHUSDT".into()],
            th(),
            10,
            RetryPolicy::immediate(),
        );
        let warnings = detector.run_cycle(Utc::now()).await;

        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].kind, WarningKind::ReferenceShock);
        assert_eq!(warnings[0].action_taken, ActionTaken::PausedSignals);
        assert!(pause.is_paused());
        assert!(pause.reason().unwrap().starts_with("CRITICAL_WARNING: REFERENCE_SHOCK"));
        assert_eq!(store.warnings().len(), 1);

        let stats = detector.stats();
        assert_eq!(stats.checks_run, 1);
        assert_eq!(stats.warnings_generated, 1);
        assert_eq!(stats.api_calls, 2);
    }

    #[tokio::test]
    async fn quiet_market_raises_nothing() {
        let data = Arc::new(StaticMarketData::new());
        data.set("BTCUSDT", Timeframe::H1, hourly(&vec![100.0; 48]));
        let store = Arc::new(MemoryStore::new());
        let pause = Arc::new(PauseState::new());
        let detector = AnomalyDetector::new(
            data,
            store.clone(),
            pause.clone(),
            Arc::new(LogNotifier),
            "BTCUSDT",
            vec!["BTCUSDT".into(), "MISSINGUSDT".into()],
            th(),
            10,
            RetryPolicy::immediate(),
        );
        assert!(detector.run_cycle(Utc::now()).await.is_empty());
        assert!(!pause.is_paused());
        assert!(store.warnings().is_empty());
        assert_eq!(detector.stats().errors, 1);
    }
}
