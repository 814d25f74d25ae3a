/// scanner.rs — Periodic multi-symbol signal pipeline
///
/// One cycle, per symbol (symbols fan out in bounded batches):
///
///   fetch entry TF ─► newest closed candle past the watermark?
///        │ no  → skip
///        ▼ yes
///   fetch intermediate + macro TF ─► indicators (closed candles only)
///        ─► regime ─► score ─► confluence penalty
///        ─► pause re-check ─► risk gate ─► pause re-check
///        ─► record decision (one transaction)
///        ─► commit watermark with the decision receipt
///
/// Open paper positions are marked to market at the end of every cycle,
/// paused or not. A failure in one symbol is logged and counted; it never
/// aborts the batch.
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::json;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::MarketDataCache;
use crate::candles::CandleStateTracker;
use crate::confluence;
use crate::data::{fetch_with_retry, MarketDataSource, RetryPolicy};
use crate::error::{ScanError, ScanResult};
use crate::features::{IndicatorParams, IndicatorSet};
use crate::metrics::{portfolio_stats, PortfolioStats};
use crate::models::{closed_candles, Candle, Direction, Ohlcv, RiskDecision, RiskStatus, Signal, Timeframe};
use crate::notify::Notifier;
use crate::paper::{PaperLedger, DEFAULT_FEE_PCT};
use crate::pause::PauseState;
use crate::regime::RegimeClassifier;
use crate::risk::{PortfolioRiskGate, RiskLimits};
use crate::scoring::{ScoringEngine, DEFAULT_MAX_SCORE, DEFAULT_MIN_SCORE};
use crate::store::{DecisionReceipt, DecisionRecord, Store};

/// Closed entry-timeframe candles needed before a symbol is scored.
pub const MIN_ENTRY_CANDLES: usize = 50;

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub universe:                 Vec<String>,
    pub entry_timeframe:          Timeframe,
    pub intermediate_timeframe:   Timeframe,
    pub macro_timeframe:          Timeframe,
    pub candle_limit:             usize,
    pub cache_capacity:           usize,
    pub min_score:                f64,
    pub max_score:                f64,
    pub max_concurrent_positions: usize,
    pub fee_pct:                  f64,
    pub batch_size:               usize,
    pub batch_pause:              Duration,
    pub scan_interval:            Duration,
    pub indicators:               IndicatorParams,
    pub retry:                    RetryPolicy,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            universe:                 Vec::new(),
            entry_timeframe:          Timeframe::M15,
            intermediate_timeframe:   Timeframe::H1,
            macro_timeframe:          Timeframe::H4,
            candle_limit:             250,
            cache_capacity:           500,
            min_score:                DEFAULT_MIN_SCORE,
            max_score:                DEFAULT_MAX_SCORE,
            max_concurrent_positions: 5,
            fee_pct:                  DEFAULT_FEE_PCT,
            batch_size:               10,
            batch_pause:              Duration::from_secs(1),
            scan_interval:            Duration::from_secs(300),
            indicators:               IndicatorParams::default(),
            retry:                    RetryPolicy::default(),
        }
    }
}

/// What happened to one symbol in one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolOutcome {
    /// Newest closed candle was already processed
    AlreadyProcessed,
    /// Score below threshold or no direction
    NoCandidate,
    /// Confluence penalty pushed the score below threshold
    Discarded,
    /// Pause asserted mid-cycle; nothing committed
    Paused,
    Approved,
    Rejected,
}

/// Cumulative scanner counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanStats {
    pub cycles:              u64,
    pub paused_cycles:       u64,
    pub symbols_scanned:     u64,
    pub candles_skipped:     u64,
    pub signals_created:     u64,
    pub signals_approved:    u64,
    pub signals_rejected:    u64,
    pub positions_closed:    u64,
    pub errors:              u64,
    pub api_calls:           u64,
    pub last_scan_time:      Option<DateTime<Utc>>,
    pub last_cycle_duration: Option<Duration>,
}

pub struct Scanner {
    config:     ScannerConfig,
    data:       Arc<dyn MarketDataSource>,
    store:      Arc<dyn Store>,
    pause:      Arc<PauseState>,
    notifier:   Arc<dyn Notifier>,
    universe:   RwLock<Vec<String>>,
    /// Serialises the gate → persist → ledger section across symbol tasks
    gate:       tokio::sync::Mutex<Option<PortfolioRiskGate>>,
    ledger:     Mutex<PaperLedger>,
    cache:      MarketDataCache,
    tracker:    CandleStateTracker,
    classifier: RegimeClassifier,
    scoring:    ScoringEngine,
    stats:      Mutex<ScanStats>,
}

impl Scanner {
    /// Restore watermarks, open positions and risk state from `store`.
    /// `risk_limits = None` approves every candidate directly.
    pub async fn load(
        config: ScannerConfig,
        data: Arc<dyn MarketDataSource>,
        store: Arc<dyn Store>,
        pause: Arc<PauseState>,
        notifier: Arc<dyn Notifier>,
        risk_limits: Option<RiskLimits>,
        now: DateTime<Utc>,
    ) -> ScanResult<Self> {
        let tracker = CandleStateTracker::from_watermarks(store.load_watermarks().await?);
        let ledger = PaperLedger::with_positions(
            config.max_concurrent_positions,
            config.fee_pct,
            store.open_positions().await?,
        );
        let gate = match risk_limits {
            Some(limits) => Some(PortfolioRiskGate::load(limits, store.as_ref(), now).await?),
            None => None,
        };
        info!(
            symbols = config.universe.len(),
            watermarks = tracker.len(),
            open_positions = ledger.len(),
            risk_gate = gate.is_some(),
            "scanner state restored"
        );

        Ok(Self {
            cache: MarketDataCache::new(config.cache_capacity),
            scoring: ScoringEngine::new(config.min_score, config.max_score),
            classifier: RegimeClassifier::new(),
            universe: RwLock::new(config.universe.clone()),
            config,
            data,
            store,
            pause,
            notifier,
            gate: tokio::sync::Mutex::new(gate),
            ledger: Mutex::new(ledger),
            tracker,
            stats: Mutex::new(ScanStats::default()),
        })
    }

    fn ledger(&self) -> MutexGuard<'_, PaperLedger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stats_mut(&self) -> MutexGuard<'_, ScanStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stats(&self) -> ScanStats {
        self.stats_mut().clone()
    }

    /// Symbols scanned by the next cycle.
    pub fn universe(&self) -> Vec<String> {
        self.universe.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the scanned symbols; a cycle in flight keeps its snapshot.
    pub fn set_universe(&self, symbols: Vec<String>) {
        info!(symbols = symbols.len(), "scanner universe updated");
        *self.universe.write().unwrap_or_else(|e| e.into_inner()) = symbols;
    }

    pub fn tracker(&self) -> &CandleStateTracker {
        &self.tracker
    }

    pub fn cache(&self) -> &MarketDataCache {
        &self.cache
    }

    pub fn open_symbols(&self) -> Vec<String> {
        self.ledger().open_symbols()
    }

    /// Paper portfolio summary from the ledger and closed history.
    pub async fn portfolio_stats(&self) -> ScanResult<PortfolioStats> {
        let closed = self.store.closed_positions().await?;
        let open: Vec<_> = self.ledger().open_positions().cloned().collect();
        Ok(portfolio_stats(&open, &closed))
    }

    async fn fetch(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> ScanResult<Vec<Candle>> {
        self.stats_mut().api_calls += 1;
        fetch_with_retry(self.data.as_ref(), symbol, timeframe, limit, &self.config.retry).await
    }

    // ── Cycle ─────────────────────────────────────────────────────────────

    /// Run one scan cycle over the universe.
    pub async fn run_cycle(&self, now: DateTime<Utc>) {
        let started = Instant::now();

        if self.pause.is_paused() {
            info!(reason = ?self.pause.reason(), "signals paused, skipping scan");
            let closed = self.mark_to_market(now).await;
            let mut stats = self.stats_mut();
            stats.positions_closed += closed as u64;
            stats.cycles += 1;
            stats.paused_cycles += 1;
            stats.last_scan_time = Some(now);
            stats.last_cycle_duration = Some(started.elapsed());
            return;
        }

        let universe = self.universe();
        let mut tally: AHashMap<&'static str, u64> = AHashMap::new();
        let batch_size = self.config.batch_size.max(1);
        for (i, batch) in universe.chunks(batch_size).enumerate() {
            if i > 0 && !self.config.batch_pause.is_zero() {
                tokio::time::sleep(self.config.batch_pause).await;
            }
            let results = join_all(batch.iter().map(|s| self.process_symbol(s, now))).await;
            for (symbol, result) in batch.iter().zip(results) {
                let key = match result {
                    Ok(SymbolOutcome::AlreadyProcessed) => "skipped",
                    Ok(SymbolOutcome::NoCandidate) => "no_candidate",
                    Ok(SymbolOutcome::Discarded) => "discarded",
                    Ok(SymbolOutcome::Paused) => "paused",
                    Ok(SymbolOutcome::Approved) => "approved",
                    Ok(SymbolOutcome::Rejected) => "rejected",
                    Err(ScanError::Data(e)) => {
                        warn!(symbol = %symbol, error = %e, "symbol skipped: data error");
                        "errors"
                    }
                    Err(e) => {
                        error!(symbol = %symbol, error = %e, "symbol failed");
                        "errors"
                    }
                };
                *tally.entry(key).or_default() += 1;
            }
        }

        let closed = self.mark_to_market(now).await;
        let count = |k: &str| tally.get(k).copied().unwrap_or(0);
        let elapsed = started.elapsed();
        {
            let mut stats = self.stats_mut();
            stats.cycles += 1;
            stats.symbols_scanned += universe.len() as u64;
            stats.candles_skipped += count("skipped");
            stats.signals_created += count("approved") + count("rejected");
            stats.signals_approved += count("approved");
            stats.signals_rejected += count("rejected");
            stats.positions_closed += closed as u64;
            stats.errors += count("errors");
            stats.last_scan_time = Some(now);
            stats.last_cycle_duration = Some(elapsed);
        }
        info!(
            symbols = universe.len(),
            approved = count("approved"),
            rejected = count("rejected"),
            skipped = count("skipped"),
            errors = count("errors"),
            closed,
            elapsed_ms = elapsed.as_millis() as u64,
            "scan cycle complete"
        );
    }

    /// Cycle immediately, then every `scan_interval` until cancelled. A
    /// cycle in flight always completes.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.config.scan_interval.as_secs(), "scanner started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("scanner shutting down");
                    return;
                }
                _ = ticker.tick() => self.run_cycle(Utc::now()).await,
            }
        }
    }

    // ── Per-symbol pipeline ───────────────────────────────────────────────

    pub async fn process_symbol(&self, symbol: &str, now: DateTime<Utc>) -> ScanResult<SymbolOutcome> {
        let cfg = &self.config;
        let entry = self.fetch(symbol, cfg.entry_timeframe, cfg.candle_limit).await?;
        self.cache.add(symbol, &entry);

        let last_closed = CandleStateTracker::last_closed(&entry)?;
        if !self.tracker.should_process(symbol, cfg.entry_timeframe, last_closed) {
            debug!(symbol, candle_ts = last_closed, "candle already processed");
            return Ok(SymbolOutcome::AlreadyProcessed);
        }

        let closed = closed_candles(&entry);
        if closed.len() < MIN_ENTRY_CANDLES {
            return Err(ScanError::insufficient("entry timeframe", MIN_ENTRY_CANDLES, closed.len()));
        }

        let (intermediate, macro_tf) = tokio::try_join!(
            self.fetch(symbol, cfg.intermediate_timeframe, cfg.candle_limit),
            self.fetch(symbol, cfg.macro_timeframe, cfg.candle_limit),
        )?;

        let data = Ohlcv::from_candles(closed);
        let ind = IndicatorSet::compute(&data, &cfg.indicators);
        let ind_mid = IndicatorSet::compute(&Ohlcv::from_candles(closed_candles(&intermediate)), &cfg.indicators);
        let ind_macro = IndicatorSet::compute(&Ohlcv::from_candles(closed_candles(&macro_tf)), &cfg.indicators);

        let regime = self.classifier.classify(symbol, &data, &ind, now);
        let scored = self.scoring.score(symbol, &data, &ind, &regime);

        if scored.direction == Direction::Neutral || !scored.meets_threshold {
            debug!(symbol, score = scored.score, direction = %scored.direction, "no candidate");
            self.commit(&DecisionReceipt::no_signal(symbol, cfg.entry_timeframe, last_closed)).await?;
            return Ok(SymbolOutcome::NoCandidate);
        }

        let conf = confluence::check_confluence(scored.direction, &ind_mid, &ind_macro);
        let Some(final_score) = confluence::apply(scored.score, &conf, cfg.min_score) else {
            info!(
                symbol,
                base_score = scored.score,
                penalty = conf.score_penalty,
                reason = %conf.reason,
                "candidate discarded by confluence"
            );
            self.commit(&DecisionReceipt::no_signal(symbol, cfg.entry_timeframe, last_closed)).await?;
            return Ok(SymbolOutcome::Discarded);
        };

        if self.pause.is_paused() {
            info!(symbol, "pause asserted mid-cycle, candidate held back");
            return Ok(SymbolOutcome::Paused);
        }

        let mut reasons = scored.reasons.clone();
        reasons.push(format!("Confluence: {}", conf.reason));
        let signal = Signal {
            id:          Uuid::new_v4(),
            symbol:      symbol.to_owned(),
            timeframe:   cfg.entry_timeframe,
            direction:   scored.direction,
            score:       final_score,
            confidence:  scored.confidence,
            entry_price: scored.entry_price,
            stop_loss:   scored.stop_loss,
            take_profit: scored.take_profit,
            reasons,
            regime:      regime.regime.clone(),
            candle_ts:   last_closed,
            created_at:  now,
            metadata:    json!({
                "base_score": scored.score,
                "components": scored.components,
                "confluence": conf,
                "regime": regime,
                "indicators": {
                    cfg.entry_timeframe.as_str(): ind.to_json(),
                    cfg.intermediate_timeframe.as_str(): ind_mid.to_json(),
                    cfg.macro_timeframe.as_str(): ind_macro.to_json(),
                },
            }),
        };

        let Some((receipt, approved)) = self.decide(signal.clone(), now).await? else {
            info!(symbol, "pause asserted during risk evaluation, candidate held back");
            return Ok(SymbolOutcome::Paused);
        };
        self.commit(&receipt).await?;

        if approved {
            if !self.notifier.send_signal(&signal).await {
                warn!(symbol, "signal notification not delivered");
            }
            Ok(SymbolOutcome::Approved)
        } else {
            Ok(SymbolOutcome::Rejected)
        }
    }

    /// Gate, persist and register one candidate. Holding the gate lock for
    /// the whole section keeps the alert counter and position cap exact
    /// while symbol tasks run concurrently. `None` when the pause was
    /// asserted before the decision could be persisted.
    async fn decide(&self, signal: Signal, now: DateTime<Utc>) -> ScanResult<Option<(DecisionReceipt, bool)>> {
        let mut gate = self.gate.lock().await;
        let decision = match gate.as_mut() {
            Some(g) => g.evaluate(&signal, self.store.as_ref(), self.data.as_ref(), now).await?,
            None => RiskDecision {
                status:          RiskStatus::Approved,
                reason:          "Risk gate disabled".into(),
                violation:       None,
                correlations:    Vec::new(),
                avg_correlation: 0.0,
            },
        };
        let approved = decision.is_approved();

        if self.pause.is_paused() {
            if let (true, Some(g)) = (approved, gate.as_mut()) {
                g.release_approval();
            }
            return Ok(None);
        }

        let position = if approved {
            let prepared = self.ledger().prepare_open(&signal, now);
            match prepared {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!(symbol = %signal.symbol, error = %e, "approved without paper position");
                    None
                }
            }
        } else {
            None
        };

        let record = DecisionRecord { signal, decision, position };
        let receipt = match self.store.record_decision(&record).await {
            Ok(r) => r,
            Err(e) => {
                if let (true, Some(g)) = (approved, gate.as_mut()) {
                    if let Err(reload) = g.reload(self.store.as_ref(), now).await {
                        error!(error = %reload, "risk gate reload failed");
                    }
                }
                return Err(e);
            }
        };

        if let Some(p) = record.position {
            if let Some(g) = gate.as_mut() {
                g.record_open(&p.symbol);
            }
            self.ledger().insert(p);
        }
        Ok(Some((receipt, approved)))
    }

    /// Persist then apply a watermark. The decision behind the receipt is
    /// already durable, so the in-memory watermark advances even if the
    /// store write fails.
    async fn commit(&self, receipt: &DecisionReceipt) -> ScanResult<()> {
        let persisted = self.store.commit_watermark(receipt).await;
        self.tracker.commit(receipt);
        persisted
    }

    // ── Paper positions ───────────────────────────────────────────────────

    /// Refresh prices for open positions, apply stops and targets, and
    /// persist every change. Returns how many positions closed.
    async fn mark_to_market(&self, now: DateTime<Utc>) -> usize {
        let symbols = self.ledger().open_symbols();
        if symbols.is_empty() {
            return 0;
        }
        let tf = self.config.entry_timeframe;
        let max_age_minutes = 2 * tf.duration_ms() / 60_000;

        let mut prices = AHashMap::new();
        for symbol in &symbols {
            if !self.cache.has_fresh_data(symbol, max_age_minutes, now) {
                match self.fetch(symbol, tf, 2).await {
                    Ok(candles) => self.cache.add(symbol, &candles),
                    Err(e) => warn!(symbol = %symbol, error = %e, "price refresh failed"),
                }
            }
            if let Some(price) = self.cache.latest_price(symbol) {
                prices.insert(symbol.clone(), price);
            }
        }

        let changed = self.ledger().update_prices(&prices, now);
        let mut closed = 0;
        for p in &changed {
            if let Err(e) = self.store.save_position(p).await {
                error!(symbol = %p.symbol, error = %e, "failed to persist paper position");
            }
            if !p.is_open() {
                closed += 1;
                let mut gate = self.gate.lock().await;
                if let Some(g) = gate.as_mut() {
                    g.record_close(&p.symbol, p.pnl_r, p.exit_time.unwrap_or(now));
                }
            }
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::StaticMarketData;
    use crate::notify::LogNotifier;
    use crate::paper::PositionStatus;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::TimeZone;

    const BASE_MS: i64 = 1_772_409_600_000; // 2026-03-02T00:00:00Z

    fn ramp(tf: Timeframe, n: usize, start: f64, step: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let close = start + step * i as f64;
                Candle {
                    timestamp: BASE_MS + i as i64 * tf.duration_ms(),
                    open: close,
                    high: close + 2.0,
                    low: close - 2.0,
                    close,
                    volume: 1_000.0,
                }
            })
            .collect()
    }

    fn now() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(BASE_MS + 60 * Timeframe::M15.duration_ms()).unwrap()
    }

    fn rising_market(symbol: &str) -> StaticMarketData {
        let data = StaticMarketData::new();
        data.set(symbol, Timeframe::M15, ramp(Timeframe::M15, 60, 100.0, 1.0));
        data.set(symbol, Timeframe::H1, ramp(Timeframe::H1, 60, 100.0, 1.0));
        data.set(symbol, Timeframe::H4, ramp(Timeframe::H4, 220, 50.0, 0.5));
        data
    }

    fn config(universe: &[&str]) -> ScannerConfig {
        ScannerConfig {
            universe: universe.iter().map(|s| s.to_string()).collect(),
            batch_pause: Duration::ZERO,
            retry: RetryPolicy::immediate(),
            ..ScannerConfig::default()
        }
    }

    async fn scanner(
        data: Arc<dyn MarketDataSource>,
        store: Arc<MemoryStore>,
        pause: Arc<PauseState>,
        limits: Option<RiskLimits>,
    ) -> Scanner {
        Scanner::load(config(&["XUSDT"]), data, store, pause, Arc::new(LogNotifier), limits, now())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn rising_market_emits_one_long_with_position() {
        let store = Arc::new(MemoryStore::new());
        let pause = Arc::new(PauseState::new());
        let s = scanner(Arc::new(rising_market("XUSDT")), store.clone(), pause, Some(RiskLimits::default())).await;

        s.run_cycle(now()).await;

        let signals = store.signals();
        assert_eq!(signals.len(), 1);
        let sig = &signals[0];
        assert_eq!(sig.direction, Direction::Long);
        assert!(sig.score >= 7.0, "score {}", sig.score);
        assert_eq!(sig.metadata["confluence"]["score_penalty"], json!(0.0));
        assert_eq!(sig.metadata["base_score"], json!(sig.score));
        assert_eq!(sig.candle_ts, BASE_MS + 58 * Timeframe::M15.duration_ms());
        assert!(store.decisions()[0].is_approved());

        let positions = store.positions();
        assert_eq!(positions.len(), 1);
        let p = &positions[0];
        assert_eq!(p.status, PositionStatus::Open);
        assert_eq!(p.signal_id, sig.id);
        assert!(p.stop_loss < p.entry_price && p.entry_price < p.take_profit);

        assert_eq!(store.watermark("XUSDT", Timeframe::M15), Some(sig.candle_ts));
        let stats = s.stats();
        assert_eq!(stats.signals_approved, 1);
        assert_eq!(stats.errors, 0);
        assert_eq!(s.open_symbols(), vec!["XUSDT".to_string()]);
    }

    #[tokio::test]
    async fn same_candle_is_processed_once() {
        let store = Arc::new(MemoryStore::new());
        let s = scanner(Arc::new(rising_market("XUSDT")), store.clone(), Arc::new(PauseState::new()), None).await;

        s.run_cycle(now()).await;
        s.run_cycle(now()).await;

        assert_eq!(store.signals().len(), 1);
        assert_eq!(store.decisions()[0].reason, "Risk gate disabled");
        assert_eq!(s.stats().candles_skipped, 1);
    }

    #[tokio::test]
    async fn paused_cycle_emits_nothing_until_resumed() {
        let store = Arc::new(MemoryStore::new());
        let pause = Arc::new(PauseState::new());
        let s = scanner(Arc::new(rising_market("XUSDT")), store.clone(), pause.clone(), Some(RiskLimits::default())).await;

        pause.pause("CRITICAL_WARNING: REFERENCE_SHOCK");
        s.run_cycle(now()).await;
        assert!(store.signals().is_empty());
        assert_eq!(store.watermark("XUSDT", Timeframe::M15), None);
        assert_eq!(s.stats().paused_cycles, 1);

        pause.resume();
        s.run_cycle(now()).await;
        assert_eq!(store.signals().len(), 1);
    }

    /// Asserts the pause while the macro timeframe is being fetched.
    struct PausingSource {
        inner: StaticMarketData,
        pause: Arc<PauseState>,
    }

    #[async_trait]
    impl MarketDataSource for PausingSource {
        async fn fetch_candles(&self, symbol: &str, tf: Timeframe, limit: usize) -> ScanResult<Vec<Candle>> {
            if tf == Timeframe::H4 {
                self.pause.pause("detector fired mid-cycle");
            }
            self.inner.fetch_candles(symbol, tf, limit).await
        }
    }

    #[tokio::test]
    async fn pause_asserted_mid_cycle_blocks_commit() {
        let store = Arc::new(MemoryStore::new());
        let pause = Arc::new(PauseState::new());
        let source = PausingSource { inner: rising_market("XUSDT"), pause: pause.clone() };
        let s = scanner(Arc::new(source), store.clone(), pause.clone(), Some(RiskLimits::default())).await;

        let outcome = s.process_symbol("XUSDT", now()).await.unwrap();
        assert_eq!(outcome, SymbolOutcome::Paused);
        assert!(store.signals().is_empty());
        assert!(s.tracker().should_process("XUSDT", Timeframe::M15, BASE_MS + 58 * Timeframe::M15.duration_ms()));
    }

    /// Asserts the pause when the risk gate pulls correlation history.
    struct GatePausingSource {
        inner: StaticMarketData,
        pause: Arc<PauseState>,
    }

    #[async_trait]
    impl MarketDataSource for GatePausingSource {
        async fn fetch_candles(&self, symbol: &str, tf: Timeframe, limit: usize) -> ScanResult<Vec<Candle>> {
            let limits = RiskLimits::default();
            if tf == limits.correlation_timeframe && limit == limits.correlation_limit {
                self.pause.pause("detector fired during risk evaluation");
            }
            self.inner.fetch_candles(symbol, tf, limit).await
        }
    }

    #[tokio::test]
    async fn pause_asserted_during_risk_evaluation_blocks_commit() {
        let store = Arc::new(MemoryStore::new());
        let pause = Arc::new(PauseState::new());
        let inner = rising_market("AUSDT");
        inner.set("BUSDT", Timeframe::M15, ramp(Timeframe::M15, 60, 100.0, 1.0));
        inner.set("BUSDT", Timeframe::H1, ramp(Timeframe::H1, 60, 100.0, 1.0));
        inner.set("BUSDT", Timeframe::H4, ramp(Timeframe::H4, 220, 50.0, 0.5));
        let source = GatePausingSource { inner, pause: pause.clone() };
        let cfg = ScannerConfig { batch_size: 1, ..config(&["AUSDT", "BUSDT"]) };
        let s = Scanner::load(
            cfg,
            Arc::new(source),
            store.clone(),
            pause.clone(),
            Arc::new(LogNotifier),
            Some(RiskLimits::default()),
            now(),
        )
        .await
        .unwrap();

        s.run_cycle(now()).await;

        // AUSDT went through with an empty book; BUSDT's correlation fetch
        // raised the pause before its decision was written
        assert!(pause.is_paused());
        let symbols: Vec<String> = store.signals().into_iter().map(|sig| sig.symbol).collect();
        assert_eq!(symbols, vec!["AUSDT".to_string()]);
        assert_eq!(store.watermark("BUSDT", Timeframe::M15), None);
        assert!(s.tracker().watermark("BUSDT", Timeframe::M15).is_none());
        assert_eq!(s.stats().signals_created, 1);
    }

    #[tokio::test]
    async fn short_window_is_a_data_error_and_keeps_watermark() {
        let store = Arc::new(MemoryStore::new());
        let data = StaticMarketData::new();
        for tf in [Timeframe::M15, Timeframe::H1, Timeframe::H4] {
            data.set("XUSDT", tf, ramp(tf, 10, 100.0, 1.0));
        }
        let s = scanner(Arc::new(data), store.clone(), Arc::new(PauseState::new()), None).await;

        let err = s.process_symbol("XUSDT", now()).await.unwrap_err();
        assert!(matches!(err, ScanError::Data(_)), "got {err:?}");
        assert_eq!(store.watermark("XUSDT", Timeframe::M15), None);
        assert!(s.tracker().is_empty());

        s.run_cycle(now()).await;
        assert_eq!(s.stats().errors, 1);
        assert!(s.tracker().is_empty());
    }

    #[tokio::test]
    async fn fifty_rising_hourly_candles_emit_unpenalised_long() {
        let hour = Timeframe::H1.duration_ms();
        let now = Utc.timestamp_millis_opt(BASE_MS + 51 * hour).unwrap();
        let data = StaticMarketData::new();
        // 50 closed hourly candles plus the forming one
        data.set("XUSDT", Timeframe::H1, ramp(Timeframe::H1, 51, 100.0, 1.0));
        data.set("XUSDT", Timeframe::H4, ramp(Timeframe::H4, 220, 50.0, 0.5));
        let cfg = ScannerConfig {
            entry_timeframe: Timeframe::H1,
            intermediate_timeframe: Timeframe::H1,
            macro_timeframe: Timeframe::H4,
            ..config(&["XUSDT"])
        };
        let store = Arc::new(MemoryStore::new());
        let s = Scanner::load(
            cfg,
            Arc::new(data),
            store.clone(),
            Arc::new(PauseState::new()),
            Arc::new(LogNotifier),
            Some(RiskLimits::default()),
            now,
        )
        .await
        .unwrap();

        assert_eq!(s.process_symbol("XUSDT", now).await.unwrap(), SymbolOutcome::Approved);

        let signals = store.signals();
        assert_eq!(signals.len(), 1);
        let sig = &signals[0];
        assert_eq!(sig.direction, Direction::Long);
        assert_eq!(sig.timeframe, Timeframe::H1);
        assert_eq!(sig.candle_ts, BASE_MS + 49 * hour);
        assert_eq!(sig.metadata["confluence"]["score_penalty"], json!(0.0));
        assert_eq!(sig.metadata["base_score"], json!(sig.score));
        assert!(sig.metadata["indicators"]["1h"]["rsi"]["value"].as_f64().is_some_and(|r| r > 55.0));

        let positions = store.positions();
        assert_eq!(positions.len(), 1);
        assert!(positions[0].stop_loss < positions[0].entry_price);
        assert!(positions[0].take_profit > positions[0].entry_price);
        assert_eq!(store.watermark("XUSDT", Timeframe::H1), Some(sig.candle_ts));
    }

    #[tokio::test]
    async fn failed_decision_leaves_watermark_and_counter() {
        let store = Arc::new(MemoryStore::new());
        let limits = RiskLimits { max_alerts_per_day: 1, ..RiskLimits::default() };
        let s = scanner(Arc::new(rising_market("XUSDT")), store.clone(), Arc::new(PauseState::new()), Some(limits)).await;

        store.fail_decisions(true);
        s.run_cycle(now()).await;
        assert!(store.signals().is_empty());
        assert!(store.positions().is_empty());
        assert_eq!(store.watermark("XUSDT", Timeframe::M15), None);
        assert!(s.open_symbols().is_empty());
        assert_eq!(s.stats().errors, 1);

        // the approval that failed to persist must not consume the daily cap
        store.fail_decisions(false);
        s.run_cycle(now()).await;
        assert_eq!(store.signals().len(), 1);
        assert!(store.decisions()[0].is_approved());
    }

    #[tokio::test]
    async fn one_failing_symbol_does_not_stop_the_batch() {
        let store = Arc::new(MemoryStore::new());
        let data = rising_market("XUSDT");
        data.fail_network("BADUSDT", Timeframe::M15);
        let s = Scanner::load(
            config(&["BADUSDT", "XUSDT"]),
            Arc::new(data),
            store.clone(),
            Arc::new(PauseState::new()),
            Arc::new(LogNotifier),
            None,
            now(),
        )
        .await
        .unwrap();

        s.run_cycle(now()).await;
        assert_eq!(store.signals().len(), 1);
        assert_eq!(s.stats().errors, 1);
    }

    #[tokio::test]
    async fn stop_breach_closes_position_on_next_cycle() {
        let store = Arc::new(MemoryStore::new());
        let data = Arc::new(rising_market("XUSDT"));
        let s = scanner(data.clone(), store.clone(), Arc::new(PauseState::new()), Some(RiskLimits::default())).await;
        s.run_cycle(now()).await;
        let stop = store.positions()[0].stop_loss;

        // next bar closes, the forming bar crashes through the stop
        let mut bars = ramp(Timeframe::M15, 61, 100.0, 1.0);
        if let Some(last) = bars.last_mut() {
            last.close = stop - 5.0;
            last.low = stop - 6.0;
        }
        data.set("XUSDT", Timeframe::M15, bars);
        s.run_cycle(now()).await;

        let closed: Vec<_> = store.positions().into_iter().filter(|p| !p.is_open()).collect();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].exit_price, Some(stop));
        assert!(closed[0].pnl_r < -0.9);
        assert!(s.open_symbols().is_empty());
        assert_eq!(s.stats().positions_closed, 1);

        let report = s.portfolio_stats().await.unwrap();
        assert_eq!(report.closed_positions, 1);
    }
}
