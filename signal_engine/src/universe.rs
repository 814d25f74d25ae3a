/// universe.rs — Tradable universe filter and periodic refresh
///
/// MATHEMATICAL SPECIFICATION
/// ──────────────────────────
/// A listed market m passes when every rule holds, checked in order
/// (the first failing rule names the exclusion reason):
///
///   volume    qv_24h(m) ≥ V_min
///   spread    (ask − bid) / bid · 100 ≤ S_max        (S_max in percent)
///   exclude   m ∉ E  ∧  ∀ p ∈ P : ¬ p.matches(m)
///   notional  min_notional(m) ≤ N_max
///   price     P_min ≤ last(m) ≤ P_max               (P_max optional)
///
/// A rule whose input is missing from the listing passes.
///
/// Universe hash:  H(U) = hex( SHA-256( join(sort(U), ",") ) )
/// Diff:           added = U' \ U,  removed = U \ U'   (both sorted)
///
/// A refresh retries the listing with doubling backoff. When every attempt
/// fails, or the filter accepts nothing, the previous universe stays live.
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ScanError, ScanResult};

// ── Listing ───────────────────────────────────────────────────────────────

/// One listed perpetual with the fields the filter reads.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MarketInfo {
    pub symbol:       String,
    /// 24h quote volume in USDT
    pub quote_volume: Option<f64>,
    pub last_price:   Option<f64>,
    pub bid:          Option<f64>,
    pub ask:          Option<f64>,
    /// Exchange minimum order notional in USDT
    pub min_notional: Option<f64>,
}

#[async_trait]
pub trait MarketListSource: Send + Sync {
    async fn fetch_markets(&self) -> ScanResult<Vec<MarketInfo>>;
}

// ── Filter ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct UniverseConfig {
    pub min_volume_usd:     f64,
    pub max_spread_percent: f64,
    pub exclude_patterns:   Vec<String>,
    pub exclude_symbols:    Vec<String>,
    pub max_min_notional:   f64,
    pub min_price:          f64,
    pub max_price:          Option<f64>,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        Self {
            min_volume_usd:     1_000_000.0,
            max_spread_percent: 0.05,
            exclude_patterns:   ["BUSD", "UPUSDT", "DOWNUSDT", "BEAR", "BULL", "3L$", "3S$", "5L$", "5S$"]
                .into_iter()
                .map(String::from)
                .collect(),
            exclude_symbols:    vec!["USDTUSDT".into()],
            max_min_notional:   100.0,
            min_price:          0.0001,
            max_price:          None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusionReason {
    LowVolume,
    WideSpread,
    Excluded,
    MinNotional,
    PriceRange,
}

impl ExclusionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExclusionReason::LowVolume => "low_volume",
            ExclusionReason::WideSpread => "wide_spread",
            ExclusionReason::Excluded => "excluded",
            ExclusionReason::MinNotional => "min_notional",
            ExclusionReason::PriceRange => "price_range",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExclusionStats {
    pub listed:       usize,
    pub accepted:     usize,
    pub low_volume:   usize,
    pub wide_spread:  usize,
    pub excluded:     usize,
    pub min_notional: usize,
    pub price_range:  usize,
}

impl ExclusionStats {
    fn count(&mut self, reason: ExclusionReason) {
        match reason {
            ExclusionReason::LowVolume => self.low_volume += 1,
            ExclusionReason::WideSpread => self.wide_spread += 1,
            ExclusionReason::Excluded => self.excluded += 1,
            ExclusionReason::MinNotional => self.min_notional += 1,
            ExclusionReason::PriceRange => self.price_range += 1,
        }
    }
}

impl fmt::Display for ExclusionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} accepted (volume {}, spread {}, excluded {}, notional {}, price {})",
            self.accepted,
            self.listed,
            self.low_volume,
            self.wide_spread,
            self.excluded,
            self.min_notional,
            self.price_range,
        )
    }
}

#[derive(Debug, Clone)]
pub struct UniverseFilter {
    config:   UniverseConfig,
    patterns: Vec<Regex>,
}

impl UniverseFilter {
    pub fn new(config: UniverseConfig) -> ScanResult<Self> {
        let patterns = config
            .exclude_patterns
            .iter()
            .map(|p| {
                Regex::new(p)
                    .map_err(|e| ScanError::Config(format!("invalid exclude pattern '{p}': {e}")))
            })
            .collect::<ScanResult<Vec<_>>>()?;
        Ok(Self { config, patterns })
    }

    pub fn config(&self) -> &UniverseConfig {
        &self.config
    }

    /// First rule `market` fails, or `None` when it is tradable.
    pub fn check(&self, market: &MarketInfo) -> Option<ExclusionReason> {
        let c = &self.config;

        if market.quote_volume.is_some_and(|v| v < c.min_volume_usd) {
            return Some(ExclusionReason::LowVolume);
        }
        if let (Some(bid), Some(ask)) = (market.bid, market.ask) {
            if bid > 0.0 && (ask - bid) / bid * 100.0 > c.max_spread_percent {
                return Some(ExclusionReason::WideSpread);
            }
        }
        if c.exclude_symbols.iter().any(|s| s == &market.symbol)
            || self.patterns.iter().any(|p| p.is_match(&market.symbol))
        {
            return Some(ExclusionReason::Excluded);
        }
        if market.min_notional.is_some_and(|n| n > c.max_min_notional) {
            return Some(ExclusionReason::MinNotional);
        }
        if let Some(price) = market.last_price {
            if price < c.min_price || c.max_price.is_some_and(|max| price > max) {
                return Some(ExclusionReason::PriceRange);
            }
        }
        None
    }

    /// Accepted symbols (sorted) and per-reason exclusion counts.
    pub fn filter(&self, markets: &[MarketInfo]) -> (Vec<String>, ExclusionStats) {
        let mut stats = ExclusionStats { listed: markets.len(), ..Default::default() };
        let mut accepted = Vec::new();
        for market in markets {
            match self.check(market) {
                Some(reason) => {
                    debug!(symbol = %market.symbol, reason = reason.as_str(), "market excluded");
                    stats.count(reason);
                }
                None => accepted.push(market.symbol.clone()),
            }
        }
        accepted.sort();
        accepted.dedup();
        stats.accepted = accepted.len();
        (accepted, stats)
    }
}

// ── Diff + hash ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UniverseDiff {
    pub added:   Vec<String>,
    pub removed: Vec<String>,
}

impl UniverseDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub fn compare_universes(previous: &[String], next: &[String]) -> UniverseDiff {
    let old: BTreeSet<&String> = previous.iter().collect();
    let new: BTreeSet<&String> = next.iter().collect();
    UniverseDiff {
        added:   new.difference(&old).map(|s| (*s).clone()).collect(),
        removed: old.difference(&new).map(|s| (*s).clone()).collect(),
    }
}

/// Order-independent fingerprint of a symbol set.
pub fn universe_hash(symbols: &[String]) -> String {
    let mut sorted: Vec<&str> = symbols.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    hex::encode(Sha256::digest(sorted.join(",").as_bytes()))
}

// ── Refresh ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefreshPolicy {
    pub attempts: u32,
    /// Delay before the second attempt; doubles after each failure
    pub backoff:  Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff:  Duration::from_secs(5),
        }
    }
}

/// Outcome of one successful refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct UniverseRefresh {
    pub symbols:      Vec<String>,
    pub hash:         String,
    pub diff:         UniverseDiff,
    pub stats:        ExclusionStats,
    pub refreshed_at: DateTime<Utc>,
}

impl UniverseRefresh {
    pub fn changed(&self) -> bool {
        !self.diff.is_empty()
    }
}

#[derive(Debug)]
struct UniverseState {
    symbols:      Vec<String>,
    hash:         String,
    refreshed_at: Option<DateTime<Utc>>,
}

/// Holds the live universe and replaces it from the exchange listing.
pub struct UniverseManager {
    source: Arc<dyn MarketListSource>,
    filter: UniverseFilter,
    policy: RefreshPolicy,
    state:  Mutex<UniverseState>,
}

impl UniverseManager {
    /// `initial` is served until the first successful refresh.
    pub fn new(
        source: Arc<dyn MarketListSource>,
        filter: UniverseFilter,
        policy: RefreshPolicy,
        initial: Vec<String>,
    ) -> Self {
        let hash = universe_hash(&initial);
        Self {
            source,
            filter,
            policy,
            state: Mutex::new(UniverseState { symbols: initial, hash, refreshed_at: None }),
        }
    }

    fn state(&self) -> MutexGuard<'_, UniverseState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn symbols(&self) -> Vec<String> {
        self.state().symbols.clone()
    }

    pub fn hash(&self) -> String {
        self.state().hash.clone()
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.state().refreshed_at
    }

    async fn fetch_with_backoff(&self) -> ScanResult<Vec<MarketInfo>> {
        let attempts = self.policy.attempts.max(1);
        let mut delay = self.policy.backoff;
        let mut attempt = 1;
        loop {
            match self.source.fetch_markets().await {
                Ok(markets) => return Ok(markets),
                Err(e) if attempt < attempts => {
                    warn!(attempt, attempts, error = %e, delay_ms = delay.as_millis() as u64, "market listing failed, retrying");
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fetch, filter and swap in a new universe. On error the previous
    /// universe is untouched.
    pub async fn refresh(&self, now: DateTime<Utc>) -> ScanResult<UniverseRefresh> {
        let markets = self.fetch_with_backoff().await?;
        let (symbols, stats) = self.filter.filter(&markets);
        if symbols.is_empty() {
            return Err(ScanError::Data(format!("universe filter accepted none of {} markets", stats.listed)));
        }

        let hash = universe_hash(&symbols);
        let mut state = self.state();
        let diff = compare_universes(&state.symbols, &symbols);
        state.symbols = symbols.clone();
        state.hash = hash.clone();
        state.refreshed_at = Some(now);
        drop(state);

        info!(
            size = symbols.len(),
            added = diff.added.len(),
            removed = diff.removed.len(),
            hash = %&hash[..12],
            "universe refreshed: {stats}"
        );
        if !diff.is_empty() {
            info!(added = ?diff.added, removed = ?diff.removed, "universe changed");
        }
        Ok(UniverseRefresh { symbols, hash, diff, stats, refreshed_at: now })
    }

    /// Refresh every `interval` (first tick after one interval) until
    /// cancelled. `on_change` sees only refreshes that changed the set.
    pub async fn run<F>(&self, interval: Duration, shutdown: CancellationToken, on_change: F)
    where
        F: Fn(&UniverseRefresh) + Send + Sync,
    {
        let mut ticker = interval_at(Instant::now() + interval, interval);
        info!(interval_secs = interval.as_secs(), size = self.symbols().len(), "universe refresh started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("universe refresh shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    match self.refresh(Utc::now()).await {
                        Ok(refresh) if refresh.changed() => on_change(&refresh),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "universe refresh failed, keeping previous universe"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn market(symbol: &str, volume: f64, bid: f64, ask: f64, notional: f64, price: f64) -> MarketInfo {
        MarketInfo {
            symbol:       symbol.into(),
            quote_volume: Some(volume),
            last_price:   Some(price),
            bid:          Some(bid),
            ask:          Some(ask),
            min_notional: Some(notional),
        }
    }

    fn liquid(symbol: &str) -> MarketInfo {
        market(symbol, 5e8, 100.0, 100.01, 5.0, 100.0)
    }

    struct ScriptedMarkets {
        responses: Mutex<VecDeque<ScanResult<Vec<MarketInfo>>>>,
        calls:     AtomicUsize,
    }

    impl ScriptedMarkets {
        fn new(responses: Vec<ScanResult<Vec<MarketInfo>>>) -> Arc<Self> {
            Arc::new(Self { responses: Mutex::new(responses.into()), calls: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl MarketListSource for ScriptedMarkets {
        async fn fetch_markets(&self) -> ScanResult<Vec<MarketInfo>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ScanError::Network("script exhausted".into())))
        }
    }

    fn no_wait() -> RefreshPolicy {
        RefreshPolicy { attempts: 3, backoff: Duration::ZERO }
    }

    #[test]
    fn each_rule_excludes_and_is_counted() {
        let filter = UniverseFilter::new(UniverseConfig::default()).unwrap();
        let markets = vec![
            liquid("BTCUSDT"),
            market("THINUSDT", 2e5, 1.0, 1.0001, 5.0, 1.0),
            market("WIDEUSDT", 5e8, 100.0, 100.1, 5.0, 100.0),
            liquid("BTCDOWNUSDT"),
            liquid("USDTUSDT"),
            market("PRICEYUSDT", 5e8, 100.0, 100.01, 500.0, 100.0),
            market("DUSTUSDT", 5e8, 0.00005, 0.00005, 5.0, 0.00005),
            MarketInfo { symbol: "NEWUSDT".into(), ..Default::default() },
        ];

        let (accepted, stats) = filter.filter(&markets);
        assert_eq!(accepted, vec!["BTCUSDT".to_string(), "NEWUSDT".to_string()]);
        assert_eq!(
            stats,
            ExclusionStats {
                listed:       8,
                accepted:     2,
                low_volume:   1,
                wide_spread:  1,
                excluded:     2,
                min_notional: 1,
                price_range:  1,
            }
        );
        assert_eq!(filter.check(&markets[2]), Some(ExclusionReason::WideSpread));
    }

    #[test]
    fn anchored_patterns_only_match_suffix() {
        let filter = UniverseFilter::new(UniverseConfig::default()).unwrap();
        assert_eq!(filter.check(&liquid("ETH3L")), Some(ExclusionReason::Excluded));
        assert_eq!(filter.check(&liquid("3LUSDT")), None);
        assert_eq!(filter.check(&liquid("BUSDUSDT")), Some(ExclusionReason::Excluded));
    }

    #[test]
    fn invalid_pattern_is_a_config_error() {
        let config = UniverseConfig { exclude_patterns: vec!["(".into()], ..Default::default() };
        assert!(matches!(UniverseFilter::new(config), Err(ScanError::Config(_))));
    }

    #[test]
    fn diff_and_hash_ignore_order() {
        let old: Vec<String> = vec!["ETHUSDT".into(), "BTCUSDT".into(), "XRPUSDT".into()];
        let new: Vec<String> = vec!["SOLUSDT".into(), "BTCUSDT".into(), "ETHUSDT".into()];
        let diff = compare_universes(&old, &new);
        assert_eq!(diff.added, vec!["SOLUSDT".to_string()]);
        assert_eq!(diff.removed, vec!["XRPUSDT".to_string()]);

        let shuffled: Vec<String> = vec!["BTCUSDT".into(), "XRPUSDT".into(), "ETHUSDT".into()];
        assert_eq!(universe_hash(&old), universe_hash(&shuffled));
        assert_ne!(universe_hash(&old), universe_hash(&new));
        assert_eq!(universe_hash(&old).len(), 64);
    }

    #[tokio::test]
    async fn refresh_retries_then_swaps_universe() {
        let source = ScriptedMarkets::new(vec![
            Err(ScanError::Network("timeout".into())),
            Ok(vec![liquid("BTCUSDT"), liquid("SOLUSDT")]),
        ]);
        let manager = UniverseManager::new(
            source.clone(),
            UniverseFilter::new(UniverseConfig::default()).unwrap(),
            no_wait(),
            vec!["BTCUSDT".into(), "ETHUSDT".into()],
        );

        let refresh = manager.refresh(Utc::now()).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert!(refresh.changed());
        assert_eq!(refresh.diff.added, vec!["SOLUSDT".to_string()]);
        assert_eq!(refresh.diff.removed, vec!["ETHUSDT".to_string()]);
        assert_eq!(manager.symbols(), vec!["BTCUSDT".to_string(), "SOLUSDT".to_string()]);
        assert_eq!(manager.hash(), refresh.hash);
        assert!(manager.refreshed_at().is_some());
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_universe() {
        let source = ScriptedMarkets::new(vec![
            Err(ScanError::Network("down".into())),
            Err(ScanError::RateLimited("429".into())),
            Err(ScanError::Network("down".into())),
            Ok(vec![liquid("BTCDOWNUSDT")]),
        ]);
        let initial: Vec<String> = vec!["BTCUSDT".into()];
        let manager = UniverseManager::new(
            source.clone(),
            UniverseFilter::new(UniverseConfig::default()).unwrap(),
            no_wait(),
            initial.clone(),
        );

        assert!(manager.refresh(Utc::now()).await.is_err());
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert_eq!(manager.symbols(), initial);

        // a listing the filter rejects entirely is also kept out
        assert!(matches!(manager.refresh(Utc::now()).await, Err(ScanError::Data(_))));
        assert_eq!(manager.symbols(), initial);
        assert_eq!(manager.hash(), universe_hash(&initial));
        assert!(manager.refreshed_at().is_none());
    }
}
