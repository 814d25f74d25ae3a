/// risk.rs — Portfolio risk gate
///
/// ─────────────────────────────────────────────────────────────────────────
/// MATHEMATICAL SPECIFICATION
/// ─────────────────────────────────────────────────────────────────────────
///
/// Checks run in order; the first failure rejects the candidate.
///
///   1. ALERT CAP       approved_today ≥ max_alerts_per_day
///   2. COOLDOWN        now − last_signal(symbol) < cooldown_minutes
///                      (any persisted signal counts, approved or not)
///   3. DAILY LOSS      daily_pnl_R ≤ −daily_loss_limit_R
///   4. CORRELATION     ρ̄ ≥ max_correlation
///
/// CORRELATION
///   For the candidate c and every open-position symbol s ≠ c, fetch the
///   last L hourly closes (L = 25 → 24 log returns):
///
/// ```text
///     m      = min(|P_c|, |P_s|)           (0 when m < 3)
///     r_t    = ln(P_t / P_{t−1})          over the aligned last m closes
///     ρ_s    = Pearson(r_c, r_s)
///     ρ̄      = mean_s(ρ_s)
/// ```
///
///   The candidate needs at least 5 closes; symbols with fewer are left
///   out of the average.
///
/// DAY BOUNDARY
///   Counters reset lazily on the first call whose UTC date is later than
///   the last reset date.
/// ─────────────────────────────────────────────────────────────────────────
use ahash::AHashSet;
use chrono::{DateTime, NaiveDate, Utc};
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::data::MarketDataSource;
use crate::error::ScanResult;
use crate::indicators::{log_returns, pearson};
use crate::models::{RiskDecision, RiskStatus, Signal, Timeframe, Violation};
use crate::store::Store;

/// Minimum closes required for the candidate's correlation series.
const MIN_CORRELATION_BARS: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct RiskLimits {
    pub max_alerts_per_day:    u32,
    pub cooldown_minutes:      i64,
    pub daily_loss_limit_r:    f64,
    pub max_correlation:       f64,
    pub correlation_timeframe: Timeframe,
    pub correlation_limit:     usize,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_alerts_per_day:    5,
            cooldown_minutes:      60,
            daily_loss_limit_r:    3.0,
            max_correlation:       0.7,
            correlation_timeframe: Timeframe::H1,
            correlation_limit:     25,
        }
    }
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|d| d.and_utc())
        .unwrap_or(now)
}

/// Pearson correlation of log returns over the aligned tails of two close
/// series. Undefined inputs give 0.
pub fn close_correlation(a: &[f64], b: &[f64]) -> f64 {
    let m = a.len().min(b.len());
    if m < 3 {
        return 0.0;
    }
    match (log_returns(&a[a.len() - m..]), log_returns(&b[b.len() - m..])) {
        (Ok(ra), Ok(rb)) => pearson(&ra, &rb),
        _ => 0.0,
    }
}

#[derive(Debug)]
pub struct PortfolioRiskGate {
    limits:         RiskLimits,
    open_symbols:   AHashSet<String>,
    approved_today: u32,
    daily_pnl_r:    f64,
    last_reset:     NaiveDate,
}

impl PortfolioRiskGate {
    /// Fresh gate with no history.
    pub fn new(limits: RiskLimits, now: DateTime<Utc>) -> Self {
        Self {
            limits,
            open_symbols:   AHashSet::new(),
            approved_today: 0,
            daily_pnl_r:    0.0,
            last_reset:     now.date_naive(),
        }
    }

    /// Build the gate from persisted history.
    pub async fn load(limits: RiskLimits, store: &dyn Store, now: DateTime<Utc>) -> ScanResult<Self> {
        let mut gate = Self::new(limits, now);
        gate.reload(store, now).await?;
        Ok(gate)
    }

    /// Re-derive open symbols, today's approvals and today's realised R.
    pub async fn reload(&mut self, store: &dyn Store, now: DateTime<Utc>) -> ScanResult<()> {
        let midnight = start_of_day(now);
        self.open_symbols = store
            .open_positions()
            .await?
            .into_iter()
            .map(|p| p.symbol)
            .collect();
        self.approved_today = store.approved_signals_since(midnight).await?;
        self.daily_pnl_r = store.realized_pnl_since(midnight).await?;
        self.last_reset = now.date_naive();
        info!(
            open = self.open_symbols.len(),
            approved_today = self.approved_today,
            daily_pnl_r = self.daily_pnl_r,
            "risk gate state loaded"
        );
        Ok(())
    }

    fn roll_day(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today > self.last_reset {
            info!(%today, "day boundary crossed, resetting daily risk counters");
            self.approved_today = 0;
            self.daily_pnl_r = 0.0;
            self.last_reset = today;
        }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    pub fn approved_today(&self) -> u32 {
        self.approved_today
    }

    pub fn daily_pnl_r(&self) -> f64 {
        self.daily_pnl_r
    }

    pub fn open_symbols(&self) -> impl Iterator<Item = &str> {
        self.open_symbols.iter().map(String::as_str)
    }

    /// Give back an approval whose decision was never persisted.
    pub fn release_approval(&mut self) {
        self.approved_today = self.approved_today.saturating_sub(1);
    }

    /// Track a newly opened position.
    pub fn record_open(&mut self, symbol: &str) {
        self.open_symbols.insert(symbol.to_owned());
    }

    /// Track a closed position; its R counts toward today if it closed today.
    pub fn record_close(&mut self, symbol: &str, pnl_r: f64, exit_time: DateTime<Utc>) {
        self.roll_day(exit_time);
        self.open_symbols.remove(symbol);
        if exit_time.date_naive() == self.last_reset {
            self.daily_pnl_r += pnl_r;
        }
    }

    /// Run the four checks. Approval increments today's counter; the caller
    /// persists the decision either way.
    pub async fn evaluate(
        &mut self,
        signal: &Signal,
        store: &dyn Store,
        data: &dyn MarketDataSource,
        now: DateTime<Utc>,
    ) -> ScanResult<RiskDecision> {
        self.roll_day(now);
        let symbol = signal.symbol.as_str();

        if self.approved_today >= self.limits.max_alerts_per_day {
            let reason = format!("Max alerts per day ({}) reached", self.limits.max_alerts_per_day);
            return Ok(self.reject(symbol, reason, Violation::MaxAlertsReached, Vec::new(), 0.0));
        }

        if self.limits.cooldown_minutes > 0 {
            if let Some(last) = store.last_signal_time(symbol).await? {
                let elapsed_min = (now - last).num_seconds() as f64 / 60.0;
                if elapsed_min < self.limits.cooldown_minutes as f64 {
                    let reason = format!(
                        "Symbol {symbol} is in cooldown. Last signal: {}",
                        last.to_rfc3339()
                    );
                    return Ok(self.reject(symbol, reason, Violation::CooldownViolation, Vec::new(), 0.0));
                }
            }
        }

        if self.daily_pnl_r <= -self.limits.daily_loss_limit_r {
            let reason = format!(
                "Daily loss limit ({:.1}R) reached. Current P&L: {:.2}R",
                self.limits.daily_loss_limit_r, self.daily_pnl_r
            );
            return Ok(self.reject(symbol, reason, Violation::DailyLossLimitReached, Vec::new(), 0.0));
        }

        let (correlations, avg) = self.correlations(symbol, data).await;
        if !correlations.is_empty() && avg >= self.limits.max_correlation {
            let reason = format!(
                "Average correlation ({avg:.2}) with active positions exceeds threshold ({})",
                self.limits.max_correlation
            );
            return Ok(self.reject(symbol, reason, Violation::HighCorrelation, correlations, avg));
        }

        self.approved_today += 1;
        info!(
            symbol,
            score = signal.score,
            approved_today = self.approved_today,
            avg_correlation = avg,
            "signal approved"
        );
        Ok(RiskDecision {
            status:          RiskStatus::Approved,
            reason:          "All risk constraints passed".into(),
            violation:       None,
            correlations,
            avg_correlation: avg,
        })
    }

    fn reject(
        &self,
        symbol: &str,
        reason: String,
        violation: Violation,
        correlations: Vec<(String, f64)>,
        avg_correlation: f64,
    ) -> RiskDecision {
        warn!(symbol, violation = violation.as_str(), %reason, "signal rejected");
        RiskDecision {
            status: RiskStatus::Rejected,
            reason,
            violation: Some(violation),
            correlations,
            avg_correlation,
        }
    }

    /// Per-symbol correlations with the open book and their mean. Fetch
    /// failures shrink the set rather than failing the check.
    async fn correlations(&self, symbol: &str, data: &dyn MarketDataSource) -> (Vec<(String, f64)>, f64) {
        let mut others: Vec<&str> = self
            .open_symbols
            .iter()
            .map(String::as_str)
            .filter(|s| *s != symbol)
            .collect();
        if others.is_empty() {
            return (Vec::new(), 0.0);
        }
        others.sort_unstable();

        let tf = self.limits.correlation_timeframe;
        let limit = self.limits.correlation_limit;
        let wanted: Vec<&str> = std::iter::once(symbol).chain(others.iter().copied()).collect();
        let fetched = join_all(wanted.iter().map(|s| data.fetch_candles(s, tf, limit))).await;

        let mut series = Vec::with_capacity(wanted.len());
        for (sym, result) in wanted.iter().zip(fetched) {
            match result {
                Ok(candles) if candles.len() >= MIN_CORRELATION_BARS => {
                    series.push((*sym, candles.iter().map(|c| c.close).collect::<Vec<f64>>()));
                }
                Ok(candles) => debug!(symbol = sym, bars = candles.len(), "too few bars for correlation"),
                Err(e) => warn!(symbol = sym, error = %e, "correlation fetch failed"),
            }
        }

        let candidate = match series.first() {
            Some((s, closes)) if *s == symbol => closes.clone(),
            _ => {
                warn!(symbol, "no price history for candidate, skipping correlation check");
                return (Vec::new(), 0.0);
            }
        };

        let correlations: Vec<(String, f64)> = series[1..]
            .iter()
            .map(|(s, closes)| (s.to_string(), close_correlation(&candidate, closes)))
            .collect();
        if correlations.is_empty() {
            return (Vec::new(), 0.0);
        }
        let avg = correlations.iter().map(|(_, c)| c).sum::<f64>() / correlations.len() as f64;
        (correlations, avg)
    }
}
