/// config.rs — Centralised configuration loaded from .env
///
/// All parameters consumed by the scanner, risk gate, paper ledger and
/// anomaly detector, universe refresh and daily report are defined here. Loading happens once at startup and
/// `validate` rejects inconsistent settings before anything runs.
use anyhow::Result;
use chrono::NaiveTime;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::anomaly::AnomalyThresholds;
use crate::data::RetryPolicy;
use crate::error::{ScanError, ScanResult};
use crate::features::IndicatorParams;
use crate::models::Timeframe;
use crate::paper::DEFAULT_FEE_PCT;
use crate::reporting::ReportConfig;
use crate::risk::RiskLimits;
use crate::scanner::ScannerConfig;
use crate::scoring::{DEFAULT_MAX_SCORE, DEFAULT_MIN_SCORE};
use crate::universe::UniverseConfig;

#[derive(Debug, Clone)]
pub struct AppConfig {
    // ── Market data ──────────────────────────────────────────────────
    pub rest_url:         String,
    pub trading_pairs:    Vec<String>,
    /// Market bellwether for anomaly checks
    pub reference_symbol: String,
    pub entry_timeframe:        Timeframe,
    pub intermediate_timeframe: Timeframe,
    pub macro_timeframe:        Timeframe,
    /// Candles fetched per timeframe (EMA200 needs at least 201)
    pub candle_limit:   usize,
    pub cache_capacity: usize,

    // ── Scoring ──────────────────────────────────────────────────────
    pub min_score: f64,
    pub max_score: f64,

    // ── Portfolio risk gate ──────────────────────────────────────────
    /// When false, candidates skip the gate and are approved directly
    pub risk_gate_enabled:  bool,
    pub max_alerts_per_day: u32,
    pub cooldown_minutes:   i64,
    pub max_correlation:    f64,
    pub daily_loss_limit_r: f64,
    /// Hourly candles fetched per symbol for the correlation check
    pub correlation_limit:  usize,

    // ── Paper ledger ─────────────────────────────────────────────────
    pub max_concurrent_positions: usize,
    pub paper_fee_pct:            f64,

    // ── Scheduling ───────────────────────────────────────────────────
    pub batch_size:            usize,
    pub batch_pause_ms:        u64,
    pub scan_interval_secs:    u64,
    pub anomaly_interval_secs: u64,
    pub network_retry_ms:      u64,
    pub rate_limit_retry_ms:   u64,

    // ── Anomaly thresholds (fractions) ───────────────────────────────
    pub shock_warning:        f64,
    pub shock_critical:       f64,
    pub breadth_warning:      f64,
    pub breadth_critical:     f64,
    pub correlation_warning:  f64,
    pub correlation_critical: f64,

    // ── Indicator periods ────────────────────────────────────────────
    pub rsi_period:    usize,
    pub atr_period:    usize,
    pub adx_period:    usize,
    pub volume_period: usize,
    pub bb_period:     usize,
    pub bb_std:        f64,
    pub macd_fast:     usize,
    pub macd_slow:     usize,
    pub macd_signal:   usize,

    // ── Universe refresh ─────────────────────────────────────────────
    /// 0 keeps TRADING_PAIRS fixed for the whole run
    pub universe_refresh_secs: u64,
    pub min_volume_usd:        f64,
    /// Percent of bid, e.g. 0.05 = 0.05%
    pub max_spread_percent:    f64,
    pub max_min_notional:      f64,
    pub min_price:             f64,
    pub max_price:             Option<f64>,
    pub exclude_patterns:      Vec<String>,
    pub exclude_symbols:       Vec<String>,

    // ── Daily report ─────────────────────────────────────────────────
    pub daily_report_enabled: bool,
    /// UTC time of day, HH:MM
    pub daily_report_time:    NaiveTime,
    pub report_directory:     String,

    // ── Persistence ──────────────────────────────────────────────────
    pub database_path: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        let risk = RiskLimits::default();
        let th = AnomalyThresholds::default();
        let ind = IndicatorParams::default();
        let uni = UniverseConfig::default();
        Self {
            rest_url:               "https://fapi.binance.com".into(),
            trading_pairs:          vec!["BTCUSDT".into(), "ETHUSDT".into()],
            reference_symbol:       "BTCUSDT".into(),
            entry_timeframe:        Timeframe::M15,
            intermediate_timeframe: Timeframe::H1,
            macro_timeframe:        Timeframe::H4,
            candle_limit:           250,
            cache_capacity:         500,

            min_score: DEFAULT_MIN_SCORE,
            max_score: DEFAULT_MAX_SCORE,

            risk_gate_enabled:  true,
            max_alerts_per_day: risk.max_alerts_per_day,
            cooldown_minutes:   risk.cooldown_minutes,
            max_correlation:    risk.max_correlation,
            daily_loss_limit_r: risk.daily_loss_limit_r,
            correlation_limit:  risk.correlation_limit,

            max_concurrent_positions: 5,
            paper_fee_pct:            DEFAULT_FEE_PCT,

            batch_size:            10,
            batch_pause_ms:        1_000,
            scan_interval_secs:    300,
            anomaly_interval_secs: 300,
            network_retry_ms:      1_000,
            rate_limit_retry_ms:   5_000,

            shock_warning:        th.shock_warning,
            shock_critical:       th.shock_critical,
            breadth_warning:      th.breadth_warning,
            breadth_critical:     th.breadth_critical,
            correlation_warning:  th.correlation_warning,
            correlation_critical: th.correlation_critical,

            rsi_period:    ind.rsi_period,
            atr_period:    ind.atr_period,
            adx_period:    ind.adx_period,
            volume_period: ind.volume_period,
            bb_period:     ind.bb_period,
            bb_std:        ind.bb_std,
            macd_fast:     ind.macd_fast,
            macd_slow:     ind.macd_slow,
            macd_signal:   ind.macd_signal,

            universe_refresh_secs: 0,
            min_volume_usd:        uni.min_volume_usd,
            max_spread_percent:    uni.max_spread_percent,
            max_min_notional:      uni.max_min_notional,
            min_price:             uni.min_price,
            max_price:             uni.max_price,
            exclude_patterns:      uni.exclude_patterns,
            exclude_symbols:       uni.exclude_symbols,

            daily_report_enabled: true,
            daily_report_time:    NaiveTime::default(),
            report_directory:     "reports".into(),

            database_path: "signals.db".into(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables (after dotenv).
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // ignore missing .env
        let d = Self::default();

        let trading_pairs = env::var("TRADING_PAIRS")
            .map(|v| split_list(&v, true))
            .unwrap_or(d.trading_pairs);
        let risk_gate_enabled = env::var("RISK_GATE_ENABLED")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(d.risk_gate_enabled);
        let daily_report_enabled = env::var("DAILY_REPORT_ENABLED")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(d.daily_report_enabled);
        let daily_report_time = match env::var("DAILY_REPORT_TIME") {
            Ok(v) => NaiveTime::parse_from_str(v.trim(), "%H:%M")
                .map_err(|e| anyhow::anyhow!("Config key DAILY_REPORT_TIME: {e}"))?,
            Err(_) => d.daily_report_time,
        };
        let max_price = match env::var("MAX_PRICE") {
            Ok(v) if !v.trim().is_empty() => Some(
                v.trim()
                    .parse::<f64>()
                    .map_err(|e| anyhow::anyhow!("Config key MAX_PRICE: {e}"))?,
            ),
            _ => d.max_price,
        };

        Ok(Self {
            rest_url:         env::var("BINANCE_FUTURES_REST_URL").unwrap_or(d.rest_url),
            trading_pairs,
            reference_symbol: env::var("REFERENCE_SYMBOL").unwrap_or(d.reference_symbol),
            entry_timeframe:        parse_env("ENTRY_TIMEFRAME",        d.entry_timeframe)?,
            intermediate_timeframe: parse_env("INTERMEDIATE_TIMEFRAME", d.intermediate_timeframe)?,
            macro_timeframe:        parse_env("MACRO_TIMEFRAME",        d.macro_timeframe)?,
            candle_limit:   parse_env("CANDLE_LIMIT",   d.candle_limit)?,
            cache_capacity: parse_env("CACHE_CAPACITY", d.cache_capacity)?,

            min_score: parse_env("MIN_SCORE", d.min_score)?,
            max_score: parse_env("MAX_SCORE", d.max_score)?,

            risk_gate_enabled,
            max_alerts_per_day: parse_env("MAX_ALERTS_PER_DAY", d.max_alerts_per_day)?,
            cooldown_minutes:   parse_env("COOLDOWN_MINUTES",   d.cooldown_minutes)?,
            max_correlation:    parse_env("MAX_CORRELATION",    d.max_correlation)?,
            daily_loss_limit_r: parse_env("DAILY_LOSS_LIMIT_R", d.daily_loss_limit_r)?,
            correlation_limit:  parse_env("CORRELATION_LIMIT",  d.correlation_limit)?,

            max_concurrent_positions: parse_env("MAX_CONCURRENT_POSITIONS", d.max_concurrent_positions)?,
            paper_fee_pct:            parse_env("PAPER_FEE_PCT",            d.paper_fee_pct)?,

            batch_size:            parse_env("BATCH_SIZE",            d.batch_size)?,
            batch_pause_ms:        parse_env("BATCH_PAUSE_MS",        d.batch_pause_ms)?,
            scan_interval_secs:    parse_env("SCAN_INTERVAL_SECS",    d.scan_interval_secs)?,
            anomaly_interval_secs: parse_env("ANOMALY_INTERVAL_SECS", d.anomaly_interval_secs)?,
            network_retry_ms:      parse_env("NETWORK_RETRY_MS",      d.network_retry_ms)?,
            rate_limit_retry_ms:   parse_env("RATE_LIMIT_RETRY_MS",   d.rate_limit_retry_ms)?,

            shock_warning:        parse_env("SHOCK_WARNING",        d.shock_warning)?,
            shock_critical:       parse_env("SHOCK_CRITICAL",       d.shock_critical)?,
            breadth_warning:      parse_env("BREADTH_WARNING",      d.breadth_warning)?,
            breadth_critical:     parse_env("BREADTH_CRITICAL",     d.breadth_critical)?,
            correlation_warning:  parse_env("CORRELATION_WARNING",  d.correlation_warning)?,
            correlation_critical: parse_env("CORRELATION_CRITICAL", d.correlation_critical)?,

            rsi_period:    parse_env("RSI_PERIOD",    d.rsi_period)?,
            atr_period:    parse_env("ATR_PERIOD",    d.atr_period)?,
            adx_period:    parse_env("ADX_PERIOD",    d.adx_period)?,
            volume_period: parse_env("VOLUME_PERIOD", d.volume_period)?,
            bb_period:     parse_env("BB_PERIOD",     d.bb_period)?,
            bb_std:        parse_env("BB_STD",        d.bb_std)?,
            macd_fast:     parse_env("MACD_FAST",     d.macd_fast)?,
            macd_slow:     parse_env("MACD_SLOW",     d.macd_slow)?,
            macd_signal:   parse_env("MACD_SIGNAL",   d.macd_signal)?,

            universe_refresh_secs: parse_env("UNIVERSE_REFRESH_SECS", d.universe_refresh_secs)?,
            min_volume_usd:        parse_env("MIN_VOLUME_USD",        d.min_volume_usd)?,
            max_spread_percent:    parse_env("MAX_SPREAD_PERCENT",    d.max_spread_percent)?,
            max_min_notional:      parse_env("MAX_MIN_NOTIONAL",      d.max_min_notional)?,
            min_price:             parse_env("MIN_PRICE",             d.min_price)?,
            max_price,
            exclude_patterns: env::var("UNIVERSE_EXCLUDE_PATTERNS")
                .map(|v| split_list(&v, false))
                .unwrap_or(d.exclude_patterns),
            exclude_symbols:  env::var("UNIVERSE_EXCLUDE_SYMBOLS")
                .map(|v| split_list(&v, true))
                .unwrap_or(d.exclude_symbols),

            daily_report_enabled,
            daily_report_time,
            report_directory: env::var("REPORT_DIRECTORY").unwrap_or(d.report_directory),

            database_path: env::var("DATABASE_PATH").unwrap_or(d.database_path),
        })
    }

    /// Reject inconsistent settings. Called once at startup.
    pub fn validate(&self) -> ScanResult<()> {
        let fail = |msg: String| Err(ScanError::Config(msg));

        if self.trading_pairs.is_empty() && self.universe_refresh_secs == 0 {
            return fail("TRADING_PAIRS is empty and universe refresh is disabled".into());
        }
        if !(self.min_volume_usd >= 0.0 && self.max_spread_percent > 0.0 && self.min_price >= 0.0) {
            return fail(format!(
                "universe filter needs MIN_VOLUME_USD >= 0, MAX_SPREAD_PERCENT > 0, MIN_PRICE >= 0 (got {}/{}/{})",
                self.min_volume_usd, self.max_spread_percent, self.min_price
            ));
        }
        if self.max_price.is_some_and(|max| max <= self.min_price) {
            return fail(format!("MAX_PRICE must exceed MIN_PRICE ({})", self.min_price));
        }
        if self.macd_fast == 0 || self.macd_signal == 0 || self.macd_fast >= self.macd_slow {
            return fail(format!(
                "MACD periods must satisfy 0 < fast < slow and signal > 0 (got {}/{}/{})",
                self.macd_fast, self.macd_slow, self.macd_signal
            ));
        }
        for (name, period) in [
            ("RSI_PERIOD", self.rsi_period),
            ("ATR_PERIOD", self.atr_period),
            ("ADX_PERIOD", self.adx_period),
            ("VOLUME_PERIOD", self.volume_period),
            ("BB_PERIOD", self.bb_period),
        ] {
            if period < 2 {
                return fail(format!("{name} must be at least 2 (got {period})"));
            }
        }
        if !(self.bb_std > 0.0) {
            return fail(format!("BB_STD must be positive (got {})", self.bb_std));
        }
        if !(self.min_score >= 0.0 && self.min_score <= self.max_score) {
            return fail(format!(
                "MIN_SCORE ({}) must be within [0, MAX_SCORE ({})]",
                self.min_score, self.max_score
            ));
        }
        if !(self.max_correlation > 0.0 && self.max_correlation <= 1.0) {
            return fail(format!("MAX_CORRELATION must be in (0, 1] (got {})", self.max_correlation));
        }
        if !(self.daily_loss_limit_r > 0.0) {
            return fail(format!("DAILY_LOSS_LIMIT_R must be positive (got {})", self.daily_loss_limit_r));
        }
        if self.cooldown_minutes < 0 {
            return fail(format!("COOLDOWN_MINUTES must not be negative (got {})", self.cooldown_minutes));
        }
        if self.max_concurrent_positions == 0 {
            return fail("MAX_CONCURRENT_POSITIONS must be at least 1".into());
        }
        if !(0.0..0.1).contains(&self.paper_fee_pct) {
            return fail(format!("PAPER_FEE_PCT must be in [0, 0.1) (got {})", self.paper_fee_pct));
        }
        if self.batch_size == 0 {
            return fail("BATCH_SIZE must be at least 1".into());
        }
        if self.scan_interval_secs == 0 || self.anomaly_interval_secs == 0 {
            return fail("scan and anomaly intervals must be positive".into());
        }
        if self.candle_limit < 3 {
            return fail(format!("CANDLE_LIMIT must be at least 3 (got {})", self.candle_limit));
        }
        for (name, warning, critical) in [
            ("SHOCK", self.shock_warning, self.shock_critical),
            ("BREADTH", self.breadth_warning, self.breadth_critical),
            ("CORRELATION", self.correlation_warning, self.correlation_critical),
        ] {
            if !(warning > 0.0 && warning < critical) {
                return fail(format!(
                    "{name}_WARNING ({warning}) must be positive and below {name}_CRITICAL ({critical})"
                ));
            }
        }
        Ok(())
    }

    pub fn indicator_params(&self) -> IndicatorParams {
        IndicatorParams {
            rsi_period:    self.rsi_period,
            atr_period:    self.atr_period,
            adx_period:    self.adx_period,
            volume_period: self.volume_period,
            bb_period:     self.bb_period,
            bb_std:        self.bb_std,
            macd_fast:     self.macd_fast,
            macd_slow:     self.macd_slow,
            macd_signal:   self.macd_signal,
        }
    }

    pub fn risk_limits(&self) -> RiskLimits {
        RiskLimits {
            max_alerts_per_day:    self.max_alerts_per_day,
            cooldown_minutes:      self.cooldown_minutes,
            daily_loss_limit_r:    self.daily_loss_limit_r,
            max_correlation:       self.max_correlation,
            correlation_timeframe: Timeframe::H1,
            correlation_limit:     self.correlation_limit,
        }
    }

    pub fn anomaly_thresholds(&self) -> AnomalyThresholds {
        AnomalyThresholds {
            shock_warning:        self.shock_warning,
            shock_critical:       self.shock_critical,
            breadth_warning:      self.breadth_warning,
            breadth_critical:     self.breadth_critical,
            correlation_warning:  self.correlation_warning,
            correlation_critical: self.correlation_critical,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            network_delay:    Duration::from_millis(self.network_retry_ms),
            rate_limit_delay: Duration::from_millis(self.rate_limit_retry_ms),
        }
    }

    pub fn universe_config(&self) -> UniverseConfig {
        UniverseConfig {
            min_volume_usd:     self.min_volume_usd,
            max_spread_percent: self.max_spread_percent,
            exclude_patterns:   self.exclude_patterns.clone(),
            exclude_symbols:    self.exclude_symbols.clone(),
            max_min_notional:   self.max_min_notional,
            min_price:          self.min_price,
            max_price:          self.max_price,
        }
    }

    pub fn report_config(&self) -> ReportConfig {
        ReportConfig {
            report_time: self.daily_report_time,
            directory:   PathBuf::from(&self.report_directory),
        }
    }

    pub fn scanner_config(&self) -> ScannerConfig {
        ScannerConfig {
            universe:                 self.trading_pairs.clone(),
            entry_timeframe:          self.entry_timeframe,
            intermediate_timeframe:   self.intermediate_timeframe,
            macro_timeframe:          self.macro_timeframe,
            candle_limit:             self.candle_limit,
            cache_capacity:           self.cache_capacity,
            min_score:                self.min_score,
            max_score:                self.max_score,
            max_concurrent_positions: self.max_concurrent_positions,
            fee_pct:                  self.paper_fee_pct,
            batch_size:               self.batch_size,
            batch_pause:              Duration::from_millis(self.batch_pause_ms),
            scan_interval:            Duration::from_secs(self.scan_interval_secs),
            indicators:               self.indicator_params(),
            retry:                    self.retry_policy(),
        }
    }
}

/// Comma-separated list, blanks dropped.
fn split_list(raw: &str, uppercase: bool) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| if uppercase { s.to_uppercase() } else { s.to_owned() })
        .collect()
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr + Copy,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(v) => v
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Config key {key}: {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = AppConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.risk_limits(), RiskLimits::default());
        assert_eq!(cfg.indicator_params(), IndicatorParams::default());
        assert_eq!(cfg.retry_policy(), RetryPolicy::default());
        assert_eq!(cfg.scanner_config().batch_size, 10);
        assert_eq!(cfg.universe_config(), UniverseConfig::default());
        assert_eq!(cfg.report_config(), ReportConfig::default());
    }

    #[test]
    fn empty_pairs_need_universe_refresh() {
        let cfg = AppConfig { trading_pairs: vec![], ..AppConfig::default() };
        assert!(cfg.validate().unwrap_err().to_string().contains("TRADING_PAIRS"));

        let cfg = AppConfig { trading_pairs: vec![], universe_refresh_secs: 3_600, ..AppConfig::default() };
        cfg.validate().unwrap();

        let cfg = AppConfig { max_price: Some(0.00001), ..AppConfig::default() };
        assert!(cfg.validate().unwrap_err().to_string().contains("MAX_PRICE"));
    }

    #[test]
    fn lists_are_trimmed_and_case_folded() {
        assert_eq!(split_list(" btcusdt, ,ethUSDT ", true), vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(split_list("3L$, BULL", false), vec!["3L$", "BULL"]);
    }

    #[test]
    fn macd_fast_must_be_below_slow() {
        let cfg = AppConfig { macd_fast: 26, macd_slow: 26, ..AppConfig::default() };
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, ScanError::Config(_)));
        assert!(err.to_string().contains("MACD"));
    }

    #[test]
    fn inverted_thresholds_fail_fast() {
        let cfg = AppConfig { shock_warning: 0.09, ..AppConfig::default() };
        assert!(cfg.validate().unwrap_err().to_string().contains("SHOCK_WARNING"));

        let cfg = AppConfig { min_score: 11.0, ..AppConfig::default() };
        assert!(cfg.validate().is_err());

        let cfg = AppConfig { max_correlation: 1.5, ..AppConfig::default() };
        assert!(cfg.validate().is_err());

        let cfg = AppConfig { batch_size: 0, ..AppConfig::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parse_env_falls_back_to_default() {
        assert_eq!(parse_env("SIGNAL_ENGINE_TEST_UNSET_KEY", 42usize).unwrap(), 42);
    }
}
