/// reporting.rs — Daily summary of signals, warnings and the paper book
///
/// ─────────────────────────────────────────────────────────────────────────
/// MATHEMATICAL SPECIFICATION
/// ─────────────────────────────────────────────────────────────────────────
///
/// WINDOW
///   W(D) = [D 00:00 UTC, D+1 00:00 UTC)
///
/// SIGNALS (all statuses created in W)
///   avg_conf = mean(confidence_i)             (0 when none)
///   top      = first 5 by confidence, descending
///
/// PAPER BOOK (positions with exit_time ∈ W, ordered by exit time)
///   E_k       = Σ_{i ≤ k} pnl_R(i),  E_0 = 0
///   win_rate  = 100 · count(pnl_R > 0) / N          (percent)
///   peak      = max_k E_k
///   MaxDD     = min_k(E_k − max_{j ≤ k} E_j)        (≤ 0)
///
/// UPTIME
///   |[max(start, W.from), min(now, W.to)]| in hours, floored at 0
/// ─────────────────────────────────────────────────────────────────────────
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::ScanResult;
use crate::metrics::{max_drawdown_r, portfolio_stats};
use crate::models::{Direction, Severity};
use crate::notify::Notifier;
use crate::store::Store;

pub const CSV_FILE: &str = "daily_summary.csv";
pub const CSV_HEADER: &str = "date,total_signals,avg_confidence,warnings,pnl_r,win_rate,uptime";

const TOP_SIGNALS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopSignal {
    pub symbol:     String,
    pub direction:  Direction,
    pub score:      f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailySummary {
    pub date:                 NaiveDate,
    pub total_signals:        usize,
    pub signals_by_direction: BTreeMap<String, usize>,
    pub signals_by_regime:    BTreeMap<String, usize>,
    pub avg_confidence:       f64,
    pub warnings_triggered:   usize,
    pub warnings_by_severity: BTreeMap<String, usize>,
    /// Messages of CRITICAL warnings, oldest first
    pub critical_events:      Vec<String>,
    pub positions_closed:     usize,
    pub pnl_r:                f64,
    /// Percent of closed positions with positive R
    pub win_rate:             f64,
    pub max_drawdown_r:       f64,
    pub peak_equity_r:        f64,
    pub uptime_hours:         f64,
    pub universe_size:        usize,
    pub top_signals:          Vec<TopSignal>,
}

impl DailySummary {
    pub fn csv_row(&self) -> String {
        format!(
            "{},{},{:.4},{},{:.4},{:.2},{:.2}",
            self.date,
            self.total_signals,
            self.avg_confidence,
            self.warnings_triggered,
            self.pnl_r,
            self.win_rate,
            self.uptime_hours,
        )
    }

    /// Write `<dir>/<date>.json` and append a row to `<dir>/daily_summary.csv`
    /// (header on first write). Returns the JSON path.
    pub async fn write_report(&self, dir: &Path) -> ScanResult<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;

        let json_path = dir.join(format!("{}.json", self.date));
        tokio::fs::write(&json_path, serde_json::to_vec_pretty(self)?).await?;

        let csv_path = dir.join(CSV_FILE);
        let fresh = !tokio::fs::try_exists(&csv_path).await?;
        let mut csv = OpenOptions::new().create(true).append(true).open(&csv_path).await?;
        if fresh {
            csv.write_all(format!("{CSV_HEADER}\n").as_bytes()).await?;
        }
        csv.write_all(format!("{}\n", self.csv_row()).as_bytes()).await?;
        csv.flush().await?;

        Ok(json_path)
    }
}

fn joined(counts: &BTreeMap<String, usize>) -> String {
    if counts.is_empty() {
        return "-".into();
    }
    counts
        .iter()
        .map(|(k, v)| format!("{k} {v}"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for DailySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "════════════════════════════════════════════")?;
        writeln!(f, "  SIGNAL ENGINE — DAILY SUMMARY {}", self.date)?;
        writeln!(f, "════════════════════════════════════════════")?;
        writeln!(f, "  Signals        : {} (avg conf {:.0}%)", self.total_signals, self.avg_confidence * 100.0)?;
        writeln!(f, "  By Direction   : {}", joined(&self.signals_by_direction))?;
        writeln!(f, "  By Regime      : {}", joined(&self.signals_by_regime))?;
        writeln!(f, "  Warnings       : {} ({})", self.warnings_triggered, joined(&self.warnings_by_severity))?;
        for event in &self.critical_events {
            writeln!(f, "    ! {event}")?;
        }
        writeln!(f, "  Closed Trades  : {}", self.positions_closed)?;
        writeln!(f, "  Win Rate       : {:.2}%", self.win_rate)?;
        writeln!(f, "  Realised P&L   : {:+.2}R", self.pnl_r)?;
        writeln!(f, "  Max Drawdown   : {:.2}R", self.max_drawdown_r)?;
        writeln!(f, "  Peak Equity    : {:.2}R", self.peak_equity_r)?;
        writeln!(f, "  Uptime         : {:.1}h", self.uptime_hours)?;
        writeln!(f, "  Universe       : {} symbols", self.universe_size)?;
        for (rank, s) in self.top_signals.iter().enumerate() {
            writeln!(
                f,
                "  #{} {:<12} {:<5} score {:.1} conf {:.0}%",
                rank + 1,
                s.symbol,
                s.direction,
                s.score,
                s.confidence * 100.0
            )?;
        }
        writeln!(f, "════════════════════════════════════════════")
    }
}

/// UTC bounds of calendar day `date`.
pub fn day_window(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let from = date.and_time(NaiveTime::default()).and_utc();
    (from, from + chrono::Duration::days(1))
}

/// Hours within `date` that the process was up, given its start time.
pub fn uptime_hours(started_at: DateTime<Utc>, now: DateTime<Utc>, date: NaiveDate) -> f64 {
    let (from, to) = day_window(date);
    let span = now.min(to) - started_at.max(from);
    (span.num_seconds().max(0) as f64) / 3600.0
}

/// Build the summary for `date` from persisted state.
pub async fn generate_daily_summary(
    store: &dyn Store,
    date: NaiveDate,
    universe_size: usize,
    uptime_hours: f64,
) -> ScanResult<DailySummary> {
    let (from, to) = day_window(date);
    let signals = store.signals_between(from, to).await?;
    let warnings = store.warnings_between(from, to).await?;
    let closed: Vec<_> = store
        .closed_positions()
        .await?
        .into_iter()
        .filter(|p| p.exit_time.is_some_and(|t| t >= from && t < to))
        .collect();

    let mut signals_by_direction = BTreeMap::new();
    let mut signals_by_regime = BTreeMap::new();
    for s in &signals {
        *signals_by_direction.entry(s.direction.as_str().to_owned()).or_insert(0) += 1;
        *signals_by_regime.entry(s.regime.clone()).or_insert(0) += 1;
    }
    let avg_confidence = if signals.is_empty() {
        0.0
    } else {
        signals.iter().map(|s| s.confidence).sum::<f64>() / signals.len() as f64
    };

    let mut ranked: Vec<_> = signals.iter().collect();
    ranked.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let top_signals = ranked
        .into_iter()
        .take(TOP_SIGNALS)
        .map(|s| TopSignal {
            symbol:     s.symbol.clone(),
            direction:  s.direction,
            score:      s.score,
            confidence: s.confidence,
        })
        .collect();

    let mut warnings_by_severity = BTreeMap::new();
    for w in &warnings {
        *warnings_by_severity.entry(w.severity.as_str().to_owned()).or_insert(0) += 1;
    }
    let critical_events = warnings
        .iter()
        .filter(|w| w.severity == Severity::Critical)
        .map(|w| w.message.clone())
        .collect();

    let book = portfolio_stats(&[], &closed);
    let mut equity = vec![0.0];
    for p in &closed {
        let last = equity.last().copied().unwrap_or(0.0);
        equity.push(last + p.pnl_r);
    }
    let peak_equity_r = equity.iter().copied().fold(0.0, f64::max);

    Ok(DailySummary {
        date,
        total_signals: signals.len(),
        signals_by_direction,
        signals_by_regime,
        avg_confidence,
        warnings_triggered: warnings.len(),
        warnings_by_severity,
        critical_events,
        positions_closed: book.closed_positions,
        pnl_r: book.total_pnl_r,
        win_rate: book.win_rate * 100.0,
        max_drawdown_r: max_drawdown_r(&equity),
        peak_equity_r,
        uptime_hours,
        universe_size,
        top_signals,
    })
}

/// First instant strictly after `now` whose UTC wall clock reads `at`.
pub fn next_run_after(now: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        today
    } else {
        today + chrono::Duration::days(1)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportConfig {
    /// UTC time of day the previous day's summary is produced
    pub report_time: NaiveTime,
    pub directory:   PathBuf,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            report_time: NaiveTime::default(),
            directory:   PathBuf::from("reports"),
        }
    }
}

pub struct DailyReporter {
    store:      Arc<dyn Store>,
    notifier:   Arc<dyn Notifier>,
    config:     ReportConfig,
    started_at: DateTime<Utc>,
}

impl DailyReporter {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        config: ReportConfig,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self { store, notifier, config, started_at }
    }

    /// Generate, deliver and archive the summary for `date`.
    pub async fn report_for(
        &self,
        date: NaiveDate,
        now: DateTime<Utc>,
        universe_size: usize,
    ) -> ScanResult<DailySummary> {
        let uptime = uptime_hours(self.started_at, now, date);
        let summary = generate_daily_summary(self.store.as_ref(), date, universe_size, uptime).await?;
        if !self.notifier.send_report(&summary.to_string()).await {
            warn!(%date, "daily summary was not delivered");
        }
        let path = summary.write_report(&self.config.directory).await?;
        info!(%date, signals = summary.total_signals, pnl_r = summary.pnl_r, path = %path.display(), "daily summary written");
        Ok(summary)
    }

    /// Sleep until each `report_time`, then report the day that just ended.
    pub async fn run<F>(&self, shutdown: CancellationToken, universe_size: F)
    where
        F: Fn() -> usize + Send + Sync,
    {
        info!(at = %self.config.report_time, dir = %self.config.directory.display(), "daily reporter started");
        loop {
            let now = Utc::now();
            let next = next_run_after(now, self.config.report_time);
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("daily reporter shutting down");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }
            let Some(date) = next.date_naive().pred_opt() else {
                continue;
            };
            if let Err(e) = self.report_for(date, Utc::now(), universe_size()).await {
                error!(%date, error = %e, "daily summary failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionTaken, RiskDecision, RiskStatus, Signal, Timeframe, Warning, WarningKind};
    use crate::notify::LogNotifier;
    use crate::paper::{ExitReason, PaperLedger};
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
    }

    fn at(hour: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + chrono::Duration::hours(hour)
    }

    fn signal(symbol: &str, direction: Direction, confidence: f64, created_at: DateTime<Utc>) -> Signal {
        Signal {
            id: Uuid::new_v4(),
            symbol: symbol.into(),
            timeframe: Timeframe::H1,
            direction,
            score: 7.0 + confidence,
            confidence,
            entry_price: 100.0,
            stop_loss: 97.0,
            take_profit: 106.0,
            reasons: vec![],
            regime: "BULLISH_NORMAL_BULLISH".into(),
            candle_ts: 0,
            created_at,
            metadata: serde_json::Value::Null,
        }
    }

    fn decision() -> RiskDecision {
        RiskDecision {
            status: RiskStatus::Approved,
            reason: "All risk checks passed".into(),
            violation: None,
            correlations: vec![],
            avg_correlation: 0.0,
        }
    }

    fn warning(severity: Severity, message: &str, created_at: DateTime<Utc>) -> Warning {
        Warning {
            severity,
            kind: WarningKind::ReferenceShock,
            symbol: Some("BTCUSDT".into()),
            message: message.into(),
            triggered_value: 6.0,
            threshold: 5.0,
            action_taken: ActionTaken::Monitoring,
            created_at,
            metadata: serde_json::Value::Null,
        }
    }

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.push_signal(signal("BTCUSDT", Direction::Long, 0.6, at(1)), decision());
        store.push_signal(signal("ETHUSDT", Direction::Long, 0.9, at(2)), decision());
        store.push_signal(signal("SOLUSDT", Direction::Short, 0.75, at(3)), decision());
        store.push_signal(signal("XRPUSDT", Direction::Short, 0.99, at(-1)), decision());

        store.insert_warning(&warning(Severity::Critical, "BTC fell 6.0% in 1h", at(4))).await.unwrap();
        store.insert_warning(&warning(Severity::Warning, "breadth 62%", at(5))).await.unwrap();
        store.insert_warning(&warning(Severity::Critical, "yesterday", at(-3))).await.unwrap();

        // +2R then −2R closed today, one −2R closed the day before
        let mut ledger = PaperLedger::new(5, 0.0);
        for (symbol, exit, hour) in [("BTCUSDT", 106.0, 6), ("ETHUSDT", 94.0, 7), ("SOLUSDT", 94.0, -2)] {
            ledger.open(&signal(symbol, Direction::Long, 0.7, at(hour - 1)), at(hour - 1)).unwrap();
            let reason = if exit > 100.0 { ExitReason::TakeProfit } else { ExitReason::StopLoss };
            let closed = ledger.close(symbol, exit, reason, at(hour)).unwrap();
            store.save_position(&closed).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn summary_covers_only_the_requested_day() {
        let store = seeded_store().await;
        let summary = generate_daily_summary(store.as_ref(), day(), 42, 12.0).await.unwrap();

        assert_eq!(summary.total_signals, 3);
        assert_eq!(summary.signals_by_direction["LONG"], 2);
        assert_eq!(summary.signals_by_direction["SHORT"], 1);
        assert_eq!(summary.signals_by_regime["BULLISH_NORMAL_BULLISH"], 3);
        assert!((summary.avg_confidence - 0.75).abs() < 1e-9);

        assert_eq!(summary.warnings_triggered, 2);
        assert_eq!(summary.warnings_by_severity["CRITICAL"], 1);
        assert_eq!(summary.critical_events, vec!["BTC fell 6.0% in 1h".to_string()]);

        assert_eq!(summary.positions_closed, 2);
        assert!(summary.pnl_r.abs() < 1e-9);
        assert!((summary.win_rate - 50.0).abs() < 1e-9);
        assert!((summary.peak_equity_r - 2.0).abs() < 1e-9);
        assert!((summary.max_drawdown_r + 2.0).abs() < 1e-9);

        let top: Vec<&str> = summary.top_signals.iter().map(|s| s.symbol.as_str()).collect();
        assert_eq!(top, vec!["ETHUSDT", "SOLUSDT", "BTCUSDT"]);
        assert_eq!(summary.universe_size, 42);
    }

    #[tokio::test]
    async fn empty_day_reports_zeros() {
        let store = MemoryStore::new();
        let summary = generate_daily_summary(&store, day(), 0, 0.0).await.unwrap();
        assert_eq!(summary.total_signals, 0);
        assert_eq!(summary.avg_confidence, 0.0);
        assert_eq!(summary.win_rate, 0.0);
        assert_eq!(summary.max_drawdown_r, 0.0);
        assert!(summary.to_string().contains("DAILY SUMMARY 2024-05-01"));
    }

    #[test]
    fn uptime_is_clipped_to_the_day() {
        assert_eq!(uptime_hours(at(-5), at(30), day()), 24.0);
        assert_eq!(uptime_hours(at(6), at(30), day()), 18.0);
        assert_eq!(uptime_hours(at(6), at(9), day()), 3.0);
        assert_eq!(uptime_hours(at(26), at(30), day()), 0.0);
    }

    #[test]
    fn next_run_rolls_to_tomorrow_once_passed() {
        let eight = NaiveTime::from_hms_opt(8, 0, 0).unwrap();
        assert_eq!(next_run_after(at(6), eight), at(8));
        assert_eq!(next_run_after(at(8), eight), at(32));
        assert_eq!(next_run_after(at(0), NaiveTime::default()), at(24));
    }

    #[tokio::test]
    async fn report_writes_json_and_appends_csv() {
        let dir = std::env::temp_dir().join(format!("signal_engine_reports_{}", Uuid::new_v4()));
        let store = seeded_store().await;
        let reporter = DailyReporter::new(
            store,
            Arc::new(LogNotifier),
            ReportConfig { report_time: NaiveTime::default(), directory: dir.clone() },
            at(-48),
        );

        reporter.report_for(day(), at(24), 10).await.unwrap();
        reporter.report_for(day(), at(24), 10).await.unwrap();

        let json = std::fs::read_to_string(dir.join("2024-05-01.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["total_signals"], 3);
        assert_eq!(parsed["uptime_hours"], 24.0);

        let csv = std::fs::read_to_string(dir.join(CSV_FILE)).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines[1], "2024-05-01,3,0.7500,2,0.0000,50.00,24.00");

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
