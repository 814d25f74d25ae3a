/// main.rs — Signal Scanner Entry Point
///
/// Runs the scanner and the anomaly detector side by side:
///   1. Load config from .env
///   2. Open the SQLite store and restore watermarks, positions, risk state
///   3. Filter the exchange listing into the universe (or use TRADING_PAIRS)
///   4. Scan the universe every interval; watch the market for anomalies;
///      refresh the universe and write the daily summary on schedule
///   5. On Ctrl-C, let in-flight cycles finish and print the paper report
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use signal_engine::anomaly::AnomalyDetector;
use signal_engine::config::AppConfig;
use signal_engine::data::{BinanceDataClient, MarketDataSource};
use signal_engine::notify::{LogNotifier, Notifier};
use signal_engine::pause::PauseState;
use signal_engine::reporting::DailyReporter;
use signal_engine::scanner::Scanner;
use signal_engine::store::{SqliteStore, Store};
use signal_engine::universe::{RefreshPolicy, UniverseFilter, UniverseManager, UniverseRefresh};

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ──────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════╗");
    info!("║      SIGNAL ENGINE  —  SCANNER MODE         ║");
    info!("║  Regime + Score + MTF Confluence + Risk     ║");
    info!("╚══════════════════════════════════════════════╝");

    // ── Config ───────────────────────────────────────────────────────────
    let cfg = AppConfig::from_env()?;
    cfg.validate()?;
    info!(
        "Pairs: {} configured  refresh={}s  reference={}  entry={} mtf={}/{}",
        cfg.trading_pairs.len(),
        cfg.universe_refresh_secs,
        cfg.reference_symbol,
        cfg.entry_timeframe,
        cfg.intermediate_timeframe,
        cfg.macro_timeframe
    );
    info!(
        "Risk:  gate={} alerts/day={} cooldown={}m max_corr={:.2} daily_loss={:.1}R",
        cfg.risk_gate_enabled,
        cfg.max_alerts_per_day,
        cfg.cooldown_minutes,
        cfg.max_correlation,
        cfg.daily_loss_limit_r
    );

    // ── Wiring ───────────────────────────────────────────────────────────
    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open(&cfg.database_path)
            .await
            .with_context(|| format!("opening database {}", cfg.database_path))?,
    );
    let binance = Arc::new(BinanceDataClient::new(&cfg.rest_url)?);
    let data: Arc<dyn MarketDataSource> = binance.clone();
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    let pause = Arc::new(PauseState::new());

    // ── Universe ─────────────────────────────────────────────────────────
    let universe = Arc::new(UniverseManager::new(
        binance,
        UniverseFilter::new(cfg.universe_config())?,
        RefreshPolicy::default(),
        cfg.trading_pairs.clone(),
    ));
    if cfg.universe_refresh_secs > 0 {
        match universe.refresh(Utc::now()).await {
            Ok(refresh) => info!("Universe: {} symbols ({})", refresh.symbols.len(), refresh.stats),
            Err(e) if !cfg.trading_pairs.is_empty() => {
                warn!("Initial universe refresh failed, using TRADING_PAIRS: {e}")
            }
            Err(e) => return Err(e).context("initial universe refresh failed and TRADING_PAIRS is empty"),
        }
    }
    let mut scanner_config = cfg.scanner_config();
    scanner_config.universe = universe.symbols();

    let risk_limits = cfg.risk_gate_enabled.then(|| cfg.risk_limits());
    let scanner = Arc::new(
        Scanner::load(
            scanner_config,
            data.clone(),
            store.clone(),
            pause.clone(),
            notifier.clone(),
            risk_limits,
            Utc::now(),
        )
        .await?,
    );
    let detector = Arc::new(AnomalyDetector::new(
        data,
        store.clone(),
        pause,
        notifier.clone(),
        cfg.reference_symbol.clone(),
        universe.symbols(),
        cfg.anomaly_thresholds(),
        cfg.batch_size,
        cfg.retry_policy(),
    ));

    // ── Run until Ctrl-C ─────────────────────────────────────────────────
    let shutdown = CancellationToken::new();

    let scan_task = tokio::spawn({
        let scanner = scanner.clone();
        let shutdown = shutdown.clone();
        async move { scanner.run(shutdown).await }
    });
    let anomaly_task = tokio::spawn({
        let detector = detector.clone();
        let shutdown = shutdown.clone();
        let interval = Duration::from_secs(cfg.anomaly_interval_secs);
        async move { detector.run(interval, shutdown).await }
    });
    let mut tasks = vec![("scanner", scan_task), ("anomaly detector", anomaly_task)];

    if cfg.universe_refresh_secs > 0 {
        let universe = universe.clone();
        let shutdown = shutdown.clone();
        let interval = Duration::from_secs(cfg.universe_refresh_secs);
        let (scanner, detector) = (scanner.clone(), detector.clone());
        let on_change = move |refresh: &UniverseRefresh| {
            scanner.set_universe(refresh.symbols.clone());
            detector.set_universe(refresh.symbols.clone());
        };
        tasks.push((
            "universe refresh",
            tokio::spawn(async move { universe.run(interval, shutdown, on_change).await }),
        ));
    }
    if cfg.daily_report_enabled {
        let reporter = DailyReporter::new(store, notifier, cfg.report_config(), Utc::now());
        let shutdown = shutdown.clone();
        let scanner = scanner.clone();
        tasks.push((
            "daily reporter",
            tokio::spawn(async move { reporter.run(shutdown, move || scanner.universe().len()).await }),
        ));
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Shutdown requested, waiting for in-flight cycles...");
    shutdown.cancel();

    for (name, task) in tasks {
        if let Err(e) = task.await {
            error!("{name} task failed: {e}");
        }
    }

    // ── Report ───────────────────────────────────────────────────────────
    let stats = scanner.stats();
    info!(
        "Scanner: cycles={} approved={} rejected={} errors={} api_calls={}",
        stats.cycles, stats.signals_approved, stats.signals_rejected, stats.errors, stats.api_calls
    );
    let detector_stats = detector.stats();
    info!(
        "Detector: checks={} warnings={} errors={}",
        detector_stats.checks_run, detector_stats.warnings_generated, detector_stats.errors
    );
    match scanner.portfolio_stats().await {
        Ok(report) => println!("{report}"),
        Err(e) => error!("portfolio report unavailable: {e}"),
    }
    Ok(())
}
