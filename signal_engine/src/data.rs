/// data.rs — Market data contract and the Binance USDT-M REST client
///
/// `fetch_candles` returns a window oldest-first whose last element is the
/// candle that is still forming. Transport failures surface as
/// `ScanError::Network`, HTTP 429/418 as `ScanError::RateLimited`.
///
/// The same client lists tradable perpetuals (exchange info joined with
/// 24h tickers and the book ticker) for universe refreshes.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use ahash::AHashMap;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ScanError, ScanResult};
use crate::models::{Candle, Timeframe};
use crate::universe::{MarketInfo, MarketListSource};

/// Longest slice of an error body carried into an error message.
const ERROR_SNIPPET_CHARS: usize = 200;

#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> ScanResult<Vec<Candle>>;
}

// ── Binance REST ──────────────────────────────────────────────────────────

pub struct BinanceDataClient {
    client:   Client,
    base_url: String,
}

impl BinanceDataClient {
    pub fn new(base_url: &str) -> ScanResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }
}

#[async_trait]
impl MarketDataSource for BinanceDataClient {
    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> ScanResult<Vec<Candle>> {
        let limit = limit.clamp(1, 1500).to_string();
        let label = format!("{symbol} {timeframe}");
        let text = self
            .get(
                "/fapi/v1/klines",
                &[("symbol", symbol), ("interval", timeframe.as_str()), ("limit", &limit)],
                &label,
            )
            .await?;
        let candles = parse_klines(&text)?;
        debug!(symbol, timeframe = %timeframe, bars = candles.len(), "klines fetched");
        Ok(candles)
    }
}

#[async_trait]
impl MarketListSource for BinanceDataClient {
    async fn fetch_markets(&self) -> ScanResult<Vec<MarketInfo>> {
        let (info, tickers, book) = tokio::try_join!(
            self.get("/fapi/v1/exchangeInfo", &[], "exchangeInfo"),
            self.get("/fapi/v1/ticker/24hr", &[], "ticker/24hr"),
            self.get("/fapi/v1/ticker/bookTicker", &[], "bookTicker"),
        )?;
        let markets = parse_markets(&info, &tickers, &book)?;
        debug!(markets = markets.len(), "markets listed");
        Ok(markets)
    }
}

impl BinanceDataClient {
    /// GET `path` and return the body, mapping HTTP failures onto the
    /// error taxonomy. `label` prefixes error messages.
    async fn get(&self, path: &str, query: &[(&str, &str)], label: &str) -> ScanResult<String> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| ScanError::Network(format!("{label}: {e}")))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
            return Err(ScanError::RateLimited(format!("{label}: HTTP {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet = error_snippet(&body);
            return Err(if status.is_server_error() {
                ScanError::Network(format!("{label}: HTTP {status}: {snippet}"))
            } else {
                ScanError::Data(format!("{label}: HTTP {status}: {snippet}"))
            });
        }

        response
            .text()
            .await
            .map_err(|e| ScanError::Network(format!("{label}: {e}")))
    }
}

/// First characters of a response body, cut on a character boundary.
fn error_snippet(body: &str) -> String {
    body.chars().take(ERROR_SNIPPET_CHARS).collect()
}

fn field_f64(row: &[Value], idx: usize) -> ScanResult<f64> {
    let v = row
        .get(idx)
        .ok_or_else(|| ScanError::Data(format!("kline row missing column {idx}")))?;
    match v {
        Value::String(s) => s
            .parse::<f64>()
            .map_err(|e| ScanError::Data(format!("kline column {idx} '{s}': {e}"))),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| ScanError::Data(format!("kline column {idx} not a float"))),
        other => Err(ScanError::Data(format!("kline column {idx} unexpected {other}"))),
    }
}

/// Parse a Binance kline array response into candles, oldest-first.
pub fn parse_klines(body: &str) -> ScanResult<Vec<Candle>> {
    let rows: Vec<Vec<Value>> = serde_json::from_str(body)?;
    let mut candles = rows
        .iter()
        .map(|row| {
            let timestamp = row
                .first()
                .and_then(Value::as_i64)
                .ok_or_else(|| ScanError::Data("kline row missing open time".into()))?;
            Ok(Candle {
                timestamp,
                open:   field_f64(row, 1)?,
                high:   field_f64(row, 2)?,
                low:    field_f64(row, 3)?,
                close:  field_f64(row, 4)?,
                volume: field_f64(row, 5)?,
            })
        })
        .collect::<ScanResult<Vec<Candle>>>()?;
    candles.sort_by_key(|c| c.timestamp);
    Ok(candles)
}

// ── Market listing ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    symbol:        String,
    status:        String,
    #[serde(default)]
    contract_type: String,
    quote_asset:   String,
    #[serde(default)]
    filters:       Vec<SymbolFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolFilter {
    filter_type: String,
    #[serde(default)]
    notional:    Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker24h {
    symbol:       String,
    #[serde(default)]
    last_price:   Option<String>,
    #[serde(default)]
    quote_volume: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookTicker {
    symbol:    String,
    #[serde(default)]
    bid_price: Option<String>,
    #[serde(default)]
    ask_price: Option<String>,
}

fn decimal(v: &Option<String>) -> Option<f64> {
    v.as_deref().and_then(|s| s.parse::<f64>().ok())
}

/// Join exchange info with the 24h and book tickers. Only trading USDT
/// perpetuals are listed; missing ticker fields stay `None`.
pub fn parse_markets(exchange_info: &str, tickers: &str, book: &str) -> ScanResult<Vec<MarketInfo>> {
    let info: ExchangeInfo = serde_json::from_str(exchange_info)?;
    let tickers: Vec<Ticker24h> = serde_json::from_str(tickers)?;
    let book: Vec<BookTicker> = serde_json::from_str(book)?;

    let tickers: AHashMap<&str, &Ticker24h> = tickers.iter().map(|t| (t.symbol.as_str(), t)).collect();
    let book: AHashMap<&str, &BookTicker> = book.iter().map(|b| (b.symbol.as_str(), b)).collect();

    let mut markets: Vec<MarketInfo> = info
        .symbols
        .iter()
        .filter(|s| s.status == "TRADING" && s.contract_type == "PERPETUAL" && s.quote_asset == "USDT")
        .map(|s| {
            let ticker = tickers.get(s.symbol.as_str());
            let quote = book.get(s.symbol.as_str());
            MarketInfo {
                symbol:       s.symbol.clone(),
                quote_volume: ticker.and_then(|t| decimal(&t.quote_volume)),
                last_price:   ticker.and_then(|t| decimal(&t.last_price)),
                bid:          quote.and_then(|q| decimal(&q.bid_price)),
                ask:          quote.and_then(|q| decimal(&q.ask_price)),
                min_notional: s
                    .filters
                    .iter()
                    .find(|f| f.filter_type == "MIN_NOTIONAL")
                    .and_then(|f| decimal(&f.notional)),
            }
        })
        .collect();
    markets.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    Ok(markets)
}

// ── Retry ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub network_delay:    Duration,
    pub rate_limit_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            network_delay:    Duration::from_secs(1),
            rate_limit_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn immediate() -> Self {
        Self {
            network_delay:    Duration::ZERO,
            rate_limit_delay: Duration::ZERO,
        }
    }
}

/// Fetch once, and retry once after a delay on a transient failure.
pub async fn fetch_with_retry(
    source: &dyn MarketDataSource,
    symbol: &str,
    timeframe: Timeframe,
    limit: usize,
    policy: &RetryPolicy,
) -> ScanResult<Vec<Candle>> {
    match source.fetch_candles(symbol, timeframe, limit).await {
        Ok(candles) => Ok(candles),
        Err(e) if e.is_retryable() => {
            let delay = match e {
                ScanError::RateLimited(_) => policy.rate_limit_delay,
                _ => policy.network_delay,
            };
            warn!(symbol, timeframe = %timeframe, error = %e, delay_ms = delay.as_millis() as u64, "fetch failed, retrying once");
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            source.fetch_candles(symbol, timeframe, limit).await
        }
        Err(e) => Err(e),
    }
}

// ── In-memory source ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Scripted {
    Candles(Vec<Candle>),
    Network,
    RateLimited,
}

/// Scripted market data for tests and offline runs. Each (symbol,
/// timeframe) returns its stored window (trimmed to `limit` newest bars)
/// or a scripted failure; queued one-shot failures are consumed first.
#[derive(Debug, Default)]
pub struct StaticMarketData {
    windows:  Mutex<AHashMap<(String, Timeframe), Scripted>>,
    failures: Mutex<AHashMap<(String, Timeframe), Vec<Scripted>>>,
    calls:    AtomicU64,
}

impl StaticMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    fn windows(&self) -> MutexGuard<'_, AHashMap<(String, Timeframe), Scripted>> {
        self.windows.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn failures(&self) -> MutexGuard<'_, AHashMap<(String, Timeframe), Vec<Scripted>>> {
        self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set(&self, symbol: &str, timeframe: Timeframe, candles: Vec<Candle>) {
        self.windows()
            .insert((symbol.to_owned(), timeframe), Scripted::Candles(candles));
    }

    /// Every fetch for the key fails with a network error.
    pub fn fail_network(&self, symbol: &str, timeframe: Timeframe) {
        self.windows().insert((symbol.to_owned(), timeframe), Scripted::Network);
    }

    /// The next fetch for the key fails once (network or rate limit).
    pub fn fail_once(&self, symbol: &str, timeframe: Timeframe, rate_limited: bool) {
        let failure = if rate_limited { Scripted::RateLimited } else { Scripted::Network };
        self.failures()
            .entry((symbol.to_owned(), timeframe))
            .or_default()
            .push(failure);
    }

    /// Total fetches served, failures included.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MarketDataSource for StaticMarketData {
    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> ScanResult<Vec<Candle>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let key = (symbol.to_owned(), timeframe);

        let queued = self.failures().get_mut(&key).and_then(|q| q.pop());
        let scripted = match queued {
            Some(f) => Some(f),
            None => self.windows().get(&key).cloned(),
        };
        match scripted {
            Some(Scripted::Candles(c)) => Ok(c[c.len().saturating_sub(limit)..].to_vec()),
            Some(Scripted::Network) => Err(ScanError::Network(format!("{symbol} {timeframe}: connection reset"))),
            Some(Scripted::RateLimited) => Err(ScanError::RateLimited(format!("{symbol} {timeframe}: HTTP 429"))),
            None => Err(ScanError::Data(format!("no data for {symbol} {timeframe}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_binance_kline_rows() {
        let body = r#"[
            [1700000900000,"101.0","103.5","100.5","102.0","12.5",1700001799999,"1275.0",10,"6.0","612.0","0"],
            [1700000000000,"100.0","102.0","99.0","101.0","10.0",1700000899999,"1010.0",8,"5.0","505.0","0"]
        ]"#;
        let candles = parse_klines(body).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].timestamp, 1_700_000_000_000);
        assert_eq!(candles[1].high, 103.5);
        assert_eq!(candles[1].volume, 12.5);
    }

    #[test]
    fn error_snippet_respects_char_boundaries() {
        let body = format!("{}é and more", "x".repeat(199));
        let snippet = error_snippet(&body);
        assert_eq!(snippet.chars().count(), ERROR_SNIPPET_CHARS);
        assert!(snippet.ends_with('é'));
        assert_eq!(error_snippet("short"), "short");
    }

    #[test]
    fn lists_trading_usdt_perpetuals() {
        let info = r#"{"timezone":"UTC","symbols":[
            {"symbol":"BTCUSDT","status":"TRADING","contractType":"PERPETUAL","quoteAsset":"USDT",
             "filters":[{"filterType":"PRICE_FILTER","tickSize":"0.10"},{"filterType":"MIN_NOTIONAL","notional":"100"}]},
            {"symbol":"ETHUSDT","status":"TRADING","contractType":"PERPETUAL","quoteAsset":"USDT","filters":[]},
            {"symbol":"BTCUSDT_260925","status":"TRADING","contractType":"CURRENT_QUARTER","quoteAsset":"USDT","filters":[]},
            {"symbol":"OLDUSDT","status":"SETTLING","contractType":"PERPETUAL","quoteAsset":"USDT","filters":[]},
            {"symbol":"ETHBTC","status":"TRADING","contractType":"PERPETUAL","quoteAsset":"BTC","filters":[]}
        ]}"#;
        let tickers = r#"[{"symbol":"BTCUSDT","lastPrice":"65000.5","quoteVolume":"1234567890.0"}]"#;
        let book = r#"[{"symbol":"BTCUSDT","bidPrice":"65000.4","askPrice":"65000.6"},
                       {"symbol":"ETHUSDT","bidPrice":"3000.0","askPrice":"3000.1"}]"#;

        let markets = parse_markets(info, tickers, book).unwrap();
        let symbols: Vec<&str> = markets.iter().map(|m| m.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(markets[0].min_notional, Some(100.0));
        assert_eq!(markets[0].quote_volume, Some(1_234_567_890.0));
        assert_eq!(markets[1].last_price, None);
        assert_eq!(markets[1].ask, Some(3000.1));
    }

    #[test]
    fn rejects_malformed_rows() {
        assert!(parse_klines(r#"[[1700000000000,"abc","1","1","1","1"]]"#).is_err());
        assert!(parse_klines(r#"[["x"]]"#).is_err());
        assert!(parse_klines("{\"code\":-1121}").is_err());
    }

    #[tokio::test]
    async fn retry_recovers_from_one_transient_failure() {
        let source = StaticMarketData::new();
        let bar = Candle { timestamp: 1, open: 1.0, high: 1.0, low: 1.0, close: 1.0, volume: 1.0 };
        source.set("BTCUSDT", Timeframe::H1, vec![bar]);
        source.fail_once("BTCUSDT", Timeframe::H1, true);

        let got = fetch_with_retry(&source, "BTCUSDT", Timeframe::H1, 10, &RetryPolicy::immediate())
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn retry_gives_up_after_second_failure() {
        let source = StaticMarketData::new();
        source.fail_network("ETHUSDT", Timeframe::M15);
        let err = fetch_with_retry(&source, "ETHUSDT", Timeframe::M15, 10, &RetryPolicy::immediate())
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Network(_)));
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn data_errors_are_not_retried() {
        let source = StaticMarketData::new();
        let err = fetch_with_retry(&source, "NOPE", Timeframe::M15, 10, &RetryPolicy::immediate())
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Data(_)));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn static_source_trims_to_limit() {
        let source = StaticMarketData::new();
        let bars: Vec<Candle> = (0..10)
            .map(|i| Candle { timestamp: i, open: 1.0, high: 1.0, low: 1.0, close: 1.0, volume: 1.0 })
            .collect();
        source.set("SOLUSDT", Timeframe::H4, bars);
        let got = source.fetch_candles("SOLUSDT", Timeframe::H4, 3).await.unwrap();
        assert_eq!(got.iter().map(|c| c.timestamp).collect::<Vec<_>>(), vec![7, 8, 9]);
    }
}
