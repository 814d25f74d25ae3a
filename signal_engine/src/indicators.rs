/// indicators.rs — Pure technical indicator functions
///
/// ─────────────────────────────────────────────────────────────────────────
/// MATHEMATICAL SPECIFICATION
/// ─────────────────────────────────────────────────────────────────────────
///
/// All inputs are ordered oldest-first. Every function fails with
/// `ScanError::Data` when the input is shorter than its minimum; nothing is
/// silently truncated.
///
///   SMA(n)      mean of the last n values                       min n
///   EMA(n)      seed = SMA of the first n values, then
///               v = α·x + (1−α)·v,  α = 2/(n+1)                  min n
///   RSI(n)      simple mean gain / loss over the last n deltas  min n+1
///               RSI = 100 − 100/(1 + gain/loss)
///   TR          max(H−L, |H−C_prev|, |L−C_prev|)
///   ATR(n)      simple mean of the last n TR values             min n+1
///   ATR%(n)     ATR(n) / C_last × 100                           min n+1
///   VWAP        Σ(TP·V)/ΣV over bars with V > 0, TP=(H+L+C)/3    min 1
///   VolZ(n)     (V_last − mean)/σ_pop over the last n volumes   min n
///   ADX(n)      single-period DX with exponential DM smoothing
///               (α = 1/n) and the prior LOW standing in for the
///               previous close inside TR                        min n+1
///   MACD(f,s,g) line = EMA(f) − EMA(s); signal = EMA(g) over the
///               line recomputed at every historical bar         min s+g
///   BB(n,k)     mid = SMA(n), σ_pop of the last n closes,
///               upper/lower = mid ± k·σ                         min n
///
/// ADX is one DX reading over the last n bars, not a Wilder average of DX.
/// ─────────────────────────────────────────────────────────────────────────
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use crate::error::{ScanError, ScanResult};

fn check_period(period: usize) -> ScanResult<()> {
    if period == 0 {
        return Err(ScanError::Data("period must be positive".into()));
    }
    Ok(())
}

fn check_len(what: &str, need: usize, got: usize) -> ScanResult<()> {
    if got < need {
        return Err(ScanError::insufficient(what, need, got));
    }
    Ok(())
}

fn check_same_len(lens: &[usize]) -> ScanResult<()> {
    if lens.windows(2).any(|w| w[0] != w[1]) {
        return Err(ScanError::Data(format!("mismatched array lengths: {lens:?}")));
    }
    Ok(())
}

// ── Moving averages ───────────────────────────────────────────────────────

/// Simple moving average of the last `period` values.
pub fn sma(values: &[f64], period: usize) -> ScanResult<f64> {
    check_period(period)?;
    check_len("SMA", period, values.len())?;
    let window = &values[values.len() - period..];
    Ok(window.iter().sum::<f64>() / period as f64)
}

/// Exponential moving average, SMA-seeded.
pub fn ema(values: &[f64], period: usize) -> ScanResult<f64> {
    check_period(period)?;
    check_len("EMA", period, values.len())?;

    let alpha = 2.0 / (period as f64 + 1.0);
    let mut value = values[..period].iter().sum::<f64>() / period as f64;
    for &x in &values[period..] {
        value = alpha * x + (1.0 - alpha) * value;
    }
    Ok(value)
}

// ── Oscillators ───────────────────────────────────────────────────────────

/// Relative Strength Index with simple (non-Wilder) averaging.
pub fn rsi(closes: &[f64], period: usize) -> ScanResult<f64> {
    check_period(period)?;
    check_len("RSI", period + 1, closes.len())?;

    let deltas = &closes[closes.len() - period - 1..];
    let (mut gains, mut losses) = (0.0, 0.0);
    for w in deltas.windows(2) {
        let change = w[1] - w[0];
        if change > 0.0 {
            gains += change;
        } else {
            losses -= change;
        }
    }
    let avg_gain = gains / period as f64;
    let avg_loss = losses / period as f64;

    if avg_gain == 0.0 && avg_loss == 0.0 {
        return Ok(50.0);
    }
    if avg_loss == 0.0 {
        return Ok(100.0);
    }
    if avg_gain == 0.0 {
        return Ok(0.0);
    }
    let rs = avg_gain / avg_loss;
    Ok((100.0 - 100.0 / (1.0 + rs)).clamp(0.0, 100.0))
}

// ── Range / volatility ────────────────────────────────────────────────────

pub fn true_range(high: f64, low: f64, prev_close: f64) -> f64 {
    (high - low)
        .max((high - prev_close).abs())
        .max((low - prev_close).abs())
}

/// Average True Range: simple mean of the last `period` true ranges.
pub fn atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> ScanResult<f64> {
    check_period(period)?;
    check_same_len(&[highs.len(), lows.len(), closes.len()])?;
    let n = highs.len();
    check_len("ATR", period + 1, n)?;

    let sum: f64 = (n - period..n)
        .map(|i| true_range(highs[i], lows[i], closes[i - 1]))
        .sum();
    Ok((sum / period as f64).max(0.0))
}

/// ATR as a percentage of the last close.
pub fn atr_percent(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> ScanResult<f64> {
    let value = atr(highs, lows, closes, period)?;
    let last_close = closes[closes.len() - 1];
    if last_close <= 0.0 {
        return Err(ScanError::Data(format!("last close must be positive, got {last_close}")));
    }
    Ok(value / last_close * 100.0)
}

// ── Volume ────────────────────────────────────────────────────────────────

/// Volume-weighted average typical price; bars with non-positive volume are
/// excluded.
pub fn vwap(highs: &[f64], lows: &[f64], closes: &[f64], volumes: &[f64]) -> ScanResult<f64> {
    check_same_len(&[highs.len(), lows.len(), closes.len(), volumes.len()])?;
    check_len("VWAP", 1, highs.len())?;

    let (mut pv, mut vol) = (0.0, 0.0);
    for i in 0..highs.len() {
        if volumes[i] > 0.0 {
            let typical = (highs[i] + lows[i] + closes[i]) / 3.0;
            pv += typical * volumes[i];
            vol += volumes[i];
        }
    }
    if vol == 0.0 {
        return Err(ScanError::Data("no valid volume data for VWAP".into()));
    }
    Ok(pv / vol)
}

/// Z-score of the latest volume against the last `period` volumes.
pub fn volume_zscore(volumes: &[f64], period: usize) -> ScanResult<f64> {
    check_period(period)?;
    check_len("volume z-score", period, volumes.len())?;

    let window = &volumes[volumes.len() - period..];
    let mean = window.iter().sum::<f64>() / period as f64;
    let std_dev = window.iter().population_std_dev();
    if std_dev == 0.0 || std_dev.is_nan() {
        return Ok(0.0);
    }
    Ok((volumes[volumes.len() - 1] - mean) / std_dev)
}

// ── Trend strength ────────────────────────────────────────────────────────

/// Exponential smoothing seeded with the first value; negative inputs are
/// floored at zero after the seed.
fn smoothed_dm(values: &[f64], period: usize) -> f64 {
    let Some((&first, rest)) = values.split_first() else {
        return 0.0;
    };
    let alpha = 1.0 / period as f64;
    rest.iter()
        .fold(first, |acc, &v| alpha * v.max(0.0) + (1.0 - alpha) * acc)
}

/// Directional index over the last `period` bars (see module header).
pub fn adx(highs: &[f64], lows: &[f64], period: usize) -> ScanResult<f64> {
    check_period(period)?;
    check_same_len(&[highs.len(), lows.len()])?;
    let n = highs.len();
    check_len("ADX", period + 1, n)?;

    let mut tr = Vec::with_capacity(n - 1);
    let mut plus_dm = Vec::with_capacity(n - 1);
    let mut minus_dm = Vec::with_capacity(n - 1);
    for i in 1..n {
        tr.push(true_range(highs[i], lows[i], lows[i - 1]));

        let up = highs[i] - highs[i - 1];
        let down = lows[i - 1] - lows[i];
        plus_dm.push(if up > down && up > 0.0 { up } else { 0.0 });
        minus_dm.push(if down > up && down > 0.0 { down } else { 0.0 });
    }

    let tail = tr.len() - period;
    let tr_smoothed = tr[tail..].iter().sum::<f64>() / period as f64;
    if tr_smoothed == 0.0 {
        return Ok(0.0);
    }
    let di_plus = smoothed_dm(&plus_dm[tail..], period) / tr_smoothed * 100.0;
    let di_minus = smoothed_dm(&minus_dm[tail..], period) / tr_smoothed * 100.0;

    let di_sum = di_plus + di_minus;
    if di_sum == 0.0 {
        return Ok(0.0);
    }
    let dx = (di_plus - di_minus).abs() / di_sum * 100.0;
    Ok(dx.clamp(0.0, 100.0))
}

// ── MACD ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Macd {
    pub macd:      f64,
    pub signal:    f64,
    pub histogram: f64,
}

/// MACD line, signal and histogram.
///
/// The signal line is the EMA of the MACD line recomputed from scratch at
/// every bar from `slow` onward (quadratic in the window length).
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> ScanResult<Macd> {
    check_period(fast)?;
    check_period(signal)?;
    if fast >= slow {
        return Err(ScanError::Data(format!(
            "MACD fast period ({fast}) must be below slow period ({slow})"
        )));
    }
    check_len("MACD", slow + signal, closes.len())?;

    let mut history = Vec::with_capacity(closes.len() - slow + 1);
    for end in slow..=closes.len() {
        let window = &closes[..end];
        history.push(ema(window, fast)? - ema(window, slow)?);
    }

    let macd_line = history[history.len() - 1];
    let signal_line = ema(&history, signal)?;
    Ok(Macd {
        macd:      macd_line,
        signal:    signal_line,
        histogram: macd_line - signal_line,
    })
}

// ── Bollinger Bands ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bollinger {
    pub upper:     f64,
    pub middle:    f64,
    pub lower:     f64,
    pub bandwidth: f64,
    /// Where the last close sits inside the band, 0 = lower, 1 = upper
    pub position:  f64,
}

pub fn bollinger_bands(closes: &[f64], period: usize, std_mult: f64) -> ScanResult<Bollinger> {
    check_period(period)?;
    check_len("Bollinger Bands", period, closes.len())?;

    let window = &closes[closes.len() - period..];
    let middle = window.iter().sum::<f64>() / period as f64;
    let variance = window.iter().map(|c| (c - middle).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();

    let upper = middle + std_mult * std_dev;
    let lower = middle - std_mult * std_dev;
    let close = closes[closes.len() - 1];
    let position = if upper == lower {
        0.5
    } else {
        (close - lower) / (upper - lower)
    };

    Ok(Bollinger {
        upper,
        middle,
        lower,
        bandwidth: upper - lower,
        position,
    })
}

// ── Returns & correlation ─────────────────────────────────────────────────

/// ln(p_t / p_{t−1}); non-positive prices are a data error.
pub fn log_returns(prices: &[f64]) -> ScanResult<Vec<f64>> {
    if prices.iter().any(|&p| p <= 0.0) {
        return Err(ScanError::Data("log returns need positive prices".into()));
    }
    Ok(prices.windows(2).map(|w| (w[1] / w[0]).ln()).collect())
}

/// (p_t − p_{t−1}) / p_{t−1}
pub fn pct_returns(prices: &[f64]) -> Vec<f64> {
    prices
        .windows(2)
        .map(|w| if w[0] != 0.0 { (w[1] - w[0]) / w[0] } else { 0.0 })
        .collect()
}

/// Pearson correlation of two equally long series; 0 when undefined
/// (fewer than two points or a zero-variance side).
pub fn pearson(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.len() < 2 {
        return 0.0;
    }
    let cov = a.iter().covariance(b.iter());
    let sd_a = a.iter().std_dev();
    let sd_b = b.iter().std_dev();
    let corr = cov / (sd_a * sd_b);
    if corr.is_finite() {
        corr.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(n: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>, Vec<f64>) {
        let closes = vec![100.0; n];
        let highs = vec![100.5; n];
        let lows = vec![99.5; n];
        let volumes = vec![1_000.0; n];
        (highs, lows, closes, volumes)
    }

    #[test]
    fn minimum_lengths_are_enforced() {
        let v: Vec<f64> = (1..=14).map(f64::from).collect();
        assert!(sma(&v, 15).is_err());
        assert!(sma(&v, 14).is_ok());
        assert!(ema(&v, 15).is_err());
        assert!(rsi(&v, 14).is_err());
        assert!(rsi(&v, 13).is_ok());
        assert!(atr(&v, &v, &v, 14).is_err());
        assert!(atr(&v, &v, &v, 13).is_ok());
        assert!(adx(&v, &v, 14).is_err());
        assert!(volume_zscore(&v, 15).is_err());
        assert!(bollinger_bands(&v, 15, 2.0).is_err());
        assert!(macd(&v, 3, 6, 9).is_err());
        assert!(macd(&v, 3, 5, 9).is_ok());
    }

    #[test]
    fn flat_series_has_neutral_readings() {
        let (highs, lows, closes, volumes) = flat(40);
        assert_eq!(rsi(&closes, 14).unwrap(), 50.0);
        assert_eq!(atr(&highs, &lows, &closes, 14).unwrap(), 1.0);
        assert_eq!(volume_zscore(&volumes, 20).unwrap(), 0.0);
        assert_eq!(adx(&highs, &lows, 14).unwrap(), 0.0);

        let bb = bollinger_bands(&closes, 20, 2.0).unwrap();
        assert_eq!(bb.upper, bb.lower);
        assert_eq!(bb.position, 0.5);
    }

    #[test]
    fn ema_is_sma_seeded() {
        let v = [1.0, 2.0, 3.0];
        assert_eq!(ema(&v, 3).unwrap(), 2.0);
        // seed 1.5, then α = 2/3: 2/3·3 + 1/3·1.5
        assert!((ema(&v, 2).unwrap() - 2.5).abs() < 1e-12);
    }

    #[test]
    fn rsi_edges() {
        let up: Vec<f64> = (1..=20).map(f64::from).collect();
        assert_eq!(rsi(&up, 14).unwrap(), 100.0);
        let down: Vec<f64> = up.iter().rev().copied().collect();
        assert_eq!(rsi(&down, 14).unwrap(), 0.0);

        let zigzag: Vec<f64> = (0..30).map(|i| if i % 2 == 0 { 10.0 } else { 11.0 }).collect();
        let r = rsi(&zigzag, 14).unwrap();
        assert!((0.0..=100.0).contains(&r));
    }

    #[test]
    fn atr_percent_rejects_non_positive_close() {
        let highs = vec![1.0; 16];
        let lows = vec![0.0; 16];
        let mut closes = vec![0.5; 16];
        closes[15] = 0.0;
        assert!(atr_percent(&highs, &lows, &closes, 14).is_err());
    }

    #[test]
    fn vwap_skips_zero_volume_and_fails_without_volume() {
        let highs = [11.0, 21.0];
        let lows = [9.0, 19.0];
        let closes = [10.0, 20.0];
        assert_eq!(vwap(&highs, &lows, &closes, &[5.0, 0.0]).unwrap(), 10.0);
        assert!(vwap(&highs, &lows, &closes, &[0.0, -1.0]).is_err());
        assert!(vwap(&highs, &lows, &closes[..1], &[1.0, 1.0]).is_err());
    }

    #[test]
    fn adx_stays_in_range_on_trending_data() {
        let highs: Vec<f64> = (0..40).map(|i| 100.0 + i as f64 * 1.5).collect();
        let lows: Vec<f64> = highs.iter().map(|h| h - 2.0).collect();
        let value = adx(&highs, &lows, 14).unwrap();
        assert!(value > 0.0 && value <= 100.0, "adx = {value}");
    }

    #[test]
    fn macd_flat_prices_are_zero() {
        let closes = vec![100.0; 50];
        let m = macd(&closes, 12, 26, 9).unwrap();
        assert!(m.macd.abs() < 1e-9);
        assert!(m.signal.abs() < 1e-9);
        assert!(m.histogram.abs() < 1e-9);
    }

    #[test]
    fn macd_rejects_inverted_periods() {
        let closes = vec![100.0; 60];
        assert!(macd(&closes, 26, 12, 9).is_err());
    }

    #[test]
    fn indicators_are_deterministic() {
        let closes: Vec<f64> = (0..80).map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0).collect();
        let a = macd(&closes, 12, 26, 9).unwrap();
        let b = macd(&closes, 12, 26, 9).unwrap();
        assert_eq!(a.macd.to_bits(), b.macd.to_bits());
        assert_eq!(a.signal.to_bits(), b.signal.to_bits());
        assert_eq!(rsi(&closes, 14).unwrap().to_bits(), rsi(&closes, 14).unwrap().to_bits());
    }

    #[test]
    fn pearson_of_identical_and_opposite_series() {
        let a = [1.0, 2.0, 4.0, 3.0, 5.0];
        let b: Vec<f64> = a.iter().map(|x| -x).collect();
        assert!((pearson(&a, &a) - 1.0).abs() < 1e-9);
        assert!((pearson(&a, &b) + 1.0).abs() < 1e-9);
        assert_eq!(pearson(&a, &[1.0; 5]), 0.0);
        assert_eq!(pearson(&a[..1], &a[..1]), 0.0);
    }
}
