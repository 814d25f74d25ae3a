/// regime.rs — Market regime classification
///
/// ─────────────────────────────────────────────────────────────────────────
/// MATHEMATICAL SPECIFICATION
/// ─────────────────────────────────────────────────────────────────────────
///
/// VOLUME CONFIRMATION
///   vs = clamp( mean(V[-5:]) / mean(V[-20:]) − 1, −1, 1 )
///   |vs| ≥ 0.5 appends _VOLUME_SURGE (vs > 0) or _VOLUME_DRY (vs < 0)
///
/// PRICE MOMENTUM
///   r5  = (P_t / P_{t−5}  − 1) × 100
///   r10 = (P_t / P_{t−10} − 1) × 100
///   ms  = ((r5 + r10) / 2) / max(ATR%, 0.1)
///
/// TREND SCORE (additive)
///   ±1    EMA20 vs EMA50
///   ±1    EMA50 vs EMA200            (skipped when EMA200 is absent)
///   ±1    P ≥ EMA20 × 1.02  /  P ≤ EMA20 × 0.98
///   ±1    r5 > 2  /  r5 < −2
///   ±0.5  RSI > 55  /  RSI < 45
///
///   ≥ 2 STRONG_BULLISH, ≥ 1 BULLISH, ≤ −2 STRONG_BEARISH, ≤ −1 BEARISH,
///   otherwise SIDEWAYS
///
/// VOLATILITY
///   v = ATR% × (1 + 0.25 × vs)      v < 2 LOW, v > 4 HIGH, else NORMAL
///
/// MOMENTUM
///   RSI ≥ 70 OVERBOUGHT, RSI ≤ 30 OVERSOLD,
///   RSI ≥ 60 or (RSI > 50 and ms > 1)   BULLISH,
///   RSI ≤ 40 or (RSI < 50 and ms < −1)  BEARISH,
///   otherwise NEUTRAL
///
/// CONFIDENCE (start 0.5, clamp [0, 1])
///   +0.1 RSI ∈ [30, 70]
///   +0.2 EMA20, EMA50, EMA200 stacked in one direction
///        (without EMA200: price on the same side of EMA20 and EMA50)
///   +0.2 ADX > 25, −0.1 ADX < 20
///   +0.1 vs > 0.2, −0.1 vs < −0.2
///   +0.1 × min(|ms|, 1) when r5 and r10 share a sign
/// ─────────────────────────────────────────────────────────────────────────
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::features::IndicatorSet;
use crate::models::Ohlcv;

/// Minimum closed candles needed for a classification.
pub const MIN_CANDLES: usize = 20;

const VOLUME_EXTREME: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Trend {
    StrongBullish,
    Bullish,
    Sideways,
    Bearish,
    StrongBearish,
    Unknown,
}

impl Trend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trend::StrongBullish => "STRONG_BULLISH",
            Trend::Bullish => "BULLISH",
            Trend::Sideways => "SIDEWAYS",
            Trend::Bearish => "BEARISH",
            Trend::StrongBearish => "STRONG_BEARISH",
            Trend::Unknown => "UNKNOWN",
        }
    }

    pub fn is_bullish(&self) -> bool {
        matches!(self, Trend::Bullish | Trend::StrongBullish)
    }

    pub fn is_bearish(&self) -> bool {
        matches!(self, Trend::Bearish | Trend::StrongBearish)
    }

    fn from_score(score: f64) -> Self {
        if score >= 2.0 {
            Trend::StrongBullish
        } else if score >= 1.0 {
            Trend::Bullish
        } else if score <= -2.0 {
            Trend::StrongBearish
        } else if score <= -1.0 {
            Trend::Bearish
        } else {
            Trend::Sideways
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Volatility {
    Low,
    Normal,
    High,
    Unknown,
}

impl Volatility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Volatility::Low => "LOW",
            Volatility::Normal => "NORMAL",
            Volatility::High => "HIGH",
            Volatility::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Momentum {
    Overbought,
    Bullish,
    Neutral,
    Bearish,
    Oversold,
    Unknown,
}

impl Momentum {
    pub fn as_str(&self) -> &'static str {
        match self {
            Momentum::Overbought => "OVERBOUGHT",
            Momentum::Bullish => "BULLISH",
            Momentum::Neutral => "NEUTRAL",
            Momentum::Bearish => "BEARISH",
            Momentum::Oversold => "OVERSOLD",
            Momentum::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeClassification {
    pub symbol:            String,
    /// Composite label, e.g. `BULLISH_NORMAL_NEUTRAL_VOLUME_SURGE`
    pub regime:            String,
    pub trend:             Trend,
    pub volatility:        Volatility,
    pub momentum:          Momentum,
    pub confidence:        f64,
    pub volume_strength:   f64,
    pub momentum_strength: f64,
    pub timestamp:         DateTime<Utc>,
}

impl RegimeClassification {
    pub fn unknown(symbol: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol:            symbol.to_owned(),
            regime:            "UNKNOWN".into(),
            trend:             Trend::Unknown,
            volatility:        Volatility::Unknown,
            momentum:          Momentum::Unknown,
            confidence:        0.0,
            volume_strength:   0.0,
            momentum_strength: 0.0,
            timestamp,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.trend == Trend::Unknown
    }
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        0.0
    } else {
        xs.iter().sum::<f64>() / xs.len() as f64
    }
}

fn pct_change(now: f64, then: f64) -> f64 {
    if then > 0.0 {
        (now / then - 1.0) * 100.0
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RegimeClassifier;

impl RegimeClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(
        &self,
        symbol: &str,
        data: &Ohlcv,
        ind: &IndicatorSet,
        now: DateTime<Utc>,
    ) -> RegimeClassification {
        let n = data.len();
        let Some(price) = data.last_close().filter(|_| n >= MIN_CANDLES) else {
            return RegimeClassification::unknown(symbol, now);
        };
        let closes = &data.closes;

        // ── Volume confirmation ───────────────────────────────────────────
        let volumes = &data.volumes;
        let vol_long = mean(&volumes[volumes.len().saturating_sub(20)..]);
        let vol_short = mean(&volumes[volumes.len().saturating_sub(5)..]);
        let volume_strength = if vol_long > 0.0 {
            (vol_short / vol_long - 1.0).clamp(-1.0, 1.0)
        } else {
            0.0
        };

        // ── Momentum ──────────────────────────────────────────────────────
        let r5 = pct_change(price, closes[n - 6]);
        let r10 = pct_change(price, closes[n - 11]);
        let atr_pct = ind.atr_percent().unwrap_or(0.0);
        let momentum_strength = ((r5 + r10) / 2.0) / atr_pct.max(0.1);

        let rsi = ind.rsi().unwrap_or(50.0);
        let ema20 = ind.ema.ema_20;
        let ema50 = ind.ema.ema_50;
        let ema200 = ind.ema.ema_200;

        // ── Trend score ───────────────────────────────────────────────────
        let mut trend_score = 0.0;
        if let (Some(e20), Some(e50)) = (ema20, ema50) {
            trend_score += if e20 > e50 { 1.0 } else if e20 < e50 { -1.0 } else { 0.0 };
        }
        if let (Some(e50), Some(e200)) = (ema50, ema200) {
            trend_score += if e50 > e200 { 1.0 } else if e50 < e200 { -1.0 } else { 0.0 };
        }
        if let Some(e20) = ema20.filter(|e| *e > 0.0) {
            let dist = (price - e20) / e20 * 100.0;
            if dist >= 2.0 {
                trend_score += 1.0;
            } else if dist <= -2.0 {
                trend_score -= 1.0;
            }
        }
        if r5 > 2.0 {
            trend_score += 1.0;
        } else if r5 < -2.0 {
            trend_score -= 1.0;
        }
        if rsi > 55.0 {
            trend_score += 0.5;
        } else if rsi < 45.0 {
            trend_score -= 0.5;
        }
        let trend = Trend::from_score(trend_score);

        // ── Volatility ────────────────────────────────────────────────────
        let adj_vol = atr_pct * (1.0 + 0.25 * volume_strength);
        let volatility = if adj_vol < 2.0 {
            Volatility::Low
        } else if adj_vol > 4.0 {
            Volatility::High
        } else {
            Volatility::Normal
        };

        // ── Momentum bucket ───────────────────────────────────────────────
        let momentum = if rsi >= 70.0 {
            Momentum::Overbought
        } else if rsi <= 30.0 {
            Momentum::Oversold
        } else if rsi >= 60.0 || (rsi > 50.0 && momentum_strength > 1.0) {
            Momentum::Bullish
        } else if rsi <= 40.0 || (rsi < 50.0 && momentum_strength < -1.0) {
            Momentum::Bearish
        } else {
            Momentum::Neutral
        };

        // ── Confidence ────────────────────────────────────────────────────
        let mut confidence = 0.5;
        if (30.0..=70.0).contains(&rsi) {
            confidence += 0.1;
        }
        let aligned = match (ema20, ema50, ema200) {
            (Some(a), Some(b), Some(c)) => (a > b && b > c) || (a < b && b < c),
            (Some(a), Some(b), None) => {
                (price > a && price > b) || (price < a && price < b)
            }
            _ => false,
        };
        if aligned {
            confidence += 0.2;
        }
        match ind.adx() {
            Some(adx) if adx > 25.0 => confidence += 0.2,
            Some(adx) if adx < 20.0 => confidence -= 0.1,
            _ => {}
        }
        if volume_strength > 0.2 {
            confidence += 0.1;
        } else if volume_strength < -0.2 {
            confidence -= 0.1;
        }
        if r5 * r10 > 0.0 {
            confidence += 0.1 * momentum_strength.abs().min(1.0);
        }
        let confidence = confidence.clamp(0.0, 1.0);

        let mut regime = format!("{}_{}_{}", trend.as_str(), volatility.as_str(), momentum.as_str());
        if volume_strength >= VOLUME_EXTREME {
            regime.push_str("_VOLUME_SURGE");
        } else if volume_strength <= -VOLUME_EXTREME {
            regime.push_str("_VOLUME_DRY");
        }

        debug!(symbol, %regime, confidence, "regime classified");

        RegimeClassification {
            symbol: symbol.to_owned(),
            regime,
            trend,
            volatility,
            momentum,
            confidence,
            volume_strength,
            momentum_strength,
            timestamp: now,
        }
    }
}
