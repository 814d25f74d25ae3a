/// scoring.rs — Multi-factor signal scoring
///
/// ─────────────────────────────────────────────────────────────────────────
/// MATHEMATICAL SPECIFICATION
/// ─────────────────────────────────────────────────────────────────────────
///
/// DIRECTION (weighted vote)
///   regime trend bullish/bearish      ±2
///   P > EMA20 > EMA50  /  P < EMA20 < EMA50   ±1
///   RSI < 40 (bull)  /  RSI > 60 (bear)       ±1
///   MACD > signal  /  MACD < signal           ±1
///   bull − bear > 1 → LONG, bear − bull > 1 → SHORT,
///   otherwise the regime trend decides, otherwise NEUTRAL
///
/// SCORE = Σ components, each capped
///   RSI        0–2   <25 | >75 → 2,  <35 | >65 → 1.5,  <45 | >55 → 0.5
///   EMA        0–2   |P/EMA20 − 1| > 1% and |EMA20/EMA50 − 1| > 0.5%
///                    on the same side → 2, same side only → 1
///   MACD       0–2   MACD, signal and histogram agree → 1, plus
///                    |histogram| > 0.01 → 2
///   Bollinger  0–2   pos < 0.1 | > 0.9 → 2,  < 0.2 | > 0.8 → 1.5,
///                    pos ∈ [0.4, 0.6] → 0.5
///   Volume     0–1   z > 2 → 1,  z > 1.5 → 0.5
///   Volatility 0–1   ATR% ∈ [2, 8] → 1,  ATR% ∈ [1, 12] → 0.5
///
///   confidence = score / max_score
///
/// PRICE LEVELS (ATR fallback = 2% of price)
///   LONG : stop = P − 1.5·ATR, moved to the lower band when the band is
///          further below;  target = P + 3·ATR
///   SHORT: mirror
/// ─────────────────────────────────────────────────────────────────────────
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::features::IndicatorSet;
use crate::models::{Direction, Ohlcv};
use crate::regime::RegimeClassification;

pub const MIN_CANDLES: usize = 20;

pub const DEFAULT_MIN_SCORE: f64 = 7.0;
pub const DEFAULT_MAX_SCORE: f64 = 10.0;

const STOP_ATR_MULT: f64 = 1.5;
const TARGET_ATR_MULT: f64 = 3.0;
const ATR_FALLBACK_FRAC: f64 = 0.02;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreComponents {
    pub rsi:           f64,
    pub ema_alignment: f64,
    pub macd:          f64,
    pub bollinger:     f64,
    pub volume:        f64,
    pub volatility:    f64,
}

impl ScoreComponents {
    pub fn total(&self) -> f64 {
        self.rsi + self.ema_alignment + self.macd + self.bollinger + self.volume + self.volatility
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub symbol:          String,
    pub direction:       Direction,
    pub score:           f64,
    pub max_score:       f64,
    pub confidence:      f64,
    pub entry_price:     f64,
    pub stop_loss:       f64,
    pub take_profit:     f64,
    pub components:      ScoreComponents,
    pub reasons:         Vec<String>,
    pub meets_threshold: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ScoringEngine {
    pub min_score: f64,
    pub max_score: f64,
}

impl Default for ScoringEngine {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_SCORE, DEFAULT_MAX_SCORE)
    }
}

impl ScoringEngine {
    pub fn new(min_score: f64, max_score: f64) -> Self {
        Self { min_score, max_score }
    }

    pub fn meets_threshold(&self, score: f64) -> bool {
        score >= self.min_score
    }

    /// Zero score, NEUTRAL, no levels.
    pub fn default_score(&self, symbol: &str) -> ScoreResult {
        ScoreResult {
            symbol:          symbol.to_owned(),
            direction:       Direction::Neutral,
            score:           0.0,
            max_score:       self.max_score,
            confidence:      0.0,
            entry_price:     0.0,
            stop_loss:       0.0,
            take_profit:     0.0,
            components:      ScoreComponents::default(),
            reasons:         Vec::new(),
            meets_threshold: false,
        }
    }

    pub fn score(
        &self,
        symbol: &str,
        data: &Ohlcv,
        ind: &IndicatorSet,
        regime: &RegimeClassification,
    ) -> ScoreResult {
        let Some(price) = data.last_close().filter(|_| data.len() >= MIN_CANDLES) else {
            return self.default_score(symbol);
        };
        if ind.is_empty() || price <= 0.0 {
            return self.default_score(symbol);
        }

        let rsi = ind.rsi().unwrap_or(50.0);
        let atr_pct = ind.atr_percent().unwrap_or(0.0);
        let volume_z = ind.volume_zscore().unwrap_or(0.0);

        let mut reasons = Vec::new();
        let mut c = ScoreComponents::default();

        // ── 1. RSI ────────────────────────────────────────────────────────
        c.rsi = score_rsi(rsi);
        if c.rsi > 0.0 {
            if rsi < 30.0 {
                reasons.push(format!("RSI oversold ({rsi:.1})"));
            } else if rsi > 70.0 {
                reasons.push(format!("RSI overbought ({rsi:.1})"));
            }
        }

        // ── 2. EMA alignment ──────────────────────────────────────────────
        if let (Some(e20), Some(e50)) = (ind.ema.ema_20, ind.ema.ema_50) {
            c.ema_alignment = score_ema_alignment(price, e20, e50);
            if c.ema_alignment > 0.0 {
                let dist = (price - e20) / e20 * 100.0;
                if dist > 0.0 {
                    reasons.push(format!("Price above EMA20 (+{dist:.1}%)"));
                } else {
                    reasons.push(format!("Price below EMA20 ({dist:.1}%)"));
                }
            }
        }

        // ── 3. MACD ───────────────────────────────────────────────────────
        if let Some(m) = ind.macd {
            c.macd = score_macd(m.macd, m.signal, m.histogram);
            if c.macd > 0.0 {
                if m.macd > m.signal && m.histogram > 0.0 {
                    reasons.push("MACD bullish crossover".into());
                } else if m.macd < m.signal && m.histogram < 0.0 {
                    reasons.push("MACD bearish crossover".into());
                }
            }
        }

        // ── 4. Bollinger position ─────────────────────────────────────────
        if let Some(bb) = ind.bollinger {
            c.bollinger = score_bollinger(bb.position);
            if c.bollinger > 0.0 {
                if bb.position < 0.2 {
                    reasons.push("Price near lower Bollinger Band".into());
                } else if bb.position > 0.8 {
                    reasons.push("Price near upper Bollinger Band".into());
                }
            }
        }

        // ── 5. Volume ─────────────────────────────────────────────────────
        c.volume = score_volume(volume_z);
        if c.volume > 0.0 {
            reasons.push(format!("High volume (Z-score: {volume_z:.2})"));
        }

        // ── 6. Volatility regime ──────────────────────────────────────────
        c.volatility = score_volatility(atr_pct);
        if c.volatility > 0.0 {
            reasons.push(format!("Moderate volatility ({atr_pct:.1}%)"));
        }

        let score = c.total();
        let direction = determine_direction(price, ind, rsi, regime);
        let (entry_price, stop_loss, take_profit) = price_levels(price, ind, direction);

        debug!(symbol, score, max = self.max_score, direction = %direction, "signal scored");

        ScoreResult {
            symbol: symbol.to_owned(),
            direction,
            score,
            max_score: self.max_score,
            confidence: if self.max_score > 0.0 { score / self.max_score } else { 0.0 },
            entry_price,
            stop_loss,
            take_profit,
            components: c,
            reasons,
            meets_threshold: self.meets_threshold(score),
        }
    }
}

fn score_rsi(rsi: f64) -> f64 {
    if rsi < 25.0 {
        2.0
    } else if rsi < 35.0 {
        1.5
    } else if rsi < 45.0 {
        0.5
    } else if rsi > 75.0 {
        2.0
    } else if rsi > 65.0 {
        1.5
    } else if rsi > 55.0 {
        0.5
    } else {
        0.0
    }
}

fn score_ema_alignment(price: f64, ema20: f64, ema50: f64) -> f64 {
    if ema20 <= 0.0 || ema50 <= 0.0 {
        return 0.0;
    }
    let p_vs_20 = (price - ema20) / ema20 * 100.0;
    let e20_vs_50 = (ema20 - ema50) / ema50 * 100.0;

    if p_vs_20 > 1.0 && e20_vs_50 > 0.5 {
        2.0
    } else if p_vs_20 > 0.0 && e20_vs_50 > 0.0 {
        1.0
    } else if p_vs_20 < -1.0 && e20_vs_50 < -0.5 {
        2.0
    } else if p_vs_20 < 0.0 && e20_vs_50 < 0.0 {
        1.0
    } else {
        0.0
    }
}

fn score_macd(macd: f64, signal: f64, hist: f64) -> f64 {
    let bullish = macd > signal && hist > 0.0;
    let bearish = macd < signal && hist < 0.0;
    match (bullish || bearish, hist.abs() > 0.01) {
        (true, true) => 2.0,
        (true, false) => 1.0,
        _ => 0.0,
    }
}

fn score_bollinger(position: f64) -> f64 {
    if position < 0.1 {
        2.0
    } else if position < 0.2 {
        1.5
    } else if position > 0.9 {
        2.0
    } else if position > 0.8 {
        1.5
    } else if (0.4..=0.6).contains(&position) {
        0.5
    } else {
        0.0
    }
}

fn score_volume(z: f64) -> f64 {
    if z > 2.0 {
        1.0
    } else if z > 1.5 {
        0.5
    } else {
        0.0
    }
}

fn score_volatility(atr_pct: f64) -> f64 {
    if (2.0..=8.0).contains(&atr_pct) {
        1.0
    } else if (1.0..=12.0).contains(&atr_pct) {
        0.5
    } else {
        0.0
    }
}

fn determine_direction(
    price: f64,
    ind: &IndicatorSet,
    rsi: f64,
    regime: &RegimeClassification,
) -> Direction {
    let mut bull = 0i32;
    let mut bear = 0i32;

    if regime.trend.is_bullish() {
        bull += 2;
    } else if regime.trend.is_bearish() {
        bear += 2;
    }

    if let (Some(e20), Some(e50)) = (ind.ema.ema_20, ind.ema.ema_50) {
        if price > e20 && e20 > e50 {
            bull += 1;
        } else if price < e20 && e20 < e50 {
            bear += 1;
        }
    }

    if rsi < 40.0 {
        bull += 1;
    } else if rsi > 60.0 {
        bear += 1;
    }

    if let Some(m) = ind.macd {
        if m.macd > m.signal {
            bull += 1;
        } else if m.macd < m.signal {
            bear += 1;
        }
    }

    if bull - bear > 1 {
        Direction::Long
    } else if bear - bull > 1 {
        Direction::Short
    } else if regime.trend.is_bullish() {
        Direction::Long
    } else if regime.trend.is_bearish() {
        Direction::Short
    } else {
        Direction::Neutral
    }
}

/// Entry, stop and target for `direction` at `price`.
fn price_levels(price: f64, ind: &IndicatorSet, direction: Direction) -> (f64, f64, f64) {
    let atr = ind
        .atr()
        .filter(|a| *a > 0.0)
        .unwrap_or(price * ATR_FALLBACK_FRAC);

    match direction {
        Direction::Long => {
            let mut stop = price - STOP_ATR_MULT * atr;
            if let Some(bb) = ind.bollinger {
                if bb.lower < stop {
                    stop = bb.lower;
                }
            }
            (price, stop, price + TARGET_ATR_MULT * atr)
        }
        Direction::Short => {
            let mut stop = price + STOP_ATR_MULT * atr;
            if let Some(bb) = ind.bollinger {
                if bb.upper > stop {
                    stop = bb.upper;
                }
            }
            (price, stop, price - TARGET_ATR_MULT * atr)
        }
        Direction::Neutral => (price, price, price),
    }
}
