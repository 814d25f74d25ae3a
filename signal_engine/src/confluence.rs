//! Multi-timeframe confluence gate.
//!
//! A LONG needs the intermediate timeframe to lean bullish (EMA20 > EMA50
//! or a positive MACD histogram); when the macro timeframe is in a
//! downtrend (EMA50 < EMA200) it passes with a caution penalty. SHORT is
//! the mirror image. Missing higher-timeframe values count as "condition
//! not met".

use serde::{Deserialize, Serialize};

use crate::features::IndicatorSet;
use crate::models::Direction;

pub const BLOCK_PENALTY: f64 = -3.0;
pub const CAUTION_PENALTY: f64 = -1.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfluenceDecision {
    pub aligned:       bool,
    pub reason:        String,
    pub score_penalty: f64,
}

impl ConfluenceDecision {
    fn aligned(reason: impl Into<String>, score_penalty: f64) -> Self {
        Self { aligned: true, reason: reason.into(), score_penalty }
    }

    fn blocked(reason: impl Into<String>) -> Self {
        Self { aligned: false, reason: reason.into(), score_penalty: BLOCK_PENALTY }
    }
}

fn gt(a: Option<f64>, b: Option<f64>) -> bool {
    matches!((a, b), (Some(a), Some(b)) if a > b)
}

fn lt(a: Option<f64>, b: Option<f64>) -> bool {
    matches!((a, b), (Some(a), Some(b)) if a < b)
}

fn intermediate_bullish(ind: &IndicatorSet) -> bool {
    gt(ind.ema.ema_20, ind.ema.ema_50) || ind.macd_histogram().is_some_and(|h| h > 0.0)
}

fn intermediate_bearish(ind: &IndicatorSet) -> bool {
    lt(ind.ema.ema_20, ind.ema.ema_50) || ind.macd_histogram().is_some_and(|h| h < 0.0)
}

/// Check `direction` against the intermediate and macro timeframes.
pub fn check_confluence(
    direction: Direction,
    intermediate: &IndicatorSet,
    macro_tf: &IndicatorSet,
) -> ConfluenceDecision {
    match direction {
        Direction::Neutral => ConfluenceDecision::aligned("neutral signal", 0.0),
        Direction::Long => {
            if !intermediate_bullish(intermediate) {
                ConfluenceDecision::blocked("intermediate timeframe not bullish")
            } else if lt(macro_tf.ema.ema_50, macro_tf.ema.ema_200) {
                ConfluenceDecision::aligned("macro caution: higher timeframe downtrend", CAUTION_PENALTY)
            } else {
                ConfluenceDecision::aligned("timeframes aligned bullish", 0.0)
            }
        }
        Direction::Short => {
            if !intermediate_bearish(intermediate) {
                ConfluenceDecision::blocked("intermediate timeframe not bearish")
            } else if gt(macro_tf.ema.ema_50, macro_tf.ema.ema_200) {
                ConfluenceDecision::aligned("macro caution: higher timeframe uptrend", CAUTION_PENALTY)
            } else {
                ConfluenceDecision::aligned("timeframes aligned bearish", 0.0)
            }
        }
    }
}

/// Base score plus the confluence penalty.
pub fn adjusted_score(base_score: f64, decision: &ConfluenceDecision) -> f64 {
    base_score + decision.score_penalty
}

/// Final score if the penalised signal still clears `min_score`.
pub fn apply(base_score: f64, decision: &ConfluenceDecision, min_score: f64) -> Option<f64> {
    let score = adjusted_score(base_score, decision);
    (score >= min_score).then_some(score)
}
