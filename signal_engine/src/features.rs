//! Typed per-timeframe indicator snapshot.
//!
//! Serialized field names are the persisted key layout (`ema.20`,
//! `atr_percent.14`, `rsi.value`, `bollinger.position`, ...) that stored
//! signals and downstream readers rely on; they stay fixed even when the
//! configured periods change.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ScanResult;
use crate::indicators::{self, Bollinger, Macd};
use crate::models::Ohlcv;

/// Indicator periods, shared by every timeframe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndicatorParams {
    pub rsi_period:    usize,
    pub atr_period:    usize,
    pub adx_period:    usize,
    pub volume_period: usize,
    pub bb_period:     usize,
    pub bb_std:        f64,
    pub macd_fast:     usize,
    pub macd_slow:     usize,
    pub macd_signal:   usize,
}

impl Default for IndicatorParams {
    fn default() -> Self {
        Self {
            rsi_period:    14,
            atr_period:    14,
            adx_period:    14,
            volume_period: 20,
            bb_period:     20,
            bb_std:        2.0,
            macd_fast:     12,
            macd_slow:     26,
            macd_signal:   9,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EmaValues {
    #[serde(rename = "20", default, skip_serializing_if = "Option::is_none")]
    pub ema_20:  Option<f64>,
    #[serde(rename = "50", default, skip_serializing_if = "Option::is_none")]
    pub ema_50:  Option<f64>,
    #[serde(rename = "200", default, skip_serializing_if = "Option::is_none")]
    pub ema_200: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RsiValue {
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Period14 {
    #[serde(rename = "14")]
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Period20 {
    #[serde(rename = "20")]
    pub value: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSet {
    #[serde(default)]
    pub ema: EmaValues,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsi: Option<RsiValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atr: Option<Period14>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atr_percent: Option<Period14>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub macd: Option<Macd>,
    #[serde(default, alias = "bollinger_bands", skip_serializing_if = "Option::is_none")]
    pub bollinger: Option<Bollinger>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adx: Option<Period14>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_zscore: Option<Period20>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vwap: Option<f64>,
}

fn keep<T>(name: &str, result: ScanResult<T>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            debug!(indicator = name, error = %e, "indicator skipped");
            None
        }
    }
}

impl IndicatorSet {
    /// Compute every indicator the window supports. Indicators whose minimum
    /// length is not met are left absent rather than failing the whole set.
    pub fn compute(data: &Ohlcv, p: &IndicatorParams) -> Self {
        let closes = &data.closes;
        let highs = &data.highs;
        let lows = &data.lows;
        let volumes = &data.volumes;

        IndicatorSet {
            ema: EmaValues {
                ema_20:  keep("ema.20", indicators::ema(closes, 20)),
                ema_50:  keep("ema.50", indicators::ema(closes, 50)),
                ema_200: keep("ema.200", indicators::ema(closes, 200)),
            },
            rsi: keep("rsi", indicators::rsi(closes, p.rsi_period)).map(|value| RsiValue { value }),
            atr: keep("atr", indicators::atr(highs, lows, closes, p.atr_period))
                .map(|value| Period14 { value }),
            atr_percent: keep(
                "atr_percent",
                indicators::atr_percent(highs, lows, closes, p.atr_period),
            )
            .map(|value| Period14 { value }),
            macd: keep(
                "macd",
                indicators::macd(closes, p.macd_fast, p.macd_slow, p.macd_signal),
            ),
            bollinger: keep(
                "bollinger",
                indicators::bollinger_bands(closes, p.bb_period, p.bb_std),
            ),
            adx: keep("adx", indicators::adx(highs, lows, p.adx_period))
                .map(|value| Period14 { value }),
            volume_zscore: keep(
                "volume_zscore",
                indicators::volume_zscore(volumes, p.volume_period),
            )
            .map(|value| Period20 { value }),
            vwap: keep("vwap", indicators::vwap(highs, lows, closes, volumes)),
        }
    }

    pub fn rsi(&self) -> Option<f64> {
        self.rsi.map(|r| r.value)
    }

    pub fn atr(&self) -> Option<f64> {
        self.atr.map(|a| a.value)
    }

    pub fn atr_percent(&self) -> Option<f64> {
        self.atr_percent.map(|a| a.value)
    }

    pub fn adx(&self) -> Option<f64> {
        self.adx.map(|a| a.value)
    }

    pub fn volume_zscore(&self) -> Option<f64> {
        self.volume_zscore.map(|v| v.value)
    }

    pub fn macd_histogram(&self) -> Option<f64> {
        self.macd.map(|m| m.histogram)
    }

    pub fn is_empty(&self) -> bool {
        *self == IndicatorSet::default()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
