//! Outbound notifications for approved signals, anomaly warnings and the
//! daily summary.
//!
//! Delivery channels (chat bots, webhooks) live outside this crate; they
//! implement [`Notifier`]. A `false` return means the message was not
//! delivered and is only logged by callers.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::models::{Severity, Signal, Warning};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_signal(&self, signal: &Signal) -> bool;
    async fn send_warning(&self, warning: &Warning) -> bool;
    async fn send_report(&self, text: &str) -> bool;
}

/// Render a signal as a multi-line alert.
pub fn format_signal(signal: &Signal) -> String {
    let risk = (signal.entry_price - signal.stop_loss).abs();
    let reward = (signal.take_profit - signal.entry_price).abs();
    let rr = if risk > 0.0 { reward / risk } else { 0.0 };
    let mut out = format!(
        "{} {} [{}] score {:.1}/10 conf {:.0}%\n  regime  {}\n  entry   {:.6}\n  stop    {:.6}\n  target  {:.6}  (R:R {:.2})",
        signal.direction,
        signal.symbol,
        signal.timeframe,
        signal.score,
        signal.confidence * 100.0,
        signal.regime,
        signal.entry_price,
        signal.stop_loss,
        signal.take_profit,
        rr,
    );
    for reason in &signal.reasons {
        out.push_str("\n  - ");
        out.push_str(reason);
    }
    out
}

pub fn format_warning(warning: &Warning) -> String {
    let subject = warning.symbol.as_deref().unwrap_or("MARKET");
    format!(
        "[{}] {} {}: {} (value {:.4}, threshold {:.4}, action {})",
        warning.severity.as_str(),
        warning.kind.as_str(),
        subject,
        warning.message,
        warning.triggered_value,
        warning.threshold,
        warning.action_taken.as_str(),
    )
}

/// Writes notifications to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_signal(&self, signal: &Signal) -> bool {
        info!(symbol = %signal.symbol, "\n{}", format_signal(signal));
        true
    }

    async fn send_warning(&self, warning: &Warning) -> bool {
        match warning.severity {
            Severity::Critical | Severity::Warning => warn!("{}", format_warning(warning)),
            Severity::Info => info!("{}", format_warning(warning)),
        }
        true
    }

    async fn send_report(&self, text: &str) -> bool {
        info!("\n{text}");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionTaken, Direction, Timeframe, WarningKind};
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn signal_message_carries_levels_and_reasons() {
        let s = Signal {
            id:          Uuid::new_v4(),
            symbol:      "ETHUSDT".into(),
            timeframe:   Timeframe::M15,
            direction:   Direction::Short,
            score:       7.5,
            confidence:  0.72,
            entry_price: 2000.0,
            stop_loss:   2030.0,
            take_profit: 1940.0,
            reasons:     vec!["Bearish EMA alignment".into()],
            regime:      "BEARISH_NORMAL_BEARISH".into(),
            candle_ts:   0,
            created_at:  Utc::now(),
            metadata:    serde_json::Value::Null,
        };
        let msg = format_signal(&s);
        assert!(msg.starts_with("SHORT ETHUSDT [15m] score 7.5/10 conf 72%"));
        assert!(msg.contains("R:R 2.00"));
        assert!(msg.ends_with("- Bearish EMA alignment"));
    }

    #[test]
    fn warning_message_names_market_when_symbolless() {
        let w = Warning {
            severity:        Severity::Critical,
            kind:            WarningKind::ReferenceShock,
            symbol:          None,
            message:         "BTCUSDT price down by 9.00% in 1 hour".into(),
            triggered_value: 0.09,
            threshold:       0.08,
            action_taken:    ActionTaken::PausedSignals,
            created_at:      Utc::now(),
            metadata:        serde_json::Value::Null,
        };
        let msg = format_warning(&w);
        assert!(msg.starts_with("[CRITICAL] REFERENCE_SHOCK MARKET:"));
        assert!(msg.ends_with("action PAUSED_SIGNALS)"));
    }
}
