/// metrics.rs — Paper portfolio performance in R units
///
/// ─────────────────────────────────────────────────────────────────────────
/// MATHEMATICAL SPECIFICATION
/// ─────────────────────────────────────────────────────────────────────────
///
/// EQUITY CURVE (closed trades, ordered by exit time)
///   E_0 = 0
///   E_k = Σ_{i ≤ k} pnl_R(i)
///
/// MAXIMUM DRAWDOWN (R, absolute; equity starts at zero so a relative
/// drawdown is undefined)
///   peak_k = max_{j ≤ k}(E_j)
///   MaxDD  = min_k(E_k − peak_k)          (≤ 0)
///
/// WIN RATE & AVERAGE TRADE
///   P_win   = count(pnl_R > 0) / N_closed
///   AvgWin  = mean(pnl_R | pnl_R > 0)
///   AvgLoss = mean(|pnl_R| | pnl_R ≤ 0)
///   Profit Factor = Σ wins / Σ |losses|
/// ─────────────────────────────────────────────────────────────────────────
use crate::paper::{PaperPosition, PositionStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioStats {
    pub open_positions:   usize,
    pub closed_positions: usize,
    pub win_rate:         f64,
    pub avg_win_r:        f64,
    pub avg_loss_r:       f64,
    pub profit_factor:    f64,
    pub total_pnl_r:      f64,
    pub unrealized_r:     f64,
    pub max_drawdown_r:   f64,
}

impl std::fmt::Display for PortfolioStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "════════════════════════════════════════════")?;
        writeln!(f, "  SIGNAL ENGINE — PAPER PORTFOLIO REPORT")?;
        writeln!(f, "════════════════════════════════════════════")?;
        writeln!(f, "  Open Positions : {}", self.open_positions)?;
        writeln!(f, "  Closed Trades  : {}", self.closed_positions)?;
        writeln!(f, "  Win Rate       : {:.2}%", self.win_rate * 100.0)?;
        writeln!(f, "  Avg Win        : {:.2}R", self.avg_win_r)?;
        writeln!(f, "  Avg Loss       : {:.2}R", self.avg_loss_r)?;
        writeln!(f, "  Profit Factor  : {:.3}", self.profit_factor)?;
        writeln!(f, "  Realised P&L   : {:+.2}R", self.total_pnl_r)?;
        writeln!(f, "  Unrealised P&L : {:+.2}R", self.unrealized_r)?;
        writeln!(f, "  Max Drawdown   : {:.2}R", self.max_drawdown_r)?;
        writeln!(f, "════════════════════════════════════════════")
    }
}

/// Aggregate open and closed positions. `closed` is expected in exit order;
/// open entries in it are ignored.
pub fn portfolio_stats(open: &[PaperPosition], closed: &[PaperPosition]) -> PortfolioStats {
    let returns: Vec<f64> = closed
        .iter()
        .filter(|p| p.status == PositionStatus::Closed)
        .map(|p| p.pnl_r)
        .collect();
    let unrealized_r = open.iter().map(|p| p.unrealized_r).sum();
    let n = returns.len();
    if n == 0 {
        return PortfolioStats {
            open_positions: open.len(),
            closed_positions: 0,
            win_rate: 0.0,
            avg_win_r: 0.0,
            avg_loss_r: 0.0,
            profit_factor: 0.0,
            total_pnl_r: 0.0,
            unrealized_r,
            max_drawdown_r: 0.0,
        };
    }

    let winners: Vec<f64> = returns.iter().filter(|&&r| r > 0.0).cloned().collect();
    let losers:  Vec<f64> = returns.iter().filter(|&&r| r <= 0.0).map(|r| r.abs()).collect();

    let gross_win:  f64 = winners.iter().sum();
    let gross_loss: f64 = losers.iter().sum();
    let profit_factor = if gross_loss < 1e-10 {
        f64::INFINITY
    } else {
        gross_win / gross_loss
    };

    let mut equity = Vec::with_capacity(n + 1);
    equity.push(0.0);
    for r in &returns {
        let last = equity.last().copied().unwrap_or(0.0);
        equity.push(last + r);
    }

    PortfolioStats {
        open_positions: open.len(),
        closed_positions: n,
        win_rate: winners.len() as f64 / n as f64,
        avg_win_r: mean(&winners).unwrap_or(0.0),
        avg_loss_r: mean(&losers).unwrap_or(0.0),
        profit_factor,
        total_pnl_r: returns.iter().sum(),
        unrealized_r,
        max_drawdown_r: max_drawdown_r(&equity),
    }
}

/// Largest peak-to-trough fall of an R equity curve, as a non-positive
/// number (e.g. −2.5 = gave back 2.5R from a high).
pub fn max_drawdown_r(equity_curve: &[f64]) -> f64 {
    let Some(&first) = equity_curve.first() else {
        return 0.0;
    };
    let mut peak = first;
    let mut max_dd = 0.0f64;
    for &e in equity_curve {
        peak = peak.max(e);
        max_dd = max_dd.min(e - peak);
    }
    max_dd
}

fn mean(data: &[f64]) -> Option<f64> {
    if data.is_empty() {
        return None;
    }
    Some(data.iter().sum::<f64>() / data.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, Signal, Timeframe};
    use crate::paper::{ExitReason, PaperLedger};
    use chrono::{Duration, TimeZone, Utc};
    use uuid::Uuid;

    #[test]
    fn max_drawdown_flat() {
        assert_eq!(max_drawdown_r(&[0.0, 0.0, 0.0]), 0.0);
        assert_eq!(max_drawdown_r(&[]), 0.0);
    }

    #[test]
    fn max_drawdown_from_peak() {
        // peak 3R, trough 0.5R → −2.5R
        let dd = max_drawdown_r(&[0.0, 2.0, 3.0, 1.0, 0.5, 2.0]);
        assert!((dd + 2.5).abs() < 1e-9, "dd = {dd}");
    }

    #[test]
    fn stats_over_closed_trades() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        let mut ledger = PaperLedger::new(10, 0.0);
        let mut closed = Vec::new();
        // +2R, −1R, +2R
        for (i, (sym, exit)) in [("AUSDT", 104.0), ("BUSDT", 98.0), ("CUSDT", 104.0)].iter().enumerate() {
            let s = Signal {
                id:          Uuid::new_v4(),
                symbol:      sym.to_string(),
                timeframe:   Timeframe::M15,
                direction:   Direction::Long,
                score:       8.0,
                confidence:  0.7,
                entry_price: 100.0,
                stop_loss:   98.0,
                take_profit: 104.0,
                reasons:     vec![],
                regime:      String::new(),
                candle_ts:   0,
                created_at:  t0,
                metadata:    serde_json::Value::Null,
            };
            ledger.open(&s, t0).unwrap();
            let at = t0 + Duration::hours(i as i64 + 1);
            closed.push(ledger.close(sym, *exit, ExitReason::Manual, at).unwrap());
        }

        let stats = portfolio_stats(&[], &closed);
        assert_eq!(stats.closed_positions, 3);
        assert!((stats.win_rate - 2.0 / 3.0).abs() < 1e-12);
        assert!((stats.total_pnl_r - 3.0).abs() < 1e-9);
        assert!((stats.profit_factor - 4.0).abs() < 1e-9);
        assert!((stats.max_drawdown_r + 1.0).abs() < 1e-9);
        assert!(stats.to_string().contains("Realised P&L   : +3.00R"));
    }
}
