//! Settled-bet statistics: ROI, Brier, calibration buckets, edge bands,
//! t-test significance, drawdown and streaks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};

use crate::backtest::SignificanceConfig;
use crate::pricing::calibration::brier_score;
use crate::store::models::{Market, Phase};

/// A recommendation replayed as placed and settled against the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BetRecord {
    pub fixture_id: String,
    pub player_id: String,
    pub market: Market,
    pub phase: Phase,
    pub kickoff: DateTime<Utc>,
    pub decided_at: DateTime<Utc>,
    pub bookmaker: String,
    pub odds: f64,
    pub model_probability: f64,
    pub edge: f64,
    pub stake: f64,
    pub won: bool,
    pub pnl: f64,
    pub closing_odds: Option<f64>,
    /// `odds / closing_odds − 1`
    pub clv: Option<f64>,
}

impl BetRecord {
    pub fn settle(stake: f64, odds: f64, won: bool) -> f64 {
        if won {
            stake * (odds - 1.0)
        } else {
            -stake
        }
    }

    /// Per-unit-staked return
    pub fn ret(&self) -> f64 {
        if self.stake > 0.0 {
            self.pnl / self.stake
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BetStats {
    pub total_bets: usize,
    pub wins: usize,
    pub total_staked: f64,
    pub profit: f64,
    pub roi: f64,
    pub win_rate: f64,
    pub avg_odds: f64,
    pub avg_edge: f64,
    pub avg_clv: Option<f64>,
    /// Over every priced selection in the test windows, not only bets
    pub brier: Option<f64>,
    pub predictions: usize,
}

fn mean(xs: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = xs.fold((0.0, 0usize), |(s, n), x| (s + x, n + 1));
    (n > 0).then(|| sum / n as f64)
}

pub fn summarize(bets: &[BetRecord], predictions: &[(f64, f64)]) -> BetStats {
    let total_staked: f64 = bets.iter().map(|b| b.stake).sum();
    let profit: f64 = bets.iter().map(|b| b.pnl).sum();
    let wins = bets.iter().filter(|b| b.won).count();
    BetStats {
        total_bets: bets.len(),
        wins,
        total_staked,
        profit,
        roi: if total_staked > 0.0 { profit / total_staked } else { 0.0 },
        win_rate: if bets.is_empty() { 0.0 } else { wins as f64 / bets.len() as f64 },
        avg_odds: mean(bets.iter().map(|b| b.odds)).unwrap_or(0.0),
        avg_edge: mean(bets.iter().map(|b| b.edge)).unwrap_or(0.0),
        avg_clv: mean(bets.iter().filter_map(|b| b.clv)),
        brier: (!predictions.is_empty()).then(|| brier_score(predictions)),
        predictions: predictions.len(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Significance {
    pub n: usize,
    pub mean_return: f64,
    pub std_dev: f64,
    pub t_score: f64,
    /// Two-sided, Student-t with n − 1 degrees of freedom
    pub p_value: f64,
    pub min_sample_met: bool,
    pub calibration_ok: bool,
    pub significant: bool,
}

/// `t = mean(r) × √N / σ(r)` over per-bet returns.
pub fn t_test(returns: &[f64], brier: Option<f64>, cfg: &SignificanceConfig) -> Significance {
    let n = returns.len();
    let calibration_ok = brier.is_some_and(|b| b < cfg.brier_ceiling);
    let min_sample_met = n > cfg.min_sample;
    if n < 2 {
        return Significance {
            n,
            mean_return: mean(returns.iter().copied()).unwrap_or(0.0),
            p_value: 1.0,
            min_sample_met,
            calibration_ok,
            ..Default::default()
        };
    }
    let m = returns.iter().sum::<f64>() / n as f64;
    let var = returns.iter().map(|r| (r - m).powi(2)).sum::<f64>() / (n - 1) as f64;
    let sd = var.sqrt();
    let (t, p) = if sd > f64::EPSILON {
        let t = m * (n as f64).sqrt() / sd;
        let p = match StudentsT::new(0.0, 1.0, (n - 1) as f64) {
            Ok(dist) => 2.0 * (1.0 - dist.cdf(t.abs())),
            Err(_) => 1.0,
        };
        (t, p.clamp(0.0, 1.0))
    } else {
        (0.0, 1.0)
    };
    Significance {
        n,
        mean_return: m,
        std_dev: sd,
        t_score: t,
        p_value: p,
        min_sample_met,
        calibration_ok,
        significant: min_sample_met && calibration_ok && p < cfg.p_threshold && m > 0.0,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskMetrics {
    /// Peak-to-trough fall in cumulative profit, in stake units
    pub max_drawdown: f64,
    pub max_losing_streak: usize,
    pub max_winning_streak: usize,
}

/// Bets must already be in settlement order.
pub fn risk(bets: &[BetRecord]) -> RiskMetrics {
    let mut equity = 0.0;
    let mut peak = 0.0_f64;
    let mut out = RiskMetrics::default();
    let (mut losing, mut winning) = (0, 0);
    for b in bets {
        equity += b.pnl;
        peak = peak.max(equity);
        out.max_drawdown = out.max_drawdown.max(peak - equity);
        if b.won {
            winning += 1;
            losing = 0;
        } else {
            losing += 1;
            winning = 0;
        }
        out.max_losing_streak = out.max_losing_streak.max(losing);
        out.max_winning_streak = out.max_winning_streak.max(winning);
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBucket {
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
    pub mean_predicted: Option<f64>,
    pub observed_rate: Option<f64>,
}

/// Ten equal-width reliability buckets over `(predicted, outcome)` pairs.
pub fn calibration_buckets(samples: &[(f64, f64)]) -> Vec<CalibrationBucket> {
    const BUCKETS: usize = 10;
    let mut sums = [(0usize, 0.0, 0.0); BUCKETS];
    for (p, y) in samples {
        let i = ((p * BUCKETS as f64) as usize).min(BUCKETS - 1);
        sums[i].0 += 1;
        sums[i].1 += p;
        sums[i].2 += y;
    }
    sums.iter()
        .enumerate()
        .map(|(i, (n, sp, sy))| CalibrationBucket {
            lower: i as f64 / BUCKETS as f64,
            upper: (i + 1) as f64 / BUCKETS as f64,
            count: *n,
            mean_predicted: (*n > 0).then(|| sp / *n as f64),
            observed_rate: (*n > 0).then(|| sy / *n as f64),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeBand {
    pub label: String,
    pub lower: f64,
    pub upper: Option<f64>,
    pub bets: usize,
    pub profit: f64,
    pub roi: f64,
}

const EDGE_BANDS: [(&str, f64, Option<f64>); 5] = [
    ("<5%", f64::NEG_INFINITY, Some(0.05)),
    ("5-10%", 0.05, Some(0.10)),
    ("10-15%", 0.10, Some(0.15)),
    ("15-20%", 0.15, Some(0.20)),
    ("20%+", 0.20, None),
];

pub fn edge_bands(bets: &[BetRecord]) -> Vec<EdgeBand> {
    EDGE_BANDS
        .iter()
        .map(|(label, lower, upper)| {
            let inside: Vec<&BetRecord> = bets
                .iter()
                .filter(|b| b.edge >= *lower && upper.map_or(true, |u| b.edge < u))
                .collect();
            let staked: f64 = inside.iter().map(|b| b.stake).sum();
            let profit: f64 = inside.iter().map(|b| b.pnl).sum();
            EdgeBand {
                label: label.to_string(),
                lower: lower.max(0.0),
                upper: *upper,
                bets: inside.len(),
                profit,
                roi: if staked > 0.0 { profit / staked } else { 0.0 },
            }
        })
        .collect()
}
