//! Standardized backtest report and failure analysis.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::backtest::metrics::{
    calibration_buckets, edge_bands, risk, summarize, t_test, BetRecord, BetStats, CalibrationBucket,
    EdgeBand, RiskMetrics, Significance,
};
use crate::backtest::BacktestConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureAnalysis {
    /// Worst settled bets by loss, largest first
    pub largest_losses: Vec<BetRecord>,
    /// Losing bets taken at or above the high-edge threshold: candidates for
    /// information the model did not have
    pub high_edge_losses: Vec<BetRecord>,
    pub high_edge_threshold: f64,
    pub max_drawdown: f64,
    pub max_losing_streak: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSummary {
    pub index: usize,
    pub train_start: DateTime<Utc>,
    pub test_start: DateTime<Utc>,
    pub test_end: DateTime<Utc>,
    pub fixtures: usize,
    /// Settled (prediction, outcome) pairs available for calibration
    pub train_samples: BTreeMap<String, usize>,
    /// Calibration method fitted per market, absent when none was
    pub calibration: BTreeMap<String, String>,
    pub bets: usize,
    pub profit: f64,
}

/// The single output record of a backtest run. Contains no wall-clock
/// fields, so identical inputs serialize to identical bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestReport {
    pub run_id: Uuid,
    pub config: BacktestConfig,
    pub stats: BetStats,
    pub significance: Significance,
    pub risk: RiskMetrics,
    pub calibration: Vec<CalibrationBucket>,
    pub edge_bands: Vec<EdgeBand>,
    /// Decisions replayed, by status / rejection reason
    pub decisions: BTreeMap<String, usize>,
    pub failure_analysis: FailureAnalysis,
    pub windows: Vec<WindowSummary>,
}

impl BacktestReport {
    /// Assemble the report from merged, settlement-ordered bets.
    pub fn build(
        run_id: Uuid,
        config: BacktestConfig,
        bets: Vec<BetRecord>,
        predictions: Vec<(f64, f64)>,
        decisions: BTreeMap<String, usize>,
        windows: Vec<WindowSummary>,
    ) -> Self {
        let stats = summarize(&bets, &predictions);
        let returns: Vec<f64> = bets.iter().map(BetRecord::ret).collect();
        let significance = t_test(&returns, stats.brier, &config.significance);
        let risk = risk(&bets);

        let mut losses: Vec<BetRecord> = bets.iter().filter(|b| b.pnl < 0.0).cloned().collect();
        losses.sort_by(|a, b| a.pnl.total_cmp(&b.pnl));
        let high_edge_losses = losses
            .iter()
            .filter(|b| b.edge >= config.high_edge_threshold)
            .cloned()
            .collect();
        losses.truncate(config.largest_losses);

        BacktestReport {
            run_id,
            stats,
            significance,
            calibration: calibration_buckets(&predictions),
            edge_bands: edge_bands(&bets),
            decisions,
            failure_analysis: FailureAnalysis {
                largest_losses: losses,
                high_edge_losses,
                high_edge_threshold: config.high_edge_threshold,
                max_drawdown: risk.max_drawdown,
                max_losing_streak: risk.max_losing_streak,
            },
            risk,
            windows,
            config,
        }
    }
}
