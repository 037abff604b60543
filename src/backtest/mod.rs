//! Walk-forward backtest: replays pricing and decisions at historical
//! instants, fits calibration on strictly earlier outcomes, settles the
//! recommendations and reports.
//!
//! Fixtures are replayed in parallel, then every window is evaluated in
//! parallel; results are merged in window order and sorted by kickoff,
//! fixture and player, so identical input produces a byte-identical report.

pub mod metrics;
pub mod report;
pub mod walk_forward;

use chrono::{DateTime, Duration, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::decision::exposure::ExposureBook;
use crate::decision::{decide, DecisionIds, DecisionInput};
use crate::error::{PricingError, Result};
use crate::pricing::calibration::{self, CalibrationMethod, CalibrationModel};
use crate::pricing::odds::Books;
use crate::pricing::scenario::FixturePhase;
use crate::pricing::{apply_calibration, normalize_books, price_fixture, PricingRequest, MARKETS};
use crate::store::models::{
    DecisionStatus, FixtureContext, FixtureId, Market, ModelOutput, Phase, PlayerResult,
};
use crate::store::SnapshotSource;
use metrics::BetRecord;
use report::{BacktestReport, WindowSummary};
use walk_forward::{expanding_splits, LeakageGuard, Split};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariant {
    /// Uncalibrated mixture probabilities
    Raw,
    /// Per-window calibration fitted on the train set
    #[default]
    Calibrated,
}

/// Which price a taken bet is compared against for closing-line value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "proxy", rename_all = "snake_case")]
pub enum ClvProxy {
    /// Last snapshot at or before kickoff
    Conservative,
    /// Snapshot nearest a fixed pre-kickoff offset
    Realistic { hours_before_kickoff: f64 },
}

impl Default for ClvProxy {
    fn default() -> Self {
        ClvProxy::Realistic {
            hours_before_kickoff: 12.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignificanceConfig {
    /// Bets required, strictly exceeded
    pub min_sample: usize,
    pub p_threshold: f64,
    pub brier_ceiling: f64,
}

impl Default for SignificanceConfig {
    fn default() -> Self {
        SignificanceConfig {
            min_sample: 500,
            p_threshold: 0.05,
            brier_ceiling: 0.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub engine: EngineConfig,
    /// Horizon by kickoff; the dataset's span when unset
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub initial_train_days: i64,
    pub test_days: i64,
    pub phases: Vec<Phase>,
    pub variant: ModelVariant,
    pub clv: ClvProxy,
    /// EARLY decisions are replayed this long before kickoff
    pub early_lead_hours: f64,
    /// LINEUP decisions are replayed this long before kickoff
    pub lineup_lead_minutes: f64,
    /// Results become known this long after kickoff
    pub settlement_delay_hours: f64,
    pub significance: SignificanceConfig,
    pub high_edge_threshold: f64,
    pub largest_losses: usize,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        BacktestConfig {
            engine: EngineConfig::default(),
            start: None,
            end: None,
            initial_train_days: 90,
            test_days: 28,
            phases: vec![Phase::Early, Phase::Lineup],
            variant: ModelVariant::Calibrated,
            clv: ClvProxy::default(),
            early_lead_hours: 24.0,
            lineup_lead_minutes: 45.0,
            settlement_delay_hours: 3.0,
            significance: SignificanceConfig::default(),
            high_edge_threshold: 0.15,
            largest_losses: 10,
        }
    }
}

fn hours(h: f64) -> Duration {
    Duration::seconds((h * 3600.0).round() as i64)
}

impl BacktestConfig {
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        if self.test_days <= 0 || self.initial_train_days < 0 {
            return Err(PricingError::InvalidConfig(
                "test_days must be positive and initial_train_days non-negative".into(),
            ));
        }
        if self.phases.is_empty() {
            return Err(PricingError::InvalidConfig("no phases to replay".into()));
        }
        if self.early_lead_hours < 0.0 || self.lineup_lead_minutes < 0.0 || self.settlement_delay_hours < 0.0 {
            return Err(PricingError::InvalidConfig(
                "decision leads and settlement delay must be non-negative".into(),
            ));
        }
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start >= end {
                return Err(PricingError::InvalidConfig("backtest start must precede end".into()));
            }
        }
        Ok(())
    }

    pub fn decision_lead(&self, phase: Phase) -> Duration {
        match phase {
            Phase::Early => hours(self.early_lead_hours),
            Phase::Lineup => Duration::seconds((self.lineup_lead_minutes * 60.0).round() as i64),
        }
    }

    fn max_decision_lead(&self) -> Duration {
        self.phases
            .iter()
            .map(|p| self.decision_lead(*p))
            .max()
            .unwrap_or_else(Duration::zero)
    }
}

/// Pricing state at one historical decision instant.
#[derive(Debug, Clone)]
struct Replay {
    fixture: FixtureContext,
    decision_at: DateTime<Utc>,
    phase: Phase,
    outputs: Vec<ModelOutput>,
    books: Books,
}

struct WindowOutcome {
    summary: WindowSummary,
    bets: Vec<BetRecord>,
    predictions: Vec<(f64, f64)>,
    decisions: BTreeMap<String, usize>,
}

pub struct BacktestEngine<'a, S: SnapshotSource + ?Sized> {
    source: &'a S,
    config: &'a BacktestConfig,
}

impl<'a, S: SnapshotSource + ?Sized> BacktestEngine<'a, S> {
    pub fn new(source: &'a S, config: &'a BacktestConfig) -> Self {
        BacktestEngine { source, config }
    }

    /// Run the whole walk-forward evaluation. Any leakage aborts the run.
    pub fn run(&self) -> Result<BacktestReport> {
        let cfg = self.config;
        cfg.validate()?;

        let fixtures = self.source.fixtures_between(
            cfg.start.unwrap_or(DateTime::<Utc>::MIN_UTC),
            cfg.end.unwrap_or(DateTime::<Utc>::MAX_UTC),
        );
        let (Some(first), Some(last)) = (fixtures.first(), fixtures.last()) else {
            return Err(PricingError::InvalidConfig("no fixtures in the backtest horizon".into()));
        };
        let start = cfg.start.unwrap_or(first.kickoff);
        let end = cfg.end.unwrap_or(last.kickoff + Duration::seconds(1));
        let splits = expanding_splits(
            start,
            end,
            Duration::days(cfg.initial_train_days),
            Duration::days(cfg.test_days),
        )?;
        let run_id = run_id(cfg, &fixtures)?;
        info!(
            run_id = %run_id,
            fixtures = fixtures.len(),
            windows = splits.len(),
            "Starting walk-forward backtest"
        );

        let replays: Vec<Replay> = fixtures
            .par_iter()
            .map(|f| self.replay_fixture(f))
            .collect::<Result<Vec<Vec<Replay>>>>()?
            .into_iter()
            .flatten()
            .collect();
        let results: BTreeMap<FixtureId, Vec<PlayerResult>> = fixtures
            .iter()
            .map(|f| (f.fixture_id.clone(), self.source.results(&f.fixture_id)))
            .filter(|(_, r)| !r.is_empty())
            .collect();

        let outcomes = splits
            .par_iter()
            .map(|split| self.evaluate_window(split, &replays, &results, run_id))
            .collect::<Result<Vec<WindowOutcome>>>()?;

        let mut bets = Vec::new();
        let mut predictions = Vec::new();
        let mut decisions: BTreeMap<String, usize> = BTreeMap::new();
        let mut windows = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            bets.extend(outcome.bets);
            predictions.extend(outcome.predictions);
            for (k, n) in outcome.decisions {
                *decisions.entry(k).or_default() += n;
            }
            windows.push(outcome.summary);
        }
        bets.sort_by(|a, b| {
            (a.kickoff, &a.fixture_id, &a.player_id, a.market, a.phase)
                .cmp(&(b.kickoff, &b.fixture_id, &b.player_id, b.market, b.phase))
        });

        let report = BacktestReport::build(run_id, cfg.clone(), bets, predictions, decisions, windows);
        info!(
            run_id = %run_id,
            bets = report.stats.total_bets,
            roi = report.stats.roi,
            t = report.significance.t_score,
            p = report.significance.p_value,
            significant = report.significance.significant,
            "Backtest complete"
        );
        Ok(report)
    }

    /// Price a fixture at each configured phase's decision instant.
    fn replay_fixture(&self, fixture: &FixtureContext) -> Result<Vec<Replay>> {
        let cfg = self.config;
        let mut phases = cfg.phases.clone();
        phases.sort();
        phases.dedup();

        let no_override = BTreeMap::new();
        let mut out = Vec::with_capacity(phases.len());
        for phase in phases {
            let at = fixture.kickoff - cfg.decision_lead(phase);
            let guard = LeakageGuard::new(at);
            let state = match phase {
                Phase::Early => FixturePhase::Early,
                Phase::Lineup => match self.source.lineup(&fixture.fixture_id, at) {
                    Some(lineup) => {
                        guard.check("lineup", lineup.confirmed_at)?;
                        FixturePhase::Lineup { lineup }
                    }
                    None => continue,
                },
            };

            let priced = price_fixture(
                self.source,
                PricingRequest {
                    fixture,
                    phase: &state,
                    team_xg: &no_override,
                    calibration: None,
                    at,
                },
                &cfg.engine,
            );
            for o in &priced.outputs {
                guard.check("feature_snapshot", o.feature_as_of)?;
            }

            let mut snapshots = Vec::new();
            for market in MARKETS {
                snapshots.extend(self.source.odds_snapshots(&fixture.fixture_id, market, at));
            }
            for s in &snapshots {
                guard.check("odds_snapshot", s.ingested_at)?;
            }

            out.push(Replay {
                fixture: fixture.clone(),
                decision_at: at,
                phase,
                outputs: priced.outputs,
                books: normalize_books(&snapshots, &cfg.engine.odds),
            });
        }
        Ok(out)
    }

    fn evaluate_window(
        &self,
        split: &Split,
        replays: &[Replay],
        results: &BTreeMap<FixtureId, Vec<PlayerResult>>,
        run_id: Uuid,
    ) -> Result<WindowOutcome> {
        let cfg = self.config;
        let lead = cfg.max_decision_lead();
        let cutoff = split.train_cutoff(lead, hours(cfg.settlement_delay_hours));
        let valid_from = split.test_start - lead;

        let mut train: BTreeMap<Market, Vec<(f64, f64)>> = BTreeMap::new();
        for r in replays.iter().filter(|r| r.fixture.kickoff < cutoff) {
            let Some(res) = results.get(&r.fixture.fixture_id) else {
                continue;
            };
            for o in &r.outputs {
                train
                    .entry(o.market)
                    .or_default()
                    .push((o.raw_probability, outcome(res, o)));
            }
        }

        let mut models: BTreeMap<Market, CalibrationModel> = BTreeMap::new();
        if cfg.variant == ModelVariant::Calibrated {
            for (market, samples) in &train {
                if let Some(m) = calibration::fit(*market, samples, valid_from, &cfg.engine.calibration) {
                    models.insert(*market, m);
                }
            }
        }

        let mut test: Vec<&Replay> = replays
            .iter()
            .filter(|r| split.contains(r.fixture.kickoff))
            .collect();
        test.sort_by(|a, b| {
            (a.decision_at, &a.fixture.fixture_id, a.phase)
                .cmp(&(b.decision_at, &b.fixture.fixture_id, b.phase))
        });

        let mut book = ExposureBook::default();
        let mut bets = Vec::new();
        let mut predictions = Vec::new();
        let mut decisions: BTreeMap<String, usize> = BTreeMap::new();
        let mut fixtures: Vec<&str> = Vec::new();

        for replay in test {
            let guard = LeakageGuard::new(replay.decision_at);
            let mut outputs = replay.outputs.clone();
            for o in outputs.iter_mut() {
                if let Some(model) = models.get(&o.market) {
                    guard.check("calibration", model.valid_from)?;
                    apply_calibration(o, model);
                }
            }
            if !fixtures.contains(&replay.fixture.fixture_id.as_str()) {
                fixtures.push(&replay.fixture.fixture_id);
            }

            let made = decide(
                DecisionInput {
                    fixture: &replay.fixture,
                    outputs: &outputs,
                    books: &replay.books.markets,
                    rejected: &replay.books.rejected,
                    decided_at: replay.decision_at,
                },
                &mut book,
                DecisionIds::Deterministic(run_id),
                &cfg.engine,
            );

            let res = results.get(&replay.fixture.fixture_id);
            if let Some(res) = res {
                predictions.extend(outputs.iter().map(|o| (o.model_probability, outcome(res, o))));
            }
            for d in made {
                let label = match d.reason {
                    Some(reason) => format!("{}:{}", d.status.as_str(), reason.as_str()),
                    None => d.status.as_str().to_string(),
                };
                *decisions.entry(label).or_default() += 1;
                if d.status != DecisionStatus::Recommended {
                    continue;
                }
                // Replayed recommendations are treated as approved and placed.
                book.mark_executed(&d.key(), d.phase);
                let (Some(res), Some(bookmaker), Some(odds), Some(edge)) =
                    (res, d.bookmaker.clone(), d.odds, d.edge)
                else {
                    warn!(fixture = %d.fixture_id, "No result to settle against; bet voided");
                    continue;
                };
                let won = res
                    .iter()
                    .any(|r| r.player_id == d.player_id && r.hit(d.market));
                let closing_odds = self.closing_odds(&replay.fixture, d.market, &bookmaker, &d.player_id);
                bets.push(BetRecord {
                    fixture_id: d.fixture_id.clone(),
                    player_id: d.player_id.clone(),
                    market: d.market,
                    phase: d.phase,
                    kickoff: replay.fixture.kickoff,
                    decided_at: d.decided_at,
                    bookmaker,
                    odds,
                    model_probability: d.model_probability,
                    edge,
                    stake: d.stake,
                    won,
                    pnl: BetRecord::settle(d.stake, odds, won),
                    clv: closing_odds.map(|c| odds / c - 1.0),
                    closing_odds,
                });
            }
        }

        let summary = WindowSummary {
            index: split.index,
            train_start: split.train_start,
            test_start: split.test_start,
            test_end: split.test_end,
            fixtures: fixtures.len(),
            train_samples: train
                .iter()
                .map(|(m, s)| (m.as_str().to_string(), s.len()))
                .collect(),
            calibration: models
                .iter()
                .map(|(m, model)| {
                    let method = match model.method {
                        CalibrationMethod::Platt(_) => "platt",
                        CalibrationMethod::Isotonic { .. } => "isotonic",
                    };
                    (m.as_str().to_string(), method.to_string())
                })
                .collect(),
            bets: bets.len(),
            profit: bets.iter().map(|b| b.pnl).sum(),
        };
        info!(
            window = split.index,
            test_start = %split.test_start,
            fixtures = summary.fixtures,
            bets = summary.bets,
            profit = summary.profit,
            "Window evaluated"
        );
        Ok(WindowOutcome {
            summary,
            bets,
            predictions,
            decisions,
        })
    }

    /// Same-book price the bet is measured against.
    fn closing_odds(
        &self,
        fixture: &FixtureContext,
        market: Market,
        bookmaker: &str,
        player_id: &str,
    ) -> Option<f64> {
        let history = self.source.odds_history(&fixture.fixture_id, market);
        let quotes = history
            .iter()
            .filter(|s| s.bookmaker == bookmaker)
            .filter_map(|s| s.selections.get(player_id).map(|o| (s.ingested_at, *o)));
        let closing = match self.config.clv {
            ClvProxy::Conservative => quotes.filter(|(at, _)| *at <= fixture.kickoff).last(),
            ClvProxy::Realistic {
                hours_before_kickoff,
            } => {
                let target = fixture.kickoff - hours(hours_before_kickoff);
                quotes.min_by_key(|(at, _)| (*at - target).num_seconds().abs())
            }
        };
        closing.map(|(_, odds)| odds)
    }
}

fn outcome(results: &[PlayerResult], output: &ModelOutput) -> f64 {
    let hit = results
        .iter()
        .any(|r| r.player_id == output.player_id && r.hit(output.market));
    if hit {
        1.0
    } else {
        0.0
    }
}

/// Name-based id over the configuration and the fixture set.
fn run_id(cfg: &BacktestConfig, fixtures: &[FixtureContext]) -> Result<Uuid> {
    let mut name = serde_json::to_vec(cfg).map_err(|e| PricingError::InvalidConfig(e.to_string()))?;
    for f in fixtures {
        name.push(b'|');
        name.extend_from_slice(f.fixture_id.as_bytes());
    }
    Ok(Uuid::new_v5(&Uuid::NAMESPACE_OID, &name))
}
