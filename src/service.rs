//! Live pricing service: event-triggered pricing + decision cycles.
//!
//! An odds snapshot, a lineup confirmation or an operator override triggers
//! one cycle for the affected fixture. Pricing runs without holding any
//! lock; the commit step (output log, exposure book, decision log) is
//! serialized, so a cycle priced against an older phase is discarded and
//! concurrent triggers cannot log the same recommendation twice.

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backtest::report::BacktestReport;
use crate::backtest::{BacktestConfig, BacktestEngine};
use crate::config::EngineConfig;
use crate::decision::exposure::{Exposure, ExposureBook};
use crate::decision::{decide, DecisionIds, DecisionInput};
use crate::error::{PricingError, Result};
use crate::pricing::calibration::{self, CalibrationModel, CalibrationRegistry, DegradationSignal};
use crate::pricing::odds::Books;
use crate::pricing::scenario::FixturePhase;
use crate::pricing::{normalize_books, price_fixture, PricedFixture, PricingRequest, MARKETS};
use crate::store::models::{
    Decision, DecisionStatus, FeatureSnapshot, FixtureContext, FixtureId, LineupConfirmation,
    Market, ModelOutput, OddsSnapshot, OutputKey, Phase, PlayerId, PlayerResult, PricingOutput,
};
use crate::store::{Commit, MemoryStore, OutputLog, SnapshotSource};

/// A (player, market) the cycle could not price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedSelection {
    pub player_id: PlayerId,
    pub market: Market,
    pub reason: String,
}

/// What one cycle logged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub fixture_id: FixtureId,
    pub phase: Phase,
    pub at: DateTime<Utc>,
    /// The fixture moved to a later phase while this cycle was pricing
    pub discarded: bool,
    pub outputs_accepted: usize,
    pub outputs_superseded: usize,
    pub outputs_duplicate: usize,
    pub skipped: Vec<SkippedSelection>,
    /// Decisions accepted into the log
    pub decisions: Vec<Decision>,
}

/// Priced but not yet committed.
#[derive(Debug, Clone)]
pub struct PendingCycle {
    fixture: FixtureContext,
    phase: Phase,
    at: DateTime<Utc>,
    priced: PricedFixture,
}

impl PendingCycle {
    fn skip_error(&self, player_id: &str, market: Market) -> Option<&PricingError> {
        self.priced
            .skipped
            .iter()
            .find(|(p, m, _)| p == player_id && *m == market)
            .map(|(_, _, err)| err)
    }
}

/// Result of a recalibration request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recalibration {
    pub market: Market,
    pub samples: usize,
    /// Raised against the version active before this request
    pub degradation: Option<DegradationSignal>,
    /// Absent when the sample was too small or degenerate to fit
    pub promoted: Option<CalibrationModel>,
}

/// Current stakes for a fixture. Player and day totals span every fixture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureExposure {
    pub fixture_id: FixtureId,
    pub match_total: f64,
    pub day_total: f64,
    pub players: BTreeMap<PlayerId, f64>,
    pub entries: Vec<Exposure>,
}

#[derive(Clone)]
pub struct PricingService {
    store: MemoryStore,
    log: OutputLog,
    phases: Arc<RwLock<HashMap<FixtureId, FixturePhase>>>,
    /// Also the commit lock: held from output commit through decision commit.
    exposure: Arc<Mutex<ExposureBook>>,
    calibration: Arc<RwLock<CalibrationRegistry>>,
    /// Operator team-xG totals per fixture, keyed by team id
    overrides: Arc<RwLock<HashMap<FixtureId, BTreeMap<String, f64>>>>,
    config: Arc<EngineConfig>,
}

fn team_of<'a>(fixture: &'a FixtureContext, player_id: &str) -> Option<&'a str> {
    [&fixture.home, &fixture.away]
        .into_iter()
        .find(|t| t.squad.iter().any(|p| p == player_id))
        .map(|t| t.team_id.as_str())
}

impl PricingService {
    pub fn new(store: MemoryStore, config: EngineConfig) -> Self {
        PricingService {
            store,
            log: OutputLog::default(),
            phases: Arc::new(RwLock::new(HashMap::new())),
            exposure: Arc::new(Mutex::new(ExposureBook::default())),
            calibration: Arc::new(RwLock::new(CalibrationRegistry::default())),
            overrides: Arc::new(RwLock::new(HashMap::new())),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn fixture(&self, fixture_id: &str) -> Result<FixtureContext> {
        self.store
            .fixture(fixture_id)
            .ok_or_else(|| PricingError::UnknownFixture(fixture_id.to_string()))
    }

    pub fn phase_of(&self, fixture_id: &str) -> Phase {
        self.phases
            .read()
            .get(fixture_id)
            .map(FixturePhase::phase)
            .unwrap_or(Phase::Early)
    }

    // ── Cycles ─────────────────────────────────────────────────────────────

    /// Price every selection of a fixture against the current phase.
    pub fn price_cycle(&self, fixture_id: &str, at: DateTime<Utc>) -> Result<PendingCycle> {
        let fixture = self.fixture(fixture_id)?;
        let phase = self.phases.read().get(fixture_id).cloned().unwrap_or_default();
        let team_xg = self.overrides.read().get(fixture_id).cloned().unwrap_or_default();
        let priced = {
            let registry = self.calibration.read();
            price_fixture(
                &self.store,
                PricingRequest {
                    fixture: &fixture,
                    phase: &phase,
                    team_xg: &team_xg,
                    calibration: Some(&registry),
                    at,
                },
                &self.config,
            )
        };
        Ok(PendingCycle {
            fixture,
            phase: phase.phase(),
            at,
            priced,
        })
    }

    /// Log a priced cycle and run the decision engine over what was accepted.
    pub fn commit_cycle(&self, pending: PendingCycle) -> CycleReport {
        let PendingCycle {
            fixture,
            phase,
            at,
            priced,
        } = pending;
        let fixture_id = fixture.fixture_id.clone();
        let mut report = CycleReport {
            fixture_id: fixture_id.clone(),
            phase,
            at,
            discarded: false,
            outputs_accepted: 0,
            outputs_superseded: 0,
            outputs_duplicate: 0,
            skipped: priced
                .skipped
                .iter()
                .map(|(player_id, market, err)| SkippedSelection {
                    player_id: player_id.clone(),
                    market: *market,
                    reason: err.to_string(),
                })
                .collect(),
            decisions: Vec::new(),
        };

        let mut exposure = self.exposure.lock();
        if self.phase_of(&fixture_id) > phase {
            info!(
                fixture = %fixture_id,
                phase = phase.as_str(),
                "Discarding in-flight cycle superseded by lineup confirmation"
            );
            report.discarded = true;
            return report;
        }

        let mut accepted = Vec::with_capacity(priced.outputs.len());
        for output in priced.outputs {
            match self.log.commit_output(output.clone()) {
                Commit::Accepted => accepted.push(output),
                Commit::Superseded => report.outputs_superseded += 1,
                Commit::Duplicate => report.outputs_duplicate += 1,
            }
        }
        report.outputs_accepted = accepted.len();
        if accepted.is_empty() {
            return report;
        }

        let mut books = Books::default();
        for m in MARKETS {
            books.extend(normalize_books(&self.store.odds_snapshots(&fixture_id, m, at), &self.config.odds));
        }
        exposure.prune_before(at.date_naive());
        exposure.release_pending(&fixture_id, phase);
        let decisions = decide(
            DecisionInput {
                fixture: &fixture,
                outputs: &accepted,
                books: &books.markets,
                rejected: &books.rejected,
                decided_at: at,
            },
            &mut exposure,
            DecisionIds::Random,
            &self.config,
        );
        for decision in decisions {
            if self.log.commit_decision(decision.clone()) == Commit::Accepted {
                report.decisions.push(decision);
            }
        }
        info!(
            fixture = %fixture_id,
            phase = phase.as_str(),
            outputs = report.outputs_accepted,
            recommended = report
                .decisions
                .iter()
                .filter(|d| d.status == DecisionStatus::Recommended)
                .count(),
            "Pricing cycle committed"
        );
        report
    }

    pub fn run_cycle(&self, fixture_id: &str, at: DateTime<Utc>) -> Result<CycleReport> {
        let pending = self.price_cycle(fixture_id, at)?;
        Ok(self.commit_cycle(pending))
    }

    /// Re-price several fixtures in parallel. Unknown fixtures yield errors
    /// without affecting the others.
    pub async fn reprice_all(
        &self,
        fixture_ids: Vec<FixtureId>,
        at: DateTime<Utc>,
    ) -> Vec<(FixtureId, Result<CycleReport>)> {
        let tasks = fixture_ids.into_iter().map(|id| {
            let svc = self.clone();
            async move {
                let fixture_id = id.clone();
                let joined = tokio::task::spawn_blocking(move || svc.run_cycle(&id, at)).await;
                (fixture_id, joined)
            }
        });
        join_all(tasks)
            .await
            .into_iter()
            .filter_map(|(id, joined)| match joined {
                Ok(result) => Some((id, result)),
                Err(e) => {
                    error!(fixture = %id, "Pricing cycle task failed: {}", e);
                    None
                }
            })
            .collect()
    }

    // ── Exposed calls ──────────────────────────────────────────────────────

    /// Price one selection. `team_xg` replaces the stored operator override
    /// for the player's team before the fixture is re-priced.
    pub fn price(
        &self,
        fixture_id: &str,
        player_id: &str,
        market: Market,
        team_xg: Option<f64>,
        at: DateTime<Utc>,
    ) -> Result<PricingOutput> {
        if let Some(total) = team_xg {
            let fixture = self.fixture(fixture_id)?;
            let team = team_of(&fixture, player_id).ok_or_else(|| PricingError::CriticalDataMissing {
                player_id: player_id.to_string(),
                field: "team".into(),
            })?;
            if !(total.is_finite() && total > 0.0) {
                return Err(PricingError::InvalidConfig(format!(
                    "team xG override must be positive, got {total}"
                )));
            }
            info!(fixture = %fixture_id, team, total, "Team xG override set");
            self.overrides
                .write()
                .entry(fixture_id.to_string())
                .or_default()
                .insert(team.to_string(), total);
        }

        let pending = self.price_cycle(fixture_id, at)?;
        if let Some(err) = pending.skip_error(player_id, market) {
            return Err(err.clone());
        }
        self.commit_cycle(pending);

        let key = OutputKey {
            fixture_id: fixture_id.to_string(),
            player_id: player_id.to_string(),
            market,
        };
        let output = self
            .log
            .latest_output(&key)
            .ok_or_else(|| PricingError::CriticalDataMissing {
                player_id: player_id.to_string(),
                field: "model_output".into(),
            })?;
        let decision = self.log.latest_decision_for(&key);
        Ok(PricingOutput::new(&output, decision.as_ref()))
    }

    pub fn clear_overrides(&self, fixture_id: &str) {
        if self.overrides.write().remove(fixture_id).is_some() {
            info!(fixture = %fixture_id, "Team xG overrides cleared");
        }
    }

    /// Move the fixture to LINEUP (or replace an older confirmation) and
    /// force a recompute of every selection.
    pub fn confirm_lineup(&self, lineup: LineupConfirmation) -> Result<CycleReport> {
        let fixture_id = lineup.fixture_id.clone();
        self.fixture(&fixture_id)?;
        let was = {
            let mut phases = self.phases.write();
            let phase = phases.entry(fixture_id.clone()).or_default();
            let was = phase.phase();
            phase.transition(Phase::Lineup, Some(lineup.clone()))?;
            was
        };
        info!(
            fixture = %fixture_id,
            from = was.as_str(),
            starters = lineup.home_starters.len() + lineup.away_starters.len(),
            "Lineup confirmed"
        );
        let at = lineup.confirmed_at;
        self.store.insert_lineup(lineup);
        if was == Phase::Early {
            self.exposure.lock().release_pending(&fixture_id, Phase::Early);
        }
        self.run_cycle(&fixture_id, at)
    }

    /// Operator approval of an open recommendation. Appends an EXECUTED
    /// decision and makes its stake permanent against the caps.
    pub fn execute(&self, decision_id: Uuid, at: DateTime<Utc>) -> Result<Decision> {
        let decision = self
            .log
            .decision(decision_id)
            .ok_or_else(|| PricingError::UnknownDecision(decision_id.to_string()))?;
        let not_open = || PricingError::DecisionNotOpen(decision_id.to_string());
        let executed = decision.executed(at).ok_or_else(not_open)?;

        let key = OutputKey {
            fixture_id: decision.fixture_id.clone(),
            player_id: decision.player_id.clone(),
            market: decision.market,
        };
        let mut exposure = self.exposure.lock();
        if self.log.latest_decision_for(&key).map(|d| d.id) != Some(decision.id) {
            return Err(not_open());
        }
        if !exposure.mark_executed(&decision.key(), decision.phase) {
            return Err(not_open());
        }
        self.log.commit_decision(executed.clone());
        info!(
            fixture = %executed.fixture_id,
            player = %executed.player_id,
            stake = executed.stake,
            "Decision executed"
        );
        Ok(executed)
    }

    /// Refit the calibration for a market on every logged output with a
    /// settled result, check the active version for degradation first, and
    /// promote the new fit from `at`.
    pub fn recalibrate(&self, market: Market, at: DateTime<Utc>) -> Result<Recalibration> {
        let mut samples = Vec::new();
        for fixture_id in self.store.fixture_ids() {
            let results = self.store.results(&fixture_id);
            if results.is_empty() {
                continue;
            }
            for output in self.log.outputs_for(&fixture_id) {
                if output.market != market {
                    continue;
                }
                let hit = results
                    .iter()
                    .find(|r| r.player_id == output.player_id)
                    .map_or(false, |r| r.hit(market));
                samples.push((output.raw_probability, if hit { 1.0 } else { 0.0 }));
            }
        }

        let degradation = self
            .calibration
            .read()
            .check_degradation(market, at, &samples, &self.config.calibration);
        let promoted = calibration::fit(market, &samples, at, &self.config.calibration);
        match &promoted {
            Some(model) => self.calibration.write().promote(model.clone()),
            None => warn!(
                market = market.as_str(),
                samples = samples.len(),
                "Not enough settled outputs to calibrate"
            ),
        }
        Ok(Recalibration {
            market,
            samples: samples.len(),
            degradation,
            promoted,
        })
    }

    /// Walk-forward backtest over everything the store holds.
    pub async fn backtest(&self, config: BacktestConfig) -> anyhow::Result<BacktestReport> {
        let store = self.store.clone();
        let report = tokio::task::spawn_blocking(move || BacktestEngine::new(&store, &config).run()).await??;
        Ok(report)
    }

    // ── Collaborator ingestion ─────────────────────────────────────────────

    pub fn ingest_fixture(&self, fixture: FixtureContext) {
        self.store.upsert_fixture(fixture);
    }

    pub fn ingest_features(&self, snapshot: FeatureSnapshot) -> bool {
        self.store.insert_features(snapshot)
    }

    /// Store a bookmaker snapshot and re-price its fixture.
    pub fn ingest_odds(&self, snapshot: OddsSnapshot, at: DateTime<Utc>) -> Result<CycleReport> {
        let fixture_id = snapshot.fixture_id.clone();
        self.fixture(&fixture_id)?;
        self.store.insert_odds(snapshot);
        self.run_cycle(&fixture_id, at)
    }

    /// Store a result and release the fixture's stakes from the caps.
    pub fn ingest_result(&self, result: PlayerResult) {
        let released = self.exposure.lock().settle(&result.fixture_id);
        if released > 0 {
            info!(fixture = %result.fixture_id, released, "Fixture settled; stakes released");
        }
        self.store.insert_result(result);
    }

    // ── Reads ──────────────────────────────────────────────────────────────

    /// Current output contract for every logged selection of a fixture.
    pub fn fixture_outputs(&self, fixture_id: &str) -> Vec<PricingOutput> {
        self.log
            .outputs_for(fixture_id)
            .iter()
            .map(|o| PricingOutput::new(o, self.log.latest_decision_for(&o.key()).as_ref()))
            .collect()
    }

    /// Every accepted output for a fixture, superseded ones included, in
    /// commit order.
    pub fn output_history(&self, fixture_id: &str) -> Vec<ModelOutput> {
        self.log
            .output_history()
            .into_iter()
            .filter(|o| o.fixture_id == fixture_id)
            .collect()
    }

    /// Stakes held against the caps for one fixture.
    pub fn exposure_for(&self, fixture_id: &str) -> FixtureExposure {
        let book = self.exposure.lock();
        let held: Vec<Exposure> = book
            .entries()
            .iter()
            .filter(|e| e.fixture_id == fixture_id)
            .cloned()
            .collect();
        let players = held
            .iter()
            .map(|e| (e.player_id.clone(), book.player_total(&e.player_id)))
            .collect();
        let day_total = held.first().map(|e| book.day_total(e.day)).unwrap_or(0.0);
        FixtureExposure {
            fixture_id: fixture_id.to_string(),
            match_total: book.match_total(fixture_id),
            day_total,
            players,
            entries: held,
        }
    }

    pub fn decisions_for(&self, fixture_id: &str) -> Vec<Decision> {
        self.log.decisions_for(fixture_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::tests::{fixture, kickoff, seeded_store};
    use crate::store::models::{Classification, RejectionReason};
    use approx::assert_relative_eq;
    use chrono::Duration;

    fn goalscorer_odds(at: DateTime<Utc>) -> OddsSnapshot {
        OddsSnapshot {
            bookmaker: "book".into(),
            market: Market::AnytimeGoalscorer,
            fixture_id: "f1".into(),
            selections: [("h1", 5.0), ("h2", 3.0), ("h3", 4.0), ("a1", 2.6)]
                .into_iter()
                .map(|(p, o)| (p.to_string(), o))
                .collect(),
            ingested_at: at,
        }
    }

    fn lineup(at: DateTime<Utc>) -> LineupConfirmation {
        LineupConfirmation {
            fixture_id: "f1".into(),
            home_starters: vec!["h1".into()],
            away_starters: vec!["a1".into()],
            confirmed_at: at,
        }
    }

    fn service() -> PricingService {
        PricingService::new(seeded_store(kickoff()), EngineConfig::default())
    }

    fn early() -> DateTime<Utc> {
        kickoff() - Duration::hours(24)
    }

    fn h1_goalscorer(decisions: &[Decision]) -> &Decision {
        decisions
            .iter()
            .find(|d| d.player_id == "h1" && d.market == Market::AnytimeGoalscorer)
            .unwrap()
    }

    #[test]
    fn odds_snapshot_triggers_cycle_and_recommendation() {
        let svc = service();
        let report = svc.ingest_odds(goalscorer_odds(early() - Duration::hours(1)), early()).unwrap();
        assert!(!report.discarded);
        assert_eq!(report.phase, Phase::Early);
        assert_eq!(report.outputs_accepted, 8);
        assert_eq!(report.decisions.len(), 8);

        let d = h1_goalscorer(&report.decisions);
        assert_eq!(d.status, DecisionStatus::Recommended);
        assert_eq!(d.classification, Classification::Value);
        assert_eq!(d.bookmaker.as_deref(), Some("book"));
        assert_eq!(d.odds, Some(5.0));
        // No assist prices anywhere: abstain, never a bet.
        assert!(report
            .decisions
            .iter()
            .filter(|d| d.market == Market::AnytimeAssist)
            .all(|d| d.status == DecisionStatus::Rejected && d.reason.is_some()));
    }

    #[test]
    fn lineup_discards_in_flight_early_cycle() {
        let svc = service();
        svc.store.insert_odds(goalscorer_odds(early() - Duration::hours(1)));
        let in_flight = svc.price_cycle("f1", early()).unwrap();

        let lineup_at = kickoff() - Duration::minutes(60);
        let lineup_report = svc.confirm_lineup(lineup(lineup_at)).unwrap();
        assert_eq!(lineup_report.phase, Phase::Lineup);
        assert_eq!(lineup_report.outputs_accepted, 8);

        let stale = svc.commit_cycle(in_flight);
        assert!(stale.discarded);
        assert!(stale.decisions.is_empty());

        let out = svc.price("f1", "h1", Market::AnytimeGoalscorer, None, lineup_at).unwrap();
        assert_eq!(out.meta.phase, Phase::Lineup);
        assert_eq!(svc.output_history("f1").len(), 8);
        assert!(svc
            .decisions_for("f1")
            .iter()
            .all(|d| d.phase == Phase::Lineup));
    }

    #[test]
    fn early_output_arriving_after_lineup_is_superseded() {
        let svc = service();
        let lineup_at = kickoff() - Duration::minutes(60);
        svc.confirm_lineup(lineup(lineup_at)).unwrap();
        // An EARLY output for the same key can never replace the LINEUP one.
        let mut early_output = svc
            .log
            .latest_output(&OutputKey {
                fixture_id: "f1".into(),
                player_id: "h2".into(),
                market: Market::AnytimeAssist,
            })
            .unwrap();
        early_output.phase = Phase::Early;
        early_output.computed_at = kickoff();
        assert_eq!(svc.log.commit_output(early_output), Commit::Superseded);
    }

    #[test]
    fn price_applies_team_override() {
        let svc = service();
        let out = svc
            .price("f1", "h1", Market::AnytimeGoalscorer, Some(2.5), early())
            .unwrap();
        assert!(out.meta.is_override_active);
        assert_eq!(out.meta.phase, Phase::Early);
        assert!(out.pricing.inputs_used.intermediates.contains_key("team_xg_override"));
        // No odds ingested: the decision abstains.
        let decision = out.decision.unwrap();
        assert_eq!(decision.status, DecisionStatus::Rejected);

        let away = svc.price("f1", "a1", Market::AnytimeGoalscorer, None, early()).unwrap();
        assert!(!away.meta.is_override_active);

        svc.clear_overrides("f1");
        let later = svc
            .price("f1", "h1", Market::AnytimeGoalscorer, None, early() + Duration::minutes(5))
            .unwrap();
        assert!(!later.meta.is_override_active);
        assert!(later.pricing.model_probability < out.pricing.model_probability);
    }

    #[test]
    fn price_surfaces_skip_reason() {
        let svc = service();
        let mut f = fixture("f1", kickoff());
        f.home.squad.push("ghost".into());
        svc.ingest_fixture(f);
        let err = svc
            .price("f1", "ghost", Market::AnytimeGoalscorer, None, early())
            .unwrap_err();
        assert!(matches!(err, PricingError::CriticalDataMissing { .. }));
        // Everyone else still priced.
        assert!(svc.price("f1", "h2", Market::AnytimeAssist, None, early()).is_ok());
    }

    #[test]
    fn concurrent_duplicate_cycles_log_one_decision_per_key() {
        let svc = service();
        svc.store.insert_odds(goalscorer_odds(early() - Duration::hours(1)));
        std::thread::scope(|s| {
            for _ in 0..6 {
                let svc = svc.clone();
                s.spawn(move || svc.run_cycle("f1", early()).unwrap());
            }
        });
        let decisions = svc.decisions_for("f1");
        assert_eq!(decisions.len(), 8);
        let held: f64 = svc.exposure.lock().entries().iter().map(|e| e.stake).sum();
        let recommended: f64 = decisions
            .iter()
            .filter(|d| d.status == DecisionStatus::Recommended)
            .map(|d| d.stake)
            .sum();
        assert_relative_eq!(held, recommended, epsilon = 1e-9);
    }

    #[test]
    fn execute_once_then_closed() {
        let svc = service();
        let report = svc.ingest_odds(goalscorer_odds(early() - Duration::hours(1)), early()).unwrap();
        let id = h1_goalscorer(&report.decisions).id;

        let executed = svc.execute(id, early() + Duration::minutes(1)).unwrap();
        assert_eq!(executed.status, DecisionStatus::Executed);
        assert_eq!(executed.supersedes, Some(id));
        assert!(svc.exposure.lock().entries().iter().any(|e| e.executed));

        let held = svc.exposure_for("f1");
        assert_eq!(held.entries.iter().filter(|e| e.executed).count(), 1);
        assert_eq!(held.match_total, held.day_total);
        assert_eq!(held.players["h1"], executed.stake);

        let again = svc.execute(id, early() + Duration::minutes(2)).unwrap_err();
        assert_eq!(again, PricingError::DecisionNotOpen(id.to_string()));

        let rejected = report
            .decisions
            .iter()
            .find(|d| d.status == DecisionStatus::Rejected)
            .unwrap();
        assert!(matches!(
            svc.execute(rejected.id, early()),
            Err(PricingError::DecisionNotOpen(_))
        ));
        assert!(matches!(
            svc.execute(Uuid::new_v4(), early()),
            Err(PricingError::UnknownDecision(_))
        ));
    }

    #[test]
    fn results_release_executed_stakes() {
        let svc = service();
        let report = svc.ingest_odds(goalscorer_odds(early() - Duration::hours(1)), early()).unwrap();
        let id = h1_goalscorer(&report.decisions).id;
        svc.execute(id, early() + Duration::minutes(1)).unwrap();
        assert!(!svc.exposure_for("f1").entries.is_empty());

        svc.ingest_result(PlayerResult {
            fixture_id: "f1".into(),
            player_id: "h1".into(),
            goals: 1,
            assists: 0,
        });
        let held = svc.exposure_for("f1");
        assert!(held.entries.is_empty());
        assert_eq!(held.match_total, 0.0);
        assert!(svc.exposure.lock().entries().is_empty());
    }

    #[test]
    fn past_matchdays_are_pruned_at_cycle_time() {
        let svc = service();
        svc.ingest_odds(goalscorer_odds(early() - Duration::hours(1)), early()).unwrap();
        assert!(!svc.exposure.lock().entries().is_empty());

        let next_kickoff = kickoff() + Duration::days(7);
        svc.ingest_fixture(fixture("f2", next_kickoff));
        let mut odds = goalscorer_odds(next_kickoff - Duration::hours(25));
        odds.fixture_id = "f2".into();
        let as_of = next_kickoff - Duration::hours(30);
        for (p, team, xg) in [("h1", "home", 0.40), ("h2", "home", 0.30), ("h3", "home", 0.20), ("a1", "away", 0.5)] {
            svc.ingest_features(crate::pricing::tests::features(p, team, xg, as_of));
        }
        svc.ingest_odds(odds, next_kickoff - Duration::hours(24)).unwrap();
        let book = svc.exposure.lock();
        assert!(!book.entries().is_empty());
        assert!(book.entries().iter().all(|e| e.fixture_id == "f2"));
    }

    #[test]
    fn rejected_assist_book_names_the_cause() {
        let svc = service();
        svc.store.insert_odds(goalscorer_odds(early() - Duration::hours(1)));
        // Σ(1/odds) ≈ 3.6, far outside the overround band.
        svc.store.insert_odds(OddsSnapshot {
            bookmaker: "book".into(),
            market: Market::AnytimeAssist,
            fixture_id: "f1".into(),
            selections: [("h1", 1.1), ("h2", 1.1), ("h3", 1.1), ("a1", 1.1)]
                .into_iter()
                .map(|(p, o)| (p.to_string(), o))
                .collect(),
            ingested_at: early() - Duration::hours(1),
        });
        let report = svc.run_cycle("f1", early()).unwrap();
        let assists: Vec<&Decision> = report
            .decisions
            .iter()
            .filter(|d| d.market == Market::AnytimeAssist)
            .collect();
        assert_eq!(assists.len(), 4);
        assert!(assists
            .iter()
            .all(|d| d.reason == Some(RejectionReason::MarketRejected)));
        assert_eq!(
            h1_goalscorer(&report.decisions).status,
            DecisionStatus::Recommended
        );
    }

    #[test]
    fn early_recommendation_closes_when_lineup_arrives() {
        let svc = service();
        let report = svc.ingest_odds(goalscorer_odds(early() - Duration::hours(1)), early()).unwrap();
        let id = h1_goalscorer(&report.decisions).id;
        svc.confirm_lineup(lineup(kickoff() - Duration::minutes(60))).unwrap();
        assert!(matches!(
            svc.execute(id, kickoff() - Duration::minutes(59)),
            Err(PricingError::DecisionNotOpen(_))
        ));
    }

    #[test]
    fn unknown_fixture_and_backwards_lineup_rejected() {
        let svc = service();
        assert_eq!(
            svc.run_cycle("nope", early()).unwrap_err(),
            PricingError::UnknownFixture("nope".into())
        );
        svc.confirm_lineup(lineup(kickoff() - Duration::minutes(60))).unwrap();
        let err = svc
            .confirm_lineup(lineup(kickoff() - Duration::minutes(90)))
            .unwrap_err();
        assert!(matches!(err, PricingError::InvalidPhaseTransition { .. }));
        // A newer confirmation replaces the older one.
        assert!(svc.confirm_lineup(lineup(kickoff() - Duration::minutes(30))).is_ok());
        assert_eq!(svc.phase_of("f1"), Phase::Lineup);
    }

    #[test]
    fn recalibration_fits_on_settled_outputs() {
        let mut cfg = EngineConfig::default();
        cfg.calibration.min_samples = 8;
        let svc = PricingService::new(seeded_store(kickoff()), cfg);
        for (i, id) in ["f1", "f2", "f3"].into_iter().enumerate() {
            let ko = kickoff() + Duration::days(i as i64);
            svc.ingest_fixture(fixture(id, ko));
            svc.run_cycle(id, kickoff() - Duration::hours(24)).unwrap();
            for (player, goals) in [("h1", 1), ("h2", 0), ("h3", 0), ("a1", 1)] {
                svc.ingest_result(PlayerResult {
                    fixture_id: id.into(),
                    player_id: player.into(),
                    goals,
                    assists: 0,
                });
            }
        }
        let at = kickoff() + Duration::days(4);
        let r = svc.recalibrate(Market::AnytimeGoalscorer, at).unwrap();
        assert_eq!(r.samples, 12);
        assert!(r.degradation.is_none());
        let model = r.promoted.unwrap();
        assert_eq!(model.valid_from, at);
        assert!(svc.calibration.read().active_at(Market::AnytimeGoalscorer, at).is_some());

        // Too few assist hits to fit anything.
        let assist = svc.recalibrate(Market::AnytimeAssist, at).unwrap();
        assert!(assist.promoted.is_none());
    }

    #[tokio::test]
    async fn reprice_all_isolates_failures() {
        let svc = service();
        let results = svc
            .reprice_all(vec!["f1".into(), "missing".into()], early())
            .await;
        assert_eq!(results.len(), 2);
        assert!(results[0].1.is_ok());
        assert!(matches!(results[1].1, Err(PricingError::UnknownFixture(_))));
    }

    #[tokio::test]
    async fn backtest_runs_over_the_store() {
        let store = MemoryStore::from_dataset(crate::backtest::tests::dataset(40, 3));
        let svc = PricingService::new(store, EngineConfig::default());
        let mut cfg = BacktestConfig {
            initial_train_days: 20,
            test_days: 10,
            ..Default::default()
        };
        cfg.engine.calibration.min_samples = 40;
        let report = svc.backtest(cfg).await.unwrap();
        assert_eq!(report.windows.len(), 2);
    }
}
