//! Pricing engine: per-fixture orchestration of the intensity model, scenario
//! mixer, override allocator and calibration layer into `ModelOutput`s.

pub mod allocation;
pub mod calibration;
pub mod intensity;
pub mod odds;
pub mod profile;
pub mod scenario;

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::config::{EngineConfig, OddsConfig};
use crate::decision::edge::fair_odds;
use crate::error::{PricingError, Result};
use crate::store::models::{
    Explanation, FeatureSnapshot, FixtureContext, Market, ModelOutput, OddsSnapshot, PlayerId,
};
use crate::store::SnapshotSource;
use allocation::{allocate, AllocationStrategy};
use calibration::{CalibrationModel, CalibrationRegistry};
use intensity::{interpret, poisson_at_least_one, PlayerContext, MIN_LAMBDA};
use odds::{normalize_snapshot, Books, RejectedBook};
use scenario::{mix_for_phase, FixturePhase, ScenarioMix};

pub const MARKETS: [Market; 2] = [Market::AnytimeGoalscorer, Market::AnytimeAssist];

/// Everything one pricing pass over a fixture needs.
#[derive(Debug, Clone, Copy)]
pub struct PricingRequest<'a> {
    pub fixture: &'a FixtureContext,
    pub phase: &'a FixturePhase,
    /// Operator team xG totals keyed by team id; goalscorer market only.
    pub team_xg: &'a BTreeMap<String, f64>,
    pub calibration: Option<&'a CalibrationRegistry>,
    /// Snapshot visibility cutoff and the outputs' `computed_at`
    pub at: DateTime<Utc>,
}

/// Outputs for every priceable (player, market) plus the ones skipped and why.
#[derive(Debug, Clone, Default)]
pub struct PricedFixture {
    pub outputs: Vec<ModelOutput>,
    pub skipped: Vec<(PlayerId, Market, PricingError)>,
}

struct Draft {
    snapshot: FeatureSnapshot,
    market: Market,
    stale: bool,
    mix: ScenarioMix,
    explanation: Explanation,
    override_active: bool,
}

/// Age check against the freshness window. `Ok(true)` means degraded pricing.
fn freshness(snapshot: &FeatureSnapshot, at: DateTime<Utc>, cfg: &EngineConfig) -> Result<bool> {
    let age_hours = (at - snapshot.as_of).num_seconds() as f64 / 3600.0;
    if age_hours > cfg.freshness.halt_after_hours {
        return Err(PricingError::DataStale {
            entity: snapshot.player_id.clone(),
            age_hours,
        });
    }
    Ok(age_hours > cfg.freshness.stale_after_hours)
}

/// Price both markets for every squad player in the fixture.
///
/// Per-player failures never abort the pass; they land in `skipped`.
pub fn price_fixture<S: SnapshotSource + ?Sized>(
    source: &S,
    request: PricingRequest<'_>,
    cfg: &EngineConfig,
) -> PricedFixture {
    let fixture = request.fixture;
    let mut priced = PricedFixture::default();
    let mut drafts: Vec<Draft> = Vec::new();

    let mut players: Vec<&PlayerId> = fixture.players().collect();
    players.sort();
    players.dedup();

    for player_id in players {
        let Some(snapshot) = source.feature_snapshot(player_id, request.at) else {
            let err = PricingError::CriticalDataMissing {
                player_id: player_id.clone(),
                field: "feature_snapshot".into(),
            };
            warn!("Skipping {}: {}", player_id, err);
            for market in MARKETS {
                priced.skipped.push((player_id.clone(), market, err.clone()));
            }
            continue;
        };
        let stale = match freshness(&snapshot, request.at, cfg) {
            Ok(stale) => stale,
            Err(err) => {
                warn!("Halting pricing for {}: {}", player_id, err);
                for market in MARKETS {
                    priced.skipped.push((player_id.clone(), market, err.clone()));
                }
                continue;
            }
        };
        if stale {
            warn!(player = %player_id, as_of = %snapshot.as_of, "Pricing on stale features (DATA_STALE)");
        }

        let ctx = PlayerContext {
            snapshot: &snapshot,
            team: fixture.team(&snapshot.team_id),
            opponent: fixture.opponent_of(&snapshot.team_id),
        };
        for market in MARKETS {
            let intensity = match intensity::intensity(market, ctx, cfg) {
                Ok(i) => i,
                Err(err) => {
                    warn!(market = market.as_str(), "Skipping {}: {}", player_id, err);
                    priced.skipped.push((player_id.clone(), market, err));
                    continue;
                }
            };
            let mut explanation = intensity.explanation.clone();
            let mix = mix_for_phase(
                request.phase,
                player_id,
                &intensity,
                &snapshot.availability,
                &cfg.scenarios,
                &mut explanation,
            );
            drafts.push(Draft {
                snapshot: snapshot.clone(),
                market,
                stale,
                mix,
                explanation,
                override_active: false,
            });
        }
    }

    apply_overrides(&mut drafts, &mut priced, request.team_xg);

    for draft in drafts {
        priced.outputs.push(finish(draft, &request));
    }
    priced.outputs.sort_by(|a, b| a.key().cmp(&b.key()));
    priced
}

/// Top-down rescaling of each overridden team's goalscorer intensities.
fn apply_overrides(
    drafts: &mut Vec<Draft>,
    priced: &mut PricedFixture,
    team_xg: &BTreeMap<String, f64>,
) {
    for (team_id, total) in team_xg {
        let strategy = AllocationStrategy::from_override(Some(*total));
        let bottom_up: BTreeMap<PlayerId, f64> = drafts
            .iter()
            .filter(|d| d.market == Market::AnytimeGoalscorer && &d.snapshot.team_id == team_id)
            .map(|d| (d.snapshot.player_id.clone(), d.mix.expected_lambda()))
            .collect();
        if bottom_up.is_empty() {
            continue;
        }
        let allocations = match allocate(strategy, &bottom_up) {
            Ok(a) => a,
            Err(err) => {
                warn!(team = %team_id, "Override not applied: {}", err);
                drafts.retain(|d| {
                    let hit = d.market == Market::AnytimeGoalscorer && &d.snapshot.team_id == team_id;
                    if hit {
                        priced
                            .skipped
                            .push((d.snapshot.player_id.clone(), d.market, err.clone()));
                    }
                    !hit
                });
                continue;
            }
        };
        for d in drafts
            .iter_mut()
            .filter(|d| d.market == Market::AnytimeGoalscorer && &d.snapshot.team_id == team_id)
        {
            if let Some(a) = allocations.get(&d.snapshot.player_id) {
                d.explanation.step("raw_lambda", a.raw_lambda);
                d.explanation.step("override_lambda", a.lambda);
                d.explanation.step("override_scale", a.scale);
                d.explanation.step("team_xg_override", *total);
                d.mix = d.mix.scaled(a.scale);
                d.override_active = strategy.is_override();
            }
        }
    }
}

fn finish(draft: Draft, request: &PricingRequest<'_>) -> ModelOutput {
    let Draft {
        snapshot,
        market,
        stale,
        mix,
        mut explanation,
        override_active,
    } = draft;

    mix.record(&mut explanation);
    // Zero-minute scenarios can still sum to zero.
    let raw_probability = mix.probability().max(min_probability());
    explanation.step("raw_probability", raw_probability);
    if stale {
        explanation.step("data_stale", 1.0);
    }
    explanation.interpretation = interpret(market, raw_probability).to_string();

    let mut output = ModelOutput {
        fixture_id: request.fixture.fixture_id.clone(),
        player_id: snapshot.player_id.clone(),
        team_id: snapshot.team_id.clone(),
        market,
        phase: mix.phase,
        computed_at: request.at,
        feature_as_of: snapshot.as_of,
        selection_status: mix.status,
        projected_minutes: mix.expected_minutes(),
        lambda: mix.expected_lambda(),
        raw_probability,
        model_probability: raw_probability,
        fair_odds: fair_odds(raw_probability),
        calibration_version: None,
        override_active,
        data_stale: stale,
        explanation,
    };
    if let Some(model) = request
        .calibration
        .and_then(|r| r.active_at(market, request.at))
    {
        apply_calibration(&mut output, model);
    }
    debug!(
        player = %output.player_id,
        market = market.as_str(),
        phase = output.phase.as_str(),
        p = output.model_probability,
        "Priced selection"
    );
    output
}

/// Lowest probability an output may carry, so fair odds stay finite.
pub fn min_probability() -> f64 {
    poisson_at_least_one(MIN_LAMBDA)
}

/// Re-derive the calibrated fields of an output from its raw probability.
pub fn apply_calibration(output: &mut ModelOutput, model: &CalibrationModel) {
    let p = model.apply(output.raw_probability).max(min_probability());
    output.explanation.step("calibrated_probability", p);
    output.explanation.interpretation = interpret(output.market, p).to_string();
    output.model_probability = p;
    output.fair_odds = fair_odds(p);
    output.calibration_version = Some(model.valid_from);
}

/// Normalize every book. Rejected markets are logged and set aside.
pub fn normalize_books(snapshots: &[OddsSnapshot], cfg: &OddsConfig) -> Books {
    let mut books = Books::default();
    for s in snapshots {
        match normalize_snapshot(s, cfg) {
            Ok(m) => books.markets.push(m),
            Err(err) => {
                warn!(
                    bookmaker = %s.bookmaker,
                    fixture = %s.fixture_id,
                    market = s.market.as_str(),
                    "Rejected odds snapshot: {}",
                    err
                );
                books.rejected.push(RejectedBook {
                    bookmaker: s.bookmaker.clone(),
                    market: s.market,
                    players: s.selections.keys().cloned().collect(),
                    error: err,
                });
            }
        }
    }
    books
}
