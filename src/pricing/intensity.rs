//! Poisson intensity models for anytime goalscorer and anytime assist.
//!
//! Both variants produce a full-match (per-90) intensity split into
//! components; the scenario mixer scales it by minutes and evaluates
//! `P(event ≥ 1) = 1 − e^{−λ}`.
//!
//! Critical inputs (xG for goals, xA for assists) are never imputed. Secondary
//! inputs fall back to configured defaults and are flagged `ESTIMATED` in the
//! explanation payload.

use std::f64::consts::LN_2;

use crate::config::{EngineConfig, OpponentConfig};
use crate::error::{PricingError, Result};
use crate::pricing::profile::creation_score;
use crate::store::models::{Explanation, FeatureSnapshot, InputValue, Market, TeamProfile};

/// Floor on a full-match intensity. Keeps every price finite.
pub const MIN_LAMBDA: f64 = 0.001;

/// `P(X ≥ 1)` for `X ~ Poisson(λ)`. Strictly increasing in λ.
pub fn poisson_at_least_one(lambda: f64) -> f64 {
    if lambda <= 0.0 {
        return 0.0;
    }
    -(-lambda).exp_m1()
}

/// Matches until a form weight halves.
pub fn half_life(decay_per_match: f64) -> f64 {
    if decay_per_match <= 0.0 {
        f64::INFINITY
    } else {
        LN_2 / decay_per_match
    }
}

/// Exponentially weighted recent per-90 rate relative to the season rate.
///
/// `recent` is most-recent-first; weight of match `i` is `e^{−k·i}`.
pub fn form_factor(recent: &[f64], season_rate: f64, decay: f64, min: f64, max: f64) -> InputValue {
    let valid: Vec<(usize, f64)> = recent
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, v)| v.is_finite() && *v >= 0.0)
        .collect();
    if valid.is_empty() || season_rate <= 0.0 {
        return InputValue::estimated(1.0);
    }
    let (mut num, mut den) = (0.0, 0.0);
    for (i, v) in valid {
        let w = (-decay * i as f64).exp();
        num += w * v;
        den += w;
    }
    InputValue::observed((num / den / season_rate).clamp(min, max))
}

/// Opponent concession rate relative to league average.
pub fn opponent_factor(opponent: Option<&TeamProfile>, cfg: &OpponentConfig) -> InputValue {
    match opponent.and_then(|t| t.xga_per90) {
        Some(xga) if xga.is_finite() && xga >= 0.0 && cfg.league_avg_xga_per90 > 0.0 => {
            InputValue::observed((xga / cfg.league_avg_xga_per90).clamp(cfg.min_factor, cfg.max_factor))
        }
        _ => InputValue::estimated(1.0),
    }
}

/// Inputs for pricing one player in one fixture.
#[derive(Debug, Clone, Copy)]
pub struct PlayerContext<'a> {
    pub snapshot: &'a FeatureSnapshot,
    pub team: Option<&'a TeamProfile>,
    pub opponent: Option<&'a TeamProfile>,
}

/// Full-match intensity components for one player and market.
#[derive(Debug, Clone, PartialEq)]
pub struct Intensity {
    pub market: Market,
    pub open_play_per90: f64,
    pub penalty_per90: f64,
    pub explanation: Explanation,
}

impl Intensity {
    pub fn per90(&self) -> f64 {
        self.open_play_per90 + self.penalty_per90
    }

    pub fn lambda_for_minutes(&self, minutes: f64) -> f64 {
        self.per90() * minutes.max(0.0) / 90.0
    }
}

fn critical(snapshot: &FeatureSnapshot, field: &str, value: Option<f64>) -> Result<f64> {
    let missing = || PricingError::CriticalDataMissing {
        player_id: snapshot.player_id.clone(),
        field: field.to_string(),
    };
    if snapshot.is_estimated(field) {
        return Err(missing());
    }
    match value {
        Some(v) if v.is_finite() && v >= 0.0 => Ok(v),
        _ => Err(missing()),
    }
}

/// Scale components down together so the total stays under the ceiling.
/// A total below [`MIN_LAMBDA`] is lifted through the open-play component.
fn cap_components(open: f64, pen: f64, max: f64, explanation: &mut Explanation) -> (f64, f64) {
    let total = open + pen;
    if total > max && total > 0.0 {
        let k = max / total;
        explanation.step("lambda_cap_scale", k);
        (open * k, pen * k)
    } else if total < MIN_LAMBDA {
        explanation.step("lambda_floor", MIN_LAMBDA);
        (MIN_LAMBDA - pen, pen)
    } else {
        (open, pen)
    }
}

pub fn goalscorer_intensity(ctx: PlayerContext<'_>, cfg: &EngineConfig) -> Result<Intensity> {
    let gs = &cfg.goalscorer;
    let snap = ctx.snapshot;
    let xg = critical(snap, "xg", snap.rates.xg)?;

    let mut explanation = Explanation::default();
    let conversion = InputValue::or_estimate(snap.conversion_rate, gs.default_conversion_rate);
    let opponent = opponent_factor(ctx.opponent, &cfg.opponent);
    let form = form_factor(&snap.recent_xg_per90, xg, gs.decay_per_match, gs.form_min, gs.form_max);
    let taker = match snap.penalty_taker {
        Some(t) if !snap.is_estimated("penalty_taker") => InputValue::observed(if t { 1.0 } else { 0.0 }),
        _ => InputValue::estimated(0.0),
    };
    let team_pens = InputValue::or_estimate(
        ctx.team.and_then(|t| t.penalties_won_per90),
        gs.default_team_penalties_per90,
    );

    explanation.input("xg_per90", InputValue::observed(xg));
    explanation.input("conversion_rate", conversion);
    explanation.input("opponent_factor", opponent);
    explanation.input("form_factor", form);
    explanation.input("penalty_taker", taker);
    explanation.input("team_penalties_per90", team_pens);

    let open = xg * conversion.value * opponent.value * form.value;
    let pen = taker.value * team_pens.value * gs.penalty_conversion;
    let (open, pen) = cap_components(open, pen, gs.max_lambda, &mut explanation);

    explanation.step("form_half_life_matches", half_life(gs.decay_per_match));
    explanation.step("penalty_conversion", gs.penalty_conversion);
    explanation.step("open_play_per90", open);
    explanation.step("penalty_per90", pen);
    explanation.step("lambda_per90", open + pen);

    Ok(Intensity {
        market: Market::AnytimeGoalscorer,
        open_play_per90: open,
        penalty_per90: pen,
        explanation,
    })
}

pub fn assist_intensity(ctx: PlayerContext<'_>, cfg: &EngineConfig) -> Result<Intensity> {
    let ac = &cfg.assist;
    let snap = ctx.snapshot;
    let xa = critical(snap, "xa", snap.rates.xa)?;

    let mut explanation = Explanation::default();
    let weights = snap
        .role_weights
        .unwrap_or_else(|| *ac.profiles.weights(snap.profile));
    weights.validate()?;
    let (composite, components) = creation_score(&snap.rates, &weights, &ac.league_averages);

    let finishing = InputValue::or_estimate(
        ctx.team.and_then(|t| t.finishing_factor),
        ac.default_teammate_finishing,
    );
    let opponent = opponent_factor(ctx.opponent, &cfg.opponent);
    let form = form_factor(&snap.recent_xa_per90, xa, ac.decay_per_match, ac.form_min, ac.form_max);

    explanation.input("xa_per90", InputValue::observed(xa));
    for c in &components {
        if c.name == "xa" {
            continue;
        }
        explanation.input(
            &format!("{}_per90", c.name),
            InputValue::or_estimate(c.raw, c.average),
        );
        explanation.step(&format!("component.{}", c.name), c.contribution());
    }
    explanation.input("teammate_finishing", finishing);
    explanation.input("opponent_factor", opponent);
    explanation.input("form_factor", form);
    explanation.step("component.xa", components[0].contribution());
    explanation.step("role_override", if snap.role_weights.is_some() { 1.0 } else { 0.0 });
    explanation.step("creation_score", composite);

    let open = composite * ac.lambda_scale * finishing.value * opponent.value * form.value;
    let (open, _) = cap_components(open, 0.0, ac.max_lambda, &mut explanation);

    explanation.step("form_half_life_matches", half_life(ac.decay_per_match));
    explanation.step("lambda_scale", ac.lambda_scale);
    explanation.step("open_play_per90", open);
    explanation.step("lambda_per90", open);

    Ok(Intensity {
        market: Market::AnytimeAssist,
        open_play_per90: open,
        penalty_per90: 0.0,
        explanation,
    })
}

pub fn intensity(market: Market, ctx: PlayerContext<'_>, cfg: &EngineConfig) -> Result<Intensity> {
    match market {
        Market::AnytimeGoalscorer => goalscorer_intensity(ctx, cfg),
        Market::AnytimeAssist => assist_intensity(ctx, cfg),
    }
}

/// Human-readable band for an event probability.
pub fn interpret(market: Market, p: f64) -> &'static str {
    match market {
        Market::AnytimeGoalscorer => {
            if p >= 0.5 {
                "Strong scoring threat - expected to score more often than not"
            } else if p >= 0.3 {
                "Solid scoring chance"
            } else if p >= 0.15 {
                "Moderate chance - typical for mid-tier forwards and midfielders"
            } else if p >= 0.05 {
                "Low probability - supplementary attacking threat"
            } else {
                "Very unlikely - defensive player or limited minutes expected"
            }
        }
        Market::AnytimeAssist => {
            if p >= 0.4 {
                "Elite creator - primary chance generator"
            } else if p >= 0.25 {
                "High assist threat - key playmaker role"
            } else if p >= 0.12 {
                "Moderate creator"
            } else if p >= 0.05 {
                "Occasional assists - secondary creative role"
            } else {
                "Rarely assists"
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pricing::profile::PositionProfile;
    use crate::store::models::{Per90Rates, Provenance};
    use approx::assert_relative_eq;
    use chrono::{TimeZone, Utc};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    pub(crate) fn snapshot(player: &str, xg: Option<f64>, xa: Option<f64>) -> FeatureSnapshot {
        FeatureSnapshot {
            player_id: player.into(),
            team_id: "home".into(),
            as_of: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            profile: PositionProfile::Forward,
            role_weights: None,
            rates: Per90Rates {
                xg,
                xa,
                ..Default::default()
            },
            conversion_rate: Some(1.0),
            penalty_taker: Some(false),
            availability: Default::default(),
            recent_xg_per90: vec![],
            recent_xa_per90: vec![],
            estimated_fields: vec![],
        }
    }

    #[test]
    fn poisson_worked_example() {
        assert_relative_eq!(poisson_at_least_one(0.61 + 0.12), 0.518, epsilon = 1e-3);
        assert_eq!(poisson_at_least_one(0.0), 0.0);
    }

    #[test]
    fn poisson_is_strictly_increasing() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..1000 {
            let a: f64 = rng.gen_range(0.0..5.0);
            let b: f64 = a + rng.gen_range(1e-6..1.0);
            assert!(poisson_at_least_one(a) < poisson_at_least_one(b));
        }
    }

    #[test]
    fn goalscorer_open_play_plus_penalty() {
        let mut snap = snapshot("p1", Some(0.61), None);
        snap.penalty_taker = Some(true);
        let team = TeamProfile {
            team_id: "home".into(),
            penalties_won_per90: Some(0.12 / 0.78),
            ..Default::default()
        };
        let ctx = PlayerContext {
            snapshot: &snap,
            team: Some(&team),
            opponent: None,
        };
        let i = goalscorer_intensity(ctx, &EngineConfig::default()).unwrap();
        assert_relative_eq!(i.open_play_per90, 0.61, epsilon = 1e-12);
        assert_relative_eq!(i.penalty_per90, 0.12, epsilon = 1e-12);
        assert_relative_eq!(i.lambda_for_minutes(90.0), 0.73, epsilon = 1e-12);
        assert_relative_eq!(
            poisson_at_least_one(i.lambda_for_minutes(90.0)),
            0.518,
            epsilon = 1e-3
        );
    }

    #[test]
    fn missing_xg_is_critical() {
        let snap = snapshot("p1", None, Some(0.2));
        let ctx = PlayerContext {
            snapshot: &snap,
            team: None,
            opponent: None,
        };
        let err = goalscorer_intensity(ctx, &EngineConfig::default()).unwrap_err();
        assert!(matches!(err, PricingError::CriticalDataMissing { ref field, .. } if field == "xg"));
    }

    #[test]
    fn estimated_xa_is_rejected() {
        let mut snap = snapshot("p1", Some(0.3), Some(0.2));
        snap.estimated_fields = vec!["xa".into()];
        let ctx = PlayerContext {
            snapshot: &snap,
            team: None,
            opponent: None,
        };
        assert!(matches!(
            assist_intensity(ctx, &EngineConfig::default()),
            Err(PricingError::CriticalDataMissing { .. })
        ));
        // The goalscorer model does not depend on xA.
        assert!(goalscorer_intensity(ctx, &EngineConfig::default()).is_ok());
    }

    #[test]
    fn secondary_inputs_flagged_estimated() {
        let mut snap = snapshot("p1", Some(0.4), None);
        snap.conversion_rate = None;
        snap.penalty_taker = None;
        let ctx = PlayerContext {
            snapshot: &snap,
            team: None,
            opponent: None,
        };
        let i = goalscorer_intensity(ctx, &EngineConfig::default()).unwrap();
        let inputs = &i.explanation.inputs;
        assert_eq!(inputs["xg_per90"].provenance, Provenance::Observed);
        assert_eq!(inputs["conversion_rate"].provenance, Provenance::Estimated);
        assert_eq!(inputs["penalty_taker"].provenance, Provenance::Estimated);
        assert_eq!(inputs["opponent_factor"].provenance, Provenance::Estimated);
        assert_eq!(i.penalty_per90, 0.0);
    }

    #[test]
    fn weak_defence_raises_intensity() {
        let snap = snapshot("p1", Some(0.5), None);
        let leaky = TeamProfile {
            team_id: "away".into(),
            xga_per90: Some(1.35 * 1.3),
            ..Default::default()
        };
        let ctx = PlayerContext {
            snapshot: &snap,
            team: None,
            opponent: Some(&leaky),
        };
        let i = goalscorer_intensity(ctx, &EngineConfig::default()).unwrap();
        assert_relative_eq!(i.open_play_per90, 0.65, epsilon = 1e-9);
    }

    #[test]
    fn lambda_ceiling_applies() {
        let snap = snapshot("p1", Some(5.0), None);
        let ctx = PlayerContext {
            snapshot: &snap,
            team: None,
            opponent: None,
        };
        let i = goalscorer_intensity(ctx, &EngineConfig::default()).unwrap();
        assert!(i.per90() <= 3.0 + 1e-12);
    }

    #[test]
    fn zero_xg_is_floored() {
        let snap = snapshot("p1", Some(0.0), Some(0.0));
        let ctx = PlayerContext {
            snapshot: &snap,
            team: None,
            opponent: None,
        };
        let cfg = EngineConfig::default();
        let goals = goalscorer_intensity(ctx, &cfg).unwrap();
        assert_relative_eq!(goals.per90(), MIN_LAMBDA, epsilon = 1e-15);
        assert_eq!(goals.explanation.intermediates.get("lambda_floor"), Some(&MIN_LAMBDA));
        let assists = assist_intensity(ctx, &cfg).unwrap();
        assert!(assists.per90() >= MIN_LAMBDA);
    }

    #[test]
    fn form_decay_weights_recent_matches_more() {
        let hot_recently = form_factor(&[0.8, 0.2, 0.2, 0.2], 0.4, 0.5, 0.5, 1.5);
        let hot_long_ago = form_factor(&[0.2, 0.2, 0.2, 0.8], 0.4, 0.5, 0.5, 1.5);
        assert!(hot_recently.value > hot_long_ago.value);
        assert_eq!(form_factor(&[], 0.4, 0.025, 0.5, 1.5), InputValue::estimated(1.0));
        assert_relative_eq!(half_life(0.025), 27.7259, epsilon = 1e-3);
    }

    #[test]
    fn assist_scales_with_creation_score() {
        let cfg = EngineConfig::default();
        let avg = &cfg.assist.league_averages;
        let mut snap = snapshot("p1", Some(0.1), Some(avg.xa));
        snap.profile = PositionProfile::AxialCreator;
        let ctx = PlayerContext {
            snapshot: &snap,
            team: None,
            opponent: None,
        };
        let base = assist_intensity(ctx, &cfg).unwrap();
        // Missing secondary metrics count as league-average: composite = 1.
        assert_relative_eq!(base.per90(), cfg.assist.lambda_scale, epsilon = 1e-12);

        let mut creator = snap.clone();
        creator.rates.xa = Some(avg.xa * 2.0);
        creator.rates.key_passes = Some(avg.key_passes * 2.0);
        let ctx = PlayerContext {
            snapshot: &creator,
            team: None,
            opponent: None,
        };
        let better = assist_intensity(ctx, &cfg).unwrap();
        assert!(better.per90() > base.per90());
    }

    #[test]
    fn role_override_replaces_profile_weights() {
        let cfg = EngineConfig::default();
        let mut snap = snapshot("p1", Some(0.1), Some(0.15));
        snap.rates.crosses = Some(8.0);
        snap.profile = PositionProfile::Forward; // forward weight on crosses is zero
        let ctx = PlayerContext {
            snapshot: &snap,
            team: None,
            opponent: None,
        };
        let as_forward = assist_intensity(ctx, &cfg).unwrap();

        let mut overridden = snap.clone();
        overridden.role_weights = Some(*cfg.assist.profiles.weights(PositionProfile::Wide));
        let ctx = PlayerContext {
            snapshot: &overridden,
            team: None,
            opponent: None,
        };
        let as_wide = assist_intensity(ctx, &cfg).unwrap();
        assert!(as_wide.per90() > as_forward.per90());
        assert_eq!(as_wide.explanation.intermediates["role_override"], 1.0);
    }
}
