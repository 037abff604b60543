//! Fixture phase machine and minutes-scenario mixer.
//!
//! EARLY blends four minute scenarios weighted by historical selection
//! behaviour. LINEUP collapses to the single confirmed scenario, so the mixed
//! probability is exactly that scenario's conditional probability.

use serde::{Deserialize, Serialize};

use crate::config::ScenarioConfig;
use crate::error::{PricingError, Result};
use crate::pricing::intensity::{poisson_at_least_one, Intensity};
use crate::store::models::{
    Availability, Explanation, InputValue, LineupConfirmation, Phase, SelectionStatus,
};

/// Per-fixture phase. The only transition is EARLY → LINEUP; a newer lineup
/// confirmation may replace an older one while in LINEUP.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FixturePhase {
    #[default]
    Early,
    Lineup { lineup: LineupConfirmation },
}

impl FixturePhase {
    pub fn phase(&self) -> Phase {
        match self {
            FixturePhase::Early => Phase::Early,
            FixturePhase::Lineup { .. } => Phase::Lineup,
        }
    }

    pub fn lineup(&self) -> Option<&LineupConfirmation> {
        match self {
            FixturePhase::Early => None,
            FixturePhase::Lineup { lineup } => Some(lineup),
        }
    }

    /// Apply a lineup confirmation.
    pub fn confirm(&mut self, lineup: LineupConfirmation) -> Result<()> {
        if let FixturePhase::Lineup { lineup: current } = self {
            if lineup.fixture_id != current.fixture_id || lineup.confirmed_at < current.confirmed_at {
                return Err(PricingError::InvalidPhaseTransition {
                    from: Phase::Lineup,
                    to: Phase::Lineup,
                });
            }
        }
        *self = FixturePhase::Lineup { lineup };
        Ok(())
    }

    /// Move to `target`, rejecting any backwards step.
    pub fn transition(&mut self, target: Phase, lineup: Option<LineupConfirmation>) -> Result<()> {
        match (self.phase(), target, lineup) {
            (Phase::Early, Phase::Early, _) => Ok(()),
            (_, Phase::Lineup, Some(lineup)) => self.confirm(lineup),
            (from, to, _) => Err(PricingError::InvalidPhaseTransition { from, to }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioKind {
    StartsFullMatch,
    StartsPartial,
    FromBench,
    DoesNotPlay,
    ConfirmedStarter,
    ConfirmedBench,
}

impl ScenarioKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioKind::StartsFullMatch => "starts_full_match",
            ScenarioKind::StartsPartial => "starts_partial",
            ScenarioKind::FromBench => "from_bench",
            ScenarioKind::DoesNotPlay => "does_not_play",
            ScenarioKind::ConfirmedStarter => "confirmed_starter",
            ScenarioKind::ConfirmedBench => "confirmed_bench",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinuteScenario {
    pub kind: ScenarioKind,
    pub weight: f64,
    pub minutes: f64,
    pub lambda: f64,
    /// `P(event ≥ 1 | scenario)`
    pub probability: f64,
}

impl MinuteScenario {
    fn new(kind: ScenarioKind, weight: f64, minutes: f64, intensity: &Intensity) -> Self {
        let lambda = intensity.lambda_for_minutes(minutes);
        MinuteScenario {
            kind,
            weight,
            minutes,
            lambda,
            probability: poisson_at_least_one(lambda),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioMix {
    pub phase: Phase,
    pub status: SelectionStatus,
    pub scenarios: Vec<MinuteScenario>,
}

impl ScenarioMix {
    pub fn weight_sum(&self) -> f64 {
        self.scenarios.iter().map(|s| s.weight).sum()
    }

    /// `Σ weight × P(event | scenario)`
    pub fn probability(&self) -> f64 {
        match self.scenarios.as_slice() {
            [only] => only.probability,
            all => all.iter().map(|s| s.weight * s.probability).sum(),
        }
    }

    pub fn expected_minutes(&self) -> f64 {
        self.scenarios.iter().map(|s| s.weight * s.minutes).sum()
    }

    /// Mixture-mean intensity; the quantity the override allocator rescales.
    pub fn expected_lambda(&self) -> f64 {
        self.scenarios.iter().map(|s| s.weight * s.lambda).sum()
    }

    /// Rescale every scenario's intensity by `k`, keeping weights and minutes.
    pub fn scaled(&self, k: f64) -> ScenarioMix {
        let scenarios = self
            .scenarios
            .iter()
            .map(|s| {
                let lambda = s.lambda * k;
                MinuteScenario {
                    lambda,
                    probability: poisson_at_least_one(lambda),
                    ..s.clone()
                }
            })
            .collect();
        ScenarioMix {
            scenarios,
            ..self.clone()
        }
    }

    pub fn record(&self, explanation: &mut Explanation) {
        for s in &self.scenarios {
            let name = s.kind.as_str();
            explanation.step(&format!("scenario.{name}.weight"), s.weight);
            explanation.step(&format!("scenario.{name}.minutes"), s.minutes);
            explanation.step(&format!("scenario.{name}.lambda"), s.lambda);
            explanation.step(&format!("scenario.{name}.probability"), s.probability);
        }
        explanation.step("projected_minutes", self.expected_minutes());
        explanation.step("expected_lambda", self.expected_lambda());
    }
}

fn rate(value: Option<f64>, fallback: f64) -> InputValue {
    let mut v = InputValue::or_estimate(value, fallback);
    v.value = v.value.clamp(0.0, 1.0);
    v
}

fn minutes(value: Option<f64>, fallback: f64, ceiling: f64) -> InputValue {
    let mut v = InputValue::or_estimate(value.filter(|m| *m >= 0.0), fallback);
    v.value = v.value.min(ceiling);
    v
}

/// Statistical minutes projection before the lineup is known.
pub fn early_mix(
    intensity: &Intensity,
    availability: &Availability,
    cfg: &ScenarioConfig,
    explanation: &mut Explanation,
) -> ScenarioMix {
    let s = rate(availability.start_rate, cfg.default_start_rate);
    let f = rate(availability.full_match_rate, cfg.default_full_match_rate);
    let b = rate(availability.bench_appearance_rate, cfg.default_bench_appearance_rate);
    let partial = minutes(
        availability.avg_partial_minutes,
        cfg.default_partial_minutes,
        cfg.full_match_minutes,
    );
    let bench = minutes(
        availability.avg_bench_minutes,
        cfg.default_bench_minutes,
        cfg.full_match_minutes,
    );
    explanation.input("start_rate", s);
    explanation.input("full_match_rate", f);
    explanation.input("bench_appearance_rate", b);
    explanation.input("avg_partial_minutes", partial);
    explanation.input("avg_bench_minutes", bench);

    let (s, f, b) = (s.value, f.value, b.value);
    ScenarioMix {
        phase: Phase::Early,
        status: SelectionStatus::Projected,
        scenarios: vec![
            MinuteScenario::new(ScenarioKind::StartsFullMatch, s * f, cfg.full_match_minutes, intensity),
            MinuteScenario::new(ScenarioKind::StartsPartial, s * (1.0 - f), partial.value, intensity),
            MinuteScenario::new(ScenarioKind::FromBench, (1.0 - s) * b, bench.value, intensity),
            MinuteScenario::new(ScenarioKind::DoesNotPlay, (1.0 - s) * (1.0 - b), 0.0, intensity),
        ],
    }
}

/// Confirmed status: one scenario with weight 1.
pub fn lineup_mix(
    intensity: &Intensity,
    availability: &Availability,
    starter: bool,
    cfg: &ScenarioConfig,
    explanation: &mut Explanation,
) -> ScenarioMix {
    let (kind, status, mins) = if starter {
        let m = minutes(
            availability.avg_starter_minutes,
            cfg.default_starter_minutes,
            cfg.full_match_minutes,
        );
        explanation.input("avg_starter_minutes", m);
        (ScenarioKind::ConfirmedStarter, SelectionStatus::ConfirmedStarter, m.value)
    } else {
        // A benched player's expected minutes: appearance rate × cameo length.
        let b = rate(availability.bench_appearance_rate, cfg.default_bench_appearance_rate);
        let m = minutes(
            availability.avg_bench_minutes,
            cfg.default_bench_minutes,
            cfg.full_match_minutes,
        );
        explanation.input("bench_appearance_rate", b);
        explanation.input("avg_bench_minutes", m);
        (ScenarioKind::ConfirmedBench, SelectionStatus::ConfirmedBench, b.value * m.value)
    };
    ScenarioMix {
        phase: Phase::Lineup,
        status,
        scenarios: vec![MinuteScenario::new(kind, 1.0, mins, intensity)],
    }
}

/// Build the mix appropriate to the fixture's current phase.
pub fn mix_for_phase(
    phase: &FixturePhase,
    player_id: &str,
    intensity: &Intensity,
    availability: &Availability,
    cfg: &ScenarioConfig,
    explanation: &mut Explanation,
) -> ScenarioMix {
    let mix = match phase {
        FixturePhase::Early => early_mix(intensity, availability, cfg, explanation),
        FixturePhase::Lineup { lineup } => lineup_mix(
            intensity,
            availability,
            lineup.is_starter(player_id),
            cfg,
            explanation,
        ),
    };
    explanation.step("scenario_weight_sum", mix.weight_sum());
    mix
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::Market;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone, Utc};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn intensity(per90: f64) -> Intensity {
        Intensity {
            market: Market::AnytimeGoalscorer,
            open_play_per90: per90,
            penalty_per90: 0.0,
            explanation: Explanation::default(),
        }
    }

    fn lineup(at_minutes: i64, starters: &[&str]) -> LineupConfirmation {
        LineupConfirmation {
            fixture_id: "f1".into(),
            home_starters: starters.iter().map(|s| s.to_string()).collect(),
            away_starters: vec![],
            confirmed_at: Utc.with_ymd_and_hms(2024, 3, 2, 14, 0, 0).unwrap()
                + Duration::minutes(at_minutes),
        }
    }

    #[test]
    fn early_weights_sum_to_one() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..500 {
            let availability = Availability {
                start_rate: Some(rng.gen_range(0.0..=1.0)),
                full_match_rate: Some(rng.gen_range(0.0..=1.0)),
                bench_appearance_rate: Some(rng.gen_range(0.0..=1.0)),
                ..Default::default()
            };
            let mix = early_mix(
                &intensity(0.5),
                &availability,
                &ScenarioConfig::default(),
                &mut Explanation::default(),
            );
            assert_eq!(mix.scenarios.len(), 4);
            assert_relative_eq!(mix.weight_sum(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn lineup_probability_is_the_single_conditional() {
        let mut explanation = Explanation::default();
        let mix = lineup_mix(
            &intensity(0.73),
            &Availability {
                avg_starter_minutes: Some(90.0),
                ..Default::default()
            },
            true,
            &ScenarioConfig::default(),
            &mut explanation,
        );
        assert_eq!(mix.scenarios.len(), 1);
        assert_eq!(mix.weight_sum(), 1.0);
        assert_eq!(mix.probability(), poisson_at_least_one(0.73));
        assert_eq!(mix.status, SelectionStatus::ConfirmedStarter);
    }

    #[test]
    fn regular_partial_starter_projects_sixty_five_minutes() {
        let availability = Availability {
            start_rate: Some(1.0),
            full_match_rate: Some(0.0),
            ..Default::default()
        };
        let mix = early_mix(
            &intensity(0.5),
            &availability,
            &ScenarioConfig::default(),
            &mut Explanation::default(),
        );
        assert_relative_eq!(mix.expected_minutes(), 65.0, epsilon = 1e-12);
    }

    #[test]
    fn missing_availability_is_estimated() {
        let mut explanation = Explanation::default();
        early_mix(
            &intensity(0.5),
            &Availability::default(),
            &ScenarioConfig::default(),
            &mut explanation,
        );
        assert!(explanation.has_estimated("start_rate"));
        assert!(explanation.has_estimated("avg_partial_minutes"));
    }

    #[test]
    fn scaling_preserves_weights() {
        let mix = early_mix(
            &intensity(0.4),
            &Availability::default(),
            &ScenarioConfig::default(),
            &mut Explanation::default(),
        );
        let scaled = mix.scaled(2.0);
        assert_relative_eq!(scaled.expected_lambda(), 2.0 * mix.expected_lambda(), epsilon = 1e-12);
        assert_relative_eq!(scaled.weight_sum(), 1.0, epsilon = 1e-12);
        assert!(scaled.probability() > mix.probability());
    }

    #[test]
    fn phase_only_moves_forward() {
        let mut phase = FixturePhase::default();
        assert_eq!(phase.phase(), Phase::Early);
        phase.confirm(lineup(0, &["p1"])).unwrap();
        assert_eq!(phase.phase(), Phase::Lineup);

        let err = phase.transition(Phase::Early, None).unwrap_err();
        assert_eq!(
            err,
            PricingError::InvalidPhaseTransition {
                from: Phase::Lineup,
                to: Phase::Early
            }
        );

        // A later correction is accepted, an older confirmation is not.
        phase.confirm(lineup(10, &["p2"])).unwrap();
        assert!(phase.lineup().unwrap().is_starter("p2"));
        assert!(phase.confirm(lineup(5, &["p1"])).is_err());
    }

    #[test]
    fn bench_player_in_lineup_gets_cameo_minutes() {
        let mut phase = FixturePhase::Early;
        phase.confirm(lineup(0, &["p1"])).unwrap();
        let mix = mix_for_phase(
            &phase,
            "p9",
            &intensity(0.5),
            &Availability {
                bench_appearance_rate: Some(0.5),
                avg_bench_minutes: Some(20.0),
                ..Default::default()
            },
            &ScenarioConfig::default(),
            &mut Explanation::default(),
        );
        assert_eq!(mix.status, SelectionStatus::ConfirmedBench);
        assert_relative_eq!(mix.expected_minutes(), 10.0, epsilon = 1e-12);
    }
}
