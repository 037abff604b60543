//! Position-profile weight tables for the assist creation score.
//!
//! A profile is a tagged variant with an explicit weight map per variant; a
//! player's tactical role can override the table entry wholesale.

use serde::{Deserialize, Serialize};

use crate::error::{PricingError, Result};
use crate::store::models::Per90Rates;

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionProfile {
    /// Central midfielders and number 10s
    AxialCreator,
    /// Wingers and wing-backs
    Wide,
    Forward,
}

/// Weights over the normalized per-90 creation metrics. Must sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfileWeights {
    pub xa: f64,
    pub key_passes: f64,
    pub sca: f64,
    pub passes_into_box: f64,
    pub crosses: f64,
    pub progressive_passes: f64,
}

impl ProfileWeights {
    pub fn sum(&self) -> f64 {
        self.xa
            + self.key_passes
            + self.sca
            + self.passes_into_box
            + self.crosses
            + self.progressive_passes
    }

    pub fn validate(&self) -> Result<()> {
        let all = [
            self.xa,
            self.key_passes,
            self.sca,
            self.passes_into_box,
            self.crosses,
            self.progressive_passes,
        ];
        if all.iter().any(|w| *w < 0.0) || (self.sum() - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(PricingError::InvalidConfig(format!(
                "profile weights must be non-negative and sum to 1 (got {:.4})",
                self.sum()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileTable {
    pub axial_creator: ProfileWeights,
    pub wide: ProfileWeights,
    pub forward: ProfileWeights,
}

impl ProfileTable {
    pub fn weights(&self, profile: PositionProfile) -> &ProfileWeights {
        match profile {
            PositionProfile::AxialCreator => &self.axial_creator,
            PositionProfile::Wide => &self.wide,
            PositionProfile::Forward => &self.forward,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.axial_creator.validate()?;
        self.wide.validate()?;
        self.forward.validate()
    }
}

impl Default for ProfileTable {
    fn default() -> Self {
        ProfileTable {
            axial_creator: ProfileWeights {
                xa: 0.35,
                key_passes: 0.25,
                sca: 0.15,
                passes_into_box: 0.10,
                crosses: 0.05,
                progressive_passes: 0.10,
            },
            wide: ProfileWeights {
                xa: 0.30,
                key_passes: 0.15,
                sca: 0.15,
                passes_into_box: 0.10,
                crosses: 0.25,
                progressive_passes: 0.05,
            },
            forward: ProfileWeights {
                xa: 0.40,
                key_passes: 0.20,
                sca: 0.25,
                passes_into_box: 0.10,
                crosses: 0.0,
                progressive_passes: 0.05,
            },
        }
    }
}

/// League-average per-90 baselines used to normalize each metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeagueAverages {
    pub xa: f64,
    pub key_passes: f64,
    pub sca: f64,
    pub passes_into_box: f64,
    pub crosses: f64,
    pub progressive_passes: f64,
}

impl Default for LeagueAverages {
    fn default() -> Self {
        LeagueAverages {
            xa: 0.15,
            key_passes: 1.5,
            sca: 2.5,
            passes_into_box: 1.0,
            crosses: 2.0,
            progressive_passes: 4.0,
        }
    }
}

/// One metric's contribution to the creation score.
#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    pub name: &'static str,
    pub raw: Option<f64>,
    pub average: f64,
    pub normalized: f64,
    pub weight: f64,
}

impl Component {
    pub fn contribution(&self) -> f64 {
        self.normalized * self.weight
    }
}

fn normalize(raw: Option<f64>, average: f64) -> f64 {
    match raw {
        Some(v) if average > 0.0 => v / average,
        // Missing secondary metrics count as league-average.
        _ => 1.0,
    }
}

/// Weighted sum of league-normalized creation metrics (1.0 = league average).
pub fn creation_score(
    rates: &Per90Rates,
    weights: &ProfileWeights,
    averages: &LeagueAverages,
) -> (f64, Vec<Component>) {
    let components = vec![
        Component {
            name: "xa",
            raw: rates.xa,
            average: averages.xa,
            normalized: normalize(rates.xa, averages.xa),
            weight: weights.xa,
        },
        Component {
            name: "key_passes",
            raw: rates.key_passes,
            average: averages.key_passes,
            normalized: normalize(rates.key_passes, averages.key_passes),
            weight: weights.key_passes,
        },
        Component {
            name: "sca",
            raw: rates.sca,
            average: averages.sca,
            normalized: normalize(rates.sca, averages.sca),
            weight: weights.sca,
        },
        Component {
            name: "passes_into_box",
            raw: rates.passes_into_box,
            average: averages.passes_into_box,
            normalized: normalize(rates.passes_into_box, averages.passes_into_box),
            weight: weights.passes_into_box,
        },
        Component {
            name: "crosses",
            raw: rates.crosses,
            average: averages.crosses,
            normalized: normalize(rates.crosses, averages.crosses),
            weight: weights.crosses,
        },
        Component {
            name: "progressive_passes",
            raw: rates.progressive_passes,
            average: averages.progressive_passes,
            normalized: normalize(rates.progressive_passes, averages.progressive_passes),
            weight: weights.progressive_passes,
        },
    ];
    let score = components.iter().map(Component::contribution).sum();
    (score, components)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn default_tables_are_valid() {
        assert!(ProfileTable::default().validate().is_ok());
    }

    #[test]
    fn league_average_player_scores_one() {
        let avg = LeagueAverages::default();
        let rates = Per90Rates {
            xg: Some(0.2),
            xa: Some(avg.xa),
            key_passes: Some(avg.key_passes),
            sca: Some(avg.sca),
            passes_into_box: Some(avg.passes_into_box),
            crosses: Some(avg.crosses),
            progressive_passes: Some(avg.progressive_passes),
        };
        for profile in [
            PositionProfile::AxialCreator,
            PositionProfile::Wide,
            PositionProfile::Forward,
        ] {
            let (score, _) = creation_score(&rates, ProfileTable::default().weights(profile), &avg);
            assert_relative_eq!(score, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn wide_profile_rewards_crossing() {
        let avg = LeagueAverages::default();
        let table = ProfileTable::default();
        let rates = Per90Rates {
            xa: Some(0.15),
            crosses: Some(6.0),
            ..Default::default()
        };
        let (wide, _) = creation_score(&rates, table.weights(PositionProfile::Wide), &avg);
        let (axial, _) = creation_score(&rates, table.weights(PositionProfile::AxialCreator), &avg);
        assert!(wide > axial);
    }

    #[test]
    fn rejects_weights_not_summing_to_one() {
        let mut w = *ProfileTable::default().weights(PositionProfile::Forward);
        w.xa += 0.1;
        assert!(w.validate().is_err());
    }
}
