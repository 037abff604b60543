//! Bottom-up vs top-down intensity allocation.
//!
//! Top-down mode takes an operator-supplied team expected-goals total and
//! rescales every player's bottom-up intensity by the same factor, keeping
//! each player's share of the team distribution.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{PricingError, Result};
use crate::store::models::PlayerId;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AllocationStrategy {
    #[default]
    BottomUp,
    TopDown { team_total: f64 },
}

impl AllocationStrategy {
    pub fn from_override(team_total: Option<f64>) -> Self {
        match team_total {
            Some(team_total) => AllocationStrategy::TopDown { team_total },
            None => AllocationStrategy::BottomUp,
        }
    }

    pub fn is_override(&self) -> bool {
        matches!(self, AllocationStrategy::TopDown { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub raw_lambda: f64,
    pub lambda: f64,
    pub scale: f64,
}

/// `override_total / Σλ_bottom_up`
pub fn scale_factor(team_total: f64, bottom_up_total: f64) -> Result<f64> {
    if !team_total.is_finite() || team_total < 0.0 {
        return Err(PricingError::InvalidConfig(format!(
            "team xG override must be a non-negative number (got {team_total})"
        )));
    }
    if !(bottom_up_total > 0.0) {
        return Err(PricingError::InvalidConfig(
            "team xG override needs a positive bottom-up total to distribute".into(),
        ));
    }
    Ok(team_total / bottom_up_total)
}

/// Allocate one team's intensities under `strategy`.
pub fn allocate(
    strategy: AllocationStrategy,
    bottom_up: &BTreeMap<PlayerId, f64>,
) -> Result<BTreeMap<PlayerId, Allocation>> {
    let scale = match strategy {
        AllocationStrategy::BottomUp => 1.0,
        AllocationStrategy::TopDown { team_total } => {
            scale_factor(team_total, bottom_up.values().sum())?
        }
    };
    Ok(bottom_up
        .iter()
        .map(|(player, raw)| {
            (
                player.clone(),
                Allocation {
                    raw_lambda: *raw,
                    lambda: raw * scale,
                    scale,
                },
            )
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn team() -> BTreeMap<PlayerId, f64> {
        [("a", 0.40), ("b", 0.30), ("c", 0.20)]
            .into_iter()
            .map(|(p, l)| (p.to_string(), l))
            .collect()
    }

    #[test]
    fn override_worked_example() {
        let out = allocate(AllocationStrategy::TopDown { team_total: 2.5 }, &team()).unwrap();
        assert_relative_eq!(out["a"].lambda, 1.111, epsilon = 1e-3);
        assert_relative_eq!(out["b"].lambda, 0.833, epsilon = 1e-3);
        assert_relative_eq!(out["c"].lambda, 0.556, epsilon = 1e-3);
        assert_relative_eq!(out.values().map(|a| a.lambda).sum::<f64>(), 2.5, epsilon = 1e-12);
        assert_eq!(out["a"].raw_lambda, 0.40);
    }

    #[test]
    fn shares_are_preserved() {
        let out = allocate(AllocationStrategy::TopDown { team_total: 1.7 }, &team()).unwrap();
        assert_relative_eq!(out["a"].lambda / out["c"].lambda, 2.0, epsilon = 1e-12);
    }

    #[test]
    fn bottom_up_is_identity() {
        let out = allocate(AllocationStrategy::BottomUp, &team()).unwrap();
        for (p, raw) in team() {
            assert_eq!(out[&p].lambda, raw);
            assert_eq!(out[&p].scale, 1.0);
        }
        assert!(!AllocationStrategy::from_override(None).is_override());
    }

    #[test]
    fn empty_or_negative_override_rejected() {
        assert!(allocate(AllocationStrategy::TopDown { team_total: 2.0 }, &BTreeMap::new()).is_err());
        assert!(allocate(AllocationStrategy::TopDown { team_total: -1.0 }, &team()).is_err());
    }
}
