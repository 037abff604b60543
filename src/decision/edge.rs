/// Edge and stake sizing.
///
/// Edge is computed two ways and the results must agree:
///   edge = p_model × odds_clean − 1
///   edge = odds_clean / odds_fair − 1,   odds_fair = 1 / p_model
///
/// Kelly sizing follows
///   f* = (b·p − q) / b
/// where
///   b  = net decimal odds received (odds − 1)
///   p  = model probability of winning
///   q  = 1 − p
/// scaled by a fractional multiplier to reduce variance.
use serde::{Deserialize, Serialize};

use crate::config::StakingConfig;
use crate::error::{PricingError, Result};
use crate::store::models::Phase;

/// Absolute agreement required between the two edge forms.
pub const EDGE_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StakingMethod {
    /// `unit × phase multiplier`
    #[default]
    Flat,
    /// Fractional Kelly on a notional bankroll, then the phase multiplier
    Kelly,
}

/// Zero-margin odds for a probability. Infinite when the event is impossible.
pub fn fair_odds(probability: f64) -> f64 {
    if probability <= 0.0 {
        f64::INFINITY
    } else {
        1.0 / probability
    }
}

pub fn edge_by_probability(model_prob: f64, clean_odds: f64) -> f64 {
    model_prob * clean_odds - 1.0
}

pub fn edge_by_odds(clean_odds: f64, fair: f64) -> f64 {
    clean_odds / fair - 1.0
}

/// Both edge forms, cross-checked.
pub fn edge(model_prob: f64, clean_odds: f64) -> Result<f64> {
    let by_probability = edge_by_probability(model_prob, clean_odds);
    let by_odds = edge_by_odds(clean_odds, fair_odds(model_prob));
    if !by_probability.is_finite()
        || !by_odds.is_finite()
        || (by_probability - by_odds).abs() > EDGE_TOLERANCE
    {
        return Err(PricingError::InconsistentEdge {
            by_probability,
            by_odds,
        });
    }
    Ok(by_probability)
}

/// Kelly fraction of bankroll for decimal `odds`.
///
/// Returns `0.0` when expected value is non-positive.
pub fn kelly_fraction(win_prob: f64, odds: f64, kelly_multiplier: f64) -> f64 {
    if odds <= 1.0 || win_prob <= 0.0 || win_prob >= 1.0 {
        return 0.0;
    }

    let b = odds - 1.0;
    let p = win_prob;
    let q = 1.0 - p;

    let f = (b * p - q) / b;

    if f <= 0.0 {
        return 0.0; // no edge
    }

    (f * kelly_multiplier).clamp(0.0, 1.0)
}

pub(crate) fn round_cents(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Suggested stake before exposure and correlation control.
pub fn stake(win_prob: f64, odds: f64, phase: Phase, cfg: &StakingConfig) -> f64 {
    let base = match cfg.method {
        StakingMethod::Flat => cfg.unit,
        StakingMethod::Kelly => cfg.bankroll * kelly_fraction(win_prob, odds, cfg.kelly_fraction),
    };
    round_cents((base * cfg.multiplier(phase)).clamp(0.0, cfg.max_stake))
}
