//! Bookmaker margin removal.
//!
//! Every method maps a complete selection set of decimal odds to clean
//! probabilities summing to 1.0 and fair odds `1 / p_clean`. Proportional is
//! the default; `Equal` and `Shin` are independent strategies selected by
//! configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::OddsConfig;
use crate::error::{PricingError, Result};
use crate::store::models::{FixtureId, Market, OddsSnapshot, PlayerId};

const SHIN_MAX_ITERS: usize = 100;
const SHIN_TOLERANCE: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverroundMethod {
    /// `p_i / Σp`
    #[default]
    Proportional,
    /// `p_i − (Σp − 1) / n`
    Equal,
    /// Shin (1993) insider-trading model
    Shin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanSelection {
    pub raw_odds: f64,
    pub implied: f64,
    pub probability: f64,
    pub fair_odds: f64,
}

/// A de-margined selection set for one bookmaker/market/fixture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMarket {
    pub fixture_id: FixtureId,
    pub market: Market,
    pub bookmaker: String,
    pub method: OverroundMethod,
    /// Raw Σ(1/odds)
    pub overround: f64,
    pub selections: BTreeMap<PlayerId, CleanSelection>,
}

impl NormalizedMarket {
    pub fn get(&self, player_id: &str) -> Option<&CleanSelection> {
        self.selections.get(player_id)
    }
}

/// A snapshot that failed normalization, kept so decisions can name the cause.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedBook {
    pub bookmaker: String,
    pub market: Market,
    pub players: Vec<PlayerId>,
    pub error: PricingError,
}

impl RejectedBook {
    pub fn quotes(&self, player_id: &str, market: Market) -> bool {
        self.market == market && self.players.iter().any(|p| p == player_id)
    }
}

/// Normalized books for one decision cycle plus the ones dropped.
#[derive(Debug, Clone, Default)]
pub struct Books {
    pub markets: Vec<NormalizedMarket>,
    pub rejected: Vec<RejectedBook>,
}

impl Books {
    pub fn extend(&mut self, other: Books) {
        self.markets.extend(other.markets);
        self.rejected.extend(other.rejected);
    }
}

pub fn implied_probabilities(odds: &[f64]) -> Vec<f64> {
    odds.iter().map(|o| 1.0 / o).collect()
}

/// Clean probabilities for a full selection set, in input order.
pub fn remove_margin(odds: &[f64], method: OverroundMethod, cfg: &OddsConfig) -> Result<Vec<f64>> {
    if odds.len() < 2 {
        return Err(PricingError::IncompleteMarket {
            selections: odds.len(),
        });
    }
    let implied = implied_probabilities(odds);
    let total: f64 = implied.iter().sum();
    if !total.is_finite()
        || odds.iter().any(|o| !(*o > 1.0) || !o.is_finite())
        || total < cfg.min_overround
        || total > cfg.max_overround
    {
        return Err(PricingError::MarginOutOfRange {
            implied_sum: total,
            min: cfg.min_overround,
            max: cfg.max_overround,
        });
    }

    let cleaned = match method {
        OverroundMethod::Proportional => proportional(&implied, total),
        OverroundMethod::Equal => equal(&implied, total),
        OverroundMethod::Shin => shin(&implied, total),
    };
    Ok(cleaned)
}

fn proportional(implied: &[f64], total: f64) -> Vec<f64> {
    implied.iter().map(|p| p / total).collect()
}

fn equal(implied: &[f64], total: f64) -> Vec<f64> {
    let per_selection = (total - 1.0) / implied.len() as f64;
    let shifted: Vec<f64> = implied
        .iter()
        .map(|p| (p - per_selection).max(f64::EPSILON))
        .collect();
    // Long shots can be pushed below zero by the flat shift; renormalise after flooring.
    let sum: f64 = shifted.iter().sum();
    shifted.iter().map(|p| p / sum).collect()
}

fn shin_probabilities(implied: &[f64], total: f64, z: f64) -> Vec<f64> {
    implied
        .iter()
        .map(|p| {
            let disc = z * z + 4.0 * (1.0 - z) * p * p / total;
            (disc.sqrt() - z) / (2.0 * (1.0 - z))
        })
        .collect()
}

fn shin(implied: &[f64], total: f64) -> Vec<f64> {
    if total <= 1.0 {
        return proportional(implied, total);
    }
    // Σp(z) decreases in z; bisect for Σp = 1.
    let (mut lo, mut hi) = (0.0f64, 0.999f64);
    for _ in 0..SHIN_MAX_ITERS {
        let mid = 0.5 * (lo + hi);
        let sum: f64 = shin_probabilities(implied, total, mid).iter().sum();
        if (sum - 1.0).abs() < SHIN_TOLERANCE {
            lo = mid;
            hi = mid;
            break;
        }
        if sum > 1.0 {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    let probs = shin_probabilities(implied, total, 0.5 * (lo + hi));
    let sum: f64 = probs.iter().sum();
    probs.iter().map(|p| p / sum).collect()
}

/// Normalize one bookmaker snapshot with the configured method.
pub fn normalize_snapshot(snapshot: &OddsSnapshot, cfg: &OddsConfig) -> Result<NormalizedMarket> {
    let (players, odds): (Vec<&PlayerId>, Vec<f64>) =
        snapshot.selections.iter().map(|(p, o)| (p, *o)).unzip();
    let cleaned = remove_margin(&odds, cfg.method, cfg)?;
    let overround: f64 = implied_probabilities(&odds).iter().sum();

    let selections = players
        .into_iter()
        .zip(odds.iter())
        .zip(cleaned)
        .map(|((player, raw), p)| {
            (
                player.clone(),
                CleanSelection {
                    raw_odds: *raw,
                    implied: 1.0 / raw,
                    probability: p,
                    fair_odds: 1.0 / p,
                },
            )
        })
        .collect();

    Ok(NormalizedMarket {
        fixture_id: snapshot.fixture_id.clone(),
        market: snapshot.market,
        bookmaker: snapshot.bookmaker.clone(),
        method: cfg.method,
        overround,
        selections,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn cfg() -> OddsConfig {
        OddsConfig::default()
    }

    #[test]
    fn proportional_matches_worked_example() {
        // Three named players plus the rest of the field at a 1.023 book.
        let rest = 1.0 / (1.023 - (1.0 / 2.20 + 1.0 / 3.50 + 1.0 / 9.00));
        let odds = [2.20, 3.50, 9.00, rest];
        let p = remove_margin(&odds, OverroundMethod::Proportional, &cfg()).unwrap();
        assert_relative_eq!(p[0], 0.4444, epsilon = 1e-3);
        assert_relative_eq!(p[1], 0.2793, epsilon = 1e-3);
        assert_relative_eq!(p[2], 0.1086, epsilon = 1e-3);
        assert_relative_eq!(p.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
        assert_relative_eq!(1.0 / p[0], 2.20 * 1.023, epsilon = 1e-6);
    }

    #[test]
    fn incomplete_market_rejected() {
        let err = remove_margin(&[1.9], OverroundMethod::Proportional, &cfg()).unwrap_err();
        assert_eq!(err, PricingError::IncompleteMarket { selections: 1 });
    }

    #[test]
    fn margin_outside_band_rejected() {
        // Σp ≈ 0.67: an arbitrage book is never a plausible complete market.
        let err = remove_margin(&[3.0, 3.0], OverroundMethod::Proportional, &cfg()).unwrap_err();
        assert!(matches!(err, PricingError::MarginOutOfRange { .. }));
        // Σp ≈ 1.54
        let err = remove_margin(&[1.3, 1.3], OverroundMethod::Proportional, &cfg()).unwrap_err();
        assert!(matches!(err, PricingError::MarginOutOfRange { .. }));
    }

    #[test]
    fn every_method_sums_to_one_and_round_trips() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let n = rng.gen_range(2..12);
            let fair: Vec<f64> = (0..n).map(|_| rng.gen_range(0.05..1.0)).collect();
            let fair_sum: f64 = fair.iter().sum();
            let margin = rng.gen_range(1.01..1.25);
            let odds: Vec<f64> = fair
                .iter()
                .map(|p| 1.0 / (p / fair_sum * margin))
                .collect();
            if odds.iter().any(|o| *o <= 1.0) {
                continue;
            }
            for method in [
                OverroundMethod::Proportional,
                OverroundMethod::Equal,
                OverroundMethod::Shin,
            ] {
                let p = remove_margin(&odds, method, &cfg()).unwrap();
                assert_relative_eq!(p.iter().sum::<f64>(), 1.0, epsilon = 1e-6);
                for pi in &p {
                    let fair_odds = 1.0 / pi;
                    assert_relative_eq!(1.0 / fair_odds, *pi, epsilon = 1e-12);
                }
            }
        }
    }

    #[test]
    fn shin_shades_longshots_more_than_proportional() {
        let odds = [1.45, 3.8, 11.0];
        let prop = remove_margin(&odds, OverroundMethod::Proportional, &cfg()).unwrap();
        let shin = remove_margin(&odds, OverroundMethod::Shin, &cfg()).unwrap();
        assert!(shin[2] < prop[2]);
        assert!(shin[0] > prop[0]);
    }

    #[test]
    fn normalize_snapshot_keys_by_player() {
        let snapshot = OddsSnapshot {
            bookmaker: "pinnacle".into(),
            market: Market::AnytimeGoalscorer,
            fixture_id: "f1".into(),
            selections: [("a".to_string(), 1.9), ("b".to_string(), 1.9)]
                .into_iter()
                .collect(),
            ingested_at: chrono::Utc::now(),
        };
        let m = normalize_snapshot(&snapshot, &cfg()).unwrap();
        let a = m.get("a").unwrap();
        assert_relative_eq!(a.probability, 0.5, epsilon = 1e-12);
        assert_relative_eq!(a.fair_odds, 2.0, epsilon = 1e-12);
        assert_relative_eq!(m.overround, 2.0 / 1.9, epsilon = 1e-12);
    }
}
