//! Exposure caps and correlation control.
//!
//! Caps apply per match, per player (EARLY and LINEUP stakes summed) and per
//! matchday. A breach rejects the candidate outright; stakes are never shrunk
//! to fit. Correlation with bets already in the book is scored pairwise and
//! discounts the stake of highly correlated candidates before the cap check.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::config::ExposureConfig;
use crate::error::{PricingError, Result};
use crate::store::models::{DecisionKey, FixtureId, Market, Phase, PlayerId};

/// A stake held against the caps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exposure {
    pub fixture_id: FixtureId,
    pub player_id: PlayerId,
    pub team_id: String,
    pub market: Market,
    pub phase: Phase,
    pub bookmaker: Option<String>,
    /// Matchday the stake counts against
    pub day: NaiveDate,
    pub stake: f64,
    /// Operator-approved stakes are permanent; recommendations can be re-priced.
    #[serde(default)]
    pub executed: bool,
}

impl Exposure {
    pub fn key(&self) -> DecisionKey {
        DecisionKey {
            fixture_id: self.fixture_id.clone(),
            player_id: self.player_id.clone(),
            market: self.market,
            bookmaker: self.bookmaker.clone(),
        }
    }

    fn same_slot(&self, other: &Exposure) -> bool {
        !self.executed && !other.executed && self.phase == other.phase && self.key() == other.key()
    }
}

/// Pairwise correlation between two player-prop bets.
pub fn correlation(a: &Exposure, b: &Exposure) -> f64 {
    let same_fixture = a.fixture_id == b.fixture_id;
    let same_team = a.team_id == b.team_id;
    if a.player_id == b.player_id {
        0.9
    } else if same_fixture && same_team {
        0.7
    } else if same_fixture {
        0.5
    } else if same_team {
        0.3
    } else {
        0.1
    }
}

/// Stake discount applied to a flagged candidate.
pub fn correlation_discount(rho: f64, cfg: &ExposureConfig) -> f64 {
    if rho >= cfg.correlation_flag_threshold {
        (1.0 - cfg.correlation_discount * rho).max(0.0)
    } else {
        1.0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExposureBook {
    entries: Vec<Exposure>,
}

impl ExposureBook {
    /// Entries other than the one `candidate` would replace.
    fn others<'a>(&'a self, candidate: &'a Exposure) -> impl Iterator<Item = &'a Exposure> + 'a {
        self.entries.iter().filter(move |e| !e.same_slot(candidate))
    }

    pub fn match_total(&self, fixture_id: &str) -> f64 {
        self.entries
            .iter()
            .filter(|e| e.fixture_id == fixture_id)
            .map(|e| e.stake)
            .sum()
    }

    pub fn player_total(&self, player_id: &str) -> f64 {
        self.entries
            .iter()
            .filter(|e| e.player_id == player_id)
            .map(|e| e.stake)
            .sum()
    }

    pub fn day_total(&self, day: NaiveDate) -> f64 {
        self.entries
            .iter()
            .filter(|e| e.day == day)
            .map(|e| e.stake)
            .sum()
    }

    /// Highest correlation between `candidate` and anything already held.
    pub fn max_correlation(&self, candidate: &Exposure) -> Option<f64> {
        self.others(candidate)
            .map(|e| correlation(candidate, e))
            .max_by(|a, b| a.total_cmp(b))
    }

    /// Reject if adding `candidate` would breach any cap.
    pub fn check(&self, candidate: &Exposure, cfg: &ExposureConfig) -> Result<()> {
        let mut by_match = 0.0;
        let mut by_player = 0.0;
        let mut by_day = 0.0;
        for e in self.others(candidate) {
            if e.fixture_id == candidate.fixture_id {
                by_match += e.stake;
            }
            if e.player_id == candidate.player_id {
                by_player += e.stake;
            }
            if e.day == candidate.day {
                by_day += e.stake;
            }
        }
        for (cap, current, limit) in [
            ("match", by_match, cfg.max_per_match),
            ("player", by_player, cfg.max_per_player),
            ("day", by_day, cfg.max_per_day),
        ] {
            if current + candidate.stake > limit + 1e-9 {
                return Err(PricingError::ExposureCapExceeded {
                    cap: cap.to_string(),
                    current,
                    stake: candidate.stake,
                    limit,
                });
            }
        }
        Ok(())
    }

    /// Hold `exposure`, replacing any pending stake for the same key and phase.
    pub fn record(&mut self, exposure: Exposure) {
        self.entries.retain(|e| !e.same_slot(&exposure));
        self.entries.push(exposure);
    }

    /// Drop pending recommendations for a fixture's phase ahead of a re-price.
    pub fn release_pending(&mut self, fixture_id: &str, phase: Phase) {
        self.entries
            .retain(|e| e.executed || e.fixture_id != fixture_id || e.phase != phase);
    }

    /// Convert a pending stake into an executed one. Returns false if none was held.
    pub fn mark_executed(&mut self, key: &DecisionKey, phase: Phase) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|e| !e.executed && e.phase == phase && &e.key() == key)
        {
            Some(e) => {
                e.executed = true;
                true
            }
            None => false,
        }
    }

    /// Drop every stake on a fixture whose result is in. Returns the count removed.
    pub fn settle(&mut self, fixture_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.fixture_id != fixture_id);
        before - self.entries.len()
    }

    /// Drop stakes for matchdays before `day`; they can no longer share a cap
    /// with a new candidate.
    pub fn prune_before(&mut self, day: NaiveDate) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.day >= day);
        before - self.entries.len()
    }

    pub fn entries(&self) -> &[Exposure] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bet(fixture: &str, player: &str, team: &str, phase: Phase, stake: f64) -> Exposure {
        Exposure {
            fixture_id: fixture.into(),
            player_id: player.into(),
            team_id: team.into(),
            market: Market::AnytimeGoalscorer,
            phase,
            bookmaker: Some("book".into()),
            day: NaiveDate::from_ymd_opt(2024, 3, 2).unwrap(),
            stake,
            executed: false,
        }
    }

    #[test]
    fn correlation_scores() {
        let a = bet("f1", "p1", "t1", Phase::Early, 10.0);
        let mut assist = a.clone();
        assist.market = Market::AnytimeAssist;
        assert_eq!(correlation(&a, &assist), 0.9);
        assert_eq!(correlation(&a, &bet("f1", "p2", "t1", Phase::Early, 1.0)), 0.7);
        assert_eq!(correlation(&a, &bet("f1", "p3", "t2", Phase::Early, 1.0)), 0.5);
        assert_eq!(correlation(&a, &bet("f2", "p4", "t1", Phase::Early, 1.0)), 0.3);
        assert_eq!(correlation(&a, &bet("f2", "p5", "t9", Phase::Early, 1.0)), 0.1);
    }

    #[test]
    fn player_cap_sums_both_phases() {
        let cfg = ExposureConfig::default();
        let mut book = ExposureBook::default();
        book.record(bet("f1", "p1", "t1", Phase::Early, 15.0));
        let lineup = bet("f1", "p1", "t1", Phase::Lineup, 15.0);
        let err = book.check(&lineup, &cfg).unwrap_err();
        assert!(matches!(err, PricingError::ExposureCapExceeded { ref cap, .. } if cap == "player"));

        // Re-pricing the same phase replaces rather than stacks.
        let repriced = bet("f1", "p1", "t1", Phase::Early, 20.0);
        assert!(book.check(&repriced, &cfg).is_ok());
        book.record(repriced);
        assert_eq!(book.player_total("p1"), 20.0);
    }

    #[test]
    fn match_and_day_caps() {
        let cfg = ExposureConfig {
            max_per_match: 30.0,
            max_per_day: 40.0,
            ..Default::default()
        };
        let mut book = ExposureBook::default();
        book.record(bet("f1", "p1", "t1", Phase::Lineup, 20.0));
        assert!(matches!(
            book.check(&bet("f1", "p2", "t1", Phase::Lineup, 15.0), &cfg),
            Err(PricingError::ExposureCapExceeded { ref cap, .. }) if cap == "match"
        ));
        book.record(bet("f2", "p3", "t3", Phase::Lineup, 15.0));
        assert!(matches!(
            book.check(&bet("f3", "p4", "t4", Phase::Lineup, 10.0), &cfg),
            Err(PricingError::ExposureCapExceeded { ref cap, .. }) if cap == "day"
        ));
        assert_eq!(book.day_total(NaiveDate::from_ymd_opt(2024, 3, 2).unwrap()), 35.0);
        assert_eq!(book.match_total("f1"), 20.0);
    }

    #[test]
    fn flagged_correlation_discounts_stake() {
        let cfg = ExposureConfig::default();
        let mut book = ExposureBook::default();
        book.record(bet("f1", "p1", "t1", Phase::Lineup, 10.0));
        let rho = book.max_correlation(&bet("f1", "p2", "t1", Phase::Lineup, 10.0)).unwrap();
        assert_eq!(rho, 0.7);
        assert!((correlation_discount(rho, &cfg) - 0.65).abs() < 1e-12);
        assert_eq!(correlation_discount(0.3, &cfg), 1.0);
    }

    #[test]
    fn settled_and_past_stakes_leave_the_book() {
        let cfg = ExposureConfig::default();
        let mut book = ExposureBook::default();
        let placed = bet("f1", "p1", "t1", Phase::Lineup, 20.0);
        book.record(placed.clone());
        assert!(book.mark_executed(&placed.key(), Phase::Lineup));
        book.record(bet("f2", "p2", "t2", Phase::Lineup, 5.0));

        // The executed stake holds the player cap until the fixture settles.
        let next_week = Exposure {
            fixture_id: "f9".into(),
            day: NaiveDate::from_ymd_opt(2024, 3, 9).unwrap(),
            ..bet("f9", "p1", "t1", Phase::Lineup, 10.0)
        };
        assert!(book.check(&next_week, &cfg).is_err());
        assert_eq!(book.settle("f1"), 1);
        assert!(book.check(&next_week, &cfg).is_ok());
        assert_eq!(book.player_total("p1"), 0.0);

        book.record(next_week);
        assert_eq!(book.prune_before(NaiveDate::from_ymd_opt(2024, 3, 9).unwrap()), 1);
        assert_eq!(book.entries().len(), 1);
        assert_eq!(book.entries()[0].fixture_id, "f9");
    }

    #[test]
    fn release_keeps_executed_stakes() {
        let mut book = ExposureBook::default();
        let placed = bet("f1", "p1", "t1", Phase::Early, 10.0);
        book.record(placed.clone());
        assert!(book.mark_executed(&placed.key(), Phase::Early));
        book.record(bet("f1", "p2", "t1", Phase::Early, 5.0));
        book.release_pending("f1", Phase::Early);
        assert_eq!(book.entries().len(), 1);
        assert!(book.entries()[0].executed);

        // A fresh recommendation on an executed key stacks on top of it.
        book.record(placed);
        assert_eq!(book.player_total("p1"), 20.0);
    }
}
