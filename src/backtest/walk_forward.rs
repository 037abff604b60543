//! Expanding walk-forward splits and the no-look-ahead guard.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PricingError, Result};

/// One expanding window: train on `[train_start, test_start)`, test on
/// `[test_start, test_end)`, both by fixture kickoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Split {
    pub index: usize,
    pub train_start: DateTime<Utc>,
    pub test_start: DateTime<Utc>,
    pub test_end: DateTime<Utc>,
}

impl Split {
    /// Latest kickoff whose outcome may train this window's calibration.
    ///
    /// The earliest decision in the window is taken `max_decision_lead`
    /// before `test_start`, and a result is only known `settlement_delay`
    /// after kickoff.
    pub fn train_cutoff(&self, max_decision_lead: Duration, settlement_delay: Duration) -> DateTime<Utc> {
        self.test_start - max_decision_lead - settlement_delay
    }

    pub fn contains(&self, kickoff: DateTime<Utc>) -> bool {
        kickoff >= self.test_start && kickoff < self.test_end
    }
}

/// Expanding splits over `[start, end)`. The train window always starts at
/// `start`; each test window is `test` long, the last one truncated at `end`.
pub fn expanding_splits(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    initial_train: Duration,
    test: Duration,
) -> Result<Vec<Split>> {
    if test <= Duration::zero() || initial_train < Duration::zero() {
        return Err(PricingError::InvalidConfig(
            "walk-forward windows must have a positive test length".into(),
        ));
    }
    let mut splits = Vec::new();
    let mut test_start = start + initial_train;
    while test_start < end {
        let test_end = (test_start + test).min(end);
        splits.push(Split {
            index: splits.len(),
            train_start: start,
            test_start,
            test_end,
        });
        test_start = test_end;
    }
    if splits.is_empty() {
        return Err(PricingError::InvalidConfig(format!(
            "no test window fits between {start} and {end} after the initial train period"
        )));
    }
    Ok(splits)
}

/// Rejects any record not yet observable at the decision instant.
#[derive(Debug, Clone, Copy)]
pub struct LeakageGuard {
    pub decision_at: DateTime<Utc>,
}

impl LeakageGuard {
    pub fn new(decision_at: DateTime<Utc>) -> Self {
        LeakageGuard { decision_at }
    }

    pub fn check(&self, source_kind: &str, observed: DateTime<Utc>) -> Result<()> {
        if observed > self.decision_at {
            return Err(PricingError::LeakageViolation {
                source_kind: source_kind.to_string(),
                observed,
                decision_at: self.decision_at,
            });
        }
        Ok(())
    }
}
