use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::store::models::Phase;

/// Failure taxonomy for the pricing, decision and backtest core.
///
/// Only `DataStale` has a local recovery path (degraded pricing below the hard
/// ceiling); every other variant surfaces to callers as an abstain.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PricingError {
    #[error("critical data missing for player {player_id}: {field}")]
    CriticalDataMissing { player_id: String, field: String },

    #[error("data stale for {entity}: last snapshot {age_hours:.1}h old")]
    DataStale { entity: String, age_hours: f64 },

    #[error("incomplete market: {selections} selection(s), need at least 2")]
    IncompleteMarket { selections: usize },

    #[error("margin out of range: implied sum {implied_sum:.4} outside [{min:.2}, {max:.2}]")]
    MarginOutOfRange {
        implied_sum: f64,
        min: f64,
        max: f64,
    },

    #[error("no counterparty for {fixture_id}/{player_id}")]
    NoCounterparty {
        fixture_id: String,
        player_id: String,
    },

    #[error("leakage violation: {source_kind} at {observed} used for decision at {decision_at}")]
    LeakageViolation {
        source_kind: String,
        observed: DateTime<Utc>,
        decision_at: DateTime<Utc>,
    },

    #[error("exposure cap exceeded: {cap} (current {current:.2} + stake {stake:.2} > limit {limit:.2})")]
    ExposureCapExceeded {
        cap: String,
        current: f64,
        stake: f64,
        limit: f64,
    },

    #[error("invalid phase transition: from {} to {}", .from.as_str(), .to.as_str())]
    InvalidPhaseTransition { from: Phase, to: Phase },

    #[error("unknown fixture: {0}")]
    UnknownFixture(String),

    #[error("unknown decision: {0}")]
    UnknownDecision(String),

    #[error("decision {0} is not an open recommendation")]
    DecisionNotOpen(String),

    #[error("edge forms disagree: probability form {by_probability}, odds form {by_odds}")]
    InconsistentEdge { by_probability: f64, by_odds: f64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, PricingError>;
