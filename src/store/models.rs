use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::pricing::profile::{PositionProfile, ProfileWeights};

pub type FixtureId = String;
pub type PlayerId = String;

/// Player-prop market priced by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Market {
    AnytimeGoalscorer,
    AnytimeAssist,
}

impl Market {
    pub fn as_str(&self) -> &'static str {
        match self {
            Market::AnytimeGoalscorer => "anytime_goalscorer",
            Market::AnytimeAssist => "anytime_assist",
        }
    }
}

/// Pricing phase of a fixture. Ordered: `Lineup` supersedes `Early`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Early,
    Lineup,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Early => "EARLY",
            Phase::Lineup => "LINEUP",
        }
    }
}

/// Per-90 rolling rates. `xg` and `xa` are the critical fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Per90Rates {
    /// Non-penalty expected goals per 90
    pub xg: Option<f64>,
    /// Expected assists per 90
    pub xa: Option<f64>,
    pub key_passes: Option<f64>,
    /// Shot-creating actions per 90
    pub sca: Option<f64>,
    pub passes_into_box: Option<f64>,
    pub crosses: Option<f64>,
    pub progressive_passes: Option<f64>,
}

/// Historical selection/minutes behaviour used to build minute scenarios.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Availability {
    /// Share of team matches started
    pub start_rate: Option<f64>,
    /// Share of starts completed (90 minutes)
    pub full_match_rate: Option<f64>,
    /// Share of non-starts where the player came on
    pub bench_appearance_rate: Option<f64>,
    pub avg_starter_minutes: Option<f64>,
    pub avg_partial_minutes: Option<f64>,
    pub avg_bench_minutes: Option<f64>,
}

/// What was known about a player at `as_of`. Immutable; keyed by (player, as_of).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    pub player_id: PlayerId,
    pub team_id: String,
    pub as_of: DateTime<Utc>,
    pub profile: PositionProfile,
    /// Tactical-role override of the profile weight table
    #[serde(default)]
    pub role_weights: Option<ProfileWeights>,
    #[serde(default)]
    pub rates: Per90Rates,
    /// Goals / npxG over the rolling window
    #[serde(default)]
    pub conversion_rate: Option<f64>,
    #[serde(default)]
    pub penalty_taker: Option<bool>,
    #[serde(default)]
    pub availability: Availability,
    /// Per-90 xG of recent matches, most recent first
    #[serde(default)]
    pub recent_xg_per90: Vec<f64>,
    /// Per-90 xA of recent matches, most recent first
    #[serde(default)]
    pub recent_xa_per90: Vec<f64>,
    /// Fields the ingestion side imputed rather than observed
    #[serde(default)]
    pub estimated_fields: Vec<String>,
}

impl FeatureSnapshot {
    pub fn is_estimated(&self, field: &str) -> bool {
        self.estimated_fields.iter().any(|f| f == field)
    }
}

/// One bookmaker's complete selection set for a market on a fixture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddsSnapshot {
    pub bookmaker: String,
    pub market: Market,
    pub fixture_id: FixtureId,
    /// player → decimal odds
    pub selections: BTreeMap<PlayerId, f64>,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TeamProfile {
    pub team_id: String,
    /// Expected goals conceded per 90
    #[serde(default)]
    pub xga_per90: Option<f64>,
    #[serde(default)]
    pub penalties_won_per90: Option<f64>,
    /// Team goals / xG
    #[serde(default)]
    pub finishing_factor: Option<f64>,
    #[serde(default)]
    pub squad: Vec<PlayerId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureContext {
    pub fixture_id: FixtureId,
    pub kickoff: DateTime<Utc>,
    #[serde(default)]
    pub league: Option<String>,
    pub home: TeamProfile,
    pub away: TeamProfile,
}

impl FixtureContext {
    pub fn team(&self, team_id: &str) -> Option<&TeamProfile> {
        [&self.home, &self.away]
            .into_iter()
            .find(|t| t.team_id == team_id)
    }

    pub fn opponent_of(&self, team_id: &str) -> Option<&TeamProfile> {
        if self.home.team_id == team_id {
            Some(&self.away)
        } else if self.away.team_id == team_id {
            Some(&self.home)
        } else {
            None
        }
    }

    /// Both squads, home first, in declared order.
    pub fn players(&self) -> impl Iterator<Item = &PlayerId> {
        self.home.squad.iter().chain(self.away.squad.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineupConfirmation {
    pub fixture_id: FixtureId,
    pub home_starters: Vec<PlayerId>,
    pub away_starters: Vec<PlayerId>,
    pub confirmed_at: DateTime<Utc>,
}

impl LineupConfirmation {
    pub fn is_starter(&self, player_id: &str) -> bool {
        self.home_starters
            .iter()
            .chain(self.away_starters.iter())
            .any(|p| p == player_id)
    }
}

/// Settled per-player outcome, used only for evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerResult {
    pub fixture_id: FixtureId,
    pub player_id: PlayerId,
    pub goals: u32,
    pub assists: u32,
}

impl PlayerResult {
    pub fn hit(&self, market: Market) -> bool {
        match market {
            Market::AnytimeGoalscorer => self.goals > 0,
            Market::AnytimeAssist => self.assists > 0,
        }
    }
}

// ── Model outputs ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Provenance {
    Observed,
    Estimated,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InputValue {
    pub value: f64,
    pub provenance: Provenance,
}

impl InputValue {
    pub fn observed(value: f64) -> Self {
        InputValue {
            value,
            provenance: Provenance::Observed,
        }
    }

    pub fn estimated(value: f64) -> Self {
        InputValue {
            value,
            provenance: Provenance::Estimated,
        }
    }

    /// Observed when present, otherwise the fallback flagged as estimated.
    pub fn or_estimate(value: Option<f64>, fallback: f64) -> Self {
        match value {
            Some(v) if v.is_finite() => Self::observed(v),
            _ => Self::estimated(fallback),
        }
    }
}

/// Every input and intermediate value used for one price.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Explanation {
    pub inputs: BTreeMap<String, InputValue>,
    pub intermediates: BTreeMap<String, f64>,
    pub interpretation: String,
}

impl Explanation {
    pub fn input(&mut self, name: &str, value: InputValue) {
        self.inputs.insert(name.to_string(), value);
    }

    pub fn step(&mut self, name: &str, value: f64) {
        self.intermediates.insert(name.to_string(), value);
    }

    pub fn has_estimated(&self, name: &str) -> bool {
        self.inputs
            .get(name)
            .map(|v| v.provenance == Provenance::Estimated)
            .unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStatus {
    Projected,
    ConfirmedStarter,
    ConfirmedBench,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelOutput {
    pub fixture_id: FixtureId,
    pub player_id: PlayerId,
    pub team_id: String,
    pub market: Market,
    pub phase: Phase,
    pub computed_at: DateTime<Utc>,
    pub feature_as_of: DateTime<Utc>,
    pub selection_status: SelectionStatus,
    pub projected_minutes: f64,
    /// Mixture-mean intensity after any override
    pub lambda: f64,
    pub raw_probability: f64,
    /// Calibrated probability; equals `raw_probability` when uncalibrated
    pub model_probability: f64,
    pub fair_odds: f64,
    pub calibration_version: Option<DateTime<Utc>>,
    pub override_active: bool,
    pub data_stale: bool,
    pub explanation: Explanation,
}

impl ModelOutput {
    pub fn key(&self) -> OutputKey {
        OutputKey {
            fixture_id: self.fixture_id.clone(),
            player_id: self.player_id.clone(),
            market: self.market,
        }
    }

    /// Version ordering used for supersession: phase first, then recency.
    pub fn version(&self) -> (Phase, DateTime<Utc>) {
        (self.phase, self.computed_at)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputKey {
    pub fixture_id: FixtureId,
    pub player_id: PlayerId,
    pub market: Market,
}

// ── Decisions ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    Value,
    NoValue,
    Avoid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionStatus {
    Recommended,
    Rejected,
    Executed,
}

impl DecisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionStatus::Recommended => "RECOMMENDED",
            DecisionStatus::Rejected => "REJECTED",
            DecisionStatus::Executed => "EXECUTED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionReason {
    BelowMinEdge,
    EdgeImplausible,
    MinutesFilter,
    OddsOutOfRange,
    MissingPenaltyTaker,
    ExposureCap,
    NoCounterparty,
    ZeroStake,
    LowConfidence,
    NotWhitelisted,
    /// Every book quoting the selection failed normalization
    MarketRejected,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::BelowMinEdge => "BELOW_MIN_EDGE",
            RejectionReason::EdgeImplausible => "EDGE_IMPLAUSIBLE",
            RejectionReason::MinutesFilter => "MINUTES_FILTER",
            RejectionReason::OddsOutOfRange => "ODDS_OUT_OF_RANGE",
            RejectionReason::MissingPenaltyTaker => "MISSING_PENALTY_TAKER",
            RejectionReason::ExposureCap => "EXPOSURE_CAP",
            RejectionReason::NoCounterparty => "NO_COUNTERPARTY",
            RejectionReason::ZeroStake => "ZERO_STAKE",
            RejectionReason::LowConfidence => "LOW_CONFIDENCE",
            RejectionReason::NotWhitelisted => "NOT_WHITELISTED",
            RejectionReason::MarketRejected => "MARKET_REJECTED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DecisionKey {
    pub fixture_id: FixtureId,
    pub player_id: PlayerId,
    pub market: Market,
    pub bookmaker: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: Uuid,
    pub fixture_id: FixtureId,
    pub player_id: PlayerId,
    pub market: Market,
    pub phase: Phase,
    /// `computed_at` of the ModelOutput this decision was made from
    pub model_computed_at: DateTime<Utc>,
    pub model_probability: f64,
    pub fair_odds: f64,
    pub bookmaker: Option<String>,
    /// Offered (raw) decimal odds
    pub odds: Option<f64>,
    /// De-margined odds used for the edge
    pub clean_odds: Option<f64>,
    pub edge: Option<f64>,
    /// Edge-tiered confidence in [0.2, 0.95]; absent without a price
    #[serde(default)]
    pub confidence: Option<f64>,
    pub classification: Classification,
    pub stake: f64,
    /// Highest correlation with an already-accepted bet, when flagged
    pub correlation: Option<f64>,
    pub status: DecisionStatus,
    pub reason: Option<RejectionReason>,
    pub decided_at: DateTime<Utc>,
    pub supersedes: Option<Uuid>,
}

impl Decision {
    pub fn key(&self) -> DecisionKey {
        DecisionKey {
            fixture_id: self.fixture_id.clone(),
            player_id: self.player_id.clone(),
            market: self.market,
            bookmaker: self.bookmaker.clone(),
        }
    }

    /// Operator approval: a new terminal record referencing this one.
    pub fn executed(&self, at: DateTime<Utc>) -> Option<Decision> {
        if self.status != DecisionStatus::Recommended {
            return None;
        }
        Some(Decision {
            id: Uuid::new_v4(),
            status: DecisionStatus::Executed,
            decided_at: at,
            supersedes: Some(self.id),
            ..self.clone()
        })
    }
}

// ── Output contract ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingMeta {
    pub fixture_id: FixtureId,
    pub player_id: PlayerId,
    pub market: Market,
    pub phase: Phase,
    pub is_override_active: bool,
    pub data_stale: bool,
    pub calibration_version: Option<DateTime<Utc>>,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionBlock {
    pub status: SelectionStatus,
    pub minutes: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingBlock {
    pub lambda: f64,
    pub raw_probability: f64,
    pub model_probability: f64,
    pub fair_odds: f64,
    pub inputs_used: Explanation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionBlock {
    pub status: DecisionStatus,
    pub classification: Classification,
    pub edge: Option<f64>,
    pub suggested_stake: f64,
    pub bookmaker: Option<String>,
    pub odds: Option<f64>,
    pub reason: Option<RejectionReason>,
}

/// Durable pricing-call response. Fields are additive-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingOutput {
    pub meta: PricingMeta,
    pub selection: SelectionBlock,
    pub pricing: PricingBlock,
    pub decision: Option<DecisionBlock>,
}

impl PricingOutput {
    pub fn new(output: &ModelOutput, decision: Option<&Decision>) -> Self {
        PricingOutput {
            meta: PricingMeta {
                fixture_id: output.fixture_id.clone(),
                player_id: output.player_id.clone(),
                market: output.market,
                phase: output.phase,
                is_override_active: output.override_active,
                data_stale: output.data_stale,
                calibration_version: output.calibration_version,
                computed_at: output.computed_at,
            },
            selection: SelectionBlock {
                status: output.selection_status,
                minutes: output.projected_minutes,
            },
            pricing: PricingBlock {
                lambda: output.lambda,
                raw_probability: output.raw_probability,
                model_probability: output.model_probability,
                fair_odds: output.fair_odds,
                inputs_used: output.explanation.clone(),
            },
            decision: decision.map(|d| DecisionBlock {
                status: d.status,
                classification: d.classification,
                edge: d.edge,
                suggested_stake: d.stake,
                bookmaker: d.bookmaker.clone(),
                odds: d.odds,
                reason: d.reason,
            }),
        }
    }
}
