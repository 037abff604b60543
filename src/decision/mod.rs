//! Edge & decision engine: best available price, edge, phase filters,
//! ranking, staking, correlation and exposure control.
//!
//! `decide` is a pure function of its inputs plus the exposure book it is
//! handed, so the live service and the backtest replay share it unchanged.

pub mod edge;
pub mod exposure;
pub mod filters;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::PricingError;
use crate::pricing::odds::{NormalizedMarket, RejectedBook};
use crate::store::models::{
    Classification, Decision, DecisionKey, DecisionStatus, FixtureContext, Market, ModelOutput,
    Phase, RejectionReason,
};
use exposure::{correlation_discount, Exposure, ExposureBook};

/// Ordering of VALUE candidates before exposure is allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingMethod {
    #[default]
    Edge,
    /// edge × offered odds
    #[serde(rename = "ev")]
    ExpectedValue,
    /// edge × confidence
    Composite,
}

/// A single bookmaker price for a selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bookmaker: String,
    /// Offered decimal odds
    pub odds: f64,
    /// De-margined odds from the same book
    pub clean_odds: f64,
}

/// Highest offered price across books for one selection. Ties go to the
/// alphabetically first bookmaker.
pub fn best_quote(player_id: &str, market: Market, books: &[NormalizedMarket]) -> Option<Quote> {
    books
        .iter()
        .filter(|b| b.market == market)
        .filter_map(|b| {
            b.get(player_id).map(|s| Quote {
                bookmaker: b.bookmaker.clone(),
                odds: s.raw_odds,
                clean_odds: s.fair_odds,
            })
        })
        .min_by(|a, b| {
            b.odds
                .total_cmp(&a.odds)
                .then_with(|| a.bookmaker.cmp(&b.bookmaker))
        })
}

/// Source of decision identifiers. Replays use name-based ids so repeated
/// runs produce identical records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionIds {
    Random,
    Deterministic(Uuid),
}

impl DecisionIds {
    pub fn next(&self, key: &DecisionKey, phase: Phase, at: DateTime<Utc>) -> Uuid {
        match self {
            DecisionIds::Random => Uuid::new_v4(),
            DecisionIds::Deterministic(namespace) => {
                let name = format!(
                    "{}|{}|{}|{}|{}|{}",
                    key.fixture_id,
                    key.player_id,
                    key.market.as_str(),
                    key.bookmaker.as_deref().unwrap_or("-"),
                    phase.as_str(),
                    at.timestamp_millis()
                );
                Uuid::new_v5(namespace, name.as_bytes())
            }
        }
    }
}

/// Everything one decision cycle for a fixture needs.
#[derive(Debug, Clone, Copy)]
pub struct DecisionInput<'a> {
    pub fixture: &'a FixtureContext,
    pub outputs: &'a [ModelOutput],
    pub books: &'a [NormalizedMarket],
    /// Books that failed normalization this cycle
    pub rejected: &'a [RejectedBook],
    pub decided_at: DateTime<Utc>,
}

struct Candidate<'a> {
    output: &'a ModelOutput,
    quote: Quote,
    edge: f64,
    confidence: f64,
}

fn base_decision(
    output: &ModelOutput,
    quote: Option<&Quote>,
    edge: Option<f64>,
    classification: Classification,
    decided_at: DateTime<Utc>,
    ids: DecisionIds,
) -> Decision {
    let key = DecisionKey {
        fixture_id: output.fixture_id.clone(),
        player_id: output.player_id.clone(),
        market: output.market,
        bookmaker: quote.map(|q| q.bookmaker.clone()),
    };
    Decision {
        id: ids.next(&key, output.phase, decided_at),
        fixture_id: key.fixture_id,
        player_id: key.player_id,
        market: output.market,
        phase: output.phase,
        model_computed_at: output.computed_at,
        model_probability: output.model_probability,
        fair_odds: output.fair_odds,
        bookmaker: key.bookmaker,
        odds: quote.map(|q| q.odds),
        clean_odds: quote.map(|q| q.clean_odds),
        edge,
        confidence: edge.map(filters::confidence),
        classification,
        stake: 0.0,
        correlation: None,
        status: DecisionStatus::Rejected,
        reason: None,
        decided_at,
        supersedes: None,
    }
}

fn rejected(mut decision: Decision, reason: RejectionReason) -> Decision {
    decision.status = DecisionStatus::Rejected;
    decision.reason = Some(reason);
    decision.stake = 0.0;
    decision
}

fn rank_key(c: &Candidate<'_>, method: RankingMethod) -> f64 {
    match method {
        RankingMethod::Edge => c.edge,
        RankingMethod::ExpectedValue => c.edge * c.quote.odds,
        RankingMethod::Composite => c.edge * c.confidence,
    }
}

/// Run one decision cycle. Returns one decision per model output, ordered by
/// player then market.
pub fn decide(
    input: DecisionInput<'_>,
    book: &mut ExposureBook,
    ids: DecisionIds,
    cfg: &EngineConfig,
) -> Vec<Decision> {
    let mut decisions = Vec::with_capacity(input.outputs.len());
    let mut candidates = Vec::new();

    let league = input.fixture.league.as_deref();
    for output in input.outputs {
        let filter = cfg.filters.for_phase(output.phase);
        if !cfg.filters.allows(league, output.market) {
            let d = base_decision(output, None, None, Classification::Avoid, input.decided_at, ids);
            decisions.push(rejected(d, RejectionReason::NotWhitelisted));
            continue;
        }
        let Some(quote) = best_quote(&output.player_id, output.market, input.books) else {
            let d = base_decision(output, None, None, Classification::NoValue, input.decided_at, ids);
            let dropped: Vec<&RejectedBook> = input
                .rejected
                .iter()
                .filter(|b| b.quotes(&output.player_id, output.market))
                .collect();
            if dropped.is_empty() {
                let err = PricingError::NoCounterparty {
                    fixture_id: output.fixture_id.clone(),
                    player_id: output.player_id.clone(),
                };
                debug!("Abstaining: {}", err);
                decisions.push(rejected(d, RejectionReason::NoCounterparty));
            } else {
                for b in dropped {
                    debug!(
                        player = %output.player_id,
                        market = output.market.as_str(),
                        bookmaker = %b.bookmaker,
                        "Abstaining on rejected market: {}",
                        b.error
                    );
                }
                decisions.push(rejected(d, RejectionReason::MarketRejected));
            }
            continue;
        };
        let edge = match edge::edge(output.model_probability, quote.clean_odds) {
            Ok(e) => e,
            Err(err) => {
                warn!(player = %output.player_id, "Edge check failed: {}", err);
                let d = base_decision(output, Some(&quote), None, Classification::Avoid, input.decided_at, ids);
                decisions.push(rejected(d, RejectionReason::EdgeImplausible));
                continue;
            }
        };
        match filters::classify(output, quote.odds, edge, filter) {
            (Classification::Value, _) => candidates.push(Candidate {
                output,
                quote,
                edge,
                confidence: filters::confidence(edge),
            }),
            (class, reason) => {
                let d = base_decision(output, Some(&quote), Some(edge), class, input.decided_at, ids);
                decisions.push(rejected(d, reason.unwrap_or(RejectionReason::BelowMinEdge)));
            }
        }
    }

    let method = cfg.staking.ranking;
    candidates.sort_by(|a, b| {
        rank_key(b, method)
            .partial_cmp(&rank_key(a, method))
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.output.player_id.cmp(&b.output.player_id))
            .then_with(|| a.output.market.cmp(&b.output.market))
    });

    let day = input.fixture.kickoff.date_naive();
    for c in candidates {
        let output = c.output;
        let mut d = base_decision(
            output,
            Some(&c.quote),
            Some(c.edge),
            Classification::Value,
            input.decided_at,
            ids,
        );
        let base = edge::stake(output.model_probability, c.quote.odds, output.phase, &cfg.staking);
        let mut exposure = Exposure {
            fixture_id: output.fixture_id.clone(),
            player_id: output.player_id.clone(),
            team_id: output.team_id.clone(),
            market: output.market,
            phase: output.phase,
            bookmaker: Some(c.quote.bookmaker.clone()),
            day,
            stake: base,
            executed: false,
        };
        let rho = book
            .max_correlation(&exposure)
            .filter(|r| *r >= cfg.exposure.correlation_flag_threshold);
        if let Some(r) = rho {
            exposure.stake = edge::round_cents(base * correlation_discount(r, &cfg.exposure));
            d.correlation = Some(r);
        }
        if exposure.stake <= 0.0 {
            decisions.push(rejected(d, RejectionReason::ZeroStake));
            continue;
        }
        if let Err(err) = book.check(&exposure, &cfg.exposure) {
            info!(player = %output.player_id, market = output.market.as_str(), "Rejected: {}", err);
            decisions.push(rejected(d, RejectionReason::ExposureCap));
            continue;
        }
        d.stake = exposure.stake;
        d.status = DecisionStatus::Recommended;
        book.record(exposure);
        decisions.push(d);
    }

    decisions.sort_by(|a, b| {
        a.player_id
            .cmp(&b.player_id)
            .then_with(|| a.market.cmp(&b.market))
    });
    decisions
}
