//! Phase-aware hard filters and VALUE / NO_VALUE / AVOID classification.
//!
//! A priced candidate also carries a confidence score tiered on its edge.
//! Candidates that clear the edge minimum but not the confidence minimum are
//! NO_VALUE with `LOW_CONFIDENCE`.

use crate::config::PhaseFilter;
use crate::store::models::{Classification, Market, ModelOutput, RejectionReason, SelectionStatus};

/// First hard filter the candidate fails, if any.
pub fn hard_filter(
    output: &ModelOutput,
    offered_odds: f64,
    edge: f64,
    filter: &PhaseFilter,
) -> Option<RejectionReason> {
    if let Some(min) = filter.min_projected_minutes {
        if output.projected_minutes < min {
            return Some(RejectionReason::MinutesFilter);
        }
    }
    if filter.require_confirmed_starter && output.selection_status != SelectionStatus::ConfirmedStarter {
        return Some(RejectionReason::MinutesFilter);
    }
    if offered_odds < filter.min_odds || offered_odds > filter.max_odds {
        return Some(RejectionReason::OddsOutOfRange);
    }
    if filter.require_penalty_flag
        && output.market == Market::AnytimeGoalscorer
        && output.explanation.has_estimated("penalty_taker")
    {
        return Some(RejectionReason::MissingPenaltyTaker);
    }
    if edge > filter.max_edge {
        return Some(RejectionReason::EdgeImplausible);
    }
    None
}

/// Confidence in a priced selection, in [0.2, 0.95].
pub fn confidence(edge: f64) -> f64 {
    if edge >= 0.10 {
        (0.7 + edge).min(0.95)
    } else if edge >= 0.05 {
        0.6 + edge
    } else if edge >= 0.0 {
        0.5
    } else {
        (0.4 + edge).max(0.2)
    }
}

/// AVOID on any hard filter, VALUE at or above the phase minimums, NO_VALUE otherwise.
pub fn classify(
    output: &ModelOutput,
    offered_odds: f64,
    edge: f64,
    filter: &PhaseFilter,
) -> (Classification, Option<RejectionReason>) {
    if let Some(reason) = hard_filter(output, offered_odds, edge, filter) {
        return (Classification::Avoid, Some(reason));
    }
    if edge < filter.min_edge {
        (Classification::NoValue, Some(RejectionReason::BelowMinEdge))
    } else if confidence(edge) < filter.min_confidence {
        (Classification::NoValue, Some(RejectionReason::LowConfidence))
    } else {
        (Classification::Value, None)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::FilterConfig;
    use crate::store::models::{Explanation, InputValue, Phase};
    use approx::assert_relative_eq;
    use chrono::{TimeZone, Utc};

    pub(crate) fn output(phase: Phase, status: SelectionStatus, minutes: f64, p: f64) -> ModelOutput {
        let mut explanation = Explanation::default();
        explanation.input("penalty_taker", InputValue::observed(0.0));
        ModelOutput {
            fixture_id: "f1".into(),
            player_id: "p1".into(),
            team_id: "home".into(),
            market: Market::AnytimeGoalscorer,
            phase,
            computed_at: Utc.with_ymd_and_hms(2024, 3, 1, 15, 0, 0).unwrap(),
            feature_as_of: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            selection_status: status,
            projected_minutes: minutes,
            lambda: 0.5,
            raw_probability: p,
            model_probability: p,
            fair_odds: 1.0 / p,
            calibration_version: None,
            override_active: false,
            data_stale: false,
            explanation,
        }
    }

    #[test]
    fn early_minutes_filter_beats_any_edge() {
        let f = FilterConfig::default();
        let out = output(Phase::Early, SelectionStatus::Projected, 65.0, 0.5);
        let (class, reason) = classify(&out, 3.0, 0.5, f.for_phase(Phase::Early));
        assert_eq!(class, Classification::Avoid);
        assert_eq!(reason, Some(RejectionReason::MinutesFilter));
    }

    #[test]
    fn lineup_confirmed_starter_passes() {
        let f = FilterConfig::default();
        let out = output(Phase::Lineup, SelectionStatus::ConfirmedStarter, 65.0, 0.5);
        let (class, reason) = classify(&out, 2.2, 0.1, f.for_phase(Phase::Lineup));
        assert_eq!(class, Classification::Value);
        assert_eq!(reason, None);

        let bench = output(Phase::Lineup, SelectionStatus::ConfirmedBench, 10.0, 0.5);
        let (class, _) = classify(&bench, 2.2, 0.1, f.for_phase(Phase::Lineup));
        assert_eq!(class, Classification::Avoid);
    }

    #[test]
    fn phase_specific_thresholds() {
        let f = FilterConfig::default();
        let early = output(Phase::Early, SelectionStatus::Projected, 80.0, 0.5);
        let lineup = output(Phase::Lineup, SelectionStatus::ConfirmedStarter, 80.0, 0.5);
        // 4% edge: NO_VALUE early, VALUE at lineup
        assert_eq!(
            classify(&early, 2.2, 0.04, f.for_phase(Phase::Early)),
            (Classification::NoValue, Some(RejectionReason::BelowMinEdge))
        );
        assert_eq!(classify(&lineup, 2.2, 0.04, f.for_phase(Phase::Lineup)).0, Classification::Value);
        // 13.0 is inside the EARLY range but beyond the LINEUP maximum.
        assert_eq!(classify(&early, 13.0, 0.1, f.for_phase(Phase::Early)).0, Classification::Value);
        assert_eq!(
            classify(&lineup, 13.0, 0.1, f.for_phase(Phase::Lineup)).1,
            Some(RejectionReason::OddsOutOfRange)
        );
    }

    #[test]
    fn missing_penalty_flag_blocks_goalscorer_only() {
        let f = FilterConfig::default();
        let mut out = output(Phase::Lineup, SelectionStatus::ConfirmedStarter, 80.0, 0.5);
        out.explanation.input("penalty_taker", InputValue::estimated(0.0));
        assert_eq!(
            classify(&out, 2.2, 0.1, f.for_phase(Phase::Lineup)).1,
            Some(RejectionReason::MissingPenaltyTaker)
        );
        out.market = Market::AnytimeAssist;
        assert_eq!(classify(&out, 2.2, 0.1, f.for_phase(Phase::Lineup)).0, Classification::Value);
    }

    #[test]
    fn confidence_tiers() {
        assert_relative_eq!(confidence(0.30), 0.95);
        assert_relative_eq!(confidence(0.12), 0.82, epsilon = 1e-12);
        assert_relative_eq!(confidence(0.06), 0.66, epsilon = 1e-12);
        assert_eq!(confidence(0.02), 0.5);
        assert_relative_eq!(confidence(-0.1), 0.3, epsilon = 1e-12);
        assert_eq!(confidence(-0.5), 0.2);
    }

    #[test]
    fn confidence_gate_applies_after_edge() {
        let mut f = FilterConfig::default();
        f.lineup.min_confidence = 0.7;
        let out = output(Phase::Lineup, SelectionStatus::ConfirmedStarter, 80.0, 0.5);
        // 6% clears the 3% edge minimum but only scores 0.66.
        assert_eq!(
            classify(&out, 2.2, 0.06, f.for_phase(Phase::Lineup)),
            (Classification::NoValue, Some(RejectionReason::LowConfidence))
        );
        assert_eq!(classify(&out, 2.2, 0.12, f.for_phase(Phase::Lineup)).0, Classification::Value);
        assert_eq!(
            classify(&out, 2.2, 0.01, f.for_phase(Phase::Lineup)).1,
            Some(RejectionReason::BelowMinEdge)
        );
    }

    #[test]
    fn implausible_edge_is_avoided() {
        let f = FilterConfig::default();
        let out = output(Phase::Lineup, SelectionStatus::ConfirmedStarter, 80.0, 0.5);
        assert_eq!(
            classify(&out, 5.0, 1.5, f.for_phase(Phase::Lineup)),
            (Classification::Avoid, Some(RejectionReason::EdgeImplausible))
        );
    }
}
