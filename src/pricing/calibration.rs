//! Probability calibration: Platt scaling for small samples, isotonic
//! regression (pool-adjacent-violators) once the sample is large enough.
//!
//! Platt model: `p_calibrated = sigmoid(a * logit(p_raw) + b)` with `a > 0`.
//! Both fits are monotone non-decreasing in the raw probability.
//!
//! Models are versioned by `valid_from` and never replaced in place: a refit
//! appends a new version, and degradation is reported, not acted on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::CalibrationConfig;
use crate::store::models::Market;

const EPS: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlattCalibration {
    pub a: f64,
    pub b: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FitMetrics {
    pub logloss_before: f64,
    pub logloss_after: f64,
    pub brier_before: f64,
    pub brier_after: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum CalibrationMethod {
    Platt(PlattCalibration),
    /// Non-decreasing (raw, calibrated) knots, linearly interpolated.
    Isotonic { knots: Vec<(f64, f64)> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationModel {
    pub market: Market,
    pub valid_from: DateTime<Utc>,
    pub samples: usize,
    pub method: CalibrationMethod,
    pub metrics: FitMetrics,
}

impl CalibrationModel {
    pub fn apply(&self, raw_prob: f64) -> f64 {
        match &self.method {
            CalibrationMethod::Platt(m) => apply_platt(raw_prob, *m),
            CalibrationMethod::Isotonic { knots } => apply_isotonic(raw_prob, knots),
        }
    }
}

/// Emitted when live Brier drifts above the fitted value. Consumers decide
/// whether to recalibrate; the active model is never swapped automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationSignal {
    pub market: Market,
    pub valid_from: DateTime<Utc>,
    pub fitted_brier: f64,
    pub observed_brier: f64,
    pub samples: usize,
}

fn clamp_prob(p: f64) -> f64 {
    p.clamp(EPS, 1.0 - EPS)
}

fn logit(p: f64) -> f64 {
    let p = clamp_prob(p);
    p.ln() - (-p).ln_1p()
}

fn sigmoid(x: f64) -> f64 {
    0.5 * (1.0 + (0.5 * x).tanh())
}

/// Binary cross-entropy of one prediction.
fn logloss(p: f64, y: f64) -> f64 {
    let p = clamp_prob(p);
    -(y * p.ln() + (1.0 - y) * (-p).ln_1p())
}

/// Mean squared error between predicted probability and binary outcome.
pub fn brier_score(samples: &[(f64, f64)]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|(p, y)| (p - y).powi(2)).sum::<f64>() / samples.len() as f64
}

pub fn apply_platt(raw_prob: f64, model: PlattCalibration) -> f64 {
    sigmoid(model.a * logit(raw_prob) + model.b)
}

pub fn apply_isotonic(raw_prob: f64, knots: &[(f64, f64)]) -> f64 {
    let (first, last) = match (knots.first(), knots.last()) {
        (Some(f), Some(l)) => (*f, *l),
        _ => return raw_prob,
    };
    if raw_prob <= first.0 {
        return first.1;
    }
    if raw_prob >= last.0 {
        return last.1;
    }
    let i = knots.partition_point(|(x, _)| *x <= raw_prob);
    let (x0, y0) = knots[i - 1];
    let (x1, y1) = knots[i];
    if x1 <= x0 {
        return y1;
    }
    y0 + (y1 - y0) * (raw_prob - x0) / (x1 - x0)
}

fn metrics(samples: &[(f64, f64)], calibrated: impl Fn(f64) -> f64) -> FitMetrics {
    let n = samples.len() as f64;
    let mut ll_before = 0.0;
    let mut ll_after = 0.0;
    let mut br_before = 0.0;
    let mut br_after = 0.0;
    for (raw_p, y) in samples {
        let before = clamp_prob(*raw_p);
        let after = calibrated(*raw_p);
        ll_before += logloss(before, *y);
        ll_after += logloss(after, *y);
        br_before += (before - *y).powi(2);
        br_after += (after - *y).powi(2);
    }
    FitMetrics {
        logloss_before: ll_before / n,
        logloss_after: ll_after / n,
        brier_before: br_before / n,
        brier_after: br_after / n,
    }
}

fn has_both_outcomes(samples: &[(f64, f64)]) -> bool {
    let positives = samples.iter().filter(|(_, y)| *y > 0.5).count();
    positives > 0 && positives < samples.len()
}

pub fn fit_platt(
    samples: &[(f64, f64)],
    max_iters: usize,
    learning_rate: f64,
    l2: f64,
) -> Option<(PlattCalibration, FitMetrics)> {
    if samples.len() < 8 || !has_both_outcomes(samples) {
        return None;
    }

    let xs: Vec<(f64, f64)> = samples.iter().map(|(p, y)| (logit(*p), *y)).collect();
    let n = xs.len() as f64;
    let (mut a, mut b) = (1.0f64, 0.0f64);

    // Gradient descent on mean log-loss with a decaying step and L2 on the slope.
    for i in 0..max_iters.max(1) {
        let (ga, gb) = xs.iter().fold((0.0, 0.0), |(ga, gb), (x, y)| {
            let err = sigmoid(a * x + b) - y;
            (ga + err * x, gb + err)
        });
        let step = learning_rate / (1.0 + 0.01 * i as f64);
        a -= step * (ga / n + l2 * a);
        b -= step * gb / n;
        if !(a.is_finite() && b.is_finite()) {
            return None;
        }
    }
    // A non-positive slope would invert the ranking.
    if a <= 0.0 {
        return None;
    }

    let model = PlattCalibration { a, b };
    Some((model, metrics(samples, |p| apply_platt(p, model))))
}

/// Pool-adjacent-violators over samples sorted by raw probability.
pub fn fit_isotonic(samples: &[(f64, f64)]) -> Option<(Vec<(f64, f64)>, FitMetrics)> {
    if samples.len() < 2 || !has_both_outcomes(samples) {
        return None;
    }
    let mut sorted: Vec<(f64, f64)> = samples.to_vec();
    sorted.sort_by(|l, r| l.0.total_cmp(&r.0));

    // Each block: (sum_x, sum_y, count)
    let mut blocks: Vec<(f64, f64, f64)> = Vec::with_capacity(sorted.len());
    for (x, y) in &sorted {
        blocks.push((*x, *y, 1.0));
        while blocks.len() >= 2 {
            let (sx1, sy1, n1) = blocks[blocks.len() - 1];
            let (sx0, sy0, n0) = blocks[blocks.len() - 2];
            if sy0 / n0 <= sy1 / n1 {
                break;
            }
            blocks.pop();
            blocks.pop();
            blocks.push((sx0 + sx1, sy0 + sy1, n0 + n1));
        }
    }
    let knots: Vec<(f64, f64)> = blocks
        .iter()
        .map(|(sx, sy, n)| (sx / n, clamp_prob(sy / n)))
        .collect();
    let m = metrics(samples, |p| apply_isotonic(p, &knots));
    Some((knots, m))
}

/// Fit the method appropriate to the sample size, or nothing when the sample
/// is too small to calibrate.
pub fn fit(
    market: Market,
    samples: &[(f64, f64)],
    valid_from: DateTime<Utc>,
    cfg: &CalibrationConfig,
) -> Option<CalibrationModel> {
    if samples.len() < cfg.min_samples {
        return None;
    }
    let (method, metrics) = if samples.len() > cfg.isotonic_min_samples {
        let (knots, m) = fit_isotonic(samples)?;
        (CalibrationMethod::Isotonic { knots }, m)
    } else {
        let (platt, m) = fit_platt(
            samples,
            cfg.platt_max_iters,
            cfg.platt_learning_rate,
            cfg.platt_l2,
        )?;
        (CalibrationMethod::Platt(platt), m)
    };
    info!(
        market = market.as_str(),
        samples = samples.len(),
        brier_before = metrics.brier_before,
        brier_after = metrics.brier_after,
        "Fitted calibration model"
    );
    Some(CalibrationModel {
        market,
        valid_from,
        samples: samples.len(),
        method,
        metrics,
    })
}

/// Every calibration version ever promoted, per market, ordered by `valid_from`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalibrationRegistry {
    versions: Vec<CalibrationModel>,
}

impl CalibrationRegistry {
    pub fn promote(&mut self, model: CalibrationModel) {
        info!(
            market = model.market.as_str(),
            valid_from = %model.valid_from,
            "Promoted calibration version"
        );
        let at = self
            .versions
            .partition_point(|m| (m.market, m.valid_from) <= (model.market, model.valid_from));
        self.versions.insert(at, model);
    }

    /// The version in force at `at`: the latest with `valid_from ≤ at`.
    pub fn active_at(&self, market: Market, at: DateTime<Utc>) -> Option<&CalibrationModel> {
        self.versions
            .iter()
            .rev()
            .find(|m| m.market == market && m.valid_from <= at)
    }

    pub fn versions(&self, market: Market) -> impl Iterator<Item = &CalibrationModel> {
        self.versions.iter().filter(move |m| m.market == market)
    }

    /// Compare recent raw-probability outcomes under the active version with
    /// its fitted Brier score.
    pub fn check_degradation(
        &self,
        market: Market,
        at: DateTime<Utc>,
        recent: &[(f64, f64)],
        cfg: &CalibrationConfig,
    ) -> Option<DegradationSignal> {
        let model = self.active_at(market, at)?;
        if recent.is_empty() {
            return None;
        }
        let calibrated: Vec<(f64, f64)> = recent.iter().map(|(p, y)| (model.apply(*p), *y)).collect();
        let observed = brier_score(&calibrated);
        if observed <= model.metrics.brier_after + cfg.brier_degradation_tolerance {
            return None;
        }
        warn!(
            market = market.as_str(),
            valid_from = %model.valid_from,
            fitted = model.metrics.brier_after,
            observed,
            "Calibration degraded beyond tolerance"
        );
        Some(DegradationSignal {
            market,
            valid_from: model.valid_from,
            fitted_brier: model.metrics.brier_after,
            observed_brier: observed,
            samples: recent.len(),
        })
    }
}
