use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::decision::edge::StakingMethod;
use crate::decision::RankingMethod;
use crate::error::{PricingError, Result};
use crate::pricing::odds::OverroundMethod;
use crate::pricing::profile::{LeagueAverages, ProfileTable};
use crate::store::models::{Market, Phase};

/// Anytime scorer / assist prop pricing engine
#[derive(Parser, Debug, Clone)]
#[command(name = "ev0-props", version, about)]
pub struct Config {
    /// JSON file with a full engine configuration (defaults are used otherwise)
    #[arg(long, env = "ENGINE_CONFIG")]
    pub engine_config: Option<PathBuf>,

    /// Minimum edge required in EARLY phase (e.g. 0.05 = 5%)
    #[arg(long, env = "MIN_EDGE_EARLY")]
    pub min_edge_early: Option<f64>,

    /// Minimum edge required in LINEUP phase
    #[arg(long, env = "MIN_EDGE_LINEUP")]
    pub min_edge_lineup: Option<f64>,

    /// Flat stake unit before the phase multiplier
    #[arg(long, env = "STAKE_UNIT")]
    pub stake_unit: Option<f64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve the pricing / lineup / backtest HTTP interface
    Serve {
        /// Listen address
        #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
        addr: String,

        /// Historical dataset (JSON) preloaded into the snapshot store
        #[arg(long, env = "DATASET_PATH")]
        dataset: Option<PathBuf>,
    },
    /// Run a walk-forward backtest over a dataset and print the report
    Backtest {
        /// Historical dataset (JSON)
        #[arg(long)]
        dataset: PathBuf,

        /// Backtest configuration (JSON); engine defaults otherwise
        #[arg(long)]
        backtest_config: Option<PathBuf>,

        /// Write the report here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, value) in [
            ("min_edge_early", self.min_edge_early),
            ("min_edge_lineup", self.min_edge_lineup),
        ] {
            if let Some(v) = value {
                if !(0.0..=1.0).contains(&v) {
                    anyhow::bail!("{} must be between 0.0 and 1.0", name);
                }
            }
        }
        if let Some(unit) = self.stake_unit {
            if unit <= 0.0 {
                anyhow::bail!("stake_unit must be positive");
            }
        }
        Ok(())
    }

    /// Load the engine configuration and apply flag overrides.
    pub fn engine(&self) -> anyhow::Result<EngineConfig> {
        let mut engine = match &self.engine_config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                serde_json::from_str::<EngineConfig>(&raw)?
            }
            None => EngineConfig::default(),
        };
        if let Some(v) = self.min_edge_early {
            engine.filters.early.min_edge = v;
        }
        if let Some(v) = self.min_edge_lineup {
            engine.filters.lineup.min_edge = v;
        }
        if let Some(v) = self.stake_unit {
            engine.staking.unit = v;
        }
        engine.validate()?;
        Ok(engine)
    }
}

// ── Engine configuration ───────────────────────────────────────────────────
//
// Passed by reference into every component call. Never held globally, so
// concurrent backtests with different configurations cannot interfere.

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub odds: OddsConfig,
    pub goalscorer: GoalscorerConfig,
    pub assist: AssistConfig,
    pub opponent: OpponentConfig,
    pub scenarios: ScenarioConfig,
    pub filters: FilterConfig,
    pub staking: StakingConfig,
    pub exposure: ExposureConfig,
    pub calibration: CalibrationConfig,
    pub freshness: FreshnessConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.odds.min_overround > self.odds.max_overround || self.odds.min_overround <= 0.0 {
            return Err(PricingError::InvalidConfig(
                "overround band must be positive and ordered".into(),
            ));
        }
        if self.goalscorer.decay_per_match < 0.0 || self.assist.decay_per_match < 0.0 {
            return Err(PricingError::InvalidConfig(
                "decay constants must be non-negative".into(),
            ));
        }
        for phase in [Phase::Early, Phase::Lineup] {
            let f = self.filters.for_phase(phase);
            if f.min_odds >= f.max_odds {
                return Err(PricingError::InvalidConfig(format!(
                    "{} odds range is empty",
                    phase.as_str()
                )));
            }
            if !(0.0..=1.0).contains(&f.min_confidence) {
                return Err(PricingError::InvalidConfig(format!(
                    "{} min_confidence must be between 0.0 and 1.0",
                    phase.as_str()
                )));
            }
            if self.staking.multiplier(phase) < 0.0 {
                return Err(PricingError::InvalidConfig(format!(
                    "{} stake multiplier is negative",
                    phase.as_str()
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.staking.kelly_fraction) {
            return Err(PricingError::InvalidConfig(
                "kelly_fraction must be between 0.0 and 1.0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.exposure.correlation_discount) {
            return Err(PricingError::InvalidConfig(
                "correlation_discount must be between 0.0 and 1.0".into(),
            ));
        }
        if self.freshness.stale_after_hours > self.freshness.halt_after_hours {
            return Err(PricingError::InvalidConfig(
                "stale window exceeds halt ceiling".into(),
            ));
        }
        self.assist.profiles.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OddsConfig {
    pub method: OverroundMethod,
    /// Accepted raw implied-probability sum band
    pub min_overround: f64,
    pub max_overround: f64,
}

impl Default for OddsConfig {
    fn default() -> Self {
        OddsConfig {
            method: OverroundMethod::Proportional,
            min_overround: 1.00,
            max_overround: 1.30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GoalscorerConfig {
    /// Exponential form decay per match (half-life = ln 2 / k)
    pub decay_per_match: f64,
    pub penalty_conversion: f64,
    pub default_conversion_rate: f64,
    pub default_team_penalties_per90: f64,
    /// Ceiling on the full-match intensity
    pub max_lambda: f64,
    pub form_min: f64,
    pub form_max: f64,
}

impl Default for GoalscorerConfig {
    fn default() -> Self {
        GoalscorerConfig {
            decay_per_match: 0.025,
            penalty_conversion: 0.78,
            default_conversion_rate: 1.0,
            default_team_penalties_per90: 0.11,
            max_lambda: 3.0,
            form_min: 0.5,
            form_max: 1.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistConfig {
    pub decay_per_match: f64,
    /// Per-90 assist intensity of a league-average creator (composite = 1.0)
    pub lambda_scale: f64,
    pub max_lambda: f64,
    pub default_teammate_finishing: f64,
    pub form_min: f64,
    pub form_max: f64,
    pub league_averages: LeagueAverages,
    pub profiles: ProfileTable,
}

impl Default for AssistConfig {
    fn default() -> Self {
        AssistConfig {
            decay_per_match: 0.017,
            lambda_scale: 0.15,
            max_lambda: 2.0,
            default_teammate_finishing: 1.0,
            form_min: 0.5,
            form_max: 1.5,
            league_averages: LeagueAverages::default(),
            profiles: ProfileTable::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpponentConfig {
    pub league_avg_xga_per90: f64,
    pub min_factor: f64,
    pub max_factor: f64,
}

impl Default for OpponentConfig {
    fn default() -> Self {
        OpponentConfig {
            league_avg_xga_per90: 1.35,
            min_factor: 0.6,
            max_factor: 1.6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    pub full_match_minutes: f64,
    pub default_partial_minutes: f64,
    pub default_bench_minutes: f64,
    pub default_starter_minutes: f64,
    pub default_start_rate: f64,
    pub default_full_match_rate: f64,
    pub default_bench_appearance_rate: f64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        ScenarioConfig {
            full_match_minutes: 90.0,
            default_partial_minutes: 65.0,
            default_bench_minutes: 20.0,
            default_starter_minutes: 80.0,
            default_start_rate: 0.5,
            default_full_match_rate: 0.5,
            default_bench_appearance_rate: 0.5,
        }
    }
}

/// One column of the phase filter table. Supplied whole when overridden.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseFilter {
    pub min_edge: f64,
    /// Sanity cap; edges above are treated as data errors
    pub max_edge: f64,
    /// EARLY: projected minutes must reach this
    pub min_projected_minutes: Option<f64>,
    /// LINEUP: only confirmed starters pass
    pub require_confirmed_starter: bool,
    pub min_odds: f64,
    pub max_odds: f64,
    /// Goalscorer bets need an observed penalty-taker flag
    pub require_penalty_flag: bool,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

fn default_min_confidence() -> f64 {
    0.5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub early: PhaseFilter,
    pub lineup: PhaseFilter,
    /// Allow-list of leagues; fixtures without a league always pass
    pub leagues: Option<Vec<String>>,
    /// Allow-list of markets
    pub markets: Option<Vec<Market>>,
}

impl FilterConfig {
    pub fn for_phase(&self, phase: Phase) -> &PhaseFilter {
        match phase {
            Phase::Early => &self.early,
            Phase::Lineup => &self.lineup,
        }
    }

    pub fn allows(&self, league: Option<&str>, market: Market) -> bool {
        let league_ok = match (&self.leagues, league) {
            (Some(allowed), Some(league)) => allowed.iter().any(|l| l.eq_ignore_ascii_case(league)),
            _ => true,
        };
        let market_ok = self.markets.as_ref().map_or(true, |m| m.contains(&market));
        league_ok && market_ok
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            early: PhaseFilter {
                min_edge: 0.05,
                max_edge: 1.0,
                min_projected_minutes: Some(70.0),
                require_confirmed_starter: false,
                min_odds: 1.3,
                max_odds: 15.0,
                require_penalty_flag: true,
                min_confidence: default_min_confidence(),
            },
            lineup: PhaseFilter {
                min_edge: 0.03,
                max_edge: 1.0,
                min_projected_minutes: None,
                require_confirmed_starter: true,
                min_odds: 1.3,
                max_odds: 12.0,
                require_penalty_flag: true,
                min_confidence: default_min_confidence(),
            },
            leagues: None,
            markets: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StakingConfig {
    pub method: StakingMethod,
    pub unit: f64,
    pub early_multiplier: f64,
    pub lineup_multiplier: f64,
    pub kelly_fraction: f64,
    /// Notional bankroll for Kelly sizing
    pub bankroll: f64,
    pub max_stake: f64,
    pub ranking: RankingMethod,
}

impl StakingConfig {
    pub fn multiplier(&self, phase: Phase) -> f64 {
        match phase {
            Phase::Early => self.early_multiplier,
            Phase::Lineup => self.lineup_multiplier,
        }
    }
}

impl Default for StakingConfig {
    fn default() -> Self {
        StakingConfig {
            method: StakingMethod::Flat,
            unit: 10.0,
            early_multiplier: 0.75,
            lineup_multiplier: 1.0,
            kelly_fraction: 0.25,
            bankroll: 1000.0,
            max_stake: 100.0,
            ranking: RankingMethod::Edge,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureConfig {
    pub max_per_match: f64,
    /// Summed across EARLY and LINEUP
    pub max_per_player: f64,
    pub max_per_day: f64,
    pub correlation_flag_threshold: f64,
    pub correlation_discount: f64,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        ExposureConfig {
            max_per_match: 100.0,
            max_per_player: 25.0,
            max_per_day: 500.0,
            correlation_flag_threshold: 0.5,
            correlation_discount: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Samples above this use the isotonic fit, otherwise Platt scaling
    pub isotonic_min_samples: usize,
    /// Below this no calibration is fitted
    pub min_samples: usize,
    pub platt_max_iters: usize,
    pub platt_learning_rate: f64,
    pub platt_l2: f64,
    /// Brier increase over the fitted value that raises a monitoring signal
    pub brier_degradation_tolerance: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        CalibrationConfig {
            isotonic_min_samples: 1000,
            min_samples: 50,
            platt_max_iters: 500,
            platt_learning_rate: 0.2,
            platt_l2: 1e-3,
            brier_degradation_tolerance: 0.02,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FreshnessConfig {
    /// Older snapshots are priced in degraded mode
    pub stale_after_hours: f64,
    /// Older snapshots halt pricing
    pub halt_after_hours: f64,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        FreshnessConfig {
            stale_after_hours: 48.0,
            halt_after_hours: 168.0,
        }
    }
}
