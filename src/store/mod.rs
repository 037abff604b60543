//! Collaborator boundary: snapshot reads and the append-only output log.
//!
//! The core never performs I/O itself. Live pricing and backtests read
//! snapshots through [`SnapshotSource`]; [`MemoryStore`] is the in-process
//! implementation fed by the ingestion endpoints or a dataset file.

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod models;
use models::*;

/// Point-in-time reads. Implementations must only return records visible at
/// `at`; the backtest engine verifies this and aborts on violation.
pub trait SnapshotSource: Send + Sync {
    /// Fixtures kicking off in `[from, to)`, ordered by kickoff then id.
    fn fixtures_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<FixtureContext>;

    fn fixture(&self, fixture_id: &str) -> Option<FixtureContext>;

    /// Latest feature snapshot with `as_of ≤ at`.
    fn feature_snapshot(&self, player_id: &str, at: DateTime<Utc>) -> Option<FeatureSnapshot>;

    /// Latest snapshot per bookmaker with `ingested_at ≤ at`.
    fn odds_snapshots(&self, fixture_id: &str, market: Market, at: DateTime<Utc>) -> Vec<OddsSnapshot>;

    /// Every snapshot for a market, oldest first. Evaluation only.
    fn odds_history(&self, fixture_id: &str, market: Market) -> Vec<OddsSnapshot>;

    /// Latest lineup confirmed at or before `at`.
    fn lineup(&self, fixture_id: &str, at: DateTime<Utc>) -> Option<LineupConfirmation>;

    fn results(&self, fixture_id: &str) -> Vec<PlayerResult>;
}

/// Serialized form of a historical dataset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoricalDataset {
    pub fixtures: Vec<FixtureContext>,
    pub features: Vec<FeatureSnapshot>,
    pub odds: Vec<OddsSnapshot>,
    pub lineups: Vec<LineupConfirmation>,
    pub results: Vec<PlayerResult>,
}

impl HistoricalDataset {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading dataset {}", path.display()))?;
        let dataset: HistoricalDataset = serde_json::from_str(&raw)
            .with_context(|| format!("parsing dataset {}", path.display()))?;
        info!(
            "Loaded dataset {}: {} fixtures, {} feature snapshots, {} odds snapshots",
            path.display(),
            dataset.fixtures.len(),
            dataset.features.len(),
            dataset.odds.len()
        );
        Ok(dataset)
    }
}

#[derive(Debug, Default)]
struct Snapshots {
    fixtures: BTreeMap<FixtureId, FixtureContext>,
    features: BTreeMap<PlayerId, BTreeMap<DateTime<Utc>, FeatureSnapshot>>,
    odds: BTreeMap<(FixtureId, Market), Vec<OddsSnapshot>>,
    lineups: BTreeMap<FixtureId, Vec<LineupConfirmation>>,
    results: BTreeMap<FixtureId, BTreeMap<PlayerId, PlayerResult>>,
}

/// Thread-safe in-memory snapshot store
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Snapshots>>,
}

impl MemoryStore {
    pub fn from_dataset(dataset: HistoricalDataset) -> Self {
        let store = MemoryStore::default();
        for f in dataset.fixtures {
            store.upsert_fixture(f);
        }
        for s in dataset.features {
            store.insert_features(s);
        }
        for o in dataset.odds {
            store.insert_odds(o);
        }
        for l in dataset.lineups {
            store.insert_lineup(l);
        }
        for r in dataset.results {
            store.insert_result(r);
        }
        store
    }

    pub fn upsert_fixture(&self, fixture: FixtureContext) {
        self.inner
            .write()
            .fixtures
            .insert(fixture.fixture_id.clone(), fixture);
    }

    /// Snapshots are immutable: a second record for the same (player, as_of)
    /// is ignored. Returns whether the snapshot was stored.
    pub fn insert_features(&self, snapshot: FeatureSnapshot) -> bool {
        let mut inner = self.inner.write();
        let history = inner.features.entry(snapshot.player_id.clone()).or_default();
        if history.contains_key(&snapshot.as_of) {
            warn!(
                "Ignoring duplicate feature snapshot for {} at {}",
                snapshot.player_id, snapshot.as_of
            );
            return false;
        }
        history.insert(snapshot.as_of, snapshot);
        true
    }

    pub fn insert_odds(&self, snapshot: OddsSnapshot) {
        let mut inner = self.inner.write();
        let history = inner
            .odds
            .entry((snapshot.fixture_id.clone(), snapshot.market))
            .or_default();
        let at = history.partition_point(|s| s.ingested_at <= snapshot.ingested_at);
        history.insert(at, snapshot);
    }

    pub fn insert_lineup(&self, lineup: LineupConfirmation) {
        let mut inner = self.inner.write();
        let history = inner.lineups.entry(lineup.fixture_id.clone()).or_default();
        let at = history.partition_point(|l| l.confirmed_at <= lineup.confirmed_at);
        history.insert(at, lineup);
    }

    pub fn insert_result(&self, result: PlayerResult) {
        self.inner
            .write()
            .results
            .entry(result.fixture_id.clone())
            .or_default()
            .insert(result.player_id.clone(), result);
    }

    pub fn fixture_ids(&self) -> Vec<FixtureId> {
        self.inner.read().fixtures.keys().cloned().collect()
    }
}

impl SnapshotSource for MemoryStore {
    fn fixtures_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<FixtureContext> {
        let mut out: Vec<FixtureContext> = self
            .inner
            .read()
            .fixtures
            .values()
            .filter(|f| f.kickoff >= from && f.kickoff < to)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.kickoff
                .cmp(&b.kickoff)
                .then_with(|| a.fixture_id.cmp(&b.fixture_id))
        });
        out
    }

    fn fixture(&self, fixture_id: &str) -> Option<FixtureContext> {
        self.inner.read().fixtures.get(fixture_id).cloned()
    }

    fn feature_snapshot(&self, player_id: &str, at: DateTime<Utc>) -> Option<FeatureSnapshot> {
        self.inner
            .read()
            .features
            .get(player_id)
            .and_then(|h| h.range(..=at).next_back())
            .map(|(_, s)| s.clone())
    }

    fn odds_snapshots(&self, fixture_id: &str, market: Market, at: DateTime<Utc>) -> Vec<OddsSnapshot> {
        let inner = self.inner.read();
        let Some(history) = inner.odds.get(&(fixture_id.to_string(), market)) else {
            return Vec::new();
        };
        let mut latest: BTreeMap<&str, &OddsSnapshot> = BTreeMap::new();
        for s in history.iter().take_while(|s| s.ingested_at <= at) {
            latest.insert(&s.bookmaker, s);
        }
        latest.into_values().cloned().collect()
    }

    fn odds_history(&self, fixture_id: &str, market: Market) -> Vec<OddsSnapshot> {
        self.inner
            .read()
            .odds
            .get(&(fixture_id.to_string(), market))
            .cloned()
            .unwrap_or_default()
    }

    fn lineup(&self, fixture_id: &str, at: DateTime<Utc>) -> Option<LineupConfirmation> {
        self.inner
            .read()
            .lineups
            .get(fixture_id)
            .and_then(|h| h.iter().rev().find(|l| l.confirmed_at <= at))
            .cloned()
    }

    fn results(&self, fixture_id: &str) -> Vec<PlayerResult> {
        self.inner
            .read()
            .results
            .get(fixture_id)
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default()
    }
}

// ── Output log ─────────────────────────────────────────────────────────────

/// Outcome of appending to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Commit {
    Accepted,
    /// A newer version for the same key is already logged
    Superseded,
    /// The same version was already logged by a concurrent trigger
    Duplicate,
}

#[derive(Debug, Default)]
struct LogState {
    outputs: Vec<ModelOutput>,
    latest_output: HashMap<OutputKey, usize>,
    decisions: Vec<Decision>,
    latest_decision: HashMap<DecisionKey, usize>,
    by_id: HashMap<Uuid, usize>,
}

/// Append-only ModelOutput / Decision log. Each commit runs under one lock,
/// so the supersession check and the write are atomic per key.
#[derive(Debug, Clone, Default)]
pub struct OutputLog {
    inner: Arc<Mutex<LogState>>,
}

impl OutputLog {
    pub fn commit_output(&self, output: ModelOutput) -> Commit {
        let mut state = self.inner.lock();
        let key = output.key();
        if let Some(&i) = state.latest_output.get(&key) {
            let current = state.outputs[i].version();
            if current > output.version() {
                info!(
                    fixture = %key.fixture_id,
                    player = %key.player_id,
                    phase = output.phase.as_str(),
                    "Discarding superseded model output"
                );
                return Commit::Superseded;
            }
            if current == output.version() {
                return Commit::Duplicate;
            }
        }
        let i = state.outputs.len();
        state.outputs.push(output);
        state.latest_output.insert(key, i);
        Commit::Accepted
    }

    /// Log a decision. Executed records always append; others must come from
    /// a newer model version than what is logged for the key.
    pub fn commit_decision(&self, mut decision: Decision) -> Commit {
        let mut state = self.inner.lock();
        let key = decision.key();
        if let Some(&i) = state.latest_decision.get(&key) {
            let current = &state.decisions[i];
            if decision.status != DecisionStatus::Executed {
                let current_version = (current.phase, current.model_computed_at);
                let incoming = (decision.phase, decision.model_computed_at);
                if current_version > incoming {
                    debug!(player = %key.player_id, "Discarding superseded decision");
                    return Commit::Superseded;
                }
                if current_version == incoming {
                    return Commit::Duplicate;
                }
                decision.supersedes = Some(current.id);
            }
        }
        let i = state.decisions.len();
        state.by_id.insert(decision.id, i);
        state.decisions.push(decision);
        state.latest_decision.insert(key, i);
        Commit::Accepted
    }

    pub fn latest_output(&self, key: &OutputKey) -> Option<ModelOutput> {
        let state = self.inner.lock();
        state.latest_output.get(key).map(|&i| state.outputs[i].clone())
    }

    /// Latest output per key for a fixture, ordered by player then market.
    pub fn outputs_for(&self, fixture_id: &str) -> Vec<ModelOutput> {
        let state = self.inner.lock();
        let mut out: Vec<ModelOutput> = state
            .latest_output
            .iter()
            .filter(|(k, _)| k.fixture_id == fixture_id)
            .map(|(_, &i)| state.outputs[i].clone())
            .collect();
        out.sort_by(|a, b| a.key().cmp(&b.key()));
        out
    }

    /// Every output ever accepted, in commit order.
    pub fn output_history(&self) -> Vec<ModelOutput> {
        self.inner.lock().outputs.clone()
    }

    pub fn decision(&self, id: Uuid) -> Option<Decision> {
        let state = self.inner.lock();
        state.by_id.get(&id).map(|&i| state.decisions[i].clone())
    }

    /// Most recent decision for a selection across bookmakers.
    pub fn latest_decision_for(&self, key: &OutputKey) -> Option<Decision> {
        let state = self.inner.lock();
        state
            .latest_decision
            .iter()
            .filter(|(k, _)| {
                k.fixture_id == key.fixture_id && k.player_id == key.player_id && k.market == key.market
            })
            .map(|(_, &i)| &state.decisions[i])
            .max_by(|a, b| {
                (a.phase, a.model_computed_at, a.decided_at)
                    .cmp(&(b.phase, b.model_computed_at, b.decided_at))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .cloned()
    }

    /// Full decision history for a fixture, in commit order.
    pub fn decisions_for(&self, fixture_id: &str) -> Vec<Decision> {
        self.inner
            .lock()
            .decisions
            .iter()
            .filter(|d| d.fixture_id == fixture_id)
            .cloned()
            .collect()
    }
}
