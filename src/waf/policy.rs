use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::PolicyConfig;
use crate::error::{Result as WafResult, WafError};
use super::{Action, FeatureVector, StateKey};

/// Current checkpoint schema version
pub const CHECKPOINT_VERSION: u32 = 1;

/// Learned expected reward per (state, action). Reads never insert.
#[derive(Debug, Clone, Default)]
pub struct ValueTable {
    values: HashMap<StateKey, BTreeMap<Action, f64>>,
}

impl ValueTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &StateKey, action: Action) -> Option<f64> {
        self.values.get(key).and_then(|actions| actions.get(&action)).copied()
    }

    pub fn value_or(&self, key: &StateKey, action: Action, default: f64) -> f64 {
        self.get(key, action).unwrap_or(default)
    }

    pub fn set(&mut self, key: StateKey, action: Action, value: f64) {
        self.values.entry(key).or_default().insert(action, value);
    }

    /// Number of (state, action) entries
    pub fn len(&self) -> usize {
        self.values.values().map(|actions| actions.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn state_count(&self) -> usize {
        self.values.len()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&StateKey, Action, f64)> + '_ {
        self.values
            .iter()
            .flat_map(|(key, actions)| actions.iter().map(move |(action, value)| (key, *action, *value)))
    }
}

/// One learned value in a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub state: StateKey,
    pub action: Action,
    pub value: f64,
}

/// Versioned, inspectable snapshot of the agent: hyperparameters, counters
/// and every learned (state, action, value) triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyCheckpoint {
    pub version: u32,
    pub exploration_rate: f64,
    pub learning_rate: f64,
    pub default_value: f64,
    pub total_updates: u64,
    pub exploration_count: u64,
    pub exploitation_count: u64,
    pub entries: Vec<CheckpointEntry>,
}

#[derive(Deserialize)]
struct CheckpointHeader {
    version: u32,
}

impl PolicyCheckpoint {
    pub fn to_bytes(&self) -> WafResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> WafResult<Self> {
        let header: CheckpointHeader = serde_json::from_slice(bytes)?;
        if header.version != CHECKPOINT_VERSION {
            return Err(WafError::UnsupportedCheckpointVersion {
                found: header.version,
                expected: CHECKPOINT_VERSION,
            });
        }

        let checkpoint: PolicyCheckpoint = serde_json::from_slice(bytes)?;
        checkpoint.validate()?;
        Ok(checkpoint)
    }

    fn validate(&self) -> WafResult<()> {
        let invalid = |message: String| WafError::checkpoint("snapshot", message);

        if !(0.0..=1.0).contains(&self.exploration_rate) {
            return Err(invalid(format!("exploration rate {} out of range", self.exploration_rate)));
        }
        if !(0.0..=1.0).contains(&self.learning_rate) {
            return Err(invalid(format!("learning rate {} out of range", self.learning_rate)));
        }
        if !self.default_value.is_finite() {
            return Err(invalid("default value is not finite".to_string()));
        }
        if let Some(entry) = self.entries.iter().find(|e| !e.value.is_finite()) {
            return Err(invalid(format!("value for {} is not finite", entry.state)));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct PolicyState {
    table: ValueTable,
    exploration_rate: f64,
    learning_rate: f64,
    default_value: f64,
}

impl PolicyState {
    fn values_for(&self, key: &StateKey) -> [(Action, f64); 6] {
        Action::ALL.map(|action| (action, self.table.value_or(key, action, self.default_value)))
    }

    /// Epsilon-greedy choice. Returns the action and whether it was exploratory.
    fn choose(&self, key: &StateKey) -> (Action, bool) {
        let mut rng = rand::thread_rng();

        if rng.gen::<f64>() < self.exploration_rate {
            let action = Action::ALL[rng.gen_range(0..Action::ALL.len())];
            return (action, true);
        }

        let values = self.values_for(key);
        let best = values
            .iter()
            .map(|(_, value)| *value)
            .fold(f64::NEG_INFINITY, f64::max);
        let tied: Vec<Action> = values
            .iter()
            .filter(|(_, value)| *value == best)
            .map(|(action, _)| *action)
            .collect();

        let action = match tied.len() {
            0 => Action::LogOnly,
            1 => tied[0],
            n => tied[rng.gen_range(0..n)],
        };
        (action, false)
    }
}

/// Contextual-bandit policy agent (epsilon-greedy over a tabular value estimate)
///
/// The value table sits behind a single `RwLock`: selections share the read
/// side, updates take the write side, so every read-modify-write of an entry
/// is applied whole and in order.
pub struct PolicyAgent {
    state: RwLock<PolicyState>,
    total_updates: AtomicU64,
    exploration_count: AtomicU64,
    exploitation_count: AtomicU64,
}

impl PolicyAgent {
    pub fn new(config: &PolicyConfig) -> Self {
        Self {
            state: RwLock::new(PolicyState {
                table: ValueTable::new(),
                exploration_rate: clamp_unit(config.exploration_rate),
                learning_rate: clamp_unit(config.learning_rate),
                default_value: if config.default_value.is_finite() {
                    config.default_value
                } else {
                    0.0
                },
            }),
            total_updates: AtomicU64::new(0),
            exploration_count: AtomicU64::new(0),
            exploitation_count: AtomicU64::new(0),
        }
    }

    /// Select an action for the given features.
    pub async fn select(&self, features: &FeatureVector) -> Action {
        let key = features.state_key();
        let (action, explored) = {
            let state = self.state.read().await;
            state.choose(&key)
        };

        if explored {
            self.exploration_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.exploitation_count.fetch_add(1, Ordering::Relaxed);
        }

        debug!("Policy selected {} ({})", action, if explored { "explore" } else { "exploit" });
        action
    }

    /// Move the stored value toward `reward`: `v <- v + alpha * (reward - v)`.
    /// Returns the new value.
    pub async fn update(&self, features: &FeatureVector, action: Action, reward: f64) -> WafResult<f64> {
        if !reward.is_finite() {
            return Err(WafError::InvalidReward {
                action: action.to_string(),
                reward,
            });
        }

        let key = features.state_key();
        let mut state = self.state.write().await;
        let old = state.table.value_or(&key, action, state.default_value);
        let new = old + state.learning_rate * (reward - old);
        // Finite inputs can still overflow, and the checkpoint cannot hold infinities.
        if !new.is_finite() {
            return Err(WafError::InvalidReward {
                action: action.to_string(),
                reward,
            });
        }
        state.table.set(key, action, new);
        drop(state);

        self.total_updates.fetch_add(1, Ordering::Relaxed);
        debug!("Policy update {}: {:.4} -> {:.4} (reward {:+.4})", action, old, new, reward);
        Ok(new)
    }

    /// Learned values for every action in the state of `features`
    pub async fn values(&self, features: &FeatureVector) -> Vec<(Action, f64)> {
        let key = features.state_key();
        let state = self.state.read().await;
        state.values_for(&key).to_vec()
    }

    /// Clamp into [0, 1]; NaN disables exploration.
    pub async fn set_exploration_rate(&self, rate: f64) {
        let rate = clamp_unit(rate);
        self.state.write().await.exploration_rate = rate;
        info!("Exploration rate set to {}", rate);
    }

    pub async fn exploration_rate(&self) -> f64 {
        self.state.read().await.exploration_rate
    }

    pub async fn table_len(&self) -> usize {
        self.state.read().await.table.len()
    }

    pub fn reset_statistics(&self) {
        self.total_updates.store(0, Ordering::Relaxed);
        self.exploration_count.store(0, Ordering::Relaxed);
        self.exploitation_count.store(0, Ordering::Relaxed);
    }

    pub async fn statistics(&self) -> serde_json::Value {
        let state = self.state.read().await;
        let exploration = self.exploration_count.load(Ordering::Relaxed);
        let exploitation = self.exploitation_count.load(Ordering::Relaxed);
        let decisions = exploration + exploitation;

        serde_json::json!({
            "total_updates": self.total_updates.load(Ordering::Relaxed),
            "total_decisions": decisions,
            "exploration_count": exploration,
            "exploitation_count": exploitation,
            "exploration_ratio": if decisions > 0 {
                exploration as f64 / decisions as f64
            } else {
                0.0
            },
            "table_entries": state.table.len(),
            "states_learned": state.table.state_count(),
            "exploration_rate": state.exploration_rate,
            "learning_rate": state.learning_rate,
        })
    }

    pub async fn snapshot(&self) -> PolicyCheckpoint {
        let state = self.state.read().await;
        let mut entries: Vec<CheckpointEntry> = state
            .table
            .entries()
            .map(|(key, action, value)| CheckpointEntry {
                state: key.clone(),
                action,
                value,
            })
            .collect();
        entries.sort_by(|a, b| a.state.cmp(&b.state).then(a.action.cmp(&b.action)));

        PolicyCheckpoint {
            version: CHECKPOINT_VERSION,
            exploration_rate: state.exploration_rate,
            learning_rate: state.learning_rate,
            default_value: state.default_value,
            total_updates: self.total_updates.load(Ordering::Relaxed),
            exploration_count: self.exploration_count.load(Ordering::Relaxed),
            exploitation_count: self.exploitation_count.load(Ordering::Relaxed),
            entries,
        }
    }

    /// Replace all in-memory state with the checkpoint.
    pub async fn restore(&self, checkpoint: PolicyCheckpoint) {
        let mut table = ValueTable::new();
        for entry in checkpoint.entries {
            table.set(entry.state, entry.action, entry.value);
        }

        let mut state = self.state.write().await;
        *state = PolicyState {
            table,
            exploration_rate: checkpoint.exploration_rate,
            learning_rate: checkpoint.learning_rate,
            default_value: checkpoint.default_value,
        };
        self.total_updates.store(checkpoint.total_updates, Ordering::Relaxed);
        self.exploration_count.store(checkpoint.exploration_count, Ordering::Relaxed);
        self.exploitation_count.store(checkpoint.exploitation_count, Ordering::Relaxed);
    }

    pub async fn checkpoint_save(&self) -> WafResult<Vec<u8>> {
        self.snapshot().await.to_bytes()
    }

    pub async fn checkpoint_load(&self, bytes: &[u8]) -> WafResult<()> {
        let checkpoint = PolicyCheckpoint::from_bytes(bytes)?;
        self.restore(checkpoint).await;
        Ok(())
    }

    pub async fn save_checkpoint(&self, store: &dyn CheckpointStore) -> WafResult<()> {
        let bytes = self.checkpoint_save().await?;
        store.save(&bytes).await?;
        debug!("Policy checkpoint written to {} ({} bytes)", store.location(), bytes.len());
        Ok(())
    }

    /// Restore from the store. `Ok(false)` when no checkpoint exists yet.
    pub async fn load_checkpoint(&self, store: &dyn CheckpointStore) -> WafResult<bool> {
        match store.load().await? {
            Some(bytes) => {
                self.checkpoint_load(&bytes).await.map_err(|e| {
                    warn!("Rejected checkpoint at {}: {}", store.location(), e);
                    e
                })?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
