//! Operator-facing configuration store
//!
//! Holds which tokens are traded (and on which forecast channel), the
//! operating mode, and the queue of operator commands. Commands are drained
//! exactly once.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{info, warn};

/// Whether the decision logic runs at all
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    Standby,
    Active,
}

impl Default for OperatingMode {
    fn default() -> Self {
        OperatingMode::Standby
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatingMode::Standby => write!(f, "standby"),
            OperatingMode::Active => write!(f, "active"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum OperatorCommand {
    SetMode { mode: OperatingMode },
    Activate { token: String, channel: String },
    Deactivate { token: String },
    ClosePosition { token: String },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// token -> forecast channel
    async fn active_channels(&self) -> Result<HashMap<String, String>>;

    async fn activate(&self, token: &str, channel: &str) -> Result<()>;

    async fn deactivate(&self, token: &str) -> Result<()>;

    async fn operating_mode(&self) -> Result<OperatingMode>;

    async fn set_operating_mode(&self, mode: OperatingMode) -> Result<()>;

    async fn enqueue_command(&self, command: OperatorCommand) -> Result<()>;

    /// Each command is returned by exactly one call
    async fn drain_pending_commands(&self) -> Result<Vec<OperatorCommand>>;
}

/// Persisted part of the store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    pub mode: OperatingMode,
    pub channels: HashMap<String, String>,
    #[serde(default)]
    pub pending: VecDeque<OperatorCommand>,
}

/// Store kept in memory, optionally mirrored to a JSON file so operator
/// changes survive a restart.
pub struct InMemoryConfigStore {
    state: RwLock<StoreState>,
    state_file: Option<PathBuf>,
}

impl InMemoryConfigStore {
    pub fn new(initial: StoreState) -> Self {
        Self {
            state: RwLock::new(initial),
            state_file: None,
        }
    }

    /// Load from `path` when it exists, otherwise start from `initial`.
    pub fn with_state_file(initial: StoreState, path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read store state {}", path.display()))?;
            let loaded: StoreState = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse store state {}", path.display()))?;
            info!(
                path = %path.display(),
                mode = %loaded.mode,
                channels = loaded.channels.len(),
                pending = loaded.pending.len(),
                "Store state restored"
            );
            loaded
        } else {
            info!(path = %path.display(), "No store state file, starting from configuration");
            initial
        };
        Ok(Self {
            state: RwLock::new(state),
            state_file: Some(path),
        })
    }

    pub fn snapshot(&self) -> StoreState {
        self.state.read().map(|s| s.clone()).unwrap_or_default()
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut StoreState) -> T) -> Result<T> {
        let (out, snapshot) = {
            let mut state = self.state.write().map_err(|_| anyhow!("store lock poisoned"))?;
            let out = f(&mut state);
            (out, state.clone())
        };
        self.save(&snapshot);
        Ok(out)
    }

    fn save(&self, state: &StoreState) {
        let Some(path) = &self.state_file else {
            return;
        };
        let result = serde_json::to_string_pretty(state)
            .map_err(anyhow::Error::from)
            .and_then(|json| std::fs::write(path, json).map_err(anyhow::Error::from));
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "Failed to save store state");
        }
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn active_channels(&self) -> Result<HashMap<String, String>> {
        let state = self.state.read().map_err(|_| anyhow!("store lock poisoned"))?;
        Ok(state.channels.clone())
    }

    async fn activate(&self, token: &str, channel: &str) -> Result<()> {
        self.mutate(|s| {
            s.channels.insert(token.to_string(), channel.to_string());
        })
    }

    async fn deactivate(&self, token: &str) -> Result<()> {
        self.mutate(|s| {
            s.channels.remove(token);
        })
    }

    async fn operating_mode(&self) -> Result<OperatingMode> {
        let state = self.state.read().map_err(|_| anyhow!("store lock poisoned"))?;
        Ok(state.mode)
    }

    async fn set_operating_mode(&self, mode: OperatingMode) -> Result<()> {
        self.mutate(|s| s.mode = mode)
    }

    async fn enqueue_command(&self, command: OperatorCommand) -> Result<()> {
        self.mutate(|s| s.pending.push_back(command))
    }

    async fn drain_pending_commands(&self) -> Result<Vec<OperatorCommand>> {
        self.mutate(|s| s.pending.drain(..).collect())
    }
}
