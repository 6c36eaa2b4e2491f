use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::errors::{AtxError, AtxResult};
use crate::interfaces::Clock;
use crate::types::{AtxId, Epoch};

/// What to do with an ATX whose previous-ATX reference does not match the
/// identity's last known ATX. Upstream deployments log and store anyway;
/// `Enforce` rejects instead.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextualPolicy {
    #[default]
    LogOnly,
    Enforce,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub key_path: PathBuf,
    /// Unix timestamp of the first epoch's start.
    pub genesis_unix: u64,
    pub epoch_duration_secs: u64,
    /// PoET leaves per verifiable tick.
    pub tick_size: u64,
    /// Hex-encoded golden ATX id, the bootstrap positioning anchor.
    pub golden_atx: String,
    #[serde(default)]
    pub contextual_policy: ContextualPolicy,
}

fn default_epoch_duration() -> u64 {
    4 * 60 * 60
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            key_path: PathBuf::from("./keys/node.toml"),
            genesis_unix: 0,
            epoch_duration_secs: default_epoch_duration(),
            tick_size: 5_000,
            golden_atx: hex::encode([0u8; 32]),
            contextual_policy: ContextualPolicy::default(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> AtxResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|err| AtxError::Config(format!("unable to parse config: {err}")))
    }

    pub fn save(&self, path: &Path) -> AtxResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| AtxError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> AtxResult<()> {
        fs::create_dir_all(&self.data_dir)?;
        if let Some(parent) = self.key_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    pub fn golden_atx_id(&self) -> AtxResult<AtxId> {
        let bytes = hex::decode(&self.golden_atx)
            .map_err(|err| AtxError::Config(format!("invalid golden atx encoding: {err}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| AtxError::Config("golden atx must be 32 bytes".into()))?;
        Ok(AtxId(bytes))
    }

    pub fn clock(&self) -> AtxResult<SystemClock> {
        if self.epoch_duration_secs == 0 {
            return Err(AtxError::Config("epoch duration must not be zero".into()));
        }
        Ok(SystemClock {
            genesis_unix: self.genesis_unix,
            epoch_duration_secs: self.epoch_duration_secs,
        })
    }
}

/// Wall-clock epoch source derived from the configured genesis time.
#[derive(Clone, Debug)]
pub struct SystemClock {
    genesis_unix: u64,
    epoch_duration_secs: u64,
}

impl Clock for SystemClock {
    fn current_epoch(&self) -> Epoch {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        let elapsed = now.saturating_sub(self.genesis_unix);
        (elapsed / self.epoch_duration_secs) as Epoch
    }
}
