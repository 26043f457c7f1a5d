//! Durable cross-process state store
//!
//! The store is the fallback truth source when the live RPC channel cannot
//! be trusted, so every write must be synchronous and immediately visible
//! to the other process. Writes go to a temporary file in the same
//! directory, are fsynced, and are then atomically renamed over the target,
//! so a reader never observes a torn document.
//!
//! The hub-owned connection state and the UI-owned tunnel settings live in
//! separate files; each file has exactly one writer process, which removes
//! the only read-modify-write race without needing cross-process locking.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::state::{ServiceState, StateSnapshot, StateUpdate};

const STATE_FILE: &str = "state.json";
const SETTINGS_FILE: &str = "settings.json";

/// Hub-owned keys persisted on every state transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    active: bool,
    #[serde(default)]
    active_label: String,
    #[serde(default)]
    last_error: String,
    #[serde(default)]
    manually_stopped: bool,
}

/// UI-owned hand-off blobs consumed by the tunnel-establishment code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct PersistedSettings {
    #[serde(default)]
    per_app: PerAppVpn,
    #[serde(default)]
    tun: TunOptions,
}

/// Per-app VPN routing mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerAppMode {
    /// Route all apps through the tunnel
    #[default]
    Off,
    /// Route only the listed apps
    Include,
    /// Route everything except the listed apps
    Exclude,
}

/// Per-app VPN selection handed to the tunnel-establishment code
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerAppVpn {
    /// Routing mode
    #[serde(default)]
    pub mode: PerAppMode,
    /// Package names the mode applies to
    #[serde(default)]
    pub packages: Vec<String>,
}

/// TUN parameters handed to the tunnel-establishment code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunOptions {
    /// Interface MTU
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// Whether to assign an IPv6 address to the interface
    #[serde(default)]
    pub ipv6: bool,
    /// Interface address in CIDR notation
    #[serde(default = "default_tun_address")]
    pub address: String,
}

impl Default for TunOptions {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            ipv6: false,
            address: default_tun_address(),
        }
    }
}

fn default_mtu() -> u16 {
    1500
}

fn default_tun_address() -> String {
    "172.19.0.1/28".to_string()
}

/// Crash-durable, multi-process-safe key/value store.
///
/// Every getter re-reads the backing file, so a value written by the other
/// process is visible on the very next read. Missing or corrupted files
/// read as defaults rather than erroring; the store is a fallback path and
/// must never take the caller down with it.
pub struct StateStore {
    state_path: PathBuf,
    settings_path: PathBuf,
}

impl StateStore {
    /// Open (and create if needed) the store directory.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::Store(format!("failed to create {:?}: {}", dir, e)))?;
        Ok(Self {
            state_path: dir.join(STATE_FILE),
            settings_path: dir.join(SETTINGS_FILE),
        })
    }

    // Hub-owned connection state

    /// Persist the fields present in a partial update.
    pub fn apply(&self, update: &StateUpdate) -> Result<()> {
        let mut persisted: PersistedState = read_json(&self.state_path);
        if let Some(state) = update.state {
            persisted.active = state == ServiceState::Running;
        }
        if let Some(ref label) = update.active_label {
            persisted.active_label = label.clone();
        }
        if let Some(ref error) = update.last_error {
            persisted.last_error = error.clone();
        }
        if let Some(stopped) = update.manually_stopped {
            persisted.manually_stopped = stopped;
        }
        write_json(&self.state_path, &persisted)
    }

    /// Persist a full snapshot, replacing all hub-owned keys.
    pub fn write_snapshot(&self, snapshot: &StateSnapshot) -> Result<()> {
        write_json(
            &self.state_path,
            &PersistedState {
                active: snapshot.state == ServiceState::Running,
                active_label: snapshot.active_label.clone(),
                last_error: snapshot.last_error.clone(),
                manually_stopped: snapshot.manually_stopped,
            },
        )
    }

    /// Reconstruct a snapshot from the durable keys.
    ///
    /// The store does not distinguish `Starting` from `Running`; the active
    /// flag is only set once the tunnel is actually up, so the fallback is
    /// never wrong about whether the tunnel is fundamentally up or down.
    pub fn snapshot(&self) -> StateSnapshot {
        let persisted: PersistedState = read_json(&self.state_path);
        StateSnapshot {
            state: if persisted.active {
                ServiceState::Running
            } else {
                ServiceState::Stopped
            },
            active_label: persisted.active_label,
            last_error: persisted.last_error,
            manually_stopped: persisted.manually_stopped,
        }
    }

    /// Whether the tunnel was up at the last durable transition
    pub fn active(&self) -> bool {
        read_json::<PersistedState>(&self.state_path).active
    }

    pub fn set_active(&self, active: bool) -> Result<()> {
        let mut persisted: PersistedState = read_json(&self.state_path);
        persisted.active = active;
        write_json(&self.state_path, &persisted)
    }

    pub fn active_label(&self) -> String {
        read_json::<PersistedState>(&self.state_path).active_label
    }

    pub fn set_active_label(&self, label: &str) -> Result<()> {
        let mut persisted: PersistedState = read_json(&self.state_path);
        persisted.active_label = label.to_string();
        write_json(&self.state_path, &persisted)
    }

    pub fn last_error(&self) -> String {
        read_json::<PersistedState>(&self.state_path).last_error
    }

    pub fn set_last_error(&self, error: &str) -> Result<()> {
        let mut persisted: PersistedState = read_json(&self.state_path);
        persisted.last_error = error.to_string();
        write_json(&self.state_path, &persisted)
    }

    pub fn manually_stopped(&self) -> bool {
        read_json::<PersistedState>(&self.state_path).manually_stopped
    }

    pub fn set_manually_stopped(&self, stopped: bool) -> Result<()> {
        let mut persisted: PersistedState = read_json(&self.state_path);
        persisted.manually_stopped = stopped;
        write_json(&self.state_path, &persisted)
    }

    // UI-owned tunnel settings

    pub fn per_app(&self) -> PerAppVpn {
        read_json::<PersistedSettings>(&self.settings_path).per_app
    }

    pub fn set_per_app(&self, per_app: &PerAppVpn) -> Result<()> {
        let mut settings: PersistedSettings = read_json(&self.settings_path);
        settings.per_app = per_app.clone();
        write_json(&self.settings_path, &settings)
    }

    pub fn tun_options(&self) -> TunOptions {
        read_json::<PersistedSettings>(&self.settings_path).tun
    }

    pub fn set_tun_options(&self, tun: &TunOptions) -> Result<()> {
        let mut settings: PersistedSettings = read_json(&self.settings_path);
        settings.tun = tun.clone();
        write_json(&self.settings_path, &settings)
    }
}

/// Read a JSON document, falling back to defaults on absence or corruption.
fn read_json<T: DeserializeOwned + Default>(path: &Path) -> T {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            log::warn!("corrupted store file {:?}, using defaults: {}", path, e);
            T::default()
        }),
        Err(_) => T::default(),
    }
}

/// Write a JSON document durably: temp file in the same directory, fsync,
/// atomic rename over the target.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let payload = serde_json::to_vec_pretty(value)?;
    let tmp_path = path.with_extension("json.tmp");

    let mut file = File::create(&tmp_path)
        .map_err(|e| Error::Store(format!("failed to create {:?}: {}", tmp_path, e)))?;
    file.write_all(&payload)
        .map_err(|e| Error::Store(format!("failed to write {:?}: {}", tmp_path, e)))?;
    file.sync_all()
        .map_err(|e| Error::Store(format!("failed to sync {:?}: {}", tmp_path, e)))?;
    drop(file);

    std::fs::rename(&tmp_path, path)
        .map_err(|e| Error::Store(format!("failed to rename {:?}: {}", tmp_path, e)))?;
    Ok(())
}
