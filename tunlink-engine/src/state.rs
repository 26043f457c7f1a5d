//! Service state and snapshot types

use serde::{Deserialize, Serialize};

/// Lifecycle state of the tunnel service.
///
/// The normal progression is `Stopped -> Starting -> Running -> Stopped`;
/// a failure may regress any state directly to `Stopped`. The state is not
/// persisted as terminal: a restarted worker always resumes from `Stopped`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Tunnel is not running
    #[default]
    Stopped,
    /// Tunnel is being established
    Starting,
    /// Tunnel is up and forwarding
    Running,
}

impl ServiceState {
    /// Stable wire ordinal for the control endpoint.
    pub fn ordinal(self) -> u8 {
        match self {
            ServiceState::Stopped => 0,
            ServiceState::Starting => 1,
            ServiceState::Running => 2,
        }
    }

    /// Decode a wire ordinal.
    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(ServiceState::Stopped),
            1 => Some(ServiceState::Starting),
            2 => Some(ServiceState::Running),
            _ => None,
        }
    }

    /// Check if the service is in an active state
    pub fn is_active(self) -> bool {
        matches!(self, ServiceState::Starting | ServiceState::Running)
    }

    /// Get a human-readable description
    pub fn description(self) -> &'static str {
        match self {
            ServiceState::Stopped => "Stopped",
            ServiceState::Starting => "Starting...",
            ServiceState::Running => "Running",
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Immutable copy of the canonical service state at one instant.
///
/// Produced atomically by the hub on every mutation; the broadcast payload
/// and the durable-store payload always derive from the same snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Current lifecycle state
    pub state: ServiceState,
    /// Label of the active target (node/profile name), empty when stopped
    pub active_label: String,
    /// Last error message, empty when none
    pub last_error: String,
    /// Whether the user explicitly stopped the tunnel
    pub manually_stopped: bool,
}

/// Partial update applied to the canonical snapshot.
///
/// Only fields that are present are applied and persisted, so one subsystem
/// updating the active label never clobbers another subsystem's error field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateUpdate {
    pub state: Option<ServiceState>,
    pub active_label: Option<String>,
    pub last_error: Option<String>,
    pub manually_stopped: Option<bool>,
}

impl StateUpdate {
    /// Create an empty update
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lifecycle state
    pub fn state(mut self, state: ServiceState) -> Self {
        self.state = Some(state);
        self
    }

    /// Set the active target label
    pub fn active_label(mut self, label: impl Into<String>) -> Self {
        self.active_label = Some(label.into());
        self
    }

    /// Set the last error message
    pub fn last_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    /// Set the manual-stop flag
    pub fn manually_stopped(mut self, stopped: bool) -> Self {
        self.manually_stopped = Some(stopped);
        self
    }

    /// Check whether the update carries no fields at all
    pub fn is_empty(&self) -> bool {
        self.state.is_none()
            && self.active_label.is_none()
            && self.last_error.is_none()
            && self.manually_stopped.is_none()
    }

    /// Apply the present fields to a snapshot
    pub fn apply_to(&self, snapshot: &mut StateSnapshot) {
        if let Some(state) = self.state {
            snapshot.state = state;
        }
        if let Some(ref label) = self.active_label {
            snapshot.active_label = label.clone();
        }
        if let Some(ref error) = self.last_error {
            snapshot.last_error = error.clone();
        }
        if let Some(stopped) = self.manually_stopped {
            snapshot.manually_stopped = stopped;
        }
    }
}
