// src/core/address.rs

//! Per-node liveness record and its state machine.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use strum_macros::{Display, EnumString};
use tracing::warn;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum AddressState {
    /// Never heard from since the fleet daemon started.
    Unknown,
    /// First tick received, handshake with the node in progress.
    Checking,
    /// Alive and authorized.
    Running,
    /// Heartbeats stopped.
    Silent,
    /// Authorization refused, isolation pending.
    Isolating,
    /// Excluded from the fleet until restart.
    Isolated,
}

impl AddressState {
    pub fn code(self) -> u16 {
        match self {
            AddressState::Unknown => 0,
            AddressState::Checking => 1,
            AddressState::Running => 2,
            AddressState::Silent => 3,
            AddressState::Isolating => 4,
            AddressState::Isolated => 5,
        }
    }

    /// Transitions accepted from this state.
    fn successors(self) -> &'static [AddressState] {
        match self {
            AddressState::Unknown => &[AddressState::Checking, AddressState::Isolating],
            AddressState::Checking => &[
                AddressState::Running,
                AddressState::Silent,
                AddressState::Isolating,
            ],
            AddressState::Running => &[AddressState::Silent, AddressState::Isolating],
            AddressState::Silent => &[AddressState::Checking, AddressState::Isolating],
            AddressState::Isolating => &[AddressState::Isolated],
            AddressState::Isolated => &[],
        }
    }
}

/// Liveness view of one node.
#[derive(Debug, Clone)]
pub struct AddressStatus {
    pub name: String,
    pub state: AddressState,
    /// Wall-clock seconds of the last tick, as stamped by the remote node.
    pub remote_time: u64,
    /// Monotonic local time of the last tick.
    pub local_time: Duration,
}

impl AddressStatus {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: AddressState::Unknown,
            remote_time: 0,
            local_time: Duration::ZERO,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == AddressState::Running
    }

    /// Whether the node is out of the fleet for good.
    pub fn in_isolation(&self) -> bool {
        matches!(
            self.state,
            AddressState::Isolating | AddressState::Isolated
        )
    }

    /// Applies a state transition, rejecting (and logging) illegal ones.
    /// Self-transitions are accepted silently.
    pub fn transition(&mut self, new_state: AddressState) -> bool {
        if self.state == new_state {
            return true;
        }
        if self.state.successors().contains(&new_state) {
            self.state = new_state;
            true
        } else {
            warn!(
                "Rejected node state transition {} -> {} for '{}'",
                self.state, new_state, self.name
            );
            false
        }
    }

    pub fn update_times(&mut self, remote_time: u64, local_time: Duration) {
        self.remote_time = remote_time;
        self.local_time = local_time;
    }

    /// The serial form used by RPC replies and ADDRESS events. The loading
    /// figure lives in the context, so it is passed in.
    pub fn serial(&self, loading: u32) -> serde_json::Value {
        json!({
            "address_name": self.name,
            "statecode": self.state.code(),
            "statename": self.state.to_string(),
            "remote_time": self.remote_time,
            "local_time": self.local_time.as_secs(),
            "loading": loading,
        })
    }
}
