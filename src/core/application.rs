// src/core/application.rs

//! Aggregate view of one application and its member processes.
//!
//! The application state and failure flags are pure functions of the member
//! processes and are recomputed after every member event.

use crate::core::process::{ProcessState, ProcessStatus};
use crate::core::rules::ApplicationRules;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use strum_macros::{Display, EnumString};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ApplicationState {
    Unknown,
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ApplicationState {
    pub fn code(self) -> u16 {
        match self {
            ApplicationState::Unknown => 0,
            ApplicationState::Stopped => 1,
            ApplicationState::Starting => 2,
            ApplicationState::Running => 3,
            ApplicationState::Stopping => 4,
        }
    }

    pub fn is_running(self) -> bool {
        matches!(
            self,
            ApplicationState::Starting | ApplicationState::Running | ApplicationState::Stopping
        )
    }
}

/// One application of the fleet. Owns its member `ProcessStatus` records;
/// everything else refers to them by name through the context.
#[derive(Debug, Clone)]
pub struct ApplicationStatus {
    pub name: String,
    pub state: ApplicationState,
    /// A required member crashed while the application was running.
    pub major_failure: bool,
    /// An optional member crashed while the application was running.
    pub minor_failure: bool,
    pub rules: ApplicationRules,
    pub processes: BTreeMap<String, ProcessStatus>,
}

impl ApplicationStatus {
    pub fn new(name: &str, rules: ApplicationRules) -> Self {
        Self {
            name: name.to_string(),
            state: ApplicationState::Unknown,
            major_failure: false,
            minor_failure: false,
            rules,
            processes: BTreeMap::new(),
        }
    }

    /// Recomputes state and failure flags from the members.
    pub fn refresh(&mut self) {
        self.state = derive_state(self.processes.values());

        let running = self.state.is_running();
        self.major_failure = running
            && self
                .processes
                .values()
                .any(|p| p.rules.required && p.crashed());
        self.minor_failure = running
            && self
                .processes
                .values()
                .any(|p| !p.rules.required && p.crashed());
    }

    /// Members grouped by start sequence, negative buckets excluded.
    pub fn start_buckets(&self) -> BTreeMap<i32, Vec<&ProcessStatus>> {
        sequence_buckets(self.processes.values(), |p| p.rules.start_sequence)
    }

    /// Members grouped by stop sequence, negative buckets excluded.
    pub fn stop_buckets(&self) -> BTreeMap<i32, Vec<&ProcessStatus>> {
        sequence_buckets(self.processes.values(), |p| p.rules.stop_sequence)
    }

    /// Members currently holding at least one node.
    pub fn running_processes(&self) -> impl Iterator<Item = &ProcessStatus> {
        self.processes.values().filter(|p| !p.addresses.is_empty())
    }

    /// The serial form used by RPC replies and APPLICATION events.
    pub fn serial(&self) -> serde_json::Value {
        json!({
            "application_name": self.name,
            "statecode": self.state.code(),
            "statename": self.state.to_string(),
            "major_failure": self.major_failure,
            "minor_failure": self.minor_failure,
        })
    }
}

/// The application state as a function of the member states.
pub fn derive_state<'a>(members: impl Iterator<Item = &'a ProcessStatus>) -> ApplicationState {
    let mut any_member = false;
    let mut any_starting = false;
    let mut any_stopping = false;
    let mut any_running = false;
    for process in members {
        any_member = true;
        match process.state {
            ProcessState::Starting | ProcessState::Backoff => any_starting = true,
            ProcessState::Stopping => any_stopping = true,
            ProcessState::Running => any_running = true,
            _ => {}
        }
    }
    if !any_member {
        ApplicationState::Unknown
    } else if any_starting {
        ApplicationState::Starting
    } else if any_stopping {
        ApplicationState::Stopping
    } else if any_running {
        ApplicationState::Running
    } else {
        ApplicationState::Stopped
    }
}

fn sequence_buckets<'a>(
    members: impl Iterator<Item = &'a ProcessStatus>,
    key: impl Fn(&ProcessStatus) -> i32,
) -> BTreeMap<i32, Vec<&'a ProcessStatus>> {
    let mut buckets: BTreeMap<i32, Vec<&ProcessStatus>> = BTreeMap::new();
    for process in members {
        let sequence = key(process);
        if sequence >= 0 {
            buckets.entry(sequence).or_default().push(process);
        }
    }
    buckets
}
