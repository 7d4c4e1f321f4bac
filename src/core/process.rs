// src/core/process.rs

//! Cluster-wide view of a single process.
//!
//! A `ProcessStatus` folds the per-node state events published by the local
//! supervisors into one record: the current state, the set of nodes believed
//! to run the process, and the start times needed to arbitrate duplicates.

use crate::core::rules::ProcessRules;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use strum_macros::{Display, EnumString};

/// Process states, as reported by the local supervisors.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcessState {
    Stopped,
    Starting,
    Backoff,
    Running,
    Stopping,
    Exited,
    Fatal,
    Unknown,
}

impl ProcessState {
    /// Numeric state code carried in serial forms.
    pub fn code(self) -> u16 {
        match self {
            ProcessState::Stopped => 0,
            ProcessState::Starting => 10,
            ProcessState::Running => 20,
            ProcessState::Backoff => 30,
            ProcessState::Stopping => 40,
            ProcessState::Exited => 100,
            ProcessState::Fatal => 200,
            ProcessState::Unknown => 1000,
        }
    }

    /// STOPPED, EXITED, FATAL and UNKNOWN: the process holds no node.
    pub fn is_stopped(self) -> bool {
        matches!(
            self,
            ProcessState::Stopped
                | ProcessState::Exited
                | ProcessState::Fatal
                | ProcessState::Unknown
        )
    }

    /// STARTING, BACKOFF and RUNNING: the process occupies a node.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            ProcessState::Starting | ProcessState::Backoff | ProcessState::Running
        )
    }
}

/// A `group:name` process identifier. A missing or `*` name part addresses
/// every process of the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespec {
    pub application: String,
    pub process: Option<String>,
}

impl Namespec {
    /// Parses `app`, `app:*` or `app:name`. Empty parts are rejected.
    pub fn parse(literal: &str) -> Option<Self> {
        let (application, process) = match literal.split_once(':') {
            Some((app, proc)) => (app, Some(proc)),
            None => (literal, None),
        };
        if application.is_empty() {
            return None;
        }
        let process = match process {
            None | Some("*") => None,
            Some("") => return None,
            Some(name) => Some(name.to_string()),
        };
        Some(Self {
            application: application.to_string(),
            process,
        })
    }

    pub fn is_wildcard(&self) -> bool {
        self.process.is_none()
    }
}

impl std::fmt::Display for Namespec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.process {
            Some(proc) => write!(f, "{}:{}", self.application, proc),
            None => write!(f, "{}:*", self.application),
        }
    }
}

/// A process state change pushed by a local supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessEvent {
    pub group: String,
    pub name: String,
    pub state: ProcessState,
    /// For EXITED, whether the exit code was one of the expected ones.
    pub expected: bool,
    /// Wall-clock seconds on the emitting node.
    pub now: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawn_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_args: Option<String>,
}

/// One process as seen by the whole fleet.
#[derive(Debug, Clone)]
pub struct ProcessStatus {
    pub application_name: String,
    pub process_name: String,
    pub state: ProcessState,
    /// Meaningful for EXITED only.
    pub expected_exit: bool,
    /// Wall-clock seconds of the last applied event.
    pub last_event_time: u64,
    pub extra_args: String,
    /// Nodes currently believed to run this process.
    pub addresses: BTreeSet<String>,
    /// Wall-clock start second per running node, used by conciliation.
    pub start_times: HashMap<String, u64>,
    pub rules: ProcessRules,
}

impl ProcessStatus {
    pub fn new(application_name: &str, process_name: &str, rules: ProcessRules) -> Self {
        Self {
            application_name: application_name.to_string(),
            process_name: process_name.to_string(),
            state: ProcessState::Unknown,
            expected_exit: true,
            last_event_time: 0,
            extra_args: String::new(),
            addresses: BTreeSet::new(),
            start_times: HashMap::new(),
            rules,
        }
    }

    pub fn namespec(&self) -> String {
        format!("{}:{}", self.application_name, self.process_name)
    }

    /// More than one node claims to run the process.
    pub fn conflicting(&self) -> bool {
        self.addresses.len() > 1
    }

    /// FATAL, or EXITED with an unexpected code.
    pub fn crashed(&self) -> bool {
        self.state == ProcessState::Fatal
            || (self.state == ProcessState::Exited && !self.expected_exit)
    }

    /// Folds one node event into the status. Re-applying the same event is a
    /// no-op on `state` and `addresses`.
    pub fn apply_event(&mut self, node: &str, event: &ProcessEvent) {
        if event.state.is_running() {
            if self.addresses.insert(node.to_string()) {
                self.start_times.insert(node.to_string(), event.now);
            }
        } else {
            self.addresses.remove(node);
            self.start_times.remove(node);
        }
        // The reported state stands unless another node still runs the
        // process; a stop on one node must not mask a surviving instance.
        if event.state.is_stopped() && !self.addresses.is_empty() {
            self.state = ProcessState::Running;
        } else {
            self.state = event.state;
        }
        self.expected_exit = event.expected;
        self.last_event_time = event.now;
        if let Some(args) = &event.extra_args {
            self.extra_args = args.clone();
        }
    }

    /// Drops a node from the believed locations after it went silent or was
    /// isolated. The state degrades to UNKNOWN once no location is left.
    pub fn invalidate_location(&mut self, node: &str) -> bool {
        if !self.addresses.remove(node) {
            return false;
        }
        self.start_times.remove(node);
        if self.addresses.is_empty() && self.state.is_running() {
            self.state = ProcessState::Unknown;
        }
        true
    }

    /// The serial form used by RPC replies and PROCESS events.
    pub fn serial(&self) -> serde_json::Value {
        json!({
            "application_name": self.application_name,
            "process_name": self.process_name,
            "statecode": self.state.code(),
            "statename": self.state.to_string(),
            "expected_exit": self.expected_exit,
            "last_event_time": self.last_event_time,
            "addresses": self.addresses.iter().collect::<Vec<_>>(),
            "extra_args": self.extra_args,
        })
    }
}
