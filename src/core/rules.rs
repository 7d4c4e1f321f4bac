// src/core/rules.rs

//! Declarative start/stop rules for applications and processes.
//!
//! Rules come from a TOML file referenced by the main configuration. They
//! drive the deployment sequencing (`start_sequence` / `stop_sequence`
//! buckets), node eligibility, load accounting, and the failure policies
//! applied when a start plan or a running process goes wrong.

use crate::core::errors::SupfleetError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use strum_macros::{Display, EnumString};

/// Placement strategy used to pick a node for a process.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, EnumString, Display,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StartStrategy {
    /// First eligible node in declared order that fits the load budget.
    #[default]
    Config,
    /// Eligible node with the least loading.
    LessLoaded,
    /// Eligible node with the most loading (consolidation).
    MostLoaded,
}

/// Policy applied when a required process fails during a start plan.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, EnumString, Display,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StartingFailureStrategy {
    /// Cancel the remaining buckets and leave whatever already started.
    #[default]
    Abort,
    /// Cancel the remaining buckets and stop the whole application.
    Stop,
    /// Carry on with the next bucket.
    Continue,
}

/// Policy applied when a process crashes while the fleet is in OPERATION.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, EnumString, Display,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunningFailureStrategy {
    #[default]
    Continue,
    RestartProcess,
    StopApplication,
    RestartApplication,
}

/// Policy applied to processes found running on more than one node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, EnumString, Display,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConciliationStrategy {
    /// Keep the instance with the earliest start time, stop the rest.
    Senicide,
    /// Keep the newest instance, stop the older ones.
    Infanticide,
    /// Leave the conflict to the operator.
    #[default]
    User,
    /// Stop every instance.
    Stop,
    /// Stop every instance, then let deployment recreate it per rules.
    Restart,
    /// Delegate to the process's running-failure strategy.
    RunningFailure,
}

/// The set of nodes a process may be placed on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NodeScope {
    /// Any node of the fleet (`"*"`).
    #[default]
    All,
    /// One process instance per eligible node, in declared order (`"#"`).
    Striped,
    /// An explicit list of canonical node names.
    List(Vec<String>),
}

impl NodeScope {
    fn from_literals(literals: &[String]) -> Self {
        match literals {
            [single] if single == "*" => NodeScope::All,
            [single] if single == "#" => NodeScope::Striped,
            [] => NodeScope::All,
            names => NodeScope::List(names.to_vec()),
        }
    }
}

/// Per-process rules record.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessRules {
    /// Bucket key within the application start plan. Negative means the
    /// process is never started automatically.
    pub start_sequence: i32,
    /// Bucket key within the application stop plan. Negative means the
    /// process is never stopped automatically.
    pub stop_sequence: i32,
    /// A required process failing makes the whole bucket fail.
    pub required: bool,
    /// The process is expected to exit on its own; a start succeeds on a
    /// clean EXITED instead of RUNNING.
    pub wait_exit: bool,
    /// Declared share of a node's load budget, 0..=100.
    pub expected_loading: u8,
    pub scope: NodeScope,
    /// Seconds granted to a start job before it times out.
    pub start_timeout: u64,
    /// Seconds granted to a stop job before it times out.
    pub stop_timeout: u64,
    pub running_failure_strategy: RunningFailureStrategy,
}

impl Default for ProcessRules {
    fn default() -> Self {
        Self {
            start_sequence: -1,
            stop_sequence: 0,
            required: false,
            wait_exit: false,
            expected_loading: 1,
            scope: NodeScope::All,
            start_timeout: 0,
            stop_timeout: 0,
            running_failure_strategy: RunningFailureStrategy::default(),
        }
    }
}

/// Per-application rules record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ApplicationRules {
    /// Ordering of the application in the deployment phase. Zero or negative
    /// means the application is never started automatically.
    pub start_sequence: i32,
    pub stop_sequence: i32,
    pub starting_failure_strategy: StartingFailureStrategy,
}

impl ApplicationRules {
    pub fn autostart(&self) -> bool {
        self.start_sequence > 0
    }
}

impl ProcessRules {
    /// The serial form returned by the rules RPC.
    pub fn serial(&self, namespec: &str) -> serde_json::Value {
        let addresses = match &self.scope {
            NodeScope::All => vec!["*".to_string()],
            NodeScope::Striped => vec!["#".to_string()],
            NodeScope::List(names) => names.clone(),
        };
        serde_json::json!({
            "namespec": namespec,
            "start_sequence": self.start_sequence,
            "stop_sequence": self.stop_sequence,
            "required": self.required,
            "wait_exit": self.wait_exit,
            "expected_loading": self.expected_loading,
            "addresses": addresses,
            "running_failure_strategy": self.running_failure_strategy.to_string(),
        })
    }
}

// Raw TOML shapes. Field absence falls back to the record defaults so a
// rules file only has to spell out what it changes.

#[derive(Debug, Deserialize)]
struct RawProcessRules {
    start_sequence: Option<i32>,
    stop_sequence: Option<i32>,
    required: Option<bool>,
    wait_exit: Option<bool>,
    expected_loading: Option<u8>,
    nodes: Option<Vec<String>>,
    start_timeout: Option<u64>,
    stop_timeout: Option<u64>,
    running_failure_strategy: Option<RunningFailureStrategy>,
}

#[derive(Debug, Deserialize)]
struct RawApplicationRules {
    start_sequence: Option<i32>,
    stop_sequence: Option<i32>,
    starting_failure_strategy: Option<StartingFailureStrategy>,
    #[serde(default)]
    process: HashMap<String, RawProcessRules>,
}

#[derive(Debug, Deserialize, Default)]
struct RawRulesFile {
    #[serde(default)]
    application: HashMap<String, RawApplicationRules>,
}

/// The parsed rules file: application records and their process records.
#[derive(Debug, Clone, Default)]
pub struct RulesFile {
    applications: HashMap<String, (ApplicationRules, HashMap<String, ProcessRules>)>,
}

impl RulesFile {
    pub fn from_file(path: &str) -> Result<Self, SupfleetError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| SupfleetError::Rules(format!("cannot read '{path}': {e}")))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, SupfleetError> {
        let raw: RawRulesFile = toml::from_str(contents)
            .map_err(|e| SupfleetError::Rules(format!("invalid rules file: {e}")))?;

        let mut applications = HashMap::new();
        for (app_name, raw_app) in raw.application {
            let app_rules = ApplicationRules {
                start_sequence: raw_app.start_sequence.unwrap_or_default(),
                stop_sequence: raw_app.stop_sequence.unwrap_or_default(),
                starting_failure_strategy: raw_app.starting_failure_strategy.unwrap_or_default(),
            };
            let mut processes = HashMap::new();
            for (proc_name, raw_proc) in raw_app.process {
                let defaults = ProcessRules::default();
                let loading = raw_proc.expected_loading.unwrap_or(defaults.expected_loading);
                if loading > 100 {
                    return Err(SupfleetError::Rules(format!(
                        "expected_loading of {app_name}:{proc_name} must be 0..=100, got {loading}"
                    )));
                }
                processes.insert(
                    proc_name,
                    ProcessRules {
                        start_sequence: raw_proc.start_sequence.unwrap_or(defaults.start_sequence),
                        stop_sequence: raw_proc.stop_sequence.unwrap_or(defaults.stop_sequence),
                        required: raw_proc.required.unwrap_or(defaults.required),
                        wait_exit: raw_proc.wait_exit.unwrap_or(defaults.wait_exit),
                        expected_loading: loading,
                        scope: raw_proc
                            .nodes
                            .as_deref()
                            .map(NodeScope::from_literals)
                            .unwrap_or_default(),
                        start_timeout: raw_proc.start_timeout.unwrap_or(defaults.start_timeout),
                        stop_timeout: raw_proc.stop_timeout.unwrap_or(defaults.stop_timeout),
                        running_failure_strategy: raw_proc
                            .running_failure_strategy
                            .unwrap_or(defaults.running_failure_strategy),
                    },
                );
            }
            applications.insert(app_name, (app_rules, processes));
        }
        Ok(Self { applications })
    }

    pub fn application_rules(&self, application: &str) -> ApplicationRules {
        self.applications
            .get(application)
            .map(|(rules, _)| rules.clone())
            .unwrap_or_default()
    }

    pub fn process_rules(&self, application: &str, process: &str) -> ProcessRules {
        self.applications
            .get(application)
            .and_then(|(_, procs)| procs.get(process))
            .cloned()
            .unwrap_or_default()
    }

    /// Applications that carry rules, for reporting.
    pub fn application_names(&self) -> impl Iterator<Item = &str> {
        self.applications.keys().map(String::as_str)
    }
}

/// Parses a wire strategy literal, mapping failures to `BAD_STRATEGY`.
pub fn parse_strategy(literal: &str) -> Result<StartStrategy, SupfleetError> {
    literal
        .parse::<StartStrategy>()
        .map_err(|_| SupfleetError::BadStrategy(literal.to_string()))
}
