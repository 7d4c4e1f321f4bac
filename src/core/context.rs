// src/core/context.rs

//! The single owner of the unified cluster state.
//!
//! The context holds every `AddressStatus`, `ApplicationStatus` and
//! `ProcessStatus`, keyed by name. All mutations come through the methods
//! below, run on the core loop, and publish their deltas on the event bus.
//! Other components only read.

use crate::core::address::{AddressState, AddressStatus};
use crate::core::application::ApplicationStatus;
use crate::core::clock::Clock;
use crate::core::errors::SupfleetError;
use crate::core::events::{EventBus, EventTopic};
use crate::core::mapper::AddressMapper;
use crate::core::process::{ProcessEvent, ProcessStatus};
use crate::core::rules::{NodeScope, ProcessRules, RulesFile};
use crate::core::strategy::Candidate;
use crate::core::supervisor::ProcessInfo;
use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Follow-up requested from the caller after a tick was folded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAction {
    /// First tick from the node: run the authorization handshake.
    Handshake,
}

/// What a process event did to the unified view.
#[derive(Debug, Clone)]
pub struct ProcessEventOutcome {
    pub status: ProcessStatus,
    /// The process held at least one node before the event.
    pub was_running: bool,
}

/// Result of one liveness sweep.
#[derive(Debug, Default)]
pub struct TimerOutcome {
    /// Nodes newly transitioned to SILENT.
    pub silent_nodes: Vec<String>,
    /// `(application, process)` pairs that lost their last known location.
    pub orphaned: Vec<(String, String)>,
}

pub struct Context {
    clock: Arc<dyn Clock>,
    bus: Arc<EventBus>,
    mapper: AddressMapper,
    rules: Arc<RulesFile>,
    synchro_timeout: Duration,
    auto_fence: bool,
    addresses: IndexMap<String, AddressStatus>,
    applications: BTreeMap<String, ApplicationStatus>,
    master: Option<String>,
}

impl Context {
    pub fn new(
        clock: Arc<dyn Clock>,
        bus: Arc<EventBus>,
        mapper: AddressMapper,
        rules: Arc<RulesFile>,
        synchro_timeout: Duration,
        auto_fence: bool,
    ) -> Self {
        let addresses = mapper
            .names()
            .map(|name| (name.to_string(), AddressStatus::new(name)))
            .collect();
        Self {
            clock,
            bus,
            mapper,
            rules,
            synchro_timeout,
            auto_fence,
            addresses,
            applications: BTreeMap::new(),
            master: None,
        }
    }

    // --- Read access ---

    pub fn addresses(&self) -> impl Iterator<Item = &AddressStatus> {
        self.addresses.values()
    }

    pub fn address(&self, name: &str) -> Option<&AddressStatus> {
        self.addresses.get(name)
    }

    pub fn applications(&self) -> impl Iterator<Item = &ApplicationStatus> {
        self.applications.values()
    }

    pub fn application(&self, name: &str) -> Option<&ApplicationStatus> {
        self.applications.get(name)
    }

    pub fn process(&self, application: &str, process: &str) -> Option<&ProcessStatus> {
        self.applications
            .get(application)?
            .processes
            .get(process)
    }

    pub fn master(&self) -> Option<&str> {
        self.master.as_deref()
    }

    pub fn resolve(&self, literal: &str) -> Result<String, SupfleetError> {
        self.mapper
            .resolve(literal)
            .map(str::to_string)
            .ok_or_else(|| SupfleetError::BadAddress(literal.to_string()))
    }

    /// Nodes currently in RUNNING state, declared order.
    pub fn running_nodes(&self) -> Vec<&str> {
        self.addresses
            .values()
            .filter(|a| a.is_running())
            .map(|a| a.name.as_str())
            .collect()
    }

    /// Every node has settled: RUNNING, SILENT or ISOLATED.
    pub fn all_nodes_settled(&self) -> bool {
        self.addresses.values().all(|a| {
            matches!(
                a.state,
                AddressState::Running | AddressState::Silent | AddressState::Isolated
            )
        })
    }

    /// Sum of expected loading over processes located on the node.
    pub fn loading(&self, node: &str) -> u32 {
        self.applications
            .values()
            .flat_map(|app| app.processes.values())
            .filter(|p| p.addresses.contains(node))
            .map(|p| p.rules.expected_loading as u32)
            .sum()
    }

    /// Processes currently reported on more than one node.
    pub fn conflicts(&self) -> Vec<&ProcessStatus> {
        self.applications
            .values()
            .flat_map(|app| app.processes.values())
            .filter(|p| p.conflicting())
            .collect()
    }

    /// RUNNING nodes allowed by the rules, declared order, with loading.
    /// A striped scope narrows down to the one node owed to this process.
    pub fn candidates_for(
        &self,
        application: &str,
        process: &str,
        rules: &ProcessRules,
    ) -> Vec<Candidate> {
        let running: Vec<&str> = self.running_nodes();
        let allowed: Vec<&str> = match &rules.scope {
            NodeScope::All => running,
            NodeScope::List(names) => running
                .into_iter()
                .filter(|n| names.iter().any(|allowed| allowed == n))
                .collect(),
            NodeScope::Striped => {
                let stripe = self.stripe_index(application, process);
                if running.is_empty() {
                    vec![]
                } else {
                    vec![running[stripe % running.len()]]
                }
            }
        };
        allowed
            .into_iter()
            .map(|node| Candidate {
                node: node.to_string(),
                loading: self.loading(node),
            })
            .collect()
    }

    /// Position of the process among the striped processes of its
    /// application, by member order.
    fn stripe_index(&self, application: &str, process: &str) -> usize {
        self.applications
            .get(application)
            .map(|app| {
                app.processes
                    .values()
                    .filter(|p| p.rules.scope == NodeScope::Striped)
                    .position(|p| p.process_name == process)
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    // --- Event ingestion ---

    /// Folds a heartbeat from a node into the view.
    pub fn on_tick(
        &mut self,
        literal: &str,
        remote_time: u64,
    ) -> Result<Option<NodeAction>, SupfleetError> {
        let name = self.resolve(literal)?;
        let now = self.clock.monotonic();
        let status = self
            .addresses
            .get_mut(&name)
            .ok_or_else(|| SupfleetError::BadAddress(name.clone()))?;
        if status.in_isolation() {
            debug!("Ignoring tick from isolated node '{}'", name);
            return Ok(None);
        }
        status.update_times(remote_time, now);
        let action = match status.state {
            AddressState::Unknown | AddressState::Silent => {
                status.transition(AddressState::Checking);
                info!("Node '{}' is up, checking authorization", name);
                Some(NodeAction::Handshake)
            }
            _ => None,
        };
        self.publish_address(&name);
        Ok(action)
    }

    /// Completes (or refuses) the CHECKING handshake of a node.
    pub fn on_authorization(
        &mut self,
        literal: &str,
        authorized: bool,
        info: Vec<ProcessInfo>,
    ) -> Result<(), SupfleetError> {
        let name = self.resolve(literal)?;
        let status = self
            .addresses
            .get_mut(&name)
            .ok_or_else(|| SupfleetError::BadAddress(name.clone()))?;
        if status.state != AddressState::Checking {
            warn!(
                "Dropping authorization for node '{}' in state {}",
                name, status.state
            );
            return Ok(());
        }
        if authorized {
            status.transition(AddressState::Running);
            info!("Node '{}' is authorized and RUNNING", name);
            self.publish_address(&name);
            self.load_process_info(&name, info);
        } else if self.auto_fence {
            status.transition(AddressState::Isolating);
            warn!("Node '{}' refused authorization, isolating", name);
            self.publish_address(&name);
        } else {
            status.transition(AddressState::Silent);
            warn!("Node '{}' refused authorization", name);
            self.publish_address(&name);
        }
        Ok(())
    }

    /// Loads the process snapshot fetched from a node during the handshake,
    /// so a node joining with live processes folds into the unified view.
    pub fn load_process_info(&mut self, node: &str, infos: Vec<ProcessInfo>) {
        for info in infos {
            let event = ProcessEvent {
                group: info.group.clone(),
                name: info.name.clone(),
                state: info.state,
                expected: info.expected,
                now: info.start,
                spawn_error: None,
                extra_args: info.extra_args.clone(),
            };
            if let Err(e) = self.on_process_event(node, &event) {
                warn!("Dropping process info from '{}': {}", node, e);
            }
        }
    }

    /// Folds one process state change into the view.
    pub fn on_process_event(
        &mut self,
        literal: &str,
        event: &ProcessEvent,
    ) -> Result<Option<ProcessEventOutcome>, SupfleetError> {
        let node = self.resolve(literal)?;
        let node_status = self
            .addresses
            .get(&node)
            .ok_or_else(|| SupfleetError::BadAddress(node.clone()))?;
        if node_status.in_isolation() {
            debug!("Ignoring process event from isolated node '{}'", node);
            return Ok(None);
        }
        if let Some(message) = &event.spawn_error {
            warn!("Spawn error for {}:{} on '{}': {}", event.group, event.name, node, message);
        }

        let rules = self.rules.clone();
        let application = self
            .applications
            .entry(event.group.clone())
            .or_insert_with(|| {
                ApplicationStatus::new(&event.group, rules.application_rules(&event.group))
            });
        let process = application
            .processes
            .entry(event.name.clone())
            .or_insert_with(|| {
                ProcessStatus::new(
                    &event.group,
                    &event.name,
                    rules.process_rules(&event.group, &event.name),
                )
            });

        let was_running = !process.addresses.is_empty();
        process.apply_event(&node, event);
        let snapshot = process.clone();
        application.refresh();

        self.publish_process(&event.group, &event.name);
        self.publish_application(&event.group);
        Ok(Some(ProcessEventOutcome {
            status: snapshot,
            was_running,
        }))
    }

    /// The periodic liveness sweep: nodes without a recent tick turn SILENT
    /// and their processes lose that location.
    pub fn on_timer_event(&mut self) -> TimerOutcome {
        let now = self.clock.monotonic();
        let mut outcome = TimerOutcome::default();
        let stale: Vec<String> = self
            .addresses
            .values()
            .filter(|a| {
                matches!(a.state, AddressState::Checking | AddressState::Running)
                    && now.saturating_sub(a.local_time) > self.synchro_timeout
            })
            .map(|a| a.name.clone())
            .collect();
        for name in stale {
            if let Some(status) = self.addresses.get_mut(&name) {
                status.transition(AddressState::Silent);
            }
            warn!("Node '{}' went SILENT, no tick within synchro timeout", name);
            self.publish_address(&name);
            outcome
                .orphaned
                .extend(self.invalidate_node_locations(&name));
            outcome.silent_nodes.push(name);
        }
        outcome
    }

    /// Finalizes pending isolations: ISOLATING nodes become ISOLATED and
    /// their processes lose that location.
    pub fn handle_isolation(&mut self) -> Vec<String> {
        let pending: Vec<String> = self
            .addresses
            .values()
            .filter(|a| a.state == AddressState::Isolating)
            .map(|a| a.name.clone())
            .collect();
        for name in &pending {
            if let Some(status) = self.addresses.get_mut(name) {
                status.transition(AddressState::Isolated);
            }
            info!("Node '{}' is now ISOLATED", name);
            self.publish_address(name);
            self.invalidate_node_locations(name);
        }
        pending
    }

    /// Removes the node from every process location set, degrading states
    /// and republishing what changed. Returns processes left with no
    /// location at all.
    fn invalidate_node_locations(&mut self, node: &str) -> Vec<(String, String)> {
        let mut orphaned = Vec::new();
        let mut touched: Vec<(String, String)> = Vec::new();
        for application in self.applications.values_mut() {
            let mut changed = false;
            for process in application.processes.values_mut() {
                if process.invalidate_location(node) {
                    changed = true;
                    touched.push((application.name.clone(), process.process_name.clone()));
                    if process.addresses.is_empty() {
                        orphaned
                            .push((application.name.clone(), process.process_name.clone()));
                    }
                }
            }
            if changed {
                application.refresh();
            }
        }
        let apps: Vec<String> = touched.iter().map(|(app, _)| app.clone()).collect();
        for (app, proc) in &touched {
            self.publish_process(app, proc);
        }
        for app in apps {
            self.publish_application(&app);
        }
        orphaned
    }

    /// Records extra arguments on a known process, whatever its state. The
    /// next start uses them.
    pub fn update_extra_args(
        &mut self,
        application: &str,
        process: &str,
        extra_args: &str,
    ) -> Result<(), SupfleetError> {
        let status = self
            .applications
            .get_mut(application)
            .and_then(|app| app.processes.get_mut(process))
            .ok_or_else(|| SupfleetError::BadName(format!("{application}:{process}")))?;
        status.extra_args = extra_args.to_string();
        Ok(())
    }

    // --- Master election ---

    /// Deterministic election: the lowest node name among RUNNING nodes.
    /// Returns true when the master changed.
    pub fn elect_master(&mut self) -> bool {
        let elected = self
            .addresses
            .values()
            .filter(|a| a.is_running())
            .map(|a| a.name.clone())
            .min();
        if elected != self.master {
            match &elected {
                Some(name) => info!("Master is now '{}'", name),
                None => warn!("Master lost, no RUNNING node"),
            }
            self.master = elected;
            true
        } else {
            false
        }
    }

    // --- Delta publication ---

    fn publish_address(&self, name: &str) {
        if let Some(status) = self.addresses.get(name) {
            let loading = self.loading(name);
            self.bus
                .publish(EventTopic::Address, status.serial(loading));
        }
    }

    fn publish_application(&self, name: &str) {
        if let Some(status) = self.applications.get(name) {
            self.bus.publish(EventTopic::Application, status.serial());
        }
    }

    fn publish_process(&self, application: &str, process: &str) {
        if let Some(status) = self.process(application, process) {
            self.bus.publish(EventTopic::Process, status.serial());
        }
    }
}
