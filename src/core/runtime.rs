// src/core/runtime.rs

//! The single-threaded cooperative core loop.
//!
//! The loop exclusively owns the context, the fleet state machine and both
//! planners. Everything external talks to it through the bounded inbox;
//! outbound supervisor work leaves through the gateway queue. The only
//! suspension points are the inbox read and the periodic timer, so no
//! shared-state operation ever blocks on the network.

use crate::core::clock::Clock;
use crate::core::commander::{
    CommandKind, Commander, Direction, PlanNotifier, PlannerAction, SupervisorCommand,
};
use crate::core::conciliation::{ConciliationAction, conciliate};
use crate::core::context::{Context, NodeAction, ProcessEventOutcome};
use crate::core::errors::SupfleetError;
use crate::core::events::{EventBus, EventTopic};
use crate::core::fsm::{FleetState, FleetStateMachine};
use crate::core::process::ProcessEvent;
use crate::core::rpc::{
    self, Deferred, RpcOutcome, RpcRequest, check_from_deployment, check_operating,
    check_operating_conciliation,
};
use crate::core::rules::{ConciliationStrategy, RunningFailureStrategy, StartStrategy};
use crate::core::supervisor::{OutboundRequest, ProcessInfo};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Capacity of the core inbox.
const INBOX_CAPACITY: usize = 1024;
/// Cadence of the periodic liveness and deadline sweep.
pub const TIMER_PERIOD: Duration = Duration::from_secs(5);

/// Everything the core loop can be asked to do.
#[derive(Debug)]
pub enum CoreMsg {
    /// Heartbeat from a node's local supervisor.
    Tick { address: String, remote_time: u64 },
    /// Process state change from a node.
    Process { address: String, event: ProcessEvent },
    /// Outcome of the authorization handshake with a node.
    Authorization {
        address: String,
        authorized: bool,
        info: Vec<ProcessInfo>,
    },
    /// An RPC call, answered through the oneshot.
    Rpc {
        request: RpcRequest,
        respond: oneshot::Sender<Result<RpcOutcome, SupfleetError>>,
    },
}

impl CoreMsg {
    /// Within a drained batch, ticks are folded in before anything else.
    fn batch_rank(&self) -> u8 {
        match self {
            CoreMsg::Tick { .. } => 0,
            _ => 1,
        }
    }
}

/// Options fixed at construction.
pub struct RuntimeOptions {
    pub local_node: String,
    pub deployment_strategy: StartStrategy,
    pub conciliation_strategy: ConciliationStrategy,
}

/// The core loop. Built once, then consumed by `run`.
pub struct CoreRuntime {
    ctx: Context,
    fsm: FleetStateMachine,
    starter: Commander,
    stopper: Commander,
    clock: Arc<dyn Clock>,
    bus: Arc<EventBus>,
    inbox: mpsc::Receiver<CoreMsg>,
    outbound: mpsc::Sender<OutboundRequest>,
    options: RuntimeOptions,
    /// Applications to start again once their stop plan terminates.
    app_restarts: HashMap<String, (StartStrategy, Vec<PlanNotifier>)>,
    /// Processes to start again once their stop plan terminates, per
    /// application.
    process_restarts: HashMap<String, Vec<(String, StartStrategy, Vec<PlanNotifier>)>>,
    /// Processes to start again once conciliation stopped every instance.
    conciliation_restarts: HashSet<(String, String)>,
    /// Signals the host that the daemon should exit.
    lifecycle_tx: broadcast::Sender<FleetState>,
}

impl CoreRuntime {
    pub fn new(
        ctx: Context,
        clock: Arc<dyn Clock>,
        bus: Arc<EventBus>,
        outbound: mpsc::Sender<OutboundRequest>,
        synchro_timeout: Duration,
        options: RuntimeOptions,
    ) -> (Self, mpsc::Sender<CoreMsg>) {
        let (tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        let (lifecycle_tx, _) = broadcast::channel(4);
        let runtime = Self {
            ctx,
            fsm: FleetStateMachine::new(synchro_timeout),
            starter: Commander::starter(),
            stopper: Commander::stopper(),
            clock,
            bus,
            inbox,
            outbound,
            options,
            app_restarts: HashMap::new(),
            process_restarts: HashMap::new(),
            conciliation_restarts: HashSet::new(),
            lifecycle_tx,
        };
        (runtime, tx)
    }

    /// Lifecycle notifications: RESTARTING and SHUTTING_DOWN are published
    /// here for the host process.
    pub fn lifecycle(&self) -> broadcast::Receiver<FleetState> {
        self.lifecycle_tx.subscribe()
    }

    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Core loop started on '{}'", self.options.local_node);
        let mut timer = tokio::time::interval(TIMER_PERIOD);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                // Pending events drain before timers fire.
                biased;
                message = self.inbox.recv() => {
                    match message {
                        Some(message) => self.process_batch(message),
                        None => break,
                    }
                }
                _ = timer.tick() => self.on_timer(),
                _ = shutdown_rx.recv() => break,
            }
            if self.fsm.state() == FleetState::ShuttingDown {
                break;
            }
        }
        info!("Core loop stopped");
    }

    /// Drains the inbox into one batch and folds it in, ticks first.
    fn process_batch(&mut self, first: CoreMsg) {
        let mut batch = vec![first];
        while let Ok(message) = self.inbox.try_recv() {
            batch.push(message);
        }
        batch.sort_by_key(CoreMsg::batch_rank);
        for message in batch {
            self.dispatch(message);
        }
        self.finalize();
    }

    fn dispatch(&mut self, message: CoreMsg) {
        match message {
            CoreMsg::Tick {
                address,
                remote_time,
            } => match self.ctx.on_tick(&address, remote_time) {
                Ok(Some(NodeAction::Handshake)) => {
                    self.send_outbound(OutboundRequest::Handshake { node: address });
                }
                Ok(None) => {}
                Err(e) => warn!("Dropping tick: {}", e),
            },
            CoreMsg::Process { address, event } => match self.ctx.on_process_event(&address, &event)
            {
                Ok(Some(outcome)) => self.after_process_event(outcome),
                Ok(None) => {}
                Err(e) => warn!("Dropping process event: {}", e),
            },
            CoreMsg::Authorization {
                address,
                authorized,
                info,
            } => {
                if let Err(e) = self.ctx.on_authorization(&address, authorized, info) {
                    warn!("Dropping authorization: {}", e);
                }
            }
            CoreMsg::Rpc { request, respond } => {
                let reply = self.handle_rpc(request);
                if let Err(ref e) = reply {
                    if !e.is_caller_fault() {
                        error!("RPC failed internally: {}", e);
                    }
                }
                let _ = respond.send(reply);
            }
        }
    }

    /// Planner progress, crash policies and deferred restarts triggered by
    /// one folded process event.
    fn after_process_event(&mut self, outcome: ProcessEventOutcome) {
        let now = self.clock.monotonic();
        let status = outcome.status;
        let application = status.application_name.clone();
        let process = status.process_name.clone();

        let actions = self.starter.on_process_event(&self.ctx, now, &status);
        self.apply_actions(Direction::Start, actions);
        let actions = self.stopper.on_process_event(&self.ctx, now, &status);
        self.apply_actions(Direction::Stop, actions);

        // A process stopped by conciliation comes back per its rules.
        if status.addresses.is_empty()
            && self
                .conciliation_restarts
                .remove(&(application.clone(), process.clone()))
        {
            info!("Restarting {} after conciliation", status.namespec());
            self.submit_start_process(
                &application,
                &process,
                self.options.deployment_strategy,
                None,
            );
        }

        // Crash of a previously-running process while in OPERATION.
        if outcome.was_running
            && status.crashed()
            && self.fsm.state() == FleetState::Operation
            && self.is_master()
        {
            self.apply_running_failure(
                &application,
                &process,
                status.rules.running_failure_strategy,
            );
        }
    }

    /// The crash policy of a process that was running and died.
    fn apply_running_failure(
        &mut self,
        application: &str,
        process: &str,
        strategy: RunningFailureStrategy,
    ) {
        match strategy {
            RunningFailureStrategy::Continue => {
                debug!("No running-failure action for {}:{}", application, process);
            }
            RunningFailureStrategy::RestartProcess => {
                info!("Restarting crashed process {}:{}", application, process);
                self.submit_start_process(
                    application,
                    process,
                    self.options.deployment_strategy,
                    None,
                );
            }
            RunningFailureStrategy::StopApplication => {
                info!("Stopping '{}' after crash of {}", application, process);
                self.submit_stop_application(application, None);
            }
            RunningFailureStrategy::RestartApplication => {
                info!("Restarting '{}' after crash of {}", application, process);
                self.app_restarts
                    .entry(application.to_string())
                    .or_insert_with(|| (self.options.deployment_strategy, Vec::new()));
                self.submit_stop_application(application, None);
            }
        }
    }

    fn on_timer(&mut self) {
        let now = self.clock.monotonic();
        let sweep = self.ctx.on_timer_event();
        for (application, process) in &sweep.orphaned {
            if self.fsm.state() == FleetState::Operation && self.is_master() {
                let strategy = self
                    .ctx
                    .process(application, process)
                    .map(|p| p.rules.running_failure_strategy)
                    .unwrap_or_default();
                self.apply_running_failure(application, process, strategy);
            }
        }
        let actions = self.starter.on_timer(&self.ctx, now);
        self.apply_actions(Direction::Start, actions);
        let actions = self.stopper.on_timer(&self.ctx, now);
        self.apply_actions(Direction::Stop, actions);
        self.ctx.handle_isolation();
        if self.fsm.state() == FleetState::Conciliation && self.is_master() {
            self.run_conciliation();
        }
        self.finalize();
    }

    /// Post-batch convergence: election, FSM guards, entry actions.
    fn finalize(&mut self) {
        let now = self.clock.monotonic();
        self.ctx.elect_master();
        while let Some(state) = self.fsm.evaluate(&self.ctx, self.starter.any_in_progress(), now) {
            self.bus.publish(EventTopic::Fleet, self.fsm.serial());
            match state {
                FleetState::Deployment => self.run_deployment(),
                FleetState::Conciliation => {
                    if self.is_master() {
                        self.run_conciliation();
                    }
                }
                _ => {}
            }
            self.ctx.elect_master();
        }
    }

    fn is_master(&self) -> bool {
        self.ctx.master() == Some(self.options.local_node.as_str())
    }

    /// DEPLOYMENT entry: the master starts every sequenced application.
    fn run_deployment(&mut self) {
        if !self.is_master() {
            debug!("Not the master, skipping deployment");
            return;
        }
        let strategy = self.options.deployment_strategy;
        let autostart: Vec<String> = self
            .ctx
            .applications()
            .filter(|app| app.rules.autostart())
            .map(|app| app.name.clone())
            .collect();
        for application in autostart {
            match self
                .starter
                .submit_application(&self.ctx, self.clock.monotonic(), &application, strategy, None)
            {
                Ok(actions) => {
                    self.apply_actions(Direction::Start, actions)
                }
                Err(e) if e.is_caller_fault() => {
                    debug!("Deployment skipped '{}': {}", application, e)
                }
                Err(e) => error!("Deployment of '{}' failed: {}", application, e),
            }
        }
    }

    /// One conciliation round over the current conflict set.
    fn run_conciliation(&mut self) {
        let conflicts = self.ctx.conflicts();
        if conflicts.is_empty() {
            return;
        }
        let actions = conciliate(self.options.conciliation_strategy, &conflicts);
        drop(conflicts);
        for action in actions {
            match action {
                ConciliationAction::Issue(command) => {
                    self.send_outbound(OutboundRequest::Command(command));
                }
                ConciliationAction::MarkProcessRestart {
                    application,
                    process,
                } => {
                    self.conciliation_restarts.insert((application, process));
                }
                ConciliationAction::MarkApplicationStop { application } => {
                    self.submit_stop_application(&application, None);
                }
                ConciliationAction::MarkApplicationRestart { application } => {
                    self.app_restarts
                        .entry(application.clone())
                        .or_insert_with(|| (self.options.deployment_strategy, Vec::new()));
                    self.submit_stop_application(&application, None);
                }
            }
        }
    }

    /// Executes planner follow-ups against the outside world.
    fn apply_actions(&mut self, direction: Direction, actions: Vec<PlannerAction>) {
        let mut queue = actions;
        while !queue.is_empty() {
            let mut next = Vec::new();
            for action in queue {
                match action {
                    PlannerAction::Issue(command) => {
                        self.send_outbound(OutboundRequest::Command(command));
                    }
                    PlannerAction::StopApplication(application) => {
                        match self.stopper.submit_application(
                            &self.ctx,
                            self.clock.monotonic(),
                            &application,
                            StartStrategy::Config,
                            None,
                        ) {
                            Ok(actions) => next.extend(actions),
                            Err(e) => warn!("Stop of '{}' not submitted: {}", application, e),
                        }
                    }
                    PlannerAction::Finished {
                        application,
                        success,
                    } => {
                        debug!(
                            "{:?} plan finished for '{}' (success: {})",
                            direction, application, success
                        );
                        if direction == Direction::Stop {
                            // Restart semantics: the start phase runs even
                            // when the stop phase failed.
                            if let Some((strategy, notifiers)) = self.app_restarts.remove(&application)
                            {
                                self.submit_start_application(&application, strategy, notifiers);
                            }
                            if let Some(restarts) = self.process_restarts.remove(&application) {
                                for (process, strategy, notifiers) in restarts {
                                    let mut notifiers = notifiers.into_iter();
                                    let first = notifiers.next();
                                    self.submit_start_process(&application, &process, strategy, first);
                                    for leftover in notifiers {
                                        let _ = leftover.send(Err(
                                            SupfleetError::AbnormalTermination(application.clone()),
                                        ));
                                    }
                                }
                            }
                        }
                    }
                }
            }
            queue = next;
        }
    }

    fn submit_start_application(
        &mut self,
        application: &str,
        strategy: StartStrategy,
        notifiers: Vec<PlanNotifier>,
    ) {
        let now = self.clock.monotonic();
        let mut notifiers = notifiers.into_iter();
        let first = notifiers.next();
        match self
            .starter
            .submit_application(&self.ctx, now, application, strategy, first)
        {
            Ok(actions) => self.apply_actions(Direction::Start, actions),
            Err(e) => warn!("Start of '{}' not submitted: {}", application, e),
        }
        for leftover in notifiers {
            let _ = leftover.send(Err(SupfleetError::AbnormalTermination(
                application.to_string(),
            )));
        }
    }

    fn submit_start_process(
        &mut self,
        application: &str,
        process: &str,
        strategy: StartStrategy,
        notifier: Option<PlanNotifier>,
    ) {
        let now = self.clock.monotonic();
        match self
            .starter
            .submit_process(&self.ctx, now, application, process, strategy, notifier)
        {
            Ok(actions) => self.apply_actions(Direction::Start, actions),
            Err(e) => warn!("Start of '{}:{}' not submitted: {}", application, process, e),
        }
    }

    fn submit_stop_application(&mut self, application: &str, notifier: Option<PlanNotifier>) {
        let now = self.clock.monotonic();
        match self.stopper.submit_application(
            &self.ctx,
            now,
            application,
            StartStrategy::Config,
            notifier,
        ) {
            Ok(actions) => self.apply_actions(Direction::Stop, actions),
            Err(e) => warn!("Stop of '{}' not submitted: {}", application, e),
        }
    }

    fn send_outbound(&self, request: OutboundRequest) {
        if let Err(e) = self.outbound.try_send(request) {
            // The queue is sized for bursts; refusal means the gateway
            // worker died or the fleet is badly overloaded.
            error!("Outbound queue refused a request: {}", e);
        }
    }

    // --- RPC dispatch ---

    fn handle_rpc(&mut self, request: RpcRequest) -> Result<RpcOutcome, SupfleetError> {
        let state = self.fsm.state();
        let now = self.clock.monotonic();
        match request {
            RpcRequest::GetApiVersion => Ok(RpcOutcome::Value(json!(rpc::API_VERSION))),
            RpcRequest::GetFleetState => Ok(RpcOutcome::Value(self.fsm.serial())),
            RpcRequest::GetMasterAddress => Ok(RpcOutcome::Value(json!(self.ctx.master()))),
            RpcRequest::GetAllAddressesInfo => {
                check_from_deployment(state)?;
                let infos: Vec<Value> = self
                    .ctx
                    .addresses()
                    .map(|a| a.serial(self.ctx.loading(&a.name)))
                    .collect();
                Ok(RpcOutcome::Value(json!(infos)))
            }
            RpcRequest::GetAddressInfo { name } => {
                check_from_deployment(state)?;
                let canonical = self.ctx.resolve(&name)?;
                let status = self
                    .ctx
                    .address(&canonical)
                    .ok_or_else(|| SupfleetError::BadAddress(name))?;
                Ok(RpcOutcome::Value(status.serial(self.ctx.loading(&canonical))))
            }
            RpcRequest::GetAllApplicationsInfo => {
                check_from_deployment(state)?;
                let infos: Vec<Value> = self.ctx.applications().map(|a| a.serial()).collect();
                Ok(RpcOutcome::Value(json!(infos)))
            }
            RpcRequest::GetApplicationInfo { name } => {
                check_from_deployment(state)?;
                let status = self
                    .ctx
                    .application(&name)
                    .ok_or_else(|| SupfleetError::BadName(name))?;
                Ok(RpcOutcome::Value(status.serial()))
            }
            RpcRequest::GetAllProcessInfo => {
                check_from_deployment(state)?;
                let infos: Vec<Value> = self
                    .ctx
                    .applications()
                    .flat_map(|a| a.processes.values())
                    .map(|p| p.serial())
                    .collect();
                Ok(RpcOutcome::Value(json!(infos)))
            }
            RpcRequest::GetProcessInfo { namespec } => {
                check_from_deployment(state)?;
                let spec = rpc::parse_namespec(&namespec)?;
                match &spec.process {
                    Some(process) => {
                        let status = self
                            .ctx
                            .process(&spec.application, process)
                            .ok_or_else(|| SupfleetError::BadName(namespec))?;
                        Ok(RpcOutcome::Value(status.serial()))
                    }
                    None => {
                        let app = self
                            .ctx
                            .application(&spec.application)
                            .ok_or_else(|| SupfleetError::BadName(namespec))?;
                        let infos: Vec<Value> =
                            app.processes.values().map(|p| p.serial()).collect();
                        Ok(RpcOutcome::Value(json!(infos)))
                    }
                }
            }
            RpcRequest::GetProcessRules { namespec } => {
                check_from_deployment(state)?;
                let spec = rpc::parse_namespec(&namespec)?;
                match &spec.process {
                    Some(process) => {
                        let status = self
                            .ctx
                            .process(&spec.application, process)
                            .ok_or_else(|| SupfleetError::BadName(namespec))?;
                        Ok(RpcOutcome::Value(status.rules.serial(&status.namespec())))
                    }
                    None => {
                        let app = self
                            .ctx
                            .application(&spec.application)
                            .ok_or_else(|| SupfleetError::BadName(namespec))?;
                        let rules: Vec<Value> = app
                            .processes
                            .values()
                            .map(|p| p.rules.serial(&p.namespec()))
                            .collect();
                        Ok(RpcOutcome::Value(json!(rules)))
                    }
                }
            }
            RpcRequest::GetConflicts => {
                check_from_deployment(state)?;
                let conflicts: Vec<Value> =
                    self.ctx.conflicts().iter().map(|p| p.serial()).collect();
                Ok(RpcOutcome::Value(json!(conflicts)))
            }
            RpcRequest::StartApplication { strategy, name } => {
                check_operating(state)?;
                let strategy = crate::core::rules::parse_strategy(&strategy)?;
                let (notifier, rx) = oneshot::channel();
                let actions = self.starter.submit_application(
                    &self.ctx,
                    now,
                    &name,
                    strategy,
                    Some(notifier),
                )?;
                self.apply_actions(Direction::Start, actions);
                Ok(RpcOutcome::Deferred(Deferred::new(rx)))
            }
            RpcRequest::StopApplication { name } => {
                check_operating_conciliation(state)?;
                let (notifier, rx) = oneshot::channel();
                let actions = self.stopper.submit_application(
                    &self.ctx,
                    now,
                    &name,
                    StartStrategy::Config,
                    Some(notifier),
                )?;
                self.apply_actions(Direction::Stop, actions);
                Ok(RpcOutcome::Deferred(Deferred::new(rx)))
            }
            RpcRequest::RestartApplication { strategy, name } => {
                check_operating(state)?;
                let strategy = crate::core::rules::parse_strategy(&strategy)?;
                if self.ctx.application(&name).is_none() {
                    return Err(SupfleetError::BadName(name));
                }
                let (notifier, rx) = oneshot::channel();
                self.app_restarts
                    .entry(name.clone())
                    .or_insert_with(|| (strategy, Vec::new()))
                    .1
                    .push(notifier);
                match self.stopper.submit_application(
                    &self.ctx,
                    now,
                    &name,
                    StartStrategy::Config,
                    None,
                ) {
                    Ok(actions) => {
                        self.apply_actions(Direction::Stop, actions)
                    }
                    Err(e) => {
                        self.app_restarts.remove(&name);
                        return Err(e);
                    }
                }
                Ok(RpcOutcome::Deferred(Deferred::new(rx)))
            }
            RpcRequest::StartArgs {
                namespec,
                extra_args,
            } => {
                check_from_deployment(state)?;
                let spec = rpc::parse_namespec(&namespec)?;
                let Some(process) = spec.process.clone() else {
                    return Err(SupfleetError::BadExtraArguments(format!(
                        "extra arguments need a single process, got '{namespec}'"
                    )));
                };
                self.ctx
                    .update_extra_args(&spec.application, &process, &extra_args)?;
                let local = self.options.local_node.clone();
                let status = self
                    .ctx
                    .process(&spec.application, &process)
                    .ok_or_else(|| SupfleetError::BadName(namespec.clone()))?;
                if status.addresses.contains(&local) {
                    return Err(SupfleetError::AlreadyStarted(namespec));
                }
                self.send_outbound(OutboundRequest::Command(SupervisorCommand {
                    node: local,
                    kind: CommandKind::Start {
                        namespec: status.namespec(),
                        extra_args,
                    },
                }));
                Ok(RpcOutcome::Value(json!(true)))
            }
            RpcRequest::StartProcess {
                strategy,
                namespec,
                extra_args,
            } => {
                check_operating(state)?;
                let strategy = crate::core::rules::parse_strategy(&strategy)?;
                let spec = rpc::parse_namespec(&namespec)?;
                if !extra_args.is_empty() && spec.process.is_none() {
                    return Err(SupfleetError::BadExtraArguments(format!(
                        "extra arguments need a single process, got '{namespec}'"
                    )));
                }
                let (notifier, rx) = oneshot::channel();
                let actions = match &spec.process {
                    Some(process) => {
                        if !extra_args.is_empty() {
                            self.ctx
                                .update_extra_args(&spec.application, process, &extra_args)?;
                        }
                        self.starter.submit_process(
                            &self.ctx,
                            now,
                            &spec.application,
                            process,
                            strategy,
                            Some(notifier),
                        )?
                    }
                    None => {
                        let members = self.application_members(&spec.application)?;
                        self.starter.submit_processes(
                            &self.ctx,
                            now,
                            &spec.application,
                            &members,
                            strategy,
                            Some(notifier),
                        )?
                    }
                };
                self.apply_actions(Direction::Start, actions);
                Ok(RpcOutcome::Deferred(Deferred::new(rx)))
            }
            RpcRequest::StopProcess { namespec } => {
                check_operating_conciliation(state)?;
                let spec = rpc::parse_namespec(&namespec)?;
                let (notifier, rx) = oneshot::channel();
                let actions = match &spec.process {
                    Some(process) => self.stopper.submit_process(
                        &self.ctx,
                        now,
                        &spec.application,
                        process,
                        StartStrategy::Config,
                        Some(notifier),
                    )?,
                    None => {
                        let members = self.application_members(&spec.application)?;
                        self.stopper.submit_processes(
                            &self.ctx,
                            now,
                            &spec.application,
                            &members,
                            StartStrategy::Config,
                            Some(notifier),
                        )?
                    }
                };
                self.apply_actions(Direction::Stop, actions);
                Ok(RpcOutcome::Deferred(Deferred::new(rx)))
            }
            RpcRequest::RestartProcess {
                strategy,
                namespec,
                extra_args,
            } => {
                check_operating(state)?;
                let strategy = crate::core::rules::parse_strategy(&strategy)?;
                let spec = rpc::parse_namespec(&namespec)?;
                let Some(process) = spec.process.clone() else {
                    return Err(SupfleetError::BadName(format!(
                        "restart needs a single process, got '{namespec}'"
                    )));
                };
                if !extra_args.is_empty() {
                    self.ctx
                        .update_extra_args(&spec.application, &process, &extra_args)?;
                } else if self.ctx.process(&spec.application, &process).is_none() {
                    return Err(SupfleetError::BadName(namespec));
                }
                let (notifier, rx) = oneshot::channel();
                self.process_restarts
                    .entry(spec.application.clone())
                    .or_default()
                    .push((process.clone(), strategy, vec![notifier]));
                match self.stopper.submit_process(
                    &self.ctx,
                    now,
                    &spec.application,
                    &process,
                    StartStrategy::Config,
                    None,
                ) {
                    Ok(actions) => {
                        self.apply_actions(Direction::Stop, actions)
                    }
                    Err(e) => {
                        let emptied = match self.process_restarts.get_mut(&spec.application) {
                            Some(list) => {
                                list.retain(|(p, _, _)| p != &process);
                                list.is_empty()
                            }
                            None => false,
                        };
                        if emptied {
                            self.process_restarts.remove(&spec.application);
                        }
                        return Err(e);
                    }
                }
                Ok(RpcOutcome::Deferred(Deferred::new(rx)))
            }
            RpcRequest::Restart => {
                let now = self.clock.monotonic();
                if !self.fsm.request_restart(now) {
                    return Err(SupfleetError::BadFleetState(state.to_string()));
                }
                self.close_lifecycle(FleetState::Restarting);
                Ok(RpcOutcome::Value(json!(true)))
            }
            RpcRequest::Shutdown => {
                let now = self.clock.monotonic();
                if !self.fsm.request_shutdown(now) {
                    return Err(SupfleetError::BadFleetState(state.to_string()));
                }
                self.close_lifecycle(FleetState::ShuttingDown);
                Ok(RpcOutcome::Value(json!(true)))
            }
        }
    }

    /// Every member process of an application, for wildcard commands.
    fn application_members(&self, application: &str) -> Result<Vec<String>, SupfleetError> {
        let app = self
            .ctx
            .application(application)
            .ok_or_else(|| SupfleetError::BadName(application.to_string()))?;
        Ok(app.processes.keys().cloned().collect())
    }

    /// RESTARTING / SHUTTING_DOWN entry: in-flight jobs are cancelled,
    /// pending buckets dropped, waiters observe ABNORMAL_TERMINATION.
    fn close_lifecycle(&mut self, state: FleetState) {
        self.starter.cancel_all();
        self.stopper.cancel_all();
        for (application, (_, notifiers)) in self.app_restarts.drain() {
            for notifier in notifiers {
                let _ = notifier.send(Err(SupfleetError::AbnormalTermination(application.clone())));
            }
        }
        for (application, restarts) in self.process_restarts.drain() {
            for (_, _, notifiers) in restarts {
                for notifier in notifiers {
                    let _ = notifier
                        .send(Err(SupfleetError::AbnormalTermination(application.clone())));
                }
            }
        }
        self.conciliation_restarts.clear();
        self.bus.publish(EventTopic::Fleet, self.fsm.serial());
        let _ = self.lifecycle_tx.send(state);
    }
}
