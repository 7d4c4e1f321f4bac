// src/core/commander.rs

//! The sequenced multi-node deployment planner.
//!
//! One `Commander` instance per direction: the starter walks the
//! `start_sequence` buckets of an application, the stopper the
//! `stop_sequence` buckets. Buckets run in ascending key order; jobs within
//! a bucket run in parallel. The commander never touches the network: it
//! returns `PlannerAction` values (commands to issue, follow-up plans,
//! completions) that the core loop executes, and it learns about progress
//! from the process events folded into the context.

use crate::core::application::ApplicationState;
use crate::core::context::Context;
use crate::core::errors::SupfleetError;
use crate::core::process::ProcessStatus;
use crate::core::rules::{StartStrategy, StartingFailureStrategy};
use crate::core::strategy::choose_node;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Floor for per-job deadlines, seconds.
const MIN_JOB_TIMEOUT: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Start,
    Stop,
}

/// A start/stop request addressed to one node's local supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorCommand {
    pub node: String,
    pub kind: CommandKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    Start { namespec: String, extra_args: String },
    Stop { namespec: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Placed,
    InFlight,
    Done(JobOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

/// One process within a plan.
#[derive(Debug)]
pub struct ProcessJob {
    pub process: String,
    pub required: bool,
    pub wait_exit: bool,
    pub expected_loading: u8,
    pub state: JobState,
    /// Nodes commanded for this job.
    pub targets: Vec<String>,
    /// Monotonic deadline once in flight.
    pub deadline: Duration,
}

impl ProcessJob {
    fn new(process: &str, required: bool, wait_exit: bool, expected_loading: u8) -> Self {
        Self {
            process: process.to_string(),
            required,
            wait_exit,
            expected_loading,
            state: JobState::Pending,
            targets: Vec::new(),
            deadline: Duration::ZERO,
        }
    }

    fn terminal(&self) -> bool {
        matches!(self.state, JobState::Done(_))
    }

    fn finish(&mut self, outcome: JobOutcome) {
        if !self.terminal() {
            self.state = JobState::Done(outcome);
        }
    }
}

/// Follow-ups the core loop must execute after a planner step.
#[derive(Debug)]
pub enum PlannerAction {
    Issue(SupervisorCommand),
    /// The STOP starting-failure strategy asked for a full application stop.
    StopApplication(String),
    /// The plan for the application reached a terminal state.
    Finished { application: String, success: bool },
}

/// Resolved with the final plan verdict; dropped receivers are tolerated.
pub type PlanNotifier = oneshot::Sender<Result<bool, SupfleetError>>;

struct ApplicationPlan {
    strategy: StartStrategy,
    failure_strategy: StartingFailureStrategy,
    /// Buckets not yet launched, ascending sequence order.
    pending: BTreeMap<i32, Vec<ProcessJob>>,
    active: Option<(i32, Vec<ProcessJob>)>,
    required_failure: bool,
    notifiers: Vec<PlanNotifier>,
}

impl ApplicationPlan {
    fn jobs_total(&self) -> usize {
        self.pending.values().map(Vec::len).sum::<usize>()
            + self.active.as_ref().map(|(_, jobs)| jobs.len()).unwrap_or(0)
    }
}

/// Direction-generic sequence executor.
pub struct Commander {
    direction: Direction,
    plans: HashMap<String, ApplicationPlan>,
    /// Loading already committed to a node by in-flight placements, not yet
    /// visible in the context. Keeps one bucket from stacking every job on
    /// the same node.
    planned_loading: HashMap<String, u32>,
}

impl Commander {
    pub fn starter() -> Self {
        Self {
            direction: Direction::Start,
            plans: HashMap::new(),
            planned_loading: HashMap::new(),
        }
    }

    pub fn stopper() -> Self {
        Self {
            direction: Direction::Stop,
            plans: HashMap::new(),
            planned_loading: HashMap::new(),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn in_progress(&self, application: &str) -> bool {
        self.plans.contains_key(application)
    }

    pub fn any_in_progress(&self) -> bool {
        !self.plans.is_empty()
    }

    /// Submits a whole-application plan. Buckets come from the rules-driven
    /// sequence maps; members already in the desired state are left alone.
    pub fn submit_application(
        &mut self,
        ctx: &Context,
        now: Duration,
        application: &str,
        strategy: StartStrategy,
        notifier: Option<PlanNotifier>,
    ) -> Result<Vec<PlannerAction>, SupfleetError> {
        let app = ctx
            .application(application)
            .ok_or_else(|| SupfleetError::BadName(application.to_string()))?;
        if self.plans.contains_key(application) {
            return Err(SupfleetError::AlreadyInProgress(application.to_string()));
        }
        let mut pending: BTreeMap<i32, Vec<ProcessJob>> = BTreeMap::new();
        match self.direction {
            Direction::Start => {
                if app.state == ApplicationState::Running {
                    return Err(SupfleetError::AlreadyStarted(application.to_string()));
                }
                for (sequence, members) in app.start_buckets() {
                    let jobs: Vec<ProcessJob> = members
                        .iter()
                        .map(|p| {
                            ProcessJob::new(
                                &p.process_name,
                                p.rules.required,
                                p.rules.wait_exit,
                                p.rules.expected_loading,
                            )
                        })
                        .collect();
                    if !jobs.is_empty() {
                        pending.insert(sequence, jobs);
                    }
                }
            }
            Direction::Stop => {
                for (sequence, members) in app.stop_buckets() {
                    let jobs: Vec<ProcessJob> = members
                        .iter()
                        .filter(|p| !p.addresses.is_empty())
                        .map(|p| {
                            ProcessJob::new(
                                &p.process_name,
                                p.rules.required,
                                p.rules.wait_exit,
                                p.rules.expected_loading,
                            )
                        })
                        .collect();
                    if !jobs.is_empty() {
                        pending.insert(sequence, jobs);
                    }
                }
            }
        }
        self.install_plan(ctx, now, application, strategy, pending, notifier)
    }

    /// Submits a single-process plan. It occupies the application slot, so
    /// it serializes against whole-application plans.
    pub fn submit_process(
        &mut self,
        ctx: &Context,
        now: Duration,
        application: &str,
        process: &str,
        strategy: StartStrategy,
        notifier: Option<PlanNotifier>,
    ) -> Result<Vec<PlannerAction>, SupfleetError> {
        let status = ctx
            .process(application, process)
            .ok_or_else(|| SupfleetError::BadName(format!("{application}:{process}")))?;
        if self.plans.contains_key(application) {
            return Err(SupfleetError::AlreadyInProgress(application.to_string()));
        }
        match self.direction {
            Direction::Start => {
                if status.state.is_running() {
                    return Err(SupfleetError::AlreadyStarted(status.namespec()));
                }
            }
            Direction::Stop => {
                if status.addresses.is_empty() {
                    // Stopping a stopped process is a no-op success.
                    if let Some(notifier) = notifier {
                        let _ = notifier.send(Ok(true));
                    }
                    return Ok(vec![PlannerAction::Finished {
                        application: application.to_string(),
                        success: true,
                    }]);
                }
            }
        }
        let mut pending = BTreeMap::new();
        pending.insert(
            0,
            vec![ProcessJob::new(
                process,
                status.rules.required,
                status.rules.wait_exit,
                status.rules.expected_loading,
            )],
        );
        self.install_plan(ctx, now, application, strategy, pending, notifier)
    }

    /// Submits a plan over an explicit process list (wildcard namespec).
    /// Members already in the desired state are skipped rather than faulted.
    pub fn submit_processes(
        &mut self,
        ctx: &Context,
        now: Duration,
        application: &str,
        processes: &[String],
        strategy: StartStrategy,
        notifier: Option<PlanNotifier>,
    ) -> Result<Vec<PlannerAction>, SupfleetError> {
        if ctx.application(application).is_none() {
            return Err(SupfleetError::BadName(application.to_string()));
        }
        if self.plans.contains_key(application) {
            return Err(SupfleetError::AlreadyInProgress(application.to_string()));
        }
        let mut jobs = Vec::new();
        for process in processes {
            let Some(status) = ctx.process(application, process) else {
                continue;
            };
            let skip = match self.direction {
                Direction::Start => status.state.is_running(),
                Direction::Stop => status.addresses.is_empty(),
            };
            if !skip {
                jobs.push(ProcessJob::new(
                    process,
                    status.rules.required,
                    status.rules.wait_exit,
                    status.rules.expected_loading,
                ));
            }
        }
        let mut pending = BTreeMap::new();
        if !jobs.is_empty() {
            pending.insert(0, jobs);
        }
        self.install_plan(ctx, now, application, strategy, pending, notifier)
    }

    fn install_plan(
        &mut self,
        ctx: &Context,
        now: Duration,
        application: &str,
        strategy: StartStrategy,
        pending: BTreeMap<i32, Vec<ProcessJob>>,
        notifier: Option<PlanNotifier>,
    ) -> Result<Vec<PlannerAction>, SupfleetError> {
        let plan = ApplicationPlan {
            strategy,
            failure_strategy: ctx
                .application(application)
                .map(|a| a.rules.starting_failure_strategy)
                .unwrap_or_default(),
            pending,
            active: None,
            required_failure: false,
            notifiers: notifier.into_iter().collect(),
        };
        info!(
            "{:?} plan submitted for '{}' ({} jobs)",
            self.direction,
            application,
            plan.jobs_total()
        );
        self.plans.insert(application.to_string(), plan);
        Ok(self.progress(ctx, now, application))
    }

    /// Folds a process state change into any plan watching it.
    pub fn on_process_event(
        &mut self,
        ctx: &Context,
        now: Duration,
        status: &ProcessStatus,
    ) -> Vec<PlannerAction> {
        let direction = self.direction;
        let Some(plan) = self.plans.get_mut(&status.application_name) else {
            return vec![];
        };
        let Some((_, jobs)) = plan.active.as_mut() else {
            return vec![];
        };
        let mut touched = false;
        for job in jobs
            .iter_mut()
            .filter(|j| j.process == status.process_name && !j.terminal())
        {
            touched = true;
            match direction {
                Direction::Start => Self::judge_start_job(job, status),
                Direction::Stop => Self::judge_stop_job(job, status),
            }
            if job.terminal() {
                Self::release_planned(&mut self.planned_loading, job);
            }
        }
        if touched {
            let application = status.application_name.clone();
            self.progress(ctx, now, &application)
        } else {
            vec![]
        }
    }

    fn judge_start_job(job: &mut ProcessJob, status: &ProcessStatus) {
        use crate::core::process::ProcessState::*;
        match status.state {
            Running => {
                if !job.wait_exit {
                    job.finish(JobOutcome::Succeeded);
                }
            }
            Exited => {
                if job.wait_exit && status.expected_exit {
                    job.finish(JobOutcome::Succeeded);
                } else {
                    job.finish(JobOutcome::Failed);
                }
            }
            Fatal | Stopped | Unknown => job.finish(JobOutcome::Failed),
            Starting | Backoff | Stopping => {}
        }
    }

    fn judge_stop_job(job: &mut ProcessJob, status: &ProcessStatus) {
        if job.targets.iter().all(|t| !status.addresses.contains(t)) {
            job.finish(JobOutcome::Succeeded);
        }
    }

    /// Returns a terminal job's committed loading to the pool. Once a start
    /// succeeded the loading shows up in the context instead.
    fn release_planned(planned: &mut HashMap<String, u32>, job: &ProcessJob) {
        for node in &job.targets {
            if let Some(load) = planned.get_mut(node) {
                *load = load.saturating_sub(job.expected_loading as u32);
            }
        }
    }

    /// Times out overdue jobs. Called from the periodic sweep.
    pub fn on_timer(&mut self, ctx: &Context, now: Duration) -> Vec<PlannerAction> {
        let mut overdue: Vec<String> = Vec::new();
        for (application, plan) in self.plans.iter_mut() {
            if let Some((_, jobs)) = plan.active.as_mut() {
                for job in jobs.iter_mut().filter(|j| !j.terminal()) {
                    if matches!(job.state, JobState::InFlight | JobState::Placed)
                        && now > job.deadline
                    {
                        warn!(
                            "Job {}:{} timed out on {:?}",
                            application, job.process, job.targets
                        );
                        job.finish(JobOutcome::TimedOut);
                        Self::release_planned(&mut self.planned_loading, job);
                        if !overdue.contains(application) {
                            overdue.push(application.clone());
                        }
                    }
                }
            }
        }
        let mut actions = Vec::new();
        for application in overdue {
            actions.extend(self.progress(ctx, now, &application));
        }
        actions
    }

    /// Cancels every plan; in-flight jobs become terminal and waiters get
    /// ABNORMAL_TERMINATION.
    pub fn cancel_all(&mut self) {
        self.planned_loading.clear();
        for (application, mut plan) in self.plans.drain() {
            if let Some((_, jobs)) = plan.active.as_mut() {
                for job in jobs.iter_mut() {
                    job.finish(JobOutcome::Cancelled);
                }
            }
            plan.pending.clear();
            info!("Cancelled {:?} plan for '{}'", self.direction, application);
            for notifier in plan.notifiers.drain(..) {
                let _ = notifier.send(Err(SupfleetError::AbnormalTermination(
                    application.clone(),
                )));
            }
        }
    }

    /// Drives the plan of one application as far as it goes without new
    /// input: launches buckets, applies failure strategies, completes.
    fn progress(&mut self, ctx: &Context, now: Duration, application: &str) -> Vec<PlannerAction> {
        let direction = self.direction;
        let mut actions = Vec::new();
        loop {
            // Launch the next bucket when none is active; detect completion.
            let finished = {
                let Some(plan) = self.plans.get_mut(application) else {
                    return actions;
                };
                if plan.active.is_some() {
                    false
                } else {
                    match plan.pending.pop_first() {
                        Some((sequence, mut jobs)) => {
                            debug!(
                                "Launching bucket {} of '{}' ({} jobs)",
                                sequence,
                                application,
                                jobs.len()
                            );
                            let strategy = plan.strategy;
                            for job in jobs.iter_mut() {
                                Self::launch_job(
                                    direction,
                                    strategy,
                                    ctx,
                                    now,
                                    application,
                                    job,
                                    &mut self.planned_loading,
                                    &mut actions,
                                );
                            }
                            plan.active = Some((sequence, jobs));
                            false
                        }
                        None => true,
                    }
                }
            };
            if finished {
                let Some(plan) = self.plans.remove(application) else {
                    return actions;
                };
                let success = !plan.required_failure;
                info!(
                    "{:?} plan for '{}' finished, success: {}",
                    direction, application, success
                );
                for notifier in plan.notifiers {
                    let _ = notifier.send(if success {
                        Ok(true)
                    } else {
                        Err(SupfleetError::AbnormalTermination(application.to_string()))
                    });
                }
                actions.push(PlannerAction::Finished {
                    application: application.to_string(),
                    success,
                });
                return actions;
            }

            let Some(plan) = self.plans.get_mut(application) else {
                return actions;
            };
            let Some((_, jobs)) = plan.active.as_ref() else {
                continue;
            };
            if !jobs.iter().all(ProcessJob::terminal) {
                // The bucket barrier: wait for every job to settle.
                return actions;
            }

            let bucket_failed = jobs
                .iter()
                .any(|j| j.required && !matches!(j.state, JobState::Done(JobOutcome::Succeeded)));
            plan.active = None;
            if bucket_failed {
                plan.required_failure = true;
                match (direction, plan.failure_strategy) {
                    (Direction::Start, StartingFailureStrategy::Abort) => {
                        warn!("Start of '{}' aborted, remaining buckets dropped", application);
                        plan.pending.clear();
                    }
                    (Direction::Start, StartingFailureStrategy::Stop) => {
                        warn!("Start of '{}' failed, stopping the application", application);
                        plan.pending.clear();
                        actions.push(PlannerAction::StopApplication(application.to_string()));
                    }
                    (Direction::Start, StartingFailureStrategy::Continue) => {
                        warn!("Start of '{}' continuing past a required failure", application);
                    }
                    (Direction::Stop, _) => {
                        warn!("Stop of '{}' hit a failed job", application);
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn launch_job(
        direction: Direction,
        strategy: StartStrategy,
        ctx: &Context,
        now: Duration,
        application: &str,
        job: &mut ProcessJob,
        planned: &mut HashMap<String, u32>,
        actions: &mut Vec<PlannerAction>,
    ) {
        let Some(status) = ctx.process(application, &job.process) else {
            warn!("Process {}:{} vanished, job failed", application, job.process);
            job.finish(JobOutcome::Failed);
            return;
        };
        match direction {
            Direction::Start => {
                if status.state.is_running() {
                    job.finish(JobOutcome::Succeeded);
                    return;
                }
                // Fold the loading of sibling placements still in flight
                // into the candidate figures.
                let candidates: Vec<_> = ctx
                    .candidates_for(application, &job.process, &status.rules)
                    .into_iter()
                    .map(|mut candidate| {
                        candidate.loading += planned.get(&candidate.node).copied().unwrap_or(0);
                        candidate
                    })
                    .collect();
                match choose_node(strategy, &candidates, status.rules.expected_loading as u32) {
                    Some(node) => {
                        *planned.entry(node.clone()).or_default() +=
                            status.rules.expected_loading as u32;
                        job.targets = vec![node.clone()];
                        job.state = JobState::Placed;
                        job.deadline =
                            now + Duration::from_secs(status.rules.start_timeout.max(MIN_JOB_TIMEOUT));
                        actions.push(PlannerAction::Issue(SupervisorCommand {
                            node,
                            kind: CommandKind::Start {
                                namespec: status.namespec(),
                                extra_args: status.extra_args.clone(),
                            },
                        }));
                        job.state = JobState::InFlight;
                    }
                    None => {
                        warn!(
                            "No node satisfies the load budget for {}:{}",
                            application, job.process
                        );
                        job.finish(JobOutcome::Failed);
                    }
                }
            }
            Direction::Stop => {
                if status.addresses.is_empty() {
                    job.finish(JobOutcome::Succeeded);
                    return;
                }
                job.targets = status.addresses.iter().cloned().collect();
                job.state = JobState::Placed;
                job.deadline =
                    now + Duration::from_secs(status.rules.stop_timeout.max(MIN_JOB_TIMEOUT));
                for node in &job.targets {
                    actions.push(PlannerAction::Issue(SupervisorCommand {
                        node: node.clone(),
                        kind: CommandKind::Stop {
                            namespec: status.namespec(),
                        },
                    }));
                }
                job.state = JobState::InFlight;
            }
        }
    }
}
