use std::sync::Arc;
use std::time::Duration;
use supfleet::config::NodeConfig;
use supfleet::core::SupfleetError;
use supfleet::core::application::ApplicationState;
use supfleet::core::clock::{Clock, ManualClock};
use supfleet::core::commander::{CommandKind, Commander, PlannerAction, SupervisorCommand};
use supfleet::core::context::Context;
use supfleet::core::events::EventBus;
use supfleet::core::mapper::AddressMapper;
use supfleet::core::process::{ProcessEvent, ProcessState};
use supfleet::core::rules::{RulesFile, StartStrategy};
use tokio::sync::oneshot;

const RULES: &str = r#"
[application.appa]
start_sequence = 1
starting_failure_strategy = "ABORT"

[application.appa.process.p1]
start_sequence = 1
stop_sequence = 1
required = true
expected_loading = 60

[application.appa.process.p2]
start_sequence = 1
stop_sequence = 1
expected_loading = 60

[application.appa.process.p3]
start_sequence = 2
stop_sequence = 2
required = true
expected_loading = 10

[application.appb]
start_sequence = 2
starting_failure_strategy = "STOP"

[application.appb.process.q1]
start_sequence = 1
required = true
expected_loading = 20

[application.appb.process.q2]
start_sequence = 2
expected_loading = 20

[application.filler.process.f1]
expected_loading = 90

[application.filler.process.f2]
expected_loading = 90

[application.batch.process.once]
start_sequence = 1
required = true
wait_exit = true
"#;

struct Fixture {
    clock: Arc<ManualClock>,
    ctx: Context,
}

impl Fixture {
    fn new(nodes: &[&str]) -> Self {
        let clock = Arc::new(ManualClock::starting_at(1_000));
        let node_configs: Vec<NodeConfig> = nodes
            .iter()
            .map(|name| NodeConfig {
                name: name.to_string(),
                aliases: vec![],
                supervisor: format!("{name}:60100"),
            })
            .collect();
        let mut ctx = Context::new(
            clock.clone(),
            Arc::new(EventBus::new()),
            AddressMapper::new(&node_configs),
            Arc::new(RulesFile::from_toml(RULES).unwrap()),
            Duration::from_secs(30),
            false,
        );
        for name in nodes {
            ctx.on_tick(name, clock.wall()).unwrap();
            ctx.on_authorization(name, true, vec![]).unwrap();
        }
        Self { clock, ctx }
    }

    fn now(&self) -> Duration {
        self.clock.monotonic()
    }

    /// Declares a process to the view in STOPPED state, as the handshake
    /// snapshot would.
    fn seed(&mut self, group: &str, name: &str) {
        self.apply("n1", group, name, ProcessState::Stopped, true);
    }

    /// Feeds a process event through the context and returns the planner
    /// input snapshot.
    fn apply(
        &mut self,
        node: &str,
        group: &str,
        name: &str,
        state: ProcessState,
        expected: bool,
    ) -> supfleet::core::process::ProcessStatus {
        let event = ProcessEvent {
            group: group.to_string(),
            name: name.to_string(),
            state,
            expected,
            now: self.clock.wall(),
            spawn_error: None,
            extra_args: None,
        };
        self.ctx
            .on_process_event(node, &event)
            .unwrap()
            .unwrap()
            .status
    }
}

fn issued(actions: &[PlannerAction]) -> Vec<&SupervisorCommand> {
    actions
        .iter()
        .filter_map(|action| match action {
            PlannerAction::Issue(command) => Some(command),
            _ => None,
        })
        .collect()
}

fn start_target<'a>(commands: &[&'a SupervisorCommand], namespec: &str) -> Option<&'a str> {
    commands.iter().find_map(|c| match &c.kind {
        CommandKind::Start { namespec: n, .. } if n == namespec => Some(c.node.as_str()),
        _ => None,
    })
}

fn finished(actions: &[PlannerAction]) -> Option<bool> {
    actions.iter().find_map(|action| match action {
        PlannerAction::Finished { success, .. } => Some(*success),
        _ => None,
    })
}

#[test]
fn test_sequenced_start_places_buckets_in_order() {
    let mut fx = Fixture::new(&["n1", "n2"]);
    for name in ["p1", "p2", "p3"] {
        fx.seed("appa", name);
    }
    let mut starter = Commander::starter();
    let (notifier, mut rx) = oneshot::channel();
    let actions = starter
        .submit_application(
            &fx.ctx,
            fx.now(),
            "appa",
            StartStrategy::LessLoaded,
            Some(notifier),
        )
        .unwrap();

    // Bucket 1: p1 and p2 in parallel, spread over both nodes by the
    // in-flight load accounting.
    let commands = issued(&actions);
    assert_eq!(commands.len(), 2);
    assert_eq!(start_target(&commands, "appa:p1"), Some("n1"));
    assert_eq!(start_target(&commands, "appa:p2"), Some("n2"));
    assert!(finished(&actions).is_none());

    // p3 is not launched until both bucket-1 jobs reach a terminal state.
    let status = fx.apply("n1", "appa", "p1", ProcessState::Running, true);
    let actions = starter.on_process_event(&fx.ctx, fx.now(), &status);
    assert!(issued(&actions).is_empty());

    let status = fx.apply("n2", "appa", "p2", ProcessState::Running, true);
    let actions = starter.on_process_event(&fx.ctx, fx.now(), &status);
    let commands = issued(&actions);
    assert_eq!(commands.len(), 1);
    assert!(start_target(&commands, "appa:p3").is_some());

    let status = fx.apply("n1", "appa", "p3", ProcessState::Running, true);
    let actions = starter.on_process_event(&fx.ctx, fx.now(), &status);
    assert_eq!(finished(&actions), Some(true));
    assert!(!starter.in_progress("appa"));

    let app = fx.ctx.application("appa").unwrap();
    assert_eq!(app.state, ApplicationState::Running);
    assert!(!app.major_failure);
    assert_eq!(rx.try_recv().unwrap().unwrap(), true);
}

#[test]
fn test_optional_failure_is_tolerated() {
    let mut fx = Fixture::new(&["n1", "n2"]);
    for name in ["p1", "p2", "p3"] {
        fx.seed("appa", name);
    }
    let mut starter = Commander::starter();
    starter
        .submit_application(&fx.ctx, fx.now(), "appa", StartStrategy::LessLoaded, None)
        .unwrap();

    let status = fx.apply("n1", "appa", "p1", ProcessState::Running, true);
    starter.on_process_event(&fx.ctx, fx.now(), &status);
    // p2 (optional) dies on spawn.
    let status = fx.apply("n2", "appa", "p2", ProcessState::Fatal, false);
    let actions = starter.on_process_event(&fx.ctx, fx.now(), &status);

    // The bucket is successful for its required subset, p3 launches.
    let commands = issued(&actions);
    assert!(start_target(&commands, "appa:p3").is_some());

    let status = fx.apply("n1", "appa", "p3", ProcessState::Running, true);
    let actions = starter.on_process_event(&fx.ctx, fx.now(), &status);
    assert_eq!(finished(&actions), Some(true));

    let app = fx.ctx.application("appa").unwrap();
    assert_eq!(app.state, ApplicationState::Running);
    assert!(app.minor_failure);
    assert!(!app.major_failure);
}

#[test]
fn test_required_failure_with_abort_drops_remaining_buckets() {
    let mut fx = Fixture::new(&["n1", "n2"]);
    for name in ["p1", "p2", "p3"] {
        fx.seed("appa", name);
    }
    let mut starter = Commander::starter();
    let (notifier, mut rx) = oneshot::channel();
    starter
        .submit_application(
            &fx.ctx,
            fx.now(),
            "appa",
            StartStrategy::LessLoaded,
            Some(notifier),
        )
        .unwrap();

    // p1 (required) fails, p2 starts fine.
    let status = fx.apply("n1", "appa", "p1", ProcessState::Fatal, false);
    let actions = starter.on_process_event(&fx.ctx, fx.now(), &status);
    assert!(finished(&actions).is_none());

    let status = fx.apply("n2", "appa", "p2", ProcessState::Running, true);
    let actions = starter.on_process_event(&fx.ctx, fx.now(), &status);

    // ABORT: no bucket 2, the plan fails, p2 is left running.
    assert_eq!(finished(&actions), Some(false));
    assert!(issued(&actions).is_empty());
    assert!(rx.try_recv().unwrap().is_err());
    assert!(fx.ctx.process("appa", "p2").unwrap().state.is_running());
}

#[test]
fn test_required_failure_with_stop_strategy_stops_the_application() {
    let mut fx = Fixture::new(&["n1", "n2"]);
    for name in ["q1", "q2"] {
        fx.seed("appb", name);
    }
    let mut starter = Commander::starter();
    starter
        .submit_application(&fx.ctx, fx.now(), "appb", StartStrategy::Config, None)
        .unwrap();

    let status = fx.apply("n1", "appb", "q1", ProcessState::Fatal, false);
    let actions = starter.on_process_event(&fx.ctx, fx.now(), &status);

    assert_eq!(finished(&actions), Some(false));
    assert!(actions.iter().any(|action| matches!(
        action,
        PlannerAction::StopApplication(name) if name == "appb"
    )));
}

#[test]
fn test_placement_refusal_fails_the_job() {
    let mut fx = Fixture::new(&["n1", "n2"]);
    // Both nodes carry 90 points already.
    fx.apply("n1", "filler", "f1", ProcessState::Running, true);
    fx.apply("n2", "filler", "f2", ProcessState::Running, true);
    fx.seed("appb", "q1");

    let mut starter = Commander::starter();
    let (notifier, mut rx) = oneshot::channel();
    let actions = starter
        .submit_process(
            &fx.ctx,
            fx.now(),
            "appb",
            "q1",
            StartStrategy::LessLoaded,
            Some(notifier),
        )
        .unwrap();

    assert!(issued(&actions).is_empty());
    assert_eq!(finished(&actions), Some(false));
    let err = rx.try_recv().unwrap().unwrap_err();
    assert!(matches!(err, SupfleetError::AbnormalTermination(_)));
}

#[test]
fn test_job_timeout_fails_the_plan() {
    let mut fx = Fixture::new(&["n1", "n2"]);
    fx.seed("appb", "q1");
    let mut starter = Commander::starter();
    let (notifier, mut rx) = oneshot::channel();
    let actions = starter
        .submit_process(
            &fx.ctx,
            fx.now(),
            "appb",
            "q1",
            StartStrategy::Config,
            Some(notifier),
        )
        .unwrap();
    assert_eq!(issued(&actions).len(), 1);

    // Nothing happens within the deadline window.
    fx.clock.advance(Duration::from_secs(11));
    let actions = starter.on_timer(&fx.ctx, fx.now());
    assert_eq!(finished(&actions), Some(false));
    assert!(rx.try_recv().unwrap().is_err());
}

#[test]
fn test_start_of_running_application_is_already_started() {
    let mut fx = Fixture::new(&["n1", "n2"]);
    fx.apply("n1", "appb", "q1", ProcessState::Running, true);
    fx.apply("n1", "appb", "q2", ProcessState::Running, true);

    let mut starter = Commander::starter();
    let err = starter
        .submit_application(&fx.ctx, fx.now(), "appb", StartStrategy::Config, None)
        .unwrap_err();
    assert!(matches!(err, SupfleetError::AlreadyStarted(_)));
}

#[test]
fn test_concurrent_plans_for_one_application_are_rejected() {
    let mut fx = Fixture::new(&["n1", "n2"]);
    fx.seed("appb", "q1");
    fx.seed("appb", "q2");
    let mut starter = Commander::starter();
    starter
        .submit_application(&fx.ctx, fx.now(), "appb", StartStrategy::Config, None)
        .unwrap();
    assert!(starter.in_progress("appb"));

    let err = starter
        .submit_process(&fx.ctx, fx.now(), "appb", "q2", StartStrategy::Config, None)
        .unwrap_err();
    assert!(matches!(err, SupfleetError::AlreadyInProgress(_)));
}

#[test]
fn test_unknown_application_is_a_bad_name() {
    let fx = Fixture::new(&["n1"]);
    let mut starter = Commander::starter();
    let err = starter
        .submit_application(&fx.ctx, fx.now(), "ghost", StartStrategy::Config, None)
        .unwrap_err();
    assert!(matches!(err, SupfleetError::BadName(_)));
}

#[test]
fn test_stop_plan_targets_every_location() {
    let mut fx = Fixture::new(&["n1", "n2"]);
    fx.apply("n1", "appb", "q1", ProcessState::Running, true);
    fx.apply("n2", "appb", "q1", ProcessState::Running, true);

    let mut stopper = Commander::stopper();
    let actions = stopper
        .submit_process(&fx.ctx, fx.now(), "appb", "q1", StartStrategy::Config, None)
        .unwrap();
    let commands = issued(&actions);
    let mut nodes: Vec<&str> = commands.iter().map(|c| c.node.as_str()).collect();
    nodes.sort_unstable();
    assert_eq!(nodes, vec!["n1", "n2"]);
    assert!(commands
        .iter()
        .all(|c| matches!(&c.kind, CommandKind::Stop { namespec } if namespec == "appb:q1")));

    // Both nodes acknowledge, in any order.
    let status = fx.apply("n1", "appb", "q1", ProcessState::Stopped, true);
    let actions = stopper.on_process_event(&fx.ctx, fx.now(), &status);
    assert!(finished(&actions).is_none());
    let status = fx.apply("n2", "appb", "q1", ProcessState::Stopped, true);
    let actions = stopper.on_process_event(&fx.ctx, fx.now(), &status);
    assert_eq!(finished(&actions), Some(true));
}

#[test]
fn test_stop_of_stopped_process_is_a_no_op_success() {
    let mut fx = Fixture::new(&["n1"]);
    fx.seed("appb", "q1");
    let mut stopper = Commander::stopper();
    let (notifier, mut rx) = oneshot::channel();
    let actions = stopper
        .submit_process(
            &fx.ctx,
            fx.now(),
            "appb",
            "q1",
            StartStrategy::Config,
            Some(notifier),
        )
        .unwrap();
    assert!(issued(&actions).is_empty());
    assert_eq!(finished(&actions), Some(true));
    assert_eq!(rx.try_recv().unwrap().unwrap(), true);
    assert!(!stopper.in_progress("appb"));
}

#[test]
fn test_wait_exit_start_succeeds_on_clean_exit_only() {
    let mut fx = Fixture::new(&["n1"]);
    fx.seed("batch", "once");
    let mut starter = Commander::starter();
    starter
        .submit_process(&fx.ctx, fx.now(), "batch", "once", StartStrategy::Config, None)
        .unwrap();

    // RUNNING does not terminate a wait-exit job.
    let status = fx.apply("n1", "batch", "once", ProcessState::Running, true);
    let actions = starter.on_process_event(&fx.ctx, fx.now(), &status);
    assert!(finished(&actions).is_none());

    // The clean exit does.
    let status = fx.apply("n1", "batch", "once", ProcessState::Exited, true);
    let actions = starter.on_process_event(&fx.ctx, fx.now(), &status);
    assert_eq!(finished(&actions), Some(true));
}

#[test]
fn test_unexpected_exit_fails_the_start_job() {
    let mut fx = Fixture::new(&["n1"]);
    fx.seed("batch", "once");
    let mut starter = Commander::starter();
    let (notifier, mut rx) = oneshot::channel();
    starter
        .submit_process(
            &fx.ctx,
            fx.now(),
            "batch",
            "once",
            StartStrategy::Config,
            Some(notifier),
        )
        .unwrap();

    let status = fx.apply("n1", "batch", "once", ProcessState::Exited, false);
    let actions = starter.on_process_event(&fx.ctx, fx.now(), &status);
    assert_eq!(finished(&actions), Some(false));
    assert!(rx.try_recv().unwrap().is_err());
}

#[test]
fn test_cancel_all_resolves_waiters_abnormally() {
    let mut fx = Fixture::new(&["n1", "n2"]);
    fx.seed("appb", "q1");
    let mut starter = Commander::starter();
    let (notifier, mut rx) = oneshot::channel();
    starter
        .submit_process(
            &fx.ctx,
            fx.now(),
            "appb",
            "q1",
            StartStrategy::Config,
            Some(notifier),
        )
        .unwrap();
    assert!(starter.any_in_progress());

    starter.cancel_all();
    assert!(!starter.any_in_progress());
    let err = rx.try_recv().unwrap().unwrap_err();
    assert!(matches!(err, SupfleetError::AbnormalTermination(_)));
}
