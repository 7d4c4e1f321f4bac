use supfleet::core::commander::CommandKind;
use supfleet::core::conciliation::{ConciliationAction, conciliate};
use supfleet::core::process::{ProcessEvent, ProcessState, ProcessStatus};
use supfleet::core::rules::{ConciliationStrategy, ProcessRules, RunningFailureStrategy};

fn conflicting(strategy: RunningFailureStrategy) -> ProcessStatus {
    let rules = ProcessRules {
        running_failure_strategy: strategy,
        ..ProcessRules::default()
    };
    let mut status = ProcessStatus::new("app", "p", rules);
    for (node, started) in [("n1", 1_000), ("n2", 1_005)] {
        status.apply_event(
            node,
            &ProcessEvent {
                group: "app".to_string(),
                name: "p".to_string(),
                state: ProcessState::Running,
                expected: true,
                now: started,
                spawn_error: None,
                extra_args: None,
            },
        );
    }
    status
}

fn stops(actions: &[ConciliationAction]) -> Vec<&str> {
    actions
        .iter()
        .filter_map(|action| match action {
            ConciliationAction::Issue(command) => match &command.kind {
                CommandKind::Stop { .. } => Some(command.node.as_str()),
                _ => None,
            },
            _ => None,
        })
        .collect()
}

#[test]
fn test_user_strategy_does_nothing() {
    let process = conflicting(RunningFailureStrategy::Continue);
    let actions = conciliate(ConciliationStrategy::User, &[&process]);
    assert!(actions.is_empty());
}

#[test]
fn test_senicide_keeps_the_earliest_instance() {
    let process = conflicting(RunningFailureStrategy::Continue);
    let actions = conciliate(ConciliationStrategy::Senicide, &[&process]);
    // n1 started first and survives; the stop goes to n2.
    assert_eq!(stops(&actions), vec!["n2"]);
}

#[test]
fn test_infanticide_keeps_the_newest_instance() {
    let process = conflicting(RunningFailureStrategy::Continue);
    let actions = conciliate(ConciliationStrategy::Infanticide, &[&process]);
    // n2 started last and survives; the stop goes to n1.
    assert_eq!(stops(&actions), vec!["n1"]);
}

#[test]
fn test_stop_strategy_stops_every_instance() {
    let process = conflicting(RunningFailureStrategy::Continue);
    let actions = conciliate(ConciliationStrategy::Stop, &[&process]);
    let mut nodes = stops(&actions);
    nodes.sort_unstable();
    assert_eq!(nodes, vec!["n1", "n2"]);
}

#[test]
fn test_restart_strategy_stops_all_then_marks_a_restart() {
    let process = conflicting(RunningFailureStrategy::Continue);
    let actions = conciliate(ConciliationStrategy::Restart, &[&process]);
    assert_eq!(stops(&actions).len(), 2);
    assert!(actions.iter().any(|action| matches!(
        action,
        ConciliationAction::MarkProcessRestart { application, process }
            if application == "app" && process == "p"
    )));
}

#[test]
fn test_running_failure_delegates_to_the_process_rules() {
    let process = conflicting(RunningFailureStrategy::RestartProcess);
    let actions = conciliate(ConciliationStrategy::RunningFailure, &[&process]);
    assert_eq!(stops(&actions).len(), 2);
    assert!(actions.iter().any(|action| matches!(
        action,
        ConciliationAction::MarkProcessRestart { .. }
    )));

    let process = conflicting(RunningFailureStrategy::StopApplication);
    let actions = conciliate(ConciliationStrategy::RunningFailure, &[&process]);
    assert!(actions.iter().any(|action| matches!(
        action,
        ConciliationAction::MarkApplicationStop { application } if application == "app"
    )));

    let process = conflicting(RunningFailureStrategy::RestartApplication);
    let actions = conciliate(ConciliationStrategy::RunningFailure, &[&process]);
    assert!(actions.iter().any(|action| matches!(
        action,
        ConciliationAction::MarkApplicationRestart { .. }
    )));

    let process = conflicting(RunningFailureStrategy::Continue);
    let actions = conciliate(ConciliationStrategy::RunningFailure, &[&process]);
    // Continue: the duplicates are stopped and nothing comes back.
    assert_eq!(stops(&actions).len(), 2);
    assert_eq!(actions.len(), 2);
}

#[test]
fn test_every_stop_names_the_conflicting_process() {
    let process = conflicting(RunningFailureStrategy::Continue);
    let actions = conciliate(ConciliationStrategy::Stop, &[&process]);
    for action in &actions {
        if let ConciliationAction::Issue(command) = action {
            assert!(matches!(
                &command.kind,
                CommandKind::Stop { namespec } if namespec == "app:p"
            ));
        }
    }
}
