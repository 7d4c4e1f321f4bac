// tests/integration/runtime_test.rs

use super::fixtures::{Harness, stopped_info};
use supfleet::core::commander::CommandKind;
use supfleet::core::events::EventTopic;
use supfleet::core::fsm::FleetState;
use supfleet::core::process::ProcessState;
use supfleet::core::rpc::{RpcOutcome, RpcRequest};
use supfleet::core::SupfleetError;

const RULES: &str = r#"
[application.appa]
start_sequence = 1

[application.appa.process.p1]
start_sequence = 1
required = true
expected_loading = 10
"#;

async fn fleet_state(harness: &Harness) -> String {
    match harness.rpc.request(RpcRequest::GetFleetState).await.unwrap() {
        RpcOutcome::Value(value) => value["statename"].as_str().unwrap().to_string(),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_synchronization_deployment_and_operation() {
    let mut harness = Harness::spawn(&["n1", "n2"], RULES).await;

    // First ticks open the handshakes.
    harness.tick("n1").await;
    harness.tick("n2").await;
    let first = harness.next_handshake().await;
    let second = harness.next_handshake().await;
    assert_ne!(first, second);

    harness.authorize("n1", vec![stopped_info("appa", "p1")]).await;
    harness.authorize("n2", vec![]).await;

    // Reads are refused until the fleet synchronized.
    let err = harness
        .rpc
        .request(RpcRequest::GetAllAddressesInfo)
        .await
        .unwrap_err();
    assert!(matches!(err, SupfleetError::BadFleetState(_)));

    // The master is already the lowest running node.
    match harness
        .rpc
        .request(RpcRequest::GetMasterAddress)
        .await
        .unwrap()
    {
        RpcOutcome::Value(value) => assert_eq!(value, "n1"),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(fleet_state(&harness).await, "INITIALIZATION");

    // Passing the synchronization window starts the deployment: the master
    // places appa:p1 somewhere.
    for _ in 0..2 {
        harness.clock.advance(std::time::Duration::from_secs(16));
        harness.tick("n1").await;
        harness.tick("n2").await;
    }
    let command = harness.next_command().await;
    assert!(matches!(
        &command.kind,
        CommandKind::Start { namespec, .. } if namespec == "appa:p1"
    ));

    // The supervisor confirms; the fleet settles in OPERATION.
    harness
        .process_event(&command.node, "appa", "p1", ProcessState::Running)
        .await;
    assert_eq!(fleet_state(&harness).await, "OPERATION");

    harness.stop();
}

#[tokio::test(start_paused = true)]
async fn test_stop_application_round_trip() {
    let mut harness = Harness::spawn(&["n1", "n2"], RULES).await;
    harness
        .synchronize(&["n1", "n2"], vec![stopped_info("appa", "p1")])
        .await;
    let start = harness.next_command().await;
    harness
        .process_event(&start.node, "appa", "p1", ProcessState::Running)
        .await;
    assert_eq!(fleet_state(&harness).await, "OPERATION");

    let outcome = harness
        .rpc
        .request(RpcRequest::StopApplication {
            name: "appa".to_string(),
        })
        .await
        .unwrap();
    let deferred = match outcome {
        RpcOutcome::Deferred(deferred) => deferred,
        other => panic!("unexpected outcome: {other:?}"),
    };

    let stop = harness.next_command().await;
    assert!(matches!(
        &stop.kind,
        CommandKind::Stop { namespec } if namespec == "appa:p1"
    ));
    harness
        .process_event(&stop.node, "appa", "p1", ProcessState::Stopped)
        .await;

    assert!(deferred.wait().await.unwrap());

    // Stopping again is an immediate no-op success.
    match harness
        .rpc
        .request(RpcRequest::StopApplication {
            name: "appa".to_string(),
        })
        .await
        .unwrap()
    {
        RpcOutcome::Deferred(deferred) => assert!(deferred.wait().await.unwrap()),
        other => panic!("unexpected outcome: {other:?}"),
    }

    harness.stop();
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_process_is_conciliated() {
    let mut harness = Harness::spawn(&["n1", "n2"], RULES).await;
    harness
        .synchronize(&["n1", "n2"], vec![stopped_info("appa", "p1")])
        .await;
    let start = harness.next_command().await;
    harness
        .process_event(&start.node, "appa", "p1", ProcessState::Running)
        .await;
    assert_eq!(fleet_state(&harness).await, "OPERATION");

    let mut fleet_rx = harness.bus.subscribe(EventTopic::Fleet);

    // A second node reports the same process: conflict.
    let other = if start.node == "n1" { "n2" } else { "n1" };
    harness.clock.advance(std::time::Duration::from_secs(1));
    harness
        .process_event(other, "appa", "p1", ProcessState::Running)
        .await;
    assert_eq!(fleet_state(&harness).await, "CONCILIATION");
    assert_eq!(
        fleet_rx.recv().await.unwrap().payload["statename"],
        "CONCILIATION"
    );

    // Infanticide keeps the newest instance: the stop goes to the node that
    // started first.
    let stop = harness.next_command().await;
    assert_eq!(stop.node, start.node);
    assert!(matches!(
        &stop.kind,
        CommandKind::Stop { namespec } if namespec == "appa:p1"
    ));
    harness
        .process_event(&stop.node, "appa", "p1", ProcessState::Stopped)
        .await;

    assert_eq!(fleet_state(&harness).await, "OPERATION");
    match harness.rpc.request(RpcRequest::GetConflicts).await.unwrap() {
        RpcOutcome::Value(value) => assert!(value.as_array().unwrap().is_empty()),
        other => panic!("unexpected outcome: {other:?}"),
    }

    harness.stop();
}

#[tokio::test(start_paused = true)]
async fn test_restart_request_closes_the_lifecycle() {
    let mut harness = Harness::spawn(&["n1"], RULES).await;
    harness
        .synchronize(&["n1"], vec![stopped_info("appa", "p1")])
        .await;
    // Leave the deployment start in flight on purpose.
    let _pending = harness.next_command().await;

    match harness.rpc.request(RpcRequest::Restart).await.unwrap() {
        RpcOutcome::Value(value) => assert_eq!(value, true),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(fleet_state(&harness).await, "RESTARTING");
    assert_eq!(harness.lifecycle.recv().await.unwrap(), FleetState::Restarting);

    // Commands are refused from a closing fleet.
    let err = harness
        .rpc
        .request(RpcRequest::StartApplication {
            strategy: "CONFIG".to_string(),
            name: "appa".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SupfleetError::BadFleetState(_)));

    harness.stop();
}
