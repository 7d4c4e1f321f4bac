// src/core/rpc.rs

//! The request/reply RPC surface of the control plane.
//!
//! Requests are validated against the fleet state, then either answered
//! immediately from the unified view or turned into a planner submission.
//! A non-instantaneous command hands back a `Deferred`: an explicit value
//! the caller polls (or awaits) for the plan verdict.

use crate::core::errors::SupfleetError;
use crate::core::fsm::FleetState;
use crate::core::process::Namespec;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

pub const API_VERSION: &str = "1.0";

/// Every method of the RPC surface.
#[derive(Debug)]
pub enum RpcRequest {
    GetApiVersion,
    GetFleetState,
    GetMasterAddress,
    GetAllAddressesInfo,
    GetAddressInfo { name: String },
    GetAllApplicationsInfo,
    GetApplicationInfo { name: String },
    GetAllProcessInfo,
    GetProcessInfo { namespec: String },
    GetProcessRules { namespec: String },
    GetConflicts,
    StartApplication { strategy: String, name: String },
    StopApplication { name: String },
    RestartApplication { strategy: String, name: String },
    StartArgs { namespec: String, extra_args: String },
    StartProcess { strategy: String, namespec: String, extra_args: String },
    StopProcess { namespec: String },
    RestartProcess { strategy: String, namespec: String, extra_args: String },
    Restart,
    Shutdown,
}

/// What the core loop hands back for a request.
#[derive(Debug)]
pub enum RpcOutcome {
    /// The reply value, complete.
    Value(Value),
    /// The command was accepted and runs in the background.
    Deferred(Deferred),
}

/// Poll result of a deferred command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredPoll {
    /// `NOT_DONE_YET`.
    Pending,
    Done(bool),
}

/// Handle on a command completing in the background. Resolved by the
/// planner when the plan terminates; a cancelled plan resolves to
/// `ABNORMAL_TERMINATION`.
#[derive(Debug)]
pub struct Deferred {
    rx: oneshot::Receiver<Result<bool, SupfleetError>>,
}

impl Deferred {
    pub fn new(rx: oneshot::Receiver<Result<bool, SupfleetError>>) -> Self {
        Self { rx }
    }

    /// Non-blocking check, suitable for a polling cadence.
    pub fn poll(&mut self) -> Result<DeferredPoll, SupfleetError> {
        use tokio::sync::oneshot::error::TryRecvError;
        match self.rx.try_recv() {
            Ok(Ok(done)) => Ok(DeferredPoll::Done(done)),
            Ok(Err(e)) => Err(e),
            Err(TryRecvError::Empty) => Ok(DeferredPoll::Pending),
            Err(TryRecvError::Closed) => Err(SupfleetError::AbnormalTermination(
                "command abandoned".to_string(),
            )),
        }
    }

    /// Blocks until the plan terminates.
    pub async fn wait(self) -> Result<bool, SupfleetError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(SupfleetError::AbnormalTermination(
                "command abandoned".to_string(),
            )),
        }
    }
}

// --- Fleet state preconditions ---

/// Read access to the unified view requires a synchronized fleet.
pub fn check_from_deployment(state: FleetState) -> Result<(), SupfleetError> {
    if state == FleetState::Initialization {
        return Err(SupfleetError::BadFleetState(state.to_string()));
    }
    Ok(())
}

/// Start-family commands require OPERATION.
pub fn check_operating(state: FleetState) -> Result<(), SupfleetError> {
    if state != FleetState::Operation {
        return Err(SupfleetError::BadFleetState(state.to_string()));
    }
    Ok(())
}

/// Stop-family commands are also legal during CONCILIATION.
pub fn check_operating_conciliation(state: FleetState) -> Result<(), SupfleetError> {
    if !matches!(state, FleetState::Operation | FleetState::Conciliation) {
        return Err(SupfleetError::BadFleetState(state.to_string()));
    }
    Ok(())
}

/// Parses a namespec literal, mapping failures to `BAD_NAME`.
pub fn parse_namespec(literal: &str) -> Result<Namespec, SupfleetError> {
    Namespec::parse(literal).ok_or_else(|| SupfleetError::BadName(literal.to_string()))
}

/// Client-side handle submitting requests to the core loop.
#[derive(Debug, Clone)]
pub struct RpcHandle {
    tx: mpsc::Sender<crate::core::runtime::CoreMsg>,
}

impl RpcHandle {
    pub fn new(tx: mpsc::Sender<crate::core::runtime::CoreMsg>) -> Self {
        Self { tx }
    }

    pub async fn request(&self, request: RpcRequest) -> Result<RpcOutcome, SupfleetError> {
        let (respond, rx) = oneshot::channel();
        self.tx
            .send(crate::core::runtime::CoreMsg::Rpc { request, respond })
            .await
            .map_err(|_| SupfleetError::CoreUnavailable("core loop gone".to_string()))?;
        rx.await
            .map_err(|_| SupfleetError::CoreUnavailable("core loop gone".to_string()))?
    }

    /// Convenience for callers that always want the final value: deferred
    /// outcomes are awaited to completion.
    pub async fn call_waiting(&self, request: RpcRequest) -> Result<Value, SupfleetError> {
        match self.request(request).await? {
            RpcOutcome::Value(value) => Ok(value),
            RpcOutcome::Deferred(deferred) => deferred.wait().await.map(Value::from),
        }
    }
}
