// src/core/fsm.rs

//! The top-level fleet lifecycle state machine.
//!
//! Guards are evaluated on the core loop after every event batch and timer
//! sweep. The machine never blocks; it only reads the context and the
//! planners' progress flags.

use crate::core::context::Context;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use strum_macros::{Display, EnumString};
use tracing::info;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FleetState {
    /// Waiting for the fleet to synchronize: nodes checking in, master
    /// election pending.
    Initialization,
    /// The master drives the automatic start of sequenced applications.
    Deployment,
    /// Normal supervision.
    Operation,
    /// Duplicate-running processes are being resolved.
    Conciliation,
    Restarting,
    ShuttingDown,
}

impl FleetState {
    pub fn code(self) -> u16 {
        match self {
            FleetState::Initialization => 0,
            FleetState::Deployment => 1,
            FleetState::Operation => 2,
            FleetState::Conciliation => 3,
            FleetState::Restarting => 4,
            FleetState::ShuttingDown => 5,
        }
    }

    /// Terminal lifecycle states refuse further commands.
    pub fn is_closing(self) -> bool {
        matches!(self, FleetState::Restarting | FleetState::ShuttingDown)
    }
}

/// The fleet state machine. Owns nothing but the current state and the
/// monotonic instant it was entered.
#[derive(Debug)]
pub struct FleetStateMachine {
    state: FleetState,
    entered_at: Duration,
    synchro_timeout: Duration,
}

impl FleetStateMachine {
    pub fn new(synchro_timeout: Duration) -> Self {
        Self {
            state: FleetState::Initialization,
            entered_at: Duration::ZERO,
            synchro_timeout,
        }
    }

    pub fn state(&self) -> FleetState {
        self.state
    }

    /// The serial form published on the FLEET topic.
    pub fn serial(&self) -> serde_json::Value {
        json!({
            "statecode": self.state.code(),
            "statename": self.state.to_string(),
        })
    }

    fn enter(&mut self, state: FleetState, now: Duration) -> bool {
        if self.state == state {
            return false;
        }
        info!("Fleet state {} -> {}", self.state, state);
        self.state = state;
        self.entered_at = now;
        true
    }

    /// Evaluates the transition guards. Returns the new state when one
    /// fired. At most one transition happens per call; the caller loops the
    /// evaluation within a batch when it wants full convergence.
    pub fn evaluate(
        &mut self,
        ctx: &Context,
        starter_busy: bool,
        now: Duration,
    ) -> Option<FleetState> {
        let next = match self.state {
            FleetState::Initialization => {
                let synchronized = now.saturating_sub(self.entered_at) >= self.synchro_timeout;
                if synchronized && ctx.master().is_some() && ctx.all_nodes_settled() {
                    Some(FleetState::Deployment)
                } else {
                    None
                }
            }
            FleetState::Deployment => {
                if self.master_lost(ctx) {
                    Some(FleetState::Initialization)
                } else if !starter_busy {
                    Some(FleetState::Operation)
                } else {
                    None
                }
            }
            FleetState::Operation => {
                if self.master_lost(ctx) {
                    Some(FleetState::Initialization)
                } else if !ctx.conflicts().is_empty() {
                    Some(FleetState::Conciliation)
                } else {
                    None
                }
            }
            FleetState::Conciliation => {
                if self.master_lost(ctx) {
                    Some(FleetState::Initialization)
                } else if ctx.conflicts().is_empty() {
                    Some(FleetState::Operation)
                } else {
                    None
                }
            }
            FleetState::Restarting | FleetState::ShuttingDown => None,
        };
        match next {
            Some(state) if self.enter(state, now) => Some(state),
            _ => None,
        }
    }

    /// A master was elected and has since left RUNNING.
    fn master_lost(&self, ctx: &Context) -> bool {
        match ctx.master() {
            Some(master) => ctx
                .address(master)
                .map(|a| !a.is_running())
                .unwrap_or(true),
            None => true,
        }
    }

    /// Forces the RESTARTING lifecycle state.
    pub fn request_restart(&mut self, now: Duration) -> bool {
        !self.state.is_closing() && self.enter(FleetState::Restarting, now)
    }

    /// Forces the SHUTTING_DOWN lifecycle state.
    pub fn request_shutdown(&mut self, now: Duration) -> bool {
        self.state != FleetState::ShuttingDown && self.enter(FleetState::ShuttingDown, now)
    }
}
