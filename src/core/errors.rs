// src/core/errors.rs

//! Defines the primary error type for the entire application.

use thiserror::Error;

/// The main error enum, representing all possible failures within the control plane.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum SupfleetError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Rules Error: {0}")]
    Rules(String),

    // --- Wire-level faults returned to RPC callers ---
    #[error("BAD_ADDRESS: unknown node '{0}'")]
    BadAddress(String),

    #[error("BAD_NAME: unknown application or process '{0}'")]
    BadName(String),

    #[error("BAD_STRATEGY: unknown strategy '{0}'")]
    BadStrategy(String),

    #[error("BAD_FLEET_STATE: command not allowed in state {0}")]
    BadFleetState(String),

    #[error("BAD_EXTRA_ARGUMENTS: {0}")]
    BadExtraArguments(String),

    #[error("ALREADY_STARTED: {0}")]
    AlreadyStarted(String),

    #[error("NOT_RUNNING: {0}")]
    NotRunning(String),

    #[error("ABNORMAL_TERMINATION: {0}")]
    AbnormalTermination(String),

    #[error("ALREADY_IN_PROGRESS: a command is already in progress for {0}")]
    AlreadyInProgress(String),

    // --- Internal categories, never surfaced as wire faults ---
    #[error("Unknown RPC method '{0}'")]
    UnknownMethod(String),

    #[error("Core loop unavailable: {0}")]
    CoreUnavailable(String),

    #[error("Internal Error: {0}")]
    Internal(String),
}

impl SupfleetError {
    /// The numeric fault code carried on the wire for RPC callers.
    /// Internal categories share the generic failure slot.
    pub fn code(&self) -> u16 {
        match self {
            SupfleetError::BadName(_) => 10,
            SupfleetError::AbnormalTermination(_) => 40,
            SupfleetError::AlreadyStarted(_) => 60,
            SupfleetError::NotRunning(_) => 70,
            SupfleetError::BadFleetState(_) => 101,
            SupfleetError::BadAddress(_) => 102,
            SupfleetError::BadStrategy(_) => 103,
            SupfleetError::BadExtraArguments(_) => 104,
            SupfleetError::AlreadyInProgress(_) => 105,
            _ => 1,
        }
    }

    /// Whether the error is an input or precondition fault, reported to the
    /// caller without being logged as a cluster fault.
    pub fn is_caller_fault(&self) -> bool {
        !matches!(
            self,
            SupfleetError::Io(_)
                | SupfleetError::Config(_)
                | SupfleetError::Rules(_)
                | SupfleetError::CoreUnavailable(_)
                | SupfleetError::Internal(_)
        )
    }
}
