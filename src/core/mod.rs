// src/core/mod.rs

//! The central module containing the coordination logic of Supfleet.

pub mod address;
pub mod application;
pub mod clock;
pub mod commander;
pub mod conciliation;
pub mod context;
pub mod errors;
pub mod events;
pub mod fsm;
pub mod mapper;
pub mod process;
pub mod rpc;
pub mod rules;
pub mod runtime;
pub mod strategy;
pub mod supervisor;

pub use errors::SupfleetError;
pub use fsm::FleetState;
