// src/core/conciliation.rs

//! Resolution of duplicate-running processes.
//!
//! A process reported RUNNING on more than one node is a conflict. The
//! reconciler runs while the fleet is in CONCILIATION and turns each
//! conflict into corrective actions according to the configured strategy.
//! Like the commander, it is side-effect free: the core loop executes the
//! actions it returns.

use crate::core::commander::{CommandKind, SupervisorCommand};
use crate::core::process::ProcessStatus;
use crate::core::rules::{ConciliationStrategy, RunningFailureStrategy};
use tracing::{info, warn};

/// Corrective steps for one round of conciliation.
#[derive(Debug, PartialEq, Eq)]
pub enum ConciliationAction {
    Issue(SupervisorCommand),
    /// Start the process again once every instance is down.
    MarkProcessRestart { application: String, process: String },
    /// Stop the whole application once the conflict is resolved.
    MarkApplicationStop { application: String },
    /// Restart the whole application once the conflict is resolved.
    MarkApplicationRestart { application: String },
}

/// Applies the strategy to every conflicting process.
pub fn conciliate(
    strategy: ConciliationStrategy,
    conflicts: &[&ProcessStatus],
) -> Vec<ConciliationAction> {
    let mut actions = Vec::new();
    for process in conflicts {
        info!(
            "Conciliating {} running on {:?} with {}",
            process.namespec(),
            process.addresses,
            strategy
        );
        match strategy {
            ConciliationStrategy::User => {}
            ConciliationStrategy::Senicide => {
                stop_all_but(process, keeper_by_start_time(process, true), &mut actions);
            }
            ConciliationStrategy::Infanticide => {
                stop_all_but(process, keeper_by_start_time(process, false), &mut actions);
            }
            ConciliationStrategy::Stop => {
                stop_all_but(process, None, &mut actions);
            }
            ConciliationStrategy::Restart => {
                stop_all_but(process, None, &mut actions);
                actions.push(ConciliationAction::MarkProcessRestart {
                    application: process.application_name.clone(),
                    process: process.process_name.clone(),
                });
            }
            ConciliationStrategy::RunningFailure => {
                stop_all_but(process, None, &mut actions);
                match process.rules.running_failure_strategy {
                    RunningFailureStrategy::Continue => {}
                    RunningFailureStrategy::RestartProcess => {
                        actions.push(ConciliationAction::MarkProcessRestart {
                            application: process.application_name.clone(),
                            process: process.process_name.clone(),
                        });
                    }
                    RunningFailureStrategy::StopApplication => {
                        actions.push(ConciliationAction::MarkApplicationStop {
                            application: process.application_name.clone(),
                        });
                    }
                    RunningFailureStrategy::RestartApplication => {
                        actions.push(ConciliationAction::MarkApplicationRestart {
                            application: process.application_name.clone(),
                        });
                    }
                }
            }
        }
    }
    actions
}

/// The node whose instance survives: earliest start time for senicide,
/// newest for infanticide. Ties fall to the lower node name.
fn keeper_by_start_time(process: &ProcessStatus, earliest: bool) -> Option<String> {
    let mut keeper: Option<(&String, u64)> = None;
    for node in &process.addresses {
        let started = process.start_times.get(node).copied().unwrap_or(0);
        keeper = match keeper {
            None => Some((node, started)),
            Some((_, best)) if earliest && started < best => Some((node, started)),
            Some((_, best)) if !earliest && started > best => Some((node, started)),
            other => other,
        };
    }
    keeper.map(|(node, _)| node.clone())
}

fn stop_all_but(
    process: &ProcessStatus,
    keeper: Option<String>,
    actions: &mut Vec<ConciliationAction>,
) {
    match &keeper {
        Some(node) => info!("Keeping {} on '{}'", process.namespec(), node),
        None => warn!("Stopping every instance of {}", process.namespec()),
    }
    for node in &process.addresses {
        if Some(node) == keeper.as_ref() {
            continue;
        }
        actions.push(ConciliationAction::Issue(SupervisorCommand {
            node: node.clone(),
            kind: CommandKind::Stop {
                namespec: process.namespec(),
            },
        }));
    }
}
