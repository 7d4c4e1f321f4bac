// src/server/mod.rs

//! Server wiring: builds the core loop and its collaborators from the
//! configuration, spawns the listeners and the event publisher, and waits
//! for a lifecycle exit.

use crate::config::Config;
use crate::core::clock::{Clock, SystemClock};
use crate::core::context::Context;
use crate::core::events::EventBus;
use crate::core::fsm::FleetState;
use crate::core::mapper::AddressMapper;
use crate::core::rpc::RpcHandle;
use crate::core::rules::RulesFile;
use crate::core::runtime::{CoreRuntime, RuntimeOptions};
use crate::core::supervisor::{GatewayWorker, TcpSupervisorGateway};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

mod listener;
mod publisher;

/// Capacity of the outbound supervisor command queue.
const OUTBOUND_CAPACITY: usize = 1024;

/// The main daemon startup function.
pub async fn run(config: Config) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let bus = Arc::new(EventBus::new());
    let mapper = AddressMapper::new(&config.nodes);
    let rules = Arc::new(match &config.rules_file {
        Some(path) => RulesFile::from_file(path)?,
        None => RulesFile::default(),
    });

    let ctx = Context::new(
        clock.clone(),
        bus.clone(),
        mapper,
        rules,
        config.synchro_timeout,
        config.auto_fence,
    );

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let (runtime, core_tx) = CoreRuntime::new(
        ctx,
        clock,
        bus.clone(),
        outbound_tx,
        config.synchro_timeout,
        RuntimeOptions {
            local_node: config.node_name.clone(),
            deployment_strategy: config.deployment_strategy,
            conciliation_strategy: config.conciliation_strategy,
        },
    );
    let mut lifecycle_rx = runtime.lifecycle();

    let endpoints: HashMap<String, String> = config
        .nodes
        .iter()
        .map(|n| (n.name.clone(), n.supervisor.clone()))
        .collect();
    let gateway = Arc::new(TcpSupervisorGateway::new(endpoints, config.node_name.clone()));

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    let worker = GatewayWorker::new(gateway, outbound_rx, core_tx.clone());
    let worker_shutdown = shutdown_tx.subscribe();
    tasks.spawn(async move {
        worker.run(worker_shutdown).await;
        Ok(())
    });

    let runtime_shutdown = shutdown_tx.subscribe();
    tasks.spawn(async move {
        runtime.run(runtime_shutdown).await;
        Ok(())
    });

    let rpc_handle = RpcHandle::new(core_tx.clone());
    tasks.spawn(listener::run_event_listener(
        config.internal_port,
        core_tx.clone(),
        shutdown_tx.subscribe(),
    ));
    tasks.spawn(listener::run_rpc_listener(
        config.rpc_port,
        rpc_handle,
        shutdown_tx.subscribe(),
    ));
    tasks.spawn(publisher::run(
        config.event_port,
        bus,
        shutdown_tx.subscribe(),
    ));

    // Run until the fleet lifecycle asks for an exit, a task dies, or the
    // operator interrupts.
    let exit: Result<()> = tokio::select! {
        lifecycle = lifecycle_rx.recv() => {
            match lifecycle {
                Ok(FleetState::Restarting) => {
                    info!("Fleet requested a restart, exiting for the process manager");
                    Ok(())
                }
                Ok(state) => {
                    info!("Fleet lifecycle reached {}, shutting down", state);
                    Ok(())
                }
                Err(_) => Ok(()),
            }
        }
        result = tasks.join_next() => {
            match result {
                Some(Ok(Ok(()))) => {
                    warn!("A server task completed unexpectedly");
                    Ok(())
                }
                Some(Ok(Err(e))) => {
                    error!("A server task failed: {}", e);
                    Err(e)
                }
                Some(Err(e)) => {
                    error!("A server task panicked: {}", e);
                    Err(e.into())
                }
                None => Ok(()),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            Ok(())
        }
    };

    let _ = shutdown_tx.send(());
    tasks.shutdown().await;
    exit
}
