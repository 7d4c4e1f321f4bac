// tests/integration/fixtures.rs

//! A channel-level harness around the core loop: the test plays the local
//! supervisors (ticks, authorizations, process events) and the gateway
//! worker (outbound command queue).

use std::sync::Arc;
use std::time::Duration;
use supfleet::config::NodeConfig;
use supfleet::core::clock::{Clock, ManualClock};
use supfleet::core::commander::SupervisorCommand;
use supfleet::core::context::Context;
use supfleet::core::events::EventBus;
use supfleet::core::fsm::FleetState;
use supfleet::core::mapper::AddressMapper;
use supfleet::core::process::{ProcessEvent, ProcessState};
use supfleet::core::rpc::RpcHandle;
use supfleet::core::rules::{ConciliationStrategy, RulesFile, StartStrategy};
use supfleet::core::runtime::{CoreMsg, CoreRuntime, RuntimeOptions};
use supfleet::core::supervisor::{OutboundRequest, ProcessInfo};
use tokio::sync::{broadcast, mpsc};

pub const SYNCHRO: Duration = Duration::from_secs(30);

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub bus: Arc<EventBus>,
    pub core: mpsc::Sender<CoreMsg>,
    pub rpc: RpcHandle,
    pub outbound: mpsc::Receiver<OutboundRequest>,
    pub lifecycle: broadcast::Receiver<FleetState>,
    shutdown: broadcast::Sender<()>,
}

impl Harness {
    pub async fn spawn(nodes: &[&str], rules: &str) -> Self {
        let clock = Arc::new(ManualClock::starting_at(1_000));
        let bus = Arc::new(EventBus::new());
        let node_configs: Vec<NodeConfig> = nodes
            .iter()
            .map(|name| NodeConfig {
                name: name.to_string(),
                aliases: vec![],
                supervisor: format!("{name}:60100"),
            })
            .collect();
        let ctx = Context::new(
            clock.clone(),
            bus.clone(),
            AddressMapper::new(&node_configs),
            Arc::new(RulesFile::from_toml(rules).unwrap()),
            SYNCHRO,
            false,
        );
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (runtime, core_tx) = CoreRuntime::new(
            ctx,
            clock.clone(),
            bus.clone(),
            outbound_tx,
            SYNCHRO,
            RuntimeOptions {
                local_node: nodes[0].to_string(),
                deployment_strategy: StartStrategy::Config,
                conciliation_strategy: ConciliationStrategy::Infanticide,
            },
        );
        let lifecycle = runtime.lifecycle();
        let (shutdown, _) = broadcast::channel(1);
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(runtime.run(shutdown_rx));
        let rpc = RpcHandle::new(core_tx.clone());
        Self {
            clock,
            bus,
            core: core_tx,
            rpc,
            outbound: outbound_rx,
            lifecycle,
            shutdown,
        }
    }

    pub async fn tick(&self, node: &str) {
        self.core
            .send(CoreMsg::Tick {
                address: node.to_string(),
                remote_time: self.clock.wall(),
            })
            .await
            .unwrap();
    }

    pub async fn authorize(&self, node: &str, info: Vec<ProcessInfo>) {
        self.core
            .send(CoreMsg::Authorization {
                address: node.to_string(),
                authorized: true,
                info,
            })
            .await
            .unwrap();
    }

    pub async fn process_event(&self, node: &str, group: &str, name: &str, state: ProcessState) {
        self.core
            .send(CoreMsg::Process {
                address: node.to_string(),
                event: ProcessEvent {
                    group: group.to_string(),
                    name: name.to_string(),
                    state,
                    expected: true,
                    now: self.clock.wall(),
                    spawn_error: None,
                    extra_args: None,
                },
            })
            .await
            .unwrap();
    }

    /// Waits for the next outbound supervisor command, skipping handshakes.
    pub async fn next_command(&mut self) -> SupervisorCommand {
        loop {
            let request = tokio::time::timeout(Duration::from_secs(10), self.outbound.recv())
                .await
                .expect("no outbound command within the window")
                .expect("outbound queue closed");
            match request {
                OutboundRequest::Command(command) => return command,
                OutboundRequest::Handshake { .. } => continue,
            }
        }
    }

    /// Waits for the next handshake request and returns the node.
    pub async fn next_handshake(&mut self) -> String {
        loop {
            let request = tokio::time::timeout(Duration::from_secs(10), self.outbound.recv())
                .await
                .expect("no handshake within the window")
                .expect("outbound queue closed");
            if let OutboundRequest::Handshake { node } = request {
                return node;
            }
        }
    }

    /// Brings every node to RUNNING and walks the fleet into OPERATION.
    pub async fn synchronize(&mut self, nodes: &[&str], info_on_first: Vec<ProcessInfo>) {
        for node in nodes {
            self.tick(node).await;
        }
        for _ in nodes {
            self.next_handshake().await;
        }
        let mut info = Some(info_on_first);
        for node in nodes {
            self.authorize(node, info.take().unwrap_or_default()).await;
        }
        // Step the manual clock past the synchronization window without
        // letting any node look silent.
        for _ in 0..2 {
            self.clock.advance(Duration::from_secs(16));
            for node in nodes {
                self.tick(node).await;
            }
        }
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }
}

pub fn stopped_info(group: &str, name: &str) -> ProcessInfo {
    ProcessInfo {
        group: group.to_string(),
        name: name.to_string(),
        state: ProcessState::Stopped,
        expected: true,
        start: 0,
        extra_args: None,
    }
}
