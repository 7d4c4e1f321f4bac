// src/core/supervisor.rs

//! The interface to the local per-node process supervisors.
//!
//! The control plane consumes each node's supervisor through the
//! `SupervisorGateway` trait: start/stop a process, fetch the process
//! snapshot, and answer the authorization handshake. A worker task drains
//! the outbound command queue off the core loop and folds downstream
//! failures back into the view as synthetic FATAL events.

use crate::core::commander::{CommandKind, SupervisorCommand};
use crate::core::process::{ProcessEvent, ProcessState};
use crate::core::runtime::CoreMsg;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// One process entry of a node's full snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub group: String,
    pub name: String,
    pub state: ProcessState,
    pub expected: bool,
    /// Wall-clock second the process entered its current run, 0 if stopped.
    pub start: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_args: Option<String>,
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("node '{0}' unreachable: {1}")]
    Unreachable(String, String),
    #[error("node '{0}' refused: {1}")]
    Refused(String, String),
}

/// RPC surface of one local supervisor, as consumed by the control plane.
#[async_trait]
pub trait SupervisorGateway: Send + Sync {
    /// Asks the node whether this fleet daemon is welcome there.
    async fn check_authorization(&self, node: &str) -> Result<bool, GatewayError>;

    /// Full process snapshot of the node.
    async fn all_process_info(&self, node: &str) -> Result<Vec<ProcessInfo>, GatewayError>;

    async fn start_process(
        &self,
        node: &str,
        namespec: &str,
        extra_args: &str,
    ) -> Result<(), GatewayError>;

    async fn stop_process(&self, node: &str, namespec: &str) -> Result<(), GatewayError>;
}

/// Work items drained by the gateway worker.
#[derive(Debug)]
pub enum OutboundRequest {
    /// A start/stop command produced by the commander.
    Command(SupervisorCommand),
    /// The CHECKING handshake of a node: authorization + process snapshot.
    Handshake { node: String },
}

/// Executes outbound requests against the gateway, off the core loop, and
/// reports outcomes back through the core inbox.
pub struct GatewayWorker {
    gateway: Arc<dyn SupervisorGateway>,
    requests: mpsc::Receiver<OutboundRequest>,
    core: mpsc::Sender<CoreMsg>,
}

impl GatewayWorker {
    pub fn new(
        gateway: Arc<dyn SupervisorGateway>,
        requests: mpsc::Receiver<OutboundRequest>,
        core: mpsc::Sender<CoreMsg>,
    ) -> Self {
        Self {
            gateway,
            requests,
            core,
        }
    }

    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Supervisor gateway worker started");
        loop {
            tokio::select! {
                request = self.requests.recv() => {
                    match request {
                        Some(request) => self.handle(request).await,
                        None => break,
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        debug!("Supervisor gateway worker stopped");
    }

    async fn handle(&self, request: OutboundRequest) {
        match request {
            OutboundRequest::Handshake { node } => {
                let authorized = match self.gateway.check_authorization(&node).await {
                    Ok(authorized) => authorized,
                    Err(e) => {
                        warn!("Authorization handshake with '{}' failed: {}", node, e);
                        return;
                    }
                };
                let info = if authorized {
                    match self.gateway.all_process_info(&node).await {
                        Ok(info) => info,
                        Err(e) => {
                            warn!("Process snapshot from '{}' failed: {}", node, e);
                            vec![]
                        }
                    }
                } else {
                    vec![]
                };
                let _ = self
                    .core
                    .send(CoreMsg::Authorization {
                        address: node,
                        authorized,
                        info,
                    })
                    .await;
            }
            OutboundRequest::Command(command) => {
                let result = match &command.kind {
                    CommandKind::Start {
                        namespec,
                        extra_args,
                    } => {
                        self.gateway
                            .start_process(&command.node, namespec, extra_args)
                            .await
                    }
                    CommandKind::Stop { namespec } => {
                        self.gateway.stop_process(&command.node, namespec).await
                    }
                };
                if let Err(e) = result {
                    warn!("Command on '{}' failed: {}", command.node, e);
                    self.report_fatal(&command, e.to_string()).await;
                }
            }
        }
    }

    /// A downstream RPC failure surfaces as a synthetic FATAL event so the
    /// planners observe it like any other state change.
    async fn report_fatal(&self, command: &SupervisorCommand, message: String) {
        let namespec = match &command.kind {
            CommandKind::Start { namespec, .. } | CommandKind::Stop { namespec } => namespec,
        };
        let Some((group, name)) = namespec.split_once(':') else {
            return;
        };
        let event = ProcessEvent {
            group: group.to_string(),
            name: name.to_string(),
            state: ProcessState::Fatal,
            expected: false,
            now: 0,
            spawn_error: Some(message),
            extra_args: None,
        };
        let _ = self
            .core
            .send(CoreMsg::Process {
                address: command.node.clone(),
                event,
            })
            .await;
    }
}

/// Line-JSON TCP client for the local supervisors, one short-lived
/// connection per request.
#[derive(Debug)]
pub struct TcpSupervisorGateway {
    /// Canonical node name to `host:port` of its supervisor endpoint.
    endpoints: HashMap<String, String>,
    /// Name this daemon announces during the handshake.
    local_name: String,
}

impl TcpSupervisorGateway {
    pub fn new(endpoints: HashMap<String, String>, local_name: String) -> Self {
        Self {
            endpoints,
            local_name,
        }
    }

    async fn call(
        &self,
        node: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError> {
        let endpoint = self
            .endpoints
            .get(node)
            .ok_or_else(|| GatewayError::Unreachable(node.to_string(), "no endpoint".into()))?;
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(endpoint.as_str()))
            .await
            .map_err(|_| GatewayError::Unreachable(node.to_string(), "connect timeout".into()))?
            .map_err(|e| GatewayError::Unreachable(node.to_string(), e.to_string()))?;
        let (read_half, mut write_half) = stream.into_split();

        let mut line = serde_json::to_string(&payload)
            .map_err(|e| GatewayError::Refused(node.to_string(), e.to_string()))?;
        line.push('\n');
        write_half
            .write_all(line.as_bytes())
            .await
            .map_err(|e| GatewayError::Unreachable(node.to_string(), e.to_string()))?;

        let mut reader = BufReader::new(read_half);
        let mut reply = String::new();
        tokio::time::timeout(READ_TIMEOUT, reader.read_line(&mut reply))
            .await
            .map_err(|_| GatewayError::Unreachable(node.to_string(), "read timeout".into()))?
            .map_err(|e| GatewayError::Unreachable(node.to_string(), e.to_string()))?;

        let value: serde_json::Value = serde_json::from_str(reply.trim())
            .map_err(|e| GatewayError::Refused(node.to_string(), e.to_string()))?;
        if value.get("ok").and_then(|v| v.as_bool()) == Some(true) {
            Ok(value.get("result").cloned().unwrap_or(serde_json::Value::Null))
        } else {
            let message = value
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error")
                .to_string();
            Err(GatewayError::Refused(node.to_string(), message))
        }
    }
}

#[async_trait]
impl SupervisorGateway for TcpSupervisorGateway {
    async fn check_authorization(&self, node: &str) -> Result<bool, GatewayError> {
        let result = self
            .call(
                node,
                json!({"method": "authorization", "params": {"from": self.local_name}}),
            )
            .await?;
        Ok(result.as_bool().unwrap_or(false))
    }

    async fn all_process_info(&self, node: &str) -> Result<Vec<ProcessInfo>, GatewayError> {
        let result = self
            .call(node, json!({"method": "all_process_info", "params": {}}))
            .await?;
        serde_json::from_value(result)
            .map_err(|e| GatewayError::Refused(node.to_string(), e.to_string()))
    }

    async fn start_process(
        &self,
        node: &str,
        namespec: &str,
        extra_args: &str,
    ) -> Result<(), GatewayError> {
        self.call(
            node,
            json!({
                "method": "start_process",
                "params": {"namespec": namespec, "extra_args": extra_args, "wait": false},
            }),
        )
        .await
        .map(|_| ())
    }

    async fn stop_process(&self, node: &str, namespec: &str) -> Result<(), GatewayError> {
        self.call(
            node,
            json!({
                "method": "stop_process",
                "params": {"namespec": namespec, "wait": false},
            }),
        )
        .await
        .map(|_| ())
    }
}
