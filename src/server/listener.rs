// src/server/listener.rs

//! TCP listeners: the internal event stream pushed by local supervisors and
//! peer daemons, and the request/reply RPC surface. Both speak line-framed
//! JSON.

use crate::core::errors::SupfleetError;
use crate::core::process::ProcessEvent;
use crate::core::rpc::{DeferredPoll, RpcHandle, RpcOutcome, RpcRequest};
use crate::core::runtime::CoreMsg;
use anyhow::Result;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

/// One inbound line on the internal event stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundEvent {
    Tick {
        address: String,
        remote_time: u64,
    },
    Process {
        address: String,
        #[serde(flatten)]
        event: ProcessEvent,
    },
}

/// Accepts connections from local supervisors and peers pushing ticks and
/// process events.
pub async fn run_event_listener(
    port: u16,
    core: mpsc::Sender<CoreMsg>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!("Event listener on port {}", port);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, addr)) => {
                        debug!("Accepted event stream from {}", addr);
                        let core = core.clone();
                        tokio::spawn(async move {
                            if let Err(e) = pump_events(socket, core).await {
                                warn!("Event stream from {} ended: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => warn!("Failed to accept event stream: {}", e),
                }
            }
            _ = shutdown_rx.recv() => return Ok(()),
        }
    }
}

async fn pump_events(socket: TcpStream, core: mpsc::Sender<CoreMsg>) -> Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new());
    while let Some(line) = framed.next().await {
        let line = line?;
        let event: InboundEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!("Dropping malformed event line: {}", e);
                continue;
            }
        };
        let message = match event {
            InboundEvent::Tick {
                address,
                remote_time,
            } => CoreMsg::Tick {
                address,
                remote_time,
            },
            InboundEvent::Process { address, event } => CoreMsg::Process { address, event },
        };
        if core.send(message).await.is_err() {
            break;
        }
    }
    Ok(())
}

/// Accepts RPC connections: one JSON request per line, one JSON reply per
/// line.
pub async fn run_rpc_listener(
    port: u16,
    handle: RpcHandle,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!("RPC listener on port {}", port);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, addr)) => {
                        debug!("Accepted RPC connection from {}", addr);
                        let handle = handle.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_rpc(socket, handle).await {
                                warn!("RPC connection from {} ended: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => warn!("Failed to accept RPC connection: {}", e),
                }
            }
            _ = shutdown_rx.recv() => return Ok(()),
        }
    }
}

async fn serve_rpc(socket: TcpStream, handle: RpcHandle) -> Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new());
    while let Some(line) = framed.next().await {
        let line = line?;
        let reply = process_rpc_line(&line, &handle).await;
        framed.send(reply.to_string()).await?;
    }
    Ok(())
}

/// Parses one request line, runs it, and shapes the wire reply:
/// `{"ok": true, "result": ...}` or `{"ok": false, "code": N, "error": ...}`.
async fn process_rpc_line(line: &str, handle: &RpcHandle) -> Value {
    let parsed: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => return fault_reply(&SupfleetError::Internal(format!("bad request: {e}"))),
    };
    let method = parsed.get("method").and_then(Value::as_str).unwrap_or("");
    let params = parsed.get("params").cloned().unwrap_or(json!({}));
    let wait = params.get("wait").and_then(Value::as_bool).unwrap_or(true);

    let request = match build_request(method, &params) {
        Ok(request) => request,
        Err(e) => return fault_reply(&e),
    };
    match handle.request(request).await {
        Ok(RpcOutcome::Value(value)) => json!({"ok": true, "result": value}),
        Ok(RpcOutcome::Deferred(mut deferred)) => {
            if wait {
                match deferred.wait().await {
                    Ok(done) => json!({"ok": true, "result": done}),
                    Err(e) => fault_reply(&e),
                }
            } else {
                // Deferred handles stay server-side; the caller polls the
                // state RPCs instead.
                match deferred.poll() {
                    Ok(DeferredPoll::Done(done)) => json!({"ok": true, "result": done}),
                    Ok(DeferredPoll::Pending) => json!({"ok": true, "result": "NOT_DONE_YET"}),
                    Err(e) => fault_reply(&e),
                }
            }
        }
        Err(e) => fault_reply(&e),
    }
}

fn fault_reply(error: &SupfleetError) -> Value {
    json!({"ok": false, "code": error.code(), "error": error.to_string()})
}

fn param_str(params: &Value, key: &str) -> String {
    params
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

fn build_request(method: &str, params: &Value) -> Result<RpcRequest, SupfleetError> {
    let request = match method {
        "get_api_version" => RpcRequest::GetApiVersion,
        "get_fleet_state" => RpcRequest::GetFleetState,
        "get_master_address" => RpcRequest::GetMasterAddress,
        "get_all_addresses_info" => RpcRequest::GetAllAddressesInfo,
        "get_address_info" => RpcRequest::GetAddressInfo {
            name: param_str(params, "name"),
        },
        "get_all_applications_info" => RpcRequest::GetAllApplicationsInfo,
        "get_application_info" => RpcRequest::GetApplicationInfo {
            name: param_str(params, "name"),
        },
        "get_all_process_info" => RpcRequest::GetAllProcessInfo,
        "get_process_info" => RpcRequest::GetProcessInfo {
            namespec: param_str(params, "namespec"),
        },
        "get_process_rules" => RpcRequest::GetProcessRules {
            namespec: param_str(params, "namespec"),
        },
        "get_conflicts" => RpcRequest::GetConflicts,
        "start_application" => RpcRequest::StartApplication {
            strategy: param_str(params, "strategy"),
            name: param_str(params, "name"),
        },
        "stop_application" => RpcRequest::StopApplication {
            name: param_str(params, "name"),
        },
        "restart_application" => RpcRequest::RestartApplication {
            strategy: param_str(params, "strategy"),
            name: param_str(params, "name"),
        },
        "start_args" => RpcRequest::StartArgs {
            namespec: param_str(params, "namespec"),
            extra_args: param_str(params, "extra_args"),
        },
        "start_process" => RpcRequest::StartProcess {
            strategy: param_str(params, "strategy"),
            namespec: param_str(params, "namespec"),
            extra_args: param_str(params, "extra_args"),
        },
        "stop_process" => RpcRequest::StopProcess {
            namespec: param_str(params, "namespec"),
        },
        "restart_process" => RpcRequest::RestartProcess {
            strategy: param_str(params, "strategy"),
            namespec: param_str(params, "namespec"),
            extra_args: param_str(params, "extra_args"),
        },
        "restart" => RpcRequest::Restart,
        "shutdown" => RpcRequest::Shutdown,
        other => return Err(SupfleetError::UnknownMethod(other.to_string())),
    };
    Ok(request)
}
