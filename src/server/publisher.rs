// src/server/publisher.rs

//! Forwards the event bus to TCP subscribers as line-framed JSON.
//!
//! Each subscriber gets every topic. A subscriber that cannot keep up is
//! disconnected rather than allowed to hold the bus back.

use crate::core::events::{EventBus, EventTopic, FleetEvent};
use anyhow::Result;
use futures::SinkExt;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

pub async fn run(
    port: u16,
    bus: Arc<EventBus>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!("Event publisher on port {}", port);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, addr)) => {
                        debug!("Event subscriber connected from {}", addr);
                        let bus = bus.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_subscriber(socket, bus).await {
                                debug!("Event subscriber {} gone: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => warn!("Failed to accept event subscriber: {}", e),
                }
            }
            _ = shutdown_rx.recv() => return Ok(()),
        }
    }
}

async fn serve_subscriber(socket: TcpStream, bus: Arc<EventBus>) -> Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new());
    let mut fleet = bus.subscribe(EventTopic::Fleet);
    let mut address = bus.subscribe(EventTopic::Address);
    let mut application = bus.subscribe(EventTopic::Application);
    let mut process = bus.subscribe(EventTopic::Process);
    loop {
        let received = tokio::select! {
            event = fleet.recv() => event,
            event = address.recv() => event,
            event = application.recv() => event,
            event = process.recv() => event,
        };
        match received {
            Ok(event) => forward(&mut framed, event).await?,
            Err(RecvError::Lagged(missed)) => {
                // Dropping deltas silently would leave the subscriber with
                // a stale view it cannot detect.
                warn!("Event subscriber lagged by {} messages, closing", missed);
                return Ok(());
            }
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}

async fn forward(
    framed: &mut Framed<TcpStream, LinesCodec>,
    event: FleetEvent,
) -> Result<()> {
    let line = serde_json::json!({
        "topic": event.topic.to_string(),
        "payload": event.payload,
    });
    framed.send(line.to_string()).await?;
    Ok(())
}
