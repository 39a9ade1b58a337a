// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use async_trait::async_trait;
use broker_gateway::{
    Acknowledgement, BrokerProperties, GatewayBuilder, InboundMessage, MessageHandler,
};
use opentelemetry::Context;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Logs every delivery and acknowledges it; undecodable payloads are rejected.
struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, _ctx: &Context, message: &InboundMessage) -> Acknowledgement {
        match message.payload() {
            Ok(payload) => {
                info!(
                    queue = message.queue,
                    routing_key = message.routing_key,
                    payload,
                    "message received"
                );
                Acknowledgement::Ack
            }
            Err(err) => {
                warn!(error = err.to_string(), queue = message.queue, "non utf-8 payload");
                Acknowledgement::Reject
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "broker gateway starting");

    let props = BrokerProperties::from_env()?;
    let gateway = GatewayBuilder::new(props)
        .handler(Arc::new(LoggingHandler))
        .connect()
        .await?;

    info!(status = ?gateway.status(), "waiting for messages, ctrl-c to stop");

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = err.to_string(), "failure to listen for shutdown signal");
    }

    let report = gateway.close().await;
    if !report.is_clean() {
        warn!(failures = ?report.failures, "shutdown finished with errors");
    }

    Ok(())
}
