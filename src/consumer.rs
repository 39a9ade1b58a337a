// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Handling
//!
//! This module turns a single broker delivery into an [`InboundMessage`],
//! hands it to the registered [`MessageHandler`] and settles it with whatever
//! the handler decided. Nothing is acknowledged automatically: a delivery whose
//! handler never returns stays unacknowledged and is redelivered by the broker
//! once the channel goes away.

use crate::{errors::GatewayError, otel};
use async_trait::async_trait;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions, BasicRejectOptions},
    protocol::basic::AMQPProperties,
};
#[cfg(test)]
use mockall::automock;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
    Context,
};
use std::{borrow::Cow, str::Utf8Error};
use tracing::{debug, error, warn};

/// How a delivery should be settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    Ack,
    Nack { requeue: bool },
    /// Discards the message, or dead-letters it if the queue is set up for it
    Reject,
}

/// A message as seen by the application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundMessage {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub correlation_id: Option<String>,
    pub data: Vec<u8>,
}

impl InboundMessage {
    pub(crate) fn from_delivery(queue: &str, delivery: &Delivery) -> Self {
        InboundMessage {
            queue: queue.to_owned(),
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            correlation_id: delivery
                .properties
                .correlation_id()
                .as_ref()
                .map(|id| id.to_string()),
            data: delivery.data.clone(),
        }
    }

    /// The body as text; fails when it is not valid UTF-8.
    pub fn payload(&self) -> Result<&str, Utf8Error> {
        std::str::from_utf8(&self.data)
    }
}

/// A delivery split into what the handler sees and what settles it.
pub(crate) struct Delivered<S> {
    pub(crate) properties: AMQPProperties,
    pub(crate) message: InboundMessage,
    pub(crate) settler: S,
}

impl Delivered<Acker> {
    pub(crate) fn from_delivery(queue: &str, delivery: Delivery) -> Self {
        let message = InboundMessage::from_delivery(queue, &delivery);
        Delivered {
            properties: delivery.properties,
            message,
            settler: delivery.acker,
        }
    }
}

/// The application side of the consumer container.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: &Context, message: &InboundMessage) -> Acknowledgement;
}

/// Settles one delivery at the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Settle: Send + Sync {
    async fn settle(&self, outcome: Acknowledgement) -> Result<(), GatewayError>;
}

#[async_trait]
impl Settle for Acker {
    async fn settle(&self, outcome: Acknowledgement) -> Result<(), GatewayError> {
        match outcome {
            Acknowledgement::Ack => self
                .ack(BasicAckOptions { multiple: false })
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error whiling ack msg");
                    GatewayError::AckMessageError
                }),
            Acknowledgement::Nack { requeue } => self
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue,
                })
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error whiling nack msg");
                    GatewayError::NackMessageError
                }),
            Acknowledgement::Reject => self
                .reject(BasicRejectOptions { requeue: false })
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error whiling reject msg");
                    GatewayError::RejectMessageError
                }),
        }
    }
}

/// Runs the handler for one message and settles it.
///
/// The handler's decision is returned even though it has already been applied,
/// so callers can log it.
///
/// # Parameters
/// * `tracer` - Tracer for the consumer span
/// * `props` - Delivery properties carrying the trace headers
/// * `message` - What the handler gets to see
/// * `handler` - The application handler
/// * `settler` - Applies the handler's decision at the broker
///
/// # Returns
/// * `Result<Acknowledgement, GatewayError>` - The applied decision, or the
///   settle error
pub(crate) async fn consume<S>(
    tracer: &BoxedTracer,
    props: &AMQPProperties,
    message: InboundMessage,
    handler: &dyn MessageHandler,
    settler: &S,
) -> Result<Acknowledgement, GatewayError>
where
    S: Settle + ?Sized,
{
    let (ctx, mut span) = otel::consumer_span(props, tracer, &message.queue);

    debug!(
        queue = message.queue,
        routing_key = message.routing_key,
        delivery_tag = message.delivery_tag,
        redelivered = message.redelivered,
        "received message"
    );

    let outcome = handler.handle(&ctx, &message).await;
    match outcome {
        Acknowledgement::Ack => debug!("message successfully processed"),
        Acknowledgement::Nack { requeue } => {
            warn!(requeue, queue = message.queue, "handler refused message")
        }
        Acknowledgement::Reject => warn!(queue = message.queue, "handler rejected message"),
    }

    match settler.settle(outcome).await {
        Ok(()) => {
            span.set_status(Status::Ok);
            span.end();
            Ok(outcome)
        }
        Err(err) => {
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error to settle msg"),
            });
            span.end();
            Err(err)
        }
    }
}
