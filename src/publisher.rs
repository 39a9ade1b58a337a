// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Waitlist Publisher
//!
//! This module publishes messages to the waitlist queue through the gateway
//! exchange. The publishing channel runs in confirm mode; confirms are awaited
//! on a background task and handed to a [`ConfirmCallback`], never to the
//! caller of [`WaitlistPublisher::publish`].

use crate::{
    config::{BrokerProperties, WAITLIST_BINDING_KEY},
    connection::BrokerConnection,
    errors::GatewayError,
    otel,
};
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions},
    publisher_confirm::Confirmation,
    types::ShortString,
    BasicProperties, Channel,
};
use opentelemetry::Context;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Content type of published messages
pub const TEXT_CONTENT_TYPE: &str = "text/plain";

/// Persistent delivery mode
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Receives the broker's answer for every published message.
pub trait ConfirmCallback: Send + Sync {
    /// `reason` is set when the message was not acknowledged.
    fn on_confirm(&self, correlation_id: &str, ack: bool, reason: Option<&str>);

    /// The broker could not route the message to any queue.
    fn on_return(&self, correlation_id: &str, reply_code: u16, reply_text: &str) {
        warn!(
            correlation_id,
            reply_code, reply_text, "message returned by the broker"
        );
    }
}

/// Callback that only logs the result.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingConfirmCallback;

impl ConfirmCallback for LoggingConfirmCallback {
    fn on_confirm(&self, correlation_id: &str, ack: bool, reason: Option<&str>) {
        match reason {
            None => info!(correlation_id, ack, "received confirm with result"),
            Some(reason) => warn!(correlation_id, ack, reason, "received confirm with result"),
        }
    }
}

/// Where the publisher sends every message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTarget {
    pub exchange: String,
    pub routing_key: String,
    pub queue: String,
}

impl PublishTarget {
    /// The gateway exchange with [`WAITLIST_BINDING_KEY`]; the incoming binding
    /// keys play no part.
    pub fn waitlist(props: &BrokerProperties) -> Self {
        PublishTarget {
            exchange: props.exchange_name.clone(),
            routing_key: WAITLIST_BINDING_KEY.to_owned(),
            queue: props.waitlist_queue_name.clone(),
        }
    }
}

/// Publishes to the waitlist queue. Cheap to share between tasks.
#[derive(Clone)]
pub struct WaitlistPublisher {
    channel: Channel,
    target: PublishTarget,
    callback: Arc<dyn ConfirmCallback>,
}

impl WaitlistPublisher {
    /// Opens the publishing channel and switches it to confirm mode.
    ///
    /// # Parameters
    /// * `connection` - The shared broker connection
    /// * `target` - Exchange and routing key every message is sent with
    /// * `callback` - Receives the broker's confirm for each message
    ///
    /// # Returns
    /// * `Result<WaitlistPublisher, GatewayError>` - The publisher, or
    ///   `ChannelError`/`ConfirmSelectError`
    pub async fn new(
        connection: &BrokerConnection,
        target: PublishTarget,
        callback: Arc<dyn ConfirmCallback>,
    ) -> Result<Self, GatewayError> {
        let channel = connection.create_channel().await?;

        if let Err(err) = channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
        {
            error!(error = err.to_string(), "failure to enable publisher confirms");
            return Err(GatewayError::ConfirmSelectError(err.to_string()));
        }

        debug!(
            exchange = target.exchange,
            routing_key = target.routing_key,
            "waitlist publisher ready"
        );

        Ok(WaitlistPublisher {
            channel,
            target,
            callback,
        })
    }

    pub fn target(&self) -> &PublishTarget {
        &self.target
    }

    /// Sends `message` to the waitlist queue and returns its correlation id.
    ///
    /// Only a failure to hand the message to the channel is returned; the
    /// broker confirm arrives later on the [`ConfirmCallback`].
    ///
    /// # Parameters
    /// * `message` - Sent as UTF-8 `text/plain`, persistent
    ///
    /// # Returns
    /// * `Result<String, GatewayError>` - The correlation id, or `PublishingError`
    pub async fn publish(&self, message: &str) -> Result<String, GatewayError> {
        debug!("publishing message to message bus...");

        let correlation_id = Uuid::new_v4().to_string();
        let properties = message_properties(&correlation_id, &Context::current());

        let confirm = match self
            .channel
            .basic_publish(
                &self.target.exchange,
                &self.target.routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    immediate: false,
                },
                message.as_bytes(),
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(GatewayError::PublishingError(err.to_string()))
            }
            Ok(confirm) => Ok(confirm),
        }?;

        let callback = self.callback.clone();
        let id = correlation_id.clone();
        tokio::spawn(async move {
            report_confirmation(&id, confirm.await, callback.as_ref());
        });

        Ok(correlation_id)
    }
}

fn message_properties(correlation_id: &str, ctx: &Context) -> BasicProperties {
    BasicProperties::default()
        .with_content_type(ShortString::from(TEXT_CONTENT_TYPE))
        .with_content_encoding(ShortString::from("UTF-8"))
        .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
        .with_message_id(ShortString::from(correlation_id))
        .with_correlation_id(ShortString::from(correlation_id))
        .with_headers(otel::inject(ctx))
}

/// Forwards one broker confirm to the callback.
pub(crate) fn report_confirmation(
    correlation_id: &str,
    result: Result<Confirmation, lapin::Error>,
    callback: &dyn ConfirmCallback,
) {
    match result {
        Ok(Confirmation::Ack(returned)) => {
            if let Some(returned) = returned {
                callback.on_return(
                    correlation_id,
                    returned.reply_code,
                    returned.reply_text.as_str(),
                );
            }
            callback.on_confirm(correlation_id, true, None);
        }
        Ok(Confirmation::Nack(returned)) => {
            if let Some(returned) = returned {
                callback.on_return(
                    correlation_id,
                    returned.reply_code,
                    returned.reply_text.as_str(),
                );
            }
            callback.on_confirm(correlation_id, false, Some("nacked by broker"));
        }
        Ok(Confirmation::NotRequested) => {
            callback.on_confirm(correlation_id, false, Some("confirms not enabled"))
        }
        Err(err) => callback.on_confirm(correlation_id, false, Some(&err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        confirms: Mutex<Vec<(String, bool, Option<String>)>>,
    }

    impl ConfirmCallback for Recorder {
        fn on_confirm(&self, correlation_id: &str, ack: bool, reason: Option<&str>) {
            self.confirms.lock().unwrap().push((
                correlation_id.to_owned(),
                ack,
                reason.map(str::to_owned),
            ));
        }
    }

    fn props(binding_keys: &str) -> BrokerProperties {
        BrokerProperties::from_json(&format!(
            r#"{{"host": "mq", "exchangeName": "events", "queueName": "incoming",
                "waitlistQueueName": "waitlist", "bindingKeys": "{binding_keys}"}}"#
        ))
        .unwrap()
    }

    #[test]
    fn target_ignores_incoming_bindings() {
        let expected = PublishTarget {
            exchange: "events".to_owned(),
            routing_key: WAITLIST_BINDING_KEY.to_owned(),
            queue: "waitlist".to_owned(),
        };

        assert_eq!(PublishTarget::waitlist(&props("a.*")), expected);
        assert_eq!(PublishTarget::waitlist(&props("#, x.y, z.*")), expected);
    }

    #[test]
    fn properties_carry_correlation_id() {
        let props = message_properties("abc", &Context::new());

        assert_eq!(props.correlation_id().as_ref().map(|v| v.as_str()), Some("abc"));
        assert_eq!(props.message_id().as_ref().map(|v| v.as_str()), Some("abc"));
        assert_eq!(props.delivery_mode(), &Some(DELIVERY_MODE_PERSISTENT));
        assert_eq!(
            props.content_type().as_ref().map(|v| v.as_str()),
            Some(TEXT_CONTENT_TYPE)
        );
    }

    #[test]
    fn ack_is_reported_without_reason() {
        let recorder = Recorder::default();
        report_confirmation("1", Ok(Confirmation::Ack(None)), &recorder);

        assert_eq!(
            *recorder.confirms.lock().unwrap(),
            vec![("1".to_owned(), true, None)]
        );
    }

    #[test]
    fn nack_and_errors_are_reported_not_raised() {
        let recorder = Recorder::default();
        report_confirmation("1", Ok(Confirmation::Nack(None)), &recorder);
        report_confirmation(
            "2",
            Err(lapin::Error::ChannelsLimitReached),
            &recorder,
        );

        let confirms = recorder.confirms.lock().unwrap();
        assert_eq!(confirms.len(), 2);
        assert!(confirms.iter().all(|(_, ack, reason)| !ack && reason.is_some()));
        assert_eq!(confirms[1].0, "2");
    }
}
