// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Broker Gateway
//!
//! This module provides the error type shared by every gateway component.
//! The `GatewayError` enum covers configuration loading, connection and channel
//! creation, topology declaration, consuming, publishing and shutdown.

use thiserror::Error;

/// Represents errors that can occur while wiring the application to the broker.
///
/// Lapin errors are logged where they happen and mapped onto one of these
/// variants, so callers only ever match on gateway-level failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// A required configuration property is missing or empty
    #[error("missing configuration property `{0}`")]
    MissingProperty(String),

    /// A configuration property could not be parsed or is out of range
    #[error("invalid value `{value}` for configuration property `{name}`")]
    InvalidProperty { name: String, value: String },

    /// The binding-key list contains an empty entry
    #[error("empty binding key at position {position} in `{keys}`")]
    EmptyBindingKey { keys: String, position: usize },

    /// The TLS settings could not be applied
    #[error("failure to configure tls `{0}`")]
    TlsConfigError(String),

    /// No message handler was registered before connecting
    #[error("no message handler registered")]
    MissingHandler,

    /// Error establishing a connection to the broker
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error enabling publisher confirms on the publishing channel
    #[error("failure to enable publisher confirms `{0}`")]
    ConfirmSelectError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// In-flight deliveries did not drain before the shutdown timeout
    #[error("in-flight deliveries did not drain within {0} ms")]
    ShutdownTimeout(u64),

    /// Error closing a channel or the connection
    #[error("failure to close `{0}`")]
    CloseError(String),
}
