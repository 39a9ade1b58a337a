// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connection Management
//!
//! This module opens the single connection shared by the topology declarator,
//! the consumer container and the publisher. Each of them creates its own
//! channel from it.
//!
//! The client never reconnects on its own. Errors raised by the connection
//! after it was established are forwarded to a [`ConnectionListener`], which is
//! where the hosting application decides on recovery.

use crate::{
    config::{BrokerProperties, TlsVersion},
    errors::GatewayError,
    shutdown::Shutdown,
};
use async_trait::async_trait;
use lapin::{
    tcp::OwnedTLSConfig,
    types::LongString,
    uri::{AMQPAuthority, AMQPScheme, AMQPUri, AMQPUserInfo},
    Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Outcome of applying the configured TLS settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsStatus {
    /// No TLS version was configured
    Disabled,
    /// The connection uses `amqps`
    Enabled(TlsVersion),
    /// TLS was requested but could not be configured; the connection is plain
    Degraded { requested: String, reason: String },
}

impl TlsStatus {
    pub fn is_enabled(&self) -> bool {
        matches!(self, TlsStatus::Enabled(_))
    }
}

/// Receives connection lifecycle events.
pub trait ConnectionListener: Send + Sync {
    fn on_connected(&self, name: &str);

    /// Called by the client when an established connection fails.
    fn on_connection_error(&self, name: &str, error: &lapin::Error);

    fn on_closed(&self, name: &str);
}

/// Listener that only records the events in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingConnectionListener;

impl ConnectionListener for LoggingConnectionListener {
    fn on_connected(&self, name: &str) {
        info!(connection = name, "connected to broker");
    }

    fn on_connection_error(&self, name: &str, error: &lapin::Error) {
        error!(
            connection = name,
            error = error.to_string(),
            "broker connection lost"
        );
    }

    fn on_closed(&self, name: &str) {
        info!(connection = name, "broker connection closed");
    }
}

/// The shared, long-lived connection to the broker.
#[derive(Clone)]
pub struct BrokerConnection {
    name: String,
    connection: Arc<Connection>,
    tls: TlsStatus,
    listener: Arc<dyn ConnectionListener>,
}

impl BrokerConnection {
    /// Connects to the broker described by `props`.
    ///
    /// TLS problems never fail this call; they downgrade the connection to
    /// plain AMQP and are reported through [`BrokerConnection::tls_status`].
    /// Unreachable brokers and refused credentials are returned as
    /// [`GatewayError::ConnectionError`] without retrying.
    ///
    /// # Parameters
    /// * `props` - Host, port, credentials, vhost, TLS settings and connection name
    /// * `listener` - Receives the connect, failure and close events
    pub async fn connect(
        props: &BrokerProperties,
        listener: Arc<dyn ConnectionListener>,
    ) -> Result<Self, GatewayError> {
        let (tls, tls_config) = resolve_tls(props);
        let uri = amqp_uri(props, &tls);

        debug!(
            host = props.host,
            port = props.port,
            vhost = props.vhost,
            tls = tls.is_enabled(),
            "creating amqp connection..."
        );

        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(props.connection_name.clone()));

        let connection = match Connection::connect_uri_with_config(uri, options, tls_config).await
        {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(GatewayError::ConnectionError(err.to_string()))
            }
        }?;

        let name = props.connection_name.clone();
        {
            let listener = listener.clone();
            let name = name.clone();
            connection.on_error(move |err| listener.on_connection_error(&name, &err));
        }

        listener.on_connected(&name);

        Ok(BrokerConnection {
            name,
            connection: Arc::new(connection),
            tls,
            listener,
        })
    }

    /// Opens a new channel on the shared connection.
    ///
    /// # Returns
    /// * `Result<Channel, GatewayError>` - The channel, or `ChannelError` when the
    ///   connection is closed or the channel limit is reached
    pub async fn create_channel(&self) -> Result<Channel, GatewayError> {
        debug!("creating amqp channel...");
        match self.connection.create_channel().await {
            Ok(c) => {
                debug!(channel = c.id(), "channel created");
                Ok(c)
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(GatewayError::ChannelError(err.to_string()))
            }
        }
    }

    /// The client-provided connection name shown in the broker's management UI.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether TLS is in use, or why it was dropped.
    pub fn tls_status(&self) -> &TlsStatus {
        &self.tls
    }

    /// `true` while the client reports the connection as open. Becomes
    /// `false` after a broker-side failure, since nothing reconnects.
    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }
}

#[async_trait]
impl Shutdown for BrokerConnection {
    fn component(&self) -> &'static str {
        "connection"
    }

    /// Closes the connection. Closing one that is not open is a no-op.
    async fn shutdown(&self) -> Result<(), GatewayError> {
        if !self.is_connected() {
            debug!(connection = self.name, "connection is not open, nothing to close");
            return Ok(());
        }

        match self.connection.close(200, "OK").await {
            Ok(_) => {
                self.listener.on_closed(&self.name);
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to close the connection");
                Err(GatewayError::CloseError(self.name.clone()))
            }
        }
    }
}

/// Works out the TLS status and client TLS configuration from the properties.
///
/// Every failure is logged and turns into [`TlsStatus::Degraded`].
pub(crate) fn resolve_tls(props: &BrokerProperties) -> (TlsStatus, OwnedTLSConfig) {
    let Some(requested) = props.tls_version.as_deref().filter(|v| !v.trim().is_empty()) else {
        return (TlsStatus::Disabled, OwnedTLSConfig::default());
    };

    let degraded = |err: GatewayError| {
        error!(
            error = err.to_string(),
            requested, "failed to set tls version, connecting without tls"
        );
        (
            TlsStatus::Degraded {
                requested: requested.to_owned(),
                reason: err.to_string(),
            },
            OwnedTLSConfig::default(),
        )
    };

    let version = match requested.parse::<TlsVersion>() {
        Ok(v) => v,
        Err(err) => return degraded(err),
    };

    let cert_chain = match &props.tls_ca_path {
        None => None,
        Some(path) => match std::fs::read_to_string(path) {
            Ok(pem) => Some(pem),
            Err(err) => {
                return degraded(GatewayError::TlsConfigError(format!(
                    "cannot read ca file {}: {err}",
                    path.display()
                )))
            }
        },
    };

    if version == TlsVersion::Tls12 {
        warn!("tls version is a minimum, the client may negotiate TLSv1.3");
    }
    debug!(version = version.to_string(), "using tls connection to broker");

    (
        TlsStatus::Enabled(version),
        OwnedTLSConfig {
            identity: None,
            cert_chain,
        },
    )
}

/// Builds the broker URI; credentials are only set when both are present.
pub(crate) fn amqp_uri(props: &BrokerProperties, tls: &TlsStatus) -> AMQPUri {
    let userinfo = if props.has_credentials() {
        AMQPUserInfo {
            username: props.user.clone(),
            password: props.password.clone(),
        }
    } else {
        AMQPUserInfo::default()
    };

    AMQPUri {
        scheme: if tls.is_enabled() {
            AMQPScheme::AMQPS
        } else {
            AMQPScheme::AMQP
        },
        authority: AMQPAuthority {
            userinfo,
            host: props.host.clone(),
            port: props.port,
        },
        vhost: props.vhost.clone(),
        ..Default::default()
    }
}
