// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Gateway
//!
//! Brings the other modules together. [`GatewayBuilder::connect`] performs the
//! whole startup sequence once:
//!
//! 1. opens the shared connection
//! 2. installs the topology on a short-lived channel
//! 3. opens the waitlist publisher
//! 4. starts the consumer container on the incoming and waitlist queues
//!
//! The resulting [`BrokerGateway`] owns every broker resource until
//! [`BrokerGateway::close`].

use crate::{
    config::BrokerProperties,
    connection::{BrokerConnection, ConnectionListener, LoggingConnectionListener, TlsStatus},
    consumer::MessageHandler,
    container::{ConsumerContainer, ContainerSettings},
    errors::GatewayError,
    publisher::{ConfirmCallback, LoggingConfirmCallback, PublishTarget, WaitlistPublisher},
    shutdown::{shutdown_in_order, Shutdown, ShutdownReport},
    topology::Topology,
};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Collects the collaborators of a gateway before connecting.
pub struct GatewayBuilder {
    props: BrokerProperties,
    handler: Option<Arc<dyn MessageHandler>>,
    listener: Arc<dyn ConnectionListener>,
    confirm_callback: Arc<dyn ConfirmCallback>,
}

impl GatewayBuilder {
    /// A builder with logging listener and confirm callback; a handler must
    /// still be set.
    pub fn new(props: BrokerProperties) -> Self {
        GatewayBuilder {
            props,
            handler: None,
            listener: Arc::new(LoggingConnectionListener),
            confirm_callback: Arc::new(LoggingConfirmCallback),
        }
    }

    /// Receives every message from the incoming and waitlist queues. Required.
    pub fn handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Replaces the default listener that only logs connection events.
    pub fn connection_listener(mut self, listener: Arc<dyn ConnectionListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Replaces the default callback that only logs publisher confirms.
    pub fn confirm_callback(mut self, callback: Arc<dyn ConfirmCallback>) -> Self {
        self.confirm_callback = callback;
        self
    }

    /// Connects, declares the topology, and starts publishing and consuming.
    ///
    /// Configuration errors are reported before the broker is contacted. If a
    /// later step fails, the resources opened so far are released again.
    ///
    /// # Returns
    /// * `Result<BrokerGateway, GatewayError>` - The running gateway, or
    ///   `MissingHandler`, a configuration error, or the first failing startup step
    pub async fn connect(self) -> Result<BrokerGateway, GatewayError> {
        let handler = self.handler.ok_or(GatewayError::MissingHandler)?;
        self.props.validate()?;
        let topology = Topology::for_gateway(&self.props)?;
        let settings = ContainerSettings::from_properties(&self.props)?;

        let connection = BrokerConnection::connect(&self.props, self.listener).await?;

        let startup = BrokerStartup {
            props: &self.props,
            connection: &connection,
            topology: &topology,
            handler,
            settings,
            confirm_callback: self.confirm_callback,
        };
        let wired = wire(&startup).await;

        match wired {
            Ok((publisher, container)) => {
                info!(
                    connection = connection.name(),
                    exchange = self.props.exchange_name,
                    "broker gateway ready"
                );
                Ok(BrokerGateway {
                    connection,
                    container,
                    publisher,
                })
            }
            Err(err) => {
                let steps: [&dyn Shutdown; 1] = [&connection];
                let report = shutdown_in_order(&steps).await;
                if !report.is_clean() {
                    warn!("connection not closed cleanly after failed startup");
                }
                Err(err)
            }
        }
    }
}

/// The startup steps that follow the connection, in the order [`wire`] runs them.
#[cfg_attr(test, automock(type Publisher = (); type Container = ();))]
#[async_trait]
pub(crate) trait Startup: Send + Sync {
    type Publisher: Send;
    type Container: Send;

    async fn install_topology(&self) -> Result<(), GatewayError>;

    async fn open_publisher(&self) -> Result<Self::Publisher, GatewayError>;

    async fn start_consumers(&self) -> Result<Self::Container, GatewayError>;
}

/// Installs the topology, then opens the publisher, then starts consuming.
///
/// Consumers only start once every queue and binding exists. The first failing
/// step ends the sequence.
pub(crate) async fn wire<S>(startup: &S) -> Result<(S::Publisher, S::Container), GatewayError>
where
    S: Startup + ?Sized,
{
    startup.install_topology().await?;
    let publisher = startup.open_publisher().await?;
    let container = startup.start_consumers().await?;
    Ok((publisher, container))
}

struct BrokerStartup<'a> {
    props: &'a BrokerProperties,
    connection: &'a BrokerConnection,
    topology: &'a Topology,
    handler: Arc<dyn MessageHandler>,
    settings: ContainerSettings,
    confirm_callback: Arc<dyn ConfirmCallback>,
}

#[async_trait]
impl Startup for BrokerStartup<'_> {
    type Publisher = WaitlistPublisher;
    type Container = ConsumerContainer;

    async fn install_topology(&self) -> Result<(), GatewayError> {
        let channel = self.connection.create_channel().await?;
        let installed = self.topology.install(&channel).await;
        if let Err(err) = channel.close(200, "OK").await {
            debug!(error = err.to_string(), "topology channel not closed");
        }
        installed
    }

    async fn open_publisher(&self) -> Result<WaitlistPublisher, GatewayError> {
        WaitlistPublisher::new(
            self.connection,
            PublishTarget::waitlist(self.props),
            self.confirm_callback.clone(),
        )
        .await
    }

    async fn start_consumers(&self) -> Result<ConsumerContainer, GatewayError> {
        ConsumerContainer::start(
            self.connection,
            &[
                self.props.queue_name.as_str(),
                self.props.waitlist_queue_name.as_str(),
            ],
            self.handler.clone(),
            self.settings.clone(),
        )
        .await
    }
}

/// Point-in-time view of the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayStatus {
    pub connected: bool,
    pub consuming: bool,
    pub tls: TlsStatus,
}

/// Every broker resource of the application, created once at startup.
pub struct BrokerGateway {
    connection: BrokerConnection,
    container: ConsumerContainer,
    publisher: WaitlistPublisher,
}

impl BrokerGateway {
    /// Sends `message` to the waitlist queue; see [`WaitlistPublisher::publish`].
    pub async fn publish(&self, message: &str) -> Result<String, GatewayError> {
        self.publisher.publish(message).await
    }

    /// A publisher handle sharing this gateway's channel.
    pub fn publisher(&self) -> WaitlistPublisher {
        self.publisher.clone()
    }

    /// Current connection, consumer and TLS state.
    pub fn status(&self) -> GatewayStatus {
        GatewayStatus {
            connected: self.connection.is_connected(),
            consuming: self.container.is_running(),
            tls: self.connection.tls_status().clone(),
        }
    }

    /// Stops the consumer container, then closes the connection.
    ///
    /// Never fails; problems are logged and listed in the report.
    pub async fn close(self) -> ShutdownReport {
        let steps: [&dyn Shutdown; 2] = [&self.container, &self.connection];
        let report = shutdown_in_order(&steps).await;

        if report.is_clean() {
            info!("broker gateway closed");
        } else {
            warn!(failures = report.failures.len(), "broker gateway closed with errors");
        }

        report
    }
}
