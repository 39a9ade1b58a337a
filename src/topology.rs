// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Topology
//!
//! This module collects the exchanges, queues and bindings the gateway needs
//! and installs them on the broker. Declarations are idempotent at the broker:
//! installing the same topology twice changes nothing.
//!
//! The main components are:
//! - `Declarer` trait: the three broker calls topology installation needs
//! - `Topology`: the declarations, built with chained setters
//! - `Topology::for_gateway`: the incoming/waitlist layout derived from the properties

use crate::{
    config::{BrokerProperties, WAITLIST_BINDING_KEY},
    errors::GatewayError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use lapin::{options::QueueBindOptions, types::FieldTable, Channel};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, error};

/// Broker operations used to install a topology.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Declarer: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), GatewayError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), GatewayError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), GatewayError>;
}

#[async_trait]
impl Declarer for Channel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), GatewayError> {
        debug!("creating exchange: {}", def.name);

        match self
            .exchange_declare(
                &def.name,
                def.kind(),
                def.options(),
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the exchange"
                );
                Err(GatewayError::DeclareExchangeError(def.name.clone()))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), GatewayError> {
        debug!("creating queue: {}", def.name);

        match self
            .queue_declare(&def.name, def.options(), FieldTable::default())
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the queue"
                );
                Err(GatewayError::DeclareQueueError(def.name.clone()))
            }
            _ => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), GatewayError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(GatewayError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// The exchanges, queues and bindings to install.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) bindings: Vec<QueueBinding>,
}

impl Topology {
    /// An empty topology.
    pub fn new() -> Topology {
        Topology::default()
    }

    /// The gateway layout: a durable topic exchange, the durable incoming
    /// queue bound once per configured key, and the durable waitlist queue
    /// bound with [`WAITLIST_BINDING_KEY`].
    ///
    /// Fails on an empty binding key before anything reaches the broker.
    ///
    /// # Parameters
    /// * `props` - Exchange, queue names and the comma-separated binding keys
    ///
    /// # Returns
    /// * `Result<Topology, GatewayError>` - The layout, or `EmptyBindingKey`
    pub fn for_gateway(props: &BrokerProperties) -> Result<Topology, GatewayError> {
        let keys = props.binding_keys()?;

        let topology = Topology::new()
            .exchange(ExchangeDefinition::topic(&props.exchange_name).durable())
            .queue(QueueDefinition::new(&props.queue_name).durable())
            .queue(QueueDefinition::new(&props.waitlist_queue_name).durable())
            .queue_binding(
                QueueBinding::new(&props.waitlist_queue_name)
                    .exchange(&props.exchange_name)
                    .routing_key(WAITLIST_BINDING_KEY),
            );

        Ok(keys.iter().fold(topology, |topology, key| {
            topology.queue_binding(
                QueueBinding::new(&props.queue_name)
                    .exchange(&props.exchange_name)
                    .routing_key(key),
            )
        }))
    }

    /// Adds an exchange to declare before any queue.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Adds a queue; a second definition with the same name replaces the first.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.retain(|q| q.name != def.name);
        self.queues.push(def);
        self
    }

    /// Adds a binding; bindings are installed in the order they were added.
    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// The bindings targeting `queue`, in installation order.
    pub fn bindings_for<'a>(&'a self, queue: &'a str) -> impl Iterator<Item = &'a QueueBinding> {
        self.bindings.iter().filter(move |b| b.queue_name == queue)
    }

    /// Declares exchanges, then queues, then bindings. Stops at the first failure.
    ///
    /// # Parameters
    /// * `declarer` - The broker side, usually a `lapin::Channel`
    pub async fn install<D>(&self, declarer: &D) -> Result<(), GatewayError>
    where
        D: Declarer + ?Sized,
    {
        for exchange in &self.exchanges {
            declarer.declare_exchange(exchange).await?;
        }

        for queue in &self.queues {
            declarer.declare_queue(queue).await?;
        }

        for binding in &self.bindings {
            declarer.bind_queue(binding).await?;
        }

        debug!(
            exchanges = self.exchanges.len(),
            queues = self.queues.len(),
            bindings = self.bindings.len(),
            "topology installed"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::{predicate::always, Sequence};

    fn props(binding_keys: &str) -> BrokerProperties {
        BrokerProperties::from_json(&format!(
            r#"{{"host": "mq", "port": 5672, "exchangeName": "events",
                "queueName": "incoming", "waitlistQueueName": "waitlist",
                "bindingKeys": "{binding_keys}"}}"#
        ))
        .unwrap()
    }

    fn keys<'a>(topology: &'a Topology, queue: &'a str) -> Vec<&'a str> {
        topology.bindings_for(queue).map(|b| b.key()).collect()
    }

    #[test]
    fn scenario_two_incoming_keys_and_fixed_waitlist_key() {
        let topology = Topology::for_gateway(&props("a.*, b.*")).unwrap();

        assert_eq!(keys(&topology, "incoming"), vec!["a.*", "b.*"]);
        assert_eq!(keys(&topology, "waitlist"), vec![WAITLIST_BINDING_KEY]);
        assert!(topology.bindings.iter().all(|b| b.exchange_name() == "events"));
    }

    #[test]
    fn one_incoming_binding_per_key() {
        for (raw, expected) in [("a", 1), ("a,b", 2), ("a.#, b.*, c.d.e", 3), ("#,*,x,y,z", 5)] {
            let topology = Topology::for_gateway(&props(raw)).unwrap();
            assert_eq!(topology.bindings_for("incoming").count(), expected, "{raw}");
            assert_eq!(topology.bindings_for("waitlist").count(), 1);
        }
    }

    #[test]
    fn whitespace_does_not_change_bindings() {
        assert_eq!(
            Topology::for_gateway(&props("  a.* ,   b.*  ")).unwrap(),
            Topology::for_gateway(&props("a.*,b.*")).unwrap()
        );
    }

    #[test]
    fn declares_durable_queues_and_topic_exchange() {
        let topology = Topology::for_gateway(&props("a.*")).unwrap();

        assert_eq!(topology.exchanges.len(), 1);
        assert!(matches!(
            topology.exchanges[0].kind(),
            lapin::ExchangeKind::Topic
        ));
        assert!(topology.exchanges[0].is_durable());
        assert_eq!(topology.queues.len(), 2);
        assert!(topology.queues.iter().all(|q| q.is_durable()));
    }

    #[test]
    fn same_queue_twice_is_declared_once() {
        let topology = Topology::new()
            .queue(QueueDefinition::new("q"))
            .queue(QueueDefinition::new("q").durable());

        assert_eq!(topology.queues, vec![QueueDefinition::new("q").durable()]);
    }

    #[tokio::test]
    async fn installs_exchange_then_queues_then_bindings() {
        let topology = Topology::for_gateway(&props("a.*, b.*")).unwrap();
        let mut seq = Sequence::new();
        let mut declarer = MockDeclarer::new();

        declarer
            .expect_declare_exchange()
            .withf(|def| def.name() == "events")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        declarer
            .expect_declare_queue()
            .with(always())
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        declarer
            .expect_bind_queue()
            .withf(|b| b.queue_name() == "waitlist" && b.key() == WAITLIST_BINDING_KEY)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        declarer
            .expect_bind_queue()
            .withf(|b| b.queue_name() == "incoming")
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        topology.install(&declarer).await.unwrap();
    }

    #[tokio::test]
    async fn install_stops_at_first_failure() {
        let topology = Topology::for_gateway(&props("a.*")).unwrap();
        let mut declarer = MockDeclarer::new();

        declarer
            .expect_declare_exchange()
            .returning(|def| Err(GatewayError::DeclareExchangeError(def.name().to_owned())));
        declarer.expect_declare_queue().never();
        declarer.expect_bind_queue().never();

        assert_eq!(
            topology.install(&declarer).await,
            Err(GatewayError::DeclareExchangeError("events".to_owned()))
        );
    }

    #[test]
    fn empty_key_fails_before_install() {
        let mut p = props("a.*");
        p.binding_keys = "a.*,".to_owned();
        assert!(matches!(
            Topology::for_gateway(&p),
            Err(GatewayError::EmptyBindingKey { position: 1, .. })
        ));
    }
}
