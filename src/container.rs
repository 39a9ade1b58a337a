// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Container
//!
//! This module subscribes the registered [`MessageHandler`] to the gateway
//! queues. Each queue gets its own channel and consumer with manual
//! acknowledgement and a prefetch limit; deliveries from all queues are handed
//! to worker tasks whose number is bounded by the same limit.
//!
//! Stopping the container cancels the consumers, waits for in-flight handlers
//! up to the shutdown timeout and closes the consumer channels.

use crate::{
    config::BrokerProperties,
    connection::BrokerConnection,
    consumer::{consume, Delivered, MessageHandler, Settle},
    errors::GatewayError,
    shutdown::Shutdown,
};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use lapin::{
    acker::Acker,
    options::{BasicCancelOptions, BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
    Channel, Consumer,
};
use opentelemetry::global::{self, BoxedTracer};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex, Semaphore},
    task::JoinHandle,
    time::{timeout_at, Instant},
};
use tracing::{debug, error, info, warn};

/// Consumer settings derived from the broker properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSettings {
    /// Unacknowledged deliveries per consumer, and concurrent handler runs
    pub prefetch: u16,
    pub consumer_tag_prefix: String,
    /// Upper bound for the whole stop sequence to wait on in-flight handlers
    pub shutdown_timeout: Duration,
}

impl ContainerSettings {
    /// Derives the settings from validated broker properties.
    ///
    /// # Parameters
    /// * `props` - The broker properties; `maxThreads` becomes the prefetch
    ///
    /// # Returns
    /// The settings, or `InvalidProperty` if `maxThreads` does not fit a
    /// prefetch count
    pub fn from_properties(props: &BrokerProperties) -> Result<Self, GatewayError> {
        Ok(ContainerSettings {
            prefetch: props.prefetch_count()?,
            consumer_tag_prefix: props.connection_name.clone(),
            shutdown_timeout: props.shutdown_timeout(),
        })
    }

    /// Consumer tag used for `queue`, unique per queue within a connection.
    pub fn consumer_tag(&self, queue: &str) -> String {
        format!("{}-{}", self.consumer_tag_prefix, queue)
    }
}

struct QueueWorker {
    queue: String,
    consumer_tag: String,
    channel: Channel,
    task: JoinHandle<()>,
}

/// Owns the subscriptions to the gateway queues.
pub struct ConsumerContainer {
    settings: ContainerSettings,
    workers: Mutex<Vec<QueueWorker>>,
    permits: Arc<Semaphore>,
    running: AtomicBool,
}

impl ConsumerContainer {
    /// Starts consuming `queues` immediately.
    ///
    /// If one subscription fails, those already started are stopped again
    /// before the error is returned.
    ///
    /// # Parameters
    /// * `connection` - The shared broker connection; one channel is opened per queue
    /// * `queues` - Names of the queues to consume, already declared
    /// * `handler` - Receives every delivery from every queue
    /// * `settings` - Prefetch, consumer tags and shutdown timeout
    ///
    /// # Returns
    /// * `Result<ConsumerContainer, GatewayError>` - The running container, or
    ///   the error of the first subscription that failed
    pub async fn start(
        connection: &BrokerConnection,
        queues: &[&str],
        handler: Arc<dyn MessageHandler>,
        settings: ContainerSettings,
    ) -> Result<Self, GatewayError> {
        let container = ConsumerContainer {
            permits: Arc::new(Semaphore::new(usize::from(settings.prefetch))),
            settings,
            workers: Mutex::new(vec![]),
            running: AtomicBool::new(true),
        };

        let tracer = Arc::new(global::tracer("amqp consumer"));

        for queue in queues {
            match container
                .subscribe(connection, queue, handler.clone(), tracer.clone())
                .await
            {
                Ok(worker) => container.workers.lock().await.push(worker),
                Err(err) => {
                    if let Err(stop_err) = container.shutdown().await {
                        warn!(
                            error = stop_err.to_string(),
                            "failure to stop partially started container"
                        );
                    }
                    return Err(err);
                }
            }
        }

        info!(
            queues = queues.join(","),
            prefetch = container.settings.prefetch,
            "consumer container started"
        );

        Ok(container)
    }

    async fn subscribe(
        &self,
        connection: &BrokerConnection,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        tracer: Arc<BoxedTracer>,
    ) -> Result<QueueWorker, GatewayError> {
        let channel = connection.create_channel().await?;

        let qos = channel
            .basic_qos(self.settings.prefetch, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, "failure to configure qos");
                GatewayError::QoSDeclarationError(queue.to_owned())
            });
        release_on_error(qos, close_channel(&channel, queue)).await?;

        let consumer_tag = self.settings.consumer_tag(queue);
        let consumer = channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, "error to create the consumer");
                GatewayError::BindingConsumerError(queue.to_owned())
            });
        let consumer = release_on_error(consumer, close_channel(&channel, queue)).await?;

        debug!(queue, consumer_tag, "consumer created");

        let task = tokio::spawn(dispatch(
            queue.to_owned(),
            deliveries(queue.to_owned(), consumer),
            handler,
            self.permits.clone(),
            tracer,
        ));

        Ok(QueueWorker {
            queue: queue.to_owned(),
            consumer_tag,
            channel,
            task,
        })
    }

    /// `false` once [`Shutdown::shutdown`] has been called.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn settings(&self) -> &ContainerSettings {
        &self.settings
    }
}

/// Awaits `release` when `result` is an error, then hands `result` back.
async fn release_on_error<T, F>(
    result: Result<T, GatewayError>,
    release: F,
) -> Result<T, GatewayError>
where
    F: Future<Output = ()>,
{
    if result.is_err() {
        release.await;
    }
    result
}

async fn close_channel(channel: &Channel, queue: &str) {
    if let Err(err) = channel.close(200, "OK").await {
        warn!(error = err.to_string(), queue, "failure to close consumer channel");
    }
}

/// Adapts a lapin consumer into settleable deliveries; stream errors are logged
/// and skipped.
fn deliveries(
    queue: String,
    consumer: Consumer,
) -> impl Stream<Item = Delivered<Acker>> + Send + 'static {
    consumer.filter_map(move |result| {
        let queue = queue.clone();
        async move {
            match result {
                Ok(delivery) => Some(Delivered::from_delivery(&queue, delivery)),
                Err(err) => {
                    error!(error = err.to_string(), queue, "errors consume msg");
                    None
                }
            }
        }
    })
}

/// Reads deliveries from one queue and runs each on its own task once a
/// worker permit is available. The permits are shared by all queues of the
/// container, so no more than `prefetch` handlers run at once.
async fn dispatch<D, S>(
    queue: String,
    deliveries: D,
    handler: Arc<dyn MessageHandler>,
    permits: Arc<Semaphore>,
    tracer: Arc<BoxedTracer>,
) where
    D: Stream<Item = Delivered<S>> + Send,
    S: Settle + 'static,
{
    let mut deliveries = std::pin::pin!(deliveries);

    while let Some(delivered) = deliveries.next().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };

        let handler = handler.clone();
        let tracer = tracer.clone();
        let queue = queue.clone();

        tokio::spawn(async move {
            let Delivered {
                properties,
                message,
                settler,
            } = delivered;

            if let Err(err) =
                consume(&tracer, &properties, message, handler.as_ref(), &settler).await
            {
                error!(error = err.to_string(), queue, "error consume msg");
            }
            drop(permit);
        });
    }

    debug!(queue, "consumer stream ended");
}

/// Waits for the dispatch loops to end and for every worker permit to come
/// back, all against the one `deadline`. Loops still running at the deadline
/// are aborted.
async fn drain<'a>(
    tasks: impl IntoIterator<Item = &'a mut JoinHandle<()>>,
    permits: &Semaphore,
    prefetch: u16,
    deadline: Instant,
    budget: Duration,
) -> Result<(), GatewayError> {
    for task in tasks {
        if timeout_at(deadline, &mut *task).await.is_err() {
            warn!("consumer did not stop in time, aborting");
            task.abort();
        }
    }

    match timeout_at(deadline, permits.acquire_many(u32::from(prefetch))).await {
        Ok(_) => {
            debug!("in-flight deliveries drained");
            Ok(())
        }
        Err(_) => {
            warn!("in-flight deliveries still running after shutdown timeout");
            Err(GatewayError::ShutdownTimeout(
                u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
            ))
        }
    }
}

#[async_trait]
impl Shutdown for ConsumerContainer {
    fn component(&self) -> &'static str {
        "consumer container"
    }

    /// Cancels the consumers, drains in-flight deliveries and closes the
    /// channels. Waiting is bounded by one shutdown timeout overall. Only the
    /// first failure is returned; every step still runs.
    async fn shutdown(&self) -> Result<(), GatewayError> {
        let mut workers = std::mem::take(&mut *self.workers.lock().await);
        self.running.store(false, Ordering::Release);

        if workers.is_empty() {
            debug!("consumer container is not running, nothing to stop");
            return Ok(());
        }

        let budget = self.settings.shutdown_timeout;
        let deadline = Instant::now() + budget;
        let mut failure = None;

        for worker in &workers {
            if let Err(err) = worker
                .channel
                .basic_cancel(&worker.consumer_tag, BasicCancelOptions { nowait: false })
                .await
            {
                error!(
                    error = err.to_string(),
                    queue = worker.queue,
                    "failure to cancel consumer"
                );
                failure.get_or_insert(GatewayError::CancelConsumerError(
                    worker.consumer_tag.clone(),
                ));
            }
        }

        if let Err(err) = drain(
            workers
                .iter_mut()
                .map(|worker| &mut worker.task)
                .collect::<Vec<_>>(),
            &self.permits,
            self.settings.prefetch,
            deadline,
            budget,
        )
        .await
        {
            failure.get_or_insert(err);
        }

        for worker in &workers {
            if let Err(err) = worker.channel.close(200, "OK").await {
                error!(
                    error = err.to_string(),
                    queue = worker.queue,
                    "failure to close consumer channel"
                );
                failure.get_or_insert(GatewayError::CloseError(worker.queue.clone()));
            }
        }

        info!("consumer container stopped");

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{Acknowledgement, InboundMessage, MockSettle};
    use futures_util::stream;
    use lapin::protocol::basic::AMQPProperties;
    use opentelemetry::Context;
    use std::sync::atomic::AtomicUsize;

    fn props() -> BrokerProperties {
        BrokerProperties::from_json(
            r#"{"host": "mq", "exchangeName": "events", "queueName": "incoming",
                "waitlistQueueName": "waitlist", "bindingKeys": "a.*",
                "maxThreads": 16, "connectionName": "gw", "shutdownTimeoutMs": 250}"#,
        )
        .unwrap()
    }

    #[test]
    fn prefetch_follows_max_threads() {
        let settings = ContainerSettings::from_properties(&props()).unwrap();

        assert_eq!(settings.prefetch, 16);
        assert_eq!(settings.shutdown_timeout, Duration::from_millis(250));
    }

    #[test]
    fn consumer_tags_are_unique_per_queue() {
        let settings = ContainerSettings::from_properties(&props()).unwrap();

        assert_eq!(settings.consumer_tag("incoming"), "gw-incoming");
        assert_ne!(
            settings.consumer_tag("incoming"),
            settings.consumer_tag("waitlist")
        );
    }

    #[test]
    fn oversized_thread_limit_is_rejected() {
        let mut p = props();
        p.max_threads = 70_000;
        assert!(matches!(
            ContainerSettings::from_properties(&p),
            Err(GatewayError::InvalidProperty { .. })
        ));
    }

    #[tokio::test]
    async fn stopping_an_empty_container_is_a_no_op() {
        let container = ConsumerContainer {
            settings: ContainerSettings::from_properties(&props()).unwrap(),
            workers: Mutex::new(vec![]),
            permits: Arc::new(Semaphore::new(16)),
            running: AtomicBool::new(true),
        };

        assert_eq!(container.shutdown().await, Ok(()));
        assert!(!container.is_running());
        assert_eq!(container.shutdown().await, Ok(()));
    }

    #[derive(Default)]
    struct SlowHandler {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for SlowHandler {
        async fn handle(&self, _ctx: &Context, _message: &InboundMessage) -> Acknowledgement {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Acknowledgement::Ack
        }
    }

    fn delivered(
        queue: &str,
        count: u64,
        settled: Arc<AtomicUsize>,
    ) -> impl Stream<Item = Delivered<MockSettle>> + Send + 'static {
        let queue = queue.to_owned();
        stream::iter((1..=count).map(move |tag| {
            let settled = settled.clone();
            let mut settler = MockSettle::new();
            settler
                .expect_settle()
                .times(1)
                .returning(move |_| {
                    settled.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
            Delivered {
                properties: AMQPProperties::default(),
                message: InboundMessage {
                    queue: queue.clone(),
                    delivery_tag: tag,
                    ..Default::default()
                },
                settler,
            }
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_handlers_never_exceed_max_threads() {
        let handler = Arc::new(SlowHandler::default());
        let settled = Arc::new(AtomicUsize::new(0));
        let permits = Arc::new(Semaphore::new(2));
        let tracer = Arc::new(global::tracer("test"));

        tokio::join!(
            dispatch(
                "incoming".to_owned(),
                delivered("incoming", 6, settled.clone()),
                handler.clone() as Arc<dyn MessageHandler>,
                permits.clone(),
                tracer.clone(),
            ),
            dispatch(
                "waitlist".to_owned(),
                delivered("waitlist", 6, settled.clone()),
                handler.clone() as Arc<dyn MessageHandler>,
                permits.clone(),
                tracer,
            ),
        );

        let _all = permits.acquire_many(2).await.unwrap();

        assert_eq!(settled.load(Ordering::SeqCst), 12);
        assert_eq!(handler.peak.load(Ordering::SeqCst), 2);
        assert_eq!(handler.running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_once_for_the_whole_timeout() {
        let budget = Duration::from_millis(250);
        let permits = Semaphore::new(2);
        let _in_flight = permits.acquire_many(2).await.unwrap();
        let mut tasks = vec![
            tokio::spawn(std::future::pending::<()>()),
            tokio::spawn(std::future::pending::<()>()),
        ];

        let started = Instant::now();
        let result = drain(tasks.iter_mut(), &permits, 2, started + budget, budget).await;

        assert_eq!(result, Err(GatewayError::ShutdownTimeout(250)));
        assert!(started.elapsed() >= budget);
        assert!(started.elapsed() < budget * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_returns_as_soon_as_work_is_done() {
        let budget = Duration::from_secs(5);
        let permits = Semaphore::new(2);
        let mut tasks = vec![tokio::spawn(async {})];

        let started = Instant::now();
        let result = drain(tasks.iter_mut(), &permits, 2, started + budget, budget).await;

        assert_eq!(result, Ok(()));
        assert!(started.elapsed() < budget);
    }

    #[tokio::test]
    async fn failed_subscription_step_releases_the_channel() {
        let released = AtomicBool::new(false);
        let result: Result<(), _> = release_on_error(
            Err(GatewayError::QoSDeclarationError("incoming".to_owned())),
            async { released.store(true, Ordering::SeqCst) },
        )
        .await;

        assert_eq!(
            result,
            Err(GatewayError::QoSDeclarationError("incoming".to_owned()))
        );
        assert!(released.load(Ordering::SeqCst));

        let released = AtomicBool::new(false);
        let result =
            release_on_error(Ok(7), async { released.store(true, Ordering::SeqCst) }).await;

        assert_eq!(result, Ok(7));
        assert!(!released.load(Ordering::SeqCst));
    }
}
