//! JetStream consumer for ingesting orders and persisting them via
//! `OrderService`.
//!
//! The pipeline has four stages: N queue-group subscribers decode and
//! validate incoming JSON, hand accepted orders over a bounded channel to M
//! persistence workers, and every message ends its life as one stat event.
//! Shutdown is a drain, not an abort: an unsubscribe broadcast stops the
//! subscribers, the handoff channel closes once the last of them lets go,
//! and the workers finish whatever is still queued before exiting.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_nats::jetstream;
use async_nats::jetstream::consumer::{push, AckPolicy, DeliverPolicy};
use futures::StreamExt;
use model::Order;
use service::OrderService;
use stats::{MessageStat, StatsPusher, UNKNOWN_ID};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Settings for the subscriber fleet and the worker pool.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Server URL.
    pub url: String,
    /// Connection name reported to the server.
    pub client_name: String,
    /// Stream the order subject is bound to.
    pub stream: String,
    /// Subject order messages arrive on.
    pub subject: String,
    /// Queue group; the server load-balances deliveries across its members.
    pub qgroup: String,
    /// Durable consumer name. The server remembers delivery progress for
    /// this name and replays unacknowledged messages across restarts.
    pub durable: String,
    /// Number of parallel subscription handles in this process.
    pub subscribers: usize,
    /// Number of persistence workers.
    pub workers: usize,
    /// Capacity of the subscriber→worker handoff channel.
    pub handoff_capacity: usize,
    /// Server-side cap on unacknowledged messages in flight.
    pub max_inflight: i64,
}

/// NatsConsumer wraps the JetStream context and business dependencies.
pub struct NatsConsumer<S> {
    jetstream: jetstream::Context,
    service: Arc<S>,
    stats: StatsPusher,
    config: ConsumerConfig,
}

/// Join handles for every pipeline task, in drain order.
pub struct ConsumerHandle {
    subscribers: Vec<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl ConsumerHandle {
    /// Waits until every subscriber has unsubscribed and every worker has
    /// drained the handoff channel and exited.
    pub async fn drained(self) {
        for (i, handle) in self.subscribers.into_iter().enumerate() {
            if let Err(e) = handle.await {
                error!(subscriber = i, error = %e, "subscriber task failed");
            }
        }
        for (i, handle) in self.workers.into_iter().enumerate() {
            if let Err(e) = handle.await {
                error!(worker = i, error = %e, "worker task failed");
            }
        }
        info!("consumer drained");
    }
}

impl<S> NatsConsumer<S>
where
    S: OrderService + 'static,
{
    /// Connect to the broker.
    ///
    /// A connection failure here is fatal to construction; the caller is
    /// expected to abort startup rather than retry.
    pub async fn connect(
        config: ConsumerConfig,
        service: Arc<S>,
        stats: StatsPusher,
    ) -> Result<Self, async_nats::ConnectError> {
        let client = async_nats::ConnectOptions::new()
            .name(&config.client_name)
            .connect(config.url.as_str())
            .await?;
        info!(url = %config.url, client = %config.client_name, "connected to nats");

        Ok(Self {
            jetstream: jetstream::new(client),
            service,
            stats,
            config,
        })
    }

    /// Bind the durable consumer and start the pipeline.
    ///
    /// Spawns one task per subscriber and per worker and returns their
    /// handles. Subscriptions are opened here, before any task starts, so a
    /// broken subscription fails the whole run instead of dying quietly
    /// inside a task.
    ///
    /// Each subscriber watches `unsubscribe`; once it fires the subscriber
    /// drops its delivery stream and its clone of the handoff sender. The
    /// channel therefore closes exactly when the last subscriber has
    /// unsubscribed, and the workers run dry and exit.
    pub async fn run(self, unsubscribe: watch::Receiver<bool>) -> Result<ConsumerHandle> {
        let cfg = &self.config;

        let stream = self
            .jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: cfg.stream.clone(),
                subjects: vec![cfg.subject.clone()],
                ..Default::default()
            })
            .await
            .context("failed to look up or create stream")?;

        let deliver_subject = format!("deliver.{}.{}", cfg.stream, cfg.durable);
        let consumer = stream
            .get_or_create_consumer(
                &cfg.durable,
                push::Config {
                    durable_name: Some(cfg.durable.clone()),
                    deliver_subject,
                    deliver_group: Some(cfg.qgroup.clone()),
                    deliver_policy: DeliverPolicy::All,
                    ack_policy: AckPolicy::Explicit,
                    max_ack_pending: cfg.max_inflight,
                    ..Default::default()
                },
            )
            .await
            .context("failed to bind durable consumer")?;

        let (tx, rx) = mpsc::channel::<Order>(cfg.handoff_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let mut subscribers = Vec::with_capacity(cfg.subscribers);
        for i in 0..cfg.subscribers {
            let messages = consumer
                .messages()
                .await
                .context("failed to open delivery stream")?;
            subscribers.push(tokio::spawn(subscriber_loop(
                i,
                messages,
                tx.clone(),
                self.stats.clone(),
                unsubscribe.clone(),
            )));
        }
        // The subscribers hold the only senders from here on.
        drop(tx);

        let mut workers = Vec::with_capacity(cfg.workers);
        for i in 0..cfg.workers {
            workers.push(tokio::spawn(worker_loop(
                i,
                rx.clone(),
                self.service.clone(),
                self.stats.clone(),
            )));
        }

        info!(
            subject = %cfg.subject,
            qgroup = %cfg.qgroup,
            durable = %cfg.durable,
            subscribers = cfg.subscribers,
            workers = cfg.workers,
            "order processing started"
        );

        Ok(ConsumerHandle {
            subscribers,
            workers,
        })
    }
}

async fn subscriber_loop(
    id: usize,
    mut messages: push::Messages,
    tx: mpsc::Sender<Order>,
    stats: StatsPusher,
    mut unsubscribe: watch::Receiver<bool>,
) {
    info!(subscriber = id, "subscribed");
    loop {
        tokio::select! {
            _ = unsubscribe.changed() => {
                info!(subscriber = id, "unsubscribing");
                break;
            }
            next = messages.next() => match next {
                Some(Ok(message)) => {
                    dispatch_payload(&message.payload, &tx, &stats).await;
                    // Ack on every branch: a payload that failed to decode
                    // or validate must not come back on redelivery.
                    if let Err(e) = message.ack().await {
                        warn!(subscriber = id, error = %e, "failed to ack message");
                    }
                }
                Some(Err(e)) => {
                    error!(subscriber = id, error = %e, "subscription failed");
                    break;
                }
                None => {
                    debug!(subscriber = id, "delivery stream ended");
                    break;
                }
            }
        }
    }
    // Dropping `messages` stops delivery to this handle; dropping `tx`
    // releases this subscriber's hold on the handoff channel.
}

/// Decode and validate one payload, then queue it for persistence.
///
/// Rejections are terminal: they produce one error stat (under the order
/// UID when one is known, [`UNKNOWN_ID`] otherwise) and the message is
/// dropped. The handoff send blocks while every worker is busy; together
/// with the server-side in-flight window that is the pipeline backpressure.
async fn dispatch_payload(payload: &[u8], tx: &mpsc::Sender<Order>, stats: &StatsPusher) {
    let order: Order = match serde_json::from_slice(payload) {
        Ok(order) => order,
        Err(e) => {
            warn!(error = %e, "failed to decode order payload");
            stats
                .push(MessageStat::error(UNKNOWN_ID, e.to_string()))
                .await;
            return;
        }
    };

    if let Err(e) = validator::validate(&order) {
        warn!(order_uid = %order.order_uid, error = %e, "order rejected");
        stats
            .push(MessageStat::error(order.order_uid.clone(), e.to_string()))
            .await;
        return;
    }

    let order_uid = order.order_uid.clone();
    if tx.send(order).await.is_err() {
        // Only reachable if a message sneaks in mid-shutdown.
        error!(order_uid = %order_uid, "handoff channel closed, order dropped");
    }
}

async fn worker_loop<S>(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Order>>>,
    service: Arc<S>,
    stats: StatsPusher,
) where
    S: OrderService,
{
    loop {
        // Lock only around the receive; saving and stat pushes run unlocked.
        let next = { rx.lock().await.recv().await };
        let Some(order) = next else { break };

        let order_uid = order.order_uid.clone();
        match service.save(&order).await {
            Ok(()) => {
                info!(order_uid = %order_uid, "order saved");
                stats.push(MessageStat::success(order_uid)).await;
            }
            Err(e) => {
                error!(order_uid = %order_uid, error = %e, "failed to save order");
                stats
                    .push(MessageStat::error(order_uid, e.to_string()))
                    .await;
            }
        }
    }
    debug!(worker = id, "worker drained");
}
