// Copyright (c) 2025, The Messenger Authors
// MIT License
// All rights reserved.

//! # Messaging Service
//!
//! This module ties the pieces together: it owns the connection lifecycle as
//! an explicit three-state machine, declares the topology on every
//! (re)connect, exposes the publish operations, and runs the consumers. A
//! background supervisor task re-establishes the connection with a fixed
//! backoff whenever the broker closes it for a reason the application did not
//! initiate, and keeps doing so for the life of the process unless
//! `shutdown()` is called.

use crate::{
    channel::new_amqp_channel,
    config::AmqpConfig,
    consumer::{self, DispatchContext},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    handler::{Codec, JsonCodec, MessageHandler},
    publisher::{PublishOptions, Publisher},
    queue::QueueDefinition,
    routing::{RoutingKey, RoutingKeyRegistry},
    topology::AmqpTopology,
};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use lapin::{
    options::{BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
    Channel, Connection,
};
use opentelemetry::global;
use serde::Serialize;
use std::sync::Arc;
use tokio::{
    sync::{mpsc, watch, Mutex, RwLock},
    time::sleep,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Lifecycle of the broker connection. The service owns at most one live
/// connection/channel pair, held by the `Ready` state; whether the channel is
/// usable is answered here and nowhere else.
pub(crate) enum ConnectionState {
    Disconnected,
    Connecting,
    Ready {
        connection: Arc<Connection>,
        channel: Arc<Channel>,
    },
}

impl ConnectionState {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready { .. } => "ready",
        }
    }

    /// `Disconnected -> Connecting`; any other origin is a programming error.
    fn begin_connect(&mut self) -> Result<(), AmqpError> {
        match self {
            ConnectionState::Disconnected => {
                *self = ConnectionState::Connecting;
                Ok(())
            }
            other => Err(AmqpError::InvalidStateTransition(
                other.name().to_owned(),
                "connecting".to_owned(),
            )),
        }
    }

    /// `Connecting -> Ready`, installing the fresh pair.
    fn complete_connect(
        &mut self,
        connection: Arc<Connection>,
        channel: Arc<Channel>,
    ) -> Result<(), AmqpError> {
        match self {
            ConnectionState::Connecting => {
                *self = ConnectionState::Ready {
                    connection,
                    channel,
                };
                Ok(())
            }
            other => Err(AmqpError::InvalidStateTransition(
                other.name().to_owned(),
                "ready".to_owned(),
            )),
        }
    }

    /// `Connecting -> Disconnected` after a failed attempt.
    fn fail_connect(&mut self) {
        if matches!(self, ConnectionState::Connecting) {
            *self = ConnectionState::Disconnected;
        }
    }

    /// Drops to `Disconnected` from any state, handing back the live pair so
    /// the caller can close it.
    fn disconnect(&mut self) -> Option<(Arc<Connection>, Arc<Channel>)> {
        match std::mem::replace(self, ConnectionState::Disconnected) {
            ConnectionState::Ready {
                connection,
                channel,
            } => Some((connection, channel)),
            _ => None,
        }
    }

    fn channel(&self) -> Result<Arc<Channel>, AmqpError> {
        match self {
            ConnectionState::Ready { channel, .. } => Ok(Arc::clone(channel)),
            other => Err(AmqpError::NotConnected(other.name().to_owned())),
        }
    }

    fn pair(&self) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
        match self {
            ConnectionState::Ready {
                connection,
                channel,
            } => Ok((Arc::clone(connection), Arc::clone(channel))),
            other => Err(AmqpError::NotConnected(other.name().to_owned())),
        }
    }
}

/// Resilient messaging service over a RabbitMQ broker.
///
/// Constructed with the primary exchange, the registered routing keys, and
/// the application handler. `start()` spawns the supervisor that connects,
/// declares the topology, starts the consumers, and reconnects forever with
/// a fixed backoff until `shutdown()`.
pub struct MessagingService {
    cfg: AmqpConfig,
    exchange: ExchangeDefinition,
    shared_queue: QueueDefinition,
    registry: Arc<RoutingKeyRegistry>,
    handler: Arc<dyn MessageHandler>,
    codec: Arc<dyn Codec>,
    state: Arc<RwLock<ConnectionState>>,
    closed_tx: mpsc::UnboundedSender<()>,
    closed_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl MessagingService {
    /// Creates a new messaging service using the default JSON codec.
    ///
    /// Fails fast when the routing-key list contains duplicated key strings.
    ///
    /// # Parameters
    /// * `cfg` - Connection parameters and behavior flags
    /// * `exchange` - The primary exchange definition
    /// * `keys` - The routing keys this service publishes and consumes
    /// * `handler` - Application callback invoked per delivery
    ///
    /// # Returns
    /// An Arc-wrapped service on success, or AmqpError on invalid topology
    pub fn new(
        cfg: AmqpConfig,
        exchange: ExchangeDefinition,
        keys: Vec<RoutingKey>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Arc<MessagingService>, AmqpError> {
        Self::with_codec(cfg, exchange, keys, handler, Arc::new(JsonCodec))
    }

    /// Creates a service with a custom payload codec.
    pub fn with_codec(
        cfg: AmqpConfig,
        exchange: ExchangeDefinition,
        keys: Vec<RoutingKey>,
        handler: Arc<dyn MessageHandler>,
        codec: Arc<dyn Codec>,
    ) -> Result<Arc<MessagingService>, AmqpError> {
        let registry = Arc::new(RoutingKeyRegistry::new(keys)?);
        let shared_queue = QueueDefinition::new(exchange.name());
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(MessagingService {
            cfg,
            exchange,
            shared_queue,
            registry,
            handler,
            codec,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            closed_tx,
            closed_rx: Mutex::new(Some(closed_rx)),
            shutdown_tx,
        }))
    }

    /// Spawns the background supervisor driving connect, listen, and the
    /// reconnect loop.
    pub fn start(self: &Arc<Self>) {
        let service = Arc::clone(self);
        tokio::spawn(async move { service.run().await });
    }

    /// Stops accepting reconnects and closes the live connection. Intended
    /// for clean process shutdown and test teardown; close failures are
    /// ignored.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        self.teardown().await;
    }

    /// Whether the service currently holds a usable channel.
    pub async fn is_ready(&self) -> bool {
        matches!(*self.state.read().await, ConnectionState::Ready { .. })
    }

    /// Resolves a registered routing key by its string.
    pub fn routing_key(&self, key: &str) -> Result<RoutingKey, AmqpError> {
        self.registry.resolve(key).map(|key| key.clone())
    }

    /// Opens the connection and channel, applies the prefetch limit, and
    /// declares the topology. One-shot; the supervisor wraps this in the
    /// retry loop.
    pub async fn connect(&self) -> Result<(), AmqpError> {
        self.state.write().await.begin_connect()?;

        match self.establish().await {
            Ok((connection, channel)) => self
                .state
                .write()
                .await
                .complete_connect(connection, channel),
            Err(err) => {
                self.state.write().await.fail_connect();
                Err(err)
            }
        }
    }

    async fn establish(&self) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
        let connection_name = self.cfg.connection_name_or(self.shared_queue.name());
        let (connection, channel) = new_amqp_channel(&self.cfg, &connection_name).await?;

        let closed_tx = self.closed_tx.clone();
        connection.on_error(move |err| {
            error!(error = err.to_string(), "connection closed unexpectedly");
            let _ = closed_tx.send(());
        });

        let closed_tx = self.closed_tx.clone();
        channel.on_error(move |err| {
            error!(error = err.to_string(), "channel closed unexpectedly");
            let _ = closed_tx.send(());
        });

        if let Err(err) = channel
            .basic_qos(self.cfg.prefetch, BasicQosOptions::default())
            .await
        {
            error!(error = err.to_string(), "error to configure prefetch");
            return Err(AmqpError::QosError);
        }

        self.setup(Arc::clone(&channel)).await?;

        Ok((connection, channel))
    }

    /// Declares the exchange, the shared queue, and its bindings. Safe to run
    /// on every (re)connect since declarations are idempotent.
    pub async fn setup(&self, channel: Arc<Channel>) -> Result<(), AmqpError> {
        AmqpTopology::new(channel, &self.cfg)
            .install(&self.exchange, &self.shared_queue, &self.registry)
            .await
    }

    /// Starts consumption: declares the per-instance exclusive queue, binds
    /// the fan-out keys to it, and consumes both it and the shared queue with
    /// manual acknowledgment. Each delivery is dispatched as its own task,
    /// bounded by the prefetch limit.
    pub async fn listen(&self) -> Result<(), AmqpError> {
        let (connection, channel) = self.state.read().await.pair()?;

        let topology = AmqpTopology::new(Arc::clone(&channel), &self.cfg);
        let exclusive_queue = topology.declare_exclusive_queue().await?;
        for key in self.registry.fan_out() {
            topology
                .bind(&exclusive_queue, self.exchange.name(), key.key())
                .await?;
        }

        let ctx = Arc::new(DispatchContext {
            connection,
            registry: Arc::clone(&self.registry),
            handler: Arc::clone(&self.handler),
            max_retry_count: self.cfg.max_retry_count,
            dead_sink: self.cfg.dead_sink,
        });

        for queue in [self.shared_queue.name().to_owned(), exclusive_queue] {
            self.consume(&channel, queue, Arc::clone(&ctx)).await?;
        }

        Ok(())
    }

    /// Publishes a value under a registered routing key with the configured
    /// retry defaults.
    ///
    /// # Parameters
    /// * `routing_key` - The key string, which must be registered
    /// * `value` - The payload, serialized via the codec
    ///
    /// # Returns
    /// Ok(()) on success or AmqpError after all attempts failed
    pub async fn publish<T: Serialize>(
        &self,
        routing_key: &str,
        value: &T,
    ) -> Result<(), AmqpError> {
        self.publish_with(routing_key, value, &self.default_publish_options())
            .await
    }

    /// Publishes with explicit per-call options.
    pub async fn publish_with<T: Serialize>(
        &self,
        routing_key: &str,
        value: &T,
        opts: &PublishOptions,
    ) -> Result<(), AmqpError> {
        let key = self.routing_key(routing_key)?;
        self.publisher().await?.publish(&key, value, opts).await
    }

    /// Publishes a value for delivery no earlier than `publish_at`. Requires
    /// the exchange to be of a delayed kind.
    pub async fn publish_at<T: Serialize>(
        &self,
        routing_key: &str,
        value: &T,
        publish_at: DateTime<Utc>,
    ) -> Result<(), AmqpError> {
        self.publish_at_with(routing_key, value, publish_at, &self.default_publish_options())
            .await
    }

    /// Scheduled publish with explicit per-call options.
    pub async fn publish_at_with<T: Serialize>(
        &self,
        routing_key: &str,
        value: &T,
        publish_at: DateTime<Utc>,
        opts: &PublishOptions,
    ) -> Result<(), AmqpError> {
        let key = self.routing_key(routing_key)?;
        self.publisher()
            .await?
            .publish_at(&key, value, publish_at, opts)
            .await
    }

    fn default_publish_options(&self) -> PublishOptions {
        PublishOptions {
            persistent: false,
            attempts: self.cfg.publish_attempts,
            delay: self.cfg.publish_delay(),
        }
    }

    async fn publisher(&self) -> Result<Publisher, AmqpError> {
        let channel = self.state.read().await.channel()?;
        Ok(Publisher::new(
            channel,
            Arc::clone(&self.codec),
            self.exchange.clone(),
            self.cfg.persistent,
        ))
    }

    async fn consume(
        &self,
        channel: &Arc<Channel>,
        queue: String,
        ctx: Arc<DispatchContext>,
    ) -> Result<(), AmqpError> {
        let consumer_tag = format!("{}-{}", queue, Uuid::new_v4());

        let mut consumer = match channel
            .basic_consume(
                &queue,
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
        {
            Ok(consumer) => consumer,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = queue.as_str(),
                    "error to create the consumer"
                );
                return Err(AmqpError::ConsumerError(queue));
            }
        };

        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        let ctx = Arc::clone(&ctx);
                        tokio::spawn(async move {
                            let tracer = global::tracer("amqp consumer");
                            if let Err(err) = consumer::dispatch(&ctx, &tracer, delivery).await {
                                error!(error = err.to_string(), "error consume msg");
                            }
                        });
                    }
                    Err(err) => error!(error = err.to_string(), "errors consume msg"),
                }
            }

            debug!(queue = queue.as_str(), "consumer stream ended");
        });

        Ok(())
    }

    /// Supervisor: connect (retrying forever with the fixed backoff), start
    /// the consumers, then wait for an unexpected closure or shutdown.
    async fn run(self: Arc<Self>) {
        let mut closed_rx = match self.closed_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                error!("supervisor is already running");
                return;
            }
        };
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if *shutdown_rx.borrow() {
                return;
            }

            while let Err(err) = self.connect().await {
                error!(error = err.to_string(), "failure to connect, will retry");
                self.teardown().await;

                tokio::select! {
                    _ = sleep(self.cfg.reconnect_delay()) => {}
                    _ = shutdown_rx.changed() => return,
                }
                if *shutdown_rx.borrow() {
                    return;
                }
            }

            if self.cfg.auto_listen {
                if let Err(err) = self.listen().await {
                    error!(error = err.to_string(), "failure to start consumers");
                }
            }

            tokio::select! {
                _ = closed_rx.recv() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                    warn!("connection lost, scheduling reconnect");
                    self.teardown().await;
                    while closed_rx.try_recv().is_ok() {}
                }
                _ = shutdown_rx.changed() => return,
            }
        }
    }

    /// Best-effort close of whatever is live; always lands on Disconnected.
    async fn teardown(&self) {
        let pair = self.state.write().await.disconnect();

        if let Some((connection, channel)) = pair {
            if let Err(err) = channel.close(200, "closing").await {
                debug!(error = err.to_string(), "error to close the channel");
            }
            if let Err(err) = connection.close(200, "closing").await {
                debug!(error = err.to_string(), "error to close the connection");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::MockMessageHandler;

    #[test]
    fn begin_connect_only_leaves_disconnected() {
        let mut state = ConnectionState::Disconnected;
        assert!(state.begin_connect().is_ok());
        assert_eq!(state.name(), "connecting");

        assert_eq!(
            state.begin_connect(),
            Err(AmqpError::InvalidStateTransition(
                "connecting".to_owned(),
                "connecting".to_owned()
            ))
        );
    }

    #[test]
    fn failed_connects_fall_back_to_disconnected() {
        let mut state = ConnectionState::Connecting;
        state.fail_connect();
        assert_eq!(state.name(), "disconnected");

        // Failing outside of Connecting keeps the current state.
        let mut state = ConnectionState::Disconnected;
        state.fail_connect();
        assert_eq!(state.name(), "disconnected");
    }

    #[test]
    fn channel_access_requires_ready() {
        let state = ConnectionState::Connecting;
        assert_eq!(
            state.channel().map(|_| ()),
            Err(AmqpError::NotConnected("connecting".to_owned()))
        );
    }

    #[test]
    fn disconnect_without_a_live_pair_returns_nothing() {
        let mut state = ConnectionState::Connecting;
        assert!(state.disconnect().is_none());
        assert_eq!(state.name(), "disconnected");
    }

    #[tokio::test]
    async fn construction_rejects_duplicated_routing_keys() {
        let handler: Arc<dyn MessageHandler> = Arc::new(MockMessageHandler::new());

        let result = MessagingService::new(
            AmqpConfig::default(),
            ExchangeDefinition::new("orders"),
            vec![RoutingKey::new("order.created"), RoutingKey::new("order.created")],
            handler,
        );

        assert!(matches!(result, Err(AmqpError::InvalidTopology(_))));
    }

    #[tokio::test]
    async fn fresh_services_are_not_ready() {
        let handler: Arc<dyn MessageHandler> = Arc::new(MockMessageHandler::new());

        let service = MessagingService::new(
            AmqpConfig::default(),
            ExchangeDefinition::new("orders"),
            vec![RoutingKey::new("order.created")],
            handler,
        )
        .unwrap();

        assert!(!service.is_ready().await);
        assert_eq!(
            service.routing_key("order.created").unwrap().key(),
            "order.created"
        );
    }
}
