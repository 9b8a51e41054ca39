// Copyright (c) 2025, The Messenger Authors
// MIT License
// All rights reserved.

//! # Topology Declaration
//!
//! This module declares the broker-side topology: the primary exchange, the
//! shared queue with its bindings, and the derived failure infrastructure.
//! When a retry budget is configured, a `-dlx` exchange/queue pair buffers
//! rejected messages under a short TTL before redelivering them to the main
//! exchange. When the dead-letter sink is enabled, a `-dead` fanout pair
//! permanently stores messages that exhausted their budget.
//!
//! Every declaration is idempotent: re-declaring a resource with identical
//! parameters is a no-op on the broker.

use crate::{
    config::AmqpConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::QueueDefinition,
    routing::RoutingKeyRegistry,
};
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    Channel,
};
use std::sync::Arc;
use tracing::{debug, error};

/// Queue argument pointing rejected/expired messages at an exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument bounding how long a message sits in a queue
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Queue argument selecting the queue type
pub const AMQP_HEADERS_QUEUE_TYPE: &str = "x-queue-type";
/// Queue type providing replication across broker nodes
pub const QUORUM_QUEUE_TYPE: &str = "quorum";
/// Wildcard used for the dead sink binding
const MATCH_ALL_ROUTING_KEY: &str = "#";

/// Declares exchanges, queues, and bindings on a channel.
///
/// Holds the channel and the configuration flags that shape the derived
/// resources; the same installer serves the initial `setup()` and the
/// exclusive-queue declaration done by `listen()`.
pub struct AmqpTopology<'tp> {
    channel: Arc<Channel>,
    cfg: &'tp AmqpConfig,
}

impl<'tp> AmqpTopology<'tp> {
    /// Creates a new AmqpTopology instance.
    ///
    /// # Parameters
    /// * `channel` - A channel to the RabbitMQ server
    /// * `cfg` - Configuration flags shaping the derived resources
    ///
    /// # Returns
    /// A new AmqpTopology instance
    pub fn new(channel: Arc<Channel>, cfg: &'tp AmqpConfig) -> AmqpTopology<'tp> {
        AmqpTopology { channel, cfg }
    }

    /// Installs the topology to the RabbitMQ server.
    ///
    /// This declares the primary exchange (with its derived retry and dead
    /// resources), the shared queue, and one binding per non-fan-out routing
    /// key. Safe to call on every (re)connect.
    ///
    /// # Parameters
    /// * `exchange` - The primary exchange definition
    /// * `shared_queue` - The shared work queue definition
    /// * `registry` - The registered routing keys
    ///
    /// # Returns
    /// Ok(()) on success or AmqpError on the first declaration that fails
    pub async fn install(
        &self,
        exchange: &ExchangeDefinition,
        shared_queue: &QueueDefinition,
        registry: &RoutingKeyRegistry,
    ) -> Result<(), AmqpError> {
        self.declare_exchange(exchange).await?;
        self.declare_queue(shared_queue, exchange).await?;

        for routing_key in registry.shared() {
            self.bind_queue(shared_queue.name(), exchange, routing_key.key())
                .await?;
        }

        Ok(())
    }

    /// Declares the primary exchange and its derived failure resources.
    ///
    /// A retry budget above one adds the `-dlx` exchange; the dead-letter
    /// sink adds the `-dead` fanout exchange/queue pair bound with a
    /// match-all key.
    pub async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name());

        self.exchange_declare(def.name(), def.kind.as_lapin(), def.kind.declare_arguments())
            .await?;

        if self.cfg.retries_enabled() {
            self.exchange_declare(&def.dlx_name(), def.kind.undelayed(), FieldTable::default())
                .await?;
        }

        if self.cfg.dead_sink {
            let dead = def.dead_name();
            self.exchange_declare(&dead, lapin::ExchangeKind::Fanout, FieldTable::default())
                .await?;
            self.queue_declare(&dead, durable_options(), FieldTable::default())
                .await?;
            self.bind(&dead, &dead, MATCH_ALL_ROUTING_KEY).await?;
        }

        debug!("exchange: {} was created", def.name());
        Ok(())
    }

    /// Declares a queue together with its retry buffer.
    ///
    /// With retries enabled, the `<queue>-dlx` buffer dead-letters back to
    /// the main exchange after the configured TTL, and the main queue points
    /// its rejections at `<exchange>-dlx`.
    pub async fn declare_queue(
        &self,
        def: &QueueDefinition,
        exchange: &ExchangeDefinition,
    ) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name());

        if self.cfg.retries_enabled() {
            self.queue_declare(
                &def.dlx_name(),
                declare_options(def),
                dlx_queue_arguments(exchange.name(), self.cfg.retry_ttl_ms),
            )
            .await?;
        }

        self.queue_declare(
            def.name(),
            declare_options(def),
            main_queue_arguments(def, exchange, self.cfg),
        )
        .await?;

        debug!("queue: {} was created", def.name());
        Ok(())
    }

    /// Binds a queue to the exchange and, when retries are enabled, mirrors
    /// the binding on the `-dlx` pair so redeliveries keep their key.
    pub async fn bind_queue(
        &self,
        queue: &str,
        exchange: &ExchangeDefinition,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.bind(queue, exchange.name(), routing_key).await?;

        if self.cfg.retries_enabled() {
            self.bind(
                &format!("{}{}", queue, crate::exchange::DLX_SUFFIX),
                &exchange.dlx_name(),
                routing_key,
            )
            .await?;
        }

        Ok(())
    }

    /// Declares the server-named exclusive queue for this instance and
    /// returns the generated name. Fan-out keys are bound to it directly,
    /// with no retry buffer.
    pub async fn declare_exclusive_queue(&self) -> Result<String, AmqpError> {
        let def = QueueDefinition::exclusive_server_named();

        let queue = match self
            .channel
            .queue_declare("", declare_options(&def), FieldTable::default())
            .await
        {
            Ok(queue) => queue,
            Err(err) => {
                error!(error = err.to_string(), "failure to declare exclusive queue");
                return Err(AmqpError::DeclareQueueError("<server-named>".to_owned()));
            }
        };

        Ok(queue.name().as_str().to_owned())
    }

    /// Plain binding without the mirrored `-dlx` binding.
    pub async fn bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue, exchange, routing_key
        );

        match self
            .channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingError(
                    exchange.to_owned(),
                    queue.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: lapin::ExchangeKind,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    passive: false,
                    durable: true,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                arguments,
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name, "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(name.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        match self.channel.queue_declare(name, options, arguments).await {
            Err(err) => {
                error!(error = err.to_string(), name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
            _ => Ok(()),
        }
    }
}

fn declare_options(def: &QueueDefinition) -> QueueDeclareOptions {
    QueueDeclareOptions {
        passive: false,
        durable: def.durable,
        exclusive: def.exclusive,
        auto_delete: def.auto_delete,
        nowait: false,
    }
}

fn durable_options() -> QueueDeclareOptions {
    QueueDeclareOptions {
        passive: false,
        durable: true,
        exclusive: false,
        auto_delete: false,
        nowait: false,
    }
}

/// Arguments of the main queue: the DLX pointer when a retry budget exists,
/// and the quorum type when requested and allowed for this queue.
pub(crate) fn main_queue_arguments(
    def: &QueueDefinition,
    exchange: &ExchangeDefinition,
    cfg: &AmqpConfig,
) -> FieldTable {
    let mut arguments = FieldTable::default();

    if cfg.retries_enabled() {
        arguments.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(exchange.dlx_name())),
        );
    }

    if cfg.quorum && def.supports_quorum() {
        arguments.insert(
            ShortString::from(AMQP_HEADERS_QUEUE_TYPE),
            AMQPValue::LongString(LongString::from(QUORUM_QUEUE_TYPE)),
        );
    }

    arguments
}

/// Arguments of the `-dlx` buffer queue: expired messages return to the main
/// exchange after the retry TTL.
pub(crate) fn dlx_queue_arguments(exchange_name: &str, retry_ttl_ms: u32) -> FieldTable {
    let mut arguments = FieldTable::default();

    arguments.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
        AMQPValue::LongString(LongString::from(exchange_name)),
    );
    arguments.insert(
        ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
        AMQPValue::LongInt(LongInt::from(retry_ttl_ms as i32)),
    );

    arguments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(max_retry_count: u32, quorum: bool) -> AmqpConfig {
        AmqpConfig {
            max_retry_count,
            quorum,
            ..AmqpConfig::default()
        }
    }

    #[test]
    fn main_queue_points_at_the_dlx_when_retries_are_enabled() {
        let exchange = ExchangeDefinition::new("orders");
        let queue = QueueDefinition::new("orders");

        let arguments = main_queue_arguments(&queue, &exchange, &config_with(3, false));
        assert_eq!(
            arguments.inner().get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&AMQPValue::LongString(LongString::from("orders-dlx")))
        );

        let without_retries = main_queue_arguments(&queue, &exchange, &config_with(1, false));
        assert!(without_retries.inner().is_empty());
    }

    #[test]
    fn quorum_argument_only_applies_to_eligible_queues() {
        let exchange = ExchangeDefinition::new("orders");
        let cfg = config_with(1, true);

        let eligible = main_queue_arguments(&QueueDefinition::new("orders"), &exchange, &cfg);
        assert_eq!(
            eligible.inner().get(AMQP_HEADERS_QUEUE_TYPE),
            Some(&AMQPValue::LongString(LongString::from(QUORUM_QUEUE_TYPE)))
        );

        let exclusive =
            main_queue_arguments(&QueueDefinition::new("orders").exclusive(), &exchange, &cfg);
        assert!(exclusive.inner().get(AMQP_HEADERS_QUEUE_TYPE).is_none());

        let transient =
            main_queue_arguments(&QueueDefinition::new("orders").transient(), &exchange, &cfg);
        assert!(transient.inner().get(AMQP_HEADERS_QUEUE_TYPE).is_none());
    }

    #[test]
    fn dlx_buffer_returns_messages_to_the_main_exchange_after_the_ttl() {
        let arguments = dlx_queue_arguments("orders", 5_000);

        assert_eq!(
            arguments.inner().get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&AMQPValue::LongString(LongString::from("orders")))
        );
        assert_eq!(
            arguments.inner().get(AMQP_HEADERS_MESSAGE_TTL),
            Some(&AMQPValue::LongInt(5_000))
        );
    }
}
