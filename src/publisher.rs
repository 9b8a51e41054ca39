// Copyright (c) 2025, The Messenger Authors
// MIT License
// All rights reserved.

//! # Message Publishing
//!
//! This module publishes typed values to the primary exchange with bounded
//! retry: transient failures are retried a fixed number of times with a fixed
//! delay, and the final error propagates to the caller. Scheduled delivery
//! attaches an `x-delay` offset and requires the delayed exchange kind; the
//! broker defers routing until the offset elapses, so the target instant is a
//! lower bound.

use crate::{
    config::{DEFAULT_PUBLISH_ATTEMPTS, DEFAULT_PUBLISH_DELAY_MS},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    handler::Codec,
    otel,
    retrier::retry_with_attempts,
    routing::RoutingKey,
};
use chrono::{DateTime, Utc};
use lapin::{
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel,
};
use opentelemetry::Context;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::error;
use uuid::Uuid;

/// Header carrying the scheduling offset for delayed exchanges
pub const AMQP_HEADERS_DELAY: &str = "x-delay";

/// Per-call publish options. The service derives the defaults from its
/// configuration; `Default` matches the documented fallbacks.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Publish with delivery mode 2 (persisted to disk).
    pub persistent: bool,
    /// Total number of attempts before the error is surfaced.
    pub attempts: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl Default for PublishOptions {
    fn default() -> Self {
        PublishOptions {
            persistent: false,
            attempts: DEFAULT_PUBLISH_ATTEMPTS,
            delay: Duration::from_millis(DEFAULT_PUBLISH_DELAY_MS),
        }
    }
}

/// Publishes messages on the service channel.
pub struct Publisher {
    channel: Arc<Channel>,
    codec: Arc<dyn Codec>,
    exchange: ExchangeDefinition,
    persistent_default: bool,
}

impl Publisher {
    /// Creates a new publisher.
    ///
    /// # Parameters
    /// * `channel` - A channel to the RabbitMQ server
    /// * `codec` - Codec used to encode message payloads
    /// * `exchange` - The exchange messages are published to
    /// * `persistent_default` - Service-level default delivery mode
    ///
    /// # Returns
    /// A new Publisher instance
    pub fn new(
        channel: Arc<Channel>,
        codec: Arc<dyn Codec>,
        exchange: ExchangeDefinition,
        persistent_default: bool,
    ) -> Publisher {
        Publisher {
            channel,
            codec,
            exchange,
            persistent_default,
        }
    }

    /// Publishes a message to RabbitMQ.
    ///
    /// Serializes `value` via the codec and publishes it under the routing
    /// key, retrying transient failures per `opts`. Serialization failures
    /// are not retried; after the retry budget is exhausted the final error
    /// propagates to the caller.
    ///
    /// # Parameters
    /// * `routing_key` - The registered routing key to publish under
    /// * `value` - The payload, serialized via the codec
    /// * `opts` - Per-call persistence and retry options
    ///
    /// # Returns
    /// Ok(()) on success or AmqpError after all attempts failed
    pub async fn publish<T: serde::Serialize>(
        &self,
        routing_key: &RoutingKey,
        value: &T,
        opts: &PublishOptions,
    ) -> Result<(), AmqpError> {
        let body = self.encode(value)?;

        retry_with_attempts(opts.attempts, opts.delay, || {
            self.try_publish(routing_key.key(), &body, opts.persistent, None)
        })
        .await
    }

    /// Publishes a message for delivery no earlier than `publish_at`.
    ///
    /// The broker defers routing by the `x-delay` offset, so the exchange
    /// must be of a delayed kind. The offset from now is recomputed on every
    /// attempt and clamped at zero, so a past instant publishes immediately.
    ///
    /// # Parameters
    /// * `routing_key` - The registered routing key to publish under
    /// * `value` - The payload, serialized via the codec
    /// * `publish_at` - Earliest delivery instant; a lower bound, not exact
    /// * `opts` - Per-call persistence and retry options
    ///
    /// # Returns
    /// Ok(()) on success or AmqpError after all attempts failed
    pub async fn publish_at<T: serde::Serialize>(
        &self,
        routing_key: &RoutingKey,
        value: &T,
        publish_at: DateTime<Utc>,
        opts: &PublishOptions,
    ) -> Result<(), AmqpError> {
        if !self.exchange.kind.is_delayed() {
            return Err(AmqpError::InvalidTopology(format!(
                "scheduled publish requires a delayed exchange, `{}` is not",
                self.exchange.name()
            )));
        }

        let body = self.encode(value)?;

        retry_with_attempts(opts.attempts, opts.delay, || {
            let delay = delay_until(publish_at, Utc::now());
            self.try_publish(routing_key.key(), &body, opts.persistent, Some(delay))
        })
        .await
    }

    fn encode<T: serde::Serialize>(&self, value: &T) -> Result<Vec<u8>, AmqpError> {
        let value = serde_json::to_value(value).map_err(|_| AmqpError::SerializationError)?;
        self.codec.encode(&value)
    }

    async fn try_publish(
        &self,
        routing_key: &str,
        body: &[u8],
        persistent: bool,
        delay_ms: Option<i64>,
    ) -> Result<(), AmqpError> {
        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject_context(&Context::current(), &mut headers);

        if let Some(delay_ms) = delay_ms {
            headers.insert(
                ShortString::from(AMQP_HEADERS_DELAY),
                AMQPValue::LongLongInt(delay_ms),
            );
        }

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(self.codec.content_type().to_owned()))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_delivery_mode(delivery_mode(persistent, self.persistent_default))
            .with_headers(FieldTable::from(headers));

        match self
            .channel
            .basic_publish(
                self.exchange.name(),
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                body,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishError(self.exchange.name().to_owned()))
            }
            _ => Ok(()),
        }
    }
}

/// Delivery mode 2 persists the message to disk; the service-level default
/// applies when the per-call flag is unset.
pub(crate) fn delivery_mode(persistent: bool, service_default: bool) -> u8 {
    if persistent || service_default {
        2
    } else {
        1
    }
}

/// Millisecond offset between now and the target instant, clamped at zero.
pub(crate) fn delay_until(publish_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (publish_at - now).num_milliseconds().max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn delivery_mode_prefers_the_per_call_flag() {
        assert_eq!(delivery_mode(false, false), 1);
        assert_eq!(delivery_mode(true, false), 2);
        assert_eq!(delivery_mode(false, true), 2);
        assert_eq!(delivery_mode(true, true), 2);
    }

    #[test]
    fn future_instants_produce_a_positive_offset() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let at = now + chrono::Duration::milliseconds(1_500);

        assert_eq!(delay_until(at, now), 1_500);
    }

    #[test]
    fn past_instants_are_clamped_to_zero() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let at = now - chrono::Duration::seconds(30);

        assert_eq!(delay_until(at, now), 0);
    }
}
