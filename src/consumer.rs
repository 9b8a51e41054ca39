// Copyright (c) 2025, The Messenger Authors
// MIT License
// All rights reserved.

//! # Delivery Dispatch and Failure Escalation
//!
//! This module processes a single delivery: resolve the routing key, invoke
//! the registered handler, and acknowledge on success. Failures escalate in
//! tiers. While the broker-reported death count stays under the retry budget
//! the delivery is rejected without requeue, which routes it through the DLX
//! buffer and back after the TTL; once the budget is exhausted the message is
//! republished to the terminal dead sink with diagnostic headers and the
//! original is acknowledged so it can never loop.

use crate::{
    errors::AmqpError,
    exchange::dead_name_for,
    handler::MessageHandler,
    otel,
    routing::RoutingKeyRegistry,
};
use chrono::Utc;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions, BasicPublishOptions, ExchangeDeclareOptions},
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, ShortString},
    Connection,
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc};
use tracing::{debug, error, warn};

/// Broker-populated history of dead-letter events for a message
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Count field inside an x-death entry
pub const AMQP_HEADERS_COUNT: &str = "count";
/// Failure reason attached before republishing to the dead sink
pub const AMQP_HEADERS_FAILED_REASON: &str = "x-failed-reason";
/// Failure timestamp (epoch millis) attached before republishing
pub const AMQP_HEADERS_FAILED_AT: &str = "x-failed-at";

/// Everything the dispatch path needs for one delivery, shared across the
/// per-delivery tasks of all consumers.
pub(crate) struct DispatchContext {
    pub(crate) connection: Arc<Connection>,
    pub(crate) registry: Arc<RoutingKeyRegistry>,
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub(crate) max_retry_count: u32,
    pub(crate) dead_sink: bool,
}

/// Consumes and processes a message from RabbitMQ.
///
/// This function is the core of the message consumption process. It:
/// 1. Creates a trace span for distributed tracing
/// 2. Resolves the routing key of the delivery
/// 3. Processes the message using the registered handler
/// 4. Handles successful processing with acknowledgment
/// 5. Handles failures with retry or dead-sink routing
///
/// Dispatch failures never escape: they are absorbed by the escalation policy
/// so one bad message cannot halt consumption of the next.
///
/// # Parameters
/// * `ctx` - Shared dispatch context (registry, handler, escalation flags)
/// * `tracer` - OpenTelemetry tracer for creating spans
/// * `delivery` - The RabbitMQ delivery containing the message
///
/// # Returns
/// Ok(()) on success or AmqpError on failure
pub(crate) async fn dispatch(
    ctx: &DispatchContext,
    tracer: &BoxedTracer,
    delivery: Delivery,
) -> Result<(), AmqpError> {
    let routing_key = delivery.routing_key.as_str().to_owned();
    let (_otel_ctx, mut span) = otel::new_span(&delivery.properties, tracer, &routing_key);

    debug!(
        "received: {} - exchange: {}",
        routing_key,
        delivery.exchange.as_str()
    );

    let outcome = run_handler(&ctx.registry, &ctx.handler, &routing_key, &delivery.data).await;

    match outcome {
        Ok(()) => {
            debug!("message successfully processed");
            match delivery.ack(BasicAckOptions { multiple: false }).await {
                Err(err) => {
                    error!(error = err.to_string(), "error whiling ack msg");
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack msg"),
                    });
                    Err(AmqpError::AckMessageError)
                }
                _ => {
                    span.set_status(Status::Ok);
                    Ok(())
                }
            }
        }
        Err(err) => {
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("handler failure"),
            });
            handle_exception(ctx, delivery, err).await
        }
    }
}

/// Resolves the routing key and invokes the handler. An unregistered key is
/// treated like any handler failure and goes through escalation.
pub(crate) async fn run_handler(
    registry: &RoutingKeyRegistry,
    handler: &Arc<dyn MessageHandler>,
    routing_key: &str,
    body: &[u8],
) -> Result<(), AmqpError> {
    let key = registry.resolve(routing_key)?;
    handler.handle(key, body).await.map_err(AmqpError::from)
}

/// Applies the escalation policy to a failed delivery.
pub(crate) async fn handle_exception(
    ctx: &DispatchContext,
    delivery: Delivery,
    error: AmqpError,
) -> Result<(), AmqpError> {
    match escalate(ctx.max_retry_count, death_count(&delivery.properties)) {
        Escalation::Requeue => {
            warn!(
                error = error.to_string(),
                "error whiling handling msg, rejecting for delayed redelivery"
            );
            match delivery
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue: false,
                })
                .await
            {
                Ok(_) => Ok(()),
                Err(err) => {
                    error!(error = err.to_string(), "error whiling nack msg");
                    Err(AmqpError::NackMessageError)
                }
            }
        }
        Escalation::Terminal => handle_failed_message(ctx, delivery, error).await,
    }
}

/// Terminal handling: forward a copy to the dead sink when one is configured
/// and remove the original from the queue. The ack happens regardless of the
/// forward outcome so the message cannot requeue forever.
async fn handle_failed_message(
    ctx: &DispatchContext,
    delivery: Delivery,
    error: AmqpError,
) -> Result<(), AmqpError> {
    error!(
        error = error.to_string(),
        routing_key = delivery.routing_key.as_str(),
        "retries exhausted, discarding message"
    );

    if ctx.dead_sink {
        if let Err(err) = publish_to_dead_sink(ctx, &delivery, &error).await {
            debug!(
                error = err.to_string(),
                "dead-letter sink unavailable, skipping forward"
            );
        }
    }

    match delivery.ack(BasicAckOptions { multiple: false }).await {
        Err(err) => {
            error!(error = err.to_string(), "error whiling ack failed msg");
            Err(AmqpError::AckMessageError)
        }
        _ => Ok(()),
    }
}

/// Republishes the failed message, body unchanged, to the terminal exchange
/// derived from its originating exchange. Uses a short-lived channel so a
/// broker-side rejection cannot disturb the consumer channel. The sink is
/// verified passively and never created here.
async fn publish_to_dead_sink(
    ctx: &DispatchContext,
    delivery: &Delivery,
    error: &AmqpError,
) -> Result<(), AmqpError> {
    let channel = match ctx.connection.create_channel().await {
        Ok(channel) => channel,
        Err(_) => return Err(AmqpError::ChannelError),
    };

    let dead_exchange = dead_name_for(delivery.exchange.as_str());

    channel
        .exchange_declare(
            &dead_exchange,
            lapin::ExchangeKind::Fanout,
            ExchangeDeclareOptions {
                passive: true,
                durable: true,
                auto_delete: false,
                internal: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
        .map_err(|_| AmqpError::DeadLetterPublishError)?;

    let properties = delivery.properties.clone().with_headers(failure_headers(
        &delivery.properties,
        &error.to_string(),
        Utc::now().timestamp_millis(),
    ));

    channel
        .basic_publish(
            &dead_exchange,
            delivery.routing_key.as_str(),
            BasicPublishOptions::default(),
            &delivery.data,
            properties,
        )
        .await
        .map_err(|_| AmqpError::DeadLetterPublishError)?;

    let _ = channel.close(200, "dead sink forward done").await;
    Ok(())
}

/// Escalation tiers for a failed delivery.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Escalation {
    /// Reject without requeue so the broker routes through the DLX buffer.
    Requeue,
    /// Budget exhausted (or no budget at all): dead sink + ack.
    Terminal,
}

/// Decides the escalation tier from the retry budget and the number of times
/// the broker already dead-lettered this message.
pub(crate) fn escalate(max_retry_count: u32, death_count: i64) -> Escalation {
    if max_retry_count <= 1 {
        return Escalation::Terminal;
    }

    if death_count < i64::from(max_retry_count) {
        Escalation::Requeue
    } else {
        Escalation::Terminal
    }
}

/// Reads the death count from the first `x-death` entry. Messages that never
/// went through a DLX have no history and count as zero.
pub(crate) fn death_count(props: &AMQPProperties) -> i64 {
    let headers = match props.headers() {
        Some(headers) => headers.to_owned(),
        None => FieldTable::default(),
    };

    headers
        .inner()
        .get(AMQP_HEADERS_X_DEATH)
        .and_then(AMQPValue::as_array)
        .and_then(|entries| entries.as_slice().first())
        .and_then(AMQPValue::as_field_table)
        .and_then(|death| death.inner().get(AMQP_HEADERS_COUNT))
        .and_then(AMQPValue::as_long_long_int)
        .unwrap_or(0)
}

/// Copies the delivery headers and appends the failure reason and timestamp.
pub(crate) fn failure_headers(
    props: &AMQPProperties,
    reason: &str,
    failed_at_ms: i64,
) -> FieldTable {
    let mut headers = props
        .headers()
        .clone()
        .unwrap_or_default()
        .inner()
        .clone();

    headers.insert(
        ShortString::from(AMQP_HEADERS_FAILED_REASON),
        AMQPValue::LongString(reason.into()),
    );
    headers.insert(
        ShortString::from(AMQP_HEADERS_FAILED_AT),
        AMQPValue::LongLongInt(failed_at_ms),
    );

    FieldTable::from(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::HandlerError;
    use crate::handler::MockMessageHandler;
    use crate::routing::RoutingKey;
    use lapin::types::{FieldArray, LongString};
    use lapin::BasicProperties;
    use std::collections::BTreeMap;

    fn props_with_death_count(count: i64) -> BasicProperties {
        let mut death = BTreeMap::<ShortString, AMQPValue>::default();
        death.insert(
            ShortString::from(AMQP_HEADERS_COUNT),
            AMQPValue::LongLongInt(count),
        );

        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
        headers.insert(
            ShortString::from(AMQP_HEADERS_X_DEATH),
            AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::FieldTable(
                FieldTable::from(death),
            )])),
        );

        BasicProperties::default().with_headers(FieldTable::from(headers))
    }

    #[test]
    fn death_count_defaults_to_zero_without_history() {
        assert_eq!(death_count(&BasicProperties::default()), 0);
    }

    #[test]
    fn death_count_reads_the_first_entry() {
        assert_eq!(death_count(&props_with_death_count(2)), 2);
    }

    #[test]
    fn escalation_skips_straight_to_terminal_without_a_budget() {
        assert_eq!(escalate(1, 0), Escalation::Terminal);
        assert_eq!(escalate(0, 0), Escalation::Terminal);
    }

    #[test]
    fn escalation_requeues_until_the_budget_is_reached() {
        assert_eq!(escalate(2, 0), Escalation::Requeue);
        assert_eq!(escalate(2, 1), Escalation::Requeue);
        assert_eq!(escalate(2, 2), Escalation::Terminal);
        assert_eq!(escalate(2, 3), Escalation::Terminal);
    }

    #[test]
    fn failure_headers_preserve_existing_entries() {
        let mut existing = BTreeMap::<ShortString, AMQPValue>::default();
        existing.insert(
            ShortString::from("x-request-id"),
            AMQPValue::LongString(LongString::from("abc-123")),
        );
        let props = BasicProperties::default().with_headers(FieldTable::from(existing));

        let headers = failure_headers(&props, "handler failure: boom", 1_700_000_000_000);
        let inner = headers.inner();

        assert_eq!(
            inner.get("x-request-id"),
            Some(&AMQPValue::LongString(LongString::from("abc-123")))
        );
        assert_eq!(
            inner.get(AMQP_HEADERS_FAILED_REASON),
            Some(&AMQPValue::LongString(LongString::from(
                "handler failure: boom"
            )))
        );
        assert_eq!(
            inner.get(AMQP_HEADERS_FAILED_AT),
            Some(&AMQPValue::LongLongInt(1_700_000_000_000))
        );
    }

    #[tokio::test]
    async fn run_handler_invokes_the_handler_for_registered_keys() {
        let registry = Arc::new(
            RoutingKeyRegistry::new(vec![RoutingKey::new("order.created")]).unwrap(),
        );

        let mut mock = MockMessageHandler::new();
        mock.expect_handle()
            .withf(|key, body| key.key() == "order.created" && body == b"{}".as_slice())
            .once()
            .returning(|_, _| Ok(()));
        let handler: Arc<dyn MessageHandler> = Arc::new(mock);

        let result = run_handler(&registry, &handler, "order.created", b"{}").await;
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn run_handler_maps_unknown_keys_to_an_error_without_calling_the_handler() {
        let registry = Arc::new(
            RoutingKeyRegistry::new(vec![RoutingKey::new("order.created")]).unwrap(),
        );

        let mock = MockMessageHandler::new();
        let handler: Arc<dyn MessageHandler> = Arc::new(mock);

        let result = run_handler(&registry, &handler, "order.deleted", b"{}").await;
        assert_eq!(
            result,
            Err(AmqpError::UnknownRoutingKey("order.deleted".to_owned()))
        );
    }

    #[tokio::test]
    async fn run_handler_surfaces_handler_failures() {
        let registry = Arc::new(
            RoutingKeyRegistry::new(vec![RoutingKey::new("order.created")]).unwrap(),
        );

        let mut mock = MockMessageHandler::new();
        mock.expect_handle()
            .once()
            .returning(|_, _| Err(HandlerError::new("boom")));
        let handler: Arc<dyn MessageHandler> = Arc::new(mock);

        let result = run_handler(&registry, &handler, "order.created", b"{}").await;
        assert_eq!(result, Err(AmqpError::HandlerError("boom".to_owned())));
    }
}
