// Copyright (c) 2025, The Messenger Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! This module provides the error taxonomy for the messaging layer. The
//! `AmqpError` enum covers connection and channel establishment, topology
//! declaration, publishing, and consumer-side failures. `HandlerError` is the
//! error type application handlers use to signal that a delivery could not be
//! processed and must go through the escalation policy.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Propagation rules differ per group: connection errors are never surfaced
/// to callers (they feed the reconnect loop), publish errors bubble to the
/// caller after the retry budget is exhausted, and dispatch errors are fully
/// absorbed by the escalation policy.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error configuring the prefetch (flow-control) limit
    #[error("failure to configure qos")]
    QosError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingError(String, String),

    /// Topology configuration rejected at construction time
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// Error publishing a message, raised after all retry attempts failed
    #[error("failure to publish to exchange `{0}`")]
    PublishError(String),

    /// Error serializing or deserializing a message payload
    #[error("failure to encode or decode payload")]
    SerializationError,

    /// A delivery arrived with a routing key that was never registered
    #[error("unknown routing key `{0}`")]
    UnknownRoutingKey(String),

    /// Application handler failure, drives the escalation policy
    #[error("handler failure: {0}")]
    HandlerError(String),

    /// Error starting a consumer on a queue
    #[error("failure to consume from queue `{0}`")]
    ConsumerError(String),

    /// Error acknowledging a delivery
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a delivery
    #[error("failure to nack message")]
    NackMessageError,

    /// Error republishing a message to the terminal dead-letter sink
    #[error("failure to publish to the dead-letter sink")]
    DeadLetterPublishError,

    /// Operation attempted while the service is not connected
    #[error("service is not connected, current state `{0}`")]
    NotConnected(String),

    /// Lifecycle transition not allowed from the current state
    #[error("invalid state transition from `{0}` to `{1}`")]
    InvalidStateTransition(String, String),
}

/// Error returned by application message handlers.
///
/// Returning this from [`crate::handler::MessageHandler::handle`] marks the
/// delivery as failed and hands it to the retry escalation policy.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    /// Creates a handler error from any displayable reason.
    pub fn new(reason: impl Into<String>) -> Self {
        HandlerError(reason.into())
    }
}

impl From<HandlerError> for AmqpError {
    fn from(err: HandlerError) -> Self {
        AmqpError::HandlerError(err.0)
    }
}
