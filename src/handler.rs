// Copyright (c) 2025, The Messenger Authors
// MIT License
// All rights reserved.

//! # Handler and Codec Contracts
//!
//! This module defines the two collaborator interfaces of the messaging core:
//! the message handler invoked per delivery, and the payload codec used to
//! turn typed values into wire bytes. JSON is the default codec.

use crate::{errors::AmqpError, errors::HandlerError, routing::RoutingKey};
use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Application callback invoked for every inbound delivery.
///
/// The handler receives the resolved routing key and the raw message body.
/// Returning an error hands the delivery to the retry escalation policy;
/// handlers are expected to be idempotent since delivery is at-least-once.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes one delivery.
    async fn handle(&self, key: &RoutingKey, body: &[u8]) -> Result<(), HandlerError>;
}

/// Payload codec used by the publisher.
///
/// The codec works on [`serde_json::Value`] so it stays object-safe; typed
/// values go through `serde_json::to_value` before encoding.
pub trait Codec: Send + Sync {
    /// Content type stamped on published messages.
    fn content_type(&self) -> &str;

    /// Encodes a value into wire bytes.
    fn encode(&self, value: &serde_json::Value) -> Result<Vec<u8>, AmqpError>;

    /// Decodes wire bytes back into a value.
    fn decode(&self, data: &[u8]) -> Result<serde_json::Value, AmqpError>;
}

/// JSON implementation of the [`Codec`] trait.
#[derive(Debug, Clone, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &str {
        JSON_CONTENT_TYPE
    }

    fn encode(&self, value: &serde_json::Value) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(value).map_err(|_| AmqpError::SerializationError)
    }

    fn decode(&self, data: &[u8]) -> Result<serde_json::Value, AmqpError> {
        serde_json::from_slice(data).map_err(|_| AmqpError::SerializationError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_codec_round_trips_a_value() {
        let codec = JsonCodec;
        let value = json!({"id": 42, "status": "created"});

        let bytes = codec.encode(&value).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), value);
    }

    #[test]
    fn json_codec_rejects_malformed_payloads() {
        let codec = JsonCodec;
        assert_eq!(
            codec.decode(b"{not json"),
            Err(AmqpError::SerializationError)
        );
    }

    #[test]
    fn json_codec_reports_json_content_type() {
        assert_eq!(JsonCodec.content_type(), JSON_CONTENT_TYPE);
    }
}
