// Copyright (c) 2025, The Messenger Authors
// MIT License
// All rights reserved.

//! # Trace Context Propagation
//!
//! Injects the active OpenTelemetry context into outgoing message headers and
//! restores it from inbound deliveries, so a publish and the handler run that
//! consumes it share one distributed trace.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, ShortString},
};
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

/// Adapter mapping AMQP header tables to the OpenTelemetry carrier traits.
pub(crate) struct AmqpTracePropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> AmqpTracePropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for AmqpTracePropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for AmqpTracePropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|err| error!(error = err.to_string(), "malformed trace header"))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Injects the given context into a header map about to be published.
pub(crate) fn inject_context(ctx: &Context, headers: &mut BTreeMap<ShortString, AMQPValue>) {
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut AmqpTracePropagator::new(headers))
    });
}

/// Extracts the upstream context from delivery properties and starts a
/// consumer span named after the routing key.
pub(crate) fn new_span(
    props: &AMQPProperties,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let mut headers = props
        .headers()
        .clone()
        .unwrap_or_default()
        .inner()
        .clone();

    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&AmqpTracePropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
