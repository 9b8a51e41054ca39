// Copyright (c) 2025, The Messenger Authors
// MIT License
// All rights reserved.

//! # Exchange Descriptors
//!
//! This module defines the exchange kinds supported by the messaging layer
//! and the immutable exchange descriptor with its derived resource names.
//! Delayed delivery is modeled as a kind injected at construction time rather
//! than a service variant: a delayed exchange declares itself with the
//! `x-delayed-message` plugin type and carries the underlying routing type in
//! the `x-delayed-type` argument.

use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};

/// Argument carrying the underlying type of a delayed exchange
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";
/// Suffix of the retry-buffer exchange/queue pair
pub const DLX_SUFFIX: &str = "-dlx";
/// Suffix of the terminal dead-letter exchange/queue pair
pub const DEAD_SUFFIX: &str = "-dead";

/// Routing behavior of an exchange.
///
/// The delayed variants require the `x-delayed-message` plugin on the broker
/// and defer routing until the per-message `x-delay` offset elapses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    DirectDelayed,
    FanoutDelayed,
}

impl ExchangeKind {
    /// Whether this kind supports scheduled publishing.
    pub fn is_delayed(&self) -> bool {
        matches!(
            self,
            ExchangeKind::DirectDelayed | ExchangeKind::FanoutDelayed
        )
    }

    /// The underlying routing type, as the broker names it.
    pub(crate) fn routing_type(&self) -> &'static str {
        match self {
            ExchangeKind::Direct | ExchangeKind::DirectDelayed => "direct",
            ExchangeKind::Fanout | ExchangeKind::FanoutDelayed => "fanout",
        }
    }

    /// The plain (never delayed) kind, used for the derived retry exchange.
    pub(crate) fn undelayed(&self) -> lapin::ExchangeKind {
        match self {
            ExchangeKind::Direct | ExchangeKind::DirectDelayed => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout | ExchangeKind::FanoutDelayed => lapin::ExchangeKind::Fanout,
        }
    }

    /// The kind passed to the declare call.
    pub(crate) fn as_lapin(&self) -> lapin::ExchangeKind {
        match self {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::DirectDelayed | ExchangeKind::FanoutDelayed => {
                lapin::ExchangeKind::Custom("x-delayed-message".to_owned())
            }
        }
    }

    /// Declaration arguments for this kind. Delayed exchanges carry their
    /// underlying routing type, others declare with no arguments.
    pub(crate) fn declare_arguments(&self) -> FieldTable {
        let mut arguments = FieldTable::default();
        if self.is_delayed() {
            arguments.insert(
                ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
                AMQPValue::LongString(LongString::from(self.routing_type())),
            );
        }
        arguments
    }
}

/// Immutable descriptor of the primary exchange.
///
/// All exchanges in this design are durable. The shared queue and the derived
/// retry/dead resources take their names from the exchange name.
#[derive(Debug, Clone)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
}

impl ExchangeDefinition {
    /// Creates a new exchange definition with the given name.
    ///
    /// The exchange defaults to direct routing; use the builder methods to
    /// pick another kind.
    ///
    /// # Parameters
    /// * `name` - The name of the exchange
    ///
    /// # Returns
    /// A new direct exchange definition
    pub fn new(name: impl Into<String>) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.into(),
            kind: ExchangeKind::Direct,
        }
    }

    /// Sets the exchange kind.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the exchange kind to fanout.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn fanout(mut self) -> Self {
        self.kind = ExchangeKind::Fanout;
        self
    }

    /// Sets the exchange kind to delayed direct. Requires the
    /// `x-delayed-message` plugin on the broker.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn direct_delayed(mut self) -> Self {
        self.kind = ExchangeKind::DirectDelayed;
        self
    }

    /// Sets the exchange kind to delayed fanout. Requires the
    /// `x-delayed-message` plugin on the broker.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn fanout_delayed(mut self) -> Self {
        self.kind = ExchangeKind::FanoutDelayed;
        self
    }

    /// The exchange name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configured kind.
    pub fn exchange_kind(&self) -> ExchangeKind {
        self.kind
    }

    /// Name of the retry-buffer exchange/queue pair.
    pub fn dlx_name(&self) -> String {
        format!("{}{}", self.name, DLX_SUFFIX)
    }

    /// Name of the terminal dead-letter exchange/queue pair.
    pub fn dead_name(&self) -> String {
        format!("{}{}", self.name, DEAD_SUFFIX)
    }
}

/// Derives the terminal sink name for any exchange name. Used on the consumer
/// side, where only the originating exchange of a delivery is known.
pub(crate) fn dead_name_for(exchange: &str) -> String {
    format!("{exchange}{DEAD_SUFFIX}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_kinds_map_to_builtin_lapin_kinds() {
        assert!(matches!(
            ExchangeKind::Direct.as_lapin(),
            lapin::ExchangeKind::Direct
        ));
        assert!(matches!(
            ExchangeKind::Fanout.as_lapin(),
            lapin::ExchangeKind::Fanout
        ));
        assert!(ExchangeKind::Direct.declare_arguments().inner().is_empty());
    }

    #[test]
    fn delayed_kinds_use_the_plugin_type_and_carry_the_routing_type() {
        for (kind, routing_type) in [
            (ExchangeKind::DirectDelayed, "direct"),
            (ExchangeKind::FanoutDelayed, "fanout"),
        ] {
            assert!(matches!(
                kind.as_lapin(),
                lapin::ExchangeKind::Custom(custom) if custom == "x-delayed-message"
            ));

            let arguments = kind.declare_arguments();
            assert_eq!(
                arguments.inner().get(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
                Some(&AMQPValue::LongString(LongString::from(routing_type)))
            );
        }
    }

    #[test]
    fn derived_names_follow_the_suffix_convention() {
        let exchange = ExchangeDefinition::new("orders");

        assert_eq!(exchange.dlx_name(), "orders-dlx");
        assert_eq!(exchange.dead_name(), "orders-dead");
        assert_eq!(dead_name_for("orders"), "orders-dead");
    }
}
