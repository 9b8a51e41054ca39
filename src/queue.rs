// Copyright (c) 2025, The Messenger Authors
// MIT License
// All rights reserved.

//! # Queue Descriptors
//!
//! This module provides the queue descriptor used by the topology declarer.
//! The shared queue of a service is durable by default; the per-instance
//! fan-out queue is server-named, exclusive and auto-deleted. The retry
//! buffer of a queue is derived as `<name>-dlx`.

use crate::exchange::DLX_SUFFIX;

/// Definition of a queue with its declaration parameters.
#[derive(Debug, Clone)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) auto_delete: bool,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is durable, non-exclusive, and never auto-deleted,
    /// which is what the shared work queue of a service needs.
    ///
    /// # Parameters
    /// * `name` - The name of the queue
    ///
    /// # Returns
    /// A new queue definition with default settings
    pub fn new(name: impl Into<String>) -> QueueDefinition {
        QueueDefinition {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// Creates the descriptor of a server-named exclusive queue, used for the
    /// per-instance fan-out bindings. The broker assigns the name.
    pub(crate) fn exclusive_server_named() -> QueueDefinition {
        QueueDefinition {
            name: String::new(),
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }

    /// Drops durability, keeping messages in memory only.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Makes the queue exclusive to the declaring connection.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Deletes the queue when the last consumer goes away.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// The queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the retry-buffer queue paired with this queue.
    pub fn dlx_name(&self) -> String {
        format!("{}{}", self.name, DLX_SUFFIX)
    }

    /// Whether the quorum queue type may be applied: quorum queues must be
    /// durable and non-exclusive.
    pub(crate) fn supports_quorum(&self) -> bool {
        self.durable && !self.exclusive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_a_durable_shared_queue() {
        let queue = QueueDefinition::new("orders");

        assert!(queue.durable);
        assert!(!queue.exclusive);
        assert!(!queue.auto_delete);
        assert_eq!(queue.dlx_name(), "orders-dlx");
    }

    #[test]
    fn quorum_requires_durable_and_non_exclusive() {
        assert!(QueueDefinition::new("orders").supports_quorum());
        assert!(!QueueDefinition::new("orders").transient().supports_quorum());
        assert!(!QueueDefinition::new("orders").exclusive().supports_quorum());
        assert!(!QueueDefinition::exclusive_server_named().supports_quorum());
    }
}
