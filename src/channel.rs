// Copyright (c) 2025, The Messenger Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Establishment
//!
//! This module opens the broker connection and the channel the service works
//! on. The connection carries a logical name visible in the broker management
//! UI; the channel gets the configured prefetch limit applied by the caller.

use crate::{config::AmqpConfig, errors::AmqpError};
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tracing::{debug, error};

/// Creates a new AMQP channel for communication with RabbitMQ.
///
/// This function establishes a connection using the parameters in `cfg`, then
/// creates a channel on that connection. The connection carries
/// `connection_name` (the primary queue name unless configured otherwise) so
/// operators can tell instances apart in the management UI. Both handles are
/// wrapped in Arc for thread-safe sharing between the publish and dispatch
/// paths.
///
/// # Parameters
/// * `cfg` - Configuration containing connection details like host, port, credentials, etc.
/// * `connection_name` - Logical name attached to the connection
///
/// # Returns
/// * `Result<(Arc<Connection>, Arc<Channel>), AmqpError>` -
///   A tuple containing the connection and channel on success, or an error on failure.
pub async fn new_amqp_channel(
    cfg: &AmqpConfig,
    connection_name: &str,
) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(connection_name.to_owned()));

    let conn = match Connection::connect(&cfg.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError)
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((Arc::new(conn), Arc::new(c)))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError)
        }
    }
}
