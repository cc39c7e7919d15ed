// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation of AMQP connections and channels. Connecting
//! is retried with bounded exponential backoff before the failure is surfaced.

use crate::{amqp::AmqpChannel, errors::AmqpError, settings::BrokerSettings};
use lapin::{
    options::ConfirmSelectOptions, types::LongString, Channel, Connection, ConnectionProperties,
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, warn};

/// Builds the AMQP URI for the configured broker.
///
/// The vhost path segment is omitted for the default `/` vhost.
pub fn amqp_uri(cfg: &BrokerSettings) -> String {
    let base = format!(
        "amqp://{}:{}@{}:{}",
        cfg.user, cfg.password, cfg.host, cfg.port
    );

    match cfg.vhost.as_str() {
        "" | "/" => base,
        vhost => format!("{}/{}", base, vhost),
    }
}

/// Delay before the given (1-based) retry attempt.
pub fn backoff_delay(cfg: &BrokerSettings, attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(
        cfg.retry_backoff_ms
            .saturating_mul(factor)
            .min(cfg.max_backoff_ms),
    )
}

/// Connects to the broker, retrying up to `connect_attempts` times.
pub async fn connect(cfg: &BrokerSettings) -> Result<Connection, AmqpError> {
    let uri = amqp_uri(cfg);
    let attempts = cfg.connect_attempts.max(1);
    let mut attempt = 1;

    loop {
        debug!(
            host = %cfg.host,
            port = cfg.port,
            attempt,
            "creating amqp connection..."
        );

        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.connection_name.clone()));

        match Connection::connect(&uri, options).await {
            Ok(conn) => {
                debug!("amqp connected");
                return Ok(conn);
            }
            Err(err) if attempt < attempts => {
                let delay = backoff_delay(cfg, attempt);
                warn!(
                    error = err.to_string(),
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    "failure to connect, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                error!(error = err.to_string(), attempt, "failure to connect");
                return Err(AmqpError::ConnectionError(err.to_string()));
            }
        }
    }
}

/// Opens a channel on `conn`, enabling publisher confirms when configured.
pub async fn open_channel(conn: &Connection, cfg: &BrokerSettings) -> Result<Channel, AmqpError> {
    debug!("creating amqp channel...");
    let channel = match conn.create_channel().await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError)
        }
    }?;

    if cfg.publisher_confirms {
        if let Err(err) = channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
        {
            error!(error = err.to_string(), "error to enable publisher confirms");
            return Err(AmqpError::ChannelError);
        }
    }

    debug!("channel created");
    Ok(channel)
}

/// Creates a new AMQP channel for communication with RabbitMQ.
///
/// The connection is returned alongside the channel so the caller controls its
/// lifetime; dropping it closes the channel.
pub async fn new_amqp_channel(
    cfg: &BrokerSettings,
) -> Result<(Arc<Connection>, Arc<AmqpChannel>), AmqpError> {
    let conn = connect(cfg).await?;
    let channel = open_channel(&conn, cfg).await?;

    Ok((
        Arc::new(conn),
        Arc::new(AmqpChannel::new(channel, cfg.publisher_confirms)),
    ))
}
