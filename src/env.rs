// src/env.rs
use std::env;

use anyhow::{Context, Result};
use dotenv::dotenv;
use tracing::debug;

use crate::config::{self, RabbitConfig};

pub const AMQP_ADDR: &str = "AMQP_ADDR";
pub const RABBITMQ_QUEUE: &str = "RABBITMQ_QUEUE";
pub const RABBITMQ_EXCHANGE: &str = "RABBITMQ_EXCHANGE";
pub const RABBITMQ_PREFETCH_COUNT: &str = "RABBITMQ_PREFETCH_COUNT";
pub const RABBITMQ_RECONNECT_ATTEMPTS: &str = "RABBITMQ_RECONNECT_ATTEMPTS";
pub const RABBITMQ_RECONNECT_DELAY_MS: &str = "RABBITMQ_RECONNECT_DELAY_MS";

/// Load the configuration file if one exists, then apply `.env` and
/// environment overrides on top of it.
pub fn load() -> Result<RabbitConfig> {
    dotenv().ok();

    let mut config = match config::find_config_file() {
        Ok(path) => config::load_config_from(&path)?,
        Err(_) => {
            debug!("No config file found, using defaults");
            RabbitConfig::default()
        }
    };

    apply_overrides(&mut config, |key| env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

pub fn apply_overrides<F>(config: &mut RabbitConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(uri) = lookup(AMQP_ADDR) {
        config.connection.uri = uri;
    }
    if let Some(queue) = lookup(RABBITMQ_QUEUE) {
        config.consumer.queue = queue;
    }
    if let Some(exchange) = lookup(RABBITMQ_EXCHANGE) {
        config.publisher.exchange = exchange;
    }
    if let Some(val) = lookup(RABBITMQ_PREFETCH_COUNT) {
        config.consumer.prefetch = val
            .parse()
            .with_context(|| format!("{} must be a number", RABBITMQ_PREFETCH_COUNT))?;
    }
    if let Some(val) = lookup(RABBITMQ_RECONNECT_ATTEMPTS) {
        config.connection.reconnect.max_attempts = val
            .parse()
            .with_context(|| format!("{} must be a number", RABBITMQ_RECONNECT_ATTEMPTS))?;
    }
    if let Some(val) = lookup(RABBITMQ_RECONNECT_DELAY_MS) {
        config.connection.reconnect.delay_ms = val
            .parse()
            .with_context(|| format!("{} must be a number", RABBITMQ_RECONNECT_DELAY_MS))?;
    }
    Ok(())
}
