//! Redis-backed bus.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use super::{Bus, BusSubscription};
use crate::errors::{AgentError, Result};

fn bus_err(e: redis::RedisError) -> AgentError {
    AgentError::Bus(e.to_string())
}

pub struct RedisBus {
    client: redis::Client,
    manager: ConnectionManager,
}

impl RedisBus {
    /// Connect and build the auto-reconnecting command connection.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(bus_err)?;
        let manager = client.get_connection_manager().await.map_err(bus_err)?;
        Ok(Self { client, manager })
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn rpush(&self, queue: &str, payload: String) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.rpush::<_, _, ()>(queue, payload).await.map_err(bus_err)
    }

    async fn lpop(&self, queue: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        conn.lpop(queue, None).await.map_err(bus_err)
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(bus_err)
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn BusSubscription>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(bus_err)?;
        pubsub.subscribe(channel).await.map_err(bus_err)?;
        Ok(Box::new(RedisSubscription { pubsub }))
    }
}

pub struct RedisSubscription {
    pubsub: redis::aio::PubSub,
}

#[async_trait]
impl BusSubscription for RedisSubscription {
    async fn next_message(&mut self, timeout: Duration) -> Result<Option<String>> {
        let mut stream = self.pubsub.on_message();
        match tokio::time::timeout(timeout, stream.next()).await {
            Ok(Some(msg)) => {
                // Non-text payloads are dropped, not errors.
                match msg.get_payload::<String>() {
                    Ok(payload) => Ok(Some(payload)),
                    Err(_) => Ok(None),
                }
            }
            Ok(None) => Err(AgentError::Bus("subscription closed".into())),
            Err(_) => Ok(None),
        }
    }
}
