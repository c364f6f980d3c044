// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Redis.
//!
//! Provides helpers to spin up Redis containers for integration tests.

use cqrs_replication::config::BrokerConfig;
use cqrs_replication::resilience::RetryConfig;
use cqrs_replication::transport::redis_streams::RedisTransport;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

/// Create a vanilla Redis container (streams-compatible).
///
/// Uses official redis:7 image. Waits for "Ready to accept connections".
pub fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Get the Redis URL for a container.
pub fn redis_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(6379);
    format!("redis://127.0.0.1:{}", port)
}

/// A broker container plus a transport connected to it.
pub struct TestBroker<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub redis_url: String,
}

impl<'a> TestBroker<'a> {
    pub fn new(docker: &'a Cli) -> Self {
        let container = redis_container(docker);
        let redis_url = redis_url(&container);
        Self { container, redis_url }
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            redis_url: self.redis_url.clone(),
            key_prefix: Some("test:".to_string()),
            ..BrokerConfig::default()
        }
    }

    pub async fn transport(&self) -> RedisTransport {
        RedisTransport::connect(&self.broker_config(), &RetryConfig::testing())
            .await
            .expect("Failed to connect to test broker")
    }

    /// Length of a raw stream key.
    pub async fn stream_len(&self, key: &str) -> redis::RedisResult<usize> {
        let client = redis::Client::open(self.redis_url.as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        use redis::AsyncCommands;
        conn.xlen(key).await
    }

    /// Remaining TTL of a raw key in milliseconds (-1 none, -2 missing).
    pub async fn pttl(&self, key: &str) -> redis::RedisResult<i64> {
        let client = redis::Client::open(self.redis_url.as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        use redis::AsyncCommands;
        conn.pttl(key).await
    }
}
