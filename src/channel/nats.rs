use super::transport::{Inbound, InboundStream, Transport};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use std::sync::RwLock;
use std::time::Duration;
use tracing::info;

/// Broker configuration
#[derive(Clone, Debug, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    /// First token of every agent subject
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
}

fn default_url() -> String {
    std::env::var("ARENA_BROKER_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string())
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_publish_timeout_ms() -> u64 {
    2000
}

fn default_subject_prefix() -> String {
    "pixelbot".to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            user: None,
            password: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            publish_timeout_ms: default_publish_timeout_ms(),
            subject_prefix: default_subject_prefix(),
        }
    }
}

impl BrokerConfig {
    /// Override URL and credentials from the environment, when set
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("ARENA_BROKER_URL") {
            self.url = url;
        }
        if let Ok(user) = std::env::var("ARENA_BROKER_USER") {
            self.user = Some(user);
        }
        if let Ok(password) = std::env::var("ARENA_BROKER_PASS") {
            self.password = Some(password);
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

/// NATS-backed transport
pub struct NatsTransport {
    config: BrokerConfig,
    client: RwLock<Option<async_nats::Client>>,
}

impl NatsTransport {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            client: RwLock::new(None),
        }
    }

    fn client(&self) -> Result<async_nats::Client> {
        self.client
            .read()
            .map_err(|_| anyhow!("NATS client lock poisoned"))?
            .clone()
            .context("Not connected to NATS")
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn connect(&self) -> Result<()> {
        info!("Connecting to NATS at {}", self.config.url);

        let mut options =
            async_nats::ConnectOptions::new().connection_timeout(self.config.connect_timeout());

        match (&self.config.user, &self.config.password) {
            (Some(user), Some(password)) => {
                info!("Using broker authentication");
                options = options.user_and_password(user.clone(), password.clone());
            }
            _ => info!("Not using broker authentication"),
        }

        let client = options
            .connect(self.config.url.as_str())
            .await
            .context("Failed to connect to NATS")?;

        *self
            .client
            .write()
            .map_err(|_| anyhow!("NATS client lock poisoned"))? = Some(client);

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client()
            .map(|c| {
                matches!(
                    c.connection_state(),
                    async_nats::connection::State::Connected
                )
            })
            .unwrap_or(false)
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        self.client()?
            .publish(subject.to_string(), payload.into())
            .await
            .with_context(|| format!("Failed to publish to subject '{}'", subject))
    }

    async fn flush(&self) -> Result<()> {
        self.client()?
            .flush()
            .await
            .context("Failed to flush NATS connection")
    }

    async fn subscribe(&self, subject: &str) -> Result<InboundStream> {
        let subscriber = self
            .client()?
            .subscribe(subject.to_string())
            .await
            .with_context(|| format!("Failed to subscribe to subject '{}'", subject))?;

        Ok(subscriber
            .map(|msg| Inbound {
                subject: msg.subject.to_string(),
                payload: String::from_utf8_lossy(&msg.payload).into_owned(),
            })
            .boxed())
    }
}
