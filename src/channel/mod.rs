// Command channel: publish commands to agents, route their status messages

mod command;
mod error;
mod memory;
mod nats;
mod transport;

pub use command::{
    Addressing, Command, CommandKind, Instruction, COMMAND_PREFIX, DISTANCE_VARIABLE,
    TURN_VARIABLE,
};
pub use error::{ConnectError, PublishError, SubscribeError};
pub use memory::{MemoryTransport, Published};
pub use nats::{BrokerConfig, NatsTransport};
pub use transport::{Inbound, InboundStream, Transport};

use dashmap::DashMap;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

#[cfg(test)]
mod tests;

/// Handler for payloads arriving on one address: `(address, payload)`
pub type Callback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Result of a successful connect
#[derive(Debug, Clone, PartialEq)]
pub struct Connected {
    /// Addresses whose subscriptions were restored
    pub resubscribed: usize,
}

/// Result of a successful publish
#[derive(Debug, Clone, PartialEq)]
pub struct Sent {
    pub address: String,
    pub bytes: usize,
    /// The broker confirmed receipt (flushed) before returning
    pub confirmed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subscribed {
    pub address: String,
    /// An earlier callback for this address was replaced
    pub replaced: bool,
}

/// What happened to an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Delivered,
    /// No callback registered; message discarded
    Unrouted,
}

/// Address -> callback table shared with the inbound pump tasks
#[derive(Default)]
struct RouteTable {
    callbacks: DashMap<String, Callback>,
    delivered: AtomicU64,
    unrouted: AtomicU64,
}

impl RouteTable {
    fn dispatch(&self, address: &str, payload: &str) -> Dispatch {
        // clone out so the callback runs without holding the shard lock
        let callback = self.callbacks.get(address).map(|c| Arc::clone(c.value()));

        match callback {
            Some(callback) => {
                callback(address, payload);
                self.delivered.fetch_add(1, Ordering::Relaxed);
                Dispatch::Delivered
            }
            None => {
                self.unrouted.fetch_add(1, Ordering::Relaxed);
                warn!(address = %address, payload = %payload, "No callback registered, message discarded");
                Dispatch::Unrouted
            }
        }
    }
}

/// Reliable command delivery to agent addresses plus routed inbound delivery.
///
/// Cheap to clone; clones share the connection, routes and pump tasks.
///
/// - `connect` is bounded by the connect timeout and restores every
///   registered subscription.
/// - `publish` reconnects once on failure and always reports the outcome.
/// - `subscribe` keeps one callback per address; a second subscribe
///   replaces the first.
#[derive(Clone)]
pub struct CommandChannel {
    transport: Arc<dyn Transport>,
    routes: Arc<RouteTable>,
    /// address -> task feeding that subscription into the route table
    pumps: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    /// Serialises connects so concurrent failures trigger one reconnect
    connect_lock: Arc<tokio::sync::Mutex<()>>,
    connect_timeout: Duration,
    publish_timeout: Duration,
}

impl CommandChannel {
    pub fn new(
        transport: Arc<dyn Transport>,
        connect_timeout: Duration,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            routes: Arc::new(RouteTable::default()),
            pumps: Arc::new(Mutex::new(HashMap::new())),
            connect_lock: Arc::new(tokio::sync::Mutex::new(())),
            connect_timeout,
            publish_timeout,
        }
    }

    pub fn from_config(transport: Arc<dyn Transport>, config: &BrokerConfig) -> Self {
        Self::new(transport, config.connect_timeout(), config.publish_timeout())
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Connect to the broker, then restore every registered subscription
    pub async fn connect(&self) -> Result<Connected, ConnectError> {
        let _guard = self.connect_lock.lock().await;
        let started = Instant::now();

        info!("Trying to connect to the broker");

        match timeout(self.connect_timeout, self.transport.connect()).await {
            Err(_) => {
                error!(
                    timeout_ms = self.connect_timeout.as_millis() as u64,
                    "Broker connect timed out"
                );
                return Err(ConnectError::Timeout(self.connect_timeout));
            }
            Ok(Err(e)) => {
                error!(error = %e, "Broker connect failed");
                return Err(ConnectError::Refused(format!("{:#}", e)));
            }
            Ok(Ok(())) => {}
        }

        let addresses: Vec<String> = self
            .routes
            .callbacks
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        for address in &addresses {
            self.attach(address)
                .await
                .map_err(|e| ConnectError::Resubscribe {
                    address: address.clone(),
                    reason: e.to_string(),
                })?;
        }

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            resubscribed = addresses.len(),
            "Connected to broker"
        );

        Ok(Connected {
            resubscribed: addresses.len(),
        })
    }

    /// Publish `payload` to `address`.
    ///
    /// With `require_ack` the call returns only after the broker confirmed
    /// receipt. On failure (or with no connection) one reconnect is
    /// attempted before the error is returned.
    pub async fn publish(
        &self,
        address: &str,
        payload: &str,
        require_ack: bool,
    ) -> Result<Sent, PublishError> {
        if self.transport.is_connected() {
            match self.send(address, payload, require_ack).await {
                Ok(sent) => return Ok(sent),
                Err(e) => warn!(address = %address, error = %e, "Publish failed, reconnecting"),
            }
        } else {
            warn!(address = %address, "Broker not connected, reconnecting before publish");
        }

        self.connect()
            .await
            .map_err(|source| PublishError::Reconnect {
                address: address.to_string(),
                source,
            })?;

        self.send(address, payload, require_ack).await
    }

    /// Publish an encoded command
    pub async fn publish_command(
        &self,
        address: &str,
        command: &Command,
    ) -> Result<Sent, PublishError> {
        debug!(
            agent_id = command.agent_id,
            kind = %command.kind(),
            address = %address,
            "Sending command"
        );
        self.publish(address, &command.payload(), command.require_ack)
            .await
    }

    async fn send(
        &self,
        address: &str,
        payload: &str,
        require_ack: bool,
    ) -> Result<Sent, PublishError> {
        let attempt = async {
            self.transport
                .publish(address, payload.as_bytes().to_vec())
                .await?;
            if require_ack {
                self.transport.flush().await?;
            }
            Ok::<(), anyhow::Error>(())
        };

        match timeout(self.publish_timeout, attempt).await {
            Err(_) => Err(PublishError::Timeout {
                address: address.to_string(),
                timeout: self.publish_timeout,
            }),
            Ok(Err(e)) => Err(PublishError::Transport {
                address: address.to_string(),
                reason: format!("{:#}", e),
            }),
            Ok(Ok(())) => {
                debug!(address = %address, bytes = payload.len(), "Published");
                Ok(Sent {
                    address: address.to_string(),
                    bytes: payload.len(),
                    confirmed: require_ack,
                })
            }
        }
    }

    /// Run `callback` for every payload arriving on `address`.
    ///
    /// Replaces any callback already registered for the address. The
    /// registration survives reconnects even if this call fails.
    pub async fn subscribe(
        &self,
        address: &str,
        callback: Callback,
    ) -> Result<Subscribed, SubscribeError> {
        let replaced = self
            .routes
            .callbacks
            .insert(address.to_string(), callback)
            .is_some();

        if replaced {
            info!(address = %address, "Replaced existing callback");
        } else {
            info!(address = %address, "Callback registered");
        }

        let subscribed = Subscribed {
            address: address.to_string(),
            replaced,
        };

        if !self.transport.is_connected() {
            // connect() attaches every registered address, this one included
            self.connect()
                .await
                .map_err(|source| SubscribeError::Connect {
                    address: address.to_string(),
                    source,
                })?;
            return Ok(subscribed);
        }

        if replaced && self.has_live_pump(address) {
            return Ok(subscribed);
        }

        self.attach(address).await?;
        Ok(subscribed)
    }

    /// Drop the callback and broker subscription for `address`
    pub fn unsubscribe(&self, address: &str) -> bool {
        let removed = self.routes.callbacks.remove(address).is_some();
        if let Ok(mut pumps) = self.pumps.lock() {
            if let Some(pump) = pumps.remove(address) {
                pump.abort();
            }
        }
        if removed {
            info!(address = %address, "Callback removed");
        }
        removed
    }

    /// Route one inbound payload to the callback registered for `address`
    pub fn on_message(&self, address: &str, payload: &str) -> Dispatch {
        self.routes.dispatch(address, payload)
    }

    /// Inbound messages delivered to a callback since startup
    pub fn delivered_count(&self) -> u64 {
        self.routes.delivered.load(Ordering::Relaxed)
    }

    /// Inbound messages discarded for lack of a callback since startup
    pub fn unrouted_count(&self) -> u64 {
        self.routes.unrouted.load(Ordering::Relaxed)
    }

    fn has_live_pump(&self, address: &str) -> bool {
        self.pumps
            .lock()
            .map(|pumps| pumps.get(address).is_some_and(|p| !p.is_finished()))
            .unwrap_or(false)
    }

    /// Open a broker subscription for `address` and pump it into the routes
    async fn attach(&self, address: &str) -> Result<(), SubscribeError> {
        let mut stream = match timeout(self.connect_timeout, self.transport.subscribe(address)).await
        {
            Err(_) => {
                return Err(SubscribeError::Timeout {
                    address: address.to_string(),
                    timeout: self.connect_timeout,
                })
            }
            Ok(Err(e)) => {
                return Err(SubscribeError::Transport {
                    address: address.to_string(),
                    reason: format!("{:#}", e),
                })
            }
            Ok(Ok(stream)) => stream,
        };

        let routes = Arc::clone(&self.routes);
        let pump_address = address.to_string();
        let pump = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                debug!(address = %msg.subject, payload = %msg.payload, "Inbound message");
                routes.dispatch(&msg.subject, &msg.payload);
            }
            debug!(address = %pump_address, "Inbound stream ended");
        });

        if let Ok(mut pumps) = self.pumps.lock() {
            if let Some(old) = pumps.insert(address.to_string(), pump) {
                old.abort();
            }
        }

        debug!(address = %address, "Subscribed");
        Ok(())
    }
}
