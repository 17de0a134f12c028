use super::transport::{Inbound, InboundStream, Transport};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::info;

/// A payload captured by [`MemoryTransport`]
#[derive(Clone, Debug, PartialEq)]
pub struct Published {
    pub subject: String,
    pub payload: String,
}

/// In-process broker stand-in.
///
/// Records every publish and lets callers inject inbound messages. Used for
/// dry runs (nothing leaves the process) and by tests, which can also make
/// connects hang or fail and drop the connection.
#[derive(Default)]
pub struct MemoryTransport {
    connected: AtomicBool,
    refuse_connect: AtomicBool,
    hang_connect: AtomicBool,
    failing_publishes: AtomicU32,
    connects: AtomicU32,
    published: Mutex<Vec<Published>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Inbound>>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make future connects fail immediately
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    /// Make future connects never complete
    pub fn hang_connections(&self, hang: bool) {
        self.hang_connect.store(hang, Ordering::SeqCst);
    }

    /// Fail the next `count` publishes with a transport error
    pub fn fail_next_publishes(&self, count: u32) {
        self.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Simulate losing the broker: ends every inbound stream
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.clear();
        }
    }

    /// Deliver a message to every live subscription on `subject`.
    ///
    /// Returns the number of subscriptions reached.
    pub fn deliver(&self, subject: &str, payload: &str) -> usize {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return 0;
        };
        let Some(senders) = subscribers.get_mut(subject) else {
            return 0;
        };

        senders.retain(|tx| {
            tx.send(Inbound {
                subject: subject.to_string(),
                payload: payload.to_string(),
            })
            .is_ok()
        });
        senders.len()
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Payloads published to one subject, oldest first
    pub fn published_to(&self, subject: &str) -> Vec<String> {
        self.published()
            .into_iter()
            .filter(|p| p.subject == subject)
            .map(|p| p.payload)
            .collect()
    }

    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<()> {
        if self.hang_connect.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        if self.refuse_connect.load(Ordering::SeqCst) {
            bail!("connection refused");
        }

        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        if !self.is_connected() {
            bail!("not connected");
        }

        let failing = self.failing_publishes.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_publishes.store(failing - 1, Ordering::SeqCst);
            bail!("injected publish failure");
        }

        let payload = String::from_utf8_lossy(&payload).into_owned();
        info!(subject = %subject, payload = %payload, "Publish (in-memory)");

        self.published
            .lock()
            .map_err(|_| anyhow!("publish log lock poisoned"))?
            .push(Published {
                subject: subject.to_string(),
                payload,
            });
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        if !self.is_connected() {
            bail!("not connected");
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<InboundStream> {
        if !self.is_connected() {
            bail!("not connected");
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .map_err(|_| anyhow!("subscriber table lock poisoned"))?
            .entry(subject.to_string())
            .or_default()
            .push(tx);

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}
