use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{BrokerError, MessageBroker};

/// A message accepted by [`InMemoryBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct State {
    connected: bool,
    connect_attempts: u32,
    failing_connects: u32,
    failing_routing_keys: HashSet<String>,
    published: Vec<PublishedMessage>,
    closed: u32,
}

/// Recording broker for tests and local runs.
///
/// Failures can be scripted: the next `n` connection attempts, or every
/// publish with a given routing key.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<State>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.state().failing_connects = n;
    }

    pub fn fail_routing_key(&self, routing_key: impl Into<String>) {
        self.state().failing_routing_keys.insert(routing_key.into());
    }

    pub fn heal_routing_key(&self, routing_key: &str) {
        self.state().failing_routing_keys.remove(routing_key);
    }

    /// Simulate the broker dropping the connection.
    pub fn disconnect(&self) {
        self.state().connected = false;
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state().connect_attempts
    }

    pub fn close_count(&self) -> u32 {
        self.state().closed
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        let mut state = self.state();
        if state.connected {
            return Ok(());
        }
        state.connect_attempts += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(BrokerError::Connection("connection refused".to_string()));
        }
        state.connected = true;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.state().connected
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let mut state = self.state();
        if !state.connected {
            return Err(BrokerError::NotConnected);
        }
        if state.failing_routing_keys.contains(routing_key) {
            return Err(BrokerError::Publish {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                reason: "nack".to_string(),
            });
        }
        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.state();
        state.connected = false;
        state.closed += 1;
        Ok(())
    }
}
