//! Shared key/value broker holding task lists, action locks and flash messages.

use crate::services::error::BillingError;
use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::Client;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Push a value onto the head of a list.
    async fn push(&self, list: &str, value: &str) -> Result<(), BillingError>;

    /// Pop a value from the tail of a list, waiting up to `timeout` for one to arrive.
    async fn pop(&self, list: &str, timeout: Duration) -> Result<Option<String>, BillingError>;

    /// Set `key` only if it does not exist. Returns whether the key was set.
    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, BillingError>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BillingError>;

    async fn get(&self, key: &str) -> Result<Option<String>, BillingError>;

    async fn get_del(&self, key: &str) -> Result<Option<String>, BillingError>;

    async fn del(&self, key: &str) -> Result<(), BillingError>;

    /// All keys matching a glob pattern (`*` wildcards only).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, BillingError>;

    async fn health_check(&self) -> Result<(), BillingError>;
}

pub struct RedisBroker {
    client: Client,
    manager: ConnectionManager,
    /// Dedicated connections for blocking pops, which would otherwise stall the
    /// multiplexed manager connection for their full timeout.
    blocking: tokio::sync::Mutex<Vec<MultiplexedConnection>>,
}

impl RedisBroker {
    pub async fn new(url: &str) -> Result<Self, BillingError> {
        tracing::info!("Connecting to Redis");
        let client = Client::open(url)?;

        // Use ConnectionManager for automatic reconnection
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to get Redis connection manager");
            e
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            client,
            manager,
            blocking: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    async fn checkout_blocking(&self) -> Result<MultiplexedConnection, BillingError> {
        if let Some(conn) = self.blocking.lock().await.pop() {
            return Ok(conn);
        }
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn push(&self, list: &str, value: &str) -> Result<(), BillingError> {
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(list)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn pop(&self, list: &str, timeout: Duration) -> Result<Option<String>, BillingError> {
        let mut conn = self.checkout_blocking().await?;
        let seconds = timeout.as_secs_f64().max(0.1);

        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(list)
            .arg(seconds)
            .query_async(&mut conn)
            .await?;

        // Only healthy connections go back to the pool
        self.blocking.lock().await.push(conn);
        Ok(popped.map(|(_, value)| value))
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, BillingError> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        let set: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(set.is_some())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BillingError> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BillingError> {
        let mut conn = self.manager.clone();
        Ok(redis::cmd("GET").arg(key).query_async(&mut conn).await?)
    }

    async fn get_del(&self, key: &str) -> Result<Option<String>, BillingError> {
        let mut conn = self.manager.clone();
        Ok(redis::cmd("GETDEL").arg(key).query_async(&mut conn).await?)
    }

    async fn del(&self, key: &str) -> Result<(), BillingError> {
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, BillingError> {
        let mut conn = self.manager.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    async fn health_check(&self) -> Result<(), BillingError> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryState {
    lists: HashMap<String, VecDeque<String>>,
    values: HashMap<String, (String, Option<Instant>)>,
    unavailable: bool,
}

impl MemoryState {
    fn check_available(&self) -> Result<(), BillingError> {
        if self.unavailable {
            return Err(BillingError::Internal(anyhow::anyhow!("broker unavailable")));
        }
        Ok(())
    }

    fn live_value(&mut self, key: &str) -> Option<&String> {
        let expired = matches!(
            self.values.get(key),
            Some((_, Some(expires))) if *expires <= Instant::now()
        );
        if expired {
            self.values.remove(key);
        }
        self.values.get(key).map(|(value, _)| value)
    }
}

/// In-process broker with the same list and key semantics as Redis.
pub struct MemoryBroker {
    state: Mutex<MemoryState>,
    pushed: Notify,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            pushed: Notify::new(),
        }
    }

    /// Make every subsequent operation fail, as if the broker went away.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.unavailable = unavailable;
        }
        self.pushed.notify_waiters();
    }

    pub fn list_len(&self, list: &str) -> usize {
        self.state
            .lock()
            .map(|state| state.lists.get(list).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }

    /// Snapshot of a list, head first.
    pub fn list_items(&self, list: &str) -> Vec<String> {
        self.state
            .lock()
            .map(|state| {
                state
                    .lists
                    .get(list)
                    .map(|items| items.iter().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, BillingError> {
        let state = self
            .state
            .lock()
            .map_err(|e| BillingError::Internal(anyhow::anyhow!("Memory broker mutex poisoned: {}", e)))?;
        state.check_available()?;
        Ok(state)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn push(&self, list: &str, value: &str) -> Result<(), BillingError> {
        {
            let mut state = self.state()?;
            state
                .lists
                .entry(list.to_string())
                .or_default()
                .push_front(value.to_string());
        }
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn pop(&self, list: &str, timeout: Duration) -> Result<Option<String>, BillingError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.pushed.notified();
            let popped = {
                let mut state = self.state()?;
                state.lists.get_mut(list).and_then(VecDeque::pop_back)
            };
            if let Some(value) = popped {
                return Ok(Some(value));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, BillingError> {
        let mut state = self.state()?;
        if state.live_value(key).is_some() {
            return Ok(false);
        }
        let expires = ttl.map(|ttl| Instant::now() + ttl);
        state
            .values
            .insert(key.to_string(), (value.to_string(), expires));
        Ok(true)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BillingError> {
        self.state()?.values.insert(
            key.to_string(),
            (value.to_string(), Some(Instant::now() + ttl)),
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BillingError> {
        Ok(self.state()?.live_value(key).cloned())
    }

    async fn get_del(&self, key: &str) -> Result<Option<String>, BillingError> {
        let mut state = self.state()?;
        let value = state.live_value(key).cloned();
        state.values.remove(key);
        Ok(value)
    }

    async fn del(&self, key: &str) -> Result<(), BillingError> {
        self.state()?.values.remove(key);
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, BillingError> {
        let mut state = self.state()?;
        let candidates: Vec<String> = state.values.keys().cloned().collect();
        let mut keys: Vec<String> = candidates
            .into_iter()
            .filter(|key| glob_match(pattern, key))
            .filter(|key| state.live_value(key).is_some())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn health_check(&self) -> Result<(), BillingError> {
        self.state().map(|_| ())
    }
}

/// Match `key` against a pattern where `*` matches any run of characters.
fn glob_match(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !key.starts_with(first) || key.len() < first.len() + last.len() {
        return false;
    }

    let mut rest = &key[first.len()..key.len() - last.len()];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    key.ends_with(last)
}
