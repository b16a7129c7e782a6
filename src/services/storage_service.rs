// src/services/storage_service.rs
use async_trait::async_trait;
use redis::Client;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing;

// Error types
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Operation error: {0}")]
    Operation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        match err.kind() {
            redis::ErrorKind::IoError => StoreError::Connection(err.to_string()),
            redis::ErrorKind::AuthenticationFailed => {
                StoreError::Connection("Authentication failed".to_string())
            }
            _ => StoreError::Operation(err.to_string()),
        }
    }
}

/// String key-value persistence shared by the request store and trip manager.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
    async fn remove_many(&self, keys: &[String]) -> Result<(), StoreError>;
    async fn get_all_keys(&self) -> Result<Vec<String>, StoreError>;

    /// Writes `value` only if the current value equals `expected`
    /// (`None` meaning the key must be absent). Returns whether it wrote.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, StoreError>;
}

/// Reads a JSON value, returning the raw string alongside it so callers can
/// compare-and-set against exactly what they read.
pub async fn read_json<T>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<(String, T)>, StoreError>
where
    T: DeserializeOwned,
{
    match store.get(key).await? {
        Some(raw) => {
            let value = serde_json::from_str(&raw)
                .map_err(|e| StoreError::Serialization(format!("{}: {}", key, e)))?;
            Ok(Some((raw, value)))
        }
        None => Ok(None),
    }
}

pub async fn write_json<T>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<(), StoreError>
where
    T: Serialize + ?Sized,
{
    let json = to_json(value)?;
    store.set(key, &json).await
}

pub fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

// Key layout, everything under one namespace
#[derive(Debug, Clone)]
pub struct StorageKeys {
    namespace: String,
}

impl StorageKeys {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self { namespace: namespace.into() }
    }

    fn compose(&self, parts: &[&str]) -> String {
        let mut key = self.namespace.clone();
        for part in parts {
            key.push(':');
            key.push_str(part);
        }
        key
    }

    pub fn request_prefix(&self) -> String {
        self.compose(&["request", ""])
    }

    pub fn request(&self, request_id: &str) -> String {
        self.compose(&["request", request_id])
    }

    pub fn user_requests(&self, user_id: &str) -> String {
        self.compose(&["user", user_id, "requests"])
    }

    pub fn user_active_request(&self, user_id: &str) -> String {
        self.compose(&["user", user_id, "active_request"])
    }

    pub fn active_trip(&self, user_id: &str) -> String {
        self.compose(&["user", user_id, "active_trip"])
    }

    pub fn trip_events_since(&self, user_id: &str) -> String {
        self.compose(&["user", user_id, "trip_events_since"])
    }

    /// Keys owned by the rider's trip session, cleared on teardown.
    pub fn user_trip_keys(&self, user_id: &str) -> Vec<String> {
        vec![self.active_trip(user_id), self.trip_events_since(user_id)]
    }
}

impl Default for StorageKeys {
    fn default() -> Self {
        Self::new("sparrow")
    }
}

// In-process store for development/testing
#[derive(Debug, Default)]
pub struct MemoryStore {
    store: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.store.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.store.write().await.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.store.write().await.remove(key);
        Ok(())
    }

    async fn remove_many(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut store = self.store.write().await;
        for key in keys {
            store.remove(key);
        }
        Ok(())
    }

    async fn get_all_keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.store.read().await.keys().cloned().collect())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, StoreError> {
        let mut store = self.store.write().await;
        if store.get(key).map(String::as_str) != expected {
            return Ok(false);
        }
        store.insert(key.to_string(), value.to_string());
        Ok(true)
    }
}

const COMPARE_AND_SET_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2])
    return 1
end
return 0
"#;

// Redis-backed store
pub struct RedisStore {
    connection: redis::aio::MultiplexedConnection,
    namespace: String,
    cas_script: redis::Script,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, namespace: impl Into<String>) -> Result<Self, StoreError> {
        let client = Client::open(redis_url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        tracing::info!("Connected to redis at {}", redis_url);

        Ok(Self {
            connection,
            namespace: namespace.into(),
            cas_script: redis::Script::new(COMPARE_AND_SET_SCRIPT),
        })
    }

    fn connection(&self) -> redis::aio::MultiplexedConnection {
        self.connection.clone()
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.connection();
        let _: () = redis::cmd("SET").arg(key).arg(value).query_async(&mut conn).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection();
        let _: () = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn remove_many(&self, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection();
        let _: () = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(())
    }

    async fn get_all_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection();
        let pattern = format!("{}:*", self.namespace);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
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

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection();
        match expected {
            None => {
                let written: Option<String> = redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .query_async(&mut conn)
                    .await?;
                Ok(written.is_some())
            }
            Some(expected) => {
                let written: i64 = self
                    .cas_script
                    .key(key)
                    .arg(expected)
                    .arg(value)
                    .invoke_async(&mut conn)
                    .await?;
                Ok(written == 1)
            }
        }
    }
}
