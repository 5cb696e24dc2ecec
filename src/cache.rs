use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::singleflight;

/// One storage tier of the multi-level cache. Layers are ordered fastest
/// first; values are opaque serialized bytes.
#[async_trait]
pub trait CacheLayer: Send + Sync {
    fn name(&self) -> &'static str;
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> anyhow::Result<()>;
    async fn del(&self, key: &str) -> anyhow::Result<()>;
}

/// In-process tier with per-entry expiry.
pub struct MemoryLayer {
    entries: DashMap<String, (Vec<u8>, Instant)>,
}

impl MemoryLayer {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl Default for MemoryLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheLayer for MemoryLayer {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        if let Some(entry) = self.entries.get(key) {
            let (value, deadline) = entry.value();
            if Instant::now() < *deadline {
                return Ok(Some(value.clone()));
            }
        }
        self.entries.remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> anyhow::Result<()> {
        self.entries
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn del(&self, key: &str) -> anyhow::Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Shared tier backed by Redis.
pub struct RedisLayer {
    manager: redis::aio::ConnectionManager,
}

impl RedisLayer {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let manager = client
            .get_connection_manager()
            .await
            .context("failed to connect to redis")?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl CacheLayer for RedisLayer {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let mut conn = self.manager.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> anyhow::Result<()> {
        let mut conn = self.manager.clone();
        let secs = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(key, value, secs).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> anyhow::Result<()> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}

/// Read-through multi-level cache. Hits in a slower layer are backfilled
/// into the faster layers asynchronously; writes and deletes fan out to
/// every layer. Not on the execution path.
pub struct MultiCache<T> {
    layers: Vec<Arc<dyn CacheLayer>>,
    prefix: String,
    default_ttl: Duration,
    flight: singleflight::Group<Result<T, String>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> MultiCache<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(prefix: &str, default_ttl: Duration, layers: Vec<Arc<dyn CacheLayer>>) -> Self {
        Self {
            layers,
            prefix: prefix.to_string(),
            default_ttl,
            flight: singleflight::Group::new(),
            _marker: PhantomData,
        }
    }

    fn build_key(&self, key: &str) -> String {
        let compact: String = key.chars().filter(|c| !c.is_whitespace()).collect();
        format!("{}:{}", self.prefix, compact).to_uppercase()
    }

    pub async fn get(&self, key: &str) -> anyhow::Result<Option<T>> {
        let cache_key = self.build_key(key);
        for (idx, layer) in self.layers.iter().enumerate() {
            let raw = match layer.get(&cache_key).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(err) => {
                    warn!(layer = layer.name(), error = %err, "cache layer read failed");
                    continue;
                }
            };
            let value: T = match serde_json::from_slice(&raw) {
                Ok(value) => value,
                Err(err) => {
                    warn!(layer = layer.name(), error = %err, "cache entry failed to decode");
                    continue;
                }
            };
            if idx > 0 {
                self.backfill(cache_key.clone(), raw, idx);
            }
            return Ok(Some(value));
        }
        Ok(None)
    }

    /// Repopulates the faster layers after a hit further down the stack.
    fn backfill(&self, cache_key: String, raw: Vec<u8>, upto: usize) {
        let layers: Vec<Arc<dyn CacheLayer>> = self.layers[..upto].to_vec();
        let ttl = self.default_ttl;
        tokio::spawn(async move {
            for layer in layers {
                if let Err(err) = layer.set(&cache_key, raw.clone(), ttl).await {
                    warn!(layer = layer.name(), error = %err, "cache backfill failed");
                }
            }
        });
    }

    pub async fn set(&self, key: &str, value: &T, ttl: Duration) -> anyhow::Result<()> {
        let cache_key = self.build_key(key);
        let raw = serde_json::to_vec(value).context("failed to serialize cache value")?;
        for layer in &self.layers {
            if let Err(err) = layer.set(&cache_key, raw.clone(), ttl).await {
                warn!(layer = layer.name(), error = %err, "cache layer write failed");
            }
        }
        Ok(())
    }

    pub async fn del(&self, key: &str) -> anyhow::Result<()> {
        let cache_key = self.build_key(key);
        for layer in &self.layers {
            if let Err(err) = layer.del(&cache_key).await {
                warn!(layer = layer.name(), error = %err, "cache layer delete failed");
            }
        }
        Ok(())
    }

    /// Fetches from the source and stores the result in every layer.
    pub async fn get_or_fill<F, Fut>(&self, key: &str, source: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        let value = source().await.context("cache source function failed")?;
        self.set(key, &value, self.default_ttl).await?;
        Ok(value)
    }

    /// Read-through with single-flight refill: a cache miss runs the source
    /// at most once per key at a time; concurrent missers share the result.
    /// Source errors are not cached.
    pub async fn get_or_fill_coalesced<F, Fut>(&self, key: &str, source: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        if let Some(value) = self.get(key).await? {
            return Ok(value);
        }
        let result = self
            .flight
            .run(key, || async {
                match self.get_or_fill(key, source).await {
                    Ok(value) => Ok(value),
                    Err(err) => Err(err.to_string()),
                }
            })
            .await;
        result.map_err(|msg| anyhow::anyhow!(msg))
    }
}
