use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::metrics::MetricsRegistry;
use crate::ringbuf::RingBuffer;
use crate::sandbox::backend::ContainerBackend;
use crate::sandbox::language::{Language, LanguageRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Creating,
    Pending,
    Running,
    Releasing,
    Idle,
    Destroying,
}

#[derive(Debug, Clone)]
pub struct PooledContainer {
    pub id: String,
    pub image: String,
    pub language: Language,
    pub status: ContainerStatus,
    pub last_used: Instant,
}

/// Handle to an acquired container. The holder must call
/// [`ContainerPool::release`] when done; the pool keeps the record.
#[derive(Debug, Clone)]
pub struct ContainerLease {
    pub id: String,
    pub language: Language,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_per_lang: usize,
    pub reserved_per_lang: usize,
    pub idle_timeout: Duration,
}

/// Per-language pools of reusable containers. A single coarse lock guards
/// all buffers; it is held across container create/start on the slow path.
pub struct ContainerPool {
    buffers: Mutex<HashMap<Language, RingBuffer<PooledContainer>>>,
    backend: Arc<dyn ContainerBackend>,
    registry: Arc<LanguageRegistry>,
    metrics: Arc<MetricsRegistry>,
    config: PoolConfig,
}

fn sh(cmd: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), cmd.to_string()]
}

impl ContainerPool {
    pub fn new(
        config: PoolConfig,
        backend: Arc<dyn ContainerBackend>,
        registry: Arc<LanguageRegistry>,
        metrics: Arc<MetricsRegistry>,
    ) -> anyhow::Result<Self> {
        if config.max_per_lang == 0 || config.max_per_lang < config.reserved_per_lang {
            bail!(
                "invalid pool bounds: max_per_lang={} reserved_per_lang={}",
                config.max_per_lang,
                config.reserved_per_lang
            );
        }
        info!(
            max_per_lang = config.max_per_lang,
            reserved_per_lang = config.reserved_per_lang,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "creating container pool"
        );
        Ok(Self {
            buffers: Mutex::new(HashMap::new()),
            backend,
            registry,
            metrics,
            config,
        })
    }

    /// Acquires a container for `language`, reusing an idle one when
    /// possible and creating a new one otherwise. The returned lease has
    /// status `Pending`.
    pub async fn get(&self, language: Language) -> anyhow::Result<ContainerLease> {
        let executor = self
            .registry
            .get(language)
            .with_context(|| format!("unsupported language: {language}"))?;
        let image = executor.image().to_string();

        let mut buffers = self.buffers.lock().await;
        let buffer = buffers
            .entry(language)
            .or_insert_with(|| RingBuffer::new(self.config.max_per_lang));

        // Scan for an idle container: dequeue everything, take the first
        // idle one, and re-enqueue in the original relative order.
        let mut scanned = Vec::with_capacity(buffer.size());
        let mut selected = None;
        while let Ok(mut container) = buffer.dequeue() {
            if selected.is_none() && container.status == ContainerStatus::Idle {
                container.status = ContainerStatus::Pending;
                container.last_used = Instant::now();
                selected = Some(container.id.clone());
            }
            scanned.push(container);
        }
        buffer
            .enqueue_batch(scanned)
            .context("pool buffer rejected rescanned containers")?;

        if let Some(id) = selected {
            debug!(container_id = %id, %language, "reusing idle container");
            self.metrics.container_reused();
            return Ok(ContainerLease { id, language });
        }

        if buffer.is_full() {
            bail!("reached max containers for language: {language}");
        }

        let mut record = PooledContainer {
            id: String::new(),
            image: image.clone(),
            language,
            status: ContainerStatus::Creating,
            last_used: Instant::now(),
        };

        self.backend.ensure_image(&image).await?;
        record.id = self.backend.create_container(&image).await?;
        self.backend.start_container(&record.id).await?;
        record.status = ContainerStatus::Pending;

        let lease = ContainerLease {
            id: record.id.clone(),
            language,
        };
        buffer
            .enqueue(record)
            .context("pool buffer rejected new container")?;
        self.metrics.container_created();
        info!(container_id = %lease.id, %language, "container created");
        Ok(lease)
    }

    /// Flips an acquired container to `Running`, keeping it out of the
    /// idle-selection path until released.
    pub async fn mark_running(&self, container_id: &str) {
        let buffers = self.buffers.lock().await;
        let mut found = false;
        for buffer in buffers.values() {
            buffer.for_each_mut(|container| {
                if container.id == container_id && container.status == ContainerStatus::Pending {
                    container.status = ContainerStatus::Running;
                    found = true;
                }
            });
        }
        if !found {
            warn!(container_id, "container not found or not pending when marking running");
        }
    }

    /// Returns a container to the pool: cleans its working directory and
    /// flips it back to `Idle`. Cleanup failures are logged, not fatal.
    pub async fn release(&self, container_id: &str) {
        let buffers = self.buffers.lock().await;
        let mut found = false;
        for buffer in buffers.values() {
            buffer.for_each_mut(|container| {
                if container.id == container_id {
                    container.status = ContainerStatus::Releasing;
                    found = true;
                }
            });
        }
        if !found {
            warn!(container_id, "container not found during release");
            return;
        }

        if let Err(err) = self
            .backend
            .exec_capture(container_id, sh("rm -rf /app/*"))
            .await
        {
            warn!(container_id, error = %err, "container cleanup failed");
        }

        for buffer in buffers.values() {
            buffer.for_each_mut(|container| {
                if container.id == container_id {
                    container.status = ContainerStatus::Idle;
                    container.last_used = Instant::now();
                }
            });
        }
        debug!(container_id, "container released to pool");
    }

    /// Destroys idle containers past the timeout while never dropping a
    /// language below its reserve floor. Survivors keep their order.
    pub async fn evict_idle(&self) {
        let mut buffers = self.buffers.lock().await;
        let now = Instant::now();
        let mut evicted_total = 0;

        for (language, buffer) in buffers.iter_mut() {
            let mut drained = Vec::with_capacity(buffer.size());
            while let Ok(container) = buffer.dequeue() {
                drained.push(container);
            }

            let mut remaining = drained.len();
            let mut kept = Vec::with_capacity(drained.len());
            for mut container in drained {
                let expired = container.status == ContainerStatus::Idle
                    && now.duration_since(container.last_used) > self.config.idle_timeout;
                if expired && remaining > self.config.reserved_per_lang {
                    container.status = ContainerStatus::Destroying;
                    remaining -= 1;
                    evicted_total += 1;
                    info!(container_id = %container.id, %language, "evicting idle container");
                    if let Err(err) = self.backend.stop_and_remove(&container.id).await {
                        warn!(container_id = %container.id, error = %err, "error destroying idle container");
                    }
                    self.metrics.container_evicted();
                } else {
                    kept.push(container);
                }
            }
            if buffer.enqueue_batch(kept).is_err() {
                warn!(%language, "failed to rebuild pool buffer after eviction");
            }
        }

        if evicted_total > 0 {
            info!(evicted = evicted_total, "idle container eviction completed");
        }
    }

    /// Periodic eviction driver; the check interval is a fixed multiple of
    /// the idle timeout.
    pub fn spawn_eviction(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        let period = pool
            .config
            .idle_timeout
            .saturating_mul(10)
            .max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                pool.evict_idle().await;
            }
        })
    }

    /// Prewarms `reserved_per_lang` idle containers for every registered
    /// language. Image pulls here are allowed to block startup.
    pub async fn init_reserves(&self) -> anyhow::Result<()> {
        if self.config.reserved_per_lang == 0 {
            info!("no reserved containers configured, skipping prewarm");
            return Ok(());
        }
        for language in self.registry.languages() {
            for _ in 0..self.config.reserved_per_lang {
                let lease = self
                    .get(language)
                    .await
                    .with_context(|| format!("failed to prewarm container for {language}"))?;
                self.mark_idle(&lease.id).await;
            }
            info!(%language, count = self.config.reserved_per_lang, "reserved containers ready");
        }
        Ok(())
    }

    async fn mark_idle(&self, container_id: &str) {
        let buffers = self.buffers.lock().await;
        for buffer in buffers.values() {
            buffer.for_each_mut(|container| {
                if container.id == container_id {
                    container.status = ContainerStatus::Idle;
                }
            });
        }
    }

    /// Stops and removes every pooled container. The pool is empty (and
    /// effectively unusable) afterwards.
    pub async fn shutdown(&self) {
        let mut buffers = self.buffers.lock().await;
        info!("closing container pool");
        for (language, buffer) in buffers.iter_mut() {
            while let Ok(container) = buffer.dequeue() {
                if let Err(err) = self.backend.stop_and_remove(&container.id).await {
                    warn!(container_id = %container.id, %language, error = %err, "error removing container during shutdown");
                }
            }
        }
        buffers.clear();
    }
}
