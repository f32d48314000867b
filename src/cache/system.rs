//! Two-tier image cache facade.
//!
//! [`ImageCache`] coordinates the memory and disk tiers behind a single
//! store/query/remove surface. Disk work runs on a dedicated serial IO
//! executor (deterministic per-key ordering, no per-path locking) and
//! asynchronous outcomes are delivered on the main executor.

use crate::cache::disk::DiskStore;
use crate::cache::memory::MemoryCache;
use crate::cache::sweep::{sweep, SweepResult};
use crate::cache::types::{CacheConfig, CacheSource, DiskStats, MemoryStats, StoreOptions};
use crate::decoded::{has_png_signature, CachedImage};
use crate::executor::{main_executor, Executor, SerialExecutor};
use crate::key::scale_for_key;
use crate::operation::{CacheOperation, Operation};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Callback for a cache query: the image (or `None` on a complete miss)
/// and the tier that satisfied it.
pub type QueryCallback = Box<dyn FnOnce(Option<CachedImage>, CacheSource) + Send>;

/// Unified store/query/remove over the memory and disk tiers.
pub struct ImageCache {
    memory: Arc<MemoryCache>,
    disk: Arc<DiskStore>,
    io: Arc<dyn Executor>,
    main: Arc<dyn Executor>,
    config: CacheConfig,
}

impl ImageCache {
    /// Create a cache with its own serial disk-IO worker and the
    /// process-wide main executor.
    pub fn new(config: CacheConfig) -> Self {
        let io: Arc<dyn Executor> = Arc::new(SerialExecutor::new("webimage-disk-io"));
        Self::with_executors(config, main_executor(), io)
    }

    /// Create a cache with injected executors.
    ///
    /// Tests pass [`crate::executor::InlineExecutor`] for both to make
    /// delivery synchronous. The IO executor must serialize submissions
    /// for the per-key ordering guarantee to hold.
    pub fn with_executors(
        config: CacheConfig,
        main: Arc<dyn Executor>,
        io: Arc<dyn Executor>,
    ) -> Self {
        let memory = Arc::new(MemoryCache::new(
            config.max_memory_cost,
            config.max_memory_count,
        ));
        let disk = Arc::new(DiskStore::new(
            config.root_dir.clone(),
            &config.namespace,
            config.should_disable_backup,
        ));

        Self {
            memory,
            disk,
            io,
            main,
            config,
        }
    }

    /// Process-wide default cache instance.
    ///
    /// Lazily initialised with the default configuration; never destroyed.
    pub fn shared() -> Arc<ImageCache> {
        static SHARED: OnceLock<Arc<ImageCache>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Arc::new(ImageCache::new(CacheConfig::default()))))
    }

    /// The disk tier's namespace directory.
    pub fn namespace_dir(&self) -> &Path {
        self.disk.namespace_dir()
    }

    /// The configuration this cache was built with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Register an auxiliary read-only directory for disk reads.
    pub fn add_aux_root(&self, dir: PathBuf) {
        self.disk.add_aux_root(dir);
    }

    /// Store an image under a key.
    ///
    /// The memory tier is updated synchronously (when enabled); disk
    /// persistence is scheduled on the IO executor and the call returns
    /// immediately. Bytes to persist are chosen on the IO executor:
    /// caller-supplied `data` verbatim unless `recalculate` is set,
    /// otherwise a re-encode as PNG (data carries the PNG signature, or no
    /// data and the image has alpha) or JPEG (everything else).
    pub fn store(
        &self,
        image: &CachedImage,
        data: Option<Bytes>,
        key: &str,
        options: StoreOptions,
    ) {
        if self.config.should_cache_images_in_memory {
            self.memory.put(key, image.clone(), image.cache_cost());
        }

        if !options.to_disk {
            return;
        }

        let image = image.clone();
        let key = key.to_string();
        let disk = Arc::clone(&self.disk);
        let recalculate = options.recalculate;

        self.io.execute(Box::new(move || {
            let bytes = match (&data, recalculate) {
                (Some(data), false) => Some(data.clone()),
                _ => {
                    let as_png = match &data {
                        Some(data) => has_png_signature(data),
                        None => image.has_alpha(),
                    };
                    let encoded = if as_png {
                        image.to_png_bytes()
                    } else {
                        image.to_jpeg_bytes()
                    };
                    encoded.ok()
                }
            };

            if let Some(bytes) = bytes {
                // Write failures are best effort; the next read misses.
                let _ = disk.write(&key, &bytes);
            } else {
                debug!(key, "no bytes to persist for key");
            }
        }));
    }

    /// Query both tiers for a key.
    ///
    /// Without a callback this does no work. A memory hit is delivered
    /// synchronously with no operation returned. On a miss the disk
    /// lookup is scheduled on the IO executor and the returned operation
    /// can cancel delivery; a hit found on disk is promoted to the memory
    /// tier before delivery on the main executor.
    pub fn query(
        &self,
        key: Option<&str>,
        done: Option<QueryCallback>,
    ) -> Option<Arc<CacheOperation>> {
        let done = done?;

        let Some(key) = key else {
            done(None, CacheSource::None);
            return None;
        };

        if self.config.should_cache_images_in_memory {
            if let Some(image) = self.memory.get(key) {
                done(Some(image), CacheSource::Memory);
                return None;
            }
        }

        let operation = Arc::new(CacheOperation::new());

        let key = key.to_string();
        let disk = Arc::clone(&self.disk);
        let memory = Arc::clone(&self.memory);
        let main = Arc::clone(&self.main);
        let op = Arc::clone(&operation);
        let decompress = self.config.should_decompress_images;
        let cache_in_memory = self.config.should_cache_images_in_memory;

        self.io.execute(Box::new(move || {
            if op.is_cancelled() {
                return;
            }

            let image = disk
                .read(&key)
                .and_then(|data| CachedImage::decode(&data, scale_for_key(&key), decompress));

            if let Some(image) = &image {
                if cache_in_memory {
                    memory.put(&key, image.clone(), image.cache_cost());
                }
            }

            let op = Arc::clone(&op);
            main.execute(Box::new(move || {
                // Already-dispatched deliveries become no-ops once cancelled.
                if op.is_cancelled() {
                    return;
                }
                done(image, CacheSource::Disk);
            }));
        }));

        Some(operation)
    }

    /// Memory-tier read.
    pub fn image_from_memory(&self, key: &str) -> Option<CachedImage> {
        if !self.config.should_cache_images_in_memory {
            return None;
        }
        self.memory.get(key)
    }

    /// Disk-tier read on the calling thread, promoting to memory on hit.
    pub fn image_from_disk(&self, key: &str) -> Option<CachedImage> {
        let data = self.disk.read(key)?;
        let image = CachedImage::decode(
            &data,
            scale_for_key(key),
            self.config.should_decompress_images,
        )?;

        if self.config.should_cache_images_in_memory {
            self.memory.put(key, image.clone(), image.cache_cost());
        }
        Some(image)
    }

    /// Remove a key from the memory tier and, optionally, the disk tier.
    ///
    /// With `from_disk` the removal runs on the IO executor and the
    /// completion is delivered on the main executor afterwards; otherwise
    /// the completion runs immediately.
    pub fn remove(&self, key: &str, from_disk: bool, completion: Option<Box<dyn FnOnce() + Send>>) {
        if self.config.should_cache_images_in_memory {
            self.memory.remove(key);
        }

        if from_disk {
            let key = key.to_string();
            let disk = Arc::clone(&self.disk);
            let main = Arc::clone(&self.main);
            self.io.execute(Box::new(move || {
                disk.remove(&key);
                if let Some(completion) = completion {
                    main.execute(completion);
                }
            }));
        } else if let Some(completion) = completion {
            completion();
        }
    }

    /// Synchronous existence probe against the primary disk directory.
    ///
    /// Non-mutating, safe to call off the IO executor.
    pub fn exists_on_disk(&self, key: &str) -> bool {
        self.disk.exists(key)
    }

    /// Asynchronous existence probe; completes on the main executor.
    pub fn exists_on_disk_async(&self, key: &str, completion: Box<dyn FnOnce(bool) + Send>) {
        let key = key.to_string();
        let disk = Arc::clone(&self.disk);
        let main = Arc::clone(&self.main);
        self.io.execute(Box::new(move || {
            let exists = disk.exists(&key);
            main.execute(Box::new(move || completion(exists)));
        }));
    }

    /// Flush the memory tier entirely (explicit clear or memory-pressure
    /// purge).
    pub fn clear_memory(&self) {
        self.memory.remove_all();
    }

    /// Delete and recreate the disk namespace directory on the IO
    /// executor; the completion is delivered on the main executor.
    pub fn clear_disk(&self, completion: Option<Box<dyn FnOnce() + Send>>) {
        let disk = Arc::clone(&self.disk);
        let main = Arc::clone(&self.main);
        self.io.execute(Box::new(move || {
            let _ = disk.remove_all();
            if let Some(completion) = completion {
                main.execute(completion);
            }
        }));
    }

    /// Run both sweep passes on the IO executor; the result is delivered
    /// on the main executor.
    pub fn sweep_disk(&self, completion: Option<Box<dyn FnOnce(SweepResult) + Send>>) {
        let dir = self.disk.namespace_dir().to_path_buf();
        let max_age = self.config.max_cache_age;
        let max_size = self.config.max_cache_size;
        let main = Arc::clone(&self.main);

        self.io.execute(Box::new(move || {
            let result = sweep(&dir, max_age, max_size);
            if let Some(completion) = completion {
                main.execute(Box::new(move || completion(result)));
            }
        }));
    }

    /// Traverse the disk tier for total size and entry count; delivered on
    /// the main executor.
    pub fn calculate_disk(&self, completion: Box<dyn FnOnce(u64, usize) + Send>) {
        let disk = Arc::clone(&self.disk);
        let main = Arc::clone(&self.main);
        self.io.execute(Box::new(move || {
            let (size, count) = disk.calculate();
            main.execute(Box::new(move || completion(size, count)));
        }));
    }

    /// Synchronous disk tier size in bytes.
    pub fn disk_size(&self) -> u64 {
        self.disk.size()
    }

    /// Synchronous disk tier entry count.
    pub fn disk_count(&self) -> usize {
        self.disk.count()
    }

    /// Memory tier counter snapshot.
    pub fn memory_stats(&self) -> MemoryStats {
        self.memory.stats()
    }

    /// Disk tier counter snapshot.
    pub fn disk_stats(&self) -> DiskStats {
        self.disk.stats()
    }
}
