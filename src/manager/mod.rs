//! Request orchestration: cache lookup, download, persistence.
//!
//! [`ImageManager`] combines the two-tier [`ImageCache`] with an
//! [`ImageDownloader`]. Each request yields a [`CombinedOperation`] that
//! spans the cache-lookup phase and the download phase under one
//! cancellable identity. The manager owns the failed-URL set (URLs that
//! conclusively failed are not re-attempted without the retry option) and
//! the set of in-flight operations.

pub mod options;
pub mod registry;

pub use options::{should_show_placeholder, RequestFlags};
pub use registry::{OperationRegistry, TargetId};

use crate::cache::{CacheSource, ImageCache, StoreOptions};
use crate::decoded::CachedImage;
use crate::downloader::{DownloadError, DownloadEvent, ImageDownloader, ProgressCallback};
use crate::executor::{main_executor, Executor, PoolExecutor};
use crate::key::{key_for_url, KeyFilter};
use crate::operation::{CombinedOperation, Operation};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Error delivered to a request's completion callback.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    /// The URL was empty, invalid, or previously failed conclusively.
    #[error("file does not exist")]
    FileDoesNotExist,
    /// The downloader reported an error, propagated verbatim.
    #[error(transparent)]
    Download(#[from] DownloadError),
}

/// Outcome delivered to a request's completion callback.
///
/// Refresh requests deliver twice: once for the cached image and once for
/// the re-fetched one. Progressive downloads deliver repeatedly with
/// `finished = false` until the terminal invocation.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// The image, absent on miss or error.
    pub image: Option<CachedImage>,
    /// Error, only ever produced by the download path.
    pub error: Option<FetchError>,
    /// Which cache tier produced the image; `None` for downloads.
    pub source: CacheSource,
    /// Whether this is the terminal delivery for its phase.
    pub finished: bool,
    /// The URL string the request was made with.
    pub url: String,
}

/// Completion callback for a request. Must be supplied; a request without
/// one is programmer error, which the signature makes unrepresentable.
pub type CompletionCallback = Arc<dyn Fn(&FetchOutcome) + Send + Sync>;

/// Application hooks consulted by the manager.
pub trait ManagerDelegate: Send + Sync {
    /// Veto a download after a cache miss. Defaults to allowing it.
    fn should_download_for(&self, _url: &Url) -> bool {
        true
    }

    /// Transform a downloaded image before caching and delivery.
    ///
    /// Runs on the transform executor. Returning the input unchanged
    /// (same pixel storage) persists the original downloaded bytes;
    /// returning a new image re-encodes.
    fn transform_downloaded(&self, image: CachedImage, _url: &Url) -> CachedImage {
        image
    }
}

type RunningSet = Arc<Mutex<Vec<Arc<CombinedOperation>>>>;

fn remove_operation(running: &RunningSet, operation: &Arc<CombinedOperation>) {
    let mut ops = running.lock().unwrap();
    ops.retain(|op| !Arc::ptr_eq(op, operation));
}

/// Builder for [`ImageManager`].
pub struct ImageManagerBuilder {
    downloader: Arc<dyn ImageDownloader>,
    cache: Option<Arc<ImageCache>>,
    delegate: Option<Arc<dyn ManagerDelegate>>,
    key_filter: Option<Arc<KeyFilter>>,
    main: Option<Arc<dyn Executor>>,
    transform: Option<Arc<dyn Executor>>,
}

impl ImageManagerBuilder {
    /// Use a specific cache instead of the shared one.
    pub fn cache(mut self, cache: Arc<ImageCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Install the application delegate.
    pub fn delegate(mut self, delegate: Arc<dyn ManagerDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Install a key filter replacing URL-string keys.
    pub fn key_filter(mut self, filter: Arc<KeyFilter>) -> Self {
        self.key_filter = Some(filter);
        self
    }

    /// Use a specific main executor (tests inject an inline one).
    pub fn main_executor(mut self, main: Arc<dyn Executor>) -> Self {
        self.main = Some(main);
        self
    }

    /// Use a specific transform executor.
    pub fn transform_executor(mut self, transform: Arc<dyn Executor>) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Build the manager.
    pub fn build(self) -> Arc<ImageManager> {
        Arc::new(ImageManager {
            cache: self.cache.unwrap_or_else(ImageCache::shared),
            downloader: self.downloader,
            delegate: self.delegate,
            key_filter: self.key_filter,
            failed_urls: Arc::new(Mutex::new(HashSet::new())),
            running: Arc::new(Mutex::new(Vec::new())),
            main: self.main.unwrap_or_else(main_executor),
            transform: self
                .transform
                .unwrap_or_else(|| Arc::new(PoolExecutor::new("webimage-transform", 2))),
        })
    }
}

/// Orchestrates cache lookup, download, and persistence per request.
pub struct ImageManager {
    cache: Arc<ImageCache>,
    downloader: Arc<dyn ImageDownloader>,
    delegate: Option<Arc<dyn ManagerDelegate>>,
    key_filter: Option<Arc<KeyFilter>>,
    failed_urls: Arc<Mutex<HashSet<String>>>,
    running: RunningSet,
    main: Arc<dyn Executor>,
    transform: Arc<dyn Executor>,
}

impl ImageManager {
    /// Start building a manager around a downloader.
    pub fn builder(downloader: Arc<dyn ImageDownloader>) -> ImageManagerBuilder {
        ImageManagerBuilder {
            downloader,
            cache: None,
            delegate: None,
            key_filter: None,
            main: None,
            transform: None,
        }
    }

    /// Install the process-wide default manager. Idempotent; the first
    /// installation wins.
    pub fn init_shared(manager: Arc<ImageManager>) {
        let _ = shared_slot().set(manager);
    }

    /// The process-wide default manager, if one was installed.
    pub fn shared() -> Option<Arc<ImageManager>> {
        shared_slot().get().cloned()
    }

    /// The cache this manager stores through.
    pub fn cache(&self) -> &Arc<ImageCache> {
        &self.cache
    }

    /// Derive the cache key for a URL, consulting the key filter.
    pub fn cache_key_for_url(&self, url: &Url) -> String {
        match &self.key_filter {
            Some(filter) => filter(url),
            None => key_for_url(url),
        }
    }

    /// Whether any combined operation is currently in flight.
    pub fn is_running(&self) -> bool {
        !self.running.lock().unwrap().is_empty()
    }

    /// Cancel every in-flight operation.
    ///
    /// Iterates a snapshot taken under the lock; each cancel path removes
    /// its own operation from the running set.
    pub fn cancel_all(&self) {
        let snapshot: Vec<Arc<CombinedOperation>> = self.running.lock().unwrap().clone();
        for operation in &snapshot {
            operation.cancel();
        }
    }

    /// Synchronous check whether an image for this URL is cached in either
    /// tier. May touch the filesystem.
    pub fn cached_image_exists(&self, url: &str) -> bool {
        let Ok(url) = Url::parse(url) else {
            return false;
        };
        let key = self.cache_key_for_url(&url);
        self.cache.image_from_memory(&key).is_some() || self.cache.exists_on_disk(&key)
    }

    /// Asynchronous disk existence check; completes on the main executor.
    pub fn disk_image_exists(&self, url: &str, completion: Box<dyn FnOnce(bool) + Send>) {
        let Ok(url) = Url::parse(url) else {
            completion(false);
            return;
        };
        let key = self.cache_key_for_url(&url);
        self.cache.exists_on_disk_async(&key, completion);
    }

    /// Store an already-obtained image under its URL's key, in both tiers.
    pub fn save_image_to_cache(&self, image: &CachedImage, url: &str) {
        let Ok(url) = Url::parse(url) else {
            return;
        };
        let key = self.cache_key_for_url(&url);
        self.cache.store(
            image,
            None,
            &key,
            StoreOptions {
                recalculate: false,
                to_disk: true,
            },
        );
    }

    /// Fetch the image for a URL: cache lookup first, download on miss (or
    /// refresh), persistence on success.
    ///
    /// Returns the combined operation spanning both phases; cancelling it
    /// suppresses any further success delivery. The completion is invoked
    /// synchronously for memory hits and on the main executor otherwise.
    pub fn download_image(
        &self,
        url: &str,
        flags: RequestFlags,
        progress: Option<ProgressCallback>,
        completion: CompletionCallback,
    ) -> Arc<CombinedOperation> {
        let input = url;
        let parsed = Url::parse(input).ok();

        let retry_failed = flags.contains(RequestFlags::RETRY_FAILED);
        let blacklisted = parsed
            .as_ref()
            .map(|url| self.failed_urls.lock().unwrap().contains(url.as_str()))
            .unwrap_or(false);

        let Some(url) = parsed else {
            return self.fail_immediately(input, &completion);
        };
        if blacklisted && !retry_failed {
            debug!(url = %url, "request for blacklisted URL rejected");
            return self.fail_immediately(input, &completion);
        }

        let operation = CombinedOperation::new();
        self.running.lock().unwrap().push(Arc::clone(&operation));

        // Until the download starts, cancellation only needs to clear the
        // handle from the running set.
        install_removal_hook(&operation, &self.running);

        let key = self.cache_key_for_url(&url);

        let query_cb = self.make_query_callback(
            Arc::clone(&operation),
            url,
            input.to_string(),
            key.clone(),
            flags,
            progress,
            completion,
        );

        if let Some(cache_op) = self.cache.query(Some(&key), Some(query_cb)) {
            operation.set_cache_operation(cache_op);
        }

        operation
    }

    /// Deliver the "file does not exist" outcome on the main executor for
    /// absent or blacklisted URLs, returning a fresh no-op handle.
    fn fail_immediately(&self, url: &str, completion: &CompletionCallback) -> Arc<CombinedOperation> {
        let outcome = FetchOutcome {
            image: None,
            error: Some(FetchError::FileDoesNotExist),
            source: CacheSource::None,
            finished: true,
            url: url.to_string(),
        };
        let completion = Arc::clone(completion);
        self.main.execute(Box::new(move || completion(&outcome)));

        CombinedOperation::new()
    }

    #[allow(clippy::too_many_arguments)]
    fn make_query_callback(
        &self,
        operation: Arc<CombinedOperation>,
        url: Url,
        url_string: String,
        key: String,
        flags: RequestFlags,
        progress: Option<ProgressCallback>,
        completion: CompletionCallback,
    ) -> crate::cache::QueryCallback {
        let running = Arc::clone(&self.running);
        let cache = Arc::clone(&self.cache);
        let downloader = Arc::clone(&self.downloader);
        let failed_urls = Arc::clone(&self.failed_urls);
        let main = Arc::clone(&self.main);
        let transform = Arc::clone(&self.transform);
        let delegate = self.delegate.clone();

        Box::new(move |cached_image, source| {
            if operation.is_cancelled() {
                remove_operation(&running, &operation);
                return;
            }

            let refreshing = flags.contains(RequestFlags::REFRESH_CACHED);
            let had_hit = cached_image.is_some();

            if let Some(image) = cached_image {
                completion(&FetchOutcome {
                    image: Some(image),
                    error: None,
                    source,
                    finished: true,
                    url: url_string.clone(),
                });
                if !refreshing {
                    remove_operation(&running, &operation);
                    return;
                }
            } else if let Some(delegate) = &delegate {
                if !delegate.should_download_for(&url) {
                    completion(&FetchOutcome {
                        image: None,
                        error: None,
                        source: CacheSource::None,
                        finished: true,
                        url: url_string.clone(),
                    });
                    remove_operation(&running, &operation);
                    return;
                }
            }

            // Download phase.
            let refreshing_hit = refreshing && had_hit;
            let downloader_flags = flags.downloader_flags(refreshing_hit);
            let retry_failed = flags.contains(RequestFlags::RETRY_FAILED);
            let to_disk = !flags.contains(RequestFlags::CACHE_MEMORY_ONLY);

            let dl_operation = Arc::clone(&operation);
            let dl_running = Arc::clone(&running);
            let dl_url = url.clone();

            let dl_completion = Box::new(move |event: DownloadEvent| {
                if dl_operation.is_cancelled() {
                    return;
                }

                if let Some(error) = event.error {
                    deliver(
                        &main,
                        &dl_operation,
                        &completion,
                        FetchOutcome {
                            image: None,
                            error: Some(FetchError::Download(error.clone())),
                            source: CacheSource::None,
                            finished: event.finished,
                            url: url_string.clone(),
                        },
                    );
                    if !error.is_transient() {
                        failed_urls.lock().unwrap().insert(url_string.clone());
                    }
                    if event.finished {
                        remove_operation(&dl_running, &dl_operation);
                    }
                    return;
                }

                if retry_failed {
                    failed_urls.lock().unwrap().remove(&url_string);
                }

                match event.image {
                    // The HTTP layer revalidated its own cache and produced
                    // no new image: the first delivery already covered it.
                    None if refreshing_hit => {}
                    None => {
                        if event.finished {
                            deliver(
                                &main,
                                &dl_operation,
                                &completion,
                                FetchOutcome {
                                    image: None,
                                    error: None,
                                    source: CacheSource::None,
                                    finished: true,
                                    url: url_string.clone(),
                                },
                            );
                        }
                    }
                    Some(image) => {
                        let transformable = !image.is_animated()
                            || flags.contains(RequestFlags::TRANSFORM_ANIMATED_IMAGE);
                        let transform_delegate = if event.finished && transformable {
                            delegate.clone()
                        } else {
                            None
                        };

                        if let Some(transform_delegate) = transform_delegate {
                            let cache = Arc::clone(&cache);
                            let main = Arc::clone(&main);
                            let completion = completion.clone();
                            let op = Arc::clone(&dl_operation);
                            let url = dl_url.clone();
                            let url_string = url_string.clone();
                            let key = key.clone();
                            let data = event.data.clone();

                            transform.execute(Box::new(move || {
                                let transformed =
                                    transform_delegate.transform_downloaded(image.clone(), &url);
                                let changed = !transformed.shares_pixels(&image);

                                cache.store(
                                    &transformed,
                                    if changed { None } else { data },
                                    &key,
                                    StoreOptions {
                                        recalculate: changed,
                                        to_disk,
                                    },
                                );
                                deliver(
                                    &main,
                                    &op,
                                    &completion,
                                    FetchOutcome {
                                        image: Some(transformed),
                                        error: None,
                                        source: CacheSource::None,
                                        finished: true,
                                        url: url_string,
                                    },
                                );
                            }));
                        } else if event.finished {
                            cache.store(
                                &image,
                                event.data.clone(),
                                &key,
                                StoreOptions {
                                    recalculate: false,
                                    to_disk,
                                },
                            );
                            deliver(
                                &main,
                                &dl_operation,
                                &completion,
                                FetchOutcome {
                                    image: Some(image),
                                    error: None,
                                    source: CacheSource::None,
                                    finished: true,
                                    url: url_string.clone(),
                                },
                            );
                        } else {
                            // Intermediate progressive delivery; nothing is
                            // persisted until the terminal invocation.
                            deliver(
                                &main,
                                &dl_operation,
                                &completion,
                                FetchOutcome {
                                    image: Some(image),
                                    error: None,
                                    source: CacheSource::None,
                                    finished: false,
                                    url: url_string.clone(),
                                },
                            );
                        }
                    }
                }

                if event.finished {
                    remove_operation(&dl_running, &dl_operation);
                }
            });

            let token = downloader.download(&url, downloader_flags, progress, dl_completion);

            // Replace the lookup-phase hook: cancelling now also cancels
            // the downloader's sub-operation. The hook holds only a weak
            // back-reference to the combined operation.
            let weak = operation.downgrade();
            let hook_running = Arc::clone(&running);
            operation.set_cancel_hook(Box::new(move || {
                token.cancel();
                if let Some(operation) = weak.upgrade() {
                    remove_operation(&hook_running, &operation);
                }
            }));
        })
    }
}

/// Install a cancel hook that only clears the handle from the running set.
fn install_removal_hook(operation: &Arc<CombinedOperation>, running: &RunningSet) {
    let weak = operation.downgrade();
    let running = Arc::clone(running);
    operation.set_cancel_hook(Box::new(move || {
        if let Some(operation) = weak.upgrade() {
            remove_operation(&running, &operation);
        }
    }));
}

/// Post a success/error outcome to the main executor; cancelled operations
/// observe the flag at delivery time and become no-ops.
fn deliver(
    main: &Arc<dyn Executor>,
    operation: &Arc<CombinedOperation>,
    completion: &CompletionCallback,
    outcome: FetchOutcome,
) {
    let operation = Arc::clone(operation);
    let completion = Arc::clone(completion);
    main.execute(Box::new(move || {
        if operation.is_cancelled() {
            return;
        }
        completion(&outcome);
    }));
}

fn shared_slot() -> &'static OnceLock<Arc<ImageManager>> {
    static SHARED: OnceLock<Arc<ImageManager>> = OnceLock::new();
    &SHARED
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::downloader::{DownloadCompletion, DownloaderFlags};
    use crate::executor::InlineExecutor;
    use crate::operation::CacheOperation;
    use image::DynamicImage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Downloader that must never be reached.
    struct RefusingDownloader {
        calls: AtomicUsize,
    }

    impl RefusingDownloader {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl ImageDownloader for RefusingDownloader {
        fn download(
            &self,
            _url: &Url,
            _flags: DownloaderFlags,
            _progress: Option<ProgressCallback>,
            _completion: DownloadCompletion,
        ) -> Arc<dyn Operation> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Arc::new(CacheOperation::new())
        }
    }

    fn inline_manager(
        downloader: Arc<dyn ImageDownloader>,
    ) -> (Arc<ImageManager>, TempDir) {
        let temp = TempDir::new().unwrap();
        let cache = Arc::new(ImageCache::with_executors(
            CacheConfig::default().with_root_dir(temp.path().to_path_buf()),
            Arc::new(InlineExecutor),
            Arc::new(InlineExecutor),
        ));
        let manager = ImageManager::builder(downloader)
            .cache(cache)
            .main_executor(Arc::new(InlineExecutor))
            .transform_executor(Arc::new(InlineExecutor))
            .build();
        (manager, temp)
    }

    fn test_image(side: u32) -> CachedImage {
        CachedImage::from_pixels(DynamicImage::new_rgba8(side, side), 1)
    }

    #[test]
    fn test_invalid_url_fails_immediately() {
        let downloader = RefusingDownloader::new();
        let (manager, _temp) = inline_manager(downloader.clone());

        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let outcomes_clone = Arc::clone(&outcomes);
        let op = manager.download_image(
            "not a url",
            RequestFlags::empty(),
            None,
            Arc::new(move |outcome: &FetchOutcome| {
                outcomes_clone.lock().unwrap().push(outcome.clone());
            }),
        );

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].error, Some(FetchError::FileDoesNotExist));
        assert_eq!(outcomes[0].source, CacheSource::None);
        assert!(outcomes[0].finished);
        assert_eq!(outcomes[0].url, "not a url");

        assert!(!op.is_cancelled());
        assert!(!manager.is_running(), "no-op handle is never tracked");
        assert_eq!(downloader.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_key_filter_overrides_url_key() {
        let (manager, _temp) = inline_manager(RefusingDownloader::new());
        let url = Url::parse("https://h/x.png?token=secret").unwrap();
        assert_eq!(manager.cache_key_for_url(&url), url.as_str());

        let filtered = ImageManager::builder(RefusingDownloader::new())
            .cache(Arc::clone(manager.cache()))
            .key_filter(Arc::new(|url: &Url| {
                let mut stripped = url.clone();
                stripped.set_query(None);
                stripped.to_string()
            }))
            .main_executor(Arc::new(InlineExecutor))
            .build();

        assert_eq!(filtered.cache_key_for_url(&url), "https://h/x.png");
    }

    #[test]
    fn test_save_image_to_cache_round_trip() {
        let (manager, _temp) = inline_manager(RefusingDownloader::new());
        let image = test_image(4);

        manager.save_image_to_cache(&image, "https://h/saved.png");

        assert!(manager.cached_image_exists("https://h/saved.png"));
        let key = manager
            .cache_key_for_url(&Url::parse("https://h/saved.png").unwrap());
        assert!(manager.cache().exists_on_disk(&key));
    }

    #[test]
    fn test_save_image_invalid_url_is_noop() {
        let (manager, _temp) = inline_manager(RefusingDownloader::new());
        manager.save_image_to_cache(&test_image(2), "::");
        assert!(!manager.cached_image_exists("::"));
    }

    #[test]
    fn test_cached_image_exists_checks_disk() {
        let (manager, _temp) = inline_manager(RefusingDownloader::new());
        let image = test_image(4);
        manager.save_image_to_cache(&image, "https://h/on-disk.png");

        manager.cache().clear_memory();

        assert!(manager.cached_image_exists("https://h/on-disk.png"));
        assert!(!manager.cached_image_exists("https://h/absent.png"));
    }

    #[test]
    fn test_disk_image_exists_async() {
        let (manager, _temp) = inline_manager(RefusingDownloader::new());
        manager.save_image_to_cache(&test_image(4), "https://h/d.png");

        let seen = Arc::new(Mutex::new(None));
        let seen_clone = Arc::clone(&seen);
        manager.disk_image_exists(
            "https://h/d.png",
            Box::new(move |exists| {
                *seen_clone.lock().unwrap() = Some(exists);
            }),
        );

        assert_eq!(*seen.lock().unwrap(), Some(true));
    }

    #[test]
    fn test_is_running_initially_false() {
        let (manager, _temp) = inline_manager(RefusingDownloader::new());
        assert!(!manager.is_running());
        manager.cancel_all();
        assert!(!manager.is_running());
    }

    #[test]
    fn test_delegate_vetoes_download() {
        struct Veto;
        impl ManagerDelegate for Veto {
            fn should_download_for(&self, _url: &Url) -> bool {
                false
            }
        }

        let downloader = RefusingDownloader::new();
        let temp = TempDir::new().unwrap();
        let cache = Arc::new(ImageCache::with_executors(
            CacheConfig::default().with_root_dir(temp.path().to_path_buf()),
            Arc::new(InlineExecutor),
            Arc::new(InlineExecutor),
        ));
        let manager = ImageManager::builder(downloader.clone())
            .cache(cache)
            .delegate(Arc::new(Veto))
            .main_executor(Arc::new(InlineExecutor))
            .build();

        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let outcomes_clone = Arc::clone(&outcomes);
        manager.download_image(
            "https://h/vetoed.png",
            RequestFlags::empty(),
            None,
            Arc::new(move |outcome: &FetchOutcome| {
                outcomes_clone.lock().unwrap().push(outcome.clone());
            }),
        );

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].image.is_none());
        assert!(outcomes[0].error.is_none());
        assert!(outcomes[0].finished);
        assert_eq!(downloader.calls.load(Ordering::SeqCst), 0);
        assert!(!manager.is_running());
    }
}
