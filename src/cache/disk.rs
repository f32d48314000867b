//! Filesystem-backed byte store for the disk tier.
//!
//! Bytes live as flat files under a namespaced directory
//! `<root>/<prefix>.<namespace>/<filename>`, where the filename is the
//! digest-based name from [`crate::key::filename_for_key`]. All mutating
//! operations are intended to run on the owning IO executor; existence
//! probes are non-mutating and may run off it.
//!
//! Keys stored before extensions were preserved were written under the
//! bare digest, so every probe and read tries the path both with and
//! without the extension.

use crate::cache::types::{CacheError, DiskStats, DIRECTORY_PREFIX};
use crate::key::filename_for_key;
use bytes::Bytes;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Length of the hex digest portion of a cache filename.
const DIGEST_LEN: usize = 32;

/// Byte store under a namespaced cache directory.
pub struct DiskStore {
    namespace_dir: PathBuf,
    aux_roots: Mutex<Vec<PathBuf>>,
    disable_backup: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    write_failures: AtomicU64,
}

impl DiskStore {
    /// Create a store rooted at `root` (the platform caches directory when
    /// `None`) under the namespace label.
    ///
    /// No directories are created until the first write.
    pub fn new(root: Option<PathBuf>, namespace: &str, disable_backup: bool) -> Self {
        let root = root.unwrap_or_else(|| {
            dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."))
        });
        let namespace_dir = root.join(format!("{DIRECTORY_PREFIX}.{namespace}"));

        Self {
            namespace_dir,
            aux_roots: Mutex::new(Vec::new()),
            disable_backup,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
        }
    }

    /// The namespace directory all writes go to.
    pub fn namespace_dir(&self) -> &Path {
        &self.namespace_dir
    }

    /// Register an auxiliary read-only directory, consulted after the
    /// primary namespace directory in registration order.
    pub fn add_aux_root(&self, dir: PathBuf) {
        self.aux_roots.lock().unwrap().push(dir);
    }

    /// Primary on-disk path for a key.
    pub fn path_for_key(&self, key: &str) -> PathBuf {
        self.namespace_dir.join(filename_for_key(key))
    }

    /// Candidate filenames for a key: with the preserved extension, and
    /// the bare digest written by older stores.
    fn candidate_names(key: &str) -> Vec<String> {
        let filename = filename_for_key(key);
        if filename.len() > DIGEST_LEN {
            let bare = filename[..DIGEST_LEN].to_string();
            vec![filename, bare]
        } else {
            vec![filename]
        }
    }

    /// Non-mutating existence probe against the primary directory only.
    pub fn exists(&self, key: &str) -> bool {
        Self::candidate_names(key)
            .iter()
            .any(|name| self.namespace_dir.join(name).is_file())
    }

    /// Write bytes for a key, creating the namespace directory if absent.
    pub fn write(&self, key: &str, data: &[u8]) -> Result<(), CacheError> {
        let result = self.write_inner(key, data);
        match &result {
            Ok(()) => {
                self.writes.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                self.write_failures.fetch_add(1, Ordering::Relaxed);
                warn!(key, %error, "disk tier write failed");
            }
        }
        result
    }

    fn write_inner(&self, key: &str, data: &[u8]) -> Result<(), CacheError> {
        fs::create_dir_all(&self.namespace_dir)?;
        let path = self.path_for_key(key);
        fs::write(&path, data)?;

        if self.disable_backup {
            mark_excluded_from_backup(&path);
        }
        Ok(())
    }

    /// Read the first non-empty candidate across the primary directory and
    /// every auxiliary root, each probed with and without the extension.
    pub fn read(&self, key: &str) -> Option<Bytes> {
        let names = Self::candidate_names(key);

        let mut dirs: Vec<PathBuf> = vec![self.namespace_dir.clone()];
        dirs.extend(self.aux_roots.lock().unwrap().iter().cloned());

        for dir in &dirs {
            for name in &names {
                if let Ok(data) = fs::read(dir.join(name)) {
                    if !data.is_empty() {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return Some(Bytes::from(data));
                    }
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Best-effort removal of a key's files; errors are swallowed.
    pub fn remove(&self, key: &str) {
        for name in Self::candidate_names(key) {
            let _ = fs::remove_file(self.namespace_dir.join(name));
        }
    }

    /// Delete and recreate the namespace directory.
    pub fn remove_all(&self) -> Result<(), CacheError> {
        match fs::remove_dir_all(&self.namespace_dir) {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }
        fs::create_dir_all(&self.namespace_dir)?;
        debug!(dir = %self.namespace_dir.display(), "disk tier cleared");
        Ok(())
    }

    /// Total size in bytes of regular files in the namespace directory.
    pub fn size(&self) -> u64 {
        self.traverse().map(|(_, len)| len).sum()
    }

    /// Number of regular files in the namespace directory.
    pub fn count(&self) -> usize {
        self.traverse().count()
    }

    /// Size and count in one traversal.
    pub fn calculate(&self) -> (u64, usize) {
        let mut total = 0u64;
        let mut count = 0usize;
        for (_, len) in self.traverse() {
            total += len;
            count += 1;
        }
        (total, count)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> DiskStats {
        DiskStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }

    fn traverse(&self) -> impl Iterator<Item = (PathBuf, u64)> {
        let entries = fs::read_dir(&self.namespace_dir)
            .into_iter()
            .flatten()
            .flatten();

        entries.filter_map(|entry| {
            let metadata = entry.metadata().ok()?;
            if metadata.is_file() {
                Some((entry.path(), metadata.len()))
            } else {
                None
            }
        })
    }
}

/// Mark a file as excluded from system backups.
///
/// The backup-exclusion attribute only exists on Apple platforms; elsewhere
/// the request is recorded in the log and otherwise ignored.
fn mark_excluded_from_backup(path: &Path) {
    debug!(path = %path.display(), "backup exclusion requested (no-op on this platform)");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (DiskStore, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = DiskStore::new(Some(temp.path().to_path_buf()), "test", true);
        (store, temp)
    }

    #[test]
    fn test_namespace_dir_layout() {
        let (store, temp) = test_store();
        assert_eq!(
            store.namespace_dir(),
            temp.path().join("com.webimage.cache.test")
        );
    }

    #[test]
    fn test_write_creates_namespace_dir() {
        let (store, _temp) = test_store();
        assert!(!store.namespace_dir().exists());

        store.write("https://h/x.png", b"payload").unwrap();

        assert!(store.namespace_dir().is_dir());
        assert!(store.exists("https://h/x.png"));
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let (store, _temp) = test_store();
        let data = vec![1u8, 2, 3, 4, 5];

        store.write("https://h/x.png", &data).unwrap();

        assert_eq!(store.read("https://h/x.png"), Some(Bytes::from(data)));
    }

    #[test]
    fn test_filename_preserves_extension() {
        let (store, _temp) = test_store();
        store.write("https://h/x.png", b"data").unwrap();

        let path = store.path_for_key("https://h/x.png");
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("png"));
        assert!(path.is_file());
    }

    #[test]
    fn test_read_falls_back_to_bare_digest() {
        let (store, _temp) = test_store();
        let key = "https://h/x.png";

        // Simulate a file written before extensions were preserved.
        fs::create_dir_all(store.namespace_dir()).unwrap();
        let bare = &filename_for_key(key)[..DIGEST_LEN];
        fs::write(store.namespace_dir().join(bare), b"legacy").unwrap();

        assert!(store.exists(key));
        assert_eq!(store.read(key), Some(Bytes::from_static(b"legacy")));
    }

    #[test]
    fn test_read_miss() {
        let (store, _temp) = test_store();
        assert_eq!(store.read("https://h/absent.png"), None);
        assert_eq!(store.stats().misses, 1);
    }

    #[test]
    fn test_read_skips_empty_files() {
        let (store, _temp) = test_store();
        store.write("https://h/empty", b"").unwrap();

        assert_eq!(store.read("https://h/empty"), None);
    }

    #[test]
    fn test_read_consults_aux_roots_in_order() {
        let (store, _temp) = test_store();
        let aux = TempDir::new().unwrap();

        let key = "https://h/shared.png";
        fs::write(aux.path().join(filename_for_key(key)), b"from-aux").unwrap();
        store.add_aux_root(aux.path().to_path_buf());

        // Primary miss falls through to the auxiliary root.
        assert_eq!(store.read(key), Some(Bytes::from_static(b"from-aux")));

        // Primary wins once present.
        store.write(key, b"from-primary").unwrap();
        assert_eq!(store.read(key), Some(Bytes::from_static(b"from-primary")));
    }

    #[test]
    fn test_exists_ignores_aux_roots() {
        let (store, _temp) = test_store();
        let aux = TempDir::new().unwrap();

        let key = "https://h/auxonly.png";
        fs::write(aux.path().join(filename_for_key(key)), b"x").unwrap();
        store.add_aux_root(aux.path().to_path_buf());

        assert!(!store.exists(key));
    }

    #[test]
    fn test_remove_is_best_effort() {
        let (store, _temp) = test_store();
        store.write("https://h/x.png", b"data").unwrap();

        store.remove("https://h/x.png");
        assert!(!store.exists("https://h/x.png"));

        // Removing an absent key does not panic or error.
        store.remove("https://h/x.png");
    }

    #[test]
    fn test_remove_all_recreates_dir() {
        let (store, _temp) = test_store();
        store.write("https://h/a.png", b"a").unwrap();
        store.write("https://h/b.png", b"b").unwrap();

        store.remove_all().unwrap();

        assert!(store.namespace_dir().is_dir());
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn test_remove_all_on_missing_dir() {
        let (store, _temp) = test_store();
        store.remove_all().unwrap();
        assert!(store.namespace_dir().is_dir());
    }

    #[test]
    fn test_size_and_count() {
        let (store, _temp) = test_store();
        store.write("https://h/a.png", &[0u8; 100]).unwrap();
        store.write("https://h/b.png", &[0u8; 250]).unwrap();

        assert_eq!(store.size(), 350);
        assert_eq!(store.count(), 2);
        assert_eq!(store.calculate(), (350, 2));
    }

    #[test]
    fn test_size_skips_subdirectories() {
        let (store, _temp) = test_store();
        store.write("https://h/a.png", &[0u8; 10]).unwrap();
        fs::create_dir_all(store.namespace_dir().join("nested")).unwrap();

        assert_eq!(store.count(), 1);
        assert_eq!(store.size(), 10);
    }

    #[test]
    fn test_write_counter() {
        let (store, _temp) = test_store();
        store.write("https://h/a.png", b"a").unwrap();
        store.write("https://h/b.png", b"b").unwrap();

        let stats = store.stats();
        assert_eq!(stats.writes, 2);
        assert_eq!(stats.write_failures, 0);
    }
}
