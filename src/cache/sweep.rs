//! Age- and size-based garbage collection for the disk tier.
//!
//! A sweep makes one pass, then conditionally a second:
//!
//! 1. **Age cull** - every regular file whose modification time is at or
//!    before `now - max_age` is deleted; the survivors' sizes accumulate
//!    into the current total.
//! 2. **Size cull** - only when a size ceiling is configured and the
//!    surviving total exceeds it: survivors are deleted oldest-first until
//!    the total drops below half the ceiling. Ordering by modification
//!    time approximates LRU without access tracking; halving amortizes the
//!    pass across many subsequent stores.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

/// Result of one sweep run.
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepResult {
    /// Files deleted by the age pass
    pub expired_deleted: usize,
    /// Files deleted by the size pass
    pub culled_deleted: usize,
    /// Total bytes freed by both passes
    pub bytes_freed: u64,
    /// Size of surviving files after both passes
    pub remaining_size: u64,
}

impl SweepResult {
    /// Total files deleted across both passes.
    pub fn files_deleted(&self) -> usize {
        self.expired_deleted + self.culled_deleted
    }
}

/// Attributes of one surviving file, keyed by path during the sweep.
struct FileRecord {
    path: PathBuf,
    modified: SystemTime,
    size: u64,
}

/// Run both sweep passes over a namespace directory.
///
/// `max_size` of zero disables the size pass.
pub fn sweep(dir: &Path, max_age: Duration, max_size: u64) -> SweepResult {
    let mut result = SweepResult::default();

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return result,
    };

    let expiration = SystemTime::now() - max_age;
    let mut expired: Vec<FileRecord> = Vec::new();
    let mut survivors: Vec<FileRecord> = Vec::new();
    let mut current_size = 0u64;

    for entry in entries.flatten() {
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if metadata.is_dir() {
            continue;
        }
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let record = FileRecord {
            path: entry.path(),
            modified,
            size: metadata.len(),
        };

        if modified <= expiration {
            expired.push(record);
        } else {
            current_size += record.size;
            survivors.push(record);
        }
    }

    // Pass 1: delete everything past the expiration cutoff.
    for record in expired {
        if fs::remove_file(&record.path).is_ok() {
            result.expired_deleted += 1;
            result.bytes_freed += record.size;
        } else {
            debug!(path = %record.path.display(), "failed to delete expired cache file");
        }
    }

    // Pass 2: cull oldest-first down to half the ceiling.
    if max_size > 0 && current_size > max_size {
        let desired = max_size / 2;
        survivors.sort_by_key(|record| record.modified);

        for record in survivors {
            if current_size < desired {
                break;
            }
            if fs::remove_file(&record.path).is_ok() {
                current_size = current_size.saturating_sub(record.size);
                result.culled_deleted += 1;
                result.bytes_freed += record.size;
            } else {
                debug!(path = %record.path.display(), "failed to delete cache file during size cull");
            }
        }
    }

    result.remaining_size = current_size;

    if result.files_deleted() > 0 {
        info!(
            expired = result.expired_deleted,
            culled = result.culled_deleted,
            bytes_freed = result.bytes_freed,
            remaining_size = result.remaining_size,
            "disk cache sweep complete"
        );
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use tempfile::TempDir;

    const WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

    /// Create a file with the given size and age in seconds.
    fn create_aged_file(dir: &Path, name: &str, size: usize, age_secs: u64) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, vec![0u8; size]).unwrap();

        let mtime = SystemTime::now() - Duration::from_secs(age_secs);
        filetime::set_file_mtime(&path, FileTime::from_system_time(mtime)).unwrap();
        path
    }

    #[test]
    fn test_sweep_empty_dir() {
        let temp = TempDir::new().unwrap();
        let result = sweep(temp.path(), WEEK, 0);

        assert_eq!(result.files_deleted(), 0);
        assert_eq!(result.remaining_size, 0);
    }

    #[test]
    fn test_sweep_missing_dir() {
        let temp = TempDir::new().unwrap();
        let result = sweep(&temp.path().join("absent"), WEEK, 0);
        assert_eq!(result.files_deleted(), 0);
    }

    #[test]
    fn test_age_pass_deletes_only_expired() {
        let temp = TempDir::new().unwrap();
        let old = create_aged_file(temp.path(), "old", 100, 8 * 24 * 60 * 60);
        let fresh = create_aged_file(temp.path(), "fresh", 200, 60);

        let result = sweep(temp.path(), WEEK, 0);

        assert_eq!(result.expired_deleted, 1);
        assert_eq!(result.culled_deleted, 0);
        assert!(!old.exists());
        assert!(fresh.exists());
        assert_eq!(result.remaining_size, 200);
    }

    #[test]
    fn test_age_pass_skips_directories() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("nested");
        fs::create_dir_all(&nested).unwrap();
        let mtime = SystemTime::now() - Duration::from_secs(30 * 24 * 60 * 60);
        filetime::set_file_mtime(&nested, FileTime::from_system_time(mtime)).unwrap();

        let result = sweep(temp.path(), WEEK, 0);

        assert_eq!(result.files_deleted(), 0);
        assert!(nested.exists());
    }

    #[test]
    fn test_size_pass_disabled_when_ceiling_is_zero() {
        let temp = TempDir::new().unwrap();
        for i in 0..5 {
            create_aged_file(temp.path(), &format!("f{i}"), 1000, 60 + i);
        }

        let result = sweep(temp.path(), WEEK, 0);

        assert_eq!(result.files_deleted(), 0);
        assert_eq!(result.remaining_size, 5000);
    }

    #[test]
    fn test_size_pass_culls_oldest_first_to_half() {
        let temp = TempDir::new().unwrap();
        // Five fresh 1000-byte files with strictly increasing age.
        for i in 0..5u64 {
            create_aged_file(temp.path(), &format!("f{i}"), 1000, 500 - i * 100);
        }

        // Ceiling 4000; total 5000 exceeds it; desired = 2000.
        let result = sweep(temp.path(), WEEK, 4000);

        assert_eq!(result.expired_deleted, 0);
        assert!(result.remaining_size < 2000);
        // Oldest files (f0 has age 500s, ..., f4 age 100s) go first.
        assert!(!temp.path().join("f0").exists());
        assert!(!temp.path().join("f1").exists());
        assert!(!temp.path().join("f2").exists());
        assert!(!temp.path().join("f3").exists());
        assert!(temp.path().join("f4").exists());
    }

    #[test]
    fn test_size_pass_not_run_when_under_ceiling() {
        let temp = TempDir::new().unwrap();
        create_aged_file(temp.path(), "a", 100, 60);
        create_aged_file(temp.path(), "b", 100, 60);

        let result = sweep(temp.path(), WEEK, 1000);

        assert_eq!(result.files_deleted(), 0);
        assert_eq!(result.remaining_size, 200);
    }

    #[test]
    fn test_expired_files_do_not_count_toward_size() {
        let temp = TempDir::new().unwrap();
        // Expired bulk plus a small fresh file: the size pass compares
        // survivors only, so it must not run.
        create_aged_file(temp.path(), "expired", 10_000, 30 * 24 * 60 * 60);
        create_aged_file(temp.path(), "fresh", 100, 60);

        let result = sweep(temp.path(), WEEK, 5000);

        assert_eq!(result.expired_deleted, 1);
        assert_eq!(result.culled_deleted, 0);
        assert!(temp.path().join("fresh").exists());
    }

    #[test]
    fn test_both_passes_combined() {
        let temp = TempDir::new().unwrap();
        create_aged_file(temp.path(), "ancient", 500, 30 * 24 * 60 * 60);
        for i in 0..4u64 {
            create_aged_file(temp.path(), &format!("f{i}"), 1000, 400 - i * 100);
        }

        // Survivor total 4000 over ceiling 3000; desired = 1500.
        let result = sweep(temp.path(), WEEK, 3000);

        assert_eq!(result.expired_deleted, 1);
        assert!(result.remaining_size < 1500);
        assert!(temp.path().join("f3").exists(), "newest file survives");
    }

    #[test]
    fn test_bytes_freed_accounting() {
        let temp = TempDir::new().unwrap();
        create_aged_file(temp.path(), "old", 700, 30 * 24 * 60 * 60);

        let result = sweep(temp.path(), WEEK, 0);

        assert_eq!(result.bytes_freed, 700);
    }
}
