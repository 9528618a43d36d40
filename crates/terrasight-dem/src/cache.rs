//! On-disk tile cache primitives shared by every job.
//!
//! Two rules keep the cache safe under concurrent jobs: files only appear
//! at their final path through an atomic rename, and each cache key has at
//! most one download in flight with other requesters waiting on it.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fs;
use std::hash::Hash;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write `bytes` to `path` so readers never observe a partial file.
///
/// Data goes to a uniquely named sibling first and is renamed into place.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let temp_name = format!(
        ".{}.part-{}-{}",
        file_name,
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    let temp_path = match parent {
        Some(parent) => parent.join(temp_name),
        None => temp_name.into(),
    };

    let result = (|| {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

/// Status of a download in progress.
#[derive(Clone)]
enum DownloadStatus {
    InProgress,
    Complete,
    Failed(String),
}

/// One in-flight key: its status and how many callers are blocked on it.
struct Slot {
    status: DownloadStatus,
    waiters: usize,
}

/// Download statistics for a tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadStats {
    /// Number of downloads completed.
    pub files_downloaded: usize,
    /// Total bytes downloaded.
    pub bytes_downloaded: u64,
}

/// Coalesces concurrent downloads of the same key.
///
/// The first caller for a key performs the download; callers arriving while
/// it runs block until it finishes and then share its outcome. The entry is
/// dropped once the last waiter has read it, so a failure is reported to the
/// callers that waited on it and never to later ones.
pub struct DownloadTracker<K> {
    in_flight: Mutex<HashMap<K, Slot>>,
    download_complete: Condvar,
    files_downloaded: AtomicUsize,
    bytes_downloaded: AtomicU64,
}

impl<K> Default for DownloadTracker<K> {
    fn default() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
            download_complete: Condvar::new(),
            files_downloaded: AtomicUsize::new(0),
            bytes_downloaded: AtomicU64::new(0),
        }
    }
}

impl<K: Eq + Hash + Clone> DownloadTracker<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> DownloadStats {
        DownloadStats {
            files_downloaded: self.files_downloaded.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
        }
    }

    /// Run `download` for `key` unless it is already cached or in flight.
    ///
    /// `is_cached` is re-checked under the lock so a download finished by
    /// another thread is not repeated. `download` returns the number of
    /// bytes fetched on success or a failure reason.
    pub fn fetch<C, D>(&self, key: &K, is_cached: C, download: D) -> Result<(), String>
    where
        C: Fn() -> bool,
        D: FnOnce() -> Result<u64, String>,
    {
        if is_cached() {
            return Ok(());
        }

        {
            let mut tracker = self.in_flight.lock();
            if let Some(slot) = tracker.get_mut(key) {
                slot.waiters += 1;
                loop {
                    let status = match tracker.get(key) {
                        Some(slot) => slot.status.clone(),
                        None => return Err("download slot vanished".to_string()),
                    };
                    if let DownloadStatus::InProgress = status {
                        self.download_complete.wait(&mut tracker);
                        continue;
                    }
                    if let Some(slot) = tracker.get_mut(key) {
                        slot.waiters -= 1;
                        if slot.waiters == 0 {
                            tracker.remove(key);
                        }
                    }
                    return match status {
                        DownloadStatus::Failed(reason) => Err(reason),
                        _ => Ok(()),
                    };
                }
            }
            if is_cached() {
                return Ok(());
            }
            tracker.insert(
                key.clone(),
                Slot {
                    status: DownloadStatus::InProgress,
                    waiters: 0,
                },
            );
        }

        // Settles the slot even if `download` unwinds, so waiters never hang.
        let mut guard = SettleOnDrop {
            tracker: self,
            key,
            settled: false,
        };
        let result = download();
        guard.settled = true;
        self.settle(key, &result);

        result.map(|_| ())
    }

    /// Publish `result` for `key` and wake every waiter.
    fn settle(&self, key: &K, result: &Result<u64, String>) {
        {
            let mut tracker = self.in_flight.lock();
            if let Ok(bytes) = result {
                self.files_downloaded.fetch_add(1, Ordering::Relaxed);
                self.bytes_downloaded.fetch_add(*bytes, Ordering::Relaxed);
            }
            let waiting = tracker.get(key).map_or(0, |slot| slot.waiters);
            if waiting == 0 {
                tracker.remove(key);
            } else if let Some(slot) = tracker.get_mut(key) {
                slot.status = match result {
                    Ok(_) => DownloadStatus::Complete,
                    Err(reason) => DownloadStatus::Failed(reason.clone()),
                };
            }
        }
        self.download_complete.notify_all();
    }
}

struct SettleOnDrop<'a, K: Eq + Hash + Clone> {
    tracker: &'a DownloadTracker<K>,
    key: &'a K,
    settled: bool,
}

impl<K: Eq + Hash + Clone> Drop for SettleOnDrop<'_, K> {
    fn drop(&mut self) {
        if !self.settled {
            self.tracker
                .settle(self.key, &Err("download panicked".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_write_atomic_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("tile.hgt");
        write_atomic(&target, b"abc").unwrap();
        write_atomic(&target, b"defg").unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"defg");
        let entries: Vec<_> = fs::read_dir(target.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_concurrent_fetch_downloads_once() {
        let dir = tempfile::tempdir().unwrap();
        let target = Arc::new(dir.path().join("t.bin"));
        let tracker = Arc::new(DownloadTracker::<String>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                let target = Arc::clone(&target);
                let calls = Arc::clone(&calls);
                thread::spawn(move || {
                    tracker.fetch(
                        &"t".to_string(),
                        || target.exists(),
                        || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(50));
                            write_atomic(&target, &[0u8; 16]).map_err(|e| e.to_string())?;
                            Ok(16)
                        },
                    )
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            tracker.stats(),
            DownloadStats {
                files_downloaded: 1,
                bytes_downloaded: 16
            }
        );
    }

    #[test]
    fn test_failed_fetch_reports_reason() {
        let tracker = DownloadTracker::<u32>::new();
        let err = tracker.fetch(&7, || false, || Err("boom".to_string()));
        assert_eq!(err, Err("boom".to_string()));
        // The failure is not sticky for later callers.
        assert_eq!(tracker.fetch(&7, || false, || Ok(1)), Ok(()));
        assert_eq!(tracker.stats().files_downloaded, 1);
    }

    #[test]
    fn test_panicking_download_releases_waiters() {
        let tracker = Arc::new(DownloadTracker::<u32>::new());
        let started = Arc::new(std::sync::Barrier::new(2));

        let owner = {
            let tracker = Arc::clone(&tracker);
            let started = Arc::clone(&started);
            thread::spawn(move || {
                tracker.fetch(&3, || false, || {
                    started.wait();
                    thread::sleep(Duration::from_millis(50));
                    panic!("decoder bug");
                })
            })
        };
        started.wait();
        let waiter = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || tracker.fetch(&3, || false, || Ok(1)))
        };

        assert!(owner.join().is_err());
        // The waiter either shared the failure or ran its own download.
        match waiter.join().unwrap() {
            Err(reason) => assert_eq!(reason, "download panicked"),
            Ok(()) => assert_eq!(tracker.stats().files_downloaded, 1),
        }
        assert_eq!(tracker.fetch(&3, || false, || Ok(2)), Ok(()));
    }
}
