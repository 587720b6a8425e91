// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tracks which files have been read this session, so mutating tools can
//! refuse to touch a file the model has never seen or that changed on disk
//! behind its back.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

/// Per-session map of `path -> mtime at last read`.
///
/// Shared (via `Arc`) between the read tools that populate it and the
/// write/edit tools that consult it before mutating a file.
pub struct FileTracker {
    tracked: Mutex<HashMap<PathBuf, SystemTime>>,
}

impl FileTracker {
    pub fn new() -> Self {
        Self { tracked: Mutex::new(HashMap::new()) }
    }

    fn key(path: &str) -> PathBuf {
        std::fs::canonicalize(path).unwrap_or_else(|_| PathBuf::from(path))
    }

    /// Record that `path` was read (or successfully written) just now.
    /// No-op if the path cannot be stat'd (e.g. it does not exist yet).
    pub fn mark_read(&self, path: &str) {
        let key = Self::key(path);
        if let Ok(mtime) = std::fs::metadata(&key).and_then(|m| m.modified()) {
            self.tracked.lock().unwrap().insert(key, mtime);
        }
    }

    /// Returns `true` if `path` has never been read this session.
    pub fn is_untracked(&self, path: &str) -> bool {
        !self.tracked.lock().unwrap().contains_key(&Self::key(path))
    }

    /// Gate a mutation against `path`.  Returns `Err` with a model-facing
    /// message when the file was never read this session, or when it was
    /// modified on disk since the tracked read.
    pub fn check_writable(&self, path: &str) -> Result<(), String> {
        let key = Self::key(path);
        let tracked_mtime = {
            let tracked = self.tracked.lock().unwrap();
            match tracked.get(&key) {
                Some(mtime) => *mtime,
                None => {
                    return Err(
                        "File has not been read yet. Read it first before writing to it."
                            .to_string(),
                    );
                }
            }
        };
        if let Ok(current_mtime) = std::fs::metadata(&key).and_then(|m| m.modified()) {
            if current_mtime > tracked_mtime {
                return Err(format!(
                    "{path} was modified on disk since it was last read. Read it again before editing."
                ));
            }
        }
        Ok(())
    }

    /// `true` iff `path` exists on disk right now.
    pub fn exists(path: &str) -> bool {
        Path::new(path).exists()
    }
}

impl Default for FileTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn tmp_path(name: &str) -> String {
        static CTR: AtomicU32 = AtomicU32::new(0);
        let n = CTR.fetch_add(1, Ordering::Relaxed);
        format!("/tmp/sven_file_tracker_test_{}_{n}_{name}", std::process::id())
    }

    #[test]
    fn untracked_file_is_not_writable() {
        let path = tmp_path("a.txt");
        std::fs::write(&path, "hi").unwrap();
        let tracker = FileTracker::new();
        assert!(tracker.check_writable(&path).is_err());
    }

    #[test]
    fn read_then_write_is_allowed() {
        let path = tmp_path("b.txt");
        std::fs::write(&path, "hi").unwrap();
        let tracker = FileTracker::new();
        tracker.mark_read(&path);
        assert!(tracker.check_writable(&path).is_ok());
    }

    #[test]
    fn externally_modified_file_is_rejected() {
        let path = tmp_path("c.txt");
        std::fs::write(&path, "hi").unwrap();
        let tracker = FileTracker::new();
        tracker.mark_read(&path);
        // Force a detectably later mtime.
        std::thread::sleep(std::time::Duration::from_millis(10));
        std::fs::write(&path, "changed externally").unwrap();
        let err = tracker.check_writable(&path).unwrap_err();
        assert!(err.contains("modified on disk"), "{err}");
    }

    #[test]
    fn is_untracked_reflects_read_state() {
        let path = tmp_path("d.txt");
        std::fs::write(&path, "hi").unwrap();
        let tracker = FileTracker::new();
        assert!(tracker.is_untracked(&path));
        tracker.mark_read(&path);
        assert!(!tracker.is_untracked(&path));
    }
}
