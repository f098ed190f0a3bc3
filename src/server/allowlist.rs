//! Client allow-list with hot reload
//!
//! The list is a newline-delimited file of lowercase hex SHA-1 digests of
//! client subject public keys. Readers work against an immutable snapshot
//! behind an `Arc`; a reload parses the whole file and swaps the snapshot
//! in one assignment, so a reader never observes a partially applied edit.

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How often the watcher polls the file for changes
const WATCH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2);

/// The set of authorized client key digests
pub struct Allowlist {
    path: PathBuf,
    snapshot: RwLock<Arc<HashSet<String>>>,
}

impl Allowlist {
    /// Load the allow-list, creating an empty file when none exists
    pub fn load(path: impl Into<PathBuf>) -> io::Result<Arc<Self>> {
        let path = path.into();

        if !path.exists() {
            std::fs::write(&path, "")?;
            info!("created empty allow-list at {}", path.display());
        }

        let content = std::fs::read_to_string(&path)?;
        let entries = parse(&content);
        info!(
            "loaded {} authorized client(s) from {}",
            entries.len(),
            path.display()
        );

        Ok(Arc::new(Self {
            path,
            snapshot: RwLock::new(Arc::new(entries)),
        }))
    }

    /// Whether a key digest is currently authorized
    pub fn contains(&self, digest: &str) -> bool {
        self.snapshot().contains(digest)
    }

    /// The current immutable snapshot
    pub fn snapshot(&self) -> Arc<HashSet<String>> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Re-read the file and swap in the new snapshot.
    ///
    /// A read failure keeps the previous snapshot untouched.
    pub fn reload(&self) {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => {
                let entries = parse(&content);
                info!(
                    "allow-list reloaded: {} authorized client(s)",
                    entries.len()
                );
                *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(entries);
            }
            Err(e) => warn!("allow-list reload failed, keeping current set: {}", e),
        }
    }

    /// Spawn the background task that reloads the file when it changes
    pub fn spawn_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let list = Arc::clone(self);
        tokio::spawn(async move {
            let mut last_seen = modified_time(&list.path).await;
            let mut ticker = tokio::time::interval(WATCH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let current = modified_time(&list.path).await;
                if current != last_seen {
                    debug!("allow-list changed on disk");
                    last_seen = current;
                    list.reload();
                }
            }
        })
    }
}

async fn modified_time(path: &PathBuf) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

fn parse(content: &str) -> HashSet<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| line.to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_skips_blank_lines() {
        let content = "aa0102\n\n  \nbb0304\n";
        let entries = parse(content);
        assert_eq!(entries.len(), 2);
        assert!(entries.contains("aa0102"));
        assert!(entries.contains("bb0304"));
    }

    #[test]
    fn test_parse_normalizes_case() {
        let entries = parse("AA0102\n");
        assert!(entries.contains("aa0102"));
    }

    #[tokio::test]
    async fn test_load_creates_missing_file_and_reloads() {
        let path = std::env::temp_dir().join(format!(
            "portgate-allowlist-{}-{:x}",
            std::process::id(),
            rand::random::<u64>()
        ));

        let list = Allowlist::load(&path).unwrap();
        assert!(path.exists());
        assert!(!list.contains("aa0102"));

        std::fs::write(&path, "aa0102\n").unwrap();
        list.reload();
        assert!(list.contains("aa0102"));

        // snapshots taken before an edit stay stable
        let snapshot = list.snapshot();
        std::fs::write(&path, "").unwrap();
        list.reload();
        assert!(snapshot.contains("aa0102"));
        assert!(!list.contains("aa0102"));

        let _ = std::fs::remove_file(&path);
    }
}
