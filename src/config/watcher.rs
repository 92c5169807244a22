//! Configuration file watcher for hot reload.
//!
//! The directory holding the file is watched rather than the file itself:
//! editors that save by renaming a temporary file over the original replace
//! the watched inode, and a watch on the file would go quiet after the
//! first such save.

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::loader::parse_config;
use crate::config::schema::BalancerConfig;

/// A watcher that monitors the configuration file for changes.
pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<BalancerConfig>,
}

impl ConfigWatcher {
    /// Create a new ConfigWatcher.
    ///
    /// Returns the watcher and a receiver for validated configuration updates.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<BalancerConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        (
            Self {
                path: path.to_path_buf(),
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching in a background thread.
    ///
    /// The returned watcher must be kept alive for updates to keep flowing.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let dir = watch_dir(&self.path);
        let file_name = self
            .path
            .file_name()
            .map(OsStr::to_os_string)
            .ok_or_else(|| notify::Error::generic("config path has no file name"))?;

        let mut reloader = Reloader::new(self.path.clone(), self.update_tx);

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if touches(&event, &file_name) => reloader.reload(),
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, dir = ?dir, "Config watcher started");
        Ok(watcher)
    }
}

fn watch_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Whether `event` may have changed the file called `file_name`.
fn touches(event: &Event, file_name: &OsStr) -> bool {
    (event.kind.is_modify() || event.kind.is_create())
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name))
}

/// Re-reads the file and forwards configurations that changed and validate.
struct Reloader {
    path: PathBuf,
    last: Option<String>,
    tx: mpsc::UnboundedSender<BalancerConfig>,
}

impl Reloader {
    fn new(path: PathBuf, tx: mpsc::UnboundedSender<BalancerConfig>) -> Self {
        let last = fs::read_to_string(&path).ok();
        Self { path, last, tx }
    }

    fn reload(&mut self) {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(
                    path = ?self.path,
                    error = %e,
                    "Config file unreadable, keeping current configuration"
                );
                return;
            }
        };

        // one save usually raises several events
        if self.last.as_deref() == Some(content.as_str()) {
            return;
        }

        match parse_config(&content) {
            Ok(config) => {
                tracing::info!(path = ?self.path, "Config file change detected, reloading");
                self.last = Some(content);
                if self.tx.send(config).is_err() {
                    tracing::warn!(
                        path = ?self.path,
                        "Config update receiver dropped, update discarded"
                    );
                }
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "Failed to reload config, keeping current configuration"
                );
            }
        }
    }
}
