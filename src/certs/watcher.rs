//! Certificate file watcher for hot reload.
//!
//! Watches the directories containing the certificate, key, and CA files
//! rather than the files themselves, so rename-into-place updates (including
//! the `..data` symlink swap used by mounted secrets) are observed.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::certs::bundle::{BundleError, CertPaths, CertificateBundle};
use crate::certs::cache::BundleCache;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to watch certificate directory: {0}")]
    Notify(#[from] notify::Error),
}

/// A directory and the file names within it that matter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    pub directory: PathBuf,
    pub basenames: BTreeSet<OsString>,
}

impl WatchTarget {
    fn matches(&self, path: &Path) -> bool {
        let Some(name) = path.file_name() else {
            return false;
        };
        self.basenames.contains(name) || name.to_string_lossy().starts_with("..")
    }
}

/// Group paths by parent directory; paths sharing a directory share a target.
pub fn watch_targets(paths: &CertPaths) -> Vec<WatchTarget> {
    let mut targets: Vec<WatchTarget> = Vec::new();
    for path in [Some(&paths.cert), Some(&paths.key), paths.ca.as_ref()]
        .into_iter()
        .flatten()
    {
        let (Some(directory), Some(name)) = (path.parent(), path.file_name()) else {
            continue;
        };
        let directory = if directory.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            directory.to_path_buf()
        };
        match targets.iter_mut().find(|t| t.directory == directory) {
            Some(target) => {
                target.basenames.insert(name.to_os_string());
            }
            None => targets.push(WatchTarget {
                directory,
                basenames: BTreeSet::from([name.to_os_string()]),
            }),
        }
    }
    targets
}

/// Result of a reload attempt.
#[derive(Debug)]
pub enum ReloadOutcome {
    /// A new bundle was installed.
    Rotated,
    /// Disk content equals the current bundle.
    Unchanged,
    /// Disk content was unusable; the previous bundle is retained.
    Rejected(BundleError),
}

/// Keeps the bundle cache in sync with certificate files on disk.
pub struct CertWatcher {
    paths: CertPaths,
    cache: BundleCache,
    debounce: Duration,
}

impl CertWatcher {
    pub fn new(paths: CertPaths, cache: BundleCache, debounce: Duration) -> Self {
        Self {
            paths,
            cache,
            debounce,
        }
    }

    pub fn targets(&self) -> Vec<WatchTarget> {
        watch_targets(&self.paths)
    }

    /// Load the bundle once and install it. Fails if the files are unusable.
    pub fn load_initial(&self) -> Result<Arc<CertificateBundle>, BundleError> {
        let bundle = Arc::new(CertificateBundle::load(&self.paths)?);
        self.cache.set(Arc::clone(&bundle));
        tracing::info!(
            cert = %self.paths.cert.display(),
            key = %self.paths.key.display(),
            ca = ?self.paths.ca,
            "Serving certificate loaded from disk"
        );
        Ok(bundle)
    }

    /// Re-read every file and swap the cache if the pair is consistent and new.
    pub fn reload(&self) -> ReloadOutcome {
        let bundle = match CertificateBundle::load(&self.paths) {
            Ok(bundle) => bundle,
            Err(e) => {
                tracing::warn!(
                    cert = %self.paths.cert.display(),
                    error = %e,
                    "Certificate reload rejected, keeping current certificate"
                );
                return ReloadOutcome::Rejected(e);
            }
        };

        if let Some(current) = self.cache.get() {
            if current.same_material(&bundle) {
                tracing::debug!("Certificate files unchanged");
                return ReloadOutcome::Unchanged;
            }
        }

        let not_after = bundle.not_after();
        self.cache.set(Arc::new(bundle));
        tracing::info!(
            cert = %self.paths.cert.display(),
            not_after = ?not_after,
            generation = self.cache.generation(),
            "Serving certificate rotated"
        );
        ReloadOutcome::Rotated
    }

    /// Start watching in the background.
    ///
    /// Filesystem events are forwarded from the notify thread into a channel;
    /// the task coalesces bursts and then reads from disk.
    pub fn spawn(
        self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<JoinHandle<()>, WatchError> {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<()>();
        let targets = self.targets();

        let handler_targets = targets.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_access() {
                        return;
                    }
                    let relevant = event
                        .paths
                        .iter()
                        .any(|p| handler_targets.iter().any(|t| t.matches(p)));
                    if relevant {
                        let _ = event_tx.send(());
                    }
                }
                Err(e) => tracing::error!(error = %e, "Certificate watch error"),
            },
            Config::default(),
        )?;

        for target in &targets {
            watcher.watch(&target.directory, RecursiveMode::NonRecursive)?;
            tracing::info!(
                directory = %target.directory.display(),
                files = ?target.basenames,
                "Certificate watcher started"
            );
        }

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    event = event_rx.recv() => {
                        if event.is_none() {
                            break;
                        }
                        // Coalesce until the directory has been quiet for one debounce window.
                        while let Ok(Some(())) =
                            tokio::time::timeout(self.debounce, event_rx.recv()).await
                        {}
                        self.reload();
                    }
                }
            }
            drop(watcher);
            tracing::info!("Certificate watcher stopped");
        }))
    }
}
