use anyhow::{Result, bail};
use async_trait::async_trait;
use notify::{
    Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher,
    event::{CreateKind, MetadataKind, ModifyKind},
};
use std::sync::{Mutex, PoisonError};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    sync::mpsc::UnboundedReceiver,
    task::JoinHandle,
    time::{Duration, sleep},
};
use tracing::{debug, error, info, warn};

use crate::{
    channel::ChannelManager,
    pathmap::{self, PathMapRule},
};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Something that reacts to files appearing, changing or going away.
#[async_trait]
pub trait WatchedType: Send + Sync + 'static {
    fn is_relevant(&self, path: &Path) -> bool;
    async fn on_create_or_modify(&self, path: &Path) -> Result<()>;

    async fn on_remove(&self, path: &Path) -> Result<()>;

    async fn reload(&self, path: &Path) -> Result<()> {
        self.on_create_or_modify(path).await
    }
}

/// Running watch on one directory; its tasks live until [`DirectoryWatcher::shutdown`].
pub struct DirectoryWatcher {
    handles: Vec<JoinHandle<()>>,
}

impl DirectoryWatcher {
    /// Watch `dir` for files whose extension is one of `exts` or that
    /// `watcher_impl` finds relevant. With `initial_scan`, existing files are
    /// loaded first; with `enable_retry`, failed loads are retried a few times.
    pub async fn new(
        dir: PathBuf,
        watcher_impl: Arc<dyn WatchedType>,
        exts: &[&str],
        initial_scan: bool,
        enable_retry: bool,
    ) -> Result<DirectoryWatcher> {
        if !dir.exists() {
            let msg = format!("Directory {} does not exist", dir.to_string_lossy());
            warn!(%msg);
            bail!(msg);
        }

        if initial_scan {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if watcher_impl.is_relevant(&path) || is_valid_extension(&path, exts) {
                    try_reload(&watcher_impl, &path, enable_retry).await;
                }
            }
        }

        let (tx, mut rx): (_, UnboundedReceiver<notify::Result<Event>>) =
            tokio::sync::mpsc::unbounded_channel();

        let mut watcher = PollWatcher::new(
            move |res| {
                // nobody listening any more
                let _ = tx.send(res);
            },
            // mtimes are compared in whole seconds, contents catch faster edits
            Config::default().with_poll_interval(POLL_INTERVAL).with_compare_contents(true),
        )?;
        watcher.watch(&dir, RecursiveMode::Recursive)?;

        // owns the poll watcher until aborted
        let handle_watcher = tokio::spawn(async move {
            let _watcher = watcher;
            futures::future::pending::<()>().await;
        });

        let watcher_clone = watcher_impl.clone();
        let exts_clone: Vec<String> = exts.iter().map(|s| s.to_string()).collect();
        let handle_dispatch = tokio::spawn(async move {
            let relevant = |path: &Path| {
                watcher_clone.is_relevant(path)
                    || path
                        .extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| exts_clone.iter().any(|x| x == e))
            };
            while let Some(res) = rx.recv().await {
                match res {
                    Ok(Event {
                        kind:
                            EventKind::Create(CreateKind::Any | CreateKind::File)
                            | EventKind::Modify(
                                ModifyKind::Data(_) | ModifyKind::Metadata(MetadataKind::WriteTime) | ModifyKind::Any,
                            ),
                        paths,
                        ..
                    }) => {
                        for path in paths.into_iter().filter(|p| relevant(p.as_path())) {
                            let watcher_inner = watcher_clone.clone();
                            tokio::spawn(async move {
                                if let Err(e) = watcher_inner.on_create_or_modify(&path).await {
                                    warn!(?path, ?e, "Failed to handle create/modify");
                                }
                            });
                        }
                    }
                    Ok(Event {
                        kind: EventKind::Remove(_),
                        paths,
                        ..
                    }) => {
                        for path in paths.into_iter().filter(|p| relevant(p.as_path())) {
                            if let Err(e) = watcher_clone.on_remove(&path).await {
                                warn!(?path, ?e, "Failed to handle removal");
                            }
                        }
                    }
                    Err(e) => {
                        warn!(?e, "Watcher error");
                    }
                    _ => {}
                }
            }
        });

        Ok(DirectoryWatcher { handles: vec![handle_dispatch, handle_watcher] })
    }

    /// Abort this watcher's tasks. No more events are dispatched after this.
    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

fn is_valid_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|&e| e == ext))
}

async fn try_reload(watched: &Arc<dyn WatchedType>, path: &Path, retry: bool) {
    const MAX_RETRIES: usize = 10;

    for attempt in 0..MAX_RETRIES {
        match watched.reload(path).await {
            Ok(_) => return,
            Err(e) => {
                if !retry || attempt == MAX_RETRIES - 1 {
                    error!("Failed to reload {:?}: {e:?}", path);
                    return;
                }
                warn!("Retrying reload {:?} (attempt {}): {e:?}", path, attempt + 1);
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Keeps one client rule file applied to every open channel.
pub struct PathMapWatcher {
    manager: ChannelManager,
    rules_file: PathBuf,
    client_id: String,
    rules: Mutex<Vec<PathMapRule>>,
}

impl PathMapWatcher {
    pub fn new(manager: ChannelManager, rules_file: PathBuf, client_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            rules_file,
            client_id: client_id.into(),
            rules: Mutex::default(),
        })
    }

    pub fn rules(&self) -> Vec<PathMapRule> {
        self.rules.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Watch the directory holding the rule file; the file is loaded right away.
    pub async fn watch(self: &Arc<Self>) -> Result<DirectoryWatcher> {
        let dir = match self.rules_file.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let watched: Arc<dyn WatchedType> = self.clone();
        DirectoryWatcher::new(dir, watched, &[], true, true).await
    }

    /// Reconcile the current rules with every open channel. Returns how many
    /// agents received a new map.
    pub async fn sync_all(&self) -> usize {
        let rules = self.rules();
        let mut pushed = 0;
        for channel in self.manager.open_channels() {
            match self.manager.sync_path_map(&channel, &rules, &self.client_id, false).await {
                Ok(true) => pushed += 1,
                Ok(false) => {}
                Err(e) => warn!(channel = %channel.id(), "path map sync failed: {e}"),
            }
        }
        pushed
    }
}

#[async_trait]
impl WatchedType for PathMapWatcher {
    fn is_relevant(&self, path: &Path) -> bool {
        path.file_name().is_some() && path.file_name() == self.rules_file.file_name()
    }

    async fn on_create_or_modify(&self, path: &Path) -> Result<()> {
        let rules = pathmap::load_rules(path)?;
        info!(path = %path.display(), rules = rules.len(), "path map rules reloaded");
        *self.rules.lock().unwrap_or_else(PoisonError::into_inner) = rules;
        let pushed = self.sync_all().await;
        debug!(pushed, "path map rules applied");
        Ok(())
    }

    /// Agents keep what they have; only later opens see the empty set.
    async fn on_remove(&self, path: &Path) -> Result<()> {
        info!(path = %path.display(), "path map rule file removed");
        self.rules.lock().unwrap_or_else(PoisonError::into_inner).clear();
        Ok(())
    }
}
