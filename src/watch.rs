//! Watching mock directories and keeping the registry current.
//!
//! The coordinator owns the registry's write path: it seeds config-declared
//! mocks, runs the initial scan, and then serializes watch events into
//! loader calls. The raw watch mechanism stays behind [`WatchSource`], so it
//! can be replaced (or disabled) without touching the pipeline.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{MockSource, ServerConfig};
use crate::error::Error;
use crate::events::{EventBus, ServerEvent};
use crate::loader::{LoadOutcome, MockLoader};
use crate::mock::MockValue;
use crate::registry::{MockRegistry, SourceRank};
use crate::shutdown::Shutdown;

/// Lifecycle of the watch coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    Scanning,
    Ready,
    Watching,
    Closing,
    Closed,
}

/// A change observed by a watch source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEventKind {
    Add,
    Change,
    Delete,
}

#[derive(Debug, Clone)]
pub struct FsEvent {
    pub kind: FsEventKind,
    pub path: PathBuf,
}

/// Messages a watch source sends to the coordinator.
#[derive(Debug)]
pub enum WatchMessage {
    /// The subscription is established. Must be sent exactly once.
    Ready,
    Event(FsEvent),
    Error(String),
}

/// A pluggable file-system watch mechanism.
pub trait WatchSource: Send + 'static {
    /// Begin watching the given roots, forwarding matching events to `tx`.
    /// Must send [`WatchMessage::Ready`] once the subscription is live.
    fn start(
        &mut self,
        roots: &[PathBuf],
        filter: GlobFilter,
        tx: mpsc::UnboundedSender<WatchMessage>,
    ) -> Result<(), Error>;

    /// Release the subscription. Idempotent.
    fn close(&mut self);
}

/// Compiled include/exclude glob patterns.
#[derive(Debug, Clone)]
pub struct GlobFilter {
    include: GlobSet,
    exclude: GlobSet,
}

impl GlobFilter {
    /// Compile a pattern list; patterns prefixed `!` are exclusions.
    pub fn new(patterns: &[String]) -> Result<Self, Error> {
        let mut include = GlobSetBuilder::new();
        let mut exclude = GlobSetBuilder::new();
        for pattern in patterns {
            let (builder, body) = match pattern.strip_prefix('!') {
                Some(rest) => (&mut exclude, rest),
                None => (&mut include, pattern.as_str()),
            };
            builder.add(Glob::new(body).map_err(|source| Error::Glob {
                pattern: pattern.clone(),
                source,
            })?);
        }
        Ok(Self {
            include: include.build().map_err(|source| Error::Glob {
                pattern: String::new(),
                source,
            })?,
            exclude: exclude.build().map_err(|source| Error::Glob {
                pattern: String::new(),
                source,
            })?,
        })
    }

    pub fn is_match(&self, path: &Path) -> bool {
        self.include.is_match(path) && !self.exclude.is_match(path)
    }
}

/// `notify`-backed watch source.
#[derive(Default)]
pub struct NotifyWatchSource {
    watcher: Option<RecommendedWatcher>,
}

impl NotifyWatchSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WatchSource for NotifyWatchSource {
    fn start(
        &mut self,
        roots: &[PathBuf],
        filter: GlobFilter,
        tx: mpsc::UnboundedSender<WatchMessage>,
    ) -> Result<(), Error> {
        let event_tx = tx.clone();
        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<notify::Event>| match result {
                Ok(event) => {
                    let Some(kind) = map_kind(&event.kind) else {
                        return;
                    };
                    for path in event.paths {
                        if filter.is_match(&path) {
                            let _ = event_tx.send(WatchMessage::Event(FsEvent {
                                kind,
                                path,
                            }));
                        }
                    }
                }
                Err(err) => {
                    let _ = event_tx.send(WatchMessage::Error(err.to_string()));
                }
            },
            notify::Config::default(),
        )?;

        for root in roots {
            // A root that does not exist yet is not an error; there is just
            // nothing to watch there.
            if root.is_dir() {
                watcher.watch(root, RecursiveMode::Recursive)?;
            }
        }

        self.watcher = Some(watcher);
        let _ = tx.send(WatchMessage::Ready);
        Ok(())
    }

    fn close(&mut self) {
        self.watcher.take();
    }
}

fn map_kind(kind: &notify::EventKind) -> Option<FsEventKind> {
    use notify::EventKind;
    match kind {
        EventKind::Create(_) => Some(FsEventKind::Add),
        EventKind::Modify(_) => Some(FsEventKind::Change),
        EventKind::Remove(_) => Some(FsEventKind::Delete),
        _ => None,
    }
}

/// Probe handle for a running (or finished) coordinator.
#[derive(Debug)]
pub struct WatchHandle {
    state: watch::Receiver<WatchState>,
    task: Option<JoinHandle<()>>,
}

impl WatchHandle {
    pub fn state(&self) -> WatchState {
        *self.state.borrow()
    }

    /// Wait for the steady-state task (if any) to finish.
    pub async fn closed(self) {
        if let Some(task) = self.task {
            let _ = task.await;
        }
    }
}

/// Bridges watch notifications into serialized registry mutations.
pub struct WatchCoordinator {
    registry: Arc<RwLock<MockRegistry>>,
    events: EventBus,
    loader: Arc<MockLoader>,
    filter: GlobFilter,
    globs: Vec<String>,
    roots: Vec<PathBuf>,
    inline: Vec<(String, serde_json::Value)>,
    watch_enabled: bool,
    state: watch::Sender<WatchState>,
    state_probe: watch::Receiver<WatchState>,
}

impl WatchCoordinator {
    /// Split the configured mock sources and compile the glob set.
    ///
    /// Startup with neither globs nor inline mocks is a configuration error.
    pub fn new(
        config: &ServerConfig,
        registry: Arc<RwLock<MockRegistry>>,
        events: EventBus,
    ) -> Result<Self, Error> {
        let mut globs = Vec::new();
        let mut inline = Vec::new();
        for source in &config.mocks {
            match source {
                MockSource::Glob(pattern) => globs.push(absolutize(pattern)?),
                MockSource::Inline(mock) => inline.push((mock.path.clone(), mock.mock.clone())),
            }
        }

        if globs.is_empty() && inline.is_empty() {
            return Err(Error::Config("no valid mocks provided".to_string()));
        }

        let filter = GlobFilter::new(&globs)?;
        let mut roots = Vec::new();
        for glob in globs.iter().filter(|g| !g.starts_with('!')) {
            let root = glob_root(glob);
            if !roots.contains(&root) {
                roots.push(root);
            }
        }

        let loader = Arc::new(MockLoader::new(roots.clone()));
        let (state, state_probe) = watch::channel(WatchState::Idle);

        Ok(Self {
            registry,
            events,
            loader,
            filter,
            globs,
            roots,
            inline,
            watch_enabled: config.watch,
            state,
            state_probe,
        })
    }

    /// Run the initial scan and, if enabled, enter steady-state watching.
    ///
    /// Returns once the coordinator is Ready: config mocks seeded, the scan
    /// batch fully loaded, and the watch source's own startup signal seen.
    pub async fn run(
        self,
        source: Option<Box<dyn WatchSource>>,
        shutdown: &Shutdown,
    ) -> Result<WatchHandle, Error> {
        self.state.send_replace(WatchState::Scanning);
        self.events.emit(ServerEvent::MockGlobs(self.globs.clone()));

        {
            let mut registry = self.registry.write().await;
            for (path, mock) in &self.inline {
                registry.set(
                    &format!("config:{path}"),
                    SourceRank::Inline,
                    path,
                    MockValue::interpret(mock.clone()),
                );
            }
        }

        // Subscribe before scanning so changes landing mid-scan are not
        // missed; their events fold into the initial batch below.
        let subscription = if self.watch_enabled {
            let (tx, rx) = mpsc::unbounded_channel();
            let mut source = source
                .unwrap_or_else(|| Box::new(NotifyWatchSource::new()) as Box<dyn WatchSource>);
            source.start(&self.roots, self.filter.clone(), tx)?;
            Some((source, rx))
        } else {
            None
        };

        self.scan().await?;

        let Some((mut source, mut rx)) = subscription else {
            self.state.send_replace(WatchState::Ready);
            self.events.emit(ServerEvent::Loaded);
            info!(routes = self.registry.read().await.route_count(), "mocks loaded");
            return Ok(WatchHandle {
                state: self.state_probe.clone(),
                task: None,
            });
        };

        let mut shutdown_rx = shutdown.subscribe();

        // Events arriving before the source's startup signal belong to the
        // initial batch; Ready stays blocked until they are loaded too.
        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(WatchMessage::Ready) => break,
                    Some(WatchMessage::Event(event)) => self.handle_event(event).await,
                    Some(WatchMessage::Error(err)) => {
                        self.events.emit(ServerEvent::Error(err));
                    }
                    None => {
                        source.close();
                        self.state.send_replace(WatchState::Closed);
                        return Err(Error::Watch(
                            "watch source closed before signalling ready".to_string(),
                        ));
                    }
                },
                _ = shutdown_rx.recv() => {
                    self.state.send_replace(WatchState::Closing);
                    source.close();
                    self.state.send_replace(WatchState::Closed);
                    return Ok(WatchHandle {
                        state: self.state_probe.clone(),
                        task: None,
                    });
                }
            }
        }

        self.state.send_replace(WatchState::Ready);
        self.events.emit(ServerEvent::Loaded);
        info!(routes = self.registry.read().await.route_count(), "mocks loaded");

        self.state.send_replace(WatchState::Watching);
        let probe = self.state_probe.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = rx.recv() => match message {
                        Some(WatchMessage::Event(event)) => self.handle_event(event).await,
                        Some(WatchMessage::Error(err)) => {
                            warn!(%err, "watch source error");
                            self.events.emit(ServerEvent::Error(err));
                        }
                        // A duplicate ready signal is ignored; ready fires once.
                        Some(WatchMessage::Ready) => {}
                        None => break,
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
            self.state.send_replace(WatchState::Closing);
            source.close();
            self.state.send_replace(WatchState::Closed);
            debug!("watch coordinator closed");
        });

        Ok(WatchHandle {
            state: probe,
            task: Some(task),
        })
    }

    /// Enumerate and load everything currently matching the glob set.
    async fn scan(&self) -> Result<(), Error> {
        let roots = self.roots.clone();
        let filter = self.filter.clone();
        let files = tokio::task::spawn_blocking(move || scan_files(&roots, &filter))
            .await
            .map_err(|err| Error::Watch(err.to_string()))?;

        let mut loads = JoinSet::new();
        for file in files {
            let loader = Arc::clone(&self.loader);
            let registry = Arc::clone(&self.registry);
            let events = self.events.clone();
            loads.spawn(async move {
                if let Err(err) = loader.reload(&registry, &file).await {
                    warn!(%err, "failed to load mock during initial scan");
                    events.emit(ServerEvent::Error(err.to_string()));
                }
            });
        }
        while loads.join_next().await.is_some() {}
        Ok(())
    }

    /// Load one change event; the `mock-updated` notification fires only
    /// after the load completes. Events are handled one at a time, which
    /// linearizes mutations per source path.
    async fn handle_event(&self, event: FsEvent) {
        debug!(kind = ?event.kind, path = %event.path.display(), "mock change observed");
        match self.loader.reload(&self.registry, &event.path).await {
            Ok(LoadOutcome::Skipped) => {}
            Ok(_) => {
                self.events
                    .emit(ServerEvent::MockUpdated(event.path.display().to_string()));
            }
            Err(err) => {
                warn!(%err, "failed to reload mock");
                self.events.emit(ServerEvent::Error(err.to_string()));
            }
        }
    }
}

fn scan_files(roots: &[PathBuf], filter: &GlobFilter) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut found = Vec::new();
    for root in roots {
        for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
            let path = entry.path();
            if entry.file_type().is_file()
                && filter.is_match(path)
                && seen.insert(path.to_path_buf())
            {
                found.push(path.to_path_buf());
            }
        }
    }
    found
}

/// Anchor a relative glob pattern at the current working directory,
/// preserving a leading `!`.
fn absolutize(pattern: &str) -> Result<String, Error> {
    let (negation, body) = match pattern.strip_prefix('!') {
        Some(rest) => ("!", rest),
        None => ("", pattern),
    };
    if Path::new(body).is_absolute() {
        return Ok(pattern.to_string());
    }
    let cwd = std::env::current_dir()
        .map_err(|err| Error::Config(format!("cannot resolve working directory: {err}")))?;
    let joined = cwd.join(body.trim_start_matches("./"));
    Ok(format!("{negation}{}", joined.display()))
}

/// The non-wildcard directory prefix of a glob pattern.
fn glob_root(pattern: &str) -> PathBuf {
    let mut root = PathBuf::new();
    for component in Path::new(pattern).components() {
        let text = component.as_os_str().to_string_lossy();
        if text.contains(['*', '?', '[', '{']) {
            break;
        }
        root.push(component);
    }
    root
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[test]
    fn glob_root_stops_at_the_first_wildcard() {
        assert_eq!(glob_root("/srv/mocks/**/*"), PathBuf::from("/srv/mocks"));
        assert_eq!(glob_root("/srv/*.json"), PathBuf::from("/srv"));
        assert_eq!(glob_root("/srv/mocks/api"), PathBuf::from("/srv/mocks/api"));
    }

    #[test]
    fn filter_applies_exclusions() {
        let filter = GlobFilter::new(&[
            "/srv/mocks/**/*".to_string(),
            "!/srv/mocks/**/*.bak".to_string(),
        ])
        .unwrap();
        assert!(filter.is_match(Path::new("/srv/mocks/a.json")));
        assert!(!filter.is_match(Path::new("/srv/mocks/a.json.bak")));
        assert!(!filter.is_match(Path::new("/elsewhere/a.json")));
    }

    #[test]
    fn invalid_glob_is_a_config_error() {
        assert!(GlobFilter::new(&["/srv/[".to_string()]).is_err());
    }

    /// Watch source driven by the test: replays `Ready` immediately, then
    /// hands the sender out for manual event injection.
    #[derive(Clone, Default)]
    struct FakeSource {
        tx: Arc<Mutex<Option<mpsc::UnboundedSender<WatchMessage>>>>,
        closed: Arc<AtomicBool>,
    }

    impl WatchSource for FakeSource {
        fn start(
            &mut self,
            _roots: &[PathBuf],
            _filter: GlobFilter,
            tx: mpsc::UnboundedSender<WatchMessage>,
        ) -> Result<(), Error> {
            let _ = tx.send(WatchMessage::Ready);
            *self.tx.lock().unwrap() = Some(tx);
            Ok(())
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn config_for(dir: &Path, watch: bool) -> ServerConfig {
        let yaml = format!(
            "port: 0\nwatch: {}\nmocks:\n  - \"{}/**/*\"\n",
            watch,
            dir.display()
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    async fn wait_for(
        rx: &mut tokio::sync::broadcast::Receiver<ServerEvent>,
        want: impl Fn(&ServerEvent) -> bool,
    ) {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if want(&event) {
                    return;
                }
            }
        })
        .await
        .expect("event not observed in time");
    }

    #[tokio::test]
    async fn scan_only_run_reaches_ready_without_watching() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.txt"), b"hi").await.unwrap();

        let registry = Arc::new(RwLock::new(MockRegistry::new()));
        let events = EventBus::new();
        let mut rx = events.subscribe();

        let coordinator = WatchCoordinator::new(
            &config_for(dir.path(), false),
            Arc::clone(&registry),
            events,
        )
        .unwrap();

        let handle = coordinator.run(None, &Shutdown::new()).await.unwrap();
        assert_eq!(handle.state(), WatchState::Ready);
        wait_for(&mut rx, |e| matches!(e, ServerEvent::Loaded)).await;
        assert_eq!(registry.read().await.get("/a.txt").len(), 1);
    }

    #[tokio::test]
    async fn events_reload_and_notify_after_ready() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(RwLock::new(MockRegistry::new()));
        let events = EventBus::new();
        let mut rx = events.subscribe();

        let coordinator = WatchCoordinator::new(
            &config_for(dir.path(), true),
            Arc::clone(&registry),
            events,
        )
        .unwrap();

        let source = FakeSource::default();
        let shutdown = Shutdown::new();
        let handle = coordinator
            .run(Some(Box::new(source.clone())), &shutdown)
            .await
            .unwrap();
        assert_eq!(handle.state(), WatchState::Watching);

        // A file appears and the source reports it.
        let file = dir.path().join("fresh.txt");
        tokio::fs::write(&file, b"new").await.unwrap();
        source
            .tx
            .lock()
            .unwrap()
            .as_ref()
            .unwrap()
            .send(WatchMessage::Event(FsEvent {
                kind: FsEventKind::Add,
                path: file.clone(),
            }))
            .unwrap();

        wait_for(&mut rx, |e| matches!(e, ServerEvent::MockUpdated(_))).await;
        assert_eq!(registry.read().await.get("/fresh.txt").len(), 1);

        // Deleting reverts the route.
        tokio::fs::remove_file(&file).await.unwrap();
        source
            .tx
            .lock()
            .unwrap()
            .as_ref()
            .unwrap()
            .send(WatchMessage::Event(FsEvent {
                kind: FsEventKind::Delete,
                path: file.clone(),
            }))
            .unwrap();
        wait_for(&mut rx, |e| matches!(e, ServerEvent::MockUpdated(_))).await;
        assert!(registry.read().await.get("/fresh.txt").is_empty());

        // Shutdown is one-way and idempotent.
        shutdown.trigger();
        shutdown.trigger();
        handle.closed().await;
        assert!(source.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn startup_without_any_mocks_is_a_config_error() {
        let yaml = "port: 0\nmocks: []\n";
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        let result = WatchCoordinator::new(
            &config,
            Arc::new(RwLock::new(MockRegistry::new())),
            EventBus::new(),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn inline_config_mocks_are_seeded_before_ready() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            "port: 0\nwatch: false\nmocks:\n  - \"{}/**/*\"\n  - path: /greeting\n    mock:\n      response:\n        body: hello\n",
            dir.path().display()
        );
        let config: ServerConfig = serde_yaml::from_str(&yaml).unwrap();

        let registry = Arc::new(RwLock::new(MockRegistry::new()));
        let coordinator =
            WatchCoordinator::new(&config, Arc::clone(&registry), EventBus::new()).unwrap();
        coordinator.run(None, &Shutdown::new()).await.unwrap();

        let mocks = registry.read().await.get("/greeting");
        assert_eq!(mocks.len(), 1);
        assert!(matches!(mocks[0].as_ref(), MockValue::Descriptor(_)));
        assert_eq!(registry.read().await.get("/greeting/").len(), 1);
    }

    #[test]
    fn fs_event_kinds_map_from_notify() {
        use notify::event::{CreateKind, ModifyKind, RemoveKind};
        assert_eq!(
            map_kind(&notify::EventKind::Create(CreateKind::File)),
            Some(FsEventKind::Add)
        );
        assert_eq!(
            map_kind(&notify::EventKind::Modify(ModifyKind::Any)),
            Some(FsEventKind::Change)
        );
        assert_eq!(
            map_kind(&notify::EventKind::Remove(RemoveKind::File)),
            Some(FsEventKind::Delete)
        );
        assert_eq!(map_kind(&notify::EventKind::Any), None);
    }

    #[test]
    fn json_value_mocks_round_trip_through_interpret() {
        let value = json!({"answer": 42});
        assert!(matches!(
            MockValue::interpret(value),
            MockValue::Literal(_)
        ));
    }
}
