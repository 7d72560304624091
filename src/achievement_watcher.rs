use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::achievements::{AchievementSchema, Snapshot};
use crate::config::{AppConfig, GameConfig, Platform};
use crate::debounce::DebounceTimer;
use crate::diff::diff;
use crate::error::{Error, Result};
use crate::notifications::{build_payload, NotificationQueue, PayloadSettings, TransitionKind};
use crate::parsers::registry::{self, RegistryQuery};
use crate::parsers::{parse_source, ParseContext};
use crate::snapshot_store::SnapshotStore;
use crate::sources::{SaveSource, WatchTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchPhase {
    Unattached,
    Watching,
    Evaluating,
}

/// Timing and presentation knobs, taken from `AppConfig`.
#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub debounce: Duration,
    pub cooldown: Duration,
    pub retry_delay: Duration,
    pub pending_recheck: Duration,
    pub registry_poll: Duration,
    pub payload: PayloadSettings,
}

impl From<&AppConfig> for WatcherSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            debounce: Duration::from_millis(config.debounce_ms),
            cooldown: Duration::from_millis(config.cooldown_ms),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            pending_recheck: Duration::from_secs(config.pending_recheck_secs),
            registry_poll: Duration::from_secs(config.registry_poll_secs.max(1)),
            payload: PayloadSettings::from(config),
        }
    }
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

/// Everything one game's evaluations own. Only the game's own runtime mutates it.
#[derive(Debug)]
pub struct WatchState {
    pub config: GameConfig,
    pub schema: AchievementSchema,
    pub snapshot: Snapshot,
    pub phase: WatchPhase,
    pub source: Option<SaveSource>,
    ctx: ParseContext,
}

struct Shared {
    store: SnapshotStore,
    queue: NotificationQueue,
    registry: Arc<dyn RegistryQuery>,
    settings: WatcherSettings,
    active_config: Mutex<Option<String>>,
}

/// Cloneable handle used by the game task and by direct calls.
#[derive(Clone)]
struct GameRuntime {
    state: Arc<tokio::sync::Mutex<WatchState>>,
    detached: Arc<AtomicBool>,
    target: Arc<WatchTarget>,
    shared: Arc<Shared>,
}

struct GameWatch {
    runtime: GameRuntime,
    task: JoinHandle<()>,
    _watcher: Option<RecommendedWatcher>,
}

pub struct AchievementWatcher {
    games: Arc<Mutex<HashMap<String, GameWatch>>>,
    pending_games: Arc<Mutex<HashMap<String, (GameConfig, Instant)>>>,
    shared: Arc<Shared>,
}

impl AchievementWatcher {
    pub fn new(
        store: SnapshotStore,
        queue: NotificationQueue,
        registry: Arc<dyn RegistryQuery>,
        settings: WatcherSettings,
    ) -> Self {
        Self {
            games: Arc::new(Mutex::new(HashMap::new())),
            pending_games: Arc::new(Mutex::new(HashMap::new())),
            shared: Arc::new(Shared {
                store,
                queue,
                registry,
                settings,
                active_config: Mutex::new(None),
            }),
        }
    }

    /// Attach a game. Games whose save data does not exist yet are parked in the
    /// pending list; a missing schema is an error and leaves the game unattached.
    pub async fn start_watching_game(&self, config: GameConfig) -> Result<()> {
        self.stop_watching_game(&config.name).await;
        tracing::info!(game = %config.name, platform = %config.platform, "looking for achievement source");

        let target = WatchTarget::build(&config);

        let schema = match AchievementSchema::load(&config) {
            Ok(schema) => schema,
            Err(Error::SchemaNotFound(path)) => match target.resolve() {
                Some(source) if source.can_derive_schema() => {
                    let schema = source.derive_schema()?;
                    tracing::info!(game = %config.name, count = schema.entries.len(), "derived schema from {} data", source.format_name());
                    schema
                }
                None if config.platform.is_console() => {
                    tracing::debug!(game = %config.name, path = %path.display(), "no schema and no console data yet");
                    self.park(config);
                    return Ok(());
                }
                _ => {
                    tracing::error!(game = %config.name, path = %path.display(), "cannot watch game: no achievement schema");
                    return Err(Error::SchemaNotFound(path));
                }
            },
            Err(e) => {
                tracing::error!(game = %config.name, "cannot watch game: {}", e);
                return Err(e);
            }
        };

        if target.config.platform != Platform::Luma && target.watch_root().is_none() {
            self.park(config);
            return Ok(());
        }

        self.attach(target, schema).await
    }

    fn park(&self, config: GameConfig) {
        tracing::info!(
            game = %config.name,
            "save data not found, will check again every {}s",
            self.shared.settings.pending_recheck.as_secs()
        );
        lock(&self.pending_games).insert(config.name.clone(), (config, Instant::now()));
    }

    async fn attach(&self, target: WatchTarget, schema: AchievementSchema) -> Result<()> {
        let config = target.config.clone();
        let name = config.name.clone();

        let (snapshot, silent) = match self.shared.store.load(&name) {
            Ok(Some(snapshot)) => (snapshot, false),
            Ok(None) => (Snapshot::new(), true),
            Err(e) => {
                tracing::warn!(game = %name, "snapshot cache unreadable, starting fresh: {}", e);
                (Snapshot::new(), true)
            }
        };

        let runtime = GameRuntime {
            state: Arc::new(tokio::sync::Mutex::new(WatchState {
                ctx: ParseContext::new(name.clone(), &schema),
                config: config.clone(),
                schema,
                snapshot,
                phase: WatchPhase::Watching,
                source: None,
            })),
            detached: Arc::new(AtomicBool::new(false)),
            target: Arc::new(target),
            shared: self.shared.clone(),
        };

        let (tx, rx) = mpsc::unbounded_channel::<PathBuf>();
        let watcher = match runtime.target.watch_root() {
            Some(root) => Some(setup_file_watcher(&root, tx)?),
            None => None,
        };

        // Baseline pass: silent when there was no cache, so existing unlocks
        // are recorded rather than announced.
        runtime.evaluate(silent).await;

        let poll = (config.platform == Platform::Luma).then_some(self.shared.settings.registry_poll);

        let task = tokio::spawn(run_game_loop(runtime.clone(), rx, watcher.is_some(), poll));

        lock(&self.pending_games).remove(&name);
        lock(&self.games).insert(
            name.clone(),
            GameWatch {
                runtime,
                task,
                _watcher: watcher,
            },
        );
        tracing::info!(game = %name, "watching achievements");
        Ok(())
    }

    /// Detach a game. Once this returns no evaluation of it can commit anymore.
    pub async fn stop_watching_game(&self, name: &str) {
        lock(&self.pending_games).remove(name);

        let Some(watch) = lock(&self.games).remove(name) else {
            return;
        };
        watch.runtime.detached.store(true, Ordering::SeqCst);
        watch.task.abort();
        drop(watch._watcher);

        // wait out an in-flight evaluation holding the state
        let mut state = watch.runtime.state.lock().await;
        state.phase = WatchPhase::Unattached;
        tracing::info!(game = %name, "stopped watching achievements");
    }

    /// Follow a config rename: the cache file moves with it.
    pub async fn rename_game(&self, old_name: &str, config: GameConfig) -> Result<()> {
        self.stop_watching_game(old_name).await;
        self.shared.store.rename(old_name, &config.name)?;
        self.start_watching_game(config).await
    }

    /// Forget a game and its cached snapshot.
    pub async fn remove_game(&self, name: &str) -> Result<()> {
        self.stop_watching_game(name).await;
        self.shared.store.remove(name)
    }

    /// The config currently open in the foreground UI; its unlocks are recorded but not announced.
    pub fn set_active_config(&self, name: Option<String>) {
        *lock(&self.shared.active_config) = name;
    }

    /// Retry games parked without save data once their recheck interval has elapsed.
    pub async fn check_pending_games(&self) {
        let now = Instant::now();
        let interval = self.shared.settings.pending_recheck;

        let to_check: Vec<GameConfig> = lock(&self.pending_games)
            .values()
            .filter(|(_, last_check)| now.duration_since(*last_check) >= interval)
            .map(|(config, _)| config.clone())
            .collect();

        for config in to_check {
            tracing::debug!(game = %config.name, "rechecking for save data");
            let name = config.name.clone();
            if let Err(e) = self.start_watching_game(config).await {
                tracing::warn!(game = %name, "recheck failed: {}", e);
            }
        }
    }

    /// Run an evaluation right away. Returns whether the snapshot changed, `None` if not attached.
    pub async fn evaluate_now(&self, name: &str) -> Option<bool> {
        let runtime = lock(&self.games).get(name).map(|w| w.runtime.clone())?;
        Some(runtime.evaluate(false).await)
    }

    pub async fn snapshot(&self, name: &str) -> Option<Snapshot> {
        let runtime = lock(&self.games).get(name).map(|w| w.runtime.clone())?;
        let state = runtime.state.lock().await;
        Some(state.snapshot.clone())
    }

    pub async fn phase(&self, name: &str) -> WatchPhase {
        let runtime = lock(&self.games).get(name).map(|w| w.runtime.clone());
        match runtime {
            Some(runtime) => runtime.state.lock().await.phase,
            None => WatchPhase::Unattached,
        }
    }

    pub fn watched_games(&self) -> Vec<String> {
        lock(&self.games).keys().cloned().collect()
    }

    pub fn pending_games(&self) -> Vec<String> {
        lock(&self.pending_games).keys().cloned().collect()
    }

    pub async fn stop_all(&self) {
        let names: Vec<String> = lock(&self.games).keys().cloned().collect();
        for name in names {
            self.stop_watching_game(&name).await;
        }
        lock(&self.pending_games).clear();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Subscribe to `root` and forward create/modify paths into the game's channel.
fn setup_file_watcher(root: &std::path::Path, tx: mpsc::UnboundedSender<PathBuf>) -> Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res: std::result::Result<Event, notify::Error>| match res {
            Ok(event) => {
                if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    for path in event.paths {
                        let _ = tx.send(path);
                    }
                }
            }
            Err(e) => tracing::warn!("watch error: {}", e),
        },
        Config::default(),
    )?;

    watcher.watch(root, RecursiveMode::Recursive)?;
    tracing::debug!(root = %root.display(), "filesystem watch registered");
    Ok(watcher)
}

async fn run_game_loop(
    runtime: GameRuntime,
    mut events: mpsc::UnboundedReceiver<PathBuf>,
    mut events_open: bool,
    poll: Option<Duration>,
) {
    let settings = &runtime.shared.settings;
    let mut timer = DebounceTimer::new(settings.debounce, settings.cooldown, settings.retry_delay);
    let mut poll_interval = tokio::time::interval(poll.unwrap_or(Duration::from_secs(3600)));
    poll_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately and the baseline already ran
    poll_interval.reset();

    loop {
        let deadline = timer.deadline();

        tokio::select! {
            event = events.recv(), if events_open => {
                events_open = note_event(&runtime, &mut timer, event);
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if timer.poll(Instant::now()) {
                    // keep draining events so writes landing mid-evaluation mark the timer dirty
                    let evaluation = runtime.evaluate(false);
                    tokio::pin!(evaluation);
                    let changed = loop {
                        tokio::select! {
                            changed = &mut evaluation => break changed,
                            event = events.recv(), if events_open => {
                                events_open = note_event(&runtime, &mut timer, event);
                            }
                        }
                    };
                    timer.finish(Instant::now(), changed);
                }
            }
            _ = poll_interval.tick(), if poll.is_some() => {
                timer.on_poll(Instant::now());
            }
            else => break,
        }

        if runtime.detached.load(Ordering::SeqCst) {
            timer.cancel();
            break;
        }
    }
}

/// Feed one channel message to the timer. Returns `false` once the channel has closed.
fn note_event(runtime: &GameRuntime, timer: &mut DebounceTimer, event: Option<PathBuf>) -> bool {
    let Some(path) = event else {
        return false;
    };
    if runtime.target.is_relevant(&path) {
        tracing::trace!(path = %path.display(), "save data event");
        timer.on_event(Instant::now());
    }
    true
}

impl GameRuntime {
    /// Parse, diff, persist and emit. Returns whether the snapshot changed.
    async fn evaluate(&self, silent: bool) -> bool {
        let mut state = self.state.lock().await;
        if self.detached.load(Ordering::SeqCst) {
            return false;
        }
        state.phase = WatchPhase::Evaluating;

        let source = self.target.resolve();
        if source != state.source {
            match &source {
                Some(s) => tracing::info!(game = %state.config.name, format = s.format_name(), "using save source {:?}", s),
                None => tracing::debug!(game = %state.config.name, "no save source present"),
            }
            state.source = source.clone();
        }

        let Some(source) = source else {
            state.phase = WatchPhase::Watching;
            return false;
        };

        let previous = state.snapshot.clone();
        let current = match &source {
            SaveSource::Registry { key } => {
                match registry::read(self.shared.registry.clone(), key.clone()).await {
                    Ok(entries) => state.ctx.assemble(entries, &previous),
                    Err(e) => {
                        tracing::debug!(game = %state.config.name, "registry read failed: {}", e);
                        previous.clone()
                    }
                }
            }
            _ => {
                let source = source.clone();
                let ctx = state.ctx.clone();
                let fallback = previous.clone();
                tokio::task::spawn_blocking(move || parse_source(&source, &fallback, &ctx))
                    .await
                    .unwrap_or_else(|e| {
                        tracing::warn!("parse task failed: {}", e);
                        previous.clone()
                    })
            }
        };

        if self.detached.load(Ordering::SeqCst) {
            return false;
        }
        state.phase = WatchPhase::Watching;

        if current == previous {
            return false;
        }

        let transitions = diff(&previous, &current);
        state.snapshot = current;
        if let Err(e) = self.shared.store.save(&state.config.name, &state.snapshot) {
            tracing::error!(game = %state.config.name, "failed to persist snapshot: {}", e);
        }

        if transitions.is_empty() {
            return true;
        }

        let active = lock(&self.shared.active_config).as_deref() == Some(state.config.name.as_str());
        if silent || active {
            tracing::info!(
                game = %state.config.name,
                count = transitions.len(),
                silent,
                active,
                "recorded transitions without notifying"
            );
            return true;
        }

        let earned: HashSet<&str> = transitions.earned.iter().map(String::as_str).collect();
        let progressed: HashSet<&str> = transitions.progress.iter().map(String::as_str).collect();

        for (name, achievement) in &state.snapshot {
            let kind = if earned.contains(name.as_str()) {
                TransitionKind::Earned
            } else if progressed.contains(name.as_str()) {
                TransitionKind::Progress
            } else {
                continue;
            };

            tracing::info!(game = %state.config.name, achievement = %name, ?kind, "achievement transition");
            let payload = build_payload(
                &state.config.name,
                &state.config.config_path,
                &state.schema,
                name,
                achievement,
                kind,
                &self.shared.settings.payload,
            );
            if !self.shared.queue.enqueue(payload) {
                tracing::warn!("notification queue is closed");
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::{NotificationPayload, NotificationSink};
    use std::fs;
    use std::path::Path;

    #[derive(Default)]
    struct Recorder {
        names: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn names(&self) -> Vec<String> {
            lock(&self.names).clone()
        }
    }

    impl NotificationSink for Recorder {
        fn show(&self, payload: &NotificationPayload) -> Result<()> {
            lock(&self.names).push(payload.name.clone());
            Ok(())
        }
    }

    fn write_save(save_path: &Path, earned: [bool; 2]) {
        fs::write(
            save_path.join("achievements.json"),
            format!(
                r#"[{{"name":"A1","achieved":{},"UnlockTime":1700000000}},{{"name":"A2","achieved":{}}}]"#,
                u8::from(earned[0]),
                u8::from(earned[1])
            ),
        )
        .unwrap();
    }

    /// A Steam game with a locked save, already through its silent baseline.
    async fn runtime(dir: &Path, settings: WatcherSettings) -> (GameRuntime, Arc<Recorder>) {
        let config_path = dir.join("config");
        let save_path = dir.join("save");
        fs::create_dir_all(&config_path).unwrap();
        fs::create_dir_all(&save_path).unwrap();
        fs::write(
            config_path.join("achievements.json"),
            r#"[{"name":"A1","displayName":"First"},{"name":"A2","displayName":"Second"}]"#,
        )
        .unwrap();
        write_save(&save_path, [false, false]);

        let config = GameConfig {
            name: "Game".into(),
            appid: "480".into(),
            platform: Platform::Steam,
            config_path,
            save_path,
            user: None,
        };
        let schema = AchievementSchema::load(&config).unwrap();
        let recorder = Arc::new(Recorder::default());
        let (queue, _task) = NotificationQueue::start(recorder.clone(), Duration::ZERO);

        let runtime = GameRuntime {
            state: Arc::new(tokio::sync::Mutex::new(WatchState {
                ctx: ParseContext::new("Game", &schema),
                config: config.clone(),
                schema,
                snapshot: Snapshot::new(),
                phase: WatchPhase::Watching,
                source: None,
            })),
            detached: Arc::new(AtomicBool::new(false)),
            target: Arc::new(WatchTarget::build(&config)),
            shared: Arc::new(Shared {
                store: SnapshotStore::new(dir.join("cache")),
                queue,
                registry: Arc::new(registry::SystemRegistry),
                settings,
                active_config: Mutex::new(None),
            }),
        };
        assert!(runtime.evaluate(true).await);
        (runtime, recorder)
    }

    fn timings(retry_delay: Duration) -> WatcherSettings {
        WatcherSettings {
            debounce: Duration::from_millis(100),
            cooldown: Duration::from_millis(100),
            retry_delay,
            ..WatcherSettings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_evaluation_is_retried_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, recorder) = runtime(dir.path(), timings(Duration::from_secs(1))).await;
        let save = dir.path().join("save");

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_game_loop(runtime.clone(), rx, true, None));

        // the event's own run sees nothing new; the write lands before the retry
        tx.send(save.join("achievements.json")).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(recorder.names().is_empty());
        write_save(&save, [true, false]);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(recorder.names(), vec!["A1".to_string()]);

        // an unchanged run and its unchanged retry leave the timer idle
        tx.send(save.join("achievements.json")).unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        write_save(&save, [true, true]);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!runtime.state.lock().await.snapshot["A2"].earned);
        assert_eq!(recorder.names().len(), 1);

        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn event_during_evaluation_reruns_after_debounce() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, recorder) = runtime(dir.path(), timings(Duration::from_secs(10))).await;
        let save = dir.path().join("save");

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_game_loop(runtime.clone(), rx, true, None));

        // hold the state so the debounced evaluation stalls mid-flight
        let guard = runtime.state.lock().await;
        tx.send(save.join("achievements.json")).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        tx.send(save.join("achievements.json")).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(guard);

        // the stalled evaluation runs first and finds nothing new
        let after_first = runtime.state.lock().await;
        assert!(!after_first.snapshot["A1"].earned);
        write_save(&save, [true, false]);
        drop(after_first);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(recorder.names(), vec!["A1".to_string()]);

        task.abort();
    }

    #[test]
    fn settings_follow_app_config() {
        let config = AppConfig {
            debounce_ms: 100,
            cooldown_ms: 250,
            retry_delay_ms: 300,
            registry_poll_secs: 0,
            ..AppConfig::default()
        };
        let settings = WatcherSettings::from(&config);
        assert_eq!(settings.debounce, Duration::from_millis(100));
        assert_eq!(settings.cooldown, Duration::from_millis(250));
        assert_eq!(settings.retry_delay, Duration::from_millis(300));
        assert_eq!(settings.registry_poll, Duration::from_secs(1));
        assert_eq!(settings.pending_recheck, Duration::from_secs(600));
    }
}
