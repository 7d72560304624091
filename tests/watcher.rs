//! Watch orchestration against a real temp directory and a recording sink.

use achievement_companion::achievement_watcher::{AchievementWatcher, WatchPhase, WatcherSettings};
use achievement_companion::achievements::{AchievementSchema, AchievementState};
use achievement_companion::config::{GameConfig, Platform};
use achievement_companion::notifications::{
    build_payload, NotificationPayload, NotificationQueue, NotificationSink, PayloadSettings,
    TransitionKind,
};
use achievement_companion::parsers::registry::{
    RegistryData, RegistryQuery, RegistryValue, SystemRegistry,
};
use achievement_companion::snapshot_store::SnapshotStore;
use achievement_companion::Error;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Default)]
struct RecordingSink {
    shown: Mutex<Vec<NotificationPayload>>,
}

impl RecordingSink {
    fn names(&self) -> Vec<String> {
        self.shown.lock().unwrap().iter().map(|p| p.name.clone()).collect()
    }
}

impl NotificationSink for RecordingSink {
    fn show(&self, payload: &NotificationPayload) -> achievement_companion::Result<()> {
        self.shown.lock().unwrap().push(payload.clone());
        Ok(())
    }
}

struct Harness {
    dir: TempDir,
    sink: Arc<RecordingSink>,
    store: SnapshotStore,
    watcher: AchievementWatcher,
}

fn settings(debounce_ms: u64) -> WatcherSettings {
    WatcherSettings {
        debounce: Duration::from_millis(debounce_ms),
        cooldown: Duration::from_millis(debounce_ms),
        retry_delay: Duration::from_millis(debounce_ms * 2),
        pending_recheck: Duration::ZERO,
        ..WatcherSettings::default()
    }
}

impl Harness {
    fn new(settings: WatcherSettings) -> Self {
        Self::with_registry(settings, Arc::new(SystemRegistry))
    }

    fn with_registry(settings: WatcherSettings, registry: Arc<dyn RegistryQuery>) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let sink = Arc::new(RecordingSink::default());
        let (queue, _task) = NotificationQueue::start(sink.clone(), Duration::ZERO);
        let store = SnapshotStore::new(dir.path().join("cache"));
        let watcher = AchievementWatcher::new(store.clone(), queue, registry, settings);
        Self {
            dir,
            sink,
            store,
            watcher,
        }
    }

    fn game(&self, name: &str, create_save_dir: bool) -> GameConfig {
        let config_path = self.dir.path().join(name).join("config");
        let save_path = self.dir.path().join(name).join("save");
        fs::create_dir_all(&config_path).unwrap();
        if create_save_dir {
            fs::create_dir_all(&save_path).unwrap();
        }
        fs::write(
            config_path.join("achievements.json"),
            r#"[{"name":"A1","displayName":"First"},{"name":"A2","displayName":"Second"}]"#,
        )
        .unwrap();
        GameConfig {
            name: name.into(),
            appid: "480".into(),
            platform: Platform::Steam,
            config_path,
            save_path,
            user: None,
        }
    }
}

/// In-memory registry hive whose values tests can flip.
struct FlipRegistry {
    values: Mutex<Vec<RegistryValue>>,
}

impl FlipRegistry {
    fn new(values: &[(&str, u32)]) -> Self {
        let registry = Self {
            values: Mutex::new(Vec::new()),
        };
        registry.set(values);
        registry
    }

    fn set(&self, values: &[(&str, u32)]) {
        *self.values.lock().unwrap() = values
            .iter()
            .map(|(name, flag)| RegistryValue {
                name: name.to_string(),
                data: RegistryData::Dword(*flag),
            })
            .collect();
    }
}

impl RegistryQuery for FlipRegistry {
    fn query(&self, _key: &str) -> achievement_companion::Result<Vec<RegistryValue>> {
        Ok(self.values.lock().unwrap().clone())
    }
}

fn write_save(save_path: &Path, rows: &str) {
    fs::create_dir_all(save_path).unwrap();
    fs::write(save_path.join("achievements.json"), rows).unwrap();
}

async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}

#[tokio::test(flavor = "multi_thread")]
async fn evaluation_emits_persists_and_settles() {
    let h = Harness::new(settings(10_000));
    let game = h.game("Game", true);
    h.watcher.start_watching_game(game.clone()).await.unwrap();
    assert_eq!(h.watcher.phase("Game").await, WatchPhase::Watching);

    write_save(
        &game.save_path,
        r#"[{"name":"A1","achieved":1,"UnlockTime":1700000000},{"name":"A2","achieved":0}]"#,
    );
    assert_eq!(h.watcher.evaluate_now("Game").await, Some(true));
    assert!(wait_for(|| h.sink.names() == vec!["A1".to_string()]).await);

    let payload = h.sink.shown.lock().unwrap()[0].clone();
    assert_eq!(payload.display_name, "First");
    assert_eq!(payload.kind, TransitionKind::Earned);
    assert_eq!(payload.config_path, game.config_path);

    let cached = h.store.load("Game").unwrap().expect("snapshot persisted");
    assert!(cached["A1"].earned);
    assert!(!cached["A2"].earned);

    assert_eq!(h.watcher.evaluate_now("Game").await, Some(false));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.sink.names().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn first_attach_without_cache_is_silent() {
    let h = Harness::new(settings(10_000));
    let game = h.game("Game", true);
    write_save(&game.save_path, r#"[{"name":"A1","achieved":1,"UnlockTime":1700000000}]"#);

    h.watcher.start_watching_game(game).await.unwrap();
    let snapshot = h.watcher.snapshot("Game").await.unwrap();
    assert!(snapshot["A1"].earned);
    assert!(h.store.load("Game").unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.sink.names().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn unlocks_while_away_are_announced_on_attach() {
    let h = Harness::new(settings(10_000));
    let game = h.game("Game", true);
    let mut cached = achievement_companion::achievements::Snapshot::new();
    cached.insert("A1".into(), AchievementState::earned_at(1_600_000_000));
    h.store.save("Game", &cached).unwrap();

    write_save(
        &game.save_path,
        r#"[{"name":"A1","achieved":1,"UnlockTime":1600000000},{"name":"A2","achieved":1,"UnlockTime":1700000000}]"#,
    );
    h.watcher.start_watching_game(game).await.unwrap();
    assert!(wait_for(|| h.sink.names() == vec!["A2".to_string()]).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn active_config_records_without_notifying() {
    let h = Harness::new(settings(10_000));
    let game = h.game("Game", true);
    h.watcher.start_watching_game(game.clone()).await.unwrap();
    h.watcher.set_active_config(Some("Game".into()));

    write_save(&game.save_path, r#"[{"name":"A1","achieved":1,"UnlockTime":1700000000}]"#);
    assert_eq!(h.watcher.evaluate_now("Game").await, Some(true));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.sink.names().is_empty());
    assert!(h.store.load("Game").unwrap().unwrap()["A1"].earned);
}

#[tokio::test(flavor = "multi_thread")]
async fn file_change_triggers_debounced_evaluation() {
    let h = Harness::new(settings(30));
    let game = h.game("Game", true);
    h.watcher.start_watching_game(game.clone()).await.unwrap();

    write_save(&game.save_path, r#"[{"name":"A1","achieved":0}]"#);
    write_save(&game.save_path, r#"[{"name":"A1","achieved":1,"UnlockTime":1700000000}]"#);

    assert!(wait_for(|| h.sink.names() == vec!["A1".to_string()]).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.sink.names().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn detached_game_stops_evaluating() {
    let h = Harness::new(settings(30));
    let game = h.game("Game", true);
    h.watcher.start_watching_game(game.clone()).await.unwrap();
    h.watcher.stop_watching_game("Game").await;

    assert_eq!(h.watcher.phase("Game").await, WatchPhase::Unattached);
    assert_eq!(h.watcher.evaluate_now("Game").await, None);

    write_save(&game.save_path, r#"[{"name":"A1","achieved":1,"UnlockTime":1700000000}]"#);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(h.sink.names().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_save_dir_waits_in_pending() {
    let h = Harness::new(settings(10_000));
    let game = h.game("Game", false);
    h.watcher.start_watching_game(game.clone()).await.unwrap();
    assert_eq!(h.watcher.pending_games(), vec!["Game".to_string()]);
    assert!(h.watcher.watched_games().is_empty());

    h.watcher.check_pending_games().await;
    assert_eq!(h.watcher.pending_games(), vec!["Game".to_string()]);

    write_save(&game.save_path, r#"[{"name":"A1","achieved":1,"UnlockTime":1700000000}]"#);
    h.watcher.check_pending_games().await;
    assert_eq!(h.watcher.watched_games(), vec!["Game".to_string()]);
    assert!(h.watcher.pending_games().is_empty());
    assert!(h.watcher.snapshot("Game").await.unwrap()["A1"].earned);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_schema_leaves_game_unattached() {
    let h = Harness::new(settings(10_000));
    let game = h.game("Game", true);
    fs::remove_file(game.config_path.join("achievements.json")).unwrap();

    let err = h.watcher.start_watching_game(game).await.unwrap_err();
    assert!(matches!(err, Error::SchemaNotFound(_)));
    assert_eq!(h.watcher.phase("Game").await, WatchPhase::Unattached);
    assert!(h.watcher.pending_games().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn rename_and_remove_carry_the_cache() {
    let h = Harness::new(settings(10_000));
    let game = h.game("Old", true);
    write_save(&game.save_path, r#"[{"name":"A1","achieved":1,"UnlockTime":1700000000}]"#);
    h.watcher.start_watching_game(game.clone()).await.unwrap();
    assert!(h.store.load("Old").unwrap().is_some());

    let renamed = GameConfig {
        name: "New".into(),
        ..game
    };
    h.watcher.rename_game("Old", renamed).await.unwrap();
    assert!(h.store.load("Old").unwrap().is_none());
    assert!(h.store.load("New").unwrap().unwrap()["A1"].earned);
    assert_eq!(h.watcher.watched_games(), vec!["New".to_string()]);

    h.watcher.remove_game("New").await.unwrap();
    assert!(h.store.load("New").unwrap().is_none());
    assert!(h.watcher.watched_games().is_empty());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.sink.names().is_empty());
}

/// Binary key-value writer for Steam `appcache/stats` fixtures.
fn kv_object(out: &mut Vec<u8>, key: &str, body: impl FnOnce(&mut Vec<u8>)) {
    out.push(0x00);
    out.extend_from_slice(key.as_bytes());
    out.push(0);
    body(out);
    out.push(0x08);
}

fn kv_string(out: &mut Vec<u8>, key: &str, value: &str) {
    out.push(0x01);
    for s in [key, value] {
        out.extend_from_slice(s.as_bytes());
        out.push(0);
    }
}

fn kv_int(out: &mut Vec<u8>, key: &str, value: i32) {
    out.push(0x02);
    out.extend_from_slice(key.as_bytes());
    out.push(0);
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_appcache(save_path: &Path, earned: bool) {
    let stats = save_path.join("appcache").join("stats");
    fs::create_dir_all(&stats).unwrap();

    let mut schema = Vec::new();
    kv_object(&mut schema, "480", |o| {
        kv_object(o, "stats", |o| {
            kv_object(o, "1", |o| {
                kv_object(o, "bits", |o| {
                    kv_object(o, "0", |o| {
                        kv_string(o, "name", "ACH_WIN");
                        kv_int(o, "bit", 0);
                        kv_object(o, "display", |o| {
                            kv_object(o, "name", |o| kv_string(o, "english", "Winner"));
                        });
                    });
                });
            });
        });
    });
    schema.push(0x08);
    fs::write(stats.join("UserGameStatsSchema_480.bin"), schema).unwrap();

    let mut user = Vec::new();
    kv_object(&mut user, "cache", |o| {
        kv_object(o, "1", |o| {
            kv_int(o, "data", i32::from(earned));
            kv_object(o, "AchievementTimes", |o| kv_int(o, "0", 1_700_000_000));
        });
    });
    user.push(0x08);
    fs::write(stats.join("UserGameStats_1_480.bin"), user).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn appcache_without_schema_file_uses_derived_names() {
    let h = Harness::new(settings(10_000));
    let game = h.game("Game", true);
    fs::remove_file(game.config_path.join("achievements.json")).unwrap();
    write_appcache(&game.save_path, false);

    h.watcher.start_watching_game(game.clone()).await.unwrap();
    assert_eq!(h.watcher.watched_games(), vec!["Game".to_string()]);

    write_appcache(&game.save_path, true);
    assert_eq!(h.watcher.evaluate_now("Game").await, Some(true));
    assert!(wait_for(|| h.sink.names() == vec!["ACH_WIN".to_string()]).await);
    assert_eq!(h.sink.shown.lock().unwrap()[0].display_name, "Winner");
}

#[tokio::test(start_paused = true)]
async fn registry_poll_announces_a_flipped_value_once() {
    let registry = Arc::new(FlipRegistry::new(&[("A1", 0), ("A2", 0)]));
    let h = Harness::with_registry(
        WatcherSettings {
            registry_poll: Duration::from_secs(1),
            ..settings(100)
        },
        registry.clone(),
    );
    let game = GameConfig {
        platform: Platform::Luma,
        user: Some("player".into()),
        ..h.game("Luma", false)
    };

    h.watcher.start_watching_game(game).await.unwrap();
    assert_eq!(h.watcher.watched_games(), vec!["Luma".to_string()]);
    assert!(!h.watcher.snapshot("Luma").await.unwrap()["A1"].earned);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(h.sink.names().is_empty());

    registry.set(&[("A1", 1), ("A2", 0)]);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(h.sink.names(), vec!["A1".to_string()]);
    assert!(h.store.load("Luma").unwrap().unwrap()["A1"].earned);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.sink.names().len(), 1);
    h.watcher.stop_all().await;
}

#[tokio::test]
async fn queue_shows_payloads_in_order() {
    let sink = Arc::new(RecordingSink::default());
    let (queue, _task) = NotificationQueue::start(sink.clone(), Duration::from_millis(5));
    let schema = AchievementSchema::default();

    for name in ["A1", "A2", "A3"] {
        assert!(queue.enqueue(build_payload(
            "Game",
            Path::new("/cfg"),
            &schema,
            name,
            &AchievementState::earned_at(1),
            TransitionKind::Earned,
            &PayloadSettings::default(),
        )));
    }

    assert!(wait_for(|| sink.names().len() == 3).await);
    assert_eq!(sink.names(), vec!["A1", "A2", "A3"]);
}
