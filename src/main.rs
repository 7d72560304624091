use std::path::PathBuf;
use std::sync::Arc;

use achievement_companion::achievement_watcher::{AchievementWatcher, WatcherSettings};
use achievement_companion::config::ConfigManager;
use achievement_companion::notifications::{
    DesktopSink, LogSink, NotificationQueue, NotificationSink,
};
use achievement_companion::parsers::registry::SystemRegistry;
use achievement_companion::snapshot_store::SnapshotStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "achievement_companion=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_manager = match std::env::args().nth(1) {
        Some(path) => ConfigManager::with_path(PathBuf::from(path)),
        None => ConfigManager::new(),
    };
    let config = config_manager.get_all();
    config.validate()?;
    tracing::info!(path = %config_manager.config_path().display(), games = config.games.len(), "loaded config");

    let sink: Arc<dyn NotificationSink> = if config.notifications_enabled {
        Arc::new(DesktopSink::new(config.notification_duration()))
    } else {
        Arc::new(LogSink)
    };
    let (queue, queue_task) = NotificationQueue::start(sink, config.notification_duration());

    let cache_dir = config.resolved_cache_dir();
    tracing::info!(path = %cache_dir.display(), "snapshot cache");

    let settings = WatcherSettings::from(&config);
    let recheck = settings.pending_recheck;
    let watcher = AchievementWatcher::new(
        SnapshotStore::new(cache_dir),
        queue,
        Arc::new(SystemRegistry),
        settings,
    );

    for game in config.games.iter().cloned() {
        let name = game.name.clone();
        if let Err(e) = watcher.start_watching_game(game).await {
            tracing::error!(game = %name, "failed to start watching: {}", e);
        }
    }

    let mut pending_interval = tokio::time::interval(recheck.max(std::time::Duration::from_secs(1)));
    pending_interval.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
            _ = pending_interval.tick() => {
                watcher.check_pending_games().await;
            }
        }
    }

    watcher.stop_all().await;
    drop(watcher);
    queue_task.abort();
    Ok(())
}
