use notify_rust::Notification;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::achievements::{AchievementSchema, AchievementState, LocalizedText};
use crate::config::AppConfig;
use crate::error::{Error, Result};

const HIDDEN_PLACEHOLDER: &str = "Hidden";

const DEFAULT_ICON: &[u8] = include_bytes!("../assets/trophy.png");
static DEFAULT_ICON_PATH: OnceLock<Option<PathBuf>> = OnceLock::new();

/// Subfolders of the schema directory searched for achievement icons, in order.
const ICON_DIRS: &[&str] = &[
    "achievement_images",
    "steam_settings/achievement_images",
    "img",
    "images",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    Earned,
    Progress,
}

/// What the presentation layer needs to render one popup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationPayload {
    pub game: String,
    pub name: String,
    pub kind: TransitionKind,
    #[serde(rename = "displayName")]
    pub display_name: String,
    pub description: String,
    pub icon: Option<PathBuf>,
    pub icon_gray: Option<PathBuf>,
    pub config_path: PathBuf,
    pub preset: String,
    pub position: String,
    pub sound: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_progress: Option<f64>,
}

/// The slice of `AppConfig` payload assembly depends on.
#[derive(Debug, Clone)]
pub struct PayloadSettings {
    pub language: String,
    pub preset: String,
    pub position: String,
    pub sound: Option<String>,
    pub fallback_icon: Option<PathBuf>,
}

impl From<&AppConfig> for PayloadSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            language: config.language.clone(),
            preset: config.preset.clone(),
            position: config.position.clone(),
            sound: config.sound.clone(),
            fallback_icon: config.fallback_icon.clone(),
        }
    }
}

impl Default for PayloadSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

fn localized(text: Option<&LocalizedText>, language: &str) -> String {
    text.and_then(|t| t.resolve(language))
        .unwrap_or(HIDDEN_PLACEHOLDER)
        .to_string()
}

/// First existing file among the conventional icon locations under `schema_dir`.
pub fn resolve_icon(schema_dir: &Path, icon: &str) -> Option<PathBuf> {
    let icon = icon.trim();
    if icon.is_empty() {
        return None;
    }
    let direct = Path::new(icon);
    if direct.is_absolute() {
        return direct.is_file().then(|| direct.to_path_buf());
    }

    ICON_DIRS
        .iter()
        .map(|dir| schema_dir.join(dir).join(icon))
        .chain(std::iter::once(schema_dir.join(icon)))
        .find(|candidate| candidate.is_file())
}

/// The bundled trophy image, unpacked on first use for games that ship no icons.
pub fn default_icon() -> Option<PathBuf> {
    DEFAULT_ICON_PATH
        .get_or_init(|| {
            let dirs = dirs::cache_dir().into_iter().chain(std::iter::once(std::env::temp_dir()));
            for dir in dirs.map(|d| d.join("achievement-companion")) {
                let path = dir.join("trophy.png");
                match fs::create_dir_all(&dir).and_then(|_| fs::write(&path, DEFAULT_ICON)) {
                    Ok(()) => return Some(path),
                    Err(e) => tracing::debug!(path = %path.display(), "cannot unpack default icon: {}", e),
                }
            }
            tracing::warn!("no writable folder for the default notification icon");
            None
        })
        .clone()
}

pub fn build_payload(
    game: &str,
    config_path: &Path,
    schema: &AchievementSchema,
    name: &str,
    state: &AchievementState,
    kind: TransitionKind,
    settings: &PayloadSettings,
) -> NotificationPayload {
    let entry = schema.get(name);
    let icon_for = |icon: Option<&String>| {
        icon.and_then(|i| resolve_icon(&schema.dir, i))
            .or_else(|| settings.fallback_icon.clone())
            .or_else(default_icon)
    };

    let (progress, max_progress) = match kind {
        TransitionKind::Progress => (state.progress, state.max_progress),
        TransitionKind::Earned => (None, None),
    };

    NotificationPayload {
        game: game.to_string(),
        name: name.to_string(),
        kind,
        display_name: localized(entry.map(|e| &e.display_name), &settings.language),
        description: localized(entry.map(|e| &e.description), &settings.language),
        icon: icon_for(entry.and_then(|e| e.icon.as_ref())),
        icon_gray: icon_for(entry.and_then(|e| e.icon_gray.as_ref())),
        config_path: config_path.to_path_buf(),
        preset: settings.preset.clone(),
        position: settings.position.clone(),
        sound: settings.sound.clone(),
        progress,
        max_progress,
    }
}

/// Renders a payload. Called from a blocking thread.
pub trait NotificationSink: Send + Sync {
    fn show(&self, payload: &NotificationPayload) -> Result<()>;
}

/// Native desktop notification through the OS notification service.
pub struct DesktopSink {
    timeout: Duration,
}

impl DesktopSink {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl NotificationSink for DesktopSink {
    fn show(&self, payload: &NotificationPayload) -> Result<()> {
        let body = match (payload.kind, payload.progress, payload.max_progress) {
            (TransitionKind::Progress, Some(p), Some(max)) => {
                format!("{} ({}/{})\n{}", payload.display_name, p, max, payload.description)
            }
            _ => format!("🏆 {}\n{}", payload.display_name, payload.description),
        };

        let mut notification = Notification::new();
        notification
            .summary(&payload.game)
            .body(&body)
            .timeout(i32::try_from(self.timeout.as_millis()).unwrap_or(i32::MAX));
        if let Some(icon) = payload.icon.as_ref().and_then(|p| p.to_str()) {
            notification.icon(icon);
        }

        notification
            .show()
            .map(|_| ())
            .map_err(|e| Error::Other(format!("desktop notification failed: {}", e)))
    }
}

/// Writes payloads to the log instead of the screen.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn show(&self, payload: &NotificationPayload) -> Result<()> {
        tracing::info!(
            game = %payload.game,
            achievement = %payload.name,
            kind = ?payload.kind,
            "🏆 {}: {}",
            payload.display_name,
            payload.description
        );
        Ok(())
    }
}

/// FIFO of payloads, shown one at a time by a single consumer task.
#[derive(Clone)]
pub struct NotificationQueue {
    tx: mpsc::UnboundedSender<NotificationPayload>,
}

impl NotificationQueue {
    /// Spawn the consumer. Each payload holds the screen for `display` before the next one.
    pub fn start(sink: Arc<dyn NotificationSink>, display: Duration) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<NotificationPayload>();

        let handle = tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                let sink = sink.clone();
                let name = payload.name.clone();
                match tokio::task::spawn_blocking(move || sink.show(&payload)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(achievement = %name, "notification failed: {}", e),
                    Err(e) => tracing::warn!(achievement = %name, "notification task panicked: {}", e),
                }
                tokio::time::sleep(display).await;
            }
            tracing::debug!("notification queue closed");
        });

        (Self { tx }, handle)
    }

    /// Returns false once the consumer has stopped.
    pub fn enqueue(&self, payload: NotificationPayload) -> bool {
        self.tx.send(payload).is_ok()
    }
}
