//! Achievement save-data ingestion and unlock detection.
//!
//! Save files written by emulators and alternative clients are parsed into a
//! canonical [`achievements::Snapshot`], diffed against the previous one, and
//! every newly earned or progressed achievement is queued as a notification.

pub mod achievement_watcher;
pub mod achievements;
pub mod canonical;
pub mod config;
pub mod debounce;
pub mod diff;
pub mod error;
pub mod notifications;
pub mod parsers;
pub mod snapshot_store;
pub mod sources;

pub use achievement_watcher::{AchievementWatcher, WatchPhase, WatcherSettings};
pub use error::{Error, Result};
