use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::devices::VideoPreset;

const SETTINGS_FILE: &str = "settings.json";

/// Per-user preferences, persisted between sessions.
///
/// Missing keys take their default, so files written by older builds
/// still load.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub display_name: Option<String>,
    pub mic_enabled_on_join: bool,
    pub camera_enabled_on_join: bool,
    /// Overrides the deployment preset when set.
    pub video_preset: Option<VideoPreset>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            display_name: None,
            mic_enabled_on_join: true,
            camera_enabled_on_join: true,
            video_preset: None,
        }
    }
}

/// JSON-file backed [`Settings`]. Write failures are logged and the
/// in-memory value is kept.
pub struct SettingsStore {
    current: Mutex<Settings>,
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let path = data_dir.as_ref().join(SETTINGS_FILE);
        let current = Mutex::new(read_settings(&path));
        Self { current, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> Settings {
        self.guard().clone()
    }

    /// Apply `change` and persist the result.
    pub fn update(&self, change: impl FnOnce(&mut Settings)) -> Settings {
        let next = {
            let mut current = self.guard();
            change(&mut current);
            current.clone()
        };
        write_settings(&self.path, &next);
        next
    }

    pub fn set_display_name(&self, name: Option<String>) {
        self.update(|s| s.display_name = name);
    }

    pub fn set_video_preset(&self, preset: Option<VideoPreset>) {
        self.update(|s| s.video_preset = preset);
    }

    fn guard(&self) -> MutexGuard<'_, Settings> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn read_settings(path: &Path) -> Settings {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return Settings::default();
    };
    serde_json::from_str(&raw).unwrap_or_else(|e| {
        tracing::warn!("ignoring unreadable settings at {}: {e}", path.display());
        Settings::default()
    })
}

fn write_settings(path: &Path, settings: &Settings) {
    let json = match serde_json::to_string_pretty(settings) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!("cannot serialize settings: {e}");
            return;
        }
    };
    let result = match path.parent() {
        Some(dir) => std::fs::create_dir_all(dir).and_then(|_| std::fs::write(path, json)),
        None => std::fs::write(path, json),
    };
    if let Err(e) = result {
        tracing::warn!("cannot save settings to {}: {e}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path());
        assert_eq!(store.get(), Settings::default());
        assert!(!store.path().exists());
    }

    #[test]
    fn updates_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SettingsStore::new(dir.path());
            store.set_display_name(Some("Prof. Ada".to_string()));
            store.update(|s| s.camera_enabled_on_join = false);
            store.set_video_preset(Some(VideoPreset::P1080));
        }
        let reopened = SettingsStore::new(dir.path()).get();
        assert_eq!(reopened.display_name.as_deref(), Some("Prof. Ada"));
        assert!(!reopened.camera_enabled_on_join);
        assert!(reopened.mic_enabled_on_join);
        assert_eq!(reopened.video_preset, Some(VideoPreset::P1080));
    }

    #[test]
    fn unreadable_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SETTINGS_FILE), "{{ nope").unwrap();
        assert_eq!(SettingsStore::new(dir.path()).get(), Settings::default());
    }

    #[test]
    fn absent_keys_take_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(SETTINGS_FILE),
            r#"{"mic_enabled_on_join":false}"#,
        )
        .unwrap();
        let loaded = SettingsStore::new(dir.path()).get();
        assert!(!loaded.mic_enabled_on_join);
        assert!(loaded.camera_enabled_on_join);
        assert_eq!(loaded.video_preset, None);
    }

    #[test]
    fn save_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let store = SettingsStore::new(&nested);
        store.update(|s| s.mic_enabled_on_join = false);
        assert!(nested.join(SETTINGS_FILE).exists());
    }
}
