use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct Settings {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub preferred_input: Option<String>,
    #[serde(default)]
    pub preferred_output: Option<String>,
}

/// JSON-file-backed store for user preferences.
///
/// Persisting the device selection is optional for correctness; sessions
/// never depend on it.
pub struct SettingsStore {
    settings: Mutex<Settings>,
    file_path: PathBuf,
}

impl SettingsStore {
    pub fn new(data_dir: &str) -> Self {
        let file_path = PathBuf::from(data_dir).join("settings.json");
        let settings = Self::load(&file_path);
        Self {
            settings: Mutex::new(settings),
            file_path,
        }
    }

    pub fn get(&self) -> Settings {
        self.settings.lock().unwrap().clone()
    }

    pub fn set_display_name(&self, name: Option<String>) {
        self.settings.lock().unwrap().display_name = name;
        self.save();
    }

    pub fn set_preferred_input(&self, device_id: Option<String>) {
        self.settings.lock().unwrap().preferred_input = device_id;
        self.save();
    }

    pub fn set_preferred_output(&self, device_id: Option<String>) {
        self.settings.lock().unwrap().preferred_output = device_id;
        self.save();
    }

    fn save(&self) {
        let settings = self.settings.lock().unwrap().clone();
        if let Some(parent) = self.file_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(json) = serde_json::to_string_pretty(&settings) {
            let _ = std::fs::write(&self.file_path, json);
        }
    }

    fn load(path: &PathBuf) -> Settings {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => Settings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn new_creates_defaults_when_no_file() {
        let dir = temp_dir();
        let store = SettingsStore::new(dir.path().to_str().unwrap());
        assert_eq!(store.get(), Settings::default());
    }

    #[test]
    fn set_display_name_persists() {
        let dir = temp_dir();
        let path = dir.path().to_str().unwrap();
        {
            let store = SettingsStore::new(path);
            store.set_display_name(Some("Alice".to_string()));
        }
        let store = SettingsStore::new(path);
        assert_eq!(store.get().display_name, Some("Alice".to_string()));
    }

    #[test]
    fn preferred_devices_persist() {
        let dir = temp_dir();
        let path = dir.path().to_str().unwrap();
        {
            let store = SettingsStore::new(path);
            store.set_preferred_input(Some("mic-1".to_string()));
            store.set_preferred_output(Some("spk-2".to_string()));
        }
        let store = SettingsStore::new(path);
        let s = store.get();
        assert_eq!(s.preferred_input, Some("mic-1".to_string()));
        assert_eq!(s.preferred_output, Some("spk-2".to_string()));
    }

    #[test]
    fn clear_preferred_input() {
        let dir = temp_dir();
        let path = dir.path().to_str().unwrap();
        let store = SettingsStore::new(path);
        store.set_preferred_input(Some("mic-1".to_string()));
        store.set_preferred_input(None);
        assert_eq!(store.get().preferred_input, None);
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let dir = temp_dir();
        let path = dir.path().to_str().unwrap();
        fs::write(dir.path().join("settings.json"), "not json!!!").unwrap();
        let store = SettingsStore::new(path);
        assert_eq!(store.get(), Settings::default());
    }

    #[test]
    fn partial_json_uses_serde_defaults() {
        let dir = temp_dir();
        let path = dir.path().to_str().unwrap();
        fs::write(
            dir.path().join("settings.json"),
            r#"{"preferred_input":"mic-1"}"#,
        )
        .unwrap();
        let store = SettingsStore::new(path);
        let s = store.get();
        assert_eq!(s.preferred_input, Some("mic-1".to_string()));
        assert_eq!(s.display_name, None);
    }
}
