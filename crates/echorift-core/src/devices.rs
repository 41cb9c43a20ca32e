use std::sync::{Arc, Mutex};

use crate::errors::RiftError;
use crate::settings::SettingsStore;
use crate::snapshot::{AudioDevice, DeviceKind, DeviceSelection};

/// Platform seam for audio device enumeration.
///
/// Backed by the media SDK's device APIs on real targets. Labels may come
/// back as empty strings when microphone permission has not been granted
/// yet; that is not an error.
pub trait DeviceSource: Send + Sync {
    fn enumerate(&self) -> Result<Vec<AudioDevice>, RiftError>;
}

/// Maintains the current audio input/output device lists and the user's
/// selection.
///
/// Refreshed on construction and on hardware-change notifications. The
/// selection has its own lifecycle: it survives reconnects, and with a
/// settings store attached it survives restarts too.
pub struct DeviceInventory {
    source: Arc<dyn DeviceSource>,
    state: Mutex<DeviceSelection>,
    settings: Option<Arc<SettingsStore>>,
}

impl DeviceInventory {
    pub fn new(source: Arc<dyn DeviceSource>) -> Self {
        let inventory = Self {
            source,
            state: Mutex::new(DeviceSelection::default()),
            settings: None,
        };
        inventory.refresh();
        inventory
    }

    /// Like [`DeviceInventory::new`], but restores the persisted selection
    /// and writes selection changes back to the store.
    pub fn with_settings(source: Arc<dyn DeviceSource>, settings: Arc<SettingsStore>) -> Self {
        let prefs = settings.get();
        let inventory = Self {
            source,
            state: Mutex::new(DeviceSelection {
                selected_input: prefs.preferred_input,
                selected_output: prefs.preferred_output,
                ..DeviceSelection::default()
            }),
            settings: Some(settings),
        };
        inventory.refresh();
        inventory
    }

    /// Re-enumerate devices. Enumeration failure is logged and yields empty
    /// lists; it never fails an active session. The selection is kept even
    /// if the device is currently absent (it may come back).
    pub fn refresh(&self) {
        let devices = match self.source.enumerate() {
            Ok(devices) => devices,
            Err(e) => {
                tracing::warn!("device enumeration failed: {e}");
                Vec::new()
            }
        };

        let mut state = self.state.lock().unwrap();
        state.inputs = devices
            .iter()
            .filter(|d| d.kind == DeviceKind::Input)
            .cloned()
            .collect();
        state.outputs = devices
            .into_iter()
            .filter(|d| d.kind == DeviceKind::Output)
            .collect();
    }

    pub fn select_input(&self, device_id: &str) {
        self.state.lock().unwrap().selected_input = Some(device_id.to_string());
        if let Some(settings) = &self.settings {
            settings.set_preferred_input(Some(device_id.to_string()));
        }
    }

    pub fn select_output(&self, device_id: &str) {
        self.state.lock().unwrap().selected_output = Some(device_id.to_string());
        if let Some(settings) = &self.settings {
            settings.set_preferred_output(Some(device_id.to_string()));
        }
    }

    pub fn selected_input(&self) -> Option<String> {
        self.state.lock().unwrap().selected_input.clone()
    }

    pub fn selected_output(&self) -> Option<String> {
        self.state.lock().unwrap().selected_output.clone()
    }

    /// Copy of the full device state, in snapshot shape.
    pub fn selection(&self) -> DeviceSelection {
        self.state.lock().unwrap().clone()
    }
}
