use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Connection lifecycle of a voice session.
///
/// Driven only by platform connection events or an explicit local
/// disconnect, never by command handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalParticipant {
    pub display_name: String,
    pub microphone_enabled: bool,
    pub speaking: bool,
    pub audio_level: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteParticipant {
    pub display_name: String,
    pub microphone_enabled: bool,
    pub speaking: bool,
    pub audio_level: f32,
}

/// An active remote screen share, in subscribe order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenShare {
    pub participant_identity: String,
    pub display_name: String,
    /// Opaque track id used to look the media up in the backend registry.
    pub media_handle: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    Input,
    Output,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDevice {
    pub id: String,
    /// May be empty before the user grants microphone permission.
    pub label: String,
    pub kind: DeviceKind,
}

/// Audio device lists plus the user's selection.
///
/// Lives independently of the connection and survives reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceSelection {
    pub inputs: Vec<AudioDevice>,
    pub outputs: Vec<AudioDevice>,
    pub selected_input: Option<String>,
    pub selected_output: Option<String>,
}

/// Immutable-per-version state of one voice session.
///
/// Owned and written exclusively by the session controller; replaced
/// wholesale on every fold. The UI and satellites only ever read clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub phase: ConnectionPhase,
    /// Room the session belongs to. `None` while disconnected.
    pub room: Option<String>,
    pub local_participant: Option<LocalParticipant>,
    /// Keyed by participant identity, unique within a session. Unordered.
    pub remote_participants: HashMap<String, RemoteParticipant>,
    pub screen_shares: Vec<ScreenShare>,
    pub is_muted: bool,
    pub is_deafened: bool,
    pub is_screen_sharing: bool,
    pub is_camera_on: bool,
    pub devices: DeviceSelection,
    pub last_error: Option<String>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            room: None,
            local_participant: None,
            remote_participants: HashMap::new(),
            screen_shares: Vec::new(),
            is_muted: false,
            is_deafened: false,
            is_screen_sharing: false,
            is_camera_on: false,
            devices: DeviceSelection::default(),
            last_error: None,
        }
    }
}

impl SessionSnapshot {
    /// Fresh snapshot for a new connect attempt. Device state is the only
    /// thing carried over from the previous session.
    pub fn connecting(room: &str, devices: DeviceSelection) -> Self {
        Self {
            phase: ConnectionPhase::Connecting,
            room: Some(room.to_string()),
            devices,
            ..Self::default()
        }
    }

    /// Fresh disconnected snapshot, preserving device state.
    pub fn disconnected(devices: DeviceSelection) -> Self {
        Self {
            devices,
            ..Self::default()
        }
    }

    /// Move to a new phase. Successful transitions clear `last_error`;
    /// a local participant is only carried while connected or reconnecting.
    pub fn set_phase(&mut self, phase: ConnectionPhase) {
        match phase {
            ConnectionPhase::Connecting | ConnectionPhase::Connected => {
                self.last_error = None;
            }
            _ => {}
        }
        if !matches!(
            phase,
            ConnectionPhase::Connected | ConnectionPhase::Reconnecting
        ) {
            self.local_participant = None;
        }
        self.phase = phase;
    }

    /// Insert a remote participant if unknown. Idempotent against duplicate
    /// join events; an existing entry keeps its mute/speaking state.
    pub fn ensure_remote(&mut self, identity: &str, display_name: &str) -> &mut RemoteParticipant {
        self.remote_participants
            .entry(identity.to_string())
            .or_insert_with(|| RemoteParticipant {
                display_name: if display_name.is_empty() {
                    identity.to_string()
                } else {
                    display_name.to_string()
                },
                microphone_enabled: true,
                speaking: false,
                audio_level: 0.0,
            })
    }

    /// Remove a participant and everything keyed on their identity.
    pub fn remove_remote(&mut self, identity: &str) {
        self.remote_participants.remove(identity);
        self.screen_shares
            .retain(|s| s.participant_identity != identity);
    }

    /// Append a screen share unless the same handle is already present.
    pub fn add_screen_share(&mut self, share: ScreenShare) {
        if !self
            .screen_shares
            .iter()
            .any(|s| s.media_handle == share.media_handle)
        {
            self.screen_shares.push(share);
        }
    }

    /// Remove a screen share by its track handle.
    pub fn remove_screen_share(&mut self, media_handle: &str) {
        self.screen_shares.retain(|s| s.media_handle != media_handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connecting_carries_devices_only() {
        let mut devices = DeviceSelection::default();
        devices.selected_input = Some("mic-1".to_string());

        let snap = SessionSnapshot::connecting("general", devices.clone());
        assert_eq!(snap.phase, ConnectionPhase::Connecting);
        assert_eq!(snap.room.as_deref(), Some("general"));
        assert_eq!(snap.devices, devices);
        assert!(snap.remote_participants.is_empty());
        assert!(!snap.is_muted);
    }

    #[test]
    fn set_phase_clears_error_on_success() {
        let mut snap = SessionSnapshot::default();
        snap.last_error = Some("boom".to_string());
        snap.set_phase(ConnectionPhase::Connected);
        assert!(snap.last_error.is_none());
    }

    #[test]
    fn set_phase_drops_local_participant_when_not_live() {
        let mut snap = SessionSnapshot::default();
        snap.local_participant = Some(LocalParticipant {
            display_name: "alice".to_string(),
            microphone_enabled: true,
            speaking: false,
            audio_level: 0.0,
        });

        snap.set_phase(ConnectionPhase::Reconnecting);
        assert!(snap.local_participant.is_some());

        snap.set_phase(ConnectionPhase::Failed);
        assert!(snap.local_participant.is_none());
    }

    #[test]
    fn ensure_remote_is_idempotent() {
        let mut snap = SessionSnapshot::default();
        snap.ensure_remote("bob", "Bob").microphone_enabled = false;
        snap.ensure_remote("bob", "Bob");
        assert_eq!(snap.remote_participants.len(), 1);
        assert!(!snap.remote_participants["bob"].microphone_enabled);
    }

    #[test]
    fn ensure_remote_falls_back_to_identity_for_name() {
        let mut snap = SessionSnapshot::default();
        snap.ensure_remote("bob", "");
        assert_eq!(snap.remote_participants["bob"].display_name, "bob");
    }

    #[test]
    fn remove_remote_takes_screen_shares_with_it() {
        let mut snap = SessionSnapshot::default();
        snap.ensure_remote("bob", "Bob");
        snap.add_screen_share(ScreenShare {
            participant_identity: "bob".to_string(),
            display_name: "Bob".to_string(),
            media_handle: "tr-1".to_string(),
        });
        snap.remove_remote("bob");
        assert!(snap.remote_participants.is_empty());
        assert!(snap.screen_shares.is_empty());
    }

    #[test]
    fn duplicate_screen_share_subscribe_kept_once() {
        let mut snap = SessionSnapshot::default();
        let share = ScreenShare {
            participant_identity: "bob".to_string(),
            display_name: "Bob".to_string(),
            media_handle: "tr-1".to_string(),
        };
        snap.add_screen_share(share.clone());
        snap.add_screen_share(share);
        assert_eq!(snap.screen_shares.len(), 1);
    }
}
