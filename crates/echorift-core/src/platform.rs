use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;

use crate::errors::RiftError;
use crate::level::LevelProbe;
use crate::token::JoinCredential;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Microphone,
    Camera,
    ScreenShare,
    Unknown,
}

/// Loudness reading for one participant, from an active-speakers event.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeakerUpdate {
    pub identity: String,
    pub level: f32,
}

/// Handle to the local microphone's analysis tap, delivered with the
/// local-track-published event so the level monitor can attach to it.
#[derive(Clone)]
pub struct AudioProbe(pub Arc<dyn LevelProbe>);

impl fmt::Debug for AudioProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AudioProbe")
    }
}

/// Platform events, normalized away from the SDK's mutable object model.
///
/// Each event carries plain owned data copied out of the SDK handles at
/// translation time; nothing here aliases live platform state. Delivery
/// order between participant and track events is not guaranteed.
#[derive(Debug, Clone)]
pub enum PlatformEvent {
    Connected,
    Reconnecting,
    Reconnected,
    /// Orderly close, locally or server initiated.
    Disconnected { reason: String },
    /// Signaling gave up; the session is unusable.
    ConnectionFailed { message: String },
    ParticipantJoined {
        identity: String,
        display_name: String,
        microphone_enabled: bool,
    },
    ParticipantLeft { identity: String },
    TrackMuted { identity: String, source: TrackSource },
    TrackUnmuted { identity: String, source: TrackSource },
    TrackSubscribed {
        identity: String,
        display_name: String,
        source: TrackSource,
        handle: String,
    },
    TrackUnsubscribed { identity: String, handle: String },
    ActiveSpeakersChanged(Vec<SpeakerUpdate>),
    LocalTrackPublished { source: TrackSource, probe: Option<AudioProbe> },
    LocalTrackUnpublished { source: TrackSource },
}

/// One live connection to a platform room.
///
/// Exclusively owned by the session controller for the duration of the
/// connection; operations are fire-and-await platform round-trips.
pub trait MediaSession: Send + Sync + 'static {
    fn set_microphone_enabled(
        &self,
        enabled: bool,
    ) -> impl Future<Output = Result<(), RiftError>> + Send;

    /// First enable publishes the camera track; afterwards the
    /// publication is muted/unmuted in place.
    fn set_camera_enabled(
        &self,
        enabled: bool,
    ) -> impl Future<Output = Result<(), RiftError>> + Send;

    fn set_screen_share_enabled(
        &self,
        enabled: bool,
    ) -> impl Future<Output = Result<(), RiftError>> + Send;

    /// Set the local playout volume for one remote participant's audio.
    /// Deafen is implemented as volume 0 for everyone, inherited by late
    /// joiners; it never touches the remote's own publish state.
    fn set_participant_volume(
        &self,
        identity: &str,
        volume: f32,
    ) -> impl Future<Output = Result<(), RiftError>> + Send;

    /// Volume applied to participants with no explicit volume yet, so
    /// audio arriving between a join and its fold is already silenced
    /// while deafened.
    fn set_default_playout_volume(
        &self,
        volume: f32,
    ) -> impl Future<Output = Result<(), RiftError>> + Send;

    fn switch_audio_input(
        &self,
        device_id: &str,
    ) -> impl Future<Output = Result<(), RiftError>> + Send;

    fn switch_audio_output(
        &self,
        device_id: &str,
    ) -> impl Future<Output = Result<(), RiftError>> + Send;

    /// Close the connection and release every track and analysis resource.
    /// Idempotent.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Factory seam for the media platform.
///
/// The real implementation wraps the LiveKit SDK (feature `livekit`);
/// tests use an in-memory mock.
pub trait MediaBackend: Send + Sync + 'static {
    type Session: MediaSession;

    /// Open a room connection with a fresh join credential. On success
    /// yields the session handle plus the event stream for exactly that
    /// connection.
    fn connect(
        &self,
        credential: &JoinCredential,
    ) -> impl Future<Output = Result<(Self::Session, UnboundedReceiver<PlatformEvent>), RiftError>> + Send;
}
