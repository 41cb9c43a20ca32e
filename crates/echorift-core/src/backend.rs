use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use futures_util::StreamExt;
use livekit::options::TrackPublishOptions;
use livekit::prelude::*;
use livekit::track::TrackSource as LkTrackSource;
use livekit::webrtc::audio_source::native::NativeAudioSource;
use livekit::webrtc::audio_stream::native::NativeAudioStream;
use livekit::webrtc::prelude::*;
use livekit::webrtc::video_source::native::NativeVideoSource;
use tokio::sync::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::errors::RiftError;
use crate::level::LevelProbe;
use crate::platform::{
    AudioProbe, MediaBackend, MediaSession, PlatformEvent, SpeakerUpdate, TrackSource,
};
use crate::playout::PlayoutMixer;
use crate::token::JoinCredential;

const AUDIO_SAMPLE_RATE: u32 = 48_000;
const AUDIO_CHANNELS: u32 = 1;
const AUDIO_QUEUE_SIZE_MS: u32 = 100;

const VIDEO_WIDTH: u32 = 1280;
const VIDEO_HEIGHT: u32 = 720;

const SCREEN_WIDTH: u32 = 1920;
const SCREEN_HEIGHT: u32 = 1080;

/// Media backend over the LiveKit SDK.
///
/// Holds the server URL and the shared playout mixer; each `connect` opens
/// one room and yields an independent session plus event stream.
pub struct LiveKitBackend {
    server_url: String,
    mixer: Arc<PlayoutMixer>,
}

impl LiveKitBackend {
    pub fn new(server_url: &str) -> Self {
        Self {
            server_url: server_url.to_string(),
            mixer: Arc::new(PlayoutMixer::new()),
        }
    }

    /// Platform audio output (cpal, Android AudioTrack) pulls mixed remote
    /// PCM from here.
    pub fn mixer(&self) -> Arc<PlayoutMixer> {
        self.mixer.clone()
    }
}

impl MediaBackend for LiveKitBackend {
    type Session = LiveKitSession;

    async fn connect(
        &self,
        credential: &JoinCredential,
    ) -> Result<(LiveKitSession, UnboundedReceiver<PlatformEvent>), RiftError> {
        let mut options = RoomOptions::default();
        options.auto_subscribe = true;

        let (room, room_events) = Room::connect(&self.server_url, &credential.token, options)
            .await
            .map_err(|e| RiftError::Connection(e.to_string()))?;
        let room = Arc::new(room);

        let (tx, rx) = unbounded_channel();

        // Participants already in the room when we arrive never produce a
        // ParticipantConnected event; seed them ourselves.
        for (_, participant) in room.remote_participants() {
            let _ = tx.send(remote_joined(&participant));
        }

        tokio::spawn(translate_events(room_events, tx.clone(), self.mixer.clone()));

        let session = LiveKitSession {
            room,
            events: tx,
            mixer: self.mixer.clone(),
            capture: Mutex::new(None),
        };
        Ok((session, rx))
    }
}

/// One live LiveKit room connection.
pub struct LiveKitSession {
    room: Arc<Room>,
    events: UnboundedSender<PlatformEvent>,
    mixer: Arc<PlayoutMixer>,
    capture: Mutex<Option<MicCapture>>,
}

/// Handle the native capture shell feeds microphone PCM into. Frames go to
/// the published track and their peak to the level probe.
#[derive(Clone)]
pub struct MicCapture {
    source: NativeAudioSource,
    peak: Arc<AtomicU32>,
}

impl MicCapture {
    pub async fn push_frame(&self, samples: &[i16]) -> Result<(), RiftError> {
        let peak = samples.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);
        self.peak
            .store((peak as f32 / i16::MAX as f32).to_bits(), Ordering::Relaxed);

        let frame = AudioFrame {
            data: samples.into(),
            sample_rate: AUDIO_SAMPLE_RATE,
            num_channels: AUDIO_CHANNELS,
            samples_per_channel: samples.len() as u32 / AUDIO_CHANNELS,
        };
        self.source
            .capture_frame(&frame)
            .await
            .map_err(|e| RiftError::Device(format!("capture frame: {e}")))
    }
}

struct PeakProbe {
    peak: Arc<AtomicU32>,
}

impl LevelProbe for PeakProbe {
    fn level(&self) -> f32 {
        f32::from_bits(self.peak.load(Ordering::Relaxed))
    }
}

impl LiveKitSession {
    /// Capture handle for the native shell, once the microphone track has
    /// been published.
    pub async fn capture(&self) -> Option<MicCapture> {
        self.capture.lock().await.clone()
    }

    async fn publish_microphone(&self) -> Result<(), RiftError> {
        let source = NativeAudioSource::new(
            AudioSourceOptions {
                echo_cancellation: true,
                noise_suppression: true,
                auto_gain_control: true,
            },
            AUDIO_SAMPLE_RATE,
            AUDIO_CHANNELS,
            AUDIO_QUEUE_SIZE_MS,
        );

        let track = LocalAudioTrack::create_audio_track(
            "microphone",
            RtcAudioSource::Native(source.clone()),
        );

        self.room
            .local_participant()
            .publish_track(
                LocalTrack::Audio(track),
                TrackPublishOptions {
                    source: LkTrackSource::Microphone,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| RiftError::Room(format!("publish audio: {e}")))?;

        let peak = Arc::new(AtomicU32::new(0));
        *self.capture.lock().await = Some(MicCapture {
            source,
            peak: peak.clone(),
        });

        tracing::info!("microphone track published");
        let _ = self.events.send(PlatformEvent::LocalTrackPublished {
            source: TrackSource::Microphone,
            probe: Some(AudioProbe(Arc::new(PeakProbe { peak }))),
        });
        Ok(())
    }

    async fn publish_camera(&self) -> Result<(), RiftError> {
        let source = NativeVideoSource::new(
            VideoResolution {
                width: VIDEO_WIDTH,
                height: VIDEO_HEIGHT,
            },
            false, // not a screencast
        );
        let track = LocalVideoTrack::create_video_track(
            "camera",
            RtcVideoSource::Native(source),
        );
        self.room
            .local_participant()
            .publish_track(
                LocalTrack::Video(track),
                TrackPublishOptions {
                    source: LkTrackSource::Camera,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| RiftError::Command(format!("publish camera: {e}")))?;

        tracing::info!("camera track published");
        let _ = self.events.send(PlatformEvent::LocalTrackPublished {
            source: TrackSource::Camera,
            probe: None,
        });
        Ok(())
    }

    fn has_publication(&self, source: LkTrackSource) -> bool {
        self.room
            .local_participant()
            .track_publications()
            .values()
            .any(|publication| publication.source() == source)
    }

    fn set_source_muted(&self, source: LkTrackSource, muted: bool) {
        let local = self.room.local_participant();
        for (_, publication) in local.track_publications() {
            if publication.source() == source {
                if muted {
                    publication.mute();
                } else {
                    publication.unmute();
                }
                break;
            }
        }
    }
}

impl MediaSession for LiveKitSession {
    async fn set_microphone_enabled(&self, enabled: bool) -> Result<(), RiftError> {
        if enabled && self.capture.lock().await.is_none() {
            return self.publish_microphone().await;
        }
        self.set_source_muted(LkTrackSource::Microphone, !enabled);
        tracing::info!("microphone enabled: {enabled}");
        Ok(())
    }

    async fn set_camera_enabled(&self, enabled: bool) -> Result<(), RiftError> {
        if enabled && !self.has_publication(LkTrackSource::Camera) {
            return self.publish_camera().await;
        }
        self.set_source_muted(LkTrackSource::Camera, !enabled);
        tracing::info!("camera enabled: {enabled}");
        Ok(())
    }

    async fn set_screen_share_enabled(&self, enabled: bool) -> Result<(), RiftError> {
        if enabled {
            let source = NativeVideoSource::new(
                VideoResolution {
                    width: SCREEN_WIDTH,
                    height: SCREEN_HEIGHT,
                },
                true, // screencast
            );
            let track = LocalVideoTrack::create_video_track(
                "screen",
                RtcVideoSource::Native(source),
            );
            self.room
                .local_participant()
                .publish_track(
                    LocalTrack::Video(track),
                    TrackPublishOptions {
                        source: LkTrackSource::Screenshare,
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| RiftError::Command(format!("publish screen share: {e}")))?;
            tracing::info!("screen share track published");
        } else {
            let local = self.room.local_participant();
            let sid = local
                .track_publications()
                .iter()
                .find(|(_, publication)| publication.source() == LkTrackSource::Screenshare)
                .map(|(sid, _)| sid.clone());
            if let Some(sid) = sid {
                local
                    .unpublish_track(&sid)
                    .await
                    .map_err(|e| RiftError::Command(format!("unpublish screen share: {e}")))?;
                tracing::info!("screen share track unpublished");
            }
        }
        Ok(())
    }

    async fn set_participant_volume(&self, identity: &str, volume: f32) -> Result<(), RiftError> {
        self.mixer.set_gain(identity, volume);
        Ok(())
    }

    async fn set_default_playout_volume(&self, volume: f32) -> Result<(), RiftError> {
        self.mixer.set_default_gain(volume);
        Ok(())
    }

    async fn switch_audio_input(&self, device_id: &str) -> Result<(), RiftError> {
        // Capture routing lives in the embedding shell; it observes the
        // device selection and re-routes its feed into the capture handle.
        tracing::info!("audio input switched to {device_id}");
        Ok(())
    }

    async fn switch_audio_output(&self, device_id: &str) -> Result<(), RiftError> {
        tracing::info!("audio output switched to {device_id}");
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.room.close().await {
            tracing::warn!("error closing room: {e}");
        }
        self.mixer.clear();
    }
}

fn map_source(source: LkTrackSource) -> TrackSource {
    match source {
        LkTrackSource::Microphone => TrackSource::Microphone,
        LkTrackSource::Camera => TrackSource::Camera,
        LkTrackSource::Screenshare => TrackSource::ScreenShare,
        _ => TrackSource::Unknown,
    }
}

fn remote_joined(participant: &RemoteParticipant) -> PlatformEvent {
    let microphone_enabled = !participant.track_publications().values().any(|publication| {
        publication.kind() == livekit::track::TrackKind::Audio && publication.is_muted()
    });
    PlatformEvent::ParticipantJoined {
        identity: participant.identity().to_string(),
        display_name: participant.name().to_string(),
        microphone_enabled,
    }
}

/// Translates the SDK's event stream into [`PlatformEvent`]s, copying
/// plain data out of the SDK handles, and runs the per-track audio playout
/// tasks.
async fn translate_events(
    mut room_events: UnboundedReceiver<RoomEvent>,
    tx: UnboundedSender<PlatformEvent>,
    mixer: Arc<PlayoutMixer>,
) {
    // Keyed by track sid so playout stops the moment a track goes away.
    let mut playout_tasks: HashMap<String, tokio::task::JoinHandle<()>> = HashMap::new();

    while let Some(event) = room_events.recv().await {
        match event {
            RoomEvent::Connected { .. } => {
                let _ = tx.send(PlatformEvent::Connected);
            }

            RoomEvent::Reconnecting => {
                let _ = tx.send(PlatformEvent::Reconnecting);
            }

            RoomEvent::Reconnected => {
                let _ = tx.send(PlatformEvent::Reconnected);
            }

            RoomEvent::Disconnected { reason } => {
                for (sid, handle) in playout_tasks.drain() {
                    handle.abort();
                    tracing::debug!("audio playout stopped on disconnect: {sid}");
                }
                use livekit::DisconnectReason as Dr;
                let event = match reason {
                    Dr::ClientInitiated
                    | Dr::ServerShutdown
                    | Dr::RoomDeleted
                    | Dr::ParticipantRemoved => PlatformEvent::Disconnected {
                        reason: format!("{reason:?}"),
                    },
                    _ => PlatformEvent::ConnectionFailed {
                        message: format!("{reason:?}"),
                    },
                };
                let _ = tx.send(event);
                break;
            }

            RoomEvent::ParticipantConnected(participant) => {
                let _ = tx.send(remote_joined(&participant));
            }

            RoomEvent::ParticipantDisconnected(participant) => {
                let _ = tx.send(PlatformEvent::ParticipantLeft {
                    identity: participant.identity().to_string(),
                });
            }

            RoomEvent::TrackSubscribed {
                track,
                publication,
                participant,
            } => {
                let identity = participant.identity().to_string();
                let track_sid = track.sid().to_string();

                // Remote audio: decode into the shared mixer until the
                // track goes away.
                if let livekit::track::RemoteTrack::Audio(audio_track) = &track {
                    let rtc_track = audio_track.rtc_track();
                    let mut stream =
                        NativeAudioStream::new(rtc_track, AUDIO_SAMPLE_RATE as i32, AUDIO_CHANNELS as i32);
                    let mixer = mixer.clone();
                    let identity = identity.clone();
                    let sid = track_sid.clone();
                    let handle = tokio::spawn(async move {
                        tracing::debug!("audio playout started for track {sid}");
                        while let Some(frame) = stream.next().await {
                            mixer.push_samples(&identity, &frame.data);
                        }
                        tracing::debug!("audio playout ended for track {sid}");
                    });
                    playout_tasks.insert(track_sid.clone(), handle);
                }

                let _ = tx.send(PlatformEvent::TrackSubscribed {
                    identity,
                    display_name: participant.name().to_string(),
                    source: map_source(publication.source()),
                    handle: track_sid,
                });
            }

            RoomEvent::TrackUnsubscribed {
                track, participant, ..
            } => {
                let track_sid = track.sid().to_string();
                if let Some(handle) = playout_tasks.remove(&track_sid) {
                    handle.abort();
                    tracing::debug!("audio playout aborted for track {track_sid}");
                }
                let _ = tx.send(PlatformEvent::TrackUnsubscribed {
                    identity: participant.identity().to_string(),
                    handle: track_sid,
                });
            }

            RoomEvent::TrackMuted {
                participant,
                publication,
            } => {
                let _ = tx.send(PlatformEvent::TrackMuted {
                    identity: participant.identity().to_string(),
                    source: map_source(publication.source()),
                });
            }

            RoomEvent::TrackUnmuted {
                participant,
                publication,
            } => {
                let _ = tx.send(PlatformEvent::TrackUnmuted {
                    identity: participant.identity().to_string(),
                    source: map_source(publication.source()),
                });
            }

            RoomEvent::ActiveSpeakersChanged { speakers } => {
                let updates = speakers
                    .iter()
                    .map(|p| SpeakerUpdate {
                        identity: p.identity().to_string(),
                        level: p.audio_level(),
                    })
                    .collect();
                let _ = tx.send(PlatformEvent::ActiveSpeakersChanged(updates));
            }

            RoomEvent::LocalTrackUnpublished { publication, .. } => {
                let _ = tx.send(PlatformEvent::LocalTrackUnpublished {
                    source: map_source(publication.source()),
                });
            }

            _ => {
                tracing::debug!("unhandled room event: {event:?}");
            }
        }
    }

    tracing::debug!("room event translation ended");
}
