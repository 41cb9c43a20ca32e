use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use crate::devices::DeviceInventory;
use crate::errors::RiftError;
use crate::level::{AudioLevelMonitor, SPEAKING_THRESHOLD};
use crate::platform::{MediaBackend, MediaSession, PlatformEvent, TrackSource};
use crate::publisher::{SnapshotObserver, SnapshotPublisher, Subscription};
use crate::snapshot::{ConnectionPhase, LocalParticipant, ScreenShare, SessionSnapshot};
use crate::token::TokenProvider;

/// A connect attempt that neither succeeds nor fails within this window is
/// surfaced as Failed instead of hanging in Connecting; the platform's own
/// timeout does not always fire.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

struct ControllerState<S> {
    /// Monotonically increasing tag for the current connection attempt.
    /// Events and late connect results carrying an older epoch are dropped.
    epoch: u64,
    /// Version of the snapshot, bumped on every mutation while this lock
    /// is held. The publisher drops versions that lose the race to a
    /// newer sibling between unlock and delivery.
    version: u64,
    session: Option<Arc<S>>,
    snapshot: SessionSnapshot,
}

impl<S> ControllerState<S> {
    /// Assign the next snapshot version and clone the snapshot for
    /// publishing, both under the same lock hold as the mutation.
    fn stamp(&mut self) -> (u64, SessionSnapshot) {
        self.version += 1;
        (self.version, self.snapshot.clone())
    }
}

/// Manages at most one live room connection, folding the platform's event
/// stream into successive [`SessionSnapshot`] versions.
///
/// Generic over the media backend and the credential fetcher so the whole
/// lifecycle can be driven in tests without a platform or a token server.
/// All state mutation happens under one lock and each fold starts from the
/// latest snapshot, so versions are totally ordered per session.
pub struct SessionController<B: MediaBackend, T: TokenProvider> {
    backend: Arc<B>,
    tokens: Arc<T>,
    devices: Arc<DeviceInventory>,
    monitor: Arc<AudioLevelMonitor>,
    publisher: SnapshotPublisher,
    state: Arc<Mutex<ControllerState<B::Session>>>,
}

impl<B: MediaBackend, T: TokenProvider> SessionController<B, T> {
    pub fn new(backend: B, tokens: T, devices: Arc<DeviceInventory>) -> Self {
        let snapshot = SessionSnapshot::disconnected(devices.selection());
        let publisher = SnapshotPublisher::new();
        publisher.publish_version(1, snapshot.clone());
        Self {
            backend: Arc::new(backend),
            tokens: Arc::new(tokens),
            devices,
            monitor: Arc::new(AudioLevelMonitor::new()),
            publisher,
            state: Arc::new(Mutex::new(ControllerState {
                epoch: 0,
                version: 1,
                session: None,
                snapshot,
            })),
        }
    }

    /// Register a snapshot observer; the current version is delivered
    /// synchronously before this returns.
    pub fn subscribe(&self, observer: Arc<dyn SnapshotObserver>) -> Subscription {
        self.publisher.subscribe(observer)
    }

    /// Synchronous peek at the current snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.publisher.current()
    }

    /// Connect to `room` as `identity`, tearing down any prior connection
    /// first — at most one room connection exists at any time.
    ///
    /// Fetches a fresh join credential, opens the platform connection and
    /// spawns the event loop for this attempt. On failure the snapshot
    /// moves to Failed with `last_error` set; there is no automatic retry,
    /// callers own that policy and may simply call this again.
    pub async fn connect_to_room(&self, room: &str, identity: &str) -> Result<(), RiftError> {
        if room.is_empty() {
            return Err(RiftError::Room("room identity must not be empty".to_string()));
        }
        let identity = if identity.is_empty() {
            format!("user-{}", chrono::Utc::now().timestamp_millis())
        } else {
            identity.to_string()
        };

        // Begin a new epoch; anything still in flight for the previous
        // connection is now stale.
        let (my_epoch, old_session, version, snap) = {
            let mut st = self.state.lock().unwrap();
            st.epoch += 1;
            let old = st.session.take();
            st.snapshot = SessionSnapshot::connecting(room, self.devices.selection());
            let (version, snap) = st.stamp();
            (st.epoch, old, version, snap)
        };
        self.monitor.detach();
        self.publisher.publish_version(version, snap);
        if let Some(old) = old_session {
            old.close().await;
        }

        tracing::info!("connecting to room {room} as {identity}");

        let credential = match self.tokens.fetch(&identity, room).await {
            Ok(credential) => credential,
            Err(e) => {
                self.fail_attempt(my_epoch, &e.to_string());
                return Err(e);
            }
        };

        let connected = tokio::time::timeout(CONNECT_TIMEOUT, self.backend.connect(&credential));
        let (session, events) = match connected.await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                self.fail_attempt(my_epoch, &e.to_string());
                return Err(e);
            }
            Err(_) => {
                let e = RiftError::Connection(format!(
                    "connect timed out after {}s",
                    CONNECT_TIMEOUT.as_secs()
                ));
                self.fail_attempt(my_epoch, &e.to_string());
                return Err(e);
            }
        };
        let session = Arc::new(session);

        // A connect resolving for an abandoned attempt must tear itself
        // down, not install listeners onto a controller that moved on.
        // The lock scope closes before any await so the future stays Send.
        let installed = {
            let mut st = self.state.lock().unwrap();
            if st.epoch != my_epoch {
                None
            } else {
                st.session = Some(session.clone());
                st.snapshot.set_phase(ConnectionPhase::Connected);
                st.snapshot.local_participant = Some(LocalParticipant {
                    display_name: credential.identity.clone(),
                    microphone_enabled: true,
                    speaking: false,
                    audio_level: 0.0,
                });
                Some(st.stamp())
            }
        };
        let Some((version, snap)) = installed else {
            tracing::info!("connect to {room} superseded, tearing down");
            session.close().await;
            return Err(RiftError::Connection(
                "superseded by a newer connect attempt".to_string(),
            ));
        };
        self.publisher.publish_version(version, snap);

        // Microphone on by default; a failure here surfaces but does not
        // tear down the session.
        if let Err(e) = session.set_microphone_enabled(true).await {
            tracing::warn!("enabling microphone failed: {e}");
            self.record_error(my_epoch, &format!("enabling microphone failed: {e}"));
        }

        // Apply a device selection queued while disconnected.
        if let Some(device_id) = self.devices.selected_input() {
            if let Err(e) = session.switch_audio_input(&device_id).await {
                tracing::warn!("applying queued input device failed: {e}");
            }
        }
        if let Some(device_id) = self.devices.selected_output() {
            if let Err(e) = session.switch_audio_output(&device_id).await {
                tracing::warn!("applying output device failed: {e}");
            }
        }

        tokio::spawn(run_event_loop(
            events,
            my_epoch,
            session,
            self.state.clone(),
            self.publisher.clone(),
            self.monitor.clone(),
        ));

        Ok(())
    }

    /// Disconnect from the current room. Idempotent; safe to call when
    /// never connected. Leaves a fresh Disconnected snapshot with device
    /// state preserved.
    pub async fn disconnect(&self) {
        let (old, version, snap) = {
            let mut st = self.state.lock().unwrap();
            st.epoch += 1;
            let old = st.session.take();
            st.snapshot = SessionSnapshot::disconnected(st.snapshot.devices.clone());
            let (version, snap) = st.stamp();
            (old, version, snap)
        };
        self.monitor.detach();
        self.publisher.publish_version(version, snap);
        if let Some(old) = old {
            tracing::info!("closing room connection");
            old.close().await;
        }
    }

    /// Toggle the local microphone. Returns the new muted state, or the
    /// current one as a no-op when not connected. The flag flips only
    /// after the platform call succeeds.
    pub async fn toggle_mute(&self) -> Result<bool, RiftError> {
        let (session, epoch, current) = {
            let st = self.state.lock().unwrap();
            (st.session.clone(), st.epoch, st.snapshot.is_muted)
        };
        let Some(session) = session else {
            return Ok(current);
        };

        let next = !current;
        if let Err(e) = session.set_microphone_enabled(!next).await {
            self.record_error(epoch, &format!("toggle mute failed: {e}"));
            return Err(RiftError::Command(format!("toggle mute: {e}")));
        }

        let (version, snap) = {
            let mut st = self.state.lock().unwrap();
            // The session may have been torn down while the platform call
            // was in flight; never stamp flags onto the successor snapshot.
            if st.epoch != epoch {
                return Ok(st.snapshot.is_muted);
            }
            st.snapshot.is_muted = next;
            if let Some(local) = st.snapshot.local_participant.as_mut() {
                local.microphone_enabled = !next;
            }
            st.stamp()
        };
        self.publisher.publish_version(version, snap);
        Ok(next)
    }

    /// Toggle deafen: sets the local playout volume of every currently
    /// known remote participant to zero/one. Participants joining while
    /// deafened inherit the zero volume at fold time.
    pub async fn toggle_deafen(&self) -> Result<bool, RiftError> {
        let (session, epoch, current, identities) = {
            let st = self.state.lock().unwrap();
            (
                st.session.clone(),
                st.epoch,
                st.snapshot.is_deafened,
                st.snapshot
                    .remote_participants
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>(),
            )
        };
        let Some(session) = session else {
            return Ok(current);
        };

        let next = !current;
        let volume = if next { 0.0 } else { 1.0 };
        // New arrivals inherit this before their join event is folded.
        if let Err(e) = session.set_default_playout_volume(volume).await {
            tracing::warn!("setting default playout volume failed: {e}");
        }
        for identity in &identities {
            // Partial failure is not fatal; the remaining participants
            // still get the new volume.
            if let Err(e) = session.set_participant_volume(identity, volume).await {
                tracing::warn!("setting playout volume for {identity} failed: {e}");
            }
        }

        let (version, snap) = {
            let mut st = self.state.lock().unwrap();
            if st.epoch != epoch {
                return Ok(st.snapshot.is_deafened);
            }
            st.snapshot.is_deafened = next;
            st.stamp()
        };
        self.publisher.publish_version(version, snap);
        Ok(next)
    }

    /// Toggle local screen capture. A failure (e.g. the user cancelling
    /// the share picker) leaves the flag unchanged and surfaces via
    /// `last_error`.
    pub async fn toggle_screen_share(&self) -> Result<bool, RiftError> {
        let (session, epoch, current) = {
            let st = self.state.lock().unwrap();
            (st.session.clone(), st.epoch, st.snapshot.is_screen_sharing)
        };
        let Some(session) = session else {
            return Ok(current);
        };

        let next = !current;
        if let Err(e) = session.set_screen_share_enabled(next).await {
            self.record_error(epoch, &format!("screen share failed: {e}"));
            return Err(RiftError::Command(format!("toggle screen share: {e}")));
        }

        let (version, snap) = {
            let mut st = self.state.lock().unwrap();
            if st.epoch != epoch {
                return Ok(st.snapshot.is_screen_sharing);
            }
            st.snapshot.is_screen_sharing = next;
            st.stamp()
        };
        self.publisher.publish_version(version, snap);
        Ok(next)
    }

    /// Toggle the local camera. First enable publishes the track; after
    /// that the publication is muted/unmuted in place. A failure leaves
    /// the flag unchanged and surfaces via `last_error`.
    pub async fn toggle_camera(&self) -> Result<bool, RiftError> {
        let (session, epoch, current) = {
            let st = self.state.lock().unwrap();
            (st.session.clone(), st.epoch, st.snapshot.is_camera_on)
        };
        let Some(session) = session else {
            return Ok(current);
        };

        let next = !current;
        if let Err(e) = session.set_camera_enabled(next).await {
            self.record_error(epoch, &format!("toggle camera failed: {e}"));
            return Err(RiftError::Command(format!("toggle camera: {e}")));
        }

        let (version, snap) = {
            let mut st = self.state.lock().unwrap();
            if st.epoch != epoch {
                return Ok(st.snapshot.is_camera_on);
            }
            st.snapshot.is_camera_on = next;
            st.stamp()
        };
        self.publisher.publish_version(version, snap);
        Ok(next)
    }

    /// Switch the microphone device. Live switch when connected; otherwise
    /// the selection is remembered and applied on the next connect.
    pub async fn switch_audio_input(&self, device_id: &str) -> Result<(), RiftError> {
        let (session, epoch) = {
            let st = self.state.lock().unwrap();
            (st.session.clone(), st.epoch)
        };
        if let Some(session) = session {
            if let Err(e) = session.switch_audio_input(device_id).await {
                self.record_error(epoch, &format!("switch input failed: {e}"));
                return Err(RiftError::Command(format!("switch input: {e}")));
            }
        }
        self.devices.select_input(device_id);
        self.sync_devices();
        Ok(())
    }

    /// Switch the playback device; applied immediately.
    pub async fn switch_audio_output(&self, device_id: &str) -> Result<(), RiftError> {
        let (session, epoch) = {
            let st = self.state.lock().unwrap();
            (st.session.clone(), st.epoch)
        };
        if let Some(session) = session {
            if let Err(e) = session.switch_audio_output(device_id).await {
                self.record_error(epoch, &format!("switch output failed: {e}"));
                return Err(RiftError::Command(format!("switch output: {e}")));
            }
        }
        self.devices.select_output(device_id);
        self.sync_devices();
        Ok(())
    }

    /// Re-enumerate audio devices (hardware-change notification) and fold
    /// the result into the snapshot.
    pub fn refresh_devices(&self) {
        self.devices.refresh();
        self.sync_devices();
    }

    fn sync_devices(&self) {
        let (version, snap) = {
            let mut st = self.state.lock().unwrap();
            st.snapshot.devices = self.devices.selection();
            st.stamp()
        };
        self.publisher.publish_version(version, snap);
    }

    /// Record a command failure, unless the session it failed against has
    /// already been torn down.
    fn record_error(&self, epoch: u64, message: &str) {
        let (version, snap) = {
            let mut st = self.state.lock().unwrap();
            if st.epoch != epoch {
                return;
            }
            st.snapshot.last_error = Some(message.to_string());
            st.stamp()
        };
        self.publisher.publish_version(version, snap);
    }

    /// Move the snapshot to Failed for a connect attempt, unless a newer
    /// attempt has already taken over.
    fn fail_attempt(&self, epoch: u64, message: &str) {
        let (version, snap) = {
            let mut st = self.state.lock().unwrap();
            if st.epoch != epoch {
                return;
            }
            st.snapshot.set_phase(ConnectionPhase::Failed);
            st.snapshot.last_error = Some(message.to_string());
            st.stamp()
        };
        self.publisher.publish_version(version, snap);
    }
}

/// Per-connection event loop: folds each platform event onto the latest
/// snapshot. Every fold is guarded by epoch equality, so events from a
/// torn-down connection can never mutate the current snapshot.
async fn run_event_loop<S: MediaSession>(
    mut events: UnboundedReceiver<PlatformEvent>,
    epoch: u64,
    session: Arc<S>,
    state: Arc<Mutex<ControllerState<S>>>,
    publisher: SnapshotPublisher,
    monitor: Arc<AudioLevelMonitor>,
) {
    while let Some(event) = events.recv().await {
        // Identities to silence after the lock is released (deafen
        // inherited by late joiners) and a probe to attach.
        let mut silence = Vec::new();
        let mut attach_probe = None;
        let mut ended = false;

        let (version, snap) = {
            let mut st = state.lock().unwrap();
            if st.epoch != epoch {
                tracing::debug!("dropping stale platform event: {event:?}");
                break;
            }

            match event {
                PlatformEvent::Connected | PlatformEvent::Reconnected => {
                    st.snapshot.set_phase(ConnectionPhase::Connected);
                }

                PlatformEvent::Reconnecting => {
                    st.snapshot.set_phase(ConnectionPhase::Reconnecting);
                }

                PlatformEvent::Disconnected { reason } => {
                    tracing::info!("room disconnected: {reason}");
                    st.epoch += 1;
                    st.session = None;
                    st.snapshot = SessionSnapshot::disconnected(st.snapshot.devices.clone());
                    ended = true;
                }

                PlatformEvent::ConnectionFailed { message } => {
                    tracing::warn!("room connection failed: {message}");
                    st.epoch += 1;
                    st.session = None;
                    st.snapshot.set_phase(ConnectionPhase::Failed);
                    st.snapshot.last_error = Some(message);
                    ended = true;
                }

                PlatformEvent::ParticipantJoined {
                    identity,
                    display_name,
                    microphone_enabled,
                } => {
                    let known = st.snapshot.remote_participants.contains_key(&identity);
                    let p = st.snapshot.ensure_remote(&identity, &display_name);
                    if !known {
                        p.microphone_enabled = microphone_enabled;
                    }
                    if st.snapshot.is_deafened {
                        silence.push(identity);
                    }
                }

                PlatformEvent::ParticipantLeft { identity } => {
                    st.snapshot.remove_remote(&identity);
                }

                PlatformEvent::TrackMuted { identity, source } => {
                    if source == TrackSource::Microphone {
                        st.snapshot.ensure_remote(&identity, "").microphone_enabled = false;
                    }
                }

                PlatformEvent::TrackUnmuted { identity, source } => {
                    if source == TrackSource::Microphone {
                        st.snapshot.ensure_remote(&identity, "").microphone_enabled = true;
                    }
                }

                PlatformEvent::TrackSubscribed {
                    identity,
                    display_name,
                    source,
                    handle,
                } => {
                    // Join and subscribe events are not ordered; a track
                    // for an unknown identity creates a provisional entry
                    // instead of being dropped.
                    st.snapshot.ensure_remote(&identity, &display_name);
                    match source {
                        TrackSource::ScreenShare => {
                            let display_name = st.snapshot.remote_participants[&identity]
                                .display_name
                                .clone();
                            st.snapshot.add_screen_share(ScreenShare {
                                participant_identity: identity,
                                display_name,
                                media_handle: handle,
                            });
                        }
                        TrackSource::Microphone => {
                            if st.snapshot.is_deafened {
                                silence.push(identity);
                            }
                        }
                        _ => {}
                    }
                }

                PlatformEvent::TrackUnsubscribed { handle, .. } => {
                    st.snapshot.remove_screen_share(&handle);
                }

                PlatformEvent::ActiveSpeakersChanged(speakers) => {
                    // Remote speaking state comes from the platform; the
                    // local participant is driven by the level monitor.
                    for (identity, p) in st.snapshot.remote_participants.iter_mut() {
                        match speakers.iter().find(|s| &s.identity == identity) {
                            Some(s) => {
                                p.speaking = true;
                                p.audio_level = s.level.clamp(0.0, 1.0);
                            }
                            None => {
                                p.speaking = false;
                                p.audio_level = 0.0;
                            }
                        }
                    }
                }

                PlatformEvent::LocalTrackPublished { source, probe } => {
                    if source == TrackSource::Microphone {
                        attach_probe = probe;
                    }
                }

                PlatformEvent::LocalTrackUnpublished { source } => match source {
                    // Share ended outside our command path (e.g. the
                    // browser's own stop button).
                    TrackSource::ScreenShare => st.snapshot.is_screen_sharing = false,
                    TrackSource::Camera => st.snapshot.is_camera_on = false,
                    TrackSource::Microphone => monitor.detach(),
                    _ => {}
                },
            }

            st.stamp()
        };

        publisher.publish_version(version, snap);

        for identity in silence {
            if let Err(e) = session.set_participant_volume(&identity, 0.0).await {
                tracing::warn!("silencing {identity} while deafened failed: {e}");
            }
        }

        if let Some(probe) = attach_probe {
            let sink_state = state.clone();
            let sink_publisher = publisher.clone();
            monitor.attach(probe.0, move |level| {
                let (version, snap) = {
                    let mut st = sink_state.lock().unwrap();
                    if st.epoch != epoch {
                        return;
                    }
                    let Some(local) = st.snapshot.local_participant.as_mut() else {
                        return;
                    };
                    let speaking = level > SPEAKING_THRESHOLD;
                    if local.speaking == speaking && (local.audio_level - level).abs() < 1e-3 {
                        return;
                    }
                    local.audio_level = level;
                    local.speaking = speaking;
                    st.stamp()
                };
                sink_publisher.publish_version(version, snap);
            });
        }

        if ended {
            monitor.detach();
            session.close().await;
            break;
        }
    }

    tracing::debug!("event loop ended for epoch {epoch}");
}
