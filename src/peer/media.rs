use crate::error::MediaAcquisitionError;
use crate::peer::types::TrackKind;
use crate::utils::random_id;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// What to capture for a call
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    #[serde(default = "enabled")]
    pub audio: bool,
    #[serde(default = "enabled")]
    pub video: bool,
}

fn enabled() -> bool {
    true
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

#[derive(Debug)]
struct TrackShared {
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
}

/// Handle to a captured track. Clones share enablement and end-of-stream state.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    label: String,
    shared: Arc<TrackShared>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            id: random_id(),
            kind,
            label: label.into(),
            shared: Arc::new(TrackShared {
                enabled: AtomicBool::new(true),
                ended,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, on: bool) {
        self.shared.enabled.store(on, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        !*self.shared.ended.borrow()
    }

    /// Stops capture. Also used by device backends when the OS ends the track
    /// (e.g. the native "stop sharing" control). Returns false if already stopped.
    pub fn stop(&self) -> bool {
        let was_ended = self.shared.ended.send_replace(true);
        if !was_ended {
            debug!("track {} ({:?}) stopped", self.id, self.kind);
        }
        !was_ended
    }

    /// Resolves once the track has ended, immediately if it already has.
    pub async fn ended(&self) {
        let mut rx = self.shared.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }
}

/// Camera and microphone capture plus the enabled flags gating what is sent
#[derive(Debug, Clone)]
pub struct LocalMediaState {
    pub audio: Option<MediaTrack>,
    pub video: Option<MediaTrack>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
}

impl Default for LocalMediaState {
    fn default() -> Self {
        Self {
            audio: None,
            video: None,
            audio_enabled: true,
            video_enabled: true,
        }
    }
}

impl LocalMediaState {
    pub fn from_tracks(tracks: Vec<MediaTrack>) -> Self {
        let mut state = Self::default();
        for track in tracks {
            let slot = match track.kind() {
                TrackKind::Audio => &mut state.audio,
                TrackKind::Video => &mut state.video,
            };
            if let Some(extra) = slot.replace(track) {
                // one track per kind; a surplus one would never be sent
                extra.stop();
            }
        }
        state
    }

    pub fn has_tracks(&self) -> bool {
        self.audio.is_some() || self.video.is_some()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.audio.iter().chain(self.video.iter())
    }

    /// No-op without local media. Returns whether the flag was applied.
    pub fn set_audio_enabled(&mut self, on: bool) -> bool {
        match &self.audio {
            Some(track) => {
                track.set_enabled(on);
                self.audio_enabled = on;
                true
            }
            None => false,
        }
    }

    /// No-op without local media. Returns whether the flag was applied.
    pub fn set_video_enabled(&mut self, on: bool) -> bool {
        match &self.video {
            Some(track) => {
                track.set_enabled(on);
                self.video_enabled = on;
                true
            }
            None => false,
        }
    }
}

/// Secondary screen capture
#[derive(Debug, Clone, Default)]
pub struct ScreenShareState {
    pub track: Option<MediaTrack>,
    /// Camera track that was on the video sender before sharing began
    pub camera: Option<MediaTrack>,
    pub active: bool,
}

/// Host capture capabilities (`getUserMedia` / `getDisplayMedia` equivalents)
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<MediaTrack>, MediaAcquisitionError>;

    async fn get_display_media(&self) -> Result<MediaTrack, MediaAcquisitionError>;
}

/// Acquires and releases capture through the host's [`MediaDevices`]
#[derive(Clone)]
pub struct MediaSourceManager {
    devices: Arc<dyn MediaDevices>,
}

impl MediaSourceManager {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self { devices }
    }

    pub async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalMediaState, MediaAcquisitionError> {
        let tracks = self.devices.get_user_media(constraints).await?;
        let state = LocalMediaState::from_tracks(tracks);
        if !state.has_tracks() {
            return Err(MediaAcquisitionError::DeviceUnavailable(
                "capture returned no tracks".into(),
            ));
        }
        info!(
            "Local media acquired: audio={} video={}",
            state.audio.is_some(),
            state.video.is_some()
        );
        Ok(state)
    }

    pub fn release_local_media(&self, state: &mut LocalMediaState) {
        let mut stopped = 0;
        for track in [state.audio.take(), state.video.take()].into_iter().flatten() {
            if track.stop() {
                stopped += 1;
            }
        }
        if stopped > 0 {
            info!("Local media released ({stopped} tracks)");
        }
    }

    pub async fn acquire_screen_capture(&self) -> Result<ScreenShareState, MediaAcquisitionError> {
        let track = self.devices.get_display_media().await?;
        if track.kind() != TrackKind::Video {
            warn!("display capture returned a {:?} track", track.kind());
            track.stop();
            return Err(MediaAcquisitionError::Unsupported);
        }
        info!("Screen capture acquired: {}", track.label());
        Ok(ScreenShareState {
            track: Some(track),
            camera: None,
            active: false,
        })
    }

    pub fn release_screen_capture(&self, state: &mut ScreenShareState) {
        if let Some(track) = state.track.take() {
            if track.stop() {
                info!("Screen capture released");
            }
        }
        state.camera = None;
        state.active = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct StaticDevices {
        handed_out: Mutex<Vec<MediaTrack>>,
        deny: bool,
    }

    #[async_trait]
    impl MediaDevices for StaticDevices {
        async fn get_user_media(
            &self,
            constraints: &MediaConstraints,
        ) -> Result<Vec<MediaTrack>, MediaAcquisitionError> {
            if self.deny {
                return Err(MediaAcquisitionError::PermissionDenied);
            }
            let mut tracks = Vec::new();
            if constraints.audio {
                tracks.push(MediaTrack::new(TrackKind::Audio, "mic"));
            }
            if constraints.video {
                tracks.push(MediaTrack::new(TrackKind::Video, "cam"));
            }
            self.handed_out.lock().unwrap().extend(tracks.iter().cloned());
            Ok(tracks)
        }

        async fn get_display_media(&self) -> Result<MediaTrack, MediaAcquisitionError> {
            Ok(MediaTrack::new(TrackKind::Video, "screen"))
        }
    }

    fn manager(deny: bool) -> (MediaSourceManager, Arc<StaticDevices>) {
        let devices = Arc::new(StaticDevices {
            handed_out: Mutex::new(Vec::new()),
            deny,
        });
        (MediaSourceManager::new(devices.clone()), devices)
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let (mgr, devices) = manager(false);
        let mut state = mgr
            .acquire_local_media(&MediaConstraints::default())
            .await
            .unwrap();
        mgr.release_local_media(&mut state);
        mgr.release_local_media(&mut state);

        assert!(!state.has_tracks());
        let handed_out = devices.handed_out.lock().unwrap();
        assert_eq!(handed_out.len(), 2);
        assert!(handed_out.iter().all(|t| !t.is_live()));
    }

    #[tokio::test]
    async fn denied_permission_is_reported() {
        let (mgr, _) = manager(true);
        let err = mgr
            .acquire_local_media(&MediaConstraints::default())
            .await
            .unwrap_err();
        assert_eq!(err, MediaAcquisitionError::PermissionDenied);
    }

    #[tokio::test]
    async fn empty_capture_counts_as_unavailable() {
        let (mgr, _) = manager(false);
        let none = MediaConstraints {
            audio: false,
            video: false,
        };
        let err = mgr.acquire_local_media(&none).await.unwrap_err();
        assert!(matches!(err, MediaAcquisitionError::DeviceUnavailable(_)));
    }

    #[tokio::test]
    async fn enable_flags_keep_capture_running() {
        let (mgr, _) = manager(false);
        let mut state = mgr
            .acquire_local_media(&MediaConstraints::default())
            .await
            .unwrap();
        assert!(state.set_audio_enabled(false));
        assert!(!state.audio_enabled);
        let mic = state.audio.as_ref().unwrap();
        assert!(!mic.is_enabled());
        assert!(mic.is_live());
    }

    #[test]
    fn enable_flags_without_media_are_noops() {
        let mut state = LocalMediaState::default();
        assert!(!state.set_video_enabled(false));
        assert!(state.video_enabled);
    }

    #[tokio::test]
    async fn screen_release_twice_equals_once() {
        let (mgr, _) = manager(false);
        let mut share = mgr.acquire_screen_capture().await.unwrap();
        let track = share.track.clone().unwrap();
        mgr.release_screen_capture(&mut share);
        mgr.release_screen_capture(&mut share);
        assert!(!track.is_live());
        assert!(share.track.is_none());
        assert!(!share.active);
    }

    #[tokio::test]
    async fn ended_resolves_after_stop() {
        let track = MediaTrack::new(TrackKind::Video, "screen");
        let waiter = {
            let track = track.clone();
            tokio::spawn(async move { track.ended().await })
        };
        assert!(track.stop());
        assert!(!track.stop());
        waiter.await.unwrap();
    }
}
