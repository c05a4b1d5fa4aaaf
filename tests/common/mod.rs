#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use vidcall_lib::config::{AnswerMode, CallConfig};
use vidcall_lib::error::{MediaAcquisitionError, SignalingError, TransportError};
use vidcall_lib::negotiator::Negotiator;
use vidcall_lib::peer::connection::{PeerTransport, TransportEvent, TransportFactory};
use vidcall_lib::peer::media::{MediaConstraints, MediaDevices, MediaTrack};
use vidcall_lib::peer::types::{IceCandidate, SessionDescription, TrackKind};
use vidcall_lib::signaling::{SignalEnvelope, SignalMessage, SignalSender};

/// Camera/mic/screen that hand out fake tracks
#[derive(Default)]
pub struct FakeDevices {
    fail: Mutex<Option<MediaAcquisitionError>>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
    started: Notify,
    screen_gate: Mutex<Option<oneshot::Receiver<()>>>,
    screen_started: Notify,
    issued: Mutex<Vec<MediaTrack>>,
    screens: Mutex<Vec<MediaTrack>>,
}

impl FakeDevices {
    pub fn fail_with(&self, err: MediaAcquisitionError) {
        *self.fail.lock().unwrap() = Some(err);
    }

    pub fn succeed(&self) {
        *self.fail.lock().unwrap() = None;
    }

    /// The next camera/mic request blocks until the returned sender fires
    pub fn hold(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.gate.lock().unwrap() = Some(rx);
        tx
    }

    /// Resolves once a camera/mic request has begun
    pub async fn requested(&self) {
        self.started.notified().await;
    }

    /// The next screen capture request blocks until the returned sender fires
    pub fn hold_screen(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.screen_gate.lock().unwrap() = Some(rx);
        tx
    }

    /// Resolves once a screen capture request has begun
    pub async fn screen_requested(&self) {
        self.screen_started.notified().await;
    }

    pub fn issued(&self) -> Vec<MediaTrack> {
        self.issued.lock().unwrap().clone()
    }

    pub fn last_screen(&self) -> Option<MediaTrack> {
        self.screens.lock().unwrap().last().cloned()
    }

    pub fn all_released(&self) -> bool {
        self.issued.lock().unwrap().iter().all(|t| !t.is_live())
            && self.screens.lock().unwrap().iter().all(|t| !t.is_live())
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<MediaTrack>, MediaAcquisitionError> {
        self.started.notify_one();
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if let Some(err) = self.fail.lock().unwrap().clone() {
            return Err(err);
        }
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack::new(TrackKind::Audio, "fake mic"));
        }
        if constraints.video {
            tracks.push(MediaTrack::new(TrackKind::Video, "fake camera"));
        }
        self.issued.lock().unwrap().extend(tracks.iter().cloned());
        Ok(tracks)
    }

    async fn get_display_media(&self) -> Result<MediaTrack, MediaAcquisitionError> {
        self.screen_started.notify_one();
        let gate = self.screen_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if let Some(err) = self.fail.lock().unwrap().clone() {
            return Err(err);
        }
        let track = MediaTrack::new(TrackKind::Video, "fake screen");
        self.screens.lock().unwrap().push(track.clone());
        Ok(track)
    }
}

/// Transport that records what the negotiator asked of it
#[derive(Default)]
pub struct FakeTransport {
    calls: Mutex<Vec<String>>,
    candidates: Mutex<Vec<String>>,
    video: Mutex<Vec<Option<String>>>,
    closed: AtomicBool,
    fail_step: Option<&'static str>,
}

impl FakeTransport {
    fn record(&self, call: impl Into<String>) -> Result<(), TransportError> {
        let call = call.into();
        let failing = self.fail_step.is_some_and(|step| call.starts_with(step));
        self.calls.lock().unwrap().push(call.clone());
        if failing {
            return Err(TransportError::Other(format!("{call} refused")));
        }
        Ok(())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Candidate strings, in the order they were applied
    pub fn candidates(&self) -> Vec<String> {
        self.candidates.lock().unwrap().clone()
    }

    /// Every replace_video_track call: the track id, or None for empty
    pub fn video_history(&self) -> Vec<Option<String>> {
        self.video.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), TransportError> {
        let kind = match track.kind() {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        };
        self.record(format!("add_track:{kind}"))
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.record("create_offer")?;
        Ok(SessionDescription::offer("v=0 fake-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.record("create_answer")?;
        Ok(SessionDescription::answer("v=0 fake-answer"))
    }

    async fn set_local_description(&self, _: SessionDescription) -> Result<(), TransportError> {
        self.record("set_local")
    }

    async fn set_remote_description(&self, _: SessionDescription) -> Result<(), TransportError> {
        self.record("set_remote")
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.record(format!("candidate:{}", candidate.candidate))?;
        if candidate.candidate.contains("bad") {
            return Err(TransportError::Other("malformed candidate".into()));
        }
        self.candidates.lock().unwrap().push(candidate.candidate);
        Ok(())
    }

    async fn replace_video_track(&self, track: Option<&MediaTrack>) -> Result<(), TransportError> {
        self.record("replace_video")?;
        self.video
            .lock()
            .unwrap()
            .push(track.map(|t| t.id().to_owned()));
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeFactory {
    created: Mutex<Vec<Arc<FakeTransport>>>,
    events: Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
    fail_create: AtomicBool,
    fail_step: Mutex<Option<&'static str>>,
    attempts: AtomicUsize,
}

impl FakeFactory {
    pub fn fail_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    /// Transports created from now on fail calls starting with `step`
    pub fn fail_step(&self, step: &'static str) {
        *self.fail_step.lock().unwrap() = Some(step);
    }

    pub fn created(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn last(&self) -> Arc<FakeTransport> {
        self.created.lock().unwrap().last().cloned().unwrap()
    }

    /// Raise a transport callback on the most recent transport
    pub fn raise(&self, event: TransportEvent) {
        let events = self.events.lock().unwrap();
        events.last().unwrap().send(event).unwrap();
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(TransportError::Other("no ICE agent".into()));
        }
        let transport = Arc::new(FakeTransport {
            fail_step: *self.fail_step.lock().unwrap(),
            ..Default::default()
        });
        self.created.lock().unwrap().push(transport.clone());
        self.events.lock().unwrap().push(events);
        Ok(transport)
    }
}

/// A relay that is down
pub struct DeadRelay;

#[async_trait]
impl SignalSender for DeadRelay {
    async fn send(&self, _: SignalMessage) -> Result<(), SignalingError> {
        Err(SignalingError::Closed)
    }
}

pub struct Peer {
    pub negotiator: Negotiator,
    pub devices: Arc<FakeDevices>,
    pub factory: Arc<FakeFactory>,
    pub outbox: mpsc::UnboundedReceiver<SignalEnvelope>,
}

impl Peer {
    pub fn new(mode: AnswerMode) -> Self {
        let (tx, outbox) = mpsc::unbounded_channel();
        let (negotiator, devices, factory) = build(mode, Arc::new(tx));
        Self {
            negotiator,
            devices,
            factory,
            outbox,
        }
    }

    /// Next message this peer sent to the relay
    pub async fn sent(&mut self) -> SignalMessage {
        tokio::time::timeout(Duration::from_secs(1), self.outbox.recv())
            .await
            .expect("nothing sent within 1s")
            .expect("outbox closed")
            .message
    }

    pub async fn sent_offer(&mut self) -> SessionDescription {
        match self.sent().await {
            SignalMessage::Offer(offer) => offer,
            other => panic!("expected an offer, got {other:?}"),
        }
    }

    pub async fn sent_answer(&mut self) -> SessionDescription {
        match self.sent().await {
            SignalMessage::Answer(answer) => answer,
            other => panic!("expected an answer, got {other:?}"),
        }
    }
}

pub fn build(
    mode: AnswerMode,
    signal: Arc<dyn SignalSender>,
) -> (Negotiator, Arc<FakeDevices>, Arc<FakeFactory>) {
    let config = CallConfig {
        answer_mode: mode,
        ..Default::default()
    };
    let devices = Arc::new(FakeDevices::default());
    let factory = Arc::new(FakeFactory::default());
    let negotiator = Negotiator::new(&config, devices.clone(), factory.clone(), signal);
    (negotiator, devices, factory)
}

pub fn candidate(text: &str) -> IceCandidate {
    IceCandidate::new(text)
}

pub fn offer(sdp: &str) -> SessionDescription {
    SessionDescription::offer(sdp)
}
