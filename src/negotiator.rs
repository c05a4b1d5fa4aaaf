//! Call negotiation state machine.
//!
//! All session state lives in one [`CallSession`] behind a mutex that is never
//! held across an `.await`. Transitions suspend at their async steps (capture,
//! transport creation, description exchange); after each step the session id
//! and phase are checked again, and a result that belongs to a session which
//! has since been ended is released and reported as [`CallError::Cancelled`].

use crate::config::{AnswerMode, CallConfig};
use crate::error::{
    CallError, CallResult, MediaAcquisitionError, NegotiationStep, TransportError,
};
use crate::peer::connection::{PeerTransport, TransportEvent, TransportFactory};
use crate::peer::ice::{analyze_candidates, apply_candidate, Admission, CandidateBuffer, EarlyCandidates};
use crate::peer::media::{LocalMediaState, MediaConstraints, MediaDevices, MediaSourceManager};
use crate::peer::state::{CallEvent, CallSnapshot, RejectReason, StateHub};
use crate::peer::types::{CallPhase, CallRole, IceCandidate, OutgoingStage, SessionDescription};
use crate::session::{CallSession, IncomingCallOffer, SessionId};
use crate::signaling::{SignalMessage, SignalSender};
use crate::utils::lock;
use chrono::Utc;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

const OFFERING: CallPhase = CallPhase::Outgoing(OutgoingStage::Offering);
const AWAITING_ANSWER: CallPhase = CallPhase::Outgoing(OutgoingStage::AwaitingAnswer);

struct Shared {
    session: CallSession,
    next_id: SessionId,
    early: EarlyCandidates,
    screen_pending: bool,
}

impl Shared {
    /// Swap in a fresh idle session and hand back the old one for teardown
    fn replace_session(&mut self) -> CallSession {
        self.next_id += 1;
        self.screen_pending = false;
        std::mem::replace(&mut self.session, CallSession::new(self.next_id))
    }
}

struct Inner {
    answer_mode: AnswerMode,
    constraints: MediaConstraints,
    media: MediaSourceManager,
    transports: Arc<dyn TransportFactory>,
    signal: Arc<dyn SignalSender>,
    hub: StateHub,
    state: Mutex<Shared>,
}

/// Handle to the negotiator; clones share the same session
#[derive(Clone)]
pub struct Negotiator {
    inner: Arc<Inner>,
}

impl Negotiator {
    pub fn new(
        config: &CallConfig,
        devices: Arc<dyn MediaDevices>,
        transports: Arc<dyn TransportFactory>,
        signal: Arc<dyn SignalSender>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                answer_mode: config.answer_mode,
                constraints: config.media,
                media: MediaSourceManager::new(devices),
                transports,
                signal,
                hub: StateHub::new(),
                state: Mutex::new(Shared {
                    session: CallSession::new(0),
                    next_id: 0,
                    early: EarlyCandidates::new(config.max_early_candidates),
                    screen_pending: false,
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, Shared> {
        lock(&self.inner.state)
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.inner.hub.snapshot()
    }

    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.inner.hub.watch()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.hub.subscribe()
    }

    pub fn phase(&self) -> CallPhase {
        self.state().session.phase
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state().session.local_description.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state().session.remote_description.clone()
    }

    /// Remote candidates still waiting for the remote description
    pub fn pending_candidates(&self) -> usize {
        self.state().session.candidates.len()
    }

    /// Start an outgoing call. Only valid while idle.
    pub async fn start_call(&self) -> CallResult<()> {
        let id = {
            let mut st = self.state();
            let phase = st.session.phase;
            if phase != CallPhase::Idle {
                return Err(CallError::InvalidState {
                    action: "start call",
                    phase,
                });
            }
            st.replace_session();
            st.early.clear();
            st.session.role = CallRole::Caller;
            st.session.phase = OFFERING;
            self.inner.hub.publish(&st.session);
            st.session.id
        };
        info!("Starting call {id}");

        let media = match self
            .inner
            .media
            .acquire_local_media(&self.inner.constraints)
            .await
        {
            Ok(media) => media,
            Err(e) => {
                warn!("Media acquisition failed, call {id} not started: {e}");
                self.roll_back(id, OFFERING, None);
                return Err(e.into());
            }
        };
        self.adopt_media(id, OFFERING, media)?;

        let transport = match self.open_transport(id, OFFERING).await {
            Ok(transport) => transport,
            Err(e) => {
                if !matches!(e, CallError::Cancelled) {
                    self.roll_back(id, OFFERING, None);
                }
                return Err(e);
            }
        };
        self.attach_tracks(id, OFFERING, &transport).await?;

        let offer = self
            .step(id, OFFERING, NegotiationStep::CreateOffer, transport.create_offer())
            .await?;
        self.step(
            id,
            OFFERING,
            NegotiationStep::SetLocalDescription,
            transport.set_local_description(offer.clone()),
        )
        .await?;
        {
            let mut st = self.current(id, OFFERING)?;
            st.session.set_local_description(offer.clone());
        }

        self.send_signal(id, OFFERING, SignalMessage::Offer(offer))
            .await?;

        let mut st = self.current(id, OFFERING)?;
        st.session.phase = AWAITING_ANSWER;
        self.inner.hub.publish(&st.session);
        info!("Call {id}: offer sent, awaiting answer");
        Ok(())
    }

    /// Handle an offer from the relay
    pub async fn receive_offer(&self, offer: SessionDescription) -> CallResult<()> {
        let auto_accept = self.inner.answer_mode == AnswerMode::AutoAccept;
        let (id, incoming) = {
            let mut st = self.state();
            let phase = st.session.phase;
            if phase == CallPhase::Ended {
                return Err(CallError::InvalidState {
                    action: "receive offer",
                    phase,
                });
            }
            if phase != CallPhase::Idle {
                if is_duplicate_offer(&st.session, &offer) {
                    debug!("Ignoring repeated delivery of the current offer");
                    return Ok(());
                }
                warn!("Glare: offer received while {phase:?}, rejecting it");
                self.inner.hub.emit(CallEvent::OfferRejected(RejectReason::Glare));
                return Err(CallError::Glare(phase));
            }

            let early = st.early.take();
            st.replace_session();
            if !early.is_empty() {
                debug!("Adopting {} early candidates", early.len());
                st.session.candidates = CandidateBuffer::with_pending(early);
            }
            st.session.role = CallRole::Callee;
            let incoming = IncomingCallOffer {
                offer,
                received_at: Utc::now(),
            };
            if auto_accept {
                st.session.answering_offer = Some(incoming.offer.clone());
                st.session.phase = CallPhase::Answering;
            } else {
                st.session.incoming = Some(incoming.clone());
                st.session.phase = CallPhase::IncomingRinging;
            }
            self.inner.hub.publish(&st.session);
            (st.session.id, incoming)
        };

        if auto_accept {
            info!("Call {id}: auto-accepting incoming offer");
            return self.answer(id, incoming, false).await;
        }
        info!("Call {id}: incoming offer, ringing");
        self.inner.hub.emit(CallEvent::IncomingCall {
            received_at: incoming.received_at,
        });
        self.inner.hub.emit(CallEvent::RingbackStarted);
        Ok(())
    }

    /// Accept the ringing offer
    pub async fn accept_call(&self) -> CallResult<()> {
        let (id, incoming) = {
            let mut st = self.state();
            let phase = st.session.phase;
            let incoming = match (phase, st.session.incoming.take()) {
                (CallPhase::IncomingRinging, Some(incoming)) => incoming,
                (_, kept) => {
                    st.session.incoming = kept;
                    return Err(CallError::InvalidState {
                        action: "accept call",
                        phase,
                    });
                }
            };
            st.session.answering_offer = Some(incoming.offer.clone());
            st.session.phase = CallPhase::Answering;
            self.inner.hub.publish(&st.session);
            (st.session.id, incoming)
        };
        self.inner.hub.emit(CallEvent::RingbackStopped);
        info!("Call {id}: accepted");
        self.answer(id, incoming, true).await
    }

    /// Turn down the ringing offer; nothing was allocated for it
    pub fn reject_call(&self) -> CallResult<()> {
        let old = {
            let mut st = self.state();
            let phase = st.session.phase;
            if phase != CallPhase::IncomingRinging {
                return Err(CallError::InvalidState {
                    action: "reject call",
                    phase,
                });
            }
            st.early.clear();
            let old = st.replace_session();
            self.inner.hub.publish(&st.session);
            old
        };
        old.candidates.clear();
        info!("Call {}: incoming offer rejected", old.id);
        self.inner.hub.emit(CallEvent::RingbackStopped);
        self.inner
            .hub
            .emit(CallEvent::OfferRejected(RejectReason::Declined));
        Ok(())
    }

    /// Handle an answer from the relay. Outside `AwaitingAnswer` it is stale and ignored.
    pub async fn receive_answer(&self, answer: SessionDescription) -> CallResult<()> {
        let (id, transport) = {
            let mut st = self.state();
            let phase = st.session.phase;
            if phase != AWAITING_ANSWER {
                warn!("Ignoring answer received while {phase:?} (stale or duplicate)");
                return Ok(());
            }
            if !st.session.set_remote_description(answer.clone()) {
                debug!("Ignoring answer: one is already being applied");
                return Ok(());
            }
            let Some(transport) = st.session.transport.clone() else {
                st.session.remote_description = None;
                return Err(CallError::InvalidState {
                    action: "receive answer",
                    phase,
                });
            };
            (st.session.id, transport)
        };

        let applied = self
            .step(
                id,
                AWAITING_ANSWER,
                NegotiationStep::SetRemoteDescription,
                transport.set_remote_description(answer),
            )
            .await;
        let buffer = {
            let mut st = self.current(id, AWAITING_ANSWER)?;
            if let Err(e) = applied {
                // allow a retransmitted answer to try again
                st.session.remote_description = None;
                return Err(e);
            }
            st.session.remote_description_applied = true;
            self.inner.hub.publish(&st.session);
            st.session.candidates.clone()
        };
        let report = buffer.drain_into(transport.as_ref()).await;
        if report.failed > 0 {
            warn!(
                "Call {id}: {} of {} buffered candidates were rejected",
                report.failed,
                report.applied + report.failed
            );
        }

        let mut st = self.current(id, AWAITING_ANSWER)?;
        st.session.phase = CallPhase::Active;
        self.inner.hub.publish(&st.session);
        info!("Call {id}: answer applied, call active");
        Ok(())
    }

    /// Handle a remote ICE candidate
    pub async fn receive_candidate(&self, candidate: IceCandidate) -> CallResult<()> {
        let (admission, transport) = {
            let mut st = self.state();
            match st.session.phase {
                CallPhase::Ended => {
                    return Err(CallError::InvalidState {
                        action: "receive candidate",
                        phase: CallPhase::Ended,
                    })
                }
                CallPhase::Idle => {
                    st.early.push(candidate);
                    debug!(
                        "Candidate arrived before any offer, holding it ({} held)",
                        st.early.len()
                    );
                    return Ok(());
                }
                _ => (
                    st.session.candidates.admit(candidate),
                    st.session.transport.clone(),
                ),
            }
        };

        match (admission, transport) {
            (Admission::Buffered(pending), _) => {
                debug!("Remote description not set yet, queued candidate ({pending} pending)");
            }
            (Admission::Apply(candidate), Some(transport)) => {
                apply_candidate(transport.as_ref(), candidate).await;
            }
            (Admission::Apply(_), None) => {
                warn!("Dropping candidate: session has no transport");
            }
        }
        Ok(())
    }

    /// Hang up: release everything and go back to idle
    pub async fn end_call(&self) -> CallResult<()> {
        let old = {
            let mut st = self.state();
            let phase = st.session.phase;
            if !phase.is_live() {
                return Err(CallError::InvalidState {
                    action: "end call",
                    phase,
                });
            }
            st.early.clear();
            let old = st.replace_session();
            self.inner.hub.publish(&st.session);
            old
        };
        if old.phase == CallPhase::IncomingRinging {
            self.inner.hub.emit(CallEvent::RingbackStopped);
        }
        info!("Call {}: ended from {:?}", old.id, old.phase);
        self.teardown(old).await;
        Ok(())
    }

    /// Host teardown. Terminal: every later action fails with `InvalidState`.
    pub async fn shutdown(&self) {
        let old = {
            let mut st = self.state();
            if st.session.phase == CallPhase::Ended {
                return;
            }
            st.early.clear();
            let old = st.replace_session();
            st.session.phase = CallPhase::Ended;
            self.inner.hub.publish(&st.session);
            old
        };
        if old.phase == CallPhase::IncomingRinging {
            self.inner.hub.emit(CallEvent::RingbackStopped);
        }
        self.teardown(old).await;
        info!("Negotiator shut down");
    }

    /// Start or stop sharing the screen. Returns whether sharing is now on.
    pub async fn toggle_screen_share(&self) -> CallResult<bool> {
        let (id, sharing) = {
            let mut st = self.state();
            let phase = st.session.phase;
            if phase != CallPhase::Active || st.screen_pending {
                return Err(CallError::InvalidState {
                    action: "toggle screen share",
                    phase,
                });
            }
            let sharing = st.session.screen.active;
            if !sharing {
                st.screen_pending = true;
            }
            (st.session.id, sharing)
        };
        if sharing {
            self.stop_screen_share(id, None).await?;
            Ok(false)
        } else {
            self.start_screen_share(id).await?;
            Ok(true)
        }
    }

    /// Returns whether the flag was applied (false without local media)
    pub fn set_audio_enabled(&self, on: bool) -> bool {
        let mut st = self.state();
        let applied = st.session.media.set_audio_enabled(on);
        if applied {
            debug!("Audio {}", if on { "unmuted" } else { "muted" });
            self.inner.hub.publish(&st.session);
        }
        applied
    }

    /// Returns whether the flag was applied (false without local media)
    pub fn set_video_enabled(&self, on: bool) -> bool {
        let mut st = self.state();
        let applied = st.session.media.set_video_enabled(on);
        if applied {
            debug!("Video {}", if on { "on" } else { "off" });
            self.inner.hub.publish(&st.session);
        }
        applied
    }

    // ---------------------------------------------------------------------

    /// Callee half: media, transport, remote offer, candidate flush, answer.
    /// `ring_fallback` restores the ringing offer if capture or transport setup fails.
    async fn answer(
        &self,
        id: SessionId,
        incoming: IncomingCallOffer,
        ring_fallback: bool,
    ) -> CallResult<()> {
        let answering = CallPhase::Answering;
        let fallback = ring_fallback.then(|| incoming.clone());

        let media = match self
            .inner
            .media
            .acquire_local_media(&self.inner.constraints)
            .await
        {
            Ok(media) => media,
            Err(e) => {
                warn!("Media acquisition failed, call {id} not answered: {e}");
                self.roll_back(id, answering, fallback);
                return Err(e.into());
            }
        };
        self.adopt_media(id, answering, media)?;

        let transport = match self.open_transport(id, answering).await {
            Ok(transport) => transport,
            Err(e) => {
                if !matches!(e, CallError::Cancelled) {
                    self.roll_back(id, answering, fallback);
                }
                return Err(e);
            }
        };
        self.attach_tracks(id, answering, &transport).await?;

        let offer = incoming.offer;
        self.step(
            id,
            answering,
            NegotiationStep::SetRemoteDescription,
            transport.set_remote_description(offer.clone()),
        )
        .await?;
        let buffer = {
            let mut st = self.current(id, answering)?;
            st.session.answering_offer = None;
            st.session.set_remote_description(offer);
            st.session.remote_description_applied = true;
            self.inner.hub.publish(&st.session);
            st.session.candidates.clone()
        };
        let report = buffer.drain_into(transport.as_ref()).await;
        if report.failed > 0 {
            warn!(
                "Call {id}: {} of {} buffered candidates were rejected",
                report.failed,
                report.applied + report.failed
            );
        }
        self.current(id, answering)?;

        let answer = self
            .step(id, answering, NegotiationStep::CreateAnswer, transport.create_answer())
            .await?;
        self.step(
            id,
            answering,
            NegotiationStep::SetLocalDescription,
            transport.set_local_description(answer.clone()),
        )
        .await?;
        {
            let mut st = self.current(id, answering)?;
            st.session.set_local_description(answer.clone());
        }

        self.send_signal(id, answering, SignalMessage::Answer(answer))
            .await?;

        let mut st = self.current(id, answering)?;
        st.session.phase = CallPhase::Active;
        self.inner.hub.publish(&st.session);
        info!("Call {id}: answer sent, call active");
        Ok(())
    }

    /// Lock and confirm the session is still `id` in `phase`
    fn current(&self, id: SessionId, phase: CallPhase) -> CallResult<MutexGuard<'_, Shared>> {
        let st = self.state();
        if st.session.is_current(id, phase) {
            Ok(st)
        } else {
            debug!("Call {id} moved on while a step was outstanding");
            Err(CallError::Cancelled)
        }
    }

    /// Await one negotiation step, then check the session is still ours
    async fn step<T>(
        &self,
        id: SessionId,
        phase: CallPhase,
        step: NegotiationStep,
        fut: impl Future<Output = Result<T, TransportError>>,
    ) -> CallResult<T> {
        let result = fut.await;
        drop(self.current(id, phase)?);
        result.map_err(|e| {
            error!("Call {id}: {step} failed: {e}");
            self.inner.hub.emit(CallEvent::NegotiationFailed(step));
            CallError::negotiation(step, e)
        })
    }

    async fn send_signal(
        &self,
        id: SessionId,
        phase: CallPhase,
        message: SignalMessage,
    ) -> CallResult<()> {
        let kind = message.kind();
        let sent = self.inner.signal.send(message).await;
        drop(self.current(id, phase)?);
        sent.map_err(|e| {
            error!("Call {id}: sending {kind} failed: {e}");
            CallError::Signaling(e)
        })
    }

    fn adopt_media(
        &self,
        id: SessionId,
        phase: CallPhase,
        mut media: LocalMediaState,
    ) -> CallResult<()> {
        match self.current(id, phase) {
            Ok(mut st) => {
                st.session.media = media;
                self.inner.hub.publish(&st.session);
                Ok(())
            }
            Err(e) => {
                warn!("Call {id} ended during media acquisition, releasing late capture");
                self.inner.media.release_local_media(&mut media);
                Err(e)
            }
        }
    }

    async fn open_transport(
        &self,
        id: SessionId,
        phase: CallPhase,
    ) -> CallResult<Arc<dyn PeerTransport>> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let created = self.inner.transports.create(events_tx).await;

        let stale = match (self.current(id, phase), &created) {
            (Ok(mut st), Ok(transport)) => {
                st.session.transport = Some(transport.clone());
                false
            }
            (Ok(_), Err(_)) => false,
            (Err(_), _) => true,
        };
        let transport = match created {
            Ok(transport) => transport,
            Err(_) if stale => return Err(CallError::Cancelled),
            Err(e) => {
                let step = NegotiationStep::CreateTransport;
                error!("Call {id}: {step} failed: {e}");
                self.inner.hub.emit(CallEvent::NegotiationFailed(step));
                return Err(CallError::negotiation(step, e));
            }
        };
        if stale {
            warn!("Call {id} ended during transport setup, closing it");
            if let Err(e) = transport.close().await {
                debug!("Closing late transport failed: {e}");
            }
            return Err(CallError::Cancelled);
        }

        self.spawn_event_pump(id, events_rx);
        Ok(transport)
    }

    async fn attach_tracks(
        &self,
        id: SessionId,
        phase: CallPhase,
        transport: &Arc<dyn PeerTransport>,
    ) -> CallResult<()> {
        let tracks: Vec<_> = {
            let st = self.current(id, phase)?;
            st.session.media.tracks().cloned().collect()
        };
        for track in &tracks {
            self.step(id, phase, NegotiationStep::AttachTracks, transport.add_track(track))
                .await?;
        }
        debug!("Call {id}: attached {} local tracks", tracks.len());
        Ok(())
    }

    /// Undo a half-started transition: release capture, then either go back to
    /// ringing with the offer or drop the session.
    fn roll_back(&self, id: SessionId, phase: CallPhase, ringing: Option<IncomingCallOffer>) {
        let mut media = {
            let Ok(mut st) = self.current(id, phase) else {
                return;
            };
            let media = std::mem::take(&mut st.session.media);
            let restored = ringing.is_some();
            match ringing {
                Some(incoming) => {
                    st.session.answering_offer = None;
                    st.session.incoming = Some(incoming);
                    st.session.phase = CallPhase::IncomingRinging;
                }
                None => {
                    let old = st.replace_session();
                    old.candidates.clear();
                }
            }
            self.inner.hub.publish(&st.session);
            if restored {
                self.inner.hub.emit(CallEvent::RingbackStarted);
            }
            media
        };
        self.inner.media.release_local_media(&mut media);
    }

    async fn teardown(&self, mut old: CallSession) {
        self.inner.media.release_screen_capture(&mut old.screen);
        self.inner.media.release_local_media(&mut old.media);
        old.candidates.clear();
        old.incoming = None;
        if let Some(transport) = old.transport.take() {
            if let Err(e) = transport.close().await {
                warn!("Closing transport of call {} failed: {e}", old.id);
            }
        }
        debug!("Call {} torn down", old.id);
    }

    async fn start_screen_share(&self, id: SessionId) -> CallResult<()> {
        let acquired = self.inner.media.acquire_screen_capture().await;
        {
            let mut st = self.state();
            if st.session.id == id {
                st.screen_pending = false;
            }
        }
        let mut share = acquired?;

        let screen = match share.track.clone() {
            Some(track) => track,
            None => return Err(MediaAcquisitionError::Unsupported.into()),
        };
        let transport = match self.current(id, CallPhase::Active) {
            Ok(st) => st.session.transport.clone(),
            Err(e) => {
                self.inner.media.release_screen_capture(&mut share);
                return Err(e);
            }
        };
        let Some(transport) = transport else {
            self.inner.media.release_screen_capture(&mut share);
            return Err(CallError::Cancelled);
        };

        let replaced = transport.replace_video_track(Some(&screen)).await;
        {
            match self.current(id, CallPhase::Active) {
                Ok(mut st) => match replaced {
                    Ok(()) => {
                        share.camera = st.session.media.video.clone();
                        share.active = true;
                        st.session.screen = share;
                        self.inner.hub.publish(&st.session);
                    }
                    Err(e) => {
                        drop(st);
                        self.inner.media.release_screen_capture(&mut share);
                        error!("Call {id}: replacing video with screen failed: {e}");
                        self.inner
                            .hub
                            .emit(CallEvent::NegotiationFailed(NegotiationStep::ReplaceTrack));
                        return Err(CallError::negotiation(NegotiationStep::ReplaceTrack, e));
                    }
                },
                Err(e) => {
                    self.inner.media.release_screen_capture(&mut share);
                    return Err(e);
                }
            }
        }
        info!("Call {id}: screen sharing started");

        // the OS "stop sharing" control ends the track underneath us
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let track_id = screen.id().to_owned();
        tokio::spawn(async move {
            screen.ended().await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let negotiator = Negotiator { inner };
            if let Err(e) = negotiator.stop_screen_share(id, Some(&track_id)).await {
                warn!("Restoring camera after screen share ended failed: {e}");
            }
        });
        Ok(())
    }

    /// Stop sharing and put the camera back. With `only_track`, act only if that
    /// track is still the one being shared.
    async fn stop_screen_share(&self, id: SessionId, only_track: Option<&str>) -> CallResult<()> {
        let (mut share, transport) = {
            let mut st = self.state();
            let screen = &st.session.screen;
            let matches = match (only_track, &screen.track) {
                (Some(wanted), Some(track)) => track.id() == wanted,
                (Some(_), None) => false,
                (None, _) => true,
            };
            if st.session.id != id || !screen.active || !matches {
                return Ok(());
            }
            let share = std::mem::take(&mut st.session.screen);
            self.inner.hub.publish(&st.session);
            (share, st.session.transport.clone())
        };

        let camera = share.camera.take();
        self.inner.media.release_screen_capture(&mut share);
        self.inner.hub.emit(CallEvent::ScreenShareEnded);
        info!(
            "Call {id}: screen sharing stopped, restoring {}",
            if camera.is_some() { "camera" } else { "empty video" }
        );

        if let Some(transport) = transport {
            transport
                .replace_video_track(camera.as_ref())
                .await
                .map_err(|e| {
                    error!("Call {id}: restoring camera failed: {e}");
                    self.inner
                        .hub
                        .emit(CallEvent::NegotiationFailed(NegotiationStep::ReplaceTrack));
                    CallError::negotiation(NegotiationStep::ReplaceTrack, e)
                })?;
        }
        Ok(())
    }

    fn spawn_event_pump(&self, id: SessionId, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut gathered = Vec::new();
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let current = lock(&inner.state).session.id;
                if current != id {
                    debug!("Dropping transport event of ended call {id}");
                    break;
                }
                match event {
                    TransportEvent::LocalCandidate(candidate) => {
                        gathered.push(candidate.clone());
                        if let Err(e) = inner
                            .signal
                            .send(SignalMessage::IceCandidate(candidate))
                            .await
                        {
                            warn!("Call {id}: sending local candidate failed: {e}");
                        }
                    }
                    TransportEvent::GatheringComplete => {
                        analyze_candidates(&gathered);
                    }
                    TransportEvent::Connection(health) => {
                        inner.hub.emit(CallEvent::Connection(health));
                    }
                    TransportEvent::RemoteTrack { id: track_id, kind } => {
                        inner.hub.emit(CallEvent::RemoteTrack { id: track_id, kind });
                    }
                }
            }
        });
    }
}

/// A relay may redeliver the offer the session is already handling
fn is_duplicate_offer(session: &CallSession, offer: &SessionDescription) -> bool {
    if session.role != CallRole::Callee {
        return false;
    }
    let ringing = session.incoming.as_ref().map(|o| &o.offer);
    ringing == Some(offer)
        || session.answering_offer.as_ref() == Some(offer)
        || session.remote_description.as_ref() == Some(offer)
}
