use crate::error::NegotiationStep;
use crate::peer::connection::ConnectionHealth;
use crate::peer::types::{CallPhase, CallRole, TrackKind};
use crate::session::CallSession;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};
use tracing::debug;

/// Renderable view of the call
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallSnapshot {
    pub phase: CallPhase,
    pub role: CallRole,
    /// Arrival time of an offer waiting for accept/reject
    pub incoming_offer: Option<DateTime<Utc>>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
    pub remote_description_applied: bool,
}

impl CallSnapshot {
    pub fn of(session: &CallSession) -> Self {
        Self {
            phase: session.phase,
            role: session.role,
            incoming_offer: session.incoming.as_ref().map(|o| o.received_at),
            audio_enabled: session.media.audio_enabled,
            video_enabled: session.media.video_enabled,
            screen_sharing: session.screen.active,
            remote_description_applied: session.remote_description_applied,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// A call was already in progress
    Glare,
    /// The user declined
    Declined,
}

/// Notifications for the presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    PhaseChanged(CallPhase),
    IncomingCall { received_at: DateTime<Utc> },
    RingbackStarted,
    RingbackStopped,
    OfferRejected(RejectReason),
    NegotiationFailed(NegotiationStep),
    ScreenShareEnded,
    RemoteTrack { id: String, kind: TrackKind },
    Connection(ConnectionHealth),
}

/// Publishes snapshots (latest value) and events (stream) to observers
#[derive(Debug, Clone)]
pub struct StateHub {
    snapshot: watch::Sender<CallSnapshot>,
    events: broadcast::Sender<CallEvent>,
}

impl StateHub {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(CallSnapshot {
            audio_enabled: true,
            video_enabled: true,
            ..Default::default()
        });
        let (events, _) = broadcast::channel(64);
        Self { snapshot, events }
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Publish the session's state, announcing a phase change if there was one
    pub fn publish(&self, session: &CallSession) {
        let next = CallSnapshot::of(session);
        let phase_changed = self.snapshot.borrow().phase != next.phase;
        self.snapshot.send_replace(next);
        if phase_changed {
            self.emit(CallEvent::PhaseChanged(session.phase));
        }
    }

    pub fn emit(&self, event: CallEvent) {
        debug!("emit {event:?}");
        // no receivers is fine
        let _ = self.events.send(event);
    }
}

impl Default for StateHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_change_is_announced_once() {
        let hub = StateHub::new();
        let mut events = hub.subscribe();
        let mut session = CallSession::new(1);

        session.phase = CallPhase::IncomingRinging;
        hub.publish(&session);
        hub.publish(&session);

        assert_eq!(
            events.try_recv().unwrap(),
            CallEvent::PhaseChanged(CallPhase::IncomingRinging)
        );
        assert!(events.try_recv().is_err());
        assert_eq!(hub.snapshot().phase, CallPhase::IncomingRinging);
    }
}
