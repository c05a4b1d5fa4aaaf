use crate::peer::connection::PeerTransport;
use crate::peer::ice::CandidateBuffer;
use crate::peer::media::{LocalMediaState, ScreenShareState};
use crate::peer::types::{CallPhase, CallRole, SessionDescription};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Identity of a session; bumped for every new call so late async results can be recognised
pub type SessionId = u64;

/// An offer waiting for the user to accept or reject it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCallOffer {
    pub offer: SessionDescription,
    pub received_at: DateTime<Utc>,
}

/// The single negotiation context owned by the negotiator
pub struct CallSession {
    pub id: SessionId,
    pub role: CallRole,
    pub phase: CallPhase,
    pub local_description: Option<SessionDescription>,
    pub remote_description: Option<SessionDescription>,
    pub remote_description_applied: bool,
    pub incoming: Option<IncomingCallOffer>,
    /// Offer taken off `incoming` by accept, until it becomes the remote description
    pub answering_offer: Option<SessionDescription>,
    pub(crate) transport: Option<Arc<dyn PeerTransport>>,
    pub(crate) media: LocalMediaState,
    pub(crate) screen: ScreenShareState,
    pub(crate) candidates: CandidateBuffer,
}

impl CallSession {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            role: CallRole::None,
            phase: CallPhase::Idle,
            local_description: None,
            remote_description: None,
            remote_description_applied: false,
            incoming: None,
            answering_offer: None,
            transport: None,
            media: LocalMediaState::default(),
            screen: ScreenShareState::default(),
            candidates: CandidateBuffer::new(),
        }
    }

    /// Records the local description; a session gets exactly one.
    pub fn set_local_description(&mut self, desc: SessionDescription) -> bool {
        if self.local_description.is_some() {
            return false;
        }
        self.local_description = Some(desc);
        true
    }

    /// Records the remote description; a session gets exactly one.
    pub fn set_remote_description(&mut self, desc: SessionDescription) -> bool {
        if self.remote_description.is_some() {
            return false;
        }
        self.remote_description = Some(desc);
        true
    }

    /// Whether `id` still names this session in `phase`
    pub fn is_current(&self, id: SessionId, phase: CallPhase) -> bool {
        self.id == id && self.phase == phase
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("phase", &self.phase)
            .field("remote_description_applied", &self.remote_description_applied)
            .field("has_transport", &self.transport.is_some())
            .field("pending_candidates", &self.candidates.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptions_are_set_once() {
        let mut session = CallSession::new(1);
        assert!(session.set_remote_description(SessionDescription::offer("a")));
        assert!(!session.set_remote_description(SessionDescription::offer("b")));
        assert_eq!(session.remote_description.as_ref().unwrap().sdp, "a");

        assert!(session.set_local_description(SessionDescription::answer("c")));
        assert!(!session.set_local_description(SessionDescription::answer("d")));
    }

    #[test]
    fn identity_check_uses_id_and_phase() {
        let session = CallSession::new(7);
        assert!(session.is_current(7, CallPhase::Idle));
        assert!(!session.is_current(8, CallPhase::Idle));
        assert!(!session.is_current(7, CallPhase::Active));
    }
}
