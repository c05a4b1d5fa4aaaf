use crate::peer::types::CallPhase;
use thiserror::Error;

/// Local capture could not be started
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaAcquisitionError {
    #[error("permission to capture media was denied")]
    PermissionDenied,

    #[error("no capture device available: {0}")]
    DeviceUnavailable(String),

    #[error("capture request was cancelled by the user")]
    Cancelled,

    #[error("capture is not supported on this host")]
    Unsupported,
}

/// Failure reported by the peer transport
#[derive(Error, Debug)]
pub enum TransportError {
    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),

    #[error("transport is closed")]
    Closed,

    #[error("no local track with id {0}")]
    UnknownTrack(String),

    #[error("{0}")]
    Other(String),
}

/// The negotiation step that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStep {
    CreateTransport,
    AttachTracks,
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    ReplaceTrack,
}

impl std::fmt::Display for NegotiationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::CreateTransport => "create transport",
            Self::AttachTracks => "attach tracks",
            Self::CreateOffer => "create offer",
            Self::CreateAnswer => "create answer",
            Self::SetLocalDescription => "set local description",
            Self::SetRemoteDescription => "set remote description",
            Self::ReplaceTrack => "replace track",
        };
        f.write_str(name)
    }
}

/// Relay channel failures
#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("relay connect failed: {0}")]
    Connect(String),

    #[error("relay channel is closed")]
    Closed,

    #[error("malformed signaling message: {0}")]
    Codec(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("ICE server URL cannot be empty")]
    EmptyUrl,

    #[error("TURN server {0} requires username and credential")]
    MissingTurnCredentials(String),

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors returned by negotiator actions
#[derive(Error, Debug)]
pub enum CallError {
    #[error(transparent)]
    MediaAcquisition(#[from] MediaAcquisitionError),

    #[error("cannot {action} while {phase:?}")]
    InvalidState {
        action: &'static str,
        phase: CallPhase,
    },

    #[error("negotiation failed at {step}: {source}")]
    Negotiation {
        step: NegotiationStep,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error("incoming offer rejected: a call is already in progress ({0:?})")]
    Glare(CallPhase),

    #[error("call ended while the operation was outstanding")]
    Cancelled,
}

impl CallError {
    pub(crate) fn negotiation(step: NegotiationStep, source: TransportError) -> Self {
        Self::Negotiation { step, source }
    }
}

pub type CallResult<T> = Result<T, CallError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::types::OutgoingStage;

    #[test]
    fn invalid_state_names_action_and_phase() {
        let err = CallError::InvalidState {
            action: "start call",
            phase: CallPhase::Outgoing(OutgoingStage::AwaitingAnswer),
        };
        assert_eq!(
            err.to_string(),
            "cannot start call while Outgoing(AwaitingAnswer)"
        );
    }

    #[test]
    fn negotiation_error_carries_step() {
        let err = CallError::negotiation(NegotiationStep::CreateAnswer, TransportError::Closed);
        assert_eq!(
            err.to_string(),
            "negotiation failed at create answer: transport is closed"
        );
    }
}
