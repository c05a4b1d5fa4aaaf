pub mod connection;
pub mod ice;
pub mod media;
pub mod state;
pub mod types;

pub use connection::{
    ConnectionHealth, PeerTransport, TransportEvent, TransportFactory, WebRtcTransport,
    WebRtcTransportFactory,
};
pub use ice::{Admission, CandidateBuffer, DrainReport};
pub use media::{
    LocalMediaState, MediaConstraints, MediaDevices, MediaSourceManager, MediaTrack,
    ScreenShareState,
};
pub use state::{CallEvent, CallSnapshot, RejectReason, StateHub};
pub use types::{
    CallPhase, CallRole, IceCandidate, OutgoingStage, SdpKind, ServerConfig, SessionDescription,
    TrackKind,
};
