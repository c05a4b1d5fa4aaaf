pub mod config;
pub mod controller;
pub mod error;
pub mod logger;
pub mod negotiator;
pub mod peer;
pub mod session;
pub mod signaling;
mod utils;

pub use config::{AnswerMode, CallConfig};
pub use controller::CallController;
pub use error::{CallError, CallResult, MediaAcquisitionError, NegotiationStep};
pub use negotiator::Negotiator;
pub use peer::{CallEvent, CallPhase, CallRole, CallSnapshot, IceCandidate, SessionDescription};
pub use signaling::{SignalEnvelope, SignalMessage, SignalSender, SignalingGateway};
