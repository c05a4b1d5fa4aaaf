use crate::config::RelayConfig;
use crate::error::{CallResult, SignalingError};
use crate::negotiator::Negotiator;
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::utils::random_id;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::io::{Read, Write};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Cap for gunzip output, guards against zip bombs
const MAX_DECOMPRESSED_SIZE: u64 = 256 * 1024;

/// Envelope ids remembered for duplicate suppression
const SEEN_WINDOW: usize = 256;

/// Relay messages
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum SignalMessage {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
}

impl SignalMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::IceCandidate(_) => "ice-candidate",
        }
    }
}

/// A message with optional metadata; peers that send bare messages are accepted
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignalEnvelope {
    #[serde(flatten)]
    pub message: SignalMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
}

impl SignalEnvelope {
    pub fn bare(message: SignalMessage) -> Self {
        Self {
            message,
            id: None,
            ts: None,
        }
    }

    /// Tag with a fresh id and the current time
    pub fn stamped(message: SignalMessage) -> Self {
        Self {
            message,
            id: Some(random_id()),
            ts: Some(chrono::Utc::now().timestamp()),
        }
    }

    pub fn to_json(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::Codec(e.to_string()))
    }

    pub fn from_json(s: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(s).map_err(|e| SignalingError::Codec(e.to_string()))
    }

    /// JSON -> gzip -> base64, for relays that carry short opaque strings
    pub fn to_compact(&self) -> Result<String, SignalingError> {
        let json = serde_json::to_vec(self).map_err(|e| SignalingError::Codec(e.to_string()))?;
        let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
        gz.write_all(&json)
            .map_err(|e| SignalingError::Codec(e.to_string()))?;
        let compressed = gz
            .finish()
            .map_err(|e| SignalingError::Codec(e.to_string()))?;
        Ok(general_purpose::STANDARD.encode(compressed))
    }

    pub fn from_compact(s: &str) -> Result<Self, SignalingError> {
        let compressed = general_purpose::STANDARD
            .decode(s.trim())
            .map_err(|e| SignalingError::Codec(e.to_string()))?;

        let gz = GzDecoder::new(&compressed[..]);
        let mut json = Vec::new();
        gz.take(MAX_DECOMPRESSED_SIZE)
            .read_to_end(&mut json)
            .map_err(|e| SignalingError::Codec(e.to_string()))?;

        serde_json::from_slice(&json).map_err(|e| SignalingError::Codec(e.to_string()))
    }
}

/// Text encoding used on the relay
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    #[default]
    Json,
    Compact,
}

impl WireFormat {
    pub fn encode(self, envelope: &SignalEnvelope) -> Result<String, SignalingError> {
        match self {
            Self::Json => envelope.to_json(),
            Self::Compact => envelope.to_compact(),
        }
    }

    pub fn decode(self, text: &str) -> Result<SignalEnvelope, SignalingError> {
        match self {
            Self::Json => SignalEnvelope::from_json(text),
            Self::Compact => SignalEnvelope::from_compact(text),
        }
    }
}

/// Outbound half of the relay
#[async_trait]
pub trait SignalSender: Send + Sync {
    async fn send(&self, message: SignalMessage) -> Result<(), SignalingError>;
}

/// In-process relay: envelopes go to whoever holds the receiver
#[async_trait]
impl SignalSender for mpsc::UnboundedSender<SignalEnvelope> {
    async fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        mpsc::UnboundedSender::send(self, SignalEnvelope::stamped(message))
            .map_err(|_| SignalingError::Closed)
    }
}

/// WebSocket connection to the relay service
pub struct WsRelay {
    outbound: mpsc::UnboundedSender<SignalEnvelope>,
    tasks: Vec<JoinHandle<()>>,
}

impl WsRelay {
    /// Connects and returns the relay plus the stream of inbound envelopes
    pub async fn connect(
        config: &RelayConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalEnvelope>), SignalingError> {
        let (ws_stream, _) = connect_async(config.url.as_str())
            .await
            .map_err(|e| SignalingError::Connect(e.to_string()))?;
        info!("Signaling relay connected: {}", config.url);
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let format = config.wire_format;
        let (outbound, mut send_rx) = mpsc::unbounded_channel::<SignalEnvelope>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<SignalEnvelope>();

        let writer = tokio::spawn(async move {
            while let Some(envelope) = send_rx.recv().await {
                let text = match format.encode(&envelope) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Dropping unencodable {} message: {e}", envelope.message.kind());
                        continue;
                    }
                };
                debug!("ws out: {} ({} bytes)", envelope.message.kind(), text.len());
                if let Err(e) = ws_write.send(Message::Text(text)).await {
                    warn!("Signaling relay send failed: {e}");
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!("Ignoring non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Signaling relay error: {e}");
                        break;
                    }
                };
                match format.decode(&text) {
                    Ok(envelope) => {
                        debug!("ws in: {}", envelope.message.kind());
                        if inbound_tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Ignoring malformed relay frame: {e}"),
                }
            }
            info!("Signaling relay closed");
        });

        Ok((
            Self {
                outbound,
                tasks: vec![writer, reader],
            },
            inbound_rx,
        ))
    }

    pub fn close(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for WsRelay {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl SignalSender for WsRelay {
    async fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        self.outbound
            .send(SignalEnvelope::stamped(message))
            .map_err(|_| SignalingError::Closed)
    }
}

/// Dispatches inbound relay messages into the negotiator, one at a time
pub struct SignalingGateway {
    negotiator: Negotiator,
    seen_order: VecDeque<String>,
    seen: HashSet<String>,
}

impl SignalingGateway {
    pub fn new(negotiator: Negotiator) -> Self {
        Self {
            negotiator,
            seen_order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// True the first time an envelope id is seen; id-less envelopes always pass
    fn first_delivery(&mut self, envelope: &SignalEnvelope) -> bool {
        let Some(id) = &envelope.id else {
            return true;
        };
        if self.seen.contains(id) {
            return false;
        }
        if self.seen_order.len() == SEEN_WINDOW {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen.remove(&old);
            }
        }
        self.seen_order.push_back(id.clone());
        self.seen.insert(id.clone());
        true
    }

    pub async fn dispatch(&mut self, envelope: SignalEnvelope) -> CallResult<()> {
        if !self.first_delivery(&envelope) {
            debug!(
                "Dropping duplicate {} delivery {:?}",
                envelope.message.kind(),
                envelope.id
            );
            return Ok(());
        }
        match envelope.message {
            SignalMessage::Offer(offer) => self.negotiator.receive_offer(offer).await,
            SignalMessage::Answer(answer) => self.negotiator.receive_answer(answer).await,
            SignalMessage::IceCandidate(candidate) => {
                self.negotiator.receive_candidate(candidate).await
            }
        }
    }

    /// Runs until the relay's inbound stream ends
    pub async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<SignalEnvelope>) {
        while let Some(envelope) = inbound.recv().await {
            let kind = envelope.message.kind();
            if let Err(e) = self.dispatch(envelope).await {
                warn!("Handling inbound {kind} failed: {e}");
            }
        }
        info!("Signaling gateway stopped: relay stream ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn offer_wire_shape() {
        let env = SignalEnvelope::bare(SignalMessage::Offer(SessionDescription::offer("v=0")));
        let json = env.to_json().unwrap();
        assert_eq!(json, r#"{"type":"offer","payload":{"type":"offer","sdp":"v=0"}}"#);
    }

    #[test]
    fn candidate_message_is_kebab_tagged() {
        let json = r#"{"type":"ice-candidate","payload":{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0},"id":"abc","ts":1700000000}"#;
        let env = SignalEnvelope::from_json(json).unwrap();
        assert_eq!(env.id.as_deref(), Some("abc"));
        assert_eq!(env.ts, Some(1_700_000_000));
        match env.message {
            SignalMessage::IceCandidate(c) => assert_eq!(c.sdp_mline_index, Some(0)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn compact_format_decodes_what_it_encodes() {
        let env = SignalEnvelope::stamped(SignalMessage::Answer(SessionDescription::answer(
            "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\n".repeat(20),
        )));
        let text = WireFormat::Compact.encode(&env).unwrap();
        assert!(text.len() < env.to_json().unwrap().len());
        assert_eq!(WireFormat::Compact.decode(&text).unwrap(), env);
    }

    #[test]
    fn garbage_is_a_codec_error() {
        assert!(matches!(
            SignalEnvelope::from_compact("not base64!"),
            Err(SignalingError::Codec(_))
        ));
        assert!(matches!(
            SignalEnvelope::from_json(r#"{"type":"hangup"}"#),
            Err(SignalingError::Codec(_))
        ));
    }

    #[tokio::test]
    async fn channel_sender_stamps_envelopes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        SignalSender::send(&tx, SignalMessage::IceCandidate(IceCandidate::new("c1")))
            .await
            .unwrap();
        let env = rx.recv().await.unwrap();
        assert!(env.id.is_some());
        assert!(env.ts.is_some());
    }
}
