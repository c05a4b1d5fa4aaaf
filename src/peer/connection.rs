use crate::error::TransportError;
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::peer::media::MediaTrack;
use crate::peer::types::{IceCandidate, SdpKind, ServerConfig, SessionDescription, TrackKind};
use crate::utils::{add_ice_url_scheme, lock};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Wait before declaring a dropped connection failed
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Connection health as reported to the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionHealth {
    Connected,
    Problem,
    Recovering,
    Recovered,
    Failed,
    Closed,
}

/// Callbacks raised by a transport, delivered in order over a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    GatheringComplete,
    Connection(ConnectionHealth),
    RemoteTrack { id: String, kind: TrackKind },
}

/// The peer connection as seen by the negotiator
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), TransportError>;
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;
    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;
    /// Swap what the outgoing video sender carries; `None` leaves it empty.
    async fn replace_video_track(&self, track: Option<&MediaTrack>)
        -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

/// Builds [`WebRtcTransport`]s from the configured ICE servers
#[derive(Debug, Clone)]
pub struct WebRtcTransportFactory {
    ice_servers: Vec<ServerConfig>,
}

impl WebRtcTransportFactory {
    pub fn new(ice_servers: Vec<ServerConfig>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let transport = WebRtcTransport::new(&self.ice_servers, GRACE_PERIOD, events).await?;
        Ok(Arc::new(transport))
    }
}

struct LocalBinding {
    media: MediaTrack,
    local: Arc<TrackLocalStaticSample>,
}

/// [`PeerTransport`] over a `webrtc` peer connection
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    bindings: Mutex<HashMap<String, LocalBinding>>,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
    grace_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl WebRtcTransport {
    pub async fn new(
        ice_servers: &[ServerConfig],
        grace_period: Duration,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(rtc_config(ice_servers)).await?);
        let grace_task = Arc::new(Mutex::new(None));

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                match cand {
                    Some(c) => match c.to_json() {
                        Ok(init) => {
                            let cand = IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            };
                            dump_candidate("LOCAL", &cand);
                            let _ = tx.send(TransportEvent::LocalCandidate(cand));
                        }
                        Err(e) => warn!("Failed to serialize local candidate: {e}"),
                    },
                    None => {
                        debug!("ICE candidate gathering completed (null candidate received)");
                        let _ = tx.send(TransportEvent::GatheringComplete);
                    }
                }
            })
        }));

        pc.on_ice_gathering_state_change(Box::new(|state| {
            debug!("ICE gathering state changed to: {state:?}");
            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    _ => TrackKind::Video,
                };
                info!("Remote {kind:?} track arrived: {}", track.id());
                let _ = tx.send(TransportEvent::RemoteTrack {
                    id: track.id(),
                    kind,
                });
                Box::pin(async {})
            },
        ));

        watch_connection_state(&pc, grace_period, events, grace_task.clone());

        Ok(Self {
            pc,
            bindings: Mutex::new(HashMap::new()),
            video_sender: Mutex::new(None),
            grace_task,
        })
    }

    /// Forward a captured sample on the track's sender.
    /// Returns false when the track is stopped or disabled and the sample was dropped.
    pub async fn write_sample(
        &self,
        track_id: &str,
        data: Bytes,
        duration: Duration,
    ) -> Result<bool, TransportError> {
        let (media, local) = {
            let bindings = lock(&self.bindings);
            let binding = bindings
                .get(track_id)
                .ok_or_else(|| TransportError::UnknownTrack(track_id.to_owned()))?;
            (binding.media.clone(), binding.local.clone())
        };
        if !media.is_live() || !media.is_enabled() {
            return Ok(false);
        }
        local
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(true)
    }

    fn bind(&self, track: &MediaTrack) -> Arc<TrackLocalStaticSample> {
        let mut bindings = lock(&self.bindings);
        bindings
            .entry(track.id().to_owned())
            .or_insert_with(|| LocalBinding {
                media: track.clone(),
                local: Arc::new(TrackLocalStaticSample::new(
                    codec_for(track.kind()),
                    track.id().to_owned(),
                    "vidcall".to_owned(),
                )),
            })
            .local
            .clone()
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), TransportError> {
        let local = self.bind(track);
        let sender = self
            .pc
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        if track.kind() == TrackKind::Video {
            *lock(&self.video_sender) = Some(sender.clone());
        }

        // RTCP has to be read for interceptors to run
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        from_rtc(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        from_rtc(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn replace_video_track(
        &self,
        track: Option<&MediaTrack>,
    ) -> Result<(), TransportError> {
        let Some(sender) = lock(&self.video_sender).clone() else {
            warn!("No outgoing video sender, leaving video untouched");
            return Ok(());
        };
        let local = track.map(|t| self.bind(t) as Arc<dyn TrackLocal + Send + Sync>);
        sender.replace_track(local).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some(handle) = lock(&self.grace_task).take() {
            handle.abort();
        }
        lock(&self.bindings).clear();
        self.pc.close().await?;
        Ok(())
    }
}

fn watch_connection_state(
    pc: &Arc<RTCPeerConnection>,
    grace_period: Duration,
    events: mpsc::UnboundedSender<TransportEvent>,
    grace_task: Arc<Mutex<Option<JoinHandle<()>>>>,
) {
    // weak: the handler is owned by the connection itself
    let pc_state: Weak<RTCPeerConnection> = Arc::downgrade(pc);

    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        info!("Peer connection state changed to: {st:?}");
        on_state_change(st, &pc_state, grace_period, &events, &grace_task);
        Box::pin(async {})
    }));
}

fn on_state_change(
    st: RTCPeerConnectionState,
    pc: &Weak<RTCPeerConnection>,
    grace_period: Duration,
    events: &mpsc::UnboundedSender<TransportEvent>,
    grace_task: &Mutex<Option<JoinHandle<()>>>,
) {
    match st {
        RTCPeerConnectionState::Connected => {
            if let Some(handle) = lock(grace_task).take() {
                debug!("Aborting pending grace period");
                handle.abort();
                let _ = events.send(TransportEvent::Connection(ConnectionHealth::Recovered));
            }
            let _ = events.send(TransportEvent::Connection(ConnectionHealth::Connected));
        }

        RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed => {
            let mut pending = lock(grace_task);
            if pending.is_some() {
                debug!("Grace period already running, ignoring {st:?}");
                return;
            }
            let Some(pc) = pc.upgrade() else {
                return;
            };

            let _ = events.send(TransportEvent::Connection(ConnectionHealth::Problem));

            let events = events.clone();
            *pending = Some(tokio::spawn(async move {
                dump_selected_pair(&pc, "BEFORE-FAIL").await;
                info!("Grace period started, waiting {} s", grace_period.as_secs());
                let _ = events.send(TransportEvent::Connection(ConnectionHealth::Recovering));
                sleep(grace_period).await;

                let state_now = pc.connection_state();
                debug!("Grace over, state={state_now:?}");
                if state_now != RTCPeerConnectionState::Connected {
                    let _ = events.send(TransportEvent::Connection(ConnectionHealth::Failed));
                }
            }));
        }

        RTCPeerConnectionState::Closed => {
            if let Some(handle) = lock(grace_task).take() {
                handle.abort();
            }
            let _ = events.send(TransportEvent::Connection(ConnectionHealth::Closed));
        }

        _ => {}
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
    };
    Ok(rtc)
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        other => {
            return Err(TransportError::Other(format!(
                "unexpected session description type {other}"
            )))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

/// Peer connection configuration for the given ICE servers
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_user_ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}
