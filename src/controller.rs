//! User-facing call actions on top of the negotiator.

use crate::config::CallConfig;
use crate::error::{CallResult, SignalingError};
use crate::logger;
use crate::negotiator::Negotiator;
use crate::peer::connection::WebRtcTransportFactory;
use crate::peer::media::MediaDevices;
use crate::peer::state::{CallEvent, CallSnapshot};
use crate::signaling::{SignalingGateway, WsRelay};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::info;

/// What a call UI drives: start/accept/reject/end plus the media toggles
pub struct CallController {
    negotiator: Negotiator,
    gateway: Option<JoinHandle<()>>,
}

impl CallController {
    pub fn new(negotiator: Negotiator) -> Self {
        Self {
            negotiator,
            gateway: None,
        }
    }

    /// Wire up a full client: logging, relay connection, WebRTC transports and
    /// the inbound dispatch task.
    pub async fn connect(
        config: &CallConfig,
        devices: Arc<dyn MediaDevices>,
    ) -> Result<Self, SignalingError> {
        logger::init(&config.log);
        let (relay, inbound) = WsRelay::connect(&config.relay).await?;
        let transports = Arc::new(WebRtcTransportFactory::new(config.ice_servers.clone()));
        let negotiator = Negotiator::new(config, devices, transports, Arc::new(relay));
        let gateway = tokio::spawn(SignalingGateway::new(negotiator.clone()).run(inbound));
        info!("Call controller ready");
        Ok(Self {
            negotiator,
            gateway: Some(gateway),
        })
    }

    pub fn negotiator(&self) -> &Negotiator {
        &self.negotiator
    }

    pub async fn start_call(&self) -> CallResult<()> {
        self.negotiator.start_call().await
    }

    pub async fn accept_call(&self) -> CallResult<()> {
        self.negotiator.accept_call().await
    }

    pub fn reject_call(&self) -> CallResult<()> {
        self.negotiator.reject_call()
    }

    pub async fn end_call(&self) -> CallResult<()> {
        self.negotiator.end_call().await
    }

    /// Flip the microphone; returns the resulting flag
    pub fn toggle_audio(&self) -> bool {
        let next = !self.negotiator.snapshot().audio_enabled;
        if self.negotiator.set_audio_enabled(next) {
            next
        } else {
            !next
        }
    }

    /// Flip the camera; returns the resulting flag
    pub fn toggle_video(&self) -> bool {
        let next = !self.negotiator.snapshot().video_enabled;
        if self.negotiator.set_video_enabled(next) {
            next
        } else {
            !next
        }
    }

    pub async fn toggle_screen_share(&self) -> CallResult<bool> {
        self.negotiator.toggle_screen_share().await
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.negotiator.snapshot()
    }

    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.negotiator.watch()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.negotiator.subscribe()
    }

    /// Tear everything down; the controller is unusable afterwards
    pub async fn shutdown(mut self) {
        if let Some(gateway) = self.gateway.take() {
            gateway.abort();
        }
        self.negotiator.shutdown().await;
    }
}

impl Drop for CallController {
    fn drop(&mut self) {
        if let Some(gateway) = self.gateway.take() {
            gateway.abort();
        }
    }
}
