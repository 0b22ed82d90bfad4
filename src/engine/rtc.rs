//! WebRTC-Implementierung der ConnectionFacade
//!
//! Kapselt eine `RTCPeerConnection` aus webrtc-rs. Medien-Capture liegt
//! außerhalb dieses Kerns; vor der Verhandlung werden statische
//! Audio/Video-Tracks angehängt, damit Offer/Answer die Medien-Sektionen
//! tragen. Die Toggle-Flags fragt der einbettende Sender ab.

use super::facade::{ConnectionFacade, ConnectionState, EngineError, EngineEvent};
use crate::signaling::{CandidateRecord, SdpKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Standard STUN-Konfiguration (wie im Browser-Client)
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec!["stun:stun.l.google.com:19302".to_string()],
        ..Default::default()
    }]
}

// ============================================================================
// RTC CONNECTION
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct TrackFlags {
    audio_enabled: bool,
    video_enabled: bool,
}

/// Eine WebRTC-Verbindung hinter der ConnectionFacade
pub struct RtcConnection {
    pc: Arc<RTCPeerConnection>,
    state: Arc<Mutex<ConnectionState>>,
    remote_set: Arc<Mutex<bool>>,
    closed: Mutex<bool>,
    flags: Mutex<TrackFlags>,
    event_tx: broadcast::Sender<EngineEvent>,
}

impl RtcConnection {
    /// Baut die Peer Connection mit Default-Codecs und Interceptors auf
    pub async fn new(ice_servers: Vec<RTCIceServer>) -> Result<Self, EngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| EngineError::WebRtc(e.to_string()))?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| EngineError::WebRtc(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers,
            // Pool-Größe wie in der Browser-Konfiguration
            ice_candidate_pool_size: 10,
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| EngineError::WebRtc(e.to_string()))?,
        );

        // Tracks vor der Verhandlung anhängen, damit die Descriptions
        // Audio- und Video-Sektionen enthalten
        let audio_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_string(),
            "relaycall".to_string(),
        ));
        pc.add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| EngineError::WebRtc(e.to_string()))?;

        let video_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
            "video".to_string(),
            "relaycall".to_string(),
        ));
        pc.add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| EngineError::WebRtc(e.to_string()))?;

        let (event_tx, _) = broadcast::channel(100);
        let state = Arc::new(Mutex::new(ConnectionState::New));

        let conn = Self {
            pc,
            state,
            remote_set: Arc::new(Mutex::new(false)),
            closed: Mutex::new(false),
            flags: Mutex::new(TrackFlags {
                audio_enabled: true,
                video_enabled: true,
            }),
            event_tx,
        };
        conn.setup_handlers();
        Ok(conn)
    }

    /// Aktueller Engine-Zustand
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Ob die Audiospur gerade gesendet werden soll
    pub fn audio_enabled(&self) -> bool {
        self.flags.lock().audio_enabled
    }

    /// Ob die Videospur gerade gesendet werden soll
    pub fn video_enabled(&self) -> bool {
        self.flags.lock().video_enabled
    }

    fn set_state(&self, new_state: ConnectionState) {
        *self.state.lock() = new_state;
        let _ = self.event_tx.send(EngineEvent::StateChanged(new_state));
    }

    /// Registriert die Event-Handler der Peer Connection
    fn setup_handlers(&self) {
        // Connection State Handler
        let state = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                tracing::info!("Peer connection state: {:?}", s);

                let new_state = match s {
                    RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
                    RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed => {
                        Some(ConnectionState::Failed)
                    }
                    RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
                    _ => None,
                };

                if let Some(new_state) = new_state {
                    *state.lock() = new_state;
                    let _ = event_tx.send(EngineEvent::StateChanged(new_state));
                }

                Box::pin(async {})
            }));

        // ICE Candidate Handler
        let event_tx = self.event_tx.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => {
                        let record = CandidateRecord {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        };
                        let _ = event_tx.send(EngineEvent::LocalCandidate(record));
                    }
                    Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));
    }

    fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
        match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(|e| EngineError::InvalidSdp(e.to_string()))
    }
}

#[async_trait]
impl ConnectionFacade for RtcConnection {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| EngineError::WebRtc(e.to_string()))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| EngineError::WebRtc(e.to_string()))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        let kind = desc.kind;
        let sdp = Self::to_rtc_description(desc)?;
        self.pc
            .set_local_description(sdp)
            .await
            .map_err(|e| EngineError::WebRtc(e.to_string()))?;

        if kind == SdpKind::Offer {
            self.set_state(ConnectionState::HaveLocalOffer);
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        {
            let mut remote_set = self.remote_set.lock();
            if *remote_set {
                tracing::warn!("Remote description already applied, ignoring duplicate");
                return Ok(());
            }
            *remote_set = true;
        }

        let kind = desc.kind;
        let sdp = Self::to_rtc_description(desc)?;
        if let Err(e) = self.pc.set_remote_description(sdp).await {
            // Guard zurücknehmen, damit ein korrigierter Versuch möglich bleibt
            *self.remote_set.lock() = false;
            return Err(EngineError::WebRtc(e.to_string()));
        }

        if kind == SdpKind::Offer {
            self.set_state(ConnectionState::HaveRemoteOffer);
        }
        Ok(())
    }

    fn remote_description_set(&self) -> bool {
        *self.remote_set.lock()
    }

    async fn add_candidate(&self, candidate: CandidateRecord) -> Result<(), EngineError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| EngineError::WebRtc(e.to_string()))
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.flags.lock().audio_enabled = enabled;
        tracing::debug!("Audio track enabled: {}", enabled);
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.flags.lock().video_enabled = enabled;
        tracing::debug!("Video track enabled: {}", enabled);
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    async fn close(&self) {
        let already_closed = std::mem::replace(&mut *self.closed.lock(), true);
        if already_closed {
            return;
        }

        if let Err(e) = self.pc.close().await {
            tracing::warn!("Error closing peer connection: {}", e);
        }
        self.set_state(ConnectionState::Closed);
    }
}

impl std::fmt::Debug for RtcConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcConnection")
            .field("state", &self.state())
            .field("remote_set", &self.remote_description_set())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offer_answer_negotiation_between_two_connections() {
        let caller = RtcConnection::new(vec![]).await.unwrap();
        let callee = RtcConnection::new(vec![]).await.unwrap();

        let offer = caller.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        caller.set_local_description(offer.clone()).await.unwrap();
        assert_eq!(caller.state(), ConnectionState::HaveLocalOffer);

        callee.set_remote_description(offer).await.unwrap();
        assert_eq!(callee.state(), ConnectionState::HaveRemoteOffer);
        assert!(callee.remote_description_set());

        let answer = callee.create_answer().await.unwrap();
        callee.set_local_description(answer.clone()).await.unwrap();

        caller.set_remote_description(answer.clone()).await.unwrap();
        assert!(caller.remote_description_set());

        // Doppelte Anwendung ist ein No-op, kein Fehler
        caller.set_remote_description(answer).await.unwrap();

        caller.close().await;
        caller.close().await;
        callee.close().await;
    }

    #[tokio::test]
    async fn test_track_toggle_flags() {
        let conn = RtcConnection::new(default_ice_servers()).await.unwrap();
        assert!(conn.audio_enabled());
        assert!(conn.video_enabled());

        conn.set_audio_enabled(false);
        conn.set_video_enabled(false);
        assert!(!conn.audio_enabled());
        assert!(!conn.video_enabled());
        conn.close().await;
    }
}
