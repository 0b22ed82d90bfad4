//! Adapter-Kontrakt zur Verhandlungs-Engine
//!
//! `ConnectionFacade` ist die schmale Schnittstelle, hinter der die
//! eigentliche WebRTC-Engine liegt: Descriptions erzeugen und anwenden,
//! lokale Kandidaten melden, Zustandsübergänge berichten. Die Session
//! hält die Facade als `Arc<dyn ConnectionFacade>`; Tests tauschen sie
//! gegen ein Skript-Double aus.

use crate::signaling::{CandidateRecord, SessionDescription};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("No active connection")]
    NoConnection,
}

// ============================================================================
// CONNECTION STATE
// ============================================================================

/// Verbindungszustand aus Sicht der Engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    HaveLocalOffer,
    HaveRemoteOffer,
    Connected,
    /// Verhandlung gescheitert oder Verbindung verloren; für die Session
    /// gleichbedeutend mit einem fatalen `NegotiationFailed`
    Failed,
    Closed,
}

/// Events, die die Engine an die Session meldet
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Neu entdeckter lokaler Kandidat
    LocalCandidate(CandidateRecord),
    /// Zustandsübergang der Verbindung
    StateChanged(ConnectionState),
}

// ============================================================================
// FACADE CONTRACT
// ============================================================================

#[async_trait]
pub trait ConnectionFacade: Send + Sync {
    /// Erzeugt das lokale Offer; Tracks sind zu diesem Zeitpunkt angehängt
    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;

    /// Erzeugt das lokale Answer (erst nach angewandtem Remote-Offer)
    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    /// Wendet die entfernte Description an
    ///
    /// Höchstens einmal wirksam; ein zweiter Aufruf ist ein geloggtes
    /// No-op und niemals ein Fehler (Guard gegen doppelte Zustellung).
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    /// Ob bereits eine entfernte Description angewandt wurde
    fn remote_description_set(&self) -> bool;

    /// Wendet einen entfernten Kandidaten an; beliebig oft aufrufbar
    async fn add_candidate(&self, candidate: CandidateRecord) -> Result<(), EngineError>;

    /// Schaltet die lokale Audiospur an/aus (Mic-Toggle)
    fn set_audio_enabled(&self, enabled: bool);

    /// Schaltet die lokale Videospur an/aus (Cam-Toggle)
    fn set_video_enabled(&self, enabled: bool);

    /// Gibt einen Event-Receiver zurück
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;

    /// Gibt alle Engine-Ressourcen frei; idempotent
    async fn close(&self);
}
