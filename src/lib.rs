//! RelayCall - P2P Video Call Client
//!
//! Ein serverloser P2P-Video-Call-Client mit:
//! - einem geteilten Dokument-Store als Signaling-Kanal
//! - WebRTC für die eigentliche Medienverbindung
//! - Trickle ICE über append-only Kandidaten-Records
//!
//! Zwei Instanzen verabreden einen Call ausschließlich über Dokumente:
//! Der Anrufer legt ein Call-Dokument mit seinem Offer an und teilt dessen
//! Id; der Angerufene schreibt sein Answer hinein; Kandidaten fließen über
//! zwei Sub-Collections. Sobald die direkte Verbindung steht, spielt der
//! Store keine Rolle mehr.

pub mod engine;
pub mod session;
pub mod signaling;

pub use engine::{
    default_ice_servers, ConnectionFacade, ConnectionState, EngineError, EngineEvent,
    RtcConnection,
};
pub use session::{CallSession, SessionError, SessionEvent, SessionState};
pub use signaling::{
    CandidateRelay, MemoryStore, SessionRole, SignalingChannel, SignalingStore, StoreError,
};

// ============================================================================
// LOGGING
// ============================================================================

/// Initialisiert das Logging für Binaries und Beispiele
///
/// Aus Tests nicht aufrufen; dort übernimmt der Test-Runner.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("relaycall=debug".parse().unwrap())
                .add_directive("webrtc=warn".parse().unwrap()),
        )
        .init();
}
