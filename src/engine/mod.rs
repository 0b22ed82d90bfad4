//! Engine Module - Adapter zur WebRTC-Verhandlungs-Engine
//!
//! Dieses Modul trennt die Session von webrtc-rs:
//! - `ConnectionFacade` als Kontrakt der Engine
//! - `RtcConnection` als produktive Implementierung

mod facade;
mod rtc;

pub use facade::{ConnectionFacade, ConnectionState, EngineError, EngineEvent};
pub use rtc::{default_ice_servers, RtcConnection};
