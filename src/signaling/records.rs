//! Record-Typen für das Signaling über den Dokument-Store
//!
//! Diese Strukturen spiegeln die Dokument-Felder wider, die beide Seiten
//! im geteilten Store lesen und schreiben. Die Feldnamen bleiben camelCase,
//! damit die Records mit einer Browser-Gegenseite kompatibel sind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// COLLECTION NAMES
// ============================================================================

/// Top-Level-Collection für Call-Dokumente
pub const CALLS: &str = "calls";

/// Sub-Collection mit den Kandidaten des Anrufers (Offerer)
pub const OFFER_CANDIDATES: &str = "offerCandidates";

/// Sub-Collection mit den Kandidaten des Angerufenen (Answerer)
pub const ANSWER_CANDIDATES: &str = "answerCandidates";

// ============================================================================
// SESSION DESCRIPTIONS
// ============================================================================

/// Art einer Session Description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Eine Session Description, wie sie im Call-Dokument abgelegt wird
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

// ============================================================================
// CALL RECORD
// ============================================================================

/// Das Call-Dokument im Store
///
/// `answer` darf erst existieren, wenn `offer` gesetzt ist. Ein Dokument
/// ohne `offer` behandelt der Angerufene wie ein nicht vorhandenes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,

    #[serde(rename = "createdAt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl CallRecord {
    pub fn has_offer(&self) -> bool {
        self.offer.is_some()
    }

    pub fn has_answer(&self) -> bool {
        self.answer.is_some()
    }
}

// ============================================================================
// CANDIDATE RECORD
// ============================================================================

/// Ein entdeckter ICE-Kandidat, append-only und unveränderlich
///
/// Entspricht dem JSON von `RTCIceCandidate.toJSON()` und wird unverändert
/// durchgereicht; der Kern parst den Kandidaten-String selbst nie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub candidate: String,

    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,

    #[serde(rename = "usernameFragment", skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

// ============================================================================
// SESSION ROLE
// ============================================================================

/// Rolle einer Seite, fest für die Lebensdauer einer CallSession
///
/// Die Rolle bestimmt, in welche Sub-Collection geschrieben und welche
/// abonniert wird, und welche der beiden Descriptions diese Seite erzeugt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionRole {
    Caller,
    Callee,
}

impl SessionRole {
    /// Sub-Collection, in die diese Rolle ihre eigenen Kandidaten schreibt
    pub fn local_bucket(self) -> &'static str {
        match self {
            SessionRole::Caller => OFFER_CANDIDATES,
            SessionRole::Callee => ANSWER_CANDIDATES,
        }
    }

    /// Sub-Collection der Gegenseite, die diese Rolle abonniert
    pub fn remote_bucket(self) -> &'static str {
        match self {
            SessionRole::Caller => ANSWER_CANDIDATES,
            SessionRole::Callee => OFFER_CANDIDATES,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
