//! Signaling Module - Offer/Answer und Kandidaten über den Dokument-Store
//!
//! Dieses Modul verwaltet den Austausch über den geteilten Store:
//! - Call-Dokumente anlegen, öffnen und beobachten
//! - Offer/Answer veröffentlichen
//! - Kandidatenströme weiterleiten (genau einmal pro Kandidat)
//!

mod channel;
mod records;
mod relay;
mod store;

pub use channel::{CallHandle, SignalingChannel, Subscription};
pub use records::{
    CallRecord, CandidateRecord, SdpKind, SessionDescription, SessionRole, ANSWER_CANDIDATES,
    CALLS, OFFER_CANDIDATES,
};
pub use relay::CandidateRelay;
pub use store::{CollectionChange, DocPath, MemoryStore, SignalingStore, StoreError};
