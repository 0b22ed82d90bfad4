//! Session Module - Lebenszyklus eines Anrufs
//!
//! Dieses Modul verbindet Signaling und Engine zu einer Zustandsmaschine:
//! - Rollenwahl und Start als Anrufer oder Angerufener
//! - Description-Austausch und Kandidatenpufferung
//! - Abbau und Fehlerbehandlung

mod call;

pub use call::{CallSession, SessionError, SessionEvent, SessionState};
