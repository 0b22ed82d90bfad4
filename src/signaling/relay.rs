//! Kandidaten-Relay
//!
//! Verwaltet die beiden Einweg-Kandidatenströme eines Calls (lokal→remote,
//! remote→lokal) und stellt sicher, dass jeder entfernte Kandidat genau
//! einmal beim Konsumenten ankommt, in Store-Reihenfolge.

use crate::signaling::channel::{CallHandle, Subscription};
use crate::signaling::records::{CandidateRecord, SessionRole};
use crate::signaling::store::{CollectionChange, SignalingStore};
use std::collections::HashSet;
use std::sync::Arc;

/// Relay für die Kandidaten-Sub-Collections eines Calls
#[derive(Clone)]
pub struct CandidateRelay {
    store: Arc<dyn SignalingStore>,
}

impl CandidateRelay {
    pub fn new(store: Arc<dyn SignalingStore>) -> Self {
        Self { store }
    }

    /// Hängt einen lokalen Kandidaten an die eigene Sub-Collection an
    ///
    /// Fire-and-forget: Fehler werden geloggt, nicht wiederholt. Ein
    /// verlorener Kandidat verschlechtert nur die Verbindungschancen, ICE
    /// sammelt üblicherweise mehrere.
    pub async fn publish_local(
        &self,
        handle: &CallHandle,
        role: SessionRole,
        candidate: &CandidateRecord,
    ) {
        let collection = handle.path().subcollection(role.local_bucket());

        let value = match serde_json::to_value(candidate) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Skipping unserializable candidate on call {}: {}", handle.id(), e);
                return;
            }
        };

        if let Err(e) = self.store.create_document(&collection, value).await {
            tracing::warn!(
                "Failed to publish local candidate for call {}: {}",
                handle.id(),
                e
            );
        }
    }

    /// Abonniert die Kandidaten-Sub-Collection der Gegenrolle
    ///
    /// `on_candidate` feuert genau einmal pro neu angehängtem Record, in
    /// Store-Reihenfolge. Nur `Added`-Änderungen werden durchgereicht;
    /// Modifikationen und Löschungen kommen im Protokoll nicht vor.
    pub fn watch_remote(
        &self,
        handle: &CallHandle,
        role: SessionRole,
        on_candidate: impl Fn(CandidateRecord) + Send + 'static,
    ) -> Subscription {
        let collection = handle.path().subcollection(role.remote_bucket());
        let mut rx = self.store.watch_collection(&collection);
        let call_id = handle.id().to_string();

        let task = tokio::spawn(async move {
            let mut seen: HashSet<String> = HashSet::new();
            while let Some(change) = rx.recv().await {
                let (id, value) = match change {
                    CollectionChange::Added { id, value } => (id, value),
                    _ => continue,
                };

                // At-least-once vom Store abfangen
                if !seen.insert(id.clone()) {
                    tracing::debug!("Duplicate candidate {} on call {}, ignoring", id, call_id);
                    continue;
                }

                match serde_json::from_value::<CandidateRecord>(value) {
                    Ok(candidate) => on_candidate(candidate),
                    Err(e) => {
                        tracing::warn!("Ignoring malformed candidate {} on call {}: {}", id, call_id, e)
                    }
                }
            }
        });
        Subscription::new(task)
    }
}

// ============================================================================
// TESTS
// ============================================================================
