//! Call-bezogene Sicht auf den Dokument-Store
//!
//! `SignalingChannel` kapselt Pfade und Record-Formate eines Calls:
//! anlegen bzw. öffnen, Offer/Answer veröffentlichen, einmaliges Lesen und
//! die Beobachtung des Call-Dokuments für das eintreffende Answer.

use crate::signaling::records::{CallRecord, SessionDescription, CALLS};
use crate::signaling::store::{DocPath, SignalingStore, StoreError};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;

// ============================================================================
// CALL HANDLE
// ============================================================================

/// Bindung an ein Call-Dokument im Store
///
/// `open_call` prüft die Existenz nicht; das passiert erst beim Lesen.
#[derive(Debug, Clone)]
pub struct CallHandle {
    path: DocPath,
}

impl CallHandle {
    pub fn id(&self) -> &str {
        &self.path.id
    }

    pub(crate) fn path(&self) -> &DocPath {
        &self.path
    }
}

// ============================================================================
// SUBSCRIPTION
// ============================================================================

/// Laufende Store-Beobachtung
///
/// `cancel` ist idempotent und auch dann sicher, wenn nie ein Ereignis
/// eingetroffen ist. Drop bricht die Beobachtung ebenfalls ab.
pub struct Subscription {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    pub(crate) fn new(task: JoinHandle<()>) -> Self {
        Self {
            task: Mutex::new(Some(task)),
        }
    }

    pub fn cancel(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ============================================================================
// SIGNALING CHANNEL
// ============================================================================

/// Call-bezogener Wrapper um den Dokument-Store
#[derive(Clone)]
pub struct SignalingChannel {
    store: Arc<dyn SignalingStore>,
}

impl SignalingChannel {
    pub fn new(store: Arc<dyn SignalingStore>) -> Self {
        Self { store }
    }

    /// Legt einen neuen Call mit frischer Id an
    pub async fn create_call(&self) -> Result<CallHandle, StoreError> {
        let record = CallRecord {
            created_at: Some(Utc::now()),
            ..Default::default()
        };
        let value =
            serde_json::to_value(&record).map_err(|e| StoreError::Malformed(e.to_string()))?;

        let id = self.store.create_document(CALLS, value).await?;
        tracing::info!("Created call {}", id);
        Ok(CallHandle {
            path: DocPath::new(CALLS, id),
        })
    }

    /// Bindet an einen bestehenden Call, ohne die Existenz zu prüfen
    pub fn open_call(&self, id: &str) -> CallHandle {
        CallHandle {
            path: DocPath::new(CALLS, id),
        }
    }

    /// Schreibt das Offer in das Call-Dokument
    ///
    /// Pro Handle höchstens einmal aufzurufen (Caller-Rolle).
    pub async fn publish_offer(
        &self,
        handle: &CallHandle,
        offer: SessionDescription,
    ) -> Result<(), StoreError> {
        tracing::debug!("Publishing offer for call {}", handle.id());
        self.store
            .merge_fields(&handle.path, json!({ "offer": offer }))
            .await
    }

    /// Schreibt das Answer in ein bestehendes Call-Dokument
    ///
    /// Schlägt fehl, wenn das Dokument fehlt, kein Offer trägt oder schon
    /// ein Answer enthält (first-answer-wins).
    pub async fn publish_answer(
        &self,
        handle: &CallHandle,
        answer: SessionDescription,
    ) -> Result<(), StoreError> {
        let record = self
            .fetch_call(handle)
            .await?
            .ok_or_else(|| StoreError::NotFound(handle.id().to_string()))?;

        if !record.has_offer() {
            return Err(StoreError::NotFound(handle.id().to_string()));
        }
        if record.has_answer() {
            return Err(StoreError::Conflict(format!(
                "call {} already answered",
                handle.id()
            )));
        }

        tracing::debug!("Publishing answer for call {}", handle.id());
        self.store
            .merge_fields(&handle.path, json!({ "answer": answer }))
            .await
    }

    /// Einmaliges Lesen des Call-Dokuments; `None` wenn nicht vorhanden
    pub async fn fetch_call(&self, handle: &CallHandle) -> Result<Option<CallRecord>, StoreError> {
        match self.store.get_document(&handle.path).await? {
            Some(value) => {
                let record = serde_json::from_value(value)
                    .map_err(|e| StoreError::Malformed(e.to_string()))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Beobachtet das Call-Dokument und reicht jeden Stand an `on_update`
    ///
    /// Die Zustellung ist mindestens-einmal und beginnt mit dem aktuellen
    /// Stand; der Handler muss gegenüber schon angewandtem Zustand
    /// idempotent sein.
    pub fn watch_call(
        &self,
        handle: &CallHandle,
        on_update: impl Fn(CallRecord) + Send + 'static,
    ) -> Subscription {
        let mut rx = self.store.watch_document(&handle.path);
        let call_id = handle.id().to_string();

        let task = tokio::spawn(async move {
            while let Some(value) = rx.recv().await {
                match serde_json::from_value::<CallRecord>(value) {
                    Ok(record) => on_update(record),
                    Err(e) => {
                        tracing::warn!("Ignoring malformed call record for {}: {}", call_id, e)
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
