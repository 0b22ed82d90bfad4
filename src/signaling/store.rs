//! Dokument-Store-Abstraktion für das Signaling
//!
//! Der Store wird als generischer, key-adressierter Record-Store mit
//! Push-Benachrichtigungen behandelt: Dokumente mit generierter Id anlegen,
//! Felder in bestehende Dokumente mergen, per Id lesen und Dokumente oder
//! Sub-Collections in Echtzeit beobachten. Über das eigentliche Schema aus
//! `records` hinaus wird vom Store nichts verlangt.
//!
//! `MemoryStore` ist die vollständige In-Process-Implementierung für Tests
//! und den Loopback-Betrieb; ein gehosteter Store wird über dieselbe
//! Schnittstelle angebunden.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("signaling store unavailable: {0}")]
    Unavailable(String),

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("write conflict on {0}")]
    Conflict(String),

    #[error("malformed record: {0}")]
    Malformed(String),
}

// ============================================================================
// ADDRESSING
// ============================================================================

/// Adresse eines Dokuments: Collection-Pfad plus Dokument-Id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocPath {
    pub collection: String,
    pub id: String,
}

impl DocPath {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Pfad einer Sub-Collection unterhalb dieses Dokuments
    pub fn subcollection(&self, name: &str) -> String {
        format!("{}/{}/{}", self.collection, self.id, name)
    }
}

impl std::fmt::Display for DocPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

// ============================================================================
// CHANGE EVENTS
// ============================================================================

/// Eine klassifizierte Änderung innerhalb einer beobachteten Collection
#[derive(Debug, Clone)]
pub enum CollectionChange {
    Added { id: String, value: Value },
    Modified { id: String, value: Value },
    Removed { id: String },
}

// ============================================================================
// STORE CONTRACT
// ============================================================================

/// Kontrakt des externen Dokument-Stores
///
/// Beobachtungen liefern mindestens-einmal; Konsumenten müssen gegenüber
/// schon verarbeitetem Zustand idempotent sein. Innerhalb einer Collection
/// kommen `Added`-Änderungen in Append-Reihenfolge.
#[async_trait]
pub trait SignalingStore: Send + Sync {
    /// Legt ein Dokument mit generierter Id an und liefert die Id zurück
    async fn create_document(&self, collection: &str, value: Value) -> Result<String, StoreError>;

    /// Merged die Top-Level-Felder von `fields` in ein bestehendes Dokument
    async fn merge_fields(&self, path: &DocPath, fields: Value) -> Result<(), StoreError>;

    /// Liest ein Dokument; `None` wenn es nicht existiert
    async fn get_document(&self, path: &DocPath) -> Result<Option<Value>, StoreError>;

    /// Beobachtet ein Dokument
    ///
    /// Liefert bei jeder Änderung den vollen Stand, beginnend mit dem
    /// aktuellen, sofern das Dokument schon existiert.
    fn watch_document(&self, path: &DocPath) -> mpsc::UnboundedReceiver<Value>;

    /// Beobachtet eine Collection
    ///
    /// Bereits vorhandene Dokumente kommen zuerst als `Added` in
    /// Append-Reihenfolge, danach jede weitere Änderung.
    fn watch_collection(&self, collection: &str) -> mpsc::UnboundedReceiver<CollectionChange>;
}

// ============================================================================
// MEMORY STORE
// ============================================================================

#[derive(Default)]
struct CollectionState {
    // Append-Reihenfolge der Dokumente bleibt erhalten
    docs: Vec<(String, Value)>,
    doc_watchers: HashMap<String, Vec<mpsc::UnboundedSender<Value>>>,
    watchers: Vec<mpsc::UnboundedSender<CollectionChange>>,
}

impl CollectionState {
    fn find(&self, id: &str) -> Option<&Value> {
        self.docs
            .iter()
            .find(|(doc_id, _)| doc_id == id)
            .map(|(_, value)| value)
    }

    fn notify_doc(&mut self, id: &str, value: &Value) {
        if let Some(senders) = self.doc_watchers.get_mut(id) {
            senders.retain(|tx| tx.send(value.clone()).is_ok());
        }
    }

    fn notify_collection(&mut self, change: &CollectionChange) {
        self.watchers.retain(|tx| tx.send(change.clone()).is_ok());
    }
}

/// In-Process-Implementierung des Dokument-Stores
///
/// Benachrichtigungen laufen unter demselben Lock wie die Schreiboperation,
/// damit kein Abonnent eine Änderung zwischen Snapshot und Registrierung
/// verpasst.
#[derive(Clone, Default)]
pub struct MemoryStore {
    collections: Arc<Mutex<HashMap<String, CollectionState>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SignalingStore for MemoryStore {
    async fn create_document(&self, collection: &str, value: Value) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();

        let mut collections = self.collections.lock();
        let state = collections.entry(collection.to_string()).or_default();
        state.docs.push((id.clone(), value.clone()));
        state.notify_doc(&id, &value);
        state.notify_collection(&CollectionChange::Added {
            id: id.clone(),
            value,
        });

        tracing::debug!("Created document {}/{}", collection, id);
        Ok(id)
    }

    async fn merge_fields(&self, path: &DocPath, fields: Value) -> Result<(), StoreError> {
        let fields = match fields {
            Value::Object(map) => map,
            _ => return Err(StoreError::Malformed("merge expects an object".to_string())),
        };

        let mut collections = self.collections.lock();
        let state = collections
            .get_mut(&path.collection)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;

        let doc = state
            .docs
            .iter_mut()
            .find(|(id, _)| *id == path.id)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;

        match &mut doc.1 {
            Value::Object(existing) => {
                for (key, value) in fields {
                    existing.insert(key, value);
                }
            }
            other => *other = Value::Object(fields),
        }

        let updated = doc.1.clone();
        state.notify_doc(&path.id, &updated);
        state.notify_collection(&CollectionChange::Modified {
            id: path.id.clone(),
            value: updated,
        });
        Ok(())
    }

    async fn get_document(&self, path: &DocPath) -> Result<Option<Value>, StoreError> {
        let collections = self.collections.lock();
        Ok(collections
            .get(&path.collection)
            .and_then(|state| state.find(&path.id))
            .cloned())
    }

    fn watch_document(&self, path: &DocPath) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut collections = self.collections.lock();
        let state = collections.entry(path.collection.clone()).or_default();
        if let Some(current) = state.find(&path.id) {
            let _ = tx.send(current.clone());
        }
        state
            .doc_watchers
            .entry(path.id.clone())
            .or_default()
            .push(tx);
        rx
    }

    fn watch_collection(&self, collection: &str) -> mpsc::UnboundedReceiver<CollectionChange> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut collections = self.collections.lock();
        let state = collections.entry(collection.to_string()).or_default();
        for (id, value) in &state.docs {
            let _ = tx.send(CollectionChange::Added {
                id: id.clone(),
                value: value.clone(),
            });
        }
        state.watchers.push(tx);
        rx
    }
}

// ============================================================================
// TESTS
// ============================================================================
