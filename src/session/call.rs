//! Call-Lebenszyklus
//!
//! `CallSession` besitzt den gesamten Zustand eines Anrufversuchs:
//! Rollenwahl, Description-Austausch über den Store, Kandidatenpufferung
//! und Abbau. Store- und Engine-Ereignisse laufen über Callbacks, die
//! zuerst prüfen, ob die Session noch lebt; Kandidaten werden über eine
//! Queue von genau einem Task in Eintreffreihenfolge angewandt.

use crate::engine::{ConnectionFacade, ConnectionState, EngineError, EngineEvent};
use crate::signaling::{
    CallHandle, CallRecord, CandidateRecord, CandidateRelay, SessionDescription, SessionRole,
    SignalingChannel, StoreError, Subscription,
};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid call id")]
    InvalidCallId,

    #[error("Call not found: {0}")]
    CallNotFound(String),

    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("Session already started")]
    AlreadyStarted,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

// ============================================================================
// SESSION STATE
// ============================================================================

/// Lebenszyklus einer CallSession
///
/// `Closed` ist aus jedem anderen Zustand erreichbar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    RoleChosen,
    Negotiating,
    Connected,
    Closed,
}

/// Events der Session für die Oberfläche
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// Die Call-Id steht fest und kann mit der Gegenseite geteilt werden
    CallReady { id: String },
    Error(String),
}

// ============================================================================
// CANDIDATE QUEUE
// ============================================================================

/// Kommandos an den Kandidaten-Anwender-Task
///
/// Bis `Flush` eintrifft (Remote-Description angewandt) wird gepuffert,
/// danach in Eintreffreihenfolge direkt angewandt.
enum CandidateCommand {
    Apply(CandidateRecord),
    Flush,
}

// ============================================================================
// CALL SESSION
// ============================================================================

struct Inner {
    state: SessionState,
    role: Option<SessionRole>,
    handle: Option<CallHandle>,
    remote_applied: bool,
    candidate_tx: Option<mpsc::UnboundedSender<CandidateCommand>>,
    call_watch: Option<Subscription>,
    candidate_watch: Option<Subscription>,
    engine_pump: Option<JoinHandle<()>>,
    candidate_applier: Option<JoinHandle<()>>,
}

/// Zustandsmaschine eines Anrufs
///
/// Genau eine Session besitzt genau eine ConnectionFacade, ein
/// SignalingChannel-Handle und höchstens zwei Relay-Abonnements; nichts
/// davon wird über Sessions hinweg geteilt.
#[derive(Clone)]
pub struct CallSession {
    channel: SignalingChannel,
    relay: CandidateRelay,
    facade: Arc<dyn ConnectionFacade>,
    inner: Arc<Mutex<Inner>>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl CallSession {
    pub fn new(
        channel: SignalingChannel,
        relay: CandidateRelay,
        facade: Arc<dyn ConnectionFacade>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            channel,
            relay,
            facade,
            inner: Arc::new(Mutex::new(Inner {
                state: SessionState::Idle,
                role: None,
                handle: None,
                remote_applied: false,
                candidate_tx: None,
                call_watch: None,
                candidate_watch: None,
                engine_pump: None,
                candidate_applier: None,
            })),
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn role(&self) -> Option<SessionRole> {
        self.inner.lock().role
    }

    /// Id des laufenden Calls, sobald bekannt (zum Teilen mit der Gegenseite)
    pub fn call_id(&self) -> Option<String> {
        self.inner
            .lock()
            .handle
            .as_ref()
            .map(|h| h.id().to_string())
    }

    // ========================================================================
    // CALLER PATH
    // ========================================================================

    /// Startet als Anrufer und liefert die zu teilende Call-Id
    ///
    /// Legt das Call-Dokument an, veröffentlicht das Offer und wartet dann
    /// per Beobachtung auf Answer und Kandidaten der Gegenseite.
    pub async fn start_as_caller(&self) -> Result<String, SessionError> {
        self.choose_role(SessionRole::Caller)?;

        let handle = match self.channel.create_call().await {
            Ok(handle) => handle,
            Err(e) => {
                self.fail(&format!("could not create call: {}", e));
                return Err(e.into());
            }
        };
        self.inner.lock().handle = Some(handle.clone());
        let _ = self.event_tx.send(SessionEvent::CallReady {
            id: handle.id().to_string(),
        });

        self.spawn_engine_pump(handle.clone(), SessionRole::Caller);
        let candidate_tx = self.spawn_candidate_applier();

        let offer = match self.facade.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                self.fail(&format!("could not create offer: {}", e));
                return Err(e.into());
            }
        };
        if let Err(e) = self.facade.set_local_description(offer.clone()).await {
            self.fail(&format!("could not apply local offer: {}", e));
            return Err(e.into());
        }
        if let Err(e) = self.channel.publish_offer(&handle, offer).await {
            self.fail(&format!("could not publish offer: {}", e));
            return Err(e.into());
        }

        self.set_state(SessionState::Negotiating);

        // Auf das Answer der Gegenseite warten
        let session = self.clone();
        let call_watch = self.channel.watch_call(&handle, move |record| {
            session.on_call_update(record);
        });

        // Kandidaten der Gegenseite in die Anwendungs-Queue
        let tx = candidate_tx;
        let candidate_watch = self
            .relay
            .watch_remote(&handle, SessionRole::Caller, move |candidate| {
                let _ = tx.send(CandidateCommand::Apply(candidate));
            });

        self.store_subscriptions(call_watch, candidate_watch);
        Ok(handle.id().to_string())
    }

    /// Verarbeitet einen Stand des Call-Dokuments (Caller-Pfad)
    ///
    /// Die Beobachtung kann beliebig oft ohne Answer feuern (Store-Re-Sync);
    /// nur der erste Stand mit Answer bei noch nicht angewandter
    /// Remote-Description löst die Anwendung aus.
    fn on_call_update(&self, record: CallRecord) {
        {
            let inner = self.inner.lock();
            if inner.state == SessionState::Closed || inner.remote_applied {
                return;
            }
        }
        let Some(answer) = record.answer else {
            return;
        };

        let session = self.clone();
        tokio::spawn(async move {
            session.apply_remote_answer(answer).await;
        });
    }

    /// Wendet das Answer genau einmal an und stößt die Kandidaten-Spülung an
    async fn apply_remote_answer(&self, answer: SessionDescription) {
        let candidate_tx = {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Closed || inner.remote_applied {
                return;
            }
            inner.remote_applied = true;
            inner.candidate_tx.clone()
        };

        if let Err(e) = self.facade.set_remote_description(answer).await {
            self.fail(&format!("remote answer rejected: {}", e));
            return;
        }
        tracing::info!("Remote answer applied");

        if let Some(tx) = candidate_tx {
            let _ = tx.send(CandidateCommand::Flush);
        }
        // Mit angewandtem Answer gilt der Caller als verbunden
        self.transition_connected();
    }

    // ========================================================================
    // CALLEE PATH
    // ========================================================================

    /// Tritt einem bestehenden Call als Angerufener bei
    pub async fn join(&self, call_id: &str) -> Result<(), SessionError> {
        let call_id = call_id.trim();
        if call_id.is_empty() {
            // Vor jeder Store-Interaktion abweisen; die Session bleibt Idle
            return Err(SessionError::InvalidCallId);
        }
        self.choose_role(SessionRole::Callee)?;

        let handle = self.channel.open_call(call_id);
        self.inner.lock().handle = Some(handle.clone());

        let record = match self.channel.fetch_call(&handle).await {
            Ok(record) => record,
            Err(e) => {
                self.fail(&format!("could not fetch call: {}", e));
                return Err(e.into());
            }
        };
        let offer = match record.and_then(|r| r.offer) {
            Some(offer) => offer,
            None => {
                tracing::warn!("Call {} not found or has no offer", call_id);
                self.end();
                return Err(SessionError::CallNotFound(call_id.to_string()));
            }
        };

        self.spawn_engine_pump(handle.clone(), SessionRole::Callee);
        let candidate_tx = self.spawn_candidate_applier();

        if let Err(e) = self.facade.set_remote_description(offer).await {
            self.fail(&format!("remote offer rejected: {}", e));
            return Err(e.into());
        }
        {
            let mut inner = self.inner.lock();
            inner.remote_applied = true;
        }
        // Remote-Description steht; früh eingetroffene Kandidaten freigeben
        let _ = candidate_tx.send(CandidateCommand::Flush);

        let answer = match self.facade.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                self.fail(&format!("could not create answer: {}", e));
                return Err(e.into());
            }
        };
        if let Err(e) = self.facade.set_local_description(answer.clone()).await {
            self.fail(&format!("could not apply local answer: {}", e));
            return Err(e.into());
        }
        if let Err(e) = self.channel.publish_answer(&handle, answer).await {
            self.fail(&format!("could not publish answer: {}", e));
            return Err(e.into());
        }

        self.set_state(SessionState::Negotiating);

        // Kandidaten des Anrufers in die Anwendungs-Queue
        let tx = candidate_tx;
        let candidate_watch = self
            .relay
            .watch_remote(&handle, SessionRole::Callee, move |candidate| {
                let _ = tx.send(CandidateCommand::Apply(candidate));
            });

        self.store_subscriptions_callee(candidate_watch);
        Ok(())
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    /// Beendet den Call; mehrfacher Aufruf ist ein No-op
    ///
    /// Abonnements werden vor der Engine freigegeben, damit keine späte
    /// Zustellung mehr eine schon geschlossene Engine berührt.
    pub fn end(&self) {
        let (call_watch, candidate_watch, engine_pump, candidate_applier) = {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Closed {
                return;
            }
            inner.state = SessionState::Closed;
            inner.candidate_tx = None;
            (
                inner.call_watch.take(),
                inner.candidate_watch.take(),
                inner.engine_pump.take(),
                inner.candidate_applier.take(),
            )
        };

        if let Some(watch) = call_watch {
            watch.cancel();
        }
        if let Some(watch) = candidate_watch {
            watch.cancel();
        }
        if let Some(task) = engine_pump {
            task.abort();
        }
        if let Some(task) = candidate_applier {
            task.abort();
        }

        let facade = Arc::clone(&self.facade);
        tokio::spawn(async move {
            facade.close().await;
        });

        let _ = self
            .event_tx
            .send(SessionEvent::StateChanged(SessionState::Closed));
        tracing::info!("Call session closed");
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn choose_role(&self, role: SessionRole) -> Result<(), SessionError> {
        {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Idle {
                return Err(SessionError::AlreadyStarted);
            }
            inner.state = SessionState::RoleChosen;
            inner.role = Some(role);
        }
        tracing::info!("Session role chosen: {:?}", role);
        let _ = self
            .event_tx
            .send(SessionEvent::StateChanged(SessionState::RoleChosen));
        Ok(())
    }

    fn set_state(&self, new_state: SessionState) {
        self.inner.lock().state = new_state;
        let _ = self.event_tx.send(SessionEvent::StateChanged(new_state));
    }

    /// Übergang nach Connected, genau einmal und nur aus Negotiating
    fn transition_connected(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Negotiating {
                return;
            }
            inner.state = SessionState::Connected;
        }
        tracing::info!("Call connected");
        let _ = self
            .event_tx
            .send(SessionEvent::StateChanged(SessionState::Connected));
    }

    /// Meldet einen fatalen Fehler und schließt die Session
    fn fail(&self, message: &str) {
        tracing::error!("Call session failed: {}", message);
        let _ = self.event_tx.send(SessionEvent::Error(message.to_string()));
        self.end();
    }

    /// Leitet Engine-Events in die Session
    ///
    /// Lokale Kandidaten gehen in den Store; Zustandswechsel in den
    /// Sessionzustand. Failed/Disconnected ist fatal, ohne Reconnect.
    fn spawn_engine_pump(&self, handle: CallHandle, role: SessionRole) {
        let mut rx = self.facade.subscribe();
        let session = self.clone();

        let task = tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if session.state() == SessionState::Closed {
                    break;
                }
                match event {
                    EngineEvent::LocalCandidate(candidate) => {
                        tracing::debug!("Publishing local candidate for call {}", handle.id());
                        session.relay.publish_local(&handle, role, &candidate).await;
                    }
                    EngineEvent::StateChanged(ConnectionState::Connected) => {
                        session.transition_connected();
                    }
                    EngineEvent::StateChanged(ConnectionState::Failed) => {
                        session.fail("negotiation failed");
                    }
                    EngineEvent::StateChanged(state) => {
                        tracing::debug!("Connection state: {:?}", state);
                    }
                }
            }
        });
        self.inner.lock().engine_pump = Some(task);
    }

    /// Startet den Task, der entfernte Kandidaten serialisiert anwendet
    ///
    /// Frühe Kandidaten werden gepuffert, bis die Remote-Description steht;
    /// `Flush` spült den Puffer in Eintreffreihenfolge.
    fn spawn_candidate_applier(&self) -> mpsc::UnboundedSender<CandidateCommand> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = self.clone();

        let task = tokio::spawn(async move {
            let mut pending: Vec<CandidateRecord> = Vec::new();
            let mut remote_ready = false;

            while let Some(command) = rx.recv().await {
                if session.state() == SessionState::Closed {
                    break;
                }
                match command {
                    CandidateCommand::Apply(candidate) if remote_ready => {
                        if let Err(e) = session.facade.add_candidate(candidate).await {
                            tracing::warn!("Failed to apply remote candidate: {}", e);
                        }
                    }
                    CandidateCommand::Apply(candidate) => pending.push(candidate),
                    CandidateCommand::Flush => {
                        remote_ready = true;
                        for candidate in pending.drain(..) {
                            if let Err(e) = session.facade.add_candidate(candidate).await {
                                tracing::warn!("Failed to apply buffered candidate: {}", e);
                            }
                        }
                    }
                }
            }
        });

        let mut inner = self.inner.lock();
        inner.candidate_applier = Some(task);
        inner.candidate_tx = Some(tx.clone());
        tx
    }

    fn store_subscriptions(&self, call_watch: Subscription, candidate_watch: Subscription) {
        let mut inner = self.inner.lock();
        // end() kann während des Aufbaus gelaufen sein
        if inner.state == SessionState::Closed {
            drop(inner);
            call_watch.cancel();
            candidate_watch.cancel();
            return;
        }
        inner.call_watch = Some(call_watch);
        inner.candidate_watch = Some(candidate_watch);
    }

    fn store_subscriptions_callee(&self, candidate_watch: Subscription) {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Closed {
            drop(inner);
            candidate_watch.cancel();
            return;
        }
        inner.candidate_watch = Some(candidate_watch);
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CallSession")
            .field("state", &inner.state)
            .field("role", &inner.role)
            .field("call_id", &inner.handle.as_ref().map(|h| h.id()))
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{DocPath, MemoryStore, SignalingStore};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    // ------------------------------------------------------------------------
    // Skript-Double für die Engine
    // ------------------------------------------------------------------------

    struct MockConnection {
        offer_sdp: &'static str,
        answer_sdp: &'static str,
        local: Mutex<Vec<SessionDescription>>,
        remote: Mutex<Vec<SessionDescription>>,
        added: Mutex<Vec<CandidateRecord>>,
        closed: Mutex<bool>,
        event_tx: broadcast::Sender<EngineEvent>,
    }

    impl MockConnection {
        fn new(offer_sdp: &'static str, answer_sdp: &'static str) -> Arc<Self> {
            let (event_tx, _) = broadcast::channel(100);
            Arc::new(Self {
                offer_sdp,
                answer_sdp,
                local: Mutex::new(Vec::new()),
                remote: Mutex::new(Vec::new()),
                added: Mutex::new(Vec::new()),
                closed: Mutex::new(false),
                event_tx,
            })
        }

        fn emit(&self, event: EngineEvent) {
            let _ = self.event_tx.send(event);
        }

        fn remote_applications(&self) -> Vec<SessionDescription> {
            self.remote.lock().clone()
        }

        fn added_candidates(&self) -> Vec<CandidateRecord> {
            self.added.lock().clone()
        }
    }

    #[async_trait::async_trait]
    impl ConnectionFacade for MockConnection {
        async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
            Ok(SessionDescription::offer(self.offer_sdp))
        }

        async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
            Ok(SessionDescription::answer(self.answer_sdp))
        }

        async fn set_local_description(
            &self,
            desc: SessionDescription,
        ) -> Result<(), EngineError> {
            self.local.lock().push(desc);
            Ok(())
        }

        async fn set_remote_description(
            &self,
            desc: SessionDescription,
        ) -> Result<(), EngineError> {
            let mut remote = self.remote.lock();
            if !remote.is_empty() {
                // Spiegelung des Engine-Guards: Duplikat ist No-op
                return Ok(());
            }
            remote.push(desc);
            Ok(())
        }

        fn remote_description_set(&self) -> bool {
            !self.remote.lock().is_empty()
        }

        async fn add_candidate(&self, candidate: CandidateRecord) -> Result<(), EngineError> {
            self.added.lock().push(candidate);
            Ok(())
        }

        fn set_audio_enabled(&self, _enabled: bool) {}

        fn set_video_enabled(&self, _enabled: bool) {}

        fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
            self.event_tx.subscribe()
        }

        async fn close(&self) {
            *self.closed.lock() = true;
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn session_over(
        store: &Arc<MemoryStore>,
        facade: Arc<MockConnection>,
    ) -> CallSession {
        let store: Arc<dyn SignalingStore> = Arc::clone(store) as Arc<dyn SignalingStore>;
        CallSession::new(
            SignalingChannel::new(Arc::clone(&store)),
            CandidateRelay::new(store),
            facade,
        )
    }

    async fn wait_for_state(rx: &mut broadcast::Receiver<SessionEvent>, want: SessionState) {
        timeout(Duration::from_secs(2), async {
            loop {
                match rx.recv().await {
                    Ok(SessionEvent::StateChanged(state)) if state == want => break,
                    Ok(_) => {}
                    Err(e) => panic!("event stream ended: {}", e),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}", want));
    }

    fn candidate(payload: &str) -> CandidateRecord {
        CandidateRecord {
            candidate: payload.to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    // ------------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_empty_call_id_is_rejected_before_store_access() {
        let store = Arc::new(MemoryStore::new());
        let session = session_over(&store, MockConnection::new("O", "A"));

        let result = session.join("   ").await;
        assert!(matches!(result, Err(SessionError::InvalidCallId)));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_join_unknown_call_closes_without_answer() {
        let store = Arc::new(MemoryStore::new());
        let mock = MockConnection::new("O", "A");
        let session = session_over(&store, Arc::clone(&mock));

        let result = session.join("does-not-exist").await;
        assert!(matches!(result, Err(SessionError::CallNotFound(_))));
        assert_eq!(session.state(), SessionState::Closed);

        // Es wurde nie ein Answer veröffentlicht oder erzeugt
        assert!(mock.local.lock().is_empty());
        assert!(store
            .get_document(&DocPath::new("calls", "does-not-exist"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_join_call_without_offer_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let session = session_over(&store, MockConnection::new("O", "A"));

        // Dokument existiert, trägt aber kein Offer
        let channel = SignalingChannel::new(Arc::clone(&store) as Arc<dyn SignalingStore>);
        let handle = channel.create_call().await.unwrap();

        let result = session.join(handle.id()).await;
        assert!(matches!(result, Err(SessionError::CallNotFound(_))));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_second_start_on_same_session_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let session = session_over(&store, MockConnection::new("O", "A"));

        session.start_as_caller().await.unwrap();
        let again = session.start_as_caller().await;
        assert!(matches!(again, Err(SessionError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn test_caller_applies_answer_exactly_once() {
        let store = Arc::new(MemoryStore::new());
        let mock = MockConnection::new("O1", "unused");
        let session = session_over(&store, Arc::clone(&mock));
        let mut events = session.subscribe();

        let call_id = session.start_as_caller().await.unwrap();
        assert_eq!(session.state(), SessionState::Negotiating);

        let path = DocPath::new("calls", call_id);
        let answer = json!({ "type": "answer", "sdp": "A1" });

        // Dieselbe Answer-Payload mehrfach zustellen (Store-Re-Sync)
        store
            .merge_fields(&path, json!({ "answer": answer }))
            .await
            .unwrap();
        store
            .merge_fields(&path, json!({ "answer": answer }))
            .await
            .unwrap();

        wait_for_state(&mut events, SessionState::Connected).await;

        // Ein weiterer stale Stand darf nichts mehr auslösen
        store
            .merge_fields(&path, json!({ "answer": answer }))
            .await
            .unwrap();
        sleep(Duration::from_millis(50)).await;

        let applied = mock.remote_applications();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].sdp, "A1");
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_candidates_buffered_until_answer_then_flushed_in_order() {
        let store = Arc::new(MemoryStore::new());
        let mock = MockConnection::new("O1", "unused");
        let session = session_over(&store, Arc::clone(&mock));
        let mut events = session.subscribe();

        let call_id = session.start_as_caller().await.unwrap();

        // Die Gegenseite schickt Kandidaten, bevor ihr Answer ankommt
        let store_dyn: Arc<dyn SignalingStore> = Arc::clone(&store) as Arc<dyn SignalingStore>;
        let channel = SignalingChannel::new(Arc::clone(&store_dyn));
        let relay = CandidateRelay::new(store_dyn);
        let handle = channel.open_call(&call_id);
        relay
            .publish_local(&handle, SessionRole::Callee, &candidate("c1"))
            .await;
        relay
            .publish_local(&handle, SessionRole::Callee, &candidate("c2"))
            .await;

        sleep(Duration::from_millis(50)).await;
        assert!(mock.added_candidates().is_empty(), "must buffer before answer");

        store
            .merge_fields(
                &DocPath::new("calls", call_id),
                json!({ "answer": { "type": "answer", "sdp": "A1" } }),
            )
            .await
            .unwrap();
        wait_for_state(&mut events, SessionState::Connected).await;

        // Nach dem Answer kommen weitere direkt durch
        relay
            .publish_local(&handle, SessionRole::Callee, &candidate("c3"))
            .await;
        sleep(Duration::from_millis(50)).await;

        let added: Vec<String> = mock
            .added_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(added, vec!["c1", "c2", "c3"]);
    }

    #[tokio::test]
    async fn test_local_candidates_are_published_to_own_bucket() {
        let store = Arc::new(MemoryStore::new());
        let mock = MockConnection::new("O1", "unused");
        let session = session_over(&store, Arc::clone(&mock));

        let call_id = session.start_as_caller().await.unwrap();

        let mut bucket =
            store.watch_collection(&format!("calls/{}/offerCandidates", call_id));
        mock.emit(EngineEvent::LocalCandidate(candidate("local-1")));

        let change = timeout(Duration::from_secs(1), bucket.recv())
            .await
            .unwrap()
            .unwrap();
        match change {
            crate::signaling::CollectionChange::Added { value, .. } => {
                assert_eq!(value["candidate"], "local-1")
            }
            other => panic!("unexpected change: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_end_to_end_call_over_memory_store() {
        let store = Arc::new(MemoryStore::new());

        let caller_mock = MockConnection::new("O1", "unused");
        let callee_mock = MockConnection::new("unused", "A1");
        let caller = session_over(&store, Arc::clone(&caller_mock));
        let callee = session_over(&store, Arc::clone(&callee_mock));

        let mut caller_events = caller.subscribe();

        let call_id = caller.start_as_caller().await.unwrap();
        callee.join(&call_id).await.unwrap();

        // Callee hat das Offer angewandt und sein Answer veröffentlicht
        assert_eq!(callee_mock.remote_applications()[0].sdp, "O1");
        assert_eq!(callee.state(), SessionState::Negotiating);

        // Caller sieht das Answer über den Watch und verbindet
        wait_for_state(&mut caller_events, SessionState::Connected).await;
        assert_eq!(caller_mock.remote_applications()[0].sdp, "A1");

        // Callee verbindet über den Engine-Callback, nicht über den Store
        let mut callee_events = callee.subscribe();
        callee_mock.emit(EngineEvent::StateChanged(ConnectionState::Connected));
        wait_for_state(&mut callee_events, SessionState::Connected).await;
    }

    #[tokio::test]
    async fn test_engine_failure_closes_session() {
        let store = Arc::new(MemoryStore::new());
        let mock = MockConnection::new("O1", "unused");
        let session = session_over(&store, Arc::clone(&mock));
        let mut events = session.subscribe();

        session.start_as_caller().await.unwrap();
        mock.emit(EngineEvent::StateChanged(ConnectionState::Failed));

        wait_for_state(&mut events, SessionState::Closed).await;
        sleep(Duration::from_millis(50)).await;
        assert!(*mock.closed.lock());
    }

    #[tokio::test]
    async fn test_late_candidate_after_end_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let caller_mock = MockConnection::new("O1", "unused");
        let callee_mock = MockConnection::new("unused", "A1");
        let caller = session_over(&store, Arc::clone(&caller_mock));
        let callee = session_over(&store, Arc::clone(&callee_mock));

        let mut caller_events = caller.subscribe();
        let call_id = caller.start_as_caller().await.unwrap();
        callee.join(&call_id).await.unwrap();
        wait_for_state(&mut caller_events, SessionState::Connected).await;

        let before = caller_mock.added_candidates().len();
        caller.end();
        assert_eq!(caller.state(), SessionState::Closed);

        // Späte Kandidaten der Gegenseite dürfen die Engine nicht mehr erreichen
        let store_dyn: Arc<dyn SignalingStore> = Arc::clone(&store) as Arc<dyn SignalingStore>;
        let relay = CandidateRelay::new(Arc::clone(&store_dyn));
        let handle = SignalingChannel::new(store_dyn).open_call(&call_id);
        relay
            .publish_local(&handle, SessionRole::Callee, &candidate("late"))
            .await;
        sleep(Duration::from_millis(50)).await;

        assert_eq!(caller_mock.added_candidates().len(), before);

        // end ist idempotent
        caller.end();
        sleep(Duration::from_millis(50)).await;
        assert!(*caller_mock.closed.lock());
    }
}
