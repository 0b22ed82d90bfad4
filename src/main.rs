//! Loopback-Demo: zwei Call-Sessions im selben Prozess
//!
//! Beide Seiten teilen sich einen `MemoryStore` als Signaling-Kanal und
//! verhandeln darüber eine echte WebRTC-Verbindung. Zeigt den kompletten
//! Ablauf Anlegen → Beitreten → Verbunden → Auflegen ohne externe Dienste.

use anyhow::Context;
use relaycall::{
    default_ice_servers, CallSession, CandidateRelay, MemoryStore, RtcConnection, SessionEvent,
    SessionState, SignalingChannel, SignalingStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

fn session_over(store: Arc<dyn SignalingStore>, facade: Arc<RtcConnection>) -> CallSession {
    CallSession::new(
        SignalingChannel::new(Arc::clone(&store)),
        CandidateRelay::new(store),
        facade,
    )
}

async fn wait_for(
    rx: &mut broadcast::Receiver<SessionEvent>,
    want: SessionState,
) -> anyhow::Result<()> {
    timeout(Duration::from_secs(15), async {
        loop {
            match rx.recv().await? {
                SessionEvent::StateChanged(state) if state == want => return Ok(()),
                SessionEvent::Error(message) => anyhow::bail!("session error: {}", message),
                _ => {}
            }
        }
    })
    .await
    .with_context(|| format!("timed out waiting for {:?}", want))?
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    relaycall::init_logging();

    let store: Arc<dyn SignalingStore> = Arc::new(MemoryStore::new());

    let caller_rtc = Arc::new(RtcConnection::new(default_ice_servers()).await?);
    let callee_rtc = Arc::new(RtcConnection::new(default_ice_servers()).await?);

    let caller = session_over(Arc::clone(&store), caller_rtc);
    let callee = session_over(store, callee_rtc);

    let mut caller_events = caller.subscribe();
    let mut callee_events = callee.subscribe();

    let call_id = caller.start_as_caller().await?;
    tracing::info!("Call created, id: {}", call_id);

    callee.join(&call_id).await?;

    wait_for(&mut caller_events, SessionState::Connected).await?;
    wait_for(&mut callee_events, SessionState::Connected).await?;
    tracing::info!("Both sides connected, hanging up");

    caller.end();
    callee.end();
    Ok(())
}
