//! Connection manager: composes one session and one message layer, and
//! exposes the two bootstrap entry points (local code, remote lookup).

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use paircast_token::{
    BootstrapToken, CandidateInit, SessionDescription, TokenDecodeError, TokenEncodeError,
    TokenValidationError, now_ms, wire,
};
use paircast_transport::{TransportError, TransportFactory};

use crate::config::{ManagerConfig, RetryBootstrap};
use crate::directory::{DirectoryClient, DirectoryError};
use crate::message::{ApplicationMessage, MessageError, MessageLayer, RetryReport};
use crate::session::{
    ConnectionSession, ResponderAnswer, SessionError, SessionEvent, SessionEvents, SessionRole,
    SessionState,
};

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    TokenDecode(#[from] TokenDecodeError),
    #[error(transparent)]
    TokenEncode(#[from] TokenEncodeError),
    #[error(transparent)]
    TokenValidation(#[from] TokenValidationError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("no active session")]
    NoSession,
    #[error("no directory client configured")]
    NoDirectory,
}

/// Events surfaced to the embedding application.
#[derive(Debug)]
pub enum ManagerEvent {
    SessionState(SessionState),
    MessageReceived(ApplicationMessage),
    RetryScheduled { attempt: u32, delay: Duration },
    /// The backoff window elapsed and the bootstrap is the caller's to
    /// re-run (manual re-bootstrap policy).
    RetryReady { attempt: u32 },
    Terminated { reason: String },
}

#[derive(Clone)]
enum BootstrapAction {
    LocalOffer { trickle: bool },
    RemoteLookup { username: String },
}

pub struct ConnectionManager {
    /// Self-handle for the tasks the manager spawns.
    weak: Weak<ConnectionManager>,
    config: ManagerConfig,
    factory: Arc<dyn TransportFactory>,
    directory: Option<DirectoryClient>,
    messages: Arc<MessageLayer>,
    session: Mutex<Option<Arc<ConnectionSession>>>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    last_bootstrap: Mutex<Option<BootstrapAction>>,
    retry_attempts: AtomicU32,
    events_tx: mpsc::UnboundedSender<ManagerEvent>,
}

impl ConnectionManager {
    pub fn new(
        config: ManagerConfig,
        factory: Arc<dyn TransportFactory>,
        directory: Option<DirectoryClient>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ManagerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let messages = Arc::new(MessageLayer::new(config.messages));
        let manager = Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            config,
            factory,
            directory,
            messages,
            session: Mutex::new(None),
            loop_task: Mutex::new(None),
            last_bootstrap: Mutex::new(None),
            retry_attempts: AtomicU32::new(0),
            events_tx,
        });
        (manager, events_rx)
    }

    pub fn messages(&self) -> &MessageLayer {
        &self.messages
    }

    pub fn session(&self) -> Option<Arc<ConnectionSession>> {
        self.session.lock().clone()
    }

    /// Armors a token for a transmission channel (code image, URL, HTTP
    /// body): binary codec wrapped in standard base64.
    pub fn encode_token(token: &BootstrapToken) -> Result<String, ManagerError> {
        Ok(BASE64.encode(wire::encode_token(token)?))
    }

    /// Reverses [`Self::encode_token`]; the inner decode accepts the legacy
    /// JSON form as well.
    pub fn decode_token(encoded: &str) -> Result<BootstrapToken, ManagerError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|_| TokenDecodeError::Malformed("invalid base64"))?;
        Ok(wire::decode_token(&bytes)?)
    }

    /// Local-code path, initiating side: produces the token to render as a
    /// code image.
    pub async fn create_offer(&self, trickle: bool) -> Result<BootstrapToken, ManagerError> {
        let session = self.start_session(SessionRole::Initiator).await?;
        let token = session.begin_as_initiator(trickle).await?;
        *self.last_bootstrap.lock() = Some(BootstrapAction::LocalOffer { trickle });
        Ok(token)
    }

    /// Local-code path, responding side: joins a scanned token. A returned
    /// [`ResponderAnswer`] must travel back out-of-band and be fed to
    /// [`Self::complete_offer`] on the initiating device.
    pub async fn join_with_token(
        &self,
        token: &BootstrapToken,
    ) -> Result<Option<ResponderAnswer>, ManagerError> {
        token
            .metadata
            .ensure_fresh(now_ms(), self.config.token_max_age)?;
        let session = self.start_session(SessionRole::Responder).await?;
        Ok(session.begin_as_responder(token).await?)
    }

    /// Applies the reverse token from the responder (non-trickle path).
    pub async fn complete_offer(
        &self,
        answer: SessionDescription,
        candidates: Vec<CandidateInit>,
    ) -> Result<(), ManagerError> {
        let session = self.session().ok_or(ManagerError::NoSession)?;
        session.complete_as_initiator(answer, candidates).await?;
        Ok(())
    }

    /// Remote-lookup path: hands an armored token to the directory under
    /// `username` with the configured TTL.
    pub async fn publish(&self, username: &str, token: &BootstrapToken) -> Result<(), ManagerError> {
        let directory = self.directory.as_ref().ok_or(ManagerError::NoDirectory)?;
        let encoded = Self::encode_token(token)?;
        directory
            .publish(username, &encoded, self.config.publish_ttl)
            .await?;
        Ok(())
    }

    /// Remote-lookup path: fetches the token published under `username`,
    /// validates freshness and joins.
    pub async fn lookup_and_join(
        &self,
        username: &str,
    ) -> Result<Option<ResponderAnswer>, ManagerError> {
        let directory = self.directory.as_ref().ok_or(ManagerError::NoDirectory)?;
        let response = directory.lookup(username).await?;
        let token = Self::decode_token(&response.token)?;
        let reply = self.join_with_token(&token).await?;
        *self.last_bootstrap.lock() = Some(BootstrapAction::RemoteLookup {
            username: username.to_string(),
        });
        Ok(reply)
    }

    /// Removes a previously published token.
    pub async fn unpublish(&self, username: &str) -> Result<(), ManagerError> {
        let directory = self.directory.as_ref().ok_or(ManagerError::NoDirectory)?;
        directory.delete(username).await?;
        Ok(())
    }

    /// Validates, stamps and sends one application message. A `NotReady`
    /// error means the message was queued, not dropped.
    pub async fn send_message(
        &self,
        kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<ApplicationMessage, ManagerError> {
        let session = self.session().ok_or(ManagerError::NoSession)?;
        let message = self.messages.create_message(kind, payload)?;
        self.messages
            .send(message.clone(), session.as_ref())
            .await?;
        Ok(message)
    }

    /// Manual retry pacing: drains the outbound queue through the current
    /// session.
    pub async fn retry_queued(&self) -> Result<RetryReport, ManagerError> {
        let session = self.session().ok_or(ManagerError::NoSession)?;
        Ok(self.messages.retry_queued(session.as_ref()).await)
    }

    /// Bounded wait until the current session reports `Connected`.
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<(), ManagerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.session() {
                Some(session) if session.state() == SessionState::Connected => return Ok(()),
                Some(session) if session.state().is_terminal() => {
                    return Err(ManagerError::Timeout("connection"));
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ManagerError::Timeout("connection"));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Closes the active session and detaches its event loop.
    pub async fn close(&self) {
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.close().await;
        }
        if let Some(task) = self.loop_task.lock().take() {
            task.abort();
        }
    }

    async fn start_session(&self, role: SessionRole) -> Result<Arc<ConnectionSession>, ManagerError> {
        let previous = self.session.lock().take();
        if let Some(previous) = previous {
            previous.close().await;
        }
        if let Some(task) = self.loop_task.lock().take() {
            task.abort();
        }
        let (transport, transport_events) = self.factory.create().await?;
        let (session, session_events) = ConnectionSession::new(
            role,
            transport,
            transport_events,
            self.config.session.clone(),
        );
        *self.session.lock() = Some(session.clone());
        if let Some(manager) = self.weak.upgrade() {
            let loop_session = session.clone();
            let task = tokio::spawn(async move {
                run_session_loop(manager, loop_session, session_events).await;
            });
            *self.loop_task.lock() = Some(task);
        }
        Ok(session)
    }

    fn handle_failure(&self) {
        let policy = &self.config.retry;
        if !policy.auto_retry {
            let _ = self.events_tx.send(ManagerEvent::Terminated {
                reason: "transport failed".to_string(),
            });
            return;
        }
        let attempt = self.retry_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > policy.max_retries {
            let _ = self.events_tx.send(ManagerEvent::Terminated {
                reason: format!("transport failed after {} retries", policy.max_retries),
            });
            return;
        }
        let delay = policy.backoff_delay(attempt);
        let _ = self
            .events_tx
            .send(ManagerEvent::RetryScheduled { attempt, delay });
        let Some(manager) = self.weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let action = manager.last_bootstrap.lock().clone();
            match (manager.config.retry.rebootstrap, action) {
                (RetryBootstrap::Automatic, Some(BootstrapAction::RemoteLookup { username })) => {
                    debug!(target: "paircast::manager", %username, attempt, "re-running remote-lookup bootstrap");
                    if let Err(err) = manager.lookup_and_join(&username).await {
                        let _ = manager.events_tx.send(ManagerEvent::Terminated {
                            reason: format!("re-bootstrap failed: {err}"),
                        });
                    }
                }
                _ => {
                    let _ = manager.events_tx.send(ManagerEvent::RetryReady { attempt });
                }
            }
        });
    }
}

async fn run_session_loop(
    manager: Arc<ConnectionManager>,
    session: Arc<ConnectionSession>,
    mut events: SessionEvents,
) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::StateChanged(state) => {
                let _ = manager.events_tx.send(ManagerEvent::SessionState(state));
                match state {
                    SessionState::Connected => {
                        manager.retry_attempts.store(0, Ordering::SeqCst);
                        let report = manager.messages.retry_queued(session.as_ref()).await;
                        if report.sent > 0 {
                            debug!(
                                target: "paircast::manager",
                                sent = report.sent,
                                "flushed queued messages on connect"
                            );
                        }
                    }
                    SessionState::Failed => manager.handle_failure(),
                    _ => {}
                }
            }
            SessionEvent::ChannelOpen => {
                let _ = manager.messages.retry_queued(session.as_ref()).await;
            }
            SessionEvent::ApplicationFrame(value) => {
                match manager.messages.process_incoming_value(value) {
                    Ok(report) => {
                        if !report.failures.is_empty() {
                            warn!(
                                target: "paircast::manager",
                                message = %report.message.id,
                                failures = report.failures.len(),
                                "handler failures during dispatch"
                            );
                        }
                        let _ = manager
                            .events_tx
                            .send(ManagerEvent::MessageReceived(report.message));
                    }
                    Err(err) => {
                        warn!(target: "paircast::manager", error = %err, "incoming message rejected");
                    }
                }
            }
            SessionEvent::TransportFailure(reason) => {
                warn!(target: "paircast::manager", session = %session.id(), %reason, "transport failure");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_armoring_round_trips() {
        let mut metadata = paircast_token::TokenMetadata::new("conn-1", true);
        metadata.created_at_ms = 7;
        let token = BootstrapToken::new(
            SessionDescription::offer("v=0\r\n"),
            Vec::new(),
            metadata,
        );
        let encoded = ConnectionManager::encode_token(&token).expect("encode");
        let decoded = ConnectionManager::decode_token(&encoded).expect("decode");
        assert_eq!(token, decoded);
    }

    #[test]
    fn decode_rejects_invalid_base64() {
        let err = ConnectionManager::decode_token("not-base64!!!").expect_err("reject");
        assert!(matches!(
            err,
            ManagerError::TokenDecode(TokenDecodeError::Malformed("invalid base64"))
        ));
    }

    #[test]
    fn armored_legacy_json_still_decodes() {
        let json = r#"{"offer":{"type":"offer","sdp":"v=0\r\n"},"metadata":{"createdAt":7,"connectionId":"legacy","trickleIce":true}}"#;
        let encoded = BASE64.encode(json);
        let decoded = ConnectionManager::decode_token(&encoded).expect("decode");
        assert_eq!(decoded.metadata.connection_id, "legacy");
        assert!(decoded.is_trickle());
    }
}
