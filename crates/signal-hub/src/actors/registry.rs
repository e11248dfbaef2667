//! `RegistryActor` - singleton supervisor owning the session map.
//!
//! The registry is the only component that creates or removes sessions:
//!
//! - Creates a `SessionActor` on the first join to an unseen session id
//! - Hands out session handles so per-session operations bypass the registry
//! - Removes sessions that stayed empty past the grace period, serialized
//!   with joins so removal can never race a peer back in
//! - Owns the root `CancellationToken` for graceful shutdown
//!
//! # Graceful Shutdown
//!
//! On shutdown the registry stops accepting joins, cancels the root token
//! (propagating to every session actor) and waits for sessions to drain
//! within a deadline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::TopologySettings;
use crate::errors::HubError;
use crate::observability::HubMetrics;

use super::messages::{JoinAccepted, PeerSink, RegistryMessage, RegistryStatus};
use super::session::{SessionActor, SessionHandle};

/// Channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// Handle to the `RegistryActor`.
///
/// This is the public interface of the session registry. Cloneable; all
/// methods are async and use oneshot channels for replies.
#[derive(Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RegistryHandle {
    /// Create a new `RegistryActor` and return a handle to it.
    #[must_use]
    pub fn new(settings: TopologySettings, metrics: Arc<HubMetrics>) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = RegistryActor {
            receiver,
            cancel_token: cancel_token.clone(),
            sessions: HashMap::new(),
            accepting_new: true,
            settings,
            metrics,
        };

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    /// Admit a peer into a session, creating the session on first join.
    ///
    /// Returns the join result and a handle for the connection to use for
    /// subsequent per-session operations.
    pub async fn join(
        &self,
        session_id: String,
        identity: String,
        relay_capable: bool,
        connection_id: String,
        sink: PeerSink,
    ) -> Result<(JoinAccepted, SessionHandle), HubError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::Join {
                session_id,
                identity,
                relay_capable,
                connection_id,
                sink,
                respond_to: tx,
            })
            .await
            .map_err(|e| HubError::RegistryUnavailable(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| HubError::RegistryUnavailable(format!("response receive failed: {e}")))?
    }

    /// Handles to all active sessions.
    pub async fn sessions(&self) -> Result<Vec<SessionHandle>, HubError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::Sessions { respond_to: tx })
            .await
            .map_err(|e| HubError::RegistryUnavailable(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| HubError::RegistryUnavailable(format!("response receive failed: {e}")))
    }

    /// Remove a session if it has been empty for at least `grace`.
    /// Returns whether the session was removed.
    pub async fn remove_if_empty(
        &self,
        session_id: String,
        grace: Duration,
    ) -> Result<bool, HubError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::RemoveIfEmpty {
                session_id,
                grace,
                respond_to: tx,
            })
            .await
            .map_err(|e| HubError::RegistryUnavailable(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| HubError::RegistryUnavailable(format!("response receive failed: {e}")))
    }

    /// Current registry status.
    pub async fn status(&self) -> Result<RegistryStatus, HubError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::Status { respond_to: tx })
            .await
            .map_err(|e| HubError::RegistryUnavailable(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| HubError::RegistryUnavailable(format!("response receive failed: {e}")))
    }

    /// Initiate graceful shutdown.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), HubError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::Shutdown {
                deadline,
                respond_to: tx,
            })
            .await
            .map_err(|e| HubError::RegistryUnavailable(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| HubError::RegistryUnavailable(format!("response receive failed: {e}")))?
    }

    /// Cancel the actor (immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Get a child token tied to the registry's lifetime.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// Internal state for a managed session.
struct ManagedSession {
    handle: SessionHandle,
    task_handle: JoinHandle<()>,
}

/// The `RegistryActor` implementation.
struct RegistryActor {
    receiver: mpsc::Receiver<RegistryMessage>,
    cancel_token: CancellationToken,
    sessions: HashMap<String, ManagedSession>,
    accepting_new: bool,
    settings: TopologySettings,
    metrics: Arc<HubMetrics>,
}

impl RegistryActor {
    /// Run the actor message loop.
    #[instrument(skip_all, name = "hub.actor.registry")]
    async fn run(mut self) {
        info!(target: "hub.actor.registry", "RegistryActor started");

        loop {
            self.reap_finished_sessions().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "hub.actor.registry",
                        "RegistryActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => self.handle_message(message).await,
                        None => {
                            info!(
                                target: "hub.actor.registry",
                                "RegistryActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "hub.actor.registry",
            sessions_remaining = self.sessions.len(),
            "RegistryActor stopped"
        );
    }

    /// Handle a single message.
    async fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::Join {
                session_id,
                identity,
                relay_capable,
                connection_id,
                sink,
                respond_to,
            } => {
                let result = self
                    .handle_join(session_id, identity, relay_capable, connection_id, sink)
                    .await;
                let _ = respond_to.send(result);
            }

            RegistryMessage::Sessions { respond_to } => {
                let handles = self
                    .sessions
                    .values()
                    .map(|m| m.handle.clone())
                    .collect();
                let _ = respond_to.send(handles);
            }

            RegistryMessage::RemoveIfEmpty {
                session_id,
                grace,
                respond_to,
            } => {
                let removed = self.handle_remove_if_empty(&session_id, grace).await;
                let _ = respond_to.send(removed);
            }

            RegistryMessage::Status { respond_to } => {
                let _ = respond_to.send(RegistryStatus {
                    session_count: self.sessions.len(),
                    peer_count: self.metrics.peer_count(),
                    is_draining: !self.accepting_new,
                });
            }

            RegistryMessage::Shutdown {
                deadline: _,
                respond_to,
            } => {
                info!(
                    target: "hub.actor.registry",
                    session_count = self.sessions.len(),
                    "Initiating graceful shutdown"
                );
                self.accepting_new = false;
                self.cancel_token.cancel();
                let _ = respond_to.send(Ok(()));
            }
        }
    }

    /// Admit a peer, creating the session actor if this is the first join.
    async fn handle_join(
        &mut self,
        session_id: String,
        identity: String,
        relay_capable: bool,
        connection_id: String,
        sink: PeerSink,
    ) -> Result<(JoinAccepted, SessionHandle), HubError> {
        if !self.accepting_new {
            return Err(HubError::Draining);
        }

        if !self.sessions.contains_key(&session_id) {
            debug!(
                target: "hub.actor.registry",
                session_id = %session_id,
                "Creating session actor on first join"
            );

            let session_token = self.cancel_token.child_token();
            let (handle, task_handle) = SessionActor::spawn(
                session_id.clone(),
                session_token,
                self.settings,
                Arc::clone(&self.metrics),
            );

            self.sessions.insert(
                session_id.clone(),
                ManagedSession {
                    handle,
                    task_handle,
                },
            );
            self.metrics.session_created();

            info!(
                target: "hub.actor.registry",
                session_id = %session_id,
                total_sessions = self.sessions.len(),
                "Session created"
            );
        }

        let handle = self
            .sessions
            .get(&session_id)
            .map(|m| m.handle.clone())
            .ok_or_else(|| HubError::SessionNotFound(session_id.clone()))?;

        let accepted = handle
            .join(identity, relay_capable, connection_id, sink)
            .await?;

        Ok((accepted, handle))
    }

    /// Remove a session that has stayed empty past the grace period.
    ///
    /// The emptiness re-check happens here, after any queued joins have been
    /// processed, so a peer joining concurrently always wins.
    async fn handle_remove_if_empty(&mut self, session_id: &str, grace: Duration) -> bool {
        let Some(managed) = self.sessions.get(session_id) else {
            return false;
        };

        let expired = match managed.handle.snapshot().await {
            Ok(snapshot) => {
                snapshot.peers.is_empty() && snapshot.empty_for.is_some_and(|d| d >= grace)
            }
            Err(e) => {
                // Unreachable actor: treat as dead and clean it up.
                warn!(
                    target: "hub.actor.registry",
                    session_id = %session_id,
                    error = %e,
                    "Session actor unreachable, removing"
                );
                true
            }
        };

        if !expired {
            return false;
        }

        if let Some(managed) = self.sessions.remove(session_id) {
            managed.handle.cancel();
            self.metrics.session_removed();

            // Wait for the task off the message loop.
            let session_id_owned = session_id.to_string();
            tokio::spawn(async move {
                match tokio::time::timeout(Duration::from_secs(5), managed.task_handle).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(
                            target: "hub.actor.registry",
                            session_id = %session_id_owned,
                            error = ?e,
                            "Session actor task panicked during removal"
                        );
                    }
                    Err(_) => {
                        warn!(
                            target: "hub.actor.registry",
                            session_id = %session_id_owned,
                            "Session actor task cleanup timed out"
                        );
                    }
                }
            });

            info!(
                target: "hub.actor.registry",
                session_id = %session_id,
                total_sessions = self.sessions.len(),
                "Empty session removed"
            );
            return true;
        }

        false
    }

    /// Drop entries whose actor task has already finished.
    async fn reap_finished_sessions(&mut self) {
        let finished: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, m)| m.task_handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        for session_id in finished {
            if let Some(managed) = self.sessions.remove(&session_id) {
                match managed.task_handle.await {
                    Ok(()) => {
                        info!(
                            target: "hub.actor.registry",
                            session_id = %session_id,
                            "Session actor exited cleanly"
                        );
                    }
                    Err(join_error) => {
                        if join_error.is_panic() {
                            error!(
                                target: "hub.actor.registry",
                                session_id = %session_id,
                                error = ?join_error,
                                "Session actor panicked"
                            );
                        }
                    }
                }
                self.metrics.session_removed();
            }
        }
    }

    /// Perform graceful shutdown: cancel and drain every session actor.
    async fn graceful_shutdown(&mut self) {
        info!(
            target: "hub.actor.registry",
            session_count = self.sessions.len(),
            "Performing graceful shutdown"
        );

        self.accepting_new = false;

        for managed in self.sessions.values() {
            managed.handle.cancel();
        }

        for (session_id, managed) in self.sessions.drain() {
            match tokio::time::timeout(Duration::from_secs(5), managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "hub.actor.registry",
                        session_id = %session_id,
                        "Session actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "hub.actor.registry",
                        session_id = %session_id,
                        error = ?e,
                        "Session actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "hub.actor.registry",
                        session_id = %session_id,
                        "Session actor shutdown timed out"
                    );
                }
            }
            self.metrics.session_removed();
        }

        info!(target: "hub.actor.registry", "Graceful shutdown complete");
    }
}
