//! CDP Session - Represents a connection to a specific browser target
//!
//! Design: Lightweight handle sharing the connection's single transport.
//! Each session owns the pending commands it issued, so tearing one down
//! fails exactly its own waiters.

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::connection::CDPConnection;
use super::protocol::{CDPErrorPayload, CDPRequest, ProtocolEvent, RequestId, SessionId, TargetId};
use crate::error::{CDPError, Result};
use crate::events::{EventEmitter, Subscription};

/// What a session's listeners receive
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Protocol(ProtocolEvent),
    /// The session is gone; no further events follow
    Detached,
}

/// Why a session stopped accepting commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    Detached,
    ConnectionClosed,
}

struct PendingCommand {
    method: String,
    tx: oneshot::Sender<Result<Value>>,
}

/// CDP Session bound to a specific target
pub struct CDPSession {
    /// Session ID assigned by Chrome (empty for the browser session)
    id: SessionId,

    /// Target this session is attached to
    target_id: TargetId,

    target_type: String,

    /// Session the attach was reported on (None = browser session)
    parent_id: Option<SessionId>,

    connection: Weak<CDPConnection>,

    pending: DashMap<RequestId, PendingCommand>,

    events: EventEmitter<SessionEvent>,

    closed: OnceLock<CloseReason>,

    protocol_timeout: Option<Duration>,
}

impl CDPSession {
    pub(crate) fn new(
        id: SessionId,
        target_id: TargetId,
        target_type: String,
        parent_id: Option<SessionId>,
        connection: Weak<CDPConnection>,
        protocol_timeout: Option<Duration>,
    ) -> Self {
        Self {
            id,
            target_id,
            target_type,
            parent_id,
            connection,
            pending: DashMap::new(),
            events: EventEmitter::new(),
            closed: OnceLock::new(),
            protocol_timeout,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn target_type(&self) -> &str {
        &self.target_type
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn is_detached(&self) -> bool {
        self.closed.get().is_some()
    }

    pub fn connection(&self) -> Option<Arc<CDPConnection>> {
        self.connection.upgrade()
    }

    pub(crate) fn connection_weak(&self) -> Weak<CDPConnection> {
        self.connection.clone()
    }

    /// Number of commands still awaiting a response
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn closed_error(&self, method: &str) -> CDPError {
        match self.closed.get() {
            Some(CloseReason::ConnectionClosed) => CDPError::ConnectionClosed,
            _ => CDPError::SessionClosed {
                method: method.to_string(),
            },
        }
    }

    /// Send CDP command and wait for response
    ///
    /// Fails without touching the transport once the session is detached.
    pub async fn send(&self, method: &str, params: Value) -> Result<Value> {
        if self.is_detached() {
            return Err(self.closed_error(method));
        }
        let connection = self.connection.upgrade().ok_or(CDPError::ConnectionClosed)?;

        let id = connection.next_request_id();
        let request = CDPRequest {
            id,
            method: method.to_string(),
            params,
            session_id: (!self.id.is_empty()).then(|| self.id.clone()),
        };
        let message = serde_json::to_string(&request)?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingCommand {
                method: method.to_string(),
                tx,
            },
        );

        // Detach may have raced the insert
        if self.is_detached() {
            self.pending.remove(&id);
            return Err(self.closed_error(method));
        }

        if let Err(e) = connection.transport().send(message).await {
            self.pending.remove(&id);
            return Err(e);
        }
        drop(connection);

        let outcome = match self.protocol_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.pending.remove(&id);
                    return Err(CDPError::Timeout(format!(
                        "{} timed out after {} ms",
                        method,
                        limit.as_millis()
                    )));
                }
            },
            None => rx.await,
        };

        match outcome {
            Ok(result) => result,
            // Sender dropped without an answer
            Err(_) => Err(self.closed_error(method)),
        }
    }

    /// Send and deserialize the result
    pub async fn send_typed<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let value = self.send(method, params).await?;
        serde_json::from_value(value).map_err(|e| CDPError::invalid_response(method, e))
    }

    /// Subscribe to this session's events
    pub fn on<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.events.on(callback)
    }

    pub(crate) fn dispatch(&self, event: ProtocolEvent) {
        if self.is_detached() {
            return;
        }
        self.events.emit(&SessionEvent::Protocol(event));
    }

    /// Route a response to the command that issued it
    ///
    /// Returns false if this session has no such command.
    pub(crate) fn resolve(
        &self,
        id: RequestId,
        result: Option<Value>,
        error: Option<CDPErrorPayload>,
    ) -> bool {
        let Some((_, pending)) = self.pending.remove(&id) else {
            return false;
        };

        let outcome = match error {
            Some(error) => Err(CDPError::Protocol {
                method: pending.method,
                code: error.code,
                message: error.message,
                data: error.data.map(|data| match data {
                    Value::String(text) => text,
                    other => other.to_string(),
                }),
            }),
            None => Ok(result.unwrap_or(Value::Null)),
        };

        // Receiver dropped: caller timed out or went away
        let _ = pending.tx.send(outcome);
        true
    }

    /// Fail every pending command and stop dispatching; runs once
    pub(crate) fn close(&self, reason: CloseReason) {
        if self.closed.set(reason).is_err() {
            return;
        }

        let ids: Vec<RequestId> = self.pending.iter().map(|entry| *entry.key()).collect();
        if !ids.is_empty() {
            debug!(
                "[Session] Failing {} pending command(s) on {:?}",
                ids.len(),
                self.id
            );
        }
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let error = self.closed_error(&pending.method);
                let _ = pending.tx.send(Err(error));
            }
        }

        self.events.emit(&SessionEvent::Detached);
        self.events.clear();
    }
}

impl std::fmt::Debug for CDPSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CDPSession")
            .field("id", &self.id)
            .field("target_id", &self.target_id)
            .field("target_type", &self.target_type)
            .field("detached", &self.is_detached())
            .finish()
    }
}

impl Drop for CDPSession {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            warn!(
                "[Session] Dropping session {:?} with {} pending command(s)",
                self.id,
                self.pending.len()
            );
        }
    }
}
