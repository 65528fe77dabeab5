//! CDP Connection - The Core Communication Layer
//!
//! Design decisions:
//! 1. Single transport per browser connection, sessions multiplexed on top
//! 2. One task drains inbound messages strictly in arrival order
//! 3. Responses matched by ID, events routed by session ID
//! 4. Fail fast - no retries, no queuing. Let the caller decide.
//!
//! Attach and detach notifications mutate the session table *before* the
//! event is dispatched, so traffic for a fresh session always finds it.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::protocol::{CDPEvent, CDPMessage, CDPResponse, ProtocolEvent, RequestId, SessionId, TargetId};
use super::session::{CDPSession, CloseReason};
use super::transport::{Inbound, Transport};
use crate::error::{CDPError, Result};
use crate::events::EventBus;

/// Connection-level notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    SessionAttached {
        session_id: SessionId,
        target_id: TargetId,
        target_type: String,
    },
    SessionDetached {
        session_id: SessionId,
        target_id: TargetId,
    },
    Disconnected,
}

/// CDP Connection - owns the transport and every session riding on it
pub struct CDPConnection {
    transport: Arc<dyn Transport>,

    /// Monotonic request ID counter
    next_id: AtomicU64,

    /// Browser-level session; its pending map is the connection's own
    root: Arc<CDPSession>,

    /// Attached sessions by ID
    sessions: DashMap<SessionId, Arc<CDPSession>>,

    events: EventBus<ConnectionEvent>,

    closed: AtomicBool,

    protocol_timeout: Option<Duration>,
}

impl CDPConnection {
    /// Wrap a transport and start draining its inbound channel
    pub fn new(
        transport: Arc<dyn Transport>,
        inbound: Inbound,
        protocol_timeout: Option<Duration>,
    ) -> Arc<Self> {
        let connection = Arc::new_cyclic(|weak| Self {
            transport,
            next_id: AtomicU64::new(1),
            root: Arc::new(CDPSession::new(
                String::new(),
                String::new(),
                "browser".to_string(),
                None,
                weak.clone(),
                protocol_timeout,
            )),
            sessions: DashMap::new(),
            events: EventBus::new(),
            closed: AtomicBool::new(false),
            protocol_timeout,
        });

        tokio::spawn(Self::run(connection.clone(), inbound));
        connection
    }

    async fn run(connection: Arc<Self>, mut inbound: Inbound) {
        while let Some(text) = inbound.recv().await {
            if connection.is_closed() {
                break;
            }
            connection.handle_message(&text);
        }
        debug!("[Connection] Inbound channel closed");
        connection.on_close();
    }

    pub(crate) fn next_request_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// The browser-level session
    pub fn root(&self) -> Arc<CDPSession> {
        self.root.clone()
    }

    pub fn session(&self, session_id: &str) -> Option<Arc<CDPSession>> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    pub fn sessions(&self) -> Vec<Arc<CDPSession>> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Send a command on a session (None = browser session)
    pub async fn send(
        &self,
        session_id: Option<&str>,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        match session_id {
            None | Some("") => self.root.send(method, params).await,
            Some(id) => match self.session(id) {
                Some(session) => session.send(method, params).await,
                None if self.is_closed() => Err(CDPError::ConnectionClosed),
                None => Err(CDPError::SessionClosed {
                    method: method.to_string(),
                }),
            },
        }
    }

    /// Handle one inbound message; never suspends
    fn handle_message(&self, text: &str) {
        let message: CDPMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("[Connection] Dropping malformed message: {}", e);
                return;
            }
        };

        match message {
            CDPMessage::Response(response) => self.route_response(response),
            CDPMessage::Event(event) => self.route_event(event),
        }
    }

    fn route_response(&self, response: CDPResponse) {
        let CDPResponse {
            id,
            result,
            error,
            session_id,
        } = response;

        let owner = session_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .and_then(|id| self.session(id));

        let resolved = match owner {
            Some(session) => {
                // Fall back to the root map for root-issued commands
                session.resolve(id, result.clone(), error.clone())
                    || self.root.resolve(id, result, error)
            }
            None => self.root.resolve(id, result, error),
        };

        if !resolved {
            debug!("[Connection] Received response for unknown request: {}", id);
        }
    }

    fn route_event(&self, event: CDPEvent) {
        let CDPEvent {
            method,
            params,
            session_id,
        } = event;
        let session_id = session_id.filter(|id| !id.is_empty());

        let event = match ProtocolEvent::decode(&method, params) {
            Ok(event) => event,
            Err(e) => {
                warn!("[Connection] Dropping malformed {} event: {}", method, e);
                return;
            }
        };

        match &event {
            ProtocolEvent::AttachedToTarget(attached) => {
                let session = Arc::new(CDPSession::new(
                    attached.session_id.clone(),
                    attached.target_info.target_id.clone(),
                    attached.target_info.target_type.clone(),
                    session_id.clone(),
                    self.root.connection_weak(),
                    self.protocol_timeout,
                ));
                debug!(
                    "[Connection] Session {} attached to {} ({})",
                    attached.session_id, attached.target_info.target_id, attached.target_info.target_type
                );
                self.sessions.insert(attached.session_id.clone(), session);
                self.events.publish(ConnectionEvent::SessionAttached {
                    session_id: attached.session_id.clone(),
                    target_id: attached.target_info.target_id.clone(),
                    target_type: attached.target_info.target_type.clone(),
                });
            }
            ProtocolEvent::DetachedFromTarget(detached) => {
                self.detach_session(&detached.session_id, CloseReason::Detached);
            }
            _ => {}
        }

        let target = match session_id {
            None => Some(self.root.clone()),
            Some(id) => self.session(&id),
        };
        match target {
            Some(session) => session.dispatch(event),
            None => debug!("[Connection] Dropping {} for unknown session", method),
        }
    }

    /// Detach a session and everything attached beneath it, leaves first
    fn detach_session(&self, session_id: &str, reason: CloseReason) {
        for id in self.subtree_leaves_first(session_id) {
            if let Some((_, session)) = self.sessions.remove(&id) {
                debug!("[Connection] Session {} detached", id);
                session.close(reason);
                self.events.publish(ConnectionEvent::SessionDetached {
                    session_id: id,
                    target_id: session.target_id().to_string(),
                });
            }
        }
    }

    fn subtree_leaves_first(&self, root_id: &str) -> Vec<SessionId> {
        let mut order = vec![root_id.to_string()];
        let mut cursor = 0;
        while cursor < order.len() {
            let parent = order[cursor].clone();
            order.extend(
                self.sessions
                    .iter()
                    .filter(|entry| entry.value().parent_id() == Some(parent.as_str()))
                    .map(|entry| entry.key().clone()),
            );
            cursor += 1;
        }
        order.reverse();
        order
    }

    /// Transport gone: detach every session, then fail root commands
    fn on_close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let top_level: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .parent_id()
                    .map_or(true, |parent| !self.sessions.contains_key(parent))
            })
            .map(|entry| entry.key().clone())
            .collect();

        for id in top_level {
            self.detach_session(&id, CloseReason::ConnectionClosed);
        }
        // Anything left over (a parent cycle would be a browser bug)
        let leftover: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in leftover {
            self.detach_session(&id, CloseReason::ConnectionClosed);
        }

        self.root.close(CloseReason::ConnectionClosed);
        debug!("[Connection] Disconnected");
        self.events.publish(ConnectionEvent::Disconnected);
    }

    /// Close the transport; outstanding commands fail with ConnectionClosed
    pub async fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let result = self.transport.close().await;
        self.on_close();
        result
    }
}
