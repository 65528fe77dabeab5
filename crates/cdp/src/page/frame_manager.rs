//! Frame Manager - one page's frame tree, driven by its sessions
//!
//! ```text
//! page session ─┐
//! OOPIF session ┼─→ on_session_event ─→ FrameArena ─→ Vec<FrameChange>
//! OOPIF session ┘          (lock)                        (unlock, emit)
//! ```
//!
//! All mutation happens on the connection's message loop. Readers get
//! snapshots; waiters subscribe to `FrameEvent`s.

use dashmap::DashMap;
use futures_util::future::{join_all, try_join_all};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use frame_tree::{
    ContextDescription, ContextKey, FrameArena, FrameChange, FrameError, FrameKey, NavigatedFrame,
    World,
};

use super::frame::Frame;
use super::lifecycle::{LifecycleWatcher, NavigationOptions, NavigationResult, WatchMode};
use super::network::NetworkManager;
use crate::cdp::protocol::{
    ExecutionContextCreated, FramePayload, FrameTree, GetFrameTreeResult, ProtocolEvent, SessionId,
};
use crate::cdp::{CDPSession, SessionEvent};
use crate::config::BrowserConfig;
use crate::error::Result;
use crate::events::{EventEmitter, Subscription};

/// Frame-tree notifications
#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    Changed(FrameChange),
    /// The page session is gone; the tree is frozen
    Disposed,
}

/// Out-of-process iframe session adopted by this page
struct ChildSession {
    session: Arc<CDPSession>,
    _subscription: Subscription,
}

pub struct FrameManager {
    page_session: Arc<CDPSession>,

    config: Arc<BrowserConfig>,

    arena: Mutex<FrameArena>,

    children: DashMap<SessionId, ChildSession>,

    page_subscription: Mutex<Option<Subscription>>,

    events: EventEmitter<FrameEvent>,

    network: Arc<NetworkManager>,

    disposed: AtomicBool,

    self_weak: Weak<FrameManager>,
}

impl FrameManager {
    /// Bind to a page session and synthesize its main frame
    ///
    /// Subscribes synchronously so no event after the attach is missed.
    pub fn new(
        page_session: Arc<CDPSession>,
        initial_url: &str,
        config: Arc<BrowserConfig>,
    ) -> Arc<Self> {
        let mut arena = FrameArena::new();
        arena.ensure_main_frame(page_session.target_id(), initial_url);

        let manager = Arc::new_cyclic(|weak| Self {
            page_session: page_session.clone(),
            config,
            arena: Mutex::new(arena),
            children: DashMap::new(),
            page_subscription: Mutex::new(None),
            events: EventEmitter::new(),
            network: Arc::new(NetworkManager::new()),
            disposed: AtomicBool::new(false),
            self_weak: weak.clone(),
        });

        let subscription = manager.subscribe_session(&page_session);
        *manager.page_subscription.lock() = Some(subscription);
        manager
    }

    fn subscribe_session(&self, session: &Arc<CDPSession>) -> Subscription {
        let weak = self.self_weak.clone();
        let session_id = session.id().to_string();
        session.on(move |event| {
            if let Some(manager) = weak.upgrade() {
                manager.on_session_event(&session_id, event);
            }
        })
    }

    pub fn config(&self) -> &Arc<BrowserConfig> {
        &self.config
    }

    pub fn network(&self) -> &Arc<NetworkManager> {
        &self.network
    }

    pub fn page_session(&self) -> &Arc<CDPSession> {
        &self.page_session
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Read the tree under the lock
    pub fn with_arena<R>(&self, read: impl FnOnce(&FrameArena) -> R) -> R {
        read(&self.arena.lock())
    }

    pub fn on_frame_event<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&FrameEvent) + Send + Sync + 'static,
    {
        self.events.on(callback)
    }

    #[cfg(test)]
    pub(crate) fn frame_listener_count(&self) -> usize {
        self.events.listener_count()
    }

    fn handle(&self, key: FrameKey) -> Frame {
        Frame::new(key, self.self_weak.clone())
    }

    /// Frames in depth-first order, main frame first
    pub fn frames(&self) -> Vec<Frame> {
        let keys: Vec<FrameKey> = self.with_arena(|arena| arena.frames().iter().map(|f| f.key).collect());
        keys.into_iter().map(|key| self.handle(key)).collect()
    }

    pub fn main_frame(&self) -> Option<Frame> {
        self.with_arena(|arena| arena.main_key())
            .map(|key| self.handle(key))
    }

    pub fn frame(&self, frame_id: &str) -> Option<Frame> {
        self.with_arena(|arena| arena.key_of(frame_id))
            .map(|key| self.handle(key))
    }

    /// Session that owns a context id
    pub(crate) fn session_by_id(&self, session_id: &str) -> Option<Arc<CDPSession>> {
        if session_id == self.page_session.id() {
            return Some(self.page_session.clone());
        }
        self.children.get(session_id).map(|child| child.session.clone())
    }

    /// Session that hosts a frame: nearest ancestor with its own target
    pub(crate) fn session_for_frame(&self, key: FrameKey) -> Arc<CDPSession> {
        let ancestry: Vec<String> = self.with_arena(|arena| {
            let mut ids = Vec::new();
            let mut cursor = arena.get(key);
            while let Some(node) = cursor {
                ids.push(node.id.clone());
                cursor = node.parent.and_then(|parent| arena.get(parent));
            }
            ids
        });

        ancestry
            .iter()
            .find_map(|frame_id| {
                self.children
                    .iter()
                    .find(|child| child.session.target_id() == frame_id)
                    .map(|child| child.session.clone())
            })
            .unwrap_or_else(|| self.page_session.clone())
    }

    /// Wait for the next navigation of `frame` to satisfy `options`
    pub async fn wait_for_frame_navigation(
        self: &Arc<Self>,
        frame: &Frame,
        options: NavigationOptions,
    ) -> Result<NavigationResult> {
        LifecycleWatcher::new(self, frame.key(), &options, WatchMode::Navigation)?
            .wait()
            .await
    }

    /// Wait until the current document of `frame` satisfies `options`
    pub async fn wait_for_frame_lifecycle(
        self: &Arc<Self>,
        frame: &Frame,
        options: NavigationOptions,
    ) -> Result<NavigationResult> {
        LifecycleWatcher::new(self, frame.key(), &options, WatchMode::Lifecycle)?
            .wait()
            .await
    }

    /// Enable domains on the page session and load the existing tree
    pub async fn initialize(&self) -> Result<()> {
        let session = self.page_session.clone();
        self.initialize_session(&session).await?;
        info!(
            "[FrameManager] Page {} ready with {} frame(s)",
            session.target_id(),
            self.with_arena(|arena| arena.len())
        );
        Ok(())
    }

    async fn initialize_session(&self, session: &Arc<CDPSession>) -> Result<()> {
        let (_, tree) = futures_util::try_join!(
            session.send("Page.enable", json!({})),
            session.send_typed::<GetFrameTreeResult>("Page.getFrameTree", json!({})),
        )?;

        let mut frame_ids = Vec::new();
        self.apply_frame_tree(session.id(), tree.frame_tree, &mut frame_ids);

        try_join_all(vec![
            session.send(
                "Target.setAutoAttach",
                json!({"autoAttach": true, "waitForDebuggerOnStart": true, "flatten": true}),
            ),
            session.send("Page.setLifecycleEventsEnabled", json!({"enabled": true})),
            session.send("Runtime.enable", json!({})),
            session.send("Network.enable", json!({})),
        ])
        .await?;

        self.create_isolated_worlds(session, &frame_ids).await?;

        session
            .send("Runtime.runIfWaitingForDebugger", json!({}))
            .await?;
        Ok(())
    }

    fn apply_frame_tree(&self, session_id: &str, tree: FrameTree, frame_ids: &mut Vec<String>) {
        // Iterative pre-order: parents before children
        let mut stack = vec![tree];
        while let Some(node) = stack.pop() {
            frame_ids.push(node.frame.id.clone());
            self.frame_navigated(session_id, &node.frame);
            stack.extend(node.child_frames.into_iter().rev());
        }
    }

    async fn create_isolated_worlds(&self, session: &Arc<CDPSession>, frame_ids: &[String]) -> Result<()> {
        let world_name = self.config.isolated_world_name.as_str();
        session
            .send(
                "Page.addScriptToEvaluateOnNewDocument",
                json!({"source": "", "worldName": world_name}),
            )
            .await?;

        // Frames may vanish meanwhile; individual failures are fine
        let results = join_all(frame_ids.iter().map(|frame_id| {
            session.send(
                "Page.createIsolatedWorld",
                json!({"frameId": frame_id, "worldName": world_name, "grantUniveralAccess": true}),
            )
        }))
        .await;
        let failures = results.iter().filter(|r| r.is_err()).count();
        if failures > 0 {
            debug!(
                "[FrameManager] Isolated world creation failed: {}/{}",
                failures,
                results.len()
            );
        }
        Ok(())
    }

    /// Apply one arena mutation, then notify with the lock released
    fn apply<F>(&self, mutate: F)
    where
        F: FnOnce(&mut FrameArena) -> frame_tree::Result<Vec<FrameChange>>,
    {
        let outcome = {
            let mut arena = self.arena.lock();
            mutate(&mut arena)
        };

        match outcome {
            Ok(changes) => {
                for change in changes {
                    self.events.emit(&FrameEvent::Changed(change));
                }
            }
            Err(FrameError::FrameNotFound(frame_id)) => {
                debug!("[FrameManager] Event for unknown frame {}", frame_id);
            }
            Err(e) => warn!("[FrameManager] Ignoring inconsistent event: {}", e),
        }
    }

    fn on_session_event(&self, session_id: &str, event: &SessionEvent) {
        if self.is_disposed() {
            return;
        }

        let event = match event {
            SessionEvent::Detached if session_id == self.page_session.id() => {
                self.dispose();
                return;
            }
            SessionEvent::Detached => {
                self.on_child_detached(session_id);
                return;
            }
            SessionEvent::Protocol(event) => event,
        };

        match event {
            ProtocolEvent::FrameAttached(attached) => {
                self.apply(|arena| arena.attach(&attached.frame_id, &attached.parent_frame_id));
            }
            ProtocolEvent::FrameNavigated(navigated) => {
                self.frame_navigated(session_id, &navigated.frame);
            }
            ProtocolEvent::NavigatedWithinDocument(navigated) => {
                self.apply(|arena| arena.navigate_within_document(&navigated.frame_id, &navigated.url));
            }
            ProtocolEvent::FrameDetached(detached) => {
                // The frame moves to its own session; it is not gone
                if detached.reason.as_deref() == Some("swap") {
                    debug!("[FrameManager] Frame {} swapped out of process", detached.frame_id);
                    return;
                }
                self.apply(|arena| arena.detach(&detached.frame_id));
            }
            ProtocolEvent::FrameStoppedLoading(stopped) => {
                self.apply(|arena| arena.loading_stopped(&stopped.frame_id));
            }
            ProtocolEvent::LifecycleEvent(event) => {
                self.apply(|arena| arena.lifecycle_event(&event.frame_id, &event.loader_id, &event.name));
            }
            ProtocolEvent::ExecutionContextCreated(created) => {
                self.context_created(session_id, created);
            }
            ProtocolEvent::ExecutionContextDestroyed(destroyed) => {
                let key = ContextKey::new(session_id, destroyed.execution_context_id);
                self.apply(|arena| Ok(arena.context_destroyed(&key)));
            }
            ProtocolEvent::ExecutionContextsCleared => {
                self.apply(|arena| Ok(arena.contexts_cleared(session_id)));
            }
            ProtocolEvent::AttachedToTarget(attached) => {
                self.on_child_attached(&attached.session_id, &attached.target_info.target_type);
            }
            ProtocolEvent::TargetCrashed => {
                warn!("[FrameManager] Target {} crashed", self.page_session.target_id());
            }
            ProtocolEvent::RequestWillBeSent(_)
            | ProtocolEvent::ResponseReceived(_)
            | ProtocolEvent::LoadingFinished(_)
            | ProtocolEvent::LoadingFailed(_) => self.network.handle_event(event),
            _ => {}
        }
    }

    fn frame_navigated(&self, session_id: &str, frame: &FramePayload) {
        let is_child_session = session_id != self.page_session.id();
        self.apply(|arena| {
            let mut parent_id = frame.parent_id.clone();

            // An OOPIF reports its root frame without a parent
            if parent_id.is_none() && is_child_session {
                let Some(node) = arena.get_by_id(&frame.id) else {
                    return Err(FrameError::FrameNotFound(frame.id.clone()));
                };
                parent_id = node
                    .parent
                    .and_then(|parent| arena.get(parent))
                    .map(|parent| parent.id.clone());
            }

            arena.navigate(NavigatedFrame {
                id: frame.id.clone(),
                parent_id,
                url: frame.full_url(),
                loader_id: frame.loader_id.clone(),
                name: frame.name.clone(),
            })
        });
    }

    fn context_created(&self, session_id: &str, created: &ExecutionContextCreated) {
        let context = &created.context;
        let Some(frame_id) = context.aux_data.frame_id.clone() else {
            return;
        };
        let world = if context.aux_data.is_default {
            World::Main
        } else {
            World::Isolated
        };

        let description = ContextDescription {
            key: ContextKey::new(session_id, context.id),
            frame_id,
            world,
            name: context.name.clone(),
            origin: context.origin.clone(),
        };
        self.apply(|arena| Ok(arena.context_created(description)));
    }

    fn on_child_attached(&self, child_id: &str, target_type: &str) {
        let Some(session) = self.page_session.connection().and_then(|c| c.session(child_id)) else {
            return;
        };

        if target_type != "iframe" {
            // Workers and friends: let them run, nothing to track
            tokio::spawn(async move {
                if let Err(e) = session.send("Runtime.runIfWaitingForDebugger", json!({})).await {
                    debug!("[FrameManager] Could not resume {}: {}", session.target_id(), e);
                }
            });
            return;
        }

        debug!(
            "[FrameManager] Adopting out-of-process frame {} (session {})",
            session.target_id(),
            child_id
        );
        let subscription = self.subscribe_session(&session);
        self.children.insert(
            child_id.to_string(),
            ChildSession {
                session: session.clone(),
                _subscription: subscription,
            },
        );

        let weak = self.self_weak.clone();
        tokio::spawn(async move {
            let Some(manager) = weak.upgrade() else {
                return;
            };
            if let Err(e) = manager.initialize_session(&session).await {
                debug!(
                    "[FrameManager] Out-of-process frame {} failed to initialize: {}",
                    session.target_id(),
                    e
                );
            }
        });
    }

    fn on_child_detached(&self, child_id: &str) {
        let Some((_, child)) = self.children.remove(child_id) else {
            return;
        };
        let frame_id = child.session.target_id().to_string();
        debug!("[FrameManager] Out-of-process frame {} detached", frame_id);

        self.apply(|arena| Ok(arena.contexts_cleared(child_id)));
        self.apply(|arena| arena.detach(&frame_id));
    }

    /// Stop tracking: fails every waiter with a navigation error
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("[FrameManager] Disposing page {}", self.page_session.target_id());

        self.children.clear();
        self.network.clear();
        self.events.emit(&FrameEvent::Disposed);
        self.page_subscription.lock().take();
    }
}

impl std::fmt::Debug for FrameManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameManager")
            .field("target_id", &self.page_session.target_id())
            .field("frames", &self.with_arena(|arena| arena.len()))
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::PageHarness;

    fn frame_ids(manager: &FrameManager) -> Vec<String> {
        manager
            .frames()
            .iter()
            .filter_map(|frame| frame.id())
            .collect()
    }

    #[tokio::test]
    async fn test_initialize_sequence() {
        let harness = PageHarness::open("T1", "S1", "about:blank").await;
        let methods = harness.transport.methods_for_session("S1");

        let position = |method: &str| methods.iter().position(|m| m == method).unwrap();
        assert!(position("Page.enable") < position("Page.setLifecycleEventsEnabled"));
        assert!(position("Page.getFrameTree") < position("Page.createIsolatedWorld"));
        assert_eq!(methods.last().map(String::as_str), Some("Runtime.runIfWaitingForDebugger"));

        let isolated = harness.transport.commands("Page.createIsolatedWorld");
        assert_eq!(isolated[0].params["frameId"], "T1");
        assert_eq!(isolated[0].params["worldName"], "__devtools_utility_world__");
    }

    #[tokio::test]
    async fn test_frame_tree_follows_events() {
        let harness = PageHarness::open("T1", "S1", "about:blank").await;
        let manager = harness.page.frame_manager();

        harness.navigate("T1", None, "http://x/", "L1").await;
        harness.attach_frame("a", "T1").await;
        harness.attach_frame("a1", "a").await;
        harness.attach_frame("b", "T1").await;
        // Duplicate delivery
        harness.attach_frame("a", "T1").await;
        assert_eq!(frame_ids(manager), vec!["T1", "a", "a1", "b"]);

        let a = manager.frame("a").unwrap();
        assert_eq!(a.parent_frame().and_then(|p| p.id()).as_deref(), Some("T1"));
        assert_eq!(
            a.child_frames().iter().filter_map(|f| f.id()).collect::<Vec<_>>(),
            vec!["a1"]
        );

        harness.detach_frame("a").await;
        assert_eq!(frame_ids(manager), vec!["T1", "b"]);
        assert!(a.is_detached());

        // Main frame survives a detach request
        harness.detach_frame("T1").await;
        assert_eq!(frame_ids(manager), vec!["T1", "b"]);
    }

    #[tokio::test]
    async fn test_cross_document_navigation_drops_children() {
        let harness = PageHarness::open("T1", "S1", "about:blank").await;
        let manager = harness.page.frame_manager();

        harness.navigate("T1", None, "http://x/", "L1").await;
        harness.attach_frame("a", "T1").await;

        harness.navigate("T1", None, "http://x/#top", "L1").await;
        assert_eq!(frame_ids(manager), vec!["T1", "a"]);

        harness.navigate("T1", None, "http://y/", "L2").await;
        assert_eq!(frame_ids(manager), vec!["T1"]);
        assert_eq!(manager.main_frame().unwrap().url().as_deref(), Some("http://y/"));
    }

    #[tokio::test]
    async fn test_swap_detach_is_ignored() {
        let harness = PageHarness::open("T1", "S1", "about:blank").await;
        harness.navigate("T1", None, "http://x/", "L1").await;
        harness.attach_frame("oopif", "T1").await;

        harness
            .event(
                "Page.frameDetached",
                serde_json::json!({"frameId": "oopif", "reason": "swap"}),
            )
            .await;
        assert!(harness.page.frame_manager().frame("oopif").is_some());
    }

    #[tokio::test]
    async fn test_out_of_process_frame_adoption() {
        let harness = PageHarness::open("T1", "S1", "about:blank").await;
        let manager = harness.page.frame_manager().clone();
        harness.navigate("T1", None, "http://x/", "L1").await;
        harness.attach_frame("oopif", "T1").await;

        harness.attach_child_session("oopif", "S-oopif", "iframe").await;
        harness.transport.wait_for_session_command("S-oopif", "Runtime.runIfWaitingForDebugger").await;

        // Contexts from the child session land on the adopted frame
        harness
            .child_event(
                "S-oopif",
                "Runtime.executionContextCreated",
                serde_json::json!({"context": {
                    "id": 1, "origin": "http://y", "name": "",
                    "auxData": {"frameId": "oopif", "isDefault": true}
                }}),
            )
            .await;
        let context = manager
            .with_arena(|arena| arena.get_by_id("oopif").and_then(|f| f.main_world.clone()))
            .unwrap();
        assert_eq!(context, ContextKey::new("S-oopif", 1));
        let frame = manager.frame("oopif").unwrap();
        assert_eq!(manager.session_for_frame(frame.key()).id(), "S-oopif");

        harness.detach_child_session("S-oopif", "oopif").await;
        assert!(manager.frame("oopif").is_none());
        assert_eq!(manager.with_arena(|arena| arena.context_count()), 0);
    }

    #[tokio::test]
    async fn test_workers_are_resumed_not_tracked() {
        let harness = PageHarness::open("T1", "S1", "about:blank").await;
        harness.attach_child_session("W1", "S-worker", "worker").await;
        harness
            .transport
            .wait_for_session_command("S-worker", "Runtime.runIfWaitingForDebugger")
            .await;
        assert_eq!(harness.page.frame_manager().frames().len(), 1);
    }

    #[tokio::test]
    async fn test_dispose_on_session_detach() {
        let harness = PageHarness::open("T1", "S1", "about:blank").await;
        let manager = harness.page.frame_manager().clone();
        harness.detach_session().await;

        assert!(manager.is_disposed());
        // Tree is frozen after disposal
        harness.navigate("T1", None, "http://late/", "L9").await;
        assert_eq!(manager.main_frame().unwrap().url().as_deref(), Some("about:blank"));
    }
}
