//! Target Registry - what the browser exposes, as observers should see it
//!
//! Raw target notifications are noisy: every new tab starts life as
//! `about:blank`. A page-like target only counts as *initialized* (and
//! only then produces `Created`) once it has a real URL or was explicitly
//! requested through `create_page`.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use url::Url;

use crate::cdp::protocol::{AttachedToTarget, CreateTargetResult, ProtocolEvent, TargetId, TargetInfo};
use crate::cdp::{CDPConnection, SessionEvent};
use crate::config::BrowserConfig;
use crate::error::{CDPError, Result};
use crate::events::{EventBus, Subscription};
use crate::page::{NavigationOptions, Page};

/// Target kind as reported by the browser
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetKind {
    Page,
    BackgroundPage,
    ServiceWorker,
    SharedWorker,
    Browser,
    Other(String),
}

impl TargetKind {
    pub fn from_type(target_type: &str) -> Self {
        match target_type {
            "page" => TargetKind::Page,
            "background_page" => TargetKind::BackgroundPage,
            "service_worker" => TargetKind::ServiceWorker,
            "shared_worker" => TargetKind::SharedWorker,
            "browser" => TargetKind::Browser,
            other => TargetKind::Other(other.to_string()),
        }
    }

    /// Gets a `Page` object when attached
    pub fn is_page_like(&self) -> bool {
        matches!(self, TargetKind::Page | TargetKind::BackgroundPage)
    }
}

/// Empty or `about:blank` (any query or fragment)
pub fn is_blank_url(raw: &str) -> bool {
    if raw.is_empty() {
        return true;
    }
    match Url::parse(raw) {
        Ok(url) => url.scheme() == "about" && url.path() == "blank",
        Err(_) => false,
    }
}

/// Point-in-time view of a target
#[derive(Clone)]
pub struct Target {
    info: TargetInfo,
    kind: TargetKind,
    registry: Weak<TargetRegistry>,
}

impl Target {
    pub fn id(&self) -> &str {
        &self.info.target_id
    }

    pub fn kind(&self) -> &TargetKind {
        &self.kind
    }

    pub fn url(&self) -> &str {
        &self.info.url
    }

    pub fn title(&self) -> &str {
        &self.info.title
    }

    pub fn browser_context_id(&self) -> Option<&str> {
        self.info.browser_context_id.as_deref()
    }

    pub fn info(&self) -> &TargetInfo {
        &self.info
    }

    /// The target that opened this one, if it is still around
    pub fn opener(&self) -> Option<Target> {
        let opener_id = self.info.opener_id.as_deref()?;
        self.registry.upgrade()?.target(opener_id)
    }

    /// Page object, for attached page-like targets
    pub fn page(&self) -> Option<Arc<Page>> {
        self.registry.upgrade()?.page(self.id())
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("id", &self.info.target_id)
            .field("kind", &self.kind)
            .field("url", &self.info.url)
            .finish()
    }
}

/// Registry notifications
#[derive(Debug, Clone)]
pub enum TargetEvent {
    Created(Target),
    Changed(Target),
    Destroyed(Target),
}

impl TargetEvent {
    pub fn target(&self) -> &Target {
        match self {
            TargetEvent::Created(target)
            | TargetEvent::Changed(target)
            | TargetEvent::Destroyed(target) => target,
        }
    }
}

struct TargetRecord {
    info: TargetInfo,
    kind: TargetKind,
    initialized: bool,
    page: Option<Arc<Page>>,
}

#[derive(Default)]
struct RegistryState {
    targets: HashMap<TargetId, TargetRecord>,
    /// Explicitly requested through `create_page`
    requested: HashSet<TargetId>,
}

pub struct TargetRegistry {
    connection: Arc<CDPConnection>,
    config: Arc<BrowserConfig>,
    state: Mutex<RegistryState>,
    events: EventBus<TargetEvent>,
    /// Bumped on every change, for waiters
    version: watch::Sender<u64>,
    subscription: Mutex<Option<Subscription>>,
    self_weak: Weak<TargetRegistry>,
}

impl TargetRegistry {
    /// Start listening to browser-level target notifications
    pub fn new(connection: Arc<CDPConnection>, config: Arc<BrowserConfig>) -> Arc<Self> {
        let (version, _) = watch::channel(0);
        let registry = Arc::new_cyclic(|weak| Self {
            connection: connection.clone(),
            config,
            state: Mutex::new(RegistryState::default()),
            events: EventBus::new(),
            version,
            subscription: Mutex::new(None),
            self_weak: weak.clone(),
        });

        let weak = Arc::downgrade(&registry);
        let subscription = connection.root().on(move |event| {
            if let Some(registry) = weak.upgrade() {
                registry.on_event(event);
            }
        });
        *registry.subscription.lock() = Some(subscription);
        registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TargetEvent> {
        self.events.subscribe()
    }

    fn snapshot(&self, record: &TargetRecord) -> Target {
        Target {
            info: record.info.clone(),
            kind: record.kind.clone(),
            registry: self.self_weak.clone(),
        }
    }

    fn bump(&self) {
        self.version.send_modify(|version| *version += 1);
    }

    /// Initialized targets
    pub fn targets(&self) -> Vec<Target> {
        let state = self.state.lock();
        state
            .targets
            .values()
            .filter(|record| record.initialized)
            .map(|record| self.snapshot(record))
            .collect()
    }

    /// Initialized targets by id
    pub fn target(&self, target_id: &str) -> Option<Target> {
        let state = self.state.lock();
        state
            .targets
            .get(target_id)
            .filter(|record| record.initialized)
            .map(|record| self.snapshot(record))
    }

    /// Pages of initialized page-like targets
    pub fn pages(&self) -> Vec<Arc<Page>> {
        let state = self.state.lock();
        state
            .targets
            .values()
            .filter(|record| record.initialized)
            .filter_map(|record| record.page.clone())
            .collect()
    }

    /// Page bound to a target, initialized or not
    pub fn page(&self, target_id: &str) -> Option<Arc<Page>> {
        self.state
            .lock()
            .targets
            .get(target_id)
            .and_then(|record| record.page.clone())
    }

    fn on_event(&self, event: &SessionEvent) {
        let SessionEvent::Protocol(event) = event else {
            return;
        };

        match event {
            ProtocolEvent::TargetCreated(info) => self.on_target_created(info),
            ProtocolEvent::TargetInfoChanged(info) => self.on_target_info_changed(info),
            ProtocolEvent::TargetDestroyed(destroyed) => self.on_target_destroyed(&destroyed.target_id),
            ProtocolEvent::AttachedToTarget(attached) => self.on_attached(attached),
            ProtocolEvent::DetachedFromTarget(detached) => {
                if let Some(target_id) = &detached.target_id {
                    let mut state = self.state.lock();
                    if let Some(record) = state.targets.get_mut(target_id) {
                        let stale = record
                            .page
                            .as_ref()
                            .is_some_and(|page| page.session().id() == detached.session_id);
                        if stale {
                            record.page = None;
                        }
                    }
                }
                self.bump();
            }
            _ => {}
        }
    }

    /// Initialization rule, applied after every update of a record
    fn try_initialize(record: &mut TargetRecord, requested: bool) -> bool {
        if record.initialized {
            return false;
        }
        if record.kind.is_page_like() && !requested && is_blank_url(&record.info.url) {
            return false;
        }
        record.initialized = true;
        true
    }

    /// Insert or update; returns the event to publish, if any
    fn upsert(&self, info: &TargetInfo) -> Option<TargetEvent> {
        let mut state = self.state.lock();
        let requested = state.requested.contains(&info.target_id);

        let record = state
            .targets
            .entry(info.target_id.clone())
            .or_insert_with(|| TargetRecord {
                info: info.clone(),
                kind: TargetKind::from_type(&info.target_type),
                initialized: false,
                page: None,
            });
        let was_initialized = record.initialized;
        // `attached` flips on attach alone; not a change observers care about
        let changed = record.info.url != info.url
            || record.info.title != info.title
            || record.info.target_type != info.target_type;
        record.info = info.clone();
        record.kind = TargetKind::from_type(&info.target_type);

        if Self::try_initialize(record, requested) {
            debug!("[TargetRegistry] Target {} initialized at {}", info.target_id, info.url);
            return Some(TargetEvent::Created(self.snapshot(record)));
        }
        if was_initialized && changed {
            return Some(TargetEvent::Changed(self.snapshot(record)));
        }
        None
    }

    fn on_target_created(&self, info: &TargetInfo) {
        if let Some(event) = self.upsert(info) {
            self.events.publish(event);
        }
        self.bump();
    }

    fn on_target_info_changed(&self, info: &TargetInfo) {
        if let Some(event) = self.upsert(info) {
            self.events.publish(event);
        }
        self.bump();
    }

    fn on_target_destroyed(&self, target_id: &str) {
        let removed = {
            let mut state = self.state.lock();
            state.requested.remove(target_id);
            state.targets.remove(target_id)
        };
        let Some(record) = removed else {
            return;
        };

        if let Some(page) = &record.page {
            page.frame_manager().dispose();
        }
        if record.initialized {
            info!("[TargetRegistry] Target {} destroyed", target_id);
            self.events.publish(TargetEvent::Destroyed(self.snapshot(&record)));
        }
        self.bump();
    }

    /// Page-like targets get their page object right away
    fn on_attached(&self, attached: &AttachedToTarget) {
        let info = &attached.target_info;
        if let Some(event) = self.upsert(info) {
            self.events.publish(event);
        }

        let Some(session) = self.connection.session(&attached.session_id) else {
            return;
        };

        if !TargetKind::from_type(&info.target_type).is_page_like() {
            if attached.waiting_for_debugger {
                tokio::spawn(async move {
                    if let Err(e) = session.send("Runtime.runIfWaitingForDebugger", json!({})).await {
                        debug!("[TargetRegistry] Could not resume {}: {}", session.target_id(), e);
                    }
                });
            }
            self.bump();
            return;
        }

        let page = Page::new(session, &info.url, self.config.clone());
        {
            let mut state = self.state.lock();
            if let Some(record) = state.targets.get_mut(&info.target_id) {
                record.page = Some(page.clone());
            }
        }
        self.bump();

        tokio::spawn(async move {
            let _ = page.initialize().await;
        });
    }

    /// Count a target as initialized regardless of its URL
    fn mark_requested(&self, target_id: &str) {
        let event = {
            let mut state = self.state.lock();
            state.requested.insert(target_id.to_string());
            match state.targets.get_mut(target_id) {
                Some(record) => {
                    if Self::try_initialize(record, true) {
                        Some(TargetEvent::Created(self.snapshot(record)))
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some(event) = event {
            self.events.publish(event);
        }
        self.bump();
    }

    /// Wait until `target_id` has an initialized page object
    pub async fn wait_for_page(&self, target_id: &str) -> Result<Arc<Page>> {
        let mut version = self.version.subscribe();
        let wait = async {
            loop {
                if let Some(page) = self.page(target_id) {
                    page.wait_ready().await?;
                    return Ok(page);
                }
                if self.connection.is_closed() {
                    return Err(CDPError::ConnectionClosed);
                }
                if version.changed().await.is_err() {
                    return Err(CDPError::ConnectionClosed);
                }
            }
        };

        match self.config.default_timeout() {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                CDPError::Timeout(format!(
                    "Waiting for page {} timed out after {} ms",
                    target_id,
                    limit.as_millis()
                ))
            })?,
            None => wait.await,
        }
    }

    /// Open a new page and navigate it
    pub async fn create_page(&self, url: &str, browser_context_id: Option<&str>) -> Result<Arc<Page>> {
        let mut params = json!({ "url": "about:blank" });
        if let Some(context) = browser_context_id {
            params["browserContextId"] = json!(context);
        }

        let created: CreateTargetResult = self
            .connection
            .root()
            .send_typed("Target.createTarget", params)
            .await?;
        self.mark_requested(&created.target_id);

        let page = self.wait_for_page(&created.target_id).await?;
        if !is_blank_url(url) {
            page.goto(url, NavigationOptions::default()).await?;
        }
        Ok(page)
    }

    /// Stop listening; pages are disposed
    pub(crate) fn shutdown(&self) {
        self.subscription.lock().take();
        let pages: Vec<Arc<Page>> = self
            .state
            .lock()
            .targets
            .values()
            .filter_map(|record| record.page.clone())
            .collect();
        if !self.connection.is_closed() {
            warn!(
                "[TargetRegistry] Shutting down with {} live page(s) while still connected",
                pages.len()
            );
        }
        for page in pages {
            page.frame_manager().dispose();
        }
        self.bump();
    }
}
