//! Lifecycle Watcher - "is the navigation done yet?"
//!
//! A watcher is created *before* the action that navigates, snapshots the
//! frame's loader, and then reacts to frame-tree changes on the message
//! loop. It resolves exactly once: success, NavigationError, or timeout.
//! Dropping it unsubscribes.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::debug;

use frame_tree::{lifecycle, FrameChange, FrameKey, LoaderId};

use super::frame_manager::{FrameEvent, FrameManager};
use super::network::{DocumentResponse, NetworkManager};
use crate::config::NetworkIdleConfig;
use crate::error::{CDPError, Result};
use crate::events::Subscription;

/// Readiness predicate for a navigation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitUntil {
    Load,
    #[serde(rename = "domcontentloaded")]
    DomContentLoaded,
    #[serde(rename = "networkidle0")]
    NetworkIdle0,
    #[serde(rename = "networkidle2")]
    NetworkIdle2,
}

impl WaitUntil {
    /// Protocol lifecycle event this condition waits for, if any
    fn lifecycle_event(self) -> Option<&'static str> {
        match self {
            WaitUntil::Load => Some(lifecycle::LOAD),
            WaitUntil::DomContentLoaded => Some(lifecycle::DOM_CONTENT_LOADED),
            WaitUntil::NetworkIdle0 | WaitUntil::NetworkIdle2 => None,
        }
    }

    /// In-flight request ceiling this condition waits for, if any
    fn max_inflight(self, policy: &NetworkIdleConfig) -> Option<usize> {
        match self {
            WaitUntil::NetworkIdle0 => Some(0),
            WaitUntil::NetworkIdle2 => Some(policy.almost_idle_max_inflight),
            WaitUntil::Load | WaitUntil::DomContentLoaded => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WaitUntil::Load => "load",
            WaitUntil::DomContentLoaded => "domcontentloaded",
            WaitUntil::NetworkIdle0 => "networkidle0",
            WaitUntil::NetworkIdle2 => "networkidle2",
        }
    }
}

impl fmt::Display for WaitUntil {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for navigation waits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationOptions {
    pub wait_until: Vec<WaitUntil>,
    /// None = configured navigation timeout; zero = no timeout
    pub timeout: Option<Duration>,
}

impl Default for NavigationOptions {
    fn default() -> Self {
        Self {
            wait_until: vec![WaitUntil::Load],
            timeout: None,
        }
    }
}

impl NavigationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn until(conditions: impl IntoIterator<Item = WaitUntil>) -> Self {
        Self {
            wait_until: conditions.into_iter().collect(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of a successful navigation wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationResult {
    pub url: String,
    pub loader_id: Option<LoaderId>,
    /// No new document was loaded
    pub same_document: bool,
    /// Response that delivered the document, when it was observed
    pub response: Option<DocumentResponse>,
}

/// What counts as "started"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatchMode {
    /// A navigation must commit after the watcher was created
    Navigation,
    /// The current document is enough
    Lifecycle,
}

#[derive(Debug, Default)]
struct Progress {
    /// A navigation committed after creation
    navigated: bool,
    same_document: bool,
    /// Loader that was current when the network went quiet
    idle_loader: Option<LoaderId>,
}

struct WatcherState {
    manager: Weak<FrameManager>,
    frame: FrameKey,
    mode: WatchMode,
    expected: Vec<&'static str>,
    max_inflight: Option<usize>,
    initial_loader: Option<LoaderId>,
    progress: Mutex<Progress>,
    tx: Mutex<Option<oneshot::Sender<Result<NavigationResult>>>>,
    /// New document committed: restart the quiet window
    rearm: Notify,
}

impl WatcherState {
    /// Resolve once; later calls are ignored
    fn finish(&self, outcome: Result<NavigationResult>) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(outcome);
        }
    }

    fn is_finished(&self) -> bool {
        self.tx.lock().is_none()
    }

    fn on_frame_event(&self, event: &FrameEvent) {
        if self.is_finished() {
            return;
        }

        match event {
            FrameEvent::Disposed => {
                self.finish(Err(CDPError::Navigation(
                    "Navigating frame's page was closed".to_string(),
                )));
                return;
            }
            FrameEvent::Changed(FrameChange::Detached { key, .. }) if *key == self.frame => {
                self.finish(Err(CDPError::Navigation(
                    "Navigating frame was detached".to_string(),
                )));
                return;
            }
            FrameEvent::Changed(FrameChange::Navigated { key, new_document }) if *key == self.frame => {
                let mut progress = self.progress.lock();
                progress.navigated = true;
                progress.same_document = !*new_document;
                if *new_document {
                    drop(progress);
                    self.rearm.notify_one();
                }
            }
            FrameEvent::Changed(FrameChange::NavigatedWithinDocument { key }) if *key == self.frame => {
                let mut progress = self.progress.lock();
                progress.navigated = true;
                progress.same_document = true;
            }
            _ => {}
        }

        self.check();
    }

    /// Resolve if every condition holds for the current document
    fn check(&self) {
        if self.is_finished() {
            return;
        }
        let Some(manager) = self.manager.upgrade() else {
            self.finish(Err(CDPError::Navigation(
                "Navigating frame's page was closed".to_string(),
            )));
            return;
        };

        let snapshot = manager.with_arena(|arena| {
            arena.get(self.frame).map(|node| {
                let ready = arena.lifecycle_satisfied(self.frame, &self.expected, true);
                (node.url.clone(), node.loader_id.clone(), ready)
            })
        });
        let Some((url, loader_id, lifecycle_ready)) = snapshot else {
            self.finish(Err(CDPError::Navigation(
                "Navigating frame was detached".to_string(),
            )));
            return;
        };

        let progress = self.progress.lock();
        let navigated = match self.mode {
            WatchMode::Lifecycle => true,
            WatchMode::Navigation => progress.navigated || loader_id != self.initial_loader,
        };
        if !navigated {
            return;
        }

        let same_document = progress.same_document && loader_id == self.initial_loader;
        if !lifecycle_ready {
            return;
        }
        if self.max_inflight.is_some() && progress.idle_loader != loader_id {
            return;
        }
        drop(progress);

        let response = loader_id
            .as_deref()
            .and_then(|loader| manager.network().document_response(loader));

        debug!(
            "[LifecycleWatcher] Frame {} ready at {} ({:?})",
            self.frame, url, loader_id
        );
        self.finish(Ok(NavigationResult {
            url,
            loader_id,
            same_document,
            response,
        }));
    }

    /// Network has been quiet for a full window
    fn mark_idle(&self) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let loader = manager.with_arena(|arena| arena.get(self.frame).and_then(|n| n.loader_id.clone()));
        self.progress.lock().idle_loader = loader;
        self.check();
    }

    fn clear_idle(&self) {
        self.progress.lock().idle_loader = None;
    }
}

/// One caller's navigation wait
pub(crate) struct LifecycleWatcher {
    state: Arc<WatcherState>,
    rx: oneshot::Receiver<Result<NavigationResult>>,
    deadline: Option<(Instant, Duration)>,
    network: Arc<NetworkManager>,
    quiet_window: Duration,
    _subscription: Subscription,
}

impl LifecycleWatcher {
    /// Register synchronously; fails if the frame is already gone
    pub(crate) fn new(
        manager: &Arc<FrameManager>,
        frame: FrameKey,
        options: &NavigationOptions,
        mode: WatchMode,
    ) -> Result<Self> {
        let config = manager.config();
        let timeout = options.timeout.or_else(|| config.navigation_timeout());
        let deadline = timeout
            .filter(|timeout| !timeout.is_zero())
            .map(|timeout| (Instant::now() + timeout, timeout));

        let mut expected: Vec<&'static str> = options
            .wait_until
            .iter()
            .filter_map(|condition| condition.lifecycle_event())
            .collect();
        expected.sort_unstable();
        expected.dedup();
        let max_inflight = options
            .wait_until
            .iter()
            .filter_map(|condition| condition.max_inflight(&config.network_idle))
            .min();

        if manager.is_disposed() {
            return Err(CDPError::Navigation(
                "Navigating frame's page was closed".to_string(),
            ));
        }
        let initial_loader = manager
            .with_arena(|arena| arena.get(frame).map(|node| node.loader_id.clone()))
            .ok_or_else(|| CDPError::Navigation("Navigating frame was detached".to_string()))?;

        let (tx, rx) = oneshot::channel();
        let state = Arc::new(WatcherState {
            manager: Arc::downgrade(manager),
            frame,
            mode,
            expected,
            max_inflight,
            initial_loader,
            progress: Mutex::new(Progress::default()),
            tx: Mutex::new(Some(tx)),
            rearm: Notify::new(),
        });

        let listener = state.clone();
        let subscription = manager.on_frame_event(move |event| listener.on_frame_event(event));

        if mode == WatchMode::Lifecycle && max_inflight.is_none() {
            state.check();
        }

        Ok(Self {
            state,
            rx,
            deadline,
            network: manager.network().clone(),
            quiet_window: config.network_idle.quiet_window(),
            _subscription: subscription,
        })
    }

    /// Wait for the outcome
    pub(crate) async fn wait(mut self) -> Result<NavigationResult> {
        let mut inflight = self.network.subscribe();
        let quiet_deadline = |count: usize, threshold: Option<usize>, window: Duration| {
            threshold
                .filter(|max| count <= *max)
                .map(|_| Instant::now() + window)
        };
        let mut quiet_at = quiet_deadline(
            *inflight.borrow_and_update(),
            self.state.max_inflight,
            self.quiet_window,
        );

        loop {
            tokio::select! {
                biased;

                outcome = &mut self.rx => {
                    return outcome.unwrap_or_else(|_| {
                        Err(CDPError::Navigation("Navigation watcher dropped".to_string()))
                    });
                }

                _ = sleep_until(self.deadline.map(|(at, _)| at)) => {
                    let limit = self.deadline.map(|(_, limit)| limit).unwrap_or_default();
                    self.state.finish(Err(CDPError::Timeout(format!(
                        "Navigation timeout of {} ms exceeded",
                        limit.as_millis()
                    ))));
                }

                changed = inflight.changed(), if self.state.max_inflight.is_some() => {
                    if changed.is_err() {
                        // Network manager gone with its page
                        self.state.check();
                        continue;
                    }
                    let count = *inflight.borrow_and_update();
                    self.state.clear_idle();
                    quiet_at = quiet_deadline(count, self.state.max_inflight, self.quiet_window);
                }

                _ = self.state.rearm.notified(), if self.state.max_inflight.is_some() => {
                    self.state.clear_idle();
                    quiet_at = quiet_deadline(
                        self.network.inflight_count(),
                        self.state.max_inflight,
                        self.quiet_window,
                    );
                }

                _ = sleep_until(quiet_at) => {
                    quiet_at = None;
                    self.state.mark_idle();
                }
            }
        }
    }
}

/// Sleep until `at`, or forever
async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
