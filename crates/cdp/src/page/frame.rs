//! Frame handle
//!
//! A `Frame` is a key into its page's arena plus a weak link back to the
//! manager. Every getter reads the live tree, so a handle follows the frame
//! across navigations (and main-frame re-keying) and reports detachment.

use serde_json::json;
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

use frame_tree::{FrameChange, FrameKey, FrameNode, World};

use super::execution_context::ExecutionContext;
use super::frame_manager::{FrameEvent, FrameManager};
use super::lifecycle::{LifecycleWatcher, NavigationOptions, NavigationResult, WatchMode};
use crate::cdp::protocol::NavigateResult;
use crate::error::{CDPError, Result};

#[derive(Clone)]
pub struct Frame {
    key: FrameKey,
    manager: Weak<FrameManager>,
}

impl Frame {
    pub(crate) fn new(key: FrameKey, manager: Weak<FrameManager>) -> Self {
        Self { key, manager }
    }

    pub fn key(&self) -> FrameKey {
        self.key
    }

    fn manager(&self) -> Result<Arc<FrameManager>> {
        self.manager
            .upgrade()
            .ok_or_else(|| CDPError::Navigation("Frame's page was closed".to_string()))
    }

    /// Point-in-time copy of the frame's node
    pub fn snapshot(&self) -> Option<FrameNode> {
        let manager = self.manager.upgrade()?;
        manager.with_arena(|arena| arena.get(self.key).cloned())
    }

    fn read<R>(&self, read: impl FnOnce(&FrameNode) -> R) -> Option<R> {
        let manager = self.manager.upgrade()?;
        manager.with_arena(|arena| arena.get(self.key).map(read))
    }

    pub fn id(&self) -> Option<String> {
        self.read(|node| node.id.clone())
    }

    pub fn url(&self) -> Option<String> {
        self.read(|node| node.url.clone())
    }

    pub fn name(&self) -> Option<String> {
        self.read(|node| node.name.clone())
    }

    pub fn loader_id(&self) -> Option<String> {
        self.read(|node| node.loader_id.clone()).flatten()
    }

    pub fn is_main_frame(&self) -> bool {
        self.read(FrameNode::is_main_frame).unwrap_or(false)
    }

    pub fn is_detached(&self) -> bool {
        self.read(|_| ()).is_none()
    }

    pub fn parent_frame(&self) -> Option<Frame> {
        self.read(|node| node.parent)
            .flatten()
            .map(|key| Frame::new(key, self.manager.clone()))
    }

    pub fn child_frames(&self) -> Vec<Frame> {
        self.read(|node| node.children.to_vec())
            .unwrap_or_default()
            .into_iter()
            .map(|key| Frame::new(key, self.manager.clone()))
            .collect()
    }

    /// Context for `world`, waiting for it to be created if needed
    ///
    /// Bounded by the default timeout; fails if the frame goes away first.
    pub async fn execution_context(&self, world: World) -> Result<ExecutionContext> {
        let manager = self.manager()?;

        let notify = Arc::new(Notify::new());
        let _subscription = {
            let notify = notify.clone();
            let key = self.key;
            manager.on_frame_event(move |event| {
                let relevant = match event {
                    FrameEvent::Disposed => true,
                    FrameEvent::Changed(FrameChange::ContextCreated { key: k, .. })
                    | FrameEvent::Changed(FrameChange::Detached { key: k, .. }) => *k == key,
                    _ => false,
                };
                if relevant {
                    notify.notify_one();
                }
            })
        };

        let wait = async {
            loop {
                match self.current_context(&manager, world) {
                    Ok(Some(context)) => return Ok(context),
                    Ok(None) => {}
                    Err(e) => return Err(e),
                }
                notify.notified().await;
            }
        };

        match manager.config().default_timeout() {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                CDPError::Timeout(format!(
                    "Waiting for {:?} world execution context timed out after {} ms",
                    world,
                    limit.as_millis()
                ))
            })?,
            None => wait.await,
        }
    }

    fn current_context(
        &self,
        manager: &Arc<FrameManager>,
        world: World,
    ) -> Result<Option<ExecutionContext>> {
        if manager.is_disposed() {
            return Err(CDPError::Navigation("Frame's page was closed".to_string()));
        }
        let context = manager
            .with_arena(|arena| arena.get(self.key).map(|node| node.context(world).cloned()))
            .ok_or_else(|| CDPError::Navigation("Frame was detached".to_string()))?;

        let Some(context) = context else {
            return Ok(None);
        };
        let Some(session) = manager.session_by_id(&context.session_id) else {
            return Ok(None);
        };
        Ok(Some(ExecutionContext::new(
            context,
            self.key,
            world,
            session,
            Arc::downgrade(manager),
        )))
    }

    /// Navigate this frame and wait per `options`
    pub async fn goto(&self, url: &str, options: NavigationOptions) -> Result<NavigationResult> {
        let manager = self.manager()?;
        let frame_id = self
            .id()
            .ok_or_else(|| CDPError::Navigation("Frame was detached".to_string()))?;

        // Subscribe before the command so no event is missed
        let watcher = LifecycleWatcher::new(&manager, self.key, &options, WatchMode::Navigation)?;
        let session = manager.session_for_frame(self.key);
        drop(manager);

        let navigation: NavigateResult = session
            .send_typed("Page.navigate", json!({"url": url, "frameId": frame_id}))
            .await?;
        if let Some(error_text) = navigation.error_text.filter(|text| !text.is_empty()) {
            return Err(CDPError::Navigation(format!("{} at {}", error_text, url)));
        }

        watcher.wait().await
    }

    /// Wait for the next navigation of this frame
    pub async fn wait_for_navigation(&self, options: NavigationOptions) -> Result<NavigationResult> {
        self.manager()?.wait_for_frame_navigation(self, options).await
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && Weak::ptr_eq(&self.manager, &other.manager)
    }
}

impl Eq for Frame {}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("key", &self.key)
            .field("id", &self.id())
            .field("url", &self.url())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::PageHarness;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_handle_survives_main_frame_rekey() {
        let harness = PageHarness::open("T1", "S1", "about:blank").await;
        let main = harness.page.main_frame().unwrap();

        harness.navigate("T1-swapped", None, "http://z/", "L5").await;
        assert_eq!(main.id().as_deref(), Some("T1-swapped"));
        assert_eq!(main.url().as_deref(), Some("http://z/"));
        assert!(main.is_main_frame());
        assert_eq!(harness.page.frame_manager().frames().len(), 1);
    }

    #[tokio::test]
    async fn test_execution_context_waits_for_creation() {
        let harness = PageHarness::open("T1", "S1", "about:blank").await;
        let main = harness.page.main_frame().unwrap();

        let pending = tokio::spawn({
            let main = main.clone();
            async move { main.execution_context(World::Main).await }
        });
        tokio::task::yield_now().await;

        harness.context_created(7, "T1", true).await;
        let context = pending.await.unwrap().unwrap();
        assert_eq!(context.id(), 7);
        assert_eq!(context.world(), World::Main);
    }

    #[tokio::test]
    async fn test_execution_context_fails_when_frame_detached() {
        let harness = PageHarness::open("T1", "S1", "about:blank").await;
        harness.navigate("T1", None, "http://x/", "L1").await;
        harness.attach_frame("child", "T1").await;
        let child = harness.page.frame_manager().frame("child").unwrap();

        let pending = tokio::spawn(async move { child.execution_context(World::Isolated).await });
        tokio::task::yield_now().await;

        harness.detach_frame("child").await;
        assert!(pending.await.unwrap().unwrap_err().is_navigation());
    }

    #[tokio::test]
    async fn test_execution_context_times_out() {
        let config = crate::config::BrowserConfig::default()
            .with_default_timeout(Duration::from_millis(20));
        let harness = PageHarness::open_with_config("T1", "S1", "about:blank", config).await;
        let main = harness.page.main_frame().unwrap();

        let err = main.execution_context(World::Isolated).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_goto_reports_navigation_error_text() {
        let harness = PageHarness::open("T1", "S1", "about:blank").await;
        harness.transport.reply(
            "Page.navigate",
            json!({"frameId": "T1", "loaderId": "L1", "errorText": "net::ERR_NAME_NOT_RESOLVED"}),
        );
        let main = harness.page.main_frame().unwrap();

        let err = main
            .goto("http://nowhere.invalid/", NavigationOptions::new())
            .await
            .unwrap_err();
        assert!(err.is_navigation());
        assert_eq!(
            err.to_string(),
            "Navigation failed: net::ERR_NAME_NOT_RESOLVED at http://nowhere.invalid/"
        );
    }
}
