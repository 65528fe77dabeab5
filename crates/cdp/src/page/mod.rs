//! Page - a page target's session, frame tree and navigation API

pub mod execution_context;
pub mod frame;
pub mod frame_manager;
pub mod lifecycle;
pub mod network;

pub use execution_context::ExecutionContext;
pub use frame::Frame;
pub use frame_manager::{FrameEvent, FrameManager};
pub use lifecycle::{NavigationOptions, NavigationResult, WaitUntil};
pub use network::{DocumentResponse, NetworkManager};

use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cdp::protocol::TargetId;
use crate::cdp::CDPSession;
use crate::config::BrowserConfig;
use crate::error::{CDPError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum PageState {
    Initializing,
    Ready,
    Failed(String),
}

pub struct Page {
    target_id: TargetId,
    session: Arc<CDPSession>,
    frame_manager: Arc<FrameManager>,
    state: watch::Sender<PageState>,
}

impl Page {
    /// Bind a page object to a freshly attached session
    ///
    /// Synchronous: the frame manager is listening before this returns.
    pub(crate) fn new(session: Arc<CDPSession>, url: &str, config: Arc<BrowserConfig>) -> Arc<Self> {
        let frame_manager = FrameManager::new(session.clone(), url, config);
        let (state, _) = watch::channel(PageState::Initializing);
        Arc::new(Self {
            target_id: session.target_id().to_string(),
            session,
            frame_manager,
            state,
        })
    }

    /// Run the frame manager's setup; records the outcome for `wait_ready`
    pub(crate) async fn initialize(&self) -> Result<()> {
        let outcome = self.frame_manager.initialize().await;
        let state = match &outcome {
            Ok(()) => PageState::Ready,
            Err(e) => {
                if self.session.is_detached() {
                    debug!("[Page] {} closed during initialization: {}", self.target_id, e);
                } else {
                    warn!("[Page] {} failed to initialize: {}", self.target_id, e);
                }
                PageState::Failed(e.to_string())
            }
        };
        self.state.send_replace(state);
        outcome
    }

    /// Resolves once initialization finished
    pub async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|state| *state != PageState::Initializing)
            .await
            .map_err(|_| CDPError::TargetNotFound(self.target_id.clone()))?
            .clone();

        match state {
            PageState::Failed(reason) => Err(CDPError::Initialization(reason)),
            _ => Ok(()),
        }
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn session(&self) -> &Arc<CDPSession> {
        &self.session
    }

    pub fn frame_manager(&self) -> &Arc<FrameManager> {
        &self.frame_manager
    }

    pub fn main_frame(&self) -> Option<Frame> {
        self.frame_manager.main_frame()
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frame_manager.frames()
    }

    pub fn url(&self) -> Option<String> {
        self.main_frame().and_then(|frame| frame.url())
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_detached() || self.frame_manager.is_disposed()
    }

    /// Navigate the main frame and wait per `options`
    pub async fn goto(&self, url: &str, options: NavigationOptions) -> Result<NavigationResult> {
        let frame = self
            .main_frame()
            .ok_or_else(|| CDPError::Navigation("Page has no main frame".to_string()))?;
        frame.goto(url, options).await
    }

    /// Wait for the main frame's next navigation
    pub async fn wait_for_navigation(&self, options: NavigationOptions) -> Result<NavigationResult> {
        let frame = self
            .main_frame()
            .ok_or_else(|| CDPError::Navigation("Page has no main frame".to_string()))?;
        self.frame_manager.wait_for_frame_navigation(&frame, options).await
    }

    /// Close the page target
    pub async fn close(&self) -> Result<()> {
        let connection = self.session.connection().ok_or(CDPError::ConnectionClosed)?;
        connection
            .root()
            .send("Target.closeTarget", json!({ "targetId": self.target_id }))
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("target_id", &self.target_id)
            .field("session_id", &self.session.id())
            .field("url", &self.url())
            .finish()
    }
}
