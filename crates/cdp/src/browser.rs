//! Browser - top-level handle over one CDP connection
//!
//! Owns the connection and the target registry. Page objects come from the
//! registry as targets attach; nothing here talks to a page directly.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::cdp::{CDPConnection, ConnectionEvent, Inbound, Transport, WebSocketTransport};
use crate::config::BrowserConfig;
use crate::error::Result;
use crate::page::Page;
use crate::target::{Target, TargetEvent, TargetRegistry};

/// `Browser.getVersion`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BrowserVersion {
    pub protocol_version: String,
    pub product: String,
    #[serde(default)]
    pub revision: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub js_version: String,
}

pub struct Browser {
    config: Arc<BrowserConfig>,
    connection: Arc<CDPConnection>,
    registry: Arc<TargetRegistry>,
}

impl Browser {
    /// Connect to `config.ws_url` over WebSocket
    pub async fn connect(config: BrowserConfig) -> Result<Self> {
        let (transport, inbound) = WebSocketTransport::connect(&config.ws_url).await?;
        Self::with_transport(transport, inbound, config).await
    }

    /// Run on any transport; target discovery starts before this returns
    pub async fn with_transport(
        transport: Arc<dyn Transport>,
        inbound: Inbound,
        config: BrowserConfig,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let connection = CDPConnection::new(transport, inbound, config.protocol_timeout());
        let registry = TargetRegistry::new(connection.clone(), config.clone());

        let root = connection.root();
        futures_util::try_join!(
            root.send("Target.setDiscoverTargets", json!({"discover": true})),
            root.send(
                "Target.setAutoAttach",
                json!({"autoAttach": true, "waitForDebuggerOnStart": true, "flatten": true}),
            ),
        )?;

        info!("[Browser] Connected (session {})", config.id);
        Ok(Self {
            config,
            connection,
            registry,
        })
    }

    pub fn config(&self) -> &Arc<BrowserConfig> {
        &self.config
    }

    pub fn connection(&self) -> &Arc<CDPConnection> {
        &self.connection
    }

    pub fn registry(&self) -> &Arc<TargetRegistry> {
        &self.registry
    }

    pub fn is_connected(&self) -> bool {
        !self.connection.is_closed()
    }

    /// Open a tab and navigate it to `url`
    pub async fn new_page(&self, url: &str) -> Result<Arc<Page>> {
        self.registry.create_page(url, None).await
    }

    pub fn pages(&self) -> Vec<Arc<Page>> {
        self.registry.pages()
    }

    pub fn targets(&self) -> Vec<Target> {
        self.registry.targets()
    }

    pub fn target_events(&self) -> broadcast::Receiver<TargetEvent> {
        self.registry.subscribe()
    }

    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection.subscribe()
    }

    pub async fn version(&self) -> Result<BrowserVersion> {
        self.connection
            .root()
            .send_typed("Browser.getVersion", json!({}))
            .await
    }

    /// Ask the browser to exit, then drop the connection
    pub async fn close(&self) -> Result<()> {
        if let Err(e) = self.connection.root().send("Browser.close", json!({})).await {
            // The browser may hang up before answering
            debug!("[Browser] Browser.close: {}", e);
        }
        self.disconnect().await
    }

    /// Drop the connection and leave the browser running
    pub async fn disconnect(&self) -> Result<()> {
        let result = self.connection.close().await;
        self.registry.shutdown();
        info!("[Browser] Disconnected");
        result
    }
}

impl std::fmt::Debug for Browser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Browser")
            .field("id", &self.config.id)
            .field("ws_url", &self.config.ws_url)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockSetup;

    #[tokio::test]
    async fn test_connect_enables_discovery_and_auto_attach() {
        let setup = MockSetup::connect().await;

        let discover = setup.transport.commands("Target.setDiscoverTargets");
        assert_eq!(discover[0].params["discover"], true);
        let auto_attach = setup.transport.commands("Target.setAutoAttach");
        assert_eq!(auto_attach[0].params["flatten"], true);
        assert!(auto_attach[0].session_id.is_none());
        assert!(setup.browser.is_connected());
    }

    #[tokio::test]
    #[ignore] // Needs running Chrome
    async fn test_live_browser_round_trip() {
        let browser = Browser::connect(BrowserConfig::default()).await.unwrap();
        tokio_test::assert_ok!(browser.version().await);

        let page = browser.new_page("about:blank").await.unwrap();
        assert!(page.main_frame().is_some());
        page.close().await.unwrap();
        browser.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_version() {
        let setup = MockSetup::connect().await;
        let version = setup.browser.version().await.unwrap();
        assert!(version.product.starts_with("HeadlessChrome"));
        assert_eq!(version.protocol_version, "1.3");
    }

    #[tokio::test]
    async fn test_close_disposes_pages() {
        let setup = MockSetup::connect().await;
        let page = setup.open_page("T1", "S1", "http://x/").await;
        let mut events = setup.browser.connection_events();

        setup.browser.close().await.unwrap();

        assert!(!setup.transport.commands("Browser.close").is_empty());
        assert!(!setup.browser.is_connected());
        assert!(page.is_closed());
        assert!(page.frame_manager().is_disposed());

        let mut saw_disconnect = false;
        while let Ok(event) = events.try_recv() {
            saw_disconnect |= event == ConnectionEvent::Disconnected;
        }
        assert!(saw_disconnect);
    }
}
