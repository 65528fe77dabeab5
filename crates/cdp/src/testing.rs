//! Scripted browser for unit tests
//!
//! `MockTransport` records every command and answers it synchronously by
//! pushing the reply onto the inbound channel, so replies and pushed events
//! are processed in exactly the order they were produced. `settle` relies
//! on that: a round trip through the message loop means everything pushed
//! before it has been dispatched.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

use crate::browser::Browser;
use crate::cdp::protocol::RequestId;
use crate::cdp::{CDPConnection, Inbound, Transport};
use crate::config::BrowserConfig;
use crate::error::Result;
use crate::page::{FrameManager, Page};

/// Never logged, always answered
const SETTLE: &str = "Mock.settle";

const WAIT_LIMIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub(crate) struct SentCommand {
    pub id: RequestId,
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

#[derive(Clone)]
enum Reply {
    Result(Value),
    Error { code: i64, message: String },
    Never,
}

#[derive(Default)]
pub(crate) struct MockTransport {
    inbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    sent: Mutex<Vec<SentCommand>>,
    replies: Mutex<HashMap<String, Reply>>,
    /// session id -> (target id, url) from pushed attach events
    attached: Mutex<HashMap<String, (String, String)>>,
    sent_notify: Notify,
}

impl MockTransport {
    pub(crate) fn new() -> (Arc<Self>, Inbound) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            inbound: Mutex::new(Some(tx)),
            ..Default::default()
        };
        (Arc::new(transport), rx)
    }

    pub(crate) fn reply(&self, method: &str, result: Value) {
        self.replies.lock().insert(method.to_string(), Reply::Result(result));
    }

    pub(crate) fn reply_error(&self, method: &str, code: i64, message: &str) {
        self.replies.lock().insert(
            method.to_string(),
            Reply::Error {
                code,
                message: message.to_string(),
            },
        );
    }

    pub(crate) fn never_reply(&self, method: &str) {
        self.replies.lock().insert(method.to_string(), Reply::Never);
    }

    pub(crate) fn push(&self, message: Value) {
        if message["method"] == "Target.attachedToTarget" {
            let params = &message["params"];
            if let Some(session_id) = params["sessionId"].as_str() {
                let info = &params["targetInfo"];
                self.attached.lock().insert(
                    session_id.to_string(),
                    (
                        info["targetId"].as_str().unwrap_or_default().to_string(),
                        info["url"].as_str().unwrap_or_default().to_string(),
                    ),
                );
            }
        }
        self.push_raw(&message.to_string());
    }

    pub(crate) fn push_raw(&self, text: &str) {
        if let Some(tx) = self.inbound.lock().as_ref() {
            let _ = tx.send(text.to_string());
        }
    }

    /// Simulate the browser going away
    pub(crate) fn hang_up(&self) {
        self.inbound.lock().take();
    }

    pub(crate) fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub(crate) fn commands(&self, method: &str) -> Vec<SentCommand> {
        self.sent
            .lock()
            .iter()
            .filter(|command| command.method == method)
            .cloned()
            .collect()
    }

    pub(crate) fn methods_for_session(&self, session_id: &str) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|command| command.session_id.as_deref() == Some(session_id))
            .map(|command| command.method.clone())
            .collect()
    }

    pub(crate) async fn wait_for_command(&self, method: &str) -> SentCommand {
        self.wait_until(|command| command.method == method).await
    }

    pub(crate) async fn wait_for_session_command(&self, session_id: &str, method: &str) -> SentCommand {
        self.wait_until(|command| {
            command.method == method && command.session_id.as_deref() == Some(session_id)
        })
        .await
    }

    async fn wait_until(&self, predicate: impl Fn(&SentCommand) -> bool) -> SentCommand {
        let wait = async {
            loop {
                let notified = self.sent_notify.notified();
                if let Some(command) = self.sent.lock().iter().find(|c| predicate(c)).cloned() {
                    return command;
                }
                notified.await;
            }
        };
        tokio::time::timeout(WAIT_LIMIT, wait)
            .await
            .expect("command was never sent")
    }

    fn default_reply(&self, method: &str, session_id: Option<&str>) -> Value {
        match method {
            "Page.getFrameTree" => {
                let (target_id, url) = session_id
                    .and_then(|id| self.attached.lock().get(id).cloned())
                    .unwrap_or_default();
                json!({"frameTree": {"frame": {
                    "id": target_id,
                    "loaderId": "L0",
                    "url": url,
                    "securityOrigin": "",
                    "mimeType": "text/html"
                }}})
            }
            "Target.createTarget" => json!({"targetId": "T-new"}),
            "Browser.getVersion" => json!({
                "protocolVersion": "1.3",
                "product": "HeadlessChrome/120.0.6099.109",
                "revision": "@1",
                "userAgent": "Mozilla/5.0",
                "jsVersion": "12.0"
            }),
            _ => json!({}),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, message: String) -> Result<()> {
        let message: Value = serde_json::from_str(&message)?;
        let id = message["id"].as_u64().unwrap_or_default();
        let method = message["method"].as_str().unwrap_or_default().to_string();
        let session_id = message["sessionId"].as_str().map(str::to_string);

        let mut response = json!({"id": id});
        if let Some(session_id) = &session_id {
            response["sessionId"] = json!(session_id);
        }

        if method == SETTLE {
            response["result"] = json!({});
            self.push(response);
            return Ok(());
        }

        let reply = self.replies.lock().get(&method).cloned();
        let reply = reply.unwrap_or_else(|| Reply::Result(self.default_reply(&method, session_id.as_deref())));

        self.sent.lock().push(SentCommand {
            id,
            method,
            params: message.get("params").cloned().unwrap_or(Value::Null),
            session_id,
        });
        self.sent_notify.notify_waiters();

        match reply {
            Reply::Result(result) => response["result"] = result,
            Reply::Error { code, message } => {
                response["error"] = json!({"code": code, "message": message});
            }
            Reply::Never => return Ok(()),
        }
        self.push(response);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Round trip through the message loop
async fn settle(connection: &CDPConnection) {
    let _ = connection.root().send(SETTLE, json!({})).await;
}

fn attached_event(parent: Option<&str>, target_id: &str, session_id: &str, target_type: &str, url: &str) -> Value {
    let mut event = json!({
        "method": "Target.attachedToTarget",
        "params": {
            "sessionId": session_id,
            "targetInfo": {"targetId": target_id, "type": target_type, "url": url, "title": "", "attached": true},
            "waitingForDebugger": true
        }
    });
    if let Some(parent) = parent {
        event["sessionId"] = json!(parent);
    }
    event
}

fn detached_event(parent: Option<&str>, session_id: &str, target_id: &str) -> Value {
    let mut event = json!({
        "method": "Target.detachedFromTarget",
        "params": {"sessionId": session_id, "targetId": target_id}
    });
    if let Some(parent) = parent {
        event["sessionId"] = json!(parent);
    }
    event
}

/// Bare connection over a mock transport
pub(crate) struct MockBrowser {
    pub transport: Arc<MockTransport>,
    pub connection: Arc<CDPConnection>,
}

impl MockBrowser {
    pub(crate) fn new() -> Self {
        Self::with_config(BrowserConfig::default())
    }

    pub(crate) fn with_config(config: BrowserConfig) -> Self {
        let (transport, inbound) = MockTransport::new();
        let connection = CDPConnection::new(transport.clone(), inbound, config.protocol_timeout());
        Self { transport, connection }
    }

    pub(crate) async fn attach_raw(&self, target_id: &str, session_id: &str, target_type: &str, parent: Option<&str>) {
        self.transport
            .push(attached_event(parent, target_id, session_id, target_type, ""));
        self.settle().await;
    }

    pub(crate) async fn detach_raw(&self, session_id: &str, target_id: &str) {
        self.transport.push(detached_event(None, session_id, target_id));
        self.settle().await;
    }

    pub(crate) async fn settle(&self) {
        settle(&self.connection).await;
    }
}

/// Full `Browser` over a mock transport
pub(crate) struct MockSetup {
    pub transport: Arc<MockTransport>,
    pub browser: Browser,
}

impl MockSetup {
    pub(crate) async fn connect() -> Self {
        Self::connect_with_config(BrowserConfig::default()).await
    }

    pub(crate) async fn connect_with_config(config: BrowserConfig) -> Self {
        let (transport, inbound) = MockTransport::new();
        let browser = Browser::with_transport(transport.clone(), inbound, config)
            .await
            .unwrap();
        Self { transport, browser }
    }

    pub(crate) async fn settle(&self) {
        settle(self.browser.connection()).await;
    }

    fn target_info(target_id: &str, target_type: &str, url: &str, opener: Option<&str>) -> Value {
        let mut info = json!({"targetId": target_id, "type": target_type, "url": url, "title": "", "attached": false});
        if let Some(opener) = opener {
            info["openerId"] = json!(opener);
        }
        info
    }

    pub(crate) async fn target_created(&self, target_id: &str, target_type: &str, url: &str, opener: Option<&str>) {
        self.transport.push(json!({
            "method": "Target.targetCreated",
            "params": {"targetInfo": Self::target_info(target_id, target_type, url, opener)}
        }));
        self.settle().await;
    }

    pub(crate) async fn target_info_changed(&self, target_id: &str, target_type: &str, url: &str) {
        self.transport.push(json!({
            "method": "Target.targetInfoChanged",
            "params": {"targetInfo": Self::target_info(target_id, target_type, url, None)}
        }));
        self.settle().await;
    }

    pub(crate) async fn target_destroyed(&self, target_id: &str) {
        self.transport.push(json!({
            "method": "Target.targetDestroyed",
            "params": {"targetId": target_id}
        }));
        self.settle().await;
    }

    pub(crate) async fn attach(&self, target_id: &str, session_id: &str, target_type: &str, url: &str) {
        self.transport
            .push(attached_event(None, target_id, session_id, target_type, url));
        self.settle().await;
    }

    /// Announce, attach and wait for an initialized page
    pub(crate) async fn open_page(&self, target_id: &str, session_id: &str, url: &str) -> Arc<Page> {
        self.target_created(target_id, "page", url, None).await;
        self.attach(target_id, session_id, "page", url).await;
        let page = self.browser.registry().page(target_id).unwrap();
        page.wait_ready().await.unwrap();
        page
    }
}

/// One initialized page plus helpers that speak for its session
pub(crate) struct PageHarness {
    pub browser: Browser,
    pub transport: Arc<MockTransport>,
    pub page: Arc<Page>,
    target_id: String,
    session_id: String,
}

impl PageHarness {
    pub(crate) async fn open(target_id: &str, session_id: &str, url: &str) -> Self {
        Self::open_with_config(target_id, session_id, url, BrowserConfig::default()).await
    }

    pub(crate) async fn open_with_config(
        target_id: &str,
        session_id: &str,
        url: &str,
        config: BrowserConfig,
    ) -> Self {
        let setup = MockSetup::connect_with_config(config).await;
        let page = setup.open_page(target_id, session_id, url).await;
        Self {
            browser: setup.browser,
            transport: setup.transport,
            page,
            target_id: target_id.to_string(),
            session_id: session_id.to_string(),
        }
    }

    pub(crate) async fn settle(&self) {
        settle(self.browser.connection()).await;
    }

    /// Event on the page session
    pub(crate) async fn event(&self, method: &str, params: Value) {
        let session_id = self.session_id.clone();
        self.child_event(&session_id, method, params).await;
    }

    /// Event on any session
    pub(crate) async fn child_event(&self, session_id: &str, method: &str, params: Value) {
        self.transport
            .push(json!({"method": method, "params": params, "sessionId": session_id}));
        self.settle().await;
    }

    pub(crate) async fn navigate(&self, frame_id: &str, parent_id: Option<&str>, url: &str, loader_id: &str) {
        let mut frame = json!({
            "id": frame_id,
            "loaderId": loader_id,
            "url": url,
            "name": "",
            "securityOrigin": "",
            "mimeType": "text/html"
        });
        if let Some(parent_id) = parent_id {
            frame["parentId"] = json!(parent_id);
        }
        self.event("Page.frameNavigated", json!({"frame": frame, "type": "Navigation"}))
            .await;
    }

    pub(crate) async fn navigate_within_document(&self, frame_id: &str, url: &str) {
        self.event(
            "Page.navigatedWithinDocument",
            json!({"frameId": frame_id, "url": url}),
        )
        .await;
    }

    pub(crate) async fn lifecycle(&self, frame_id: &str, loader_id: &str, name: &str) {
        self.event(
            "Page.lifecycleEvent",
            json!({"frameId": frame_id, "loaderId": loader_id, "name": name, "timestamp": 1.0}),
        )
        .await;
    }

    pub(crate) async fn attach_frame(&self, frame_id: &str, parent_id: &str) {
        self.event(
            "Page.frameAttached",
            json!({"frameId": frame_id, "parentFrameId": parent_id}),
        )
        .await;
    }

    pub(crate) async fn detach_frame(&self, frame_id: &str) {
        self.event(
            "Page.frameDetached",
            json!({"frameId": frame_id, "reason": "remove"}),
        )
        .await;
    }

    pub(crate) async fn context_created(&self, id: i64, frame_id: &str, is_default: bool) {
        self.event(
            "Runtime.executionContextCreated",
            json!({"context": {
                "id": id,
                "origin": "",
                "name": if is_default { "" } else { "__devtools_utility_world__" },
                "auxData": {"frameId": frame_id, "isDefault": is_default, "type": if is_default { "default" } else { "isolated" }}
            }}),
        )
        .await;
    }

    /// The page session itself goes away
    pub(crate) async fn detach_session(&self) {
        self.transport
            .push(detached_event(None, &self.session_id, &self.target_id));
        self.settle().await;
    }

    /// Auto-attached target under the page session
    pub(crate) async fn attach_child_session(&self, target_id: &str, session_id: &str, target_type: &str) {
        self.transport.push(attached_event(
            Some(&self.session_id),
            target_id,
            session_id,
            target_type,
            "",
        ));
        self.settle().await;
    }

    pub(crate) async fn detach_child_session(&self, session_id: &str, target_id: &str) {
        self.transport
            .push(detached_event(Some(&self.session_id), session_id, target_id));
        self.settle().await;
    }

    /// A second top-level page, without waiting for initialization
    pub(crate) async fn attach_page_raw(&self, target_id: &str, session_id: &str, url: &str) {
        self.transport.push(json!({
            "method": "Target.targetCreated",
            "params": {"targetInfo": {"targetId": target_id, "type": "page", "url": url, "title": "", "attached": false}}
        }));
        self.transport
            .push(attached_event(None, target_id, session_id, "page", url));
        self.settle().await;
    }
}

/// Every waiter has unsubscribed from the frame manager
pub(crate) fn assert_no_leaked_listeners(manager: &FrameManager) {
    assert_eq!(manager.frame_listener_count(), 0, "frame event listeners leaked");
}

/// Sent at least once, always on the browser session
pub(crate) fn assert_sent_without_session(transport: &MockTransport, method: &str) {
    let sent = transport.commands(method);
    assert!(!sent.is_empty(), "{} was never sent", method);
    assert!(sent.iter().all(|command| command.session_id.is_none()));
}
