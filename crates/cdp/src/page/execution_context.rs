//! Execution Context - a script world inside one frame's document
//!
//! Contexts die with their document. Every call checks liveness before and
//! after the round trip, so a result never comes from a context the
//! frame has already replaced.

use serde_json::{json, Value};
use std::sync::{Arc, Weak};

use frame_tree::{ContextKey, ExecutionContextId, FrameKey, World};

use super::frame::Frame;
use super::frame_manager::FrameManager;
use crate::cdp::CDPSession;
use crate::error::{CDPError, Result};

#[derive(Clone)]
pub struct ExecutionContext {
    key: ContextKey,
    frame: FrameKey,
    world: World,
    session: Arc<CDPSession>,
    manager: Weak<FrameManager>,
}

impl ExecutionContext {
    pub(crate) fn new(
        key: ContextKey,
        frame: FrameKey,
        world: World,
        session: Arc<CDPSession>,
        manager: Weak<FrameManager>,
    ) -> Self {
        Self {
            key,
            frame,
            world,
            session,
            manager,
        }
    }

    pub fn id(&self) -> ExecutionContextId {
        self.key.id
    }

    pub fn world(&self) -> World {
        self.world
    }

    pub fn frame(&self) -> Frame {
        Frame::new(self.frame, self.manager.clone())
    }

    /// Still bound to its frame's current document
    pub fn is_valid(&self) -> bool {
        self.manager
            .upgrade()
            .filter(|manager| !manager.is_disposed())
            .map(|manager| manager.with_arena(|arena| arena.is_context_alive(&self.key)))
            .unwrap_or(false)
            && !self.session.is_detached()
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(CDPError::ExecutionContextDestroyed)
        }
    }

    /// Evaluate an expression and return its JSON value
    pub async fn evaluate(&self, expression: &str) -> Result<Value> {
        self.ensure_valid()?;
        let response = self
            .session
            .send(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "contextId": self.key.id,
                    "returnByValue": true,
                    "awaitPromise": true,
                    "userGesture": true,
                }),
            )
            .await
            .map_err(rewrite_error)?;
        self.ensure_valid()?;
        remote_value(response)
    }

    /// Call a function declaration with JSON arguments
    pub async fn call_function(&self, declaration: &str, args: Vec<Value>) -> Result<Value> {
        self.ensure_valid()?;
        let arguments: Vec<Value> = args.into_iter().map(|value| json!({ "value": value })).collect();
        let response = self
            .session
            .send(
                "Runtime.callFunctionOn",
                json!({
                    "functionDeclaration": declaration,
                    "executionContextId": self.key.id,
                    "arguments": arguments,
                    "returnByValue": true,
                    "awaitPromise": true,
                    "userGesture": true,
                }),
            )
            .await
            .map_err(rewrite_error)?;
        self.ensure_valid()?;
        remote_value(response)
    }
}

/// The browser's own wording when a context vanished mid-call
fn rewrite_error(error: CDPError) -> CDPError {
    match &error {
        CDPError::Protocol { message, .. }
            if message.contains("Cannot find context with specified id")
                || message.contains("Execution context was destroyed")
                || message.contains("Inspected target navigated or closed") =>
        {
            CDPError::ExecutionContextDestroyed
        }
        _ => error,
    }
}

/// Unwrap a `Runtime.RemoteObject` returned by value
fn remote_value(response: Value) -> Result<Value> {
    if let Some(details) = response.get("exceptionDetails") {
        let message = details
            .pointer("/exception/description")
            .and_then(Value::as_str)
            .or_else(|| details.get("text").and_then(Value::as_str))
            .unwrap_or("Uncaught exception");
        return Err(CDPError::Evaluation(message.to_string()));
    }

    let result = response
        .get("result")
        .ok_or_else(|| CDPError::invalid_response("Runtime.evaluate", "missing result"))?;

    if let Some(unserializable) = result.get("unserializableValue").and_then(Value::as_str) {
        return Ok(Value::String(unserializable.to_string()));
    }
    Ok(result.get("value").cloned().unwrap_or(Value::Null))
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("key", &self.key)
            .field("frame", &self.frame)
            .field("world", &self.world)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::PageHarness;

    #[test]
    fn test_remote_value_unwrapping() {
        assert_eq!(
            remote_value(json!({"result": {"type": "number", "value": 2}})).unwrap(),
            json!(2)
        );
        assert_eq!(
            remote_value(json!({"result": {"type": "undefined"}})).unwrap(),
            Value::Null
        );
        assert_eq!(
            remote_value(json!({"result": {"type": "number", "unserializableValue": "NaN"}}))
                .unwrap(),
            json!("NaN")
        );

        let err = remote_value(json!({
            "result": {"type": "object"},
            "exceptionDetails": {"text": "Uncaught", "exception": {"description": "ReferenceError: nope is not defined"}}
        }))
        .unwrap_err();
        assert_eq!(err.to_string(), "Evaluation failed: ReferenceError: nope is not defined");
    }

    #[tokio::test]
    async fn test_evaluate_in_live_context() {
        let harness = PageHarness::open("T1", "S1", "about:blank").await;
        harness.context_created(3, "T1", true).await;
        harness
            .transport
            .reply("Runtime.evaluate", json!({"result": {"type": "number", "value": 42}}));

        let context = harness
            .page
            .main_frame()
            .unwrap()
            .execution_context(World::Main)
            .await
            .unwrap();
        assert_eq!(context.evaluate("6 * 7").await.unwrap(), json!(42));

        let sent = harness.transport.commands("Runtime.evaluate");
        assert_eq!(sent[0].params["contextId"], 3);
        assert_eq!(sent[0].session_id.as_deref(), Some("S1"));
    }

    #[tokio::test]
    async fn test_navigation_invalidates_context() {
        let harness = PageHarness::open("T1", "S1", "about:blank").await;
        harness.context_created(3, "T1", true).await;
        let context = harness
            .page
            .main_frame()
            .unwrap()
            .execution_context(World::Main)
            .await
            .unwrap();
        assert!(context.is_valid());

        harness.navigate("T1", None, "http://x/", "L1").await;
        assert!(!context.is_valid());

        let sent_before = harness.transport.sent_count();
        let err = context.evaluate("1").await.unwrap_err();
        assert!(matches!(err, CDPError::ExecutionContextDestroyed));
        assert_eq!(harness.transport.sent_count(), sent_before);
    }

    #[tokio::test]
    async fn test_context_destroyed_during_call() {
        let harness = PageHarness::open("T1", "S1", "about:blank").await;
        harness.context_created(3, "T1", true).await;
        harness.transport.reply_error(
            "Runtime.callFunctionOn",
            -32000,
            "Cannot find context with specified id",
        );
        let context = harness
            .page
            .main_frame()
            .unwrap()
            .execution_context(World::Main)
            .await
            .unwrap();

        let err = context
            .call_function("(a, b) => a + b", vec![json!(1), json!(2)])
            .await
            .unwrap_err();
        assert!(matches!(err, CDPError::ExecutionContextDestroyed));
    }

    #[tokio::test]
    async fn test_isolated_context_is_separate() {
        let harness = PageHarness::open("T1", "S1", "about:blank").await;
        harness.context_created(3, "T1", true).await;
        harness.context_created(4, "T1", false).await;

        let main = harness.page.main_frame().unwrap();
        let isolated = main.execution_context(World::Isolated).await.unwrap();
        assert_eq!(isolated.id(), 4);

        harness
            .event("Runtime.executionContextDestroyed", json!({"executionContextId": 4}))
            .await;
        assert!(!isolated.is_valid());
        assert!(main.execution_context(World::Main).await.unwrap().is_valid());
    }
}
