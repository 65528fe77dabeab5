//! CDP Protocol Types
//!
//! Wire messages plus the typed event vocabulary the core reacts to.
//! Events are decoded once, at the connection boundary, into
//! `ProtocolEvent`; everything downstream matches on the enum.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request ID - monotonically increasing
pub type RequestId = u64;

/// Target ID from Chrome
pub type TargetId = String;

/// Session ID for attached targets (empty = browser session)
pub type SessionId = String;

/// CDP Request sent to browser
#[derive(Debug, Clone, Serialize)]
pub struct CDPRequest {
    pub id: RequestId,
    pub method: String,
    pub params: Value,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

/// CDP Response from browser
#[derive(Debug, Clone, Deserialize)]
pub struct CDPResponse {
    pub id: RequestId,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<CDPErrorPayload>,
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<SessionId>,
}

/// Error body of a failed command
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CDPErrorPayload {
    #[serde(default)]
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// CDP Event from browser (no request ID)
#[derive(Debug, Clone, Deserialize)]
pub struct CDPEvent {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<SessionId>,
}

/// Unified inbound message (response or event)
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CDPMessage {
    Response(CDPResponse),
    Event(CDPEvent),
}

/// Target Info from Target domain events
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub target_id: TargetId,
    #[serde(rename = "type")]
    pub target_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub attached: bool,
    #[serde(default)]
    pub opener_id: Option<TargetId>,
    #[serde(default)]
    pub browser_context_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedToTarget {
    pub session_id: SessionId,
    pub target_info: TargetInfo,
    #[serde(default)]
    pub waiting_for_debugger: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetachedFromTarget {
    pub session_id: SessionId,
    #[serde(default)]
    pub target_id: Option<TargetId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfoEnvelope {
    pub target_info: TargetInfo,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDestroyed {
    pub target_id: TargetId,
}

/// `Page.Frame`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FramePayload {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub loader_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub url: String,
    #[serde(default)]
    pub url_fragment: Option<String>,
}

impl FramePayload {
    /// Chrome reports the fragment separately
    pub fn full_url(&self) -> String {
        match &self.url_fragment {
            Some(fragment) => format!("{}{}", self.url, fragment),
            None => self.url.clone(),
        }
    }
}

/// `Page.FrameTree`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameTree {
    pub frame: FramePayload,
    #[serde(default)]
    pub child_frames: Vec<FrameTree>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetFrameTreeResult {
    pub frame_tree: FrameTree,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameAttached {
    pub frame_id: String,
    pub parent_frame_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameNavigated {
    pub frame: FramePayload,
    #[serde(rename = "type", default)]
    pub navigation_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigatedWithinDocument {
    pub frame_id: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameDetached {
    pub frame_id: String,
    /// "remove" or "swap"
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameIdParams {
    pub frame_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub frame_id: String,
    pub loader_id: String,
    pub name: String,
    #[serde(default)]
    pub timestamp: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContextAuxData {
    #[serde(default)]
    pub frame_id: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(rename = "type", default)]
    pub context_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContextDescription {
    pub id: i64,
    #[serde(default)]
    pub origin: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub aux_data: ExecutionContextAuxData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionContextCreated {
    pub context: ExecutionContextDescription,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContextDestroyed {
    pub execution_context_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestPayload {
    pub url: String,
    #[serde(default)]
    pub method: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestWillBeSent {
    pub request_id: String,
    #[serde(default)]
    pub loader_id: String,
    #[serde(default)]
    pub frame_id: Option<String>,
    pub request: RequestPayload,
    #[serde(default)]
    pub redirect_response: Option<Value>,
    #[serde(rename = "type", default)]
    pub resource_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    pub url: String,
    pub status: i64,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub mime_type: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseReceived {
    pub request_id: String,
    #[serde(default)]
    pub loader_id: String,
    #[serde(default)]
    pub frame_id: Option<String>,
    #[serde(rename = "type", default)]
    pub resource_type: Option<String>,
    pub response: ResponsePayload,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadingFinished {
    pub request_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadingFailed {
    pub request_id: String,
    #[serde(default)]
    pub error_text: String,
    #[serde(default)]
    pub canceled: bool,
}

/// Result of `Page.navigate`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigateResult {
    pub frame_id: String,
    #[serde(default)]
    pub loader_id: Option<String>,
    #[serde(default)]
    pub error_text: Option<String>,
}

/// Result of `Target.createTarget`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTargetResult {
    pub target_id: TargetId,
}

/// Every event the core understands, plus a catch-all
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    TargetCreated(TargetInfo),
    TargetInfoChanged(TargetInfo),
    TargetDestroyed(TargetDestroyed),
    AttachedToTarget(AttachedToTarget),
    DetachedFromTarget(DetachedFromTarget),
    TargetCrashed,

    FrameAttached(FrameAttached),
    FrameNavigated(FrameNavigated),
    NavigatedWithinDocument(NavigatedWithinDocument),
    FrameDetached(FrameDetached),
    FrameStartedLoading(FrameIdParams),
    FrameStoppedLoading(FrameIdParams),
    LifecycleEvent(LifecycleEvent),

    ExecutionContextCreated(ExecutionContextCreated),
    ExecutionContextDestroyed(ExecutionContextDestroyed),
    ExecutionContextsCleared,

    RequestWillBeSent(RequestWillBeSent),
    ResponseReceived(ResponseReceived),
    LoadingFinished(LoadingFinished),
    LoadingFailed(LoadingFailed),

    Other { method: String, params: Value },
}

impl ProtocolEvent {
    /// Decode an event by method name
    ///
    /// Unknown methods become `Other`; known methods with malformed params
    /// are an error.
    pub fn decode(method: &str, params: Value) -> serde_json::Result<Self> {
        use serde_json::from_value;

        let event = match method {
            "Target.targetCreated" => {
                Self::TargetCreated(from_value::<TargetInfoEnvelope>(params)?.target_info)
            }
            "Target.targetInfoChanged" => {
                Self::TargetInfoChanged(from_value::<TargetInfoEnvelope>(params)?.target_info)
            }
            "Target.targetDestroyed" => Self::TargetDestroyed(from_value(params)?),
            "Target.attachedToTarget" => Self::AttachedToTarget(from_value(params)?),
            "Target.detachedFromTarget" => Self::DetachedFromTarget(from_value(params)?),
            "Inspector.targetCrashed" => Self::TargetCrashed,

            "Page.frameAttached" => Self::FrameAttached(from_value(params)?),
            "Page.frameNavigated" => Self::FrameNavigated(from_value(params)?),
            "Page.navigatedWithinDocument" => Self::NavigatedWithinDocument(from_value(params)?),
            "Page.frameDetached" => Self::FrameDetached(from_value(params)?),
            "Page.frameStartedLoading" => Self::FrameStartedLoading(from_value(params)?),
            "Page.frameStoppedLoading" => Self::FrameStoppedLoading(from_value(params)?),
            "Page.lifecycleEvent" => Self::LifecycleEvent(from_value(params)?),

            "Runtime.executionContextCreated" => {
                Self::ExecutionContextCreated(from_value(params)?)
            }
            "Runtime.executionContextDestroyed" => {
                Self::ExecutionContextDestroyed(from_value(params)?)
            }
            "Runtime.executionContextsCleared" => Self::ExecutionContextsCleared,

            "Network.requestWillBeSent" => Self::RequestWillBeSent(from_value(params)?),
            "Network.responseReceived" => Self::ResponseReceived(from_value(params)?),
            "Network.loadingFinished" => Self::LoadingFinished(from_value(params)?),
            "Network.loadingFailed" => Self::LoadingFailed(from_value(params)?),

            _ => Self::Other {
                method: method.to_string(),
                params,
            },
        };

        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_discrimination() {
        let response: CDPMessage =
            serde_json::from_value(json!({"id": 4, "result": {}, "sessionId": "S1"})).unwrap();
        assert!(matches!(response, CDPMessage::Response(r) if r.session_id.as_deref() == Some("S1")));

        let event: CDPMessage = serde_json::from_value(
            json!({"method": "Page.loadEventFired", "params": {"timestamp": 1.0}}),
        )
        .unwrap();
        assert!(matches!(event, CDPMessage::Event(e) if e.session_id.is_none()));
    }

    #[test]
    fn test_request_omits_root_session() {
        let request = CDPRequest {
            id: 1,
            method: "Browser.getVersion".to_string(),
            params: json!({}),
            session_id: None,
        };
        let wire = serde_json::to_value(&request).unwrap();
        assert!(wire.get("sessionId").is_none());
    }

    #[test]
    fn test_decode_attached_to_target() {
        let event = ProtocolEvent::decode(
            "Target.attachedToTarget",
            json!({
                "sessionId": "S1",
                "targetInfo": {
                    "targetId": "T1", "type": "page", "title": "", "url": "about:blank",
                    "attached": true, "openerId": "T0", "browserContextId": "C1"
                },
                "waitingForDebugger": true
            }),
        )
        .unwrap();

        match event {
            ProtocolEvent::AttachedToTarget(attached) => {
                assert_eq!(attached.session_id, "S1");
                assert_eq!(attached.target_info.opener_id.as_deref(), Some("T0"));
                assert!(attached.waiting_for_debugger);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_decode_context_aux_data() {
        let event = ProtocolEvent::decode(
            "Runtime.executionContextCreated",
            json!({"context": {
                "id": 3, "origin": "http://x", "name": "",
                "auxData": {"isDefault": true, "type": "default", "frameId": "F1"}
            }}),
        )
        .unwrap();

        let ProtocolEvent::ExecutionContextCreated(created) = event else {
            panic!("wrong variant");
        };
        assert!(created.context.aux_data.is_default);
        assert_eq!(created.context.aux_data.frame_id.as_deref(), Some("F1"));
    }

    #[test]
    fn test_decode_unknown_and_malformed() {
        let event = ProtocolEvent::decode("Log.entryAdded", json!({"entry": {}})).unwrap();
        assert!(matches!(event, ProtocolEvent::Other { ref method, .. } if method == "Log.entryAdded"));

        assert!(ProtocolEvent::decode("Page.frameAttached", json!({"frameId": 1})).is_err());
    }

    #[test]
    fn test_frame_url_with_fragment() {
        let frame: FramePayload = serde_json::from_value(json!({
            "id": "F", "loaderId": "L", "url": "http://x/", "urlFragment": "#top"
        }))
        .unwrap();
        assert_eq!(frame.full_url(), "http://x/#top");
    }
}
