//! Network Manager - in-flight request accounting for one page
//!
//! Only what lifecycle waiting needs: how many requests are outstanding,
//! and which response delivered each document.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Instant;
use tokio::sync::watch;
use tracing::debug;

use crate::cdp::protocol::ProtocolEvent;

/// Document responses remembered per page
const MAX_DOCUMENT_RESPONSES: usize = 16;

/// Tracks a single network request
#[derive(Clone, Debug)]
struct RequestTracker {
    start_time: Instant,
    url: String,
    method: String,
    redirects: usize,
}

/// Response that delivered a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentResponse {
    pub url: String,
    pub status: i64,
    pub status_text: String,
    pub mime_type: String,
}

impl DocumentResponse {
    pub fn ok(&self) -> bool {
        self.status == 0 || (200..300).contains(&self.status)
    }
}

pub struct NetworkManager {
    /// Active network requests by request id
    active_requests: Mutex<HashMap<String, RequestTracker>>,

    inflight: watch::Sender<usize>,

    documents: Mutex<VecDeque<(String, DocumentResponse)>>,
}

impl NetworkManager {
    pub fn new() -> Self {
        let (inflight, _) = watch::channel(0);
        Self {
            active_requests: Mutex::new(HashMap::new()),
            inflight,
            documents: Mutex::new(VecDeque::new()),
        }
    }

    /// Feed one protocol event; anything not network-related is ignored
    pub fn handle_event(&self, event: &ProtocolEvent) {
        match event {
            ProtocolEvent::RequestWillBeSent(sent) => {
                let mut requests = self.active_requests.lock();
                match requests.get_mut(&sent.request_id) {
                    // Redirects reuse the request id
                    Some(tracker) if sent.redirect_response.is_some() => {
                        tracker.url = sent.request.url.clone();
                        tracker.redirects += 1;
                    }
                    _ => {
                        requests.insert(
                            sent.request_id.clone(),
                            RequestTracker {
                                start_time: Instant::now(),
                                url: sent.request.url.clone(),
                                method: sent.request.method.clone(),
                                redirects: 0,
                            },
                        );
                    }
                }
                let count = requests.len();
                drop(requests);
                self.publish(count);
            }

            ProtocolEvent::ResponseReceived(received) => {
                if received.resource_type.as_deref() == Some("Document")
                    && !received.loader_id.is_empty()
                {
                    let mut documents = self.documents.lock();
                    documents.retain(|(loader, _)| loader != &received.loader_id);
                    if documents.len() >= MAX_DOCUMENT_RESPONSES {
                        documents.pop_front();
                    }
                    documents.push_back((
                        received.loader_id.clone(),
                        DocumentResponse {
                            url: received.response.url.clone(),
                            status: received.response.status,
                            status_text: received.response.status_text.clone(),
                            mime_type: received.response.mime_type.clone(),
                        },
                    ));
                }
            }

            ProtocolEvent::LoadingFinished(finished) => {
                self.untrack_request(&finished.request_id, None);
            }

            ProtocolEvent::LoadingFailed(failed) => {
                self.untrack_request(&failed.request_id, Some(&failed.error_text));
            }

            _ => {}
        }
    }

    /// Remove request from tracking
    fn untrack_request(&self, request_id: &str, error: Option<&str>) {
        let mut requests = self.active_requests.lock();
        if let Some(tracker) = requests.remove(request_id) {
            let elapsed = Instant::now().duration_since(tracker.start_time);
            match error {
                Some(error) => debug!(
                    "[NetworkManager] {} {} failed after {:?}: {}",
                    tracker.method, tracker.url, elapsed, error
                ),
                None => debug!(
                    "[NetworkManager] {} {} completed in {:?} ({} redirect(s))",
                    tracker.method, tracker.url, elapsed, tracker.redirects
                ),
            }
        }
        let count = requests.len();
        drop(requests);
        self.publish(count);
    }

    fn publish(&self, count: usize) {
        self.inflight.send_if_modified(|current| {
            let changed = *current != count;
            *current = count;
            changed
        });
    }

    pub fn inflight_count(&self) -> usize {
        *self.inflight.borrow()
    }

    /// Watch the in-flight count
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.inflight.subscribe()
    }

    /// Response that delivered the document for `loader_id`
    pub fn document_response(&self, loader_id: &str) -> Option<DocumentResponse> {
        self.documents
            .lock()
            .iter()
            .find(|(loader, _)| loader == loader_id)
            .map(|(_, response)| response.clone())
    }

    /// Forget everything (page session gone)
    pub fn clear(&self) {
        self.active_requests.lock().clear();
        self.documents.lock().clear();
        self.publish(0);
    }
}

impl Default for NetworkManager {
    fn default() -> Self {
        Self::new()
    }
}
