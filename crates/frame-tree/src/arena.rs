//! Arena-based frame tree storage
//!
//! "Bad programmers worry about the code. Good programmers worry about
//! data structures and their relationships."
//!
//! Frames live in one map keyed by a stable `FrameKey`. Parent and child
//! links are keys, so tearing down a subtree is "remove from the map", not
//! pointer surgery. A second map translates protocol frame ids to keys,
//! the same way the DOM arena translated backend node ids.
//!
//! ```text
//! frameAttached / frameNavigated / frameDetached / contexts
//!                        ↓
//!                   FrameArena  →  Vec<FrameChange>
//! ```

use ahash::AHashMap;
use tracing::warn;

use crate::error::{FrameError, Result};
use crate::types::{
    lifecycle, ContextDescription, ContextKey, ContextRecord, FrameChange, FrameKey, FrameNode,
    NavigatedFrame, World,
};

/// Buffered contexts whose frame never shows up are capped at this many
const MAX_PENDING_CONTEXTS: usize = 256;

/// Frame tree and execution-context bookkeeping for one page
#[derive(Debug)]
pub struct FrameArena {
    nodes: AHashMap<FrameKey, FrameNode>,

    /// Protocol frame id → FrameKey
    id_map: AHashMap<String, FrameKey>,

    next_key: FrameKey,

    main_key: Option<FrameKey>,

    contexts: AHashMap<ContextKey, ContextRecord>,

    /// Contexts reported before their frame was attached
    pending_contexts: Vec<ContextDescription>,
}

impl FrameArena {
    pub fn new() -> Self {
        Self {
            nodes: AHashMap::with_capacity(16),
            id_map: AHashMap::with_capacity(16),
            next_key: 0,
            main_key: None,
            contexts: AHashMap::with_capacity(16),
            pending_contexts: Vec::new(),
        }
    }

    fn alloc(&mut self, frame_id: &str, parent: Option<FrameKey>) -> FrameKey {
        let key = self.next_key;
        self.next_key += 1;

        self.id_map.insert(frame_id.to_string(), key);
        self.nodes
            .insert(key, FrameNode::new(key, frame_id.to_string(), parent));

        if let Some(parent_key) = parent {
            if let Some(parent_node) = self.nodes.get_mut(&parent_key) {
                parent_node.children.push(key);
            }
        }

        key
    }

    /// Synthesize the main frame when a page session is created
    ///
    /// No-op once a main frame exists.
    pub fn ensure_main_frame(&mut self, frame_id: &str, url: &str) -> Vec<FrameChange> {
        let mut changes = Vec::new();
        if self.main_key.is_some() {
            return changes;
        }

        let key = self.alloc(frame_id, None);
        if let Some(node) = self.nodes.get_mut(&key) {
            node.url = url.to_string();
        }
        self.main_key = Some(key);

        changes.push(FrameChange::Attached {
            key,
            frame_id: frame_id.to_string(),
        });
        self.flush_pending_contexts(frame_id, key, &mut changes);
        changes
    }

    /// `Page.frameAttached`: duplicate delivery is a no-op
    pub fn attach(&mut self, frame_id: &str, parent_id: &str) -> Result<Vec<FrameChange>> {
        let mut changes = Vec::new();
        if self.id_map.contains_key(frame_id) {
            return Ok(changes);
        }

        let parent = *self
            .id_map
            .get(parent_id)
            .ok_or_else(|| FrameError::ParentNotFound {
                frame_id: frame_id.to_string(),
                parent_id: parent_id.to_string(),
            })?;

        let key = self.alloc(frame_id, Some(parent));
        changes.push(FrameChange::Attached {
            key,
            frame_id: frame_id.to_string(),
        });
        self.flush_pending_contexts(frame_id, key, &mut changes);
        Ok(changes)
    }

    /// `Page.frameNavigated`
    ///
    /// A changed loader id discards the previous document's subframes and
    /// contexts. An unchanged loader id is a same-document update.
    pub fn navigate(&mut self, frame: NavigatedFrame) -> Result<Vec<FrameChange>> {
        let mut changes = Vec::new();

        let key = match frame.parent_id.as_deref() {
            None => self.resolve_main_frame(&frame.id, &mut changes),
            Some(parent_id) => match self.id_map.get(&frame.id).copied() {
                Some(key) => key,
                None => {
                    changes.extend(self.attach(&frame.id, parent_id)?);
                    *self
                        .id_map
                        .get(&frame.id)
                        .ok_or_else(|| FrameError::FrameNotFound(frame.id.clone()))?
                }
            },
        };

        let previous = self.nodes.get(&key).and_then(|n| n.loader_id.clone());
        let new_document = previous.as_deref() != Some(frame.loader_id.as_str());

        // Children and contexts may precede the first document too
        if new_document {
            let children: Vec<FrameKey> = self
                .nodes
                .get(&key)
                .map(|n| n.children.to_vec())
                .unwrap_or_default();
            for child in children {
                self.remove_subtree(child, &mut changes);
            }
            self.invalidate_frame_contexts(key, &mut changes);
        }

        let node = self
            .nodes
            .get_mut(&key)
            .ok_or_else(|| FrameError::FrameNotFound(frame.id.clone()))?;
        node.url = frame.url;
        if let Some(name) = frame.name {
            node.name = name;
        }
        node.loader_id = Some(frame.loader_id);

        changes.push(FrameChange::Navigated { key, new_document });
        Ok(changes)
    }

    fn resolve_main_frame(&mut self, frame_id: &str, changes: &mut Vec<FrameChange>) -> FrameKey {
        let Some(main) = self.main_key else {
            let key = self.alloc(frame_id, None);
            self.main_key = Some(key);
            changes.push(FrameChange::Attached {
                key,
                frame_id: frame_id.to_string(),
            });
            self.flush_pending_contexts(frame_id, key, changes);
            return key;
        };

        let current_id = match self.nodes.get(&main) {
            Some(node) => node.id.clone(),
            None => return main,
        };
        if current_id == frame_id {
            return main;
        }

        // Cross-process swap: same frame, new protocol id
        if let Some(&stale) = self.id_map.get(frame_id) {
            if stale != main {
                self.remove_subtree(stale, changes);
            }
        }
        self.id_map.remove(&current_id);
        self.id_map.insert(frame_id.to_string(), main);
        if let Some(node) = self.nodes.get_mut(&main) {
            node.id = frame_id.to_string();
        }
        self.flush_pending_contexts(frame_id, main, changes);
        main
    }

    /// `Page.navigatedWithinDocument`
    pub fn navigate_within_document(
        &mut self,
        frame_id: &str,
        url: &str,
    ) -> Result<Vec<FrameChange>> {
        let key = self.require(frame_id)?;
        if let Some(node) = self.nodes.get_mut(&key) {
            node.url = url.to_string();
        }
        Ok(vec![FrameChange::NavigatedWithinDocument { key }])
    }

    /// `Page.frameDetached`: removes the frame and all descendants
    ///
    /// Unknown frames are ignored; the main frame is never removed here.
    pub fn detach(&mut self, frame_id: &str) -> Result<Vec<FrameChange>> {
        let mut changes = Vec::new();
        let Some(&key) = self.id_map.get(frame_id) else {
            return Ok(changes);
        };
        if Some(key) == self.main_key {
            return Err(FrameError::MainFrameDetach(frame_id.to_string()));
        }

        self.remove_subtree(key, &mut changes);
        Ok(changes)
    }

    /// Remove a subtree, deepest frames first
    fn remove_subtree(&mut self, root: FrameKey, changes: &mut Vec<FrameChange>) {
        let order = self.descendants_inclusive(root);

        if let Some(parent) = self.nodes.get(&root).and_then(|n| n.parent) {
            if let Some(parent_node) = self.nodes.get_mut(&parent) {
                parent_node.children.retain(|c| *c != root);
            }
        }

        for key in order.into_iter().rev() {
            self.invalidate_frame_contexts(key, changes);
            if let Some(node) = self.nodes.remove(&key) {
                self.id_map.remove(&node.id);
                self.pending_contexts.retain(|p| p.frame_id != node.id);
                if self.main_key == Some(key) {
                    self.main_key = None;
                }
                changes.push(FrameChange::Detached {
                    key,
                    frame_id: node.id,
                });
            }
        }
    }

    fn invalidate_frame_contexts(&mut self, key: FrameKey, changes: &mut Vec<FrameChange>) {
        let Some(node) = self.nodes.get_mut(&key) else {
            return;
        };

        for world in [World::Main, World::Isolated] {
            if let Some(context) = node.context_slot(world).take() {
                self.contexts.remove(&context);
                changes.push(FrameChange::ContextDestroyed {
                    key,
                    world,
                    context,
                });
            }
        }
    }

    /// `Page.lifecycleEvent`
    ///
    /// Events are recorded against the loader they name. Events for a newer
    /// loader may arrive before its `frameNavigated`; late events for an
    /// older document are dropped.
    pub fn lifecycle_event(
        &mut self,
        frame_id: &str,
        loader_id: &str,
        name: &str,
    ) -> Result<Vec<FrameChange>> {
        let key = self.require(frame_id)?;
        let node = self
            .nodes
            .get_mut(&key)
            .ok_or_else(|| FrameError::FrameNotFound(frame_id.to_string()))?;

        let recorded_is_current = node.lifecycle_loader.is_some()
            && node.lifecycle_loader == node.loader_id;

        if node.lifecycle_loader.as_deref() != Some(loader_id) {
            if name != lifecycle::INIT && recorded_is_current {
                return Ok(Vec::new());
            }
            node.lifecycle_loader = Some(loader_id.to_string());
            node.lifecycle.clear();
        }
        node.lifecycle.insert(name.to_string());

        Ok(vec![FrameChange::Lifecycle {
            key,
            name: name.to_string(),
        }])
    }

    /// `Page.frameStoppedLoading`: the current document reached load
    pub fn loading_stopped(&mut self, frame_id: &str) -> Result<Vec<FrameChange>> {
        let key = self.require(frame_id)?;
        let node = self
            .nodes
            .get_mut(&key)
            .ok_or_else(|| FrameError::FrameNotFound(frame_id.to_string()))?;

        if let Some(loader) = node.loader_id.clone() {
            if node.lifecycle_loader.as_ref() != Some(&loader) {
                node.lifecycle_loader = Some(loader);
                node.lifecycle.clear();
            }
            node.lifecycle
                .insert(lifecycle::DOM_CONTENT_LOADED.to_string());
            node.lifecycle.insert(lifecycle::LOAD.to_string());
        }

        Ok(vec![FrameChange::LoadingStopped { key }])
    }

    /// `Runtime.executionContextCreated`
    ///
    /// Buffered until the owning frame is attached or navigated.
    pub fn context_created(&mut self, description: ContextDescription) -> Vec<FrameChange> {
        let mut changes = Vec::new();
        match self.id_map.get(&description.frame_id) {
            Some(&key) => self.install_context(key, description, &mut changes),
            None => {
                if self.pending_contexts.len() >= MAX_PENDING_CONTEXTS {
                    let dropped = self.pending_contexts.remove(0);
                    warn!(
                        "[FrameArena] Dropping buffered context {} for unknown frame {}",
                        dropped.key.id, dropped.frame_id
                    );
                }
                self.pending_contexts.push(description);
            }
        }
        changes
    }

    fn install_context(
        &mut self,
        key: FrameKey,
        description: ContextDescription,
        changes: &mut Vec<FrameChange>,
    ) {
        let Some(node) = self.nodes.get_mut(&key) else {
            return;
        };

        let world = description.world;
        if let Some(previous) = node.context_slot(world).replace(description.key.clone()) {
            self.contexts.remove(&previous);
            changes.push(FrameChange::ContextDestroyed {
                key,
                world,
                context: previous,
            });
        }

        self.contexts.insert(
            description.key.clone(),
            ContextRecord {
                key: description.key.clone(),
                frame: key,
                world,
                name: description.name,
                origin: description.origin,
            },
        );
        changes.push(FrameChange::ContextCreated {
            key,
            world,
            context: description.key,
        });
    }

    fn flush_pending_contexts(
        &mut self,
        frame_id: &str,
        key: FrameKey,
        changes: &mut Vec<FrameChange>,
    ) {
        if !self.pending_contexts.iter().any(|p| p.frame_id == frame_id) {
            return;
        }
        let (ready, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_contexts)
            .into_iter()
            .partition(|p| p.frame_id == frame_id);
        self.pending_contexts = rest;

        for description in ready {
            self.install_context(key, description, changes);
        }
    }

    /// `Runtime.executionContextDestroyed`
    pub fn context_destroyed(&mut self, context: &ContextKey) -> Vec<FrameChange> {
        let mut changes = Vec::new();
        self.pending_contexts.retain(|p| &p.key != context);

        if let Some(record) = self.contexts.remove(context) {
            if let Some(node) = self.nodes.get_mut(&record.frame) {
                let slot = node.context_slot(record.world);
                if slot.as_ref() == Some(context) {
                    *slot = None;
                }
            }
            changes.push(FrameChange::ContextDestroyed {
                key: record.frame,
                world: record.world,
                context: record.key,
            });
        }
        changes
    }

    /// `Runtime.executionContextsCleared`: every context of one session
    pub fn contexts_cleared(&mut self, session_id: &str) -> Vec<FrameChange> {
        self.pending_contexts
            .retain(|p| p.key.session_id != session_id);

        let doomed: Vec<ContextKey> = self
            .contexts
            .keys()
            .filter(|k| k.session_id == session_id)
            .cloned()
            .collect();

        doomed
            .iter()
            .flat_map(|context| self.context_destroyed(context))
            .collect()
    }

    fn require(&self, frame_id: &str) -> Result<FrameKey> {
        self.id_map
            .get(frame_id)
            .copied()
            .ok_or_else(|| FrameError::FrameNotFound(frame_id.to_string()))
    }

    /// Get frame by key
    pub fn get(&self, key: FrameKey) -> Option<&FrameNode> {
        self.nodes.get(&key)
    }

    /// Get frame by protocol id
    pub fn get_by_id(&self, frame_id: &str) -> Option<&FrameNode> {
        self.id_map.get(frame_id).and_then(|k| self.nodes.get(k))
    }

    pub fn key_of(&self, frame_id: &str) -> Option<FrameKey> {
        self.id_map.get(frame_id).copied()
    }

    pub fn contains(&self, key: FrameKey) -> bool {
        self.nodes.contains_key(&key)
    }

    pub fn main_key(&self) -> Option<FrameKey> {
        self.main_key
    }

    pub fn main_frame(&self) -> Option<&FrameNode> {
        self.main_key.and_then(|k| self.nodes.get(&k))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn pending_context_count(&self) -> usize {
        self.pending_contexts.len()
    }

    /// Frames in depth-first order, main frame first
    pub fn frames(&self) -> Vec<&FrameNode> {
        let Some(main) = self.main_key else {
            return Vec::new();
        };
        self.descendants_inclusive(main)
            .into_iter()
            .filter_map(|k| self.nodes.get(&k))
            .collect()
    }

    pub fn children(&self, key: FrameKey) -> Vec<&FrameNode> {
        self.nodes
            .get(&key)
            .map(|n| n.children.iter().filter_map(|c| self.nodes.get(c)).collect())
            .unwrap_or_default()
    }

    /// Keys of `root` and everything below it, depth-first pre-order
    ///
    /// Iterative, no recursion.
    pub fn descendants_inclusive(&self, root: FrameKey) -> Vec<FrameKey> {
        let mut order = Vec::new();
        let mut stack = vec![root];

        while let Some(key) = stack.pop() {
            let Some(node) = self.nodes.get(&key) else {
                continue;
            };
            order.push(key);
            for &child in node.children.iter().rev() {
                stack.push(child);
            }
        }

        order
    }

    pub fn context(&self, context: &ContextKey) -> Option<&ContextRecord> {
        self.contexts.get(context)
    }

    pub fn is_context_alive(&self, context: &ContextKey) -> bool {
        self.contexts.contains_key(context)
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// True when `expected` lifecycle events were reached by the frame's
    /// current document (and, optionally, by every descendant's)
    pub fn lifecycle_satisfied(
        &self,
        key: FrameKey,
        expected: &[&str],
        include_descendants: bool,
    ) -> bool {
        let frames = if include_descendants {
            self.descendants_inclusive(key)
        } else {
            vec![key]
        };
        if frames.is_empty() {
            return false;
        }

        frames.iter().all(|k| {
            self.nodes
                .get(k)
                .map(|n| n.has_lifecycle(expected))
                .unwrap_or(false)
        })
    }
}

impl Default for FrameArena {
    fn default() -> Self {
        Self::new()
    }
}
