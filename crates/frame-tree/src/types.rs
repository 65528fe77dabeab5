//! Core type definitions for a page's frame tree
//!
//! Key design principles:
//! 1. Frames are addressed by a stable arena key (u32), not by protocol id
//! 2. Parent/child links are keys, never owning pointers
//! 3. SmallVec for child lists (most frames have a handful of children)

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::BTreeSet;

/// Stable frame handle (key into the arena)
///
/// Survives re-keying of the main frame's protocol id.
pub type FrameKey = u32;

/// Frame identifier from CDP
pub type FrameId = String;

/// Loader identifier from CDP, one per document load
pub type LoaderId = String;

/// Session identifier from CDP
pub type SessionId = String;

/// Execution context identifier from CDP (unique per session only)
pub type ExecutionContextId = i64;

/// Lifecycle event names as reported by `Page.lifecycleEvent`
pub mod lifecycle {
    pub const INIT: &str = "init";
    pub const DOM_CONTENT_LOADED: &str = "DOMContentLoaded";
    pub const LOAD: &str = "load";
}

/// Script world of an execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum World {
    /// The page's own default world
    Main,
    /// Instrumentation world, invisible to page scripts
    Isolated,
}

/// Execution contexts are only unique within the session that created them
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextKey {
    pub session_id: SessionId,
    pub id: ExecutionContextId,
}

impl ContextKey {
    pub fn new(session_id: impl Into<SessionId>, id: ExecutionContextId) -> Self {
        Self {
            session_id: session_id.into(),
            id,
        }
    }
}

/// A live execution context bound to a frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRecord {
    pub key: ContextKey,
    pub frame: FrameKey,
    pub world: World,
    pub name: String,
    pub origin: String,
}

/// Input for `FrameArena::context_created`
#[derive(Debug, Clone, PartialEq)]
pub struct ContextDescription {
    pub key: ContextKey,
    pub frame_id: FrameId,
    pub world: World,
    pub name: String,
    pub origin: String,
}

/// Input for `FrameArena::navigate`, mirrors CDP's `Page.Frame`
#[derive(Debug, Clone, PartialEq)]
pub struct NavigatedFrame {
    pub id: FrameId,
    pub parent_id: Option<FrameId>,
    pub url: String,
    pub loader_id: LoaderId,
    pub name: Option<String>,
}

/// One frame of the tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameNode {
    pub key: FrameKey,
    pub id: FrameId,
    pub parent: Option<FrameKey>,
    /// Attach order, not DOM order
    pub children: SmallVec<[FrameKey; 4]>,
    pub url: String,
    pub name: String,
    pub loader_id: Option<LoaderId>,
    /// Loader the `lifecycle` set was recorded for
    pub lifecycle_loader: Option<LoaderId>,
    pub lifecycle: BTreeSet<String>,
    pub main_world: Option<ContextKey>,
    pub isolated_world: Option<ContextKey>,
}

impl FrameNode {
    pub fn new(key: FrameKey, id: FrameId, parent: Option<FrameKey>) -> Self {
        Self {
            key,
            id,
            parent,
            children: SmallVec::new(),
            url: String::new(),
            name: String::new(),
            loader_id: None,
            lifecycle_loader: None,
            lifecycle: BTreeSet::new(),
            main_world: None,
            isolated_world: None,
        }
    }

    pub fn is_main_frame(&self) -> bool {
        self.parent.is_none()
    }

    pub fn context(&self, world: World) -> Option<&ContextKey> {
        match world {
            World::Main => self.main_world.as_ref(),
            World::Isolated => self.isolated_world.as_ref(),
        }
    }

    pub(crate) fn context_slot(&mut self, world: World) -> &mut Option<ContextKey> {
        match world {
            World::Main => &mut self.main_world,
            World::Isolated => &mut self.isolated_world,
        }
    }

    /// True if every name in `expected` was reported for the current document
    pub fn has_lifecycle(&self, expected: &[&str]) -> bool {
        match (&self.loader_id, &self.lifecycle_loader) {
            (Some(current), Some(recorded)) if current == recorded => {
                expected.iter().all(|name| self.lifecycle.contains(*name))
            }
            _ => false,
        }
    }
}

/// What a single arena mutation did
///
/// The arena never notifies anyone itself; callers fan these out after
/// releasing whatever lock guards the arena.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameChange {
    Attached {
        key: FrameKey,
        frame_id: FrameId,
    },
    Navigated {
        key: FrameKey,
        /// Loader id changed (cross-document navigation)
        new_document: bool,
    },
    NavigatedWithinDocument {
        key: FrameKey,
    },
    Detached {
        key: FrameKey,
        frame_id: FrameId,
    },
    Lifecycle {
        key: FrameKey,
        name: String,
    },
    LoadingStopped {
        key: FrameKey,
    },
    ContextCreated {
        key: FrameKey,
        world: World,
        context: ContextKey,
    },
    ContextDestroyed {
        key: FrameKey,
        world: World,
        context: ContextKey,
    },
}

impl FrameChange {
    /// Frame the change applies to
    pub fn frame_key(&self) -> FrameKey {
        match self {
            FrameChange::Attached { key, .. }
            | FrameChange::Navigated { key, .. }
            | FrameChange::NavigatedWithinDocument { key }
            | FrameChange::Detached { key, .. }
            | FrameChange::Lifecycle { key, .. }
            | FrameChange::LoadingStopped { key }
            | FrameChange::ContextCreated { key, .. }
            | FrameChange::ContextDestroyed { key, .. } => *key,
        }
    }
}
