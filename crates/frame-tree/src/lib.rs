//! Frame Tree - per-page frame and execution-context bookkeeping
//!
//! Pure, synchronous state machine fed by the page session's events.
//! No I/O, no async, no locks: the owner serializes access.
//!
//! ## Core Design
//!
//! ```text
//! CDP event → FrameArena mutation → Vec<FrameChange> → owner fans out
//!                  ↓
//!             FrameKey (u32), stable across main-frame re-keying
//! ```
//!
//! Invariants the arena maintains:
//! - at most one frame without a parent (the main frame)
//! - detaching a frame removes its whole subtree and its contexts
//! - a loader id change discards the old document's subframes

pub mod arena;
pub mod error;
pub mod types;

pub use arena::FrameArena;
pub use error::{FrameError, Result};
pub use types::*;
