//! Error types for frame tree operations
//!
//! Simple, flat error hierarchy. No over-engineering.

use thiserror::Error;

use crate::types::FrameId;

pub type Result<T> = std::result::Result<T, FrameError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("Frame not found: {0}")]
    FrameNotFound(FrameId),

    #[error("Parent frame {parent_id} of frame {frame_id} is not attached")]
    ParentNotFound { frame_id: FrameId, parent_id: FrameId },

    #[error("Main frame {0} cannot be detached")]
    MainFrameDetach(FrameId),
}
