//! Chrome DevTools Protocol client core
//!
//! One WebSocket, many sessions. On top of the wire layer sit a target
//! registry and, per page, a frame manager that mirrors the frame tree and
//! its execution contexts and answers "has this navigation finished?".
//!
//! # Layers
//!
//! 1. **cdp**: transport, connection, sessions. Ordered, non-suspending dispatch.
//! 2. **target**: which targets exist, with `about:blank` noise filtered out
//! 3. **page**: frames, execution contexts, lifecycle waits, network tracking
//! 4. **browser**: the handle users hold

pub mod browser;
pub mod cdp;
pub mod config;
pub mod error;
pub mod events;
pub mod page;
pub mod target;

#[cfg(test)]
pub(crate) mod testing;

pub use browser::{Browser, BrowserVersion};
pub use cdp::{CDPConnection, CDPSession, ConnectionEvent, SessionEvent, Transport, WebSocketTransport};
pub use config::{BrowserConfig, NetworkIdleConfig};
pub use error::{CDPError, Result};
pub use events::{EventBus, EventEmitter, Subscription};
pub use page::{
    ExecutionContext, Frame, FrameEvent, FrameManager, NavigationOptions, NavigationResult, Page,
    WaitUntil,
};
pub use target::{Target, TargetEvent, TargetKind, TargetRegistry};

pub use frame_tree::World;
