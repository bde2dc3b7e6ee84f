//! File-based IPC between host and containers: atomic wire format, typed
//! handler registry (exact types + prefix families), the filesystem
//! watcher that feeds it, and the approval-decision processor.

pub mod decisions;
pub mod deps;
pub mod handlers;
pub mod protocol;
pub mod registry;
pub mod watcher;
pub mod write;

pub use deps::{Broadcaster, ContainerControl, IpcDeps, ServiceRouter, WorktreeOps};
pub use registry::{Handler, HandlerRegistry};
pub use watcher::IpcWatcher;
