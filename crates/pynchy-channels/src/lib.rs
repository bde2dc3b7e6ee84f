//! Multi-channel fan-out: the `Channel` adapter interface, ledger-backed
//! broadcast, stream finalization, message formatting, and the periodic
//! reconciler that catches up inbound history and retries outbound
//! deliveries.

pub mod broadcast;
pub mod channel;
pub mod error;
pub mod format;
pub mod reconciler;
pub mod streaming;

pub use broadcast::ChannelFanout;
pub use channel::{Channel, FetchResult};
pub use error::ChannelError;
pub use reconciler::Reconciler;
pub use streaming::{StreamManager, TraceBatcher};
