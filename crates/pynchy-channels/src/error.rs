use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Not connected")]
    NotConnected,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}
