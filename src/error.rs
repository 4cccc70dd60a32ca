use crate::parser::ParseError;
use crate::runner::RunError;

/// Error type for nvsmi-metrics control operations.
///
/// Poll failures never show up here: they are delivered to subscribers as
/// [`PollError`](crate::metrics::PollError) values. This type covers misuse of
/// the control interface and the rare case of the polling task being gone.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("polling interval {0}s is outside the supported 1-60s range")]
    InvalidInterval(u64),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("polling task is gone: {0}")]
    ChannelClosed(String),
}

impl Error {
    pub(crate) fn channel_closed<S: Into<String>>(msg: S) -> Self {
        Error::ChannelClosed(msg.into())
    }
}

/// Result type for nvsmi-metrics operations
pub type Result<T> = std::result::Result<T, Error>;
