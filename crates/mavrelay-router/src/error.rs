use std::os::fd::RawFd;

/// Errors surfaced by the event loop and its registries.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// The readiness-multiplexing context could not be created.
    #[error("failed to create poller: {0}")]
    PollerCreate(std::io::Error),

    /// A descriptor could not be added to or changed in the poller.
    #[error("failed to register fd {fd}: {source}")]
    Register { fd: RawFd, source: std::io::Error },

    /// Every timeout slot is in use.
    #[error("timeout capacity exceeded ({capacity} slots)")]
    CapacityExceeded { capacity: usize },

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] mavrelay_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] mavrelay_frame::FrameError),

    /// An I/O error occurred while waiting for events.
    #[error("router I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RouterError>;

/// Why an endpoint stopped being usable.
///
/// Never returned from the loop itself: a dead endpoint is evicted at the
/// end of the pass in which it died.
#[derive(Debug, thiserror::Error)]
pub enum DeadReason {
    /// The remote side closed the stream.
    #[error("closed by peer")]
    Closed,

    /// The poller reported a hangup or error condition.
    #[error("hangup")]
    Hangup,

    /// A read or write failed with a non-retryable error.
    #[error("I/O error: {0}")]
    Io(std::io::Error),
}
