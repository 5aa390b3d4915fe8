/// Errors that can occur during frame detection, validation or encoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame checksum does not match its contents.
    #[error("checksum mismatch on msgid {msgid} (expected {expected:#06x}, got {actual:#06x})")]
    ChecksumMismatch { msgid: u32, expected: u16, actual: u16 },

    /// No definition is known for this message id.
    #[error("unknown message id {0}")]
    UnknownMessage(u32),

    /// A MAVLink 2 frame announces incompatibility flags this codec cannot honour.
    #[error("unsupported incompatibility flags {0:#04x}")]
    UnsupportedIncompatFlags(u8),

    /// The message id does not fit the wire version.
    #[error("message id {msgid} does not fit a {version} frame")]
    MessageIdOutOfRange { msgid: u32, version: &'static str },

    /// The payload exceeds what a single frame can carry.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A message definition is inconsistent.
    #[error("invalid definition for message id {id}: {reason}")]
    InvalidDefinition { id: u32, reason: String },

    /// A dialect file could not be parsed.
    #[error("invalid dialect file: {0}")]
    Dialect(#[from] serde_json::Error),

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream ended before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

impl FrameError {
    /// Whether this error describes a single corrupt frame that the stream can
    /// resynchronize past.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FrameError::ChecksumMismatch { .. }
                | FrameError::UnknownMessage(_)
                | FrameError::UnsupportedIncompatFlags(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
