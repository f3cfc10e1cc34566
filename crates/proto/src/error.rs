use std::fmt;

/// Errors raised while framing or parsing control messages.
///
/// Mirrors the manual `Display`/`std::error::Error` style used throughout
/// the wire codecs this crate is modeled on: a flat enum, no derive macro.
#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Json(serde_json::Error),
    /// The declared payload length exceeded the configured cap.
    MessageTooLarge { len: u64, max: u64 },
    /// The one-byte type tag did not match any known message type.
    UnknownMessage(u8),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Json(e) => write!(f, "malformed message payload: {e}"),
            Self::MessageTooLarge { len, max } => {
                write!(f, "message too large: {len} bytes (max {max})")
            }
            Self::UnknownMessage(tag) => write!(f, "unknown message type: 0x{tag:02x}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}
