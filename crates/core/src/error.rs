use std::fmt;

/// The error kinds named in §7, shared across every control-plane and
/// matchmaking module in this crate. Library code here never reaches for a
/// derive-error crate, matching `retun_proto::Error` and the teacher's
/// `codec::Error` / `ports::PortRangeParseError`: a flat enum with a manual
/// `Display`.
#[derive(Debug)]
pub enum Error {
    ConfigInvalid(String),
    TransportDial(String),
    AuthRejected(String),
    ProtocolViolation(String),
    MessageTooLarge,
    UnknownMessage,
    PortUnavailable(String),
    DomainConflict(String),
    PoolExhausted,
    PluginReject(String),
    PluginSendFail,
    PeerClosed,
    Timeout,
    Canceled,
    Internal(String),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigInvalid(m) => write!(f, "invalid configuration: {m}"),
            Self::TransportDial(m) => write!(f, "transport dial failed: {m}"),
            Self::AuthRejected(m) => write!(f, "authentication rejected: {m}"),
            Self::ProtocolViolation(m) => write!(f, "protocol violation: {m}"),
            Self::MessageTooLarge => write!(f, "message too large"),
            Self::UnknownMessage => write!(f, "unknown message"),
            Self::PortUnavailable(m) => write!(f, "port unavailable: {m}"),
            Self::DomainConflict(m) => write!(f, "domain conflict: {m}"),
            Self::PoolExhausted => write!(f, "work-conn pool exhausted"),
            Self::PluginReject(m) => write!(f, "rejected by plugin: {m}"),
            Self::PluginSendFail => write!(f, "plugin dispatch failed"),
            Self::PeerClosed => write!(f, "peer closed the connection"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::Canceled => write!(f, "operation canceled"),
            Self::Internal(m) => write!(f, "internal error: {m}"),
        }
    }
}

impl From<retun_proto::Error> for Error {
    fn from(value: retun_proto::Error) -> Self {
        match value {
            retun_proto::Error::MessageTooLarge { .. } => Self::MessageTooLarge,
            retun_proto::Error::UnknownMessage(_) => Self::UnknownMessage,
            other => Self::ProtocolViolation(other.to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
