//! ## Framed control-message codec
//!
//! The wire protocol shared by the reverse-tunnel fabric's client and
//! server: one control message is a one-byte type tag, an eight-byte
//! big-endian length, and a JSON-encoded payload (§4.1). Field names and
//! casing are part of the wire contract; unknown fields are ignored on
//! decode so rolling upgrades stay compatible, and an unrecognized type tag
//! is the one thing that terminates a session outright.

pub mod error;
pub mod frame;
pub mod msg;

pub use error::Error;
pub use frame::{DEFAULT_MAX_MESSAGE_SIZE, read_message, write_message};
pub use msg::{Message, MsgType, ProxyConfig, ProxyType, VisitorConfig};
