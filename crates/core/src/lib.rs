//! Control and data multiplexing engine shared by the retun client and
//! server binaries: the framed-codec session, stream multiplexer, transport
//! adapters, crypto/compression wrappers, splice engine, and the
//! proxy/work-conn/user-conn matchmaker that sits above them.

pub mod carrier;
pub mod compress;
pub mod crypto;
pub mod error;
pub mod mux;
pub mod plugin;
pub mod proxy;
pub mod qos;
pub mod session;
pub mod splice;
pub mod stream;
pub mod transport;
pub mod vhost;
pub mod workconn;
pub mod xtcp;

pub use carrier::{BoxedCarrier, Carrier};
pub use error::{Error, Result};
