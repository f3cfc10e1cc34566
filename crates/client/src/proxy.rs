//! Client-side view of a registered proxy (§3 `ProxyDescriptor`, §4.6).
//!
//! Reuses [`retun_core::proxy::ProxyState`] verbatim: the same
//! `Registering → Active → Closing → Closed` sub-state machine the server
//! tracks applies to the client's copy of the registration, just driven by
//! `NewProxyResp`/`CloseProxy` instead of the server's own bookkeeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use retun_core::proxy::ProxyState;

use crate::config::ProxyEntry;
use crate::local::LocalHandler;

pub struct ClientProxy {
    pub entry: ProxyEntry,
    pub local_handler: Arc<dyn LocalHandler>,
    state: RwLock<ProxyState>,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
}

impl ClientProxy {
    pub fn new(entry: ProxyEntry, local_handler: Arc<dyn LocalHandler>) -> Arc<Self> {
        Arc::new(Self {
            entry,
            local_handler,
            state: RwLock::new(ProxyState::Registering),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> ProxyState {
        *self.state.read()
    }

    pub fn set_state(&self, state: ProxyState) {
        *self.state.write() = state;
    }

    pub fn record_bytes(&self, in_delta: u64, out_delta: u64) {
        if in_delta > 0 {
            self.bytes_in.fetch_add(in_delta, Ordering::Relaxed);
        }
        if out_delta > 0 {
            self.bytes_out.fetch_add(out_delta, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::TcpLocalHandler;
    use retun_proto::msg::{ProxyConfig, ProxyType};

    fn sample_entry() -> ProxyEntry {
        ProxyEntry {
            local_addr: "127.0.0.1:22".into(),
            wire: ProxyConfig {
                name: "ssh".into(),
                proxy_type: ProxyType::Tcp,
                use_encryption: false,
                use_compression: false,
                remote_port: Some(26000),
                custom_domains: Vec::new(),
                locations: Vec::new(),
                routing_key: None,
                http_user: None,
                http_password: None,
                host_header_rewrite: None,
                request_headers: Default::default(),
                response_headers: Default::default(),
                secret_key: None,
            },
        }
    }

    #[test]
    fn starts_registering_and_tracks_byte_counters() {
        let proxy = ClientProxy::new(sample_entry(), Arc::new(TcpLocalHandler));
        assert_eq!(proxy.state(), ProxyState::Registering);

        proxy.set_state(ProxyState::Active);
        assert_eq!(proxy.state(), ProxyState::Active);

        proxy.record_bytes(10, 20);
        assert_eq!(proxy.bytes_in.load(Ordering::Relaxed), 10);
        assert_eq!(proxy.bytes_out.load(Ordering::Relaxed), 20);
    }
}
