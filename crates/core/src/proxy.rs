//! Registered forwarding rule runtime state (§3 `ProxyDescriptor`, §4.6
//! "per-proxy sub-state").
//!
//! The wire shape (`retun_proto::ProxyConfig`) is a plain serializable
//! record; this module wraps it with the runtime bits a live registration
//! needs: the owning session's RunID (a lookup key, not a back-reference —
//! breaking the Session→Proxy→Session cycle per SPEC_FULL.md §9), the
//! allocated public port if any, and the `Registering → Active → Closing →
//! Closed` sub-state machine.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use retun_proto::msg::ProxyConfig;

use crate::session::RunId;

/// Per-proxy sub-state (§4.6). A `NewProxyResp` carrying a non-empty error
/// parks the proxy in `Closed` without retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Registering,
    Active,
    Closing,
    Closed,
}

pub struct Proxy {
    pub owner_run_id: RunId,
    pub config: ProxyConfig,
    pub allocated_port: Option<u16>,
    state: RwLock<ProxyState>,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    /// Count of UserConns currently spliced through this proxy. Gates the
    /// `Closing` → `Closed` transition per SPEC_FULL.md §9's resolution of
    /// the `CloseProxy`-vs-in-flight-UserConn race: a proxy observed closing
    /// only finalizes once every connection already spliced through it has
    /// finished, so an ingress that already committed isn't punished for a
    /// registration change racing it.
    inflight: AtomicU64,
}

impl Proxy {
    pub fn new(owner_run_id: RunId, config: ProxyConfig, allocated_port: Option<u16>) -> Self {
        Self {
            owner_run_id,
            config,
            allocated_port,
            state: RwLock::new(ProxyState::Registering),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            inflight: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ProxyState {
        *self.state.read()
    }

    pub fn set_state(&self, state: ProxyState) {
        *self.state.write() = state;
    }

    /// Transitions `Registering`/`Active` → `Active`; no-op from `Closing`
    /// or `Closed`, since those are terminal absent a fresh registration.
    pub fn activate(&self) {
        let mut guard = self.state.write();
        if matches!(*guard, ProxyState::Registering) {
            *guard = ProxyState::Active;
        }
    }

    /// Marks the proxy as closing: new ingress is refused immediately
    /// (§9), but in-flight connections already spliced through it keep
    /// running. Does not finalize `Closed` itself — see
    /// [`Proxy::close_if_drained`].
    pub fn begin_closing(&self) {
        let mut guard = self.state.write();
        if !matches!(*guard, ProxyState::Closed) {
            *guard = ProxyState::Closing;
        }
    }

    pub fn close(&self) {
        *self.state.write() = ProxyState::Closed;
    }

    /// Whether new public ingress may still be paired to this proxy.
    pub fn accepts_new_ingress(&self) -> bool {
        matches!(self.state(), ProxyState::Registering | ProxyState::Active)
    }

    /// Registers one more UserConn being spliced through this proxy.
    pub fn begin_inflight(&self) {
        self.inflight.fetch_add(1, Ordering::SeqCst);
    }

    /// Releases an in-flight UserConn; if the proxy was `Closing` and this
    /// was the last one, finalizes the `Closed` transition and returns
    /// `true` so the caller knows to release the public port/route.
    pub fn end_inflight(&self) -> bool {
        let remaining = self.inflight.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            let mut guard = self.state.write();
            if matches!(*guard, ProxyState::Closing) {
                *guard = ProxyState::Closed;
                return true;
            }
        }
        false
    }

    pub fn inflight_count(&self) -> u64 {
        self.inflight.load(Ordering::SeqCst)
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
    use retun_proto::msg::ProxyType;

    fn sample_config() -> ProxyConfig {
        ProxyConfig {
            name: "t".into(),
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
        }
    }

    #[test]
    fn sub_state_machine_rejects_reactivation_after_close() {
        let proxy = Proxy::new(RunId::generate(), sample_config(), Some(26000));
        assert_eq!(proxy.state(), ProxyState::Registering);

        proxy.activate();
        assert_eq!(proxy.state(), ProxyState::Active);

        proxy.close();
        assert_eq!(proxy.state(), ProxyState::Closed);

        proxy.activate();
        assert_eq!(proxy.state(), ProxyState::Closed);
    }

    #[test]
    fn closing_waits_for_inflight_to_drain() {
        let proxy = Proxy::new(RunId::generate(), sample_config(), Some(26000));
        proxy.activate();

        proxy.begin_inflight();
        proxy.begin_inflight();
        proxy.begin_closing();
        assert_eq!(proxy.state(), ProxyState::Closing);
        assert!(!proxy.accepts_new_ingress());

        assert!(!proxy.end_inflight());
        assert_eq!(proxy.state(), ProxyState::Closing, "one connection still in flight");

        assert!(proxy.end_inflight());
        assert_eq!(proxy.state(), ProxyState::Closed);
    }
}
