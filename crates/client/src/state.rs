//! Shared client state: one instance per running `retunc`, threaded through
//! the control-plane FSM and every visitor listener (mirrors
//! `retun_server::state::ServerState`).

use std::collections::HashMap;
use std::sync::Arc;

use ahash::HashMap as AHashMap;
use parking_lot::{Mutex, RwLock};
use retun_core::transport::Transport;
use retun_proto::msg::NatHoleResp;
use tokio::sync::oneshot;

use crate::config::Config;
use crate::local::{LocalHandler, TcpLocalHandler};
use crate::proxy::ClientProxy;

pub struct ClientState {
    pub config: Config,
    pub transport: Box<dyn Transport>,
    pub local_handler: Arc<dyn LocalHandler>,
    pub proxies: RwLock<AHashMap<String, Arc<ClientProxy>>>,
    /// Server-assigned RunID from the most recent successful `LoginResp`,
    /// offered back on reconnect so the server can resume the same session
    /// within its grace window (§4.7 `Draining`).
    pub run_id: Mutex<Option<String>>,
    /// XTCP rendezvous responses are correlated by `sid` (§4.10 step 4);
    /// `handle_nat_hole_resp` in the control loop resolves whichever
    /// listener registered interest in that `sid`.
    pub pending_nat_hole: Mutex<HashMap<String, oneshot::Sender<NatHoleResp>>>,
}

impl ClientState {
    pub fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        let transport = retun_core::transport::by_name(&config.transport.protocol)?;

        let mut proxies = AHashMap::default();
        for entry in &config.proxies {
            proxies.insert(
                entry.wire.name.clone(),
                ClientProxy::new(entry.clone(), Arc::new(TcpLocalHandler)),
            );
        }

        Ok(Arc::new(Self {
            config,
            transport,
            local_handler: Arc::new(TcpLocalHandler),
            proxies: RwLock::new(proxies),
            run_id: Mutex::new(None),
            pending_nat_hole: Mutex::new(HashMap::new()),
        }))
    }
}
