//! Shared server state: one instance per running `retund`, threaded through
//! every per-carrier control-plane task and public listener (§5 "Shared
//! resources").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use retun_core::plugin::PluginBus;
use retun_core::proxy::Proxy;
use retun_core::qos::LimiterManager;
use retun_core::session::{RunId, Session, SessionRegistry};
use retun_core::session::ports::PortAllocator;
use retun_core::transport::Transport;
use retun_core::vhost::VhostRouter;
use retun_core::xtcp::{SharedRendezvous, XtcpRendezvous};
use retun_proto::msg::Message;
use tokio::sync::mpsc;

use crate::config::Config;

pub struct ServerState {
    pub config: Config,
    pub sessions: SessionRegistry,
    pub tcp_ports: Mutex<PortAllocator>,
    pub udp_ports: Mutex<PortAllocator>,
    pub vhost: VhostRouter,
    pub limiter: LimiterManager,
    pub plugin_bus: PluginBus,
    pub xtcp: SharedRendezvous,
    pub transport: Box<dyn Transport>,
    /// Global proxy-name → (owning session, proxy) index, used by the STCP
    /// visitor path and XTCP rendezvous to find a proxy without knowing its
    /// owning RunID up front (§4.10, §4.9 visitor lookups).
    pub proxy_index: RwLock<HashMap<String, (Arc<Session>, Arc<Proxy>)>>,
    /// Every logged-in session's control-channel writer queue, keyed by
    /// RunID, so one session's handler can push a message onto another's
    /// channel (e.g. relaying `NatHoleClient` to a proxy's owner).
    pub control_senders: RwLock<HashMap<RunId, mpsc::UnboundedSender<Message>>>,
    /// Last-seen session per login principal, used to route XTCP rendezvous
    /// messages to "whoever owns this user" (§4.10 step 2).
    pub sessions_by_principal: RwLock<HashMap<String, Arc<Session>>>,
}

impl ServerState {
    pub fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        let port_range = config.allow_ports.unwrap_or_default();
        let transport = retun_core::transport::by_name(&config.transport.protocol)?;

        Ok(Arc::new(Self {
            tcp_ports: Mutex::new(PortAllocator::new(port_range)),
            udp_ports: Mutex::new(PortAllocator::new(port_range)),
            vhost: VhostRouter::new(),
            limiter: LimiterManager::new(
                Duration::from_secs(config.qos.expire_after_secs),
                Duration::from_secs(config.qos.idle_timeout_secs),
            ),
            plugin_bus: PluginBus::new(),
            xtcp: Arc::new(XtcpRendezvous::new()),
            sessions: SessionRegistry::new(),
            proxy_index: RwLock::new(HashMap::new()),
            control_senders: RwLock::new(HashMap::new()),
            sessions_by_principal: RwLock::new(HashMap::new()),
            transport,
            config,
        }))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.config.transport.heartbeat_timeout_secs)
    }
}
