use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One-byte wire tag identifying a control message's payload shape.
///
/// Values are stable across versions: unknown fields inside a payload MUST
/// be ignored by decoders (so old clients can talk to newer servers), but an
/// unrecognized *tag* terminates the session (`Error::UnknownMessage`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    Login = 0x01,
    LoginResp = 0x02,
    NewProxy = 0x03,
    NewProxyResp = 0x04,
    CloseProxy = 0x05,
    NewWorkConn = 0x06,
    ReqWorkConn = 0x07,
    StartWorkConn = 0x08,
    NewVisitorConn = 0x09,
    NewVisitorConnResp = 0x0a,
    Ping = 0x0b,
    Pong = 0x0c,
    NatHoleVisitor = 0x0d,
    NatHoleClient = 0x0e,
    NatHoleResp = 0x0f,
    NatHoleSid = 0x10,
    NatHoleReport = 0x11,
    UdpPacket = 0x12,
}

impl MsgType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0x01 => Self::Login,
            0x02 => Self::LoginResp,
            0x03 => Self::NewProxy,
            0x04 => Self::NewProxyResp,
            0x05 => Self::CloseProxy,
            0x06 => Self::NewWorkConn,
            0x07 => Self::ReqWorkConn,
            0x08 => Self::StartWorkConn,
            0x09 => Self::NewVisitorConn,
            0x0a => Self::NewVisitorConnResp,
            0x0b => Self::Ping,
            0x0c => Self::Pong,
            0x0d => Self::NatHoleVisitor,
            0x0e => Self::NatHoleClient,
            0x0f => Self::NatHoleResp,
            0x10 => Self::NatHoleSid,
            0x11 => Self::NatHoleReport,
            0x12 => Self::UdpPacket,
            _ => return None,
        })
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// Kind of forwarding rule a `ProxyConfig` describes. Shared between
/// server-bound proxies and client-side visitors (a visitor only ever
/// targets `Stcp`/`Sudp`/`Xtcp`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    Tcp,
    Udp,
    Http,
    Https,
    Stcp,
    Sudp,
    Xtcp,
}

impl ProxyType {
    /// Whether this variant reserves a public listener (TCP/UDP port or
    /// vhost binding) versus being discoverable only via the control
    /// channel (STCP/SUDP/XTCP).
    pub fn binds_public_endpoint(self) -> bool {
        matches!(self, Self::Tcp | Self::Udp | Self::Http | Self::Https)
    }

    pub fn requires_secret(self) -> bool {
        matches!(self, Self::Stcp | Self::Sudp | Self::Xtcp)
    }
}

/// `requestHeaders.set` / `requestHeaders.add` and their response
/// counterparts (§4.9).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeaderOps {
    #[serde(default)]
    pub set: HashMap<String, String>,
    #[serde(default)]
    pub add: HashMap<String, Vec<String>>,
}

impl HeaderOps {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.add.is_empty()
    }
}

/// The wire shape of a registered forwarding rule (§3 `ProxyDescriptor`).
///
/// All variants share `name`/`use_encryption`/`use_compression`; the rest
/// are variant-specific and left at their default when unused, the way the
/// original's single struct-with-many-optional-fields config works but
/// grouped instead of flattened, since Rust has sum types and Go doesn't.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub name: String,
    pub proxy_type: ProxyType,
    #[serde(default)]
    pub use_encryption: bool,
    #[serde(default)]
    pub use_compression: bool,

    /// TCP/UDP: requested remote port (0 or absent means "assign any").
    #[serde(default)]
    pub remote_port: Option<u16>,

    /// HTTP/HTTPS: domains this proxy answers for.
    #[serde(default)]
    pub custom_domains: Vec<String>,
    /// HTTP/HTTPS: optional path prefixes under `custom_domains`; longest
    /// prefix wins at routing time.
    #[serde(default)]
    pub locations: Vec<String>,
    /// HTTP/HTTPS: selects among proxies sharing a domain (A/B or
    /// user-affinity routing).
    #[serde(default)]
    pub routing_key: Option<String>,
    #[serde(default)]
    pub http_user: Option<String>,
    #[serde(default)]
    pub http_password: Option<String>,
    #[serde(default)]
    pub host_header_rewrite: Option<String>,
    #[serde(default)]
    pub request_headers: HeaderOps,
    #[serde(default)]
    pub response_headers: HeaderOps,

    /// STCP/SUDP/XTCP: shared secret; visitors must prove knowledge of it.
    #[serde(default)]
    pub secret_key: Option<String>,
}

impl ProxyConfig {
    /// `(domain, path, routing key)` tuples this config publishes, used for
    /// the vhost router's uniqueness check and route table key.
    pub fn route_keys(&self) -> Vec<(String, String, Option<String>)> {
        let paths: Vec<String> = if self.locations.is_empty() {
            vec![String::new()]
        } else {
            self.locations.clone()
        };

        self.custom_domains
            .iter()
            .flat_map(|domain| {
                paths
                    .iter()
                    .map(|path| (domain.clone(), path.clone(), self.routing_key.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

/// Client-side consumer of a remote STCP/SUDP/XTCP service (§3 `Visitor`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisitorConfig {
    pub name: String,
    pub visitor_type: ProxyType,
    /// Owning user of the target proxy; defaults to the visitor's own user
    /// when absent (`ProxyDescriptor::complete`/`VisitorDescriptor::complete`
    /// in SPEC_FULL.md §3).
    #[serde(default)]
    pub server_user: Option<String>,
    pub server_name: String,
    pub secret_key: String,
    #[serde(default)]
    pub bind_addr: Option<String>,
    #[serde(default)]
    pub bind_port: Option<u16>,
    #[serde(default)]
    pub use_encryption: bool,
    #[serde(default)]
    pub use_compression: bool,
    #[serde(default)]
    pub fallback_to: Option<String>,
    #[serde(default)]
    pub fallback_timeout_ms: Option<u64>,
    #[serde(default)]
    pub keep_tunnel_open: bool,
    #[serde(default = "VisitorConfig::default_max_retries_an_hour")]
    pub max_retries_an_hour: u32,
    #[serde(default = "VisitorConfig::default_min_retry_interval_secs")]
    pub min_retry_interval_secs: u32,
}

impl VisitorConfig {
    fn default_max_retries_an_hour() -> u32 {
        8
    }

    fn default_min_retry_interval_secs() -> u32 {
        180
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Login {
    pub version: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub user: String,
    /// Proof derived from the pre-shared token, never the token itself.
    pub token_proof: String,
    #[serde(default)]
    pub run_id: Option<String>,
    pub pool_count: u32,
    #[serde(default)]
    pub metas: HashMap<String, String>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResp {
    pub version: String,
    pub run_id: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProxy {
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProxyResp {
    pub proxy_name: String,
    #[serde(default)]
    pub remote_port: Option<u16>,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseProxy {
    pub proxy_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkConn {
    pub run_id: String,
    /// Tags this work-conn with the proxy it was dialed for, so the server
    /// can pair `ReqWorkConn`→`NewWorkConn` FIFO per proxy name even when
    /// arrivals interleave across proxies (§4.8).
    pub proxy_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReqWorkConn {
    pub proxy_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartWorkConn {
    pub proxy_name: String,
    pub src_addr: String,
    #[serde(default)]
    pub dst_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewVisitorConn {
    pub proxy_name: String,
    /// HMAC of `timestamp` under the shared secret; the server forwards
    /// this without ever learning the secret itself (§4.10 step 2).
    pub sign: String,
    pub timestamp: u64,
    #[serde(default)]
    pub use_encryption: bool,
    #[serde(default)]
    pub use_compression: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewVisitorConnResp {
    pub proxy_name: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ping {
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pong {
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatHoleVisitor {
    pub sid: String,
    pub proxy_name: String,
    pub owner_user: String,
    pub sign: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatHoleClient {
    pub sid: String,
    pub proxy_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatHoleResp {
    pub sid: String,
    #[serde(default)]
    pub candidates: Vec<String>,
    #[serde(default)]
    pub assisted_addrs: Vec<String>,
    pub nat_type: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatHoleSid {
    pub sid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatHoleReport {
    pub sid: String,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpPacket {
    pub sid: String,
    pub addr: String,
    pub payload: Vec<u8>,
}

/// A decoded control message: the type tag and its typed payload, paired so
/// callers never have to juggle the two separately.
#[derive(Debug, Clone)]
pub enum Message {
    Login(Login),
    LoginResp(LoginResp),
    NewProxy(NewProxy),
    NewProxyResp(NewProxyResp),
    CloseProxy(CloseProxy),
    NewWorkConn(NewWorkConn),
    ReqWorkConn(ReqWorkConn),
    StartWorkConn(StartWorkConn),
    NewVisitorConn(NewVisitorConn),
    NewVisitorConnResp(NewVisitorConnResp),
    Ping(Ping),
    Pong(Pong),
    NatHoleVisitor(NatHoleVisitor),
    NatHoleClient(NatHoleClient),
    NatHoleResp(NatHoleResp),
    NatHoleSid(NatHoleSid),
    NatHoleReport(NatHoleReport),
    UdpPacket(UdpPacket),
}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Self::Login(_) => MsgType::Login,
            Self::LoginResp(_) => MsgType::LoginResp,
            Self::NewProxy(_) => MsgType::NewProxy,
            Self::NewProxyResp(_) => MsgType::NewProxyResp,
            Self::CloseProxy(_) => MsgType::CloseProxy,
            Self::NewWorkConn(_) => MsgType::NewWorkConn,
            Self::ReqWorkConn(_) => MsgType::ReqWorkConn,
            Self::StartWorkConn(_) => MsgType::StartWorkConn,
            Self::NewVisitorConn(_) => MsgType::NewVisitorConn,
            Self::NewVisitorConnResp(_) => MsgType::NewVisitorConnResp,
            Self::Ping(_) => MsgType::Ping,
            Self::Pong(_) => MsgType::Pong,
            Self::NatHoleVisitor(_) => MsgType::NatHoleVisitor,
            Self::NatHoleClient(_) => MsgType::NatHoleClient,
            Self::NatHoleResp(_) => MsgType::NatHoleResp,
            Self::NatHoleSid(_) => MsgType::NatHoleSid,
            Self::NatHoleReport(_) => MsgType::NatHoleReport,
            Self::UdpPacket(_) => MsgType::UdpPacket,
        }
    }

    /// Serialize this message's payload (not including the tag/length
    /// header, see [`crate::frame`]).
    pub fn encode_payload(&self) -> serde_json::Result<Vec<u8>> {
        macro_rules! enc {
            ($v:expr) => {
                serde_json::to_vec($v)
            };
        }

        match self {
            Self::Login(m) => enc!(m),
            Self::LoginResp(m) => enc!(m),
            Self::NewProxy(m) => enc!(m),
            Self::NewProxyResp(m) => enc!(m),
            Self::CloseProxy(m) => enc!(m),
            Self::NewWorkConn(m) => enc!(m),
            Self::ReqWorkConn(m) => enc!(m),
            Self::StartWorkConn(m) => enc!(m),
            Self::NewVisitorConn(m) => enc!(m),
            Self::NewVisitorConnResp(m) => enc!(m),
            Self::Ping(m) => enc!(m),
            Self::Pong(m) => enc!(m),
            Self::NatHoleVisitor(m) => enc!(m),
            Self::NatHoleClient(m) => enc!(m),
            Self::NatHoleResp(m) => enc!(m),
            Self::NatHoleSid(m) => enc!(m),
            Self::NatHoleReport(m) => enc!(m),
            Self::UdpPacket(m) => enc!(m),
        }
    }

    pub fn decode_payload(kind: MsgType, bytes: &[u8]) -> serde_json::Result<Self> {
        Ok(match kind {
            MsgType::Login => Self::Login(serde_json::from_slice(bytes)?),
            MsgType::LoginResp => Self::LoginResp(serde_json::from_slice(bytes)?),
            MsgType::NewProxy => Self::NewProxy(serde_json::from_slice(bytes)?),
            MsgType::NewProxyResp => Self::NewProxyResp(serde_json::from_slice(bytes)?),
            MsgType::CloseProxy => Self::CloseProxy(serde_json::from_slice(bytes)?),
            MsgType::NewWorkConn => Self::NewWorkConn(serde_json::from_slice(bytes)?),
            MsgType::ReqWorkConn => Self::ReqWorkConn(serde_json::from_slice(bytes)?),
            MsgType::StartWorkConn => Self::StartWorkConn(serde_json::from_slice(bytes)?),
            MsgType::NewVisitorConn => Self::NewVisitorConn(serde_json::from_slice(bytes)?),
            MsgType::NewVisitorConnResp => Self::NewVisitorConnResp(serde_json::from_slice(bytes)?),
            MsgType::Ping => Self::Ping(serde_json::from_slice(bytes)?),
            MsgType::Pong => Self::Pong(serde_json::from_slice(bytes)?),
            MsgType::NatHoleVisitor => Self::NatHoleVisitor(serde_json::from_slice(bytes)?),
            MsgType::NatHoleClient => Self::NatHoleClient(serde_json::from_slice(bytes)?),
            MsgType::NatHoleResp => Self::NatHoleResp(serde_json::from_slice(bytes)?),
            MsgType::NatHoleSid => Self::NatHoleSid(serde_json::from_slice(bytes)?),
            MsgType::NatHoleReport => Self::NatHoleReport(serde_json::from_slice(bytes)?),
            MsgType::UdpPacket => Self::UdpPacket(serde_json::from_slice(bytes)?),
        })
    }
}
