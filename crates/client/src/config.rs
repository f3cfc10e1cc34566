//! Client configuration (§6, SPEC_FULL.md ambient "Configuration").
//!
//! Mirrors `retun_server::config` structurally (same `Cli`/`toml` shape),
//! plus the client-only pieces SPEC_FULL.md §3 supplements: a `local_addr`
//! alongside every registered proxy's wire shape (the server never needs to
//! know a proxy's local backend), and the `ProxyDescriptor::complete`/
//! `VisitorDescriptor::complete` defaulting step from
//! `original_source/package/frpc/loadConfig.go`.

use std::fs::read_to_string;
use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use retun_proto::msg::{ProxyConfig, VisitorConfig};
use serde::Deserialize;

pub mod legacy;

#[derive(Deserialize, Debug, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_level(self) -> log::Level {
        match self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Transport {
    #[serde(default = "Transport::protocol")]
    pub protocol: String,
    /// `poolCount` (§4.6 Running): work-conns are dialed reactively per
    /// `ReqWorkConn`, but the server sizes its pool queue to this figure.
    #[serde(default = "Transport::pool_count")]
    pub pool_count: u32,
    #[serde(default = "Transport::heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "Transport::heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default)]
    pub tcp_mux: bool,
}

impl Transport {
    fn protocol() -> String {
        "tcp".to_string()
    }

    fn pool_count() -> u32 {
        1
    }

    fn heartbeat_interval_secs() -> u64 {
        30
    }

    fn heartbeat_timeout_secs() -> u64 {
        90
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self {
            protocol: Self::protocol(),
            pool_count: Self::pool_count(),
            heartbeat_interval_secs: Self::heartbeat_interval_secs(),
            heartbeat_timeout_secs: Self::heartbeat_timeout_secs(),
            tcp_mux: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Auth {
    pub token: String,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

/// One configured proxy: the wire shape the server needs (`ProxyConfig`)
/// plus the local backend address the server is never told about.
#[derive(Deserialize, Debug, Clone)]
pub struct ProxyEntry {
    pub local_addr: String,
    #[serde(flatten)]
    pub wire: ProxyConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub server_addr: SocketAddr,
    pub user: String,
    pub auth: Auth,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default)]
    pub proxies: Vec<ProxyEntry>,
    #[serde(default)]
    pub visitors: Vec<VisitorConfig>,
    #[serde(default)]
    pub log: Log,
}

impl Config {
    /// §3 supplement: defaults a visitor's implied target owner to the
    /// client's own configured user when `server_user` is absent, mirroring
    /// `loadConfig.go`'s post-parse `Complete` step.
    pub fn complete(&mut self) {
        for visitor in &mut self.visitors {
            if visitor.server_user.is_none() {
                visitor.server_user = Some(self.user.clone());
            }
        }
    }

    /// Loads and completes a config document. `strict` selects between
    /// best-effort legacy key=value parsing (unknown keys dropped) and
    /// rejecting on any unknown key, mirroring `LoadConfigure(content,
    /// &allCfg, strict)` (§9 Open Question 2).
    pub fn load(path: &str, strict: bool) -> Result<Self> {
        let content = read_to_string(path)?;
        let mut config = match toml::from_str::<Self>(&content) {
            Ok(config) => config,
            Err(toml_err) => legacy::parse(&content, strict)
                .map_err(|e| anyhow::anyhow!("not valid TOML ({toml_err}) and legacy parse failed: {e}"))?,
        };
        config.complete();
        Ok(config)
    }
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS")
)]
pub struct Cli {
    /// Path to the client's configuration file (TOML, or legacy key=value).
    #[arg(long, short)]
    pub config: String,
    /// Reject legacy configs containing unrecognized keys instead of
    /// dropping them (§9 Open Question 2).
    #[arg(long, default_value_t = false)]
    pub strict: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_toml_and_completes_visitor_owner() {
        let mut config: Config = toml::from_str(
            r#"
            server_addr = "127.0.0.1:7000"
            user = "alice"

            [auth]
            token = "shared-secret"

            [[visitors]]
            name = "v"
            visitor_type = "stcp"
            server_name = "x"
            secret_key = "s3cr3t"
            "#,
        )
        .unwrap();
        config.complete();

        assert_eq!(config.transport.pool_count, 1);
        assert_eq!(config.visitors[0].server_user.as_deref(), Some("alice"));
    }

    #[test]
    fn proxy_entry_flattens_local_addr_alongside_wire_fields() {
        let config: Config = toml::from_str(
            r#"
            server_addr = "127.0.0.1:7000"
            user = "alice"

            [auth]
            token = "shared-secret"

            [[proxies]]
            name = "ssh"
            proxy_type = "tcp"
            local_addr = "127.0.0.1:22"
            remote_port = 26000
            "#,
        )
        .unwrap();

        assert_eq!(config.proxies[0].local_addr, "127.0.0.1:22");
        assert_eq!(config.proxies[0].wire.name, "ssh");
        assert_eq!(config.proxies[0].wire.remote_port, Some(26000));
    }
}
