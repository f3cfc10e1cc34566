//! Server configuration (§6, SPEC_FULL.md ambient "Configuration").
//!
//! Mirrors the teacher's `turn-server::config` shape exactly: a `clap`
//! `Cli` carrying only `--config`, a `toml`-backed `Config::load`, nested
//! structs with `#[serde(default = "...")]` defaults rather than a
//! `Default` derive wherever a non-zero default is needed.

use std::fs::read_to_string;
use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use retun_core::session::ports::PortRange;
use serde::Deserialize;

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
    /// `transport.protocol` (§6): selects the `retun_core::transport`
    /// adapter the control channel and work-conns dial/accept over.
    #[serde(default = "Transport::protocol")]
    pub protocol: String,
    #[serde(default = "Transport::heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default)]
    pub tcp_mux: bool,
}

impl Transport {
    fn protocol() -> String {
        "tcp".to_string()
    }

    fn heartbeat_timeout_secs() -> u64 {
        90
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self {
            protocol: Self::protocol(),
            heartbeat_timeout_secs: Self::heartbeat_timeout_secs(),
            tcp_mux: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Auth {
    /// Pre-shared token; clients prove knowledge of it in `Login.token_proof`
    /// (§3 Session, §4.7 `Authenticated`).
    pub token: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Vhost {
    #[serde(default = "Vhost::http_port")]
    pub http_port: u16,
    #[serde(default = "Vhost::https_port")]
    pub https_port: u16,
}

impl Vhost {
    fn http_port() -> u16 {
        80
    }

    fn https_port() -> u16 {
        443
    }
}

impl Default for Vhost {
    fn default() -> Self {
        Self {
            http_port: Self::http_port(),
            https_port: Self::https_port(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Qos {
    #[serde(default = "Qos::expire_after_secs")]
    pub expire_after_secs: u64,
    #[serde(default = "Qos::idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Qos {
    fn expire_after_secs() -> u64 {
        60
    }

    fn idle_timeout_secs() -> u64 {
        600
    }
}

impl Default for Qos {
    fn default() -> Self {
        Self {
            expire_after_secs: Self::expire_after_secs(),
            idle_timeout_secs: Self::idle_timeout_secs(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// `serverAddr`/`serverPort` (§6): the control-channel listener.
    #[serde(default = "Config::bind_addr")]
    pub bind_addr: SocketAddr,
    /// `allowPorts`: the public-port allocator's range for TCP/UDP proxies.
    #[serde(default)]
    pub allow_ports: Option<PortRange>,
    #[serde(default)]
    pub transport: Transport,
    pub auth: Auth,
    #[serde(default)]
    pub vhost: Vhost,
    #[serde(default)]
    pub qos: Qos,
    #[serde(default)]
    pub log: Log,
}

impl Config {
    fn bind_addr() -> SocketAddr {
        "0.0.0.0:7000".parse().unwrap()
    }
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS")
)]
struct Cli {
    /// Path to the server's TOML configuration file.
    #[arg(long, short)]
    config: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        Ok(toml::from_str(&read_to_string(&Cli::parse().config)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_toml() {
        let config: Config = toml::from_str(
            r#"
            [auth]
            token = "shared-secret"
            "#,
        )
        .unwrap();

        assert_eq!(config.bind_addr.port(), 7000);
        assert_eq!(config.transport.protocol, "tcp");
        assert_eq!(config.vhost.http_port, 80);
    }
}
