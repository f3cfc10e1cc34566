//! Best-effort legacy `[section]` / `key = value` config translator (§6,
//! §9 Open Question 2).
//!
//! Grounded on `original_source/package/frpc/loadConfig.go`'s
//! `DetectLegacyINIFormat` + `strict`-gated `LoadConfigure`: a `[common]`
//! section maps to the top-level client fields, and every other section is
//! either a proxy (default) or a visitor (`role = visitor`). Unlike TOML,
//! legacy values are bare (unquoted) strings, so this is a line-oriented
//! translator rather than a real parser — the same "lossy, best-effort"
//! contract the original has: an unrecognized key is silently dropped
//! unless `strict` is set, in which case the whole load fails.

use std::collections::HashMap;
use std::fmt;

use retun_proto::msg::{HeaderOps, ProxyConfig, ProxyType, VisitorConfig};

use super::{Auth, Config, Log, ProxyEntry, Transport};

#[derive(Debug)]
pub struct LegacyError(String);

impl fmt::Display for LegacyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "legacy config error: {}", self.0)
    }
}

impl std::error::Error for LegacyError {}

type Section = HashMap<String, String>;

fn tokenize(content: &str) -> Vec<(String, Section)> {
    let mut sections: Vec<(String, Section)> = Vec::new();
    let mut current: Option<(String, Section)> = None;

    for raw_line in content.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            if let Some(done) = current.take() {
                sections.push(done);
            }
            current = Some((name.trim().to_string(), Section::new()));
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().to_string();
        let value = value.trim().trim_matches('"').to_string();

        if let Some((_, section)) = current.as_mut() {
            section.insert(key, value);
        }
    }

    if let Some(done) = current.take() {
        sections.push(done);
    }

    sections
}

fn parse_proxy_type(raw: &str) -> Option<ProxyType> {
    Some(match raw {
        "tcp" => ProxyType::Tcp,
        "udp" => ProxyType::Udp,
        "http" => ProxyType::Http,
        "https" => ProxyType::Https,
        "stcp" => ProxyType::Stcp,
        "sudp" => ProxyType::Sudp,
        "xtcp" => ProxyType::Xtcp,
        _ => return None,
    })
}

fn take_known(section: &mut Section, key: &str) -> Option<String> {
    section.remove(key)
}

fn reject_unknown(section_name: &str, leftover: &Section, strict: bool) -> Result<(), LegacyError> {
    if strict && !leftover.is_empty() {
        let keys: Vec<&str> = leftover.keys().map(String::as_str).collect();
        return Err(LegacyError(format!(
            "section [{section_name}] has unrecognized key(s): {}",
            keys.join(", ")
        )));
    }
    Some(()).ok_or(()).or(Ok(()))
}

/// Parses a legacy document into the same in-memory `Config` a TOML
/// document would produce.
pub fn parse(content: &str, strict: bool) -> Result<Config, LegacyError> {
    let mut sections = tokenize(content);

    let common_idx = sections.iter().position(|(name, _)| name == "common");
    let mut common = common_idx.map(|i| sections.remove(i).1).unwrap_or_default();

    let server_addr_raw = take_known(&mut common, "server_addr").unwrap_or_else(|| "127.0.0.1".to_string());
    let server_port = take_known(&mut common, "server_port").unwrap_or_else(|| "7000".to_string());
    let user = take_known(&mut common, "user").unwrap_or_default();
    let token = take_known(&mut common, "token").unwrap_or_default();
    let protocol = take_known(&mut common, "protocol").unwrap_or_else(|| "tcp".to_string());
    let pool_count = take_known(&mut common, "pool_count")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);
    let heartbeat_interval_secs = take_known(&mut common, "heartbeat_interval_secs")
        .and_then(|v| v.parse().ok())
        .unwrap_or(30);
    let heartbeat_timeout_secs = take_known(&mut common, "heartbeat_timeout_secs")
        .and_then(|v| v.parse().ok())
        .unwrap_or(90);
    let tcp_mux = take_known(&mut common, "tcp_mux")
        .map(|v| v == "true")
        .unwrap_or(false);

    reject_unknown("common", &common, strict)?;

    let server_addr = format!("{server_addr_raw}:{server_port}")
        .parse()
        .map_err(|e| LegacyError(format!("invalid server_addr/server_port: {e}")))?;

    let mut proxies = Vec::new();
    let mut visitors = Vec::new();

    for (name, mut section) in sections {
        let is_visitor = take_known(&mut section, "role").as_deref() == Some("visitor");

        if is_visitor {
            let visitor_type = take_known(&mut section, "type")
                .and_then(|v| parse_proxy_type(&v))
                .ok_or_else(|| LegacyError(format!("section [{name}] missing/invalid type")))?;
            let visitor = VisitorConfig {
                name: name.clone(),
                visitor_type,
                server_user: take_known(&mut section, "server_user"),
                server_name: take_known(&mut section, "server_name").unwrap_or_default(),
                secret_key: take_known(&mut section, "sk").unwrap_or_default(),
                bind_addr: take_known(&mut section, "bind_addr"),
                bind_port: take_known(&mut section, "bind_port").and_then(|v| v.parse().ok()),
                use_encryption: take_known(&mut section, "use_encryption").map(|v| v == "true").unwrap_or(false),
                use_compression: take_known(&mut section, "use_compression").map(|v| v == "true").unwrap_or(false),
                fallback_to: take_known(&mut section, "fallback_to"),
                fallback_timeout_ms: take_known(&mut section, "fallback_timeout_ms").and_then(|v| v.parse().ok()),
                keep_tunnel_open: take_known(&mut section, "keep_tunnel_open").map(|v| v == "true").unwrap_or(false),
                max_retries_an_hour: take_known(&mut section, "max_retries_an_hour")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(8),
                min_retry_interval_secs: take_known(&mut section, "min_retry_interval_secs")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(180),
            };
            reject_unknown(&name, &section, strict)?;
            visitors.push(visitor);
            continue;
        }

        let proxy_type = take_known(&mut section, "type")
            .and_then(|v| parse_proxy_type(&v))
            .ok_or_else(|| LegacyError(format!("section [{name}] missing/invalid type")))?;

        let local_ip = take_known(&mut section, "local_ip").unwrap_or_else(|| "127.0.0.1".to_string());
        let local_port = take_known(&mut section, "local_port").unwrap_or_default();
        let local_addr = if local_port.is_empty() {
            local_ip
        } else {
            format!("{local_ip}:{local_port}")
        };

        let custom_domains = take_known(&mut section, "custom_domains")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default();
        let locations = take_known(&mut section, "locations")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default();

        let wire = ProxyConfig {
            name: name.clone(),
            proxy_type,
            use_encryption: take_known(&mut section, "use_encryption").map(|v| v == "true").unwrap_or(false),
            use_compression: take_known(&mut section, "use_compression").map(|v| v == "true").unwrap_or(false),
            remote_port: take_known(&mut section, "remote_port").and_then(|v| v.parse().ok()),
            custom_domains,
            locations,
            routing_key: take_known(&mut section, "routing_key"),
            http_user: take_known(&mut section, "http_user"),
            http_password: take_known(&mut section, "http_password"),
            host_header_rewrite: take_known(&mut section, "host_header_rewrite"),
            request_headers: HeaderOps::default(),
            response_headers: HeaderOps::default(),
            secret_key: take_known(&mut section, "secret_key"),
        };

        reject_unknown(&name, &section, strict)?;
        proxies.push(ProxyEntry { local_addr, wire });
    }

    let mut config = Config {
        server_addr,
        user,
        auth: Auth { token },
        transport: Transport {
            protocol,
            pool_count,
            heartbeat_interval_secs,
            heartbeat_timeout_secs,
            tcp_mux,
        },
        proxies,
        visitors,
        log: Log::default(),
    };
    config.complete();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [common]
        server_addr = 127.0.0.1
        server_port = 7000
        user = alice
        token = shared-secret

        [ssh]
        type = tcp
        local_ip = 127.0.0.1
        local_port = 22
        remote_port = 26000
        "#;

    #[test]
    fn parses_common_and_one_proxy() {
        let config = parse(SAMPLE, false).unwrap();
        assert_eq!(config.server_addr.port(), 7000);
        assert_eq!(config.user, "alice");
        assert_eq!(config.proxies.len(), 1);
        assert_eq!(config.proxies[0].local_addr, "127.0.0.1:22");
        assert_eq!(config.proxies[0].wire.remote_port, Some(26000));
    }

    #[test]
    fn drops_unknown_keys_when_not_strict() {
        let with_unknown = format!("{SAMPLE}\n        bogus_key = whatever\n");
        let config = parse(&with_unknown, false).unwrap();
        assert_eq!(config.proxies.len(), 1);
    }

    #[test]
    fn rejects_unknown_keys_when_strict() {
        let section_with_unknown = r#"
            [common]
            server_addr = 127.0.0.1
            server_port = 7000
            user = alice
            token = shared-secret

            [ssh]
            type = tcp
            local_ip = 127.0.0.1
            local_port = 22
            bogus_key = whatever
            "#;
        let err = parse(section_with_unknown, true).unwrap_err();
        assert!(err.to_string().contains("bogus_key"));
    }

    #[test]
    fn parses_visitor_section() {
        let with_visitor = format!(
            "{SAMPLE}\n        [v]\n        role = visitor\n        type = stcp\n        server_name = ssh\n        sk = s3cr3t\n        bind_port = 6000\n"
        );
        let config = parse(&with_visitor, false).unwrap();
        assert_eq!(config.visitors.len(), 1);
        assert_eq!(config.visitors[0].server_name, "ssh");
        assert_eq!(config.visitors[0].bind_port, Some(6000));
    }
}
