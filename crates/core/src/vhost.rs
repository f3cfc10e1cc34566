//! HTTP/HTTPS vhost router (§4.9).
//!
//! Binds one listener per configured vhost port and multiplexes many public
//! domains over it, keyed by `(domain, path-prefix, routing-key)` with
//! longest-path-prefix precedence. Request-line/Host-header extraction uses
//! `httparse` (the same crate `hyper` itself uses for this) since the
//! router forwards raw bytes to a work-conn rather than decoding into a
//! framework response the way the teacher's `axum`-based admin API does —
//! this is an **(enrichment)** import, no pack repo does HTTP routing at
//! this layer (see DESIGN.md).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::proxy::Proxy;

/// `(domain, path-prefix, routing-key)` uniqueness key (§3 invariant,
/// §4.9 "domain conflict").
pub type RouteKey = (String, String, Option<String>);

/// Copy-on-write route table: readers never block on a writer (§5 "Vhost
/// route table: copy-on-write; readers lock-free").
#[derive(Default)]
pub struct VhostRouter {
    routes: RwLock<Arc<HashMap<RouteKey, Arc<Proxy>>>>,
}

impl VhostRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every `(domain, path, key)` tuple `proxy` publishes.
    /// Fails with `DomainConflict` (leaving the table untouched) if any
    /// tuple collides with an existing registration (§4.9).
    pub fn register(&self, proxy: Arc<Proxy>) -> Result<()> {
        let keys = proxy.config.route_keys();
        if keys.is_empty() {
            return Err(Error::ConfigInvalid(format!(
                "proxy {:?} has no custom_domains to route",
                proxy.config.name
            )));
        }

        let current = self.routes.read().clone();
        for key in &keys {
            if current.contains_key(key) {
                return Err(Error::DomainConflict(format!(
                    "{}{}{}",
                    key.0,
                    key.1,
                    key.2.as_deref().map(|k| format!("#{k}")).unwrap_or_default()
                )));
            }
        }

        let mut next = (*current).clone();
        for key in keys {
            next.insert(key, proxy.clone());
        }
        *self.routes.write() = Arc::new(next);
        Ok(())
    }

    /// Removes every route tuple `proxy_name` owns. A no-op for tuples
    /// already absent.
    pub fn unregister(&self, proxy: &Proxy) {
        let keys = proxy.config.route_keys();
        let current = self.routes.read().clone();
        let mut next = (*current).clone();
        for key in keys {
            next.remove(&key);
        }
        *self.routes.write() = Arc::new(next);
    }

    /// Resolves `(domain, path, routing_key)` to its proxy. Longest path
    /// prefix wins; when `routing_key` is absent callers pass `None` and
    /// only the keyless registration matches.
    pub fn resolve(&self, domain: &str, path: &str, routing_key: Option<&str>) -> Option<Arc<Proxy>> {
        let routes = self.routes.read();

        routes
            .iter()
            .filter(|((d, p, k), _)| {
                d == domain
                    && path.starts_with(p.as_str())
                    && k.as_deref() == routing_key
            })
            .max_by_key(|((_, p, _), _)| p.len())
            .map(|(_, proxy)| proxy.clone())
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A parsed HTTP request line plus the headers the router cares about
/// (§4.9): Host for domain dispatch, Authorization for Basic-Auth.
pub struct ParsedRequest {
    pub method: String,
    pub path: String,
    pub host: String,
    pub authorization: Option<String>,
}

/// Parses a buffered HTTP/1.x request head (up through the blank line) with
/// `httparse`, extracting exactly what the router needs to dispatch: method,
/// path, Host header, and an optional Authorization header for the
/// Basic-Auth challenge (§4.9).
pub fn parse_request_head(buf: &[u8]) -> Result<ParsedRequest> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(Error::ProtocolViolation("incomplete HTTP request head".into()));
        }
        Err(e) => return Err(Error::ProtocolViolation(format!("malformed HTTP request: {e}"))),
    }

    let method = req.method.unwrap_or("GET").to_string();
    let path = req.path.unwrap_or("/").to_string();

    let mut host = None;
    let mut authorization = None;
    for header in req.headers.iter() {
        if header.name.eq_ignore_ascii_case("host") {
            host = Some(String::from_utf8_lossy(header.value).trim().to_string());
        } else if header.name.eq_ignore_ascii_case("authorization") {
            authorization = Some(String::from_utf8_lossy(header.value).trim().to_string());
        }
    }

    let host = host.ok_or_else(|| Error::ProtocolViolation("missing Host header".into()))?;
    // Host header may carry a port; the router keys purely on the domain.
    let domain = host.split(':').next().unwrap_or(&host).to_string();

    Ok(ParsedRequest {
        method,
        path,
        host: domain,
        authorization,
    })
}

/// Decodes an `Authorization: Basic <b64>` header into `(user, password)`.
/// Returns `None` for anything else (including a missing header), which the
/// caller treats as an auth failure the same as a wrong credential.
pub fn decode_basic_auth(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = base64_decode(encoded.trim())?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, password) = text.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// Minimal standard-alphabet base64 decoder, avoiding a dependency pulled
/// in purely for this one header; Basic-Auth credentials are short enough
/// that a table-driven decode is simpler than adding a crate for it.
fn base64_decode(input: &str) -> Option<Vec<u8>> {
    fn value(c: u8) -> Option<u8> {
        match c {
            b'A'..=b'Z' => Some(c - b'A'),
            b'a'..=b'z' => Some(c - b'a' + 26),
            b'0'..=b'9' => Some(c - b'0' + 52),
            b'+' => Some(62),
            b'/' => Some(63),
            _ => None,
        }
    }

    let bytes: Vec<u8> = input.bytes().filter(|&b| b != b'=').collect();
    let mut out = Vec::with_capacity(bytes.len() * 3 / 4);
    for chunk in bytes.chunks(4) {
        let vals: Vec<u8> = chunk.iter().map(|&b| value(b)).collect::<Option<_>>()?;
        match vals.len() {
            4 => {
                out.push((vals[0] << 2) | (vals[1] >> 4));
                out.push((vals[1] << 4) | (vals[2] >> 2));
                out.push((vals[2] << 6) | vals[3]);
            }
            3 => {
                out.push((vals[0] << 2) | (vals[1] >> 4));
                out.push((vals[1] << 4) | (vals[2] >> 2));
            }
            2 => {
                out.push((vals[0] << 2) | (vals[1] >> 4));
            }
            _ => return None,
        }
    }
    Some(out)
}

/// Applies `requestHeaders.set`/`requestHeaders.add` in place (§4.9, §8.6):
/// a `set` key always yields exactly one occurrence regardless of what the
/// inbound request carried, applied after any inbound duplicates are
/// stripped.
pub fn apply_header_ops(headers: &mut Vec<(String, String)>, ops: &retun_proto::msg::HeaderOps) {
    for (key, value) in &ops.set {
        headers.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
        headers.push((key.clone(), value.clone()));
    }
    for (key, values) in &ops.add {
        for value in values {
            headers.push((key.clone(), value.clone()));
        }
    }
}

/// §4.9 Basic-Auth failure delay: rate-limits bruteforcers.
pub const AUTH_FAILURE_DELAY: std::time::Duration = std::time::Duration::from_millis(200);

/// Extracts the SNI hostname from a raw TLS ClientHello record, so the
/// HTTPS vhost listener can route by domain without terminating TLS
/// (§4.9: "parses the TLS ClientHello to extract SNI without terminating
/// TLS"). Returns `None` on anything that doesn't look like a well-formed
/// ClientHello carrying a `server_name` extension.
pub fn extract_sni(record: &[u8]) -> Option<String> {
    // TLS record header: type(1) version(2) length(2).
    if record.len() < 5 || record[0] != 0x16 {
        return None;
    }
    let mut pos = 5;

    // Handshake header: type(1) length(3).
    if record.len() < pos + 4 || record[pos] != 0x01 {
        return None;
    }
    pos += 4;

    // client_version(2) + random(32).
    pos += 34;
    if record.len() < pos + 1 {
        return None;
    }

    // session_id.
    let session_id_len = *record.get(pos)? as usize;
    pos += 1 + session_id_len;

    // cipher_suites.
    let cipher_len = u16::from_be_bytes([*record.get(pos)?, *record.get(pos + 1)?]) as usize;
    pos += 2 + cipher_len;

    // compression_methods.
    let compression_len = *record.get(pos)? as usize;
    pos += 1 + compression_len;

    if pos + 2 > record.len() {
        return None;
    }
    let extensions_len = u16::from_be_bytes([record[pos], record[pos + 1]]) as usize;
    pos += 2;
    let extensions_end = (pos + extensions_len).min(record.len());

    while pos + 4 <= extensions_end {
        let ext_type = u16::from_be_bytes([record[pos], record[pos + 1]]);
        let ext_len = u16::from_be_bytes([record[pos + 2], record[pos + 3]]) as usize;
        let ext_start = pos + 4;
        if ext_start + ext_len > extensions_end {
            return None;
        }

        if ext_type == 0x0000 {
            // server_name extension: list_len(2) then entries of
            // type(1) + len(2) + name.
            let body = &record[ext_start..ext_start + ext_len];
            if body.len() < 2 {
                return None;
            }
            let mut entry_pos = 2;
            while entry_pos + 3 <= body.len() {
                let name_type = body[entry_pos];
                let name_len = u16::from_be_bytes([body[entry_pos + 1], body[entry_pos + 2]]) as usize;
                let name_start = entry_pos + 3;
                if name_type == 0x00 && name_start + name_len <= body.len() {
                    return std::str::from_utf8(&body[name_start..name_start + name_len])
                        .ok()
                        .map(str::to_string);
                }
                entry_pos = name_start + name_len;
            }
            return None;
        }

        pos = ext_start + ext_len;
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::Proxy;
    use crate::session::RunId;
    use retun_proto::msg::{ProxyConfig, ProxyType};

    fn http_proxy(name: &str, domain: &str, path: &str, key: Option<&str>) -> Arc<Proxy> {
        Arc::new(Proxy::new(
            RunId::generate(),
            ProxyConfig {
                name: name.into(),
                proxy_type: ProxyType::Http,
                use_encryption: false,
                use_compression: false,
                remote_port: None,
                custom_domains: vec![domain.into()],
                locations: if path.is_empty() { vec![] } else { vec![path.into()] },
                routing_key: key.map(str::to_string),
                http_user: None,
                http_password: None,
                host_header_rewrite: None,
                request_headers: Default::default(),
                response_headers: Default::default(),
                secret_key: None,
            },
            None,
        ))
    }

    #[test]
    fn registers_and_resolves_by_domain() {
        let router = VhostRouter::new();
        router.register(http_proxy("a", "a.example", "", None)).unwrap();

        let resolved = router.resolve("a.example", "/", None);
        assert!(resolved.is_some());
        assert_eq!(resolved.unwrap().config.name, "a");
    }

    #[test]
    fn domain_conflict_is_rejected_and_leaves_no_residue() {
        let router = VhostRouter::new();
        router.register(http_proxy("a", "a.example", "", None)).unwrap();

        let err = router.register(http_proxy("b", "a.example", "", None));
        assert!(matches!(err, Err(Error::DomainConflict(_))));
        assert_eq!(router.len(), 1);
    }

    #[test]
    fn longest_path_prefix_wins() {
        let router = VhostRouter::new();
        router.register(http_proxy("root", "a.example", "/", None)).unwrap();
        router.register(http_proxy("api", "a.example", "/api", None)).unwrap();

        let resolved = router.resolve("a.example", "/api/users", None).unwrap();
        assert_eq!(resolved.config.name, "api");

        let resolved = router.resolve("a.example", "/other", None).unwrap();
        assert_eq!(resolved.config.name, "root");
    }

    #[test]
    fn parses_host_and_strips_port() {
        let req = b"GET /foo HTTP/1.1\r\nHost: a.example:8080\r\nAuthorization: Basic dTpw\r\n\r\n";
        let parsed = parse_request_head(req).unwrap();
        assert_eq!(parsed.host, "a.example");
        assert_eq!(parsed.path, "/foo");
        assert_eq!(parsed.authorization.as_deref(), Some("Basic dTpw"));
    }

    #[test]
    fn decodes_basic_auth() {
        let (user, pass) = decode_basic_auth("Basic dTpw").unwrap();
        assert_eq!(user, "u");
        assert_eq!(pass, "p");
    }

    fn synthetic_client_hello(hostname: &str) -> Vec<u8> {
        let name = hostname.as_bytes();
        let mut sni_entry = Vec::new();
        sni_entry.push(0x00); // name_type: host_name
        sni_entry.extend_from_slice(&(name.len() as u16).to_be_bytes());
        sni_entry.extend_from_slice(name);

        let mut sni_ext_body = Vec::new();
        sni_ext_body.extend_from_slice(&(sni_entry.len() as u16).to_be_bytes());
        sni_ext_body.extend_from_slice(&sni_entry);

        let mut extensions = Vec::new();
        extensions.extend_from_slice(&0x0000u16.to_be_bytes()); // server_name
        extensions.extend_from_slice(&(sni_ext_body.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&sni_ext_body);

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // client_version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session_id_len
        body.extend_from_slice(&0u16.to_be_bytes()); // cipher_suites_len
        body.push(0); // compression_methods_len
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = Vec::new();
        handshake.push(0x01); // ClientHello
        let len = body.len() as u32;
        handshake.extend_from_slice(&len.to_be_bytes()[1..]); // 3-byte length
        handshake.extend_from_slice(&body);

        let mut record = Vec::new();
        record.push(0x16); // handshake content type
        record.extend_from_slice(&[0x03, 0x01]);
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn extracts_sni_from_synthetic_client_hello() {
        let record = synthetic_client_hello("a.example");
        assert_eq!(extract_sni(&record).as_deref(), Some("a.example"));
    }

    #[test]
    fn extract_sni_rejects_non_handshake_bytes() {
        assert_eq!(extract_sni(b"GET / HTTP/1.1\r\n\r\n"), None);
    }

    #[test]
    fn set_header_op_replaces_all_prior_occurrences() {
        let mut headers = vec![("X-Foo".to_string(), "old1".to_string()), ("x-foo".to_string(), "old2".to_string())];
        let mut ops = retun_proto::msg::HeaderOps::default();
        ops.set.insert("X-Foo".into(), "new".into());

        apply_header_ops(&mut headers, &ops);
        let matches: Vec<_> = headers.iter().filter(|(k, _)| k.eq_ignore_ascii_case("x-foo")).collect();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].1, "new");
    }
}
