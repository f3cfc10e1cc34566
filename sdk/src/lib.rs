//! Driver SDK for plugin authors who run their policy handler as a separate
//! process instead of linking `retun-core` directly (§4.12 "plugins may be
//! out-of-process, reachable over HTTP").
//!
//! [`PluginClient`] is a thin `reqwest` wrapper that POSTs a
//! [`PluginRequest`] envelope and parses the [`PluginResponse`] envelope back
//! — the HTTP counterpart of calling a [`PluginHandler`] in-process.
//! [`HttpPluginHandler`] adapts one into the other so an out-of-process
//! plugin can be registered on a [`PluginBus`] exactly like a local one.
//!
//! Grounded on `examples/mycrl-turn-rs/drivers/src/lib.rs`'s `Controller`
//! (a `reqwest::Client` built with a fixed request timeout, one method per
//! remote operation, JSON in and out).

use std::time::Duration;

use async_trait::async_trait;
use retun_core::error::{Error, Result};
use retun_core::plugin::{Op, PluginHandler, PluginRequest, PluginResponse};

/// Matches the per-call budget a handler is dispatched under on the bus
/// (`retun_core::plugin::PLUGIN_CALL_TIMEOUT`); the HTTP round trip must fit
/// comfortably inside it, so the client's own timeout is set tighter.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Posts plugin envelopes to a single HTTP endpoint that handles every op it
/// is registered for, e.g. `POST http://127.0.0.1:9500/plugin`.
pub struct PluginClient {
    client: reqwest::Client,
    endpoint: String,
}

impl PluginClient {
    pub fn new(endpoint: impl Into<String>) -> reqwest::Result<Self> {
        Self::with_timeout(endpoint, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(endpoint: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::ClientBuilder::new().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    /// Sends one `PluginRequest` and parses the JSON response body as a
    /// `PluginResponse`. A non-2xx status or a malformed body both surface
    /// as `Error::PluginSendFail`, matching the bus's own handling of a
    /// handler that errors or times out.
    pub async fn call(&self, request: &PluginRequest) -> Result<PluginResponse> {
        let res = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                log::warn!("plugin driver: request to {} failed: {e}", self.endpoint);
                Error::PluginSendFail
            })?;

        if !res.status().is_success() {
            log::warn!(
                "plugin driver: {} replied with status {}",
                self.endpoint,
                res.status()
            );
            return Err(Error::PluginSendFail);
        }

        res.json::<PluginResponse>().await.map_err(|e| {
            log::warn!("plugin driver: malformed response from {}: {e}", self.endpoint);
            Error::PluginSendFail
        })
    }
}

/// Adapts a [`PluginClient`] into a [`PluginHandler`] so an out-of-process
/// plugin registers on a `PluginBus` the same way an in-process one does.
pub struct HttpPluginHandler {
    name: String,
    ops: Vec<Op>,
    client: PluginClient,
}

impl HttpPluginHandler {
    pub fn new(name: impl Into<String>, ops: Vec<Op>, client: PluginClient) -> Self {
        Self {
            name: name.into(),
            ops,
            client,
        }
    }
}

#[async_trait]
impl PluginHandler for HttpPluginHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn ops(&self) -> &[Op] {
        &self.ops
    }

    async fn handle(&self, _op: Op, request: PluginRequest) -> Result<PluginResponse> {
        self.client.call(&request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_construction_accepts_any_endpoint_shape() {
        assert!(PluginClient::new("http://127.0.0.1:9500/plugin").is_ok());
        assert!(PluginClient::with_timeout("http://127.0.0.1:9500/plugin", Duration::from_millis(500)).is_ok());
    }

    #[test]
    fn handler_reports_the_ops_it_was_built_with() {
        let client = PluginClient::new("http://127.0.0.1:9500/plugin").unwrap();
        let handler = HttpPluginHandler::new("external-quota", vec![Op::NewProxy, Op::CloseProxy], client);
        assert_eq!(handler.name(), "external-quota");
        assert_eq!(handler.ops(), &[Op::NewProxy, Op::CloseProxy]);
    }
}
