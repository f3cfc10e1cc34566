//! Server plugin bus (§3 `PluginHook`, §4.12).
//!
//! An ordered registry of external policy handlers, each subscribed to a
//! subset of the eight operation codes. Request/response ops run the
//! subscribed handlers in registration order, each able to reject (ending
//! the chain) or mutate the content passed to the next; notification ops
//! run every subscribed handler and aggregate errors for a single log line
//! rather than propagating them (§4.12).
//!
//! Grounded on `original_source/pkg/plugin/server/manager.go`'s `Manager`
//! (`loginPlugins`/`newProxyPlugins`/... per-op slices, `reqid` generation
//! attached to the logging context for correlation). The bare `sync.Map`
//! process-wide registry in `original_source/package/register.go` is
//! explicitly not reused as a singleton here (SPEC_FULL.md §9 redesign
//! flag): the bus is an object owned by the server/client controller.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The eight operation codes a plugin may subscribe to (§3 `PluginHook`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Login,
    NewProxy,
    CloseProxy,
    Ping,
    NewWorkConn,
    NewUserConn,
    CloseUserConn,
    GetHttpQosConfig,
}

impl Op {
    /// Request/response ops run in order and may reject/mutate; notification
    /// ops are fire-and-forget with aggregated logging (§4.12).
    pub fn is_request_response(self) -> bool {
        !matches!(self, Op::CloseProxy | Op::CloseUserConn)
    }
}

/// Per-call timeout governing a blocked plugin dispatch (§5: "governed by a
/// 5s per-call timeout").
pub const PLUGIN_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Envelope every dispatch carries, matching §6: "every op carries
/// `{reqid, version, content}`".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginRequest {
    pub reqid: String,
    pub version: String,
    pub op: String,
    pub content: serde_json::Value,
}

/// Envelope a handler returns, matching §6:
/// `{reject bool, reject_reason string, unchange bool, content any}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginResponse {
    #[serde(default)]
    pub reject: bool,
    #[serde(default)]
    pub reject_reason: String,
    #[serde(default)]
    pub unchange: bool,
    #[serde(default)]
    pub content: serde_json::Value,
}

impl PluginResponse {
    pub fn unchanged() -> Self {
        Self {
            reject: false,
            reject_reason: String::new(),
            unchange: true,
            content: serde_json::Value::Null,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            reject: true,
            reject_reason: reason.into(),
            unchange: false,
            content: serde_json::Value::Null,
        }
    }

    pub fn mutated(content: serde_json::Value) -> Self {
        Self {
            reject: false,
            reject_reason: String::new(),
            unchange: false,
            content,
        }
    }
}

/// One registered policy handler. Implementors declare interest via
/// [`PluginHandler::ops`]; the bus only dispatches subscribed ops to them.
#[async_trait]
pub trait PluginHandler: Send + Sync {
    fn name(&self) -> &str;
    fn ops(&self) -> &[Op];
    async fn handle(&self, op: Op, request: PluginRequest) -> Result<PluginResponse>;
}

fn next_reqid(counter: &AtomicU64) -> String {
    let n = counter.fetch_add(1, Ordering::Relaxed);
    format!("plugin-{n:016x}")
}

/// Ordered registry of [`PluginHandler`]s, owned by the server controller
/// (never a process-wide singleton, per SPEC_FULL.md §9).
#[derive(Default)]
pub struct PluginBus {
    handlers: Vec<Arc<dyn PluginHandler>>,
    reqid_counter: AtomicU64,
}

impl PluginBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler; dispatch order for any given `Op` follows
    /// registration order.
    pub fn register(&mut self, handler: Arc<dyn PluginHandler>) {
        self.handlers.push(handler);
    }

    fn subscribed(&self, op: Op) -> impl Iterator<Item = &Arc<dyn PluginHandler>> {
        self.handlers.iter().filter(move |h| h.ops().contains(&op))
    }

    /// Dispatches a request/response op through every subscribed handler in
    /// order. The first reject ends the chain; each non-reject response
    /// becomes the `content` seen by the next handler, and by the caller
    /// once the chain completes with no reject.
    pub async fn dispatch_request(
        &self,
        op: Op,
        version: &str,
        content: serde_json::Value,
    ) -> Result<serde_json::Value> {
        debug_assert!(op.is_request_response());

        let mut current = content;
        for handler in self.subscribed(op) {
            let request = PluginRequest {
                reqid: next_reqid(&self.reqid_counter),
                version: version.to_string(),
                op: format!("{op:?}"),
                content: current.clone(),
            };

            let response =
                tokio::time::timeout(PLUGIN_CALL_TIMEOUT, handler.handle(op, request))
                    .await
                    .map_err(|_| Error::PluginSendFail)??;

            if response.reject {
                return Err(Error::PluginReject(response.reject_reason));
            }
            if !response.unchange {
                current = response.content;
            }
        }

        Ok(current)
    }

    /// Dispatches a notification op to every subscribed handler concurrently;
    /// errors are aggregated and logged, never propagated to the caller
    /// (§4.12).
    pub async fn dispatch_notification(&self, op: Op, version: &str, content: serde_json::Value) {
        debug_assert!(!op.is_request_response());

        let mut errors = Vec::new();
        for handler in self.subscribed(op) {
            let request = PluginRequest {
                reqid: next_reqid(&self.reqid_counter),
                version: version.to_string(),
                op: format!("{op:?}"),
                content: content.clone(),
            };

            let result =
                tokio::time::timeout(PLUGIN_CALL_TIMEOUT, handler.handle(op, request)).await;
            match result {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => errors.push(format!("{}: {e}", handler.name())),
                Err(_) => errors.push(format!("{}: timed out", handler.name())),
            }
        }

        if !errors.is_empty() {
            log::warn!(
                "plugin bus: {op:?} notification had {} failing handler(s): {}",
                errors.len(),
                errors.join("; ")
            );
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RejectEverything;

    #[async_trait]
    impl PluginHandler for RejectEverything {
        fn name(&self) -> &str {
            "reject-everything"
        }

        fn ops(&self) -> &[Op] {
            &[Op::Login]
        }

        async fn handle(&self, _op: Op, _request: PluginRequest) -> Result<PluginResponse> {
            Ok(PluginResponse::rejected("no logins today"))
        }
    }

    struct SetField(&'static str, &'static str);

    #[async_trait]
    impl PluginHandler for SetField {
        fn name(&self) -> &str {
            "set-field"
        }

        fn ops(&self) -> &[Op] {
            &[Op::NewProxy]
        }

        async fn handle(&self, _op: Op, request: PluginRequest) -> Result<PluginResponse> {
            let mut content = request.content;
            content[self.0] = serde_json::Value::String(self.1.to_string());
            Ok(PluginResponse::mutated(content))
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl PluginHandler for AlwaysFails {
        fn name(&self) -> &str {
            "always-fails"
        }

        fn ops(&self) -> &[Op] {
            &[Op::CloseUserConn]
        }

        async fn handle(&self, _op: Op, _request: PluginRequest) -> Result<PluginResponse> {
            Err(Error::Internal("boom".into()))
        }
    }

    #[tokio::test]
    async fn reject_ends_the_chain() {
        let mut bus = PluginBus::new();
        bus.register(Arc::new(RejectEverything));

        let result = bus
            .dispatch_request(Op::Login, "1.0", serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(Error::PluginReject(reason)) if reason == "no logins today"));
    }

    #[tokio::test]
    async fn mutation_chains_through_handlers() {
        let mut bus = PluginBus::new();
        bus.register(Arc::new(SetField("routing_key", "blue")));

        let result = bus
            .dispatch_request(Op::NewProxy, "1.0", serde_json::json!({"name": "t"}))
            .await
            .unwrap();
        assert_eq!(result["routing_key"], "blue");
        assert_eq!(result["name"], "t");
    }

    #[tokio::test]
    async fn notification_errors_are_swallowed() {
        let mut bus = PluginBus::new();
        bus.register(Arc::new(AlwaysFails));

        // Must not panic or return an error to the caller.
        bus.dispatch_notification(Op::CloseUserConn, "1.0", serde_json::json!({}))
            .await;
    }
}
