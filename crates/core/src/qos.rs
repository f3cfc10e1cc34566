//! QoS limiter manager (§3 `LimiterEntry`, §4.11).
//!
//! A lazy, per-proxy-name token bucket refreshed asynchronously through the
//! plugin bus's `GetHttpQosConfig` hook. Grounded on
//! `original_source/pkg/plugin/server/manager.go`'s `ErrorPluginsSendFail`
//! sentinel, which is the one failure class this manager treats as
//! fail-open rather than fail-closed, plus spec.md §4.11's bucket
//! parameters.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;

use crate::error::Error;
use crate::plugin::{Op, PluginBus};

fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Outcome of a `GetHttpQosConfig` refresh, distinguishing the one failure
/// mode that must fail open from everything else (§4.11, §7).
pub enum RefreshOutcome {
    Unlimited,
    Limited { rate: u32, burst: u32 },
    /// `ErrorPluginsSendFail`: network-class failure, retain the previous
    /// bucket.
    PluginSendFail,
    /// Any other failure: install a zero-rate bucket.
    OtherFailure,
}

/// A token bucket for one key (= proxy name), §3 `LimiterEntry`.
///
/// `rate == 0 && burst == 0` is the "zero-rate" fail-closed sentinel;
/// `rate == u32::MAX` is the "unlimited" sentinel installed on a
/// `{rps: 0, burst: 0}` success response (§4.11 "otherwise" branch reads as
/// the inverse of this: a *successful* zero/zero means unlimited, while a
/// *failed* refresh installing zero/zero means fail-closed — the manager
/// keeps these straight by tracking outcome, not just the numbers).
struct Bucket {
    rate: u32,
    burst: u32,
    unlimited: bool,
    tokens: AtomicI64,
    last_update_millis: AtomicU64,
    last_used_millis: AtomicU64,
}

impl Bucket {
    fn new(rate: u32, burst: u32, unlimited: bool) -> Self {
        let now = now_millis();
        Self {
            rate,
            burst,
            unlimited,
            tokens: AtomicI64::new(burst as i64),
            last_update_millis: AtomicU64::new(now),
            last_used_millis: AtomicU64::new(now),
        }
    }

    fn touch(&self) {
        self.last_update_millis.store(now_millis(), Ordering::SeqCst);
    }

    /// Refills based on elapsed time then attempts to take one token.
    fn allow(&self) -> bool {
        self.last_used_millis.store(now_millis(), Ordering::SeqCst);

        if self.unlimited {
            return true;
        }
        if self.rate == 0 && self.burst == 0 {
            return false;
        }

        let now = now_millis();
        let last = self.last_update_millis.swap(now, Ordering::SeqCst);
        let elapsed_secs = (now.saturating_sub(last)) as f64 / 1000.0;
        let refill = (elapsed_secs * self.rate as f64) as i64;

        if refill > 0 {
            let capacity = self.burst as i64;
            self.tokens
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| {
                    Some((t + refill).min(capacity))
                })
                .ok();
        }

        self.tokens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| {
                if t > 0 { Some(t - 1) } else { None }
            })
            .is_ok()
    }

    fn idle_for(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_used_millis.load(Ordering::SeqCst))
    }
}

/// Default sweep cadence (§4.11: "every 10 min").
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Manages per-key token buckets, refreshing lazily via the plugin bus and
/// evicting idle entries on a background sweep. Safe for concurrent `allow`
/// calls (§4.11, §5).
pub struct LimiterManager {
    buckets: RwLock<std::collections::HashMap<String, Arc<Bucket>>>,
    expire_after: Duration,
    idle_timeout: Duration,
}

impl LimiterManager {
    pub fn new(expire_after: Duration, idle_timeout: Duration) -> Self {
        Self {
            buckets: RwLock::new(std::collections::HashMap::new()),
            expire_after,
            idle_timeout,
        }
    }

    fn stale(&self, bucket: &Bucket) -> bool {
        now_millis().saturating_sub(bucket.last_update_millis.load(Ordering::SeqCst))
            > self.expire_after.as_millis() as u64
    }

    /// Looks up (and if needed refreshes) the bucket for `key`, then
    /// evaluates `Allow`. A miss or stale bucket triggers a synchronous
    /// refresh through `plugin_bus`'s `GetHttpQosConfig` hook, whose
    /// `version` is attached to the dispatch envelope.
    pub async fn allow(&self, key: &str, plugin_bus: &PluginBus, version: &str) -> bool {
        let existing = self.buckets.read().get(key).cloned();

        let bucket = match existing {
            Some(bucket) if !self.stale(&bucket) => bucket,
            Some(stale_bucket) => self.refresh(key, plugin_bus, version, Some(stale_bucket)).await,
            None => self.refresh(key, plugin_bus, version, None).await,
        };

        bucket.allow()
    }

    async fn refresh(
        &self,
        key: &str,
        plugin_bus: &PluginBus,
        version: &str,
        previous: Option<Arc<Bucket>>,
    ) -> Arc<Bucket> {
        let outcome = self.load_outcome(key, plugin_bus, version).await;

        let bucket = match outcome {
            RefreshOutcome::Unlimited => Arc::new(Bucket::new(0, 0, true)),
            RefreshOutcome::Limited { rate, burst } => Arc::new(Bucket::new(rate, burst, false)),
            RefreshOutcome::PluginSendFail => match previous {
                // §4.11/§7/§8.7: fail-open, retain the previous bucket.
                Some(prev) => {
                    prev.touch();
                    prev
                }
                None => Arc::new(Bucket::new(0, 0, false)),
            },
            RefreshOutcome::OtherFailure => Arc::new(Bucket::new(0, 0, false)),
        };

        self.buckets.write().insert(key.to_string(), bucket.clone());
        bucket
    }

    async fn load_outcome(&self, key: &str, plugin_bus: &PluginBus, version: &str) -> RefreshOutcome {
        let content = serde_json::json!({ "proxy_name": key });
        match plugin_bus
            .dispatch_request(Op::GetHttpQosConfig, version, content)
            .await
        {
            Ok(value) => {
                let rps = value.get("rps").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                let burst = value.get("burst").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                if rps == 0 && burst == 0 {
                    RefreshOutcome::Unlimited
                } else {
                    RefreshOutcome::Limited { rate: rps, burst }
                }
            }
            Err(Error::PluginSendFail) => RefreshOutcome::PluginSendFail,
            Err(_) => RefreshOutcome::OtherFailure,
        }
    }

    /// Evicts entries idle longer than `idle_timeout` (§4.11 background
    /// sweeper). Call on a `DEFAULT_SWEEP_INTERVAL` tick.
    pub fn sweep(&self) {
        let now = now_millis();
        let idle_millis = self.idle_timeout.as_millis() as u64;
        self.buckets
            .write()
            .retain(|_, bucket| bucket.idle_for(now) <= idle_millis);
    }

    pub fn len(&self) -> usize {
        self.buckets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{PluginHandler, PluginRequest, PluginResponse};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    struct FixedQos {
        rps: u32,
        burst: u32,
    }

    #[async_trait]
    impl PluginHandler for FixedQos {
        fn name(&self) -> &str {
            "fixed-qos"
        }
        fn ops(&self) -> &[Op] {
            &[Op::GetHttpQosConfig]
        }
        async fn handle(&self, _op: Op, _request: PluginRequest) -> crate::error::Result<PluginResponse> {
            Ok(PluginResponse::mutated(
                serde_json::json!({ "rps": self.rps, "burst": self.burst }),
            ))
        }
    }

    struct NetworkFlaky(Arc<AtomicBool>);

    #[async_trait]
    impl PluginHandler for NetworkFlaky {
        fn name(&self) -> &str {
            "network-flaky"
        }
        fn ops(&self) -> &[Op] {
            &[Op::GetHttpQosConfig]
        }
        async fn handle(&self, _op: Op, _request: PluginRequest) -> crate::error::Result<PluginResponse> {
            if self.0.load(Ordering::SeqCst) {
                Err(Error::PluginSendFail)
            } else {
                Ok(PluginResponse::mutated(serde_json::json!({ "rps": 5, "burst": 5 })))
            }
        }
    }

    #[tokio::test]
    async fn allows_up_to_burst_then_denies() {
        let mut bus = PluginBus::new();
        bus.register(Arc::new(FixedQos { rps: 1, burst: 1 }));
        let manager = LimiterManager::new(Duration::from_secs(60), Duration::from_secs(600));

        assert!(manager.allow("t", &bus, "1.0").await);
        assert!(!manager.allow("t", &bus, "1.0").await);
    }

    #[tokio::test]
    async fn fail_open_retains_previous_bucket_on_plugin_send_fail() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut bus = PluginBus::new();
        bus.register(Arc::new(NetworkFlaky(flag.clone())));
        let manager = LimiterManager::new(Duration::from_millis(0), Duration::from_secs(600));

        assert!(manager.allow("t", &bus, "1.0").await);

        flag.store(true, Ordering::SeqCst);
        // Stale on every call (expire_after = 0) but fails open: keeps the
        // previously observed (rate=5, burst=5) bucket rather than zeroing
        // it. A fail-closed bucket would deny every subsequent call; the
        // retained bucket still has burst tokens left to spend.
        for _ in 0..3 {
            assert!(manager.allow("t", &bus, "1.0").await);
        }
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn sweep_evicts_idle_entries() {
        let mut bus = PluginBus::new();
        bus.register(Arc::new(FixedQos { rps: 1, burst: 1 }));
        let manager = LimiterManager::new(Duration::from_secs(60), Duration::from_millis(0));

        manager.allow("t", &bus, "1.0").await;
        assert_eq!(manager.len(), 1);

        tokio::time::sleep(Duration::from_millis(5)).await;
        manager.sweep();
        assert_eq!(manager.len(), 0);
    }
}
