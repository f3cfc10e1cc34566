//! XTCP rendezvous (§3 `Visitor` XTCP variant, §4.10).
//!
//! Brokers visitor↔client hole-punching while preserving authorization: the
//! server never learns the shared secret, only forwards an HMAC proof
//! between the two control channels it already trusts. No direct pack
//! analogue implements NAT rendezvous; this module is built to spec.md
//! §4.10's message sequence and shares the proto crate's framed-message
//! style (see DESIGN.md).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha256;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Computes the visitor's proof of secret knowledge: HMAC-SHA256 of
/// `sid:timestamp` keyed by the shared secret. The server forwards this
/// without needing to know the secret itself (§4.10 step 2).
pub fn sign(secret: &str, sid: &str, timestamp: u64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(format!("{sid}:{timestamp}").as_bytes());
    hex_encode(&mac.finalize().into_bytes())
}

pub fn verify(secret: &str, sid: &str, timestamp: u64, candidate_sign: &str) -> bool {
    let expected = sign(secret, sid, timestamp);
    constant_time_eq(expected.as_bytes(), candidate_sign.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Coarse classification of a peer's NAT behaviour, used to pick a punching
/// strategy (§4.10 step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatType {
    /// Same external port for every destination: direct punch usually works.
    Cone,
    /// External port varies per destination: needs port prediction.
    PortPreservingSymmetric,
    /// Fully random external port: punching is unreliable, prefer fallback.
    RandomSymmetric,
}

impl NatType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cone => "cone",
            Self::PortPreservingSymmetric => "port_preserving_symmetric",
            Self::RandomSymmetric => "random_symmetric",
        }
    }

    /// Deduces NAT behaviour from two observed public addresses reported by
    /// the same peer probing from two distinct local ports (§4.10 step 4:
    /// "deduces NAT behaviour ... chooses a strategy").
    pub fn deduce(first_observed: &str, second_observed: &str) -> Self {
        let first_port = first_observed.rsplit(':').next();
        let second_port = second_observed.rsplit(':').next();

        match (first_port, second_port) {
            (Some(a), Some(b)) if a == b => Self::Cone,
            (Some(a), Some(b)) => {
                let (Ok(pa), Ok(pb)) = (a.parse::<i64>(), b.parse::<i64>()) else {
                    return Self::RandomSymmetric;
                };
                if (pa - pb).abs() <= 4 {
                    Self::PortPreservingSymmetric
                } else {
                    Self::RandomSymmetric
                }
            }
            _ => Self::RandomSymmetric,
        }
    }
}

/// Strategy the server recommends to both sides in `NatHoleResp` (§4.10
/// step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunchStrategy {
    Direct,
    PortPrediction,
    Fallback,
}

pub fn choose_strategy(visitor_nat: NatType, client_nat: NatType) -> PunchStrategy {
    use NatType::*;
    match (visitor_nat, client_nat) {
        (Cone, _) | (_, Cone) => PunchStrategy::Direct,
        (RandomSymmetric, RandomSymmetric) => PunchStrategy::Fallback,
        _ => PunchStrategy::PortPrediction,
    }
}

/// A public-address report from one side of a rendezvous (§4.10 step 3).
#[derive(Debug, Clone)]
pub struct Report {
    pub observed_addr: String,
    pub received_at: Instant,
}

/// One in-flight rendezvous, keyed by `sid`. Holds whichever reports have
/// arrived so far; resolved once both sides have reported.
struct Rendezvous {
    proxy_name: String,
    owner_user: String,
    visitor_report: Option<Report>,
    client_report: Option<Report>,
    created_at: Instant,
}

/// Default window a rendezvous record is retained waiting for both sides to
/// report before it's considered abandoned.
pub const RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-visitor retry bookkeeping (§4.10 "Retry policy"): `MaxRetriesAnHour`
/// attempts with at least `MinRetryInterval` seconds between attempts.
pub struct RetryLimiter {
    max_per_hour: u32,
    min_interval: Duration,
    attempts: Mutex<Vec<Instant>>,
    last_attempt: Mutex<Option<Instant>>,
}

impl RetryLimiter {
    pub fn new(max_per_hour: u32, min_interval: Duration) -> Self {
        Self {
            max_per_hour,
            min_interval,
            attempts: Mutex::new(Vec::new()),
            last_attempt: Mutex::new(None),
        }
    }

    /// Returns whether a new attempt is allowed right now, recording it if
    /// so.
    pub fn try_attempt(&self) -> bool {
        let now = Instant::now();

        {
            let last = self.last_attempt.lock();
            if let Some(last) = *last {
                if now.duration_since(last) < self.min_interval {
                    return false;
                }
            }
        }

        let mut attempts = self.attempts.lock();
        attempts.retain(|t| now.duration_since(*t) < Duration::from_secs(3600));
        if attempts.len() as u32 >= self.max_per_hour {
            return false;
        }

        attempts.push(now);
        *self.last_attempt.lock() = Some(now);
        true
    }
}

/// Server-side rendezvous broker: allocates and resolves `sid`-keyed
/// records as `NatHoleVisitor`/`NatHoleClient`/`NatHoleReport` messages
/// arrive on each side's control channel (§4.10 steps 2-4).
#[derive(Default)]
pub struct XtcpRendezvous {
    records: Mutex<HashMap<String, Rendezvous>>,
}

impl XtcpRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a rendezvous record for a new `sid` after the visitor's
    /// secret proof has already been verified by the caller (§4.10 step 2).
    pub fn open(&self, sid: String, proxy_name: String, owner_user: String) {
        self.records.lock().insert(
            sid,
            Rendezvous {
                proxy_name,
                owner_user,
                visitor_report: None,
                client_report: None,
                created_at: Instant::now(),
            },
        );
    }

    /// Records one side's public-address report (§4.10 step 3). Returns
    /// both reports once both sides have checked in, so the caller can
    /// deduce NAT behaviour and reply with `NatHoleResp`.
    pub fn report(&self, sid: &str, is_visitor: bool, observed_addr: String) -> Result<Option<(Report, Report)>> {
        let mut records = self.records.lock();
        let record = records.get_mut(sid).ok_or_else(|| Error::Internal(format!("unknown sid {sid}")))?;

        let report = Report {
            observed_addr,
            received_at: Instant::now(),
        };

        if is_visitor {
            record.visitor_report = Some(report);
        } else {
            record.client_report = Some(report);
        }

        match (&record.visitor_report, &record.client_report) {
            (Some(v), Some(c)) => Ok(Some((v.clone(), c.clone()))),
            _ => Ok(None),
        }
    }

    pub fn proxy_name(&self, sid: &str) -> Option<String> {
        self.records.lock().get(sid).map(|r| r.proxy_name.clone())
    }

    pub fn owner_user(&self, sid: &str) -> Option<String> {
        self.records.lock().get(sid).map(|r| r.owner_user.clone())
    }

    /// Drops rendezvous records that have outlived `RENDEZVOUS_TIMEOUT`
    /// without resolving, freeing the `sid` for reuse.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        self.records
            .lock()
            .retain(|_, record| now.duration_since(record.created_at) < RENDEZVOUS_TIMEOUT);
    }

    pub fn close(&self, sid: &str) {
        self.records.lock().remove(sid);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }
}

/// Drives the visitor side's fallback policy (§4.10 step 6, §8 S6): if
/// `fallback_to` is set and `punch` doesn't resolve within
/// `fallback_timeout`, the caller should transparently open an STCP tunnel
/// to the named fallback proxy instead. Returns `Ok(true)` if the punch
/// future resolved successfully within the timeout, `Ok(false)` if it
/// timed out and no fallback was configured (the caller then surfaces
/// `Error::Timeout`), or the punch future's own error.
pub async fn punch_or_timeout<F>(punch: F, fallback_timeout: Option<Duration>) -> Result<bool>
where
    F: std::future::Future<Output = Result<()>>,
{
    match fallback_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, punch).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(false),
        },
        None => {
            punch.await?;
            Ok(true)
        }
    }
}

pub type SharedRendezvous = Arc<XtcpRendezvous>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_round_trip() {
        let proof = sign("s3cr3t", "sid-1", 1000);
        assert!(verify("s3cr3t", "sid-1", 1000, &proof));
        assert!(!verify("wrong", "sid-1", 1000, &proof));
    }

    #[test]
    fn deduces_cone_when_ports_match() {
        let nat = NatType::deduce("1.2.3.4:5000", "1.2.3.4:5000");
        assert_eq!(nat, NatType::Cone);
    }

    #[test]
    fn deduces_random_symmetric_when_ports_diverge_widely() {
        let nat = NatType::deduce("1.2.3.4:5000", "1.2.3.4:9999");
        assert_eq!(nat, NatType::RandomSymmetric);
    }

    #[test]
    fn strategy_prefers_fallback_when_both_symmetric_random() {
        let strategy = choose_strategy(NatType::RandomSymmetric, NatType::RandomSymmetric);
        assert_eq!(strategy, PunchStrategy::Fallback);
    }

    #[test]
    fn rendezvous_resolves_once_both_sides_report() {
        let broker = XtcpRendezvous::new();
        broker.open("sid-1".into(), "x".into(), "alice".into());

        let first = broker.report("sid-1", true, "1.2.3.4:1".into()).unwrap();
        assert!(first.is_none());

        let second = broker.report("sid-1", false, "5.6.7.8:2".into()).unwrap();
        assert!(second.is_some());
    }

    #[test]
    fn retry_limiter_enforces_min_interval_and_hourly_cap() {
        let limiter = RetryLimiter::new(2, Duration::from_millis(50));
        assert!(limiter.try_attempt());
        assert!(!limiter.try_attempt(), "too soon after first attempt");
    }

    #[tokio::test]
    async fn punch_or_timeout_falls_back_on_timeout() {
        let never = std::future::pending::<Result<()>>();
        let resolved = punch_or_timeout(never, Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert!(!resolved);
    }

    #[tokio::test]
    async fn punch_or_timeout_succeeds_when_punch_completes() {
        let immediate = async { Ok(()) };
        let resolved = punch_or_timeout(immediate, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(resolved);
    }
}
