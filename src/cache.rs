//! Response Cache with single-flight generation per fingerprint.
//!
//! `get_or_begin` atomically claims a fingerprint: the first caller gets a
//! [`Lease`] and must settle it with [`ResponseCache::complete`] or
//! [`ResponseCache::fail`]; concurrent callers get a [`WaitHandle`] that
//! resolves when the leaseholder settles. A lease dropped without being
//! settled is abandoned, and its waiters are told to retry. A lease pending
//! longer than `max_pending` releases its waiters with a retry signal and can
//! be taken over by the next caller.

use crate::error::QueryError;
use crate::types::*;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

/// Deterministic identity of a cacheable query
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// SHA-256 over normalized text, structured filters, intent kind and
    /// parameters, plus a coarse time bucket for time-sensitive intents.
    pub fn compute(
        query: &Query,
        intent: &ClassifiedIntent,
        now: DateTime<Utc>,
        bucket: Duration,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(intent.normalized_text.as_bytes());
        hasher.update(b"\n");
        if let Some(filters) = &query.filters {
            hasher.update(serde_json::to_string(filters).unwrap_or_default().as_bytes());
        }
        hasher.update(b"\n");
        hasher.update(intent.kind.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(serde_json::to_string(&intent.parameters).unwrap_or_default().as_bytes());
        if intent.is_time_sensitive() {
            let secs = bucket.as_secs().max(1) as i64;
            hasher.update(format!("\nbucket:{}", now.timestamp().div_euclid(secs)).as_bytes());
        }
        Fingerprint(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0[..self.0.len().min(12)])
    }
}

/// An answer as stored in and served from the cache
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedResponse {
    pub answer: String,
    pub intent_kind: IntentKind,
    pub used_fallback: bool,
    pub truncated: bool,
    pub status: ResponseStatus,
    pub caveat: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    #[serde(rename = "static_ttl_secs", with = "secs")]
    pub static_ttl: Duration,
    /// TTL for time-sensitive intents
    #[serde(rename = "volatile_ttl_secs", with = "secs")]
    pub volatile_ttl: Duration,
    #[serde(rename = "max_pending_secs", with = "secs")]
    pub max_pending: Duration,
    #[serde(rename = "time_bucket_secs", with = "secs")]
    pub time_bucket: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            static_ttl: Duration::from_secs(3600),
            volatile_ttl: Duration::from_secs(300),
            max_pending: Duration::from_secs(120),
            time_bucket: Duration::from_secs(900),
        }
    }
}

impl CachePolicy {
    pub fn ttl_for(&self, intent: &ClassifiedIntent) -> Duration {
        if intent.is_time_sensitive() {
            self.volatile_ttl
        } else {
            self.static_ttl
        }
    }
}

pub(crate) mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[derive(Debug, Clone)]
enum LeaseState {
    Pending,
    Ready(Arc<CachedResponse>),
    Failed(QueryError),
    /// Leaseholder went away or overran; waiters should retry
    Abandoned,
}

enum Slot {
    Pending {
        lease_id: u64,
        started: Instant,
        tx: watch::Sender<LeaseState>,
    },
    Ready {
        answer: Arc<CachedResponse>,
        created_at: Instant,
        expires_at: Instant,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Pending,
    Ready,
}

/// Inspection view of one cache entry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryInfo {
    pub state: EntryState,
    pub created_at: Instant,
    pub expires_at: Option<Instant>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub pending: usize,
    pub hits: u64,
    pub misses: u64,
    /// Lookups that joined an in-flight generation
    pub coalesced: u64,
    pub hit_ratio: f64,
}

/// Slots are sharded; claim-or-wait holds only the shard of its own fingerprint.
struct CacheInner {
    slots: DashMap<Fingerprint, Slot>,
    policy: CachePolicy,
    next_lease: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
}

impl CacheInner {
    /// Settle a lease. Returns false if the lease no longer owns its slot.
    fn settle(&self, fingerprint: &Fingerprint, lease_id: u64, outcome: LeaseState, ttl: Duration) -> bool {
        let previous = match self.slots.entry(fingerprint.clone()) {
            Entry::Occupied(mut slot) => {
                let owned = matches!(slot.get(), Slot::Pending { lease_id: id, .. } if *id == lease_id);
                if !owned {
                    return false;
                }
                match &outcome {
                    LeaseState::Ready(answer) => {
                        let now = Instant::now();
                        slot.insert(Slot::Ready {
                            answer: answer.clone(),
                            created_at: now,
                            expires_at: now + ttl,
                        })
                    }
                    _ => slot.remove(),
                }
            }
            Entry::Vacant(_) => return false,
        };
        if let Slot::Pending { tx, .. } = previous {
            tx.send_replace(outcome);
        }
        true
    }

    fn new_lease(self: &Arc<Self>, fingerprint: &Fingerprint, ttl: Duration, now: Instant) -> (Lease, Slot) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        let id = self.next_lease.fetch_add(1, Ordering::Relaxed);
        let (tx, _) = watch::channel(LeaseState::Pending);
        let lease = Lease {
            inner: self.clone(),
            fingerprint: fingerprint.clone(),
            id,
            ttl,
            settled: false,
        };
        (lease, Slot::Pending { lease_id: id, started: now, tx })
    }
}

/// Exclusive right and obligation to produce the answer for one fingerprint
pub struct Lease {
    inner: Arc<CacheInner>,
    fingerprint: Fingerprint,
    id: u64,
    ttl: Duration,
    settled: bool,
}

impl Lease {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("fingerprint", &self.fingerprint)
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.settled
            && self
                .inner
                .settle(&self.fingerprint, self.id, LeaseState::Abandoned, Duration::ZERO)
        {
            debug!(fingerprint = %self.fingerprint, "Abandoned lease released");
        }
    }
}

/// Resolves when the current leaseholder settles
pub struct WaitHandle {
    rx: watch::Receiver<LeaseState>,
    deadline: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Ready(Arc<CachedResponse>),
    Failed(QueryError),
    /// The leaseholder abandoned or overran its lease; call `get_or_begin` again
    Retry,
}

impl WaitHandle {
    pub async fn wait(mut self) -> WaitOutcome {
        loop {
            let state = self.rx.borrow_and_update().clone();
            match state {
                LeaseState::Ready(answer) => return WaitOutcome::Ready(answer),
                LeaseState::Failed(err) => return WaitOutcome::Failed(err),
                LeaseState::Abandoned => return WaitOutcome::Retry,
                LeaseState::Pending => {}
            }
            match tokio::time::timeout_at(self.deadline, self.rx.changed()).await {
                Ok(Ok(())) => continue,
                // Sender gone; the last value tells us how it ended
                Ok(Err(_)) => {
                    return match self.rx.borrow().clone() {
                        LeaseState::Ready(answer) => WaitOutcome::Ready(answer),
                        LeaseState::Failed(err) => WaitOutcome::Failed(err),
                        LeaseState::Pending | LeaseState::Abandoned => WaitOutcome::Retry,
                    };
                }
                Err(_) => return WaitOutcome::Retry,
            }
        }
    }
}

pub enum Lookup {
    Ready(Arc<CachedResponse>),
    Begin(Lease),
    Wait(WaitHandle),
}

impl fmt::Debug for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lookup::Ready(_) => write!(f, "Ready"),
            Lookup::Begin(lease) => write!(f, "Begin({})", lease.fingerprint),
            Lookup::Wait(_) => write!(f, "Wait"),
        }
    }
}

#[derive(Clone)]
pub struct ResponseCache {
    inner: Arc<CacheInner>,
}

impl ResponseCache {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                slots: DashMap::new(),
                policy,
                next_lease: AtomicU64::new(1),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                coalesced: AtomicU64::new(0),
            }),
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.inner.policy
    }

    /// Claim-or-wait on `fingerprint`. `ttl` applies if this caller ends up
    /// holding the lease.
    pub fn get_or_begin(&self, fingerprint: &Fingerprint, ttl: Duration) -> Lookup {
        let now = Instant::now();
        let max_pending = self.inner.policy.max_pending;

        let mut slot = match self.inner.slots.entry(fingerprint.clone()) {
            Entry::Vacant(slot) => {
                let (lease, pending) = self.inner.new_lease(fingerprint, ttl, now);
                slot.insert(pending);
                return Lookup::Begin(lease);
            }
            Entry::Occupied(slot) => slot,
        };

        match slot.get() {
            Slot::Ready { answer, expires_at, .. } if now < *expires_at => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                debug!(fingerprint = %fingerprint, "Cache hit");
                return Lookup::Ready(answer.clone());
            }
            Slot::Pending { started, tx, .. } if now.duration_since(*started) < max_pending => {
                self.inner.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(fingerprint = %fingerprint, "Joining in-flight generation");
                return Lookup::Wait(WaitHandle {
                    rx: tx.subscribe(),
                    deadline: *started + max_pending,
                });
            }
            Slot::Pending { tx, .. } => {
                info!(fingerprint = %fingerprint, "Lease exceeded max pending time, taking over");
                tx.send_replace(LeaseState::Abandoned);
            }
            Slot::Ready { .. } => {
                debug!(fingerprint = %fingerprint, "Cache entry expired");
            }
        }

        let (lease, pending) = self.inner.new_lease(fingerprint, ttl, now);
        slot.insert(pending);
        Lookup::Begin(lease)
    }

    /// Store the answer and release all waiters with it
    pub fn complete(&self, mut lease: Lease, answer: CachedResponse) -> Arc<CachedResponse> {
        lease.settled = true;
        let answer = Arc::new(answer);
        let stored = self.inner.settle(
            &lease.fingerprint,
            lease.id,
            LeaseState::Ready(answer.clone()),
            lease.ttl,
        );
        if !stored {
            debug!(fingerprint = %lease.fingerprint, "Lease lost before completion; answer not cached");
        }
        answer
    }

    /// Remove the pending entry and hand `error` to all waiters. Cancellation
    /// releases waiters with a retry signal instead.
    pub fn fail(&self, mut lease: Lease, error: QueryError) {
        lease.settled = true;
        let outcome = match error {
            QueryError::CancellationRequested => LeaseState::Abandoned,
            err => LeaseState::Failed(err),
        };
        self.inner
            .settle(&lease.fingerprint, lease.id, outcome, Duration::ZERO);
    }

    pub fn entry(&self, fingerprint: &Fingerprint) -> Option<EntryInfo> {
        match &*self.inner.slots.get(fingerprint)? {
            Slot::Pending { started, .. } => Some(EntryInfo {
                state: EntryState::Pending,
                created_at: *started,
                expires_at: None,
            }),
            Slot::Ready { created_at, expires_at, .. } => Some(EntryInfo {
                state: EntryState::Ready,
                created_at: *created_at,
                expires_at: Some(*expires_at),
            }),
        }
    }

    /// Drop expired answers and overrun leases
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let max_pending = self.inner.policy.max_pending;
        let mut purged = 0;
        self.inner.slots.retain(|_, slot| {
            let live = match slot {
                Slot::Ready { expires_at, .. } => now < *expires_at,
                Slot::Pending { started, tx, .. } => {
                    let live = now.duration_since(*started) < max_pending;
                    if !live {
                        tx.send_replace(LeaseState::Abandoned);
                    }
                    live
                }
            };
            purged += usize::from(!live);
            live
        });
        purged
    }

    pub fn stats(&self) -> CacheStats {
        let slots = &self.inner.slots;
        let hits = self.inner.hits.load(Ordering::Relaxed);
        let misses = self.inner.misses.load(Ordering::Relaxed);
        let coalesced = self.inner.coalesced.load(Ordering::Relaxed);
        let lookups = hits + misses + coalesced;
        CacheStats {
            entries: slots.len(),
            pending: slots
                .iter()
                .filter(|slot| matches!(slot.value(), Slot::Pending { .. }))
                .count(),
            hits,
            misses,
            coalesced,
            hit_ratio: if lookups == 0 {
                0.0
            } else {
                (hits + coalesced) as f64 / lookups as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::QueryClassifier;

    fn fp(name: &str) -> Fingerprint {
        Fingerprint(name.to_string())
    }

    fn answer(text: &str) -> CachedResponse {
        CachedResponse {
            answer: text.to_string(),
            intent_kind: IntentKind::Spatial,
            used_fallback: false,
            truncated: false,
            status: ResponseStatus::Answered,
            caveat: None,
        }
    }

    fn cache() -> ResponseCache {
        ResponseCache::new(CachePolicy::default())
    }

    fn begin(cache: &ResponseCache, f: &Fingerprint) -> Lease {
        match cache.get_or_begin(f, Duration::from_secs(60)) {
            Lookup::Begin(lease) => lease,
            other => panic!("expected lease, got {:?}", other),
        }
    }

    fn wait(cache: &ResponseCache, f: &Fingerprint) -> WaitHandle {
        match cache.get_or_begin(f, Duration::from_secs(60)) {
            Lookup::Wait(handle) => handle,
            other => panic!("expected wait, got {:?}", other),
        }
    }

    #[test]
    fn fingerprint_is_deterministic_and_bucketed() {
        let classifier = QueryClassifier::default();
        let query = Query::new("Salinity  Arabian Sea March 2023", "a");
        let other_session = Query::new("salinity arabian sea march 2023?", "b");
        let intent = classifier.classify(&query);
        let now = Utc::now();
        let bucket = Duration::from_secs(900);

        assert_eq!(
            Fingerprint::compute(&query, &intent, now, bucket),
            Fingerprint::compute(&other_session, &classifier.classify(&other_session), now, bucket)
        );

        // time-sensitive intents change fingerprint across buckets
        let latest = Query::new("latest temperature profiles from 2024-01-01 to 2024-01-31", "a");
        let latest_intent = classifier.classify(&latest);
        assert!(latest_intent.is_time_sensitive());
        let later = now + chrono::Duration::seconds(3600);
        assert_ne!(
            Fingerprint::compute(&latest, &latest_intent, now, bucket),
            Fingerprint::compute(&latest, &latest_intent, later, bucket)
        );
    }

    #[tokio::test]
    async fn single_flight_then_ready() {
        let cache = cache();
        let f = fp("salinity");
        let lease = begin(&cache, &f);
        let waiter = wait(&cache, &f);
        assert_eq!(cache.entry(&f).unwrap().state, EntryState::Pending);

        let stored = cache.complete(lease, answer("36.12 PSU"));
        assert_eq!(waiter.wait().await, WaitOutcome::Ready(stored.clone()));

        let info = cache.entry(&f).unwrap();
        assert_eq!(info.state, EntryState::Ready);
        assert!(info.expires_at.unwrap() > info.created_at);
        assert!(matches!(cache.get_or_begin(&f, Duration::from_secs(60)), Lookup::Ready(a) if a == stored));
    }

    #[tokio::test]
    async fn failure_reaches_waiters_and_clears_entry() {
        let cache = cache();
        let f = fp("broken");
        let lease = begin(&cache, &f);
        let waiter = wait(&cache, &f);

        cache.fail(lease, QueryError::GenerationFailed("model 500".into()));
        assert_eq!(
            waiter.wait().await,
            WaitOutcome::Failed(QueryError::GenerationFailed("model 500".into()))
        );
        assert!(cache.entry(&f).is_none());
        // next caller retries cleanly
        assert!(matches!(cache.get_or_begin(&f, Duration::from_secs(60)), Lookup::Begin(_)));
    }

    #[tokio::test]
    async fn dropped_lease_releases_waiters_with_retry() {
        let cache = cache();
        let f = fp("abandoned");
        let lease = begin(&cache, &f);
        let waiter = wait(&cache, &f);
        drop(lease);
        assert_eq!(waiter.wait().await, WaitOutcome::Retry);
        assert!(cache.entry(&f).is_none());
    }

    #[tokio::test]
    async fn cancelled_lease_writes_nothing() {
        let cache = cache();
        let f = fp("cancelled");
        let lease = begin(&cache, &f);
        cache.fail(lease, QueryError::CancellationRequested);
        assert!(cache.entry(&f).is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn overrun_lease_is_taken_over() {
        let cache = ResponseCache::new(CachePolicy {
            max_pending: Duration::from_secs(10),
            ..Default::default()
        });
        let f = fp("slow");
        let stale = begin(&cache, &f);
        let waiter = wait(&cache, &f);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(waiter.wait().await, WaitOutcome::Retry);

        let fresh = begin(&cache, &f);
        // the stale holder finishing late must not clobber the new lease
        cache.complete(stale, answer("late"));
        assert_eq!(cache.entry(&f).unwrap().state, EntryState::Pending);
        cache.complete(fresh, answer("fresh"));
        assert!(matches!(cache.get_or_begin(&f, Duration::from_secs(60)), Lookup::Ready(a) if a.answer == "fresh"));
    }

    #[tokio::test(start_paused = true)]
    async fn ready_entries_expire() {
        let cache = cache();
        let f = fp("volatile");
        let lease = match cache.get_or_begin(&f, Duration::from_secs(30)) {
            Lookup::Begin(lease) => lease,
            other => panic!("expected lease, got {:?}", other),
        };
        cache.complete(lease, answer("warm"));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(matches!(cache.get_or_begin(&f, Duration::from_secs(30)), Lookup::Ready(_)));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert!(matches!(cache.get_or_begin(&f, Duration::from_secs(30)), Lookup::Begin(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn claim_is_atomic_across_threads() {
        let cache = cache();
        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    let shared = cache.get_or_begin(&fp("shared"), Duration::from_secs(60));
                    let own = cache.get_or_begin(&fp(&format!("own-{i}")), Duration::from_secs(60));
                    (shared, own)
                })
            })
            .collect();

        let mut lookups = Vec::new();
        for task in tasks {
            lookups.push(task.await.unwrap());
        }
        let leases = lookups.iter().filter(|(s, _)| matches!(s, Lookup::Begin(_))).count();
        let waits = lookups.iter().filter(|(s, _)| matches!(s, Lookup::Wait(_))).count();
        assert_eq!((leases, waits), (1, 31));
        assert!(lookups.iter().all(|(_, own)| matches!(own, Lookup::Begin(_))));
        assert_eq!(cache.stats().pending, 33);
    }

    #[test]
    fn ttl_policy_by_intent() {
        let policy = CachePolicy::default();
        let classifier = QueryClassifier::default();
        let temporal = classifier.classify(&Query::new("salinity in 2022", "s"));
        let lookup = classifier.classify(&Query::new("show float 2902746", "s"));
        assert_eq!(policy.ttl_for(&temporal), policy.volatile_ttl);
        assert_eq!(policy.ttl_for(&lookup), policy.static_ttl);
        assert!(policy.volatile_ttl < policy.static_ttl);
    }

    #[tokio::test]
    async fn hit_ratio_counts_lookups() {
        let cache = cache();
        let f = fp("ratio");
        let lease = begin(&cache, &f);
        cache.complete(lease, answer("x"));
        for _ in 0..3 {
            assert!(matches!(cache.get_or_begin(&f, Duration::from_secs(60)), Lookup::Ready(_)));
        }
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (3, 1));
        assert!((stats.hit_ratio - 0.75).abs() < 1e-9);
    }
}
