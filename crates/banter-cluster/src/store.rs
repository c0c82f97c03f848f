//! Shared store state machine.
//!
//! Both the in-process broker and the TCP broker apply every mutation
//! through [`SharedState::apply`], so lease, TTL, compare-and-swap, and
//! retention-ring semantics are identical no matter which transport a
//! deployment runs. Requests and responses are plain serde enums; the
//! TCP broker ships them as JSON bodies inside request frames.

use std::collections::{HashMap, VecDeque};

use banter_core::InstanceId;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

// ─────────────────────────────────────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────────────────────────────────────

/// A mutation or query against the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum StoreRequest {
    /// Acquire or re-enter a lease on `key` for `ttl_ms`.
    LeaseAcquire {
        key: String,
        holder: InstanceId,
        ttl_ms: u64,
    },
    /// Extend a lease the requester already holds.
    LeaseRenew {
        key: String,
        holder: InstanceId,
        ttl_ms: u64,
    },
    /// Drop a lease if the requester holds it.
    LeaseRelease { key: String, holder: InstanceId },
    /// Write a value, optionally expiring after `ttl_ms`.
    Put {
        key: String,
        value: String,
        ttl_ms: Option<u64>,
    },
    /// Push an existing key's expiry further out.
    ExtendTtl { key: String, ttl_ms: u64 },
    /// Read a value.
    Get { key: String },
    /// Delete a key.
    Remove { key: String },
    /// Write `value` only if the current value equals `expect`
    /// (`None` means the key must be absent).
    CompareAndSwap {
        key: String,
        expect: Option<String>,
        value: String,
        ttl_ms: Option<u64>,
    },
    /// Count live keys sharing a prefix.
    PrefixCount { prefix: String },
    /// Append an event to a channel's retention ring.
    RingAppend {
        channel: String,
        sequence: u64,
        event: String,
    },
    /// Fetch ring entries with sequence greater than `after`.
    RingFetch { channel: String, after: u64 },
}

/// Result of a store request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum StoreResponse {
    /// The request succeeded and carries no data.
    Unit,
    /// A boolean outcome (release, remove, extend).
    Flag { flag: bool },
    /// A read result.
    Value { value: Option<String> },
    /// Outcome of a lease acquire or renew.
    Lease { outcome: LeaseOutcome },
    /// Outcome of a compare-and-swap.
    Swap {
        swapped: bool,
        current: Option<String>,
    },
    /// A prefix count.
    Count { count: u64 },
    /// A retention ring slice.
    Ring { slice: RingSlice },
}

/// Outcome of a lease acquire or renew.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum LeaseOutcome {
    /// The requester holds the lease until the new deadline.
    Granted,
    /// Another instance holds the lease.
    Held { holder: InstanceId },
    /// The lease lapsed or was never held; the requester must re-acquire.
    Lost,
}

/// Contiguous tail of a channel's retention ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RingSlice {
    /// Entries with sequence strictly greater than the requested cursor.
    pub events: Vec<RingEntry>,
    /// Lowest sequence still retained, if the ring is non-empty.
    pub oldest: Option<u64>,
    /// Highest sequence retained, if the ring is non-empty.
    pub newest: Option<u64>,
}

/// One retained event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RingEntry {
    pub sequence: u64,
    /// Serialized event payload, opaque to the store.
    pub event: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// State machine
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct TtlValue {
    value: String,
    expires_at: Option<Instant>,
}

impl TtlValue {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

#[derive(Debug)]
struct LeaseEntry {
    holder: InstanceId,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Ring {
    entries: VecDeque<RingEntry>,
}

/// Authoritative shared state: TTL'd key/value pairs, leases, and
/// per-channel retention rings.
///
/// All operations take an explicit `now` so tests can drive the clock.
#[derive(Debug)]
pub struct SharedState {
    kv: HashMap<String, TtlValue>,
    leases: HashMap<String, LeaseEntry>,
    rings: HashMap<String, Ring>,
    ring_capacity: usize,
}

impl SharedState {
    /// Creates an empty store whose retention rings keep at most
    /// `ring_capacity` events per channel.
    pub fn new(ring_capacity: usize) -> Self {
        Self {
            kv: HashMap::new(),
            leases: HashMap::new(),
            rings: HashMap::new(),
            ring_capacity: ring_capacity.max(1),
        }
    }

    /// Applies one request and returns its response.
    pub fn apply(&mut self, request: StoreRequest, now: Instant) -> StoreResponse {
        match request {
            StoreRequest::LeaseAcquire {
                key,
                holder,
                ttl_ms,
            } => StoreResponse::Lease {
                outcome: self.lease_acquire(key, holder, ttl_ms, now),
            },
            StoreRequest::LeaseRenew {
                key,
                holder,
                ttl_ms,
            } => StoreResponse::Lease {
                outcome: self.lease_renew(&key, &holder, ttl_ms, now),
            },
            StoreRequest::LeaseRelease { key, holder } => StoreResponse::Flag {
                flag: self.lease_release(&key, &holder, now),
            },
            StoreRequest::Put { key, value, ttl_ms } => {
                let expires_at = ttl_ms.map(|ms| now + std::time::Duration::from_millis(ms));
                let _ = self.kv.insert(key, TtlValue { value, expires_at });
                StoreResponse::Unit
            }
            StoreRequest::ExtendTtl { key, ttl_ms } => {
                let flag = match self.kv.get_mut(&key) {
                    Some(entry) if entry.live(now) => {
                        entry.expires_at =
                            Some(now + std::time::Duration::from_millis(ttl_ms));
                        true
                    }
                    _ => {
                        let _ = self.kv.remove(&key);
                        false
                    }
                };
                StoreResponse::Flag { flag }
            }
            StoreRequest::Get { key } => StoreResponse::Value {
                value: self.get_live(&key, now).map(str::to_owned),
            },
            StoreRequest::Remove { key } => {
                let existed = self
                    .kv
                    .remove(&key)
                    .is_some_and(|entry| entry.live(now));
                StoreResponse::Flag { flag: existed }
            }
            StoreRequest::CompareAndSwap {
                key,
                expect,
                value,
                ttl_ms,
            } => {
                let current = self.get_live(&key, now).map(str::to_owned);
                if current == expect {
                    let expires_at =
                        ttl_ms.map(|ms| now + std::time::Duration::from_millis(ms));
                    let _ = self.kv.insert(
                        key,
                        TtlValue {
                            value: value.clone(),
                            expires_at,
                        },
                    );
                    StoreResponse::Swap {
                        swapped: true,
                        current: Some(value),
                    }
                } else {
                    StoreResponse::Swap {
                        swapped: false,
                        current,
                    }
                }
            }
            StoreRequest::PrefixCount { prefix } => {
                let count = self
                    .kv
                    .iter()
                    .filter(|(key, entry)| key.starts_with(&prefix) && entry.live(now))
                    .count() as u64;
                StoreResponse::Count { count }
            }
            StoreRequest::RingAppend {
                channel,
                sequence,
                event,
            } => {
                let ring = self.rings.entry(channel).or_default();
                ring.entries.push_back(RingEntry { sequence, event });
                while ring.entries.len() > self.ring_capacity {
                    let _ = ring.entries.pop_front();
                }
                StoreResponse::Unit
            }
            StoreRequest::RingFetch { channel, after } => {
                let slice = match self.rings.get(&channel) {
                    Some(ring) => RingSlice {
                        events: ring
                            .entries
                            .iter()
                            .filter(|entry| entry.sequence > after)
                            .cloned()
                            .collect(),
                        oldest: ring.entries.front().map(|entry| entry.sequence),
                        newest: ring.entries.back().map(|entry| entry.sequence),
                    },
                    None => RingSlice {
                        events: Vec::new(),
                        oldest: None,
                        newest: None,
                    },
                };
                StoreResponse::Ring { slice }
            }
        }
    }

    /// Drops expired keys and leases. The brokers run this on a timer so
    /// dead sessions do not pile up between reads.
    pub fn purge_expired(&mut self, now: Instant) {
        self.kv.retain(|_, entry| entry.live(now));
        self.leases.retain(|_, lease| lease.expires_at > now);
    }

    /// Number of live keys, for broker introspection.
    pub fn len(&self, now: Instant) -> usize {
        self.kv.values().filter(|entry| entry.live(now)).count()
    }

    fn get_live(&self, key: &str, now: Instant) -> Option<&str> {
        self.kv
            .get(key)
            .filter(|entry| entry.live(now))
            .map(|entry| entry.value.as_str())
    }

    fn lease_acquire(
        &mut self,
        key: String,
        holder: InstanceId,
        ttl_ms: u64,
        now: Instant,
    ) -> LeaseOutcome {
        let ttl = std::time::Duration::from_millis(ttl_ms);
        match self.leases.get(&key) {
            Some(lease) if lease.expires_at > now && lease.holder != holder => {
                LeaseOutcome::Held {
                    holder: lease.holder.clone(),
                }
            }
            _ => {
                let _ = self.leases.insert(
                    key,
                    LeaseEntry {
                        holder,
                        expires_at: now + ttl,
                    },
                );
                LeaseOutcome::Granted
            }
        }
    }

    fn lease_renew(
        &mut self,
        key: &str,
        holder: &InstanceId,
        ttl_ms: u64,
        now: Instant,
    ) -> LeaseOutcome {
        match self.leases.get_mut(key) {
            Some(lease) if lease.expires_at > now => {
                if lease.holder == *holder {
                    lease.expires_at = now + std::time::Duration::from_millis(ttl_ms);
                    LeaseOutcome::Granted
                } else {
                    LeaseOutcome::Held {
                        holder: lease.holder.clone(),
                    }
                }
            }
            _ => {
                let _ = self.leases.remove(key);
                LeaseOutcome::Lost
            }
        }
    }

    fn lease_release(&mut self, key: &str, holder: &InstanceId, now: Instant) -> bool {
        match self.leases.get(key) {
            Some(lease) if lease.holder == *holder && lease.expires_at > now => {
                let _ = self.leases.remove(key);
                true
            }
            _ => false,
        }
    }
}
