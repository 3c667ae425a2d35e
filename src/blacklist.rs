//! Time-bounded instance exclusion.
//!
//! Parallel to the circuit breaker but externally driven: the error policy
//! (and admin surface) adds entries, a background sweep removes expired
//! ones, and a permanent entry only leaves through an explicit removal.
//! Lookup is a single concurrent-map probe on the pick path.

use crate::events::{emit, EventHandler, GatewayEvent};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// One exclusion entry.
#[derive(Debug, Clone)]
pub struct BlacklistEntry {
    /// The excluded instance.
    pub instance_id: String,
    /// Why it was excluded.
    pub reason: String,
    /// When the entry was added.
    pub entered_at: Instant,
    /// When it expires; `None` means permanent.
    pub expires_at: Option<Instant>,
}

impl BlacklistEntry {
    /// Whether this entry never expires on its own.
    pub fn is_permanent(&self) -> bool {
        self.expires_at.is_none()
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|t| Instant::now() >= t)
    }
}

/// Serializable view of an entry for metrics snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct BlacklistEntrySnapshot {
    /// The excluded instance.
    pub instance_id: String,
    /// Why it was excluded.
    pub reason: String,
    /// Remaining milliseconds, `None` for permanent entries.
    pub remaining_ms: Option<u64>,
}

/// The exclusion list for one virtual model's instances.
pub struct Blacklist {
    entries: DashMap<String, BlacklistEntry>,
    events: Option<Arc<dyn EventHandler>>,
}

impl Blacklist {
    /// Create an empty blacklist.
    pub fn new(events: Option<Arc<dyn EventHandler>>) -> Self {
        Self {
            entries: DashMap::new(),
            events,
        }
    }

    /// Exclude an instance for `duration`, or permanently when `None`.
    ///
    /// Re-adding keeps the longer sentence: a permanent entry is never
    /// downgraded to a timed one, and a live timed entry is only ever
    /// extended. Only [`remove`](Self::remove) shortens a sentence.
    pub fn add(&self, instance_id: &str, reason: impl Into<String>, duration: Option<Duration>) {
        let reason = reason.into();
        let expires_at = duration.map(|d| Instant::now() + d);

        match self.entries.entry(instance_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get();
                let keep_existing = !existing.is_expired()
                    && match (existing.expires_at, expires_at) {
                        (None, _) => true,
                        (Some(_), None) => false,
                        (Some(old), Some(new)) => old >= new,
                    };
                if keep_existing {
                    tracing::debug!(
                        instance = instance_id,
                        %reason,
                        "already blacklisted with a longer sentence; keeping it"
                    );
                    return;
                }
                occupied.insert(BlacklistEntry {
                    instance_id: instance_id.to_string(),
                    reason: reason.clone(),
                    entered_at: Instant::now(),
                    expires_at,
                });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(BlacklistEntry {
                    instance_id: instance_id.to_string(),
                    reason: reason.clone(),
                    entered_at: Instant::now(),
                    expires_at,
                });
            }
        }

        tracing::warn!(
            instance = instance_id,
            %reason,
            permanent = duration.is_none(),
            "instance blacklisted"
        );
        emit(
            &self.events,
            GatewayEvent::InstanceBlacklisted {
                instance_id: instance_id.to_string(),
                reason,
                duration,
            },
        );
    }

    /// Remove an instance (admin call; the only way out for permanent
    /// entries). Returns whether an entry was present.
    pub fn remove(&self, instance_id: &str) -> bool {
        let removed = self.entries.remove(instance_id).is_some();
        if removed {
            emit(
                &self.events,
                GatewayEvent::InstanceUnblacklisted {
                    instance_id: instance_id.to_string(),
                },
            );
        }
        removed
    }

    /// Whether the instance is currently excluded.
    ///
    /// Expired entries are treated as absent even before the sweeper gets
    /// to them, so a stale entry can never block a pick.
    pub fn contains(&self, instance_id: &str) -> bool {
        match self.entries.get(instance_id) {
            Some(entry) => !entry.is_expired(),
            None => false,
        }
    }

    /// Number of live entries (expired-but-unswept excluded).
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_expired()).count()
    }

    /// Whether no live entries exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove expired entries. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        let events = &self.events;
        self.entries.retain(|instance_id, entry| {
            let keep = !entry.is_expired();
            if !keep {
                tracing::debug!(instance = %instance_id, "blacklist entry expired");
                emit(
                    events,
                    GatewayEvent::InstanceUnblacklisted {
                        instance_id: instance_id.clone(),
                    },
                );
            }
            keep
        });
        before - self.entries.len()
    }

    /// Snapshot of live entries for metrics.
    pub fn snapshot(&self) -> Vec<BlacklistEntrySnapshot> {
        self.entries
            .iter()
            .filter(|entry| !entry.is_expired())
            .map(|entry| BlacklistEntrySnapshot {
                instance_id: entry.instance_id.clone(),
                reason: entry.reason.clone(),
                remaining_ms: entry
                    .expires_at
                    .map(|t| t.saturating_duration_since(Instant::now()).as_millis() as u64),
            })
            .collect()
    }

    /// Spawn the periodic expiry sweep; stops when the token cancels.
    ///
    /// No-op outside a tokio runtime — [`contains`](Self::contains) treats
    /// expired entries as absent regardless, the sweep only reclaims memory.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let blacklist = self;
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        blacklist.sweep();
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for Blacklist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blacklist")
            .field("entries", &self.entries.len())
            .finish()
    }
}
