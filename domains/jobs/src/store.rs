//! Retention of terminal job snapshots
//!
//! Entries expire after a fixed TTL (checked on read and by the periodic
//! purge) and the store is bounded by an LRU capacity where reads refresh
//! recency. An evicted job is indistinguishable from an unknown one.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::domain::entities::JobSnapshot;

#[derive(Debug)]
struct Entry {
    snapshot: JobSnapshot,
    stored_at: Instant,
    recency: u64,
}

#[derive(Debug, Default)]
struct Entries {
    by_id: HashMap<Uuid, Entry>,
    /// recency tick -> id, oldest first
    lru: BTreeMap<u64, Uuid>,
    tick: u64,
}

impl Entries {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, id: &Uuid) -> Option<Entry> {
        let entry = self.by_id.remove(id)?;
        self.lru.remove(&entry.recency);
        Some(entry)
    }

    fn touch(&mut self, id: &Uuid) {
        let tick = self.next_tick();
        if let Some(entry) = self.by_id.get_mut(id) {
            self.lru.remove(&entry.recency);
            entry.recency = tick;
            self.lru.insert(tick, *id);
        }
    }
}

/// Bounded, expiring store of finished jobs
#[derive(Debug)]
pub struct ResultStore {
    ttl: Duration,
    capacity: usize,
    entries: Mutex<Entries>,
}

impl ResultStore {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            entries: Mutex::new(Entries::default()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Store a terminal snapshot, evicting the least recently used entries
    pub fn insert(&self, snapshot: JobSnapshot) {
        self.insert_at(snapshot, Instant::now());
    }

    pub fn get(&self, id: Uuid) -> Option<JobSnapshot> {
        self.get_at(id, Instant::now())
    }

    /// Non-expired snapshots, without refreshing recency
    pub fn snapshots(&self) -> Vec<JobSnapshot> {
        self.snapshots_at(Instant::now())
    }

    /// Drop expired entries; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert_at(&self, snapshot: JobSnapshot, now: Instant) {
        let id = snapshot.job_id;
        let mut entries = self.lock();
        entries.remove(&id);

        while entries.by_id.len() >= self.capacity {
            let Some((_, oldest)) = entries.lru.pop_first() else {
                break;
            };
            entries.by_id.remove(&oldest);
            tracing::debug!(job_id = %oldest, "Result evicted by capacity");
        }

        let recency = entries.next_tick();
        entries.lru.insert(recency, id);
        entries.by_id.insert(
            id,
            Entry {
                snapshot,
                stored_at: now,
                recency,
            },
        );
    }

    fn get_at(&self, id: Uuid, now: Instant) -> Option<JobSnapshot> {
        let mut entries = self.lock();
        let expired = self.is_expired(entries.by_id.get(&id)?, now);
        if expired {
            entries.remove(&id);
            tracing::debug!(job_id = %id, "Result expired");
            return None;
        }
        entries.touch(&id);
        entries.by_id.get(&id).map(|entry| entry.snapshot.clone())
    }

    fn snapshots_at(&self, now: Instant) -> Vec<JobSnapshot> {
        self.lock()
            .by_id
            .values()
            .filter(|entry| !self.is_expired(entry, now))
            .map(|entry| entry.snapshot.clone())
            .collect()
    }

    fn purge_expired_at(&self, now: Instant) -> usize {
        let mut entries = self.lock();
        let expired: Vec<Uuid> = entries
            .by_id
            .iter()
            .filter(|(_, entry)| self.is_expired(entry, now))
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            entries.remove(id);
        }
        expired.len()
    }

    fn is_expired(&self, entry: &Entry, now: Instant) -> bool {
        now.saturating_duration_since(entry.stored_at) >= self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
