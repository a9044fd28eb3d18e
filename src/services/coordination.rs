//! Guards against duplicate submissions and out-of-order quantity writes.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Set of keys with a mutation in flight.
#[derive(Debug)]
pub struct InFlight<K: Eq + Hash + Clone> {
    keys: Arc<DashMap<K, ()>>,
}

impl<K: Eq + Hash + Clone> InFlight<K> {
    pub fn new() -> Self {
        Self {
            keys: Arc::new(DashMap::new()),
        }
    }

    /// Claims `key`, or returns `None` when a mutation for it is already running.
    /// The claim is released when the token drops.
    pub fn try_begin(&self, key: K) -> Option<InFlightToken<K>> {
        match self.keys.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(());
                Some(InFlightToken {
                    keys: self.keys.clone(),
                    key,
                })
            }
        }
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.keys.contains_key(key)
    }
}

impl<K: Eq + Hash + Clone> Default for InFlight<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> Clone for InFlight<K> {
    fn clone(&self) -> Self {
        Self {
            keys: self.keys.clone(),
        }
    }
}

#[derive(Debug)]
pub struct InFlightToken<K: Eq + Hash + Clone> {
    keys: Arc<DashMap<K, ()>>,
    key: K,
}

impl<K: Eq + Hash + Clone> Drop for InFlightToken<K> {
    fn drop(&mut self) {
        self.keys.remove(&self.key);
    }
}

#[derive(Debug, Default)]
struct LineQueue {
    issued: AtomicU64,
    /// Tickets handed out and not yet dropped
    outstanding: AtomicUsize,
    /// Highest ticket whose write reached the store
    applied: Mutex<u64>,
}

/// Orders writes to the same cart line by call order.
///
/// Tickets are handed out synchronously when a mutation is issued. Writes then
/// run one at a time per line, and a write whose ticket is older than one
/// already applied is skipped, so a slow early call never overwrites a later
/// one. A line's entry lives only while it has outstanding tickets, so lines
/// deleted by any path leave nothing behind.
#[derive(Debug, Clone, Default)]
pub struct LineSequencer {
    lines: Arc<DashMap<Uuid, Arc<LineQueue>>>,
}

impl LineSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ticket(&self, line_id: Uuid) -> Ticket {
        let entry = self.lines.entry(line_id).or_default();
        // Counted while the shard is locked so a concurrent release keeps the entry
        entry.outstanding.fetch_add(1, Ordering::SeqCst);
        let queue = entry.value().clone();
        drop(entry);

        let seq = queue.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ticket {
            seq,
            line_id,
            queue,
            lines: self.lines.clone(),
        }
    }
}

#[derive(Debug)]
pub struct Ticket {
    seq: u64,
    line_id: Uuid,
    queue: Arc<LineQueue>,
    lines: Arc<DashMap<Uuid, Arc<LineQueue>>>,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.queue.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.lines.remove_if(&self.line_id, |_, queue| {
            queue.outstanding.load(Ordering::SeqCst) == 0
        });
    }
}

impl Ticket {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Waits until no other write for the line is running.
    pub async fn turn(&self) -> Turn<'_> {
        Turn {
            seq: self.seq,
            applied: self.queue.applied.lock().await,
        }
    }
}

#[derive(Debug)]
pub struct Turn<'a> {
    seq: u64,
    applied: MutexGuard<'a, u64>,
}

impl Turn<'_> {
    /// False when a later mutation of the line has already been applied.
    pub fn is_current(&self) -> bool {
        self.seq > *self.applied
    }

    pub fn commit(mut self) {
        *self.applied = self.seq;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_is_refused_until_release() {
        let in_flight = InFlight::new();
        let user = Uuid::new_v4();

        let token = in_flight.try_begin(user).expect("first claim");
        assert!(in_flight.try_begin(user).is_none());
        assert!(in_flight.is_in_flight(&user));

        drop(token);
        assert!(in_flight.try_begin(user).is_some());
    }

    #[test]
    fn claims_are_per_key() {
        let in_flight = InFlight::new();
        let product_a = (Uuid::new_v4(), Uuid::new_v4());
        let product_b = (product_a.0, Uuid::new_v4());

        let _a = in_flight.try_begin(product_a).unwrap();
        assert!(in_flight.try_begin(product_b).is_some());
    }

    #[tokio::test]
    async fn late_write_of_an_older_ticket_is_skipped() {
        let sequencer = LineSequencer::new();
        let line = Uuid::new_v4();
        let first = sequencer.ticket(line);
        let second = sequencer.ticket(line);
        assert!(second.seq() > first.seq());

        // The later call wins the race to the store
        let turn = second.turn().await;
        assert!(turn.is_current());
        turn.commit();

        let turn = first.turn().await;
        assert!(!turn.is_current());
    }

    #[tokio::test]
    async fn in_order_writes_all_apply() {
        let sequencer = LineSequencer::new();
        let line = Uuid::new_v4();
        let tickets: Vec<_> = (0..3).map(|_| sequencer.ticket(line)).collect();

        for ticket in &tickets {
            let turn = ticket.turn().await;
            assert!(turn.is_current());
            turn.commit();
        }
    }

    #[tokio::test]
    async fn entries_are_released_with_their_last_ticket() {
        let sequencer = LineSequencer::new();
        let line = Uuid::new_v4();
        let first = sequencer.ticket(line);
        let second = sequencer.ticket(line);

        let turn = second.turn().await;
        turn.commit();
        drop(second);
        assert_eq!(sequencer.lines.len(), 1);

        // The older ticket still sees the later write as applied
        assert!(!first.turn().await.is_current());
        drop(first);
        assert!(sequencer.lines.is_empty());

        // Tickets for lines that never existed leave nothing behind either
        drop(sequencer.ticket(Uuid::new_v4()));
        assert!(sequencer.lines.is_empty());
    }

    #[tokio::test]
    async fn lines_are_sequenced_independently() {
        let sequencer = LineSequencer::new();
        let a = sequencer.ticket(Uuid::new_v4());
        let b = sequencer.ticket(Uuid::new_v4());

        let turn_a = a.turn().await;
        let turn_b = b.turn().await;
        assert!(turn_a.is_current() && turn_b.is_current());
    }
}
