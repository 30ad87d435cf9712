//! In-memory snapshot store keyed by [`KeyPath`].
//!
//! One `CacheStore` lives for the whole application session and is shared by
//! cloning (all clones see the same entries). Values of any type are stored;
//! reads name the type they expect. Every mutation happens synchronously under
//! a single lock; [`CacheStore::transaction`] batches several mutations under
//! one acquisition so readers never observe a half-applied batch.

use crate::error::ChatError;
use crate::query_keys::KeyPath;
use dashmap::DashSet;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Stale time for data that is only refreshed by explicit invalidation.
pub const NEVER_STALE: Duration = Duration::MAX;

const EVENT_CAPACITY: usize = 256;

/// A typed snapshot read out of the store.
#[derive(Clone, Debug)]
pub struct CacheEntry<T> {
    pub key: KeyPath,
    pub value: T,
    pub fetched_at: Instant,
    pub stale_time: Duration,
    pub invalidated: bool,
}

impl<T> CacheEntry<T> {
    pub fn is_stale(&self) -> bool {
        self.invalidated || self.fetched_at.elapsed() > self.stale_time
    }
}

/// Change notifications for subscribed views.
#[derive(Clone, Debug, PartialEq)]
pub enum CacheEvent {
    Updated(KeyPath),
    Invalidated(KeyPath),
    Removed(KeyPath),
    Moved { from: KeyPath, to: KeyPath },
    /// An optimistic change was rolled back.
    MutationFailed { key: KeyPath, reason: String },
}

struct Slot {
    value: Arc<dyn Any + Send + Sync>,
    fetched_at: Instant,
    stale_time: Duration,
    invalidated: bool,
}

impl Slot {
    fn is_stale(&self) -> bool {
        self.invalidated || self.fetched_at.elapsed() > self.stale_time
    }

    fn read<T: Clone + 'static>(&self, key: &KeyPath) -> Option<CacheEntry<T>> {
        let value = self.value.downcast_ref::<T>()?.clone();
        Some(CacheEntry {
            key: key.clone(),
            value,
            fetched_at: self.fetched_at,
            stale_time: self.stale_time,
            invalidated: self.invalidated,
        })
    }
}

/// Exclusive access to the store for a batch of changes, obtained through
/// [`CacheStore::transaction`].
///
/// Events are queued and published once the batch is done and the lock is
/// released.
pub struct Transaction<'a> {
    entries: &'a mut HashMap<KeyPath, Slot>,
    events: Vec<CacheEvent>,
}

impl Transaction<'_> {
    pub fn get<T: Clone + 'static>(&self, key: impl Into<KeyPath>) -> Option<CacheEntry<T>> {
        let key = key.into();
        let slot = self.entries.get(&key)?;
        let entry = slot.read::<T>(&key);
        if entry.is_none() {
            log::warn!("Cache entry {} holds a different type than requested", key);
        }
        entry
    }

    pub fn contains(&self, key: impl Into<KeyPath>) -> bool {
        self.entries.contains_key(&key.into())
    }

    pub fn set<T: Send + Sync + 'static>(
        &mut self,
        key: impl Into<KeyPath>,
        value: T,
        stale_time: Duration,
    ) {
        let key = key.into();
        log::debug!("Cache set {}", key);
        self.entries.insert(
            key.clone(),
            Slot {
                value: Arc::new(value),
                fetched_at: Instant::now(),
                stale_time,
                invalidated: false,
            },
        );
        self.events.push(CacheEvent::Updated(key));
    }

    pub fn invalidate(&mut self, prefix: impl Into<KeyPath>) -> usize {
        let prefix = prefix.into();
        let mut count = 0;
        for (key, slot) in self.entries.iter_mut() {
            if key.starts_with(&prefix) {
                slot.invalidated = true;
                count += 1;
            }
        }
        log::debug!("Invalidated {} cache entries under {}", count, prefix);
        if count > 0 {
            self.events.push(CacheEvent::Invalidated(prefix));
        }
        count
    }

    pub fn update<T, F>(&mut self, key: impl Into<KeyPath>, f: F) -> bool
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(&mut T) -> bool,
    {
        let key = key.into();
        let Some(slot) = self.entries.get_mut(&key) else {
            return false;
        };
        let Some(current) = slot.value.downcast_ref::<T>() else {
            log::warn!("Cache entry {} holds a different type than requested", key);
            return false;
        };
        let mut value = current.clone();
        if !f(&mut value) {
            return false;
        }
        slot.value = Arc::new(value);
        self.events.push(CacheEvent::Updated(key));
        true
    }

    pub fn update_all<T, F>(&mut self, prefix: impl Into<KeyPath>, mut f: F) -> usize
    where
        T: Clone + Send + Sync + 'static,
        F: FnMut(&KeyPath, &mut T) -> bool,
    {
        let prefix = prefix.into();
        let mut count = 0;
        for (key, slot) in self.entries.iter_mut() {
            if !key.starts_with(&prefix) {
                continue;
            }
            let Some(current) = slot.value.downcast_ref::<T>() else {
                continue;
            };
            let mut value = current.clone();
            if f(key, &mut value) {
                slot.value = Arc::new(value);
                self.events.push(CacheEvent::Updated(key.clone()));
                count += 1;
            }
        }
        count
    }

    pub fn remove(&mut self, key: impl Into<KeyPath>) -> bool {
        let key = key.into();
        let removed = self.entries.remove(&key).is_some();
        if removed {
            self.events.push(CacheEvent::Removed(key));
        }
        removed
    }

    pub fn remove_prefix(&mut self, prefix: impl Into<KeyPath>) -> usize {
        let prefix = prefix.into();
        let keys: Vec<KeyPath> = self
            .entries
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .collect();
        for key in &keys {
            self.entries.remove(key);
        }
        log::debug!("Removed {} cache entries under {}", keys.len(), prefix);
        let count = keys.len();
        self.events.extend(keys.into_iter().map(CacheEvent::Removed));
        count
    }

    pub fn move_prefix(
        &mut self,
        from: impl Into<KeyPath>,
        to: impl Into<KeyPath>,
    ) -> Result<usize, ChatError> {
        let from = from.into();
        let to = to.into();
        if from == to {
            return Ok(0);
        }
        let moves: Vec<(KeyPath, KeyPath)> = self
            .entries
            .keys()
            .filter_map(|key| Some((key.clone(), key.replace_prefix(&from, &to)?)))
            .collect();
        if let Some((_, taken)) = moves
            .iter()
            .find(|(_, target)| self.entries.contains_key(target))
        {
            return Err(ChatError::Conflict(format!(
                "cannot move {} to {}: {} is already cached",
                from, to, taken
            )));
        }
        let mut slots = Vec::with_capacity(moves.len());
        for (source, target) in &moves {
            if let Some(slot) = self.entries.remove(source) {
                slots.push((target.clone(), slot));
            }
        }
        self.entries.extend(slots);
        log::info!("Moved {} cache entries from {} to {}", moves.len(), from, to);
        let count = moves.len();
        self.events
            .extend(moves.into_iter().map(|(from, to)| CacheEvent::Moved { from, to }));
        Ok(count)
    }
}

/// Held while a placeholder is being created on the server; released on drop.
#[derive(Debug)]
pub struct CreationClaim {
    creating: Arc<DashSet<i64>>,
    placeholder_id: i64,
}

impl Drop for CreationClaim {
    fn drop(&mut self) {
        self.creating.remove(&self.placeholder_id);
    }
}

struct Inner {
    entries: Mutex<HashMap<KeyPath, Slot>>,
    events: broadcast::Sender<CacheEvent>,
    next_placeholder: AtomicI64,
    creating: Arc<DashSet<i64>>,
}

#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<Inner>,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                events,
                next_placeholder: AtomicI64::new(-1),
                creating: Arc::new(DashSet::new()),
            }),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<KeyPath, Slot>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: CacheEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    /// Allocates a locally unique negative id (-1, -2, ...).
    pub fn next_placeholder_id(&self) -> i64 {
        self.inner.next_placeholder.fetch_sub(1, Ordering::Relaxed)
    }

    /// Marks `placeholder_id` as being created on the server. `None` while
    /// another claim on it is alive.
    pub fn claim_creation(&self, placeholder_id: i64) -> Option<CreationClaim> {
        if !self.inner.creating.insert(placeholder_id) {
            return None;
        }
        Some(CreationClaim {
            creating: Arc::clone(&self.inner.creating),
            placeholder_id,
        })
    }

    pub fn is_being_created(&self, placeholder_id: i64) -> bool {
        self.inner.creating.contains(&placeholder_id)
    }

    /// Runs `f` with the store locked. Readers see either none or all of its
    /// changes. `f` must not call back into the store.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut Transaction<'_>) -> R) -> R {
        let (result, events) = {
            let mut entries = self.entries();
            let mut txn = Transaction {
                entries: &mut *entries,
                events: Vec::new(),
            };
            let result = f(&mut txn);
            (result, txn.events)
        };
        for event in events {
            self.emit(event);
        }
        result
    }

    pub fn get<T: Clone + 'static>(&self, key: impl Into<KeyPath>) -> Option<CacheEntry<T>> {
        let key = key.into();
        let entries = self.entries();
        let slot = entries.get(&key)?;
        let entry = slot.read::<T>(&key);
        if entry.is_none() {
            log::warn!("Cache entry {} holds a different type than requested", key);
        }
        entry
    }

    pub fn contains(&self, key: impl Into<KeyPath>) -> bool {
        self.entries().contains_key(&key.into())
    }

    /// Overwrites the value and resets `fetched_at`.
    pub fn set<T: Send + Sync + 'static>(
        &self,
        key: impl Into<KeyPath>,
        value: T,
        stale_time: Duration,
    ) {
        self.transaction(|txn| txn.set(key, value, stale_time))
    }

    /// True when absent, invalidated, or older than its stale time.
    pub fn is_stale(&self, key: impl Into<KeyPath>) -> bool {
        self.entries()
            .get(&key.into())
            .map_or(true, Slot::is_stale)
    }

    /// Marks the entry fresh again without changing its value or notifying.
    /// Used when a refetch returned exactly what was already cached.
    pub fn touch(&self, key: impl Into<KeyPath>) {
        if let Some(slot) = self.entries().get_mut(&key.into()) {
            slot.fetched_at = Instant::now();
            slot.invalidated = false;
        }
    }

    /// Marks every entry at or below `prefix` stale. Values stay readable.
    pub fn invalidate(&self, prefix: impl Into<KeyPath>) -> usize {
        self.transaction(|txn| txn.invalidate(prefix))
    }

    /// Mutates a cached value in place. `f` reports whether it changed
    /// anything; only then is the new value stored and subscribers notified.
    /// `fetched_at` is kept: a local edit is not a fetch.
    pub fn update<T, F>(&self, key: impl Into<KeyPath>, f: F) -> bool
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(&mut T) -> bool,
    {
        self.transaction(|txn| txn.update(key, f))
    }

    /// Like [`update`](Self::update) for every entry of type `T` under `prefix`.
    /// Returns the number of entries changed.
    pub fn update_all<T, F>(&self, prefix: impl Into<KeyPath>, f: F) -> usize
    where
        T: Clone + Send + Sync + 'static,
        F: FnMut(&KeyPath, &mut T) -> bool,
    {
        self.transaction(|txn| txn.update_all(prefix, f))
    }

    pub fn remove(&self, key: impl Into<KeyPath>) -> bool {
        self.transaction(|txn| txn.remove(key))
    }

    /// Drops every entry at or below `prefix`.
    pub fn remove_prefix(&self, prefix: impl Into<KeyPath>) -> usize {
        self.transaction(|txn| txn.remove_prefix(prefix))
    }

    /// Re-keys every entry at or below `from` to sit below `to` instead.
    ///
    /// Entries are moved, never copied: afterwards nothing remains under
    /// `from`. Fails with [`ChatError::Conflict`] without touching anything if
    /// any destination key is already occupied.
    pub fn move_prefix(
        &self,
        from: impl Into<KeyPath>,
        to: impl Into<KeyPath>,
    ) -> Result<usize, ChatError> {
        self.transaction(|txn| txn.move_prefix(from, to))
    }

    /// First `Some` that `f` returns for an entry of type `T` under `prefix`.
    pub fn find_map<T, R, F>(&self, prefix: impl Into<KeyPath>, mut f: F) -> Option<R>
    where
        T: 'static,
        F: FnMut(&KeyPath, &T) -> Option<R>,
    {
        let prefix = prefix.into();
        let entries = self.entries();
        let found = entries
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .find_map(|(key, slot)| f(key, slot.value.downcast_ref::<T>()?));
        found
    }

    pub fn keys_with_prefix(&self, prefix: impl Into<KeyPath>) -> Vec<KeyPath> {
        let prefix = prefix.into();
        let mut keys: Vec<KeyPath> = self
            .entries()
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Publishes the explicit failure indicator for a rolled back change.
    pub fn report_failure(&self, key: impl Into<KeyPath>, reason: impl Into<String>) {
        self.emit(CacheEvent::MutationFailed {
            key: key.into(),
            reason: reason.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_keys::QueryKey;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn absent_entries_are_stale() {
        let store = CacheStore::new();
        assert!(store.get::<String>(QueryKey::AgentList).is_none());
        assert!(store.is_stale(QueryKey::AgentList));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_go_stale_after_stale_time() {
        let store = CacheStore::new();
        store.set(QueryKey::AgentList, vec![1_i64, 2], MINUTE);
        assert!(!store.is_stale(QueryKey::AgentList));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.is_stale(QueryKey::AgentList));
        // Still readable for display.
        assert_eq!(
            store.get::<Vec<i64>>(QueryKey::AgentList).unwrap().value,
            vec![1, 2]
        );

        store.set(QueryKey::AgentList, vec![3_i64], MINUTE);
        assert!(!store.is_stale(QueryKey::AgentList));
    }

    #[tokio::test(start_paused = true)]
    async fn never_stale_survives_time() {
        let store = CacheStore::new();
        store.set(QueryKey::MessageTranslation(1), "hi".to_string(), NEVER_STALE);
        tokio::time::advance(Duration::from_secs(86_400 * 365)).await;
        assert!(!store.is_stale(QueryKey::MessageTranslation(1)));
    }

    #[test]
    fn invalidating_a_prefix_reaches_descendants_only() {
        let store = CacheStore::new();
        store.set(QueryKey::Agent(7), "seven", MINUTE);
        store.set(QueryKey::AgentSessions(7), "sessions", MINUTE);
        store.set(QueryKey::session(7, 3), "session", MINUTE);
        store.set(QueryKey::Agent(8), "eight", MINUTE);

        let count = store.invalidate(QueryKey::Agent(7));

        assert_eq!(count, 3);
        assert!(store.is_stale(QueryKey::AgentSessions(7)));
        assert!(store.is_stale(QueryKey::session(7, 3)));
        assert!(!store.is_stale(QueryKey::Agent(8)));
        assert!(store.get::<&'static str>(QueryKey::session(7, 3)).is_some());
    }

    #[test]
    fn type_mismatch_reads_as_absent() {
        let store = CacheStore::new();
        store.set(QueryKey::Agent(1), 5_u32, MINUTE);
        assert!(store.get::<String>(QueryKey::Agent(1)).is_none());
        assert_eq!(store.get::<u32>(QueryKey::Agent(1)).unwrap().value, 5);
    }

    #[test]
    fn update_only_notifies_on_change() {
        let store = CacheStore::new();
        store.set(QueryKey::AgentList, vec![1_i64], MINUTE);
        let mut events = store.subscribe();

        assert!(!store.update::<Vec<i64>, _>(QueryKey::AgentList, |_| false));
        assert!(store.update::<Vec<i64>, _>(QueryKey::AgentList, |list| {
            list.push(2);
            true
        }));
        assert_eq!(
            events.try_recv().unwrap(),
            CacheEvent::Updated(QueryKey::AgentList.path())
        );
        assert!(events.try_recv().is_err());
        assert_eq!(
            store.get::<Vec<i64>>(QueryKey::AgentList).unwrap().value,
            vec![1, 2]
        );
    }

    #[test]
    fn move_prefix_leaves_nothing_behind() {
        let store = CacheStore::new();
        store.set(QueryKey::session(7, -1), "session", MINUTE);
        store.set(QueryKey::session_messages(7, -1), vec!["hello"], MINUTE);
        store.set(QueryKey::session(7, 5), "other", MINUTE);

        let moved = store
            .move_prefix(QueryKey::session(7, -1), QueryKey::session(7, 42))
            .unwrap();

        assert_eq!(moved, 2);
        assert!(store.keys_with_prefix(QueryKey::session(7, -1)).is_empty());
        assert_eq!(
            store
                .get::<Vec<&'static str>>(QueryKey::session_messages(7, 42))
                .unwrap()
                .value,
            vec!["hello"]
        );
        assert!(store.contains(QueryKey::session(7, 5)));
    }

    #[test]
    fn move_prefix_refuses_to_overwrite() {
        let store = CacheStore::new();
        store.set(QueryKey::session_messages(7, -1), 1_u8, MINUTE);
        store.set(QueryKey::session_messages(7, 42), 2_u8, MINUTE);

        let err = store
            .move_prefix(QueryKey::session(7, -1), QueryKey::session(7, 42))
            .unwrap_err();

        assert!(matches!(err, ChatError::Conflict(_)));
        assert!(store.contains(QueryKey::session_messages(7, -1)));
        assert_eq!(
            store.get::<u8>(QueryKey::session_messages(7, 42)).unwrap().value,
            2
        );
    }

    #[test]
    fn remove_prefix_drops_subtree() {
        let store = CacheStore::new();
        store.set(QueryKey::session(7, 3), 1_u8, MINUTE);
        store.set(QueryKey::session_messages(7, 3), 2_u8, MINUTE);
        store.set(QueryKey::session_messages(7, 4), 3_u8, MINUTE);

        assert_eq!(store.remove_prefix(QueryKey::session(7, 3)), 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn placeholder_ids_count_down() {
        let store = CacheStore::new();
        let clone = store.clone();
        assert_eq!(store.next_placeholder_id(), -1);
        assert_eq!(clone.next_placeholder_id(), -2);
    }

    #[test]
    fn transaction_publishes_after_the_whole_batch() {
        let store = CacheStore::new();
        store.set(QueryKey::session(7, -1), "placeholder", MINUTE);
        store.set(QueryKey::AgentSessions(7), vec![-1_i64, 5], MINUTE);
        let mut events = store.subscribe();

        let moved = store.transaction(|txn| {
            let moved = txn
                .move_prefix(QueryKey::session(7, -1), QueryKey::session(7, 42))
                .unwrap();
            txn.set(QueryKey::session(7, 42), "server", MINUTE);
            txn.update::<Vec<i64>, _>(QueryKey::AgentSessions(7), |ids| {
                ids[0] = 42;
                true
            });
            moved
        });

        assert_eq!(moved, 1);
        assert_eq!(
            events.try_recv().unwrap(),
            CacheEvent::Moved {
                from: QueryKey::session(7, -1).path(),
                to: QueryKey::session(7, 42).path(),
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            CacheEvent::Updated(QueryKey::session(7, 42).path())
        );
        assert_eq!(
            events.try_recv().unwrap(),
            CacheEvent::Updated(QueryKey::AgentSessions(7).path())
        );
        assert_eq!(
            store.get::<Vec<i64>>(QueryKey::AgentSessions(7)).unwrap().value,
            vec![42, 5]
        );
        assert!(!store.contains(QueryKey::session(7, -1)));
    }

    #[test]
    fn creation_claims_are_exclusive_until_dropped() {
        let store = CacheStore::new();
        let claim = store.claim_creation(-1).unwrap();
        assert!(store.is_being_created(-1));
        assert!(store.clone().claim_creation(-1).is_none());
        assert!(store.claim_creation(-2).is_some());

        drop(claim);
        assert!(!store.is_being_created(-1));
        assert!(store.claim_creation(-1).is_some());
    }
}
