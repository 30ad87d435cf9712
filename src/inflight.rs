//! De-duplication of concurrent fetches for the same key.

use crate::error::ChatError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, ChatError>>>;

/// Table of outstanding fetches. A second caller for a key that is already
/// being fetched awaits the first caller's future instead of starting its own.
pub struct InFlight<K, V>
where
    K: Eq + Hash,
{
    pending: Arc<DashMap<K, SharedFetch<V>>>,
}

impl<K, V> Clone for InFlight<K, V>
where
    K: Eq + Hash,
{
    fn clone(&self) -> Self {
        Self {
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<K, V> Default for InFlight<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> InFlight<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
        }
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    /// Runs `fetch` unless a fetch for `key` is already outstanding, in which
    /// case that one is joined. `fetch` is only called when a new request is
    /// actually issued. The entry is cleared as soon as the fetch settles, so
    /// failures are never remembered.
    pub async fn run<F>(&self, key: K, fetch: F) -> Result<V, ChatError>
    where
        F: FnOnce() -> BoxFuture<'static, Result<V, ChatError>>,
    {
        let shared = match self.pending.entry(key.clone()) {
            Entry::Occupied(existing) => {
                log::debug!("Joining in-flight request for {:?}", key);
                existing.get().clone()
            }
            Entry::Vacant(slot) => {
                let pending = Arc::clone(&self.pending);
                let request = fetch();
                let settle_key = key.clone();
                let shared = async move {
                    let result = request.await;
                    pending.remove(&settle_key);
                    result
                }
                .boxed()
                .shared();
                slot.insert(shared.clone());
                shared
            }
        };
        shared.await
    }
}
