//! In memory caches shared by every encoder, decoder and consumer configured with them.
//!
//! Both the id cache and the codec cache are built on [`OnceMap`]: a read first looks at the
//! shard under a shared lock, only on a miss the shard is locked exclusively to check again and
//! put an empty slot in place. Filling the slot happens outside the map lock, but the slot makes
//! sure only one caller per key does the work while the others wait for its result. A failed
//! fill leaves the slot empty, so errors are never cached. There is no eviction.
use std::borrow::Borrow;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::error::SRCError;

pub(crate) struct OnceMap<K, V> {
    entries: DashMap<K, Arc<OnceCell<V>>>,
}

impl<K: Eq + Hash, V: Clone> OnceMap<K, V> {
    pub(crate) fn new() -> OnceMap<K, V> {
        OnceMap {
            entries: DashMap::new(),
        }
    }

    pub(crate) fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries
            .get(key)
            .and_then(|cell| cell.value().get().cloned())
    }

    /// Replaces whatever is stored for the key.
    pub(crate) fn insert(&self, key: K, value: V) {
        self.entries
            .insert(key, Arc::new(OnceCell::new_with(Some(value))));
    }

    /// Only stores the value when nothing is stored for the key yet.
    pub(crate) fn insert_if_absent(&self, key: K, value: V) {
        // an Err means the slot is taken, which is exactly the case to leave alone
        let _ = self.slot(key).set(value);
    }

    /// Returns the stored value, or runs `init` to get it. For one key at most one `init` runs at
    /// a time, concurrent callers wait for it and get its value. When it fails the error is
    /// returned to that caller only, the next caller runs its own `init`.
    pub(crate) async fn get_or_try_init<Q, F, Fut, E>(&self, key: &Q, init: F) -> Result<V, E>
    where
        K: Borrow<Q>,
        Q: ToOwned<Owned = K> + Hash + Eq + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(v) = self.get(key) {
            return Ok(v);
        }
        let slot = self.slot(key.to_owned());
        slot.get_or_try_init(init).await.cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.value().initialized())
            .count()
    }

    fn slot(&self, key: K) -> Arc<OnceCell<V>> {
        Arc::clone(
            self.entries
                .entry(key)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .value(),
        )
    }
}

/// Storage for schema registry information, ids by subject and schema, and schemas by id.
///
/// A schema stored for an id never changes, ids are never reused by the schema registry. The id
/// stored for a subject and schema is the one from the last successful registration.
///
/// ```
/// use schema_registry_stream::cache::CacheSchemaRegistry;
///
/// let cache = CacheSchemaRegistry::new();
/// cache.set_by_subject_and_schema("words", r#""string""#, 1);
///
/// assert_eq!(cache.get_id_by_subject_and_schema("words", r#""string""#), Some(1));
/// assert_eq!(cache.get_by_id(1), Some(String::from(r#""string""#)));
/// ```
pub struct CacheSchemaRegistry {
    ids: OnceMap<(String, String), u32>,
    schemas: OnceMap<u32, String>,
}

impl Default for CacheSchemaRegistry {
    fn default() -> Self {
        CacheSchemaRegistry::new()
    }
}

impl CacheSchemaRegistry {
    pub fn new() -> CacheSchemaRegistry {
        CacheSchemaRegistry {
            ids: OnceMap::new(),
            schemas: OnceMap::new(),
        }
    }

    pub fn get_by_id(&self, id: u32) -> Option<String> {
        self.schemas.get(&id)
    }

    /// Stores the schema for the id, unless a schema is already known for the id.
    pub fn set_schema_by_id(&self, id: u32, schema: &str) {
        self.schemas.insert_if_absent(id, String::from(schema));
    }

    pub fn get_id_by_subject_and_schema(&self, subject: &str, schema: &str) -> Option<u32> {
        self.ids
            .get(&(String::from(subject), String::from(schema)))
    }

    /// Stores the id for the subject and schema, and the schema for the id.
    pub fn set_by_subject_and_schema(&self, subject: &str, schema: &str, id: u32) {
        self.ids
            .insert((String::from(subject), String::from(schema)), id);
        self.set_schema_by_id(id, schema);
    }

    /// Gets the id for the subject and schema, calling `register` when it's not known yet. Callers
    /// racing on the same unseen pair share a single `register` call.
    pub async fn get_or_register_id<F, Fut>(
        &self,
        subject: &str,
        schema: &str,
        register: F,
    ) -> Result<u32, SRCError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<u32, SRCError>>,
    {
        let id = self
            .ids
            .get_or_try_init(&(String::from(subject), String::from(schema)), register)
            .await?;
        self.set_schema_by_id(id, schema);
        Ok(id)
    }

    /// Gets the schema for the id, calling `fetch` when it's not known yet. Callers racing on the
    /// same unseen id share a single `fetch` call.
    pub async fn get_or_fetch_schema<F, Fut>(&self, id: u32, fetch: F) -> Result<String, SRCError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, SRCError>>,
    {
        self.schemas.get_or_try_init(&id, fetch).await
    }

    /// Number of known subject and schema pairs.
    pub fn subject_schema_count(&self) -> usize {
        self.ids.len()
    }

    /// Number of known schemas by id.
    pub fn schema_count(&self) -> usize {
        self.schemas.len()
    }
}
