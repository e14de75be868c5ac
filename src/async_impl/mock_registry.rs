//! A schema registry kept in memory, for tests and for running without a registry.
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};

use crate::async_impl::registry_client::RegistryTransport;
use crate::error::{ErrorKind, SRCError};

/// Assigns ids starting at 1. Like the real registry, registering a schema that is already known,
/// under any subject, gives back the id it already has.
///
/// Counts the calls it gets, and can be told to fail, so tests can check when the remote side
/// is reached.
pub struct InMemoryRegistry {
    ids: DashMap<String, u32>,
    schemas: DashMap<u32, String>,
    subjects: DashMap<String, Vec<u32>>,
    next_id: AtomicU32,
    register_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    failures: AtomicUsize,
    delay: Option<Duration>,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        InMemoryRegistry::new()
    }
}

impl InMemoryRegistry {
    pub fn new() -> InMemoryRegistry {
        InMemoryRegistry {
            ids: DashMap::new(),
            schemas: DashMap::new(),
            subjects: DashMap::new(),
            next_id: AtomicU32::new(1),
            register_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Every call waits this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> InMemoryRegistry {
        self.delay = Some(delay);
        self
    }

    /// Registers directly, without counting it as a call.
    pub fn add(&self, subject: &str, schema: &str) -> u32 {
        let id = *self
            .ids
            .entry(String::from(schema))
            .or_insert_with(|| self.next_id.fetch_add(1, Ordering::SeqCst));
        self.schemas
            .entry(id)
            .or_insert_with(|| String::from(schema));
        let mut versions = self.subjects.entry(String::from(subject)).or_default();
        if !versions.contains(&id) {
            versions.push(id);
        }
        id
    }

    /// The next `n` calls, of either kind, fail with a retriable transport error.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn register_calls(&self) -> usize {
        self.register_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Ids registered under the subject, oldest first.
    pub fn versions(&self, subject: &str) -> Vec<u32> {
        self.subjects
            .get(subject)
            .map(|v| v.value().clone())
            .unwrap_or_default()
    }

    async fn answer(&self) -> Result<(), SRCError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            Err(SRCError::retryable_with_cause(
                ErrorKind::Transport,
                "injected failure",
                "http call to schema registry failed",
            ))
        } else {
            Ok(())
        }
    }
}

impl RegistryTransport for InMemoryRegistry {
    fn register<'a>(
        &'a self,
        subject: &'a str,
        schema: &'a str,
    ) -> BoxFuture<'a, Result<u32, SRCError>> {
        async move {
            self.register_calls.fetch_add(1, Ordering::SeqCst);
            self.answer().await?;
            Ok(self.add(subject, schema))
        }
        .boxed()
    }

    fn fetch_by_id(&self, id: u32) -> BoxFuture<'_, Result<String, SRCError>> {
        async move {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            self.answer().await?;
            match self.schemas.get(&id) {
                Some(schema) => Ok(schema.value().clone()),
                None => Err(SRCError::non_retryable_with_cause(
                    ErrorKind::Registry,
                    "40403: Schema not found",
                    "HTTP request to schema registry failed with status 404 Not Found",
                )),
            }
        }
        .boxed()
    }
}
