use crate::adapters::kv::{KeyValueStore, KvError};
use crate::domain::token::{CustomerRef, TokenRecord};
use crate::error::Result;
use backon::{ExponentialBuilder, Retryable};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct Slot {
    loaded: bool,
    record: Option<TokenRecord>,
    // The in-memory record is ahead of what is on disk
    dirty: bool,
}

/// Durable home of the device's single [`TokenRecord`].
///
/// The store keeps a write-through copy of the record. If persisting fails the
/// in-memory copy still reflects the latest state and the next mutation (or
/// [`TokenStore::flush`]) retries the write.
///
/// Guarded mutations (`mark_registered`, `increment_retry`, `reset_retry`) only
/// apply when the given value is the stored token, so late results for a
/// superseded token never touch the current record.
#[derive(Debug, Clone)]
pub struct TokenStore {
    kv: Arc<dyn KeyValueStore>,
    key: String,
    slot: Arc<Mutex<Slot>>,
}

impl TokenStore {
    #[must_use]
    pub fn new(kv: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self { kv, key: key.into(), slot: Arc::new(Mutex::new(Slot::default())) }
    }

    fn write_backoff() -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(20))
            .with_max_delay(Duration::from_millis(200))
            .with_max_times(2)
    }

    async fn load(&self, slot: &mut Slot) -> Result<()> {
        if slot.loaded {
            return Ok(());
        }

        slot.record = match self.kv.get(&self.key).await? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(error = %e, key = %self.key, "Discarding unreadable token record");
                    None
                }
            },
            None => None,
        };
        slot.loaded = true;
        Ok(())
    }

    async fn persist(&self, slot: &mut Slot) -> std::result::Result<(), KvError> {
        let result = match &slot.record {
            Some(record) => {
                let json = serde_json::to_string(record)?;
                (|| async { self.kv.set(&self.key, &json).await })
                    .retry(Self::write_backoff())
                    .notify(|e, delay| {
                        tracing::debug!(error = %e, ?delay, "Retrying token record write");
                    })
                    .await
            }
            None => self.kv.remove(&self.key).await,
        };
        slot.dirty = result.is_err();
        result
    }

    /// Persists after a guarded mutation. Failures are logged, not returned:
    /// the in-memory record already reflects the change.
    async fn persist_logged(&self, slot: &mut Slot, operation: &'static str) {
        if let Err(e) = self.persist(slot).await {
            tracing::warn!(error = %e, operation, "Token record updated in memory only");
        }
    }

    /// Returns the current record, loading it from persistence on first use.
    ///
    /// # Errors
    /// Returns `Persistence` if the record has never been loaded and the store cannot be read.
    pub async fn read(&self) -> Result<Option<TokenRecord>> {
        let mut slot = self.slot.lock().await;
        self.load(&mut slot).await?;
        Ok(slot.record.clone())
    }

    /// Replaces the record unconditionally and waits for the write to complete.
    ///
    /// # Errors
    /// Returns `Persistence` if the write failed. The record is still the
    /// current one in memory.
    #[tracing::instrument(level = "debug", skip_all, fields(token = %record.redacted()))]
    pub async fn write(&self, record: &TokenRecord) -> Result<()> {
        let mut slot = self.slot.lock().await;
        slot.loaded = true;
        slot.record = Some(record.clone());
        self.persist(&mut slot).await?;
        Ok(())
    }

    /// Marks `value` as acknowledged by the server and resets its retry counter.
    /// Returns `false` without touching anything if `value` is not the stored token.
    ///
    /// # Errors
    /// Returns `Persistence` only if the record could not be loaded.
    pub async fn mark_registered(&self, value: &str) -> Result<bool> {
        let mut slot = self.slot.lock().await;
        self.load(&mut slot).await?;

        let dirty = slot.dirty;
        let Some(record) = slot.record.as_mut().filter(|r| r.value == value) else {
            return Ok(false);
        };

        let changed = !record.registered || record.retry_count != 0;
        record.registered = true;
        record.retry_count = 0;

        if changed || dirty {
            self.persist_logged(&mut slot, "mark_registered").await;
        }
        Ok(true)
    }

    /// Records a failed attempt for `value`. Returns the new counter, or `None`
    /// if `value` is not the stored token.
    ///
    /// # Errors
    /// Returns `Persistence` only if the record could not be loaded.
    pub async fn increment_retry(&self, value: &str) -> Result<Option<u32>> {
        let mut slot = self.slot.lock().await;
        self.load(&mut slot).await?;

        let Some(record) = slot.record.as_mut().filter(|r| r.value == value) else {
            return Ok(None);
        };

        record.retry_count = record.retry_count.saturating_add(1);
        record.last_attempt_at = Some(OffsetDateTime::now_utc());
        let count = record.retry_count;

        self.persist_logged(&mut slot, "increment_retry").await;
        Ok(Some(count))
    }

    /// Zeroes the retry counter of `value` after a cool-down.
    ///
    /// # Errors
    /// Returns `Persistence` only if the record could not be loaded.
    pub async fn reset_retry(&self, value: &str) -> Result<bool> {
        let mut slot = self.slot.lock().await;
        self.load(&mut slot).await?;

        let dirty = slot.dirty;
        let Some(record) = slot.record.as_mut().filter(|r| r.value == value) else {
            return Ok(false);
        };

        if record.retry_count != 0 || dirty {
            record.retry_count = 0;
            self.persist_logged(&mut slot, "reset_retry").await;
        }
        Ok(true)
    }

    /// Associates the stored token with `customer`. When the association
    /// changes the token needs registering again, so the registration flag and
    /// retry counter are reset. Returns whether anything changed.
    ///
    /// # Errors
    /// Returns `Persistence` only if the record could not be loaded.
    pub async fn update_customer(&self, customer: Option<CustomerRef>) -> Result<bool> {
        let mut slot = self.slot.lock().await;
        self.load(&mut slot).await?;

        let Some(record) = slot.record.as_mut().filter(|r| r.customer_ref != customer) else {
            return Ok(false);
        };

        record.customer_ref = customer;
        record.registered = false;
        record.retry_count = 0;

        self.persist_logged(&mut slot, "update_customer").await;
        Ok(true)
    }

    /// Rewrites the record if an earlier write failed.
    ///
    /// # Errors
    /// Returns `Persistence` if the write fails again.
    pub async fn flush(&self) -> Result<bool> {
        let mut slot = self.slot.lock().await;
        if !slot.dirty {
            return Ok(false);
        }
        self.persist(&mut slot).await?;
        tracing::info!("Token record persisted after earlier write failure");
        Ok(true)
    }

    /// Forgets the record entirely.
    ///
    /// # Errors
    /// Returns `Persistence` if the stored key cannot be removed.
    pub async fn clear(&self) -> Result<()> {
        let mut slot = self.slot.lock().await;
        slot.loaded = true;
        slot.record = None;
        self.persist(&mut slot).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::kv::InMemoryKeyValueStore;
    use crate::domain::token::Platform;

    const KEY: &str = "@test/record";

    fn setup() -> (Arc<InMemoryKeyValueStore>, TokenStore) {
        let kv = Arc::new(InMemoryKeyValueStore::new());
        let store = TokenStore::new(kv.clone(), KEY);
        (kv, store)
    }

    fn record(value: &str) -> TokenRecord {
        TokenRecord::new(value, Platform::Android, None)
    }

    #[tokio::test]
    async fn test_write_then_read_from_a_fresh_store() {
        let (kv, store) = setup();
        store.write(&record("tok-a")).await.unwrap();

        let reopened = TokenStore::new(kv, KEY);
        let loaded = reopened.read().await.unwrap().unwrap();
        assert_eq!(loaded.value, "tok-a");
        assert!(!loaded.registered);
    }

    #[tokio::test]
    async fn test_mark_registered_twice_equals_once() {
        let (kv, store) = setup();
        store.write(&record("tok-a")).await.unwrap();
        store.increment_retry("tok-a").await.unwrap();

        assert!(store.mark_registered("tok-a").await.unwrap());
        let once = store.read().await.unwrap();
        let once_raw = kv.get(KEY).await.unwrap();

        assert!(store.mark_registered("tok-a").await.unwrap());
        assert_eq!(store.read().await.unwrap(), once);
        assert_eq!(kv.get(KEY).await.unwrap(), once_raw);

        let once = once.unwrap();
        assert!(once.registered);
        assert_eq!(once.retry_count, 0);
    }

    #[tokio::test]
    async fn test_stale_value_does_not_touch_current_record() {
        let (_kv, store) = setup();
        store.write(&record("tok-a")).await.unwrap();
        store.write(&record("tok-b")).await.unwrap();

        assert!(!store.mark_registered("tok-a").await.unwrap());
        assert_eq!(store.increment_retry("tok-a").await.unwrap(), None);
        assert!(!store.reset_retry("tok-a").await.unwrap());

        let current = store.read().await.unwrap().unwrap();
        assert_eq!(current.value, "tok-b");
        assert!(!current.registered);
        assert_eq!(current.retry_count, 0);
    }

    #[tokio::test]
    async fn test_increment_counts_and_stamps_attempt_time() {
        let (_kv, store) = setup();
        store.write(&record("tok-a")).await.unwrap();

        assert_eq!(store.increment_retry("tok-a").await.unwrap(), Some(1));
        assert_eq!(store.increment_retry("tok-a").await.unwrap(), Some(2));

        let current = store.read().await.unwrap().unwrap();
        assert_eq!(current.retry_count, 2);
        assert!(current.last_attempt_at.is_some());

        assert!(store.reset_retry("tok-a").await.unwrap());
        assert_eq!(store.read().await.unwrap().unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_memory_copy_and_flush_recovers() {
        let (kv, store) = setup();
        kv.set_unavailable(true);

        let result = store.write(&record("tok-a")).await;
        assert!(matches!(result, Err(crate::error::LifecycleError::Persistence(_))));
        // Still the authoritative value for this session
        assert_eq!(store.read().await.unwrap().unwrap().value, "tok-a");

        kv.set_unavailable(false);
        assert!(store.flush().await.unwrap());
        assert!(!store.flush().await.unwrap());

        let raw = kv.get(KEY).await.unwrap().unwrap();
        assert!(raw.contains("tok-a"));
    }

    #[tokio::test]
    async fn test_reset_retry_rewrites_dirty_record() {
        let (kv, store) = setup();
        store.write(&record("tok-a")).await.unwrap();

        kv.set_unavailable(true);
        assert_eq!(store.increment_retry("tok-a").await.unwrap(), Some(1));
        kv.set_unavailable(false);
        assert!(store.reset_retry("tok-a").await.unwrap());

        // Counter already zero, but the earlier failed write still needs flushing
        kv.set_unavailable(true);
        assert!(store.mark_registered("tok-a").await.unwrap());
        kv.set_unavailable(false);
        assert!(store.reset_retry("tok-a").await.unwrap());
        assert!(!store.flush().await.unwrap());

        let raw = kv.get(KEY).await.unwrap().unwrap();
        let persisted: TokenRecord = serde_json::from_str(&raw).unwrap();
        assert!(persisted.registered);
        assert_eq!(persisted.retry_count, 0);
    }

    #[tokio::test]
    async fn test_update_customer_requires_reregistration() {
        let (_kv, store) = setup();
        store.write(&record("tok-a")).await.unwrap();
        store.mark_registered("tok-a").await.unwrap();

        let customer = Some(CustomerRef::new("c-1", None));
        assert!(store.update_customer(customer.clone()).await.unwrap());
        assert!(!store.update_customer(customer.clone()).await.unwrap());

        let current = store.read().await.unwrap().unwrap();
        assert_eq!(current.customer_ref, customer);
        assert!(!current.registered);
    }

    #[tokio::test]
    async fn test_clear_and_unreadable_record() {
        let (kv, store) = setup();
        store.write(&record("tok-a")).await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.read().await.unwrap(), None);
        assert_eq!(kv.get(KEY).await.unwrap(), None);

        kv.set(KEY, "{broken").await.unwrap();
        let reopened = TokenStore::new(kv, KEY);
        assert_eq!(reopened.read().await.unwrap(), None);
    }
}
