// ============================================================================
// Result Store Adapter Contract
// ============================================================================
//
// The transaction is polymorphic over a *result store* supplying persistence
// and cooperative locking. This module defines the contract (`ResultStore`),
// the value types it moves (`ResultRecord`, `StagedValue`), the escape hatch
// for clearing an ineffective metadata sink (`MetadataStorageKind`), a
// reference in-memory implementation usable for local development and tests,
// and the process-wide default-store slot the scope entry points fall back
// to when a caller supplies a `key` but no `store`.
//
// ============================================================================

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, Notify};

use crate::error::{Result, TxnError};
use crate::state::{Holder, IsolationLevel};

/// A value together with persistence metadata, recognized specially by the
/// store's record-persist path (as opposed to the generic write path used
/// for a bare [`serde_json::Value`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub key: String,
    pub value: Value,
    pub metadata: Value,
}

impl ResultRecord {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
            metadata: Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A value staged on a transaction: either an opaque payload or a
/// [`ResultRecord`]. Replaced, not appended, by repeated `stage` calls.
#[derive(Debug, Clone)]
pub enum StagedValue {
    Value(Value),
    Record(ResultRecord),
}

impl StagedValue {
    pub fn value(&self) -> &Value {
        match self {
            Self::Value(v) => v,
            Self::Record(r) => &r.value,
        }
    }
}

impl From<Value> for StagedValue {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<ResultRecord> for StagedValue {
    fn from(record: ResultRecord) -> Self {
        Self::Record(record)
    }
}

/// Whether a store's metadata sink is actually wired up. A `Null` sink must
/// be cleared (copy-on-write) on the handle a transaction uses, so it is not
/// inherited from a surrounding context where it was never effective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataStorageKind {
    Populated,
    Null,
}

/// The adapter contract a transaction requires of an external result store
/// and its lock manager. Re-entrant `acquire_lock` is not required; release
/// must be idempotent under the same `holder`.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool>;

    async fn read(&self, key: &str, holder: Holder) -> Result<Option<ResultRecord>>;

    /// Generic value persistence.
    async fn write(&self, key: &str, value: Value, holder: Holder) -> Result<()>;

    /// Record-typed persistence; the record already carries its key and metadata.
    async fn persist_result_record(&self, record: ResultRecord, holder: Holder) -> Result<()>;

    async fn acquire_lock(&self, key: &str, holder: Holder) -> Result<()>;

    async fn release_lock(&self, key: &str, holder: Holder) -> Result<()>;

    fn supports_isolation_level(&self, level: IsolationLevel) -> bool;

    fn metadata_storage_kind(&self) -> MetadataStorageKind {
        MetadataStorageKind::Populated
    }

    /// Returns a handle with its metadata sink cleared. Only meaningful (and
    /// only called) when [`Self::metadata_storage_kind`] is `Null`.
    fn with_cleared_metadata(&self) -> Arc<dyn ResultStore> {
        unreachable!("with_cleared_metadata called on a store whose metadata sink is not Null")
    }
}

/// If `store`'s metadata sink is the null kind, returns a copy with it
/// cleared; otherwise returns `store` unchanged.
pub(crate) fn clear_null_metadata(store: Arc<dyn ResultStore>) -> Arc<dyn ResultStore> {
    if store.metadata_storage_kind() == MetadataStorageKind::Null {
        store.with_cleared_metadata()
    } else {
        store
    }
}

struct InMemoryInner {
    records: Mutex<HashMap<String, ResultRecord>>,
    locks: Mutex<HashMap<String, Holder>>,
    notify: Notify,
    serializable: bool,
}

/// A keyed in-memory reference implementation of [`ResultStore`], with
/// per-key advisory exclusive locks. Suitable for local development and for
/// this crate's own tests; not durable across process restarts.
#[derive(Clone)]
pub struct InMemoryResultStore {
    inner: Arc<InMemoryInner>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(InMemoryInner {
                records: Mutex::new(HashMap::new()),
                locks: Mutex::new(HashMap::new()),
                notify: Notify::new(),
                serializable: true,
            }),
        }
    }

    /// A store that reports it cannot support `SERIALIZABLE`, exercising the
    /// configuration-error path for transactions that request it anyway.
    pub fn without_serializable() -> Self {
        Self {
            inner: Arc::new(InMemoryInner {
                records: Mutex::new(HashMap::new()),
                locks: Mutex::new(HashMap::new()),
                notify: Notify::new(),
                serializable: false,
            }),
        }
    }

    /// Synchronously checks whether a record exists under `key`, for tests
    /// that want to assert on store contents without awaiting.
    pub fn contains(&self, key: &str) -> bool {
        self.inner
            .records
            .try_lock()
            .map(|records| records.contains_key(key))
            .unwrap_or(false)
    }
}

impl Default for InMemoryResultStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.inner.records.lock().await.contains_key(key))
    }

    async fn read(&self, key: &str, _holder: Holder) -> Result<Option<ResultRecord>> {
        Ok(self.inner.records.lock().await.get(key).cloned())
    }

    async fn write(&self, key: &str, value: Value, _holder: Holder) -> Result<()> {
        let record = ResultRecord::new(key, value);
        self.inner
            .records
            .lock()
            .await
            .insert(key.to_string(), record);
        Ok(())
    }

    async fn persist_result_record(&self, record: ResultRecord, _holder: Holder) -> Result<()> {
        self.inner
            .records
            .lock()
            .await
            .insert(record.key.clone(), record);
        Ok(())
    }

    async fn acquire_lock(&self, key: &str, holder: Holder) -> Result<()> {
        loop {
            {
                let mut locks = self.inner.locks.lock().await;
                match locks.get(key) {
                    Some(existing) if *existing == holder => return Ok(()),
                    None => {
                        locks.insert(key.to_string(), holder);
                        return Ok(());
                    }
                    Some(_) => {}
                }
            }
            self.inner.notify.notified().await;
        }
    }

    async fn release_lock(&self, key: &str, holder: Holder) -> Result<()> {
        let mut locks = self.inner.locks.lock().await;
        if let Some(existing) = locks.get(key) {
            if *existing == holder {
                locks.remove(key);
                self.inner.notify.notify_waiters();
            }
        }
        Ok(())
    }

    fn supports_isolation_level(&self, level: IsolationLevel) -> bool {
        match level {
            IsolationLevel::ReadCommitted => true,
            IsolationLevel::Serializable => self.inner.serializable,
        }
    }
}

/// Wraps a store to report a `Null` metadata sink, for exercising the
/// copy-on-write clearing step at scope entry (`clear_null_metadata`).
pub struct NullMetadataStore {
    inner: Arc<dyn ResultStore>,
}

impl NullMetadataStore {
    pub fn new(inner: Arc<dyn ResultStore>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ResultStore for NullMetadataStore {
    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key).await
    }

    async fn read(&self, key: &str, holder: Holder) -> Result<Option<ResultRecord>> {
        self.inner.read(key, holder).await
    }

    async fn write(&self, key: &str, value: Value, holder: Holder) -> Result<()> {
        self.inner.write(key, value, holder).await
    }

    async fn persist_result_record(&self, record: ResultRecord, holder: Holder) -> Result<()> {
        self.inner.persist_result_record(record, holder).await
    }

    async fn acquire_lock(&self, key: &str, holder: Holder) -> Result<()> {
        self.inner.acquire_lock(key, holder).await
    }

    async fn release_lock(&self, key: &str, holder: Holder) -> Result<()> {
        self.inner.release_lock(key, holder).await
    }

    fn supports_isolation_level(&self, level: IsolationLevel) -> bool {
        self.inner.supports_isolation_level(level)
    }

    fn metadata_storage_kind(&self) -> MetadataStorageKind {
        MetadataStorageKind::Null
    }

    fn with_cleared_metadata(&self) -> Arc<dyn ResultStore> {
        Arc::clone(&self.inner)
    }
}

static DEFAULT_STORE: RwLock<Option<Arc<dyn ResultStore>>> = RwLock::new(None);

/// Installs the ambient runtime's default result store, consulted by the
/// scope entry points when a caller supplies `key` but no `store`.
pub fn set_default_store(store: Arc<dyn ResultStore>) {
    *DEFAULT_STORE.write().expect("default store lock poisoned") = Some(store);
}

/// Clears the ambient default store. Mostly useful for test isolation.
pub fn clear_default_store() {
    *DEFAULT_STORE.write().expect("default store lock poisoned") = None;
}

pub(crate) fn resolve_default_store() -> Result<Arc<dyn ResultStore>> {
    DEFAULT_STORE
        .read()
        .expect("default store lock poisoned")
        .clone()
        .ok_or_else(|| {
            TxnError::Configuration(
                "a key was provided but no store was given and no default store is installed \
                 (see set_default_store)"
                    .to_string(),
            )
        })
}
