use super::{Change, Transaction, TransactionBackend, TransactionId};
use crate::core::{Result, TxError};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{Level, event};

/// Counters describing backend activity since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryBackendStats {
    pub begun: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub open: usize,
}

/// In-memory key/value store with buffered transactional writes.
///
/// Writes made through `put`/`delete` stay private to their transaction until
/// commit. Cloning shares the underlying store.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    committed: Arc<RwLock<BTreeMap<String, JsonValue>>>,
    active_transactions: Arc<RwLock<HashMap<TransactionId, Transaction>>>,
    begun: Arc<AtomicU64>,
    committed_count: Arc<AtomicU64>,
    rolled_back: Arc<AtomicU64>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a write of `value` under `key`
    pub async fn put(&self, tx_id: TransactionId, key: impl Into<String>, value: JsonValue) -> Result<()> {
        self.record(
            tx_id,
            Change::Put {
                key: key.into(),
                value,
            },
        )
        .await
    }

    /// Stage removal of `key`
    pub async fn delete(&self, tx_id: TransactionId, key: impl Into<String>) -> Result<()> {
        self.record(tx_id, Change::Delete { key: key.into() }).await
    }

    /// Read `key` as seen from inside the transaction (staged writes win).
    pub async fn get(&self, tx_id: TransactionId, key: &str) -> Result<Option<JsonValue>> {
        let active = self.active_transactions.read().await;
        let transaction = active
            .get(&tx_id)
            .ok_or(TxError::TransactionNotFound(tx_id))?;

        if let Some(change) = transaction.changes().iter().rev().find(|c| c.key() == key) {
            return Ok(match change {
                Change::Put { value, .. } => Some(value.clone()),
                Change::Delete { .. } => None,
            });
        }
        drop(active);

        Ok(self.get_committed(key).await)
    }

    pub async fn get_committed(&self, key: &str) -> Option<JsonValue> {
        self.committed.read().await.get(key).cloned()
    }

    /// Committed entries whose key starts with `prefix`, in key order
    pub async fn scan_committed(&self, prefix: &str) -> Vec<(String, JsonValue)> {
        self.committed
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub async fn stats(&self) -> MemoryBackendStats {
        MemoryBackendStats {
            begun: self.begun.load(Ordering::SeqCst),
            committed: self.committed_count.load(Ordering::SeqCst),
            rolled_back: self.rolled_back.load(Ordering::SeqCst),
            open: self.active_transactions.read().await.len(),
        }
    }

    async fn record(&self, tx_id: TransactionId, change: Change) -> Result<()> {
        let mut active = self.active_transactions.write().await;
        let transaction = active
            .get_mut(&tx_id)
            .ok_or(TxError::TransactionNotFound(tx_id))?;
        transaction.record_change(change)
    }
}

#[async_trait]
impl TransactionBackend for MemoryBackend {
    async fn begin(&self) -> Result<TransactionId> {
        let tx_id = TransactionId::new();
        let mut active = self.active_transactions.write().await;
        active.insert(tx_id, Transaction::new(tx_id));
        self.begun.fetch_add(1, Ordering::SeqCst);
        Ok(tx_id)
    }

    async fn commit(&self, tx_id: TransactionId) -> Result<()> {
        let mut active = self.active_transactions.write().await;
        let mut transaction = active
            .remove(&tx_id)
            .ok_or(TxError::TransactionNotFound(tx_id))?;
        let change_count = transaction.change_count();
        let elapsed = transaction.duration();
        let changes = transaction.commit()?;

        // Lock order: active_transactions, then committed.
        let mut committed = self.committed.write().await;
        for change in changes {
            match change {
                Change::Put { key, value } => {
                    committed.insert(key, value);
                }
                Change::Delete { key } => {
                    committed.remove(&key);
                }
            }
        }
        self.committed_count.fetch_add(1, Ordering::SeqCst);
        event!(
            Level::DEBUG,
            tx = %tx_id,
            changes = change_count,
            elapsed_us = elapsed.as_micros() as u64,
            "transaction committed"
        );
        Ok(())
    }

    async fn rollback(&self, tx_id: TransactionId) -> Result<()> {
        let mut active = self.active_transactions.write().await;
        let mut transaction = active
            .remove(&tx_id)
            .ok_or(TxError::TransactionNotFound(tx_id))?;
        let discarded = transaction.change_count();
        transaction.rollback()?;
        self.rolled_back.fetch_add(1, Ordering::SeqCst);
        event!(
            Level::DEBUG,
            tx = %tx_id,
            discarded,
            elapsed_us = transaction.duration().as_micros() as u64,
            "transaction rolled back"
        );
        Ok(())
    }
}
