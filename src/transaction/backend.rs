use super::TransactionId;
use crate::core::Result;
use async_trait::async_trait;

/// The database transaction primitive wrapped by a session.
///
/// Implementations own isolation and durability. Lock waits, deadlocks and
/// connection failures surface as `TxError::Backend`.
#[async_trait]
pub trait TransactionBackend: Send + Sync {
    /// Open a new transaction
    async fn begin(&self) -> Result<TransactionId>;

    /// Make the transaction's writes visible
    async fn commit(&self, tx_id: TransactionId) -> Result<()>;

    /// Discard the transaction's writes
    async fn rollback(&self, tx_id: TransactionId) -> Result<()>;
}
