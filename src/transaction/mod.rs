// ============================================================================
// Transaction Management Module
// ============================================================================
//
// Request-scoped transaction control over a pluggable backend:
// - `TransactionBackend`: the begin/commit/rollback primitive
// - `TransactionSession`: attempt counter, one-shot hooks, lifecycle events
// - `MemoryBackend`: buffered in-memory key/value backend
//
// ============================================================================

pub mod backend;
pub mod change;
pub mod hooks;
pub mod memory;
pub mod session;
pub mod state;

pub use backend::TransactionBackend;
pub use change::Change;
pub use hooks::{Hook, HookPhase, HookRegistry};
pub use memory::{MemoryBackend, MemoryBackendStats};
pub use session::TransactionSession;
pub use state::{Transaction, TransactionId, TransactionState};
