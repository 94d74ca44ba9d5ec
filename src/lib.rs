// ============================================================================
// with_db_transactions
// ============================================================================
//
// Request-scoped database transactions for axum/tower services. A request is
// committed when the handler's status code is in the commit set, otherwise it
// is rolled back and retried up to the configured attempt budget.
//
// ============================================================================

pub mod config;
pub mod core;
pub mod events;
pub mod transaction;
pub mod web;

pub use config::TransactionConfig;
pub use crate::core::{Result, TxError};
pub use events::{
    EventBus, LifecycleEvent, LifecyclePoint, RecordingListener, RequestInfo, TracingListener,
    TransactionListener,
};
pub use transaction::{
    Hook, HookPhase, MemoryBackend, MemoryBackendStats, TransactionBackend, TransactionId,
    TransactionSession,
};
pub use web::{
    ErrorResponse, MiddlewareRegistry, MiddlewareSpec, RouteName, TransactionLayer,
    TransactionService, route_name_of,
};
