// ============================================================================
// Transaction Session
// ============================================================================
//
// Request-scoped controller around a `TransactionBackend`. Owns the attempt
// counter, the one-shot hooks and the active flag for one logical request.
//
// State machine per attempt:
//
//   Idle ──begin──> Open ──commit──> Committed
//                     │
//                     └──rollback──> RolledBack ──> Idle (retry) | Failed
//
// ============================================================================

use super::{Hook, HookPhase, HookRegistry, TransactionBackend, TransactionId};
use crate::core::{Result, TxError};
use crate::events::{EventBus, LifecycleEvent, LifecyclePoint, RequestInfo};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{Level, event};

#[derive(Debug, Default)]
struct SessionState {
    active: bool,
    current_attempt: u32,
    hooks: HookRegistry,
    open: Option<TransactionId>,
}

struct SessionInner {
    backend: Arc<dyn TransactionBackend>,
    events: EventBus,
    state: Mutex<SessionState>,
}

/// Per-request transaction controller.
///
/// Cloning is cheap and every clone observes the same state. The middleware
/// puts one into the request extensions, so handlers can register hooks:
///
/// ```ignore
/// async fn transfer(Extension(session): Extension<TransactionSession>) -> StatusCode {
///     session.after_commit(|| tracing::info!("transfer committed")).unwrap();
///     StatusCode::CREATED
/// }
/// ```
#[derive(Clone)]
pub struct TransactionSession {
    inner: Arc<SessionInner>,
}

impl TransactionSession {
    pub fn new(backend: Arc<dyn TransactionBackend>, events: EventBus) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                backend,
                events,
                state: Mutex::new(SessionState::default()),
            }),
        }
    }

    // Hooks never run while the lock is held, so a poisoned lock still
    // guards consistent state.
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn start_middleware(&self) {
        self.state().active = true;
    }

    pub fn stop_middleware(&self) {
        self.state().active = false;
    }

    pub fn is_active(&self) -> bool {
        self.state().active
    }

    /// Number of transactions begun so far; never decreases
    pub fn current_attempt(&self) -> u32 {
        self.state().current_attempt
    }

    pub fn open_transaction(&self) -> Option<TransactionId> {
        self.state().open
    }

    pub fn hook_count(&self, phase: HookPhase) -> usize {
        self.state().hooks.len(phase)
    }

    pub fn backend(&self) -> &Arc<dyn TransactionBackend> {
        &self.inner.backend
    }

    // ------------------------------------------------------------------
    // Hook registration
    // ------------------------------------------------------------------

    /// Register a one-shot hook for `phase`.
    ///
    /// Hooks are cleared whenever a new transaction begins, so they only
    /// apply to the attempt they were registered in.
    pub fn register<F>(&self, phase: HookPhase, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.push_hook(phase, Box::new(callback))
    }

    pub fn before_commit<F: FnOnce() + Send + 'static>(&self, callback: F) -> Result<()> {
        self.register(HookPhase::BeforeCommit, callback)
    }

    pub fn after_commit<F: FnOnce() + Send + 'static>(&self, callback: F) -> Result<()> {
        self.register(HookPhase::AfterCommit, callback)
    }

    pub fn before_rollback<F: FnOnce() + Send + 'static>(&self, callback: F) -> Result<()> {
        self.register(HookPhase::BeforeRollback, callback)
    }

    pub fn after_rollback<F: FnOnce() + Send + 'static>(&self, callback: F) -> Result<()> {
        self.register(HookPhase::AfterRollback, callback)
    }

    pub fn before_every_rollback<F: FnOnce() + Send + 'static>(&self, callback: F) -> Result<()> {
        self.register(HookPhase::BeforeEveryRollback, callback)
    }

    pub fn after_every_rollback<F: FnOnce() + Send + 'static>(&self, callback: F) -> Result<()> {
        self.register(HookPhase::AfterEveryRollback, callback)
    }

    /// Register a hook whose phase and callable are only known at runtime.
    ///
    /// `name` is case-normalized (`afterCommit`, `after_commit`). `value` must
    /// hold a [`Hook`] or a plain `fn()`; anything else is rejected with
    /// `TxError::InvalidCallable` and nothing is registered. That includes an
    /// unboxed closure: its anonymous type is neither, so box it as a `Hook`
    /// first.
    ///
    /// ```
    /// # use std::sync::Arc;
    /// # use with_db_transactions::{EventBus, Hook, MemoryBackend, TransactionSession, TxError};
    /// let session = TransactionSession::new(Arc::new(MemoryBackend::new()), EventBus::new());
    /// session.start_middleware();
    ///
    /// let rejected = session.register_dynamic("afterCommit", Box::new(|| {}));
    /// assert_eq!(rejected, Err(TxError::InvalidCallable));
    ///
    /// let hook: Hook = Box::new(|| {});
    /// session.register_dynamic("afterCommit", Box::new(hook))?;
    ///
    /// fn audit() {}
    /// session.register_dynamic("after_commit", Box::new(audit as fn()))?;
    /// # Ok::<(), TxError>(())
    /// ```
    pub fn register_dynamic(&self, name: &str, value: Box<dyn Any + Send>) -> Result<()> {
        if !self.is_active() {
            return Err(TxError::NotActive);
        }
        let hook: Hook = match value.downcast::<Hook>() {
            Ok(hook) => *hook,
            Err(value) => match value.downcast::<fn()>() {
                Ok(func) => {
                    let func = *func;
                    Box::new(func)
                }
                Err(_) => return Err(TxError::InvalidCallable),
            },
        };
        let phase = name.parse::<HookPhase>()?;
        self.push_hook(phase, hook)
    }

    fn push_hook(&self, phase: HookPhase, hook: Hook) -> Result<()> {
        let mut state = self.state();
        if !state.active {
            return Err(TxError::NotActive);
        }
        state.hooks.push(phase, hook);
        Ok(())
    }

    fn run_hooks(&self, phase: HookPhase) {
        let hooks = self.state().hooks.take(phase);
        if !hooks.is_empty() {
            event!(Level::TRACE, phase = %phase, count = hooks.len(), "running transaction hooks");
        }
        for hook in hooks {
            hook();
        }
    }

    async fn fire(&self, point: LifecyclePoint, request: Option<&RequestInfo>) {
        let attempt = self.current_attempt();
        let lifecycle = LifecycleEvent::new(point, request.cloned(), attempt);
        self.inner.events.dispatch(&lifecycle).await;
    }

    // ------------------------------------------------------------------
    // Transaction lifecycle
    // ------------------------------------------------------------------

    /// Start a new attempt: clears hooks, bumps the attempt counter, and opens
    /// a backend transaction.
    pub async fn begin_transaction(&self, request: Option<&RequestInfo>) -> Result<TransactionId> {
        let attempt = {
            let mut state = self.state();
            if state.open.is_some() {
                return Err(TxError::TransactionAlreadyOpen);
            }
            state.hooks.clear();
            state.current_attempt += 1;
            state.current_attempt
        };

        self.fire(LifecyclePoint::BeforeBeginTransaction, request).await;
        let tx_id = self.inner.backend.begin().await?;
        self.state().open = Some(tx_id);
        event!(Level::DEBUG, tx = %tx_id, attempt, "transaction started");
        self.fire(LifecyclePoint::AfterBeginTransaction, request).await;

        Ok(tx_id)
    }

    pub async fn commit(&self, request: Option<&RequestInfo>) -> Result<()> {
        let tx_id = self.open_transaction().ok_or(TxError::NoOpenTransaction)?;

        self.run_hooks(HookPhase::BeforeCommit);
        self.fire(LifecyclePoint::BeforeCommit, request).await;

        let committed = self.inner.backend.commit(tx_id).await;
        self.state().open = None;
        if let Err(err) = committed {
            event!(Level::ERROR, tx = %tx_id, error = %err, "transaction commit failed");
            return Err(err);
        }
        event!(Level::DEBUG, tx = %tx_id, "transaction committed");

        self.run_hooks(HookPhase::AfterCommit);
        self.fire(LifecyclePoint::AfterCommit, request).await;
        Ok(())
    }

    /// Roll back the open transaction.
    ///
    /// `is_final` selects the `rollback` phase (no attempts left) instead of
    /// `every_rollback` (another attempt follows).
    pub async fn rollback(&self, request: Option<&RequestInfo>, is_final: bool) -> Result<()> {
        let tx_id = self.open_transaction().ok_or(TxError::NoOpenTransaction)?;
        let (before_hooks, after_hooks) = HookPhase::rollback_pair(is_final);
        let (before_point, after_point) = LifecyclePoint::rollback_pair(is_final);

        self.run_hooks(before_hooks);
        self.fire(before_point, request).await;

        let rolled_back = self.inner.backend.rollback(tx_id).await;
        self.state().open = None;
        if let Err(err) = rolled_back {
            event!(Level::ERROR, tx = %tx_id, error = %err, "transaction rollback failed");
            return Err(err);
        }
        event!(Level::DEBUG, tx = %tx_id, is_final, "transaction rolled back");

        self.run_hooks(after_hooks);
        self.fire(after_point, request).await;
        Ok(())
    }

    /// Roll back at the backend without running hooks or firing events.
    ///
    /// Used when the wrapped service fails outright and the attempt is
    /// abandoned rather than completed.
    pub(crate) async fn abort(&self) -> Result<()> {
        let Some(tx_id) = self.state().open.take() else {
            return Ok(());
        };
        event!(Level::WARN, tx = %tx_id, "aborting transaction after service error");
        self.inner.backend.rollback(tx_id).await
    }

    /// Run `closure` inside a transaction, retrying on `Err` up to `attempts`
    /// times (`0` counts as one attempt).
    ///
    /// `Ok` commits and returns the value. `Err` rolls back; the last attempt's
    /// rollback is final and its error is returned unchanged.
    pub async fn transaction<F, Fut, T, E>(&self, mut closure: F, attempts: u32) -> std::result::Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<TxError>,
    {
        self.start_middleware();
        let mut remaining = attempts.max(1);
        loop {
            self.begin_transaction(None).await?;
            match closure().await {
                Ok(value) => {
                    self.commit(None).await?;
                    return Ok(value);
                }
                Err(err) => {
                    let is_final = remaining <= 1;
                    self.rollback(None, is_final).await?;
                    if is_final {
                        return Err(err);
                    }
                    remaining -= 1;
                }
            }
        }
    }
}

impl fmt::Debug for TransactionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("TransactionSession")
            .field("active", &state.active)
            .field("current_attempt", &state.current_attempt)
            .field("open", &state.open)
            .field("hooks", &state.hooks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingListener;
    use crate::transaction::MemoryBackend;
    use std::sync::Mutex as StdMutex;

    fn session_with(recorder: &RecordingListener) -> (TransactionSession, MemoryBackend) {
        let backend = MemoryBackend::new();
        let events = EventBus::new().subscribe(Arc::new(recorder.clone()));
        (TransactionSession::new(Arc::new(backend.clone()), events), backend)
    }

    #[test]
    fn test_register_requires_active_session() {
        let (session, _) = session_with(&RecordingListener::new());
        assert_eq!(session.before_commit(|| {}), Err(TxError::NotActive));

        session.start_middleware();
        assert!(session.before_commit(|| {}).is_ok());

        session.stop_middleware();
        assert_eq!(session.after_commit(|| {}), Err(TxError::NotActive));
        assert_eq!(session.hook_count(HookPhase::AfterCommit), 0);
    }

    #[test]
    fn test_register_dynamic_rejects_non_callable() {
        let (session, _) = session_with(&RecordingListener::new());
        session.start_middleware();

        let result = session.register_dynamic("beforeCommit", Box::new(42_u32));
        assert_eq!(result, Err(TxError::InvalidCallable));
        // An unboxed closure has its own type and is not accepted either.
        let result = session.register_dynamic("beforeCommit", Box::new(|| {}));
        assert_eq!(result, Err(TxError::InvalidCallable));
        assert_eq!(session.hook_count(HookPhase::BeforeCommit), 0);

        let hook: Hook = Box::new(|| {});
        session.register_dynamic("beforeCommit", Box::new(hook)).unwrap();
        fn noop() {}
        session
            .register_dynamic("after_every_rollback", Box::new(noop as fn()))
            .unwrap();
        assert_eq!(session.hook_count(HookPhase::BeforeCommit), 1);
        assert_eq!(session.hook_count(HookPhase::AfterEveryRollback), 1);
    }

    #[test]
    fn test_register_dynamic_checks_active_first() {
        let (session, _) = session_with(&RecordingListener::new());
        assert_eq!(
            session.register_dynamic("beforeCommit", Box::new("not callable")),
            Err(TxError::NotActive)
        );
    }

    #[tokio::test]
    async fn test_commit_runs_hooks_and_events_in_order() {
        let recorder = RecordingListener::new();
        let (session, backend) = session_with(&recorder);
        session.start_middleware();
        let order = Arc::new(StdMutex::new(Vec::new()));

        let tx = session.begin_transaction(None).await.unwrap();
        for label in ["before-1", "before-2"] {
            let order = Arc::clone(&order);
            session.before_commit(move || order.lock().unwrap().push(label)).unwrap();
        }
        let after = Arc::clone(&order);
        session.after_commit(move || after.lock().unwrap().push("after")).unwrap();
        let never = Arc::clone(&order);
        session.after_rollback(move || never.lock().unwrap().push("rollback")).unwrap();

        backend.put(tx, "k", serde_json::json!(1)).await.unwrap();
        session.commit(None).await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["before-1", "before-2", "after"]);
        assert_eq!(
            recorder.points(),
            vec![
                (LifecyclePoint::BeforeBeginTransaction, 1),
                (LifecyclePoint::AfterBeginTransaction, 1),
                (LifecyclePoint::BeforeCommit, 1),
                (LifecyclePoint::AfterCommit, 1),
            ]
        );
        assert_eq!(backend.get_committed("k").await, Some(serde_json::json!(1)));
        assert_eq!(session.open_transaction(), None);
    }

    #[tokio::test]
    async fn test_rollback_phase_depends_on_finality() {
        let recorder = RecordingListener::new();
        let (session, _) = session_with(&recorder);
        session.start_middleware();
        let fired = Arc::new(StdMutex::new(Vec::new()));

        session.begin_transaction(None).await.unwrap();
        let every = Arc::clone(&fired);
        session.before_every_rollback(move || every.lock().unwrap().push("every")).unwrap();
        let last = Arc::clone(&fired);
        session.before_rollback(move || last.lock().unwrap().push("final")).unwrap();
        session.rollback(None, false).await.unwrap();
        assert_eq!(*fired.lock().unwrap(), vec!["every"]);

        session.begin_transaction(None).await.unwrap();
        let last = Arc::clone(&fired);
        session.before_rollback(move || last.lock().unwrap().push("final")).unwrap();
        session.rollback(None, true).await.unwrap();
        assert_eq!(*fired.lock().unwrap(), vec!["every", "final"]);

        assert_eq!(recorder.count(LifecyclePoint::BeforeEveryRollback), 1);
        assert_eq!(recorder.count(LifecyclePoint::AfterEveryRollback), 1);
        assert_eq!(recorder.count(LifecyclePoint::BeforeRollback), 1);
        assert_eq!(recorder.count(LifecyclePoint::AfterRollback), 1);
    }

    #[tokio::test]
    async fn test_begin_clears_hooks_and_increments_attempt() {
        let (session, _) = session_with(&RecordingListener::new());
        session.start_middleware();

        session.begin_transaction(None).await.unwrap();
        session.after_commit(|| {}).unwrap();
        session.rollback(None, false).await.unwrap();
        assert_eq!(session.current_attempt(), 1);

        session.begin_transaction(None).await.unwrap();
        assert_eq!(session.hook_count(HookPhase::AfterCommit), 0);
        assert_eq!(session.current_attempt(), 2);
    }

    #[tokio::test]
    async fn test_single_open_transaction() {
        let (session, backend) = session_with(&RecordingListener::new());

        assert_eq!(session.commit(None).await, Err(TxError::NoOpenTransaction));
        assert_eq!(session.rollback(None, true).await, Err(TxError::NoOpenTransaction));

        session.begin_transaction(None).await.unwrap();
        assert_eq!(
            session.begin_transaction(None).await,
            Err(TxError::TransactionAlreadyOpen)
        );
        assert_eq!(session.current_attempt(), 1);
        assert_eq!(backend.stats().await.open, 1);
    }

    #[tokio::test]
    async fn test_abort_skips_hooks_and_events() {
        let recorder = RecordingListener::new();
        let (session, backend) = session_with(&recorder);
        session.start_middleware();
        session.begin_transaction(None).await.unwrap();
        session.after_rollback(|| panic!("hook must not run")).unwrap();

        session.abort().await.unwrap();
        assert_eq!(session.open_transaction(), None);
        assert_eq!(recorder.count(LifecyclePoint::AfterRollback), 0);
        assert_eq!(backend.stats().await.rolled_back, 1);
    }
}
