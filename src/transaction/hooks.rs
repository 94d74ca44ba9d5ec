use crate::core::{Result, TxError};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// A one-shot callback registered against a phase.
pub type Hook = Box<dyn FnOnce() + Send + 'static>;

/// Points in a transaction at which hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookPhase {
    BeforeCommit,
    AfterCommit,
    /// Rollback on the last permitted attempt
    BeforeRollback,
    AfterRollback,
    /// Rollback that will be followed by another attempt
    BeforeEveryRollback,
    AfterEveryRollback,
}

impl HookPhase {
    pub const ALL: [HookPhase; 6] = [
        HookPhase::BeforeCommit,
        HookPhase::AfterCommit,
        HookPhase::BeforeRollback,
        HookPhase::AfterRollback,
        HookPhase::BeforeEveryRollback,
        HookPhase::AfterEveryRollback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookPhase::BeforeCommit => "before_commit",
            HookPhase::AfterCommit => "after_commit",
            HookPhase::BeforeRollback => "before_rollback",
            HookPhase::AfterRollback => "after_rollback",
            HookPhase::BeforeEveryRollback => "before_every_rollback",
            HookPhase::AfterEveryRollback => "after_every_rollback",
        }
    }

    /// The (before, after) pair for a rollback, by finality.
    pub fn rollback_pair(is_final: bool) -> (HookPhase, HookPhase) {
        if is_final {
            (HookPhase::BeforeRollback, HookPhase::AfterRollback)
        } else {
            (HookPhase::BeforeEveryRollback, HookPhase::AfterEveryRollback)
        }
    }
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookPhase {
    type Err = TxError;

    /// Accepts `beforeCommit`, `before_commit`, `BeforeCommit`, `before-commit` etc.
    fn from_str(name: &str) -> Result<Self> {
        let normalized = snake_case(name);
        HookPhase::ALL
            .into_iter()
            .find(|phase| phase.as_str() == normalized)
            .ok_or_else(|| TxError::UnknownHookPhase(name.to_string()))
    }
}

fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for ch in name.trim().chars() {
        if ch == '-' || ch == ' ' || ch == '_' {
            if !out.ends_with('_') && !out.is_empty() {
                out.push('_');
            }
            prev_lower = false;
        } else if ch.is_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
            prev_lower = false;
        } else {
            out.push(ch);
            prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        }
    }
    out
}

/// Ordered hook lists per phase.
#[derive(Default)]
pub struct HookRegistry {
    hooks: HashMap<HookPhase, Vec<Hook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, phase: HookPhase, hook: Hook) {
        self.hooks.entry(phase).or_default().push(hook);
    }

    /// Remove and return the hooks for `phase` in registration order
    pub fn take(&mut self, phase: HookPhase) -> Vec<Hook> {
        self.hooks.remove(&phase).unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.hooks.clear();
    }

    pub fn len(&self, phase: HookPhase) -> usize {
        self.hooks.get(&phase).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.values().all(Vec::is_empty)
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<&str, usize> = self
            .hooks
            .iter()
            .map(|(phase, hooks)| (phase.as_str(), hooks.len()))
            .collect();
        f.debug_struct("HookRegistry").field("hooks", &counts).finish()
    }
}
