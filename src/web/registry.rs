use super::TransactionLayer;
use crate::config::TransactionConfig;
use crate::core::{Result, TxError};
use crate::events::EventBus;
use crate::transaction::TransactionBackend;
use axum::Router;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{Level, event};

/// A middleware reference of the form `alias` or `alias:attempts`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MiddlewareSpec {
    pub alias: String,
    pub attempts: Option<u32>,
}

impl MiddlewareSpec {
    pub fn new(alias: impl Into<String>, attempts: Option<u32>) -> Self {
        Self {
            alias: alias.into(),
            attempts,
        }
    }
}

impl FromStr for MiddlewareSpec {
    type Err = TxError;

    fn from_str(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        let (alias, attempts) = match reference.split_once(':') {
            Some((alias, attempts)) => {
                let attempts = attempts.trim().parse::<u32>().map_err(|_| {
                    TxError::InvalidMiddlewareSpec(format!(
                        "'{reference}': attempts must be a non-negative integer"
                    ))
                })?;
                (alias.trim(), Some(attempts))
            }
            None => (reference, None),
        };

        if alias.is_empty() {
            return Err(TxError::InvalidMiddlewareSpec(format!(
                "'{reference}': alias is empty"
            )));
        }

        Ok(Self::new(alias, attempts))
    }
}

impl fmt::Display for MiddlewareSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.attempts {
            Some(attempts) => write!(f, "{}:{}", self.alias, attempts),
            None => f.write_str(&self.alias),
        }
    }
}

/// Router-side registration of transaction middleware by alias and group.
#[derive(Debug, Default, Clone)]
pub struct MiddlewareRegistry {
    aliases: HashMap<String, TransactionLayer>,
    groups: BTreeMap<String, Vec<MiddlewareSpec>>,
}

impl MiddlewareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the configured alias and push `alias:attempts` onto every
    /// configured middleware group.
    pub fn boot(
        config: TransactionConfig,
        backend: Arc<dyn TransactionBackend>,
        events: EventBus,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let layer = TransactionLayer::with_shared_config(Arc::clone(&config), backend).events(events);

        let mut registry = Self::new();
        registry.alias_middleware(&config.middleware_alias, layer);

        let spec = MiddlewareSpec::new(config.middleware_alias.clone(), Some(config.group_attempts()));
        for group in &config.middleware_groups {
            registry.push_middleware_to_group(group, spec.clone());
        }

        event!(
            Level::INFO,
            alias = %config.middleware_alias,
            groups = config.middleware_groups.len(),
            "transaction middleware registered"
        );
        Ok(registry)
    }

    pub fn alias_middleware(&mut self, alias: &str, layer: TransactionLayer) {
        self.aliases.insert(alias.to_string(), layer);
    }

    /// Append `spec` to `group` unless it is already present
    pub fn push_middleware_to_group(&mut self, group: &str, spec: MiddlewareSpec) {
        let entries = self.groups.entry(group.to_string()).or_default();
        if !entries.contains(&spec) {
            entries.push(spec);
        }
    }

    pub fn group(&self, group: &str) -> &[MiddlewareSpec] {
        self.groups.get(group).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_alias(&self, alias: &str) -> bool {
        self.aliases.contains_key(alias)
    }

    /// Build the layer for a reference such as `with_db_transactions:3`
    pub fn resolve(&self, reference: &str) -> Result<TransactionLayer> {
        self.resolve_spec(&reference.parse()?)
    }

    pub fn resolve_spec(&self, spec: &MiddlewareSpec) -> Result<TransactionLayer> {
        let layer = self
            .aliases
            .get(&spec.alias)
            .cloned()
            .ok_or_else(|| TxError::UnknownMiddleware(spec.alias.clone()))?;
        Ok(match spec.attempts {
            Some(attempts) => layer.attempts(attempts),
            None => layer,
        })
    }

    /// Layer `router` with every middleware pushed onto `group`
    pub fn apply_group<S>(&self, router: Router<S>, group: &str) -> Result<Router<S>>
    where
        S: Clone + Send + Sync + 'static,
    {
        let mut router = router;
        for spec in self.group(group) {
            router = router.layer(self.resolve_spec(spec)?);
        }
        Ok(router)
    }
}
