//! Handler and predicate registry.
//!
//! Definitions are durable data: they carry step ids and predicate names,
//! never callables. The registry supplies the callables at scheduler
//! construction, keyed by the same identifiers. Lookups strip the `@<index>`
//! iteration scope so one registered handler serves every for-each index.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use strand_types::graph::handler_key;

use crate::step::{FnHandler, StepContext, StepError, StepHandler, StepOutcome};

type Predicate = dyn Fn(&Value) -> bool + Send + Sync;

/// Step handlers and named predicates, resolved by id.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    steps: HashMap<String, Arc<dyn StepHandler>>,
    predicates: HashMap<String, Arc<Predicate>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an execute function for a step id. Later registrations
    /// under the same id replace earlier ones.
    pub fn register_step(&mut self, id: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.steps.insert(id.into(), handler);
    }

    /// Register an async closure as the execute function for a step id.
    pub fn register_step_fn<F, Fut>(&mut self, id: impl Into<String>, f: F)
    where
        F: Fn(Value, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepOutcome, StepError>> + Send + 'static,
    {
        let handler = FnHandler(
            move |input: Value,
                  ctx: StepContext|
                  -> BoxFuture<'static, Result<StepOutcome, StepError>> {
                Box::pin(f(input, ctx))
            },
        );
        self.steps.insert(id.into(), Arc::new(handler));
    }

    /// Register a named predicate for branch and loop conditions.
    pub fn register_predicate<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.predicates.insert(name.into(), Arc::new(f));
    }

    /// Resolve the execute function for a (possibly iteration-scoped) node id.
    pub fn step(&self, node_id: &str) -> Option<Arc<dyn StepHandler>> {
        self.steps.get(handler_key(node_id)).cloned()
    }

    /// Resolve a named predicate.
    pub fn predicate(&self, name: &str) -> Option<Arc<Predicate>> {
        self.predicates.get(name).cloned()
    }

    pub fn has_step(&self, node_id: &str) -> bool {
        self.steps.contains_key(handler_key(node_id))
    }

    pub fn has_predicate(&self, name: &str) -> bool {
        self.predicates.contains_key(name)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .field("predicates", &self.predicates.keys().collect::<Vec<_>>())
            .finish()
    }
}
