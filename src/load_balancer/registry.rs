//! Child policy registry.
//!
//! # Responsibilities
//! - Map policy names to builders
//! - Answer whether a configured child name is known
//!
//! # Design Decisions
//! - Explicit registry value instead of a process-global, so tests can
//!   register their own policies without interfering with each other

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::load_balancer::pick_first::PickFirstBuilder;
use crate::load_balancer::round_robin::RoundRobinBuilder;
use crate::load_balancer::LoadBalancerBuilder;

/// Builders keyed by policy name.
#[derive(Clone, Default)]
pub struct Registry {
    builders: HashMap<&'static str, Arc<dyn LoadBalancerBuilder>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in child policies.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(RoundRobinBuilder));
        registry.register(Arc::new(PickFirstBuilder));
        registry
    }

    /// Register a builder, replacing any previous builder with the same name.
    pub fn register(&mut self, builder: Arc<dyn LoadBalancerBuilder>) {
        self.builders.insert(builder.name(), builder);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn LoadBalancerBuilder>> {
        self.builders.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.builders.keys().collect();
        names.sort();
        f.debug_struct("Registry").field("policies", &names).finish()
    }
}
