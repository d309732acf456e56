//! Ordered interceptor registration.
//!
//! # Design Decisions
//! - Order is `(priority, registration sequence)`, lowest first
//! - Registering an existing name replaces it in place and keeps its
//!   original sequence number, so re-registration never reshuffles ties
//! - The registry is a plain value; publishing it is `ServerHandle::recompose`

use std::sync::Arc;

use crate::dispatch::BoxHandler;
use crate::interceptor::chain::{compose, Interceptor};

#[derive(Clone)]
struct Registered {
    name: String,
    priority: i32,
    sequence: u64,
    interceptor: Arc<dyn Interceptor>,
}

/// Named, prioritised interceptors.
#[derive(Clone, Default)]
pub struct InterceptorRegistry {
    entries: Vec<Registered>,
    next_sequence: u64,
}

impl InterceptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the interceptor called `name`.
    pub fn register(&mut self, name: impl Into<String>, priority: i32, interceptor: Arc<dyn Interceptor>) -> &mut Self {
        let name = name.into();
        match self.entries.iter_mut().find(|entry| entry.name == name) {
            Some(entry) => {
                entry.priority = priority;
                entry.interceptor = interceptor;
            }
            None => {
                let sequence = self.next_sequence;
                self.next_sequence += 1;
                self.entries.push(Registered {
                    name,
                    priority,
                    sequence,
                    interceptor,
                });
            }
        }
        self.entries.sort_by_key(|entry| (entry.priority, entry.sequence));
        self
    }

    /// Remove by name. Returns whether it was present.
    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.name != name);
        self.entries.len() != before
    }

    /// Interceptors in execution order, outermost first.
    pub fn ordered(&self) -> Vec<Arc<dyn Interceptor>> {
        self.entries.iter().map(|entry| Arc::clone(&entry.interceptor)).collect()
    }

    /// Names in execution order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|entry| entry.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wrap `terminal` with every registered interceptor.
    pub fn compose(&self, terminal: BoxHandler) -> BoxHandler {
        compose(terminal, &self.ordered())
    }
}

impl std::fmt::Debug for InterceptorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|entry| (&entry.name, entry.priority)))
            .finish()
    }
}
