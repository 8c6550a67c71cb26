use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Decides whether one subscriber receives one published payload.
///
/// Arguments: the event payload, the subscriber's variables, and the
/// server-level context.
pub type Filter = Arc<dyn Fn(&Value, &Map<String, Value>, &Value) -> bool + Send + Sync>;

/// Subscription name -> filter, fixed once the server is built.
#[derive(Clone, Default)]
pub struct FilterTable {
    filters: HashMap<String, Filter>,
}

impl FilterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) the filter for `subscription_name`.
    pub fn with<F>(mut self, subscription_name: impl Into<String>, filter: F) -> Self
    where
        F: Fn(&Value, &Map<String, Value>, &Value) -> bool + Send + Sync + 'static,
    {
        self.filters.insert(subscription_name.into(), Arc::new(filter));
        self
    }

    pub fn get(&self, subscription_name: &str) -> Option<Filter> {
        self.filters.get(subscription_name).cloned()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl fmt::Debug for FilterTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.filters.keys().collect();
        names.sort();
        f.debug_struct("FilterTable").field("filters", &names).finish()
    }
}

/// Run a filter, treating a panic as a rejection for this subscriber only.
pub(crate) fn accepts(
    filter: &Filter,
    payload: &Value,
    variables: &Map<String, Value>,
    context: &Value,
) -> bool {
    panic::catch_unwind(AssertUnwindSafe(|| filter(payload, variables, context))).unwrap_or(false)
}
