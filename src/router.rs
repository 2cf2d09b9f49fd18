//! Radix-tree method router.
//!
//! One tree, keyed by full method path. O(path-length) lookup. You register a
//! method, you get a handler. Interceptors live in the chain, not here.

use std::sync::Arc;

use matchit::Router as MatchitRouter;

use crate::handler::{BoxedHandler, Handler};

/// Maps full method paths (`/<package>.<Service>/<Method>`) to handlers.
///
/// Build it once at startup and pass it to [`Server::new`](crate::Server::new).
/// Each [`Router::route`] call returns `self` so registrations chain naturally.
pub struct Router {
    methods: MatchitRouter<BoxedHandler>,
    names: Vec<String>,
}

impl Router {
    pub fn new() -> Self {
        Self { methods: MatchitRouter::new(), names: Vec::new() }
    }

    /// Registers `handler` for `path`.
    ///
    /// # Panics
    ///
    /// Panics if `path` is registered twice or is not a valid route; both are
    /// startup wiring mistakes.
    pub fn route(mut self, path: &str, handler: impl Handler) -> Self {
        self.methods
            .insert(path, handler.into_boxed_handler())
            .unwrap_or_else(|e| panic!("invalid method path `{path}`: {e}"));
        self.names.push(path.to_owned());
        self
    }

    pub(crate) fn lookup(&self, path: &str) -> Option<BoxedHandler> {
        let matched = self.methods.at(path).ok()?;
        Some(Arc::clone(matched.value))
    }

    /// Registered method paths, in registration order.
    pub fn methods(&self) -> &[String] {
        &self.names
    }
}

impl Default for Router {
    fn default() -> Self { Self::new() }
}
