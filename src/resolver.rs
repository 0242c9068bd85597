use crate::config::Route;
use moka::sync::Cache;
use std::sync::Arc;

/// Resolves the client-declared model name to a configured route. Routes
/// are scanned in declaration order and matched by exact, case-sensitive
/// comparison; the first match wins, so operators can shadow entries
/// during migrations. Routes are immutable after startup, so resolution
/// results are cached.
pub struct RouteResolver {
    routes: Arc<Vec<Route>>,
    cache: Cache<String, Option<usize>>,
}

impl RouteResolver {
    pub fn new(routes: Arc<Vec<Route>>) -> Self {
        Self {
            routes,
            cache: Cache::builder().max_capacity(10_000).build(),
        }
    }

    pub fn resolve(&self, model: &str) -> Option<&Route> {
        let index = if let Some(index) = self.cache.get(model) {
            index
        } else {
            let index = self
                .routes
                .iter()
                .position(|route| route.incoming_model == model);
            self.cache.insert(model.to_string(), index);
            index
        };
        index.and_then(|index| self.routes.get(index))
    }
}
