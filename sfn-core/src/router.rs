//! Routing along the configured pipeline.
//!
//! A [`Route`] is built once per loaded workflow and shared read-only by
//! every forwarding task. Every app id resolves to the same route; reloading
//! the workflow swaps workflow and route together.

use crate::workflow::WorkflowConfig;
use parking_lot::RwLock;
use std::sync::Arc;

/// Ordered stream-function names for one workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    workflow: String,
    names: Vec<String>,
}

impl Route {
    pub fn new(workflow: impl Into<String>, names: Vec<String>) -> Self {
        Self {
            workflow: workflow.into(),
            names,
        }
    }

    /// Name of the workflow this route was built from.
    pub fn workflow(&self) -> &str {
        &self.workflow
    }

    /// All names in pipeline order.
    pub fn all(&self) -> &[String] {
        &self.names
    }

    /// Name at pipeline position `index`.
    pub fn get(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Names configured after `current`. Unknown names yield an empty set.
    pub fn forward_routes(&self, current: &str) -> Vec<String> {
        match self.position(current) {
            Some(i) => self.names[i + 1..].to_vec(),
            None => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// A workflow and the route built from it.
#[derive(Debug)]
struct Loaded {
    workflow: Arc<WorkflowConfig>,
    route: Arc<Route>,
}

impl Loaded {
    fn new(workflow: WorkflowConfig) -> Self {
        let route = Arc::new(Route::new(
            workflow.name.clone(),
            workflow.function_names(),
        ));
        tracing::debug!(
            "Built route for workflow '{}': {:?}",
            route.workflow(),
            route.all()
        );
        Self {
            workflow: Arc::new(workflow),
            route,
        }
    }
}

/// Holds the active workflow and its route.
#[derive(Debug, Default)]
pub struct Router {
    loaded: RwLock<Option<Loaded>>,
}

impl Router {
    pub fn new(workflow: WorkflowConfig) -> Self {
        Self {
            loaded: RwLock::new(Some(Loaded::new(workflow))),
        }
    }

    /// Router with no workflow; every lookup yields no route.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn workflow(&self) -> Option<Arc<WorkflowConfig>> {
        self.loaded.read().as_ref().map(|l| l.workflow.clone())
    }

    /// Route for `app_id`.
    ///
    /// Returns `None` and logs an error when no workflow is loaded.
    pub fn route(&self, app_id: &str) -> Option<Arc<Route>> {
        let route = self.loaded.read().as_ref().map(|l| l.route.clone());
        if route.is_none() {
            tracing::error!("No workflow configured, cannot route app '{}'", app_id);
        }
        route
    }

    /// Names configured after `current` in the route for `app_id`.
    pub fn forward_routes(&self, app_id: &str, current: &str) -> Vec<String> {
        self.route(app_id)
            .map(|route| route.forward_routes(current))
            .unwrap_or_default()
    }

    /// Replaces the workflow and its route.
    pub fn reload(&self, workflow: WorkflowConfig) {
        let loaded = Loaded::new(workflow);
        *self.loaded.write() = Some(loaded);
        tracing::info!("Workflow reloaded, route rebuilt");
    }

    /// Removes the workflow; later lookups yield no route.
    pub fn clear(&self) {
        *self.loaded.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::FunctionConfig;

    fn workflow(names: &[&str]) -> WorkflowConfig {
        WorkflowConfig {
            name: "p".to_string(),
            host: "localhost".to_string(),
            port: 9000,
            functions: names.iter().map(|n| FunctionConfig::new(*n)).collect(),
            downstreams: Vec::new(),
        }
    }

    #[test]
    fn test_forward_routes() {
        let router = Router::new(workflow(&["A", "B", "C"]));
        let route = router.route("app").unwrap();

        assert_eq!(route.forward_routes("A"), vec!["B", "C"]);
        assert_eq!(route.forward_routes("B"), vec!["C"]);
        assert!(route.forward_routes("C").is_empty());
        assert!(route.forward_routes("unknown").is_empty());
        assert_eq!(route.get(0), Some("A"));
        assert_eq!(route.len(), 3);
    }

    #[test]
    fn test_route_is_cached() {
        let router = Router::new(workflow(&["A"]));
        let first = router.route("app").unwrap();
        let second = router.route("app").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_no_workflow() {
        let router = Router::empty();
        assert!(router.route("app").is_none());
        assert!(router.forward_routes("app", "A").is_empty());
    }

    #[test]
    fn test_reload_rebuilds() {
        let router = Router::new(workflow(&["A", "B"]));
        assert_eq!(router.forward_routes("app", "A"), vec!["B"]);

        router.reload(workflow(&["A", "C", "D"]));
        assert_eq!(router.forward_routes("app", "A"), vec!["C", "D"]);

        router.clear();
        assert!(router.route("app").is_none());
    }

    #[test]
    fn test_app_ids_share_one_route() {
        let router = Router::new(workflow(&["A", "B"]));
        let first = router.route("app-1").unwrap();
        for i in 0..1000 {
            let route = router.route(&format!("app-{}", i)).unwrap();
            assert!(Arc::ptr_eq(&first, &route));
        }
        assert_eq!(first.workflow(), "p");
    }

    #[test]
    fn test_lookups_never_see_stale_route_after_reload() {
        let router = Arc::new(Router::new(workflow(&["A", "B"])));
        let readers: Vec<_> = (0..4)
            .map(|t| {
                let router = router.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        let _ = router.forward_routes(&format!("app-{}-{}", t, i), "A");
                    }
                })
            })
            .collect();
        for i in 0..50 {
            let next = if i % 2 == 0 { &["A", "C"][..] } else { &["A", "B"][..] };
            router.reload(workflow(next));
        }
        router.reload(workflow(&["A", "D", "E"]));
        for reader in readers {
            reader.join().unwrap();
        }

        assert_eq!(router.forward_routes("any", "A"), vec!["D", "E"]);
        assert_eq!(
            router.route("other").unwrap().all(),
            router.workflow().unwrap().function_names().as_slice()
        );
    }

    #[test]
    fn test_concurrent_lookups() {
        let router = Arc::new(Router::new(workflow(&["A", "B", "C"])));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let router = router.clone();
                std::thread::spawn(move || router.forward_routes("app", "A"))
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), vec!["B", "C"]);
        }
    }
}
