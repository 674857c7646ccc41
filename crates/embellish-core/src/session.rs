//! Per-session context shared by the reconciler, scheduler and watchdog.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::cache::TtlCache;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::Result;
use crate::fetch::FetchOrchestrator;
use crate::host::{Navigator, NodeId, RenderTree};
use crate::store::{KeyValueStore, MemoryStore};
use crate::target::{ReadinessCheck, TargetResolver, always_ready};

pub struct Session {
    config: Config,
    cache: Arc<TtlCache>,
    fetcher: FetchOrchestrator,
    resolver: TargetResolver,
    tree: Arc<dyn RenderTree>,
    navigator: Arc<dyn Navigator>,
    /// Cache keys whose provider failed since the last fresh trigger.
    failed: Mutex<HashSet<String>>,
    /// Nodes the reconciler removed whose removal has not been observed yet.
    pruned: Mutex<HashSet<NodeId>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("cache", &self.cache)
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

impl Session {
    #[must_use]
    pub fn builder(tree: Arc<dyn RenderTree>, navigator: Arc<dyn Navigator>) -> SessionBuilder {
        SessionBuilder::new(tree, navigator)
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<TtlCache> {
        &self.cache
    }

    #[must_use]
    pub fn fetcher(&self) -> &FetchOrchestrator {
        &self.fetcher
    }

    #[must_use]
    pub fn resolver(&self) -> &TargetResolver {
        &self.resolver
    }

    #[must_use]
    pub fn tree(&self) -> &Arc<dyn RenderTree> {
        &self.tree
    }

    #[must_use]
    pub fn navigator(&self) -> &Arc<dyn Navigator> {
        &self.navigator
    }

    pub fn remember_failure(&self, key: &str) {
        self.failed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string());
    }

    #[must_use]
    pub fn has_failed(&self, key: &str) -> bool {
        self.failed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }

    /// Forget provider failures so the next cycle asks again.
    pub fn clear_failures(&self) {
        self.failed.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Record that the engine is about to remove `id` itself.
    pub fn note_pruned(&self, id: NodeId) {
        self.pruned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id);
    }

    #[must_use]
    pub fn was_pruned(&self, id: NodeId) -> bool {
        self.pruned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&id)
    }

    pub fn forget_pruned(&self, id: NodeId) {
        self.pruned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }
}

pub struct SessionBuilder {
    tree: Arc<dyn RenderTree>,
    navigator: Arc<dyn Navigator>,
    config: Config,
    store: Option<Arc<dyn KeyValueStore>>,
    clock: Option<Arc<dyn Clock>>,
    readiness: Option<ReadinessCheck>,
}

impl SessionBuilder {
    #[must_use]
    pub fn new(tree: Arc<dyn RenderTree>, navigator: Arc<dyn Navigator>) -> Self {
        Self {
            tree,
            navigator,
            config: Config::default(),
            store: None,
            clock: None,
            readiness: None,
        }
    }

    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Persistence backend; by default a [`MemoryStore`] bounded by
    /// `[cache] quota_bytes`.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Readiness test for the focus subtree; every view is ready by default.
    #[must_use]
    pub fn readiness(mut self, readiness: ReadinessCheck) -> Self {
        self.readiness = Some(readiness);
        self
    }

    /// Validate the configuration and assemble the session.
    pub fn build(self) -> Result<Arc<Session>> {
        self.config.validate()?;

        let store = self
            .store
            .unwrap_or_else(|| {
                Arc::new(MemoryStore::with_quota(self.config.cache.quota_bytes))
                    as Arc<dyn KeyValueStore>
            });
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let cache = Arc::new(TtlCache::new(
            store,
            clock,
            self.config.cache.prefix.clone(),
            self.config.cache.ttl(),
        ));
        let fetcher = FetchOrchestrator::new(Arc::clone(&cache), self.config.fetch.timeout());
        let resolver = TargetResolver::new(
            Arc::clone(&self.tree),
            Arc::clone(&self.navigator),
            self.config.focus.clone(),
            self.readiness.unwrap_or_else(always_ready),
        );

        Ok(Arc::new(Session {
            config: self.config,
            cache,
            fetcher,
            resolver,
            tree: self.tree,
            navigator: self.navigator,
            failed: Mutex::new(HashSet::new()),
            pruned: Mutex::new(HashSet::new()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::host::{MemoryNavigator, MemoryTree};

    fn builder() -> SessionBuilder {
        Session::builder(
            Arc::new(MemoryTree::new()),
            Arc::new(MemoryNavigator::new("/")),
        )
    }

    #[test]
    fn builds_with_defaults() {
        let session = builder().build().unwrap();
        assert_eq!(session.cache().prefix(), "embellish_");
        assert_eq!(session.fetcher().in_flight(), 0);
    }

    #[test]
    fn rejects_invalid_config() {
        let mut config = Config::default();
        config.cache.prefix.clear();
        assert!(matches!(
            builder().config(config).build(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn failure_memo_clears() {
        let session = builder().build().unwrap();
        session.remember_failure("a_1");
        assert!(session.has_failed("a_1"));
        session.clear_failures();
        assert!(!session.has_failed("a_1"));
    }

    #[test]
    fn default_store_honours_configured_quota() {
        let mut config = Config::default();
        config.cache.quota_bytes = 16;
        let session = builder().config(config).build().unwrap();
        let outcome = session
            .cache()
            .set("big", &serde_json::json!("far more than sixteen bytes"));
        assert_eq!(outcome, crate::cache::WriteOutcome::Dropped);
        assert!(!session.cache().contains("big"));
    }

    #[test]
    fn pruned_nodes_are_tracked_until_forgotten() {
        let session = builder().build().unwrap();
        session.note_pruned(NodeId(4));
        assert!(session.was_pruned(NodeId(4)));
        session.forget_pruned(NodeId(4));
        assert!(!session.was_pruned(NodeId(4)));
    }
}
