//! Top-level wiring.
//!
//! ```text
//! MutationWatch ──debounce──► RetryScheduler ──► Reconciler ──► TargetResolver
//!                                   │                 │
//!                                   ▼                 └──► FetchOrchestrator ──► TtlCache
//!                               Watchdog ──(ticks)──► Reconciler
//! ```

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::info;

use crate::annotator::Annotator;
use crate::host::LifecycleSource;
use crate::reconcile::Reconciler;
use crate::retry::{BackoffPolicy, RetryScheduler, TriggerSource};
use crate::session::Session;
use crate::watch::MutationWatch;
use crate::watchdog::Watchdog;

pub struct Engine {
    session: Arc<Session>,
    reconciler: Arc<Reconciler>,
    scheduler: RetryScheduler,
    watchdog: Watchdog,
    lifecycle: Option<Arc<dyn LifecycleSource>>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("reconciler", &self.reconciler)
            .field("scheduler", &self.scheduler)
            .field("watchdog", &self.watchdog)
            .finish_non_exhaustive()
    }
}

impl Engine {
    #[must_use]
    pub fn new(session: Arc<Session>, annotators: Vec<Arc<dyn Annotator>>) -> Self {
        let config = session.config();
        let policy = BackoffPolicy::from_config(&config.retry);
        let watchdog_config = config.watchdog.clone();

        let reconciler = Arc::new(Reconciler::new(Arc::clone(&session), annotators));
        let watchdog = Watchdog::new(Arc::clone(&reconciler), watchdog_config);
        let scheduler = RetryScheduler::new(Arc::clone(&reconciler), watchdog.clone(), policy);

        Self {
            session,
            reconciler,
            scheduler,
            watchdog,
            lifecycle: None,
            watch_task: Mutex::new(None),
        }
    }

    /// Listen to host lifecycle signals as well as mutations.
    #[must_use]
    pub fn with_lifecycle(mut self, lifecycle: Arc<dyn LifecycleSource>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    #[must_use]
    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    #[must_use]
    pub fn scheduler(&self) -> &RetryScheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    /// Sweep expired cache entries, start watching the host and run the
    /// first reconcile. Calling it twice restarts the watch.
    pub fn start(&self) {
        let swept = self.session.cache().cleanup(false);
        info!(swept, "Engine starting");

        let watch = MutationWatch::new(
            Arc::clone(&self.session),
            self.scheduler.clone(),
            self.lifecycle.as_deref(),
        );
        let previous = self
            .watch_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(watch.spawn());
        if let Some(previous) = previous {
            previous.abort();
        }

        self.scheduler.trigger(TriggerSource::Initial);
    }

    pub fn trigger(&self, source: TriggerSource) {
        self.scheduler.trigger(source);
    }

    /// Stop the watch, any pending retry and the watchdog.
    pub fn shutdown(&self) {
        if let Some(task) = self
            .watch_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        self.scheduler.cancel();
        self.watchdog.stop();
        info!("Engine shut down");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let task = self
            .watch_task
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotator::{Anchor, anchor_by_class};
    use crate::clock::ManualClock;
    use crate::config::Config;
    use crate::error::Result;
    use crate::fetch::Lookup;
    use crate::host::{
        ElementSpec, InsertPosition, LifecycleEvent, ManualLifecycle, MemoryNavigator,
        MemoryTree, NodeId, RenderTree,
    };
    use crate::store::{KeyValueStore, MemoryStore};
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::time::Duration;

    struct Score;

    #[async_trait]
    impl Annotator for Score {
        fn name(&self) -> &str {
            "score"
        }
        async fn fetch(&self, identity: &str) -> Result<Option<Value>> {
            Ok(Some(json!(identity.len())))
        }
        fn anchor(&self, tree: &dyn RenderTree, root: NodeId) -> Option<Anchor> {
            anchor_by_class(tree, root, "itemLinks", InsertPosition::Before)
        }
        fn build(&self, _identity: &str, lookup: &Lookup) -> Option<ElementSpec> {
            let score = lookup.payload()?;
            Some(ElementSpec::new("span").class("score").text(score.to_string()))
        }
    }

    fn view_with_links(tree: &MemoryTree) -> NodeId {
        let view = tree
            .append(
                MemoryTree::ROOT,
                &ElementSpec::new("div").class("view-item-item"),
            )
            .unwrap();
        let links = tree
            .append(view, &ElementSpec::new("div").class("linksSection"))
            .unwrap();
        tree.append(links, &ElementSpec::new("div").class("itemLinks"))
            .unwrap();
        view
    }

    #[tokio::test(start_paused = true)]
    async fn start_sweeps_expired_entries_and_annotates() {
        let tree = Arc::new(MemoryTree::new());
        view_with_links(&tree);
        let nav = Arc::new(MemoryNavigator::new("/details?id=abc"));
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        store
            .set("embellish_old", r#"{"storedAt":0,"data":1}"#)
            .unwrap();
        clock.set(90_000_000);

        let session = Session::builder(tree.clone(), nav.clone())
            .store(store.clone())
            .clock(clock)
            .build()
            .unwrap();
        let engine = Engine::new(session, vec![Arc::new(Score) as Arc<dyn Annotator>]);
        engine.start();
        engine.scheduler().settle().await;

        assert_eq!(store.get("embellish_old").unwrap(), None);
        assert!(store.get("embellish_score_abc").unwrap().is_some());
        let scores = tree.find(None, &|e| e.has_class("score"));
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].text, "3");
        assert!(engine.watchdog().is_watching("abc"));
        engine.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn full_store_evicts_oldest_to_cache_fresh_result() {
        let tree = Arc::new(MemoryTree::new());
        view_with_links(&tree);
        let nav = Arc::new(MemoryNavigator::new("/details?id=abc"));
        let clock = Arc::new(ManualClock::new(1_000));
        let mut config = Config::default();
        config.cache.quota_bytes = 200;

        let session = Session::builder(tree.clone(), nav.clone())
            .config(config)
            .clock(clock.clone())
            .build()
            .unwrap();
        // Two 85-byte entries leave too little room for the 45-byte result.
        let filler = json!("x".repeat(40));
        session.cache().set("filler_0", &filler);
        session.cache().set("filler_1", &filler);
        assert_eq!(session.cache().stats().bytes, 170);
        clock.set(2_000);

        let engine = Engine::new(session, vec![Arc::new(Score) as Arc<dyn Annotator>]);
        engine.start();
        engine.scheduler().settle().await;

        let cache = engine.session().cache();
        assert!(cache.contains("score_abc"));
        assert!(!cache.contains("filler_0"));
        assert!(cache.contains("filler_1"));
        assert_eq!(tree.count(&|e| e.has_class("score")), 1);
        engine.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle_signal_triggers_reconcile() {
        let tree = Arc::new(MemoryTree::new());
        view_with_links(&tree);
        let nav = Arc::new(MemoryNavigator::new("/details?id=1"));
        let lifecycle = Arc::new(ManualLifecycle::new());
        let session = Session::builder(tree.clone(), nav.clone()).build().unwrap();
        let engine = Engine::new(session, vec![Arc::new(Score) as Arc<dyn Annotator>])
            .with_lifecycle(lifecycle.clone());
        engine.start();
        engine.scheduler().settle().await;
        let before = engine.scheduler().attempts();

        lifecycle.emit(LifecycleEvent::ViewShow);
        tokio::time::sleep(Duration::from_millis(250)).await;
        engine.scheduler().settle().await;
        assert_eq!(engine.scheduler().attempts(), before + 1);
        engine.shutdown();
    }
}
