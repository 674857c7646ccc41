//! Scripted host session on the in-memory host.
//!
//! Plays a late-rendering view, a host overwrite and a navigation onto a
//! recycled view against the real engine, and records the tree after each
//! step.

use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use embellish_core::annotator::anchor_by_class;
use embellish_core::config::Config;
use embellish_core::fetch::Lookup;
use embellish_core::host::{
    ElementSpec, InsertPosition, MemoryNavigator, MemoryTree, NodeId, RenderTree,
};
use embellish_core::store::MemoryStore;
use embellish_core::target::requires_regions;
use embellish_core::{Anchor, Annotator, Engine, Session};

const FIRST_ADDRESS: &str = "/web/index.html#!/details?id=tt0111161&serverId=demo";
const SECOND_ADDRESS: &str = "/web/index.html#!/details?id=tt0068646&serverId=demo";

/// Deterministic stand-in for a rating provider.
struct DemoRating;

#[async_trait]
impl Annotator for DemoRating {
    fn name(&self) -> &str {
        "rating"
    }

    async fn fetch(&self, identity: &str) -> embellish_core::Result<Option<Value>> {
        tokio::time::sleep(Duration::from_millis(30)).await;
        let score = identity.bytes().map(u64::from).sum::<u64>() % 10 + 1;
        Ok(Some(json!({ "score": score })))
    }

    fn anchor(&self, tree: &dyn RenderTree, root: NodeId) -> Option<Anchor> {
        anchor_by_class(tree, root, "linksSection", InsertPosition::Before)
    }

    fn build(&self, _identity: &str, lookup: &Lookup) -> Option<ElementSpec> {
        let score = lookup.payload()?.get("score")?.as_u64()?;
        Some(
            ElementSpec::new("div")
                .class("rating")
                .text(format!("rated {score}/10")),
        )
    }
}

/// Scale every timing down so the script finishes in about a second.
fn accelerated(mut config: Config) -> Config {
    config.watch.debounce_ms = 20;
    config.watch.nav_poll_ms = 25;
    config.retry.base_delay_ms = 20;
    config.retry.increment_ms = 10;
    config.retry.max_delay_ms = 100;
    config.watchdog.interval_ms = 25;
    config.watchdog.stable_ticks = 4;
    config.watchdog.max_ticks = 40;
    config
}

fn step(out: &mut String, title: &str, tree: &MemoryTree) {
    debug!(step = title, "Simulation step");
    let _ = writeln!(out, "== {title}");
    out.push_str(&tree.render());
    out.push('\n');
}

async fn pause(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Run the script and return the transcript.
pub async fn run(config: Config) -> Result<String> {
    let tree = Arc::new(MemoryTree::new());
    let nav = Arc::new(MemoryNavigator::new(FIRST_ADDRESS));
    let view = tree.append(
        MemoryTree::ROOT,
        &ElementSpec::new("div")
            .class(&config.focus.focus_class)
            .child(ElementSpec::new("h1").text("The Shawshank Redemption")),
    )?;

    let quota = config.cache.quota_bytes;
    let session = Session::builder(tree.clone(), nav.clone())
        .config(accelerated(config))
        .store(Arc::new(MemoryStore::with_quota(quota)))
        .readiness(requires_regions(vec!["linksSection".to_string()]))
        .build()?;
    let engine = Engine::new(session, vec![Arc::new(DemoRating) as Arc<dyn Annotator>]);
    let mut out = String::new();

    engine.start();
    pause(10).await;
    step(&mut out, "initial render, links region still missing", &tree);

    pause(60).await;
    tree.append(view, &ElementSpec::new("div").class("linksSection"))?;
    engine.scheduler().settle().await;
    pause(50).await;
    step(&mut out, "links region rendered late", &tree);

    for ours in tree.find(Some(view), &|e| e.has_class("rating")) {
        tree.remove(ours.id)?;
    }
    pause(200).await;
    step(&mut out, "host wiped the annotation, engine restored it", &tree);

    nav.navigate(SECOND_ADDRESS);
    if let Some(title) = tree.find(Some(view), &|e| e.tag == "h1").first() {
        tree.remove(title.id)?;
    }
    tree.insert(
        view,
        InsertPosition::Prepend,
        &ElementSpec::new("h1").text("The Godfather"),
    )?;
    pause(300).await;
    step(&mut out, "navigated, view recycled", &tree);

    let attempts = engine.scheduler().attempts();
    let stats = engine.session().cache().stats();
    engine.shutdown();

    let _ = writeln!(
        out,
        "reconcile attempts: {attempts}, cached entries: {}",
        stats.entries
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn script_ends_with_second_identity_annotated() {
        let transcript = run(Config::default()).await.unwrap();
        let steps: Vec<&str> = transcript.split("== ").skip(1).collect();
        assert_eq!(steps.len(), 4);

        assert!(!steps[0].contains("rating"));
        assert!(steps[1].contains("data-embellish-key=\"tt0111161\""));
        assert!(steps[2].contains("data-embellish-key=\"tt0111161\""));
        assert!(steps[3].contains("data-embellish-key=\"tt0068646\""));
        assert!(!steps[3].contains("data-embellish-key=\"tt0111161\""));
        assert!(transcript.contains("cached entries: 2"));
    }
}
