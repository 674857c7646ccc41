//! Idempotent annotation reconciliation.
//!
//! One [`Reconciler::reconcile`] call inspects the focus view, works out which
//! annotators have nothing attached for the current identity, fetches their
//! data and attaches the built elements. Calling it again on an unchanged
//! view changes nothing.
//!
//! # Markers
//!
//! - every inserted element carries [`OWNED_ATTR`] (the annotator name) and
//!   [`KEY_ATTR`] (the identity it was built for)
//! - the focus root carries `data-embellish-<annotator> = <identity>` once
//!   that annotator's element is in place
//!
//! The live focus is resolved again after the fetch phase. A cycle whose
//! identity no longer matches the live view drops its results.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::annotator::Annotator;
use crate::error::HostError;
use crate::fetch::Lookup;
use crate::host::{Element, NodeId, RenderTree};
use crate::session::Session;

/// Attribute marking an element inserted by the engine.
pub const OWNED_ATTR: &str = "data-embellish-owned";
/// Attribute recording the identity an inserted element was built for.
pub const KEY_ATTR: &str = "data-embellish-key";
/// Prefix shared by every attribute the engine writes.
pub const MARKER_PREFIX: &str = "data-embellish-";

/// Root marker attribute for `annotator`.
#[must_use]
pub fn root_marker(annotator: &str) -> String {
    format!("{MARKER_PREFIX}{annotator}")
}

/// Whether `element` was inserted by the engine.
#[must_use]
pub fn is_owned(element: &Element) -> bool {
    element.attr(OWNED_ATTR).is_some()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Every annotation for `identity` is in place; `attached` were added by
    /// this call.
    Succeeded { identity: String, attached: usize },
    /// The focus view exists but the host has not finished populating it.
    NotReady { identity: String },
    /// No focus view, or the focus changed while this cycle was fetching.
    NoOp,
}

impl ReconcileOutcome {
    #[must_use]
    pub fn identity(&self) -> Option<&str> {
        match self {
            Self::Succeeded { identity, .. } | Self::NotReady { identity } => Some(identity),
            Self::NoOp => None,
        }
    }

    /// Whether this call found something to do.
    #[must_use]
    pub fn did_work(&self) -> bool {
        match self {
            Self::Succeeded { attached, .. } => *attached > 0,
            Self::NotReady { .. } => true,
            Self::NoOp => false,
        }
    }
}

pub struct Reconciler {
    session: Arc<Session>,
    annotators: Vec<Arc<dyn Annotator>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field(
                "annotators",
                &self.annotators.iter().map(|a| a.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

fn owned_by(tree: &dyn RenderTree, root: NodeId, annotator: &str) -> Vec<Element> {
    tree.find(Some(root), &|e: &Element| e.attr(OWNED_ATTR) == Some(annotator))
}

fn is_annotated(tree: &dyn RenderTree, root: NodeId, annotator: &str, identity: &str) -> bool {
    let marker_matches = tree
        .element(root)
        .is_some_and(|e| e.attr(&root_marker(annotator)) == Some(identity));
    if !marker_matches {
        return false;
    }
    let owned = owned_by(tree, root, annotator);
    owned.len() == 1 && owned[0].attr(KEY_ATTR) == Some(identity)
}

impl Reconciler {
    #[must_use]
    pub fn new(session: Arc<Session>, annotators: Vec<Arc<dyn Annotator>>) -> Self {
        Self {
            session,
            annotators,
        }
    }

    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Whether every annotator's data for `identity` is settled: cached, or
    /// known to fail until the next fresh trigger.
    #[must_use]
    pub fn data_cached(&self, identity: &str) -> bool {
        self.annotators.iter().all(|a| {
            let key = a.cache_key(identity);
            self.session.cache().contains(&key) || self.session.has_failed(&key)
        })
    }

    pub async fn reconcile(&self) -> ReconcileOutcome {
        let resolver = self.session.resolver();
        let Some(focus) = resolver.current_focus() else {
            return ReconcileOutcome::NoOp;
        };
        let identity = focus.identity_key;
        let tree = self.session.tree().as_ref();

        let pending: Vec<&Arc<dyn Annotator>> = self
            .annotators
            .iter()
            .filter(|a| !is_annotated(tree, focus.root, a.name(), &identity))
            .collect();
        if pending.is_empty() {
            return ReconcileOutcome::Succeeded {
                identity,
                attached: 0,
            };
        }

        if !focus.is_ready {
            debug!(identity = %identity, "Focus view not ready");
            return ReconcileOutcome::NotReady { identity };
        }

        let mut lookups = Vec::with_capacity(pending.len());
        for annotator in pending {
            let key = annotator.cache_key(&identity);
            let lookup = if self.session.has_failed(&key) {
                Lookup::Unknown
            } else {
                let lookup = self
                    .session
                    .fetcher()
                    .resolve(&key, || annotator.fetch(&identity))
                    .await;
                if lookup.is_unknown() {
                    self.session.remember_failure(&key);
                }
                lookup
            };
            lookups.push((annotator, lookup));
        }

        // The view may have changed while fetching; only the live one counts.
        let Some(live) = resolver.current_focus() else {
            debug!(identity = %identity, "Focus vanished during fetch");
            return ReconcileOutcome::NoOp;
        };
        if live.identity_key != identity {
            debug!(
                identity = %identity,
                live = %live.identity_key,
                "Discarding results for stale focus"
            );
            return ReconcileOutcome::NoOp;
        }
        if !live.is_ready {
            return ReconcileOutcome::NotReady { identity };
        }

        let mut attached = 0;
        for (annotator, lookup) in lookups {
            match self.attach(tree, live.root, annotator.as_ref(), &identity, &lookup) {
                Ok(Some(count)) => attached += count,
                Ok(None) => {
                    debug!(annotator = annotator.name(), identity = %identity, "Anchor region missing");
                    return ReconcileOutcome::NotReady { identity };
                }
                Err(err) => {
                    warn!(annotator = annotator.name(), identity = %identity, error = %err, "Host changed under reconcile");
                    return ReconcileOutcome::NotReady { identity };
                }
            }
        }

        if attached > 0 {
            info!(identity = %identity, attached, "Annotations attached");
        }
        ReconcileOutcome::Succeeded { identity, attached }
    }

    /// Bring one annotator's element under `root` in line with `identity`.
    ///
    /// Returns the number of inserted elements, or `None` when the anchor
    /// region is missing.
    fn attach(
        &self,
        tree: &dyn RenderTree,
        root: NodeId,
        annotator: &dyn Annotator,
        identity: &str,
        lookup: &Lookup,
    ) -> Result<Option<usize>, HostError> {
        let name = annotator.name();
        let marker = root_marker(name);

        // Drop leftovers from a recycled view and host-made duplicates.
        let mut kept = false;
        for element in owned_by(tree, root, name) {
            if !kept && element.attr(KEY_ATTR) == Some(identity) {
                kept = true;
                continue;
            }
            debug!(annotator = name, node = %element.id, "Pruning stale annotation");
            self.session.note_pruned(element.id);
            if let Err(err) = tree.remove(element.id) {
                self.session.forget_pruned(element.id);
                return Err(err);
            }
        }

        if kept {
            tree.set_attribute(root, &marker, identity)?;
            return Ok(Some(0));
        }

        let Some(spec) = annotator.build(identity, lookup) else {
            return Ok(Some(0));
        };
        let Some(anchor) = annotator.anchor(tree, root) else {
            return Ok(None);
        };

        let spec = spec.attr(OWNED_ATTR, name).attr(KEY_ATTR, identity);
        tree.insert(anchor.node, anchor.position, &spec)?;
        tree.set_attribute(root, &marker, identity)?;
        Ok(Some(1))
    }
}
