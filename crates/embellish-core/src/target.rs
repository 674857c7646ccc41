//! Focus view detection.
//!
//! The host keeps several candidate views alive at once and marks all but
//! one inactive with a hidden class. [`TargetResolver`] finds the active one
//! and pairs it with the identity key read from the navigation address.

use std::sync::Arc;

use crate::config::FocusConfig;
use crate::host::{Element, Navigator, NodeId, RenderTree, identity_from_address};

/// The view currently in focus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FocusTarget {
    pub identity_key: String,
    pub is_ready: bool,
    /// Only valid for the cycle that resolved it.
    pub root: NodeId,
}

/// Caller-supplied readiness test over the focus subtree.
pub type ReadinessCheck = Arc<dyn Fn(&dyn RenderTree, NodeId) -> bool + Send + Sync>;

/// Every focus view counts as ready.
#[must_use]
pub fn always_ready() -> ReadinessCheck {
    Arc::new(|_: &dyn RenderTree, _: NodeId| true)
}

/// Ready once every class in `classes` occurs somewhere under the root.
#[must_use]
pub fn requires_regions(classes: Vec<String>) -> ReadinessCheck {
    Arc::new(move |tree: &dyn RenderTree, root: NodeId| {
        classes.iter().all(|class| {
            !tree
                .find(Some(root), &|e: &Element| e.has_class(class))
                .is_empty()
        })
    })
}

pub struct TargetResolver {
    tree: Arc<dyn RenderTree>,
    navigator: Arc<dyn Navigator>,
    focus: FocusConfig,
    ready: ReadinessCheck,
}

impl std::fmt::Debug for TargetResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetResolver")
            .field("focus", &self.focus)
            .finish_non_exhaustive()
    }
}

impl TargetResolver {
    #[must_use]
    pub fn new(
        tree: Arc<dyn RenderTree>,
        navigator: Arc<dyn Navigator>,
        focus: FocusConfig,
        ready: ReadinessCheck,
    ) -> Self {
        Self {
            tree,
            navigator,
            focus,
            ready,
        }
    }

    /// Whether `element` is a focus candidate that is currently shown.
    #[must_use]
    pub fn is_active_candidate(&self, element: &Element) -> bool {
        element.has_class(&self.focus.focus_class) && !element.has_class(&self.focus.hidden_class)
    }

    #[must_use]
    pub fn is_candidate(&self, element: &Element) -> bool {
        element.has_class(&self.focus.focus_class)
    }

    /// Root of the visible candidate; the first in document order wins.
    #[must_use]
    pub fn focus_root(&self) -> Option<NodeId> {
        self.tree
            .find(None, &|e| self.is_active_candidate(e))
            .first()
            .map(|e| e.id)
    }

    #[must_use]
    pub fn current_identity(&self) -> Option<String> {
        identity_from_address(
            &self.navigator.current_address(),
            &self.focus.identity_param,
        )
    }

    /// Resolve the focus view afresh from the live tree.
    #[must_use]
    pub fn current_focus(&self) -> Option<FocusTarget> {
        let root = self.focus_root()?;
        let identity_key = self.current_identity()?;
        let is_ready = (self.ready)(self.tree.as_ref(), root);
        Some(FocusTarget {
            identity_key,
            is_ready,
            root,
        })
    }
}
