//! Pluggable annotation sources.
//!
//! An [`Annotator`] names one kind of annotation: where its data comes from,
//! where in the focus view it goes, and what element it renders. The
//! reconciler handles everything else (caching, dedup, markers, pruning).

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::fetch::Lookup;
use crate::host::{Element, ElementSpec, InsertPosition, NodeId, RenderTree};

/// Insertion point for an annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anchor {
    pub node: NodeId,
    pub position: InsertPosition,
}

#[async_trait]
pub trait Annotator: Send + Sync {
    /// Stable name; used in markers and cache keys.
    fn name(&self) -> &str;

    /// Cache key for the data behind `identity`.
    fn cache_key(&self, identity: &str) -> String {
        format!("{}_{identity}", self.name())
    }

    /// Fetch the payload for `identity`. `Ok(None)` means the provider has
    /// nothing for it.
    async fn fetch(&self, identity: &str) -> Result<Option<Value>>;

    /// Locate the insertion point under the focus `root`.
    fn anchor(&self, tree: &dyn RenderTree, root: NodeId) -> Option<Anchor>;

    /// Element to insert, or `None` to show nothing for this lookup.
    fn build(&self, identity: &str, lookup: &Lookup) -> Option<ElementSpec>;
}

/// First element under `root` carrying `class`, as an anchor.
#[must_use]
pub fn anchor_by_class(
    tree: &dyn RenderTree,
    root: NodeId,
    class: &str,
    position: InsertPosition,
) -> Option<Anchor> {
    tree.find(Some(root), &|e: &Element| e.has_class(class))
        .first()
        .map(|e| Anchor {
            node: e.id,
            position,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryTree;

    struct Plain;

    #[async_trait]
    impl Annotator for Plain {
        fn name(&self) -> &str {
            "plain"
        }

        async fn fetch(&self, _identity: &str) -> Result<Option<Value>> {
            Ok(None)
        }

        fn anchor(&self, tree: &dyn RenderTree, root: NodeId) -> Option<Anchor> {
            anchor_by_class(tree, root, "target", InsertPosition::After)
        }

        fn build(&self, _identity: &str, _lookup: &Lookup) -> Option<ElementSpec> {
            None
        }
    }

    #[test]
    fn default_cache_key_scopes_by_name() {
        assert_eq!(Plain.cache_key("42"), "plain_42");
    }

    #[test]
    fn anchor_by_class_finds_first_match() {
        let tree = MemoryTree::new();
        let root = tree.append(MemoryTree::ROOT, &ElementSpec::new("div")).unwrap();
        let first = tree
            .append(root, &ElementSpec::new("p").class("target"))
            .unwrap();
        tree.append(root, &ElementSpec::new("p").class("target"))
            .unwrap();

        let anchor = Plain.anchor(&tree, root).unwrap();
        assert_eq!(anchor.node, first);
        assert_eq!(anchor.position, InsertPosition::After);
        assert!(Plain.anchor(&tree, first).is_some());
    }

    #[test]
    fn missing_region_has_no_anchor() {
        let tree = MemoryTree::new();
        assert!(Plain.anchor(&tree, MemoryTree::ROOT).is_none());
    }
}
