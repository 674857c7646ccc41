//! Host collaborators: the externally owned render tree, the navigation
//! address and optional lifecycle signals.
//!
//! The engine never owns the host. It reads and mutates the tree through
//! [`RenderTree`], polls the address through [`Navigator`] and listens to
//! [`LifecycleSource`] when one exists. [`MemoryTree`], [`MemoryNavigator`]
//! and [`ManualLifecycle`] are in-process hosts for tests and simulation.
//!
//! # Mutation batches
//!
//! Every structural or attribute change on a [`RenderTree`] is published as a
//! [`MutationBatch`]. Element payloads are snapshots taken at the time of the
//! change; `added` lists the inserted subtree roots only.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::HostError;

pub(crate) const MUTATION_CHANNEL_CAPACITY: usize = 256;
const LIFECYCLE_CHANNEL_CAPACITY: usize = 32;

/// Opaque handle to a node in a render tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Snapshot of a single element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub id: NodeId,
    pub tag: String,
    pub attributes: BTreeMap<String, String>,
    pub text: String,
}

impl Element {
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.attr("class").unwrap_or_default().split_whitespace()
    }

    #[must_use]
    pub fn has_class(&self, class: &str) -> bool {
        self.classes().any(|c| c == class)
    }
}

/// Blueprint for an element subtree to insert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementSpec {
    pub tag: String,
    pub attributes: BTreeMap<String, String>,
    pub text: String,
    pub children: Vec<ElementSpec>,
}

impl ElementSpec {
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }

    /// Append a class to the `class` attribute.
    #[must_use]
    pub fn class(mut self, class: &str) -> Self {
        let entry = self.attributes.entry("class".to_string()).or_default();
        if !entry.is_empty() {
            entry.push(' ');
        }
        entry.push_str(class);
        self
    }

    #[must_use]
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    #[must_use]
    pub fn child(mut self, child: ElementSpec) -> Self {
        self.children.push(child);
        self
    }
}

/// Where an inserted subtree lands relative to its anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPosition {
    /// Last child of the anchor.
    Append,
    /// First child of the anchor.
    Prepend,
    /// Sibling immediately before the anchor.
    Before,
    /// Sibling immediately after the anchor.
    After,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    ChildList {
        target: NodeId,
        added: Vec<Element>,
        removed: Vec<Element>,
    },
    Attribute {
        target: Element,
        name: String,
        old_value: Option<String>,
    },
}

/// Changes delivered together to subscribers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationBatch {
    pub mutations: Vec<Mutation>,
}

/// Read/mutate capability over an externally owned render tree.
pub trait RenderTree: Send + Sync {
    /// The document root.
    fn root(&self) -> NodeId;

    /// Elements matching `predicate` under `scope` (inclusive), in document
    /// order. `None` searches the whole document.
    fn find(&self, scope: Option<NodeId>, predicate: &dyn Fn(&Element) -> bool) -> Vec<Element>;

    fn element(&self, id: NodeId) -> Option<Element>;

    fn parent(&self, id: NodeId) -> Option<NodeId>;

    fn set_attribute(&self, id: NodeId, name: &str, value: &str) -> Result<(), HostError>;

    fn remove_attribute(&self, id: NodeId, name: &str) -> Result<(), HostError>;

    /// Insert a subtree built from `spec` and return its root.
    fn insert(
        &self,
        anchor: NodeId,
        position: InsertPosition,
        spec: &ElementSpec,
    ) -> Result<NodeId, HostError>;

    /// Detach `id` and its descendants.
    fn remove(&self, id: NodeId) -> Result<(), HostError>;

    fn subscribe(&self) -> broadcast::Receiver<MutationBatch>;
}

/// Reads the host's current navigation address.
pub trait Navigator: Send + Sync {
    fn current_address(&self) -> String;
}

/// Host lifecycle signals the engine may listen to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleEvent {
    ViewShow,
    PageShow,
    HashChange,
    PopState,
}

/// Optional source of [`LifecycleEvent`]s. `None` means the host exposes none.
pub trait LifecycleSource: Send + Sync {
    fn subscribe(&self) -> Option<broadcast::Receiver<LifecycleEvent>>;
}

/// Extract the identity parameter `param` from a navigation address.
///
/// Checked in order: the query string, the query part of the fragment
/// (`#!/item?id=…`), then a raw `?param=` / `&param=` scan.
#[must_use]
pub fn identity_from_address(address: &str, param: &str) -> Option<String> {
    let (before_fragment, fragment) = match address.split_once('#') {
        Some((head, frag)) => (head, Some(frag)),
        None => (address, None),
    };

    let from_query = |query: &str| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, v)| k == param && !v.is_empty())
            .map(|(_, v)| v.into_owned())
    };

    if let Some((_, query)) = before_fragment.split_once('?') {
        if let Some(found) = from_query(query) {
            return Some(found);
        }
    }

    if let Some((_, query)) = fragment.and_then(|f| f.split_once('?')) {
        if let Some(found) = from_query(query) {
            return Some(found);
        }
    }

    for sep in ['?', '&'] {
        let needle = format!("{sep}{param}=");
        if let Some(pos) = address.find(&needle) {
            let value: String = address[pos + needle.len()..]
                .chars()
                .take_while(|c| !matches!(c, '&' | '#' | '?' | '/'))
                .collect();
            if !value.is_empty() {
                return Some(value);
            }
        }
    }

    None
}

#[derive(Debug)]
struct Node {
    element: Element,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

#[derive(Debug)]
struct TreeState {
    nodes: HashMap<NodeId, Node>,
    next_id: u64,
}

impl TreeState {
    fn node(&self, id: NodeId) -> Result<&Node, HostError> {
        self.nodes.get(&id).ok_or(HostError::NodeNotFound(id.0))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, HostError> {
        self.nodes.get_mut(&id).ok_or(HostError::NodeNotFound(id.0))
    }

    fn build(&mut self, spec: &ElementSpec, parent: NodeId) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        let children: Vec<NodeId> = spec.children.iter().map(|c| self.build(c, id)).collect();
        self.nodes.insert(
            id,
            Node {
                element: Element {
                    id,
                    tag: spec.tag.clone(),
                    attributes: spec.attributes.clone(),
                    text: spec.text.clone(),
                },
                parent: Some(parent),
                children,
            },
        );
        id
    }

    fn collect(&self, id: NodeId, predicate: &dyn Fn(&Element) -> bool, out: &mut Vec<Element>) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        if predicate(&node.element) {
            out.push(node.element.clone());
        }
        for child in &node.children {
            self.collect(*child, predicate, out);
        }
    }

    fn drop_subtree(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.remove(&id) {
            for child in node.children {
                self.drop_subtree(child);
            }
        }
    }
}

/// In-memory render tree rooted at a `body` element.
#[derive(Debug)]
pub struct MemoryTree {
    state: Mutex<TreeState>,
    events: broadcast::Sender<MutationBatch>,
}

impl Default for MemoryTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTree {
    pub const ROOT: NodeId = NodeId(0);

    #[must_use]
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            Self::ROOT,
            Node {
                element: Element {
                    id: Self::ROOT,
                    tag: "body".to_string(),
                    attributes: BTreeMap::new(),
                    text: String::new(),
                },
                parent: None,
                children: Vec::new(),
            },
        );
        let (events, _) = broadcast::channel(MUTATION_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(TreeState { nodes, next_id: 1 }),
            events,
        }
    }

    fn publish(&self, mutation: Mutation) {
        // No subscribers is fine.
        let _ = self.events.send(MutationBatch {
            mutations: vec![mutation],
        });
    }

    /// Append `spec` as the last child of `parent`.
    pub fn append(&self, parent: NodeId, spec: &ElementSpec) -> Result<NodeId, HostError> {
        self.insert(parent, InsertPosition::Append, spec)
    }

    pub fn add_class(&self, id: NodeId, class: &str) -> Result<(), HostError> {
        let element = self.element(id).ok_or(HostError::NodeNotFound(id.0))?;
        if element.has_class(class) {
            return Ok(());
        }
        let mut classes: Vec<&str> = element.classes().collect();
        classes.push(class);
        self.set_attribute(id, "class", &classes.join(" "))
    }

    pub fn remove_class(&self, id: NodeId, class: &str) -> Result<(), HostError> {
        let element = self.element(id).ok_or(HostError::NodeNotFound(id.0))?;
        if !element.has_class(class) {
            return Ok(());
        }
        let classes: Vec<&str> = element.classes().filter(|c| *c != class).collect();
        self.set_attribute(id, "class", &classes.join(" "))
    }

    #[must_use]
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .nodes
            .get(&id)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    /// Number of elements in the document matching `predicate`.
    #[must_use]
    pub fn count(&self, predicate: &dyn Fn(&Element) -> bool) -> usize {
        self.find(None, predicate).len()
    }

    /// Indented outline of the document, one element per line.
    #[must_use]
    pub fn render(&self) -> String {
        fn walk(state: &TreeState, id: NodeId, depth: usize, out: &mut String) {
            let Some(node) = state.nodes.get(&id) else {
                return;
            };
            let _ = write!(out, "{:indent$}<{}", "", node.element.tag, indent = depth * 2);
            for (k, v) in &node.element.attributes {
                let _ = write!(out, " {k}=\"{v}\"");
            }
            out.push('>');
            if !node.element.text.is_empty() {
                out.push_str(&node.element.text);
            }
            out.push('\n');
            for child in &node.children {
                walk(state, *child, depth + 1, out);
            }
        }

        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = String::new();
        walk(&state, Self::ROOT, 0, &mut out);
        out
    }
}

impl RenderTree for MemoryTree {
    fn root(&self) -> NodeId {
        Self::ROOT
    }

    fn find(&self, scope: Option<NodeId>, predicate: &dyn Fn(&Element) -> bool) -> Vec<Element> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        state.collect(scope.unwrap_or(Self::ROOT), predicate, &mut out);
        out
    }

    fn element(&self, id: NodeId) -> Option<Element> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.nodes.get(&id).map(|n| n.element.clone())
    }

    fn parent(&self, id: NodeId) -> Option<NodeId> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.nodes.get(&id).and_then(|n| n.parent)
    }

    fn set_attribute(&self, id: NodeId, name: &str, value: &str) -> Result<(), HostError> {
        let mutation = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let node = state.node_mut(id)?;
            let old_value = node
                .element
                .attributes
                .insert(name.to_string(), value.to_string());
            Mutation::Attribute {
                target: node.element.clone(),
                name: name.to_string(),
                old_value,
            }
        };
        self.publish(mutation);
        Ok(())
    }

    fn remove_attribute(&self, id: NodeId, name: &str) -> Result<(), HostError> {
        let mutation = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let node = state.node_mut(id)?;
            let Some(old_value) = node.element.attributes.remove(name) else {
                return Ok(());
            };
            Mutation::Attribute {
                target: node.element.clone(),
                name: name.to_string(),
                old_value: Some(old_value),
            }
        };
        self.publish(mutation);
        Ok(())
    }

    fn insert(
        &self,
        anchor: NodeId,
        position: InsertPosition,
        spec: &ElementSpec,
    ) -> Result<NodeId, HostError> {
        let (id, mutation) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let anchor_node = state.node(anchor)?;
            let (parent, index) = match position {
                InsertPosition::Append => (anchor, anchor_node.children.len()),
                InsertPosition::Prepend => (anchor, 0),
                InsertPosition::Before | InsertPosition::After => {
                    let parent = anchor_node.parent.ok_or(HostError::Detached(anchor.0))?;
                    let siblings = &state.node(parent)?.children;
                    let at = siblings
                        .iter()
                        .position(|c| *c == anchor)
                        .ok_or(HostError::Detached(anchor.0))?;
                    let index = if position == InsertPosition::Before { at } else { at + 1 };
                    (parent, index)
                }
            };

            let id = state.build(spec, parent);
            state.node_mut(parent)?.children.insert(index, id);
            let added = state.node(id)?.element.clone();
            (
                id,
                Mutation::ChildList {
                    target: parent,
                    added: vec![added],
                    removed: Vec::new(),
                },
            )
        };
        self.publish(mutation);
        Ok(id)
    }

    fn remove(&self, id: NodeId) -> Result<(), HostError> {
        let mutation = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let node = state.node(id)?;
            let parent = node.parent.ok_or(HostError::Detached(id.0))?;
            let removed = node.element.clone();
            state.node_mut(parent)?.children.retain(|c| *c != id);
            state.drop_subtree(id);
            Mutation::ChildList {
                target: parent,
                added: Vec::new(),
                removed: vec![removed],
            }
        };
        self.publish(mutation);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<MutationBatch> {
        self.events.subscribe()
    }
}

/// Navigator whose address is set by the test or simulation.
#[derive(Debug, Default)]
pub struct MemoryNavigator {
    address: Mutex<String>,
}

impl MemoryNavigator {
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: Mutex::new(address.into()),
        }
    }

    pub fn navigate(&self, address: impl Into<String>) {
        *self.address.lock().unwrap_or_else(|e| e.into_inner()) = address.into();
    }
}

impl Navigator for MemoryNavigator {
    fn current_address(&self) -> String {
        self.address
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Lifecycle source driven by explicit [`emit`](Self::emit) calls.
#[derive(Debug)]
pub struct ManualLifecycle {
    events: broadcast::Sender<LifecycleEvent>,
}

impl Default for ManualLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualLifecycle {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY);
        Self { events }
    }

    pub fn emit(&self, event: LifecycleEvent) {
        let _ = self.events.send(event);
    }
}

impl LifecycleSource for ManualLifecycle {
    fn subscribe(&self) -> Option<broadcast::Receiver<LifecycleEvent>> {
        Some(self.events.subscribe())
    }
}
