//! In-memory page model
//!
//! A small arena-backed DOM exposing the browser surface the recorder relies
//! on: an element tree with attributes and form state, open shadow roots,
//! capture/bubble event listeners with `composedPath()` and shadow
//! retargeting, and mutation observers delivered at an explicit checkpoint.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::errors::DomError;

/// Identifier of a node inside a [`Dom`] arena. Stable for the lifetime of the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(usize);

impl NodeId {
    /// The document node is always the first node of the arena.
    pub const DOCUMENT: NodeId = NodeId(0);

}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of a [`Dom`]. Node, listener and observer ids are only meaningful
/// together with the page they came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageId(u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page-{}", self.0)
    }
}

static NEXT_PAGE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObserverId(u64);

/// DOM event types the page model can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Click,
    Input,
    Change,
    KeyDown,
    MouseOver,
    MouseOut,
    Focus,
    Blur,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Click => "click",
            EventType::Input => "input",
            EventType::Change => "change",
            EventType::KeyDown => "keydown",
            EventType::MouseOver => "mouseover",
            EventType::MouseOut => "mouseout",
            EventType::Focus => "focus",
            EventType::Blur => "blur",
        }
    }

    /// Whether the event propagates out of shadow trees, as browsers define it.
    /// `change` is the odd one out: it never leaves the shadow root it was fired in.
    pub fn composed(self) -> bool {
        !matches!(self, EventType::Change)
    }

    pub fn bubbles(self) -> bool {
        !matches!(self, EventType::Focus | EventType::Blur)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extra data carried by a dispatched event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventInit {
    /// `KeyboardEvent.key`
    pub key: Option<String>,
    pub ctrl_key: bool,
    pub meta_key: bool,
    pub alt_key: bool,
    pub shift_key: bool,
    /// Overrides the dispatch wall-clock timestamp (epoch milliseconds)
    pub time_stamp: Option<u64>,
}

impl EventInit {
    pub fn key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn with_ctrl(mut self) -> Self {
        self.ctrl_key = true;
        self
    }

    pub fn with_meta(mut self) -> Self {
        self.meta_key = true;
        self
    }

    pub fn with_shift(mut self) -> Self {
        self.shift_key = true;
        self
    }

    pub fn at(mut self, time_stamp: u64) -> Self {
        self.time_stamp = Some(time_stamp);
        self
    }
}

/// The view of an event handed to a listener during dispatch.
pub struct DispatchedEvent<'a> {
    dom: &'a Dom,
    event_type: EventType,
    dispatch_id: u64,
    target: NodeId,
    current_target: NodeId,
    path: &'a [NodeId],
    init: &'a EventInit,
    time_stamp: u64,
}

impl<'a> DispatchedEvent<'a> {
    /// The page the event is being dispatched in, as it is at dispatch time.
    pub fn dom(&self) -> &'a Dom {
        self.dom
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Unique per dispatch; every listener invoked for one dispatch sees the same value.
    pub fn dispatch_id(&self) -> u64 {
        self.dispatch_id
    }

    /// `event.target`, retargeted relative to the current listener.
    pub fn target(&self) -> NodeId {
        self.target
    }

    pub fn current_target(&self) -> NodeId {
        self.current_target
    }

    /// `event.composedPath()`: the originating node first, the document last.
    pub fn composed_path(&self) -> &'a [NodeId] {
        self.path
    }

    pub fn key(&self) -> Option<&'a str> {
        self.init.key.as_deref()
    }

    pub fn ctrl_key(&self) -> bool {
        self.init.ctrl_key
    }

    pub fn meta_key(&self) -> bool {
        self.init.meta_key
    }

    pub fn alt_key(&self) -> bool {
        self.init.alt_key
    }

    pub fn shift_key(&self) -> bool {
        self.init.shift_key
    }

    pub fn time_stamp(&self) -> u64 {
        self.time_stamp
    }
}

pub type EventCallback = Arc<dyn Fn(&DispatchedEvent<'_>) + Send + Sync>;

/// Callback invoked with the queued records at a mutation checkpoint.
pub type MutationCallback = Arc<dyn Fn(&mut Dom, &[MutationRecord]) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRecord {
    pub target: NodeId,
    pub added_nodes: Vec<NodeId>,
    pub removed_nodes: Vec<NodeId>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ObserveOptions {
    pub subtree: bool,
}

struct Listener {
    id: ListenerId,
    event_type: EventType,
    capture: bool,
    callback: EventCallback,
}

struct Observer {
    id: ObserverId,
    root: NodeId,
    options: ObserveOptions,
    callback: MutationCallback,
    pending: Vec<MutationRecord>,
}

#[derive(Debug, Clone)]
struct ElementData {
    tag_name: String,
    attributes: Vec<(String, String)>,
    shadow_root: Option<NodeId>,
    value: Option<String>,
    selected_index: Option<usize>,
}

#[derive(Debug, Clone)]
enum NodeKind {
    Document { url: String, frame_url: String },
    Element(ElementData),
    Text(String),
    ShadowRoot { host: NodeId },
}

#[derive(Debug, Clone)]
struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    kind: NodeKind,
}

/// Element names allowed to host a shadow root besides custom elements.
const SHADOW_HOST_TAGS: &[&str] = &[
    "article",
    "aside",
    "blockquote",
    "body",
    "div",
    "footer",
    "h1",
    "h2",
    "h3",
    "h4",
    "h5",
    "h6",
    "header",
    "main",
    "nav",
    "p",
    "section",
    "span",
];

/// Elements exposing a writable `value` property.
const VALUE_TAGS: &[&str] = &["input", "textarea", "button", "output"];

/// An in-memory page: the document, its elements, shadow trees, listeners and observers.
pub struct Dom {
    page_id: PageId,
    nodes: Vec<Node>,
    listeners: HashMap<NodeId, Vec<Listener>>,
    observers: Vec<Observer>,
    next_handle: u64,
    dispatch_counter: AtomicU64,
    html: NodeId,
    head: NodeId,
    body: NodeId,
}

impl fmt::Debug for Dom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dom")
            .field("page", &self.page_id)
            .field("url", &self.document_url())
            .field("nodes", &self.nodes.len())
            .field("listeners", &self.total_listener_count())
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl Dom {
    /// Create a top-level page with an empty `<html><head></head><body></body></html>`.
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self::with_frame(url.clone(), url)
    }

    /// Create a page loaded in a frame whose URL differs from the top-level page URL.
    pub fn with_frame(url: impl Into<String>, frame_url: impl Into<String>) -> Self {
        let mut dom = Dom {
            page_id: PageId(NEXT_PAGE_ID.fetch_add(1, Ordering::Relaxed)),
            nodes: vec![Node {
                parent: None,
                children: Vec::new(),
                kind: NodeKind::Document {
                    url: url.into(),
                    frame_url: frame_url.into(),
                },
            }],
            listeners: HashMap::new(),
            observers: Vec::new(),
            next_handle: 1,
            dispatch_counter: AtomicU64::new(0),
            html: NodeId::DOCUMENT,
            head: NodeId::DOCUMENT,
            body: NodeId::DOCUMENT,
        };
        let html = dom.push_node(NodeKind::Element(ElementData::new("html")));
        let head = dom.push_node(NodeKind::Element(ElementData::new("head")));
        let body = dom.push_node(NodeKind::Element(ElementData::new("body")));
        dom.link(NodeId::DOCUMENT, html);
        dom.link(html, head);
        dom.link(html, body);
        dom.html = html;
        dom.head = head;
        dom.body = body;
        dom
    }

    /// Unique per `Dom` instance within the process.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn document(&self) -> NodeId {
        NodeId::DOCUMENT
    }

    pub fn document_element(&self) -> NodeId {
        self.html
    }

    pub fn head(&self) -> NodeId {
        self.head
    }

    /// The document's root content container.
    pub fn body(&self) -> NodeId {
        self.body
    }

    pub fn document_url(&self) -> &str {
        match &self.nodes[0].kind {
            NodeKind::Document { url, .. } => url,
            _ => "",
        }
    }

    pub fn frame_url(&self) -> &str {
        match &self.nodes[0].kind {
            NodeKind::Document { frame_url, .. } => frame_url,
            _ => "",
        }
    }

    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// Create a detached element. The tag is stored as given; empty tags are allowed
    /// so callers can model malformed markup.
    pub fn create_element(&mut self, tag_name: &str) -> NodeId {
        self.push_node(NodeKind::Element(ElementData::new(tag_name)))
    }

    pub fn create_text_node(&mut self, text: &str) -> NodeId {
        self.push_node(NodeKind::Text(text.to_string()))
    }

    /// Append `child` as the last child of `parent`, moving it if it is already attached.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), DomError> {
        self.check(parent)?;
        self.check(child)?;
        match self.nodes[parent.0].kind {
            NodeKind::Text(_) => {
                return Err(DomError::HierarchyRequest(format!(
                    "text node {parent} cannot have children"
                )))
            }
            NodeKind::Document { .. } | NodeKind::Element(_) | NodeKind::ShadowRoot { .. } => {}
        }
        match self.nodes[child.0].kind {
            NodeKind::Document { .. } | NodeKind::ShadowRoot { .. } => {
                return Err(DomError::HierarchyRequest(format!(
                    "node {child} cannot be inserted as a child"
                )))
            }
            NodeKind::Element(_) | NodeKind::Text(_) => {}
        }
        if self.is_shadow_including_inclusive_ancestor(child, parent) {
            return Err(DomError::HierarchyRequest(format!(
                "inserting {child} under {parent} would create a cycle"
            )));
        }

        if let Some(old_parent) = self.nodes[child.0].parent {
            self.unlink(old_parent, child);
            self.queue_mutation(MutationRecord {
                target: old_parent,
                added_nodes: Vec::new(),
                removed_nodes: vec![child],
            });
        }
        self.link(parent, child);
        self.queue_mutation(MutationRecord {
            target: parent,
            added_nodes: vec![child],
            removed_nodes: Vec::new(),
        });
        Ok(())
    }

    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), DomError> {
        self.check(parent)?;
        self.check(child)?;
        if self.nodes[child.0].parent != Some(parent) {
            return Err(DomError::HierarchyRequest(format!(
                "{child} is not a child of {parent}"
            )));
        }
        self.unlink(parent, child);
        self.queue_mutation(MutationRecord {
            target: parent,
            added_nodes: Vec::new(),
            removed_nodes: vec![child],
        });
        Ok(())
    }

    /// Create an element with attributes and append it to `parent`.
    pub fn append_element(
        &mut self,
        parent: NodeId,
        tag_name: &str,
        attributes: &[(&str, &str)],
    ) -> Result<NodeId, DomError> {
        let element = self.create_element(tag_name);
        for (name, value) in attributes {
            self.set_attribute(element, name, value)?;
        }
        self.append_child(parent, element)?;
        Ok(element)
    }

    pub fn append_text(&mut self, parent: NodeId, text: &str) -> Result<NodeId, DomError> {
        let node = self.create_text_node(text);
        self.append_child(parent, node)?;
        Ok(node)
    }

    /// `element.attachShadow({ mode: "open" })`
    pub fn attach_shadow(&mut self, host: NodeId) -> Result<NodeId, DomError> {
        let data = self.element(host)?;
        if data.shadow_root.is_some() {
            return Err(DomError::ShadowRootExists(host));
        }
        let tag = data.tag_name.to_ascii_lowercase();
        if !(tag.contains('-') || SHADOW_HOST_TAGS.contains(&tag.as_str())) {
            return Err(DomError::InvalidShadowHost(tag));
        }
        let root = self.push_node(NodeKind::ShadowRoot { host });
        self.element_mut(host)?.shadow_root = Some(root);
        debug!(%host, %root, "attached shadow root");
        Ok(root)
    }

    // ------------------------------------------------------------------
    // Tree queries
    // ------------------------------------------------------------------

    pub fn contains_node(&self, node: NodeId) -> bool {
        node.0 < self.nodes.len()
    }

    pub fn is_element(&self, node: NodeId) -> bool {
        matches!(
            self.nodes.get(node.0).map(|n| &n.kind),
            Some(NodeKind::Element(_))
        )
    }

    pub fn is_shadow_root(&self, node: NodeId) -> bool {
        matches!(
            self.nodes.get(node.0).map(|n| &n.kind),
            Some(NodeKind::ShadowRoot { .. })
        )
    }

    pub fn parent_node(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(node.0).and_then(|n| n.parent)
    }

    pub fn children(&self, node: NodeId) -> &[NodeId] {
        self.nodes
            .get(node.0)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn element_children(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.children(node)
            .iter()
            .copied()
            .filter(move |c| self.is_element(*c))
    }

    /// Element siblings preceding `node` under the same parent, nearest last.
    pub fn preceding_element_siblings(&self, node: NodeId) -> Vec<NodeId> {
        let Some(parent) = self.parent_node(node) else {
            return Vec::new();
        };
        self.children(parent)
            .iter()
            .copied()
            .take_while(|c| *c != node)
            .filter(|c| self.is_element(*c))
            .collect()
    }

    /// The host of a shadow root.
    pub fn shadow_host(&self, root: NodeId) -> Option<NodeId> {
        match self.nodes.get(root.0).map(|n| &n.kind) {
            Some(NodeKind::ShadowRoot { host }) => Some(*host),
            _ => None,
        }
    }

    /// `element.shadowRoot`
    pub fn shadow_root(&self, host: NodeId) -> Option<NodeId> {
        match self.nodes.get(host.0).map(|n| &n.kind) {
            Some(NodeKind::Element(data)) => data.shadow_root,
            _ => None,
        }
    }

    /// The root of the tree containing `node` (the document, a shadow root, or a
    /// detached subtree's top node).
    pub fn tree_root(&self, node: NodeId) -> NodeId {
        let mut current = node;
        while let Some(parent) = self.parent_node(current) {
            current = parent;
        }
        current
    }

    /// `root.querySelectorAll('*')`: elements in tree order, not descending into shadow trees.
    pub fn descendant_elements(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(root).iter().rev().copied().collect();
        while let Some(node) = stack.pop() {
            if self.is_element(node) {
                out.push(node);
            }
            stack.extend(self.children(node).iter().rev().copied());
        }
        out
    }

    pub fn is_shadow_including_inclusive_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(n) = current {
            if n == ancestor {
                return true;
            }
            current = self.parent_node(n).or_else(|| self.shadow_host(n));
        }
        false
    }

    // ------------------------------------------------------------------
    // Element data
    // ------------------------------------------------------------------

    /// The tag name as stored on the element.
    pub fn tag_name(&self, element: NodeId) -> Result<&str, DomError> {
        Ok(&self.element(element)?.tag_name)
    }

    pub fn attribute(&self, element: NodeId, name: &str) -> Option<&str> {
        let data = self.element(element).ok()?;
        data.attributes
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Attributes in document order. Names are lowercased on insertion.
    pub fn attributes(&self, element: NodeId) -> Result<&[(String, String)], DomError> {
        Ok(&self.element(element)?.attributes)
    }

    pub fn set_attribute(&mut self, element: NodeId, name: &str, value: &str) -> Result<(), DomError> {
        let name = name.to_ascii_lowercase();
        let data = self.element_mut(element)?;
        match data.attributes.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value.to_string(),
            None => data.attributes.push((name, value.to_string())),
        }
        Ok(())
    }

    /// `element.classList`
    pub fn class_list(&self, element: NodeId) -> Vec<&str> {
        self.attribute(element, "class")
            .map(|c| c.split_ascii_whitespace().collect())
            .unwrap_or_default()
    }

    /// `node.textContent`: concatenated text of the light-tree descendants.
    pub fn text_content(&self, node: NodeId) -> String {
        let mut out = String::new();
        let mut stack = vec![node];
        while let Some(n) = stack.pop() {
            match self.nodes.get(n.0).map(|node| &node.kind) {
                Some(NodeKind::Text(text)) => out.push_str(text),
                Some(_) => stack.extend(self.children(n).iter().rev().copied()),
                None => {}
            }
        }
        out
    }

    fn has_tag(&self, element: NodeId, tag: &str) -> bool {
        self.element(element)
            .map(|d| d.tag_name.eq_ignore_ascii_case(tag))
            .unwrap_or(false)
    }

    /// Whether the element exposes a `value` property (form controls and options).
    pub fn has_value_property(&self, element: NodeId) -> bool {
        match self.element(element) {
            Ok(data) => {
                data.value.is_some() || self.has_tag(element, "select") || self.has_tag(element, "option")
            }
            Err(_) => false,
        }
    }

    /// `element.value` for form controls; `None` for elements without a value property.
    pub fn value(&self, element: NodeId) -> Option<String> {
        if self.has_tag(element, "select") {
            return Some(
                self.selected_option(element)
                    .and_then(|o| self.value(o))
                    .unwrap_or_default(),
            );
        }
        if self.has_tag(element, "option") {
            return Some(
                self.attribute(element, "value")
                    .map(str::to_string)
                    .unwrap_or_else(|| self.option_text(element)),
            );
        }
        self.element(element).ok().and_then(|d| d.value.clone())
    }

    /// Assign `element.value`. Fails for elements without a writable value.
    pub fn set_value(&mut self, element: NodeId, value: &str) -> Result<(), DomError> {
        let data = self.element_mut(element)?;
        match data.value.as_mut() {
            Some(slot) => {
                *slot = value.to_string();
                Ok(())
            }
            None => Err(DomError::NoValueProperty(element)),
        }
    }

    /// `select.options`: option descendants in tree order (including inside optgroups).
    pub fn options(&self, select: NodeId) -> Vec<NodeId> {
        self.descendant_elements(select)
            .into_iter()
            .filter(|n| self.has_tag(*n, "option"))
            .collect()
    }

    /// `select.selectedIndex = index`
    pub fn select_option(&mut self, select: NodeId, index: usize) -> Result<(), DomError> {
        let len = self.options(select).len();
        if index >= len {
            return Err(DomError::OptionOutOfRange { select, index, len });
        }
        self.element_mut(select)?.selected_index = Some(index);
        Ok(())
    }

    /// The selected option: explicit selection, then the first `selected` option, then the first option.
    pub fn selected_option(&self, select: NodeId) -> Option<NodeId> {
        let options = self.options(select);
        let explicit = self.element(select).ok().and_then(|d| d.selected_index);
        if let Some(index) = explicit {
            return options.get(index).copied();
        }
        options
            .iter()
            .copied()
            .find(|o| self.attribute(*o, "selected").is_some())
            .or_else(|| options.first().copied())
    }

    /// `option.text`: text content with whitespace collapsed.
    pub fn option_text(&self, option: NodeId) -> String {
        self.text_content(option)
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// `target.addEventListener(type, callback, { capture })`
    pub fn add_event_listener(
        &mut self,
        target: NodeId,
        event_type: EventType,
        capture: bool,
        callback: EventCallback,
    ) -> Result<ListenerId, DomError> {
        self.check(target)?;
        if matches!(self.nodes[target.0].kind, NodeKind::Text(_)) {
            return Err(DomError::NotAnElement(target));
        }
        let id = ListenerId(self.next_handle());
        self.listeners.entry(target).or_default().push(Listener {
            id,
            event_type,
            capture,
            callback,
        });
        trace!(%target, %event_type, capture, "listener added");
        Ok(id)
    }

    pub fn remove_event_listener(&mut self, id: ListenerId) -> bool {
        for listeners in self.listeners.values_mut() {
            if let Some(pos) = listeners.iter().position(|l| l.id == id) {
                listeners.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn listener_count(&self, target: NodeId) -> usize {
        self.listeners.get(&target).map(Vec::len).unwrap_or(0)
    }

    pub fn total_listener_count(&self) -> usize {
        self.listeners.values().map(Vec::len).sum()
    }

    /// The propagation path for an event fired at `target`, innermost first.
    pub fn event_path(&self, target: NodeId, composed: bool) -> Vec<NodeId> {
        let mut path = vec![target];
        let mut current = target;
        loop {
            let next = match self.parent_node(current) {
                Some(parent) => Some(parent),
                None if composed => self.shadow_host(current),
                None => None,
            };
            match next {
                Some(n) => {
                    path.push(n);
                    current = n;
                }
                None => break,
            }
        }
        path
    }

    /// DOM retargeting: `a` as seen from a listener registered on `b`.
    pub fn retarget(&self, mut a: NodeId, b: NodeId) -> NodeId {
        loop {
            let root = self.tree_root(a);
            if !self.is_shadow_root(root) || self.is_shadow_including_inclusive_ancestor(root, b) {
                return a;
            }
            match self.shadow_host(root) {
                Some(host) => a = host,
                None => return a,
            }
        }
    }

    /// Dispatch an event at `target` through capture, target and bubble phases.
    ///
    /// Listeners run synchronously against the page as it is now. Returns the number of
    /// listeners invoked.
    pub fn dispatch_event(
        &self,
        target: NodeId,
        event_type: EventType,
        init: EventInit,
    ) -> Result<usize, DomError> {
        self.check(target)?;
        let path = self.event_path(target, event_type.composed());
        let dispatch_id = self.dispatch_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let time_stamp = init.time_stamp.unwrap_or_else(epoch_millis);

        let mut invoked = 0;
        let mut run = |node: NodeId, capture_phase: bool| {
            let Some(listeners) = self.listeners.get(&node) else {
                return;
            };
            let retargeted = self.retarget(target, node);
            let at_target = retargeted == node;
            for listener in listeners.iter().filter(|l| l.event_type == event_type) {
                let wanted = if capture_phase {
                    listener.capture
                } else {
                    !listener.capture && (at_target || event_type.bubbles())
                };
                if !wanted {
                    continue;
                }
                let event = DispatchedEvent {
                    dom: self,
                    event_type,
                    dispatch_id,
                    target: retargeted,
                    current_target: node,
                    path: &path,
                    init: &init,
                    time_stamp,
                };
                (listener.callback)(&event);
                invoked += 1;
            }
        };

        for node in path.iter().rev() {
            run(*node, true);
        }
        for node in path.iter() {
            run(*node, false);
        }
        trace!(%target, %event_type, invoked, "dispatched");
        Ok(invoked)
    }

    // ------------------------------------------------------------------
    // Mutation observers
    // ------------------------------------------------------------------

    /// `new MutationObserver(callback).observe(root, { childList: true, subtree })`
    pub fn observe(
        &mut self,
        root: NodeId,
        options: ObserveOptions,
        callback: MutationCallback,
    ) -> Result<ObserverId, DomError> {
        self.check(root)?;
        let id = ObserverId(self.next_handle());
        self.observers.push(Observer {
            id,
            root,
            options,
            callback,
            pending: Vec::new(),
        });
        Ok(id)
    }

    pub fn disconnect(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|o| o.id != id);
        before != self.observers.len()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Microtask checkpoint: hand queued records to their observers until none remain.
    /// Returns the number of callbacks invoked.
    pub fn deliver_mutations(&mut self) -> usize {
        let mut delivered = 0;
        loop {
            let batch: Vec<(MutationCallback, Vec<MutationRecord>)> = self
                .observers
                .iter_mut()
                .filter(|o| !o.pending.is_empty())
                .map(|o| (o.callback.clone(), std::mem::take(&mut o.pending)))
                .collect();
            if batch.is_empty() {
                return delivered;
            }
            for (callback, records) in batch {
                callback(self, &records);
                delivered += 1;
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn push_node(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            parent: None,
            children: Vec::new(),
            kind,
        });
        id
    }

    fn link(&mut self, parent: NodeId, child: NodeId) {
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.push(child);
    }

    fn unlink(&mut self, parent: NodeId, child: NodeId) {
        self.nodes[parent.0].children.retain(|c| *c != child);
        self.nodes[child.0].parent = None;
    }

    fn queue_mutation(&mut self, record: MutationRecord) {
        let target = record.target;
        let interested: Vec<usize> = self
            .observers
            .iter()
            .enumerate()
            .filter(|(_, o)| {
                o.root == target || (o.options.subtree && self.is_light_ancestor(o.root, target))
            })
            .map(|(i, _)| i)
            .collect();
        for i in interested {
            self.observers[i].pending.push(record.clone());
        }
    }

    /// Inclusive ancestor within one tree; shadow boundaries are not crossed.
    fn is_light_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(n) = current {
            if n == ancestor {
                return true;
            }
            current = self.parent_node(n);
        }
        false
    }

    fn next_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn check(&self, node: NodeId) -> Result<(), DomError> {
        if self.contains_node(node) {
            Ok(())
        } else {
            Err(DomError::NodeNotFound(node))
        }
    }

    fn element(&self, node: NodeId) -> Result<&ElementData, DomError> {
        match self.nodes.get(node.0).map(|n| &n.kind) {
            Some(NodeKind::Element(data)) => Ok(data),
            Some(_) => Err(DomError::NotAnElement(node)),
            None => Err(DomError::NodeNotFound(node)),
        }
    }

    fn element_mut(&mut self, node: NodeId) -> Result<&mut ElementData, DomError> {
        match self.nodes.get_mut(node.0).map(|n| &mut n.kind) {
            Some(NodeKind::Element(data)) => Ok(data),
            Some(_) => Err(DomError::NotAnElement(node)),
            None => Err(DomError::NodeNotFound(node)),
        }
    }
}

impl ElementData {
    fn new(tag_name: &str) -> Self {
        let lower = tag_name.to_ascii_lowercase();
        Self {
            tag_name: tag_name.to_string(),
            attributes: Vec::new(),
            shadow_root: None,
            value: VALUE_TAGS.contains(&lower.as_str()).then(String::new),
            selected_index: None,
        }
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
