use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};

use pagetrace::{
    DispatchedEvent, Dom, EventCallback, EventType, ListenerId, MutationCallback, MutationRecord,
    NodeId, ObserveOptions, ObserverId, PageId,
};
use tracing::{debug, trace};

use super::capture::CaptureHandlers;
use crate::{RecorderError, Result};

/// Event types a listener set covers. The last four are placeholders kept so every
/// instrumented root carries the same set.
pub const CAPTURED_EVENTS: [EventType; 8] = [
    EventType::Click,
    EventType::Input,
    EventType::Change,
    EventType::KeyDown,
    EventType::MouseOver,
    EventType::MouseOut,
    EventType::Focus,
    EventType::Blur,
];

#[derive(Default)]
struct Registry {
    page: Option<PageId>,
    roots: HashSet<NodeId>,
    listeners: Vec<ListenerId>,
    observers: Vec<ObserverId>,
}

/// Attaches capture listeners to the document and every shadow root, following
/// shadow roots that show up later through mutation observers.
///
/// Attachment is keyed by page and root identity, so revisiting a root never adds a
/// second listener set. Instrumenting a different page starts a fresh registry.
pub struct ShadowInstrumenter {
    handlers: Arc<CaptureHandlers>,
    observe: bool,
    registry: Mutex<Registry>,
}

impl ShadowInstrumenter {
    pub fn new(handlers: Arc<CaptureHandlers>, observe_shadow_roots: bool) -> Arc<Self> {
        Arc::new(Self {
            handlers,
            observe: observe_shadow_roots,
            registry: Mutex::new(Registry::default()),
        })
    }

    /// Instrument `root` and every shadow tree below it. Returns how many roots were
    /// newly instrumented.
    pub fn instrument(self: &Arc<Self>, dom: &mut Dom, root: NodeId) -> Result<usize> {
        self.bind_page(dom.page_id())?;
        let mut attached = 0;
        let mut pending = vec![root];
        while let Some(root) = pending.pop() {
            if self.attach_root(dom, root)? {
                attached += 1;
            }
            pending.extend(
                dom.descendant_elements(root)
                    .into_iter()
                    .filter_map(|el| dom.shadow_root(el)),
            );
        }
        if attached > 0 {
            debug!(attached, total = self.instrumented_roots(), "Instrumented roots");
        }
        Ok(attached)
    }

    fn bind_page(&self, page: PageId) -> Result<()> {
        let mut registry = self.lock()?;
        if registry.page == Some(page) {
            return Ok(());
        }
        if let Some(previous) = registry.page {
            // Ids from the previous page mean nothing on this one.
            debug!(%previous, %page, "Switching instrumented page");
        }
        *registry = Registry {
            page: Some(page),
            ..Registry::default()
        };
        self.handlers.bind_page(page);
        Ok(())
    }

    fn attach_root(self: &Arc<Self>, dom: &mut Dom, root: NodeId) -> Result<bool> {
        let mut registry = self.lock()?;
        if !registry.roots.insert(root) {
            return Ok(false);
        }

        for event_type in CAPTURED_EVENTS {
            let callback: EventCallback = match event_type {
                EventType::Click | EventType::Input | EventType::Change | EventType::KeyDown => {
                    let handlers = Arc::clone(&self.handlers);
                    Arc::new(move |event: &DispatchedEvent<'_>| handlers.handle(event))
                }
                _ => Arc::new(|_: &DispatchedEvent<'_>| {}),
            };
            let id = dom.add_event_listener(root, event_type, true, callback)?;
            registry.listeners.push(id);
        }

        if self.observe {
            let weak: Weak<Self> = Arc::downgrade(self);
            let callback: MutationCallback =
                Arc::new(move |dom: &mut Dom, records: &[MutationRecord]| {
                    if let Some(this) = weak.upgrade() {
                        this.on_mutations(dom, records);
                    }
                });
            let id = dom.observe(root, ObserveOptions { subtree: true }, callback)?;
            registry.observers.push(id);
        }
        trace!(%root, "attached capture listeners");
        Ok(true)
    }

    /// Observer callback: instrument shadow roots carried by added nodes or their descendants.
    pub fn on_mutations(self: &Arc<Self>, dom: &mut Dom, records: &[MutationRecord]) {
        if !self.handlers.is_bound_to(dom.page_id()) {
            trace!(page = %dom.page_id(), "mutations from a page that is not being recorded");
            return;
        }
        for added in records.iter().flat_map(|r| r.added_nodes.iter().copied()) {
            if !dom.is_element(added) {
                continue;
            }
            let shadow_roots: Vec<NodeId> = std::iter::once(added)
                .chain(dom.descendant_elements(added))
                .filter_map(|el| dom.shadow_root(el))
                .collect();
            for shadow_root in shadow_roots {
                if let Err(e) = self.instrument(dom, shadow_root) {
                    debug!(%shadow_root, "Failed to instrument shadow root: {}", e);
                }
            }
        }
    }

    /// Remove every listener and observer this instrumenter added. A page other than
    /// the instrumented one is left untouched.
    pub fn detach(&self, dom: &mut Dom) -> Result<usize> {
        let mut registry = self.lock()?;
        if registry.page != Some(dom.page_id()) {
            debug!(
                page = %dom.page_id(),
                instrumented = ?registry.page,
                "Nothing to detach on this page"
            );
            return Ok(0);
        }
        let removed = registry
            .listeners
            .drain(..)
            .filter(|id| dom.remove_event_listener(*id))
            .count();
        for id in registry.observers.drain(..) {
            dom.disconnect(id);
        }
        registry.roots.clear();
        debug!(removed, "Detached capture listeners");
        Ok(removed)
    }

    pub fn instrumented_roots(&self) -> usize {
        self.registry.lock().map(|r| r.roots.len()).unwrap_or(0)
    }

    pub fn is_instrumented(&self, root: NodeId) -> bool {
        self.registry
            .lock()
            .map(|r| r.roots.contains(&root))
            .unwrap_or(false)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Registry>> {
        self.registry
            .lock()
            .map_err(|e| RecorderError::State(format!("Failed to lock listener registry: {e}")))
    }
}
