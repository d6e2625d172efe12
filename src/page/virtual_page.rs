//! In-memory page.
//!
//! `VirtualPage` keeps an element tree plus the listener and observer
//! registries behind a single mutex. Every mutation computes the callbacks it
//! has to run while holding the lock, releases it, and only then invokes them,
//! so callbacks are free to re-enter the page.
//!
//! Behavior worth knowing:
//! - Events bubble from the target through its ancestors to the document.
//! - Removing an element drops the listeners and intersection observers bound
//!   to it and to its descendants.
//! - Insertion observers see every inserted node of a subtree (pre-order).
//! - An intersection observer fires when the visible ratio moves from below
//!   its threshold to at or above it, and once on registration if the element
//!   is already visible enough.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use super::selector::{Selector, Subject};
use super::{
    ElementCallback, ElementId, EventCallback, ListenerKey, Modifiers, NativeEvent,
    ObserverHandle, Page, Root,
};

/// Declarative description of an element subtree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ElementSeed {
    /// Tag name, e.g. `button`.
    pub tag: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub text: String,
    /// Fraction of the element currently inside the viewport (0.0 - 1.0).
    #[serde(default)]
    pub visible: f64,
    #[serde(default)]
    pub children: Vec<ElementSeed>,
}

impl ElementSeed {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.classes.push(class.into());
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    #[must_use]
    pub fn with_child(mut self, child: ElementSeed) -> Self {
        self.children.push(child);
        self
    }
}

/// A scripted change to the page, usually read from an event source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PageCommand {
    /// Dispatch a native event on every element matching `selector`
    /// (or on the document when no selector is given).
    Event {
        name: String,
        #[serde(default)]
        selector: Option<String>,
        #[serde(default)]
        key: Option<String>,
        #[serde(default)]
        modifiers: Modifiers,
        #[serde(default)]
        detail: Option<Value>,
    },
    /// Insert a subtree under the first element matching `parent`
    /// (top level when absent).
    Append {
        #[serde(default)]
        parent: Option<String>,
        element: ElementSeed,
    },
    Remove {
        selector: String,
    },
    /// Scroll matching elements so that `ratio` of each is visible.
    Scroll {
        selector: String,
        #[serde(default = "default_scroll_ratio")]
        ratio: f64,
    },
    Select {
        selector: String,
    },
    /// Signal an application state change to `statechange` triggers.
    StateChange {
        key: String,
        #[serde(default)]
        value: Option<Value>,
    },
    /// Same-page navigation; the host re-arms its triggers.
    Navigate {
        #[serde(default)]
        url: Option<String>,
    },
    Visibility {
        hidden: bool,
    },
}

fn default_scroll_ratio() -> f64 {
    1.0
}

/// What the host has to do after a command was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Applied,
    Navigated,
}

struct Node {
    tag: String,
    attributes: BTreeMap<String, String>,
    text: String,
    parent: Option<ElementId>,
    children: Vec<ElementId>,
    visible: f64,
}

struct IntersectionWatch {
    element: ElementId,
    threshold: f64,
    callback: ElementCallback,
}

#[derive(Default)]
struct PageState {
    url: String,
    next_element: u64,
    next_observer: u64,
    elements: BTreeMap<ElementId, Node>,
    top_level: Vec<ElementId>,
    listeners: HashMap<(Root, String), Vec<(ListenerKey, EventCallback)>>,
    insertion_observers: BTreeMap<u64, (Selector, ElementCallback)>,
    intersection_observers: BTreeMap<u64, IntersectionWatch>,
    selection: Vec<ElementId>,
    listeners_added: usize,
    listeners_removed: usize,
}

struct NodeRef<'a> {
    state: &'a PageState,
    node: &'a Node,
}

impl Subject for NodeRef<'_> {
    fn tag(&self) -> &str {
        &self.node.tag
    }

    fn attribute(&self, name: &str) -> Option<&str> {
        self.node.attributes.get(name).map(String::as_str)
    }

    fn parent(&self) -> Option<Self> {
        let parent = self.node.parent?;
        self.state.node_ref(parent)
    }
}

impl PageState {
    fn node_ref(&self, id: ElementId) -> Option<NodeRef<'_>> {
        self.elements
            .get(&id)
            .map(|node| NodeRef { state: self, node })
    }

    fn matches(&self, id: ElementId, selector: &Selector) -> bool {
        self.node_ref(id).is_some_and(|n| selector.matches(&n))
    }

    /// All element ids in document order.
    fn document_order(&self) -> Vec<ElementId> {
        let mut out = Vec::with_capacity(self.elements.len());
        let mut stack: Vec<ElementId> = self.top_level.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            out.push(id);
            if let Some(node) = self.elements.get(&id) {
                stack.extend(node.children.iter().rev().copied());
            }
        }
        out
    }

    fn subtree(&self, id: ElementId) -> Vec<ElementId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            out.push(id);
            if let Some(node) = self.elements.get(&id) {
                stack.extend(node.children.iter().rev().copied());
            }
        }
        out
    }

    fn insert_seed(
        &mut self,
        parent: Option<ElementId>,
        seed: &ElementSeed,
        created: &mut Vec<ElementId>,
    ) -> ElementId {
        self.next_element += 1;
        let id = ElementId(self.next_element);

        let mut attributes = seed.attributes.clone();
        if let Some(html_id) = &seed.id {
            attributes.insert("id".into(), html_id.clone());
        }
        if !seed.classes.is_empty() {
            attributes.insert("class".into(), seed.classes.join(" "));
        }

        self.elements.insert(
            id,
            Node {
                tag: seed.tag.to_ascii_lowercase(),
                attributes,
                text: seed.text.clone(),
                parent,
                children: Vec::new(),
                visible: seed.visible.clamp(0.0, 1.0),
            },
        );
        match parent.and_then(|p| self.elements.get_mut(&p)) {
            Some(parent_node) => parent_node.children.push(id),
            None => self.top_level.push(id),
        }
        created.push(id);

        for child in &seed.children {
            self.insert_seed(Some(id), child, created);
        }
        id
    }
}

/// Snapshot of a single element, detached from the page.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementSnapshot {
    pub id: ElementId,
    pub tag: String,
    pub attributes: BTreeMap<String, String>,
    pub text: String,
    pub parent: Option<ElementId>,
    pub visible: f64,
}

impl ElementSnapshot {
    pub fn classes(&self) -> Vec<String> {
        self.attributes
            .get("class")
            .map(|c| c.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

/// In-memory page implementing [`Page`].
pub struct VirtualPage {
    state: Arc<Mutex<PageState>>,
    hidden: watch::Sender<bool>,
}

impl VirtualPage {
    pub fn new(url: impl Into<String>) -> Self {
        let (hidden, _) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(PageState {
                url: url.into(),
                ..PageState::default()
            })),
            hidden,
        }
    }

    /// Build a page from a seed tree.
    pub fn with_elements(url: impl Into<String>, seeds: &[ElementSeed]) -> Self {
        let page = Self::new(url);
        for seed in seeds {
            page.append(None, seed);
        }
        page
    }

    fn lock(&self) -> MutexGuard<'_, PageState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn parse(selector: &str) -> Option<Selector> {
        match Selector::parse(selector) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!(target: "pagetrigger::page", %selector, error = %e, "Invalid selector");
                None
            }
        }
    }

    pub fn set_url(&self, url: impl Into<String>) {
        self.lock().url = url.into();
    }

    /// Insert `seed` under `parent` (top level when `None`).
    ///
    /// Returns `None` when `parent` does not exist.
    pub fn append(&self, parent: Option<ElementId>, seed: &ElementSeed) -> Option<ElementId> {
        let (root, fire) = {
            let mut state = self.lock();
            if let Some(p) = parent.filter(|p| !state.elements.contains_key(p)) {
                warn!(target: "pagetrigger::page", parent = %p, "Append target does not exist");
                return None;
            }
            let mut created = Vec::new();
            let root = state.insert_seed(parent, seed, &mut created);

            let mut fire: Vec<(ElementCallback, ElementId)> = Vec::new();
            for id in created {
                for (selector, callback) in state.insertion_observers.values() {
                    if state.matches(id, selector) {
                        fire.push((callback.clone(), id));
                    }
                }
            }
            (root, fire)
        };

        trace!(target: "pagetrigger::page", element = %root, observers = fire.len(), "Inserted subtree");
        for (callback, id) in fire {
            callback(id);
        }
        Some(root)
    }

    /// Remove `element` and its subtree. Returns whether it existed.
    pub fn remove(&self, element: ElementId) -> bool {
        let mut state = self.lock();
        let Some(parent) = state.elements.get(&element).map(|n| n.parent) else {
            return false;
        };
        match parent {
            Some(parent) => {
                if let Some(parent_node) = state.elements.get_mut(&parent) {
                    parent_node.children.retain(|c| *c != element);
                }
            }
            None => state.top_level.retain(|c| *c != element),
        }

        let removed = state.subtree(element);
        for id in &removed {
            state.elements.remove(id);
        }
        state
            .listeners
            .retain(|(target, _), _| !matches!(target, Root::Element(id) if removed.contains(id)));
        state
            .intersection_observers
            .retain(|_, watch| !removed.contains(&watch.element));
        state.selection.retain(|id| !removed.contains(id));
        debug!(target: "pagetrigger::page", %element, count = removed.len(), "Removed subtree");
        true
    }

    /// Change how much of `element` is visible, firing intersection observers
    /// whose threshold is crossed upwards.
    pub fn set_visible(&self, element: ElementId, ratio: f64) {
        let fire: Vec<ElementCallback> = {
            let mut state = self.lock();
            let ratio = ratio.clamp(0.0, 1.0);
            let Some(node) = state.elements.get_mut(&element) else {
                return;
            };
            let previous = node.visible;
            node.visible = ratio;
            state
                .intersection_observers
                .values()
                .filter(|w| w.element == element && previous < w.threshold && ratio >= w.threshold)
                .map(|w| w.callback.clone())
                .collect()
        };
        for callback in fire {
            callback(element);
        }
    }

    pub fn select(&self, elements: Vec<ElementId>) {
        self.lock().selection = elements;
    }

    pub fn set_hidden(&self, hidden: bool) {
        self.hidden.send_replace(hidden);
    }

    pub fn is_hidden(&self) -> bool {
        *self.hidden.borrow()
    }

    /// Dispatch `event` at its target and bubble it up to the document.
    ///
    /// Returns the number of listeners invoked.
    pub fn dispatch(&self, event: NativeEvent) -> usize {
        let hops: Vec<(Root, Vec<EventCallback>)> = {
            let state = self.lock();
            let mut path = Vec::new();
            let mut current = event.target.element();
            while let Some(id) = current {
                path.push(Root::Element(id));
                current = state.elements.get(&id).and_then(|n| n.parent);
            }
            path.push(Root::Document);

            path.into_iter()
                .map(|hop| {
                    let callbacks = state
                        .listeners
                        .get(&(hop, event.name.clone()))
                        .map(|ls| ls.iter().map(|(_, cb)| cb.clone()).collect())
                        .unwrap_or_default();
                    (hop, callbacks)
                })
                .collect()
        };

        let mut invoked = 0;
        for (hop, callbacks) in hops {
            let mut at_hop = event.clone();
            at_hop.current_target = hop;
            for callback in callbacks {
                callback(&at_hop);
                invoked += 1;
            }
        }
        trace!(target: "pagetrigger::page", event = %event.name, target = %event.target, invoked, "Dispatched event");
        invoked
    }

    /// Apply a scripted command.
    pub fn apply(&self, command: PageCommand) -> CommandOutcome {
        match command {
            PageCommand::Event {
                name,
                selector,
                key,
                modifiers,
                detail,
            } => {
                let targets = match selector {
                    Some(selector) => self
                        .query_all(&selector)
                        .into_iter()
                        .map(Root::Element)
                        .collect(),
                    None => vec![Root::Document],
                };
                for target in targets {
                    let mut event = NativeEvent::new(name.clone(), target);
                    if let Some(key) = &key {
                        event = event.with_key(key.clone(), modifiers);
                    }
                    if let Some(detail) = &detail {
                        event = event.with_detail(detail.clone());
                    }
                    self.dispatch(event);
                }
            }
            PageCommand::Append { parent, element } => {
                let parent = match parent {
                    Some(selector) => match self.query_all(&selector).first() {
                        Some(id) => Some(*id),
                        None => {
                            warn!(target: "pagetrigger::page", %selector, "No parent matches; skipping append");
                            return CommandOutcome::Applied;
                        }
                    },
                    None => None,
                };
                self.append(parent, &element);
            }
            PageCommand::Remove { selector } => {
                for id in self.query_all(&selector) {
                    self.remove(id);
                }
            }
            PageCommand::Scroll { selector, ratio } => {
                for id in self.query_all(&selector) {
                    self.set_visible(id, ratio);
                }
            }
            PageCommand::Select { selector } => {
                let selected = self.query_all(&selector);
                self.select(selected);
            }
            PageCommand::StateChange { key, value } => {
                let event = NativeEvent::new("statechange", Root::Document)
                    .with_detail(json!({ "stateKey": key, "value": value }));
                self.dispatch(event);
            }
            PageCommand::Navigate { url } => {
                if let Some(url) = url {
                    self.set_url(url);
                }
                return CommandOutcome::Navigated;
            }
            PageCommand::Visibility { hidden } => self.set_hidden(hidden),
        }
        CommandOutcome::Applied
    }

    pub fn element(&self, element: ElementId) -> Option<ElementSnapshot> {
        let state = self.lock();
        state.elements.get(&element).map(|node| ElementSnapshot {
            id: element,
            tag: node.tag.clone(),
            attributes: node.attributes.clone(),
            text: node.text.clone(),
            parent: node.parent,
            visible: node.visible,
        })
    }

    pub fn set_attribute(&self, element: ElementId, name: &str, value: &str) -> bool {
        let mut state = self.lock();
        match state.elements.get_mut(&element) {
            Some(node) => {
                node.attributes.insert(name.to_string(), value.to_string());
                true
            }
            None => false,
        }
    }

    pub fn set_text(&self, element: ElementId, text: &str) -> bool {
        let mut state = self.lock();
        match state.elements.get_mut(&element) {
            Some(node) => {
                node.text = text.to_string();
                true
            }
            None => false,
        }
    }

    pub fn toggle_class(&self, element: ElementId, class: &str, present: bool) -> bool {
        let mut state = self.lock();
        let Some(node) = state.elements.get_mut(&element) else {
            return false;
        };
        let mut classes: Vec<String> = node
            .attributes
            .get("class")
            .map(|c| c.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        classes.retain(|c| c != class);
        if present {
            classes.push(class.to_string());
        }
        if classes.is_empty() {
            node.attributes.remove("class");
        } else {
            node.attributes.insert("class".into(), classes.join(" "));
        }
        true
    }

    // --- Inspection ---

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.values().map(Vec::len).sum()
    }

    pub fn listener_count_on(&self, target: Root, event: &str) -> usize {
        self.lock()
            .listeners
            .get(&(target, event.to_string()))
            .map_or(0, Vec::len)
    }

    /// Total listener registrations / removals performed so far.
    pub fn listener_churn(&self) -> (usize, usize) {
        let state = self.lock();
        (state.listeners_added, state.listeners_removed)
    }

    pub fn insertion_observer_count(&self) -> usize {
        self.lock().insertion_observers.len()
    }

    pub fn intersection_observer_count(&self) -> usize {
        self.lock().intersection_observers.len()
    }
}

fn disconnect(
    state: Weak<Mutex<PageState>>,
    remove: impl FnOnce(&mut PageState) + Send + 'static,
) -> ObserverHandle {
    ObserverHandle::new(move || {
        if let Some(state) = state.upgrade() {
            let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
            remove(&mut guard);
        }
    })
}

#[async_trait]
impl Page for VirtualPage {
    fn url(&self) -> String {
        self.lock().url.clone()
    }

    fn query_all(&self, selector: &str) -> Vec<ElementId> {
        let Some(selector) = Self::parse(selector) else {
            return Vec::new();
        };
        let state = self.lock();
        state
            .document_order()
            .into_iter()
            .filter(|id| state.matches(*id, &selector))
            .collect()
    }

    fn closest(&self, element: ElementId, selector: &str) -> Option<ElementId> {
        let selector = Self::parse(selector)?;
        let state = self.lock();
        let mut current = Some(element);
        while let Some(id) = current {
            if state.matches(id, &selector) {
                return Some(id);
            }
            current = state.elements.get(&id).and_then(|n| n.parent);
        }
        None
    }

    fn add_listener(&self, target: Root, event: &str, key: ListenerKey, callback: EventCallback) {
        let mut state = self.lock();
        if target
            .element()
            .is_some_and(|id| !state.elements.contains_key(&id))
        {
            return;
        }
        let entry = state.listeners.entry((target, event.to_string())).or_default();
        if entry.iter().any(|(k, _)| *k == key) {
            return;
        }
        entry.push((key, callback));
        state.listeners_added += 1;
    }

    fn remove_listener(&self, target: Root, event: &str, key: ListenerKey) {
        let mut state = self.lock();
        let slot = (target, event.to_string());
        let Some(entry) = state.listeners.get_mut(&slot) else {
            return;
        };
        let before = entry.len();
        entry.retain(|(k, _)| *k != key);
        let removed = before - entry.len();
        if entry.is_empty() {
            state.listeners.remove(&slot);
        }
        state.listeners_removed += removed;
    }

    fn observe_insertions(&self, selector: &str, callback: ElementCallback) -> ObserverHandle {
        let Some(selector) = Self::parse(selector) else {
            return ObserverHandle::new(|| {});
        };
        let id = {
            let mut state = self.lock();
            state.next_observer += 1;
            let id = state.next_observer;
            state.insertion_observers.insert(id, (selector, callback));
            id
        };
        disconnect(Arc::downgrade(&self.state), move |state| {
            state.insertion_observers.remove(&id);
        })
    }

    fn observe_intersection(
        &self,
        element: ElementId,
        threshold: f64,
        callback: ElementCallback,
    ) -> ObserverHandle {
        let (id, visible) = {
            let mut state = self.lock();
            let Some(visible) = state.elements.get(&element).map(|n| n.visible) else {
                return ObserverHandle::new(|| {});
            };
            state.next_observer += 1;
            let id = state.next_observer;
            state.intersection_observers.insert(
                id,
                IntersectionWatch {
                    element,
                    threshold,
                    callback: callback.clone(),
                },
            );
            (id, visible)
        };
        if visible >= threshold {
            callback(element);
        }
        disconnect(Arc::downgrade(&self.state), move |state| {
            state.intersection_observers.remove(&id);
        })
    }

    fn selection_anchor(&self) -> Option<ElementId> {
        self.lock().selection.first().copied()
    }

    async fn next_frame(&self) {
        let mut rx = self.hidden.subscribe();
        let _ = rx.wait_for(|hidden| !*hidden).await;
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn page() -> VirtualPage {
        VirtualPage::with_elements(
            "https://shop.example.com/cart",
            &[ElementSeed::new("form").with_id("cart").with_child(
                ElementSeed::new("button")
                    .with_class("btn")
                    .with_text("Checkout")
                    .with_child(ElementSeed::new("span").with_class("icon")),
            )],
        )
    }

    fn counter() -> (Arc<AtomicUsize>, EventCallback) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        (
            hits,
            Arc::new(move |_: &NativeEvent| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn test_query_and_closest() {
        let p = page();
        let buttons = p.query_all(".btn");
        assert_eq!(buttons.len(), 1);
        let icon = p.query_all(".icon")[0];
        assert_eq!(p.closest(icon, "#cart .btn"), Some(buttons[0]));
        assert_eq!(p.closest(icon, "a"), None);
        assert!(p.query_all("a > b").is_empty());
    }

    #[test]
    fn test_listener_dedup_by_key() {
        let p = page();
        let btn = Root::Element(p.query_all(".btn")[0]);
        let (hits, cb) = counter();
        p.add_listener(btn, "click", ListenerKey(1), cb.clone());
        p.add_listener(btn, "click", ListenerKey(1), cb);
        assert_eq!(p.listener_count_on(btn, "click"), 1);

        assert_eq!(p.dispatch(NativeEvent::new("click", btn)), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        p.remove_listener(btn, "click", ListenerKey(1));
        assert_eq!(p.listener_count(), 0);
        assert_eq!(p.listener_churn(), (1, 1));
    }

    #[test]
    fn test_events_bubble_with_current_target() {
        let p = page();
        let btn = p.query_all(".btn")[0];
        let icon = p.query_all(".icon")[0];
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        p.add_listener(
            Root::Element(btn),
            "click",
            ListenerKey(9),
            Arc::new(move |e: &NativeEvent| {
                s.lock().unwrap().push((e.target, e.current_target));
            }),
        );
        let (doc_hits, doc_cb) = counter();
        p.add_listener(Root::Document, "click", ListenerKey(9), doc_cb);

        assert_eq!(p.dispatch(NativeEvent::new("click", Root::Element(icon))), 2);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(Root::Element(icon), Root::Element(btn))]
        );
        assert_eq!(doc_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_insertion_observer_sees_matching_descendants() {
        let p = page();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let handle = p.observe_insertions(
            ".btn",
            Arc::new(move |id| {
                s.lock().unwrap().push(id);
            }),
        );
        let added = p
            .append(
                None,
                &ElementSeed::new("div").with_child(ElementSeed::new("button").with_class("btn")),
            )
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_ne!(seen.lock().unwrap()[0], added);

        handle.cancel();
        assert_eq!(p.insertion_observer_count(), 0);
        p.append(None, &ElementSeed::new("button").with_class("btn"));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_intersection_fires_on_upward_crossing() {
        let p = page();
        let btn = p.query_all(".btn")[0];
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _handle = p.observe_intersection(
            btn,
            0.2,
            Arc::new(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        p.set_visible(btn, 0.1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        p.set_visible(btn, 0.5);
        p.set_visible(btn, 0.9);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        p.set_visible(btn, 0.0);
        p.set_visible(btn, 0.2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_remove_drops_listeners_and_observers() {
        let p = page();
        let btn = p.query_all(".btn")[0];
        let (_, cb) = counter();
        p.add_listener(Root::Element(btn), "click", ListenerKey(1), cb);
        let _handle = p.observe_intersection(btn, 0.2, Arc::new(|_| {}));
        assert!(p.remove(p.query_all("#cart")[0]));
        assert_eq!(p.listener_count(), 0);
        assert_eq!(p.intersection_observer_count(), 0);
        assert!(p.query_all("button").is_empty());
    }

    #[test]
    fn test_apply_commands() {
        let p = page();
        let cmd: PageCommand = serde_json::from_value(json!({
            "op": "append",
            "parent": "#cart",
            "element": {"tag": "button", "classes": ["btn", "late"]}
        }))
        .unwrap();
        assert_eq!(p.apply(cmd), CommandOutcome::Applied);
        assert_eq!(p.query_all("#cart .btn").len(), 2);

        let nav: PageCommand =
            serde_json::from_value(json!({"op": "navigate", "url": "https://shop.example.com/pay"}))
                .unwrap();
        assert_eq!(p.apply(nav), CommandOutcome::Navigated);
        assert_eq!(p.url(), "https://shop.example.com/pay");

        p.apply(PageCommand::Select {
            selector: ".late".into(),
        });
        assert_eq!(p.selection_anchor(), p.query_all(".late").first().copied());
    }

    #[test]
    fn test_class_and_attribute_mutations() {
        let p = page();
        let btn = p.query_all(".btn")[0];
        assert!(p.toggle_class(btn, "done", true));
        assert_eq!(p.query_all(".btn.done"), vec![btn]);
        assert!(p.toggle_class(btn, "btn", false));
        assert!(p.query_all(".btn").is_empty());
        assert!(p.set_attribute(btn, "data-state", "sent"));
        assert_eq!(p.query_all("[data-state=sent]"), vec![btn]);
        assert!(p.set_text(btn, "Paid"));
        assert_eq!(p.element(btn).unwrap().text, "Paid");
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_frame_waits_while_hidden() {
        let p = Arc::new(page());
        p.set_hidden(true);
        let waiter = {
            let p = p.clone();
            tokio::spawn(async move { p.next_frame().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        p.set_hidden(false);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("frame should resolve once visible")
            .unwrap();
    }
}
