/*!
Host page abstraction.

The trigger engine never touches a concrete DOM. Everything it needs from the
page goes through the [`Page`] trait:

- element queries (`query_all`, `closest`)
- event listeners keyed by a stable [`ListenerKey`] (adding the same key twice
  for the same target/event keeps a single listener, like `addEventListener`)
- insertion and intersection observation, returned as cancellable
  [`ObserverHandle`]s
- the current selection anchor and the render-frame clock

[`VirtualPage`] is the in-memory implementation used by the binary and the
test-suite. [`ElementReader`] and [`PageAvailability`] are the reference
context reader and availability checker built on top of it.
*/

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod availability;
pub mod reader;
pub mod selector;
pub mod virtual_page;

pub use availability::PageAvailability;
pub use reader::ElementReader;
pub use selector::{Selector, SelectorError};
pub use virtual_page::{CommandOutcome, ElementSeed, PageCommand, VirtualPage};

/// Identifier of an element owned by a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementId(pub u64);

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The DOM context a firing runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Root {
    Document,
    Element(ElementId),
}

impl Root {
    pub fn element(self) -> Option<ElementId> {
        match self {
            Root::Document => None,
            Root::Element(id) => Some(id),
        }
    }
}

impl fmt::Display for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Root::Document => f.write_str("document"),
            Root::Element(id) => write!(f, "element {id}"),
        }
    }
}

/// Stable identity of an event handler. One per trigger instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerKey(pub u64);

/// Keyboard modifier state carried by key events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modifiers {
    #[serde(default)]
    pub alt: bool,
    #[serde(default)]
    pub ctrl: bool,
    #[serde(default)]
    pub meta: bool,
    #[serde(default)]
    pub shift: bool,
}

/// A native event delivered to a listener.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeEvent {
    /// Event type, e.g. `click` or a custom event name.
    pub name: String,
    /// The node the event was dispatched on.
    pub target: Root,
    /// The node whose listener is being invoked (changes while bubbling).
    pub current_target: Root,
    /// Set for keyboard events.
    pub key: Option<String>,
    pub modifiers: Modifiers,
    /// Set for custom events.
    pub detail: Option<Value>,
}

impl NativeEvent {
    pub fn new(name: impl Into<String>, target: Root) -> Self {
        Self {
            name: name.into(),
            target,
            current_target: target,
            key: None,
            modifiers: Modifiers::default(),
            detail: None,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>, modifiers: Modifiers) -> Self {
        self.key = Some(key.into());
        self.modifiers = modifiers;
        self
    }

    /// Serializable projection of the event exposed to pipelines.
    ///
    /// Only plain data is copied: the type, key state for keyboard events and
    /// `detail` for custom events. Node references never leave the page.
    pub fn project(&self) -> Value {
        let mut out = Map::new();
        out.insert("type".into(), Value::String(self.name.clone()));
        if let Some(key) = &self.key {
            out.insert("key".into(), Value::String(key.clone()));
            out.insert("altKey".into(), Value::Bool(self.modifiers.alt));
            out.insert("ctrlKey".into(), Value::Bool(self.modifiers.ctrl));
            out.insert("metaKey".into(), Value::Bool(self.modifiers.meta));
            out.insert("shiftKey".into(), Value::Bool(self.modifiers.shift));
        }
        if let Some(detail) = &self.detail {
            out.insert("detail".into(), detail.clone());
        }
        Value::Object(out)
    }
}

pub type EventCallback = Arc<dyn Fn(&NativeEvent) + Send + Sync>;
pub type ElementCallback = Arc<dyn Fn(ElementId) + Send + Sync>;

/// Handle to a registered observer. Cancelling disconnects it exactly once;
/// dropping the handle without cancelling leaves the observer running.
pub struct ObserverHandle {
    disconnect: Option<Box<dyn FnOnce() + Send>>,
}

impl ObserverHandle {
    pub fn new(disconnect: impl FnOnce() + Send + 'static) -> Self {
        Self {
            disconnect: Some(Box::new(disconnect)),
        }
    }

    pub fn cancel(mut self) {
        if let Some(disconnect) = self.disconnect.take() {
            disconnect();
        }
    }
}

impl fmt::Debug for ObserverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverHandle")
            .field("connected", &self.disconnect.is_some())
            .finish()
    }
}

/// The live page the trigger engine attaches to.
///
/// Callbacks are always invoked without any internal page lock held, so they
/// may call back into the page (e.g. start observing a freshly inserted node).
#[async_trait]
pub trait Page: Send + Sync {
    fn url(&self) -> String;

    /// All elements matching `selector`, in document order. An invalid
    /// selector matches nothing.
    fn query_all(&self, selector: &str) -> Vec<ElementId>;

    /// Closest inclusive ancestor of `element` matching `selector`.
    fn closest(&self, element: ElementId, selector: &str) -> Option<ElementId>;

    fn add_listener(&self, target: Root, event: &str, key: ListenerKey, callback: EventCallback);

    fn remove_listener(&self, target: Root, event: &str, key: ListenerKey);

    /// Observe elements inserted from now on that match `selector`.
    fn observe_insertions(&self, selector: &str, callback: ElementCallback) -> ObserverHandle;

    /// Observe `element` becoming at least `threshold` visible.
    fn observe_intersection(
        &self,
        element: ElementId,
        threshold: f64,
        callback: ElementCallback,
    ) -> ObserverHandle;

    /// Best-effort guess of the element holding the current selection.
    fn selection_anchor(&self) -> Option<ElementId>;

    /// Resolves on the next render frame. Never resolves while the page is hidden.
    async fn next_frame(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_projection_of_plain_event() {
        let event = NativeEvent::new("click", Root::Document);
        assert_eq!(event.project(), json!({"type": "click"}));
    }

    #[test]
    fn test_projection_of_key_and_custom_events() {
        let key = NativeEvent::new("keydown", Root::Element(ElementId(3))).with_key(
            "Enter",
            Modifiers {
                shift: true,
                ..Modifiers::default()
            },
        );
        assert_eq!(
            key.project(),
            json!({
                "type": "keydown",
                "key": "Enter",
                "altKey": false,
                "ctrlKey": false,
                "metaKey": false,
                "shiftKey": true
            })
        );

        let custom = NativeEvent::new("cart:add", Root::Document).with_detail(json!({"sku": 7}));
        assert_eq!(
            custom.project(),
            json!({"type": "cart:add", "detail": {"sku": 7}})
        );
    }

    #[test]
    fn test_observer_handle_disconnects_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let handle = ObserverHandle::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        handle.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
