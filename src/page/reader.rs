//! Reference context reader over [`VirtualPage`].

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::{Page, Root, VirtualPage};
use crate::ports::ContextReader;

/// Reads tag, id, classes, attributes and text of the root element, or the
/// URL when the root is the document.
#[derive(Clone)]
pub struct ElementReader {
    page: Arc<VirtualPage>,
}

impl ElementReader {
    pub fn new(page: Arc<VirtualPage>) -> Self {
        Self { page }
    }
}

#[async_trait]
impl ContextReader for ElementReader {
    async fn read(&self, root: Root) -> anyhow::Result<Map<String, Value>> {
        let mut out = Map::new();
        match root {
            Root::Document => {
                out.insert("url".into(), Value::String(self.page.url()));
            }
            Root::Element(id) => {
                let element = self
                    .page
                    .element(id)
                    .ok_or_else(|| anyhow!("element {id} is no longer attached"))?;
                out.insert("tagName".into(), json!(element.tag));
                out.insert(
                    "id".into(),
                    element
                        .attributes
                        .get("id")
                        .map_or(Value::Null, |v| json!(v)),
                );
                out.insert("classes".into(), json!(element.classes()));
                out.insert("attributes".into(), json!(element.attributes));
                out.insert("text".into(), json!(element.text));
            }
        }
        Ok(out)
    }
}
