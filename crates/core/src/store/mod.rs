use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::{
    scene::{merge_fields, Element, ElementId, SceneConfig},
    Result,
};

/// Authoritative scene state: elements in insertion (draw) order plus the
/// global scene config.
///
/// The store is owned by the stage and only ever mutated from command
/// handlers or from inside a scheduler tick, which never overlap.
#[derive(Debug, Default)]
pub struct SceneStore {
    elements: IndexMap<ElementId, Element>,
    config: SceneConfig,
}

impl SceneStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `element`, replacing any element with the same id in place.
    pub fn insert(&mut self, element: Element) -> Option<Element> {
        self.elements.insert(element.id.clone(), element)
    }

    /// Merges `fields` into the element with `id`.
    ///
    /// Returns `Ok(None)` when the id is unknown. An ill-typed field fails the
    /// whole merge and leaves the element untouched.
    pub fn merge(&mut self, id: &str, fields: &Map<String, Value>) -> Result<Option<&Element>> {
        let Some(slot) = self.elements.get_mut(id) else {
            return Ok(None);
        };
        *slot = merge_fields(&*slot, fields, &["id"])?;
        Ok(Some(&*slot))
    }

    /// Removes the element, keeping the draw order of the others.
    pub fn remove(&mut self, id: &str) -> Option<Element> {
        self.elements.shift_remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Element> {
        self.elements.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Element> {
        self.elements.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Element> {
        self.elements.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.elements.values_mut()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn config(&self) -> &SceneConfig {
        &self.config
    }

    pub fn merge_config(&mut self, fields: &Map<String, Value>) -> Result<()> {
        self.config = merge_fields(&self.config, fields, &[])?;
        Ok(())
    }
}
