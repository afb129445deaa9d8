//! Shared entity state with change tracking.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{BridgeError, Result};
use crate::{EntityDescriptor, EntityKind, EntityValue};

/// One entity and its current state.
#[derive(Debug, Clone)]
pub struct Entity {
    /// Static description (kind, discovery metadata).
    pub descriptor: EntityDescriptor,
    /// Last known value, `None` until the first update.
    pub value: Option<EntityValue>,
    /// Set when the value changed since the last publish.
    pub dirty: bool,
}

/// Process-wide entity state shared between the device side and the MQTT side.
///
/// Cloning is cheap; all clones see the same entities. Every access holds the
/// lock only for the duration of the map operation.
#[derive(Debug, Clone, Default)]
pub struct EntityStore {
    entities: Arc<Mutex<BTreeMap<String, Entity>>>,
}

impl EntityStore {
    /// Create a store holding the given entities.
    ///
    /// Entities with an initial value start dirty so the first publish
    /// carries them.
    pub fn new(descriptors: impl IntoIterator<Item = EntityDescriptor>) -> Self {
        let entities = descriptors
            .into_iter()
            .map(|descriptor| {
                let value = descriptor.initial.clone();
                let entity = Entity {
                    dirty: value.is_some(),
                    value,
                    descriptor,
                };
                (entity.descriptor.name.clone(), entity)
            })
            .collect();

        Self {
            entities: Arc::new(Mutex::new(entities)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Entity>> {
        self.entities.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether an entity is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Kind of a registered entity.
    pub fn kind(&self, name: &str) -> Option<EntityKind> {
        self.lock().get(name).map(|e| e.descriptor.kind)
    }

    /// Current value of an entity.
    pub fn get(&self, name: &str) -> Option<EntityValue> {
        self.lock().get(name).and_then(|e| e.value.clone())
    }

    /// Descriptors of all entities, ordered by name.
    pub fn descriptors(&self) -> Vec<EntityDescriptor> {
        self.lock().values().map(|e| e.descriptor.clone()).collect()
    }

    /// Current values of all entities that have one.
    pub fn snapshot(&self) -> BTreeMap<String, EntityValue> {
        self.lock()
            .iter()
            .filter_map(|(name, e)| e.value.clone().map(|v| (name.clone(), v)))
            .collect()
    }

    /// Set one entity.
    ///
    /// Returns whether the value changed. Unknown names are rejected and leave
    /// the store untouched.
    pub fn set_entity(&self, name: &str, value: EntityValue) -> Result<bool> {
        let mut entities = self.lock();
        let entity = entities
            .get_mut(name)
            .ok_or_else(|| BridgeError::UnknownEntity(name.to_string()))?;

        Ok(update(entity, value))
    }

    /// Merge a batch of values, skipping names that are not registered.
    ///
    /// Returns the number of entities whose value changed.
    pub fn apply<I>(&self, values: I) -> usize
    where
        I: IntoIterator<Item = (String, EntityValue)>,
    {
        let mut entities = self.lock();
        let mut changed = 0;

        for (name, value) in values {
            match entities.get_mut(&name) {
                Some(entity) => {
                    if update(entity, value) {
                        changed += 1;
                    }
                }
                None => tracing::trace!(entity = %name, "Ignoring value for unregistered entity"),
            }
        }

        changed
    }

    /// Collect the state payload for one kind and clear the dirty flags.
    ///
    /// With `force`, every entity of the kind that has a value is included.
    /// Returns `None` when there is nothing to publish.
    pub fn take_updates(
        &self,
        kind: EntityKind,
        force: bool,
    ) -> Option<serde_json::Map<String, serde_json::Value>> {
        let mut entities = self.lock();
        let mut payload = serde_json::Map::new();

        for (name, entity) in entities.iter_mut() {
            if entity.descriptor.kind != kind || !(force || entity.dirty) {
                continue;
            }
            if let Some(value) = &entity.value {
                let json = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
                payload.insert(name.clone(), json);
                entity.dirty = false;
            }
        }

        (!payload.is_empty()).then_some(payload)
    }

    /// Flag entities as changed again, e.g. after their publish failed.
    ///
    /// Names that are not registered are ignored.
    pub fn mark_dirty<'a>(&self, names: impl IntoIterator<Item = &'a String>) {
        let mut entities = self.lock();
        for name in names {
            if let Some(entity) = entities.get_mut(name) {
                entity.dirty = true;
            }
        }
    }
}

fn update(entity: &mut Entity, value: EntityValue) -> bool {
    if entity.value.as_ref() == Some(&value) {
        return false;
    }
    entity.value = Some(value);
    entity.dirty = true;
    true
}
