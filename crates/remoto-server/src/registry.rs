use std::collections::HashMap;
use std::sync::Arc;

use remoto_common::{RemotoError, Result};

use crate::expose::{instance_key, Exposed, RemoteObject};

/// Names a registered object, either by id or by the instance itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectRef {
    Id(String),
    Instance(usize),
}

impl From<&str> for ObjectRef {
    fn from(id: &str) -> Self {
        ObjectRef::Id(id.to_string())
    }
}

impl From<String> for ObjectRef {
    fn from(id: String) -> Self {
        ObjectRef::Id(id)
    }
}

impl From<&String> for ObjectRef {
    fn from(id: &String) -> Self {
        ObjectRef::Id(id.clone())
    }
}

impl<T: Exposed> From<&Arc<T>> for ObjectRef {
    fn from(instance: &Arc<T>) -> Self {
        ObjectRef::Instance(instance_key(instance))
    }
}

/// Object id to object map, plus the reverse instance lookup.
///
/// Holding the `Arc` keeps every registered instance alive, so an instance
/// address cannot be reused while it is a key here.
#[derive(Default)]
pub(crate) struct Registry {
    objects: HashMap<String, Arc<dyn RemoteObject>>,
    ids_by_instance: HashMap<usize, String>,
}

impl Registry {
    pub(crate) fn insert(&mut self, id: String, object: Arc<dyn RemoteObject>) -> Result<()> {
        let key = object.instance_key();
        if let Some(existing) = self.ids_by_instance.get(&key) {
            return Err(RemotoError::Daemon(format!(
                "object or class already has an id: {}",
                existing
            )));
        }
        if self.objects.contains_key(&id) {
            return Err(RemotoError::Daemon(format!("object or class already registered: {}", id)));
        }
        self.ids_by_instance.insert(key, id.clone());
        self.objects.insert(id, object);
        Ok(())
    }

    /// Resolves a reference to a registered id.
    pub(crate) fn resolve(&self, target: &ObjectRef) -> Option<String> {
        match target {
            ObjectRef::Id(id) => self.objects.contains_key(id).then(|| id.clone()),
            ObjectRef::Instance(key) => self.ids_by_instance.get(key).cloned(),
        }
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<Arc<dyn RemoteObject>> {
        let object = self.objects.remove(id)?;
        self.ids_by_instance.remove(&object.instance_key());
        Some(object)
    }

    pub(crate) fn get(&self, id: &str) -> Option<Arc<dyn RemoteObject>> {
        self.objects.get(id).cloned()
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.objects.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub(crate) fn len(&self) -> usize {
        self.objects.len()
    }

    /// Drops everything except the ids in `keep`.
    pub(crate) fn retain_only(&mut self, keep: &[&str]) {
        let ids: Vec<String> = self
            .objects
            .keys()
            .filter(|id| !keep.contains(&id.as_str()))
            .cloned()
            .collect();
        for id in ids {
            self.remove(&id);
        }
    }
}
