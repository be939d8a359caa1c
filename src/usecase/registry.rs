use crate::domain::broker::ConsumerHandle;
use crate::domain::instance::belongs_to_group;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A consumer instance owned by this process.
pub(crate) struct RegistryEntry {
    pub(crate) handle: Arc<dyn ConsumerHandle>,
    pub(crate) cancel: CancellationToken,
    pub(crate) task: Option<JoinHandle<()>>,
}

impl RegistryEntry {
    pub(crate) fn new(handle: Arc<dyn ConsumerHandle>) -> Self {
        Self {
            handle,
            cancel: CancellationToken::new(),
            task: None,
        }
    }
}

/// instance id -> running entry. Only ever touched behind the usecase's lock.
#[derive(Default)]
pub(crate) struct InstanceRegistry {
    entries: HashMap<String, RegistryEntry>,
}

impl InstanceRegistry {
    pub(crate) fn contains(&self, instance_id: &str) -> bool {
        self.entries.contains_key(instance_id)
    }

    pub(crate) fn insert(&mut self, instance_id: String, entry: RegistryEntry) {
        self.entries.insert(instance_id, entry);
    }

    pub(crate) fn attach_task(&mut self, instance_id: &str, task: JoinHandle<()>) {
        if let Some(entry) = self.entries.get_mut(instance_id) {
            entry.task = Some(task);
        }
    }

    pub(crate) fn get_mut(&mut self, instance_id: &str) -> Option<&mut RegistryEntry> {
        self.entries.get_mut(instance_id)
    }

    pub(crate) fn remove(&mut self, instance_id: &str) -> Option<RegistryEntry> {
        self.entries.remove(instance_id)
    }

    /// Keys equal to `group_id` or prefixed by `group_id-`, sorted.
    pub(crate) fn matching_group(&self, group_id: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .keys()
            .filter(|key| belongs_to_group(key, group_id))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub(crate) fn drain(&mut self) -> Vec<(String, RegistryEntry)> {
        let mut drained: Vec<_> = self.entries.drain().collect();
        drained.sort_by(|a, b| a.0.cmp(&b.0));
        drained
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
