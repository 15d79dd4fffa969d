use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{FrameState, TaskState};

pub type StoreState = HashMap<String, TaskState>;

/// Compact description of one store mutation, published to subscribers in the
/// exact order mutations were applied.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StoreEvent {
    TaskChanged { id: String, task: TaskState },
    TaskRemoved { id: String },
}

/// The single source of truth for task state. Injectable rather than a
/// process-global so tests can run against independent containers.
///
/// Every mutation goes through one of the `insert`/`update`/`remove` methods,
/// which hold the lock across mutate + notify: subscribers never observe
/// interleaved or reordered changes. Mutator closures are synchronous by
/// signature, so no async work can happen inside a mutation.
#[derive(Clone)]
pub struct TaskStore {
    inner: Arc<Mutex<StoreState>>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    pub fn snapshot(&self) -> StoreState {
        self.lock().clone()
    }

    pub fn get(&self, id: &str) -> Option<TaskState> {
        self.lock().get(id).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn insert(&self, task: TaskState) {
        let mut state = self.lock();
        let id = task.id.clone();
        state.insert(id.clone(), task.clone());
        // send only fails when nobody is listening, which is fine
        let _ = self.events.send(StoreEvent::TaskChanged { id, task });
    }

    /// Applies `mutate` to the task, if present, and publishes the result.
    pub fn update<F>(&self, id: &str, mutate: F)
    where
        F: FnOnce(&mut TaskState),
    {
        let mut state = self.lock();
        if let Some(task) = state.get_mut(id) {
            mutate(task);
            let task = task.clone();
            let _ = self.events.send(StoreEvent::TaskChanged {
                id: id.to_string(),
                task,
            });
        }
    }

    /// Applies `mutate` to one frame of a task, creating the frame entry
    /// first if it does not exist yet.
    pub fn update_frame<F>(&self, id: &str, frame_id: &str, mutate: F)
    where
        F: FnOnce(&mut FrameState),
    {
        self.update(id, |task| {
            let frame = task
                .frames
                .entry(frame_id.to_string())
                .or_insert_with(|| FrameState::new(frame_id));
            mutate(frame);
        });
    }

    pub fn remove(&self, id: &str) -> Option<TaskState> {
        let mut state = self.lock();
        let removed = state.remove(id);
        if removed.is_some() {
            let _ = self.events.send(StoreEvent::TaskRemoved { id: id.to_string() });
        }
        removed
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
