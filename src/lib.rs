pub mod errors;
pub mod logging;
pub mod models;
pub mod parse_url;
pub mod preferences;
pub mod services;
pub mod store;

use tokio::sync::broadcast;

use crate::errors::Result;
use crate::models::Notification;
use crate::preferences::{Preferences, PreferencesStore};
use crate::services::{CoreConfig, NotificationHub, TaskManager};
use crate::store::{StoreEvent, StoreState, TaskStore};

/// The launcher core behind the presentation boundary: URL submission, task
/// abort/delete, store snapshots and change subscriptions, preferences and
/// notifications. The GUI shell talks to this and nothing else.
#[derive(Clone)]
pub struct LauncherCore {
    store: TaskStore,
    prefs: PreferencesStore,
    notifications: NotificationHub,
    tasks: TaskManager,
}

impl LauncherCore {
    pub fn new(prefs: PreferencesStore) -> Self {
        Self::with_config(prefs, CoreConfig::default())
    }

    pub fn with_config(prefs: PreferencesStore, config: CoreConfig) -> Self {
        let store = TaskStore::new();
        let notifications = NotificationHub::new();
        let tasks = TaskManager::new(
            store.clone(),
            prefs.clone(),
            notifications.clone(),
            config,
        );
        Self {
            store,
            prefs,
            notifications,
            tasks,
        }
    }

    /// Validates and starts handling a scheme URL; returns the new task id.
    /// Must be called from within a tokio runtime.
    pub fn submit_url(&self, url: &str) -> Result<String> {
        self.tasks.submit_url(url)
    }

    pub fn abort_task(&self, id: &str) -> Result<()> {
        self.tasks.abort_task(id)
    }

    pub async fn delete_task(&self, id: &str) -> Result<()> {
        self.tasks.delete_task(id).await
    }

    pub fn snapshot(&self) -> StoreState {
        self.store.snapshot()
    }

    pub fn subscribe_store(&self) -> broadcast::Receiver<StoreEvent> {
        self.store.subscribe()
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    pub fn preferences(&self) -> Preferences {
        self.prefs.get()
    }

    pub fn set_preferences(&self, prefs: Preferences) -> Result<()> {
        self.prefs.set(prefs)
    }
}
