use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::errors::Result;

pub const PREFERENCES_KIND: &str = "Preferences";
pub const PREFERENCES_API_VERSION: &str = "v1alpha6";

const DEFAULT_DS9_ARGS: &str = "-geometry 1000x1000 -view keyword yes -view keyvalue filter \
-view frame no -zscale -lock frame image -lock scale yes";

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    pub kind: String,
    pub api_version: String,
    pub ds9: Ds9Preferences,
    pub custom_download_dir: CustomDownloadDir,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Ds9Preferences {
    /// Path to the DS9 executable. Empty means not configured yet.
    pub path: String,
    pub args: String,
    pub mosaic_args: String,
    /// When set, a non-zero viewer exit code fails the task instead of
    /// merely closing it.
    #[serde(default)]
    pub fail_on_nonzero_exit: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CustomDownloadDir {
    pub enabled: bool,
    pub path: String,
    pub cleanup: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            kind: PREFERENCES_KIND.to_string(),
            api_version: PREFERENCES_API_VERSION.to_string(),
            ds9: Ds9Preferences {
                path: String::new(),
                args: DEFAULT_DS9_ARGS.to_string(),
                mosaic_args: format!("{} -mosaic", DEFAULT_DS9_ARGS),
                fail_on_nonzero_exit: false,
            },
            custom_download_dir: CustomDownloadDir {
                enabled: false,
                path: String::new(),
                cleanup: true,
            },
        }
    }
}

impl Preferences {
    pub fn is_valid(&self) -> bool {
        self.kind == PREFERENCES_KIND && self.api_version == PREFERENCES_API_VERSION
    }
}

/// Holds the current preferences and notifies subscribers on change.
/// Optionally backed by a JSON file; an unrecognized or version-mismatched
/// record on disk is discarded in favor of defaults.
#[derive(Clone)]
pub struct PreferencesStore {
    inner: Arc<Mutex<Preferences>>,
    path: Option<PathBuf>,
    events: broadcast::Sender<Preferences>,
}

impl Default for PreferencesStore {
    fn default() -> Self {
        Self::in_memory(Preferences::default())
    }
}

impl PreferencesStore {
    pub fn in_memory(prefs: Preferences) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Mutex::new(prefs)),
            path: None,
            events,
        }
    }

    pub fn load(path: PathBuf) -> Self {
        let prefs = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Preferences>(&raw) {
                Ok(prefs) if prefs.is_valid() => prefs,
                Ok(prefs) => {
                    warn!(
                        "discarding preferences at {:?}: unsupported kind/apiVersion {}/{}",
                        path, prefs.kind, prefs.api_version
                    );
                    Preferences::default()
                }
                Err(err) => {
                    warn!("discarding unreadable preferences at {:?}: {}", path, err);
                    Preferences::default()
                }
            },
            Err(_) => Preferences::default(),
        };

        let mut store = Self::in_memory(prefs);
        store.path = Some(path);
        store
    }

    pub fn get(&self) -> Preferences {
        match self.inner.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set(&self, prefs: Preferences) -> Result<()> {
        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, serde_json::to_vec_pretty(&prefs)?)?;
        }
        match self.inner.lock() {
            Ok(mut guard) => *guard = prefs.clone(),
            Err(poisoned) => *poisoned.into_inner() = prefs.clone(),
        }
        let _ = self.events.send(prefs);
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Preferences> {
        self.events.subscribe()
    }
}
