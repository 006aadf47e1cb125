//! Theme preference state.
//!
//! Two flags: whether the UI renders dark, and whether that follows the
//! operating system. While following, the dark flag is always recomputed
//! from `SystemPreference`; any explicit toggle stops following. The state
//! is persisted under `theme-storage` after every change.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::storage::KeyValueStore;

pub const THEME_STORAGE_KEY: &str = "theme-storage";

const STORAGE_VERSION: u32 = 0;

/// The operating system's colour-scheme preference.
pub trait SystemPreference: Send + Sync {
    fn prefers_dark(&self) -> bool;
}

/// A preference value the host keeps current from its OS notifications.
#[derive(Debug, Default)]
pub struct SharedPreference {
    dark: AtomicBool,
}

impl SharedPreference {
    pub fn new(dark: bool) -> Self {
        Self {
            dark: AtomicBool::new(dark),
        }
    }

    pub fn set(&self, dark: bool) {
        self.dark.store(dark, Ordering::Relaxed);
    }
}

impl SystemPreference for SharedPreference {
    fn prefers_dark(&self) -> bool {
        self.dark.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThemeState {
    pub is_dark: bool,
    pub is_system_theme: bool,
}

/// What the theme button shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThemeMode {
    System,
    Dark,
    Light,
}

#[derive(Serialize, Deserialize)]
struct Persisted {
    state: ThemeState,
    version: u32,
}

pub struct ThemeStore {
    state: RwLock<ThemeState>,
    system: Arc<dyn SystemPreference>,
    storage: Arc<dyn KeyValueStore>,
}

impl ThemeStore {
    /// Restore the persisted state, or start following the system.
    ///
    /// A restored state that follows the system takes its dark flag from the
    /// current OS preference rather than the stored one. An unreadable stored
    /// value is replaced by the default.
    pub fn load(system: Arc<dyn SystemPreference>, storage: Arc<dyn KeyValueStore>) -> Result<Self, ApiError> {
        let restored = match storage.get(THEME_STORAGE_KEY)? {
            Some(raw) => match serde_json::from_str::<Persisted>(&raw) {
                Ok(persisted) => Some(persisted.state),
                Err(e) => {
                    warn!(error = %e, "ignoring unreadable theme preference");
                    None
                }
            },
            None => None,
        };

        let state = match restored {
            Some(state) if state.is_system_theme => ThemeState {
                is_dark: system.prefers_dark(),
                is_system_theme: true,
            },
            Some(state) => state,
            None => ThemeState {
                is_dark: system.prefers_dark(),
                is_system_theme: true,
            },
        };
        debug!(?state, "theme loaded");

        Ok(Self {
            state: RwLock::new(state),
            system,
            storage,
        })
    }

    pub fn state(&self) -> ThemeState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_dark(&self) -> bool {
        self.state().is_dark
    }

    pub fn is_system_theme(&self) -> bool {
        self.state().is_system_theme
    }

    pub fn mode(&self) -> ThemeMode {
        match self.state() {
            ThemeState {
                is_system_theme: true,
                ..
            } => ThemeMode::System,
            ThemeState { is_dark: true, .. } => ThemeMode::Dark,
            ThemeState { is_dark: false, .. } => ThemeMode::Light,
        }
    }

    /// Flip dark/light and stop following the system.
    pub fn toggle_theme(&self) -> Result<ThemeState, ApiError> {
        self.apply(|state| ThemeState {
            is_dark: !state.is_dark,
            is_system_theme: false,
        })
    }

    /// Start or stop following the system. Stopping always lands on light;
    /// the last explicit choice is not restored.
    pub fn set_system_theme(&self, follow: bool) -> Result<ThemeState, ApiError> {
        let system = Arc::clone(&self.system);
        self.apply(move |_| ThemeState {
            is_dark: follow && system.prefers_dark(),
            is_system_theme: follow,
        })
    }

    /// Re-read the OS preference if following it. Call on every OS
    /// preference-change notification.
    pub fn update_from_system(&self) -> Result<ThemeState, ApiError> {
        let system = Arc::clone(&self.system);
        self.apply(move |state| ThemeState {
            is_dark: if state.is_system_theme {
                system.prefers_dark()
            } else {
                state.is_dark
            },
            ..state
        })
    }

    /// Theme button: system → dark → system, with light reachable only
    /// through `toggle_theme`.
    pub fn cycle_theme(&self) -> Result<ThemeState, ApiError> {
        let system = Arc::clone(&self.system);
        self.apply(move |state| match (state.is_system_theme, state.is_dark) {
            (false, true) => ThemeState {
                is_dark: system.prefers_dark(),
                is_system_theme: true,
            },
            _ => ThemeState {
                is_dark: true,
                is_system_theme: false,
            },
        })
    }

    // In-memory state changes first; a storage failure is reported after.
    fn apply(&self, transition: impl FnOnce(ThemeState) -> ThemeState) -> Result<ThemeState, ApiError> {
        let (previous, next) = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let previous = *state;
            *state = transition(previous);
            (previous, *state)
        };
        if next != previous {
            debug!(?next, "theme changed");
            self.persist(next)?;
        }
        Ok(next)
    }

    fn persist(&self, state: ThemeState) -> Result<(), ApiError> {
        let raw = serde_json::to_string(&Persisted {
            state,
            version: STORAGE_VERSION,
        })
        .map_err(|e| ApiError::SerializationError(e.to_string()))?;
        self.storage.set(THEME_STORAGE_KEY, &raw)
    }
}
