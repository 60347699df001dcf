//! Security mode
//!
//! The agent runs in one of three modes. Only AWAY arms the buzzer on motion;
//! every mode still records motion events.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Home,
    Away,
    Night,
}

impl Mode {
    pub const ALL: [Mode; 3] = [Mode::Home, Mode::Away, Mode::Night];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Home => "HOME",
            Mode::Away => "AWAY",
            Mode::Night => "NIGHT",
        }
    }

    /// Whether motion in this mode should sound the buzzer
    pub fn arms_buzzer(&self) -> bool {
        matches!(self, Mode::Away)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = Error;

    /// Case-insensitive, surrounding whitespace ignored
    fn from_str(s: &str) -> Result<Self> {
        let candidate = s.trim().to_ascii_uppercase();
        Mode::ALL
            .into_iter()
            .find(|m| m.as_str() == candidate)
            .ok_or_else(|| Error::InvalidMode(s.to_string()))
    }
}

type ModeCallback = Arc<dyn Fn(Mode) + Send + Sync>;

/// Owns the current [`Mode`] and notifies listeners when it changes.
pub struct ModeManager {
    mode: Mutex<Mode>,
    callbacks: Mutex<Vec<ModeCallback>>,
}

impl ModeManager {
    pub fn new(initial: Mode) -> Self {
        Self {
            mode: Mutex::new(initial),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn get_mode(&self) -> Mode {
        *self.mode.lock().unwrap()
    }

    /// Switch modes. Returns false if `mode` is already active.
    ///
    /// Callbacks run synchronously on the calling thread with no lock held, so
    /// a callback may read the mode, switch it again, or register another
    /// callback. Callbacks registered during a change first run on the next one.
    pub fn set_mode(&self, mode: Mode) -> bool {
        let previous = {
            let mut current = self.mode.lock().unwrap();
            if *current == mode {
                tracing::debug!(mode = %mode, "Mode unchanged");
                return false;
            }
            std::mem::replace(&mut *current, mode)
        };

        tracing::info!(from = %previous, to = %mode, "System mode changed");
        let callbacks = self.callbacks.lock().unwrap().clone();
        for callback in callbacks {
            callback(mode);
        }
        true
    }

    pub fn register_callback<F>(&self, callback: F)
    where
        F: Fn(Mode) + Send + Sync + 'static,
    {
        self.callbacks.lock().unwrap().push(Arc::new(callback));
    }
}

impl Default for ModeManager {
    fn default() -> Self {
        Self::new(Mode::default())
    }
}
