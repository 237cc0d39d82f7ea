//! Durable credential and settings store.
//!
//! Persists the relay URL, the relay-issued token, printer settings and the
//! local device address to `~/.printsalot/config.json`. The store is the
//! single owner of these values: the relay client reads it at connect time
//! and writes issued/rotated tokens back through it, never caching a copy.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::settings::PrinterSettings;

/// Relay used when nothing else is configured.
pub const DEFAULT_RELAY_URL: &str = "https://printerbot.dragnai.dev";

/// Environment variable that overrides the stored relay URL.
pub const RELAY_URL_ENV: &str = "RELAY_URL";

/// Complete persisted receiver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverConfig {
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    /// Long-lived relay credential; `None` until the device is linked.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub printer_settings: PrinterSettings,
    #[serde(default)]
    pub device: DeviceConfig,
}

fn default_relay_url() -> String {
    DEFAULT_RELAY_URL.to_string()
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            token: None,
            printer_settings: PrinterSettings::default(),
            device: DeviceConfig::default(),
        }
    }
}

/// How the receipt printer is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Character device exposed by the OS printer-class driver (e.g. `/dev/usb/lp0`).
    File,
    /// Raw TCP socket (JetDirect, usually port 9100).
    Tcp,
}

/// Address of the local receipt printer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub kind: DeviceKind,
    /// Device path for [`DeviceKind::File`], `host:port` for [`DeviceKind::Tcp`].
    pub target: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            kind: DeviceKind::File,
            target: "/dev/usb/lp0".to_string(),
        }
    }
}

impl fmt::Display for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DeviceKind::File => write!(f, "file:{}", self.target),
            DeviceKind::Tcp => write!(f, "tcp:{}", self.target),
        }
    }
}

impl FromStr for DeviceConfig {
    type Err = Error;

    /// Parse `file:/dev/usb/lp0` or `tcp:192.168.1.50:9100`. A bare path is
    /// treated as a file device.
    fn from_str(s: &str) -> Result<Self> {
        let (kind, target) = match s.split_once(':') {
            Some(("file", rest)) => (DeviceKind::File, rest),
            Some(("tcp", rest)) => (DeviceKind::Tcp, rest),
            _ => (DeviceKind::File, s),
        };
        if target.is_empty() {
            return Err(Error::Config(format!("Empty device target in '{s}'")));
        }
        if kind == DeviceKind::Tcp && !target.contains(':') {
            return Err(Error::Config(format!(
                "TCP device '{target}' must be host:port"
            )));
        }
        Ok(Self {
            kind,
            target: target.to_string(),
        })
    }
}

/// Thread-safe, write-through store for [`ReceiverConfig`].
#[derive(Debug)]
pub struct ConfigStore {
    /// `None` for in-memory stores (tests).
    path: Option<PathBuf>,
    /// Session-scoped relay URL (from the command line); never persisted.
    relay_override: Option<String>,
    inner: Mutex<ReceiverConfig>,
}

impl ConfigStore {
    /// Path to the config directory: `~/.printsalot/`.
    pub fn config_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".printsalot"))
    }

    /// Path to the config file: `~/.printsalot/config.json`.
    pub fn default_path() -> Option<PathBuf> {
        Self::config_dir().map(|d| d.join("config.json"))
    }

    /// Open the store at `path`. A missing or unparseable file is replaced
    /// with defaults so the receiver can always start.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Config file is corrupt, resetting to defaults");
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(Error::Config(format!(
                    "Failed to read config file {}: {e}",
                    path.display()
                )));
            }
        };

        let store = Self {
            path: Some(path),
            relay_override: None,
            inner: Mutex::new(config.clone().unwrap_or_default()),
        };
        if config.is_none() {
            store.save(&store.lock())?;
        }
        Ok(store)
    }

    /// Store that lives only in memory.
    pub fn in_memory(config: ReceiverConfig) -> Self {
        Self {
            path: None,
            relay_override: None,
            inner: Mutex::new(config),
        }
    }

    /// Use `url` for this process instead of the stored relay URL.
    #[must_use]
    pub fn with_relay_override(mut self, url: Option<String>) -> Self {
        self.relay_override = url;
        self
    }

    /// File backing this store, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Copy of the whole configuration.
    pub fn snapshot(&self) -> ReceiverConfig {
        self.lock().clone()
    }

    /// Effective relay URL: command line, then `RELAY_URL`, then the file.
    pub fn relay_url(&self) -> String {
        if let Some(url) = &self.relay_override {
            return url.clone();
        }
        if let Ok(url) = std::env::var(RELAY_URL_ENV) {
            if !url.is_empty() {
                return url;
            }
        }
        self.lock().relay_url.clone()
    }

    pub fn token(&self) -> Option<String> {
        self.lock().token.clone()
    }

    /// Replace the stored token.
    pub fn set_token(&self, token: &str) -> Result<()> {
        self.update(|c| c.token = Some(token.to_string()))
    }

    /// Forget the stored token (unlink).
    pub fn clear_token(&self) -> Result<()> {
        self.update(|c| c.token = None)
    }

    pub fn printer_settings(&self) -> PrinterSettings {
        self.lock().printer_settings.clone()
    }

    pub fn set_printer_settings(&self, settings: PrinterSettings) -> Result<()> {
        self.update(|c| c.printer_settings = settings)
    }

    pub fn device(&self) -> DeviceConfig {
        self.lock().device.clone()
    }

    pub fn set_device(&self, device: DeviceConfig) -> Result<()> {
        self.update(|c| c.device = device)
    }

    fn lock(&self) -> MutexGuard<'_, ReceiverConfig> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutate and write through. The in-memory value is only replaced once
    /// the file write succeeded.
    fn update(&self, f: impl FnOnce(&mut ReceiverConfig)) -> Result<()> {
        let mut guard = self.lock();
        let mut next = guard.clone();
        f(&mut next);
        self.save(&next)?;
        *guard = next;
        Ok(())
    }

    fn save(&self, config: &ReceiverConfig) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(config)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        debug!(path = %path.display(), "Config saved");
        Ok(())
    }
}
