//! Per-device printer settings negotiated with the relay.
//!
//! The same struct is persisted in the config file, sent as part of the
//! connect auth payload and pushed on `update_settings`, so field names are
//! the relay's wire names.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Widest raster the relay will render for a receipt printer.
pub const MAX_WIDTH_PX: u32 = 800;

/// Below this width the relay's receipt layout starts to break.
pub const MIN_RECOMMENDED_WIDTH_PX: u32 = 350;

/// Printer settings sent to the relay on every connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrinterSettings {
    /// Printable width in dots.
    #[serde(default = "default_width")]
    pub width: u32,
    /// Daily print limit across all users (-1 for unlimited).
    #[serde(default = "default_max_prints_per_day")]
    pub max_prints_per_day: i32,
    /// Daily print limit per user.
    #[serde(default = "default_max_prints_per_user_per_day")]
    pub max_prints_per_user_per_day: i32,
    /// Tallest image the relay may send, in pixels.
    #[serde(default = "default_max_px_height")]
    pub max_px_height: u32,
    /// Attachments accepted per print request.
    #[serde(default = "default_max_attachments")]
    pub max_attachments: u32,
    /// Cut the paper after each job unless the job says otherwise.
    #[serde(default = "default_auto_cut")]
    pub auto_cut: bool,
    /// IANA timezone used by the relay to reset daily limits.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

const fn default_width() -> u32 {
    384
}

const fn default_max_prints_per_day() -> i32 {
    50
}

const fn default_max_prints_per_user_per_day() -> i32 {
    5
}

const fn default_max_px_height() -> u32 {
    2000
}

const fn default_max_attachments() -> u32 {
    1
}

const fn default_auto_cut() -> bool {
    true
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for PrinterSettings {
    fn default() -> Self {
        Self {
            width: default_width(),
            max_prints_per_day: default_max_prints_per_day(),
            max_prints_per_user_per_day: default_max_prints_per_user_per_day(),
            max_px_height: default_max_px_height(),
            max_attachments: default_max_attachments(),
            auto_cut: default_auto_cut(),
            timezone: default_timezone(),
        }
    }
}

/// Adjustment or advisory produced while normalising user-entered settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsWarning {
    /// Width exceeded [`MAX_WIDTH_PX`] and was capped.
    WidthCapped { requested: u32 },
    /// Width is below [`MIN_RECOMMENDED_WIDTH_PX`]; kept as entered.
    NarrowWidth { width: u32 },
}

impl fmt::Display for SettingsWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WidthCapped { requested } => {
                write!(f, "Width {requested}px capped at {MAX_WIDTH_PX}px")
            }
            Self::NarrowWidth { width } => write!(
                f,
                "Width {width}px is below {MIN_RECOMMENDED_WIDTH_PX}px and may break the layout"
            ),
        }
    }
}

impl PrinterSettings {
    /// Apply the relay's limits to user-entered settings.
    #[must_use]
    pub fn normalized(mut self) -> (Self, Vec<SettingsWarning>) {
        let mut warnings = Vec::new();
        if self.width > MAX_WIDTH_PX {
            warnings.push(SettingsWarning::WidthCapped {
                requested: self.width,
            });
            self.width = MAX_WIDTH_PX;
        }
        if self.width < MIN_RECOMMENDED_WIDTH_PX {
            warnings.push(SettingsWarning::NarrowWidth { width: self.width });
        }
        if self.timezone.trim().is_empty() {
            self.timezone = default_timezone();
        }
        (self, warnings)
    }
}
