//! Capture-side components.
//!
//! The capture driver itself is an external collaborator behind
//! [`CaptureDriver`]; this module owns everything downstream of a completed
//! capture: per-source buffering with perceptual dedup, batch triggering,
//! batch persistence, and the adaptive backpressure controller.

mod backpressure;
mod builder;
mod registry;

pub use backpressure::{BackpressureController, BackpressureUpdate};
pub use builder::BatchBuilder;
pub use registry::{AddOutcome, CaptureInput, PersistFn, RejectReason, SourceBufferRegistry};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::SourceKey;

/// Facade over the platform screen-capture driver.
///
/// The engine only steers it: pausing on AI outages and retuning the
/// sampling interval under backpressure.
pub trait CaptureDriver: Send + Sync {
    /// Starts (or resumes) capturing.
    fn start(&self) -> Result<()>;
    /// Stops capturing; buffered work elsewhere in the pipeline continues.
    fn stop(&self) -> Result<()>;
    /// Whether the driver is currently capturing.
    fn is_running(&self) -> bool;
    /// Applies a new sampling interval.
    fn set_interval_ms(&self, interval_ms: u64);
}

/// User capture selection. Empty selections mean "all displays".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapturePreferences {
    /// Explicitly selected screens.
    #[serde(default)]
    pub selected_screens: Vec<ScreenSelection>,
    /// Explicitly selected application windows.
    #[serde(default)]
    pub selected_apps: Vec<AppSelection>,
}

/// A selected physical display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenSelection {
    /// Display identifier.
    pub display_id: String,
}

/// A selected application window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSelection {
    /// Window identifier.
    pub id: String,
    /// Application name, for display only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
}

impl CapturePreferences {
    /// Resolves the active-source set: explicit selections when present,
    /// otherwise every physical display.
    pub fn active_keys(&self, all_displays: &[String]) -> Vec<SourceKey> {
        if self.selected_screens.is_empty() && self.selected_apps.is_empty() {
            return all_displays.iter().map(|d| SourceKey::screen(d)).collect();
        }
        let mut keys: Vec<SourceKey> = self
            .selected_screens
            .iter()
            .map(|s| SourceKey::screen(&s.display_id))
            .collect();
        keys.extend(self.selected_apps.iter().map(|a| SourceKey::window(&a.id)));
        keys
    }
}
