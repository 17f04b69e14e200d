//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Category attached to every notification the engine sends.
pub const DEFAULT_NOTIFICATION_CATEGORY: &str = "exchange request";

/// Tunables of [`crate::ExchangeEngine`].
///
/// Deserialises from any serde format; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Category passed to the notification sink.
    pub notification_category: String,

    /// Notify the other party again when a participant confirms a side that is
    /// already confirmed. Off by default: the repeat confirmation changes nothing,
    /// so the extra notification is a duplicate.
    pub renotify_on_repeat_confirm: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            notification_category: DEFAULT_NOTIFICATION_CATEGORY.to_string(),
            renotify_on_repeat_confirm: false,
        }
    }
}
