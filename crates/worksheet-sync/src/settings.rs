//! Persisted client settings.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/worksheet-sync/settings.json
//! - Linux: ~/.config/worksheet-sync/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\worksheet-sync\settings.json

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};

use crate::settings_json_path;

pub const DEFAULT_SERVER_URL: &str = "http://localhost:8080";

/// Backoff schedule of the update poller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PollerSettings {
    /// Delays between update checks, shortest first (milliseconds)
    #[serde(
        default = "default_falloff_delays",
        deserialize_with = "deserialize_delay_list"
    )]
    pub falloff_delays_ms: Vec<u64>,

    /// Consecutive still-working responses before moving to a longer delay
    #[serde(default = "default_falloff_threshold")]
    pub falloff_threshold: u32,

    /// Delay after a failed update check (milliseconds)
    #[serde(default = "default_error_delay")]
    pub error_delay_ms: u64,

    /// Failed checks tolerated before polling is abandoned
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
}

fn default_falloff_delays() -> Vec<u64> {
    vec![250, 500, 1000, 5000]
}

fn default_falloff_threshold() -> u32 {
    20
}

fn default_error_delay() -> u64 {
    1024
}

fn default_error_threshold() -> u32 {
    30
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            falloff_delays_ms: default_falloff_delays(),
            falloff_threshold: default_falloff_threshold(),
            error_delay_ms: default_error_delay(),
            error_threshold: default_error_threshold(),
        }
    }
}

impl PollerSettings {
    /// Backoff delays, sorted, falling back to the defaults when empty.
    pub fn falloff_delays(&self) -> Vec<Duration> {
        let mut delays = if self.falloff_delays_ms.is_empty() {
            default_falloff_delays()
        } else {
            self.falloff_delays_ms.clone()
        };
        delays.sort_unstable();
        delays.into_iter().map(Duration::from_millis).collect()
    }

    pub fn error_delay(&self) -> Duration {
        Duration::from_millis(self.error_delay_ms)
    }
}

/// Deserialize a delay list that accepts both:
/// - `"250, 500, 1000"` (comma-separated string)
/// - `[250, 500, 1000]` (JSON array)
fn deserialize_delay_list<'de, D>(deserializer: D) -> std::result::Result<Vec<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    struct DelayListVisitor;

    impl<'de> de::Visitor<'de> for DelayListVisitor {
        type Value = Vec<u64>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a comma-separated string or array of milliseconds")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Vec<u64>, E> {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<u64>()
                        .map_err(|_| E::custom(format!("invalid delay: {:?}", s)))
                })
                .collect()
        }

        fn visit_seq<A: de::SeqAccess<'de>>(
            self,
            mut seq: A,
        ) -> std::result::Result<Vec<u64>, A::Error> {
            let mut items = Vec::new();
            while let Some(item) = seq.next_element::<u64>()? {
                items.push(item);
            }
            Ok(items)
        }
    }

    deserializer.deserialize_any(DelayListVisitor)
}

/// Settings for a worksheet session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SyncSettings {
    /// Base URL of the notebook server
    #[serde(default = "default_server_url")]
    pub server_url: String,

    #[serde(default)]
    pub poller: PollerSettings,

    /// Interval between liveness pings (milliseconds)
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    /// Columns in the completion menu
    #[serde(default = "default_completion_columns")]
    pub completion_columns: usize,

    /// Failed interrupts before the restart action is suggested
    #[serde(default = "default_interrupt_restart_threshold")]
    pub interrupt_restart_threshold: u32,
}

fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}

fn default_ping_interval() -> u64 {
    10_000
}

fn default_completion_columns() -> usize {
    3
}

fn default_interrupt_restart_threshold() -> u32 {
    3
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            poller: PollerSettings::default(),
            ping_interval_ms: default_ping_interval(),
            completion_columns: default_completion_columns(),
            interrupt_restart_threshold: default_interrupt_restart_threshold(),
        }
    }
}

impl SyncSettings {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.max(1))
    }
}

/// Load settings from disk, returning defaults if the file doesn't exist
pub fn load_settings() -> SyncSettings {
    load_settings_from(&settings_json_path())
}

/// Load settings from `path`, returning defaults if it is missing or invalid
pub fn load_settings_from(path: &Path) -> SyncSettings {
    if path.exists() {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    } else {
        SyncSettings::default()
    }
}

/// Save settings to disk
pub fn save_settings(settings: &SyncSettings) -> Result<()> {
    save_settings_to(&settings_json_path(), settings)
}

pub fn save_settings_to(path: &Path, settings: &SyncSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}

/// JSON Schema of the settings file
pub fn settings_schema() -> schemars::Schema {
    schemars::schema_for!(SyncSettings)
}
