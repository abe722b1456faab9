//! worksheet-sync - client-side synchronization for notebook worksheets.
//!
//! This crate mirrors a server-side worksheet on the client: it keeps the
//! ordered list of cells, submits cells for evaluation, polls the server for
//! incremental output with adaptive backoff, drives the introspection
//! (tab-completion / docstring) state machine, chains "evaluate all" one cell
//! at a time, and pings the server to detect stale client state.
//!
//! Nothing here renders. State changes are published as [`events::WorksheetEvent`]s
//! that a view layer subscribes to.
//!
//! The server is reached through the [`transport::Transport`] trait and time
//! through the [`clock::Clock`] trait, so the whole state machine can be
//! driven deterministically in tests.

use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ts_rs::TS;

pub mod actor;
pub mod cell;
pub mod clock;
pub mod events;
pub mod introspection;
pub mod poller;
pub mod protocol;
pub mod running_queue;
pub mod session;
pub mod settings;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;
pub mod worksheet;

pub use actor::{spawn_session, SessionHandle};
pub use session::{SessionError, WorksheetSession};
pub use settings::SyncSettings;

// ============================================================================
// Paths
// ============================================================================

/// Get the directory holding worksheet-sync configuration.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("worksheet-sync")
}

/// Get the path to the JSON settings file.
pub fn settings_json_path() -> PathBuf {
    config_dir().join("settings.json")
}

// ============================================================================
// Types
// ============================================================================

/// Identity of a cell within a worksheet.
///
/// The server hands out integer ids for ordinary cells and occasionally
/// string ids for special cells. Numeral strings are coerced to numbers on
/// decode so that `"5"` and `5` name the same cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, TS)]
#[ts(export)]
#[ts(type = "number | string")]
pub enum CellId {
    Number(i64),
    Name(String),
}

impl CellId {
    /// Id the server uses to say "I do not know that cell".
    pub const UNKNOWN: CellId = CellId::Number(-1);

    pub fn is_unknown(&self) -> bool {
        *self == Self::UNKNOWN
    }

    /// Render the id the way the server expects it in form parameters.
    pub fn as_param(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for CellId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellId::Number(n) => write!(f, "{}", n),
            CellId::Name(s) => write!(f, "{}", s),
        }
    }
}

impl std::str::FromStr for CellId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(CellId::from(s))
    }
}

impl From<i64> for CellId {
    fn from(n: i64) -> Self {
        CellId::Number(n)
    }
}

impl From<&str> for CellId {
    fn from(s: &str) -> Self {
        match s.trim().parse::<i64>() {
            Ok(n) => CellId::Number(n),
            Err(_) => CellId::Name(s.to_string()),
        }
    }
}

impl Default for CellId {
    fn default() -> Self {
        CellId::UNKNOWN
    }
}

impl Serialize for CellId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CellId::Number(n) => serializer.serialize_i64(*n),
            CellId::Name(s) => serializer.serialize_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for CellId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de;

        struct CellIdVisitor;

        impl<'de> de::Visitor<'de> for CellIdVisitor {
            type Value = CellId;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("an integer or string cell id")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<CellId, E> {
                Ok(CellId::Number(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<CellId, E> {
                i64::try_from(v)
                    .map(CellId::Number)
                    .map_err(|_| E::custom(format!("cell id out of range: {}", v)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<CellId, E> {
                Ok(CellId::from(v))
            }
        }

        deserializer.deserialize_any(CellIdVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_id_numeral_strings_are_coerced() {
        let id: CellId = serde_json::from_str("\"12\"").unwrap();
        assert_eq!(id, CellId::Number(12));
        let id: CellId = serde_json::from_str("\"0\"").unwrap();
        assert_eq!(id, CellId::Number(0));
    }

    #[test]
    fn test_cell_id_names_are_preserved() {
        let id: CellId = serde_json::from_str("\"intro\"").unwrap();
        assert_eq!(id, CellId::Name("intro".into()));
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"intro\"");
    }

    #[test]
    fn test_cell_id_numbers() {
        let id: CellId = serde_json::from_str("7").unwrap();
        assert_eq!(id, CellId::Number(7));
        assert_eq!(serde_json::to_string(&id).unwrap(), "7");
        assert_eq!(id.as_param(), "7");
    }

    #[test]
    fn test_unknown_cell_sentinel() {
        let id: CellId = serde_json::from_str("-1").unwrap();
        assert!(id.is_unknown());
        assert!(!CellId::Number(3).is_unknown());
    }

    #[test]
    fn test_settings_path_is_under_config_dir() {
        assert!(settings_json_path().starts_with(config_dir()));
        assert!(settings_json_path().ends_with("settings.json"));
    }
}
