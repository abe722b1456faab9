//! Worksheet endpoint protocol.
//!
//! Every server endpoint has an explicit request shape (form parameters) and
//! an explicit response schema. Most responses are JSON objects; a few
//! endpoints answer with a bare word (`alive`, `interrupt`,
//! `delete_all_output`) and any mutating endpoint may answer `locked`.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use ts_rs::TS;

use crate::CellId;

/// Server endpoints, relative to the worksheet base path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Eval,
    CellUpdate,
    Introspect,
    Interrupt,
    DeleteCell,
    DeleteCellOutput,
    NewCellBefore,
    NewCellAfter,
    NewTextCellBefore,
    NewTextCellAfter,
    CellProperties,
    CellList,
    Alive,
    DeleteAllOutput,
    HideAll,
    ShowAll,
    RestartSage,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Eval => "eval",
            Command::CellUpdate => "cell_update",
            Command::Introspect => "introspect",
            Command::Interrupt => "interrupt",
            Command::DeleteCell => "delete_cell",
            Command::DeleteCellOutput => "delete_cell_output",
            Command::NewCellBefore => "new_cell_before",
            Command::NewCellAfter => "new_cell_after",
            Command::NewTextCellBefore => "new_text_cell_before",
            Command::NewTextCellAfter => "new_text_cell_after",
            Command::CellProperties => "cell_properties",
            Command::CellList => "cell_list",
            Command::Alive => "alive",
            Command::DeleteAllOutput => "delete_all_output",
            Command::HideAll => "hide_all",
            Command::ShowAll => "show_all",
            Command::RestartSage => "restart_sage",
        }
    }

    /// Commands after which the server increments the worksheet state
    /// number. The client mirrors the increment when issuing them.
    pub fn bumps_state_number(&self) -> bool {
        matches!(
            self,
            Command::Eval
                | Command::NewCellBefore
                | Command::NewCellAfter
                | Command::NewTextCellBefore
                | Command::NewTextCellAfter
        )
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Form parameters for a request. An empty set means the request is a GET.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(Vec<(&'static str, String)>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parameters carrying just a cell id, the most common request shape.
    pub fn for_cell(id: &CellId) -> Self {
        Self::new().with("id", id.as_param())
    }

    pub fn with(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.0.push((key, value.into()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_pairs(&self) -> &[(&'static str, String)] {
        &self.0
    }
}

/// Error decoding a server response.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Failed to decode {command} response: {source}")]
    Decode {
        command: Command,
        #[source]
        source: serde_json::Error,
    },

    #[error("Worksheet is locked")]
    Locked,

    #[error("Unexpected {command} response: {body:?}")]
    Unexpected { command: Command, body: String },
}

/// Decode a JSON object response for `command`.
pub fn decode<T: DeserializeOwned>(command: Command, body: &str) -> Result<T, ProtocolError> {
    let body = body.trim();
    if body == "locked" {
        return Err(ProtocolError::Locked);
    }
    serde_json::from_str(body).map_err(|source| ProtocolError::Decode { command, source })
}

// ============================================================================
// eval / introspect
// ============================================================================

/// Response to `eval` (including `save_only` submissions) and `introspect`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvalResponse {
    pub id: CellId,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    /// Id of the next compute cell, as suggested by the server.
    #[serde(default)]
    pub next_id: Option<CellId>,
    #[serde(default)]
    pub new_cell_id: Option<CellId>,
    #[serde(default)]
    pub new_cell_html: Option<String>,
}

impl EvalResponse {
    /// The server refused the request (`error...` command).
    pub fn rejection(&self) -> Option<&str> {
        match &self.command {
            Some(cmd) if cmd.starts_with("error") => {
                Some(self.message.as_deref().unwrap_or("request rejected by server"))
            }
            _ => None,
        }
    }

    pub fn inserts_cell(&self) -> bool {
        self.command.as_deref() == Some("insert_cell")
    }
}

// ============================================================================
// cell_update
// ============================================================================

/// Whether and how a finished computation was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String")]
pub enum Interrupted {
    #[default]
    No,
    Yes,
    /// The worker crashed and must be restarted.
    Restart,
}

impl From<String> for Interrupted {
    fn from(s: String) -> Self {
        match s.as_str() {
            "false" | "" => Interrupted::No,
            "restart" => Interrupted::Restart,
            _ => Interrupted::Yes,
        }
    }
}

/// Body of a non-empty `cell_update` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CellUpdatePayload {
    pub id: CellId,
    pub status: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub output_wrapped: String,
    #[serde(default)]
    pub output_html: String,
    #[serde(default)]
    pub new_input: String,
    #[serde(default)]
    pub interrupted: Interrupted,
    #[serde(default)]
    pub introspect_html: String,
}

/// Decoded `cell_update` response.
#[derive(Debug, Clone, PartialEq)]
pub enum CellUpdate {
    /// No data yet; treated exactly like `Working`.
    Empty,
    /// `e`: the server's queue is empty or errored.
    QueueEmpty,
    Working(CellUpdatePayload),
    Done(CellUpdatePayload),
}

pub fn decode_cell_update(body: &str) -> Result<CellUpdate, ProtocolError> {
    let trimmed = body.trim();
    if trimmed.is_empty() || trimmed == "empty" {
        return Ok(CellUpdate::Empty);
    }
    let payload: CellUpdatePayload = decode(Command::CellUpdate, trimmed)?;
    Ok(match payload.status.as_str() {
        "d" => CellUpdate::Done(payload),
        "e" => CellUpdate::QueueEmpty,
        _ => CellUpdate::Working(payload),
    })
}

// ============================================================================
// cell_properties / cell_list
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    #[default]
    Evaluate,
    #[serde(other)]
    Text,
}

/// Authoritative properties of one cell (`cell_properties`, `cell_list`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CellProperties {
    pub id: CellId,
    #[serde(rename = "type", default)]
    pub cell_type: CellType,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub output_html: String,
    #[serde(default)]
    pub output_wrapped: String,
    #[serde(default)]
    pub percent_directives: Vec<String>,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub auto: bool,
    #[serde(default)]
    pub introspect_output: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CellListResponse {
    pub state_number: i64,
    #[serde(default)]
    pub cell_list: Vec<CellProperties>,
}

// ============================================================================
// Cell creation and deletion
// ============================================================================

/// Response to `new_cell_before` / `new_cell_after` and their text variants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewCellResponse {
    /// The anchor cell.
    pub id: CellId,
    pub new_id: CellId,
    #[serde(default)]
    pub new_html: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeleteCellResponse {
    pub id: CellId,
    pub command: String,
    #[serde(default)]
    pub prev_id: Option<CellId>,
    #[serde(default)]
    pub cell_id_list: Vec<CellId>,
}

impl DeleteCellResponse {
    /// The server declined to delete (e.g. the last compute cell).
    pub fn ignored(&self) -> bool {
        self.command == "ignore"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeleteOutputResponse {
    pub id: CellId,
    #[serde(default)]
    pub command: String,
}

// ============================================================================
// Plain-text responses
// ============================================================================

/// `alive` answers with the worksheet's current state number.
pub fn decode_state_number(body: &str) -> Result<i64, ProtocolError> {
    body.trim()
        .parse::<i64>()
        .map_err(|_| ProtocolError::Unexpected {
            command: Command::Alive,
            body: body.to_string(),
        })
}

/// `interrupt` answers `success` or `failed`.
pub fn decode_interrupt(body: &str) -> Result<bool, ProtocolError> {
    match body.trim() {
        "success" => Ok(true),
        "failed" => Ok(false),
        "locked" => Err(ProtocolError::Locked),
        other => Err(ProtocolError::Unexpected {
            command: Command::Interrupt,
            body: other.to_string(),
        }),
    }
}

/// Plain `success` / `fail` / `done` acknowledgements.
pub fn decode_ack(command: Command, body: &str) -> Result<bool, ProtocolError> {
    match body.trim() {
        "success" | "done" | "" => Ok(true),
        "fail" | "failed" => Ok(false),
        "locked" => Err(ProtocolError::Locked),
        other => Err(ProtocolError::Unexpected {
            command,
            body: other.to_string(),
        }),
    }
}
