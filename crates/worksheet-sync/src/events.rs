//! State-change events published by a session.
//!
//! The view layer subscribes with [`crate::WorksheetSession::subscribe`] and
//! re-renders from these; nothing in this crate touches a document tree.
//! Wire format: `{"type": "output_updated", "cell_id": 5, ...}`.

use serde::Serialize;
use ts_rs::TS;

use crate::cell::{CellKind, CellSnapshot, RenderedOutput};
use crate::introspection::CompletionMenu;
use crate::running_queue::RunningQueueState;
use crate::CellId;

#[derive(Debug, Clone, PartialEq, Serialize, TS)]
#[ts(export)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorksheetEvent {
    // ─── Cells ───────────────────────────────────────────────────────────────
    /// Authoritative properties of a cell were merged.
    CellChanged { cell: CellSnapshot },

    /// A cell was submitted and its output cleared.
    CellRunning { cell_id: CellId },

    /// New (possibly partial) output arrived.
    OutputUpdated {
        cell_id: CellId,
        output: RenderedOutput,
    },

    CellEvaluated { cell_id: CellId },

    /// Evaluation was abandoned (error, interrupt, halt).
    CellNotEvaluated { cell_id: CellId },

    /// Local input edits are waiting on a save round trip.
    InputChanged { cell_id: CellId, pending: bool },

    /// The cell's input was rewritten; place the cursor at `cursor` (bytes).
    InputReplaced {
        cell_id: CellId,
        input: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cursor: Option<usize>,
    },

    CellInserted {
        cell_id: CellId,
        kind: CellKind,
        index: usize,
    },

    CellRemoved { cell_id: CellId },

    /// Output visibility changed (`hide_all` / `show_all`).
    OutputVisibility { cell_id: CellId, hidden: bool },

    // ─── Introspection ──────────────────────────────────────────────────────
    CompletionsShown {
        cell_id: CellId,
        menu: CompletionMenu,
    },

    DocstringShown { cell_id: CellId, html: String },

    IntrospectionClosed { cell_id: CellId },

    // ─── Worksheet ──────────────────────────────────────────────────────────
    QueueState { state: RunningQueueState },

    /// The running queue emptied and polling stopped.
    PollerIdle,

    /// The cell list was reloaded from the server.
    CellListReloaded { state_number: i64 },

    /// A liveness ping saw a newer state than ours.
    StaleStateDetected { cached: i64, server: i64 },

    EvaluateAllFinished,

    // ─── Errors and notices ─────────────────────────────────────────────────
    /// Polling failed; `aborted` once the error ceiling was passed.
    ConnectionError { message: String, aborted: bool },

    ConnectionRestored,

    /// Result of a liveness ping.
    ServerStatus { up: bool },

    /// Something to tell the user once; the operation was abandoned.
    Notice {
        #[serde(skip_serializing_if = "Option::is_none")]
        cell_id: Option<CellId>,
        message: String,
    },

    /// The worksheet refused a change.
    Locked { message: String },

    InterruptFailed { attempts: u32, suggest_restart: bool },

    /// The worker died; cells need a restart before they can run again.
    RestartRequired,

    Restarted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let event = WorksheetEvent::OutputUpdated {
            cell_id: CellId::Number(5),
            output: RenderedOutput::Text("4".into()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "output_updated");
        assert_eq!(json["cell_id"], 5);
        assert_eq!(json["output"]["channel"], "text");
        assert_eq!(json["output"]["content"], "4");
    }

    #[test]
    fn test_optional_fields_skipped() {
        let event = WorksheetEvent::Notice {
            cell_id: None,
            message: "Worksheet is locked".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"notice","message":"Worksheet is locked"}"#);
    }
}
