//! Client-side mirror of a worksheet cell.

use serde::Serialize;
use ts_rs::TS;

use crate::introspection::IntrospectionState;
use crate::protocol::{CellProperties, CellType, CellUpdatePayload};
use crate::CellId;

/// Output containing this marker embeds a 3-D viewer applet and has to be
/// shown in an isolated sub-document.
pub const EMBEDDED_VIEWER_MARKER: &str = "jmol_instance";

/// Output containing this marker asks for the cell to be evaluated again.
pub const INTERACT_RESTART_MARKER: &str = "<!--__SAGE_INTERACT_RESTART__-->";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    #[default]
    Compute,
    Text,
}

impl From<CellType> for CellKind {
    fn from(t: CellType) -> Self {
        match t {
            CellType::Evaluate => CellKind::Compute,
            CellType::Text => CellKind::Text,
        }
    }
}

/// The three output channels the server sends for a compute cell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CellOutput {
    pub plain: String,
    pub wrapped: String,
    pub html: String,
}

impl CellOutput {
    pub fn is_empty(&self) -> bool {
        self.plain.is_empty() && self.wrapped.is_empty() && self.html.is_empty()
    }

    pub fn clear(&mut self) {
        self.plain.clear();
        self.wrapped.clear();
        self.html.clear();
    }

    /// HTML if non-blank, else wrapped text if non-blank, else plain text.
    pub fn preferred(&self) -> &str {
        if !self.html.trim().is_empty() {
            &self.html
        } else if !self.wrapped.trim().is_empty() {
            &self.wrapped
        } else {
            &self.plain
        }
    }

    pub fn rendered(&self) -> RenderedOutput {
        let text = self.preferred();
        if text.contains(EMBEDDED_VIEWER_MARKER) {
            RenderedOutput::IsolatedViewer(text.to_string())
        } else if !self.html.trim().is_empty() {
            RenderedOutput::Html(self.html.clone())
        } else if text.trim().is_empty() {
            RenderedOutput::Empty
        } else {
            RenderedOutput::Text(text.to_string())
        }
    }

    pub fn requests_interact_restart(&self) -> bool {
        self.html.contains(INTERACT_RESTART_MARKER) || self.plain.contains(INTERACT_RESTART_MARKER)
    }
}

/// How a view layer should present a cell's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, TS)]
#[ts(export)]
#[serde(tag = "channel", content = "content", rename_all = "snake_case")]
pub enum RenderedOutput {
    Empty,
    Text(String),
    Html(String),
    /// Render inside an isolated sub-document, away from the math
    /// typesetter.
    IsolatedViewer(String),
}

/// `%`-directives declared at the top of a cell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directives {
    pub auto: bool,
    pub hide: bool,
    pub other: Vec<String>,
}

impl Directives {
    pub fn from_list(directives: &[String]) -> Self {
        let mut parsed = Directives::default();
        for directive in directives {
            match directive.trim().trim_start_matches('%') {
                "auto" => parsed.auto = true,
                "hide" | "hideall" => parsed.hide = true,
                other => parsed.other.push(other.to_string()),
            }
        }
        parsed
    }
}

#[derive(Debug, Clone, Default)]
pub struct Cell {
    pub id: CellId,
    pub kind: CellKind,
    pub input: String,
    pub output: CellOutput,
    pub system: Option<String>,
    pub directives: Directives,
    pub running: bool,
    pub evaluated: bool,
    /// Input was edited locally and the save has not round-tripped yet.
    pub input_changed: bool,
    pub output_hidden: bool,
    pub introspection: Option<IntrospectionState>,
}

impl Cell {
    pub fn compute(id: CellId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn text(id: CellId, input: impl Into<String>) -> Self {
        Self {
            id,
            kind: CellKind::Text,
            input: input.into(),
            ..Default::default()
        }
    }

    pub fn from_properties(props: &CellProperties) -> Self {
        let mut cell = Cell::compute(props.id.clone());
        cell.merge_properties(props);
        cell.evaluated = cell.is_executable() && !cell.output.is_empty();
        cell
    }

    pub fn is_executable(&self) -> bool {
        self.kind == CellKind::Compute
    }

    pub fn is_introspecting(&self) -> bool {
        self.introspection.is_some()
    }

    /// Take the server's authoritative view of this cell.
    pub fn merge_properties(&mut self, props: &CellProperties) {
        self.kind = props.cell_type.into();
        self.input = props.input.clone();
        self.output = CellOutput {
            plain: props.output.clone(),
            wrapped: props.output_wrapped.clone(),
            html: props.output_html.clone(),
        };
        self.system = props.system.clone().filter(|s| !s.is_empty());
        self.directives = Directives::from_list(&props.percent_directives);
        self.directives.auto |= props.auto;
        self.output_hidden = self.directives.hide;
    }

    /// Merge (possibly partial) output from a `cell_update` response.
    pub fn merge_output(&mut self, update: &CellUpdatePayload) {
        self.output.plain = update.output.clone();
        self.output.wrapped = update.output_wrapped.clone();
        self.output.html = update.output_html.clone();
    }

    /// Clear output and mark the cell running, as on submission.
    pub fn start_running(&mut self) {
        self.output.clear();
        self.running = true;
        self.evaluated = false;
    }

    pub fn snapshot(&self) -> CellSnapshot {
        CellSnapshot {
            id: self.id.clone(),
            kind: self.kind,
            input: self.input.clone(),
            output: self.output.rendered(),
            system: self.system.clone(),
            running: self.running,
            evaluated: self.evaluated,
            output_hidden: self.output_hidden,
        }
    }
}

/// Read-only view of a cell for the view layer and the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, TS)]
#[ts(export)]
pub struct CellSnapshot {
    pub id: CellId,
    pub kind: CellKind,
    pub input: String,
    pub output: RenderedOutput,
    pub system: Option<String>,
    pub running: bool,
    pub evaluated: bool,
    pub output_hidden: bool,
}
