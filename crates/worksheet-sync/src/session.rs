//! Async orchestration of a worksheet against the server.
//!
//! A [`WorksheetSession`] owns the [`Worksheet`], the [`UpdatePoller`] and
//! every cell's introspection state. It is a plain `&mut self` object: one
//! operation runs at a time, so no state is ever touched concurrently. The
//! actor in [`crate::actor`] drives it from a single task, interleaving
//! user commands with poll checks and liveness pings.
//!
//! "Evaluate all" is a plan advanced from done responses rather than a loop
//! awaiting each cell, so other commands stay responsive while it runs.

use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::cell::{Cell, CellKind, CellSnapshot, RenderedOutput};
use crate::clock::Clock;
use crate::events::WorksheetEvent;
use crate::introspection::{Begin, IntrospectionKey, KeyOutcome, Received};
use crate::poller::{FailureAction, UpdatePoller};
use crate::protocol::{
    self, CellListResponse, CellProperties, CellUpdate, CellUpdatePayload, Command,
    DeleteCellResponse, DeleteOutputResponse, EvalResponse, Interrupted, NewCellResponse, Params,
    ProtocolError,
};
use crate::running_queue::PendingKind;
use crate::settings::SyncSettings;
use crate::transport::{Transport, TransportError};
use crate::worksheet::Worksheet;
use crate::CellId;

/// Error type for session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(ProtocolError),

    #[error("Cell unknown to the server: {0}")]
    UnknownCell(CellId),

    #[error("Worksheet is locked")]
    Locked,

    #[error("Server rejected request: {0}")]
    Rejected(String),

    #[error("Channel closed")]
    ChannelClosed,
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Locked => SessionError::Locked,
            other => SessionError::Protocol(other),
        }
    }
}

/// Where a new cell goes relative to its anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPosition {
    Before,
    After,
}

pub struct WorksheetSession<T, C> {
    transport: T,
    clock: C,
    settings: SyncSettings,
    worksheet: Worksheet,
    poller: UpdatePoller,
    subscribers: Vec<mpsc::UnboundedSender<WorksheetEvent>>,
    interrupt_failures: u32,
    connection_error_reported: bool,
    server_up: Option<bool>,
}

impl<T: Transport, C: Clock> WorksheetSession<T, C> {
    pub fn new(transport: T, clock: C, settings: SyncSettings) -> Self {
        let poller = UpdatePoller::new(&settings.poller);
        Self {
            transport,
            clock,
            settings,
            worksheet: Worksheet::new(),
            poller,
            subscribers: Vec::new(),
            interrupt_failures: 0,
            connection_error_reported: false,
            server_up: None,
        }
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn worksheet(&self) -> &Worksheet {
        &self.worksheet
    }

    pub fn worksheet_mut(&mut self) -> &mut Worksheet {
        &mut self.worksheet
    }

    pub fn poller(&self) -> &UpdatePoller {
        &self.poller
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn snapshot(&self) -> Vec<CellSnapshot> {
        self.worksheet.cells().iter().map(Cell::snapshot).collect()
    }

    /// Receive every event published from now on.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<WorksheetEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    fn emit(&mut self, event: WorksheetEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn emit_queue_state(&mut self) {
        let state = self.worksheet.queue().get_state();
        self.emit(WorksheetEvent::QueueState { state });
    }

    /// Surface user-facing failures once, then hand the error back.
    fn report<R>(
        &mut self,
        cell_id: Option<&CellId>,
        result: Result<R, SessionError>,
    ) -> Result<R, SessionError> {
        match &result {
            Err(SessionError::Locked) => {
                self.worksheet.locked = true;
                self.emit(WorksheetEvent::Locked {
                    message: "This worksheet is read only.".into(),
                });
            }
            Err(SessionError::UnknownCell(id)) => self.emit(WorksheetEvent::Notice {
                cell_id: Some(id.clone()),
                message: "You somehow have a cell that the server does not know about. \
                          Try refreshing the worksheet."
                    .into(),
            }),
            Err(SessionError::Rejected(message)) => self.emit(WorksheetEvent::Notice {
                cell_id: cell_id.cloned(),
                message: message.clone(),
            }),
            _ => {}
        }
        result
    }

    async fn call(&mut self, command: Command, params: Params) -> Result<String, SessionError> {
        if command.bumps_state_number() {
            self.worksheet.bump_state_number();
        }
        debug!("[session] -> {}", command);
        Ok(self.transport.request(command, params).await?)
    }

    fn require_cell(&self, id: &CellId) -> Result<&Cell, SessionError> {
        self.worksheet
            .cell(id)
            .ok_or_else(|| SessionError::UnknownCell(id.clone()))
    }

    // ── Loading ──────────────────────────────────────────────────────

    /// Fetch the full cell list. With `auto_evaluate`, cells carrying the
    /// `auto` directive are evaluated afterwards.
    pub async fn load(&mut self, auto_evaluate: bool) -> Result<(), SessionError> {
        self.refresh_cell_list().await?;
        if auto_evaluate {
            let auto: Vec<CellId> = self
                .worksheet
                .cells()
                .iter()
                .filter(|c| c.is_executable() && c.directives.auto)
                .map(|c| c.id.clone())
                .collect();
            for id in auto {
                info!("[session] Auto-evaluating cell {}", id);
                self.evaluate(&id).await?;
            }
        }
        Ok(())
    }

    /// Replace the local cells with the server's list.
    pub async fn refresh_cell_list(&mut self) -> Result<(), SessionError> {
        let body = self.call(Command::CellList, Params::new()).await?;
        let list: CellListResponse = protocol::decode(Command::CellList, &body)?;
        self.worksheet.replace_cells(&list.cell_list, list.state_number);
        info!(
            "[session] Loaded {} cells (state {})",
            self.worksheet.len(),
            list.state_number
        );
        self.emit(WorksheetEvent::CellListReloaded {
            state_number: self.worksheet.state_number(),
        });
        Ok(())
    }

    /// Fetch one cell's authoritative properties and merge them.
    pub async fn update_cell(
        &mut self,
        id: &CellId,
        auto_evaluate: bool,
    ) -> Result<(), SessionError> {
        let result = self.update_cell_inner(id, auto_evaluate).await;
        self.report(Some(id), result)
    }

    async fn update_cell_inner(
        &mut self,
        id: &CellId,
        auto_evaluate: bool,
    ) -> Result<(), SessionError> {
        let body = self
            .call(Command::CellProperties, Params::for_cell(id))
            .await?;
        let props: CellProperties = protocol::decode(Command::CellProperties, &body)?;

        match self.worksheet.cell_mut(id) {
            Some(cell) => cell.merge_properties(&props),
            None => {
                self.worksheet.push(Cell::from_properties(&props));
            }
        }
        let cell = self.require_cell(id)?;
        let run = auto_evaluate && cell.is_executable() && cell.directives.auto;
        let snapshot = cell.snapshot();
        self.emit(WorksheetEvent::CellChanged { cell: snapshot });

        if run {
            self.submit_evaluation(id).await?;
        }
        Ok(())
    }

    // ── Input ────────────────────────────────────────────────────────

    /// Record a local edit of a cell's input buffer.
    pub fn edit_input(
        &mut self,
        id: &CellId,
        input: impl Into<String>,
    ) -> Result<(), SessionError> {
        let cell = self
            .worksheet
            .cell_mut(id)
            .ok_or_else(|| SessionError::UnknownCell(id.clone()))?;
        cell.input = input.into();
        cell.input_changed = true;
        if let Some(state) = cell.introspection.as_mut() {
            state.mark_changed();
        }
        self.emit(WorksheetEvent::InputChanged {
            cell_id: id.clone(),
            pending: true,
        });
        Ok(())
    }

    /// Save the cell's input without evaluating it.
    pub async fn submit_input(&mut self, id: &CellId) -> Result<(), SessionError> {
        let result = self.submit_input_inner(id).await;
        self.report(Some(id), result)
    }

    async fn submit_input_inner(&mut self, id: &CellId) -> Result<(), SessionError> {
        let input = self.require_cell(id)?.input.clone();
        if let Some(cell) = self.worksheet.cell_mut(id) {
            cell.input_changed = true;
        }

        let params = Params::new()
            .with("newcell", "0")
            .with("id", id.as_param())
            .with("input", input)
            .with("save_only", "1");
        let body = self.call(Command::Eval, params).await?;
        let response: EvalResponse = protocol::decode(Command::Eval, &body)?;
        if let Some(message) = response.rejection() {
            return Err(SessionError::Rejected(message.to_string()));
        }

        if let Some(cell) = self.worksheet.cell_mut(id) {
            cell.input_changed = false;
        }
        self.emit(WorksheetEvent::InputChanged {
            cell_id: id.clone(),
            pending: false,
        });
        Ok(())
    }

    // ── Evaluation ───────────────────────────────────────────────────

    /// Evaluate a cell. For a text cell this continues a running
    /// "evaluate all" instead.
    ///
    /// Returns the cell that should take focus next: the next executable
    /// cell in display order, else the one the server suggested.
    pub async fn evaluate(&mut self, id: &CellId) -> Result<Option<CellId>, SessionError> {
        let result = self.evaluate_inner(id).await;
        self.report(Some(id), result)
    }

    async fn evaluate_inner(&mut self, id: &CellId) -> Result<Option<CellId>, SessionError> {
        if !self.require_cell(id)?.is_executable() {
            if self.worksheet.plan_ready_to_advance() {
                self.advance_evaluate_all().await?;
            }
            return Ok(self.worksheet.next_executable_after(id));
        }
        self.submit_evaluation(id).await
    }

    async fn submit_evaluation(&mut self, id: &CellId) -> Result<Option<CellId>, SessionError> {
        if self.worksheet.queue().contains(id) {
            debug!("[session] Cell {} already queued", id);
            return Ok(None);
        }
        let input = self.require_cell(id)?.input.clone();

        let params = Params::new()
            .with("newcell", "0")
            .with("id", id.as_param())
            .with("input", input);
        let body = self.call(Command::Eval, params).await?;
        let response: EvalResponse = protocol::decode(Command::Eval, &body)?;

        if response.id.is_unknown() || &response.id != id {
            warn!("[session] Server does not know cell {}", id);
            return Err(SessionError::UnknownCell(id.clone()));
        }
        if let Some(message) = response.rejection() {
            return Err(SessionError::Rejected(message.to_string()));
        }

        if let Some(cell) = self.worksheet.cell_mut(id) {
            cell.start_running();
            cell.input_changed = false;
        }
        self.worksheet
            .queue_mut()
            .enqueue(id.clone(), PendingKind::Evaluation);
        self.poller.start();
        info!("[session] Evaluating cell {}", id);
        self.emit(WorksheetEvent::CellRunning { cell_id: id.clone() });
        self.emit(WorksheetEvent::OutputUpdated {
            cell_id: id.clone(),
            output: RenderedOutput::Empty,
        });
        self.emit_queue_state();

        if response.inserts_cell() {
            if let Some(new_id) = response.new_cell_id.clone() {
                let index = self.worksheet.insert_after(id, Cell::compute(new_id.clone()));
                self.emit(WorksheetEvent::CellInserted {
                    cell_id: new_id,
                    kind: CellKind::Compute,
                    index,
                });
            }
        }

        let next = self.worksheet.next_executable_after(id).or_else(|| {
            response
                .next_id
                .filter(|n| self.worksheet.cell(n).is_some())
        });
        Ok(next)
    }

    /// Evaluate every executable cell, one at a time, in display order.
    /// Returns once the first cell is submitted; the rest follow from
    /// done responses.
    pub async fn evaluate_all(&mut self) -> Result<(), SessionError> {
        info!("[session] Evaluating all cells");
        self.worksheet.start_evaluate_all();
        let result = self.advance_evaluate_all().await;
        self.report(None, result)
    }

    async fn advance_evaluate_all(&mut self) -> Result<(), SessionError> {
        loop {
            let Some(id) = self.worksheet.next_in_plan() else {
                info!("[session] Evaluate all finished");
                self.emit(WorksheetEvent::EvaluateAllFinished);
                return Ok(());
            };
            match self.submit_evaluation(&id).await {
                Ok(_) if self.worksheet.queue().contains(&id) => return Ok(()),
                Ok(_) => continue,
                Err(e) => {
                    warn!("[session] Evaluate all stopped at cell {}: {}", id, e);
                    self.worksheet.cancel_evaluate_all();
                    return Err(e);
                }
            }
        }
    }

    // ── Polling ──────────────────────────────────────────────────────

    /// Time until the next update check is due, or `None` when idle.
    pub fn next_poll_in(&self) -> Option<Duration> {
        self.poller.time_until_next(self.clock.now())
    }

    /// Perform one update check on the earliest queued cell.
    pub async fn poll_once(&mut self) -> Result<(), SessionError> {
        let Some(front) = self.worksheet.queue().front().cloned() else {
            self.go_idle();
            return Ok(());
        };

        self.poller.record_check(self.clock.now());
        let update = match self
            .transport
            .request(Command::CellUpdate, Params::for_cell(&front.id))
            .await
        {
            Ok(body) => protocol::decode_cell_update(&body).map_err(SessionError::from),
            Err(e) => Err(SessionError::from(e)),
        };

        let update = match update {
            Ok(update) => update,
            Err(SessionError::Locked) => {
                warn!("[session] Worksheet is locked; halting update checks");
                self.halt_active_cells();
                return self.report(Some(&front.id), Err(SessionError::Locked));
            }
            Err(e) => {
                self.on_poll_failure(e);
                return Ok(());
            }
        };

        self.poller.on_success();
        if self.connection_error_reported {
            self.connection_error_reported = false;
            self.emit(WorksheetEvent::ConnectionRestored);
        }

        match update {
            CellUpdate::Empty => self.poller.on_working(),
            CellUpdate::QueueEmpty => {
                warn!("[session] Server reports an empty queue; halting");
                self.halt_active_cells();
                self.emit(WorksheetEvent::ConnectionError {
                    message: "The server is not computing anything for this worksheet.".into(),
                    aborted: true,
                });
            }
            CellUpdate::Working(payload) => {
                self.merge_partial_output(&front.id, &payload);
                self.poller.on_working();
            }
            CellUpdate::Done(payload) => self.on_done(front.kind, &front.id, payload).await?,
        }

        if self.worksheet.queue().is_empty() {
            self.go_idle();
        }
        Ok(())
    }

    /// Keep checking until nothing is queued, sleeping on the clock between
    /// checks.
    pub async fn run_until_idle(&mut self) -> Result<(), SessionError> {
        while let Some(wait) = self.next_poll_in() {
            if !wait.is_zero() {
                self.clock.sleep(wait).await;
            }
            self.poll_once().await?;
        }
        Ok(())
    }

    fn go_idle(&mut self) {
        if self.poller.is_active() {
            self.poller.stop();
            self.emit(WorksheetEvent::PollerIdle);
        }
    }

    fn on_poll_failure(&mut self, error: SessionError) {
        warn!("[session] Update check failed: {}", error);
        match self.poller.on_transport_failure() {
            FailureAction::Retry => {
                if !self.connection_error_reported {
                    self.connection_error_reported = true;
                    self.emit(WorksheetEvent::ConnectionError {
                        message: error.to_string(),
                        aborted: false,
                    });
                }
            }
            FailureAction::Abort => {
                self.halt_active_cells();
                self.emit(WorksheetEvent::ConnectionError {
                    message: format!(
                        "Error updating cell output; canceling further update checks ({})",
                        error
                    ),
                    aborted: true,
                });
                self.emit(WorksheetEvent::PollerIdle);
            }
        }
    }

    fn merge_partial_output(&mut self, id: &CellId, payload: &CellUpdatePayload) {
        let Some(cell) = self.worksheet.cell_mut(id) else {
            return;
        };
        if cell.output.plain == payload.output
            && cell.output.wrapped == payload.output_wrapped
            && cell.output.html == payload.output_html
        {
            return;
        }
        cell.merge_output(payload);
        let output = cell.output.rendered();
        self.emit(WorksheetEvent::OutputUpdated {
            cell_id: id.clone(),
            output,
        });
    }

    async fn on_done(
        &mut self,
        kind: PendingKind,
        polled: &CellId,
        payload: CellUpdatePayload,
    ) -> Result<(), SessionError> {
        let id = if self.worksheet.queue().contains(&payload.id) {
            payload.id.clone()
        } else {
            polled.clone()
        };
        self.worksheet.queue_mut().remove(&id);
        self.poller.on_done();
        debug!("[session] Cell {} done ({:?})", id, kind);

        let mut restart_interact = false;
        if kind == PendingKind::Evaluation {
            if let Some(cell) = self.worksheet.cell_mut(&id) {
                cell.running = false;
                cell.merge_output(&payload);
                restart_interact = cell.output.requests_interact_restart();
                let output = cell.output.rendered();
                self.emit(WorksheetEvent::OutputUpdated {
                    cell_id: id.clone(),
                    output,
                });
            }
        }

        match payload.interrupted {
            Interrupted::No => {
                if kind == PendingKind::Evaluation {
                    if let Some(cell) = self.worksheet.cell_mut(&id) {
                        cell.evaluated = true;
                    }
                    self.emit(WorksheetEvent::CellEvaluated { cell_id: id.clone() });
                }
            }
            Interrupted::Yes => {
                info!("[session] Cell {} was interrupted", id);
                self.emit(WorksheetEvent::CellNotEvaluated { cell_id: id.clone() });
                self.halt_active_cells();
            }
            Interrupted::Restart => {
                warn!("[session] Worker died while computing cell {}", id);
                self.emit(WorksheetEvent::CellNotEvaluated { cell_id: id.clone() });
                self.halt_active_cells();
                self.emit(WorksheetEvent::RestartRequired);
            }
        }

        if !payload.new_input.is_empty() {
            if let Some(cell) = self.worksheet.cell_mut(&id) {
                cell.input = payload.new_input.clone();
                let cursor = cell
                    .introspection
                    .as_ref()
                    .map(|s| s.cursor_after(&payload.new_input));
                self.emit(WorksheetEvent::InputReplaced {
                    cell_id: id.clone(),
                    input: payload.new_input.clone(),
                    cursor,
                });
            }
        }

        if !payload.introspect_html.is_empty() || kind == PendingKind::Introspection {
            self.deliver_introspection(&id, &payload.introspect_html);
        }

        self.emit_queue_state();

        if payload.interrupted == Interrupted::No {
            if restart_interact {
                debug!("[session] Re-evaluating interact cell {}", id);
                self.submit_evaluation(&id).await?;
            } else if self.worksheet.plan_waits_on(&id) {
                self.advance_evaluate_all().await?;
            }
        }
        Ok(())
    }

    // ── Introspection ────────────────────────────────────────────────

    /// Start introspection in a cell whose input is `input` with the cursor
    /// at byte offset `cursor`.
    pub async fn introspect(
        &mut self,
        id: &CellId,
        input: &str,
        cursor: usize,
    ) -> Result<(), SessionError> {
        let result = self.introspect_inner(id, input, cursor).await;
        self.report(Some(id), result)
    }

    async fn introspect_inner(
        &mut self,
        id: &CellId,
        input: &str,
        cursor: usize,
    ) -> Result<(), SessionError> {
        self.require_cell(id)?;
        match crate::introspection::IntrospectionState::begin(input, cursor) {
            Begin::Indent { input, cursor } => {
                debug!("[introspect] Nothing to introspect in cell {}; indenting", id);
                if let Some(cell) = self.worksheet.cell_mut(id) {
                    cell.input = input.clone();
                    cell.input_changed = true;
                    cell.introspection = None;
                }
                self.emit(WorksheetEvent::InputReplaced {
                    cell_id: id.clone(),
                    input,
                    cursor: Some(cursor),
                });
                Ok(())
            }
            Begin::Request {
                state,
                before,
                after,
            } => {
                if let Some(cell) = self.worksheet.cell_mut(id) {
                    cell.input = input.to_string();
                    cell.introspection = Some(state);
                }
                self.send_introspect(id, before, after).await
            }
        }
    }

    async fn send_introspect(
        &mut self,
        id: &CellId,
        before: String,
        after: String,
    ) -> Result<(), SessionError> {
        debug!("[introspect] Cell {} query {:?}", id, before);
        let params = Params::for_cell(id)
            .with("before_cursor", before)
            .with("after_cursor", after);

        let response = match self.call(Command::Introspect, params).await {
            Ok(body) => protocol::decode::<EvalResponse>(Command::Introspect, &body)
                .map_err(SessionError::from),
            Err(e) => Err(e),
        };
        let response = match response {
            Ok(r) if r.id.is_unknown() => Err(SessionError::UnknownCell(id.clone())),
            Ok(r) => match r.rejection() {
                Some(message) => Err(SessionError::Rejected(message.to_string())),
                None => Ok(r),
            },
            Err(e) => Err(e),
        };
        if let Err(e) = response {
            self.close_introspection(id);
            return Err(e);
        }

        self.worksheet
            .queue_mut()
            .enqueue(id.clone(), PendingKind::Introspection);
        self.poller.start();
        self.emit_queue_state();
        Ok(())
    }

    fn deliver_introspection(&mut self, id: &CellId, html: &str) {
        let columns = self.settings.completion_columns;
        let Some(cell) = self.worksheet.cell_mut(id) else {
            return;
        };
        let Some(state) = cell.introspection.as_mut() else {
            return;
        };

        match state.receive(html, columns) {
            Received::List(menu) => {
                self.emit(WorksheetEvent::CompletionsShown {
                    cell_id: id.clone(),
                    menu,
                });
            }
            Received::Docstring(html) => {
                self.emit(WorksheetEvent::DocstringShown {
                    cell_id: id.clone(),
                    html,
                });
            }
            Received::Committed { input, cursor } => {
                cell.input = input.clone();
                cell.input_changed = true;
                cell.introspection = None;
                self.emit(WorksheetEvent::InputReplaced {
                    cell_id: id.clone(),
                    input,
                    cursor: Some(cursor),
                });
                self.emit(WorksheetEvent::IntrospectionClosed { cell_id: id.clone() });
            }
            Received::Closed => self.close_introspection(id),
        }
    }

    /// Feed a key press to the cell's introspection state. `cursor` is the
    /// current cursor position, used when introspection has to start over.
    pub async fn introspection_key(
        &mut self,
        id: &CellId,
        key: IntrospectionKey,
        cursor: usize,
    ) -> Result<KeyOutcome, SessionError> {
        let Some(state) = self
            .worksheet
            .cell_mut(id)
            .and_then(|c| c.introspection.as_mut())
        else {
            return Ok(KeyOutcome::PassThrough);
        };
        let outcome = state.handle_key(key);
        let menu = state.grid().map(|g| g.to_menu());

        match &outcome {
            KeyOutcome::Navigated { .. } => {
                if let Some(menu) = menu {
                    self.emit(WorksheetEvent::CompletionsShown {
                        cell_id: id.clone(),
                        menu,
                    });
                }
            }
            KeyOutcome::Commit { input, cursor } => {
                if let Some(cell) = self.worksheet.cell_mut(id) {
                    cell.input = input.clone();
                    cell.input_changed = true;
                }
                self.emit(WorksheetEvent::InputReplaced {
                    cell_id: id.clone(),
                    input: input.clone(),
                    cursor: Some(*cursor),
                });
                self.close_introspection(id);
            }
            KeyOutcome::Restart => {
                let input = self.require_cell(id)?.input.clone();
                self.introspect(id, &input, cursor).await?;
            }
            KeyOutcome::Requery { before, after } => {
                let result = self.send_introspect(id, before.clone(), after.clone()).await;
                self.report(Some(id), result)?;
            }
            KeyOutcome::Closed | KeyOutcome::Dismissed => self.close_introspection(id),
            KeyOutcome::PassThrough => {}
        }
        Ok(outcome)
    }

    /// Drop a cell's introspection state, pending request included.
    pub fn cancel_introspection(&mut self, id: &CellId) {
        if self.worksheet.queue().kind_of(id) == Some(PendingKind::Introspection) {
            self.worksheet.queue_mut().remove(id);
            self.emit_queue_state();
            if self.worksheet.queue().is_empty() {
                self.go_idle();
            }
        }
        self.close_introspection(id);
    }

    fn close_introspection(&mut self, id: &CellId) {
        let was_open = self
            .worksheet
            .cell_mut(id)
            .and_then(|c| c.introspection.take())
            .is_some();
        if was_open {
            self.emit(WorksheetEvent::IntrospectionClosed { cell_id: id.clone() });
        }
    }

    // ── Cell lifecycle ───────────────────────────────────────────────

    /// Ask the server for a new cell next to `anchor`. Returns its id.
    pub async fn insert_cell(
        &mut self,
        anchor: &CellId,
        position: InsertPosition,
        kind: CellKind,
        input: &str,
    ) -> Result<CellId, SessionError> {
        let result = self.insert_cell_inner(anchor, position, kind, input).await;
        self.report(Some(anchor), result)
    }

    async fn insert_cell_inner(
        &mut self,
        anchor: &CellId,
        position: InsertPosition,
        kind: CellKind,
        input: &str,
    ) -> Result<CellId, SessionError> {
        let command = match (kind, position) {
            (CellKind::Compute, InsertPosition::Before) => Command::NewCellBefore,
            (CellKind::Compute, InsertPosition::After) => Command::NewCellAfter,
            (CellKind::Text, InsertPosition::Before) => Command::NewTextCellBefore,
            (CellKind::Text, InsertPosition::After) => Command::NewTextCellAfter,
        };
        let mut params = Params::for_cell(anchor);
        if !input.is_empty() {
            params = params.with("input", input);
        }

        let body = self.call(command, params).await?;
        let response: NewCellResponse = protocol::decode(command, &body)?;

        let mut cell = match kind {
            CellKind::Compute => Cell::compute(response.new_id.clone()),
            CellKind::Text => Cell::text(response.new_id.clone(), ""),
        };
        cell.input = input.to_string();

        let index = match position {
            InsertPosition::Before => self.worksheet.insert_before(anchor, cell),
            InsertPosition::After => self.worksheet.insert_after(anchor, cell),
        };
        info!("[session] Inserted cell {} at {}", response.new_id, index);
        self.emit(WorksheetEvent::CellInserted {
            cell_id: response.new_id.clone(),
            kind,
            index,
        });
        Ok(response.new_id)
    }

    /// Delete a cell, interrupting it first if it is running. Returns false
    /// if the server declined (e.g. the last compute cell).
    pub async fn delete_cell(&mut self, id: &CellId) -> Result<bool, SessionError> {
        let result = self.delete_cell_inner(id).await;
        self.report(Some(id), result)
    }

    async fn delete_cell_inner(&mut self, id: &CellId) -> Result<bool, SessionError> {
        // A successful interrupt cancels evaluate-all; keep the plan aside
        // so it can carry on past the deleted cell.
        let paused_plan = if self.worksheet.plan_waits_on(id) {
            self.worksheet.take_evaluate_all()
        } else {
            None
        };

        if self.worksheet.queue().contains(id) {
            debug!("[session] Interrupting running cell {} before delete", id);
            if let Err(e) = self.interrupt().await {
                warn!("[session] Interrupt before delete failed: {}", e);
            }
        }

        let deleted = self.remove_on_server(id).await;
        match (paused_plan, &deleted) {
            (Some(plan), Ok(true)) => {
                self.worksheet.resume_evaluate_all(plan);
                self.advance_evaluate_all().await?;
            }
            // Still running on the server: its done response advances.
            (Some(plan), _) if self.worksheet.queue().contains(id) => {
                self.worksheet.resume_evaluate_all(plan);
            }
            (Some(_), _) => info!("[session] Evaluate all stopped at kept cell {}", id),
            (None, _) => {}
        }
        deleted
    }

    async fn remove_on_server(&mut self, id: &CellId) -> Result<bool, SessionError> {
        let body = self.call(Command::DeleteCell, Params::for_cell(id)).await?;
        let response: DeleteCellResponse = protocol::decode(Command::DeleteCell, &body)?;
        if response.ignored() {
            debug!("[session] Server ignored delete of cell {}", id);
            return Ok(false);
        }

        if self.worksheet.remove(id).is_none() {
            return Ok(true);
        }
        info!("[session] Deleted cell {}", id);
        self.emit(WorksheetEvent::CellRemoved { cell_id: id.clone() });
        self.emit_queue_state();
        if self.worksheet.queue().is_empty() {
            self.go_idle();
        }
        Ok(true)
    }

    /// Clear one cell's output, interrupting it first if it is running.
    pub async fn delete_output(&mut self, id: &CellId) -> Result<(), SessionError> {
        let result = self.delete_output_inner(id).await;
        self.report(Some(id), result)
    }

    async fn delete_output_inner(&mut self, id: &CellId) -> Result<(), SessionError> {
        if self.worksheet.queue().contains(id) {
            if let Err(e) = self.interrupt().await {
                warn!("[session] Interrupt before delete_output failed: {}", e);
            }
        }
        let body = self
            .call(Command::DeleteCellOutput, Params::for_cell(id))
            .await?;
        let _: DeleteOutputResponse = protocol::decode(Command::DeleteCellOutput, &body)?;

        if let Some(cell) = self.worksheet.cell_mut(id) {
            cell.output.clear();
            cell.evaluated = false;
        }
        self.emit(WorksheetEvent::OutputUpdated {
            cell_id: id.clone(),
            output: RenderedOutput::Empty,
        });
        Ok(())
    }

    /// Clear the output of every cell. Returns false if the server refused.
    pub async fn delete_all_output(&mut self) -> Result<bool, SessionError> {
        let result = self.delete_all_output_inner().await;
        self.report(None, result)
    }

    async fn delete_all_output_inner(&mut self) -> Result<bool, SessionError> {
        let body = self.call(Command::DeleteAllOutput, Params::new()).await?;
        if !protocol::decode_ack(Command::DeleteAllOutput, &body)? {
            return Ok(false);
        }
        let cleared: Vec<CellId> = self
            .worksheet
            .cells_mut()
            .filter(|c| c.is_executable())
            .map(|c| {
                c.output.clear();
                c.evaluated = false;
                c.id.clone()
            })
            .collect();
        for cell_id in cleared {
            self.emit(WorksheetEvent::OutputUpdated {
                cell_id,
                output: RenderedOutput::Empty,
            });
        }
        Ok(true)
    }

    pub async fn hide_all(&mut self) -> Result<(), SessionError> {
        let result = self.set_all_hidden(true).await;
        self.report(None, result)
    }

    pub async fn show_all(&mut self) -> Result<(), SessionError> {
        let result = self.set_all_hidden(false).await;
        self.report(None, result)
    }

    async fn set_all_hidden(&mut self, hidden: bool) -> Result<(), SessionError> {
        let command = if hidden {
            Command::HideAll
        } else {
            Command::ShowAll
        };
        let body = self.call(command, Params::new()).await?;
        if !protocol::decode_ack(command, &body)? {
            return Err(SessionError::Rejected(format!("{} failed", command)));
        }
        let changed: Vec<CellId> = self
            .worksheet
            .cells_mut()
            .filter(|c| c.is_executable() && c.output_hidden != hidden)
            .map(|c| {
                c.output_hidden = hidden;
                c.id.clone()
            })
            .collect();
        for cell_id in changed {
            self.emit(WorksheetEvent::OutputVisibility { cell_id, hidden });
        }
        Ok(())
    }

    // ── Interrupt / restart ──────────────────────────────────────────

    /// Interrupt the running computation. On success every queued cell is
    /// halted; repeated failures escalate towards suggesting a restart.
    pub async fn interrupt(&mut self) -> Result<bool, SessionError> {
        let result = match self.call(Command::Interrupt, Params::new()).await {
            Ok(body) => protocol::decode_interrupt(&body).map_err(SessionError::from),
            Err(e) => Err(e),
        };

        match result {
            Ok(true) => {
                info!("[session] Interrupt succeeded");
                self.interrupt_failures = 0;
                self.halt_active_cells();
                Ok(true)
            }
            Ok(false) => {
                self.on_interrupt_failure();
                Ok(false)
            }
            Err(SessionError::Locked) => self.report(None, Err(SessionError::Locked)),
            Err(e) => {
                self.on_interrupt_failure();
                Err(e)
            }
        }
    }

    fn on_interrupt_failure(&mut self) {
        self.interrupt_failures += 1;
        let suggest_restart = self.interrupt_failures >= self.settings.interrupt_restart_threshold;
        warn!(
            "[session] Interrupt failed ({} attempts)",
            self.interrupt_failures
        );
        self.emit(WorksheetEvent::InterruptFailed {
            attempts: self.interrupt_failures,
            suggest_restart,
        });
    }

    /// Restart the worksheet's worker. Every compute cell becomes not
    /// evaluated.
    pub async fn restart(&mut self) -> Result<(), SessionError> {
        let result = self.restart_inner().await;
        self.report(None, result)
    }

    async fn restart_inner(&mut self) -> Result<(), SessionError> {
        let body = self.call(Command::RestartSage, Params::new()).await?;
        if !protocol::decode_ack(Command::RestartSage, &body)? {
            return Err(SessionError::Rejected("restart failed".into()));
        }
        info!("[session] Worker restarted");
        self.interrupt_failures = 0;
        self.halt_active_cells();
        for cell in self.worksheet.cells_mut() {
            cell.running = false;
            cell.evaluated = false;
        }
        self.emit(WorksheetEvent::Restarted);
        Ok(())
    }

    /// Empty the running queue, stop polling, cancel evaluate-all.
    pub fn halt_active_cells(&mut self) {
        let halted = self.worksheet.halt_active_cells();
        self.go_idle();
        if halted.is_empty() {
            return;
        }
        info!("[session] Halted {} active cells", halted.len());
        for cell_id in halted {
            self.emit(WorksheetEvent::CellNotEvaluated { cell_id });
        }
        self.emit_queue_state();
    }

    // ── Liveness ─────────────────────────────────────────────────────

    /// Ping the server. Returns true if stale state was detected and the
    /// cell list reloaded.
    pub async fn ping(&mut self) -> Result<bool, SessionError> {
        let state = match self.call(Command::Alive, Params::new()).await {
            Ok(body) => protocol::decode_state_number(&body).map_err(SessionError::from),
            Err(e) => Err(e),
        };
        let server = match state {
            Ok(n) => n,
            Err(e) => {
                self.set_server_up(false);
                return Err(e);
            }
        };
        self.set_server_up(true);

        let cached = self.worksheet.state_number();
        if !self.worksheet.observe_alive(server) {
            return Ok(false);
        }
        info!(
            "[session] Stale worksheet (cached {}, server {}); reloading",
            cached, server
        );
        self.emit(WorksheetEvent::StaleStateDetected { cached, server });
        if let Err(e) = self.refresh_cell_list().await {
            self.worksheet.forget_reload_request();
            return Err(e);
        }
        Ok(true)
    }

    fn set_server_up(&mut self, up: bool) {
        if self.server_up != Some(up) {
            self.server_up = Some(up);
            self.emit(WorksheetEvent::ServerStatus { up });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ManualClock, MockTransport};

    fn session() -> (WorksheetSession<MockTransport, ManualClock>, MockTransport) {
        let transport = MockTransport::new();
        let session =
            WorksheetSession::new(transport.clone(), ManualClock::new(), SyncSettings::default());
        (session, transport)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WorksheetEvent>) -> Vec<WorksheetEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_evaluate_unknown_cell_is_abandoned() {
        let (mut session, transport) = session();
        session.worksheet_mut().push(Cell::compute(CellId::Number(3)));
        let mut rx = session.subscribe();
        transport.respond(Command::Eval, r#"{"id":-1}"#);

        let result = session.evaluate(&CellId::Number(3)).await;
        assert!(matches!(result, Err(SessionError::UnknownCell(_))));
        assert!(session.worksheet().queue().is_empty());
        assert!(!session.poller().is_active());
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, WorksheetEvent::Notice { .. })));
    }

    #[tokio::test]
    async fn test_evaluate_transport_failure_leaves_cell_untouched() {
        let (mut session, transport) = session();
        let mut cell = Cell::compute(CellId::Number(3));
        cell.output.plain = "old".into();
        session.worksheet_mut().push(cell);
        transport.fail(Command::Eval, "connection reset");

        assert!(matches!(
            session.evaluate(&CellId::Number(3)).await,
            Err(SessionError::Transport(_))
        ));
        let cell = session.worksheet().cell(&CellId::Number(3)).unwrap();
        assert!(!cell.running);
        assert_eq!(cell.output.plain, "old");
        assert_eq!(transport.count(Command::Eval), 1);
    }

    #[tokio::test]
    async fn test_evaluate_queued_cell_is_noop() {
        let (mut session, transport) = session();
        session.worksheet_mut().push(Cell::compute(CellId::Number(3)));
        transport.respond_always(Command::Eval, r#"{"id":3}"#);

        session.evaluate(&CellId::Number(3)).await.unwrap();
        session.evaluate(&CellId::Number(3)).await.unwrap();
        assert_eq!(transport.count(Command::Eval), 1);
        assert_eq!(session.worksheet().queue().len(), 1);
    }

    #[tokio::test]
    async fn test_evaluate_inserts_server_cell() {
        let (mut session, transport) = session();
        session.worksheet_mut().push(Cell::compute(CellId::Number(3)));
        transport.respond(
            Command::Eval,
            r#"{"id":3,"command":"insert_cell","new_cell_id":4,"new_cell_html":""}"#,
        );

        let next = session.evaluate(&CellId::Number(3)).await.unwrap();
        assert_eq!(next, Some(CellId::Number(4)));
        assert_eq!(
            session.worksheet().ids(),
            vec![CellId::Number(3), CellId::Number(4)]
        );
    }

    #[tokio::test]
    async fn test_locked_insert_emits_notice() {
        let (mut session, transport) = session();
        session.worksheet_mut().push(Cell::compute(CellId::Number(1)));
        let mut rx = session.subscribe();
        transport.respond(Command::NewCellAfter, "locked");

        let result = session
            .insert_cell(&CellId::Number(1), InsertPosition::After, CellKind::Compute, "")
            .await;
        assert!(matches!(result, Err(SessionError::Locked)));
        assert_eq!(session.worksheet().len(), 1);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, WorksheetEvent::Locked { .. })));
    }

    #[tokio::test]
    async fn test_insert_text_cell_before() {
        let (mut session, transport) = session();
        session.worksheet_mut().push(Cell::compute(CellId::Number(1)));
        session.worksheet_mut().observe_state_number(4);
        transport.respond(
            Command::NewTextCellBefore,
            r#"{"id":1,"new_id":"7","new_html":"<div/>"}"#,
        );

        let id = session
            .insert_cell(&CellId::Number(1), InsertPosition::Before, CellKind::Text, "")
            .await
            .unwrap();
        assert_eq!(id, CellId::Number(7));
        assert_eq!(session.worksheet().ids()[0], CellId::Number(7));
        assert!(!session.worksheet().cells()[0].is_executable());
        assert_eq!(session.worksheet().state_number(), 5);
    }

    #[tokio::test]
    async fn test_submit_input_is_save_only() {
        let (mut session, transport) = session();
        session.worksheet_mut().push(Cell::compute(CellId::Number(2)));
        transport.respond(Command::Eval, r#"{"id":2}"#);

        session.edit_input(&CellId::Number(2), "x = 1").unwrap();
        assert!(session.worksheet().cell(&CellId::Number(2)).unwrap().input_changed);
        session.submit_input(&CellId::Number(2)).await.unwrap();

        let request = &transport.requests()[0];
        assert_eq!(request.params.get("save_only"), Some("1"));
        assert_eq!(request.params.get("input"), Some("x = 1"));
        let cell = session.worksheet().cell(&CellId::Number(2)).unwrap();
        assert!(!cell.input_changed);
        assert!(!cell.running);
        assert!(session.worksheet().queue().is_empty());
    }

    #[tokio::test]
    async fn test_update_cell_auto_evaluates() {
        let (mut session, transport) = session();
        transport.respond(
            Command::CellProperties,
            r#"{"id":6,"type":"evaluate","input":"%auto\n1+1","percent_directives":["auto"]}"#,
        );
        transport.respond(Command::Eval, r#"{"id":6}"#);

        session.update_cell(&CellId::Number(6), true).await.unwrap();
        assert_eq!(
            transport.commands(),
            vec![Command::CellProperties, Command::Eval]
        );
        assert!(session.worksheet().queue().contains(&CellId::Number(6)));
    }

    #[tokio::test]
    async fn test_update_cell_without_auto_flag_does_not_evaluate() {
        let (mut session, transport) = session();
        transport.respond(
            Command::CellProperties,
            r#"{"id":6,"input":"1+1","percent_directives":["auto"]}"#,
        );
        session.update_cell(&CellId::Number(6), false).await.unwrap();
        assert_eq!(transport.commands(), vec![Command::CellProperties]);
    }

    #[tokio::test]
    async fn test_introspection_indent() {
        let (mut session, transport) = session();
        session.worksheet_mut().push(Cell::compute(CellId::Number(1)));

        session
            .introspect(&CellId::Number(1), "for i in x:\n", 12)
            .await
            .unwrap();
        assert!(transport.requests().is_empty());
        assert_eq!(
            session.worksheet().cell(&CellId::Number(1)).unwrap().input,
            "for i in x:\n    "
        );
    }

    #[tokio::test]
    async fn test_completion_list_round_trip() {
        let (mut session, transport) = session();
        session.worksheet_mut().push(Cell::compute(CellId::Number(1)));
        let mut rx = session.subscribe();
        transport.respond(Command::Introspect, r#"{"id":1,"command":"introspect"}"#);
        transport.respond(
            Command::CellUpdate,
            r#"{"id":1,"status":"d","interrupted":"false","introspect_html":"factor factorial"}"#,
        );

        session.introspect(&CellId::Number(1), "fa", 2).await.unwrap();
        let request = &transport.requests()[0];
        assert_eq!(request.params.get("before_cursor"), Some("fa"));
        assert_eq!(request.params.get("after_cursor"), Some(""));

        session.run_until_idle().await.unwrap();
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, WorksheetEvent::CompletionsShown { .. })));

        let outcome = session
            .introspection_key(&CellId::Number(1), IntrospectionKey::Right, 2)
            .await
            .unwrap();
        assert!(matches!(outcome, KeyOutcome::Navigated { .. }));
        let outcome = session
            .introspection_key(&CellId::Number(1), IntrospectionKey::Pick, 2)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            KeyOutcome::Commit {
                input: "factorial".into(),
                cursor: 9
            }
        );
        let cell = session.worksheet().cell(&CellId::Number(1)).unwrap();
        assert_eq!(cell.input, "factorial");
        assert!(cell.introspection.is_none());
    }

    #[tokio::test]
    async fn test_interrupt_escalation() {
        let (mut session, transport) = session();
        let mut rx = session.subscribe();
        transport.respond_always(Command::Interrupt, "failed");

        for _ in 0..3 {
            assert!(!session.interrupt().await.unwrap());
        }
        let failures: Vec<(u32, bool)> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                WorksheetEvent::InterruptFailed {
                    attempts,
                    suggest_restart,
                } => Some((attempts, suggest_restart)),
                _ => None,
            })
            .collect();
        assert_eq!(failures, vec![(1, false), (2, false), (3, true)]);
    }

    #[tokio::test]
    async fn test_interrupt_success_halts_queue() {
        let (mut session, transport) = session();
        session.worksheet_mut().push(Cell::compute(CellId::Number(1)));
        transport.respond(Command::Eval, r#"{"id":1}"#);
        transport.respond(Command::Interrupt, "success");

        session.evaluate(&CellId::Number(1)).await.unwrap();
        assert!(session.interrupt().await.unwrap());
        assert!(session.worksheet().queue().is_empty());
        assert!(!session.poller().is_active());
        assert!(!session.worksheet().cell(&CellId::Number(1)).unwrap().evaluated);
    }

    #[tokio::test]
    async fn test_restart_marks_cells_not_evaluated() {
        let (mut session, transport) = session();
        let mut cell = Cell::compute(CellId::Number(1));
        cell.evaluated = true;
        session.worksheet_mut().push(cell);
        transport.respond(Command::RestartSage, "done");

        session.restart().await.unwrap();
        assert!(!session.worksheet().cell(&CellId::Number(1)).unwrap().evaluated);
    }

    #[tokio::test]
    async fn test_hide_and_show_all() {
        let (mut session, transport) = session();
        session.worksheet_mut().push(Cell::compute(CellId::Number(1)));
        session.worksheet_mut().push(Cell::text(CellId::Number(2), ""));
        transport.respond(Command::HideAll, "success");
        transport.respond(Command::ShowAll, "success");

        session.hide_all().await.unwrap();
        assert!(session.worksheet().cell(&CellId::Number(1)).unwrap().output_hidden);
        assert!(!session.worksheet().cell(&CellId::Number(2)).unwrap().output_hidden);
        session.show_all().await.unwrap();
        assert!(!session.worksheet().cell(&CellId::Number(1)).unwrap().output_hidden);
    }

    #[tokio::test]
    async fn test_delete_all_output() {
        let (mut session, transport) = session();
        let mut cell = Cell::compute(CellId::Number(1));
        cell.output.plain = "4".into();
        session.worksheet_mut().push(cell);
        transport.respond(Command::DeleteAllOutput, "fail");
        transport.respond(Command::DeleteAllOutput, "success");

        assert!(!session.delete_all_output().await.unwrap());
        assert!(!session.worksheet().cells()[0].output.is_empty());
        assert!(session.delete_all_output().await.unwrap());
        assert!(session.worksheet().cells()[0].output.is_empty());
    }

    #[tokio::test]
    async fn test_delete_ignored_is_noop() {
        let (mut session, transport) = session();
        session.worksheet_mut().push(Cell::compute(CellId::Number(1)));
        transport.respond(Command::DeleteCell, r#"{"id":1,"command":"ignore"}"#);

        assert!(!session.delete_cell(&CellId::Number(1)).await.unwrap());
        assert_eq!(session.worksheet().len(), 1);
    }

    #[tokio::test]
    async fn test_ping_reports_server_status_changes() {
        let (mut session, transport) = session();
        let mut rx = session.subscribe();
        transport.fail(Command::Alive, "down");
        transport.respond_always(Command::Alive, "-1");

        assert!(session.ping().await.is_err());
        assert!(!session.ping().await.unwrap());
        assert!(!session.ping().await.unwrap());

        let statuses: Vec<bool> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                WorksheetEvent::ServerStatus { up } => Some(up),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![false, true]);
    }
}
