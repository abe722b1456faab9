//! Ordered cell collection and the bookkeeping that spans cells: the
//! running queue, the state number, stale-state detection and the
//! "evaluate all" plan.

use std::collections::VecDeque;

use log::debug;

use crate::cell::Cell;
use crate::protocol::CellProperties;
use crate::running_queue::{PendingKind, RunningQueue};
use crate::CellId;

/// Snapshot of cell ids taken when "evaluate all" starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluateAllPlan {
    remaining: VecDeque<CellId>,
    current: Option<CellId>,
}

impl EvaluateAllPlan {
    pub fn current(&self) -> Option<&CellId> {
        self.current.as_ref()
    }

    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }
}

#[derive(Debug)]
pub struct Worksheet {
    cells: Vec<Cell>,
    queue: RunningQueue,
    state_number: i64,
    reload_requested_for: Option<i64>,
    evaluate_all: Option<EvaluateAllPlan>,
    pub locked: bool,
    pub published: bool,
}

impl Default for Worksheet {
    fn default() -> Self {
        Self::new()
    }
}

impl Worksheet {
    pub fn new() -> Self {
        Self {
            cells: Vec::new(),
            queue: RunningQueue::new(),
            state_number: -1,
            reload_requested_for: None,
            evaluate_all: None,
            locked: false,
            published: false,
        }
    }

    // ── Cells ────────────────────────────────────────────────────────

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn ids(&self) -> Vec<CellId> {
        self.cells.iter().map(|c| c.id.clone()).collect()
    }

    pub fn position(&self, id: &CellId) -> Option<usize> {
        self.cells.iter().position(|c| &c.id == id)
    }

    pub fn cell(&self, id: &CellId) -> Option<&Cell> {
        self.cells.iter().find(|c| &c.id == id)
    }

    pub fn cell_mut(&mut self, id: &CellId) -> Option<&mut Cell> {
        self.cells.iter_mut().find(|c| &c.id == id)
    }

    pub fn cells_mut(&mut self) -> impl Iterator<Item = &mut Cell> {
        self.cells.iter_mut()
    }

    pub fn push(&mut self, cell: Cell) -> usize {
        self.insert_at(self.cells.len(), cell)
    }

    /// Splice `cell` in after `anchor`; appended if the anchor is unknown.
    pub fn insert_after(&mut self, anchor: &CellId, cell: Cell) -> usize {
        let index = self.position(anchor).map_or(self.cells.len(), |i| i + 1);
        self.insert_at(index, cell)
    }

    /// Splice `cell` in before `anchor`; appended if the anchor is unknown.
    pub fn insert_before(&mut self, anchor: &CellId, cell: Cell) -> usize {
        let index = self.position(anchor).unwrap_or(self.cells.len());
        self.insert_at(index, cell)
    }

    fn insert_at(&mut self, index: usize, cell: Cell) -> usize {
        if let Some(existing) = self.position(&cell.id) {
            return existing;
        }
        self.cells.insert(index, cell);
        index
    }

    /// Detach a cell from the collection, the running queue and the
    /// evaluate-all plan.
    pub fn remove(&mut self, id: &CellId) -> Option<Cell> {
        let index = self.position(id)?;
        self.queue.remove(id);
        if let Some(plan) = self.evaluate_all.as_mut() {
            plan.remaining.retain(|c| c != id);
        }
        Some(self.cells.remove(index))
    }

    /// First executable cell after `id` in display order.
    pub fn next_executable_after(&self, id: &CellId) -> Option<CellId> {
        let start = self.position(id)? + 1;
        self.cells[start..]
            .iter()
            .find(|c| c.is_executable())
            .map(|c| c.id.clone())
    }

    /// Replace the whole collection with the server's cell list, keeping
    /// per-cell client state (running, introspection) of surviving cells.
    pub fn replace_cells(&mut self, cells: &[CellProperties], state_number: i64) {
        let mut previous = std::mem::take(&mut self.cells);
        for props in cells {
            let mut cell = Cell::from_properties(props);
            if let Some(old) = previous.iter_mut().find(|c| c.id == cell.id) {
                cell.introspection = old.introspection.take();
                cell.evaluated |= old.evaluated;
            }
            cell.running = self.queue.kind_of(&cell.id) == Some(PendingKind::Evaluation);
            self.cells.push(cell);
        }

        let stale: Vec<CellId> = self
            .queue
            .ids()
            .filter(|id| self.cell(id).is_none())
            .cloned()
            .collect();
        for id in stale {
            self.queue.remove(&id);
        }

        self.observe_state_number(state_number);
        debug!(
            "[worksheet] Loaded {} cells at state {}",
            self.cells.len(),
            self.state_number
        );
    }

    // ── Running queue ────────────────────────────────────────────────

    pub fn queue(&self) -> &RunningQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut RunningQueue {
        &mut self.queue
    }

    /// Empty the running queue. Evaluations are marked not evaluated,
    /// introspections are dropped, and evaluate-all is cancelled. Output
    /// already received stays in place.
    pub fn halt_active_cells(&mut self) -> Vec<CellId> {
        let halted = self.queue.drain();
        for entry in &halted {
            if let Some(cell) = self.cell_mut(&entry.id) {
                cell.running = false;
                match entry.kind {
                    PendingKind::Evaluation => cell.evaluated = false,
                    PendingKind::Introspection => cell.introspection = None,
                }
            }
        }
        self.evaluate_all = None;
        halted.into_iter().map(|e| e.id).collect()
    }

    // ── State number ─────────────────────────────────────────────────

    pub fn state_number(&self) -> i64 {
        self.state_number
    }

    /// Mirror the server's increment for a state-changing request.
    pub fn bump_state_number(&mut self) {
        if self.state_number >= 0 {
            self.state_number += 1;
        }
    }

    /// Adopt a number the server reported, never moving backwards.
    pub fn observe_state_number(&mut self, n: i64) {
        self.state_number = self.state_number.max(n);
    }

    /// Compare a liveness-ping state number against the cache. Returns true
    /// exactly once per newer value: the caller should reload the cell
    /// list.
    pub fn observe_alive(&mut self, server: i64) -> bool {
        if self.state_number < 0 || server <= self.state_number {
            return false;
        }
        if self.reload_requested_for.is_some_and(|r| server <= r) {
            return false;
        }
        self.reload_requested_for = Some(server);
        true
    }

    /// Undo the reload recorded by [`Worksheet::observe_alive`] after the
    /// reload itself failed, so the next ping retries it.
    pub fn forget_reload_request(&mut self) {
        self.reload_requested_for = None;
    }

    // ── Evaluate all ─────────────────────────────────────────────────

    pub fn evaluating_all(&self) -> bool {
        self.evaluate_all.is_some()
    }

    pub fn evaluate_all_plan(&self) -> Option<&EvaluateAllPlan> {
        self.evaluate_all.as_ref()
    }

    /// Take a snapshot of the current order.
    pub fn start_evaluate_all(&mut self) {
        self.evaluate_all = Some(EvaluateAllPlan {
            remaining: self.cells.iter().map(|c| c.id.clone()).collect(),
            current: None,
        });
    }

    /// Pop the next executable cell still present in the worksheet.
    /// Returns `None` (and clears the plan) when it is exhausted.
    pub fn next_in_plan(&mut self) -> Option<CellId> {
        let plan = self.evaluate_all.as_mut()?;
        while let Some(id) = plan.remaining.pop_front() {
            let executable = self
                .cells
                .iter()
                .any(|c| c.id == id && c.is_executable());
            if executable {
                plan.current = Some(id.clone());
                return Some(id);
            }
        }
        self.evaluate_all = None;
        None
    }

    /// True while evaluate-all runs and none of its cells is still queued.
    pub fn plan_ready_to_advance(&self) -> bool {
        self.evaluate_all.as_ref().is_some_and(|p| match &p.current {
            Some(current) => !self.queue.contains(current),
            None => true,
        })
    }

    /// Whether evaluate-all is waiting on `id` to finish.
    pub fn plan_waits_on(&self, id: &CellId) -> bool {
        self.evaluate_all
            .as_ref()
            .is_some_and(|p| p.current.as_ref() == Some(id))
    }

    pub fn cancel_evaluate_all(&mut self) {
        self.evaluate_all = None;
    }

    /// Detach the plan, e.g. across an interrupt that would cancel it.
    pub fn take_evaluate_all(&mut self) -> Option<EvaluateAllPlan> {
        self.evaluate_all.take()
    }

    /// Reattach a plan detached with [`Worksheet::take_evaluate_all`].
    pub fn resume_evaluate_all(&mut self, plan: EvaluateAllPlan) {
        self.evaluate_all = Some(plan);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: i64) -> CellId {
        CellId::Number(n)
    }

    fn sheet(ids: &[i64]) -> Worksheet {
        let mut ws = Worksheet::new();
        for &n in ids {
            ws.push(Cell::compute(id(n)));
        }
        ws
    }

    #[test]
    fn test_insert_positions() {
        let mut ws = sheet(&[1, 2, 3]);
        assert_eq!(ws.insert_after(&id(1), Cell::compute(id(10))), 1);
        assert_eq!(ws.insert_before(&id(1), Cell::compute(id(11))), 0);
        assert_eq!(ws.insert_after(&id(99), Cell::compute(id(12))), 5);
        assert_eq!(
            ws.ids(),
            vec![id(11), id(1), id(10), id(2), id(3), id(12)]
        );
    }

    #[test]
    fn test_insert_existing_id_is_noop() {
        let mut ws = sheet(&[1, 2]);
        assert_eq!(ws.insert_after(&id(2), Cell::compute(id(1))), 0);
        assert_eq!(ws.len(), 2);
    }

    #[test]
    fn test_remove_detaches_everywhere() {
        let mut ws = sheet(&[1, 2, 3]);
        ws.queue_mut().enqueue(id(2), PendingKind::Evaluation);
        ws.start_evaluate_all();

        assert!(ws.remove(&id(2)).is_some());
        assert!(ws.cell(&id(2)).is_none());
        assert!(!ws.queue().contains(&id(2)));
        assert_eq!(ws.next_in_plan(), Some(id(1)));
        assert_eq!(ws.next_in_plan(), Some(id(3)));
        assert_eq!(ws.next_in_plan(), None);
        assert!(!ws.evaluating_all());
    }

    #[test]
    fn test_plan_skips_text_cells() {
        let mut ws = sheet(&[1]);
        ws.push(Cell::text(id(2), "<p>notes</p>"));
        ws.push(Cell::compute(id(3)));
        ws.start_evaluate_all();

        assert_eq!(ws.next_in_plan(), Some(id(1)));
        assert!(ws.plan_waits_on(&id(1)));
        assert_eq!(ws.next_in_plan(), Some(id(3)));
        assert_eq!(ws.next_in_plan(), None);
    }

    #[test]
    fn test_state_number_never_decreases() {
        let mut ws = Worksheet::new();
        ws.bump_state_number();
        assert_eq!(ws.state_number(), -1);
        ws.observe_state_number(5);
        ws.bump_state_number();
        assert_eq!(ws.state_number(), 6);
        ws.observe_state_number(2);
        assert_eq!(ws.state_number(), 6);
    }

    #[test]
    fn test_stale_detection_once_per_value() {
        let mut ws = Worksheet::new();
        assert!(!ws.observe_alive(10), "unknown cached state never reloads");

        ws.observe_state_number(3);
        assert!(!ws.observe_alive(3));
        assert!(ws.observe_alive(4));
        assert!(!ws.observe_alive(4));
        assert!(!ws.observe_alive(4));
        assert!(ws.observe_alive(5));
    }

    #[test]
    fn test_halt_active_cells() {
        let mut ws = sheet(&[1, 2]);
        for n in [1, 2] {
            ws.cell_mut(&id(n)).unwrap().start_running();
            ws.queue_mut().enqueue(id(n), PendingKind::Evaluation);
        }
        ws.cell_mut(&id(1)).unwrap().output.plain = "partial".into();
        ws.start_evaluate_all();

        let halted = ws.halt_active_cells();
        assert_eq!(halted, vec![id(1), id(2)]);
        assert!(ws.queue().is_empty());
        assert!(!ws.evaluating_all());
        let cell = ws.cell(&id(1)).unwrap();
        assert!(!cell.running);
        assert!(!cell.evaluated);
        assert_eq!(cell.output.plain, "partial");
    }

    #[test]
    fn test_replace_cells_keeps_running_state() {
        let mut ws = sheet(&[1, 2]);
        ws.queue_mut().enqueue(id(2), PendingKind::Evaluation);
        ws.queue_mut().enqueue(id(9), PendingKind::Evaluation);

        let props: Vec<CellProperties> = [2, 3]
            .iter()
            .map(|&n| CellProperties {
                id: id(n),
                ..Default::default()
            })
            .collect();
        ws.replace_cells(&props, 7);

        assert_eq!(ws.ids(), vec![id(2), id(3)]);
        assert!(ws.cell(&id(2)).unwrap().running);
        assert!(!ws.queue().contains(&id(9)));
        assert_eq!(ws.state_number(), 7);
    }

    #[test]
    fn test_next_executable_after() {
        let mut ws = sheet(&[1]);
        ws.push(Cell::text(id(2), ""));
        ws.push(Cell::compute(id(3)));
        assert_eq!(ws.next_executable_after(&id(1)), Some(id(3)));
        assert_eq!(ws.next_executable_after(&id(3)), None);
    }

    #[test]
    fn test_failed_reload_is_retried() {
        let mut ws = sheet(&[1]);
        ws.observe_state_number(3);
        assert!(ws.observe_alive(9));
        assert!(!ws.observe_alive(9));
        ws.forget_reload_request();
        assert!(ws.observe_alive(9));
    }

    #[test]
    fn test_plan_waits_for_queued_cell() {
        let mut ws = sheet(&[1, 2]);
        assert!(!ws.plan_ready_to_advance());
        ws.start_evaluate_all();
        assert!(ws.plan_ready_to_advance());

        assert_eq!(ws.next_in_plan(), Some(id(1)));
        ws.queue_mut().enqueue(id(1), PendingKind::Evaluation);
        assert!(!ws.plan_ready_to_advance());

        let plan = ws.take_evaluate_all().unwrap();
        ws.halt_active_cells();
        ws.resume_evaluate_all(plan);
        assert!(ws.plan_waits_on(&id(1)));
        assert!(ws.plan_ready_to_advance());
        assert_eq!(ws.next_in_plan(), Some(id(2)));
    }
}
