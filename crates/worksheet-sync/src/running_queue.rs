use serde::Serialize;
use std::collections::VecDeque;
use ts_rs::TS;

use crate::CellId;

/// Why a cell is waiting on the server
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum PendingKind {
    /// Submitted for evaluation
    Evaluation,
    /// Waiting for completions or a docstring
    Introspection,
}

/// A cell whose computation is in flight server-side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEvaluation {
    pub id: CellId,
    pub kind: PendingKind,
}

/// A cell in the running queue as shown to the view layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, TS)]
#[ts(export)]
pub struct QueuedCell {
    pub cell_id: CellId,
    pub kind: PendingKind,
    /// Position in queue (0 = currently polled)
    pub position: usize,
}

/// Queue state emitted to the view layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, TS)]
#[ts(export)]
pub struct RunningQueueState {
    /// Is anything in flight?
    pub processing: bool,
    pub cells: Vec<QueuedCell>,
    /// ID of the cell the poller is asking about (if any)
    pub polled_cell_id: Option<CellId>,
}

/// Ordered set of cells in flight. The earliest entry is the one polled.
#[derive(Debug, Default)]
pub struct RunningQueue {
    entries: VecDeque<PendingEvaluation>,
}

impl RunningQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a cell. Returns false (and changes nothing) if it is already
    /// queued.
    pub fn enqueue(&mut self, id: CellId, kind: PendingKind) -> bool {
        if self.contains(&id) {
            return false;
        }
        self.entries.push_back(PendingEvaluation { id, kind });
        true
    }

    /// The cell to poll next
    pub fn front(&self) -> Option<&PendingEvaluation> {
        self.entries.front()
    }

    pub fn contains(&self, id: &CellId) -> bool {
        self.entries.iter().any(|e| &e.id == id)
    }

    pub fn kind_of(&self, id: &CellId) -> Option<PendingKind> {
        self.entries.iter().find(|e| &e.id == id).map(|e| e.kind)
    }

    /// Remove a cell wherever it sits in the queue
    pub fn remove(&mut self, id: &CellId) -> Option<PendingEvaluation> {
        let index = self.entries.iter().position(|e| &e.id == id)?;
        self.entries.remove(index)
    }

    /// Empty the queue, returning what was in it
    pub fn drain(&mut self) -> Vec<PendingEvaluation> {
        self.entries.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = &CellId> {
        self.entries.iter().map(|e| &e.id)
    }

    /// Get current state for the view layer
    pub fn get_state(&self) -> RunningQueueState {
        let cells = self
            .entries
            .iter()
            .enumerate()
            .map(|(position, entry)| QueuedCell {
                cell_id: entry.id.clone(),
                kind: entry.kind,
                position,
            })
            .collect();

        RunningQueueState {
            processing: !self.entries.is_empty(),
            cells,
            polled_cell_id: self.front().map(|e| e.id.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: i64) -> CellId {
        CellId::Number(n)
    }

    #[test]
    fn test_enqueue_preserves_order() {
        let mut queue = RunningQueue::new();
        queue.enqueue(id(1), PendingKind::Evaluation);
        queue.enqueue(id(2), PendingKind::Introspection);
        queue.enqueue(id(3), PendingKind::Evaluation);

        assert_eq!(queue.front().map(|e| e.id.clone()), Some(id(1)));
        assert_eq!(queue.ids().cloned().collect::<Vec<_>>(), vec![id(1), id(2), id(3)]);
    }

    #[test]
    fn test_enqueue_is_a_set() {
        let mut queue = RunningQueue::new();
        assert!(queue.enqueue(id(5), PendingKind::Evaluation));
        assert!(!queue.enqueue(id(5), PendingKind::Introspection));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.kind_of(&id(5)), Some(PendingKind::Evaluation));
    }

    #[test]
    fn test_remove_from_middle() {
        let mut queue = RunningQueue::new();
        queue.enqueue(id(1), PendingKind::Evaluation);
        queue.enqueue(id(2), PendingKind::Evaluation);
        queue.enqueue(id(3), PendingKind::Evaluation);

        assert!(queue.remove(&id(2)).is_some());
        assert!(queue.remove(&id(2)).is_none());
        assert_eq!(queue.ids().cloned().collect::<Vec<_>>(), vec![id(1), id(3)]);
    }

    #[test]
    fn test_drain_empties_queue() {
        let mut queue = RunningQueue::new();
        queue.enqueue(id(1), PendingKind::Evaluation);
        queue.enqueue(id(2), PendingKind::Evaluation);

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_get_state() {
        let mut queue = RunningQueue::new();
        queue.enqueue(id(1), PendingKind::Evaluation);
        queue.enqueue(id(2), PendingKind::Introspection);

        let state = queue.get_state();
        assert!(state.processing);
        assert_eq!(state.cells.len(), 2);
        assert_eq!(state.polled_cell_id, Some(id(1)));
        assert_eq!(state.cells[0].position, 0);
        assert_eq!(state.cells[1].position, 1);
        assert_eq!(state.cells[1].kind, PendingKind::Introspection);
    }

    #[test]
    fn test_empty_state() {
        let queue = RunningQueue::new();
        let state = queue.get_state();
        assert!(!state.processing);
        assert!(state.cells.is_empty());
        assert!(state.polled_cell_id.is_none());
    }
}
