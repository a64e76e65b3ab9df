//! Undo/redo of history edits
//!
//! Each record holds the history before and after one edit. Undo restores
//! `before`, redo restores `after`; recording a new edit clears redo.

use super::history::HistoryStack;
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq)]
pub struct UndoRecord {
    pub before: HistoryStack,
    pub after: HistoryStack,
}

#[derive(Debug, Clone)]
pub struct UndoStack {
    undo: VecDeque<UndoRecord>,
    redo: Vec<UndoRecord>,
    depth: usize,
}

impl UndoStack {
    pub fn new(depth: usize) -> Self {
        UndoStack {
            undo: VecDeque::new(),
            redo: Vec::new(),
            depth: depth.max(1),
        }
    }

    /// Record an edit. No-op edits are not recorded.
    pub fn record(&mut self, before: HistoryStack, after: HistoryStack) {
        if before == after {
            return;
        }
        self.redo.clear();
        self.undo.push_back(UndoRecord { before, after });
        while self.undo.len() > self.depth {
            self.undo.pop_front();
        }
    }

    /// History to restore for an undo.
    pub fn undo(&mut self) -> Option<HistoryStack> {
        let record = self.undo.pop_back()?;
        let before = record.before.clone();
        self.redo.push(record);
        Some(before)
    }

    /// History to restore for a redo.
    pub fn redo(&mut self) -> Option<HistoryStack> {
        let record = self.redo.pop()?;
        let after = record.after.clone();
        self.undo.push_back(record);
        Some(after)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }
}
