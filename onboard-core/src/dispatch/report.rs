use std::fmt;

use crate::domain::{PieceStatus, TaskId};
use crate::error::{DispatchError, FailedPiece};

#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub task_id: TaskId,
    pub total: usize,
    pub satisfied: usize,
    pub partial: usize,
    pub failed: Vec<FailedPiece>,
    /// Pieces still New or Dispatching after the pass.
    pub incomplete: usize,
}

impl DispatchReport {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            total: 0,
            satisfied: 0,
            partial: 0,
            failed: Vec::new(),
            incomplete: 0,
        }
    }

    pub(crate) fn count(&mut self, status: PieceStatus, failure: impl FnOnce() -> FailedPiece) {
        self.total += 1;
        match status {
            PieceStatus::Satisfied => self.satisfied += 1,
            PieceStatus::PartiallySatisfied => self.partial += 1,
            PieceStatus::Failed => self.failed.push(failure()),
            PieceStatus::New | PieceStatus::Dispatching => self.incomplete += 1,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.satisfied == self.total
    }

    /// Any Failed piece turns the report into [`DispatchError::PiecesFailed`];
    /// pieces left New or Dispatching into [`DispatchError::PiecesUnfinished`].
    pub fn into_result(self) -> Result<Self, DispatchError> {
        if !self.failed.is_empty() {
            return Err(DispatchError::PiecesFailed {
                task_id: self.task_id,
                failed: self.failed,
            });
        }
        if self.incomplete > 0 {
            return Err(DispatchError::PiecesUnfinished {
                task_id: self.task_id,
                pending: self.incomplete,
            });
        }
        Ok(self)
    }
}

impl fmt::Display for DispatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task {}: {}/{} satisfied, {} partial, {} failed, {} pending",
            self.task_id,
            self.satisfied,
            self.total,
            self.partial,
            self.failed.len(),
            self.incomplete
        )
    }
}
