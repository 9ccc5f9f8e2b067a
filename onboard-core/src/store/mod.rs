//! Persistence for tasks, pieces and deal attempts.
//!
//! Pieces are keyed on their own rather than nested in the task record, so
//! mutating one piece never locks its siblings. `update_piece` holds the
//! piece's entry lock across the mutation and its persistence.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::domain::{DealAttempt, DispatchMode, Piece, PieceId, Task, TaskId};
use crate::error::StoreError;

pub mod file;
pub mod journal;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

pub trait Store: Send + Sync {
    /// Insert or replace a task together with all of its pieces.
    fn put_task(&self, task: &Task) -> Result<(), StoreError>;
    fn get_task(&self, id: TaskId) -> Result<Task, StoreError>;
    fn task_ids(&self) -> Result<Vec<TaskId>, StoreError>;

    fn get_piece(&self, id: PieceId) -> Result<Piece, StoreError>;
    /// Apply `f` to the stored piece atomically and return the new value.
    fn update_piece(
        &self,
        id: PieceId,
        f: &mut dyn FnMut(&mut Piece),
    ) -> Result<Piece, StoreError>;

    fn append_attempt(&self, attempt: &DealAttempt) -> Result<(), StoreError>;
    /// Attempts of a piece in append order.
    fn attempts(&self, id: PieceId) -> Result<Vec<DealAttempt>, StoreError>;
}

/// Task row without its pieces.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub name: String,
    pub dataset_label: String,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub mode: DispatchMode,
    pub piece_ids: Vec<PieceId>,
}

impl TaskRecord {
    pub fn of(task: &Task) -> Self {
        Self {
            task_id: task.task_id,
            name: task.name.clone(),
            dataset_label: task.dataset_label.clone(),
            description: task.description.clone(),
            created_at: task.created_at,
            mode: task.mode,
            piece_ids: task.pieces.iter().map(|p| p.piece_id).collect(),
        }
    }

    fn with_pieces(&self, pieces: Vec<Piece>) -> Task {
        Task {
            task_id: self.task_id,
            name: self.name.clone(),
            dataset_label: self.dataset_label.clone(),
            description: self.description.clone(),
            created_at: self.created_at,
            mode: self.mode,
            pieces,
        }
    }
}

/// In-memory tables shared by both store implementations. Mutations take a
/// `commit` hook that runs while the entry lock is held.
#[derive(Default)]
pub(crate) struct Tables {
    tasks: DashMap<TaskId, TaskRecord>,
    pieces: DashMap<PieceId, Piece>,
    attempts: DashMap<PieceId, Vec<DealAttempt>>,
}

impl Tables {
    pub fn insert_task(&self, record: TaskRecord, pieces: &[Piece]) {
        for p in pieces {
            self.pieces.insert(p.piece_id, p.clone());
        }
        self.tasks.insert(record.task_id, record);
    }

    pub fn insert_attempts(&self, id: PieceId, attempts: Vec<DealAttempt>) {
        self.attempts.insert(id, attempts);
    }

    pub fn get_task(&self, id: TaskId) -> Result<Task, StoreError> {
        let record = self
            .tasks
            .get(&id)
            .map(|r| r.clone())
            .ok_or(StoreError::TaskNotFound(id))?;
        let pieces = record
            .piece_ids
            .iter()
            .map(|pid| self.get_piece(*pid))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(record.with_pieces(pieces))
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<_> = self.tasks.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    pub fn get_piece(&self, id: PieceId) -> Result<Piece, StoreError> {
        self.pieces
            .get(&id)
            .map(|p| p.clone())
            .ok_or(StoreError::PieceNotFound(id))
    }

    pub fn update_piece(
        &self,
        id: PieceId,
        f: &mut dyn FnMut(&mut Piece),
        commit: impl FnOnce(&Piece) -> Result<(), StoreError>,
    ) -> Result<Piece, StoreError> {
        let mut entry = self
            .pieces
            .get_mut(&id)
            .ok_or(StoreError::PieceNotFound(id))?;
        let mut next = entry.clone();
        f(&mut next);
        commit(&next)?;
        *entry = next.clone();
        Ok(next)
    }

    pub fn append_attempt(
        &self,
        attempt: &DealAttempt,
        commit: impl FnOnce(&DealAttempt) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        if !self.pieces.contains_key(&attempt.piece_id) {
            return Err(StoreError::PieceNotFound(attempt.piece_id));
        }
        let mut log = self.attempts.entry(attempt.piece_id).or_default();
        commit(attempt)?;
        log.push(attempt.clone());
        Ok(())
    }

    pub fn attempts(&self, id: PieceId) -> Vec<DealAttempt> {
        self.attempts
            .get(&id)
            .map(|l| l.clone())
            .unwrap_or_default()
    }
}
