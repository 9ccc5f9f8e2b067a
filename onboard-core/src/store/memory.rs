use super::{Store, TaskRecord, Tables};
use crate::domain::{DealAttempt, Piece, PieceId, Task, TaskId};
use crate::error::StoreError;

/// Volatile store; state lives for the life of the process.
#[derive(Default)]
pub struct MemoryStore {
    tables: Tables,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn put_task(&self, task: &Task) -> Result<(), StoreError> {
        self.tables.insert_task(TaskRecord::of(task), &task.pieces);
        Ok(())
    }

    fn get_task(&self, id: TaskId) -> Result<Task, StoreError> {
        self.tables.get_task(id)
    }

    fn task_ids(&self) -> Result<Vec<TaskId>, StoreError> {
        Ok(self.tables.task_ids())
    }

    fn get_piece(&self, id: PieceId) -> Result<Piece, StoreError> {
        self.tables.get_piece(id)
    }

    fn update_piece(
        &self,
        id: PieceId,
        f: &mut dyn FnMut(&mut Piece),
    ) -> Result<Piece, StoreError> {
        self.tables.update_piece(id, f, |_| Ok(()))
    }

    fn append_attempt(&self, attempt: &DealAttempt) -> Result<(), StoreError> {
        self.tables.append_attempt(attempt, |_| Ok(()))
    }

    fn attempts(&self, id: PieceId) -> Result<Vec<DealAttempt>, StoreError> {
        Ok(self.tables.attempts(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CounterpartyId, DispatchMode, PieceStatus};
    use crate::store::testing;
    use std::sync::Arc;

    #[test]
    fn task_round_trips_with_pieces_in_order() {
        let store = MemoryStore::new();
        let task = testing::task(DispatchMode::Auto, 3, 2);
        store.put_task(&task).unwrap();
        assert_eq!(store.get_task(task.task_id).unwrap(), task);
        assert_eq!(store.task_ids().unwrap(), vec![task.task_id]);
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get_task(TaskId::new()),
            Err(StoreError::TaskNotFound(_))
        ));
        let attempt = DealAttempt::pending(PieceId::new(), CounterpartyId::new("f01"));
        assert!(matches!(
            store.append_attempt(&attempt),
            Err(StoreError::PieceNotFound(_))
        ));
    }

    #[test]
    fn concurrent_updates_to_one_piece_are_serialized() {
        let store = Arc::new(MemoryStore::new());
        let task = testing::task(DispatchMode::Auto, 1, 1000);
        store.put_task(&task).unwrap();
        let id = task.pieces[0].piece_id;

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        store
                            .update_piece(id, &mut |p| {
                                p.current_replicas
                                    .insert(CounterpartyId::new(format!("f{t}-{i}")));
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.get_piece(id).unwrap().current_replicas.len(), 400);
    }

    #[test]
    fn update_returns_new_value() {
        let store = MemoryStore::new();
        let task = testing::task(DispatchMode::Manual, 1, 1);
        store.put_task(&task).unwrap();
        let id = task.pieces[0].piece_id;
        let p = store
            .update_piece(id, &mut |p| p.status = PieceStatus::Dispatching)
            .unwrap();
        assert_eq!(p.status, PieceStatus::Dispatching);
        assert_eq!(store.get_task(task.task_id).unwrap().pieces[0].status, PieceStatus::Dispatching);
    }
}
