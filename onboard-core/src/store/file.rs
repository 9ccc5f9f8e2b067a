use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::journal::{self, Journal};
use super::{Store, TaskRecord, Tables};
use crate::domain::{DealAttempt, Piece, PieceId, Task, TaskId};
use crate::error::StoreError;

/// Directory-backed store.
///
/// ```text
/// <root>/tasks/<task_id>.json     task record
/// <root>/pieces/<piece_id>.json   piece document
/// <root>/attempts/<piece_id>.log  attempt journal
/// ```
///
/// Documents are replaced atomically (temp file + rename). Everything is read
/// into memory on open.
pub struct FileStore {
    root: PathBuf,
    tables: Tables,
    journals: DashMap<PieceId, Journal>,
}

impl FileStore {
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        for sub in ["tasks", "pieces", "attempts"] {
            fs::create_dir_all(root.join(sub))?;
        }
        let store = Self {
            root: root.to_path_buf(),
            tables: Tables::default(),
            journals: DashMap::new(),
        };

        let mut tasks = 0usize;
        for path in json_files(&root.join("tasks"))? {
            let record: TaskRecord = read_json(&path)?;
            let pieces = record
                .piece_ids
                .iter()
                .map(|id| read_json::<Piece>(&store.piece_path(*id)))
                .collect::<Result<Vec<_>, _>>()?;
            for p in &pieces {
                let attempts = journal::read_all(&store.journal_path(p.piece_id))?;
                store.tables.insert_attempts(p.piece_id, attempts);
            }
            store.tables.insert_task(record, &pieces);
            tasks += 1;
        }
        debug!(root = %root.display(), tasks, "opened file store");
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn task_path(&self, id: TaskId) -> PathBuf {
        self.root.join("tasks").join(format!("{id}.json"))
    }

    fn piece_path(&self, id: PieceId) -> PathBuf {
        self.root.join("pieces").join(format!("{id}.json"))
    }

    fn journal_path(&self, id: PieceId) -> PathBuf {
        self.root.join("attempts").join(format!("{id}.log"))
    }
}

fn json_files(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut out = Vec::new();
    for e in fs::read_dir(dir)? {
        let p = e?.path();
        if p.extension().is_some_and(|x| x == "json") {
            out.push(p);
        }
    }
    out.sort();
    Ok(out)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let dir = path
        .parent()
        .ok_or_else(|| StoreError::Encoding(format!("no parent for {}", path.display())))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

impl Store for FileStore {
    fn put_task(&self, task: &Task) -> Result<(), StoreError> {
        for p in &task.pieces {
            write_json(&self.piece_path(p.piece_id), p)?;
        }
        let record = TaskRecord::of(task);
        // record last, so it never names a piece that is not on disk
        write_json(&self.task_path(task.task_id), &record)?;
        self.tables.insert_task(record, &task.pieces);
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
        let path = self.piece_path(id);
        self.tables.update_piece(id, f, |p| write_json(&path, p))
    }

    fn append_attempt(&self, attempt: &DealAttempt) -> Result<(), StoreError> {
        self.tables.append_attempt(attempt, |a| {
            let mut j = self
                .journals
                .entry(a.piece_id)
                .or_try_insert_with(|| Journal::open(&self.journal_path(a.piece_id)))?;
            j.append(a)
        })
    }

    fn attempts(&self, id: PieceId) -> Result<Vec<DealAttempt>, StoreError> {
        Ok(self.tables.attempts(id))
    }
}
