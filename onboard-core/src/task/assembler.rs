use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use time::OffsetDateTime;
use tracing::info;

use crate::domain::{
    ArchiveDescriptor, CounterpartyId, DispatchMode, Piece, PieceId, PieceStatus, Task, TaskId,
};
use crate::error::{ConfigError, Result};
use crate::store::Store;

pub const DEFAULT_MAX_COPY_NUMBER: u32 = 8;

#[derive(Clone, Debug, Default)]
pub struct TaskParams {
    /// Blank names are replaced by `task-<first 8 hex of the task id>`.
    pub name: String,
    pub miner_id: Option<String>,
    pub dataset_label: String,
    pub description: String,
    pub mode: Option<DispatchMode>,
    pub max_copy_number: u32,
}

/// Resolve the dispatch mode against the miner flag. Manual needs a miner;
/// auto must not have one.
pub fn resolve_mode(
    mode: Option<DispatchMode>,
    miner: Option<&str>,
) -> std::result::Result<(DispatchMode, Option<CounterpartyId>), ConfigError> {
    let miner = CounterpartyId::parse_opt(miner);
    match (mode, miner) {
        (Some(DispatchMode::Manual), Some(m)) => Ok((DispatchMode::Manual, Some(m))),
        (Some(DispatchMode::Auto), None) => Ok((DispatchMode::Auto, None)),
        (Some(DispatchMode::Manual), None) => Err(ConfigError::InvalidModeCombination(
            "manual dispatch requires a miner id".into(),
        )),
        (Some(DispatchMode::Auto), Some(m)) => Err(ConfigError::InvalidModeCombination(format!(
            "auto dispatch cannot target miner {m}"
        ))),
        (None, _) => Err(ConfigError::InvalidModeCombination(
            "dispatch mode not set".into(),
        )),
    }
}

/// Build a task with one piece per descriptor and persist it.
pub fn assemble(
    descriptors: Vec<ArchiveDescriptor>,
    params: TaskParams,
    store: &dyn Store,
) -> Result<Task> {
    let (mode, miner) = resolve_mode(params.mode, params.miner_id.as_deref())?;
    if mode == DispatchMode::Auto && params.max_copy_number == 0 {
        return Err(ConfigError::InvalidReplicationTarget(0).into());
    }
    if descriptors.is_empty() {
        return Err(ConfigError::NoArchives.into());
    }

    let task_id = TaskId::new();
    let target = match mode {
        DispatchMode::Auto => params.max_copy_number,
        DispatchMode::Manual => 1,
    };
    let pieces = descriptors
        .into_iter()
        .map(|archive| Piece {
            piece_id: PieceId::new(),
            task_id,
            archive,
            replication_target: target,
            current_replicas: BTreeSet::new(),
            status: PieceStatus::New,
            target_counterparty: miner.clone(),
        })
        .collect::<Vec<_>>();

    let name = if params.name.trim().is_empty() {
        let hex = task_id.0.simple().to_string();
        format!("task-{}", &hex[..8])
    } else {
        params.name.trim().to_string()
    };

    let task = Task {
        task_id,
        name,
        dataset_label: params.dataset_label,
        description: params.description,
        created_at: OffsetDateTime::now_utc(),
        mode,
        pieces,
    };
    store.put_task(&task)?;
    info!(
        task = %task.task_id,
        name = %task.name,
        mode = ?task.mode,
        pieces = task.pieces.len(),
        target,
        "task assembled"
    );
    Ok(task)
}

/// Write `<dir>/<task_id>.json`.
pub fn export_task(task: &Task, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.json", task.task_id));
    fs::write(&path, serde_json::to_vec_pretty(task)?)?;
    Ok(path)
}
