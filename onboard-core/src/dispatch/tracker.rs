//! Deal state tracker: the append-only attempt log and the replica accounting
//! derived from it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, info};

use crate::domain::{CounterpartyId, DealAttempt, DealOutcome, Piece, PieceId, PieceStatus};
use crate::error::StoreError;
use crate::store::Store;

/// Snapshot of one piece as seen through its attempt log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PieceState {
    pub piece_id: PieceId,
    pub status: PieceStatus,
    pub replicas: BTreeSet<CounterpartyId>,
    /// Counterparties with an unresolved Pending attempt.
    pub pending: BTreeSet<CounterpartyId>,
    /// Every counterparty ever attempted, in first-attempt order.
    pub attempted: Vec<CounterpartyId>,
}

/// Log fold: outstanding Pending records plus distinct attempted counterparties.
pub(crate) struct LogView {
    pub pending: BTreeMap<CounterpartyId, DealAttempt>,
    pub attempted: Vec<CounterpartyId>,
    /// Accepted counterparties, in acceptance order.
    pub accepted: Vec<CounterpartyId>,
    pub rejected: BTreeSet<CounterpartyId>,
}

impl LogView {
    pub fn fold(log: &[DealAttempt]) -> Self {
        let mut view = LogView {
            pending: BTreeMap::new(),
            attempted: Vec::new(),
            accepted: Vec::new(),
            rejected: BTreeSet::new(),
        };
        for a in log {
            if !view.attempted.contains(&a.counterparty) {
                view.attempted.push(a.counterparty.clone());
            }
            match a.outcome {
                DealOutcome::Pending => {
                    view.pending.insert(a.counterparty.clone(), a.clone());
                }
                outcome => {
                    let resolves = view
                        .pending
                        .get(&a.counterparty)
                        .is_some_and(|p| a.attempted_at >= p.attempted_at);
                    if resolves {
                        view.pending.remove(&a.counterparty);
                    }
                    match outcome {
                        DealOutcome::Accepted if !view.accepted.contains(&a.counterparty) => {
                            view.accepted.push(a.counterparty.clone())
                        }
                        DealOutcome::Rejected => {
                            view.rejected.insert(a.counterparty.clone());
                        }
                        _ => {}
                    }
                }
            }
        }
        view
    }

    /// True if the log holds a terminal record.
    pub fn has_resolution(log: &[DealAttempt]) -> bool {
        log.iter().any(|a| a.outcome.is_terminal())
    }
}

pub struct DealTracker {
    store: Arc<dyn Store>,
}

impl DealTracker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Append `attempt` to the log, then fold an acceptance into the piece.
    ///
    /// A counterparty is added to the replicas at most once, and never past
    /// the piece's replication target.
    pub fn record(&self, attempt: &DealAttempt) -> Result<PieceState, StoreError> {
        self.store.append_attempt(attempt)?;
        let piece = if attempt.outcome == DealOutcome::Accepted {
            self.store.update_piece(attempt.piece_id, &mut |p| {
                if !p.current_replicas.contains(&attempt.counterparty) && !p.is_satisfied() {
                    p.current_replicas.insert(attempt.counterparty.clone());
                }
            })?
        } else {
            self.store.get_piece(attempt.piece_id)?
        };
        debug!(
            piece = %attempt.piece_id,
            counterparty = %attempt.counterparty,
            outcome = ?attempt.outcome,
            replicas = piece.current_replicas.len(),
            "attempt recorded"
        );
        self.state_of(piece)
    }

    pub fn query(&self, piece_id: PieceId) -> Result<PieceState, StoreError> {
        let piece = self.store.get_piece(piece_id)?;
        self.state_of(piece)
    }

    /// Rebuild `current_replicas` from the Accepted records of the log.
    pub fn recover(&self, piece_id: PieceId) -> Result<PieceState, StoreError> {
        let view = LogView::fold(&self.store.attempts(piece_id)?);
        let piece = self.store.update_piece(piece_id, &mut |p| {
            for cp in &view.accepted {
                if p.is_satisfied() {
                    break;
                }
                p.current_replicas.insert(cp.clone());
            }
            if p.is_satisfied() {
                p.status = PieceStatus::Satisfied;
            }
        })?;
        self.state_of(piece)
    }

    /// Resolve Pending records older than `max_age` as Expired. These are
    /// attempts whose outcome was lost, e.g. to a crash mid-round.
    pub fn expire_stale(&self, piece_id: PieceId, max_age: Duration) -> Result<usize, StoreError> {
        let view = LogView::fold(&self.store.attempts(piece_id)?);
        let cutoff = OffsetDateTime::now_utc() - max_age;
        let mut expired = 0;
        for pending in view.pending.values() {
            if pending.attempted_at <= cutoff {
                self.store
                    .append_attempt(&pending.resolve(DealOutcome::Expired))?;
                expired += 1;
            }
        }
        if expired > 0 {
            info!(piece = %piece_id, expired, "expired stale pending attempts");
        }
        Ok(expired)
    }

    fn state_of(&self, piece: Piece) -> Result<PieceState, StoreError> {
        let view = LogView::fold(&self.store.attempts(piece.piece_id)?);
        Ok(PieceState {
            piece_id: piece.piece_id,
            status: piece.status,
            replicas: piece.current_replicas,
            pending: view.pending.into_keys().collect(),
            attempted: view.attempted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DispatchMode;
    use crate::store::{MemoryStore, testing};

    fn setup(target: u32) -> (DealTracker, PieceId) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let task = testing::task(DispatchMode::Auto, 1, target);
        store.put_task(&task).unwrap();
        (DealTracker::new(store), task.pieces[0].piece_id)
    }

    fn cp(s: &str) -> CounterpartyId {
        CounterpartyId::new(s)
    }

    #[test]
    fn accepted_twice_counts_once() {
        let (tracker, id) = setup(3);
        let a = DealAttempt::pending(id, cp("f01"));
        tracker.record(&a).unwrap();
        tracker.record(&a.resolve(DealOutcome::Accepted)).unwrap();
        let state = tracker.record(&a.resolve(DealOutcome::Accepted)).unwrap();

        assert_eq!(state.replicas.len(), 1);
        assert!(state.pending.is_empty());
        assert_eq!(state.attempted, vec![cp("f01")]);
        assert_eq!(tracker.store().attempts(id).unwrap().len(), 3);
    }

    #[test]
    fn replicas_never_exceed_target() {
        let (tracker, id) = setup(2);
        for name in ["f01", "f02", "f03"] {
            let a = DealAttempt::pending(id, cp(name));
            tracker.record(&a.resolve(DealOutcome::Accepted)).unwrap();
        }
        let state = tracker.query(id).unwrap();
        assert_eq!(
            state.replicas,
            BTreeSet::from([cp("f01"), cp("f02")])
        );
    }

    #[test]
    fn pending_until_resolved() {
        let (tracker, id) = setup(2);
        let a = DealAttempt::pending(id, cp("f01"));
        let b = DealAttempt::pending(id, cp("f02"));
        tracker.record(&a).unwrap();
        tracker.record(&b).unwrap();
        let state = tracker.record(&b.resolve(DealOutcome::Rejected)).unwrap();
        assert_eq!(state.pending, BTreeSet::from([cp("f01")]));
        assert!(state.replicas.is_empty());
    }

    #[test]
    fn recover_rebuilds_replicas_from_log() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let task = testing::task(DispatchMode::Auto, 1, 2);
        store.put_task(&task).unwrap();
        let id = task.pieces[0].piece_id;
        // log written, piece update lost
        for name in ["f01", "f02"] {
            let a = DealAttempt::pending(id, cp(name));
            store.append_attempt(&a).unwrap();
            store.append_attempt(&a.resolve(DealOutcome::Accepted)).unwrap();
        }

        let tracker = DealTracker::new(store);
        let state = tracker.recover(id).unwrap();
        assert_eq!(state.replicas.len(), 2);
        assert_eq!(state.status, PieceStatus::Satisfied);
    }

    #[test]
    fn stale_pending_is_expired() {
        let (tracker, id) = setup(1);
        let mut old = DealAttempt::pending(id, cp("f01"));
        old.attempted_at -= Duration::from_secs(600);
        tracker.record(&old).unwrap();
        tracker.record(&DealAttempt::pending(id, cp("f02"))).unwrap();

        assert_eq!(tracker.expire_stale(id, Duration::from_secs(120)).unwrap(), 1);
        let state = tracker.query(id).unwrap();
        assert_eq!(state.pending, BTreeSet::from([cp("f02")]));
        assert_eq!(tracker.expire_stale(id, Duration::from_secs(120)).unwrap(), 0);
    }
}
