use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::market::DealMarket;
use super::report::DispatchReport;
use super::tracker::{DealTracker, LogView};
use super::{DispatchOptions, RunMode};
use crate::domain::{
    CounterpartyId, DealAttempt, DealOutcome, DispatchMode, Piece, PieceId, PieceStatus, TaskId,
};
use crate::error::{DispatchError, FailedPiece};
use crate::store::Store;

/// Drives pieces of a task through negotiation rounds.
///
/// Cheap to clone; all state lives in the store.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn Store>,
    tracker: Arc<DealTracker>,
    market: Arc<dyn DealMarket>,
    opts: DispatchOptions,
}

/// Final state of one piece after a pass.
struct PieceRun {
    piece: Piece,
    reason: Option<String>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>, market: Arc<dyn DealMarket>, opts: DispatchOptions) -> Self {
        Self {
            tracker: Arc::new(DealTracker::new(store.clone())),
            store,
            market,
            opts,
        }
    }

    pub fn tracker(&self) -> &DealTracker {
        &self.tracker
    }

    /// Run one pass over every piece of the task. Pieces are dispatched
    /// concurrently, at most `piece_concurrency` at a time.
    pub async fn dispatch_task(
        &self,
        task_id: TaskId,
        run: RunMode,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport, DispatchError> {
        let task = self.store.get_task(task_id)?;
        info!(task = %task_id, mode = ?task.mode, pieces = task.pieces.len(), ?run, "dispatching task");

        let limit = Arc::new(Semaphore::new(self.opts.piece_concurrency.max(1)));
        let mut pieces = JoinSet::new();
        for piece in &task.pieces {
            let permit = limit
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| DispatchError::Join(e.to_string()))?;
            let this = self.clone();
            let cancel = cancel.clone();
            let (piece_id, mode) = (piece.piece_id, task.mode);
            pieces.spawn(async move {
                let _permit = permit;
                let res = match mode {
                    DispatchMode::Manual => this.dispatch_manual(piece_id, &cancel).await,
                    DispatchMode::Auto => this.dispatch_auto(piece_id, run, &cancel).await,
                };
                (piece_id, res)
            });
        }

        let mut report = DispatchReport::new(task_id);
        let mut first_err = None;
        while let Some(joined) = pieces.join_next().await {
            let (piece_id, res) = match joined {
                Ok(v) => v,
                Err(e) => {
                    error!(task = %task_id, error = %e, "piece dispatch panicked");
                    first_err.get_or_insert(DispatchError::Join(e.to_string()));
                    continue;
                }
            };
            match res {
                Ok(PieceRun { piece, reason }) => {
                    let attempted = match self.tracker.query(piece_id) {
                        Ok(s) => s.attempted,
                        Err(e) => {
                            error!(task = %task_id, piece = %piece_id, error = %e, "attempt log unreadable");
                            first_err.get_or_insert(e.into());
                            continue;
                        }
                    };
                    report.count(piece.status, || FailedPiece {
                        piece_id,
                        attempted,
                        reason: reason.unwrap_or_else(|| "no replica obtained".into()),
                    });
                }
                Err(e) => {
                    error!(task = %task_id, piece = %piece_id, error = %e, "piece dispatch failed");
                    first_err.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }

        info!(
            task = %task_id,
            satisfied = report.satisfied,
            partial = report.partial,
            failed = report.failed.len(),
            incomplete = report.incomplete,
            total = report.total,
            "dispatch pass finished"
        );
        Ok(report)
    }

    fn set_status(&self, id: PieceId, status: PieceStatus) -> Result<Piece, DispatchError> {
        Ok(self.store.update_piece(id, &mut |p| p.status = status)?)
    }

    async fn dispatch_manual(
        &self,
        id: PieceId,
        cancel: &CancellationToken,
    ) -> Result<PieceRun, DispatchError> {
        let piece = self.store.get_piece(id)?;
        if piece.status.is_terminal() {
            return Ok(PieceRun { piece, reason: None });
        }
        let Some(target) = piece.target_counterparty.clone() else {
            let piece = self.set_status(id, PieceStatus::Failed)?;
            return Ok(PieceRun {
                piece,
                reason: Some("manual piece has no target counterparty".into()),
            });
        };

        self.tracker.expire_stale(id, self.opts.deal_timeout)?;
        let log = self.store.attempts(id)?;
        if LogView::has_resolution(&log) {
            // resolved in an earlier pass; settle the status from the log
            let state = self.tracker.recover(id)?;
            if state.replicas.contains(&target) {
                let piece = self.set_status(id, PieceStatus::Satisfied)?;
                return Ok(PieceRun { piece, reason: None });
            }
            let piece = self.set_status(id, PieceStatus::Failed)?;
            return Ok(PieceRun {
                piece,
                reason: Some(format!("earlier attempt to {target} did not succeed")),
            });
        }
        if cancel.is_cancelled() {
            return Ok(PieceRun { piece, reason: None });
        }

        let piece = self.set_status(id, PieceStatus::Dispatching)?;
        let pending = DealAttempt::pending(id, target.clone());
        self.tracker.record(&pending)?;
        let (outcome, why) = propose(
            self.market.clone(),
            piece,
            target.clone(),
            self.opts.deal_timeout,
        )
        .await;
        let state = self.tracker.record(&pending.resolve(outcome))?;

        let status = if state.replicas.contains(&target) {
            PieceStatus::Satisfied
        } else {
            PieceStatus::Failed
        };
        let piece = self.set_status(id, status)?;
        info!(piece = %id, counterparty = %target, ?outcome, "manual deal finished");
        Ok(PieceRun {
            piece,
            reason: why,
        })
    }

    async fn dispatch_auto(
        &self,
        id: PieceId,
        run: RunMode,
        cancel: &CancellationToken,
    ) -> Result<PieceRun, DispatchError> {
        let piece = self.store.get_piece(id)?;
        if piece.status.is_terminal() {
            return Ok(PieceRun { piece, reason: None });
        }

        self.tracker.expire_stale(id, self.opts.deal_timeout)?;
        self.tracker.recover(id)?;
        let mut piece = self.store.get_piece(id)?;
        let mut rejected: BTreeSet<CounterpartyId> = BTreeSet::new();
        let mut reason = None;
        let mut exhausted = true;

        for round in 1..=self.opts.max_rounds {
            if piece.is_satisfied() {
                break;
            }
            if cancel.is_cancelled() {
                debug!(piece = %id, round, "cancelled before round");
                exhausted = false;
                break;
            }
            piece = self.set_status(id, PieceStatus::Dispatching)?;

            let state = self.tracker.query(id)?;
            let excluding: BTreeSet<CounterpartyId> =
                state.replicas.union(&state.pending).cloned().collect();
            let slots = piece.remaining_slots();

            let eligible = match self.market.list_eligible(&piece, &excluding).await {
                Ok(e) => e,
                Err(e) => {
                    warn!(piece = %id, round, error = %e, "eligibility lookup failed");
                    reason = Some(format!("eligibility lookup failed: {e}"));
                    exhausted = false;
                    break;
                }
            };
            let mut picks: Vec<CounterpartyId> = Vec::new();
            for cp in eligible {
                if picks.len() == slots {
                    break;
                }
                if excluding.contains(&cp) || rejected.contains(&cp) || picks.contains(&cp) {
                    continue;
                }
                picks.push(cp);
            }

            if picks.is_empty() {
                let status = if !piece.current_replicas.is_empty() {
                    PieceStatus::PartiallySatisfied
                } else if run == RunMode::OneShot {
                    PieceStatus::Failed
                } else {
                    PieceStatus::Dispatching
                };
                if reason.is_none() {
                    reason = Some("no eligible counterparty left".into());
                }
                debug!(piece = %id, round, ?status, "no candidates");
                piece = self.set_status(id, status)?;
                return Ok(PieceRun { piece, reason });
            }

            debug!(piece = %id, round, slots, candidates = picks.len(), "starting round");
            let mut attempts = JoinSet::new();
            for cp in picks {
                let pending = DealAttempt::pending(id, cp.clone());
                self.tracker.record(&pending)?;
                let market = self.market.clone();
                let snapshot = piece.clone();
                let limit = self.opts.deal_timeout;
                attempts.spawn(async move {
                    let (outcome, why) = propose(market, snapshot, cp, limit).await;
                    (pending, outcome, why)
                });
            }
            // drain every attempt before deciding on the next round
            while let Some(joined) = attempts.join_next().await {
                let (pending, outcome, why) = match joined {
                    Ok(v) => v,
                    Err(e) => {
                        error!(piece = %id, error = %e, "deal attempt panicked");
                        continue;
                    }
                };
                if outcome == DealOutcome::Rejected {
                    rejected.insert(pending.counterparty.clone());
                }
                if why.is_some() {
                    reason = why;
                }
                self.tracker.record(&pending.resolve(outcome))?;
            }

            piece = self.store.get_piece(id)?;
            let status = if piece.is_satisfied() {
                PieceStatus::Satisfied
            } else if piece.current_replicas.is_empty() {
                PieceStatus::Dispatching
            } else {
                PieceStatus::PartiallySatisfied
            };
            piece = self.set_status(id, status)?;
        }

        if piece.is_satisfied() && piece.status != PieceStatus::Satisfied {
            piece = self.set_status(id, PieceStatus::Satisfied)?;
        } else if run == RunMode::OneShot && exhausted && piece.current_replicas.is_empty() {
            // every round ended without an acceptance, usually timeouts
            let last = reason.unwrap_or_else(|| "no answer".into());
            reason = Some(format!(
                "no replica after {} round(s); last: {last}",
                self.opts.max_rounds
            ));
            warn!(piece = %id, rounds = self.opts.max_rounds, "rounds exhausted without a replica");
            piece = self.set_status(id, PieceStatus::Failed)?;
        }
        Ok(PieceRun { piece, reason })
    }

    /// One pass over every Auto task that still has unfinished pieces.
    pub async fn poll_once(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<DispatchReport>, DispatchError> {
        let mut reports = Vec::new();
        for task_id in self.store.task_ids()? {
            if cancel.is_cancelled() {
                break;
            }
            let task = self.store.get_task(task_id)?;
            if task.mode != DispatchMode::Auto || task.is_complete() {
                continue;
            }
            match self.dispatch_task(task_id, RunMode::Continuous, cancel).await {
                Ok(r) => reports.push(r),
                Err(e) => error!(task = %task_id, error = %e, "polling pass failed for task"),
            }
        }
        Ok(reports)
    }

    /// Poll every `poll_interval` until `cancel` fires. A pass in progress
    /// finishes before the loop exits.
    pub async fn run_polling(&self, cancel: CancellationToken) {
        info!(interval = ?self.opts.poll_interval, "dispatch polling started");
        loop {
            match self.poll_once(&cancel).await {
                Ok(reports) if !reports.is_empty() => {
                    debug!(tasks = reports.len(), "polling pass done");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "polling pass failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.opts.poll_interval) => {}
            }
        }
        info!("dispatch polling stopped");
    }

    pub fn spawn_polling(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run_polling(cancel).await })
    }
}

/// One proposal under `limit`. Timeouts and transport errors count as
/// Expired; the second value explains a non-acceptance.
async fn propose(
    market: Arc<dyn DealMarket>,
    piece: Piece,
    counterparty: CounterpartyId,
    limit: Duration,
) -> (DealOutcome, Option<String>) {
    match tokio::time::timeout(limit, market.propose_deal(&piece, &counterparty)).await {
        Ok(Ok(DealOutcome::Accepted)) => (DealOutcome::Accepted, None),
        Ok(Ok(DealOutcome::Rejected)) | Ok(Err(DispatchError::Rejected { .. })) => (
            DealOutcome::Rejected,
            Some(format!("rejected by {counterparty}")),
        ),
        Ok(Ok(other)) => (
            DealOutcome::Expired,
            Some(format!("{counterparty} answered {other:?}")),
        ),
        Ok(Err(e)) => {
            warn!(piece = %piece.piece_id, %counterparty, error = %e, "deal proposal failed");
            (DealOutcome::Expired, Some(e.to_string()))
        }
        Err(_) => {
            let e = DispatchError::Timeout { counterparty };
            warn!(piece = %piece.piece_id, error = %e, "deal proposal timed out");
            (DealOutcome::Expired, Some(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::tracker::PieceState;
    use crate::error::StoreError;
    use crate::store::{MemoryStore, testing};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers from a fixed script. Unknown counterparties reject.
    #[derive(Default)]
    struct ScriptedMarket {
        pool: Vec<&'static str>,
        answers: HashMap<&'static str, DealOutcome>,
        slow: BTreeSet<&'static str>,
        eligibility_calls: AtomicUsize,
        proposals: Mutex<Vec<String>>,
    }

    impl ScriptedMarket {
        fn new(pool: &[&'static str], answers: &[(&'static str, DealOutcome)]) -> Self {
            Self {
                pool: pool.to_vec(),
                answers: answers.iter().copied().collect(),
                ..Default::default()
            }
        }

        fn proposals(&self) -> Vec<String> {
            self.proposals.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DealMarket for ScriptedMarket {
        async fn list_eligible(
            &self,
            _piece: &Piece,
            excluding: &BTreeSet<CounterpartyId>,
        ) -> Result<Vec<CounterpartyId>, DispatchError> {
            self.eligibility_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .pool
                .iter()
                .map(|s| CounterpartyId::new(*s))
                .filter(|c| !excluding.contains(c))
                .collect())
        }

        async fn propose_deal(
            &self,
            _piece: &Piece,
            counterparty: &CounterpartyId,
        ) -> Result<DealOutcome, DispatchError> {
            self.proposals
                .lock()
                .unwrap()
                .push(counterparty.to_string());
            if self.slow.contains(counterparty.as_str()) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(self
                .answers
                .get(counterparty.as_str())
                .copied()
                .unwrap_or(DealOutcome::Rejected))
        }
    }

    fn opts() -> DispatchOptions {
        DispatchOptions {
            deal_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(20),
            max_rounds: 8,
            piece_concurrency: 2,
        }
    }

    fn setup(
        mode: DispatchMode,
        pieces: usize,
        target: u32,
        market: ScriptedMarket,
    ) -> (Dispatcher, Arc<ScriptedMarket>, crate::domain::Task) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let task = testing::task(mode, pieces, target);
        store.put_task(&task).unwrap();
        let market = Arc::new(market);
        let d = Dispatcher::new(store, market.clone(), opts());
        (d, market, task)
    }

    fn state(d: &Dispatcher, id: PieceId) -> PieceState {
        d.tracker().query(id).unwrap()
    }

    fn cps(names: &[&str]) -> BTreeSet<CounterpartyId> {
        names.iter().map(|n| CounterpartyId::new(*n)).collect()
    }

    #[tokio::test]
    async fn rejected_slot_is_refilled_from_the_pool() {
        use DealOutcome::*;
        let market = ScriptedMarket::new(
            &["P1", "P2", "P3", "P4"],
            &[("P1", Accepted), ("P2", Accepted), ("P3", Rejected), ("P4", Accepted)],
        );
        let (d, market, task) = setup(DispatchMode::Auto, 1, 3, market);
        let id = task.pieces[0].piece_id;

        let report = d
            .dispatch_task(task.task_id, RunMode::OneShot, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.satisfied, 1);

        let s = state(&d, id);
        assert_eq!(s.replicas, cps(&["P1", "P2", "P4"]));
        assert_eq!(s.status, PieceStatus::Satisfied);
        assert!(s.pending.is_empty());
        let mut proposed = market.proposals();
        proposed.sort();
        assert_eq!(proposed, vec!["P1", "P2", "P3", "P4"]);
    }

    #[tokio::test]
    async fn empty_pool_fails_one_shot_but_waits_when_continuous() {
        let (d, _, task) = setup(DispatchMode::Auto, 1, 2, ScriptedMarket::new(&[], &[]));
        let id = task.pieces[0].piece_id;

        let report = d
            .dispatch_task(task.task_id, RunMode::Continuous, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.incomplete, 1);
        assert_eq!(state(&d, id).status, PieceStatus::Dispatching);

        let report = d
            .dispatch_task(task.task_id, RunMode::OneShot, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(state(&d, id).status, PieceStatus::Failed);
        assert!(matches!(
            report.into_result(),
            Err(DispatchError::PiecesFailed { .. })
        ));
    }

    #[tokio::test]
    async fn pool_smaller_than_target_leaves_piece_partial() {
        use DealOutcome::*;
        let market = ScriptedMarket::new(&["P1", "P2"], &[("P1", Accepted), ("P2", Accepted)]);
        let (d, _, task) = setup(DispatchMode::Auto, 1, 5, market);
        let report = d
            .dispatch_task(task.task_id, RunMode::OneShot, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.partial, 1);
        let s = state(&d, task.pieces[0].piece_id);
        assert_eq!(s.status, PieceStatus::PartiallySatisfied);
        assert_eq!(s.replicas.len(), 2);
    }

    #[tokio::test]
    async fn satisfied_pieces_are_left_alone() {
        use DealOutcome::*;
        let market = ScriptedMarket::new(&["P1", "P2", "P3"], &[("P1", Accepted), ("P2", Accepted)]);
        let (d, market, task) = setup(DispatchMode::Auto, 2, 2, market);
        let cancel = CancellationToken::new();
        d.dispatch_task(task.task_id, RunMode::OneShot, &cancel)
            .await
            .unwrap();
        let calls = market.eligibility_calls.load(Ordering::SeqCst);
        let proposals = market.proposals().len();

        let again = d
            .dispatch_task(task.task_id, RunMode::OneShot, &cancel)
            .await
            .unwrap();
        assert_eq!(again.satisfied, 2);
        assert_eq!(market.eligibility_calls.load(Ordering::SeqCst), calls);
        assert_eq!(market.proposals().len(), proposals);
        for p in &task.pieces {
            assert!(state(&d, p.piece_id).replicas.len() <= 2);
        }
    }

    #[tokio::test]
    async fn slow_counterparty_expires_and_is_not_counted() {
        use DealOutcome::*;
        let mut market = ScriptedMarket::new(&["SLOW", "P1"], &[("SLOW", Accepted), ("P1", Accepted)]);
        market.slow.insert("SLOW");
        let (d, _, task) = setup(DispatchMode::Auto, 1, 2, market);
        let id = task.pieces[0].piece_id;

        let report = d
            .dispatch_task(task.task_id, RunMode::OneShot, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.partial, 1);

        let log = d.store.attempts(id).unwrap();
        let slow_expired = log
            .iter()
            .filter(|a| a.counterparty.as_str() == "SLOW" && a.outcome == Expired)
            .count();
        // expired counterparties stay eligible: one attempt per round
        assert_eq!(slow_expired, opts().max_rounds as usize);
        let s = state(&d, id);
        assert_eq!(s.status, PieceStatus::PartiallySatisfied);
        assert_eq!(s.replicas, cps(&["P1"]));
        assert!(s.pending.is_empty());
    }

    #[tokio::test]
    async fn counterparty_that_never_answers_fails_one_shot() {
        let mut market = ScriptedMarket::new(&["SLOW"], &[("SLOW", DealOutcome::Accepted)]);
        market.slow.insert("SLOW");
        let (d, _, task) = setup(DispatchMode::Auto, 1, 1, market);
        let id = task.pieces[0].piece_id;
        let mut o = opts();
        o.max_rounds = 2;
        let d = Dispatcher::new(d.store.clone(), d.market.clone(), o);

        let report = d
            .dispatch_task(task.task_id, RunMode::OneShot, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.incomplete, 0);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].reason.contains("2 round(s)"));
        assert_eq!(report.failed[0].attempted, vec![CounterpartyId::new("SLOW")]);
        let s = state(&d, id);
        assert_eq!(s.status, PieceStatus::Failed);
        assert!(s.pending.is_empty());
        assert!(matches!(
            report.into_result(),
            Err(DispatchError::PiecesFailed { .. })
        ));
    }

    #[tokio::test]
    async fn failed_auto_piece_is_never_dispatched_again() {
        use DealOutcome::*;
        let market = ScriptedMarket::new(&["P1"], &[("P1", Accepted)]);
        let (d, market, task) = setup(DispatchMode::Auto, 2, 1, market);
        let (gone, live) = (task.pieces[0].piece_id, task.pieces[1].piece_id);
        d.set_status(gone, PieceStatus::Failed).unwrap();

        let reports = d.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].failed.len(), 1);
        assert_eq!(reports[0].satisfied, 1);
        assert_eq!(state(&d, gone).status, PieceStatus::Failed);
        assert!(d.store.attempts(gone).unwrap().is_empty());
        assert_eq!(state(&d, live).status, PieceStatus::Satisfied);
        assert_eq!(market.proposals(), vec!["P1"]);

        // every piece is terminal now, so polling skips the task
        assert!(d.poll_once(&CancellationToken::new()).await.unwrap().is_empty());
        d.dispatch_task(task.task_id, RunMode::OneShot, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(market.proposals().len(), 1);
    }

    #[tokio::test]
    async fn surplus_candidates_stay_untried() {
        use DealOutcome::*;
        let pool = ["P1", "P2", "P3", "P4", "P5"];
        let answers = [
            ("P1", Accepted),
            ("P2", Rejected),
            ("P3", Accepted),
            ("P4", Accepted),
            ("P5", Accepted),
        ];

        // a single round leaves one slot open
        let (d, market, task) = setup(DispatchMode::Auto, 1, 3, ScriptedMarket::new(&pool, &answers));
        let mut o = opts();
        o.max_rounds = 1;
        let d = Dispatcher::new(d.store.clone(), d.market.clone(), o);
        let id = task.pieces[0].piece_id;
        let report = d
            .dispatch_task(task.task_id, RunMode::OneShot, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.partial, 1);
        let s = state(&d, id);
        assert_eq!(s.status, PieceStatus::PartiallySatisfied);
        assert_eq!(s.replicas, cps(&["P1", "P3"]));
        let mut proposed = market.proposals();
        proposed.sort();
        assert_eq!(proposed, vec!["P1", "P2", "P3"]);

        // the next round refills the rejected slot and stops at the target
        let (d, market, task) = setup(DispatchMode::Auto, 1, 3, ScriptedMarket::new(&pool, &answers));
        let id = task.pieces[0].piece_id;
        let report = d
            .dispatch_task(task.task_id, RunMode::OneShot, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.satisfied, 1);
        let s = state(&d, id);
        assert_eq!(s.replicas, cps(&["P1", "P3", "P4"]));
        let mut proposed = market.proposals();
        proposed.sort();
        assert_eq!(proposed, vec!["P1", "P2", "P3", "P4"]);
        assert!(!s.attempted.contains(&CounterpartyId::new("P5")));
    }

    /// Serves everything from memory except attempt logs.
    struct LogOutage(MemoryStore);

    impl Store for LogOutage {
        fn put_task(&self, task: &crate::domain::Task) -> Result<(), StoreError> {
            self.0.put_task(task)
        }
        fn get_task(&self, id: TaskId) -> Result<crate::domain::Task, StoreError> {
            self.0.get_task(id)
        }
        fn task_ids(&self) -> Result<Vec<TaskId>, StoreError> {
            self.0.task_ids()
        }
        fn get_piece(&self, id: PieceId) -> Result<Piece, StoreError> {
            self.0.get_piece(id)
        }
        fn update_piece(
            &self,
            id: PieceId,
            f: &mut dyn FnMut(&mut Piece),
        ) -> Result<Piece, StoreError> {
            self.0.update_piece(id, f)
        }
        fn append_attempt(&self, attempt: &DealAttempt) -> Result<(), StoreError> {
            self.0.append_attempt(attempt)
        }
        fn attempts(&self, _id: PieceId) -> Result<Vec<DealAttempt>, StoreError> {
            Err(StoreError::Encoding("attempt log corrupted".into()))
        }
    }

    #[tokio::test]
    async fn unreadable_attempt_log_fails_the_pass() {
        let store = Arc::new(LogOutage(MemoryStore::new()));
        let mut task = testing::task(DispatchMode::Manual, 1, 1);
        task.pieces[0].status = PieceStatus::Failed;
        store.put_task(&task).unwrap();
        let market = Arc::new(ScriptedMarket::new(&[], &[]));
        let d = Dispatcher::new(store, market.clone(), opts());

        let err = d
            .dispatch_task(task.task_id, RunMode::OneShot, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Store(StoreError::Encoding(_))));
        assert!(market.proposals().is_empty());
    }

    #[tokio::test]
    async fn manual_piece_gets_exactly_one_attempt() {
        let market = ScriptedMarket::new(&[], &[("f0manual", DealOutcome::Accepted)]);
        let (d, market, task) = setup(DispatchMode::Manual, 1, 1, market);
        let cancel = CancellationToken::new();

        let report = d
            .dispatch_task(task.task_id, RunMode::OneShot, &cancel)
            .await
            .unwrap();
        assert_eq!(report.satisfied, 1);
        d.dispatch_task(task.task_id, RunMode::OneShot, &cancel)
            .await
            .unwrap();
        assert_eq!(market.proposals(), vec!["f0manual"]);
        assert_eq!(market.eligibility_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn manual_rejection_fails_without_retry() {
        let (d, market, task) = setup(DispatchMode::Manual, 1, 1, ScriptedMarket::new(&[], &[]));
        let err = d
            .dispatch_task(task.task_id, RunMode::OneShot, &CancellationToken::new())
            .await
            .unwrap()
            .into_result()
            .unwrap_err();
        match err {
            DispatchError::PiecesFailed { failed, .. } => {
                assert_eq!(failed[0].attempted, vec![CounterpartyId::new("f0manual")]);
            }
            other => panic!("unexpected {other}"),
        }
        d.dispatch_task(task.task_id, RunMode::OneShot, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(market.proposals().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_token_starts_no_rounds() {
        let market = ScriptedMarket::new(&["P1"], &[("P1", DealOutcome::Accepted)]);
        let (d, market, task) = setup(DispatchMode::Auto, 1, 1, market);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = d
            .dispatch_task(task.task_id, RunMode::OneShot, &cancel)
            .await
            .unwrap();
        assert_eq!(report.incomplete, 1);
        assert!(market.proposals().is_empty());
        assert!(matches!(
            report.into_result(),
            Err(DispatchError::PiecesUnfinished { pending: 1, .. })
        ));
    }

    #[tokio::test]
    async fn polling_loop_satisfies_auto_tasks_and_stops_on_cancel() {
        use DealOutcome::*;
        let market = ScriptedMarket::new(&["P1", "P2"], &[("P1", Accepted), ("P2", Accepted)]);
        let (d, _, task) = setup(DispatchMode::Auto, 3, 2, market);
        let cancel = CancellationToken::new();
        let handle = d.spawn_polling(cancel.clone());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let t = d.store.get_task(task.task_id).unwrap();
            if t.is_complete() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "polling made no progress");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        handle.await.unwrap();
        for p in &task.pieces {
            assert_eq!(state(&d, p.piece_id).status, PieceStatus::Satisfied);
        }
    }
}
