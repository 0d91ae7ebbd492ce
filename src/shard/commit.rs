//! Single in-flight batch commit coordination.
//!
//! The coordinator queues local modifications and keeps at most one batch in
//! flight. Failures are retried on election-timeout cadence and never reach the
//! caller that queued the modification.

use crate::error::CommitError;
use crate::metrics::ShardMetrics;
use crate::model::{self, Modification, ModificationBatch};
use crate::types::{Entity, MemberName, TransactionId};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Replies to a caller once every modification it queued has committed.
pub type CommitWaiter = oneshot::Sender<Result<(), CommitError>>;

/// What the coordinator needs from the shard it belongs to.
pub trait CommitTarget {
    fn is_leader(&self) -> bool;

    /// Whether a leader able to accept batches is known.
    fn has_leader(&self) -> bool;

    /// Hand a batch to the consensus primitive. The outcome comes back through
    /// [`CommitCoordinator::on_commit_result`].
    fn submit(&mut self, batch: ModificationBatch);

    /// Arrange for [`CommitCoordinator::on_retry`] to be called with `id` after `delay`.
    fn schedule_retry(&mut self, id: TransactionId, delay: Duration) -> CancellationToken;

    /// Give the shard a chance to contact a newly known leader before batches flow.
    fn announce_to_leader(&mut self);
}

#[derive(Debug)]
struct InflightBatch {
    id: TransactionId,
    entries: Vec<(u64, Modification)>,
}

impl InflightBatch {
    fn batch(&self) -> ModificationBatch {
        ModificationBatch::new(
            self.id.clone(),
            self.entries.iter().map(|(_, m)| m.clone()).collect(),
        )
    }
}

/// Commit coordinator of one shard replica.
#[derive(Debug)]
pub struct CommitCoordinator {
    shard_name: String,
    local_member: MemberName,
    max_batch_size: usize,
    retry_interval: Duration,

    /// Queued modifications tagged with a local sequence number, oldest first.
    pending: VecDeque<(u64, Modification)>,
    inflight: Option<InflightBatch>,
    next_modification_seq: u64,
    next_transaction_seq: u64,
    retry: Option<CancellationToken>,
    /// Role seen at the last entry point, so a lost leadership is noticed
    /// even before the role change event is handled.
    was_leader: bool,
    /// Waiters keyed by the sequence number of the last modification they queued.
    waiters: Vec<(u64, CommitWaiter)>,

    metrics: Arc<ShardMetrics>,
}

impl CommitCoordinator {
    pub fn new(
        shard_name: impl Into<String>,
        local_member: MemberName,
        max_batch_size: usize,
        retry_interval: Duration,
        metrics: Arc<ShardMetrics>,
    ) -> Self {
        Self {
            shard_name: shard_name.into(),
            local_member,
            max_batch_size: max_batch_size.max(1),
            retry_interval,
            pending: VecDeque::new(),
            inflight: None,
            next_modification_seq: 1,
            next_transaction_seq: 1,
            retry: None,
            was_leader: false,
            waiters: Vec::new(),
            metrics,
        }
    }

    pub fn commit_modification(&mut self, modification: Modification, target: &mut impl CommitTarget) {
        self.commit_modifications(vec![modification], target);
    }

    pub fn commit_modifications(
        &mut self,
        modifications: Vec<Modification>,
        target: &mut impl CommitTarget,
    ) {
        if modifications.is_empty() {
            return;
        }
        self.enqueue(modifications);
        self.commit_next_batch(target);
    }

    /// Queue modifications and reply on `waiter` once all of them have committed.
    pub fn commit_modifications_with_waiter(
        &mut self,
        modifications: Vec<Modification>,
        waiter: CommitWaiter,
        target: &mut impl CommitTarget,
    ) {
        if modifications.is_empty() {
            let _ = waiter.send(Ok(()));
            return;
        }
        let last_seq = self.enqueue(modifications);
        self.waiters.push((last_seq, waiter));
        self.commit_next_batch(target);
    }

    fn enqueue(&mut self, modifications: Vec<Modification>) -> u64 {
        for modification in modifications {
            let seq = self.next_modification_seq;
            self.next_modification_seq += 1;
            self.pending.push_back((seq, modification));
        }
        self.update_pending_gauge();
        self.next_modification_seq - 1
    }

    fn next_transaction_id(&mut self) -> TransactionId {
        let id = TransactionId {
            member: self.local_member.clone(),
            seq: self.next_transaction_seq,
        };
        self.next_transaction_seq += 1;
        id
    }

    /// Start a new batch if the slot is free, work is queued and a leader is known.
    pub fn commit_next_batch(&mut self, target: &mut impl CommitTarget) {
        self.observe_role(&*target);
        if self.inflight.is_some() || self.pending.is_empty() || !target.has_leader() {
            return;
        }

        let take = self.pending.len().min(self.max_batch_size);
        let entries: Vec<_> = self.pending.drain(..take).collect();
        let id = self.next_transaction_id();
        self.inflight = Some(InflightBatch { id, entries });
        self.update_pending_gauge();

        self.submit_inflight(target);
    }

    fn submit_inflight(&mut self, target: &mut impl CommitTarget) {
        let Some(inflight) = &self.inflight else {
            return;
        };
        debug!(
            shard = %self.shard_name,
            transaction_id = %inflight.id,
            modifications = inflight.entries.len(),
            "Submitting modification batch"
        );
        self.metrics.batches_submitted.inc();
        target.submit(inflight.batch());
    }

    /// Handle the outcome of a submitted batch. Outcomes for any batch other than
    /// the one in flight are ignored.
    pub fn on_commit_result(
        &mut self,
        id: &TransactionId,
        result: Result<(), CommitError>,
        target: &mut impl CommitTarget,
    ) {
        if self.inflight.as_ref().map(|b| &b.id) != Some(id) {
            debug!(shard = %self.shard_name, transaction_id = %id, "Ignoring result for stale transaction");
            return;
        }

        match result {
            Ok(()) => {
                debug!(shard = %self.shard_name, transaction_id = %id, "Modification batch committed");
                self.cancel_retry();
                self.inflight = None;
                self.complete_waiters();
                self.commit_next_batch(target);
            }
            Err(e) => {
                self.metrics.commit_failures.inc();
                if e.is_no_leader() {
                    warn!(shard = %self.shard_name, transaction_id = %id, error = %e, "Commit failed, no leader; retrying");
                } else {
                    // The batch may have partially applied, so it must not be resent under its old id.
                    self.rebuild_inflight();
                    warn!(shard = %self.shard_name, transaction_id = %id, error = %e, "Commit failed; retrying under a new transaction id");
                }
                self.arm_retry(target);
            }
        }
    }

    /// Handle a retry timer firing for `id`.
    pub fn on_retry(&mut self, id: &TransactionId, target: &mut impl CommitTarget) {
        if self.inflight.as_ref().map(|b| &b.id) != Some(id) {
            debug!(shard = %self.shard_name, transaction_id = %id, "Ignoring stale retry");
            return;
        }
        self.retry = None;

        self.observe_role(&*target);
        if self.inflight.is_none() {
            self.commit_next_batch(target);
            return;
        }

        if target.has_leader() {
            self.metrics.commit_retries.inc();
            debug!(shard = %self.shard_name, transaction_id = %id, "Retrying modification batch");
            self.submit_inflight(target);
        } else {
            debug!(shard = %self.shard_name, transaction_id = %id, "No leader for retry, rescheduling");
            self.arm_retry(target);
        }
    }

    /// React to a role or leader change of the local replica.
    pub fn on_state_changed(&mut self, target: &mut impl CommitTarget) {
        let is_leader = target.is_leader();
        let has_leader = target.has_leader();

        target.announce_to_leader();

        if has_leader && !is_leader {
            self.prune_owner_writes();
        }
        self.observe_role(&*target);

        if !is_leader && self.inflight.is_some() {
            // The batch may have been submitted to a leader that is gone.
            self.rebuild_inflight();
            self.cancel_retry();
            if has_leader {
                self.submit_inflight(target);
            } else {
                self.arm_retry(target);
            }
        } else if self.inflight.is_none() {
            self.commit_next_batch(target);
        }
    }

    /// Prune owner writes the first time the local replica is seen to have lost leadership.
    fn observe_role(&mut self, target: &impl CommitTarget) {
        let is_leader = target.is_leader();
        if self.was_leader && !is_leader {
            self.prune_owner_writes();
        }
        self.was_leader = is_leader;
    }

    /// Drop owner writes, whose selection may be stale for a different leader.
    fn prune_owner_writes(&mut self) {
        let before = self.pending.len();
        self.pending.retain(|(_, m)| !model::is_owner_write(m));
        let mut pruned = before - self.pending.len();

        if let Some(inflight) = &mut self.inflight {
            let before = inflight.entries.len();
            inflight.entries.retain(|(_, m)| !model::is_owner_write(m));
            let dropped = before - inflight.entries.len();
            pruned += dropped;
            if inflight.entries.is_empty() {
                self.inflight = None;
                self.cancel_retry();
            } else if dropped > 0 {
                self.rebuild_inflight();
            }
        }

        if pruned > 0 {
            info!(shard = %self.shard_name, pruned, "Pruned owner writes after losing leadership");
            self.metrics.modifications_pruned.inc_by(pruned as u64);
            self.update_pending_gauge();
            self.complete_waiters();
        }
    }

    fn rebuild_inflight(&mut self) {
        let id = self.next_transaction_id();
        if let Some(inflight) = &mut self.inflight {
            debug!(shard = %self.shard_name, old = %inflight.id, new = %id, "Rebuilding in-flight batch");
            inflight.id = id;
            self.metrics.transactions_rebuilt.inc();
        }
    }

    fn arm_retry(&mut self, target: &mut impl CommitTarget) {
        self.cancel_retry();
        if let Some(inflight) = &self.inflight {
            self.retry = Some(target.schedule_retry(inflight.id.clone(), self.retry_interval));
        }
    }

    fn cancel_retry(&mut self) {
        if let Some(token) = self.retry.take() {
            token.cancel();
        }
    }

    /// Reply to waiters whose modifications are all committed or pruned.
    fn complete_waiters(&mut self) {
        let oldest_outstanding = self
            .inflight
            .as_ref()
            .and_then(|b| b.entries.first().map(|(seq, _)| *seq))
            .into_iter()
            .chain(self.pending.front().map(|(seq, _)| *seq))
            .min()
            .unwrap_or(u64::MAX);

        let (done, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiters)
            .into_iter()
            .partition(|(last_seq, _)| *last_seq < oldest_outstanding);
        self.waiters = waiting;
        for (_, waiter) in done {
            let _ = waiter.send(Ok(()));
        }
    }

    fn update_pending_gauge(&self) {
        self.metrics.pending_modifications.set(self.pending.len() as i64);
    }

    /// Owner the entity will have once queued and in-flight writes commit, if any
    /// of them writes its owner. `Some(None)` is a queued write of no owner.
    pub fn effective_owner(&self, entity: &Entity) -> Option<Option<MemberName>> {
        let path = model::owner_path(entity);
        let owner_of = |m: &Modification| match m {
            Modification::Write { path: p, node } if *p == path => {
                Some(model::owner_value(node.value()))
            }
            _ => None,
        };

        self.pending
            .iter()
            .rev()
            .find_map(|(_, m)| owner_of(m))
            .or_else(|| {
                self.inflight
                    .as_ref()
                    .and_then(|b| b.entries.iter().rev().find_map(|(_, m)| owner_of(m)))
            })
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn inflight_id(&self) -> Option<&TransactionId> {
        self.inflight.as_ref().map(|b| &b.id)
    }

    /// Modifications of the in-flight batch.
    pub fn inflight_modifications(&self) -> Vec<Modification> {
        self.inflight
            .as_ref()
            .map(|b| b.entries.iter().map(|(_, m)| m.clone()).collect())
            .unwrap_or_default()
    }

    pub fn is_idle(&self) -> bool {
        self.inflight.is_none()
    }
}
