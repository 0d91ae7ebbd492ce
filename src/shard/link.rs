//! The shard's side of the commit path: submission tasks, retry timers and the
//! initial stale-candidate purge.

use super::commit::CommitTarget;
use super::ShardMessage;
use crate::consensus::{Consensus, LeaderRequest};
use crate::error::CommitError;
use crate::model::ModificationBatch;
use crate::types::{MemberName, TransactionId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Progress of the one-time purge of candidates left by a previous incarnation.
#[derive(Debug)]
enum InitialPurge {
    /// No leader seen yet.
    Needed,
    /// Waiting for the leader to acknowledge. Batches are held until then.
    InFlight { held: Option<ModificationBatch> },
    Done,
}

pub(crate) struct ShardLink {
    shard_name: String,
    local_member: MemberName,
    consensus: Arc<dyn Consensus>,
    self_tx: mpsc::UnboundedSender<ShardMessage>,
    commit_timeout: Duration,
    purge: InitialPurge,
}

impl ShardLink {
    pub(crate) fn new(
        shard_name: String,
        local_member: MemberName,
        consensus: Arc<dyn Consensus>,
        self_tx: mpsc::UnboundedSender<ShardMessage>,
        commit_timeout: Duration,
    ) -> Self {
        Self {
            shard_name,
            local_member,
            consensus,
            self_tx,
            commit_timeout,
            purge: InitialPurge::Needed,
        }
    }

    pub(crate) fn sender(&self) -> &mpsc::UnboundedSender<ShardMessage> {
        &self.self_tx
    }

    /// The leader acknowledged the initial purge, or the request gave up.
    pub(crate) fn on_initial_purge_done(&mut self) {
        if let InitialPurge::InFlight { held } =
            std::mem::replace(&mut self.purge, InitialPurge::Done)
        {
            if let Some(batch) = held {
                self.spawn_submit(batch);
            }
        }
    }

    fn spawn_submit(&self, batch: ModificationBatch) {
        let consensus = self.consensus.clone();
        let tx = self.self_tx.clone();
        let timeout = self.commit_timeout;
        let id = batch.transaction_id.clone();

        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, consensus.submit(batch)).await {
                Ok(result) => result,
                Err(_) => Err(CommitError::Timeout),
            };
            let _ = tx.send(ShardMessage::CommitComplete { id, result });
        });
    }
}

impl CommitTarget for ShardLink {
    fn is_leader(&self) -> bool {
        self.consensus.is_leader()
    }

    fn has_leader(&self) -> bool {
        self.consensus.leader().is_some()
            && (!self.consensus.is_leader() || self.consensus.has_active_leader())
    }

    fn submit(&mut self, batch: ModificationBatch) {
        self.announce_to_leader();

        if let InitialPurge::InFlight { held } = &mut self.purge {
            debug!(
                shard = %self.shard_name,
                transaction_id = %batch.transaction_id,
                "Holding batch until the initial candidate purge completes"
            );
            *held = Some(batch);
            return;
        }
        self.spawn_submit(batch);
    }

    fn schedule_retry(&mut self, id: TransactionId, delay: Duration) -> CancellationToken {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let tx = self.self_tx.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(ShardMessage::CommitRetry { id });
                }
            }
        });

        token
    }

    fn announce_to_leader(&mut self) {
        if !matches!(self.purge, InitialPurge::Needed) {
            return;
        }
        let Some(leader) = self.consensus.leader() else {
            return;
        };
        if self.consensus.is_leader() {
            self.purge = InitialPurge::Done;
            return;
        }

        info!(
            shard = %self.shard_name,
            %leader,
            "Found leader on startup, removing stale candidates of this member"
        );
        self.purge = InitialPurge::InFlight { held: None };

        let consensus = self.consensus.clone();
        let tx = self.self_tx.clone();
        let timeout = self.commit_timeout;
        let shard = self.shard_name.clone();
        let request = LeaderRequest::RemoveAllCandidates {
            member: self.local_member.clone(),
        };

        tokio::spawn(async move {
            match tokio::time::timeout(timeout, consensus.send_to_leader(request)).await {
                Ok(Ok(())) => debug!(shard = %shard, "Initial candidate purge committed"),
                Ok(Err(e)) => warn!(shard = %shard, error = %e, "Initial candidate purge failed"),
                Err(_) => warn!(shard = %shard, "Initial candidate purge timed out"),
            }
            let _ = tx.send(ShardMessage::InitialPurgeDone);
        });
    }
}
