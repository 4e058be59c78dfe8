//! Claiming, lease reclaim and the tick queue that drives workers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use trellis_core::config::SchedulerConfig;
use trellis_core::error::Result;
use trellis_core::types::*;
use trellis_store::Transition;

use crate::engine::GraphEngine;
use crate::mutation::Mutator;
use crate::runner::Runner;

/// Error recorded on nodes whose lease ran out while running.
pub const LEASE_EXPIRED_REASON: &str = "running_lease_expired";

/// Hands out leases on ready nodes.
///
/// Holds no scheduling state of its own: every decision is a conditional
/// update in the store, so any number of schedulers may share a database.
pub struct Scheduler {
    engine: Arc<GraphEngine>,
    lease: chrono::Duration,
    worker_id: String,
}

impl Scheduler {
    pub fn new(engine: Arc<GraphEngine>, config: &SchedulerConfig) -> Self {
        let worker_id = config
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::now_v7()));
        Self {
            engine,
            lease: lease_duration(config.lease_seconds),
            worker_id,
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn lease(&self) -> chrono::Duration {
        self.lease
    }

    /// Lease up to `limit` ready, executable nodes to this worker.
    ///
    /// A node is ready when every dependency predecessor finished and every
    /// sequence predecessor settled. Nodes lost to a racing claimer are
    /// skipped silently.
    pub fn claim(&self, graph_id: &GraphId, limit: usize) -> Result<Vec<Node>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let claimed = self.engine.mutate(graph_id, |m| {
            let now = m.now();
            let until = now + self.lease;
            let mut claimed = Vec::new();
            for node in m.rows().ready_pending_nodes()? {
                if claimed.len() >= limit {
                    break;
                }
                if !m.policy().is_executable(&node.node_type) {
                    continue;
                }
                if m.rows().claim(&node.id, &self.worker_id, now, until)? {
                    claimed.push(m.rows().node(&node.id)?);
                } else {
                    debug!(node_id = %node.id, "Claim lost to another worker");
                }
            }
            Ok(claimed)
        })?;
        if !claimed.is_empty() {
            info!(graph_id = %graph_id, worker = %self.worker_id, count = claimed.len(), "Nodes claimed");
        }
        Ok(claimed)
    }

    /// Error out expired leases in one graph, then cascade the failures.
    pub fn reclaim(&self, graph_id: &GraphId) -> Result<Vec<NodeId>> {
        self.engine.mutate(graph_id, |m| {
            let now = m.now();
            let reclaimed = m.reclaim_expired_leases(now)?;
            if !reclaimed.is_empty() {
                m.propagate_failures()?;
                m.repair_leaf_invariant()?;
            }
            Ok(reclaimed)
        })
    }

    /// Reclaim sweep across every graph with an expired lease. A failing
    /// graph is logged and does not stop the sweep.
    pub fn reclaim_all(&self) -> Result<usize> {
        let mut total = 0;
        for graph_id in self.engine.store().graphs_with_expired_leases(Utc::now())? {
            match self.reclaim(&graph_id) {
                Ok(ids) => total += ids.len(),
                Err(e) => warn!(graph_id = %graph_id, error = %e, "Lease reclaim failed"),
            }
        }
        Ok(total)
    }

    /// Apply queued visibility patches in every graph that has any.
    pub fn sweep_patches(&self) -> Result<usize> {
        let mut total = 0;
        for graph_id in self.engine.store().graphs_with_patches()? {
            match self.engine.apply_visibility_patches(&graph_id) {
                Ok(ids) => total += ids.len(),
                Err(e) => warn!(graph_id = %graph_id, error = %e, "Patch sweep failed"),
            }
        }
        Ok(total)
    }
}

pub(crate) fn lease_duration(seconds: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(seconds).unwrap_or(i64::MAX / 1000))
}

impl<'a> Mutator<'a> {
    /// Move every running node whose lease ran out before `now` to errored.
    pub fn reclaim_expired_leases(&mut self, now: DateTime<Utc>) -> Result<Vec<NodeId>> {
        let mut reclaimed = Vec::new();
        for node in self.rows().expired_leases(now)? {
            let change = Transition::at(now).with_error(LEASE_EXPIRED_REASON);
            if !self
                .rows()
                .transition(&node.id, &[NodeState::Running], NodeState::Errored, &change)?
            {
                continue;
            }
            warn!(
                node_id = %node.id,
                claimed_by = node.claimed_by.as_deref().unwrap_or("-"),
                "Running lease expired, node errored"
            );
            self.emit(
                EventType::NodeStateChanged,
                SubjectType::Node,
                &node.id,
                json!({
                    "from": NodeState::Running,
                    "to": NodeState::Errored,
                    "reason": LEASE_EXPIRED_REASON,
                }),
            );
            reclaimed.push(node.id);
        }
        Ok(reclaimed)
    }
}

// ── Tick queue ──────────────────────────────────────────────────────

/// A request to claim and run up to `limit` nodes of one graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tick {
    pub graph_id: GraphId,
    pub limit: usize,
}

type PendingTicks = Arc<Mutex<HashMap<GraphId, usize>>>;

/// Sending half of the tick queue. Kicking a graph that already has a tick
/// waiting only raises that tick's limit.
#[derive(Clone)]
pub struct TickQueue {
    tx: mpsc::UnboundedSender<GraphId>,
    pending: PendingTicks,
}

pub struct TickReceiver {
    rx: mpsc::UnboundedReceiver<GraphId>,
    pending: PendingTicks,
}

impl TickQueue {
    pub fn new() -> (Self, TickReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending: PendingTicks = Arc::default();
        (
            Self {
                tx,
                pending: pending.clone(),
            },
            TickReceiver { rx, pending },
        )
    }

    /// Enqueue a tick. Returns `false` when it merged into one already queued.
    pub fn kick(&self, graph_id: &GraphId, limit: usize) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(queued) = pending.get_mut(graph_id) {
            *queued = (*queued).max(limit);
            return false;
        }
        if self.tx.send(graph_id.clone()).is_err() {
            debug!(graph_id = %graph_id, "Tick receiver gone, kick dropped");
            return false;
        }
        pending.insert(graph_id.clone(), limit);
        true
    }

    pub fn queued(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl TickReceiver {
    /// Next tick, or `None` once every queue handle is dropped.
    pub async fn recv(&mut self) -> Option<Tick> {
        loop {
            let graph_id = self.rx.recv().await?;
            let limit = self
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&graph_id);
            if let Some(limit) = limit {
                return Some(Tick { graph_id, limit });
            }
        }
    }
}

// ── Worker loop ─────────────────────────────────────────────────────

/// Drains ticks (claim, then run each claimed node) and periodically sweeps
/// expired leases and queued visibility patches.
pub struct Worker {
    scheduler: Arc<Scheduler>,
    runner: Arc<Runner>,
    ticks: TickReceiver,
    sweep_interval: Duration,
}

impl Worker {
    pub fn new(scheduler: Arc<Scheduler>, runner: Arc<Runner>, ticks: TickReceiver, config: &SchedulerConfig) -> Self {
        Self {
            scheduler,
            runner,
            ticks,
            sweep_interval: Duration::from_secs(config.reclaim_interval_secs.max(1)),
        }
    }

    /// Run until cancelled or every queue handle is dropped.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(worker = %self.scheduler.worker_id(), "Worker started");
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Worker shutting down");
                    break;
                }
                tick = self.ticks.recv() => {
                    let Some(tick) = tick else {
                        debug!("Tick queue closed, worker stopping");
                        break;
                    };
                    self.handle_tick(tick).await;
                }
                _ = sweep.tick() => {
                    self.sweep();
                }
            }
        }
    }

    async fn handle_tick(&self, tick: Tick) {
        let claimed = match self.scheduler.claim(&tick.graph_id, tick.limit) {
            Ok(nodes) => nodes,
            Err(e) => {
                error!(graph_id = %tick.graph_id, error = %e, "Claim failed");
                return;
            }
        };
        let worker = self.scheduler.worker_id();
        let runs = claimed
            .iter()
            .map(|node| self.runner.run(&tick.graph_id, &node.id, worker));
        for result in futures::future::join_all(runs).await {
            if let Err(e) = result {
                error!(graph_id = %tick.graph_id, error = %e, "Run failed");
            }
        }
    }

    fn sweep(&self) {
        match self.scheduler.reclaim_all() {
            Ok(0) => {}
            Ok(n) => info!(count = n, "Expired leases reclaimed"),
            Err(e) => error!(error = %e, "Lease sweep failed"),
        }
        match self.scheduler.sweep_patches() {
            Ok(0) => {}
            Ok(n) => info!(count = n, "Queued visibility patches applied"),
            Err(e) => error!(error = %e, "Patch sweep failed"),
        }
    }
}
