use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use trellis_core::config::SchedulerConfig;
use trellis_core::types::*;
use trellis_engine::{ExecutorRegistry, GraphAudit, Runner, Scheduler, TickQueue, Worker, LEASE_EXPIRED_REASON};
use trellis_test_utils::{chain, file_engine, pending_after, test_engine, ScriptedExecutor};

fn registry_for(executor: &Arc<ScriptedExecutor>, node_types: &[&str]) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    registry.register_shared(node_types, executor.clone());
    registry
}

#[tokio::test]
async fn test_pending_reply_runs_exactly_once() {
    let (engine, sink) = test_engine();
    let graph = engine.create_graph(Map::new()).unwrap().id;
    let a = chain(&engine, &graph, &["user_message"], NodeState::Finished).remove(0);
    let b = pending_after(&engine, &graph, &a, "agent_message", EdgeType::Sequence);

    let config = SchedulerConfig::default();
    let scheduler = Scheduler::new(engine.clone(), &config).with_worker_id("w1");
    let claimed = scheduler.claim(&graph, 10).unwrap();
    assert_eq!(claimed.iter().map(|n| &n.id).collect::<Vec<_>>(), vec![&b]);
    assert!(scheduler.claim(&graph, 10).unwrap().is_empty());

    let executor = Arc::new(ScriptedExecutor::new().then(ExecutionOutcome::finished("x")));
    let runner = Runner::new(engine.clone(), registry_for(&executor, &["agent_message"]), &config);
    let report = runner.run(&graph, &b, "w1").await.unwrap();
    assert!(report.transitioned);
    assert_eq!(report.state, NodeState::Finished);

    let node = engine.node(&graph, &b).unwrap();
    assert_eq!(node.state, NodeState::Finished);
    assert_eq!(node.content(), Some("x"));
    assert!(node.lease_expires_at.is_none());

    let changes = sink.of_type(EventType::NodeStateChanged);
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].subject_id, b.as_str());
    assert_eq!(changes[0].particulars["to"], "finished");

    // A second run of the same claim is a no-op.
    let again = runner.run(&graph, &b, "w1").await.unwrap();
    assert!(!again.transitioned);
    assert_eq!(sink.count(EventType::NodeStateChanged), 1);
    assert_eq!(executor.seen().len(), 1);
}

#[tokio::test]
async fn test_worker_drives_graph_to_quiescence() {
    let (engine, _sink) = test_engine();
    let graph = engine.create_graph(Map::new()).unwrap().id;
    let user = chain(&engine, &graph, &["user_message"], NodeState::Finished).remove(0);
    let reply = pending_after(&engine, &graph, &user, "agent_message", EdgeType::Sequence);
    let task = pending_after(&engine, &graph, &reply, "task", EdgeType::Dependency);

    let executor = Arc::new(ScriptedExecutor::new());
    let config = SchedulerConfig {
        worker_id: Some("w1".into()),
        ..SchedulerConfig::default()
    };
    let (ticks, rx) = TickQueue::new();
    let runner = Arc::new(
        Runner::new(engine.clone(), registry_for(&executor, &["agent_message", "task"]), &config)
            .with_ticks(ticks.clone()),
    );
    let scheduler = Arc::new(Scheduler::new(engine.clone(), &config));
    let cancel = CancellationToken::new();
    let worker = tokio::spawn(Worker::new(scheduler, runner, rx, &config).run(cancel.clone()));

    ticks.kick(&graph, config.claim_limit);

    // The finished task leaf gets a repair reply, which the worker runs too.
    let settled = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let open = engine
                .read(&graph, |rows| {
                    Ok(rows.count_in_state(NodeState::Pending)? + rows.count_in_state(NodeState::Running)?)
                })
                .unwrap();
            if open == 0 && executor.seen().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    cancel.cancel();
    worker.await.unwrap();
    assert!(settled.is_ok(), "worker did not settle the graph");

    let seen: Vec<NodeId> = executor.seen().into_iter().map(|(id, _)| id).collect();
    assert_eq!(&seen[..2], &[reply.clone(), task.clone()]);
    assert_eq!(engine.node(&graph, &task).unwrap().state, NodeState::Finished);

    let repair = engine.node(&graph, &seen[2]).unwrap();
    assert_eq!(repair.node_type, node_types::AGENT_MESSAGE);
    assert_eq!(repair.metadata["generated_by"], "leaf_repair");
    assert_eq!(repair.state, NodeState::Finished);
}

#[tokio::test]
async fn test_concurrent_claims_on_one_engine_have_one_winner() {
    let (engine, _sink) = test_engine();
    let graph = engine.create_graph(Map::new()).unwrap().id;
    let a = chain(&engine, &graph, &["user_message"], NodeState::Finished).remove(0);
    let b = pending_after(&engine, &graph, &a, "agent_message", EdgeType::Sequence);

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let scheduler = Scheduler::new(engine.clone(), &SchedulerConfig::default())
                .with_worker_id(format!("w{}", i));
            let graph = graph.clone();
            tokio::spawn(async move { scheduler.claim(&graph, 10).unwrap().len() })
        })
        .collect();

    let mut total = 0;
    for result in futures::future::join_all(tasks).await {
        total += result.unwrap();
    }
    assert_eq!(total, 1);
    assert!(engine.node(&graph, &b).unwrap().claimed_by.is_some());
}

#[tokio::test]
async fn test_concurrent_claims_across_connections_have_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("graphs.db");
    let (first, _) = file_engine(&db);
    let (second, _) = file_engine(&db);

    let graph = first.create_graph(Map::new()).unwrap().id;
    let a = chain(&first, &graph, &["user_message"], NodeState::Finished).remove(0);
    let b = pending_after(&first, &graph, &a, "agent_message", EdgeType::Sequence);

    let handles: Vec<_> = [(first.clone(), "w-first"), (second.clone(), "w-second")]
        .into_iter()
        .map(|(engine, worker)| {
            let graph = graph.clone();
            tokio::task::spawn_blocking(move || {
                let scheduler = Scheduler::new(engine, &SchedulerConfig::default()).with_worker_id(worker);
                scheduler
                    .claim(&graph, 10)
                    .unwrap()
                    .into_iter()
                    .map(|n| (worker, n.id))
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut winners = Vec::new();
    for handle in handles {
        winners.extend(handle.await.unwrap());
    }
    assert_eq!(winners.len(), 1);
    let (worker, node) = &winners[0];
    assert_eq!(node, &b);
    assert_eq!(second.node(&graph, &b).unwrap().claimed_by.as_deref(), Some(*worker));
}

#[tokio::test]
async fn test_rejection_skips_dependents_and_repairs_leaf() {
    let (engine, sink) = test_engine();
    let graph = engine.create_graph(Map::new()).unwrap().id;
    let a = chain(&engine, &graph, &["user_message"], NodeState::Finished).remove(0);
    let b = pending_after(&engine, &graph, &a, "agent_message", EdgeType::Sequence);
    let c = pending_after(&engine, &graph, &b, "task", EdgeType::Dependency);
    let d = pending_after(&engine, &graph, &c, "task", EdgeType::Dependency);

    let config = SchedulerConfig::default();
    let executor = Arc::new(ScriptedExecutor::new().then(ExecutionOutcome::rejected("policy refused")));
    let runner = Runner::new(engine.clone(), registry_for(&executor, &["agent_message", "task"]), &config);
    Scheduler::new(engine.clone(), &config)
        .with_worker_id("w1")
        .claim(&graph, 10)
        .unwrap();

    let report = runner.run(&graph, &b, "w1").await.unwrap();
    assert_eq!(report.state, NodeState::Rejected);
    assert_eq!(report.skipped.len(), 2);
    assert!(report.skipped.contains(&c) && report.skipped.contains(&d));
    for id in [&c, &d] {
        let node = engine.node(&graph, id).unwrap();
        assert_eq!(node.state, NodeState::Skipped);
        assert!(node.error.is_some());
    }
    assert_eq!(engine.node(&graph, &b).unwrap().error.as_deref(), Some("policy refused"));

    // The skipped tail is a settled non-reply leaf, so it gets a reply.
    assert_eq!(report.repaired.len(), 1);
    let repair = engine.node(&graph, &report.repaired[0]).unwrap();
    assert_eq!(repair.metadata["repairs_node_id"], d.as_str());
    assert_eq!(sink.count(EventType::LeafInvariantRepaired), 1);
    assert_eq!(executor.seen().len(), 1);
}

#[tokio::test]
async fn test_expired_lease_reclaimed_and_late_result_discarded() {
    let (engine, sink) = test_engine();
    let graph = engine.create_graph(Map::new()).unwrap().id;
    let a = chain(&engine, &graph, &["user_message"], NodeState::Finished).remove(0);
    let b = pending_after(&engine, &graph, &a, "agent_message", EdgeType::Sequence);
    let c = pending_after(&engine, &graph, &b, "task", EdgeType::Dependency);

    let expiring = SchedulerConfig {
        lease_seconds: 0,
        ..SchedulerConfig::default()
    };
    let stale = Scheduler::new(engine.clone(), &expiring).with_worker_id("w-stale");
    assert_eq!(stale.claim(&graph, 10).unwrap().len(), 1);

    let audit = GraphAudit::new(engine.clone());
    assert!(!audit.scan(&graph).unwrap().is_clean());

    let reclaimed = stale.reclaim(&graph).unwrap();
    assert_eq!(reclaimed, vec![b.clone()]);
    let node = engine.node(&graph, &b).unwrap();
    assert_eq!(node.state, NodeState::Errored);
    assert_eq!(node.error.as_deref(), Some(LEASE_EXPIRED_REASON));
    assert_eq!(engine.node(&graph, &c).unwrap().state, NodeState::Skipped);

    let executor = Arc::new(ScriptedExecutor::new());
    let runner = Runner::new(engine.clone(), registry_for(&executor, &["agent_message"]), &expiring);
    let report = runner.run(&graph, &b, "w-stale").await.unwrap();
    assert!(!report.transitioned);
    assert_eq!(report.state, NodeState::Errored);
    assert!(executor.seen().is_empty());

    let reasons: Vec<String> = sink
        .of_type(EventType::NodeStateChanged)
        .iter()
        .filter(|e| e.subject_id == b.as_str())
        .filter_map(|e| e.particulars["reason"].as_str().map(String::from))
        .collect();
    assert_eq!(reasons, vec![LEASE_EXPIRED_REASON.to_string()]);
}
