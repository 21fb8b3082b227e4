//! End-to-end tests for the orchestration engine.
//!
//! Every test runs against its own SQLite file in a temp dir and drives the
//! engine through [`Orchestrator`], with `MockNode`/`MockCompensation`
//! standing in for real handlers.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::task::JoinSet;
use uuid::Uuid;

use db::models::{CompensationStatus, RunRow, RunStatus, RunStepRow, StepStatus};
use db::repository::{locks, runs, steps};
use db::DbPool;
use nodes::mock::{MockCompensation, MockNode};
use queue::Job;
use nodes::{HandlerRegistry, NodeError, RetryPolicy, RetryingHandler, StepContext, StepHandler, StepOutcome};

use crate::{
    CompensationScope, EngineError, FireOutcome, NewRun, NewWorkflow, Orchestrator, OrchestratorConfig,
    RegisteredWorkflow, SignalMatching, Worker,
};

// ============================================================
// Fixtures
// ============================================================

async fn setup_with(
    registry: HandlerRegistry,
    config: OrchestratorConfig,
) -> (tempfile::TempDir, DbPool, Orchestrator) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("engine.db").display());
    let pool = DbPool::connect(&url, 4).await.unwrap();
    let orch = Orchestrator::new(pool.clone(), registry, config);
    (dir, pool, orch)
}

async fn setup(registry: HandlerRegistry) -> (tempfile::TempDir, DbPool, Orchestrator) {
    setup_with(registry, OrchestratorConfig::default()).await
}

async fn register(orch: &Orchestrator, definition: &str) -> RegisteredWorkflow {
    let name = format!("wf-{}", Uuid::new_v4());
    orch.register_workflow(NewWorkflow::new(name, "1", definition))
        .await
        .expect("definition should register")
}

/// Start a run and drive it the way a worker would on its first `Advance`.
async fn start(orch: &Orchestrator, workflow: &RegisteredWorkflow) -> Uuid {
    let summary = orch
        .start_run(NewRun {
            workflow_id: workflow.id,
            inputs: json!({ "order": 42 }),
            ..Default::default()
        })
        .await
        .expect("run should start");
    assert_eq!(summary.status, RunStatus::Pending);
    orch.advance(summary.run_id).await.expect("run should advance");
    summary.run_id
}

/// Create a run with all steps pending, without advancing it.
async fn seed_run(pool: &DbPool, workflow: &RegisteredWorkflow) -> Uuid {
    let run = RunRow {
        id: Uuid::new_v4(),
        workflow_id: workflow.id,
        version: workflow.version.clone(),
        status: RunStatus::Pending,
        tenant: None,
        caller: None,
        inputs: json!({}),
        error: None,
        started_at: None,
        ended_at: None,
        created_at: Utc::now(),
    };
    runs::insert_run(&pool.writer, &run).await.unwrap();

    for (position, node) in workflow.dag.nodes.iter().enumerate() {
        let step = RunStepRow {
            id: Uuid::new_v4(),
            run_id: run.id,
            step_id: node.id.clone(),
            position: position as u32,
            step_type: node.step_type.clone(),
            status: StepStatus::Pending,
            attempt: 0,
            recovered: false,
            wait_signal: None,
            signals: json!([]),
            input: None,
            output: None,
            error: None,
            started_at: None,
            ended_at: None,
        };
        steps::insert_step(&pool.writer, &step).await.unwrap();
    }
    run.id
}

struct SlowNode;

#[async_trait]
impl StepHandler for SlowNode {
    async fn execute(&self, _ctx: &StepContext) -> Result<StepOutcome, NodeError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(StepOutcome::Completed(Value::Null))
    }

    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_millis(20))
    }
}

struct PanickingNode;

#[async_trait]
impl StepHandler for PanickingNode {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome, NodeError> {
        panic!("handler for {} blew up", ctx.step_id);
    }
}

// ============================================================
// Registration
// ============================================================

#[tokio::test]
async fn registered_workflow_keeps_compiled_edges() {
    let (_dir, _pool, orch) = setup(HandlerRegistry::with_builtins()).await;
    let wf = register(
        &orch,
        "steps:\n  - { id: A, type: noop }\n  - { id: B, type: noop, depends_on: A }\n  - { id: C, type: noop, depends_on: [A, B] }\n",
    )
    .await;

    let stored = orch.get_workflow(wf.id).await.unwrap();
    let mut edges: Vec<(String, String)> = stored.dag.edges.iter().map(|e| (e.from.clone(), e.to.clone())).collect();
    edges.sort();
    assert_eq!(
        edges,
        vec![
            ("A".to_owned(), "B".to_owned()),
            ("A".to_owned(), "C".to_owned()),
            ("B".to_owned(), "C".to_owned()),
        ]
    );
    assert_eq!(stored.dag, wf.dag);
}

#[tokio::test]
async fn duplicate_name_and_version_conflicts() {
    let (_dir, _pool, orch) = setup(HandlerRegistry::with_builtins()).await;
    let def = "steps:\n  - { id: a, type: noop }\n";
    orch.register_workflow(NewWorkflow::new("billing", "1", def)).await.unwrap();

    let err = orch.register_workflow(NewWorkflow::new("billing", "1", def)).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));

    orch.register_workflow(NewWorkflow::new("billing", "2", def)).await.unwrap();
    assert_eq!(orch.list_workflows(Some("billing"), None).await.unwrap().len(), 2);
    assert_eq!(orch.list_workflows(Some("billing"), Some("2")).await.unwrap().len(), 1);
}

#[tokio::test]
async fn invalid_definition_is_not_stored() {
    let (_dir, _pool, orch) = setup(HandlerRegistry::with_builtins()).await;
    let err = orch
        .register_workflow(NewWorkflow::new(
            "loop",
            "1",
            "steps:\n  - { id: A, type: noop, depends_on: B }\n  - { id: B, type: noop, depends_on: A }\n",
        ))
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Compile(_)));
    assert!(orch.list_workflows(Some("loop"), None).await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_ids_are_reported() {
    let (_dir, _pool, orch) = setup(HandlerRegistry::with_builtins()).await;
    let ghost = Uuid::new_v4();

    assert!(matches!(orch.get_workflow(ghost).await, Err(EngineError::WorkflowNotFound(id)) if id == ghost));
    assert!(matches!(
        orch.start_run(NewRun { workflow_id: ghost, ..Default::default() }).await,
        Err(EngineError::WorkflowNotFound(_))
    ));
    assert!(matches!(orch.get_run(ghost).await, Err(EngineError::RunNotFound(_))));
    assert!(matches!(orch.cancel_run(ghost).await, Err(EngineError::RunNotFound(_))));
    assert!(matches!(orch.send_signal(ghost, "x", Value::Null).await, Err(EngineError::RunNotFound(_))));
}

// ============================================================
// Execution
// ============================================================

#[tokio::test]
async fn diamond_runs_every_step_after_its_predecessors() {
    let step = MockNode::delayed("step", Duration::from_millis(15), json!({ "ok": true }));
    let registry = HandlerRegistry::with_builtins().with_handler("step", step.clone());
    let (_dir, _pool, orch) = setup(registry).await;

    let wf = register(
        &orch,
        r#"
steps:
  - { id: a, type: step }
  - { id: b, type: step, depends_on: a }
  - { id: c, type: step, depends_on: a }
  - { id: d, type: step, depends_on: [b, c] }
"#,
    )
    .await;
    let run_id = start(&orch, &wf).await;

    let run = orch.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.ended_at.is_some());
    assert_eq!(step.call_count(), 4);
    assert_eq!(orch.list_runs(wf.id).await.unwrap()[0].run_id, run_id);

    for edge in &wf.dag.edges {
        let from = run.step(&edge.from).unwrap();
        let to = run.step(&edge.to).unwrap();
        assert!(
            from.ended_at.unwrap() <= to.started_at.unwrap(),
            "{} started before {} ended",
            edge.to,
            edge.from
        );
    }
    for s in &run.steps {
        assert_eq!(s.status, StepStatus::Completed);
        assert_eq!(s.attempt, 1);
        assert_eq!(s.output.as_ref().unwrap()["node"], "step");
    }
}

#[tokio::test]
async fn start_run_queues_work_instead_of_running_it() {
    let step = MockNode::delayed("step", Duration::from_millis(200), json!({}));
    let registry = HandlerRegistry::with_builtins().with_handler("step", step.clone());
    let (_dir, _pool, orch) = setup(registry).await;
    let wf = register(&orch, "steps:\n  - { id: a, type: step }\n  - { id: b, type: step }\n").await;

    let summary = orch
        .start_run(NewRun {
            workflow_id: wf.id,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(summary.status, RunStatus::Pending);
    assert_eq!(step.call_count(), 0);

    let claimed = orch.queue().next_due().await.unwrap().unwrap();
    assert_eq!(claimed.job, Job::Advance { run_id: summary.run_id });

    assert_eq!(orch.advance(summary.run_id).await.unwrap().status, RunStatus::Completed);
    assert_eq!(step.call_count(), 2);
}

#[tokio::test]
async fn handler_sees_inputs_and_upstream_outputs() {
    let first = MockNode::returning("first", json!({ "total": 99 }));
    let second = MockNode::returning("second", json!({}));
    let registry = HandlerRegistry::with_builtins()
        .with_handler("first", first.clone())
        .with_handler("second", second.clone());
    let (_dir, _pool, orch) = setup(registry).await;

    let wf = register(
        &orch,
        "steps:\n  - { id: price, type: first, output_var: total }\n  - { id: bill, type: second, input: { fixed: true } }\n",
    )
    .await;
    let run_id = start(&orch, &wf).await;

    assert_eq!(first.calls_for("price")[0].input, json!({ "order": 42 }));
    assert_eq!(second.calls_for("bill")[0].input, json!({ "fixed": true }));

    let vars = orch.run_vars(run_id).await.unwrap();
    assert_eq!(vars["total"], json!({ "node": "first", "total": 99 }));
}

#[tokio::test]
async fn concurrent_advances_dispatch_each_step_once() {
    let step = MockNode::delayed("step", Duration::from_millis(50), json!({}));
    let registry = HandlerRegistry::with_builtins().with_handler("step", step.clone());
    let (_dir, pool, orch) = setup(registry).await;

    let wf = register(
        &orch,
        "steps:\n  - { id: a, type: step }\n  - { id: b, type: step, depends_on: [] }\n  - { id: c, type: step, depends_on: [a, b] }\n",
    )
    .await;
    let run_id = seed_run(&pool, &wf).await;

    let mut set = JoinSet::new();
    for _ in 0..8 {
        let orch = orch.clone();
        set.spawn(async move { orch.advance(run_id).await });
    }
    while let Some(joined) = set.join_next().await {
        joined.unwrap().unwrap();
    }

    // A dispatcher that lost every claim may return before the winner
    // finishes, so drive the run to rest once more.
    orch.advance(run_id).await.unwrap();

    assert_eq!(step.calls_for("a").len(), 1);
    assert_eq!(step.calls_for("b").len(), 1);
    assert_eq!(step.calls_for("c").len(), 1);
    assert_eq!(orch.get_run(run_id).await.unwrap().status, RunStatus::Completed);
}

#[tokio::test]
async fn advancing_a_terminal_run_is_a_no_op() {
    let step = MockNode::returning("step", json!({}));
    let registry = HandlerRegistry::with_builtins().with_handler("step", step.clone());
    let (_dir, _pool, orch) = setup(registry).await;
    let wf = register(&orch, "steps:\n  - { id: a, type: step }\n").await;
    let run_id = start(&orch, &wf).await;

    let summary = orch.advance(run_id).await.unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(step.call_count(), 1);
}

#[tokio::test]
async fn retrying_handler_absorbs_transient_failures() {
    let flaky = MockNode::flaky("flaky", 2, json!({ "done": true }));
    let handler = RetryingHandler::new(
        flaky.clone(),
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
        },
    );
    let registry = HandlerRegistry::with_builtins().with_handler("flaky", handler);
    let (_dir, _pool, orch) = setup(registry).await;

    let wf = register(&orch, "steps:\n  - { id: call, type: flaky }\n").await;
    let run_id = start(&orch, &wf).await;

    let run = orch.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.step("call").unwrap().attempt, 1);
    assert_eq!(flaky.call_count(), 3);
}

// ============================================================
// Failures
// ============================================================

#[tokio::test]
async fn unregistered_step_type_fails_the_run() {
    let (_dir, _pool, orch) = setup(HandlerRegistry::with_builtins()).await;
    let wf = register(&orch, "steps:\n  - { id: a, type: noop }\n  - { id: b, type: mystery }\n").await;
    let run_id = start(&orch, &wf).await;

    let run = orch.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    let b = run.step("b").unwrap();
    assert_eq!(b.status, StepStatus::Failed);
    assert!(b.error.as_deref().unwrap().contains("no handler registered for step type 'mystery'"));
    assert!(run.error.as_deref().unwrap().starts_with("step 'b' failed"));
}

#[tokio::test]
async fn handler_timeout_fails_the_step() {
    let registry = HandlerRegistry::with_builtins().with_handler("slow", SlowNode);
    let (_dir, _pool, orch) = setup(registry).await;
    let wf = register(&orch, "steps:\n  - { id: s, type: slow }\n").await;
    let run_id = start(&orch, &wf).await;

    let run = orch.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.step("s").unwrap().error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn panicking_handler_fails_the_step() {
    let registry = HandlerRegistry::with_builtins().with_handler("boom", PanickingNode);
    let (_dir, _pool, orch) = setup(registry).await;
    let wf = register(&orch, "steps:\n  - { id: p, type: boom }\n  - { id: q, type: noop }\n").await;
    let run_id = start(&orch, &wf).await;

    let run = orch.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.step("p").unwrap().error.as_deref().unwrap().contains("panicked"));
    assert_eq!(run.step("q").unwrap().status, StepStatus::Pending);
}

#[tokio::test]
async fn unsatisfiable_step_deadlocks_the_run() {
    let (_dir, pool, orch) = setup(HandlerRegistry::with_builtins()).await;
    let wf = register(&orch, "steps:\n  - { id: a, type: noop }\n  - { id: b, type: noop }\n").await;
    let run_id = seed_run(&pool, &wf).await;

    // `a` failed without the run being told, e.g. by a manual repair.
    let now = Utc::now();
    assert!(steps::claim(&pool.writer, run_id, "a", now).await.unwrap());
    assert!(steps::fail(&pool.writer, run_id, "a", "manual", now).await.unwrap());

    let summary = orch.advance(run_id).await.unwrap();
    assert_eq!(summary.status, RunStatus::Failed);
    let run = orch.get_run(run_id).await.unwrap();
    assert_eq!(run.error.as_deref(), Some("deadlock: stalled steps [b]"));
}

// ============================================================
// Saga compensation
// ============================================================

#[tokio::test]
async fn failed_step_is_compensated_alone() {
    let undo = MockCompensation::succeeding();
    let registry = HandlerRegistry::with_builtins()
        .with_handler("charge", MockNode::returning("charge", json!({ "charged": 10 })))
        .with_compensation("refund", undo.clone());
    let (_dir, _pool, orch) = setup(registry).await;

    let wf = register(
        &orch,
        "steps:\n  - { id: A, type: charge, compensation: refund }\n  - { id: B, type: fail, message: out of stock }\n",
    )
    .await;
    let run_id = start(&orch, &wf).await;

    let run = orch.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.step("A").unwrap().status, StepStatus::Completed);
    assert_eq!(run.step("B").unwrap().status, StepStatus::Failed);

    let rows = orch.compensations(run_id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].step_id, "B");
    assert_eq!(rows[0].action, None);
    assert_eq!(rows[0].status, CompensationStatus::Created);
    assert!(undo.compensated_steps().is_empty());
}

#[tokio::test]
async fn compensation_outcome_is_recorded() {
    let cases = [
        (MockCompensation::succeeding(), CompensationStatus::Done, None),
        (MockCompensation::failing(), CompensationStatus::Failed, Some("could not undo B")),
        (MockCompensation::panicking(), CompensationStatus::Failed, Some("compensation action panicked")),
    ];

    for (action, status, error) in cases {
        let registry = HandlerRegistry::with_builtins().with_compensation("release", action.clone());
        let (_dir, _pool, orch) = setup(registry).await;
        let wf = register(&orch, "steps:\n  - { id: A, type: noop }\n  - { id: B, type: fail, compensation: release }\n").await;
        let run_id = start(&orch, &wf).await;

        assert_eq!(orch.get_run(run_id).await.unwrap().status, RunStatus::Failed);
        let rows = orch.compensations(run_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].action.as_deref(), Some("release"));
        assert_eq!(rows[0].status, status);
        match error {
            Some(text) => assert!(rows[0].error.as_deref().unwrap().contains(text)),
            None => assert!(rows[0].error.is_none()),
        }
        assert_eq!(action.compensated_steps(), vec!["B".to_owned()]);
    }
}

#[tokio::test]
async fn unregistered_compensation_is_a_failed_row() {
    let (_dir, _pool, orch) = setup(HandlerRegistry::with_builtins()).await;
    let wf = register(&orch, "steps:\n  - { id: B, type: fail, compensation: nowhere }\n").await;
    let run_id = start(&orch, &wf).await;

    let rows = orch.compensations(run_id).await.unwrap();
    assert_eq!(rows[0].status, CompensationStatus::Failed);
    assert_eq!(
        rows[0].error.as_deref(),
        Some("no compensation action registered as 'nowhere'")
    );
}

#[tokio::test]
async fn unwind_scope_compensates_completed_steps_latest_first() {
    let undo = MockCompensation::succeeding();
    let registry = HandlerRegistry::with_builtins().with_compensation("undo", undo.clone());
    let config = OrchestratorConfig {
        compensation_scope: CompensationScope::Unwind,
        ..Default::default()
    };
    let (_dir, _pool, orch) = setup_with(registry, config).await;

    let wf = register(
        &orch,
        r#"
steps:
  - { id: reserve, type: noop, compensation: undo }
  - { id: notify, type: noop }
  - { id: charge, type: noop, compensation: undo }
  - { id: ship, type: fail, compensation: undo }
"#,
    )
    .await;
    let run_id = start(&orch, &wf).await;

    assert_eq!(orch.get_run(run_id).await.unwrap().status, RunStatus::Failed);
    assert_eq!(undo.compensated_steps(), vec!["ship", "charge", "reserve"]);
    assert_eq!(orch.compensations(run_id).await.unwrap().len(), 3);
}

// ============================================================
// Signals
// ============================================================

#[tokio::test]
async fn signal_resumes_the_waiting_step_once() {
    let (_dir, _pool, orch) = setup(HandlerRegistry::with_builtins()).await;
    let wf = register(
        &orch,
        "steps:\n  - { id: approve, type: wait_for_signal, signal: approved }\n  - { id: ship, type: noop }\n",
    )
    .await;
    let run_id = start(&orch, &wf).await;

    let run = orch.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::WaitingForSignal);
    assert_eq!(run.step("approve").unwrap().status, StepStatus::WaitingForSignal);
    assert_eq!(run.step("ship").unwrap().status, StepStatus::Pending);

    assert!(orch.send_signal(run_id, "approved", json!({ "by": "ops" })).await.unwrap());
    assert_eq!(orch.advance(run_id).await.unwrap().status, RunStatus::Completed);

    let run = orch.get_run(run_id).await.unwrap();
    let approve = run.step("approve").unwrap();
    assert_eq!(approve.attempt, 2);
    assert_eq!(approve.output.as_ref().unwrap()["payload"], json!({ "by": "ops" }));

    assert!(!orch.send_signal(run_id, "approved", json!({})).await.unwrap());

    let log = orch.signals(run_id).await.unwrap();
    assert_eq!(log.iter().map(|s| s.handled).collect::<Vec<_>>(), vec![true, false]);
}

#[tokio::test]
async fn unmatched_signal_falls_back_to_first_waiting_step() {
    let (_dir, _pool, orch) = setup(HandlerRegistry::with_builtins()).await;
    let wf = register(&orch, "steps:\n  - { id: gate, type: wait_for_signal, signal: approved }\n").await;
    let run_id = start(&orch, &wf).await;

    assert!(orch.send_signal(run_id, "ping", json!({})).await.unwrap());

    // The handler still wants `approved`, so it parks again.
    assert_eq!(orch.advance(run_id).await.unwrap().status, RunStatus::WaitingForSignal);
    let gate = orch.get_run(run_id).await.unwrap();
    assert_eq!(gate.step("gate").unwrap().status, StepStatus::WaitingForSignal);
}

#[tokio::test]
async fn strict_matching_ignores_unmatched_signals() {
    let config = OrchestratorConfig {
        signal_matching: SignalMatching::Strict,
        ..Default::default()
    };
    let (_dir, _pool, orch) = setup_with(HandlerRegistry::with_builtins(), config).await;
    let wf = register(&orch, "steps:\n  - { id: gate, type: wait_for_signal, signal: approved }\n").await;
    let run_id = start(&orch, &wf).await;

    assert!(!orch.send_signal(run_id, "ping", json!({})).await.unwrap());
    assert!(orch.send_signal(run_id, "approved", json!({})).await.unwrap());
    assert_eq!(orch.advance(run_id).await.unwrap().status, RunStatus::Completed);
}

// ============================================================
// Wait timers
// ============================================================

#[tokio::test]
async fn wait_step_resumes_when_its_timer_fires() {
    let (_dir, _pool, orch) = setup(HandlerRegistry::with_builtins()).await;
    let wf = register(&orch, "steps:\n  - { id: pause, type: wait, duration_ms: 20 }\n  - { id: after, type: noop }\n").await;
    let run_id = start(&orch, &wf).await;

    assert_eq!(orch.get_run(run_id).await.unwrap().status, RunStatus::WaitingForSignal);
    let timers = orch.timers().timers_for_run(run_id).await.unwrap();
    assert_eq!(timers.len(), 1);
    assert_eq!(timers[0].step_id, "pause");

    let outcome = orch.fire_timer(timers[0].id).await.unwrap();
    assert_eq!(outcome, FireOutcome::Triggered { resumed: true });
    assert_eq!(orch.fire_timer(timers[0].id).await.unwrap(), FireOutcome::AlreadyTriggered);

    assert_eq!(orch.advance(run_id).await.unwrap().status, RunStatus::Completed);
    let run = orch.get_run(run_id).await.unwrap();
    assert_eq!(run.step("pause").unwrap().output, Some(json!({ "waited_ms": 20 })));
}

#[tokio::test]
async fn timer_and_its_job_commit_with_the_parking_transaction() {
    let (_dir, pool, orch) = setup(HandlerRegistry::with_builtins()).await;
    let wf = register(&orch, "steps:\n  - { id: pause, type: wait, duration_ms: 10 }\n").await;
    let run_id = seed_run(&pool, &wf).await;

    let mut tx = pool.begin().await.unwrap();
    orch.timers()
        .schedule_in(&mut tx, run_id, "pause", Duration::from_millis(10), json!({}))
        .await
        .unwrap();
    db::rollback(tx).await.unwrap();
    assert!(orch.timers().timers_for_run(run_id).await.unwrap().is_empty());
    assert!(orch.queue().list().await.unwrap().is_empty());

    let mut tx = pool.begin().await.unwrap();
    let timer_id = orch
        .timers()
        .schedule_in(&mut tx, run_id, "pause", Duration::ZERO, json!({}))
        .await
        .unwrap();
    db::commit(tx).await.unwrap();
    assert_eq!(orch.timers().timers_for_run(run_id).await.unwrap()[0].id, timer_id);
    assert_eq!(orch.queue().next_due().await.unwrap().unwrap().job, Job::FireTimer { timer_id });
}

#[tokio::test]
async fn unknown_timer_is_an_error() {
    let (_dir, _pool, orch) = setup(HandlerRegistry::with_builtins()).await;
    assert!(matches!(
        orch.fire_timer(Uuid::new_v4()).await,
        Err(EngineError::TimerNotFound(_))
    ));
}

// ============================================================
// Cancellation
// ============================================================

#[tokio::test]
async fn cancellation_leaves_no_open_step() {
    let (_dir, pool, orch) = setup(HandlerRegistry::with_builtins()).await;
    let wf = register(
        &orch,
        "steps:\n  - { id: a, type: noop }\n  - { id: gate, type: wait_for_signal }\n  - { id: c, type: noop }\n",
    )
    .await;
    let run_id = start(&orch, &wf).await;

    let summary = orch.cancel_run(run_id).await.unwrap();
    assert_eq!(summary.status, RunStatus::Cancelled);

    let run = orch.get_run(run_id).await.unwrap();
    assert!(run.ended_at.is_some());
    assert!(run.steps.iter().all(|s| s.status.is_terminal()));
    assert_eq!(run.step("a").unwrap().status, StepStatus::Completed);
    assert_eq!(run.step("gate").unwrap().status, StepStatus::Cancelled);
    assert_eq!(run.step("c").unwrap().status, StepStatus::Skipped);
    assert!(locks::get_lock(&pool.reader, run_id, "gate").await.unwrap().is_none());

    // Idempotent, and nothing is left to signal or advance.
    assert_eq!(orch.cancel_run(run_id).await.unwrap().status, RunStatus::Cancelled);
    assert!(!orch.send_signal(run_id, "gate", json!({})).await.unwrap());
    assert_eq!(orch.advance(run_id).await.unwrap().status, RunStatus::Cancelled);
}

#[tokio::test]
async fn cancelling_mid_flight_discards_the_running_result() {
    let slow = MockNode::delayed("slow", Duration::from_millis(300), json!({ "late": true }));
    let registry = HandlerRegistry::with_builtins().with_handler("slow", slow.clone());
    let (_dir, pool, orch) = setup(registry).await;
    let wf = register(&orch, "steps:\n  - { id: a, type: slow }\n  - { id: b, type: noop }\n").await;
    let run_id = seed_run(&pool, &wf).await;

    let advancing = tokio::spawn({
        let orch = orch.clone();
        async move { orch.advance(run_id).await }
    });
    for _ in 0..100 {
        let run = orch.get_run(run_id).await.unwrap();
        if run.step("a").unwrap().status == StepStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(orch.get_run(run_id).await.unwrap().step("a").unwrap().status, StepStatus::Running);

    assert_eq!(orch.cancel_run(run_id).await.unwrap().status, RunStatus::Cancelled);
    assert_eq!(advancing.await.unwrap().unwrap().status, RunStatus::Cancelled);

    assert_eq!(slow.call_count(), 1);
    let run = orch.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    let a = run.step("a").unwrap();
    assert_eq!(a.status, StepStatus::Cancelled);
    assert!(a.output.is_none());
    assert_eq!(run.step("b").unwrap().status, StepStatus::Skipped);
    assert!(locks::get_lock(&pool.reader, run_id, "a").await.unwrap().is_none());
}

#[tokio::test]
async fn cancelling_a_finished_run_reports_its_status() {
    let (_dir, _pool, orch) = setup(HandlerRegistry::with_builtins()).await;
    let wf = register(&orch, "steps:\n  - { id: a, type: noop }\n").await;
    let run_id = start(&orch, &wf).await;

    assert_eq!(orch.cancel_run(run_id).await.unwrap().status, RunStatus::Completed);
}

// ============================================================
// Recovery
// ============================================================

#[tokio::test]
async fn orphaned_step_is_replayed_once_with_the_next_attempt() {
    let charge = MockNode::returning("charge", json!({ "charged": true }));
    let registry = HandlerRegistry::with_builtins().with_handler("charge", charge.clone());
    let (_dir, pool, orch) = setup(registry).await;

    let wf = register(&orch, "steps:\n  - { id: charge, type: charge }\n").await;
    let run_id = seed_run(&pool, &wf).await;

    // Simulate a dispatcher that claimed the step and then died.
    let now = Utc::now();
    {
        let mut conn = pool.writer.acquire().await.unwrap();
        let expires = now + chrono::Duration::hours(1);
        assert!(locks::try_acquire(&mut conn, run_id, "charge", "dead-token", expires, now).await.unwrap());
    }
    assert!(steps::claim(&pool.writer, run_id, "charge", now).await.unwrap());

    let report = orch.recover().await.unwrap();
    assert_eq!(report.steps_reset, 1);
    assert_eq!(report.runs, vec![run_id]);
    assert!(locks::get_lock(&pool.reader, run_id, "charge").await.unwrap().is_none());

    assert_eq!(orch.advance(run_id).await.unwrap().status, RunStatus::Completed);

    let calls = charge.calls_for("charge");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].attempt, 2);
    let run = orch.get_run(run_id).await.unwrap();
    assert_eq!(run.step("charge").unwrap().attempt, 2);
    assert_eq!(run.steps.len(), 1);

    // A second sweep finds nothing to reset.
    assert_eq!(orch.recover().await.unwrap().steps_reset, 0);
}

#[tokio::test]
async fn resumed_run_is_recovered_after_its_worker_dies() {
    let (_dir, _pool, orch) = setup(HandlerRegistry::with_builtins()).await;
    let wf = register(
        &orch,
        "steps:\n  - { id: gate, type: wait_for_signal, signal: go }\n  - { id: ship, type: noop }\n",
    )
    .await;
    let run_id = start(&orch, &wf).await;
    assert!(orch.send_signal(run_id, "go", json!({})).await.unwrap());

    // A worker claims every queued job and dies before finishing any.
    while orch.queue().next_due().await.unwrap().is_some() {}
    let run = orch.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::WaitingForSignal);
    assert_eq!(run.step("gate").unwrap().status, StepStatus::Pending);

    let report = orch.recover().await.unwrap();
    assert_eq!(report.steps_reset, 0);
    assert!(report.jobs_requeued >= 1);
    assert_eq!(report.runs, vec![run_id]);

    let worker = Worker::new(orch.clone());
    while worker.tick().await.unwrap() {}
    let run = orch.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.step("ship").unwrap().status, StepStatus::Completed);
}
