use std::collections::HashMap;

use reset_contracts::{
	FakeClusterMetadata, InMemoryExecutionCache, InMemoryHistoryBranchClient, RecordingTaskNotifier,
};
use reset_core::{ApplyResetEventRequest, ResetOrchestrator, ResetReplicator, ResetWorkflowRequest};
use reset_types::event::DecisionTaskFailedCause;
use reset_types::state::{DecisionState, ExecutionState, PendingActivityInfo};
use reset_types::{
	BranchToken, DomainId, EventAttributes, ExecutionInfo, HistoryEvent, MutableState, ResetConfig,
	ResetError, RunId, Task, WorkflowExecution, WorkflowId,
};

fn ev(id: i64, version: i64, attrs: EventAttributes) -> HistoryEvent {
	HistoryEvent::new(id, version, id * 1000, attrs)
}

/// Base history shared by the happy-path and domain-guard scenarios: a running
/// workflow whose decision loop has gone around twice, with one activity started
/// in between, about to have its second decision reset away.
fn base_history(version: i64) -> Vec<Vec<HistoryEvent>> {
	vec![
		vec![ev(
			1,
			version,
			EventAttributes::WorkflowExecutionStarted {
				workflow_task_timeout_secs: 30,
			},
		)],
		vec![ev(
			2,
			version,
			EventAttributes::DecisionTaskScheduled {
				task_list: "tl".to_string(),
			},
		)],
		vec![ev(3, version, EventAttributes::DecisionTaskStarted)],
		vec![ev(4, version, EventAttributes::DecisionTaskCompleted)],
		vec![ev(
			5,
			version,
			EventAttributes::ActivityTaskScheduled {
				schedule_id: 5,
				task_list: "activities".to_string(),
			},
		)],
		vec![ev(
			6,
			version,
			EventAttributes::ActivityTaskStarted { schedule_id: 5 },
		)],
		vec![ev(
			7,
			version,
			EventAttributes::DecisionTaskScheduled {
				task_list: "tl".to_string(),
			},
		)],
		vec![ev(8, version, EventAttributes::DecisionTaskStarted)],
	]
}

fn running_state(
	domain_id: DomainId,
	workflow_id: WorkflowId,
	run_id: RunId,
	branch_token: BranchToken,
	replication_state: Option<reset_types::ReplicationState>,
) -> MutableState {
	MutableState {
		execution_info: ExecutionInfo {
			domain_id,
			workflow_id,
			run_id,
			parent_run_id: None,
			workflow_task_timeout_secs: 30,
			state: ExecutionState::Running,
			branch_token,
			event_store_version_v2: true,
			create_request_id: String::new(),
			next_event_id: 9,
			last_first_event_id: 7,
			start_timestamp_nanos: 0,
			last_updated_timestamp_nanos: 8000,
			sticky_task_list: None,
		},
		replication_state,
		pending_activities: {
			let mut m = HashMap::new();
			m.insert(
				5,
				PendingActivityInfo {
					schedule_id: 5,
					started_id: Some(6),
					task_list: "activities".to_string(),
				},
			);
			m
		},
		pending_timers: Vec::new(),
		pending_child_executions: 0,
		buffered_events: Vec::new(),
		decision: Some(DecisionState {
			schedule_id: 7,
			started_id: Some(8),
			attempt: 0,
		}),
	}
}

#[tokio::test]
async fn happy_path_reset_of_running_workflow() {
	let history = InMemoryHistoryBranchClient::new();
	let cache = InMemoryExecutionCache::new();
	let cluster = FakeClusterMetadata::new("A");
	let notifier = RecordingTaskNotifier::new();
	let orchestrator = ResetOrchestrator::new(&history, &cache, &cluster, &notifier, ResetConfig::default());

	let domain_id = DomainId("dom".to_string());
	let workflow_id = WorkflowId::from("wf".to_string());
	let run_id = RunId::new();

	let token = history.seed(base_history(1));
	let execution = WorkflowExecution::new(domain_id.clone(), workflow_id.clone(), run_id);
	cache
		.seed(
			execution.clone(),
			running_state(domain_id.clone(), workflow_id.clone(), run_id, token, None),
		)
		.await;

	let request = ResetWorkflowRequest {
		domain_id: domain_id.clone(),
		workflow_id: workflow_id.clone(),
		base_run_id: run_id,
		current_run_id: run_id,
		decision_finish_event_id: 9,
		reason: "bad deployment".to_string(),
		request_id: "req-1".to_string(),
	};

	let response = orchestrator
		.reset_workflow_execution(request.clone(), 100_000)
		.await
		.expect("reset should succeed");

	// The original run is terminated in place.
	let old_state = cache.peek(&execution).await.expect("old run still cached");
	assert_eq!(old_state.execution_info.state, ExecutionState::Completed);

	// The new run replays the decision loop, fails the started activity, and
	// schedules a fresh decision with nothing left started.
	let new_execution = WorkflowExecution::new(domain_id.clone(), workflow_id.clone(), response.new_run_id);
	let new_state = cache.peek(&new_execution).await.expect("new run persisted");
	assert!(new_state.has_in_flight_decision());
	assert!(new_state.pending_activities.is_empty());
	assert_eq!(new_state.execution_info.next_event_id, 12);

	assert!(!history.is_pending_complete(&new_state.execution_info.branch_token));

	let transfer = notifier.transfer_tasks();
	// The active path never sets RecordVisibility; only the passive replicator does.
	assert!(transfer
		.iter()
		.any(|t| matches!(t, Task::Decision { record_visibility: false, .. })));
	assert!(transfer.iter().any(|t| matches!(t, Task::RecordWorkflowStarted)));
	assert!(transfer
		.iter()
		.any(|t| matches!(t, Task::Close { run_id: r, .. } if *r == run_id)));
	assert!(transfer
		.iter()
		.any(|t| matches!(t, Task::Cleanup { run_id: r, .. } if *r == run_id)));
	let timer = notifier.timer_tasks();
	assert!(timer.iter().any(|t| matches!(t, Task::WorkflowTimeout { .. })));

	// Repeating the same request id returns the cached response without acquiring
	// the (now terminated) current run again or emitting a second set of tasks.
	let repeated = orchestrator
		.reset_workflow_execution(request, 200_000)
		.await
		.expect("idempotent repeat should succeed");
	assert_eq!(repeated.new_run_id, response.new_run_id);
	assert_eq!(notifier.transfer_tasks().len(), transfer.len());
}

/// The current run's replication task must carry the event id of the
/// `WorkflowExecutionTerminated` event just appended to it as `first_event_id`,
/// not a stale 0 — mirroring the original's `setEventIDsWithHistory`.
#[tokio::test]
async fn replication_task_first_event_id_is_terminate_event() {
	let history = InMemoryHistoryBranchClient::new();
	let cache = InMemoryExecutionCache::new();
	let cluster = FakeClusterMetadata::new("A");
	let notifier = RecordingTaskNotifier::new();
	let orchestrator = ResetOrchestrator::new(&history, &cache, &cluster, &notifier, ResetConfig::default());

	let domain_id = DomainId("dom".to_string());
	let workflow_id = WorkflowId::from("wf".to_string());
	let run_id = RunId::new();

	let token = history.seed(base_history(50));
	let execution = WorkflowExecution::new(domain_id.clone(), workflow_id.clone(), run_id);
	let mut replication_state = reset_types::ReplicationState::new(50);
	replication_state.last_write_version = 50;
	cache
		.seed(
			execution.clone(),
			running_state(
				domain_id.clone(),
				workflow_id.clone(),
				run_id,
				token,
				Some(replication_state),
			),
		)
		.await;

	let request = ResetWorkflowRequest {
		domain_id: domain_id.clone(),
		workflow_id: workflow_id.clone(),
		base_run_id: run_id,
		current_run_id: run_id,
		decision_finish_event_id: 9,
		reason: "bad deployment".to_string(),
		request_id: "req-repl".to_string(),
	};

	orchestrator
		.reset_workflow_execution(request, 100_000)
		.await
		.expect("reset should succeed");

	// The current run's own history had next_event_id 9 before termination, so the
	// appended WorkflowExecutionTerminated event lands at event id 9.
	let transfer = notifier.transfer_tasks();
	let replication_task = transfer
		.iter()
		.find(|t| matches!(t, Task::HistoryReplication { reset_workflow: false, .. }))
		.expect("current run's replication task should have been emitted");
	match replication_task {
		Task::HistoryReplication {
			first_event_id,
			next_event_id,
			..
		} => {
			assert_eq!(*first_event_id, 9);
			assert_eq!(*next_event_id, 10);
		}
		_ => unreachable!(),
	}
}

#[tokio::test]
async fn domain_not_active_blocks_persistence() {
	let history = InMemoryHistoryBranchClient::new();
	let cache = InMemoryExecutionCache::new();
	// Versions below 100 are owned by cluster B; local cluster is A.
	let cluster = FakeClusterMetadata::new("A").with_range(100, "B");
	let notifier = RecordingTaskNotifier::new();
	let orchestrator = ResetOrchestrator::new(&history, &cache, &cluster, &notifier, ResetConfig::default());

	let domain_id = DomainId("dom".to_string());
	let workflow_id = WorkflowId::from("wf".to_string());
	let run_id = RunId::new();

	// The base history's WorkflowExecutionStarted carries failover version 99,
	// which seeds the rebuilt run's ReplicationState.CurrentVersion at 99.
	let token = history.seed(base_history(99));
	let execution = WorkflowExecution::new(domain_id.clone(), workflow_id.clone(), run_id);
	let mut replication_state = reset_types::ReplicationState::new(50);
	replication_state.last_write_version = 50;
	cache
		.seed(
			execution.clone(),
			running_state(
				domain_id.clone(),
				workflow_id.clone(),
				run_id,
				token,
				Some(replication_state),
			),
		)
		.await;

	let request = ResetWorkflowRequest {
		domain_id: domain_id.clone(),
		workflow_id: workflow_id.clone(),
		base_run_id: run_id,
		current_run_id: run_id,
		decision_finish_event_id: 9,
		reason: "bad deployment".to_string(),
		request_id: "req-1".to_string(),
	};

	let err = orchestrator
		.reset_workflow_execution(request, 100_000)
		.await
		.expect_err("reset should be blocked by the domain guard");

	match err {
		ResetError::DomainNotActive { active_cluster, .. } => {
			assert_eq!(active_cluster.0, "B");
		}
		other => panic!("expected DomainNotActive, got {other:?}"),
	}

	// Nothing was persisted: the original run is untouched (still Running), and
	// the forked branch was cleaned up instead of committed.
	let old_state = cache.peek(&execution).await.expect("old run still cached");
	assert_eq!(old_state.execution_info.state, ExecutionState::Running);
	assert!(notifier.transfer_tasks().is_empty());
	assert!(notifier.timer_tasks().is_empty());
}

fn minimal_running_state(
	domain_id: DomainId,
	workflow_id: WorkflowId,
	run_id: RunId,
	branch_token: BranchToken,
	next_event_id: i64,
) -> MutableState {
	MutableState {
		execution_info: ExecutionInfo {
			domain_id,
			workflow_id,
			run_id,
			parent_run_id: None,
			workflow_task_timeout_secs: 30,
			state: ExecutionState::Running,
			branch_token,
			event_store_version_v2: true,
			create_request_id: String::new(),
			next_event_id,
			last_first_event_id: 0,
			start_timestamp_nanos: 0,
			last_updated_timestamp_nanos: 0,
			sticky_task_list: None,
		},
		replication_state: None,
		pending_activities: HashMap::new(),
		pending_timers: Vec::new(),
		pending_child_executions: 0,
		buffered_events: Vec::new(),
		decision: None,
	}
}

/// S3: resetting further back than the latest run, where the base run continued
/// as new into the (distinct) current run. The chain walk must reach current_run
/// by reusing the handle the orchestrator already holds instead of acquiring the
/// execution cache a second time for the same execution, which would deadlock on
/// the non-reentrant per-execution lock.
#[tokio::test]
async fn chain_walk_reuses_already_held_current_run_handle() {
	let history = InMemoryHistoryBranchClient::new();
	let cache = InMemoryExecutionCache::new();
	let cluster = FakeClusterMetadata::new("A");
	let notifier = RecordingTaskNotifier::new();
	let orchestrator = ResetOrchestrator::new(&history, &cache, &cluster, &notifier, ResetConfig::default());

	let domain_id = DomainId("dom".to_string());
	let workflow_id = WorkflowId::from("wf".to_string());
	let base_run_id = RunId::new();
	let current_run_id = RunId::new();

	// Base history continues-as-new into current_run_id right at the boundary.
	let mut batches = base_history(1);
	batches.push(vec![ev(
		9,
		1,
		EventAttributes::WorkflowExecutionContinuedAsNew {
			new_execution_run_id: current_run_id,
		},
	)]);
	let base_token = history.seed(batches);
	let base_execution = WorkflowExecution::new(domain_id.clone(), workflow_id.clone(), base_run_id);
	let mut base_state =
		running_state(domain_id.clone(), workflow_id.clone(), base_run_id, base_token, None);
	base_state.execution_info.next_event_id = 10;
	cache.seed(base_execution.clone(), base_state).await;

	// Current run has its own short history with one signal that arrived after
	// the continuation, and is still running (so it gets terminated by (T)).
	let current_token = history.seed(vec![vec![ev(
		1,
		1,
		EventAttributes::WorkflowExecutionSignaled {
			signal_name: "late-signal".to_string(),
			input: None,
			identity: "client".to_string(),
		},
	)]]);
	let current_execution = WorkflowExecution::new(domain_id.clone(), workflow_id.clone(), current_run_id);
	cache
		.seed(
			current_execution.clone(),
			minimal_running_state(
				domain_id.clone(),
				workflow_id.clone(),
				current_run_id,
				current_token,
				2,
			),
		)
		.await;

	let request = ResetWorkflowRequest {
		domain_id: domain_id.clone(),
		workflow_id: workflow_id.clone(),
		base_run_id,
		current_run_id,
		decision_finish_event_id: 9,
		reason: "bad deployment".to_string(),
		request_id: "req-s3".to_string(),
	};

	let response = orchestrator
		.reset_workflow_execution(request, 100_000)
		.await
		.expect("reset should not deadlock walking the chain to the held current run");

	let new_execution = WorkflowExecution::new(domain_id.clone(), workflow_id.clone(), response.new_run_id);
	let new_state = cache.peek(&new_execution).await.expect("new run persisted");

	// (F) DecisionTaskFailed@9, (A) ActivityTaskFailed@10, the chain-walked
	// signal@11, (Δ) DecisionTaskScheduled@12: next_event_id lands on 13, which
	// only happens if the signal on current_run_id was actually found and replayed.
	assert_eq!(new_state.execution_info.next_event_id, 13);
	assert!(new_state.has_in_flight_decision());
	assert!(new_state.pending_activities.is_empty());

	let current_old_state = cache.peek(&current_execution).await.expect("current run still cached");
	assert_eq!(current_old_state.execution_info.state, ExecutionState::Completed);
}

#[tokio::test]
async fn passive_replicator_retries_when_base_behind() {
	let history = InMemoryHistoryBranchClient::new();
	let cache = InMemoryExecutionCache::new();
	let notifier = RecordingTaskNotifier::new();
	let config = ResetConfig::default();
	let replicator = ResetReplicator::new(&history, &cache, &notifier, config);

	let domain_id = DomainId("dom".to_string());
	let workflow_id = WorkflowId::from("wf".to_string());
	let base_run_id = RunId::new();
	let new_run_id = RunId::new();

	let token = history.seed(base_history(1));
	let mut lagging_state =
		running_state(domain_id.clone(), workflow_id.clone(), base_run_id, token, None);
	// Base has only caught up to event 6, short of decisionFinishEventID=9.
	lagging_state.execution_info.next_event_id = 6;
	cache
		.seed(
			WorkflowExecution::new(domain_id.clone(), workflow_id.clone(), base_run_id),
			lagging_state,
		)
		.await;

	let decision_failed = ev(
		9,
		1,
		EventAttributes::DecisionTaskFailed {
			cause: DecisionTaskFailedCause::ResetWorkflow,
			base_run_id,
			new_run_id,
			fork_event_version: 1,
			reason: "bad deployment".to_string(),
			identity: "history-service".to_string(),
		},
	);

	let request = ApplyResetEventRequest {
		domain_id: domain_id.clone(),
		workflow_id: workflow_id.clone(),
		current_run_id: base_run_id,
		new_run_id,
		history: vec![decision_failed],
		source_cluster: "B".into(),
	};

	let err = replicator
		.apply_reset_event(&request)
		.await
		.expect_err("base has not caught up yet");

	match err {
		ResetError::RetryTask { first_event_id, .. } => assert_eq!(first_event_id, 6),
		other => panic!("expected RetryTask, got {other:?}"),
	}
}

#[tokio::test]
async fn passive_replicator_converges_with_active_reset() {
	let history = InMemoryHistoryBranchClient::new();
	let cache = InMemoryExecutionCache::new();
	let cluster = FakeClusterMetadata::new("A");
	let notifier = RecordingTaskNotifier::new();
	let config = ResetConfig::default();

	let domain_id = DomainId("dom".to_string());
	let workflow_id = WorkflowId::from("wf".to_string());
	let base_run_id = RunId::new();

	let token = history.seed(base_history(1));
	let base_execution = WorkflowExecution::new(domain_id.clone(), workflow_id.clone(), base_run_id);
	cache
		.seed(
			base_execution.clone(),
			running_state(domain_id.clone(), workflow_id.clone(), base_run_id, token, None),
		)
		.await;

	// Produce a real reset on the "active" side first to get a realistic
	// DecisionTaskFailed plus trailing events to replicate.
	let active_orchestrator = ResetOrchestrator::new(&history, &cache, &cluster, &notifier, config.clone());
	let active_response = active_orchestrator
		.reset_workflow_execution(
			ResetWorkflowRequest {
				domain_id: domain_id.clone(),
				workflow_id: workflow_id.clone(),
				base_run_id,
				current_run_id: base_run_id,
				decision_finish_event_id: 9,
				reason: "bad deployment".to_string(),
				request_id: "req-active".to_string(),
			},
			100_000,
		)
		.await
		.expect("active reset should succeed");

	// Re-seed a second base fixture under a fresh run id to act as the passive
	// cluster's independent copy of the same base history, not yet caught up on
	// the new run.
	let passive_base_run_id = RunId::new();
	let passive_token = history.seed(base_history(1));
	cache
		.seed(
			WorkflowExecution::new(domain_id.clone(), workflow_id.clone(), passive_base_run_id),
			running_state(
				domain_id.clone(),
				workflow_id.clone(),
				passive_base_run_id,
				passive_token,
				None,
			),
		)
		.await;

	let new_execution = WorkflowExecution::new(domain_id.clone(), workflow_id.clone(), active_response.new_run_id);
	let active_new_state = cache.peek(&new_execution).await.expect("active new run persisted");

	let decision_failed = ev(
		9,
		1,
		EventAttributes::DecisionTaskFailed {
			cause: DecisionTaskFailedCause::ResetWorkflow,
			base_run_id: passive_base_run_id,
			new_run_id: active_response.new_run_id,
			fork_event_version: 1,
			reason: "bad deployment".to_string(),
			identity: "history-service".to_string(),
		},
	);
	let decision_scheduled = ev(
		11,
		1,
		EventAttributes::DecisionTaskScheduled {
			task_list: "default".to_string(),
		},
	);
	let activity_failed = ev(
		10,
		1,
		EventAttributes::ActivityTaskFailed {
			schedule_id: 5,
			started_id: 6,
			reason: "workflowReset".to_string(),
			details: None,
			identity: "history-service".to_string(),
		},
	);

	let replicator = ResetReplicator::new(&history, &cache, &notifier, config);
	let request = ApplyResetEventRequest {
		domain_id: domain_id.clone(),
		workflow_id: workflow_id.clone(),
		current_run_id: passive_base_run_id,
		new_run_id: active_response.new_run_id,
		history: vec![decision_failed, activity_failed, decision_scheduled],
		source_cluster: "A".into(),
	};

	replicator
		.apply_reset_event(&request)
		.await
		.expect("passive replication should converge");

	let passive_new_execution =
		WorkflowExecution::new(domain_id.clone(), workflow_id.clone(), active_response.new_run_id);
	let passive_new_state = cache
		.peek(&passive_new_execution)
		.await
		.expect("passive cluster persisted the replicated run");

	assert_eq!(
		passive_new_state.execution_info.next_event_id,
		active_new_state.execution_info.next_event_id
	);
	assert!(passive_new_state.pending_activities.is_empty());
	assert!(passive_new_state.has_in_flight_decision());
}
