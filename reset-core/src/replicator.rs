use reset_contracts::{ExecutionCache, HistoryBranchClient, TaskNotifier};
use reset_replay::ReplayEngine;
use reset_state::StateBuilder;
use reset_types::event::DecisionTaskFailedCause;
use reset_types::state::PendingActivityInfo;
use reset_types::{
	ClusterName, DomainId, EventAttributes, HistoryEvent, ResetConfig, ResetError, ResetResult,
	RunId, Task, WorkflowExecution, WorkflowId,
};

use crate::timers::generate_timer_tasks_for_reset;

/// An incoming `ApplyResetEvent` replication payload: the event stream a reset on
/// the active cluster produced for the new run, starting with the `DecisionTaskFailed`
/// event that named the reset. Reproducing this run's state locally does not invoke
/// the orchestrator; it only needs the same replay engine the orchestrator itself
/// uses, which is what makes the two clusters converge deterministically.
#[derive(Debug, Clone)]
pub struct ApplyResetEventRequest {
	pub domain_id: DomainId,
	pub workflow_id: WorkflowId,
	pub current_run_id: RunId,
	pub new_run_id: RunId,
	pub history: Vec<HistoryEvent>,
	pub source_cluster: ClusterName,
}

/// Reproduces an active cluster's reset on a passive cluster from a replication
/// stream alone, without ever calling [`crate::orchestrator::ResetOrchestrator`].
pub struct ResetReplicator<'a> {
	history: &'a dyn HistoryBranchClient,
	cache: &'a dyn ExecutionCache,
	tasks: &'a dyn TaskNotifier,
	config: ResetConfig,
}

impl<'a> ResetReplicator<'a> {
	pub fn new(
		history: &'a dyn HistoryBranchClient,
		cache: &'a dyn ExecutionCache,
		tasks: &'a dyn TaskNotifier,
		config: ResetConfig,
	) -> Self {
		ResetReplicator {
			history,
			cache,
			tasks,
			config,
		}
	}

	#[tracing::instrument(skip_all, fields(
		domain_id = %request.domain_id,
		workflow_id = %request.workflow_id,
		new_run_id = %request.new_run_id,
	))]
	pub async fn apply_reset_event(&self, request: &ApplyResetEventRequest) -> ResetResult<()> {
		// Validation: the first event must be the reset's DecisionTaskFailed, naming
		// this run as its NewRunID.
		let first = request
			.history
			.first()
			.ok_or_else(|| ResetError::BadRequest("empty replication history".to_string()))?;
		let (base_run_id, fork_event_version, new_run_id_in_event) = match &first.attributes {
			EventAttributes::DecisionTaskFailed {
				cause: DecisionTaskFailedCause::ResetWorkflow,
				base_run_id,
				new_run_id,
				fork_event_version,
				..
			} => (*base_run_id, *fork_event_version, *new_run_id),
			_ => return Err(ResetError::BadRequest("unknown replication task".to_string())),
		};
		if new_run_id_in_event != request.new_run_id {
			return Err(ResetError::BadRequest(
				"replication task NewRunID does not match request".to_string(),
			));
		}
		let decision_finish_event_id = first.event_id;

		// Loading: base run must already have replayed far enough for this reset to
		// be reproducible.
		let base_execution = WorkflowExecution::new(
			request.domain_id.clone(),
			request.workflow_id.clone(),
			base_run_id,
		);
		let base_handle = self
			.cache
			.acquire(&base_execution, self.config.cache_acquire_timeout)
			.await?;
		if base_handle.state().execution_info.next_event_id < decision_finish_event_id {
			return Err(ResetError::RetryTask {
				domain_id: request.domain_id.clone(),
				workflow_id: request.workflow_id.clone(),
				run_id: request.new_run_id,
				first_event_id: base_handle.state().execution_info.next_event_id,
			});
		}

		// The current run's own transition was already applied independently by the
		// active cluster's replication stream; this acquisition only enforces the
		// same per-workflow locking discipline the active path uses, so the two
		// cannot race against each other.
		let _current_handle = if request.current_run_id != base_run_id {
			Some(
				self.cache
					.acquire(
						&WorkflowExecution::new(
							request.domain_id.clone(),
							request.workflow_id.clone(),
							request.current_run_id,
						),
						self.config.cache_acquire_timeout,
					)
					.await?,
			)
		} else {
			None
		};

		let base_branch_token = base_handle.state().execution_info.branch_token.clone();
		let base_next_event_id = base_handle.state().execution_info.next_event_id;
		let replication_enabled = base_handle.state().replication_state.is_some();
		drop(base_handle);

		// Replay + apply: rebuild the same state the active cluster had at the
		// boundary, then confirm it agrees with the incoming event's ForkEventVersion.
		let replay_engine = ReplayEngine::new(self.history, self.config.history_page_size);
		let replay_output = replay_engine
			.replay(
				request.domain_id.clone(),
				request.workflow_id.clone(),
				&base_branch_token,
				base_next_event_id,
				decision_finish_event_id,
				request.new_run_id,
				replication_enabled,
				first.timestamp_nanos,
			)
			.await?;

		if replay_output.fork_event_version != fork_event_version {
			return Err(ResetError::RetryTask {
				domain_id: request.domain_id.clone(),
				workflow_id: request.workflow_id.clone(),
				run_id: request.new_run_id,
				first_event_id: base_next_event_id,
			});
		}

		let mut rebuilt = replay_output.rebuilt_state;

		// Forcing the in-flight decision's attempt to 0 before the incoming
		// DecisionTaskFailed clears it mirrors the active path exactly, even though
		// the clear that follows makes it locally unobservable.
		if let Some(decision) = rebuilt.decision.as_mut() {
			decision.attempt = 0;
		}

		// Append received history: install the active cluster's own event stream
		// rather than re-deriving one, so both clusters end up with byte-identical
		// history for the new run.
		StateBuilder::apply_batch(&mut rebuilt, &request.history)?;
		let last_event = request
			.history
			.last()
			.expect("validated non-empty above");
		rebuilt.execution_info.next_event_id = last_event.event_id + 1;

		// Tasks: schedule unstarted activities, same invariant as the active path.
		let mut new_transfer_tasks = Vec::new();
		let unstarted: Vec<PendingActivityInfo> =
			rebuilt.unstarted_activities().cloned().collect();
		for activity in &unstarted {
			new_transfer_tasks.push(Task::Activity {
				domain_id: request.domain_id.clone(),
				task_list: activity.task_list.clone(),
				schedule_id: activity.schedule_id,
			});
		}
		if rebuilt.started_activities().next().is_some() {
			return Err(ResetError::InternalServiceError(
				"activity remains started after applying replicated reset".to_string(),
			));
		}

		let decision_schedule_id = rebuilt
			.decision
			.as_ref()
			.map(|d| d.schedule_id)
			.ok_or_else(|| {
				ResetError::InternalServiceError(
					"replicated reset history did not schedule a decision".to_string(),
				)
			})?;
		new_transfer_tasks.push(Task::Decision {
			domain_id: request.domain_id.clone(),
			task_list: "default".to_string(),
			schedule_id: decision_schedule_id,
			record_visibility: true,
		});

		let need_activity_timer = !unstarted.is_empty();
		let new_timer_tasks = generate_timer_tasks_for_reset(
			&rebuilt,
			last_event.timestamp_nanos,
			rebuilt.execution_info.workflow_task_timeout_secs,
			need_activity_timer,
		);

		// Fork history at the same boundary the active cluster forked at.
		let fork_info = format!(
			"{}:{}:{}",
			request.domain_id, request.workflow_id, request.new_run_id
		);
		let new_branch_token = self
			.history
			.fork(&base_branch_token, decision_finish_event_id, fork_info)
			.await?;
		rebuilt.execution_info.branch_token = new_branch_token.clone();

		// Persist: no close/cleanup tasks and no current-run replication tasks here,
		// since the active cluster already produced and sent those independently.
		let new_execution = WorkflowExecution::new(
			request.domain_id.clone(),
			request.workflow_id.clone(),
			request.new_run_id,
		);
		let outcome = self.cache.insert(new_execution, rebuilt).await;

		let fork_success = outcome.is_ok();
		self.history
			.complete_fork_branch(&new_branch_token, fork_success)
			.await?;
		outcome?;

		self.tasks
			.notify_transfer_tasks(&request.source_cluster, &new_transfer_tasks)
			.await?;
		self.tasks
			.notify_timer_tasks(&request.source_cluster, &new_timer_tasks)
			.await?;

		Ok(())
	}
}
