use std::collections::HashMap;
use std::sync::Mutex;

use reset_contracts::{ClusterMetadata, ExecutionCache, HistoryBranchClient, TaskNotifier};
use reset_replay::{ReplayEngine, SignalWalker};
use reset_state::MutableStateBuilder;
use reset_types::state::PendingActivityInfo;
use reset_types::{
	DomainId, ResetConfig, ResetError, ResetResult, RunId, Task, WorkflowExecution, WorkflowId,
};

use crate::timers::generate_timer_tasks_for_reset;

/// A `ResetWorkflowExecution` request. `request_id` is a client-supplied
/// idempotency key: repeating a call with the same `(workflow_id, request_id)`
/// returns the first call's `new_run_id` without replaying or persisting again.
#[derive(Debug, Clone)]
pub struct ResetWorkflowRequest {
	pub domain_id: DomainId,
	pub workflow_id: WorkflowId,
	/// The run whose history is replayed as the basis for the reset.
	pub base_run_id: RunId,
	/// The run currently considered "current" for this workflow id. Equal to
	/// `base_run_id` unless resetting further back than the latest run.
	pub current_run_id: RunId,
	pub decision_finish_event_id: i64,
	pub reason: String,
	pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetWorkflowResponse {
	pub new_run_id: RunId,
}

/// Coordinates the active-cluster reset path: terminate the current run if
/// running, replay the base run up to the requested boundary, reconcile signals
/// that arrived after it, fork history, and persist atomically.
pub struct ResetOrchestrator<'a> {
	history: &'a dyn HistoryBranchClient,
	cache: &'a dyn ExecutionCache,
	cluster: &'a dyn ClusterMetadata,
	tasks: &'a dyn TaskNotifier,
	config: ResetConfig,
	idempotency: Mutex<HashMap<(WorkflowId, String), RunId>>,
}

impl<'a> ResetOrchestrator<'a> {
	pub fn new(
		history: &'a dyn HistoryBranchClient,
		cache: &'a dyn ExecutionCache,
		cluster: &'a dyn ClusterMetadata,
		tasks: &'a dyn TaskNotifier,
		config: ResetConfig,
	) -> Self {
		ResetOrchestrator {
			history,
			cache,
			cluster,
			tasks,
			config,
			idempotency: Mutex::new(HashMap::new()),
		}
	}

	#[tracing::instrument(skip_all, fields(
		domain_id = %request.domain_id,
		workflow_id = %request.workflow_id,
		base_run_id = %request.base_run_id,
		decision_finish_event_id = request.decision_finish_event_id,
	))]
	pub async fn reset_workflow_execution(
		&self,
		request: ResetWorkflowRequest,
		now_nanos: i64,
	) -> ResetResult<ResetWorkflowResponse> {
		let idempotency_key = (request.workflow_id.clone(), request.request_id.clone());
		if let Some(existing) = self.idempotency.lock().unwrap().get(&idempotency_key).copied() {
			tracing::debug!("returning cached reset response for repeated request id");
			return Ok(ResetWorkflowResponse { new_run_id: existing });
		}

		let response = self.reset_workflow_execution_inner(&request, now_nanos).await?;

		self.idempotency
			.lock()
			.unwrap()
			.insert(idempotency_key, response.new_run_id);
		Ok(response)
	}

	async fn reset_workflow_execution_inner(
		&self,
		request: &ResetWorkflowRequest,
		now_nanos: i64,
	) -> ResetResult<ResetWorkflowResponse> {
		let current_execution = WorkflowExecution::new(
			request.domain_id.clone(),
			request.workflow_id.clone(),
			request.current_run_id,
		);
		let base_execution = WorkflowExecution::new(
			request.domain_id.clone(),
			request.workflow_id.clone(),
			request.base_run_id,
		);

		// Acquired in canonical order, base before current when the two differ, so
		// this entry point and the replicator's never cross-deadlock on the cache.
		let same_run = request.base_run_id == request.current_run_id;
		let base_handle_owned = if same_run {
			None
		} else {
			Some(
				self.cache
					.acquire(&base_execution, self.config.cache_acquire_timeout)
					.await?,
			)
		};

		let mut curr_handle = self
			.cache
			.acquire(&current_execution, self.config.cache_acquire_timeout)
			.await?;

		// `prevRunVersion` is captured before termination can touch the replication
		// bookkeeping of the run we're about to reset away from.
		let prev_run_version = curr_handle.state().last_write_version();

		// Base history fields are read from the live state before any termination
		// bookkeeping is staged, since termination never changes branch content.
		let base_state_ro = match base_handle_owned.as_ref() {
			Some(h) => h.state(),
			None => curr_handle.state(),
		};
		base_state_ro.check_resettable()?;
		let base_branch_token = base_state_ro.execution_info.branch_token.clone();
		let base_next_event_id = base_state_ro.execution_info.next_event_id;
		let replication_enabled = base_state_ro.replication_state.is_some();

		// (T) Terminate the current run if it is still running. Staged on a clone:
		// the cache entry is only overwritten once the reset is known to succeed, so
		// a later failure (e.g. the domain guard) never leaves a half-applied
		// termination visible to the next acquirer.
		let mut curr_state_staged = curr_handle.state().clone();
		let mut close_cleanup_tasks = Vec::new();
		let currently_running =
			curr_state_staged.execution_info.state == reset_types::ExecutionState::Running;
		if currently_running {
			let terminate_event_id = {
				let mut builder = MutableStateBuilder::new(&mut curr_state_staged, now_nanos);
				builder.terminate(request.reason.clone())?.event_id
			};
			curr_state_staged.execution_info.last_first_event_id = terminate_event_id;
			close_cleanup_tasks.push(Task::Close {
				workflow_id: request.workflow_id.clone(),
				run_id: request.current_run_id,
			});
			close_cleanup_tasks.push(Task::Cleanup {
				workflow_id: request.workflow_id.clone(),
				run_id: request.current_run_id,
			});
		}

		// (V) Pre-replay validation: the current run must no longer be running.
		if curr_state_staged.execution_info.state == reset_types::ExecutionState::Running {
			return Err(ResetError::InternalServiceError(
				"current run is still running after termination step".to_string(),
			));
		}

		let new_run_id = RunId::new();

		// (R) Replay base history up to the boundary.
		let replay_engine = ReplayEngine::new(self.history, self.config.history_page_size);
		let replay_output = replay_engine
			.replay(
				request.domain_id.clone(),
				request.workflow_id.clone(),
				&base_branch_token,
				base_next_event_id,
				request.decision_finish_event_id,
				new_run_id,
				replication_enabled,
				now_nanos,
			)
			.await?;

		let mut rebuilt = replay_output.rebuilt_state;

		// (D) Post-replay validation.
		rebuilt.check_resettable()?;
		if !rebuilt.has_in_flight_decision() {
			return Err(ResetError::InternalServiceError(
				"replayed state has no in-flight decision to fail".to_string(),
			));
		}
		if rebuilt.has_buffered_events() {
			return Err(ResetError::InternalServiceError(
				"replayed state has buffered events".to_string(),
			));
		}
		if rebuilt.execution_info.is_sticky_enabled() {
			return Err(ResetError::InternalServiceError(
				"replayed state still has sticky task list enabled".to_string(),
			));
		}

		let workflow_timeout_secs = rebuilt.execution_info.workflow_task_timeout_secs;

		let mut new_transfer_tasks = Vec::new();

		{
			let mut builder = MutableStateBuilder::new(&mut rebuilt, now_nanos);

			// (F) Fail the in-flight decision with cause ResetWorkflow.
			builder.fail_decision_for_reset(
				request.base_run_id,
				new_run_id,
				replay_output.fork_event_version,
				request.reason.clone(),
			)?;

			// (A) Fail every started activity.
			let started: Vec<PendingActivityInfo> =
				builder.state().started_activities().cloned().collect();
			for activity in &started {
				builder.fail_activity_for_reset(activity)?;
			}

			// (S) Schedule every unstarted activity as a transfer task.
			let unstarted: Vec<PendingActivityInfo> =
				builder.state().unstarted_activities().cloned().collect();
			for activity in &unstarted {
				new_transfer_tasks.push(Task::Activity {
					domain_id: request.domain_id.clone(),
					task_list: activity.task_list.clone(),
					schedule_id: activity.schedule_id,
				});
			}
			if builder.state().started_activities().next().is_some() {
				return Err(ResetError::InternalServiceError(
					"activity remains started after fail-started step".to_string(),
				));
			}

			// (Σ) Replay every signal observed at or after the boundary, including
			// those on any continue-as-new successor of the base run.
			for signal in &replay_output.signals_after_boundary {
				if let reset_types::EventAttributes::WorkflowExecutionSignaled {
					signal_name,
					input,
					identity,
				} = &signal.attributes
				{
					builder.signal(signal_name.clone(), input.clone(), identity.clone())?;
				}
			}
		}

		// `current_run_id` is by construction the terminal run of the continue-as-new
		// chain the walker chases, and its handle is already held by this call — pass
		// its already-loaded branch token and next-event-id along so the walker
		// reuses them instead of trying to re-acquire a handle it would deadlock on.
		let held_current_run = (
			request.current_run_id,
			curr_handle.state().execution_info.branch_token.clone(),
			curr_handle.state().execution_info.next_event_id,
		);
		let signal_walker = SignalWalker::new(
			self.history,
			self.cache,
			self.config.history_page_size,
			self.config.cache_acquire_timeout,
		);
		let chain_signals = signal_walker
			.walk(
				&request.domain_id,
				&request.workflow_id,
				replay_output.continue_as_new_run_id_after_boundary,
				Some(held_current_run),
			)
			.await?;

		{
			let mut builder = MutableStateBuilder::new(&mut rebuilt, now_nanos);
			for signal in &chain_signals {
				if let reset_types::EventAttributes::WorkflowExecutionSignaled {
					signal_name,
					input,
					identity,
				} = &signal.attributes
				{
					builder.signal(signal_name.clone(), input.clone(), identity.clone())?;
				}
			}

			// (Δ) Always schedule a fresh decision.
			builder.schedule_decision("default")?;
		}

		let decision_schedule_id = rebuilt
			.decision
			.as_ref()
			.map(|d| d.schedule_id)
			.ok_or_else(|| ResetError::InternalServiceError("missing scheduled decision".to_string()))?;
		new_transfer_tasks.push(Task::Decision {
			domain_id: request.domain_id.clone(),
			task_list: "default".to_string(),
			schedule_id: decision_schedule_id,
			record_visibility: false,
		});
		new_transfer_tasks.push(Task::RecordWorkflowStarted);

		let need_activity_timer = !new_transfer_tasks
			.iter()
			.filter(|t| matches!(t, Task::Activity { .. }))
			.collect::<Vec<_>>()
			.is_empty();
		let mut new_timer_tasks =
			generate_timer_tasks_for_reset(&rebuilt, now_nanos, workflow_timeout_secs, need_activity_timer);

		// (K) Fork history at the boundary. Nothing has been persisted yet, so a
		// failure here needs no cleanup.
		let fork_info = format!(
			"{}:{}:{}",
			request.domain_id, request.workflow_id, new_run_id
		);
		let new_branch_token = self
			.history
			.fork(&base_branch_token, request.decision_finish_event_id, fork_info)
			.await?;
		rebuilt.execution_info.branch_token = new_branch_token.clone();

		let outcome: ResetResult<()> = async {
			// (Z) Domain-status guard: must run before any persistence.
			if let Some(current_version) = rebuilt.current_version() {
				if current_version < prev_run_version {
					return Err(ResetError::DomainNotActive {
						domain_id: request.domain_id.clone(),
						active_cluster: self.cluster.current_cluster_name(),
					});
				}
				let active_cluster = self.cluster.cluster_name_for_failover_version(current_version);
				if active_cluster != self.cluster.current_cluster_name() {
					return Err(ResetError::DomainNotActive {
						domain_id: request.domain_id.clone(),
						active_cluster,
					});
				}
			}

			// (P) Replication tasks: the new run always gets one; the current run
			// gets one too if it was terminated.
			let mut replication_tasks = Vec::new();
			if replication_enabled {
				if currently_running {
					replication_tasks.push(Task::HistoryReplication {
						run_id: request.current_run_id,
						first_event_id: curr_state_staged.execution_info.last_first_event_id,
						next_event_id: curr_state_staged.execution_info.next_event_id,
						reset_workflow: false,
						last_replication_info: curr_state_staged
							.replication_state
							.as_ref()
							.map(|r| r.last_replication_info.clone())
							.unwrap_or_default(),
					});
				}
				replication_tasks.push(Task::HistoryReplication {
					run_id: new_run_id,
					first_event_id: 1,
					next_event_id: rebuilt.execution_info.next_event_id,
					reset_workflow: true,
					last_replication_info: rebuilt
						.replication_state
						.as_ref()
						.map(|r| r.last_replication_info.clone())
						.unwrap_or_default(),
				});
			}
			new_transfer_tasks.extend(replication_tasks);

			// (W) Atomic persist: publish the new run's state and, only now, commit
			// the staged termination of the current run into its live cache slot.
			let new_execution = WorkflowExecution::new(
				request.domain_id.clone(),
				request.workflow_id.clone(),
				new_run_id,
			);
			self.cache.insert(new_execution, rebuilt.clone()).await?;
			*curr_handle.state_mut() = curr_state_staged.clone();
			Ok(())
		}
		.await;

		let fork_success = outcome.is_ok();
		self.history
			.complete_fork_branch(&new_branch_token, fork_success)
			.await?;
		outcome?;

		// (N) Notify task processors. Only transfer/timer shaped tasks, split by
		// kind since the source system notifies two distinct processors.
		new_transfer_tasks.extend(close_cleanup_tasks);
		let cluster = self.cluster.current_cluster_name();
		self.tasks.notify_transfer_tasks(&cluster, &new_transfer_tasks).await?;
		self.tasks.notify_timer_tasks(&cluster, &new_timer_tasks).await?;

		Ok(ResetWorkflowResponse { new_run_id })
	}
}
