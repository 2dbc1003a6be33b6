use reset_contracts::HistoryBranchClient;
use reset_state::StateBuilder;
use reset_types::event::EventType;
use reset_types::state::{DecisionState, ExecutionState};
use reset_types::{
	BranchToken, DomainId, ExecutionInfo, HistoryEvent, MutableState, ReplicationState, ResetError,
	ResetResult, RunId, WorkflowId,
};

/// Result of replaying a base run's history up to a decision-completion boundary.
pub struct ReplayOutput {
	pub rebuilt_state: MutableState,
	/// Failover version of the terminal `DecisionTaskStarted` event; becomes the new
	/// run's `DecisionTaskFailed.fork_event_version`.
	pub fork_event_version: i64,
	/// Signals observed at or after the boundary, in the order they occurred. Does
	/// not include signals from any continue-as-new successor run — see
	/// [`crate::signal_walk`] for that.
	pub signals_after_boundary: Vec<HistoryEvent>,
	/// If the base run continued-as-new at or after the boundary, the run id of its
	/// successor, so the caller can keep walking for lost signals.
	pub continue_as_new_run_id_after_boundary: Option<RunId>,
}

/// Replays `[1, boundary_event_id)` of a branch to reconstruct the `MutableState` a
/// reset should resume from, and separately collects every signal from
/// `[boundary_event_id, end)` so none are lost. Deterministic: same inputs always
/// produce the same rebuilt state (modulo the caller-supplied `new_run_id` and
/// timestamp), which is what lets a passive cluster reproduce an active cluster's
/// reset from a replication stream alone.
pub struct ReplayEngine<'a> {
	history: &'a dyn HistoryBranchClient,
	page_size: usize,
}

impl<'a> ReplayEngine<'a> {
	pub fn new(history: &'a dyn HistoryBranchClient, page_size: usize) -> Self {
		ReplayEngine { history, page_size }
	}

	#[tracing::instrument(skip_all, fields(%domain_id, %workflow_id, %new_run_id, boundary_event_id))]
	pub async fn replay(
		&self,
		domain_id: DomainId,
		workflow_id: WorkflowId,
		base_branch_token: &BranchToken,
		base_next_event_id: i64,
		boundary_event_id: i64,
		new_run_id: RunId,
		replication_enabled: bool,
		now_nanos: i64,
	) -> ResetResult<ReplayOutput> {
		let batches = self
			.history
			.read_full_range(base_branch_token, 1, base_next_event_id, self.page_size)
			.await?;

		let mut rebuilt: Option<MutableState> = None;
		let mut signals_after_boundary = Vec::new();
		let mut continue_as_new_run_id_after_boundary = None;
		let mut last_replayed: Option<HistoryEvent> = None;

		for batch in &batches {
			let batch_first_id = match batch.first() {
				Some(e) => e.event_id,
				None => continue,
			};

			if batch_first_id >= boundary_event_id {
				for event in batch {
					match &event.attributes {
						reset_types::EventAttributes::WorkflowExecutionSignaled { .. } => {
							signals_after_boundary.push(event.clone());
						}
						reset_types::EventAttributes::WorkflowExecutionContinuedAsNew {
							new_execution_run_id,
						} => {
							continue_as_new_run_id_after_boundary = Some(*new_execution_run_id);
						}
						_ => {}
					}
				}
				continue;
			}

			if rebuilt.is_none() {
				let first_event = batch.first().ok_or_else(|| {
					ResetError::InternalServiceError("empty first history batch".to_string())
				})?;
				if first_event.event_type() != EventType::WorkflowExecutionStarted {
					return Err(ResetError::BadRequest(
						"first event of history is not WorkflowExecutionStarted".to_string(),
					));
				}
				rebuilt = Some(new_mutable_state_for_replay(
					domain_id.clone(),
					workflow_id.clone(),
					new_run_id,
					first_event.version,
					replication_enabled,
				));
			}

			let last_of_batch = batch.last().expect("non-empty batch");
			if last_of_batch.event_type() == EventType::WorkflowExecutionContinuedAsNew {
				return Err(ResetError::BadRequest(
					"cannot replay history to continueAsNew".to_string(),
				));
			}

			let state = rebuilt.as_mut().expect("seeded above");
			StateBuilder::apply_batch(state, batch)?;
			last_replayed = Some(last_of_batch.clone());
		}

		let mut rebuilt_state = rebuilt.ok_or_else(|| {
			ResetError::BadRequest("boundary precedes WorkflowExecutionStarted".to_string())
		})?;

		let last_event = last_replayed.ok_or_else(|| {
			ResetError::BadRequest("no history replayed before boundary".to_string())
		})?;

		if last_event.event_type() != EventType::DecisionTaskStarted
			|| last_event.event_id != boundary_event_id - 1
		{
			return Err(ResetError::BadRequest(format!(
				"wrong decision finish event id: expected the event before {boundary_event_id} to be \
				 DecisionTaskStarted, found {:?} at {}",
				last_event.event_type(),
				last_event.event_id
			)));
		}
		let fork_event_version = last_event.version;

		rebuilt_state.execution_info.run_id = new_run_id;
		rebuilt_state.execution_info.start_timestamp_nanos = now_nanos;
		rebuilt_state.execution_info.last_updated_timestamp_nanos = now_nanos;
		rebuilt_state.execution_info.next_event_id = boundary_event_id;
		rebuilt_state.execution_info.clear_stickiness();

		Ok(ReplayOutput {
			rebuilt_state,
			fork_event_version,
			signals_after_boundary,
			continue_as_new_run_id_after_boundary,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use reset_contracts::history::InMemoryHistoryBranchClient;
	use reset_types::DomainId as D;

	fn ev(id: i64, version: i64, attrs: reset_types::EventAttributes) -> HistoryEvent {
		HistoryEvent::new(id, version, id * 1000, attrs)
	}

	fn happy_path_batches(tail: Vec<HistoryEvent>) -> Vec<Vec<HistoryEvent>> {
		let mut batches = vec![
			vec![ev(
				1,
				1,
				reset_types::EventAttributes::WorkflowExecutionStarted {
					workflow_task_timeout_secs: 30,
				},
			)],
			vec![ev(
				2,
				1,
				reset_types::EventAttributes::DecisionTaskScheduled {
					task_list: "tl".to_string(),
				},
			)],
			vec![ev(3, 1, reset_types::EventAttributes::DecisionTaskStarted)],
			vec![ev(4, 1, reset_types::EventAttributes::DecisionTaskCompleted)],
			vec![ev(
				5,
				1,
				reset_types::EventAttributes::ActivityTaskScheduled {
					schedule_id: 5,
					task_list: "tl".to_string(),
				},
			)],
			vec![ev(
				6,
				1,
				reset_types::EventAttributes::ActivityTaskStarted { schedule_id: 5 },
			)],
			vec![ev(
				7,
				1,
				reset_types::EventAttributes::DecisionTaskScheduled {
					task_list: "tl".to_string(),
				},
			)],
			vec![ev(8, 1, reset_types::EventAttributes::DecisionTaskStarted)],
		];
		batches.push(tail);
		batches
	}

	#[tokio::test]
	async fn replays_up_to_boundary_and_collects_signals_after() {
		let signal = ev(
			9,
			1,
			reset_types::EventAttributes::WorkflowExecutionSignaled {
				signal_name: "late".to_string(),
				input: None,
				identity: "client".to_string(),
			},
		);
		let client = InMemoryHistoryBranchClient::new();
		let token = client.seed(happy_path_batches(vec![signal]));

		let engine = ReplayEngine::new(&client, 100);
		let output = engine
			.replay(
				D("dom".to_string()),
				WorkflowId::from("wf".to_string()),
				&token,
				10,
				9,
				RunId::new(),
				false,
				42,
			)
			.await
			.expect("replay should succeed");

		assert_eq!(output.fork_event_version, 1);
		assert_eq!(output.signals_after_boundary.len(), 1);
		assert!(output.rebuilt_state.has_in_flight_decision());
		assert_eq!(output.rebuilt_state.execution_info.next_event_id, 9);
		// one activity remains pending and started, ready for the caller to fail it
		assert_eq!(output.rebuilt_state.pending_activities.len(), 1);
	}

	#[tokio::test]
	async fn wrong_boundary_is_bad_request() {
		// boundary of 8 means the event at id 7 must be DecisionTaskStarted, but it is
		// DecisionTaskScheduled instead.
		let client = InMemoryHistoryBranchClient::new();
		let token = client.seed(happy_path_batches(vec![]));

		let engine = ReplayEngine::new(&client, 100);
		let err = engine
			.replay(
				D("dom".to_string()),
				WorkflowId::from("wf".to_string()),
				&token,
				10,
				8,
				RunId::new(),
				false,
				0,
			)
			.await
			.expect_err("should reject boundary not following DecisionTaskStarted");

		assert!(matches!(err, ResetError::BadRequest(_)));
	}

	#[tokio::test]
	async fn continue_as_new_mid_history_is_rejected() {
		let client = InMemoryHistoryBranchClient::new();
		let mut batches = happy_path_batches(vec![]);
		// Replace the tail decision-started batch's predecessor with a continuation
		// so the terminal batch before the boundary ends in ContinuedAsNew.
		batches.insert(
			7,
			vec![ev(
				7,
				1,
				reset_types::EventAttributes::WorkflowExecutionContinuedAsNew {
					new_execution_run_id: RunId::new(),
				},
			)],
		);
		let token = client.seed(batches);

		let engine = ReplayEngine::new(&client, 100);
		let err = engine
			.replay(
				D("dom".to_string()),
				WorkflowId::from("wf".to_string()),
				&token,
				10,
				9,
				RunId::new(),
				false,
				0,
			)
			.await;

		assert!(err.is_err());
	}

}

fn new_mutable_state_for_replay(
	domain_id: DomainId,
	workflow_id: WorkflowId,
	run_id: RunId,
	start_version: i64,
	replication_enabled: bool,
) -> MutableState {
	MutableState {
		execution_info: ExecutionInfo {
			domain_id,
			workflow_id,
			run_id,
			parent_run_id: None,
			workflow_task_timeout_secs: 0,
			state: ExecutionState::Created,
			branch_token: BranchToken::new(),
			event_store_version_v2: true,
			create_request_id: String::new(),
			next_event_id: 1,
			last_first_event_id: 0,
			start_timestamp_nanos: 0,
			last_updated_timestamp_nanos: 0,
			sticky_task_list: None,
		},
		replication_state: if replication_enabled {
			Some(ReplicationState::new(start_version))
		} else {
			None
		},
		pending_activities: Default::default(),
		pending_timers: Default::default(),
		pending_child_executions: 0,
		buffered_events: Default::default(),
		decision: None::<DecisionState>,
	}
}
