use reset_types::event::EventAttributes;
use reset_types::state::{DecisionState, ExecutionState, PendingActivityInfo};
use reset_types::{HistoryEvent, MutableState, ResetError, ResetResult};

/// Folds history events into a [`MutableState`] projection. Stateless: all state
/// lives on the `MutableState` passed in, so the same applier instance can fold
/// many independent replays (the replay engine constructs one `MutableState` per
/// run it is reconstructing).
pub struct StateBuilder;

impl StateBuilder {
	pub fn apply_batch(state: &mut MutableState, batch: &[HistoryEvent]) -> ResetResult<()> {
		for event in batch {
			Self::apply_event(state, event)?;
		}
		Ok(())
	}

	pub fn apply_event(state: &mut MutableState, event: &HistoryEvent) -> ResetResult<()> {
		match &event.attributes {
			EventAttributes::WorkflowExecutionStarted {
				workflow_task_timeout_secs,
			} => {
				state.execution_info.state = ExecutionState::Running;
				state.execution_info.workflow_task_timeout_secs = *workflow_task_timeout_secs;
				state.execution_info.start_timestamp_nanos = event.timestamp_nanos;
			}
			EventAttributes::DecisionTaskScheduled { .. } => {
				state.decision = Some(DecisionState {
					schedule_id: event.event_id,
					started_id: None,
					attempt: 0,
				});
			}
			EventAttributes::DecisionTaskStarted => {
				let decision = state.decision.as_mut().ok_or_else(|| {
					ResetError::InternalServiceError(
						"DecisionTaskStarted with no scheduled decision".to_string(),
					)
				})?;
				decision.started_id = Some(event.event_id);
			}
			EventAttributes::DecisionTaskCompleted | EventAttributes::DecisionTaskFailed { .. } => {
				state.decision = None;
			}
			EventAttributes::ActivityTaskScheduled {
				schedule_id,
				task_list,
			} => {
				state.pending_activities.insert(
					*schedule_id,
					PendingActivityInfo {
						schedule_id: *schedule_id,
						started_id: None,
						task_list: task_list.clone(),
					},
				);
			}
			EventAttributes::ActivityTaskStarted { schedule_id } => {
				let activity = state.pending_activities.get_mut(schedule_id).ok_or_else(|| {
					ResetError::InternalServiceError(format!(
						"ActivityTaskStarted for unknown schedule id {schedule_id}"
					))
				})?;
				activity.started_id = Some(event.event_id);
			}
			EventAttributes::ActivityTaskFailed { schedule_id, .. } => {
				state.pending_activities.remove(schedule_id);
			}
			EventAttributes::WorkflowExecutionSignaled { .. } => {
				// No bookkeeping beyond history position: signal delivery to the
				// running decision loop is out of scope for this projection.
			}
			EventAttributes::WorkflowExecutionContinuedAsNew { .. } => {
				state.execution_info.state = ExecutionState::Completed;
				state.decision = None;
			}
			EventAttributes::WorkflowExecutionTerminated { .. } => {
				state.execution_info.state = ExecutionState::Completed;
				state.decision = None;
			}
		}

		state.execution_info.next_event_id = event.event_id + 1;
		state.execution_info.last_updated_timestamp_nanos = event.timestamp_nanos;
		if let Some(replication_state) = state.replication_state.as_mut() {
			replication_state.last_write_version = event.version;
			replication_state.last_write_event_id = event.event_id;
		}

		Ok(())
	}
}
