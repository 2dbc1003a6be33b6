use reset_types::event::{DecisionTaskFailedCause, EventAttributes, IDENTITY_HISTORY_SERVICE};
use reset_types::state::PendingActivityInfo;
use reset_types::{HistoryEvent, MutableState, ResetResult, RunId};

use crate::applier::StateBuilder;

/// Wraps a [`MutableState`] under active construction and appends new events to it,
/// mirroring the source system's pattern of emitting an event and immediately
/// folding it into the in-progress state rather than doing the two as separate
/// passes. Every append advances `next_event_id` and records the event so the
/// caller can persist and replicate the whole batch at the end.
pub struct MutableStateBuilder<'a> {
	state: &'a mut MutableState,
	emitted: Vec<HistoryEvent>,
	now_nanos: i64,
}

impl<'a> MutableStateBuilder<'a> {
	pub fn new(state: &'a mut MutableState, now_nanos: i64) -> Self {
		MutableStateBuilder {
			state,
			emitted: Vec::new(),
			now_nanos,
		}
	}

	pub fn state(&self) -> &MutableState {
		self.state
	}

	pub fn into_emitted(self) -> Vec<HistoryEvent> {
		self.emitted
	}

	pub fn emitted(&self) -> &[HistoryEvent] {
		&self.emitted
	}

	fn append(&mut self, attributes: EventAttributes) -> ResetResult<&HistoryEvent> {
		let event_id = self.state.execution_info.next_event_id;
		let version = self.state.last_write_version();
		let event = HistoryEvent::new(event_id, version, self.now_nanos, attributes);
		StateBuilder::apply_event(self.state, &event)?;
		self.emitted.push(event);
		Ok(self.emitted.last().expect("just pushed"))
	}

	/// (T) Terminates the current run.
	pub fn terminate(&mut self, reason: impl Into<String>) -> ResetResult<&HistoryEvent> {
		self.append(EventAttributes::WorkflowExecutionTerminated {
			reason: reason.into(),
			identity: IDENTITY_HISTORY_SERVICE.to_string(),
		})
	}

	/// (F) Fails the in-flight decision with cause `ResetWorkflow`.
	pub fn fail_decision_for_reset(
		&mut self,
		base_run_id: RunId,
		new_run_id: RunId,
		fork_event_version: i64,
		reason: impl Into<String>,
	) -> ResetResult<&HistoryEvent> {
		self.append(EventAttributes::DecisionTaskFailed {
			cause: DecisionTaskFailedCause::ResetWorkflow,
			base_run_id,
			new_run_id,
			fork_event_version,
			reason: reason.into(),
			identity: IDENTITY_HISTORY_SERVICE.to_string(),
		})
	}

	/// (A) Fails one started activity with the fixed "workflowReset" reason.
	pub fn fail_activity_for_reset(&mut self, activity: &PendingActivityInfo) -> ResetResult<&HistoryEvent> {
		let started_id = activity.started_id.unwrap_or_default();
		self.append(EventAttributes::ActivityTaskFailed {
			schedule_id: activity.schedule_id,
			started_id,
			reason: "workflowReset".to_string(),
			details: None,
			identity: IDENTITY_HISTORY_SERVICE.to_string(),
		})
	}

	/// (Σ) Replays one signal observed after the reset boundary.
	pub fn signal(
		&mut self,
		signal_name: impl Into<String>,
		input: Option<serde_json::Value>,
		identity: impl Into<String>,
	) -> ResetResult<&HistoryEvent> {
		self.append(EventAttributes::WorkflowExecutionSignaled {
			signal_name: signal_name.into(),
			input,
			identity: identity.into(),
		})
	}

	/// (Δ) Schedules the new decision the reset always ends with.
	pub fn schedule_decision(&mut self, task_list: impl Into<String>) -> ResetResult<&HistoryEvent> {
		self.append(EventAttributes::DecisionTaskScheduled {
			task_list: task_list.into(),
		})
	}
}
