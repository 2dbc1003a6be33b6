use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::RunId;

pub const IDENTITY_HISTORY_SERVICE: &str = "history-service";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum EventType {
	WorkflowExecutionStarted,
	DecisionTaskScheduled,
	DecisionTaskStarted,
	DecisionTaskCompleted,
	DecisionTaskFailed,
	ActivityTaskScheduled,
	ActivityTaskStarted,
	ActivityTaskFailed,
	WorkflowExecutionSignaled,
	WorkflowExecutionContinuedAsNew,
	WorkflowExecutionTerminated,
}

/// Why a decision task failed. Reset always uses `ResetWorkflow`; other causes are
/// out of scope but kept so the enum round-trips history produced by the rest of
/// the orchestration system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionTaskFailedCause {
	ResetWorkflow,
	Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventAttributes {
	WorkflowExecutionStarted {
		workflow_task_timeout_secs: u32,
	},
	DecisionTaskScheduled {
		task_list: String,
	},
	DecisionTaskStarted,
	DecisionTaskCompleted,
	DecisionTaskFailed {
		cause: DecisionTaskFailedCause,
		base_run_id: RunId,
		new_run_id: RunId,
		fork_event_version: i64,
		reason: String,
		identity: String,
	},
	ActivityTaskScheduled {
		schedule_id: i64,
		task_list: String,
	},
	ActivityTaskStarted {
		schedule_id: i64,
	},
	ActivityTaskFailed {
		schedule_id: i64,
		started_id: i64,
		reason: String,
		details: Option<serde_json::Value>,
		identity: String,
	},
	WorkflowExecutionSignaled {
		signal_name: String,
		input: Option<serde_json::Value>,
		identity: String,
	},
	WorkflowExecutionContinuedAsNew {
		new_execution_run_id: RunId,
	},
	WorkflowExecutionTerminated {
		reason: String,
		identity: String,
	},
}

impl EventAttributes {
	pub fn event_type(&self) -> EventType {
		match self {
			EventAttributes::WorkflowExecutionStarted { .. } => EventType::WorkflowExecutionStarted,
			EventAttributes::DecisionTaskScheduled { .. } => EventType::DecisionTaskScheduled,
			EventAttributes::DecisionTaskStarted => EventType::DecisionTaskStarted,
			EventAttributes::DecisionTaskCompleted => EventType::DecisionTaskCompleted,
			EventAttributes::DecisionTaskFailed { .. } => EventType::DecisionTaskFailed,
			EventAttributes::ActivityTaskScheduled { .. } => EventType::ActivityTaskScheduled,
			EventAttributes::ActivityTaskStarted { .. } => EventType::ActivityTaskStarted,
			EventAttributes::ActivityTaskFailed { .. } => EventType::ActivityTaskFailed,
			EventAttributes::WorkflowExecutionSignaled { .. } => EventType::WorkflowExecutionSignaled,
			EventAttributes::WorkflowExecutionContinuedAsNew { .. } => {
				EventType::WorkflowExecutionContinuedAsNew
			}
			EventAttributes::WorkflowExecutionTerminated { .. } => {
				EventType::WorkflowExecutionTerminated
			}
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
	pub event_id: i64,
	pub version: i64,
	pub timestamp_nanos: i64,
	pub attributes: EventAttributes,
}

impl HistoryEvent {
	pub fn new(event_id: i64, version: i64, timestamp_nanos: i64, attributes: EventAttributes) -> Self {
		HistoryEvent {
			event_id,
			version,
			timestamp_nanos,
			attributes,
		}
	}

	pub fn event_type(&self) -> EventType {
		self.attributes.event_type()
	}
}

/// Opaque identifier for a history branch fork. Produced by `Fork`, consumed by
/// range-reads and `CompleteForkBranch`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchToken(pub Uuid);

impl BranchToken {
	pub fn new() -> Self {
		BranchToken(Uuid::new_v4())
	}
}

impl Default for BranchToken {
	fn default() -> Self {
		Self::new()
	}
}
