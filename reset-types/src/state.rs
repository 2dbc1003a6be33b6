use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{ResetError, ResetResult};
use crate::event::BranchToken;
use crate::execution::{ClusterName, DomainId, RunId, WorkflowId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionState {
	Created,
	Running,
	Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionInfo {
	pub domain_id: DomainId,
	pub workflow_id: WorkflowId,
	pub run_id: RunId,
	pub parent_run_id: Option<RunId>,
	pub workflow_task_timeout_secs: u32,
	pub state: ExecutionState,
	pub branch_token: BranchToken,
	pub event_store_version_v2: bool,
	pub create_request_id: String,
	pub next_event_id: i64,
	pub last_first_event_id: i64,
	pub start_timestamp_nanos: i64,
	pub last_updated_timestamp_nanos: i64,
	pub sticky_task_list: Option<String>,
}

impl ExecutionInfo {
	pub fn is_sticky_enabled(&self) -> bool {
		self.sticky_task_list.is_some()
	}

	pub fn clear_stickiness(&mut self) {
		self.sticky_task_list = None;
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastReplicationInfo {
	pub version: i64,
	pub last_event_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationState {
	pub current_version: i64,
	pub start_version: i64,
	pub last_write_version: i64,
	pub last_write_event_id: i64,
	pub last_replication_info: HashMap<ClusterName, LastReplicationInfo>,
}

impl ReplicationState {
	pub fn new(start_version: i64) -> Self {
		ReplicationState {
			current_version: start_version,
			start_version,
			last_write_version: start_version,
			last_write_event_id: 0,
			last_replication_info: HashMap::new(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingActivityInfo {
	pub schedule_id: i64,
	pub started_id: Option<i64>,
	pub task_list: String,
}

impl PendingActivityInfo {
	pub fn is_started(&self) -> bool {
		self.started_id.is_some()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTimerInfo {
	pub timer_id: i64,
	pub expiry_timestamp_nanos: i64,
}

/// In-flight decision task tracking. A workflow has at most one of these at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionState {
	pub schedule_id: i64,
	pub started_id: Option<i64>,
	pub attempt: u32,
}

impl DecisionState {
	pub fn is_started(&self) -> bool {
		self.started_id.is_some()
	}
}

/// In-memory projection of a run's history plus scheduling metadata. Produced either
/// by replaying events through the state builder or by loading a live run from the
/// execution cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutableState {
	pub execution_info: ExecutionInfo,
	pub replication_state: Option<ReplicationState>,
	pub pending_activities: HashMap<i64, PendingActivityInfo>,
	pub pending_timers: Vec<PendingTimerInfo>,
	pub pending_child_executions: usize,
	pub buffered_events: Vec<crate::event::HistoryEvent>,
	pub decision: Option<DecisionState>,
}

impl MutableState {
	pub fn has_in_flight_decision(&self) -> bool {
		self.decision.is_some()
	}

	pub fn has_buffered_events(&self) -> bool {
		!self.buffered_events.is_empty()
	}

	pub fn current_version(&self) -> Option<i64> {
		self.replication_state.as_ref().map(|r| r.current_version)
	}

	pub fn last_write_version(&self) -> i64 {
		self.replication_state
			.as_ref()
			.map(|r| r.last_write_version)
			.unwrap_or(0)
	}

	/// Invariant checks the source calls `CheckResettable`: no pending child workflows
	/// and a branch-structured (V2) history.
	pub fn check_resettable(&self) -> ResetResult<()> {
		if self.pending_child_executions > 0 {
			return Err(ResetError::BadRequest(
				"workflow has pending child executions".to_string(),
			));
		}
		if !self.execution_info.event_store_version_v2 {
			return Err(ResetError::BadRequest(
				"unsupported history (not V2 branch-structured)".to_string(),
			));
		}
		Ok(())
	}

	pub fn started_activities(&self) -> impl Iterator<Item = &PendingActivityInfo> {
		self.pending_activities.values().filter(|a| a.is_started())
	}

	pub fn unstarted_activities(&self) -> impl Iterator<Item = &PendingActivityInfo> {
		self.pending_activities.values().filter(|a| !a.is_started())
	}
}
