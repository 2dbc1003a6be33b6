use serde::{Deserialize, Serialize};

use crate::execution::{ClusterName, DomainId, RunId, WorkflowId};
use crate::state::LastReplicationInfo;
use std::collections::HashMap;

/// Work handed off to external processors once a reset has been persisted. The
/// reset core only produces these; dispatching them is someone else's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Task {
	Activity {
		domain_id: DomainId,
		task_list: String,
		schedule_id: i64,
	},
	Decision {
		domain_id: DomainId,
		task_list: String,
		schedule_id: i64,
		record_visibility: bool,
	},
	WorkflowTimeout {
		fire_timestamp_nanos: i64,
	},
	UserTimer {
		timer_id: i64,
		fire_timestamp_nanos: i64,
	},
	ActivityTimeout {
		schedule_id: i64,
		fire_timestamp_nanos: i64,
	},
	RecordWorkflowStarted,
	HistoryReplication {
		run_id: RunId,
		first_event_id: i64,
		next_event_id: i64,
		reset_workflow: bool,
		last_replication_info: HashMap<ClusterName, LastReplicationInfo>,
	},
	/// Emitted alongside a termination of the current run; paired with `cleanup`.
	Close { workflow_id: WorkflowId, run_id: RunId },
	Cleanup { workflow_id: WorkflowId, run_id: RunId },
}
