pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod reset_point;
pub mod state;
pub mod task;

pub use config::ResetConfig;
pub use error::{ResetError, ResetResult};
pub use event::{BranchToken, EventAttributes, EventType, HistoryEvent};
pub use execution::{ClusterName, DomainId, RunId, WorkflowExecution, WorkflowId};
pub use reset_point::{BadBinaryInfo, ResetPointInfo};
pub use state::{
	DecisionState, ExecutionInfo, ExecutionState, MutableState, PendingActivityInfo,
	PendingTimerInfo, ReplicationState,
};
pub use task::Task;
