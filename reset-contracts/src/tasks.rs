use std::sync::Mutex;

use async_trait::async_trait;
use reset_types::{ClusterName, ResetResult, Task};

/// Notified after persistence succeeds, never before. Transfer-task-shaped variants
/// (`Activity`, `Decision`, `RecordWorkflowStarted`, `HistoryReplication`, `Close`,
/// `Cleanup`) and timer-shaped variants (`WorkflowTimeout`, `UserTimer`,
/// `ActivityTimeout`) are delivered through separate methods because the source
/// system notifies two distinct processors.
#[async_trait]
pub trait TaskNotifier: Send + Sync {
	async fn notify_transfer_tasks(&self, cluster: &ClusterName, tasks: &[Task]) -> ResetResult<()>;
	async fn notify_timer_tasks(&self, cluster: &ClusterName, tasks: &[Task]) -> ResetResult<()>;
}

fn is_timer_shaped(task: &Task) -> bool {
	matches!(
		task,
		Task::WorkflowTimeout { .. } | Task::UserTimer { .. } | Task::ActivityTimeout { .. }
	)
}

/// Records every notification it receives, in order, for assertions in tests.
#[derive(Default)]
pub struct RecordingTaskNotifier {
	transfer: Mutex<Vec<Task>>,
	timer: Mutex<Vec<Task>>,
}

impl RecordingTaskNotifier {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn transfer_tasks(&self) -> Vec<Task> {
		self.transfer.lock().unwrap().clone()
	}

	pub fn timer_tasks(&self) -> Vec<Task> {
		self.timer.lock().unwrap().clone()
	}
}

#[async_trait]
impl TaskNotifier for RecordingTaskNotifier {
	async fn notify_transfer_tasks(&self, _cluster: &ClusterName, tasks: &[Task]) -> ResetResult<()> {
		debug_assert!(tasks.iter().all(|t| !is_timer_shaped(t)));
		self.transfer.lock().unwrap().extend(tasks.iter().cloned());
		Ok(())
	}

	async fn notify_timer_tasks(&self, _cluster: &ClusterName, tasks: &[Task]) -> ResetResult<()> {
		debug_assert!(tasks.iter().all(is_timer_shaped));
		self.timer.lock().unwrap().extend(tasks.iter().cloned());
		Ok(())
	}
}
