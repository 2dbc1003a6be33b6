use reset_types::{MutableState, Task};

/// Always emits a workflow-timeout task; adds a user-timer task if any pending
/// timer survived the replay, and an activity-timeout task if the reset
/// (re)scheduled any activity.
pub fn generate_timer_tasks_for_reset(
	state: &MutableState,
	now_nanos: i64,
	workflow_timeout_secs: u32,
	need_activity_timer: bool,
) -> Vec<Task> {
	let mut tasks = Vec::new();

	tasks.push(Task::WorkflowTimeout {
		fire_timestamp_nanos: now_nanos + i64::from(workflow_timeout_secs) * 1_000_000_000,
	});

	if let Some(earliest) = state.pending_timers.iter().min_by_key(|t| t.expiry_timestamp_nanos) {
		tasks.push(Task::UserTimer {
			timer_id: earliest.timer_id,
			fire_timestamp_nanos: earliest.expiry_timestamp_nanos,
		});
	}

	if need_activity_timer {
		if let Some(earliest) = state.pending_activities.values().min_by_key(|a| a.schedule_id) {
			tasks.push(Task::ActivityTimeout {
				schedule_id: earliest.schedule_id,
				fire_timestamp_nanos: now_nanos,
			});
		}
	}

	tasks
}
