use std::time::Duration;

use reset_contracts::{ExecutionCache, HistoryBranchClient};
use reset_types::{
	BranchToken, DomainId, EventAttributes, HistoryEvent, ResetResult, RunId, WorkflowExecution,
	WorkflowId,
};

/// Walks a continue-as-new chain collecting every signal delivered to any run in
/// it, so a reset whose boundary falls before the chain's end does not silently
/// drop signals that arrived on a successor run. Each run in the chain is acquired
/// through the execution cache (for its branch token) and then range-read in full
/// through the history client; the walk stops at the first run with no
/// continue-as-new successor.
///
/// `held_run`, when given, names a run whose handle the caller already holds
/// exclusively (run id, branch token, next event id). If the chain reaches that
/// run, its branch token and next event id are reused directly instead of
/// acquiring the execution cache again — re-acquiring would deadlock against the
/// caller's own non-reentrant lock.
pub struct SignalWalker<'a> {
	history: &'a dyn HistoryBranchClient,
	cache: &'a dyn ExecutionCache,
	page_size: usize,
	cache_timeout: Duration,
}

impl<'a> SignalWalker<'a> {
	pub fn new(
		history: &'a dyn HistoryBranchClient,
		cache: &'a dyn ExecutionCache,
		page_size: usize,
		cache_timeout: Duration,
	) -> Self {
		SignalWalker {
			history,
			cache,
			page_size,
			cache_timeout,
		}
	}

	#[tracing::instrument(skip_all, fields(%domain_id, %workflow_id))]
	pub async fn walk(
		&self,
		domain_id: &DomainId,
		workflow_id: &WorkflowId,
		mut next_run_id: Option<RunId>,
		held_run: Option<(RunId, BranchToken, i64)>,
	) -> ResetResult<Vec<HistoryEvent>> {
		let mut signals = Vec::new();

		while let Some(run_id) = next_run_id.take() {
			let (branch_token, next_event_id) = match &held_run {
				Some((held_id, token, next_event_id)) if *held_id == run_id => {
					(token.clone(), *next_event_id)
				}
				_ => {
					let execution = WorkflowExecution::new(domain_id.clone(), workflow_id.clone(), run_id);
					let handle = self.cache.acquire(&execution, self.cache_timeout).await?;
					let branch_token = handle.state().execution_info.branch_token.clone();
					let next_event_id = handle.state().execution_info.next_event_id;
					drop(handle);
					(branch_token, next_event_id)
				}
			};

			let batches = self
				.history
				.read_full_range(&branch_token, 1, next_event_id, self.page_size)
				.await?;

			for batch in &batches {
				for event in batch {
					match &event.attributes {
						EventAttributes::WorkflowExecutionSignaled { .. } => {
							signals.push(event.clone());
						}
						EventAttributes::WorkflowExecutionContinuedAsNew {
							new_execution_run_id,
						} => {
							next_run_id = Some(*new_execution_run_id);
						}
						_ => {}
					}
				}
			}
		}

		Ok(signals)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use reset_contracts::{InMemoryExecutionCache, InMemoryHistoryBranchClient};
	use reset_types::state::{ExecutionState, PendingActivityInfo};
	use reset_types::{BranchToken, EventAttributes, ExecutionInfo, MutableState};

	fn signal_event(id: i64, name: &str) -> HistoryEvent {
		HistoryEvent::new(
			id,
			1,
			id * 1000,
			EventAttributes::WorkflowExecutionSignaled {
				signal_name: name.to_string(),
				input: None,
				identity: "client".to_string(),
			},
		)
	}

	fn continued_as_new(id: i64, successor: RunId) -> HistoryEvent {
		HistoryEvent::new(
			id,
			1,
			id * 1000,
			EventAttributes::WorkflowExecutionContinuedAsNew {
				new_execution_run_id: successor,
			},
		)
	}

	fn fixture_state(run_id: RunId, branch_token: BranchToken, next_event_id: i64) -> MutableState {
		MutableState {
			execution_info: ExecutionInfo {
				domain_id: DomainId("dom".to_string()),
				workflow_id: WorkflowId::from("wf".to_string()),
				run_id,
				parent_run_id: None,
				workflow_task_timeout_secs: 30,
				state: ExecutionState::Completed,
				branch_token,
				event_store_version_v2: true,
				create_request_id: String::new(),
				next_event_id,
				last_first_event_id: 0,
				start_timestamp_nanos: 0,
				last_updated_timestamp_nanos: 0,
				sticky_task_list: None,
			},
			replication_state: None,
			pending_activities: std::collections::HashMap::<i64, PendingActivityInfo>::new(),
			pending_timers: Vec::new(),
			pending_child_executions: 0,
			buffered_events: Vec::new(),
			decision: None,
		}
	}

	#[tokio::test]
	async fn walks_chain_collecting_signals_until_no_successor() {
		let history = InMemoryHistoryBranchClient::new();
		let cache = InMemoryExecutionCache::new();
		let domain_id = DomainId("dom".to_string());
		let workflow_id = WorkflowId::from("wf".to_string());

		let run_b = RunId::new();
		let run_c = RunId::new();

		// Run B: one signal, then continues-as-new into run C.
		let token_b = history.seed(vec![vec![
			signal_event(1, "b-signal"),
			continued_as_new(2, run_c),
		]]);
		cache
			.seed(
				WorkflowExecution::new(domain_id.clone(), workflow_id.clone(), run_b),
				fixture_state(run_b, token_b, 3),
			)
			.await;

		// Run C: two signals, no further continuation.
		let token_c = history.seed(vec![vec![
			signal_event(1, "c-signal-1"),
			signal_event(2, "c-signal-2"),
		]]);
		cache
			.seed(
				WorkflowExecution::new(domain_id.clone(), workflow_id.clone(), run_c),
				fixture_state(run_c, token_c, 3),
			)
			.await;

		let walker = SignalWalker::new(&history, &cache, 100, Duration::from_secs(1));
		let signals = walker
			.walk(&domain_id, &workflow_id, Some(run_b), None)
			.await
			.expect("walk should succeed");

		let names: Vec<&str> = signals
			.iter()
			.map(|e| match &e.attributes {
				EventAttributes::WorkflowExecutionSignaled { signal_name, .. } => {
					signal_name.as_str()
				}
				_ => panic!("expected signal"),
			})
			.collect();
		assert_eq!(names, vec!["b-signal", "c-signal-1", "c-signal-2"]);
	}

	#[tokio::test]
	async fn reuses_held_run_without_acquiring_cache() {
		let history = InMemoryHistoryBranchClient::new();
		let cache = InMemoryExecutionCache::new();
		let domain_id = DomainId("dom".to_string());
		let workflow_id = WorkflowId::from("wf".to_string());

		let held_run_id = RunId::new();
		// Deliberately not seeded into the cache: if the walker tried to acquire it
		// instead of reusing the held values, this would fail with NotFound.
		let held_token = history.seed(vec![vec![signal_event(1, "held-signal")]]);

		let walker = SignalWalker::new(&history, &cache, 100, Duration::from_secs(1));
		let signals = walker
			.walk(
				&domain_id,
				&workflow_id,
				Some(held_run_id),
				Some((held_run_id, held_token, 2)),
			)
			.await
			.expect("walk should reuse the held run instead of acquiring the cache");

		assert_eq!(signals.len(), 1);
	}

	#[tokio::test]
	async fn no_successor_returns_empty() {
		let history = InMemoryHistoryBranchClient::new();
		let cache = InMemoryExecutionCache::new();
		let domain_id = DomainId("dom".to_string());
		let workflow_id = WorkflowId::from("wf".to_string());

		let walker = SignalWalker::new(&history, &cache, 100, Duration::from_secs(1));
		let signals = walker
			.walk(&domain_id, &workflow_id, None, None)
			.await
			.expect("walk with no successor should succeed trivially");
		assert!(signals.is_empty());
	}
}
