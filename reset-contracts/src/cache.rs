use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reset_types::{MutableState, ResetError, ResetResult, WorkflowExecution};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Exclusive, bounded-wait access to one execution's mutable state. The orchestrator
/// never reads or mutates a `MutableState` without holding the matching handle, and
/// never holds more than one handle per execution at a time.
#[async_trait]
pub trait ExecutionCache: Send + Sync {
	async fn acquire(
		&self,
		execution: &WorkflowExecution,
		timeout: Duration,
	) -> ResetResult<ExecutionHandle>;

	/// Creates (or replaces) the cached entry for an execution. Used to publish a
	/// newly reset run's state once persistence has succeeded; a real cache would
	/// have written this to storage first and is populating its own entry as a
	/// side effect.
	async fn insert(&self, execution: WorkflowExecution, state: MutableState) -> ResetResult<()>;
}

/// Guards a single execution's state for the lifetime of the handle. Dropping it
/// (the common case, via an early return or the end of a request) always releases
/// the underlying lock — there is no separate release callback to forget to call.
pub struct ExecutionHandle {
	execution: WorkflowExecution,
	guard: OwnedMutexGuard<MutableState>,
}

impl ExecutionHandle {
	pub fn execution(&self) -> &WorkflowExecution {
		&self.execution
	}

	pub fn state(&self) -> &MutableState {
		&self.guard
	}

	pub fn state_mut(&mut self) -> &mut MutableState {
		&mut self.guard
	}
}

/// Reference implementation: one `tokio::sync::Mutex<MutableState>` per execution,
/// looked up through a `moka` cache so entries can be bounded and evicted like the
/// real cache would be. There is no backing store here — an execution must be
/// [`InMemoryExecutionCache::seed`]ed before it can be acquired, standing in for the
/// load-on-first-acquire behavior a production cache would have against persistence.
pub struct InMemoryExecutionCache {
	entries: moka::future::Cache<WorkflowExecution, Arc<Mutex<MutableState>>>,
}

impl InMemoryExecutionCache {
	pub fn new() -> Self {
		InMemoryExecutionCache {
			entries: moka::future::Cache::builder()
				.max_capacity(10_000)
				.build(),
		}
	}

	/// Test-fixture setup. Equivalent to `insert`, named separately so test code
	/// reads as "arranging a fixture" rather than "the system publishing state".
	pub async fn seed(&self, execution: WorkflowExecution, state: MutableState) {
		self.entries
			.insert(execution, Arc::new(Mutex::new(state)))
			.await;
	}

	/// Snapshot of the current state, bypassing the lock. Intended for assertions in
	/// tests after a handle has been released.
	pub async fn peek(&self, execution: &WorkflowExecution) -> Option<MutableState> {
		let cell = self.entries.get(execution).await?;
		Some(cell.lock().await.clone())
	}
}

impl Default for InMemoryExecutionCache {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl ExecutionCache for InMemoryExecutionCache {
	async fn acquire(
		&self,
		execution: &WorkflowExecution,
		timeout: Duration,
	) -> ResetResult<ExecutionHandle> {
		let cell = self
			.entries
			.get(execution)
			.await
			.ok_or(ResetError::NotFound)?;
		let guard = tokio::time::timeout(timeout, cell.lock_owned())
			.await
			.map_err(|_| ResetError::CacheTimeout {
				workflow_id: execution.workflow_id.clone(),
			})?;
		Ok(ExecutionHandle {
			execution: execution.clone(),
			guard,
		})
	}

	async fn insert(&self, execution: WorkflowExecution, state: MutableState) -> ResetResult<()> {
		self.entries
			.insert(execution, Arc::new(Mutex::new(state)))
			.await;
		Ok(())
	}
}
