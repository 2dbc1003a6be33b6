use crate::execution::{ClusterName, DomainId, RunId, WorkflowId};

pub type ResetResult<T> = Result<T, ResetError>;

/// Every way a reset (active or passive) can fail. Callers should branch on
/// [`ResetError::is_retryable`] / [`ResetError::is_terminal`] rather than matching
/// variants, except where they need the structured hints (`DomainNotActive`,
/// `RetryTask`) to redirect or re-send.
#[derive(thiserror::Error, Debug)]
pub enum ResetError {
	#[error("bad request: {0}")]
	BadRequest(String),

	#[error("internal service error: {0}")]
	InternalServiceError(String),

	#[error("domain not active on this cluster, active cluster is {active_cluster}")]
	DomainNotActive {
		domain_id: DomainId,
		active_cluster: ClusterName,
	},

	#[error("retry task: workflow not caught up, retry from event {first_event_id}")]
	RetryTask {
		domain_id: DomainId,
		workflow_id: WorkflowId,
		run_id: RunId,
		first_event_id: i64,
	},

	#[error("timed out waiting on {0}")]
	Timeout(String),

	#[error("storage error: {0}")]
	StorageError(#[source] anyhow::Error),

	#[error("cache acquisition timed out for {workflow_id}")]
	CacheTimeout { workflow_id: WorkflowId },

	#[error("workflow execution not found")]
	NotFound,
}

impl ResetError {
	/// Whether a caller may usefully retry the exact same request unmodified.
	///
	/// `Timeout` is retryable because the write may or may not have landed; retrying
	/// with the same RequestID is idempotent. `RetryTask` is retryable by definition
	/// (it names the point to resume from). Everything else reflects a state that
	/// retrying without changing anything will not fix.
	pub fn is_retryable(&self) -> bool {
		matches!(self, ResetError::Timeout(_) | ResetError::RetryTask { .. })
	}

	/// Whether this error reflects a condition the caller cannot recover from by
	/// itself (bad input, or an invariant the orchestrator refuses to proceed past).
	pub fn is_terminal(&self) -> bool {
		matches!(
			self,
			ResetError::BadRequest(_) | ResetError::InternalServiceError(_) | ResetError::NotFound
		)
	}

	/// For `DomainNotActive`, the cluster a retried request should be routed to.
	pub fn domain_not_active_hint(&self) -> Option<&ClusterName> {
		match self {
			ResetError::DomainNotActive { active_cluster, .. } => Some(active_cluster),
			_ => None,
		}
	}
}
