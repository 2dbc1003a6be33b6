use std::time::Duration;

/// Tunables referenced by the replay engine and orchestrator. Not loaded from a
/// file or the environment here — constructing one is the caller's job — but
/// typed the way the rest of the stack types its config structs, rather than
/// threading raw `Duration`/`usize` literals through the algorithms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetConfig {
	/// Max events per batch when range-reading a history branch.
	pub history_page_size: usize,
	/// Bound on how long a reset waits to acquire an execution-cache handle.
	pub cache_acquire_timeout: Duration,
	/// Starting delay for the activity/operation retry backoff referenced in
	/// deadline computations. Mirrors the teacher's exponential backoff base.
	pub retry_backoff_base: Duration,
	pub retry_backoff_max: Duration,
	pub retry_max_attempts: u32,
}

impl Default for ResetConfig {
	fn default() -> Self {
		ResetConfig {
			history_page_size: 100,
			cache_acquire_timeout: Duration::from_secs(10),
			retry_backoff_base: Duration::from_millis(500),
			retry_backoff_max: Duration::from_secs(8),
			retry_max_attempts: 8,
		}
	}
}
