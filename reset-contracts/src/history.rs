use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use reset_types::{BranchToken, HistoryEvent, ResetError, ResetResult};

/// One page of a history range-read. Events are grouped into the batches they were
/// originally appended in; callers that only care about the flat event order should
/// iterate `batches.iter().flatten()`.
#[derive(Debug, Clone, Default)]
pub struct HistoryBatchPage {
	pub batches: Vec<Vec<HistoryEvent>>,
	pub next_page_token: Option<Vec<u8>>,
}

/// The append-only branched history log. This crate never appends to it directly
/// outside of fork/cleanup bookkeeping — event application happens in-memory against
/// a [`reset_types::MutableState`] and is persisted by a collaborator outside this
/// contract (see the execution-cache write path).
#[async_trait]
pub trait HistoryBranchClient: Send + Sync {
	async fn fork(
		&self,
		fork_branch_token: &BranchToken,
		fork_node_id: i64,
		info: String,
	) -> ResetResult<BranchToken>;

	/// Idempotent. `success = false` schedules the forked branch for cleanup instead
	/// of committing it.
	async fn complete_fork_branch(&self, branch_token: &BranchToken, success: bool) -> ResetResult<()>;

	async fn read_history_branch_by_batch(
		&self,
		branch_token: &BranchToken,
		min_event_id: i64,
		max_event_id: i64,
		page_size: usize,
		page_token: Option<Vec<u8>>,
	) -> ResetResult<HistoryBatchPage>;

	/// Convenience wrapper that pages through the entire `[min_event_id, max_event_id)`
	/// range and returns the concatenated batches in order.
	async fn read_full_range(
		&self,
		branch_token: &BranchToken,
		min_event_id: i64,
		max_event_id: i64,
		page_size: usize,
	) -> ResetResult<Vec<Vec<HistoryEvent>>> {
		let mut batches = Vec::new();
		let mut page_token = None;
		loop {
			let page = self
				.read_history_branch_by_batch(
					branch_token,
					min_event_id,
					max_event_id,
					page_size,
					page_token.take(),
				)
				.await?;
			batches.extend(page.batches);
			match page.next_page_token {
				Some(token) => page_token = Some(token),
				None => break,
			}
		}
		Ok(batches)
	}
}

struct Branch {
	/// Batches in append order. Forked branches start as a copy of the parent's
	/// batches truncated to the fork point; later appends to the parent do not
	/// retroactively appear here.
	batches: Vec<Vec<HistoryEvent>>,
	forked_pending_complete: bool,
}

/// Reference implementation used by tests and as the default for standalone
/// experimentation. Branch storage is a plain in-memory map; there is no real
/// durability or cross-process sharing.
#[derive(Default)]
pub struct InMemoryHistoryBranchClient {
	branches: Mutex<HashMap<BranchToken, Branch>>,
}

impl InMemoryHistoryBranchClient {
	pub fn new() -> Self {
		Self::default()
	}

	/// Seeds a branch with the given batches, returning the token a test can then
	/// fork or read from. Not part of the trait: only the fake needs a way to inject
	/// fixture history since there is no real append path in this crate.
	pub fn seed(&self, batches: Vec<Vec<HistoryEvent>>) -> BranchToken {
		let token = BranchToken::new();
		self.branches.lock().unwrap().insert(
			token.clone(),
			Branch {
				batches,
				forked_pending_complete: false,
			},
		);
		token
	}

	pub fn is_pending_complete(&self, token: &BranchToken) -> bool {
		self.branches
			.lock()
			.unwrap()
			.get(token)
			.map(|b| b.forked_pending_complete)
			.unwrap_or(false)
	}
}

#[async_trait]
impl HistoryBranchClient for InMemoryHistoryBranchClient {
	async fn fork(
		&self,
		fork_branch_token: &BranchToken,
		fork_node_id: i64,
		_info: String,
	) -> ResetResult<BranchToken> {
		let mut branches = self.branches.lock().unwrap();
		let parent = branches
			.get(fork_branch_token)
			.ok_or(ResetError::NotFound)?;
		let truncated: Vec<Vec<HistoryEvent>> = parent
			.batches
			.iter()
			.map(|batch| {
				batch
					.iter()
					.filter(|e| e.event_id < fork_node_id)
					.cloned()
					.collect::<Vec<_>>()
			})
			.filter(|batch: &Vec<HistoryEvent>| !batch.is_empty())
			.collect();
		let token = BranchToken::new();
		branches.insert(
			token.clone(),
			Branch {
				batches: truncated,
				forked_pending_complete: true,
			},
		);
		Ok(token)
	}

	async fn complete_fork_branch(&self, branch_token: &BranchToken, success: bool) -> ResetResult<()> {
		let mut branches = self.branches.lock().unwrap();
		if success {
			if let Some(branch) = branches.get_mut(branch_token) {
				branch.forked_pending_complete = false;
			}
			Ok(())
		} else {
			branches.remove(branch_token);
			Ok(())
		}
	}

	async fn read_history_branch_by_batch(
		&self,
		branch_token: &BranchToken,
		min_event_id: i64,
		max_event_id: i64,
		page_size: usize,
		page_token: Option<Vec<u8>>,
	) -> ResetResult<HistoryBatchPage> {
		let branches = self.branches.lock().unwrap();
		let branch = branches.get(branch_token).ok_or(ResetError::NotFound)?;

		let start_batch_index = page_token
			.map(|bytes| {
				let mut buf = [0u8; 8];
				buf.copy_from_slice(&bytes[..8]);
				usize::from_le_bytes(buf)
			})
			.unwrap_or(0);

		let mut batches = Vec::new();
		let mut index = start_batch_index;
		while index < branch.batches.len() && batches.len() < page_size {
			let filtered: Vec<HistoryEvent> = branch.batches[index]
				.iter()
				.filter(|e| e.event_id >= min_event_id && e.event_id < max_event_id)
				.cloned()
				.collect();
			if !filtered.is_empty() {
				batches.push(filtered);
			}
			index += 1;
		}

		let next_page_token = if index < branch.batches.len() {
			Some(index.to_le_bytes().to_vec())
		} else {
			None
		};

		Ok(HistoryBatchPage {
			batches,
			next_page_token,
		})
	}
}
