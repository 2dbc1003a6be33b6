use serde::{Deserialize, Serialize};

use crate::execution::RunId;

/// One entry in a workflow's auto-reset point history: a decision-completion
/// boundary that was safe to reset to as of some worker binary checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetPointInfo {
	pub binary_checksum: String,
	pub run_id: RunId,
	pub first_decision_completed_id: i64,
	pub created_timestamp_nanos: i64,
	/// 0 means "never expires".
	pub expiring_timestamp_nanos: i64,
	pub resettable: bool,
}

/// A worker binary checksum the operator has flagged as bad, with the reason given
/// at the time it was flagged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadBinaryInfo {
	pub reason: String,
	pub created_timestamp_nanos: i64,
}
