use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier for a workflow; survives resets and continue-as-new.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

impl fmt::Display for WorkflowId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl From<String> for WorkflowId {
	fn from(value: String) -> Self {
		WorkflowId(value)
	}
}

/// Opaque identifier for a single run of a workflow. Fresh on every reset or continue-as-new.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
	pub fn new() -> Self {
		RunId(Uuid::new_v4())
	}
}

impl Default for RunId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for RunId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DomainId(pub String);

impl fmt::Display for DomainId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterName(pub String);

impl fmt::Display for ClusterName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl From<&str> for ClusterName {
	fn from(value: &str) -> Self {
		ClusterName(value.to_string())
	}
}

/// A (domain, workflow, run) triple identifying one execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowExecution {
	pub domain_id: DomainId,
	pub workflow_id: WorkflowId,
	pub run_id: RunId,
}

impl WorkflowExecution {
	pub fn new(domain_id: DomainId, workflow_id: WorkflowId, run_id: RunId) -> Self {
		WorkflowExecution {
			domain_id,
			workflow_id,
			run_id,
		}
	}
}

impl fmt::Display for WorkflowExecution {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}/{}", self.domain_id, self.workflow_id, self.run_id)
	}
}
