use std::collections::HashMap;
use std::sync::RwLock;

use reset_types::ClusterName;

/// Active-cluster / failover-version resolution. Consulted only at the
/// domain-status guard and for replication-info bookkeeping; results are never
/// cached across calls by the orchestrator since failover can happen mid-request.
pub trait ClusterMetadata: Send + Sync {
	fn current_cluster_name(&self) -> ClusterName;
	fn cluster_name_for_failover_version(&self, version: i64) -> ClusterName;
}

/// Fake backed by a fixed local cluster name and a version-range-to-cluster table,
/// mutable so tests can simulate a failover mid-scenario.
pub struct FakeClusterMetadata {
	local_cluster: ClusterName,
	/// Ranges are represented as (exclusive upper bound, cluster). The table is
	/// scanned in insertion order; the first range whose bound exceeds the version
	/// wins, mirroring a simple failover-version-to-cluster mapping.
	version_ranges: RwLock<Vec<(i64, ClusterName)>>,
	overrides: RwLock<HashMap<i64, ClusterName>>,
}

impl FakeClusterMetadata {
	pub fn new(local_cluster: impl Into<ClusterName>) -> Self {
		FakeClusterMetadata {
			local_cluster: local_cluster.into(),
			version_ranges: RwLock::new(Vec::new()),
			overrides: RwLock::new(HashMap::new()),
		}
	}

	pub fn with_range(self, upper_bound_exclusive: i64, cluster: impl Into<ClusterName>) -> Self {
		self.version_ranges
			.write()
			.unwrap()
			.push((upper_bound_exclusive, cluster.into()));
		self
	}

	/// Pins a single version to a cluster regardless of range table contents, for
	/// tests that want to flip one specific version's ownership.
	pub fn set_override(&self, version: i64, cluster: impl Into<ClusterName>) {
		self.overrides
			.write()
			.unwrap()
			.insert(version, cluster.into());
	}
}

impl ClusterMetadata for FakeClusterMetadata {
	fn current_cluster_name(&self) -> ClusterName {
		self.local_cluster.clone()
	}

	fn cluster_name_for_failover_version(&self, version: i64) -> ClusterName {
		if let Some(cluster) = self.overrides.read().unwrap().get(&version) {
			return cluster.clone();
		}
		self.version_ranges
			.read()
			.unwrap()
			.iter()
			.find(|(bound, _)| version < *bound)
			.map(|(_, cluster)| cluster.clone())
			.unwrap_or_else(|| self.local_cluster.clone())
	}
}
