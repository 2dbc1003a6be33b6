pub mod cache;
pub mod cluster;
pub mod history;
pub mod tasks;

pub use cache::{ExecutionCache, ExecutionHandle, InMemoryExecutionCache};
pub use cluster::{ClusterMetadata, FakeClusterMetadata};
pub use history::{HistoryBatchPage, HistoryBranchClient, InMemoryHistoryBranchClient};
pub use tasks::{RecordingTaskNotifier, TaskNotifier};
