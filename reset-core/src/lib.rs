pub mod auto_reset;
pub mod orchestrator;
pub mod replicator;
pub mod timers;

pub use auto_reset::find_auto_reset_point;
pub use orchestrator::{ResetOrchestrator, ResetWorkflowRequest, ResetWorkflowResponse};
pub use replicator::{ApplyResetEventRequest, ResetReplicator};
pub use timers::generate_timer_tasks_for_reset;
