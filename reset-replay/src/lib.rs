pub mod replay;
pub mod signal_walk;

pub use replay::{ReplayEngine, ReplayOutput};
pub use signal_walk::SignalWalker;
