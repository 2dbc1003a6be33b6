pub mod applier;
pub mod builder;

pub use applier::StateBuilder;
pub use builder::MutableStateBuilder;
