pub mod chunking;
pub mod driver;
pub mod errors;
pub mod metrics;
pub mod pubsub;

pub use driver::*;
pub use pubsub::{Message, NextOutput, PubSub, Response, Subscriber};
