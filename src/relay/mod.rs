pub mod sink;
pub mod broadcaster;

pub use sink::{OverflowPolicy, Sink, SinkSettings};
pub use broadcaster::Broadcaster;
