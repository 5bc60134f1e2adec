pub mod update;
pub mod reconnect;
pub mod ingestor;

pub use update::Update;
pub use reconnect::{ReconnectConfig, ReconnectMode};
pub use ingestor::{FeedIngestor, FeedStatus, FeedStatusSnapshot};
