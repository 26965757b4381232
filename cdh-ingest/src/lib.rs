pub mod client;
pub mod config;
pub mod dedup;
pub mod devices;
pub mod poller;
pub mod sequencer;
pub mod sink;
pub mod state;
pub mod storage;

pub use client::{ClientError, FeedClient};
pub use config::{Config, ConfigError, FeedConfig, StallAction, StallPolicy, StorageConfig};
pub use sink::{ChannelSink, EventSink, LogSink, SinkError};
pub use storage::CursorStore;
pub use storage::file::FileCursorStore;
pub use storage::memory::MemoryCursorStore;
pub use storage::sqlite::SqliteCursorStore;
