pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod logging;
pub mod manager;
pub mod metrics;
pub mod queue;
pub mod redis_keys;
pub mod registry;
pub mod scheduler;
pub mod stream_bridge;
pub mod worker_pool;

pub use config::Config;
pub use error::Error;
pub use manager::QueueManager;
pub use queue::Queue;
pub use registry::{ProcessorRegistry, ProcessorRegistryBuilder};
