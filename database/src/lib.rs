mod error;
mod redis_pool;

pub use error::Error;
pub use redis_pool::{RedisConfig, RedisPool};

/// Generate a fresh random job/entity identifier.
pub fn new_uuid() -> uuid::Uuid {
    uuid::Uuid::new_v4()
}
