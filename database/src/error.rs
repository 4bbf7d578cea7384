use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Redis connection pool error: {0}")]
    Pool(#[from] deadpool::managed::PoolError<redis::RedisError>),

    #[error("Redis connection pool creation error: {0}")]
    PoolCreation(#[from] deadpool_redis::CreatePoolError),

    #[error("Database configuration error: {0}")]
    Config(String),
}
