use std::{ops::Deref, sync::Arc};

use tracing::{event, Level};

use crate::error::Error;

/// Connection parameters for the Redis instance backing the job queue.
///
/// Mirrors the `redis` block of the core's recognized configuration
/// (host/port/password/db). Any field left unset falls back to the
/// corresponding `REDIS_*` environment variable, then to a local default.
#[derive(Clone, Debug, Default)]
pub struct RedisConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub password: Option<String>,
    pub db: Option<i64>,
}

impl RedisConfig {
    pub fn from_env() -> Self {
        RedisConfig {
            host: std::env::var("REDIS_HOST").ok(),
            port: std::env::var("REDIS_PORT")
                .ok()
                .and_then(|p| p.parse().ok()),
            password: std::env::var("REDIS_PASSWORD").ok(),
            db: std::env::var("REDIS_DB").ok().and_then(|d| d.parse().ok()),
        }
    }

    fn to_url(&self) -> String {
        let host = self.host.as_deref().unwrap_or("127.0.0.1");
        let port = self.port.unwrap_or(6379);
        let db = self.db.unwrap_or(0);
        match &self.password {
            Some(password) => format!("redis://:{password}@{host}:{port}/{db}"),
            None => format!("redis://{host}:{port}/{db}"),
        }
    }
}

/// Shared, cloneable handle to the deadpool-redis connection pool plus an
/// optional key prefix, so multiple `Queue`/`QueueManager` instances in the
/// same process (or the same physical Redis used by several environments)
/// can coexist without key collisions.
#[derive(Clone)]
pub struct RedisPool(Arc<RedisPoolInner>);

struct RedisPoolInner {
    pool: deadpool_redis::Pool,
    key_prefix: Option<String>,
}

impl Deref for RedisPool {
    type Target = deadpool_redis::Pool;

    fn deref(&self) -> &Self::Target {
        &self.0.pool
    }
}

impl RedisPool {
    /// Build a pool from an explicit config, falling back to environment
    /// variables for any field left unset.
    pub fn new(config: RedisConfig, key_prefix: Option<String>) -> Result<RedisPool, Error> {
        let url = config.to_url();
        let pool = deadpool_redis::Config {
            url: Some(url),
            connection: None,
            pool: None,
        }
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))?;

        event!(Level::INFO, key_prefix = ?key_prefix, "redis pool created");
        Ok(RedisPool(Arc::new(RedisPoolInner { pool, key_prefix })))
    }

    /// Build a pool directly from a `redis://` URL, bypassing `RedisConfig`.
    pub fn from_url(url: impl Into<String>, key_prefix: Option<String>) -> Result<RedisPool, Error> {
        let pool = deadpool_redis::Config {
            url: Some(url.into()),
            connection: None,
            pool: None,
        }
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))?;

        event!(Level::INFO, key_prefix = ?key_prefix, "redis pool created");
        Ok(RedisPool(Arc::new(RedisPoolInner { pool, key_prefix })))
    }

    pub fn pool(&self) -> &deadpool_redis::Pool {
        &self.0.pool
    }

    pub fn key_prefix(&self) -> Option<&str> {
        self.0.key_prefix.as_deref()
    }

    /// Prefix a bare key name with the pool's configured key prefix, if any.
    pub fn key(&self, name: &str) -> String {
        match self.key_prefix() {
            Some(prefix) => format!("{prefix}:{name}"),
            None => name.to_string(),
        }
    }

    pub async fn get(&self) -> Result<deadpool_redis::Connection, Error> {
        self.0.pool.get().await.map_err(Error::from)
    }

    /// Closes the underlying pool: in-flight connections are dropped and
    /// every future `get()` fails immediately instead of waiting on a
    /// connection that will never come. Called once, at the end of the
    /// process's graceful shutdown sequence.
    pub fn close(&self) {
        event!(Level::INFO, "redis pool closing");
        self.0.pool.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_with_password() {
        let cfg = RedisConfig {
            host: Some("redis.internal".into()),
            port: Some(6380),
            password: Some("hunter2".into()),
            db: Some(3),
        };
        assert_eq!(cfg.to_url(), "redis://:hunter2@redis.internal:6380/3");
    }

    #[test]
    fn url_defaults() {
        let cfg = RedisConfig::default();
        assert_eq!(cfg.to_url(), "redis://127.0.0.1:6379/0");
    }
}
