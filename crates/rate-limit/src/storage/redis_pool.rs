//! Pooled multiplexed Redis connections.

use std::sync::atomic::{AtomicUsize, Ordering};

use deadpool::managed::{self, Metrics, PoolConfig};
use redis::{Client, ClientTlsConfig, ErrorKind, RedisError, RedisResult, TlsCertificates, aio::MultiplexedConnection};

use config::{RedisConfig, RedisTlsConfig};

pub(crate) type Pool = managed::Pool<Manager>;

pub(crate) struct Manager {
    client: Client,
    ping_number: AtomicUsize,
}

impl Manager {
    fn new(config: &RedisConfig) -> RedisResult<Self> {
        let client = match &config.tls {
            Some(tls) if tls.insecure.unwrap_or(false) => {
                // redis-rs skips certificate verification for `#insecure` URLs.
                let url = format!("{}#insecure", config.url);
                Client::build_with_tls(url, read_certificates(tls)?)?
            }
            Some(tls) => Client::build_with_tls(config.url.clone(), read_certificates(tls)?)?,
            None => Client::open(config.url.as_str())?,
        };

        Ok(Self {
            client,
            ping_number: AtomicUsize::new(0),
        })
    }
}

impl managed::Manager for Manager {
    type Type = MultiplexedConnection;
    type Error = RedisError;

    async fn create(&self) -> Result<MultiplexedConnection, Self::Error> {
        self.client.get_multiplexed_async_connection().await
    }

    async fn recycle(&self, conn: &mut MultiplexedConnection, _: &Metrics) -> managed::RecycleResult<Self::Error> {
        let ping_number = self.ping_number.fetch_add(1, Ordering::Relaxed).to_string();

        let pong: String = redis::cmd("PING").arg(&ping_number).query_async(conn).await?;

        if pong == ping_number {
            Ok(())
        } else {
            Err(managed::RecycleError::message("Invalid PING response"))
        }
    }
}

fn read_certificates(config: &RedisTlsConfig) -> RedisResult<TlsCertificates> {
    let read = |path: &str, what: &'static str| {
        std::fs::read(path).map_err(|e| RedisError::from((ErrorKind::IoError, what, format!("{path}: {e}"))))
    };

    let client_tls = match (&config.client_cert_path, &config.client_key_path) {
        (Some(cert), Some(key)) => Some(ClientTlsConfig {
            client_cert: read(cert, "Failed to read client certificate")?,
            client_key: read(key, "Failed to read client key")?,
        }),
        _ => None,
    };

    let root_cert = config
        .ca_cert_path
        .as_deref()
        .map(|path| read(path, "Failed to read CA certificate"))
        .transpose()?;

    Ok(TlsCertificates { client_tls, root_cert })
}

/// Create a connection pool for one Redis endpoint.
pub(crate) fn create_pool(config: &RedisConfig) -> RedisResult<Pool> {
    let manager = Manager::new(config)?;
    let mut pool_config = PoolConfig::default();

    if let Some(max_size) = config.pool.max_size {
        pool_config.max_size = max_size;
    }

    pool_config.timeouts.create = config.pool.timeout_create;
    pool_config.timeouts.wait = config.pool.timeout_wait;
    pool_config.timeouts.recycle = config.pool.timeout_recycle;

    Pool::builder(manager)
        .config(pool_config)
        .runtime(deadpool::Runtime::Tokio1)
        .build()
        .map_err(|e| RedisError::from((ErrorKind::IoError, "Failed to create pool", e.to_string())))
}
