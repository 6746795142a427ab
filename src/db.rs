//! Database connection management
//!
//! Builds the pool for the analytics database. Every connection it hands out
//! is used read-only; the executor enforces that per transaction.

use crate::config::DatabaseConfig;
use deadpool_postgres::{
    Config, CreatePoolError, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime, Timeouts,
};
use tokio_postgres::NoTls;
use tracing::{debug, warn};

/// Create the connection pool, with rustls when the database requires TLS
pub fn create_pool(config: &DatabaseConfig) -> Result<Pool, CreatePoolError> {
    let mut cfg = Config::new();
    cfg.host = Some(config.host.clone());
    cfg.port = Some(config.port);
    cfg.user = Some(config.user.clone());
    cfg.password = Some(config.password.clone());
    cfg.dbname = Some(config.database.clone());
    cfg.application_name = Some(env!("CARGO_PKG_NAME").to_string());
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    cfg.connect_timeout = Some(config.connect_timeout);
    cfg.pool = Some(PoolConfig {
        max_size: config.max_pool_size.max(1),
        // A server that accepts TCP but never answers the startup handshake
        // would otherwise hold `pool.get()` forever
        timeouts: Timeouts {
            wait: Some(config.connect_timeout),
            create: Some(config.connect_timeout),
            recycle: Some(config.connect_timeout),
        },
        ..PoolConfig::default()
    });

    debug!(
        host = %config.host,
        port = config.port,
        database = %config.database,
        max_pool_size = config.max_pool_size,
        tls = config.require_tls,
        "Creating database pool"
    );

    if config.require_tls {
        let certs = rustls_native_certs::load_native_certs();
        for e in &certs.errors {
            warn!("Skipping unreadable native certificate: {}", e);
        }
        let mut root_store = rustls::RootCertStore::empty();
        for cert in certs.certs {
            root_store.add(cert).ok();
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);
        cfg.create_pool(Some(Runtime::Tokio1), tls)
    } else {
        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::silent_peer;
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pool_creation_is_lazy() {
        // Nothing listens here; building the pool must still succeed
        let config = DatabaseConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            max_pool_size: 2,
            ..DatabaseConfig::default()
        };
        let pool = create_pool(&config).unwrap();
        assert_eq!(pool.status().max_size, 2);
    }

    #[tokio::test]
    async fn test_silent_server_does_not_hang_checkout() {
        let config = DatabaseConfig {
            host: "127.0.0.1".to_string(),
            port: silent_peer().await,
            connect_timeout: Duration::from_millis(200),
            ..DatabaseConfig::default()
        };
        let pool = create_pool(&config).unwrap();

        let checkout = tokio::time::timeout(Duration::from_secs(5), pool.get())
            .await
            .expect("checkout must respect the pool timeouts");
        assert!(checkout.is_err());
    }
}
