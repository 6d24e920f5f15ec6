//! Unified, dialect-agnostic database access gateway: one adapter
//! contract over PostgreSQL, MySQL/MariaDB, SQL Server, SQLite,
//! Cassandra, and Redshift, plus SSH tunneling and an encrypted-at-rest
//! server registry.

pub mod adapter;
pub mod descriptor;
pub mod error;
pub mod gateway;
pub mod registry;
pub mod session;
pub mod ssh;
pub mod statement;
pub mod vault;
pub mod version;

pub use descriptor::{Address, Dialect, ServerDescriptor, SshAuth, SshDescriptor};
pub use error::{GatewayError, Result, CANCELED_BY_USER};
pub use gateway::Gateway;
pub use session::Session;

/// Installs an env-filtered `tracing` subscriber for test output. A
/// library never installs a global subscriber on its own; this exists so
/// integration tests can opt into seeing the `tracing::debug!`/`warn!`
/// events emitted throughout the gateway.
#[cfg(test)]
pub(crate) fn init_test_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
