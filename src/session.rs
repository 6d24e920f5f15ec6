//! A Session owns one decrypted `ServerDescriptor`, an optional live SSH
//! tunnel, and the set of per-database adapter connections opened against
//! it (§4.6). Nothing here touches the network until `db()` is called for
//! a database that hasn't been connected yet.

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::adapter::{registry as adapter_registry, CancelWaiter, ConnectParams, DialectAdapter, VersionInfo};
use crate::descriptor::{Address, ServerDescriptor};
use crate::error::{GatewayError, Result};
use crate::registry::decrypt_secrets;
use crate::ssh::{SshTunnel, SshTunnelConfig};

/// One dialect connection opened for a particular database name, plus the
/// version probe captured when it was established.
struct Connection {
    adapter: Box<dyn DialectAdapter>,
    version: VersionInfo,
}

pub struct Session {
    descriptor: ServerDescriptor,
    tunnel: Option<SshTunnel>,
    connections: Mutex<HashMap<String, Connection>>,
}

impl Session {
    /// Decrypts `descriptor`'s secrets (if `encrypted`) and returns a
    /// Session with no open connections and no tunnel yet.
    pub fn new(descriptor: ServerDescriptor, vault_key: &str) -> Result<Self> {
        let descriptor = if descriptor.encrypted {
            decrypt_secrets(&descriptor, vault_key)?
        } else {
            descriptor
        };
        Ok(Self { descriptor, tunnel: None, connections: Mutex::new(HashMap::new()) })
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    /// Returns the adapter connected to `database` (the descriptor's own
    /// database if `None`), opening it — and the SSH tunnel, if this is
    /// the first connection for the session — on demand.
    pub async fn db(&mut self, database: Option<&str>) -> Result<VersionInfo> {
        let db_name = self.resolve_db_name(database);

        {
            let connections = self.connections.lock().await;
            if let Some(conn) = connections.get(&db_name) {
                return Ok(conn.version.clone());
            }
        }

        self.create_connection(db_name).await
    }

    /// The canonical memoization key for a `db()`/`execute()` database
    /// argument: the explicit name, else the descriptor's own database,
    /// else the empty string. Used identically by the cache lookup in
    /// `db()` and the cache insert in `create_connection()` so the two
    /// never disagree about what a connection is keyed under.
    fn resolve_db_name(&self, database: Option<&str>) -> String {
        database
            .map(|s| s.to_string())
            .or_else(|| self.descriptor.database.clone())
            .unwrap_or_default()
    }

    async fn create_connection(&mut self, database: String) -> Result<VersionInfo> {
        if !adapter_registry::is_known_dialect(&self.descriptor.client) {
            tracing::error!(dialect = %self.descriptor.client, "unknown dialect requested for connection");
            return Err(GatewayError::Validation {
                field: "client".into(),
                validator: "oneOf(CLIENTS)".into(),
            });
        }

        // 1. Start the tunnel (once per session) if ssh is configured,
        //    rewriting connect params to the local forwarded port.
        let (host, port) = self.real_address()?;
        let (connect_host, connect_port) = if let Some(ssh) = self.descriptor.ssh.clone() {
            if self.tunnel.is_none() {
                tracing::debug!(server = %self.descriptor.name, ssh_host = %ssh.host, "starting ssh tunnel");
                let config = SshTunnelConfig::from_descriptor(&ssh, host.clone(), port);
                self.tunnel = Some(SshTunnel::start(config).await?);
            }
            let tunnel = self.tunnel.as_ref().unwrap();
            (tunnel.local_host().to_string(), tunnel.local_port())
        } else {
            (host, port)
        };

        // 2. Build and connect the dialect adapter.
        let mut adapter = adapter_registry::build(&self.descriptor.client)
            .ok_or_else(|| GatewayError::NotSupported(self.descriptor.client.clone()))?;

        let params = ConnectParams {
            host: connect_host,
            port: connect_port,
            database: if database.is_empty() { None } else { Some(database.clone()) },
            user: self.descriptor.user.clone(),
            password: self.descriptor.password.clone(),
            ssl: self.descriptor.ssl,
        };

        // 3. Probe the version as part of connecting.
        let version = adapter.connect(params).await.map_err(|e| {
            tracing::error!(server = %self.descriptor.name, dialect = %self.descriptor.client, error = %e, "failed to connect");
            e
        })?;
        tracing::debug!(server = %self.descriptor.name, dialect = %self.descriptor.client, version = %version.version, "connected");

        // 4. Memoize under the same key `db()` looks up by — not the
        //    probed dialect name, which would never match a later lookup
        //    keyed on an empty/defaulted database argument.
        self.connections.lock().await.insert(database, Connection { adapter, version: version.clone() });

        Ok(version)
    }

    fn real_address(&self) -> Result<(String, u16)> {
        match &self.descriptor.address {
            Address::HostPort { host, port } => Ok((host.clone(), *port)),
            Address::Socket { socket_path } => Err(GatewayError::NotSupported(format!(
                "unix socket address {socket_path} cannot be tunneled"
            ))),
        }
    }

    /// Runs `text` against the connection for `database`, opening it first
    /// if necessary.
    pub async fn execute(
        &mut self,
        database: Option<&str>,
        text: &str,
        cancel: CancelWaiter,
    ) -> Result<Vec<crate::adapter::NormalizedResult>> {
        self.db(database).await?;
        let key = self.resolve_db_name(database);

        let connections = self.connections.lock().await;
        let conn = connections.get(&key).ok_or(GatewayError::QueryNotReady)?;
        conn.adapter.execute_query(text, cancel).await
    }

    /// Disconnects every open connection and tears down the tunnel, if any.
    pub async fn end(&mut self) -> Result<()> {
        let mut connections = self.connections.lock().await;
        for (_, mut conn) in connections.drain() {
            conn.adapter.disconnect().await?;
        }
        drop(connections);
        self.tunnel = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Address;

    fn descriptor() -> ServerDescriptor {
        ServerDescriptor {
            id: None,
            name: "local".into(),
            client: "sqlite".into(),
            address: Address::HostPort { host: "localhost".into(), port: 0 },
            database: Some(":memory:".into()),
            user: None,
            password: None,
            ssl: false,
            ssh: None,
            encrypted: false,
        }
    }

    /// No default database at all, so `db(None)` resolves to the empty
    /// string key at both the lookup site and the memoization site.
    fn descriptor_without_default_database() -> ServerDescriptor {
        let mut d = descriptor();
        d.database = None;
        d
    }

    #[test]
    fn new_session_does_not_touch_network() {
        let session = Session::new(descriptor(), "unused").unwrap();
        assert_eq!(session.descriptor().client, "sqlite");
    }

    #[tokio::test]
    async fn db_opens_sqlite_in_memory_connection() {
        let mut session = Session::new(descriptor(), "unused").unwrap();
        let version = session.db(None).await.unwrap();
        assert_eq!(version.name, "sqlite");
        session.end().await.unwrap();
    }

    /// Regression: repeated `db(None)` calls (and `execute(None, ...)`,
    /// which calls `db()` first) must hit the same memoized connection
    /// rather than reconnecting every time.
    #[tokio::test]
    async fn repeated_db_none_reuses_the_same_connection() {
        let mut session = Session::new(descriptor_without_default_database(), "unused").unwrap();

        session.db(None).await.unwrap();
        assert_eq!(session.connections.lock().await.len(), 1);

        session.db(None).await.unwrap();
        assert_eq!(
            session.connections.lock().await.len(),
            1,
            "second db(None) call opened a second connection instead of reusing the memoized one"
        );

        session.end().await.unwrap();
    }
}
