//! Top-level facade (§4.7): validates a server descriptor against the
//! dialect registry and the registry's own field validator, but performs
//! no network I/O until the returned Session's `db()`/`execute()` is used.

use crate::adapter::registry as adapter_registry;
use crate::descriptor::ServerDescriptor;
use crate::error::{GatewayError, Result};
use crate::registry::{self, Registry};
use crate::session::Session;

pub struct Gateway {
    registry: Registry,
}

impl Gateway {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub fn at_default_path() -> Result<Self> {
        Ok(Self { registry: Registry::at_default_path()? })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Validates `descriptor` (shape + known dialect) and hands back a
    /// Session ready to lazily connect. No network I/O happens here.
    pub fn create_server(&self, descriptor: ServerDescriptor, vault_key: &str) -> Result<Session> {
        registry::validate(&descriptor)?;
        if !adapter_registry::is_known_dialect(&descriptor.client) {
            return Err(GatewayError::validation("client", "oneOf(CLIENTS)"));
        }
        Session::new(descriptor, vault_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Address;
    use tempfile::NamedTempFile;

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

    #[test]
    fn rejects_unknown_dialect() {
        let file = NamedTempFile::new().unwrap();
        let gateway = Gateway::new(Registry::new(file.path()));
        let mut bad = descriptor();
        bad.client = "oracle".into();
        let err = gateway.create_server(bad, "key").unwrap_err();
        assert!(matches!(err, GatewayError::Validation { .. }));
    }

    #[test]
    fn accepts_known_dialect_without_touching_network() {
        let file = NamedTempFile::new().unwrap();
        let gateway = Gateway::new(Registry::new(file.path()));
        assert!(gateway.create_server(descriptor(), "key").is_ok());
    }
}
