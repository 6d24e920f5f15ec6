//! The persisted server descriptor and its nested SSH tunnel config.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One of the dialect keys the gateway recognizes (CLIENTS, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Mysql,
    Mariadb,
    Postgresql,
    Redshift,
    Sqlserver,
    Sqlite,
    Cassandra,
}

impl Dialect {
    pub fn key(&self) -> &'static str {
        match self {
            Dialect::Mysql => "mysql",
            Dialect::Mariadb => "mariadb",
            Dialect::Postgresql => "postgresql",
            Dialect::Redshift => "redshift",
            Dialect::Sqlserver => "sqlserver",
            Dialect::Sqlite => "sqlite",
            Dialect::Cassandra => "cassandra",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "mysql" => Some(Dialect::Mysql),
            "mariadb" => Some(Dialect::Mariadb),
            "postgresql" => Some(Dialect::Postgresql),
            "redshift" => Some(Dialect::Redshift),
            "sqlserver" => Some(Dialect::Sqlserver),
            "sqlite" => Some(Dialect::Sqlite),
            "cassandra" => Some(Dialect::Cassandra),
            _ => None,
        }
    }

    pub fn default_database(&self) -> Option<&'static str> {
        match self {
            Dialect::Postgresql | Dialect::Redshift => Some("postgres"),
            Dialect::Mysql | Dialect::Mariadb => None,
            Dialect::Sqlserver => Some("master"),
            Dialect::Sqlite => None,
            Dialect::Cassandra => Some("system"),
        }
    }

    /// Feature keys this dialect disables for registry field validation
    /// (`server:<field>` entries suppressed before the schema is applied).
    pub fn disabled_features(&self) -> &'static [&'static str] {
        match self {
            Dialect::Sqlite => &["server:ssh", "server:user", "server:password", "server:ssl"],
            Dialect::Cassandra => &["server:ssh"],
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", untagged)]
pub enum SshAuth {
    Password { password: String },
    PrivateKey { private_key: String, passphrase: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshDescriptor {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(flatten)]
    pub auth: SshAuth,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", untagged)]
pub enum Address {
    HostPort { host: String, port: u16 },
    Socket { socket_path: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDescriptor {
    pub id: Option<Uuid>,
    pub name: String,
    pub client: String,
    #[serde(flatten)]
    pub address: Address,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub ssl: bool,
    #[serde(default)]
    pub ssh: Option<SshDescriptor>,
    #[serde(default)]
    pub encrypted: bool,
}
