//! Process-wide dialect → adapter-constructor registry (§9: "process
//! singletons; initialize once, never reassign").

use std::collections::HashMap;
use std::sync::OnceLock;

use super::cassandra::CassandraAdapter;
use super::mssql::MssqlAdapter;
use super::mysql::MysqlAdapter;
use super::postgres::PostgresAdapter;
use super::sqlite::SqliteAdapter;
use super::DialectAdapter;

type Constructor = fn() -> Box<dyn DialectAdapter>;

fn constructors() -> &'static HashMap<&'static str, Constructor> {
    static MAP: OnceLock<HashMap<&'static str, Constructor>> = OnceLock::new();
    MAP.get_or_init(|| {
        let mut m: HashMap<&'static str, Constructor> = HashMap::new();
        m.insert("postgresql", || Box::new(PostgresAdapter::new(false)));
        m.insert("redshift", || Box::new(PostgresAdapter::new(true)));
        m.insert("mysql", || Box::new(MysqlAdapter::new()));
        m.insert("mariadb", || Box::new(MysqlAdapter::new()));
        m.insert("sqlserver", || Box::new(MssqlAdapter::new()));
        m.insert("sqlite", || Box::new(SqliteAdapter::new()));
        m.insert("cassandra", || Box::new(CassandraAdapter::new()));
        m
    })
}

/// Every dialect key recognized by the registry.
pub fn known_dialects() -> Vec<&'static str> {
    constructors().keys().copied().collect()
}

pub fn is_known_dialect(key: &str) -> bool {
    constructors().contains_key(key)
}

/// Construct a fresh, not-yet-connected adapter for `dialect`.
pub fn build(dialect: &str) -> Option<Box<dyn DialectAdapter>> {
    constructors().get(dialect).map(|ctor| ctor())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_all_clients_dialect_keys() {
        for key in ["mysql", "mariadb", "postgresql", "redshift", "sqlserver", "sqlite", "cassandra"] {
            assert!(is_known_dialect(key), "{key} should be a known dialect");
        }
        assert!(!is_known_dialect("oracle"));
    }

    #[test]
    fn build_returns_an_adapter_for_each_known_key() {
        for key in known_dialects() {
            assert!(build(key).is_some());
        }
    }
}
