//! MySQL/MariaDB adapter, grounded on the same sqlx pool-plus-introspection
//! pattern as the PostgreSQL adapter, using `information_schema` and
//! backtick identifier quoting.

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, MySqlPool, Row, TypeInfo, ValueRef};
use tokio::sync::RwLock;

use crate::error::{GatewayError, Result};
use crate::statement::{identify_statements, StatementType};

use super::{
    wrap_identifier_with, CancelWaiter, ColumnInfo, ConnectParams, DialectAdapter, FieldInfo,
    NormalizedResult, TableRef, VersionInfo,
};

pub struct MysqlAdapter {
    pool: RwLock<Option<MySqlPool>>,
}

impl MysqlAdapter {
    pub fn new() -> Self {
        Self { pool: RwLock::new(None) }
    }

    async fn pool(&self) -> Result<MySqlPool> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| GatewayError::Connect("not connected".into()))
    }
}

#[async_trait]
impl DialectAdapter for MysqlAdapter {
    fn dialect_key(&self) -> &'static str {
        "mysql"
    }

    async fn connect(&mut self, params: ConnectParams) -> Result<VersionInfo> {
        let mut opts = MySqlConnectOptions::new().host(&params.host).port(params.port);
        if let Some(user) = &params.user {
            opts = opts.username(user);
        }
        if let Some(password) = &params.password {
            opts = opts.password(password);
        }
        if let Some(db) = &params.database {
            opts = opts.database(db);
        }

        let pool = MySqlPoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .map_err(|e| GatewayError::Connect(e.to_string()))?;

        let row = sqlx::query("SELECT VERSION()")
            .fetch_one(&pool)
            .await
            .map_err(|e| GatewayError::Connect(e.to_string()))?;
        let version_string: String = row.try_get(0).unwrap_or_default();
        *self.pool.write().await = Some(pool);

        Ok(VersionInfo {
            name: "mysql".into(),
            version: version_string
                .split(|c: char| !c.is_ascii_digit() && c != '.')
                .next()
                .unwrap_or("0")
                .to_string(),
            string: version_string,
        })
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
        }
        Ok(())
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        let pool = self.pool().await?;
        let rows = sqlx::query("SHOW DATABASES")
            .fetch_all(&pool)
            .await
            .map_err(|e| GatewayError::Query(e.to_string()))?;
        Ok(rows.iter().filter_map(|r| r.try_get::<String, _>(0).ok()).collect())
    }

    async fn list_tables(&self, _schema: Option<&str>) -> Result<Vec<TableRef>> {
        // MySQL/MariaDB has no schema-qualified listing: a "database" is
        // the unit of namespacing and is already selected by the pool.
        let pool = self.pool().await?;
        let rows = sqlx::query(
            "SELECT table_name FROM information_schema.tables WHERE table_schema = DATABASE() AND table_type = 'BASE TABLE' ORDER BY table_name",
        )
        .fetch_all(&pool)
        .await
        .map_err(|e| GatewayError::Query(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|r| TableRef { schema: None, name: r.try_get::<String, _>(0).unwrap_or_default() })
            .collect())
    }

    async fn list_table_columns(&self, table: &str, _schema: Option<&str>) -> Result<Vec<ColumnInfo>> {
        let pool = self.pool().await?;
        let rows = sqlx::query(
            "SELECT column_name, data_type, is_nullable FROM information_schema.columns WHERE table_schema = DATABASE() AND table_name = ? ORDER BY ordinal_position",
        )
        .bind(table)
        .fetch_all(&pool)
        .await
        .map_err(|e| GatewayError::Query(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|r| ColumnInfo {
                table: table.to_string(),
                schema: None,
                name: r.try_get::<String, _>(0).unwrap_or_default(),
                data_type: r.try_get::<String, _>(1).unwrap_or_default(),
                nullable: r.try_get::<String, _>(2).map(|v| v == "YES").unwrap_or(true),
            })
            .collect())
    }

    async fn list_views(&self, _schema: Option<&str>) -> Result<Vec<TableRef>> {
        let pool = self.pool().await?;
        let rows = sqlx::query(
            "SELECT table_name FROM information_schema.views WHERE table_schema = DATABASE() ORDER BY table_name",
        )
        .fetch_all(&pool)
        .await
        .map_err(|e| GatewayError::Query(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|r| TableRef { schema: None, name: r.try_get::<String, _>(0).unwrap_or_default() })
            .collect())
    }

    async fn list_routines(&self, _schema: Option<&str>) -> Result<Vec<String>> {
        let pool = self.pool().await?;
        let rows = sqlx::query(
            "SELECT routine_name FROM information_schema.routines WHERE routine_schema = DATABASE() AND routine_type = 'PROCEDURE' ORDER BY routine_name",
        )
        .fetch_all(&pool)
        .await
        .map_err(|e| GatewayError::Query(e.to_string()))?;
        Ok(rows.iter().filter_map(|r| r.try_get::<String, _>(0).ok()).collect())
    }

    async fn list_table_triggers(&self, table: &str, _schema: Option<&str>) -> Result<Vec<String>> {
        let pool = self.pool().await?;
        let rows = sqlx::query(
            "SELECT trigger_name FROM information_schema.triggers WHERE event_object_schema = DATABASE() AND event_object_table = ? ORDER BY trigger_name",
        )
        .bind(table)
        .fetch_all(&pool)
        .await
        .map_err(|e| GatewayError::Query(e.to_string()))?;
        Ok(rows.iter().filter_map(|r| r.try_get::<String, _>(0).ok()).collect())
    }

    async fn get_table_create_script(&self, table: &str, _schema: Option<&str>) -> Result<String> {
        let pool = self.pool().await?;
        let row = sqlx::query(&format!("SHOW CREATE TABLE {}", self.wrap_identifier(table)))
            .fetch_one(&pool)
            .await
            .map_err(|e| GatewayError::Query(e.to_string()))?;
        row.try_get::<String, _>(1).map_err(|e| GatewayError::Query(e.to_string()))
    }

    async fn get_view_create_script(&self, view: &str, _schema: Option<&str>) -> Result<String> {
        let pool = self.pool().await?;
        let row = sqlx::query(&format!("SHOW CREATE VIEW {}", self.wrap_identifier(view)))
            .fetch_one(&pool)
            .await
            .map_err(|e| GatewayError::Query(e.to_string()))?;
        row.try_get::<String, _>(1).map_err(|e| GatewayError::Query(e.to_string()))
    }

    async fn truncate_all_tables(&self) -> Result<()> {
        let pool = self.pool().await?;
        let tables = self.list_tables(None).await?;
        sqlx::query("SET FOREIGN_KEY_CHECKS = 0")
            .execute(&pool)
            .await
            .map_err(|e| GatewayError::Query(e.to_string()))?;
        for t in tables {
            sqlx::query(&format!("TRUNCATE TABLE {}", self.wrap_identifier(&t.name)))
                .execute(&pool)
                .await
                .map_err(|e| GatewayError::Query(e.to_string()))?;
        }
        sqlx::query("SET FOREIGN_KEY_CHECKS = 1")
            .execute(&pool)
            .await
            .map_err(|e| GatewayError::Query(e.to_string()))?;
        Ok(())
    }

    fn get_query_select_top(&self, table: &str, schema: Option<&str>, limit: u64) -> String {
        let qualified = self.qualify(table, schema);
        format!("SELECT * FROM {qualified} LIMIT {limit}")
    }

    async fn execute_query(&self, text: &str, cancel: CancelWaiter) -> Result<Vec<NormalizedResult>> {
        let pool = self.pool().await?;
        let statements = identify_statements(text);
        let mut results = Vec::with_capacity(statements.len());
        let mut cancel = Some(cancel);

        for (idx, stmt) in statements.iter().enumerate() {
            let is_select = matches!(stmt.kind, StatementType::Select | StatementType::Explain);

            let outcome = if is_select {
                let fetch = sqlx::query(&stmt.text).fetch_all(&pool);
                if let Some(waiter) = cancel.take() {
                    tokio::select! {
                        biased;
                        _ = waiter.wait() => Err(GatewayError::Canceled),
                        r = fetch => r
                            .map_err(|e| GatewayError::Query(format!("statement {idx}: {e}")))
                            .map(|rows| rows_to_result(&rows, stmt.kind)),
                    }
                } else {
                    fetch
                        .await
                        .map_err(|e| GatewayError::Query(format!("statement {idx}: {e}")))
                        .map(|rows| rows_to_result(&rows, stmt.kind))
                }
            } else {
                sqlx::query(&stmt.text)
                    .execute(&pool)
                    .await
                    .map(|r| {
                        let mut nr = NormalizedResult::empty_for(stmt.kind);
                        nr.affected_rows = Some(r.rows_affected());
                        nr
                    })
                    .map_err(|e| GatewayError::Query(format!("statement {idx}: {e}")))
            };

            results.push(outcome?);
        }

        Ok(results)
    }

    fn wrap_identifier(&self, name: &str) -> String {
        wrap_identifier_with(name, '`')
    }
}

fn rows_to_result(rows: &[MySqlRow], kind: StatementType) -> NormalizedResult {
    if rows.is_empty() {
        return NormalizedResult::empty_for(kind);
    }

    let fields = rows[0]
        .columns()
        .iter()
        .map(|c| FieldInfo { name: c.name().to_string() })
        .collect::<Vec<_>>();

    let out_rows = rows
        .iter()
        .map(|row| {
            let mut map = Map::new();
            for (i, col) in row.columns().iter().enumerate() {
                map.insert(col.name().to_string(), extract_cell_value(row, i, col.type_info().name()));
            }
            map
        })
        .collect();

    NormalizedResult {
        command: if matches!(kind, StatementType::Unknown) { "SELECT".into() } else { kind.as_command().into() },
        row_count: Some(rows.len() as u64),
        rows: out_rows,
        fields,
        affected_rows: None,
    }
}

fn extract_cell_value(row: &MySqlRow, index: usize, type_name: &str) -> Value {
    match row.try_get_raw(index) {
        Ok(raw) if raw.is_null() => Value::Null,
        Ok(_) => decode_cell_value(row, index, type_name),
        Err(_) => Value::Null,
    }
}

fn decode_cell_value(row: &MySqlRow, index: usize, type_name: &str) -> Value {
    if let Ok(v) = row.try_get::<String, _>(index) {
        return Value::String(v);
    }
    match type_name {
        "BOOLEAN" | "TINYINT" => row
            .try_get::<i32, _>(index)
            .map(|v| Value::Number(v.into()))
            .unwrap_or(Value::Null),
        "SMALLINT" | "INT" | "MEDIUMINT" => row
            .try_get::<i32, _>(index)
            .map(|v| Value::Number(v.into()))
            .unwrap_or(Value::Null),
        "BIGINT" => row
            .try_get::<i64, _>(index)
            .map(|v| Value::Number(v.into()))
            .unwrap_or(Value::Null),
        "FLOAT" => row
            .try_get::<f32, _>(index)
            .ok()
            .and_then(|v| serde_json::Number::from_f64(v as f64))
            .map(Value::Number)
            .unwrap_or(Value::Null),
        "DOUBLE" => row
            .try_get::<f64, _>(index)
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        "DECIMAL" => row
            .try_get::<rust_decimal::Decimal, _>(index)
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_uses_backticks() {
        let a = MysqlAdapter::new();
        assert_eq!(a.wrap_identifier("users"), "`users`");
    }
}
