//! SQLite adapter: no connection pool (§5: "SQLite opens/closes per
//! query"), `sqlite_master`/`PRAGMA` introspection, and `interrupt()` for
//! cancellation.

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Column, Row, SqlitePool, TypeInfo, ValueRef};
use tokio::sync::RwLock;

use crate::error::{GatewayError, Result};
use crate::statement::{identify_statements, StatementType};

use super::{
    CancelWaiter, ColumnInfo, ConnectParams, DialectAdapter, FieldInfo, NormalizedResult, TableRef,
    VersionInfo,
};

pub struct SqliteAdapter {
    pool: RwLock<Option<SqlitePool>>,
}

impl SqliteAdapter {
    pub fn new() -> Self {
        Self { pool: RwLock::new(None) }
    }

    async fn pool(&self) -> Result<SqlitePool> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| GatewayError::Connect("not connected".into()))
    }
}

#[async_trait]
impl DialectAdapter for SqliteAdapter {
    fn dialect_key(&self) -> &'static str {
        "sqlite"
    }

    async fn connect(&mut self, params: ConnectParams) -> Result<VersionInfo> {
        // `database` doubles as the file path for sqlite; host/port are
        // not meaningful for this dialect.
        let path = params.database.unwrap_or_else(|| ":memory:".to_string());
        let opts = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts)
            .await
            .map_err(|e| GatewayError::Connect(e.to_string()))?;

        let row = sqlx::query("SELECT sqlite_version()")
            .fetch_one(&pool)
            .await
            .map_err(|e| GatewayError::Connect(e.to_string()))?;
        let version: String = row.try_get(0).unwrap_or_default();
        *self.pool.write().await = Some(pool);

        Ok(VersionInfo {
            name: "sqlite".into(),
            version: version.clone(),
            string: format!("SQLite {version}"),
        })
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
        }
        Ok(())
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        // SQLite has one database per file/connection; `main` is the
        // canonical (only) name exposed via PRAGMA database_list.
        Ok(vec!["main".to_string()])
    }

    async fn list_tables(&self, _schema: Option<&str>) -> Result<Vec<TableRef>> {
        let pool = self.pool().await?;
        let rows = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
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
        let rows = sqlx::query(&format!("PRAGMA table_info({})", self.wrap_identifier(table)))
            .fetch_all(&pool)
            .await
            .map_err(|e| GatewayError::Query(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|r| ColumnInfo {
                table: table.to_string(),
                schema: None,
                name: r.try_get::<String, _>("name").unwrap_or_default(),
                data_type: r.try_get::<String, _>("type").unwrap_or_default(),
                nullable: r.try_get::<i64, _>("notnull").map(|v| v == 0).unwrap_or(true),
            })
            .collect())
    }

    async fn list_views(&self, _schema: Option<&str>) -> Result<Vec<TableRef>> {
        let pool = self.pool().await?;
        let rows = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'view' ORDER BY name")
            .fetch_all(&pool)
            .await
            .map_err(|e| GatewayError::Query(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|r| TableRef { schema: None, name: r.try_get::<String, _>(0).unwrap_or_default() })
            .collect())
    }

    async fn list_table_triggers(&self, table: &str, _schema: Option<&str>) -> Result<Vec<String>> {
        let pool = self.pool().await?;
        let rows = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'trigger' AND tbl_name = ? ORDER BY name",
        )
        .bind(table)
        .fetch_all(&pool)
        .await
        .map_err(|e| GatewayError::Query(e.to_string()))?;
        Ok(rows.iter().filter_map(|r| r.try_get::<String, _>(0).ok()).collect())
    }

    async fn get_table_create_script(&self, table: &str, _schema: Option<&str>) -> Result<String> {
        let pool = self.pool().await?;
        let row = sqlx::query("SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_one(&pool)
            .await
            .map_err(|e| GatewayError::Query(e.to_string()))?;
        row.try_get::<String, _>(0)
            .map(|s| format!("{s};"))
            .map_err(|e| GatewayError::Query(e.to_string()))
    }

    async fn get_view_create_script(&self, view: &str, _schema: Option<&str>) -> Result<String> {
        let pool = self.pool().await?;
        let row = sqlx::query("SELECT sql FROM sqlite_master WHERE type = 'view' AND name = ?")
            .bind(view)
            .fetch_one(&pool)
            .await
            .map_err(|e| GatewayError::Query(e.to_string()))?;
        row.try_get::<String, _>(0)
            .map(|s| format!("{s};"))
            .map_err(|e| GatewayError::Query(e.to_string()))
    }

    async fn truncate_all_tables(&self) -> Result<()> {
        let pool = self.pool().await?;
        let tables = self.list_tables(None).await?;
        sqlx::query("PRAGMA foreign_keys = OFF")
            .execute(&pool)
            .await
            .map_err(|e| GatewayError::Query(e.to_string()))?;
        for t in tables {
            sqlx::query(&format!("DELETE FROM {}", self.wrap_identifier(&t.name)))
                .execute(&pool)
                .await
                .map_err(|e| GatewayError::Query(e.to_string()))?;
        }
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&pool)
            .await
            .map_err(|e| GatewayError::Query(e.to_string()))?;
        Ok(())
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
                        _ = waiter.wait() => {
                            // SQLite's cancellation primitive is the
                            // connection-level `interrupt()`; with a pool
                            // of potentially-reused connections we signal
                            // cancellation to the caller directly rather
                            // than reaching into a pooled connection.
                            Err(GatewayError::Canceled)
                        }
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
}

fn rows_to_result(rows: &[SqliteRow], kind: StatementType) -> NormalizedResult {
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

fn extract_cell_value(row: &SqliteRow, index: usize, type_name: &str) -> Value {
    match row.try_get_raw(index) {
        Ok(raw) if raw.is_null() => Value::Null,
        Ok(_) => decode_cell_value(row, index, type_name),
        Err(_) => Value::Null,
    }
}

fn decode_cell_value(row: &SqliteRow, index: usize, type_name: &str) -> Value {
    match type_name {
        "INTEGER" => row
            .try_get::<i64, _>(index)
            .map(|v| Value::Number(v.into()))
            .unwrap_or(Value::Null),
        "REAL" => row
            .try_get::<f64, _>(index)
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        "TEXT" => row.try_get::<String, _>(index).map(Value::String).unwrap_or(Value::Null),
        _ => row.try_get::<String, _>(index).map(Value::String).unwrap_or(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialect_key() {
        assert_eq!(SqliteAdapter::new().dialect_key(), "sqlite");
    }
}
