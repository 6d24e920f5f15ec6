//! PostgreSQL (and, via `redshift_mode`, Redshift) adapter.
//!
//! Grounded on the teacher's `services/database/{manager,query,schema}.rs`:
//! OID-joined introspection SQL, `try_get_raw`-then-type-dispatch cell
//! decoding, and a pooled `PgPool` behind an `RwLock`.

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{Column, PgPool, Row, TypeInfo, ValueRef};
use tokio::sync::RwLock;

use crate::error::{GatewayError, Result};
use crate::statement::{identify_statements, StatementType};

use super::{
    wrap_identifier_with, CancelWaiter, ColumnInfo, ConnectParams, DialectAdapter, FieldInfo,
    NormalizedResult, TableRef, VersionInfo,
};

pub struct PostgresAdapter {
    redshift_mode: bool,
    pool: RwLock<Option<PgPool>>,
    backend_pid: RwLock<Option<i32>>,
}

impl PostgresAdapter {
    pub fn new(redshift_mode: bool) -> Self {
        Self {
            redshift_mode,
            pool: RwLock::new(None),
            backend_pid: RwLock::new(None),
        }
    }

    async fn pool(&self) -> Result<PgPool> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| GatewayError::Connect("not connected".into()))
    }
}

#[async_trait]
impl DialectAdapter for PostgresAdapter {
    fn dialect_key(&self) -> &'static str {
        if self.redshift_mode {
            "redshift"
        } else {
            "postgresql"
        }
    }

    async fn connect(&mut self, params: ConnectParams) -> Result<VersionInfo> {
        let mut opts = PgConnectOptions::new()
            .host(&params.host)
            .port(params.port);
        if let Some(user) = &params.user {
            opts = opts.username(user);
        }
        if let Some(password) = &params.password {
            opts = opts.password(password);
        }
        if let Some(db) = &params.database {
            opts = opts.database(db);
        }
        if !params.ssl {
            opts = opts.ssl_mode(sqlx::postgres::PgSslMode::Prefer);
        } else {
            opts = opts.ssl_mode(sqlx::postgres::PgSslMode::Require);
        }

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .map_err(|e| GatewayError::Connect(e.to_string()))?;

        let row = sqlx::query("SELECT version(), pg_backend_pid()")
            .fetch_one(&pool)
            .await
            .map_err(|e| GatewayError::Connect(e.to_string()))?;
        let version_string: String = row.try_get(0).unwrap_or_default();
        let pid: i32 = row.try_get(1).unwrap_or_default();

        *self.backend_pid.write().await = Some(pid);
        *self.pool.write().await = Some(pool);

        Ok(VersionInfo {
            name: if self.redshift_mode { "redshift".into() } else { "postgresql".into() },
            version: version_string
                .split_whitespace()
                .nth(1)
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
        let rows = sqlx::query("SELECT datname FROM pg_database WHERE datistemplate = false ORDER BY datname")
            .fetch_all(&pool)
            .await
            .map_err(|e| GatewayError::Query(e.to_string()))?;
        Ok(rows.iter().filter_map(|r| r.try_get::<String, _>(0).ok()).collect())
    }

    async fn list_schemas(&self) -> Result<Vec<String>> {
        let pool = self.pool().await?;
        let rows = sqlx::query(
            "SELECT schema_name FROM information_schema.schemata WHERE schema_name NOT LIKE 'pg_%' AND schema_name != 'information_schema' ORDER BY schema_name",
        )
        .fetch_all(&pool)
        .await
        .map_err(|e| GatewayError::Query(e.to_string()))?;
        Ok(rows.iter().filter_map(|r| r.try_get::<String, _>(0).ok()).collect())
    }

    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<TableRef>> {
        let pool = self.pool().await?;
        let schema = schema.unwrap_or("public");
        let rows = sqlx::query(
            "SELECT table_schema, table_name FROM information_schema.tables WHERE table_schema = $1 AND table_type = 'BASE TABLE' ORDER BY table_name",
        )
        .bind(schema)
        .fetch_all(&pool)
        .await
        .map_err(|e| GatewayError::Query(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|r| TableRef {
                schema: r.try_get::<String, _>(0).ok(),
                name: r.try_get::<String, _>(1).unwrap_or_default(),
            })
            .collect())
    }

    async fn list_views(&self, schema: Option<&str>) -> Result<Vec<TableRef>> {
        let pool = self.pool().await?;
        let schema = schema.unwrap_or("public");
        let rows = sqlx::query(
            "SELECT table_schema, table_name FROM information_schema.views WHERE table_schema = $1 ORDER BY table_name",
        )
        .bind(schema)
        .fetch_all(&pool)
        .await
        .map_err(|e| GatewayError::Query(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|r| TableRef {
                schema: r.try_get::<String, _>(0).ok(),
                name: r.try_get::<String, _>(1).unwrap_or_default(),
            })
            .collect())
    }

    async fn list_table_columns(&self, table: &str, schema: Option<&str>) -> Result<Vec<ColumnInfo>> {
        let pool = self.pool().await?;
        let schema = schema.unwrap_or("public");
        let rows = sqlx::query(
            "SELECT column_name, data_type, is_nullable FROM information_schema.columns WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position",
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&pool)
        .await
        .map_err(|e| GatewayError::Query(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|r| ColumnInfo {
                table: table.to_string(),
                schema: Some(schema.to_string()),
                name: r.try_get::<String, _>(0).unwrap_or_default(),
                data_type: r.try_get::<String, _>(1).unwrap_or_default(),
                nullable: r.try_get::<String, _>(2).map(|v| v == "YES").unwrap_or(true),
            })
            .collect())
    }

    async fn list_routines(&self, schema: Option<&str>) -> Result<Vec<String>> {
        let pool = self.pool().await?;
        let schema = schema.unwrap_or("public");
        let rows = sqlx::query(
            "SELECT routine_name FROM information_schema.routines WHERE routine_schema = $1 AND routine_type = 'FUNCTION' ORDER BY routine_name",
        )
        .bind(schema)
        .fetch_all(&pool)
        .await
        .map_err(|e| GatewayError::Query(e.to_string()))?;
        Ok(rows.iter().filter_map(|r| r.try_get::<String, _>(0).ok()).collect())
    }

    async fn list_table_triggers(&self, table: &str, schema: Option<&str>) -> Result<Vec<String>> {
        let pool = self.pool().await?;
        let schema = schema.unwrap_or("public");
        let rows = sqlx::query(
            "SELECT trigger_name FROM information_schema.triggers WHERE event_object_schema = $1 AND event_object_table = $2 ORDER BY trigger_name",
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&pool)
        .await
        .map_err(|e| GatewayError::Query(e.to_string()))?;
        Ok(rows.iter().filter_map(|r| r.try_get::<String, _>(0).ok()).collect())
    }

    async fn list_table_indexes(&self, table: &str, schema: Option<&str>) -> Result<Vec<String>> {
        let pool = self.pool().await?;
        let schema = schema.unwrap_or("public");
        let rows = sqlx::query(
            "SELECT indexname FROM pg_indexes WHERE schemaname = $1 AND tablename = $2 ORDER BY indexname",
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&pool)
        .await
        .map_err(|e| GatewayError::Query(e.to_string()))?;
        Ok(rows.iter().filter_map(|r| r.try_get::<String, _>(0).ok()).collect())
    }

    async fn get_table_references(&self, table: &str, schema: Option<&str>) -> Result<Vec<TableRef>> {
        let pool = self.pool().await?;
        let schema = schema.unwrap_or("public");
        let rows = sqlx::query(
            "SELECT ccu.table_schema, ccu.table_name \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.constraint_column_usage ccu ON tc.constraint_name = ccu.constraint_name \
             WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = $1 AND tc.table_name = $2",
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&pool)
        .await
        .map_err(|e| GatewayError::Query(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|r| TableRef {
                schema: r.try_get::<String, _>(0).ok(),
                name: r.try_get::<String, _>(1).unwrap_or_default(),
            })
            .collect())
    }

    async fn get_table_keys(&self, table: &str, schema: Option<&str>) -> Result<Vec<String>> {
        let pool = self.pool().await?;
        let schema = schema.unwrap_or("public");
        let rows = sqlx::query(
            "SELECT kcu.column_name \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu ON tc.constraint_name = kcu.constraint_name \
             WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema = $1 AND tc.table_name = $2 \
             ORDER BY kcu.ordinal_position",
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&pool)
        .await
        .map_err(|e| GatewayError::Query(e.to_string()))?;
        Ok(rows.iter().filter_map(|r| r.try_get::<String, _>(0).ok()).collect())
    }

    async fn get_table_create_script(&self, table: &str, schema: Option<&str>) -> Result<String> {
        // Reconstructed from catalog metadata rather than a native
        // `SHOW CREATE TABLE` (postgres has none); a minimal column-list
        // rebuild, matching what Redshift also falls back to.
        let columns = self.list_table_columns(table, schema).await?;
        let qualified = self.qualify(table, schema);
        let cols = columns
            .iter()
            .map(|c| format!("  {} {}", self.wrap_identifier(&c.name), c.data_type))
            .collect::<Vec<_>>()
            .join(",\n");
        Ok(format!("CREATE TABLE {qualified} (\n{cols}\n);"))
    }

    async fn get_view_create_script(&self, view: &str, schema: Option<&str>) -> Result<String> {
        let pool = self.pool().await?;
        let schema = schema.unwrap_or("public");
        let row = sqlx::query(
            "SELECT view_definition FROM information_schema.views WHERE table_schema = $1 AND table_name = $2",
        )
        .bind(schema)
        .bind(view)
        .fetch_optional(&pool)
        .await
        .map_err(|e| GatewayError::Query(e.to_string()))?;

        let definition: String = row
            .and_then(|r| r.try_get::<String, _>(0).ok())
            .ok_or_else(|| GatewayError::NotSupported("getViewCreateScript".into()))?;
        let qualified = self.qualify(view, Some(schema));
        Ok(format!("CREATE VIEW {qualified} AS\n{definition}"))
    }

    async fn get_routine_create_script(&self, name: &str, routine_type: &str) -> Result<String> {
        let pool = self.pool().await?;
        let kind = if routine_type.eq_ignore_ascii_case("procedure") {
            "PROCEDURE"
        } else {
            "FUNCTION"
        };
        let row = sqlx::query(
            "SELECT routine_definition FROM information_schema.routines WHERE routine_name = $1 AND routine_type = $2",
        )
        .bind(name)
        .bind(kind)
        .fetch_optional(&pool)
        .await
        .map_err(|e| GatewayError::Query(e.to_string()))?;

        row.and_then(|r| r.try_get::<String, _>(0).ok())
            .ok_or_else(|| GatewayError::NotSupported("getRoutineCreateScript".into()))
    }

    async fn execute_query(&self, text: &str, cancel: CancelWaiter) -> Result<Vec<NormalizedResult>> {
        let pool = self.pool().await?;
        let statements = identify_statements(text);
        let mut results = Vec::with_capacity(statements.len());

        let pid = *self.backend_pid.read().await;
        // The cancellation token targets whatever is currently executing
        // on this connection's backend pid; it can only meaningfully race
        // the statement in flight when it fires, so it's consumed by the
        // first statement of the batch and has no effect on later ones.
        let mut cancel = Some(cancel);

        for (idx, stmt) in statements.iter().enumerate() {
            let is_select = matches!(stmt.kind, StatementType::Select | StatementType::Explain);

            let outcome = if is_select {
                if let Some(waiter) = cancel.take() {
                    tokio::select! {
                        biased;
                        _ = waiter.wait() => {
                            cancel_backend(&pool, pid).await;
                            Err(GatewayError::Canceled)
                        }
                        r = sqlx::query(&stmt.text).fetch_all(&pool) => {
                            r.map_err(|e| GatewayError::Query(format!("statement {idx}: {e}")))
                                .map(|rows| rows_to_result(&rows, stmt.kind))
                        }
                    }
                } else {
                    sqlx::query(&stmt.text)
                        .fetch_all(&pool)
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

            match outcome {
                Ok(r) => results.push(r),
                Err(e) => {
                    tracing::warn!(statement = idx, error = %e, "postgres statement failed");
                    return Err(e);
                }
            }
        }

        Ok(results)
    }

    async fn truncate_all_tables(&self) -> Result<()> {
        let pool = self.pool().await?;
        let tables = self.list_tables(None).await?;
        for t in tables {
            let qualified = self.qualify(&t.name, t.schema.as_deref());
            sqlx::query(&format!("TRUNCATE TABLE {qualified} CASCADE"))
                .execute(&pool)
                .await
                .map_err(|e| GatewayError::Query(e.to_string()))?;
        }
        Ok(())
    }

    fn wrap_identifier(&self, name: &str) -> String {
        wrap_identifier_with(name, '"')
    }
}

async fn cancel_backend(pool: &PgPool, pid: Option<i32>) {
    if let Some(pid) = pid {
        let _ = sqlx::query("SELECT pg_cancel_backend($1)")
            .bind(pid)
            .execute(pool)
            .await;
    }
}

fn rows_to_result(rows: &[PgRow], kind: StatementType) -> NormalizedResult {
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

    let command = if matches!(kind, StatementType::Unknown) {
        "SELECT".to_string()
    } else {
        kind.as_command().to_string()
    };

    NormalizedResult {
        command,
        row_count: Some(rows.len() as u64),
        rows: out_rows,
        fields,
        affected_rows: None,
    }
}

/// Decode one cell: try text decoding first (postgres can cast most
/// scalar types to text), then fall back to a type-name dispatch for the
/// handful of types that don't roundtrip through `TEXT`.
fn extract_cell_value(row: &PgRow, index: usize, type_name: &str) -> Value {
    match row.try_get_raw(index) {
        Ok(raw) if raw.is_null() => Value::Null,
        Ok(_) => decode_cell_value(row, index, type_name),
        Err(_) => Value::Null,
    }
}

fn decode_cell_value(row: &PgRow, index: usize, type_name: &str) -> Value {
    if let Ok(v) = row.try_get::<String, _>(index) {
        return Value::String(v);
    }

    match type_name {
        "BOOL" => row
            .try_get::<bool, _>(index)
            .map(Value::Bool)
            .unwrap_or(Value::Null),
        "INT2" | "INT4" => row
            .try_get::<i32, _>(index)
            .map(|v| Value::Number(v.into()))
            .unwrap_or(Value::Null),
        "INT8" => row
            .try_get::<i64, _>(index)
            .map(|v| Value::Number(v.into()))
            .unwrap_or(Value::Null),
        "FLOAT4" => row
            .try_get::<f32, _>(index)
            .ok()
            .and_then(|v| serde_json::Number::from_f64(v as f64))
            .map(Value::Number)
            .unwrap_or(Value::Null),
        "FLOAT8" => row
            .try_get::<f64, _>(index)
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        "NUMERIC" => row
            .try_get::<rust_decimal::Decimal, _>(index)
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),
        // DATE/TIMESTAMP/TIMESTAMPTZ (OIDs 1082/1114/1184): surfaced as
        // their original textual form rather than a typed value.
        "DATE" => row
            .try_get::<chrono::NaiveDate, _>(index)
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),
        "TIMESTAMP" => row
            .try_get::<chrono::NaiveDateTime, _>(index)
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),
        "TIMESTAMPTZ" => row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(index)
            .map(|v| Value::String(v.to_rfc3339()))
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_uses_double_quotes() {
        let a = PostgresAdapter::new(false);
        assert_eq!(a.wrap_identifier("users"), "\"users\"");
    }

    #[test]
    fn select_top_uses_limit() {
        let a = PostgresAdapter::new(false);
        assert_eq!(
            a.get_query_select_top("users", Some("public"), 1000),
            "SELECT * FROM \"public\".\"users\" LIMIT 1000"
        );
    }
}
