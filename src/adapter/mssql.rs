//! Microsoft SQL Server adapter built on `tiberius`, following the
//! `Config` + `TcpStream::compat_write()` connection pattern used for
//! SQL Server client connections elsewhere in the ecosystem.
//!
//! No pool: tiberius's client owns one TCP connection; concurrent use is
//! serialized behind a `tokio::sync::Mutex`, matching the spec's "request-
//! level cancel" model (one in-flight request per client at a time).

use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::{Map, Value};
use tiberius::{AuthMethod, Client, Config, Query};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use crate::error::{GatewayError, Result};
use crate::statement::{identify_statements, StatementType};

use super::{
    wrap_identifier_brackets, CancelWaiter, ColumnInfo, ConnectParams, DialectAdapter, FieldInfo,
    NormalizedResult, TableRef, VersionInfo,
};

type TiberiusClient = Client<Compat<TcpStream>>;

pub struct MssqlAdapter {
    client: Mutex<Option<TiberiusClient>>,
}

impl MssqlAdapter {
    pub fn new() -> Self {
        Self { client: Mutex::new(None) }
    }
}

#[async_trait]
impl DialectAdapter for MssqlAdapter {
    fn dialect_key(&self) -> &'static str {
        "sqlserver"
    }

    async fn connect(&mut self, params: ConnectParams) -> Result<VersionInfo> {
        let mut config = Config::new();
        config.host(&params.host);
        config.port(params.port);
        if let Some(db) = &params.database {
            config.database(db);
        }
        config.authentication(AuthMethod::sql_server(
            params.user.as_deref().unwrap_or_default(),
            params.password.as_deref().unwrap_or_default(),
        ));
        if !params.ssl {
            config.trust_cert();
        }

        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| GatewayError::Connect(e.to_string()))?;
        tcp.set_nodelay(true).ok();

        let mut client = Client::connect(config, tcp.compat_write())
            .await
            .map_err(|e| GatewayError::Connect(e.to_string()))?;

        let stream = client
            .simple_query("SELECT @@VERSION")
            .await
            .map_err(|e| GatewayError::Connect(e.to_string()))?;
        let row = stream
            .into_row()
            .await
            .map_err(|e| GatewayError::Connect(e.to_string()))?
            .ok_or_else(|| GatewayError::Connect("empty version probe".into()))?;
        let version_string: String = row.get::<&str, _>(0).unwrap_or("").to_string();

        *self.client.lock().await = Some(client);

        Ok(VersionInfo {
            name: "sqlserver".into(),
            version: version_string
                .split_whitespace()
                .nth(3)
                .unwrap_or("0")
                .trim_end_matches(|c: char| !c.is_ascii_digit() && c != '.')
                .to_string(),
            string: version_string,
        })
    }

    async fn disconnect(&mut self) -> Result<()> {
        *self.client.lock().await = None;
        Ok(())
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(|| GatewayError::Connect("not connected".into()))?;
        let mut stream = client
            .simple_query("SELECT name FROM sys.databases ORDER BY name")
            .await
            .map_err(|e| GatewayError::Query(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(row) = stream.try_next().await.map_err(|e| GatewayError::Query(e.to_string()))? {
            if let tiberius::QueryItem::Row(r) = row {
                if let Some(name) = r.get::<&str, _>(0) {
                    out.push(name.to_string());
                }
            }
        }
        Ok(out)
    }

    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<TableRef>> {
        let schema = schema.unwrap_or("dbo");
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(|| GatewayError::Connect("not connected".into()))?;

        let mut q = Query::new(
            "SELECT table_schema, table_name FROM information_schema.tables WHERE table_schema = @P1 AND table_type = 'BASE TABLE' ORDER BY table_name",
        );
        q.bind(schema);
        let mut stream = q.query(client).await.map_err(|e| GatewayError::Query(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(item) = stream.try_next().await.map_err(|e| GatewayError::Query(e.to_string()))? {
            if let tiberius::QueryItem::Row(r) = item {
                out.push(TableRef {
                    schema: r.get::<&str, _>(0).map(|s| s.to_string()),
                    name: r.get::<&str, _>(1).unwrap_or_default().to_string(),
                });
            }
        }
        Ok(out)
    }

    async fn list_table_columns(&self, table: &str, schema: Option<&str>) -> Result<Vec<ColumnInfo>> {
        let schema = schema.unwrap_or("dbo");
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(|| GatewayError::Connect("not connected".into()))?;

        let mut q = Query::new(
            "SELECT column_name, data_type, is_nullable FROM information_schema.columns WHERE table_schema = @P1 AND table_name = @P2 ORDER BY ordinal_position",
        );
        q.bind(schema);
        q.bind(table);
        let mut stream = q.query(client).await.map_err(|e| GatewayError::Query(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(item) = stream.try_next().await.map_err(|e| GatewayError::Query(e.to_string()))? {
            if let tiberius::QueryItem::Row(r) = item {
                out.push(ColumnInfo {
                    table: table.to_string(),
                    schema: Some(schema.to_string()),
                    name: r.get::<&str, _>(0).unwrap_or_default().to_string(),
                    data_type: r.get::<&str, _>(1).unwrap_or_default().to_string(),
                    nullable: r.get::<&str, _>(2).map(|v| v == "YES").unwrap_or(true),
                });
            }
        }
        Ok(out)
    }

    async fn list_views(&self, schema: Option<&str>) -> Result<Vec<TableRef>> {
        let schema = schema.unwrap_or("dbo");
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(|| GatewayError::Connect("not connected".into()))?;

        let mut q = Query::new(
            "SELECT table_schema, table_name FROM information_schema.views WHERE table_schema = @P1 ORDER BY table_name",
        );
        q.bind(schema);
        let mut stream = q.query(client).await.map_err(|e| GatewayError::Query(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(item) = stream.try_next().await.map_err(|e| GatewayError::Query(e.to_string()))? {
            if let tiberius::QueryItem::Row(r) = item {
                out.push(TableRef {
                    schema: r.get::<&str, _>(0).map(|s| s.to_string()),
                    name: r.get::<&str, _>(1).unwrap_or_default().to_string(),
                });
            }
        }
        Ok(out)
    }

    /// SQL Server surfaces these via `sp_helptrigger`/`sp_helpindex`, but
    /// `sys.triggers`/`sys.indexes` give the same data through an ordinary
    /// query rather than a stored-procedure result set.
    async fn list_table_triggers(&self, table: &str, schema: Option<&str>) -> Result<Vec<String>> {
        let schema = schema.unwrap_or("dbo");
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(|| GatewayError::Connect("not connected".into()))?;

        let mut q = Query::new(
            "SELECT tr.name FROM sys.triggers tr \
             JOIN sys.tables t ON tr.parent_id = t.object_id \
             JOIN sys.schemas s ON t.schema_id = s.schema_id \
             WHERE s.name = @P1 AND t.name = @P2 ORDER BY tr.name",
        );
        q.bind(schema);
        q.bind(table);
        let mut stream = q.query(client).await.map_err(|e| GatewayError::Query(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(item) = stream.try_next().await.map_err(|e| GatewayError::Query(e.to_string()))? {
            if let tiberius::QueryItem::Row(r) = item {
                if let Some(name) = r.get::<&str, _>(0) {
                    out.push(name.to_string());
                }
            }
        }
        Ok(out)
    }

    async fn list_table_indexes(&self, table: &str, schema: Option<&str>) -> Result<Vec<String>> {
        let schema = schema.unwrap_or("dbo");
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(|| GatewayError::Connect("not connected".into()))?;

        let mut q = Query::new(
            "SELECT i.name FROM sys.indexes i \
             JOIN sys.tables t ON i.object_id = t.object_id \
             JOIN sys.schemas s ON t.schema_id = s.schema_id \
             WHERE s.name = @P1 AND t.name = @P2 AND i.name IS NOT NULL ORDER BY i.name",
        );
        q.bind(schema);
        q.bind(table);
        let mut stream = q.query(client).await.map_err(|e| GatewayError::Query(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(item) = stream.try_next().await.map_err(|e| GatewayError::Query(e.to_string()))? {
            if let tiberius::QueryItem::Row(r) = item {
                if let Some(name) = r.get::<&str, _>(0) {
                    out.push(name.to_string());
                }
            }
        }
        Ok(out)
    }

    async fn list_routines(&self, schema: Option<&str>) -> Result<Vec<String>> {
        let schema = schema.unwrap_or("dbo");
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(|| GatewayError::Connect("not connected".into()))?;

        let mut q = Query::new(
            "SELECT routine_name FROM information_schema.routines WHERE routine_schema = @P1 AND routine_type = 'PROCEDURE' ORDER BY routine_name",
        );
        q.bind(schema);
        let mut stream = q.query(client).await.map_err(|e| GatewayError::Query(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(item) = stream.try_next().await.map_err(|e| GatewayError::Query(e.to_string()))? {
            if let tiberius::QueryItem::Row(r) = item {
                if let Some(name) = r.get::<&str, _>(0) {
                    out.push(name.to_string());
                }
            }
        }
        Ok(out)
    }

    async fn get_table_create_script(&self, table: &str, schema: Option<&str>) -> Result<String> {
        // No native `SHOW CREATE TABLE`; reconstruct from the same
        // introspection used for `listTableColumns`.
        let columns = self.list_table_columns(table, schema).await?;
        let qualified = self.qualify(table, schema);
        let cols = columns
            .iter()
            .map(|c| format!("  {} {}", self.wrap_identifier(&c.name), c.data_type))
            .collect::<Vec<_>>()
            .join(",\n");
        Ok(format!("CREATE TABLE {qualified} (\n{cols}\n);"))
    }

    async fn truncate_all_tables(&self) -> Result<()> {
        let tables = self.list_tables(None).await?;
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(|| GatewayError::Connect("not connected".into()))?;
        for t in tables {
            let qualified = self.qualify(&t.name, t.schema.as_deref());
            client
                .execute(format!("TRUNCATE TABLE {qualified}").as_str(), &[])
                .await
                .map_err(|e| GatewayError::Query(e.to_string()))?;
        }
        Ok(())
    }

    fn get_query_select_top(&self, table: &str, schema: Option<&str>, limit: u64) -> String {
        let qualified = self.qualify(table, schema);
        format!("SELECT TOP {limit} * FROM {qualified}")
    }

    /// SQL Server collapses multiple non-SELECT statements executed in
    /// one batch into a single result (§4.5); every SELECT still yields
    /// its own result.
    async fn execute_query(&self, text: &str, cancel: CancelWaiter) -> Result<Vec<NormalizedResult>> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(|| GatewayError::Connect("not connected".into()))?;
        let statements = identify_statements(text);

        let mut results = Vec::new();
        let mut pending_affected: Option<u64> = None;
        let mut cancel = Some(cancel);

        for (idx, stmt) in statements.iter().enumerate() {
            let is_select = matches!(stmt.kind, StatementType::Select | StatementType::Explain);

            if is_select {
                if let Some(pending) = pending_affected.take() {
                    let mut nr = NormalizedResult::empty_for(StatementType::Unknown);
                    nr.command = "BATCH".into();
                    nr.affected_rows = Some(pending);
                    results.push(nr);
                }

                let run = client.simple_query(&stmt.text);
                let stream = if let Some(waiter) = cancel.take() {
                    tokio::select! {
                        biased;
                        _ = waiter.wait() => return Err(GatewayError::Canceled),
                        r = run => r,
                    }
                } else {
                    run.await
                }
                .map_err(|e| GatewayError::Query(format!("statement {idx}: {e}")))?;

                results.push(consume_select(stream, stmt.kind).await?);
            } else {
                let result = client
                    .execute(stmt.text.as_str(), &[])
                    .await
                    .map_err(|e| GatewayError::Query(format!("statement {idx}: {e}")))?;
                let affected: u64 = result.rows_affected().iter().sum();
                pending_affected = Some(pending_affected.unwrap_or(0) + affected);
            }
        }

        if let Some(pending) = pending_affected {
            let mut nr = NormalizedResult::empty_for(StatementType::Unknown);
            nr.command = "BATCH".into();
            nr.affected_rows = Some(pending);
            results.push(nr);
        }

        Ok(results)
    }

    fn wrap_identifier(&self, name: &str) -> String {
        wrap_identifier_brackets(name)
    }
}

async fn consume_select(
    mut stream: tiberius::QueryStream<'_>,
    kind: StatementType,
) -> Result<NormalizedResult> {
    let mut fields: Vec<FieldInfo> = Vec::new();
    let mut rows = Vec::new();

    while let Some(item) = stream.try_next().await.map_err(|e| GatewayError::Query(e.to_string()))? {
        match item {
            tiberius::QueryItem::Metadata(meta) => {
                fields = meta.columns().iter().map(|c| FieldInfo { name: c.name().to_string() }).collect();
            }
            tiberius::QueryItem::Row(row) => {
                let mut map = Map::new();
                for (i, col) in row.columns().iter().enumerate() {
                    map.insert(col.name().to_string(), column_to_json(&row, i));
                }
                rows.push(map);
            }
        }
    }

    let command = if matches!(kind, StatementType::Unknown) { "SELECT".to_string() } else { kind.as_command().to_string() };
    Ok(NormalizedResult {
        command,
        row_count: Some(rows.len() as u64),
        rows,
        fields,
        affected_rows: None,
    })
}

fn column_to_json(row: &tiberius::Row, index: usize) -> Value {
    // DATE/DATETIME types are left as their driver-native representation
    // rather than coerced to text (per the dialect variance table).
    if let Some(v) = row.get::<&str, _>(index) {
        return Value::String(v.to_string());
    }
    if let Some(v) = row.get::<i32, _>(index) {
        return Value::Number(v.into());
    }
    if let Some(v) = row.get::<i64, _>(index) {
        return Value::Number(v.into());
    }
    if let Some(v) = row.get::<f64, _>(index) {
        return serde_json::Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null);
    }
    if let Some(v) = row.get::<bool, _>(index) {
        return Value::Bool(v);
    }
    Value::Null
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_uses_brackets() {
        let a = MssqlAdapter::new();
        assert_eq!(a.wrap_identifier("users"), "[users]");
    }

    #[test]
    fn select_top_not_limit() {
        let a = MssqlAdapter::new();
        assert_eq!(
            a.get_query_select_top("users", Some("public"), 1000),
            "SELECT TOP 1000 * FROM [public].[users]"
        );
    }

    #[test]
    fn select_script_brackets_every_column() {
        let a = MssqlAdapter::new();
        let columns = [
            "id", "username", "email", "password", "role_id", "createdat",
        ]
        .map(String::from);
        assert_eq!(
            a.get_table_select_script("users", Some("public"), &columns),
            "SELECT [id], [username], [email], [password], [role_id], [createdat] FROM [public].[users];"
        );
    }
}
