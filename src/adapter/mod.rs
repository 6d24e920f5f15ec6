//! The uniform adapter contract every dialect satisfies (§4.5), and the
//! shared result/cancellation types that flow through it.

pub mod cassandra;
pub mod mssql;
pub mod mysql;
pub mod postgres;
pub mod registry;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::statement::StatementType;

/// `{name, version, string}` populated by `connect`'s liveness probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub name: String,
    pub version: String,
    pub string: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
}

/// The dialect-independent result shape (§3) for one statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedResult {
    pub command: String,
    pub rows: Vec<serde_json::Map<String, Value>>,
    pub fields: Vec<FieldInfo>,
    pub row_count: Option<u64>,
    pub affected_rows: Option<u64>,
}

impl NormalizedResult {
    /// Build the result for a statement whose identified type is known and
    /// which produced no rows — synthesizes the "one result per statement"
    /// empty result (§4.5).
    pub fn empty_for(kind: StatementType) -> Self {
        let command = kind.as_command().to_string();
        let is_select = matches!(kind, StatementType::Select | StatementType::Explain);
        NormalizedResult {
            command,
            rows: Vec::new(),
            fields: Vec::new(),
            row_count: if is_select { Some(0) } else { None },
            affected_rows: if is_select { None } else { Some(0) },
        }
    }
}

/// A description of a table/view reference returned by `list_tables` etc.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableRef {
    pub schema: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub table: String,
    pub schema: Option<String>,
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

/// Writable side of a query's cancellation token: held by the query
/// handle, fired by the caller's `cancel()`.
#[derive(Debug)]
pub struct CancelToken {
    tx: Option<tokio::sync::oneshot::Sender<()>>,
}

/// Readable side, polled by the adapter while a statement executes.
#[derive(Debug)]
pub struct CancelWaiter {
    rx: tokio::sync::oneshot::Receiver<()>,
}

pub fn cancel_pair() -> (CancelToken, CancelWaiter) {
    let (tx, rx) = tokio::sync::oneshot::channel();
    (CancelToken { tx: Some(tx) }, CancelWaiter { rx })
}

impl CancelToken {
    /// Fire the cancellation. Legal only once; a second call is a no-op.
    pub fn cancel(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl CancelWaiter {
    pub async fn wait(self) {
        let _ = self.rx.await;
    }
}

/// Connection parameters an adapter resolves to a concrete endpoint,
/// after any SSH tunnel rewrite has been applied by the Session.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub ssl: bool,
}

/// `query(text) → Handle`'s outcome state machine (§3): a handle starts
/// `Pending`, moves to `Running` once `wait()` registers the
/// cancellation token with the adapter, and settles in exactly one of
/// the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    Pending,
    Running,
    Done,
    Canceled,
    Failed,
}

struct QueryHandleState {
    outcome: QueryOutcome,
    token: Option<CancelToken>,
    waiter: Option<CancelWaiter>,
}

/// A query in flight against a particular adapter. Created synchronously
/// by `query()`; the network call doesn't start until `wait()` is
/// awaited, so a caller can hold the handle, spawn/await `wait()`, and
/// call `cancel()` from another branch of the same `tokio::select!`/
/// `join!` without needing to clone the adapter.
pub struct QueryHandle<'a> {
    adapter: &'a (dyn DialectAdapter + 'a),
    text: String,
    state: std::sync::Mutex<QueryHandleState>,
}

impl<'a> QueryHandle<'a> {
    fn new(adapter: &'a (dyn DialectAdapter + 'a), text: String) -> Self {
        let (token, waiter) = cancel_pair();
        Self {
            adapter,
            text,
            state: std::sync::Mutex::new(QueryHandleState {
                outcome: QueryOutcome::Pending,
                token: Some(token),
                waiter: Some(waiter),
            }),
        }
    }

    pub fn outcome(&self) -> QueryOutcome {
        self.state.lock().unwrap().outcome
    }

    /// Cancels the in-flight query. Legal only once the query has
    /// reached `Running`; calling before `wait()` has registered the
    /// token yields `QueryNotReady`.
    pub fn cancel(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.outcome != QueryOutcome::Running {
            return Err(crate::error::GatewayError::QueryNotReady);
        }
        if let Some(mut token) = state.token.take() {
            token.cancel();
        }
        Ok(())
    }

    /// Runs the query to completion, transitioning `Pending` → `Running`
    /// → one of `{Done, Canceled, Failed}`.
    pub async fn wait(&self) -> Result<Vec<NormalizedResult>> {
        let waiter = {
            let mut state = self.state.lock().unwrap();
            state.outcome = QueryOutcome::Running;
            state.waiter.take().expect("QueryHandle::wait called twice")
        };

        let result = self.adapter.execute_query(&self.text, waiter).await;

        let mut state = self.state.lock().unwrap();
        state.outcome = match &result {
            Ok(_) => QueryOutcome::Done,
            Err(e) if e.is_canceled_by_user() => QueryOutcome::Canceled,
            Err(_) => QueryOutcome::Failed,
        };
        result
    }
}

/// The uniform capability contract every dialect adapter implements.
///
/// Methods not meaningful for a dialect default to `NotSupported` (a
/// single object) or an empty `Vec` (a list) rather than being omitted,
/// so callers get one error taxonomy and one "no such thing" shape
/// regardless of which adapter they're driving.
#[async_trait]
pub trait DialectAdapter: Send + Sync {
    fn dialect_key(&self) -> &'static str;

    async fn connect(&mut self, params: ConnectParams) -> Result<VersionInfo>;
    async fn disconnect(&mut self) -> Result<()>;

    async fn list_databases(&self) -> Result<Vec<String>>;
    async fn list_schemas(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<TableRef>>;
    async fn list_views(&self, schema: Option<&str>) -> Result<Vec<TableRef>> {
        let _ = schema;
        Ok(Vec::new())
    }
    async fn list_routines(&self, schema: Option<&str>) -> Result<Vec<String>> {
        let _ = schema;
        Ok(Vec::new())
    }
    async fn list_table_columns(&self, table: &str, schema: Option<&str>) -> Result<Vec<ColumnInfo>>;
    async fn list_table_triggers(&self, table: &str, schema: Option<&str>) -> Result<Vec<String>> {
        let _ = (table, schema);
        Ok(Vec::new())
    }
    async fn list_table_indexes(&self, table: &str, schema: Option<&str>) -> Result<Vec<String>> {
        let _ = (table, schema);
        Ok(Vec::new())
    }

    /// Other tables this table's foreign keys point at.
    async fn get_table_references(&self, table: &str, schema: Option<&str>) -> Result<Vec<TableRef>> {
        let _ = (table, schema);
        Ok(Vec::new())
    }

    /// Primary key column names, in key order.
    async fn get_table_keys(&self, table: &str, schema: Option<&str>) -> Result<Vec<String>> {
        let _ = (table, schema);
        Ok(Vec::new())
    }

    async fn get_table_create_script(&self, table: &str, schema: Option<&str>) -> Result<String>;

    async fn get_view_create_script(&self, view: &str, schema: Option<&str>) -> Result<String> {
        let _ = (view, schema);
        Err(crate::error::GatewayError::NotSupported("getViewCreateScript".into()))
    }

    async fn get_routine_create_script(&self, name: &str, routine_type: &str) -> Result<String> {
        let _ = (name, routine_type);
        Err(crate::error::GatewayError::NotSupported("getRoutineCreateScript".into()))
    }

    /// Builds a dialect-correct "select first N rows" string.
    fn get_query_select_top(&self, table: &str, schema: Option<&str>, limit: u64) -> String {
        let ident = self.wrap_identifier(table);
        let qualified = match schema {
            Some(s) => format!("{}.{}", self.wrap_identifier(s), ident),
            None => ident,
        };
        format!("SELECT * FROM {qualified} LIMIT {limit}")
    }

    fn get_table_select_script(&self, table: &str, schema: Option<&str>, columns: &[String]) -> String {
        let cols = if columns.is_empty() {
            "*".to_string()
        } else {
            columns
                .iter()
                .map(|c| self.wrap_identifier(c))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let qualified = self.qualify(table, schema);
        format!("SELECT {cols} FROM {qualified};")
    }

    /// Templated `INSERT` with one `?` bind-parameter marker per column.
    fn get_table_insert_script(&self, table: &str, schema: Option<&str>, columns: &[String]) -> String {
        let qualified = self.qualify(table, schema);
        let cols = columns.iter().map(|c| self.wrap_identifier(c)).collect::<Vec<_>>().join(", ");
        let placeholders = columns.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        format!("INSERT INTO {qualified} ({cols}) VALUES ({placeholders});")
    }

    /// Templated `UPDATE` with `?` markers and a `<condition>` WHERE
    /// placeholder for the caller to fill in.
    fn get_table_update_script(&self, table: &str, schema: Option<&str>, columns: &[String]) -> String {
        let qualified = self.qualify(table, schema);
        let assignments = columns
            .iter()
            .map(|c| format!("{} = ?", self.wrap_identifier(c)))
            .collect::<Vec<_>>()
            .join(", ");
        format!("UPDATE {qualified} SET {assignments} WHERE <condition>;")
    }

    /// Templated `DELETE` with a `<condition>` WHERE placeholder.
    fn get_table_delete_script(&self, table: &str, schema: Option<&str>) -> String {
        let qualified = self.qualify(table, schema);
        format!("DELETE FROM {qualified} WHERE <condition>;")
    }

    /// Executes the full text, returning one `NormalizedResult` per
    /// identified statement (modulo dialect batching exceptions).
    async fn execute_query(&self, text: &str, cancel: CancelWaiter) -> Result<Vec<NormalizedResult>>;

    /// Creates a query handle without starting execution; the network
    /// call begins inside `handle.wait()`.
    fn query<'a>(&'a self, text: &str) -> QueryHandle<'a> {
        QueryHandle::new(self, text.to_string())
    }

    async fn truncate_all_tables(&self) -> Result<()> {
        Err(crate::error::GatewayError::NotSupported(
            "truncateAllTables".into(),
        ))
    }

    /// Default identifier quoting: double quotes, embedded quotes doubled,
    /// `*` passed through, trailing `[n]` array suffix left unquoted.
    /// Dialects override the quote character as needed.
    fn wrap_identifier(&self, name: &str) -> String {
        wrap_identifier_with(name, '"')
    }

    fn qualify(&self, table: &str, schema: Option<&str>) -> String {
        match schema {
            Some(s) => format!("{}.{}", self.wrap_identifier(s), self.wrap_identifier(table)),
            None => self.wrap_identifier(table),
        }
    }
}

/// Shared implementation of `wrapIdentifier` parameterized by the
/// dialect's quote character (`"` / backtick / `[``]`-pair handled by
/// callers that need bracket quoting separately).
pub fn wrap_identifier_with(name: &str, quote: char) -> String {
    if name == "*" {
        return name.to_string();
    }

    // preserve a trailing array suffix like `tags[1]` unquoted
    if let Some(bracket_pos) = name.find('[') {
        if name.ends_with(']') {
            let (base, suffix) = name.split_at(bracket_pos);
            return format!("{}{}", wrap_identifier_with(base, quote), suffix);
        }
    }

    let doubled: String = name.chars().flat_map(|c| {
        if c == quote {
            vec![c, c]
        } else {
            vec![c]
        }
    }).collect();

    format!("{quote}{doubled}{quote}")
}

/// Square-bracket quoting for SQL Server: `[name]`, embedded `]` doubled.
pub fn wrap_identifier_brackets(name: &str) -> String {
    if name == "*" {
        return name.to_string();
    }
    if let Some(bracket_pos) = name.find('[') {
        if name.ends_with(']') {
            let (base, suffix) = name.split_at(bracket_pos);
            return format!("{}{}", wrap_identifier_brackets(base), suffix);
        }
    }
    let doubled = name.replace(']', "]]");
    format!("[{doubled}]")
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Exercises only the trait's default methods: no dialect actually
    /// overrides anything here.
    struct StubAdapter;

    #[async_trait]
    impl DialectAdapter for StubAdapter {
        fn dialect_key(&self) -> &'static str {
            "stub"
        }
        async fn connect(&mut self, _params: ConnectParams) -> Result<VersionInfo> {
            unreachable!()
        }
        async fn disconnect(&mut self) -> Result<()> {
            Ok(())
        }
        async fn list_databases(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn list_tables(&self, _schema: Option<&str>) -> Result<Vec<TableRef>> {
            Ok(Vec::new())
        }
        async fn list_table_columns(&self, _table: &str, _schema: Option<&str>) -> Result<Vec<ColumnInfo>> {
            Ok(Vec::new())
        }
        async fn get_table_create_script(&self, _table: &str, _schema: Option<&str>) -> Result<String> {
            Ok(String::new())
        }
        async fn execute_query(&self, _text: &str, _cancel: CancelWaiter) -> Result<Vec<NormalizedResult>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn missing_operations_default_to_empty_list_or_not_supported() {
        // Regression: these used to be entirely absent from the trait.
        let a = StubAdapter;
        assert!(futures::executor::block_on(a.list_views(None)).unwrap().is_empty());
        assert!(futures::executor::block_on(a.list_routines(None)).unwrap().is_empty());
        assert!(futures::executor::block_on(a.list_table_triggers("t", None)).unwrap().is_empty());
        assert!(futures::executor::block_on(a.list_table_indexes("t", None)).unwrap().is_empty());
        assert!(futures::executor::block_on(a.get_table_references("t", None)).unwrap().is_empty());
        assert!(futures::executor::block_on(a.get_table_keys("t", None)).unwrap().is_empty());
        assert!(futures::executor::block_on(a.get_view_create_script("v", None)).is_err());
        assert!(futures::executor::block_on(a.get_routine_create_script("r", "FUNCTION")).is_err());
    }

    #[test]
    fn templated_dml_scripts_use_wrap_identifier_and_placeholders() {
        let a = StubAdapter;
        let columns = ["id".to_string(), "name".to_string()];

        assert_eq!(
            a.get_table_insert_script("users", Some("public"), &columns),
            "INSERT INTO \"public\".\"users\" (\"id\", \"name\") VALUES (?, ?);"
        );
        assert_eq!(
            a.get_table_update_script("users", Some("public"), &columns),
            "UPDATE \"public\".\"users\" SET \"id\" = ?, \"name\" = ? WHERE <condition>;"
        );
        assert_eq!(
            a.get_table_delete_script("users", Some("public")),
            "DELETE FROM \"public\".\"users\" WHERE <condition>;"
        );
    }

    #[tokio::test]
    async fn query_handle_runs_on_wait_not_on_creation() {
        let a = StubAdapter;
        let handle = a.query("select 1");
        assert_eq!(handle.outcome(), QueryOutcome::Pending);

        // cancel() before wait() is illegal: the token hasn't been handed
        // to an in-flight statement yet.
        assert!(handle.cancel().is_err());

        handle.wait().await.unwrap();
        assert_eq!(handle.outcome(), QueryOutcome::Done);
    }

    #[tokio::test]
    async fn query_handle_cancel_after_running_resolves_canceled() {
        struct SlowAdapter;
        #[async_trait]
        impl DialectAdapter for SlowAdapter {
            fn dialect_key(&self) -> &'static str {
                "slow"
            }
            async fn connect(&mut self, _p: ConnectParams) -> Result<VersionInfo> {
                unreachable!()
            }
            async fn disconnect(&mut self) -> Result<()> {
                Ok(())
            }
            async fn list_databases(&self) -> Result<Vec<String>> {
                Ok(Vec::new())
            }
            async fn list_tables(&self, _schema: Option<&str>) -> Result<Vec<TableRef>> {
                Ok(Vec::new())
            }
            async fn list_table_columns(&self, _t: &str, _s: Option<&str>) -> Result<Vec<ColumnInfo>> {
                Ok(Vec::new())
            }
            async fn get_table_create_script(&self, _t: &str, _s: Option<&str>) -> Result<String> {
                Ok(String::new())
            }
            async fn execute_query(&self, _text: &str, cancel: CancelWaiter) -> Result<Vec<NormalizedResult>> {
                tokio::select! {
                    biased;
                    _ = cancel.wait() => Err(crate::error::GatewayError::Canceled),
                    _ = tokio::time::sleep(std::time::Duration::from_secs(10)) => Ok(Vec::new()),
                }
            }
        }

        let a = SlowAdapter;
        let handle = a.query("select pg_sleep(10)");

        // `wait()` and `cancel()` are driven from the same scope, exactly
        // how a caller would race a user-initiated cancel against a
        // slow statement without needing to clone/move the handle.
        let canceler = async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            // Not yet Running when this first races ahead of wait()'s
            // state flip is impossible here since wait() flips it before
            // its first await point; retry once if it somehow loses.
            if handle.cancel().is_err() {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                handle.cancel().unwrap();
            }
        };

        let start = std::time::Instant::now();
        let (result, _) = tokio::join!(handle.wait(), canceler);
        assert!(result.is_err());
        assert_eq!(handle.outcome(), QueryOutcome::Canceled);
        assert!(start.elapsed() < std::time::Duration::from_secs(1));
    }

    #[test]
    fn wrap_identifier_basic() {
        assert_eq!(wrap_identifier_with("users", '"'), "\"users\"");
        assert_eq!(wrap_identifier_with("users", '`'), "`users`");
    }

    #[test]
    fn wrap_identifier_star_passthrough() {
        assert_eq!(wrap_identifier_with("*", '"'), "*");
    }

    #[test]
    fn wrap_identifier_doubles_embedded_quote() {
        assert_eq!(wrap_identifier_with("a\"b", '"'), "\"a\"\"b\"");
    }

    #[test]
    fn wrap_identifier_preserves_array_suffix() {
        assert_eq!(wrap_identifier_with("tags[1]", '"'), "\"tags\"[1]");
    }

    #[test]
    fn wrap_identifier_brackets_basic() {
        assert_eq!(wrap_identifier_brackets("users"), "[users]");
        assert_eq!(wrap_identifier_brackets("a]b"), "[a]]b]");
    }

    /// `wrapIdentifier(wrapIdentifier(x)) == wrapIdentifier(x)` holds only
    /// where re-wrapping doesn't add another layer of quoting — the `*`
    /// passthrough is that case; a normal identifier is *not* idempotent
    /// since the second pass quotes the quote characters from the first.
    #[test]
    fn wrap_identifier_idempotent_only_for_star() {
        for quote in ['"', '`'] {
            let once = wrap_identifier_with("*", quote);
            let twice = wrap_identifier_with(&once, quote);
            assert_eq!(once, twice);

            let once = wrap_identifier_with("users", quote);
            let twice = wrap_identifier_with(&once, quote);
            assert_ne!(once, twice);
        }

        let once = wrap_identifier_brackets("*");
        assert_eq!(once, wrap_identifier_brackets(&once));
        let once = wrap_identifier_brackets("users");
        assert_ne!(once, wrap_identifier_brackets(&once));
    }

    /// Mirrors the shape every adapter's `execute_query` races a SELECT
    /// against: a long-running future loses to `cancel()` fired shortly
    /// after the statement starts, resolving well under a second.
    #[tokio::test]
    async fn cancel_wins_race_against_slow_statement() {
        let (mut token, waiter) = cancel_pair();

        let slow_statement = tokio::time::sleep(std::time::Duration::from_secs(10));
        let canceler = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            token.cancel();
        });

        let start = std::time::Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = waiter.wait() => Err(crate::error::GatewayError::Canceled),
            _ = slow_statement => Ok(()),
        };
        canceler.await.unwrap();

        assert!(outcome.is_err());
        assert!(outcome.unwrap_err().is_canceled_by_user());
        assert!(start.elapsed() < std::time::Duration::from_secs(1));
    }
}
