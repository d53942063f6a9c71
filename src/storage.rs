use std::time::Duration;

use diesel::query_builder::{BoxedSqlQuery, SqlQuery};
use diesel::sql_types::{BigInt, Bool, Double, Integer, Nullable, Text};
use diesel::sqlite::{Sqlite, SqliteConnection};
use diesel::{ConnectionError, ConnectionResult, QueryableByName};
use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::pooled_connection::{AsyncDieselConnectionManager, ManagerConfig};
use diesel_async::sync_connection_wrapper::SyncConnectionWrapper;
use diesel_async::scoped_futures::ScopedBoxFuture;
use diesel_async::{AsyncConnection, RunQueryDsl, SimpleAsyncConnection};
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::sql::{self, Statement};
use crate::value::{format_datetime, Value, DATE_FORMAT};

pub type SqliteConn = SyncConnectionWrapper<SqliteConnection>;
pub type SqlitePool = Pool<SqliteConn>;
pub type PooledConn = Object<SqliteConn>;

#[derive(QueryableByName, Debug)]
struct RecordRow {
    #[diesel(sql_type = Text)]
    record: String,
}

#[derive(QueryableByName, Debug)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    count: i64,
}

/// One row of `pragma_table_info` for an existing table.
#[derive(QueryableByName, Debug, Clone, PartialEq)]
pub struct ColumnInfoRow {
    #[diesel(sql_type = Text)]
    pub name: String,
    #[diesel(sql_type = Text)]
    pub declared_type: String,
    #[diesel(sql_type = Integer)]
    pub not_null: i32,
    #[diesel(sql_type = Integer)]
    pub pk: i32,
}

fn establish_connection(url: &str, busy_timeout_ms: u64) -> BoxFuture<'_, ConnectionResult<SqliteConn>> {
    async move {
        let mut conn = SqliteConn::establish(url).await?;
        conn.batch_execute(&format!(
            "PRAGMA busy_timeout = {}; PRAGMA foreign_keys = ON;",
            busy_timeout_ms
        ))
        .await
        .map_err(ConnectionError::CouldntSetupConfiguration)?;
        Ok(conn)
    }
    .boxed()
}

fn setup_callback<F>(callback: F) -> F
where
    F: Fn(&str) -> BoxFuture<'_, ConnectionResult<SqliteConn>> + Send + Sync + 'static,
{
    callback
}

pub fn build_pool(
    database_url: &str,
    max_size: usize,
    busy_timeout: Duration,
) -> Result<SqlitePool, EngineError> {
    let busy_timeout_ms = busy_timeout.as_millis() as u64;
    let mut manager_config = ManagerConfig::default();
    manager_config.custom_setup = Box::new(setup_callback(move |url| {
        establish_connection(url, busy_timeout_ms)
    }));

    let manager =
        AsyncDieselConnectionManager::<SqliteConn>::new_with_config(database_url, manager_config);
    Pool::builder(manager)
        .max_size(max_size)
        .build()
        .map_err(|e| EngineError::ConfigError {
            message: format!("Failed to create database pool: {}", e),
        })
}

fn bind_value(
    query: BoxedSqlQuery<'static, Sqlite, SqlQuery>,
    value: Value,
) -> BoxedSqlQuery<'static, Sqlite, SqlQuery> {
    match value {
        Value::Null => query.bind::<Nullable<Text>, _>(None::<String>),
        Value::Text(s) => query.bind::<Text, _>(s),
        Value::Integer(i) => query.bind::<BigInt, _>(i),
        Value::Float(f) => query.bind::<Double, _>(f),
        Value::Boolean(b) => query.bind::<Bool, _>(b),
        Value::Date(d) => query.bind::<Text, _>(d.format(DATE_FORMAT).to_string()),
        Value::Datetime(dt) => query.bind::<Text, _>(format_datetime(&dt)),
    }
}

fn into_query(statement: Statement) -> BoxedSqlQuery<'static, Sqlite, SqlQuery> {
    debug!(sql = %statement.sql, params = statement.params.len(), "Preparing statement");
    statement
        .params
        .into_iter()
        .fold(diesel::sql_query(statement.sql).into_boxed(), bind_value)
}

/// Executes statements against the shared pool. Checkout and each query are
/// bounded by the storage timeout; an elapsed timeout is reported as
/// [`EngineError::Unavailable`] and the outcome of the abandoned statement is
/// unknown.
#[derive(Clone)]
pub struct TableStore {
    pool: SqlitePool,
    timeout: Duration,
}

impl TableStore {
    pub(crate) fn new(pool: SqlitePool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    fn timed_out(&self, operation: &str) -> EngineError {
        warn!("Storage operation '{}' timed out after {:?}", operation, self.timeout);
        EngineError::Unavailable {
            message: format!("{} timed out after {:?}", operation, self.timeout),
        }
    }

    async fn checkout(&self, operation: &str) -> Result<PooledConn, EngineError> {
        match tokio::time::timeout(self.timeout, self.pool.get()).await {
            Ok(conn) => conn.map_err(|e| EngineError::Unavailable {
                message: format!("Failed to get database connection: {}", e),
            }),
            Err(_) => Err(self.timed_out(operation)),
        }
    }

    /// Runs `query` on a pooled connection under the storage timeout.
    ///
    /// A connection whose query timed out is detached from the pool: the
    /// abandoned statement keeps running on a blocking thread and still owns
    /// the underlying SQLite handle.
    pub(crate) async fn run<'a, T, F>(&self, operation: &str, query: F) -> Result<T, EngineError>
    where
        F: for<'c> FnOnce(&'c mut SqliteConn) -> ScopedBoxFuture<'a, 'c, Result<T, EngineError>>
            + Send
            + 'a,
        T: Send + 'a,
    {
        let mut conn = self.checkout(operation).await?;
        let outcome = tokio::time::timeout(self.timeout, query(&mut *conn)).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                drop(PooledConn::take(conn));
                Err(self.timed_out(operation))
            }
        }
    }

    pub(crate) async fn execute(&self, statement: Statement) -> Result<usize, EngineError> {
        self.run("execute", move |conn| {
            Box::pin(async move { Ok(into_query(statement).execute(conn).await?) })
        })
        .await
    }

    /// Fetches rows produced by a record projection, each flattened into
    /// `[id, column_0, column_1, ...]`.
    pub(crate) async fn fetch_records(
        &self,
        statement: Statement,
    ) -> Result<Vec<Vec<serde_json::Value>>, EngineError> {
        let rows = self
            .run("fetch", move |conn| {
                Box::pin(async move { Ok(into_query(statement).load::<RecordRow>(conn).await?) })
            })
            .await?;

        rows.into_iter().map(|row| flatten_record(&row.record)).collect()
    }

    pub(crate) async fn fetch_count(&self, statement: Statement) -> Result<i64, EngineError> {
        self.run("count", move |conn| {
            Box::pin(async move {
                let row = into_query(statement).get_result::<CountRow>(conn).await?;
                Ok(row.count)
            })
        })
        .await
    }

    pub(crate) async fn fetch_columns(
        &self,
        statement: Statement,
    ) -> Result<Vec<ColumnInfoRow>, EngineError> {
        self.run("table_info", move |conn| {
            Box::pin(async move { Ok(into_query(statement).load::<ColumnInfoRow>(conn).await?) })
        })
        .await
    }

    /// Runs all statements in one transaction and returns the affected rows.
    pub(crate) async fn execute_all(&self, statements: Vec<Statement>) -> Result<usize, EngineError> {
        self.run("transaction", move |conn| {
            Box::pin(async move {
                conn.transaction::<_, EngineError, _>(|conn| {
                    Box::pin(async move {
                        let mut affected = 0;
                        for statement in statements {
                            affected += into_query(statement).execute(conn).await?;
                        }
                        Ok(affected)
                    })
                })
                .await
            })
        })
        .await
    }

    pub(crate) async fn health_check(&self) -> Result<(), EngineError> {
        self.fetch_count(sql::select_one()).await.map(|_| ())
    }
}

fn flatten_record(record: &str) -> Result<Vec<serde_json::Value>, EngineError> {
    let chunks: Vec<Vec<serde_json::Value>> = serde_json::from_str(record)?;
    Ok(chunks.into_iter().flatten().collect())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tempfile::TempDir;

    /// Store on a throwaway database file. The directory must outlive the store.
    pub(crate) fn temp_store(pool_size: usize, timeout: Duration) -> (TempDir, TableStore) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("store.db").to_string_lossy().into_owned();
        let pool = build_pool(&path, pool_size, Duration::from_secs(5)).expect("Failed to build pool");
        (dir, TableStore::new(pool, timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_flattened_across_chunks() {
        let flat = flatten_record(r#"[[1, "a", 2.5], [true, null]]"#).unwrap();
        assert_eq!(
            flat,
            vec![
                serde_json::json!(1),
                serde_json::json!("a"),
                serde_json::json!(2.5),
                serde_json::json!(true),
                serde_json::Value::Null
            ]
        );
    }

    #[test]
    fn malformed_records_are_internal_errors() {
        let err = flatten_record("not json").unwrap_err();
        assert!(matches!(err, EngineError::Internal { .. }));
    }

    #[tokio::test]
    async fn timed_out_query_leaves_the_pool_usable() {
        let (_dir, store) = testing::temp_store(1, Duration::from_millis(250));
        store.health_check().await.unwrap();

        let slow = Statement {
            sql: "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 20000000) \
                  SELECT COUNT(*) AS count FROM n"
                .to_string(),
            params: Vec::new(),
        };
        let err = store.fetch_count(slow).await.unwrap_err();
        assert!(matches!(err, EngineError::Unavailable { .. }));
        assert!(err.is_retryable());

        store.health_check().await.unwrap();
        assert_eq!(store.fetch_count(sql::select_one()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn transactions_roll_back_on_failure() {
        let (_dir, store) = testing::temp_store(2, Duration::from_secs(5));
        let statement = |sql: &str| Statement {
            sql: sql.to_string(),
            params: Vec::new(),
        };
        TableStore::execute(&store, statement("CREATE TABLE t (x INTEGER NOT NULL)"))
            .await
            .unwrap();

        let result = store
            .execute_all(vec![
                statement("INSERT INTO t (x) VALUES (1)"),
                statement("INSERT INTO t (x) VALUES (NULL)"),
            ])
            .await;
        assert!(result.is_err());
        assert_eq!(
            store
                .fetch_count(statement("SELECT COUNT(*) AS count FROM t"))
                .await
                .unwrap(),
            0
        );
    }
}
