//! SQLite backend built on [`rusqlite`](https://crates.io/crates/rusqlite).
//!
//! SQLite runs DDL inside transactions, so a failing migration script leaves
//! no partial state behind. Scripts without bound arguments go through
//! `execute_batch`, which means one file may hold several statements.
//!
//! ```
//! use schemalock::sqlite::SqliteDatabase;
//! use schemalock::{Database, Scope, Statement};
//!
//! let db = SqliteDatabase::open_in_memory().unwrap();
//! let mut scope = Scope::root(&db);
//! scope
//!     .exec(&Statement::new("create table users (id integer primary key, name text)"))
//!     .unwrap();
//! scope
//!     .exec(&Statement::new("insert into users (name) values (:name)").arg("name", "ada"))
//!     .unwrap();
//! let name: String = scope
//!     .query_row(&Statement::new("select name from users"))
//!     .unwrap()
//!     .get(0)
//!     .unwrap();
//! assert_eq!(name, "ada");
//! assert_eq!(db.name(), "sqlite");
//! ```

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection, ToSql};

use crate::db::{Database, Row, Transaction, Value};
use crate::error::DbError;
use crate::sql::{Compiled, Dialect, Params};
use crate::tx::TxOptions;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// A SQLite database handle. Clones share the same connection.
#[derive(Clone)]
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
    dialect: Dialect,
}

impl std::fmt::Debug for SqliteDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDatabase")
            .field("dialect", &self.dialect)
            .finish()
    }
}

impl SqliteDatabase {
    /// Opens (or creates) the database file at `path`.
    ///
    /// A 30 second busy timeout is set so that several processes upgrading
    /// the same file wait on each other's writes instead of failing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            dialect: Dialect::QuestionMark,
        }
    }

    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Set how long a statement waits on another connection's lock.
    pub fn with_busy_timeout(self, timeout: Duration) -> Result<Self, DbError> {
        self.conn.lock()?.busy_timeout(timeout)?;
        Ok(self)
    }
}

impl Database for SqliteDatabase {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    fn ping(&self) -> Result<(), DbError> {
        let conn = self.conn.lock()?;
        conn.query_row("select 1", [], |_| Ok(()))?;
        Ok(())
    }

    fn execute(&self, stmt: &Compiled) -> Result<u64, DbError> {
        run(&*self.conn.lock()?, stmt)
    }

    fn query(&self, stmt: &Compiled) -> Result<Vec<Row>, DbError> {
        fetch(&*self.conn.lock()?, stmt)
    }

    fn begin(&self, options: &TxOptions) -> Result<Box<dyn Transaction>, DbError> {
        let conn = self.conn.lock()?;
        if options.read_only {
            conn.execute_batch("PRAGMA query_only = ON")?;
        }
        // A deferred writer upgrading from a read lock can fail with BUSY
        // without waiting on the busy timeout.
        let begin = if options.read_only {
            "BEGIN"
        } else {
            "BEGIN IMMEDIATE"
        };
        if let Err(err) = conn.execute_batch(begin) {
            if options.read_only {
                let _ = conn.execute_batch("PRAGMA query_only = OFF");
            }
            return Err(err.into());
        }
        Ok(Box::new(SqliteTransaction {
            conn: Arc::clone(&self.conn),
            read_only: options.read_only,
            done: false,
        }))
    }
}

struct SqliteTransaction {
    conn: Arc<Mutex<Connection>>,
    read_only: bool,
    done: bool,
}

impl SqliteTransaction {
    fn finish(&mut self, sql: &str) -> Result<(), DbError> {
        self.done = true;
        let conn = self.conn.lock()?;
        let result = conn.execute_batch(sql);
        if self.read_only {
            conn.execute_batch("PRAGMA query_only = OFF")?;
        }
        Ok(result?)
    }
}

impl Transaction for SqliteTransaction {
    fn execute(&mut self, stmt: &Compiled) -> Result<u64, DbError> {
        run(&*self.conn.lock()?, stmt)
    }

    fn query(&mut self, stmt: &Compiled) -> Result<Vec<Row>, DbError> {
        fetch(&*self.conn.lock()?, stmt)
    }

    fn commit(mut self: Box<Self>) -> Result<(), DbError> {
        self.finish("COMMIT")
    }

    fn rollback(mut self: Box<Self>) -> Result<(), DbError> {
        self.finish("ROLLBACK")
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if !self.done {
            if let Err(err) = self.finish("ROLLBACK") {
                tracing::warn!(error = %err, "Failed to roll back abandoned transaction");
            }
        }
    }
}

fn run(conn: &Connection, stmt: &Compiled) -> Result<u64, DbError> {
    let changed = match &stmt.params {
        params if params.is_empty() => {
            conn.execute_batch(&stmt.sql)?;
            conn.changes()
        }
        Params::Positional(values) => conn.execute(&stmt.sql, params_from_iter(values.iter()))? as u64,
        Params::Named(pairs) => {
            let names = named(pairs);
            let bound: Vec<(&str, &dyn ToSql)> = names
                .iter()
                .zip(pairs)
                .map(|(name, (_, value))| (name.as_str(), value as &dyn ToSql))
                .collect();
            conn.execute(&stmt.sql, bound.as_slice())? as u64
        }
    };
    Ok(changed)
}

fn fetch(conn: &Connection, stmt: &Compiled) -> Result<Vec<Row>, DbError> {
    let mut prepared = conn.prepare(&stmt.sql)?;
    let columns = prepared.column_count();
    let mut rows = match &stmt.params {
        Params::Positional(values) => prepared.query(params_from_iter(values.iter()))?,
        Params::Named(pairs) => {
            let names = named(pairs);
            let bound: Vec<(&str, &dyn ToSql)> = names
                .iter()
                .zip(pairs)
                .map(|(name, (_, value))| (name.as_str(), value as &dyn ToSql))
                .collect();
            prepared.query(bound.as_slice())?
        }
    };

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(columns);
        for index in 0..columns {
            values.push(from_sqlite(index, row.get_ref(index)?)?);
        }
        out.push(Row::new(values));
    }
    Ok(out)
}

fn named(pairs: &[(String, Value)]) -> Vec<String> {
    pairs.iter().map(|(name, _)| format!(":{name}")).collect()
}

fn from_sqlite(index: usize, value: ValueRef<'_>) -> Result<Value, DbError> {
    Ok(match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Integer(v),
        ValueRef::Real(v) => Value::Real(v),
        ValueRef::Text(bytes) => Value::Text(
            String::from_utf8(bytes.to_vec()).map_err(|e| DbError::Column {
                index,
                reason: e.to_string(),
            })?,
        ),
        ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
    })
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Integer(v) => ToSqlOutput::from(*v),
            Value::Real(v) => ToSqlOutput::from(*v),
            Value::Text(s) => ToSqlOutput::from(s.as_str()),
            Value::Blob(bytes) => ToSqlOutput::from(bytes.as_slice()),
            Value::Timestamp(ts) => {
                ToSqlOutput::from(ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::Statement;
    use crate::tx::Scope;
    use chrono::{DateTime, TimeZone, Utc};

    #[test]
    fn multi_statement_script_runs_as_batch() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        let mut scope = Scope::root(&db);

        scope
            .exec(&Statement::new(
                "create table a (id integer);\ncreate table b (id integer);\ninsert into b values (1);",
            ))
            .unwrap();

        let count: i64 = scope
            .query_row(&Statement::new("select count(*) from b"))
            .unwrap()
            .get(0)
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn timestamps_round_trip_through_text() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        let mut scope = Scope::root(&db);
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();

        scope
            .exec(&Statement::new("create table t (at timestamp)"))
            .unwrap();
        scope
            .exec(&Statement::new("insert into t values (:at)").arg("at", at))
            .unwrap();

        let read: DateTime<Utc> = scope
            .query_row(&Statement::new("select at from t"))
            .unwrap()
            .get(0)
            .unwrap();
        assert_eq!(read, at);
    }

    #[test]
    fn named_dialect_binds_by_name() {
        let db = SqliteDatabase::open_in_memory()
            .unwrap()
            .with_dialect(Dialect::Named);
        let mut scope = Scope::root(&db);

        let row = scope
            .query_row(
                &Statement::new("select :b - :a")
                    .arg("a", 1_i64)
                    .arg("b", 10_i64),
            )
            .unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 9);
    }

    #[test]
    fn indexed_dialect_binds_repeated_index() {
        let db = SqliteDatabase::open_in_memory()
            .unwrap()
            .with_dialect(Dialect::postgres());
        let mut scope = Scope::root(&db);

        let row = scope
            .query_row(
                &Statement::new("select :a + :a + :b")
                    .arg("a", 2_i64)
                    .arg("b", 5_i64),
            )
            .unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 9);
    }

    #[test]
    fn ping_succeeds() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.ping().unwrap();
    }
}
