//! MySQL backend built on the [`mysql`](https://crates.io/crates/mysql) crate.
//!
//! # DDL is not transactional
//!
//! MySQL commits implicitly before and after most DDL statements
//! (`CREATE TABLE`, `ALTER TABLE`, `DROP TABLE`, ...). A script that fails
//! after some DDL already ran leaves that DDL applied, and the script is not
//! recorded in the history. Fix the database by hand before re-running.
//!
//! | Behavior | SQLite | MySQL | PostgreSQL |
//! |----------|--------|-------|------------|
//! | DDL in transactions | Fully supported | Causes implicit commit | Fully supported |
//! | Script failure | Complete rollback | Partial DDL may persist | Complete rollback |
//! | Placeholders | `?` | `?` or `:name` | `$1` |
//!
//! Keep scripts small and idempotent (`IF NOT EXISTS`) where DDL is involved.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{Datelike, NaiveDate, Timelike};
use mysql::prelude::*;
use mysql::{Conn, Opts};

use crate::db::{Database, Row, Transaction, Value};
use crate::error::DbError;
use crate::sql::{Compiled, Dialect, Params};
use crate::tx::TxOptions;

/// A MySQL database handle. Clones share the same connection.
#[derive(Clone)]
pub struct MysqlDatabase {
    conn: Arc<Mutex<Conn>>,
    dialect: Dialect,
}

impl std::fmt::Debug for MysqlDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MysqlDatabase")
            .field("dialect", &self.dialect)
            .finish()
    }
}

impl MysqlDatabase {
    pub fn connect(url: &str) -> Result<Self, DbError> {
        let opts = Opts::from_url(url).map_err(mysql::Error::from)?;
        Ok(Self::from_conn(Conn::new(opts)?))
    }

    pub fn from_conn(conn: Conn) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            dialect: Dialect::QuestionMark,
        }
    }

    /// `Named` binds `:name` tokens natively. `Indexed` is not understood
    /// by MySQL.
    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }
}

impl Database for MysqlDatabase {
    fn name(&self) -> &str {
        "mysql"
    }

    fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    fn ping(&self) -> Result<(), DbError> {
        self.conn.lock()?.query_drop("SELECT 1")?;
        Ok(())
    }

    fn execute(&self, stmt: &Compiled) -> Result<u64, DbError> {
        run(&mut *self.conn.lock()?, stmt)
    }

    fn query(&self, stmt: &Compiled) -> Result<Vec<Row>, DbError> {
        fetch(&mut *self.conn.lock()?, stmt)
    }

    fn begin(&self, options: &TxOptions) -> Result<Box<dyn Transaction>, DbError> {
        let mut conn = self.conn.lock()?;
        if let Some(level) = options.isolation.as_sql() {
            // Applies to the next transaction only.
            conn.query_drop(format!("SET TRANSACTION ISOLATION LEVEL {level}"))?;
        }
        conn.query_drop(if options.read_only {
            "START TRANSACTION READ ONLY"
        } else {
            "START TRANSACTION READ WRITE"
        })?;
        Ok(Box::new(MysqlTransaction {
            conn: Arc::clone(&self.conn),
            done: false,
        }))
    }
}

struct MysqlTransaction {
    conn: Arc<Mutex<Conn>>,
    done: bool,
}

impl MysqlTransaction {
    fn finish(&mut self, sql: &str) -> Result<(), DbError> {
        self.done = true;
        self.conn.lock()?.query_drop(sql)?;
        Ok(())
    }
}

impl Transaction for MysqlTransaction {
    fn execute(&mut self, stmt: &Compiled) -> Result<u64, DbError> {
        run(&mut *self.conn.lock()?, stmt)
    }

    fn query(&mut self, stmt: &Compiled) -> Result<Vec<Row>, DbError> {
        fetch(&mut *self.conn.lock()?, stmt)
    }

    fn commit(mut self: Box<Self>) -> Result<(), DbError> {
        self.finish("COMMIT")
    }

    fn rollback(mut self: Box<Self>) -> Result<(), DbError> {
        self.finish("ROLLBACK")
    }
}

impl Drop for MysqlTransaction {
    fn drop(&mut self) {
        if !self.done {
            if let Err(err) = self.finish("ROLLBACK") {
                tracing::warn!(error = %err, "Failed to roll back abandoned transaction");
            }
        }
    }
}

fn params(stmt: &Compiled) -> mysql::Params {
    match &stmt.params {
        Params::Positional(values) => {
            mysql::Params::Positional(values.iter().map(to_mysql).collect())
        }
        Params::Named(pairs) => mysql::Params::Named(
            pairs
                .iter()
                .map(|(name, value)| (name.as_bytes().to_vec(), to_mysql(value)))
                .collect::<HashMap<_, _>>(),
        ),
    }
}

fn run(conn: &mut Conn, stmt: &Compiled) -> Result<u64, DbError> {
    if stmt.params.is_empty() {
        // Text protocol, so one script may hold several statements.
        conn.query_drop(&stmt.sql)?;
    } else {
        conn.exec_drop(stmt.sql.as_str(), params(stmt))?;
    }
    Ok(conn.affected_rows())
}

fn fetch(conn: &mut Conn, stmt: &Compiled) -> Result<Vec<Row>, DbError> {
    let rows: Vec<mysql::Row> = if stmt.params.is_empty() {
        conn.query(&stmt.sql)?
    } else {
        conn.exec(stmt.sql.as_str(), params(stmt))?
    };
    rows.iter().map(from_mysql_row).collect()
}

fn from_mysql_row(row: &mysql::Row) -> Result<Row, DbError> {
    (0..row.len())
        .map(|index| from_mysql(index, row.as_ref(index).unwrap_or(&mysql::Value::NULL)))
        .collect::<Result<Vec<_>, _>>()
        .map(Row::new)
}

fn from_mysql(index: usize, value: &mysql::Value) -> Result<Value, DbError> {
    let column_error = |reason: String| DbError::Column { index, reason };
    Ok(match value {
        mysql::Value::NULL => Value::Null,
        // The text protocol returns every column as bytes.
        mysql::Value::Bytes(bytes) => match String::from_utf8(bytes.clone()) {
            Ok(text) => Value::Text(text),
            Err(err) => Value::Blob(err.into_bytes()),
        },
        mysql::Value::Int(v) => Value::Integer(*v),
        mysql::Value::UInt(v) => {
            Value::Integer(i64::try_from(*v).map_err(|e| column_error(e.to_string()))?)
        }
        mysql::Value::Float(v) => Value::Real((*v).into()),
        mysql::Value::Double(v) => Value::Real(*v),
        mysql::Value::Date(year, month, day, hour, minute, second, micros) => {
            let timestamp = NaiveDate::from_ymd_opt((*year).into(), (*month).into(), (*day).into())
                .and_then(|date| {
                    date.and_hms_micro_opt(
                        (*hour).into(),
                        (*minute).into(),
                        (*second).into(),
                        *micros,
                    )
                })
                .ok_or_else(|| column_error(format!("invalid date {value:?}")))?;
            Value::Timestamp(timestamp.and_utc())
        }
        mysql::Value::Time(negative, days, hours, minutes, seconds, micros) => Value::Text(format!(
            "{}{}:{:02}:{:02}.{:06}",
            if *negative { "-" } else { "" },
            u32::from(*hours) + days * 24,
            minutes,
            seconds,
            micros
        )),
    })
}

fn to_mysql(value: &Value) -> mysql::Value {
    match value {
        Value::Null => mysql::Value::NULL,
        Value::Integer(v) => mysql::Value::Int(*v),
        Value::Real(v) => mysql::Value::Double(*v),
        Value::Text(s) => mysql::Value::Bytes(s.as_bytes().to_vec()),
        Value::Blob(bytes) => mysql::Value::Bytes(bytes.clone()),
        Value::Timestamp(ts) => {
            let naive = ts.naive_utc();
            mysql::Value::Date(
                // MySQL timestamps stop well before u16::MAX.
                u16::try_from(naive.year()).unwrap_or(u16::MAX),
                naive.month() as u8,
                naive.day() as u8,
                naive.hour() as u8,
                naive.minute() as u8,
                naive.second() as u8,
                naive.nanosecond() / 1_000 % 1_000_000,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::Statement;
    use crate::test_mysql::fresh_database;
    use crate::tx::Scope;
    use crate::{Error, MemorySource, Migrator};

    #[test]
    fn upgrade_applies_scripts_once() {
        let db = fresh_database();
        let source = MemorySource::new()
            .with("01_users.sql", "CREATE TABLE users (id INT PRIMARY KEY, name TEXT)")
            .with(
                "02_seed.sql",
                "INSERT INTO users VALUES (1, 'ada'); INSERT INTO users VALUES (2, 'bob');",
            );
        let migrator = Migrator::new(db.clone(), source).with_signal_handling(false);

        let report = migrator.upgrade().unwrap();
        assert_eq!(report.applied.len(), 2);
        assert!(migrator.upgrade().unwrap().applied.is_empty());

        let users: i64 = Scope::root(&db)
            .query_row(&Statement::new("SELECT count(*) FROM users"))
            .unwrap()
            .get(0)
            .unwrap();
        assert_eq!(users, 2);

        let history = migrator.history().unwrap();
        assert_eq!(history[1].name, "02_seed.sql");
        assert_eq!(history[1].checksum, report.applied[1].checksum);
    }

    #[test]
    fn named_parameters_bind_natively() {
        let db = fresh_database().with_dialect(Dialect::Named);
        let row = Scope::root(&db)
            .query_row(&Statement::new("SELECT :b - :a").arg("a", 1_i64).arg("b", 10_i64))
            .unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 9);
    }

    #[test]
    fn ddl_commits_before_failing_script_is_recorded() {
        let db = fresh_database();
        let source = MemorySource::new().with(
            "01_partial.sql",
            "CREATE TABLE kept (id INT); SELECT * FROM missing;",
        );
        let err = Migrator::new(db.clone(), source)
            .with_signal_handling(false)
            .upgrade()
            .unwrap_err();
        assert!(matches!(err, Error::MigrationExecution { ref name, .. } if name == "01_partial.sql"));

        // The implicit commit kept the table, but nothing was recorded.
        let tables: i64 = Scope::root(&db)
            .query_row(&Statement::new(
                "SELECT count(*) FROM information_schema.tables \
                 WHERE table_schema = DATABASE() AND table_name = 'kept'",
            ))
            .unwrap()
            .get(0)
            .unwrap();
        assert_eq!(tables, 1);
        assert!(Migrator::new(db, MemorySource::new()).history().unwrap().is_empty());
    }

    #[test]
    fn dropped_history_fails_the_ledger_write() {
        let db = fresh_database();
        let source = MemorySource::new().with("01_drop.sql", "DROP TABLE schemalock_history");
        let err = Migrator::new(db, source)
            .with_signal_handling(false)
            .upgrade()
            .unwrap_err();
        assert!(matches!(err, Error::LedgerWrite { ref name, .. } if name == "01_drop.sql"));
    }
}
