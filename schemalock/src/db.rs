//! The SQL execution surface the migrator drives: a [`Database`] handle,
//! the [`Transaction`]s it begins, and the values passed in and out.

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::DbError;
use crate::sql::{Compiled, Dialect};
use crate::tx::TxOptions;

/// A single SQL value, either bound as a parameter or read from a row.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Timestamp(DateTime<Utc>),
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Integer(value.into())
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::Integer(value.into())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Integer(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self::Blob(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Conversion out of a [`Value`] read from a result row.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self, String>;
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::Integer(v) => Ok(*v),
            Value::Text(s) => s
                .trim()
                .parse()
                .map_err(|e| format!("cannot read {s:?} as integer: {e}")),
            other => Err(format!("expected integer, found {other:?}")),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> Result<Self, String> {
        let wide = i64::from_value(value)?;
        i32::try_from(wide).map_err(|e| format!("{wide} out of range: {e}"))
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::Real(v) => Ok(*v),
            Value::Integer(v) => Ok(*v as f64),
            other => Err(format!("expected real, found {other:?}")),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::Text(s) => Ok(s.clone()),
            Value::Blob(bytes) => String::from_utf8(bytes.clone()).map_err(|e| e.to_string()),
            other => Err(format!("expected text, found {other:?}")),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::Blob(bytes) => Ok(bytes.clone()),
            Value::Text(s) => Ok(s.clone().into_bytes()),
            other => Err(format!("expected blob, found {other:?}")),
        }
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::Timestamp(ts) => Ok(*ts),
            Value::Text(s) => parse_timestamp(s),
            other => Err(format!("expected timestamp, found {other:?}")),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

/// Engines without a native timestamp type (SQLite) hand timestamps back as
/// text, either RFC 3339 or `YYYY-MM-DD HH:MM:SS[.fff]` in UTC.
fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| format!("cannot read {s:?} as timestamp: {e}"))
}

/// One result row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get<T: FromValue>(&self, index: usize) -> Result<T, DbError> {
        let value = self.values.get(index).ok_or_else(|| DbError::Column {
            index,
            reason: format!("row has {} columns", self.values.len()),
        })?;
        T::from_value(value).map_err(|reason| DbError::Column { index, reason })
    }
}

/// A database the migrator can upgrade.
///
/// Implementations are cheap handles over one connection; statements
/// arrive already rendered in [`Database::dialect`].
pub trait Database: Send + Sync {
    /// Engine name, used to pick engine-qualified scripts (`sqlite`,
    /// `postgresql`, `mysql`).
    fn name(&self) -> &str;

    fn dialect(&self) -> &Dialect;

    fn ping(&self) -> Result<(), DbError>;

    /// Executes `stmt` outside any transaction, returning the affected row count.
    fn execute(&self, stmt: &Compiled) -> Result<u64, DbError>;

    fn query(&self, stmt: &Compiled) -> Result<Vec<Row>, DbError>;

    fn begin(&self, options: &TxOptions) -> Result<Box<dyn Transaction>, DbError>;
}

impl<T: Database + ?Sized> Database for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn dialect(&self) -> &Dialect {
        (**self).dialect()
    }

    fn ping(&self) -> Result<(), DbError> {
        (**self).ping()
    }

    fn execute(&self, stmt: &Compiled) -> Result<u64, DbError> {
        (**self).execute(stmt)
    }

    fn query(&self, stmt: &Compiled) -> Result<Vec<Row>, DbError> {
        (**self).query(stmt)
    }

    fn begin(&self, options: &TxOptions) -> Result<Box<dyn Transaction>, DbError> {
        (**self).begin(options)
    }
}

/// An open transaction. Dropping it without calling [`Transaction::commit`]
/// rolls it back.
pub trait Transaction {
    fn execute(&mut self, stmt: &Compiled) -> Result<u64, DbError>;

    fn query(&mut self, stmt: &Compiled) -> Result<Vec<Row>, DbError>;

    fn commit(self: Box<Self>) -> Result<(), DbError>;

    fn rollback(self: Box<Self>) -> Result<(), DbError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn row_reads_typed_columns() {
        let row = Row::new(vec![
            Value::Text("01_init.sql".to_string()),
            Value::Text("2024-03-01 10:20:30.250".to_string()),
            Value::Integer(42),
            Value::Null,
        ]);

        assert_eq!(row.get::<String>(0).unwrap(), "01_init.sql");
        assert_eq!(
            row.get::<DateTime<Utc>>(1).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 20, 30).unwrap()
                + chrono::Duration::milliseconds(250)
        );
        assert_eq!(row.get::<i64>(2).unwrap(), 42);
        assert_eq!(row.get::<Option<i64>>(3).unwrap(), None);
    }

    #[test]
    fn row_reports_bad_columns() {
        let row = Row::new(vec![Value::Text("abc".to_string())]);

        assert!(matches!(
            row.get::<i64>(0),
            Err(DbError::Column { index: 0, .. })
        ));
        assert!(matches!(
            row.get::<String>(3),
            Err(DbError::Column { index: 3, .. })
        ));
    }

    #[test]
    fn timestamps_accept_rfc3339() {
        let ts = parse_timestamp("2024-03-01T10:20:30+02:00").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 3, 1, 8, 20, 30).unwrap());
    }
}
