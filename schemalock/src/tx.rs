//! Transaction scoping.
//!
//! A [`Scope`] is the current execution context: either the bare database or
//! an open transaction plus the options it was begun with. Work that needs
//! transactional guarantees goes through [`Scope::ensure_transaction`], which
//! either reuses the ambient transaction or opens (and owns) a new one.

use crate::db::{Database, Row, Transaction};
use crate::error::DbError;
use crate::sql::{Compiled, Statement};

/// Isolation levels, ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum IsolationLevel {
    /// Whatever the engine uses when none is requested.
    #[default]
    Default = 0,
    ReadUncommitted = 1,
    ReadCommitted = 2,
    WriteCommitted = 3,
    RepeatableRead = 4,
    Snapshot = 5,
    Serializable = 6,
    Linearizable = 7,
}

impl IsolationLevel {
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// The SQL keyword form, or `None` when the engine default applies.
    pub fn as_sql(self) -> Option<&'static str> {
        match self {
            Self::Default => None,
            Self::ReadUncommitted => Some("READ UNCOMMITTED"),
            Self::ReadCommitted | Self::WriteCommitted => Some("READ COMMITTED"),
            Self::RepeatableRead | Self::Snapshot => Some("REPEATABLE READ"),
            Self::Serializable | Self::Linearizable => Some("SERIALIZABLE"),
        }
    }
}

/// Requirements for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TxOptions {
    pub read_only: bool,
    pub isolation: IsolationLevel,
}

impl TxOptions {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }
}

/// Whether a request for `requested` cannot be served by the `ambient`
/// transaction and needs one of its own.
///
/// No request never needs a transaction. A request with no ambient
/// transaction always does. Otherwise a new one is needed when the
/// read-only flags differ or the request asks for stronger isolation.
pub fn needs_new_transaction(ambient: Option<&TxOptions>, requested: Option<&TxOptions>) -> bool {
    match (ambient, requested) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(ambient), Some(requested)) => {
            ambient.read_only != requested.read_only || requested.isolation > ambient.isolation
        }
    }
}

struct Ambient<'a> {
    tx: &'a mut Box<dyn Transaction>,
    options: TxOptions,
}

/// Execution context threaded through every database call.
pub struct Scope<'a> {
    db: &'a dyn Database,
    ambient: Option<Ambient<'a>>,
}

impl std::fmt::Debug for Scope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("database", &self.db.name())
            .field("transaction", &self.options())
            .finish()
    }
}

impl<'a> Scope<'a> {
    /// A scope with no ambient transaction.
    pub fn root(db: &'a dyn Database) -> Self {
        Self { db, ambient: None }
    }

    pub fn database(&self) -> &dyn Database {
        self.db
    }

    /// Options of the ambient transaction, if there is one.
    pub fn options(&self) -> Option<&TxOptions> {
        self.ambient.as_ref().map(|ambient| &ambient.options)
    }

    pub fn in_transaction(&self) -> bool {
        self.ambient.is_some()
    }

    pub fn ping(&self) -> Result<(), DbError> {
        self.db.ping()
    }

    fn compile(&self, stmt: &Statement) -> Compiled {
        let compiled = stmt.render(self.db.dialect());
        tracing::debug!(
            sql = %compiled.sql,
            params = ?compiled.params,
            in_transaction = self.in_transaction(),
            "Statement"
        );
        compiled
    }

    pub fn exec(&mut self, stmt: &Statement) -> Result<u64, DbError> {
        let compiled = self.compile(stmt);
        match self.ambient.as_mut() {
            Some(ambient) => ambient.tx.execute(&compiled),
            None => self.db.execute(&compiled),
        }
    }

    pub fn query(&mut self, stmt: &Statement) -> Result<Vec<Row>, DbError> {
        let compiled = self.compile(stmt);
        match self.ambient.as_mut() {
            Some(ambient) => ambient.tx.query(&compiled),
            None => self.db.query(&compiled),
        }
    }

    /// First row of the result, or [`DbError::NoRows`].
    pub fn query_row(&mut self, stmt: &Statement) -> Result<Row, DbError> {
        self.query(stmt)?.into_iter().next().ok_or(DbError::NoRows)
    }

    /// Runs `body` inside a transaction satisfying `requested`.
    ///
    /// When the ambient transaction already satisfies the request (see
    /// [`needs_new_transaction`]) `body` runs directly in this scope and no
    /// begin, commit or rollback happens here. Otherwise a new transaction is
    /// begun; it is committed if `body` succeeds and rolled back if it fails.
    /// A commit failure is returned. A panic in `body` rolls the transaction
    /// back when the handle is dropped during unwinding.
    pub fn ensure_transaction<T, E, F>(
        &mut self,
        requested: Option<&TxOptions>,
        body: F,
    ) -> Result<T, E>
    where
        E: From<DbError>,
        F: FnOnce(&mut Scope<'_>) -> Result<T, E>,
    {
        let options = match requested {
            Some(options) if needs_new_transaction(self.options(), requested) => *options,
            _ => {
                if self.in_transaction() {
                    tracing::debug!("Already in a transaction");
                }
                return body(self);
            }
        };

        tracing::debug!(?options, "Starting transaction");
        let mut tx = self.db.begin(&options)?;

        let result = {
            let mut scope = Scope {
                db: self.db,
                ambient: Some(Ambient {
                    tx: &mut tx,
                    options,
                }),
            };
            body(&mut scope)
        };

        match result {
            Ok(value) => {
                tracing::debug!("Committing transaction");
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                tracing::debug!("Rolling back transaction");
                if let Err(rollback_err) = tx.rollback() {
                    tracing::warn!(error = %rollback_err, "Failed to roll back transaction");
                }
                Err(err)
            }
        }
    }
}


#[cfg(all(test, feature = "sqlite"))]
mod sqlite_tests {
    use super::*;
    use crate::sqlite::SqliteDatabase;

    fn database() -> SqliteDatabase {
        let db = SqliteDatabase::open_in_memory().unwrap();
        Scope::root(&db)
            .exec(&Statement::new("create table t (v integer)"))
            .unwrap();
        db
    }

    fn count(db: &SqliteDatabase) -> i64 {
        Scope::root(db)
            .query_row(&Statement::new("select count(*) from t"))
            .unwrap()
            .get(0)
            .unwrap()
    }

    fn insert(scope: &mut Scope<'_>, v: i64) -> Result<u64, DbError> {
        scope.exec(&Statement::new("insert into t (v) values (:v)").arg("v", v))
    }

    #[test]
    fn commits_on_success() {
        let db = database();
        let mut root = Scope::root(&db);

        root.ensure_transaction(Some(&TxOptions::default()), |scope| {
            assert!(scope.in_transaction());
            insert(scope, 1)
        })
        .unwrap();

        assert_eq!(count(&db), 1);
    }

    #[test]
    fn rolls_back_on_error() {
        let db = database();
        let mut root = Scope::root(&db);

        let result: Result<(), DbError> =
            root.ensure_transaction(Some(&TxOptions::default()), |scope| {
                insert(scope, 1)?;
                Err(DbError::NoRows)
            });

        assert!(matches!(result, Err(DbError::NoRows)));
        assert_eq!(count(&db), 0);
    }

    #[test]
    fn rolls_back_on_panic() {
        let db = database();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut root = Scope::root(&db);
            let _: Result<(), DbError> =
                root.ensure_transaction(Some(&TxOptions::default()), |scope| {
                    insert(scope, 1)?;
                    panic!("boom");
                });
        }));

        assert!(result.is_err());
        assert_eq!(count(&db), 0);
    }

    #[test]
    fn nested_call_reuses_ambient_transaction() {
        let db = database();
        let mut root = Scope::root(&db);

        let result: Result<(), DbError> =
            root.ensure_transaction(Some(&TxOptions::default()), |outer| {
                insert(outer, 1)?;
                outer.ensure_transaction(Some(&TxOptions::default()), |inner| {
                    assert_eq!(inner.options(), Some(&TxOptions::default()));
                    insert(inner, 2)
                })?;
                outer.ensure_transaction(None, |inner| insert(inner, 3))?;
                // Failing after the nested calls undoes all of them.
                Err(DbError::NoRows)
            });

        assert!(result.is_err());
        assert_eq!(count(&db), 0);
    }

    #[test]
    fn no_request_runs_without_transaction() {
        let db = database();
        let mut root = Scope::root(&db);

        root.ensure_transaction(None, |scope| {
            assert!(!scope.in_transaction());
            insert(scope, 1)
        })
        .unwrap();

        assert_eq!(count(&db), 1);
    }

    #[test]
    fn read_only_transaction_rejects_writes() {
        let db = database();
        let mut root = Scope::root(&db);

        let result = root.ensure_transaction(Some(&TxOptions::read_only()), |scope| insert(scope, 1));

        assert!(result.is_err());
        assert_eq!(count(&db), 0);
        // The connection is writable again afterwards.
        insert(&mut root, 1).unwrap();
        assert_eq!(count(&db), 1);
    }
}
