#![cfg_attr(docsrs, feature(doc_cfg))]
//! `schemalock` applies ordered SQL migration scripts to a database exactly
//! once, even when several processes start the same upgrade at the same time.
//!
//! Core concepts:
//! - A migration is a named SQL script. Scripts apply in lexical order of
//!   their names, each in its own transaction, and each applied script is
//!   recorded in a history table together with a checksum of its text.
//! - An upgrade holds a lock row while it runs. Other processes poll until
//!   the row is gone, their timeout elapses, or they are cancelled.
//! - A recorded script that was later edited, renamed or removed stops the
//!   upgrade before anything runs.
//!
//! ```
//! use schemalock::sqlite::SqliteDatabase;
//! use schemalock::{MemorySource, Migrator};
//!
//! let db = SqliteDatabase::open_in_memory().unwrap();
//! let migrator = Migrator::new(
//!     db,
//!     MemorySource::new().with("01_users.sql", "create table users (id integer primary key);"),
//! );
//!
//! let report = migrator.upgrade().unwrap();
//! assert_eq!(report.applied[0].name, "01_users.sql");
//! assert_eq!(report.applied[0].checksum.len(), 43);
//! ```
//!
//! # Database support
//!
//! - [`SQLite`](sqlite) - available with the `sqlite` feature flag (default).
//! - [`MySQL`](mysql) - available with the `mysql` feature flag.
//! - [`PostgreSQL`](postgres) - available with the `postgres` feature flag.
//!
//! # Script naming
//!
//! Scripts meant for a single engine carry its name as the second-to-last
//! dot-separated segment, e.g. `04_index.postgresql.sql`. They are skipped
//! when upgrading any other engine.

mod clock;
pub use clock::{Clock, SystemClock};

mod db;
pub use db::{Database, FromValue, Row, Transaction, Value};

mod error;
pub use error::{AbortCause, DbError, Error, SourceError, UnknownDialect};

mod ledger;
pub use ledger::{checksum, MigrationRecord};

mod lock;
pub use lock::{Lock, LockManager, DEFAULT_TICK, DEFAULT_TIMEOUT, LOCK_ID, MIN_TICK};

mod log;
pub use log::{Logger, TracingLogger};

mod migrator;
pub use migrator::{Migrator, UpgradeReport};

mod source;
pub use source::{for_engine, DirSource, MemorySource, MigrationSource};

mod sql;
pub use sql::{Compiled, Dialect, Params, Statement};

mod statements;
pub use statements::{DefaultStatements, Statements, DEFAULT_HISTORY_TABLE, DEFAULT_LOCK_TABLE};

mod tx;
pub use tx::{needs_new_transaction, IsolationLevel, Scope, TxOptions};

#[cfg(feature = "sqlite")]
#[cfg_attr(docsrs, doc(cfg(feature = "sqlite")))]
pub mod sqlite;

#[cfg(feature = "mysql")]
#[cfg_attr(docsrs, doc(cfg(feature = "mysql")))]
pub mod mysql;

#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod postgres;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(all(test, feature = "mysql"))]
pub(crate) mod test_mysql;

#[cfg(all(test, feature = "postgres"))]
pub(crate) mod test_postgres;
