use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::db::Database;
use crate::error::{DbError, Error};
use crate::ledger::{checksum, MigrationRecord};
use crate::lock::{LockManager, DEFAULT_TICK, DEFAULT_TIMEOUT};
use crate::log::{Logger, TracingLogger};
use crate::source::{for_engine, MigrationSource};
use crate::sql::Statement;
use crate::statements::{DefaultStatements, Statements};
use crate::tx::{Scope, TxOptions};

/// What a successful [`Migrator::upgrade`] did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpgradeReport {
    /// Number of migrations found in the history before this run.
    pub already_applied: usize,
    /// Migrations applied by this run, in order.
    pub applied: Vec<MigrationRecord>,
}

/// The entrypoint for upgrading a database.
///
/// Construct it with the database and the source of migration scripts, then
/// call [`Migrator::upgrade`]. Any number of processes may upgrade the same
/// database at once: the lock row serializes them, and every script runs
/// exactly once, in lexical order of its name.
///
/// `upgrade` blocks the calling thread, including while it waits for the
/// lock. From async code, call it inside `spawn_blocking`.
///
/// ```
/// use schemalock::sqlite::SqliteDatabase;
/// use schemalock::{MemorySource, Migrator};
///
/// let db = SqliteDatabase::open_in_memory().unwrap();
/// let source = MemorySource::new()
///     .with("01_users.sql", "create table users (id integer primary key, name text);")
///     .with("02_email.sql", "alter table users add column email text;");
///
/// let migrator = Migrator::new(db, source).with_signal_handling(false);
/// let report = migrator.upgrade().unwrap();
/// assert_eq!(report.applied.len(), 2);
///
/// // A second run finds nothing to do.
/// assert!(migrator.upgrade().unwrap().applied.is_empty());
/// assert_eq!(migrator.history().unwrap().len(), 2);
/// ```
pub struct Migrator {
    db: Box<dyn Database>,
    source: Box<dyn MigrationSource>,
    statements: Box<dyn Statements>,
    clock: Box<dyn Clock>,
    logger: Box<dyn Logger>,
    engine: Option<String>,
    tick: Duration,
    timeout: Duration,
    cancel: Option<CancellationToken>,
    watch_signals: bool,
    on_migration_start: Option<Box<dyn Fn(&str) + Send + Sync>>,
    on_migration_complete: Option<Box<dyn Fn(&MigrationRecord) + Send + Sync>>,
    on_migration_error: Option<Box<dyn Fn(&str, &Error) + Send + Sync>>,
}

// Manual Debug impl since closures don't implement Debug
impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("database", &self.db.name())
            .field("dialect", self.db.dialect())
            .field("engine", &self.engine())
            .field("lock_table", &self.statements.lock_table())
            .field("history_table", &self.statements.history_table())
            .field("tick", &self.tick)
            .field("timeout", &self.timeout)
            .field("cancel", &self.cancel.is_some())
            .field("watch_signals", &self.watch_signals)
            .field("on_migration_start", &self.on_migration_start.is_some())
            .field(
                "on_migration_complete",
                &self.on_migration_complete.is_some(),
            )
            .field("on_migration_error", &self.on_migration_error.is_some())
            .finish()
    }
}

impl Migrator {
    pub fn new(db: impl Database + 'static, source: impl MigrationSource + 'static) -> Self {
        Self {
            db: Box::new(db),
            source: Box::new(source),
            statements: Box::new(DefaultStatements::default()),
            clock: Box::new(SystemClock),
            logger: Box::new(TracingLogger),
            engine: None,
            tick: DEFAULT_TICK,
            timeout: DEFAULT_TIMEOUT,
            cancel: None,
            watch_signals: true,
            on_migration_start: None,
            on_migration_complete: None,
            on_migration_error: None,
        }
    }

    pub fn with_statements(mut self, statements: impl Statements + 'static) -> Self {
        self.statements = Box::new(statements);
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_logger(mut self, logger: impl Logger + 'static) -> Self {
        self.logger = Box::new(logger);
        self
    }

    /// Engine name matched against qualified script names such as
    /// `03_index.postgresql.sql`. Defaults to [`Database::name`].
    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = Some(engine.into());
        self
    }

    /// Lock poll interval. Defaults to 5 seconds.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// How long to wait for the lock. Defaults to 5 minutes.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Abort a pending lock wait when `token` is cancelled. Cancellation is
    /// not observed once scripts are running.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Whether SIGINT, SIGTERM and SIGQUIT abort a pending lock wait.
    /// Defaults to true.
    pub fn with_signal_handling(mut self, enabled: bool) -> Self {
        self.watch_signals = enabled;
        self
    }

    /// Set a callback to be invoked when a migration starts.
    /// The callback receives the migration name.
    pub fn on_migration_start<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_migration_start = Some(Box::new(callback));
        self
    }

    /// Set a callback to be invoked once a migration and its ledger row are
    /// both committed.
    pub fn on_migration_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&MigrationRecord) + Send + Sync + 'static,
    {
        self.on_migration_complete = Some(Box::new(callback));
        self
    }

    /// Set a callback to be invoked when a migration fails.
    pub fn on_migration_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &Error) + Send + Sync + 'static,
    {
        self.on_migration_error = Some(Box::new(callback));
        self
    }

    pub fn database(&self) -> &dyn Database {
        self.db.as_ref()
    }

    pub fn engine(&self) -> &str {
        self.engine.as_deref().unwrap_or_else(|| self.db.name())
    }

    fn lock_manager(&self) -> LockManager<'_> {
        LockManager::new(self.db.as_ref(), self.statements.as_ref())
            .with_clock(self.clock.as_ref())
            .with_logger(self.logger.as_ref())
            .with_tick(self.tick)
            .with_timeout(self.timeout)
            .with_cancellation(self.cancel.clone())
            .with_signal_handling(self.watch_signals)
    }

    /// Script names for this engine, in the order they apply.
    pub fn candidates(&self) -> Result<Vec<String>, Error> {
        Ok(for_engine(self.source.list()?, self.engine()))
    }

    /// Applied migrations ordered by name. Empty if the history table does
    /// not exist yet.
    pub fn history(&self) -> Result<Vec<MigrationRecord>, Error> {
        if !self.table_exists(self.statements.history_table()) {
            return Ok(Vec::new());
        }
        self.load_history()
    }

    /// Migrations an upgrade would apply, without taking the lock or
    /// changing anything. Fails the same way an upgrade would if the history
    /// does not match the scripts.
    pub fn pending(&self) -> Result<Vec<String>, Error> {
        let history = self.history()?;
        self.diff(&history, &self.candidates()?)
    }

    /// Brings the database up to date with the migration source.
    ///
    /// Creates the lock and history tables if needed, takes the lock, checks
    /// the recorded history against the scripts and applies the missing
    /// ones in order. The lock is released on every path out, including a
    /// panic. If releasing fails after an earlier error, the earlier error is
    /// returned and the release failure is only logged.
    pub fn upgrade(&self) -> Result<UpgradeReport, Error> {
        self.logger.log("Starting database upgrade...");

        self.bootstrap()?;

        let locks = self.lock_manager();
        let lock = locks.acquire()?;
        tracing::debug!(%lock, "Holding lock");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.upgrade_locked()));
        if let Ok(Ok(_)) = outcome {
            self.logger.log("Database successfully upgraded");
        }

        let released = locks.release(&lock);
        if let Err(err) = &released {
            self.logger.log(&format!("failed to free lock: {err}"));
        }

        match outcome {
            Ok(Ok(report)) => released.map(|()| report),
            Ok(Err(err)) => Err(err),
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    fn bootstrap(&self) -> Result<(), Error> {
        let mut scope = Scope::root(self.db.as_ref());
        scope.ping().map_err(Error::Connectivity)?;

        let tables = [
            (
                self.statements.lock_table(),
                self.statements.create_lock_table(),
            ),
            (
                self.statements.history_table(),
                self.statements.create_history_table(),
            ),
        ];

        for (table, create) in tables {
            if self.table_exists(table) {
                continue;
            }

            self.logger.log(&format!("Creating table {table}..."));
            scope
                .ensure_transaction(Some(&TxOptions::default()), |scope| scope.exec(&create))
                .map_err(|source| Error::Bootstrap {
                    table: table.to_string(),
                    source,
                })?;
            self.logger.log(&format!("Table {table} successfully created"));
        }

        Ok(())
    }

    /// A failing count is taken to mean the table is absent.
    fn table_exists(&self, table: &str) -> bool {
        let counted: Result<_, DbError> = Scope::root(self.db.as_ref())
            .ensure_transaction(Some(&TxOptions::read_only()), |scope| {
                scope.query_row(&self.statements.count(table))
            });
        if let Err(err) = &counted {
            tracing::debug!(table, error = %err, "Table probe failed");
        }
        counted.is_ok()
    }

    fn load_history(&self) -> Result<Vec<MigrationRecord>, Error> {
        self.logger.log("Finding existing migrations...");

        let rows = Scope::root(self.db.as_ref())
            .ensure_transaction(Some(&TxOptions::read_only()), |scope| {
                scope.query(&self.statements.history())
            })
            .map_err(Error::History)?;

        let mut history = rows
            .iter()
            .map(MigrationRecord::from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Error::History)?;
        // Collation differs between engines; the walk needs byte order.
        history.sort_by(|a, b| a.name.cmp(&b.name));

        self.logger
            .log(&format!("Found {} existing migration(s)", history.len()));
        Ok(history)
    }

    /// Walks history and candidates in lockstep and returns the candidates
    /// past the end of the history.
    fn diff(
        &self,
        history: &[MigrationRecord],
        candidates: &[String],
    ) -> Result<Vec<String>, Error> {
        for (record, name) in history.iter().zip(candidates) {
            if record.name != *name {
                return Err(Error::HistoryMismatch {
                    recorded: record.name.clone(),
                    candidate: Some(name.clone()),
                });
            }

            let computed = checksum(&self.source.content(name)?);
            if computed != record.checksum {
                return Err(Error::ChecksumMismatch {
                    name: name.clone(),
                    recorded: record.checksum.clone(),
                    computed,
                });
            }

            self.logger.log(&format!(
                "Migration {} already done on {}",
                record.name, record.started_at
            ));
        }

        if let Some(missing) = history.get(candidates.len()) {
            return Err(Error::HistoryMismatch {
                recorded: missing.name.clone(),
                candidate: None,
            });
        }

        Ok(candidates.get(history.len()..).unwrap_or_default().to_vec())
    }

    fn upgrade_locked(&self) -> Result<UpgradeReport, Error> {
        let history = self.load_history()?;
        let pending = self.diff(&history, &self.candidates()?)?;

        tracing::debug!(
            already_applied = history.len(),
            pending = ?pending,
            "Considering migrations to run"
        );

        let mut applied = Vec::with_capacity(pending.len());
        for name in &pending {
            let _span = tracing::info_span!("migration", name = %name).entered();

            // Call on_migration_start hook
            if let Some(ref callback) = self.on_migration_start {
                callback(name);
            }

            match self.apply(name) {
                Ok(record) => {
                    tracing::info!(
                        duration_ms = record.duration_ms,
                        "Migration completed successfully"
                    );

                    // Call on_migration_complete hook
                    if let Some(ref callback) = self.on_migration_complete {
                        callback(&record);
                    }
                    applied.push(record);
                }
                Err(err) => {
                    tracing::error!(error = %err, "Migration failed");

                    // Call on_migration_error hook
                    if let Some(ref callback) = self.on_migration_error {
                        callback(name, &err);
                    }
                    return Err(err);
                }
            }
        }

        Ok(UpgradeReport {
            already_applied: history.len(),
            applied,
        })
    }

    /// Runs one script in its own transaction, then records it in a second
    /// one.
    fn apply(&self, name: &str) -> Result<MigrationRecord, Error> {
        self.logger.log(&format!("Processing migration {name}..."));

        let content = self.source.content(name)?;
        let mut scope = Scope::root(self.db.as_ref());

        let started_at = self.clock.now();
        scope
            .ensure_transaction(Some(&TxOptions::default()), |scope| {
                scope.exec(&Statement::new(content.as_str()))
            })
            .map_err(|source| Error::MigrationExecution {
                name: name.to_string(),
                source,
            })?;
        let duration = self.clock.now() - started_at;

        let record = MigrationRecord {
            name: name.to_string(),
            started_at,
            duration_ms: duration.num_milliseconds(),
            checksum: checksum(&content),
        };

        scope
            .ensure_transaction(Some(&TxOptions::default()), |scope| {
                scope.exec(&self.statements.record(&record))
            })
            .map_err(|source| Error::LedgerWrite {
                name: name.to_string(),
                source,
            })?;

        self.logger
            .log(&format!("Migration {name} successfully processed"));
        Ok(record)
    }
}
