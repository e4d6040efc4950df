use crate::ledger::MigrationRecord;
use crate::lock::Lock;
use crate::sql::Statement;

pub const DEFAULT_LOCK_TABLE: &str = "schemalock_lock";
pub const DEFAULT_HISTORY_TABLE: &str = "schemalock_history";

/// Every statement the migrator sends to the database.
///
/// Implement this to target an engine whose SQL differs from
/// [`DefaultStatements`].
pub trait Statements: Send + Sync {
    fn lock_table(&self) -> &str;

    fn history_table(&self) -> &str;

    /// Single-row `count(*)` over `table`, used to probe whether it exists.
    fn count(&self, table: &str) -> Statement;

    fn create_lock_table(&self) -> Statement;

    fn create_history_table(&self) -> Statement;

    /// Inserts the lock row. Must fail if the row already exists.
    fn lock(&self, lock: &Lock) -> Statement;

    fn unlock(&self, lock: &Lock) -> Statement;

    /// Selects `name, started_at, duration_ms, checksum` ordered by name.
    fn history(&self) -> Statement;

    fn record(&self, record: &MigrationRecord) -> Statement;
}

/// Portable SQL that runs on SQLite, PostgreSQL and MySQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultStatements {
    lock_table: String,
    history_table: String,
}

impl Default for DefaultStatements {
    fn default() -> Self {
        Self::with_table_names(DEFAULT_LOCK_TABLE, DEFAULT_HISTORY_TABLE)
    }
}

impl DefaultStatements {
    pub fn with_table_names(lock_table: impl Into<String>, history_table: impl Into<String>) -> Self {
        Self {
            lock_table: lock_table.into(),
            history_table: history_table.into(),
        }
    }
}

impl Statements for DefaultStatements {
    fn lock_table(&self) -> &str {
        &self.lock_table
    }

    fn history_table(&self) -> &str {
        &self.history_table
    }

    fn count(&self, table: &str) -> Statement {
        Statement::new(format!("select count(*) from {table}"))
    }

    fn create_lock_table(&self) -> Statement {
        Statement::new(format!(
            "create table if not exists {} (
                id int primary key,
                hostname varchar(128) not null,
                pid int not null,
                since timestamp not null
            )",
            self.lock_table
        ))
    }

    fn create_history_table(&self) -> Statement {
        Statement::new(format!(
            "create table if not exists {} (
                name varchar(512) primary key,
                started_at timestamp not null,
                duration_ms int not null,
                checksum char(43) not null
            )",
            self.history_table
        ))
    }

    fn lock(&self, lock: &Lock) -> Statement {
        Statement::new(format!(
            "insert into {} (id, hostname, pid, since) values (:id, :hostname, :pid, :since)",
            self.lock_table
        ))
        .arg("id", lock.id)
        .arg("hostname", lock.hostname.as_str())
        .arg("pid", lock.pid)
        .arg("since", lock.since)
    }

    fn unlock(&self, lock: &Lock) -> Statement {
        Statement::new(format!("delete from {} where id = :id", self.lock_table)).arg("id", lock.id)
    }

    fn history(&self) -> Statement {
        Statement::new(format!(
            "select name, started_at, duration_ms, checksum from {} order by name",
            self.history_table
        ))
    }

    fn record(&self, record: &MigrationRecord) -> Statement {
        Statement::new(format!(
            "insert into {} (name, started_at, duration_ms, checksum) \
             values (:name, :started_at, :duration_ms, :checksum)",
            self.history_table
        ))
        .arg("name", record.name.as_str())
        .arg("started_at", record.started_at)
        .arg("duration_ms", record.duration_ms)
        .arg("checksum", record.checksum.as_str())
    }
}
