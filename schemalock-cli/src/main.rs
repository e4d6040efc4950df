//! Command line runner for schemalock migrations.
//!
//! Applies the SQL scripts of a directory to the database named by
//! `--database-url` (or `DATABASE_URL`):
//!
//! ```text
//! schemalock --database-url sqlite:app.db --dir migrations upgrade
//! schemalock --database-url postgres://app@localhost/app history --json
//! ```

use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use schemalock::{Database, DefaultStatements, Dialect, DirSource, MigrationSource, Migrator};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "schemalock", version, about = "Apply SQL migration scripts exactly once")]
struct CliArgs {
    /// Database to upgrade: `sqlite:<path>`, `sqlite::memory:`, a plain file
    /// path, `postgres://...` or `mysql://...`
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Directory holding the migration scripts
    #[arg(long, env = "SCHEMALOCK_DIR", default_value = "migrations", global = true)]
    dir: String,

    /// Engine name used to select engine-specific scripts (defaults to the
    /// backend's own name)
    #[arg(long, global = true)]
    engine: Option<String>,

    /// Placeholder style for bound arguments: `?`, `named`, `$` or
    /// `indexed:<prefix>`
    #[arg(long, global = true)]
    placeholders: Option<Dialect>,

    /// Interval between lock attempts, in milliseconds
    #[arg(
        long,
        default_value_t = 5_000,
        value_parser = clap::value_parser!(u64).range(1..),
        global = true
    )]
    tick_ms: u64,

    /// How long to wait for the lock, in seconds
    #[arg(long, default_value_t = 300, global = true)]
    timeout_secs: u64,

    #[arg(long, default_value = schemalock::DEFAULT_LOCK_TABLE, global = true)]
    lock_table: String,

    #[arg(long, default_value = schemalock::DEFAULT_HISTORY_TABLE, global = true)]
    history_table: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run pending migrations
    Upgrade,
    /// Show migrations that an upgrade would run, without running them
    Pending,
    /// Show applied migrations
    History {
        /// Print the history as JSON
        #[arg(long)]
        json: bool,
    },
    /// List migration scripts found in the directory (no database required)
    List,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    // Parse args first - this allows --help to work without DATABASE_URL
    let args = CliArgs::parse();
    let source = DirSource::new(&args.dir);

    match &args.command {
        Commands::List => print!("{}", list(&source, &args.dir)?),
        Commands::Upgrade => {
            let report = migrator(&args, source)?.upgrade()?;
            println!(
                "Applied {} migration(s), {} already applied.",
                report.applied.len(),
                report.already_applied
            );
            for record in &report.applied {
                println!("  {} ({} ms)", record.name, record.duration_ms);
            }
        }
        Commands::Pending => {
            let pending = migrator(&args, source)?.pending()?;
            if pending.is_empty() {
                println!("Database is up to date.");
            } else {
                println!("Pending migrations ({}):", pending.len());
                for name in pending {
                    println!("  {}", name);
                }
            }
        }
        Commands::History { json } => {
            let history = migrator(&args, source)?.history()?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&history)?);
            } else if history.is_empty() {
                println!("No migrations applied.");
            } else {
                for record in history {
                    println!(
                        "  {}  {}  {} ms  {}",
                        record.started_at.format("%Y-%m-%d %H:%M:%S"),
                        record.name,
                        record.duration_ms,
                        record.checksum
                    );
                }
            }
        }
    }
    Ok(())
}

/// Lists the scripts in `dir` without touching a database.
fn list(source: &impl MigrationSource, dir: &str) -> anyhow::Result<String> {
    let names = source.list().context("failed to list migration scripts")?;
    if names.is_empty() {
        return Ok(format!("No migrations found in {}.\n", dir));
    }
    let mut out = format!("Migrations in {} ({}):\n", dir, names.len());
    for name in names {
        out.push_str(&format!("  {}\n", name));
    }
    Ok(out)
}

/// Connects to the database and configures a migrator from the arguments.
fn migrator(args: &CliArgs, source: DirSource) -> anyhow::Result<Migrator> {
    let url = args
        .database_url
        .as_deref()
        .context("no database given; pass --database-url or set DATABASE_URL")?;
    let db = connect(url, args.placeholders.clone())?;

    let mut migrator = Migrator::new(db, source)
        .with_statements(DefaultStatements::with_table_names(
            &args.lock_table,
            &args.history_table,
        ))
        .with_tick(Duration::from_millis(args.tick_ms))
        .with_timeout(Duration::from_secs(args.timeout_secs));
    if let Some(engine) = &args.engine {
        migrator = migrator.with_engine(engine);
    }
    Ok(migrator)
}

/// Opens the backend named by the URL scheme.
fn connect(url: &str, placeholders: Option<Dialect>) -> anyhow::Result<Box<dyn Database>> {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        return postgres(url, placeholders);
    }
    if url.starts_with("mysql://") {
        return mysql(url, placeholders);
    }
    sqlite(url.strip_prefix("sqlite:").unwrap_or(url), placeholders)
}

#[cfg(feature = "sqlite")]
fn sqlite(path: &str, placeholders: Option<Dialect>) -> anyhow::Result<Box<dyn Database>> {
    use schemalock::sqlite::SqliteDatabase;

    let mut db = if path == ":memory:" {
        SqliteDatabase::open_in_memory()
    } else {
        SqliteDatabase::open(path)
    }
    .with_context(|| format!("failed to open sqlite database {path}"))?;
    if let Some(dialect) = placeholders {
        db = db.with_dialect(dialect);
    }
    Ok(Box::new(db))
}

#[cfg(not(feature = "sqlite"))]
fn sqlite(_path: &str, _placeholders: Option<Dialect>) -> anyhow::Result<Box<dyn Database>> {
    bail!("sqlite support not compiled in; rebuild with the `sqlite` feature")
}

#[cfg(feature = "postgres")]
fn postgres(url: &str, placeholders: Option<Dialect>) -> anyhow::Result<Box<dyn Database>> {
    use schemalock::postgres::PostgresDatabase;

    let mut db = PostgresDatabase::connect(url).context("failed to connect to postgres")?;
    if let Some(dialect) = placeholders {
        db = db.with_dialect(dialect);
    }
    Ok(Box::new(db))
}

#[cfg(not(feature = "postgres"))]
fn postgres(_url: &str, _placeholders: Option<Dialect>) -> anyhow::Result<Box<dyn Database>> {
    bail!("postgres support not compiled in; rebuild with the `postgres` feature")
}

#[cfg(feature = "mysql")]
fn mysql(url: &str, placeholders: Option<Dialect>) -> anyhow::Result<Box<dyn Database>> {
    use schemalock::mysql::MysqlDatabase;

    let mut db = MysqlDatabase::connect(url).context("failed to connect to mysql")?;
    if let Some(dialect) = placeholders {
        db = db.with_dialect(dialect);
    }
    Ok(Box::new(db))
}

#[cfg(not(feature = "mysql"))]
fn mysql(_url: &str, _placeholders: Option<Dialect>) -> anyhow::Result<Box<dyn Database>> {
    bail!("mysql support not compiled in; rebuild with the `mysql` feature")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_parse_with_defaults() {
        let args = CliArgs::try_parse_from(["schemalock", "history", "--json"]).unwrap();
        assert_eq!(args.dir, "migrations");
        assert_eq!(args.tick_ms, 5_000);
        assert_eq!(args.lock_table, "schemalock_lock");
        assert!(matches!(args.command, Commands::History { json: true }));
    }

    #[test]
    fn placeholders_parse_into_dialects() {
        let args = CliArgs::try_parse_from([
            "schemalock",
            "--placeholders",
            "indexed:@p",
            "pending",
        ])
        .unwrap();
        assert_eq!(args.placeholders, Some(Dialect::Indexed("@p".to_string())));

        assert!(CliArgs::try_parse_from(["schemalock", "--placeholders", "%", "pending"]).is_err());
    }

    #[test]
    fn zero_tick_is_rejected() {
        assert!(CliArgs::try_parse_from(["schemalock", "--tick-ms", "0", "upgrade"]).is_err());
        let args = CliArgs::try_parse_from(["schemalock", "--tick-ms", "1", "upgrade"]).unwrap();
        assert_eq!(args.tick_ms, 1);
    }

    #[test]
    fn list_reads_directory_without_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        assert_eq!(
            list(&DirSource::new(path), path).unwrap(),
            format!("No migrations found in {}.\n", path)
        );

        std::fs::write(dir.path().join("02_b.sql"), "select 2;").unwrap();
        std::fs::write(dir.path().join("01_a.sql"), "select 1;").unwrap();
        assert_eq!(
            list(&DirSource::new(path), path).unwrap(),
            format!("Migrations in {} (2):\n  01_a.sql\n  02_b.sql\n", path)
        );
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn sqlite_urls_open_databases() {
        assert_eq!(connect("sqlite::memory:", None).unwrap().name(), "sqlite");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        let db = connect(path.to_str().unwrap(), Some(Dialect::Named)).unwrap();
        assert_eq!(db.dialect(), &Dialect::Named);
        assert!(path.exists());
    }
}
