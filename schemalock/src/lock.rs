//! The cross-process advisory lock.
//!
//! Holding the lock means owning the single row (id 1) of the lock table.
//! The primary key makes a second insert fail, so acquisition is a plain
//! insert and release is a delete.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::db::Database;
use crate::error::{AbortCause, DbError, Error};
use crate::log::{Logger, TracingLogger};
use crate::statements::Statements;
use crate::tx::{Scope, TxOptions};

pub const LOCK_ID: i64 = 1;
pub const DEFAULT_TICK: Duration = Duration::from_secs(5);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Shorter ticks, including zero, are raised to this.
pub const MIN_TICK: Duration = Duration::from_millis(1);

/// The lock row: who holds it and since when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub id: i64,
    pub hostname: String,
    pub pid: u32,
    pub since: DateTime<Utc>,
}

impl Lock {
    /// A lock owned by this process.
    pub fn new(since: DateTime<Utc>) -> std::io::Result<Self> {
        Ok(Self {
            id: LOCK_ID,
            hostname: hostname::get()?.to_string_lossy().into_owned(),
            pid: std::process::id(),
            since,
        })
    }
}

impl fmt::Display for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lock from host {} by PID {} since {}",
            self.hostname, self.pid, self.since
        )
    }
}

/// Acquires and releases the lock row.
pub struct LockManager<'a> {
    db: &'a dyn Database,
    statements: &'a dyn Statements,
    clock: &'a dyn Clock,
    logger: &'a dyn Logger,
    tick: Duration,
    timeout: Duration,
    cancel: Option<CancellationToken>,
    watch_signals: bool,
}

impl fmt::Debug for LockManager<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("lock_table", &self.statements.lock_table())
            .field("tick", &self.tick)
            .field("timeout", &self.timeout)
            .field("cancel", &self.cancel.is_some())
            .field("watch_signals", &self.watch_signals)
            .finish()
    }
}

enum Wake {
    Cancelled,
    Signal(&'static str),
    Tick,
}

impl<'a> LockManager<'a> {
    pub fn new(db: &'a dyn Database, statements: &'a dyn Statements) -> Self {
        Self {
            db,
            statements,
            clock: &SystemClock,
            logger: &TracingLogger,
            tick: DEFAULT_TICK,
            timeout: DEFAULT_TIMEOUT,
            cancel: None,
            watch_signals: true,
        }
    }

    pub fn with_clock(mut self, clock: &'a dyn Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_logger(mut self, logger: &'a dyn Logger) -> Self {
        self.logger = logger;
        self
    }

    /// How often to retry while another process holds the lock. At least
    /// [`MIN_TICK`].
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// How long to keep retrying before giving up.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Abort the wait when `token` is cancelled.
    pub fn with_cancellation(mut self, token: Option<CancellationToken>) -> Self {
        self.cancel = token;
        self
    }

    /// Abort the wait on SIGINT, SIGTERM or SIGQUIT (Ctrl-C elsewhere).
    /// On by default.
    pub fn with_signal_handling(mut self, enabled: bool) -> Self {
        self.watch_signals = enabled;
        self
    }

    /// One insert attempt. Any failure, including a duplicate key, means the
    /// lock was not taken.
    pub fn try_lock(&self, lock: &Lock) -> bool {
        self.logger.log("Acquiring lock...");
        let result: Result<u64, DbError> = Scope::root(self.db)
            .ensure_transaction(Some(&TxOptions::default()), |scope| {
                scope.exec(&self.statements.lock(lock))
            });

        match result {
            Ok(_) => {
                self.logger.log("Lock successfully acquired");
                true
            }
            Err(err) => {
                tracing::debug!(error = %err, "Lock not acquired");
                false
            }
        }
    }

    /// Takes the lock, polling every tick while it is held elsewhere.
    ///
    /// Fails with [`Error::LockTimeout`] once more than the timeout has
    /// elapsed on the clock, or [`Error::LockAborted`] as soon as the
    /// cancellation token fires or a termination signal arrives.
    pub fn acquire(&self) -> Result<Lock, Error> {
        let start = self.clock.now();
        let mut lock = Lock::new(start).map_err(Error::LockOwner)?;

        if self.try_lock(&lock) {
            return Ok(lock);
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(Error::LockWait)?;
        let _context = runtime.enter();

        let tick = self.tick.max(MIN_TICK);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);
        // After a slow attempt the next one waits a full tick, with no catch-up burst.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut signals = if self.watch_signals {
            Some(Signals::new().map_err(Error::LockWait)?)
        } else {
            None
        };

        loop {
            let wake = runtime.block_on(async {
                tokio::select! {
                    biased;
                    _ = cancelled(self.cancel.as_ref()) => Wake::Cancelled,
                    name = next_signal(signals.as_mut()) => Wake::Signal(name),
                    _ = ticker.tick() => Wake::Tick,
                }
            });

            match wake {
                Wake::Cancelled => return Err(Error::LockAborted(AbortCause::Cancelled)),
                Wake::Signal(name) => return Err(Error::LockAborted(AbortCause::Signal(name))),
                Wake::Tick => {
                    lock.since = self.clock.now();
                    let elapsed = (lock.since - start).to_std().unwrap_or_default();
                    tracing::debug!(?elapsed, "Lock poll");
                    if elapsed > self.timeout {
                        return Err(Error::LockTimeout(self.timeout));
                    }
                    if self.try_lock(&lock) {
                        return Ok(lock);
                    }
                }
            }
        }
    }

    /// Deletes the lock row.
    pub fn release(&self, lock: &Lock) -> Result<(), Error> {
        self.logger.log("Freeing lock...");
        Scope::root(self.db)
            .ensure_transaction(Some(&TxOptions::default()), |scope| {
                scope.exec(&self.statements.unlock(lock))
            })
            .map_err(Error::LockRelease)?;
        self.logger.log("Lock successfully freed");
        Ok(())
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn next_signal(signals: Option<&mut Signals>) -> &'static str {
    match signals {
        Some(signals) => signals.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
struct Signals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            Some(()) = self.interrupt.recv() => "SIGINT",
            Some(()) = self.terminate.recv() => "SIGTERM",
            Some(()) = self.quit.recv() => "SIGQUIT",
            else => std::future::pending().await,
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn new() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> &'static str {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "Ctrl-C",
            Err(_) => std::future::pending().await,
        }
    }
}
