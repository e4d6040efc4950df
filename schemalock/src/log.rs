/// Receives human-readable progress lines from the migrator.
pub trait Logger: Send + Sync {
    fn log(&self, line: &str);
}

/// Forwards every line to [`tracing::info!`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, line: &str) {
        tracing::info!("{line}");
    }
}

impl<T: Logger + ?Sized> Logger for std::sync::Arc<T> {
    fn log(&self, line: &str) {
        (**self).log(line)
    }
}
