use tracing::warn;

use crate::config::CairnConfig;
use crate::error::CairnError;
use crate::progress::ProgressSink;

/// Process-wide maintenance state threaded through the pipeline: the
/// accumulated error count and the progress sink.
///
/// Errors are non-fatal at the shard level: they are logged, counted, and
/// the pass moves on. The final count decides the exit status.
pub struct MaintenanceContext<'a> {
    pub config: &'a CairnConfig,
    pub progress: &'a mut dyn ProgressSink,
    errors: u64,
}

impl<'a> MaintenanceContext<'a> {
    pub fn new(config: &'a CairnConfig, progress: &'a mut dyn ProgressSink) -> Self {
        MaintenanceContext {
            config,
            progress,
            errors: 0,
        }
    }

    /// Log and count a non-fatal error.
    pub fn record(&mut self, err: CairnError) {
        warn!("{err}");
        self.errors += 1;
    }

    pub fn errors(&self) -> u64 {
        self.errors
    }
}
