//! Kernel-facing log sink.
//!
//! State transitions and connection failures are reported through a
//! [`KernelLog`] held by the client instead of a process-wide logger, so
//! embedders can route them (tests capture them). [`TracingLog`] is the
//! default and forwards to `tracing` under the `kernlet::kernel` target.

use tracing::Level;

pub trait KernelLog: Send + Sync {
    fn log(&self, level: Level, message: &str);
}

/// Forwards to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLog;

impl KernelLog for TracingLog {
    fn log(&self, level: Level, message: &str) {
        match level {
            Level::ERROR => tracing::error!(target: "kernlet::kernel", "{message}"),
            Level::WARN => tracing::warn!(target: "kernlet::kernel", "{message}"),
            Level::INFO => tracing::info!(target: "kernlet::kernel", "{message}"),
            Level::DEBUG => tracing::debug!(target: "kernlet::kernel", "{message}"),
            _ => tracing::trace!(target: "kernlet::kernel", "{message}"),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::memory::MemoryLog;
    use super::*;

    #[test]
    fn tracing_log_accepts_every_level() {
        let log = TracingLog;
        for level in [Level::ERROR, Level::WARN, Level::INFO, Level::DEBUG, Level::TRACE] {
            log.log(level, "Kernel: idle (abc)");
        }
    }

    #[test]
    fn memory_log_records_in_order() {
        let log = MemoryLog::default();
        log.log(Level::INFO, "Kernel: starting (k1)");
        log.log(Level::DEBUG, "Kernel: busy (k1)");
        assert_eq!(log.entries().len(), 2);
        assert!(log.contains(Level::DEBUG, "busy"));
        assert!(!log.contains(Level::INFO, "busy"));
    }
}
