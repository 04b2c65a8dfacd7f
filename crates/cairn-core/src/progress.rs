//! Progress reporting.
//!
//! The engine reports phase transitions and within-phase counts through a
//! sink interface; the binary installs the wire-protocol implementation the
//! scheduler parses, `-p` installs the silent one, and tests capture.

use std::io::Write;

/// Sink for progress events.
pub trait ProgressSink {
    /// Announce this process at startup.
    fn start(&mut self) {}

    /// A phase transition.
    fn state(&mut self, label: &str);

    /// Position within the current phase.
    fn file_count(&mut self, current: usize, total: usize);

    /// Announce completion at exit.
    fn finish(&mut self) {}
}

/// The line protocol consumed by the scheduler, written to stdout.
#[derive(Debug, Default)]
pub struct ProtocolProgress;

impl ProgressSink for ProtocolProgress {
    fn start(&mut self) {
        println!("xferPids {}", std::process::id());
        let _ = std::io::stdout().flush();
    }

    fn state(&mut self, label: &str) {
        println!("__bpc_progress_state__ {label}");
        let _ = std::io::stdout().flush();
    }

    fn file_count(&mut self, current: usize, total: usize) {
        println!("__bpc_progress_fileCnt__ {current}/{total}");
        let _ = std::io::stdout().flush();
    }

    fn finish(&mut self) {
        println!("xferPids");
        let _ = std::io::stdout().flush();
    }
}

/// Progress suppression (`-p`).
#[derive(Debug, Default)]
pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn state(&mut self, _label: &str) {}
    fn file_count(&mut self, _current: usize, _total: usize) {}
}
