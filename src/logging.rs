use std::sync::{Arc, Mutex};

// check the channel before paying for the format!
macro_rules! log {
    ($log:expr, $($arg:tt)*) => {
        $log.log(&format!($($arg)*));
    };
}
macro_rules! verbose {
    ($log:expr, $($arg:tt)*) => {
        if $log.verbose_enabled() {
            $log.log(&format!($($arg)*));
        }
    };
}
macro_rules! debug {
    ($log:expr, $($arg:tt)*) => {
        if $log.debug_enabled() {
            $log.log(&format!($($arg)*));
        }
    };
}

pub(crate) use debug;
pub(crate) use log;
pub(crate) use verbose;

/// Console printer for user facing cook and replay output.
///
/// Lines are routed through the active progress bar (if any) so the bar is redrawn below them.
/// Diagnostics meant for developers go through `tracing` instead.
#[derive(Clone, Default)]
pub struct Log {
    verbose: bool,
    debug: bool,
    quiet: bool,
    progress: Arc<Mutex<Option<indicatif::ProgressBar>>>,
}
impl Log {
    pub fn new(verbose: bool, debug: bool) -> Self {
        Self {
            verbose,
            debug,
            quiet: false,
            progress: Default::default(),
        }
    }
    /// Swallows every line, used by tests and worker processes
    pub fn quiet() -> Self {
        Self {
            quiet: true,
            ..Default::default()
        }
    }
    pub fn set_progress(&self, progress: Option<&indicatif::ProgressBar>) {
        *self.progress.lock().unwrap() = progress.cloned();
    }
    pub fn progress(&self) -> Option<indicatif::ProgressBar> {
        self.progress.lock().unwrap().clone()
    }
    pub fn log(&self, msg: &str) {
        if self.quiet {
            return;
        }
        if let Some(progress) = self.progress.lock().unwrap().as_ref() {
            progress.println(msg);
        } else {
            println!("{msg}");
        }
    }
    pub fn verbose_enabled(&self) -> bool {
        self.verbose || self.debug
    }
    pub fn debug_enabled(&self) -> bool {
        self.debug
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_channels() {
        let log = Log::new(false, true);
        assert!(log.verbose_enabled());
        assert!(log.debug_enabled());
        let quiet = Log::quiet();
        assert!(!quiet.verbose_enabled());
        log!(quiet, "dropped {}", 1);
    }
}
