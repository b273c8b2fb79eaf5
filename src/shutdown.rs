//! Cooperative shutdown token.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;

/// Checked by the reactor at every loop iteration. Clones share one flag.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Shutdown::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Routes SIGINT and SIGTERM to this token. Every token registered this
    /// way is set by either signal.
    pub fn install_signal_handlers(&self) -> io::Result<()> {
        for signal in [SIGINT, SIGTERM] {
            flag::register(signal, Arc::clone(&self.flag))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let shutdown = Shutdown::new();
        let observer = shutdown.clone();
        assert!(!observer.is_triggered());
        shutdown.trigger();
        assert!(observer.is_triggered());
    }

    #[test]
    fn sigterm_sets_every_registered_token() {
        let first = Shutdown::new();
        let second = Shutdown::new();
        first.install_signal_handlers().unwrap();
        second.install_signal_handlers().unwrap();

        signal_hook::low_level::raise(SIGTERM).unwrap();
        assert!(first.is_triggered());
        assert!(second.is_triggered());
    }
}
