//! Process-wide cleanup registry and signal-driven shutdown.
//!
//! Every spawned child process is tracked here so that SIGINT/SIGTERM can
//! terminate the whole tree before the orchestrator exits. Components with
//! pending writes register flush callbacks. Cleanup is idempotent and
//! tolerates partial completion.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Grace period between graceful termination and forced kill.
const KILL_GRACE: Duration = Duration::from_secs(1);

type CleanupCallback = Box<dyn FnOnce() + Send>;

/// Registry of child processes and cleanup callbacks.
///
/// Constructed once at startup and passed by reference; there are no
/// hidden globals.
#[derive(Default)]
pub struct CleanupRegistry {
    children: Mutex<HashMap<u32, String>>,
    callbacks: Mutex<Vec<CleanupCallback>>,
    ran: AtomicBool,
}

impl CleanupRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks a spawned child process for cleanup.
    pub fn register_child(&self, pid: u32, label: impl Into<String>) {
        let mut children = self.children.lock().expect("lock poisoned");
        children.insert(pid, label.into());
    }

    /// Removes a child that exited on its own.
    pub fn unregister_child(&self, pid: u32) {
        let mut children = self.children.lock().expect("lock poisoned");
        children.remove(&pid);
    }

    /// Registers a callback to run during shutdown (flushes, lock release).
    pub fn register_callback(&self, callback: impl FnOnce() + Send + 'static) {
        let mut callbacks = self.callbacks.lock().expect("lock poisoned");
        callbacks.push(Box::new(callback));
    }

    /// Number of currently tracked children.
    #[must_use]
    pub fn tracked_children(&self) -> usize {
        self.children.lock().expect("lock poisoned").len()
    }

    /// Runs cleanup: kills tracked children (graceful, then forced after a
    /// grace period), then drains registered callbacks. Safe to call more
    /// than once; only the first call does work.
    pub fn run(&self) {
        if self.ran.swap(true, Ordering::SeqCst) {
            return;
        }

        let children: Vec<u32> = {
            let mut guard = self.children.lock().expect("lock poisoned");
            guard.drain().map(|(pid, _)| pid).collect()
        };

        for pid in &children {
            terminate_gracefully(*pid);
        }
        if !children.is_empty() {
            std::thread::sleep(KILL_GRACE);
            for pid in &children {
                kill_forcefully(*pid);
            }
        }

        let callbacks: Vec<CleanupCallback> = {
            let mut guard = self.callbacks.lock().expect("lock poisoned");
            std::mem::take(&mut *guard)
        };
        for callback in callbacks {
            callback();
        }
    }

}

/// Installs SIGINT/SIGTERM handlers that drain the registry and exit.
///
/// # Errors
/// Returns an error if a handler is already installed for this process.
pub fn install_signal_handler(registry: Arc<CleanupRegistry>) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        registry.run();
        std::process::exit(130);
    })
}

#[cfg(unix)]
fn terminate_gracefully(pid: u32) {
    // SAFETY: plain kill(2) on a pid we spawned; ESRCH is fine.
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
}

#[cfg(unix)]
fn kill_forcefully(pid: u32) {
    // SAFETY: as above.
    unsafe {
        if libc::kill(pid as i32, 0) == 0 {
            libc::kill(pid as i32, libc::SIGKILL);
        }
    }
}

#[cfg(windows)]
fn terminate_gracefully(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T"])
        .output();
}

#[cfg(windows)]
fn kill_forcefully(pid: u32) {
    // Process-tree kill; covers children the engine may have spawned.
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .output();
}
