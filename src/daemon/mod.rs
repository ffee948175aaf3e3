//! Sniffer Daemon module
//!
//! This module contains the daemon side of the sniffer: the event loop,
//! capture and control sockets, configuration management and the
//! orchestrator tying them together.

pub mod core;
pub mod io;
pub mod event;
pub mod config;

// Re-export main types
pub use self::core::{classify, CaptureStats, Sniffer, SnifferContext, SnifferStatus};
pub use self::io::{CaptureSocket, ControlSocket, FrameSource, IoStats};
pub use event::{EventLoop, Interest, LoopStats, TimerId};
pub use config::{ConfigManager, DaemonConfig, ValidationResult};

use crate::{Result, SnifferError};
use std::path::Path;

/// Daemon utilities
pub struct DaemonUtils;

impl DaemonUtils {
    /// Check if daemon is running as root
    pub fn is_privileged() -> bool {
        unsafe { libc::geteuid() == 0 }
    }

    /// Get daemon process ID
    pub fn get_pid() -> u32 {
        std::process::id()
    }

    /// Create PID file
    pub fn create_pid_file(path: &Path) -> Result<()> {
        use std::io::Write;

        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", Self::get_pid())?;
        Ok(())
    }

    /// Remove PID file
    pub fn remove_pid_file(path: &Path) -> Result<()> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Check if the process named in a PID file is alive
    pub fn is_daemon_running(pid_path: &Path) -> Result<bool> {
        if !pid_path.exists() {
            return Ok(false);
        }

        let pid_str = std::fs::read_to_string(pid_path)?;
        let pid = pid_str
            .trim()
            .parse::<u32>()
            .map_err(|_| SnifferError::Config("Invalid PID in pid file".to_string()))?;

        Ok(Self::is_process_running(pid))
    }

    /// Check if process is running
    pub fn is_process_running(pid: u32) -> bool {
        match libc::pid_t::try_from(pid) {
            Ok(pid) if pid > 0 => unsafe { libc::kill(pid, 0) == 0 },
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_utils() {
        let pid = DaemonUtils::get_pid();
        assert!(pid > 0);
        assert!(DaemonUtils::is_process_running(pid));
        assert!(!DaemonUtils::is_process_running(0));
    }

    #[test]
    fn test_pid_file() {
        let path = std::env::temp_dir().join(format!("airsniff-{}.pid", std::process::id()));
        assert!(!DaemonUtils::is_daemon_running(&path).unwrap());

        DaemonUtils::create_pid_file(&path).unwrap();
        assert!(DaemonUtils::is_daemon_running(&path).unwrap());

        DaemonUtils::remove_pid_file(&path).unwrap();
        assert!(!path.exists());
        DaemonUtils::remove_pid_file(&path).unwrap();

        std::fs::write(&path, "not a pid").unwrap();
        assert!(DaemonUtils::is_daemon_running(&path).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
