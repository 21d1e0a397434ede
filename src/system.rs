//! OS power control.
//!
//! Shutdown and restart shell out to `systemctl` on Linux; every other
//! platform reports the capability as unavailable so the control surface can
//! say so instead of failing mid-operation.

use crate::error::Result;

/// Handle to the host's power management.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemControl;

impl SystemControl {
    pub fn new() -> Self {
        Self
    }

    /// Whether shutdown/restart is available on this host.
    pub fn available(&self) -> bool {
        imp::AVAILABLE
    }

    /// Power the host off, or reboot it when `restart` is set.
    pub fn shutdown(&self, restart: bool) -> Result<()> {
        imp::shutdown(restart)
    }
}

#[cfg(target_os = "linux")]
mod imp {
    use crate::error::{Error, Result};
    use std::process::Command;

    pub const AVAILABLE: bool = true;

    pub fn shutdown(restart: bool) -> Result<()> {
        let verb = if restart { "reboot" } else { "poweroff" };
        log::warn!("invoking systemctl {}", verb);
        let status = Command::new("systemctl").arg(verb).status()?;
        if !status.success() {
            return Err(Error::UnsupportedSystem(format!(
                "systemctl {} exited with {}",
                verb, status
            )));
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use crate::error::{Error, Result};

    pub const AVAILABLE: bool = false;

    pub fn shutdown(_restart: bool) -> Result<()> {
        Err(Error::UnsupportedSystem(
            "no power control on this platform".to_string(),
        ))
    }
}
