//! Per-session message bus started through `dbus-launch`.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::sysuser::Sysuser;

const DBUS_LAUNCH: &str = "dbus-launch";

/// A running session bus; its address is exported into the user environment.
#[derive(Debug)]
pub struct DBusLauncher {
    address: String,
    pid: Option<Pid>,
}

impl DBusLauncher {
    /// Start the bus as `user` and export `DBUS_SESSION_BUS_ADDRESS` and `DBUS_SESSION_BUS_PID`.
    pub fn launch(user: &mut Sysuser) -> Result<Self> {
        let output = user
            .command(DBUS_LAUNCH)
            .output()
            .map_err(|e| Error::Session(format!("cannot run {}: {}", DBUS_LAUNCH, e)))?;
        if !output.status.success() {
            return Err(Error::Session(format!(
                "{} exited with {}",
                DBUS_LAUNCH, output.status
            )));
        }

        let launcher = Self::parse(&String::from_utf8_lossy(&output.stdout))?;
        user.setenv("DBUS_SESSION_BUS_ADDRESS", launcher.address());
        if let Some(pid) = launcher.pid() {
            user.setenv("DBUS_SESSION_BUS_PID", pid.to_string());
        }
        info!(address = %launcher.address(), pid = ?launcher.pid(), "Started session bus");
        Ok(launcher)
    }

    fn parse(output: &str) -> Result<Self> {
        let mut address = None;
        let mut pid = None;
        for line in output.lines() {
            let Some((key, value)) = line.trim().split_once('=') else {
                continue;
            };
            let value = value.trim().trim_end_matches(';').trim_matches('\'');
            match key {
                "DBUS_SESSION_BUS_ADDRESS" => address = Some(value.to_string()),
                "DBUS_SESSION_BUS_PID" => pid = value.parse::<i32>().ok().map(Pid::from_raw),
                _ => {}
            }
        }
        let address = address.ok_or_else(|| {
            Error::Session(format!("{} printed no bus address", DBUS_LAUNCH))
        })?;
        Ok(Self { address, pid })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// Interrupt the bus daemon.
    pub fn stop(self) {
        let Some(pid) = self.pid else {
            return;
        };
        match kill(pid, Signal::SIGINT) {
            Ok(()) => debug!(%pid, "Stopped session bus"),
            Err(e) => warn!(%pid, "cannot stop session bus: {}", e),
        }
    }
}
