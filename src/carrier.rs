//! Processes a session needs before it can run: nothing for Wayland, the X
//! server and its authorization cookie for Xorg.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::sys::stat::stat;
use nix::unistd::{chown, Gid, Pid, Uid};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::desktop::SessionEnv;
use crate::error::{Error, Result};
use crate::sysuser::Sysuser;
use crate::terminal;

const XORG: &str = "/usr/bin/Xorg";
const XAUTH: &str = "/usr/bin/xauth";
const MCOOKIE: &str = "/usr/bin/mcookie";
const XAUTH_FILE: &str = ".emptty-xauth";
const X_TMP_DIR: &str = "/tmp";
const MAX_DISPLAYS: u32 = 32;

const SOCKET_PROBES: u32 = 50;
const SOCKET_PROBE_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarrierState {
    Idle,
    Starting,
    Ready,
    Stopping,
    Stopped,
}

pub enum Carrier {
    /// Wayland compositors and carrier-less sessions bring their own display.
    Wayland,
    Xorg(XorgCarrier),
}

impl Carrier {
    pub fn for_env(env: SessionEnv, conf: &Config) -> Self {
        match env {
            SessionEnv::Xorg => Carrier::Xorg(XorgCarrier::new(conf)),
            SessionEnv::Wayland | SessionEnv::Custom | SessionEnv::UserCustom => Carrier::Wayland,
        }
    }

    pub async fn start(&mut self, user: &mut Sysuser) -> Result<()> {
        match self {
            Carrier::Wayland => Ok(()),
            Carrier::Xorg(xorg) => xorg.start(user).await,
        }
    }

    pub fn pid(&self) -> Option<Pid> {
        match self {
            Carrier::Wayland => None,
            Carrier::Xorg(xorg) => xorg.pid(),
        }
    }

    /// `DISPLAY` of the X server, if any.
    pub fn display(&self) -> Option<&str> {
        match self {
            Carrier::Wayland => None,
            Carrier::Xorg(xorg) => xorg.display.as_deref(),
        }
    }

    pub fn state(&self) -> CarrierState {
        match self {
            Carrier::Wayland => CarrierState::Idle,
            Carrier::Xorg(xorg) => xorg.state,
        }
    }

    pub async fn stop(&mut self) {
        if let Carrier::Xorg(xorg) = self {
            xorg.stop().await;
        }
    }
}

/// Owner and mode of the tty before it was handed to a rootless X server.
#[derive(Debug, Clone)]
struct TtyOwner {
    path: PathBuf,
    uid: Uid,
    gid: Gid,
    mode: u32,
}

impl TtyOwner {
    /// Record the current owner and mode of `path`, then chown it to `uid` with mode 0620.
    fn hand_over(path: &Path, uid: Uid) -> Result<Self> {
        let st = stat(path)?;
        let owner = Self {
            path: path.to_path_buf(),
            uid: Uid::from_raw(st.st_uid),
            gid: Gid::from_raw(st.st_gid),
            mode: st.st_mode & 0o7777,
        };

        chown(path, Some(uid), None)
            .map_err(|e| Error::Privilege(format!("chown {}: {}", path.display(), e)))?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o620))
            .map_err(|e| Error::Privilege(format!("chmod {}: {}", path.display(), e)))?;
        Ok(owner)
    }

    fn restore(self) {
        if let Err(e) = chown(&self.path, Some(self.uid), Some(self.gid)) {
            warn!(path = %self.path.display(), "cannot restore tty owner: {}", e);
        }
        if let Err(e) = fs::set_permissions(&self.path, fs::Permissions::from_mode(self.mode)) {
            warn!(path = %self.path.display(), "cannot restore tty mode: {}", e);
        }
    }
}

pub struct XorgCarrier {
    state: CarrierState,
    tty: u32,
    rootless: bool,
    default_xauthority: bool,
    extra_args: Vec<String>,
    tmp_dir: PathBuf,
    display: Option<String>,
    xauthority: Option<PathBuf>,
    tty_owner: Option<TtyOwner>,
    child: Option<Child>,
}

impl XorgCarrier {
    pub fn new(conf: &Config) -> Self {
        Self {
            state: CarrierState::Idle,
            tty: conf.tty,
            rootless: conf.rootless_xorg && conf.daemon_mode,
            default_xauthority: conf.default_xauthority,
            extra_args: conf.xorg_extra_args(),
            tmp_dir: PathBuf::from(X_TMP_DIR),
            display: None,
            xauthority: None,
            tty_owner: None,
            child: None,
        }
    }

    pub fn pid(&self) -> Option<Pid> {
        self.child
            .as_ref()
            .and_then(Child::id)
            .map(|id| Pid::from_raw(id as i32))
    }

    async fn start(&mut self, user: &mut Sysuser) -> Result<()> {
        self.state = CarrierState::Starting;
        match self.launch(user).await {
            Ok(()) => {
                self.state = CarrierState::Ready;
                info!(display = ?self.display, pid = ?self.pid(), "X server ready");
                Ok(())
            }
            Err(e) => {
                error!("cannot start X server: {}", e);
                Err(e)
            }
        }
    }

    async fn launch(&mut self, user: &mut Sysuser) -> Result<()> {
        self.prepare_xauthority(user)?;

        let number = free_display(&self.tmp_dir)
            .ok_or_else(|| Error::Carrier("no free display number".to_string()))?;
        let display_name = format!(":{}", number);
        user.setenv("DISPLAY", display_name.clone());
        self.display = Some(display_name.clone());
        debug!(display = %display_name, "Selected display");

        let cookie = run_as_user(user, MCOOKIE, &[]).await?;
        run_as_user(user, XAUTH, &["add", &display_name, ".", cookie.trim()]).await?;

        if self.rootless {
            self.take_tty(user)?;
        }

        let std_cmd = if self.rootless {
            user.command(XORG)
        } else {
            user.root_command(XORG)
        };
        let mut cmd = Command::from(std_cmd);
        cmd.args(self.xorg_args(&display_name));
        info!(display = %display_name, rootless = self.rootless, args = ?self.xorg_args(&display_name), "Starting Xorg");
        let child = cmd
            .spawn()
            .map_err(|e| Error::Carrier(format!("cannot spawn {}: {}", XORG, e)))?;
        self.child = Some(child);

        if !self.wait_ready(number).await {
            return Err(Error::Carrier(format!("X server on {} did not come up", display_name)));
        }
        Ok(())
    }

    fn prepare_xauthority(&mut self, user: &mut Sysuser) -> Result<()> {
        if self.default_xauthority {
            let path = user.homedir.join(".Xauthority");
            user.setenv("XAUTHORITY", path.to_string_lossy().into_owned());
            return Ok(());
        }

        let path = user.runtime_dir().join(XAUTH_FILE);
        match fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "Removed stale Xauthority"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::Carrier(format!(
                    "cannot remove stale {}: {}",
                    path.display(),
                    e
                )))
            }
        }
        user.setenv("XAUTHORITY", path.to_string_lossy().into_owned());
        self.xauthority = Some(path);
        Ok(())
    }

    fn xorg_args(&self, display: &str) -> Vec<String> {
        let mut args = Vec::with_capacity(self.extra_args.len() + 3);
        if self.rootless {
            args.push("-keeptty".to_string());
        }
        args.push(format!("vt{}", self.tty));
        args.push(display.to_string());
        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// Give the tty to the user (group kept, mode 0620) for a rootless server.
    fn take_tty(&mut self, user: &Sysuser) -> Result<()> {
        let path = terminal::tty_path(self.tty);
        self.tty_owner = Some(TtyOwner::hand_over(&path, user.uid)?);
        debug!(path = %path.display(), user = %user.username, "Handed tty to user");
        Ok(())
    }

    fn restore_tty(&mut self) {
        if let Some(owner) = self.tty_owner.take() {
            owner.restore();
        }
    }

    #[cfg(not(feature = "xlib"))]
    async fn wait_ready(&mut self, number: u32) -> bool {
        let socket = socket_path(&self.tmp_dir, number);
        for _ in 0..SOCKET_PROBES {
            if socket.exists() {
                return true;
            }
            if self.exited() {
                return false;
            }
            tokio::time::sleep(SOCKET_PROBE_INTERVAL).await;
        }
        socket.exists()
    }

    #[cfg(feature = "xlib")]
    async fn wait_ready(&mut self, number: u32) -> bool {
        let display = format!(":{}", number);
        for _ in 0..xlib::PROBES {
            if xlib::can_connect(&display) {
                return true;
            }
            if self.exited() {
                return false;
            }
            tokio::time::sleep(xlib::PROBE_INTERVAL).await;
        }
        false
    }

    fn exited(&mut self) -> bool {
        match self.child.as_mut().map(Child::try_wait) {
            Some(Ok(Some(status))) => {
                warn!(%status, "X server exited during startup");
                true
            }
            _ => false,
        }
    }

    async fn stop(&mut self) {
        if matches!(self.state, CarrierState::Idle | CarrierState::Stopped) && self.child.is_none() {
            self.remove_xauthority();
            self.restore_tty();
            return;
        }
        self.state = CarrierState::Stopping;

        if let Some(mut child) = self.child.take() {
            if let Some(pid) = child.id() {
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
                    debug!(pid, "cannot interrupt X server: {}", e);
                }
            }
            match child.wait().await {
                Ok(status) => info!(%status, "X server stopped"),
                Err(e) => warn!("waiting for X server failed: {}", e),
            }
        }

        self.remove_xauthority();
        self.restore_tty();
        self.state = CarrierState::Stopped;
    }

    fn remove_xauthority(&mut self) {
        let Some(path) = self.xauthority.take() else {
            return;
        };
        match fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "Removed Xauthority"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), "cannot remove Xauthority: {}", e),
        }
    }
}

/// Smallest display number below 32 without a `.X<n>-lock` file in `tmp_dir`.
fn free_display(tmp_dir: &Path) -> Option<u32> {
    (0..MAX_DISPLAYS).find(|i| !tmp_dir.join(format!(".X{}-lock", i)).exists())
}

fn socket_path(tmp_dir: &Path, number: u32) -> PathBuf {
    tmp_dir.join(".X11-unix").join(format!("X{}", number))
}

/// Run `program` as `user` and return its stdout.
async fn run_as_user(user: &Sysuser, program: &str, args: &[&str]) -> Result<String> {
    let mut cmd = Command::from(user.command(program));
    cmd.args(args).stdin(Stdio::null());
    let output = cmd
        .output()
        .await
        .map_err(|e| Error::Carrier(format!("cannot run {}: {}", program, e)))?;
    if !output.status.success() {
        return Err(Error::Carrier(format!(
            "{} failed with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(feature = "xlib")]
mod xlib {
    use std::ffi::CString;
    use std::time::Duration;

    use libc::{c_char, c_int, c_void};

    pub const PROBES: u32 = 50;
    pub const PROBE_INTERVAL: Duration = Duration::from_millis(50);

    #[link(name = "X11")]
    extern "C" {
        fn XOpenDisplay(display_name: *const c_char) -> *mut c_void;
        fn XCloseDisplay(display: *mut c_void) -> c_int;
    }

    pub fn can_connect(display: &str) -> bool {
        let Ok(name) = CString::new(display) else {
            return false;
        };
        let handle = unsafe { XOpenDisplay(name.as_ptr()) };
        if handle.is_null() {
            return false;
        }
        unsafe { XCloseDisplay(handle) };
        true
    }
}
