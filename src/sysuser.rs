//! The authenticated user: identity, per-session environment and helpers to
//! act under that identity.

use std::collections::BTreeMap;
use std::env;
use std::ffi::{CString, OsStr};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::unistd::{chown, getgrouplist, setgid, setgroups, setuid, Gid, Uid, User};
use tracing::{debug, info};

use crate::config::Config;
use crate::desktop::SessionDescriptor;
use crate::error::{Error, Result};

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/bin:/bin";

#[derive(Debug, Clone)]
pub struct Sysuser {
    pub username: String,
    pub homedir: PathBuf,
    pub shell: String,
    pub uid: Uid,
    pub gid: Gid,
    pub gids: Vec<Gid>,
    env: BTreeMap<String, String>,
}

impl Sysuser {
    pub fn new(
        username: impl Into<String>,
        homedir: impl Into<PathBuf>,
        shell: impl Into<String>,
        uid: Uid,
        gid: Gid,
        gids: Vec<Gid>,
    ) -> Self {
        Self {
            username: username.into(),
            homedir: homedir.into(),
            shell: shell.into(),
            uid,
            gid,
            gids,
            env: BTreeMap::new(),
        }
    }

    /// Resolve `name` through the system user database.
    pub fn lookup(name: &str) -> Result<Self> {
        let user = User::from_name(name)?
            .ok_or_else(|| Error::Auth(format!("unknown user '{}'", name)))?;
        let cname = CString::new(name).map_err(|_| Error::Auth("invalid username".to_string()))?;
        let gids = getgrouplist(&cname, user.gid)?;
        let shell = login_shell(name).unwrap_or_else(|| user.shell.to_string_lossy().into_owned());

        debug!(user = name, uid = %user.uid, gid = %user.gid, groups = gids.len(), "Resolved user");
        Ok(Self::new(name, user.dir, shell, user.uid, user.gid, gids))
    }

    pub fn setenv(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    pub fn getenv(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// `XDG_RUNTIME_DIR` as staged, or `/run/user/<uid>`.
    pub fn runtime_dir(&self) -> PathBuf {
        self.getenv("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(format!("/run/user/{}", self.uid)))
    }

    /// Fill the session environment. Variables already present (exported by
    /// the authenticator) are kept unless assigned unconditionally here.
    pub fn stage_environment(&mut self, conf: &Config, desc: &SessionDescriptor, lang: &str) {
        let home = self.homedir.to_string_lossy().into_owned();
        let username = self.username.clone();

        self.setenv("HOME", home.clone());
        self.setenv("PWD", home.clone());
        self.setenv("USER", username.clone());
        self.setenv("LOGNAME", username);
        self.setenv("UID", self.uid.to_string());
        self.setenv("SHELL", self.shell.clone());
        self.setenv("LANG", lang);
        self.setenv(
            "PATH",
            env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string()),
        );

        if conf.no_xdg_fallback {
            return;
        }

        let session = desc.effective();
        if !self.env.contains_key("XDG_CONFIG_HOME") {
            self.setenv("XDG_CONFIG_HOME", format!("{}/.config", home));
        }
        if !self.env.contains_key("XDG_RUNTIME_DIR") {
            self.setenv("XDG_RUNTIME_DIR", format!("/run/user/{}", self.uid));
        }
        self.setenv("XDG_SEAT", "seat0");
        self.setenv("XDG_SESSION_CLASS", "user");
        self.setenv("XDG_SESSION_TYPE", session.env.session_type());
        self.setenv("DESKTOP_SESSION", session.desktop_name());
        self.setenv("XDG_SESSION_DESKTOP", session.desktop_name());
        if !session.desktop_names.is_empty() {
            self.setenv("XDG_CURRENT_DESKTOP", session.desktop_names.join(":"));
        }
    }

    /// Create `XDG_RUNTIME_DIR` (0700, owned by the user) if it does not exist yet.
    pub fn ensure_runtime_dir(&self) -> Result<()> {
        if self.getenv("XDG_RUNTIME_DIR").is_none() {
            return Ok(());
        }
        let dir = self.runtime_dir();
        if dir.exists() {
            return Ok(());
        }
        fs::create_dir_all(&dir)
            .map_err(|e| Error::Privilege(format!("mkdir {}: {}", dir.display(), e)))?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))
            .map_err(|e| Error::Privilege(format!("chmod {}: {}", dir.display(), e)))?;
        chown(&dir, Some(self.uid), Some(self.gid))
            .map_err(|e| Error::Privilege(format!("chown {}: {}", dir.display(), e)))?;
        info!(path = %dir.display(), "Created runtime directory");
        Ok(())
    }

    /// A command that runs with this user's environment, home directory and
    /// credentials. Groups, gid and uid are switched in the forked child.
    pub fn command(&self, program: impl AsRef<OsStr>) -> Command {
        let mut cmd = Command::new(program);
        cmd.env_clear().envs(self.env()).current_dir(&self.homedir);

        let (uid, gid, gids) = (self.uid, self.gid, self.gids.clone());
        unsafe {
            cmd.pre_exec(move || drop_privileges(uid, gid, &gids));
        }
        cmd
    }

    /// A root command that still sees the session environment.
    pub fn root_command(&self, program: impl AsRef<OsStr>) -> Command {
        let mut cmd = Command::new(program);
        cmd.env_clear().envs(self.env());
        cmd
    }

    /// Switch the filesystem uid/gid of this thread to the user until the guard drops.
    pub fn assume_fs_identity(&self) -> Result<FsIdentity> {
        FsIdentity::switch(self.uid, self.gid)
    }
}

fn drop_privileges(uid: Uid, gid: Gid, gids: &[Gid]) -> io::Result<()> {
    setgroups(gids)?;
    setgid(gid)?;
    setuid(uid)?;
    Ok(())
}

/// Login shell as reported by `getent passwd <name>` (field 7).
fn login_shell(name: &str) -> Option<String> {
    let output = Command::new("getent").args(["passwd", name]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    parse_passwd_shell(&String::from_utf8_lossy(&output.stdout))
}

fn parse_passwd_shell(line: &str) -> Option<String> {
    line.lines()
        .next()?
        .split(':')
        .nth(6)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Previous filesystem identity, restored on drop.
pub struct FsIdentity {
    uid: u32,
    gid: u32,
}

impl FsIdentity {
    fn switch(uid: Uid, gid: Gid) -> Result<Self> {
        let prev_gid = unsafe { libc::setfsgid(gid.as_raw()) } as u32;
        let prev_uid = unsafe { libc::setfsuid(uid.as_raw()) } as u32;
        let guard = Self {
            uid: prev_uid,
            gid: prev_gid,
        };

        // The calls report the previous value only; read back to verify.
        let now_uid = unsafe { libc::setfsuid(u32::MAX) } as u32;
        let now_gid = unsafe { libc::setfsgid(u32::MAX) } as u32;
        if now_uid != uid.as_raw() || now_gid != gid.as_raw() {
            return Err(Error::Privilege(format!(
                "setfsuid({})/setfsgid({}) refused",
                uid, gid
            )));
        }
        Ok(guard)
    }
}

impl Drop for FsIdentity {
    fn drop(&mut self) {
        unsafe {
            libc::setfsuid(self.uid);
            libc::setfsgid(self.gid);
        }
    }
}

/// Write `content` to `path` as `user`, creating parent directories, mode 0600.
pub fn write_as_user(user: &Sysuser, path: &Path, content: &str) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let _identity = user.assume_fs_identity()?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desktop::{SessionDescriptor, SessionEnv};

    fn alice() -> Sysuser {
        Sysuser::new(
            "alice",
            "/home/alice",
            "/bin/zsh",
            Uid::from_raw(1000),
            Gid::from_raw(1000),
            vec![Gid::from_raw(1000), Gid::from_raw(10)],
        )
    }

    #[test]
    fn stages_unconditional_and_xdg_variables() {
        let mut user = alice();
        let desc = SessionDescriptor::new("Sway", "sway", SessionEnv::Wayland, "/usr/share/wayland-sessions/sway.desktop");
        user.stage_environment(&Config::default(), &desc, "cs_CZ.UTF-8");

        assert_eq!(user.getenv("HOME"), Some("/home/alice"));
        assert_eq!(user.getenv("PWD"), Some("/home/alice"));
        assert_eq!(user.getenv("USER"), Some("alice"));
        assert_eq!(user.getenv("LOGNAME"), Some("alice"));
        assert_eq!(user.getenv("UID"), Some("1000"));
        assert_eq!(user.getenv("SHELL"), Some("/bin/zsh"));
        assert_eq!(user.getenv("LANG"), Some("cs_CZ.UTF-8"));
        assert_eq!(user.getenv("XDG_CONFIG_HOME"), Some("/home/alice/.config"));
        assert_eq!(user.getenv("XDG_RUNTIME_DIR"), Some("/run/user/1000"));
        assert_eq!(user.getenv("XDG_SEAT"), Some("seat0"));
        assert_eq!(user.getenv("XDG_SESSION_CLASS"), Some("user"));
        assert_eq!(user.getenv("XDG_SESSION_TYPE"), Some("wayland"));
        assert_eq!(user.getenv("DESKTOP_SESSION"), Some("sway"));
        assert_eq!(user.getenv("XDG_SESSION_DESKTOP"), Some("sway"));
        assert!(user.getenv("PATH").is_some());
    }

    #[test]
    fn no_xdg_fallback_sets_no_xdg_variables() {
        let mut user = alice();
        let conf = Config {
            no_xdg_fallback: true,
            ..Config::default()
        };
        let desc = SessionDescriptor::new("i3", "i3", SessionEnv::Xorg, "/usr/share/xsessions/i3.desktop");
        user.stage_environment(&conf, &desc, "en_US.UTF-8");

        assert!(user.env().keys().all(|k| !k.starts_with("XDG_")));
        assert!(user.getenv("DESKTOP_SESSION").is_none());
        assert_eq!(user.getenv("HOME"), Some("/home/alice"));
    }

    #[test]
    fn authenticator_variables_are_kept_but_unconditional_ones_win() {
        let mut user = alice();
        user.setenv("XDG_RUNTIME_DIR", "/run/user/custom");
        user.setenv("HOME", "/wrong");
        user.setenv("MAIL", "/var/mail/alice");
        let desc = SessionDescriptor::new("i3", "i3", SessionEnv::Xorg, "/usr/share/xsessions/i3.desktop");
        user.stage_environment(&Config::default(), &desc, "en_US.UTF-8");

        assert_eq!(user.getenv("XDG_RUNTIME_DIR"), Some("/run/user/custom"));
        assert_eq!(user.getenv("HOME"), Some("/home/alice"));
        assert_eq!(user.getenv("MAIL"), Some("/var/mail/alice"));
        assert_eq!(user.getenv("XDG_SESSION_TYPE"), Some("x11"));
        assert_eq!(user.runtime_dir(), PathBuf::from("/run/user/custom"));
    }

    #[test]
    fn passwd_shell_field() {
        assert_eq!(
            parse_passwd_shell("alice:x:1000:1000:Alice:/home/alice:/bin/zsh\n"),
            Some("/bin/zsh".to_string())
        );
        assert_eq!(parse_passwd_shell("broken:x:1\n"), None);
    }
}
