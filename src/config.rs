//! Immutable configuration snapshot loaded at startup.

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::warn;

use crate::desktop::SessionEnv;
use crate::error::{Error, Result};
use crate::logging::LogPolicy;
use crate::props::{self, Properties};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/emptty/conf";
pub const DEFAULT_LANG: &str = "en_US.UTF-8";
const TTY_PLACEHOLDER: &str = "[TTY_NUMBER]";

/// Where the last logged-in username is remembered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectLastUser {
    Off,
    PerTty,
    Global,
}

impl SelectLastUser {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectLastUser::Off => "false",
            SelectLastUser::PerTty => "per-tty",
            SelectLastUser::Global => "global",
        }
    }
}

impl FromStr for SelectLastUser {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per-tty" => Ok(SelectLastUser::PerTty),
            "global" => Ok(SelectLastUser::Global),
            "" | "false" | "no" | "off" => Ok(SelectLastUser::Off),
            other => Err(format!("unknown SELECT_LAST_USER value '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub tty: u32,
    pub switch_tty: bool,
    pub print_issue: bool,
    pub print_motd: bool,
    pub default_user: String,
    pub autologin: bool,
    pub autologin_session: String,
    pub autologin_session_env: Option<SessionEnv>,
    /// Negative means unlimited.
    pub autologin_max_retry: i32,
    pub lang: String,
    pub dbus_launch: bool,
    pub xinitrc_launch: bool,
    pub vertical_selection: bool,
    pub indent_selection: usize,
    pub logging: LogPolicy,
    pub logging_file: String,
    pub xorg_args: String,
    pub dynamic_motd: bool,
    pub dynamic_motd_path: PathBuf,
    pub motd_path: PathBuf,
    pub fg_color: String,
    pub bg_color: String,
    pub display_start_script: String,
    pub display_stop_script: String,
    pub enable_numlock: bool,
    pub session_error_logging: LogPolicy,
    pub session_error_logging_file: String,
    pub no_xdg_fallback: bool,
    pub default_xauthority: bool,
    pub rootless_xorg: bool,
    pub identify_envs: bool,
    pub select_last_user: SelectLastUser,
    pub allow_commands: bool,
    pub hide_enter_login: bool,
    pub hide_enter_password: bool,
    pub auto_selection: bool,
    pub default_session: String,
    pub default_session_env: Option<SessionEnv>,
    pub xorg_sessions_path: PathBuf,
    pub wayland_sessions_path: PathBuf,
    pub daemon_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tty: 0,
            switch_tty: true,
            print_issue: true,
            print_motd: true,
            default_user: String::new(),
            autologin: false,
            autologin_session: String::new(),
            autologin_session_env: None,
            autologin_max_retry: -1,
            lang: env::var("LANG")
                .ok()
                .filter(|l| !l.is_empty())
                .unwrap_or_else(|| DEFAULT_LANG.to_string()),
            dbus_launch: true,
            xinitrc_launch: false,
            vertical_selection: false,
            indent_selection: 0,
            logging: LogPolicy::Rotate,
            logging_file: String::new(),
            xorg_args: String::new(),
            dynamic_motd: false,
            dynamic_motd_path: PathBuf::from("/etc/emptty/motd-gen.sh"),
            motd_path: PathBuf::from("/etc/emptty/motd"),
            fg_color: String::new(),
            bg_color: String::new(),
            display_start_script: String::new(),
            display_stop_script: String::new(),
            enable_numlock: false,
            session_error_logging: LogPolicy::Disabled,
            session_error_logging_file: String::new(),
            no_xdg_fallback: false,
            default_xauthority: false,
            rootless_xorg: false,
            identify_envs: false,
            select_last_user: SelectLastUser::Off,
            allow_commands: false,
            hide_enter_login: false,
            hide_enter_password: false,
            auto_selection: false,
            default_session: String::new(),
            default_session_env: None,
            xorg_sessions_path: PathBuf::from("/usr/share/xsessions/"),
            wayland_sessions_path: PathBuf::from("/usr/share/wayland-sessions/"),
            daemon_mode: false,
        }
    }
}

impl Config {
    /// Load a property file on top of the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let props = Properties::load(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Ok(Self::from_properties(&props))
    }

    /// Build a snapshot from parsed properties. Unknown keys and unparseable
    /// values are reported and otherwise ignored.
    pub fn from_properties(props: &Properties) -> Self {
        let mut conf = Config::default();
        for (key, value) in props.iter() {
            if let Err(e) = conf.apply(key, value) {
                warn!(key, value, "ignoring config entry: {}", e);
            }
        }
        conf
    }

    fn apply(&mut self, key: &str, value: &str) -> std::result::Result<(), String> {
        match key.to_ascii_uppercase().as_str() {
            "TTY_NUMBER" => self.tty = parse_num(value)?,
            "SWITCH_TTY" => self.switch_tty = flag(value)?,
            "PRINT_ISSUE" => self.print_issue = flag(value)?,
            "PRINT_MOTD" => self.print_motd = flag(value)?,
            "DEFAULT_USER" => self.default_user = value.to_string(),
            "AUTOLOGIN" => self.autologin = flag(value)?,
            "AUTOLOGIN_SESSION" => self.autologin_session = value.to_string(),
            "AUTOLOGIN_SESSION_ENV" => self.autologin_session_env = session_env(value)?,
            "AUTOLOGIN_MAX_RETRY" => self.autologin_max_retry = parse_num(value)?,
            "LANG" => self.lang = value.to_string(),
            "DBUS_LAUNCH" => self.dbus_launch = flag(value)?,
            "XINITRC_LAUNCH" => self.xinitrc_launch = flag(value)?,
            "VERTICAL_SELECTION" => self.vertical_selection = flag(value)?,
            "INDENT_SELECTION" => self.indent_selection = parse_num(value)?,
            "LOGGING" => self.logging = value.parse()?,
            "LOGGING_FILE" => self.logging_file = value.to_string(),
            "XORG_ARGS" => self.xorg_args = value.to_string(),
            "DYNAMIC_MOTD" => self.dynamic_motd = flag(value)?,
            "DYNAMIC_MOTD_PATH" => self.dynamic_motd_path = PathBuf::from(value),
            "MOTD_PATH" => self.motd_path = PathBuf::from(value),
            "FG_COLOR" => self.fg_color = value.to_string(),
            "BG_COLOR" => self.bg_color = value.to_string(),
            "DISPLAY_START_SCRIPT" => self.display_start_script = value.to_string(),
            "DISPLAY_STOP_SCRIPT" => self.display_stop_script = value.to_string(),
            "ENABLE_NUMLOCK" => self.enable_numlock = flag(value)?,
            "SESSION_ERROR_LOGGING" => self.session_error_logging = value.parse()?,
            "SESSION_ERROR_LOGGING_FILE" => self.session_error_logging_file = value.to_string(),
            "NO_XDG_FALLBACK" => self.no_xdg_fallback = flag(value)?,
            "DEFAULT_XAUTHORITY" => self.default_xauthority = flag(value)?,
            "ROOTLESS_XORG" => self.rootless_xorg = flag(value)?,
            "IDENTIFY_ENVS" => self.identify_envs = flag(value)?,
            "SELECT_LAST_USER" => self.select_last_user = value.parse()?,
            "ALLOW_COMMANDS" => self.allow_commands = flag(value)?,
            "HIDE_ENTER_LOGIN" => self.hide_enter_login = flag(value)?,
            "HIDE_ENTER_PASSWORD" => self.hide_enter_password = flag(value)?,
            "AUTO_SELECTION" => self.auto_selection = flag(value)?,
            "DEFAULT_SESSION" => self.default_session = value.to_string(),
            "DEFAULT_SESSION_ENV" => self.default_session_env = session_env(value)?,
            "XORG_SESSIONS_PATH" => self.xorg_sessions_path = PathBuf::from(value),
            "WAYLAND_SESSIONS_PATH" => self.wayland_sessions_path = PathBuf::from(value),
            "DAEMON_MODE" => self.daemon_mode = flag(value)?,
            _ => return Err("unknown key".to_string()),
        }
        Ok(())
    }

    /// Render every key so that [`Config::from_properties`] reproduces this snapshot.
    pub fn to_properties(&self) -> String {
        let env_str = |e: &Option<SessionEnv>| e.map(|e| e.as_str().to_string()).unwrap_or_default();
        let path_str = |p: &Path| p.to_string_lossy().into_owned();

        props::render([
            ("TTY_NUMBER", self.tty.to_string()),
            ("SWITCH_TTY", self.switch_tty.to_string()),
            ("PRINT_ISSUE", self.print_issue.to_string()),
            ("PRINT_MOTD", self.print_motd.to_string()),
            ("DEFAULT_USER", self.default_user.clone()),
            ("AUTOLOGIN", self.autologin.to_string()),
            ("AUTOLOGIN_SESSION", self.autologin_session.clone()),
            ("AUTOLOGIN_SESSION_ENV", env_str(&self.autologin_session_env)),
            ("AUTOLOGIN_MAX_RETRY", self.autologin_max_retry.to_string()),
            ("LANG", self.lang.clone()),
            ("DBUS_LAUNCH", self.dbus_launch.to_string()),
            ("XINITRC_LAUNCH", self.xinitrc_launch.to_string()),
            ("VERTICAL_SELECTION", self.vertical_selection.to_string()),
            ("INDENT_SELECTION", self.indent_selection.to_string()),
            ("LOGGING", self.logging.to_string()),
            ("LOGGING_FILE", self.logging_file.clone()),
            ("XORG_ARGS", self.xorg_args.clone()),
            ("DYNAMIC_MOTD", self.dynamic_motd.to_string()),
            ("DYNAMIC_MOTD_PATH", path_str(&self.dynamic_motd_path)),
            ("MOTD_PATH", path_str(&self.motd_path)),
            ("FG_COLOR", self.fg_color.clone()),
            ("BG_COLOR", self.bg_color.clone()),
            ("DISPLAY_START_SCRIPT", self.display_start_script.clone()),
            ("DISPLAY_STOP_SCRIPT", self.display_stop_script.clone()),
            ("ENABLE_NUMLOCK", self.enable_numlock.to_string()),
            ("SESSION_ERROR_LOGGING", self.session_error_logging.to_string()),
            ("SESSION_ERROR_LOGGING_FILE", self.session_error_logging_file.clone()),
            ("NO_XDG_FALLBACK", self.no_xdg_fallback.to_string()),
            ("DEFAULT_XAUTHORITY", self.default_xauthority.to_string()),
            ("ROOTLESS_XORG", self.rootless_xorg.to_string()),
            ("IDENTIFY_ENVS", self.identify_envs.to_string()),
            ("SELECT_LAST_USER", self.select_last_user.as_str().to_string()),
            ("ALLOW_COMMANDS", self.allow_commands.to_string()),
            ("HIDE_ENTER_LOGIN", self.hide_enter_login.to_string()),
            ("HIDE_ENTER_PASSWORD", self.hide_enter_password.to_string()),
            ("AUTO_SELECTION", self.auto_selection.to_string()),
            ("DEFAULT_SESSION", self.default_session.clone()),
            ("DEFAULT_SESSION_ENV", env_str(&self.default_session_env)),
            ("XORG_SESSIONS_PATH", path_str(&self.xorg_sessions_path)),
            ("WAYLAND_SESSIONS_PATH", path_str(&self.wayland_sessions_path)),
            ("DAEMON_MODE", self.daemon_mode.to_string()),
        ])
    }

    /// `tty<N>`, as used for PAM, utmp and the issue `\l` escape.
    pub fn tty_line(&self) -> String {
        format!("tty{}", self.tty)
    }

    pub fn log_file(&self) -> PathBuf {
        self.expand_log_path(&self.logging_file, "/var/log/emptty/[TTY_NUMBER].log")
    }

    pub fn session_error_log_file(&self) -> PathBuf {
        self.expand_log_path(
            &self.session_error_logging_file,
            "/var/log/emptty/session-errors.[TTY_NUMBER].log",
        )
    }

    fn expand_log_path(&self, configured: &str, default: &str) -> PathBuf {
        let template = if configured.is_empty() { default } else { configured };
        PathBuf::from(template.replace(TTY_PLACEHOLDER, &self.tty.to_string()))
    }

    /// Extra Xorg arguments, split on whitespace.
    pub fn xorg_extra_args(&self) -> Vec<String> {
        self.xorg_args.split_whitespace().map(str::to_string).collect()
    }
}

impl fmt::Display for SelectLastUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn flag(value: &str) -> std::result::Result<bool, String> {
    props::parse_bool(value).ok_or_else(|| format!("'{}' is not a boolean", value))
}

fn parse_num<T: FromStr>(value: &str) -> std::result::Result<T, String> {
    value
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a number", value))
}

fn session_env(value: &str) -> std::result::Result<Option<SessionEnv>, String> {
    if value.trim().is_empty() {
        return Ok(None);
    }
    SessionEnv::parse(value)
        .map(Some)
        .ok_or_else(|| format!("unknown environment '{}'", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn defaults_match_documented_values() {
        let conf = Config::default();
        assert_eq!(conf.tty, 0);
        assert!(conf.switch_tty);
        assert!(conf.dbus_launch);
        assert!(!conf.xinitrc_launch);
        assert_eq!(conf.autologin_max_retry, -1);
        assert_eq!(conf.logging, LogPolicy::Rotate);
        assert_eq!(conf.session_error_logging, LogPolicy::Disabled);
        assert_eq!(conf.select_last_user, SelectLastUser::Off);
        assert_eq!(conf.xorg_sessions_path, PathBuf::from("/usr/share/xsessions/"));
    }

    #[test]
    fn loads_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf");
        fs::write(
            &path,
            "TTY_NUMBER=7\nexport AUTOLOGIN=true\nDEFAULT_USER=alice\nAUTOLOGIN_SESSION=awesome\n\
             AUTOLOGIN_SESSION_ENV=xorg\nSELECT_LAST_USER=per-tty\nLOGGING=appending\nBOGUS=1\n",
        )
        .unwrap();

        let conf = Config::load(&path).unwrap();
        assert_eq!(conf.tty, 7);
        assert!(conf.autologin);
        assert_eq!(conf.default_user, "alice");
        assert_eq!(conf.autologin_session, "awesome");
        assert_eq!(conf.autologin_session_env, Some(SessionEnv::Xorg));
        assert_eq!(conf.select_last_user, SelectLastUser::PerTty);
        assert_eq!(conf.logging, LogPolicy::Appending);
    }

    #[test]
    fn invalid_values_keep_defaults() {
        let conf = Config::from_properties(&Properties::parse("TTY_NUMBER=seven\nDBUS_LAUNCH=maybe\n"));
        assert_eq!(conf.tty, 0);
        assert!(conf.dbus_launch);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = Config::load(Path::new("/nonexistent/emptty/conf")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn properties_round_trip() {
        let conf = Config {
            tty: 3,
            autologin: true,
            autologin_session: "sway --unsupported-gpu".to_string(),
            autologin_session_env: Some(SessionEnv::Wayland),
            autologin_max_retry: 2,
            lang: "de_DE.UTF-8".to_string(),
            xorg_args: "-nolisten tcp".to_string(),
            default_user: "\"quoted\"".to_string(),
            fg_color: "LIGHT_GREEN".to_string(),
            select_last_user: SelectLastUser::Global,
            session_error_logging: LogPolicy::Appending,
            indent_selection: 4,
            daemon_mode: true,
            ..Config::default()
        };

        let back = Config::from_properties(&Properties::parse(&conf.to_properties()));
        assert_eq!(back, conf);
    }

    #[test]
    fn log_paths_expand_tty_placeholder() {
        let conf = Config {
            tty: 2,
            logging_file: "/tmp/emptty-[TTY_NUMBER].log".to_string(),
            ..Config::default()
        };
        assert_eq!(conf.log_file(), PathBuf::from("/tmp/emptty-2.log"));
        assert_eq!(
            conf.session_error_log_file(),
            PathBuf::from("/var/log/emptty/session-errors.2.log")
        );
        assert_eq!(conf.tty_line(), "tty2");
    }
}
