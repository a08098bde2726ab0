//! Authentication back-ends and the login prompt they share.

use std::fs;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::process::Command;

use tracing::{debug, info, warn};

use crate::config::{Config, SelectLastUser};
use crate::error::{Error, Result};
use crate::sysuser::Sysuser;
use crate::terminal;

#[cfg(feature = "pam")]
mod pam;
#[cfg(not(feature = "pam"))]
mod shadow;

const LAST_USER_DIR: &str = "/var/cache/emptty";

/// One authentication transaction.
///
/// A successful `authenticate` must be paired with exactly one `close`.
pub trait Authenticator {
    /// Prompt as needed and verify the user. Credentials are established on success.
    fn authenticate(&mut self, conf: &Config) -> Result<Sysuser>;

    /// Open the login session of the given `XDG_SESSION_TYPE`.
    fn open_session(&mut self, session_type: &str) -> Result<()>;

    /// Copy variables provided by the back-end into the user's environment.
    fn export_env(&self, user: &mut Sysuser);

    /// Close the session, delete credentials and end the transaction.
    fn close(&mut self);

    /// Name entered in the most recent attempt, recorded in btmp on failure.
    fn claimed_user(&self) -> &str;
}

#[cfg(feature = "pam")]
pub fn new_authenticator() -> Box<dyn Authenticator> {
    Box::new(pam::PamAuthenticator::new())
}

#[cfg(not(feature = "pam"))]
pub fn new_authenticator() -> Box<dyn Authenticator> {
    Box::new(shadow::ShadowAuthenticator::new())
}

/// Where the last selected username is kept.
#[derive(Debug, Clone)]
pub struct LastUserStore {
    dir: PathBuf,
}

impl Default for LastUserStore {
    fn default() -> Self {
        Self::new(LAST_USER_DIR)
    }
}

impl LastUserStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, policy: SelectLastUser, tty: u32) -> Option<PathBuf> {
        match policy {
            SelectLastUser::Off => None,
            SelectLastUser::PerTty => Some(self.dir.join(format!("lastuser-{}", tty))),
            SelectLastUser::Global => Some(self.dir.join("lastuser")),
        }
    }

    pub fn load(&self, policy: SelectLastUser, tty: u32) -> Option<String> {
        let path = self.path(policy, tty)?;
        let content = fs::read_to_string(&path).ok()?;
        let name = content.lines().next()?.trim();
        (!name.is_empty()).then(|| name.to_string())
    }

    /// Write `username` (mode 0600). Does nothing when the policy is off.
    pub fn save(&self, policy: SelectLastUser, tty: u32, username: &str) -> io::Result<()> {
        let Some(path) = self.path(policy, tty) else {
            return Ok(());
        };
        fs::create_dir_all(&self.dir)?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)?;
        io::Write::write_all(&mut file, format!("{}\n", username).as_bytes())?;
        debug!(path = %path.display(), "Saved last user");
        Ok(())
    }
}

/// Commands accepted on the login line with `ALLOW_COMMANDS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginCommand {
    Help,
    Poweroff,
    Reboot,
    Suspend,
    Unknown(String),
}

impl LoginCommand {
    fn parse(line: &str) -> Option<Self> {
        let name = line.trim().strip_prefix(':')?;
        Some(match name.trim() {
            "help" | "?" => LoginCommand::Help,
            "poweroff" | "shutdown" => LoginCommand::Poweroff,
            "reboot" => LoginCommand::Reboot,
            "suspend" => LoginCommand::Suspend,
            other => LoginCommand::Unknown(other.to_string()),
        })
    }

    fn run(&self) {
        let argv: &[&str] = match self {
            LoginCommand::Help => {
                println!("Available commands:");
                println!("  :help, :?             show this help");
                println!("  :poweroff, :shutdown  power off the machine");
                println!("  :reboot               reboot the machine");
                println!("  :suspend              suspend the machine");
                return;
            }
            LoginCommand::Unknown(name) => {
                println!("Unknown command '{}', type :help for the list", name);
                return;
            }
            LoginCommand::Poweroff => &["poweroff"],
            LoginCommand::Reboot => &["reboot"],
            LoginCommand::Suspend => &["systemctl", "suspend"],
        };

        info!(command = ?self, "Running login command");
        if let Err(e) = Command::new(argv[0]).args(&argv[1..]).status() {
            warn!(command = ?self, "login command failed: {}", e);
            println!("Command failed: {}", e);
        }
    }
}

/// Ask for a username until one is given.
///
/// Empty input selects `last` when there is one; lines starting with `:` are
/// commands when allowed and never reach authentication.
pub fn ask_username(
    conf: &Config,
    last: Option<&str>,
    read: &mut dyn FnMut(&str) -> io::Result<String>,
) -> Result<String> {
    let prompt = if conf.hide_enter_login {
        String::new()
    } else {
        format!("{} login: ", hostname())
    };

    loop {
        let line = read(&prompt)?;
        let line = line.trim();
        if conf.allow_commands {
            if let Some(cmd) = LoginCommand::parse(line) {
                cmd.run();
                continue;
            }
        }
        match (line.is_empty(), last) {
            (false, _) => return Ok(line.to_string()),
            (true, Some(last)) => return Ok(last.to_string()),
            (true, None) => continue,
        }
    }
}

/// The username for this attempt: the configured default user, else the
/// interactive prompt.
fn login_name(conf: &Config) -> Result<String> {
    if !conf.default_user.is_empty() {
        return Ok(conf.default_user.clone());
    }
    if conf.autologin {
        return Err(Error::Config("autologin requires DEFAULT_USER".to_string()));
    }
    let last = LastUserStore::default().load(conf.select_last_user, conf.tty);
    ask_username(conf, last.as_deref(), &mut terminal::read_line)
}

fn password_prompt(conf: &Config) -> &'static str {
    if conf.hide_enter_password {
        ""
    } else {
        "Password: "
    }
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Persist the last user according to `SELECT_LAST_USER`. Failures are logged.
pub fn remember_user(conf: &Config, username: &str) {
    remember_user_in(&LastUserStore::default(), conf, username);
}

fn remember_user_in(store: &LastUserStore, conf: &Config, username: &str) {
    if let Err(e) = store.save(conf.select_last_user, conf.tty, username) {
        warn!(user = username, "cannot save last user: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scripted(answers: &[&str]) -> impl FnMut(&str) -> io::Result<String> {
        let mut answers: Vec<String> = answers.iter().rev().map(|s| s.to_string()).collect();
        move |_prompt: &str| {
            answers
                .pop()
                .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "no more input"))
        }
    }

    #[test]
    fn last_user_paths_follow_policy() {
        let dir = tempfile::tempdir().unwrap();
        let store = LastUserStore::new(dir.path());

        store.save(SelectLastUser::PerTty, 3, "alice").unwrap();
        store.save(SelectLastUser::Global, 3, "bob").unwrap();
        store.save(SelectLastUser::Off, 3, "carol").unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("lastuser-3")).unwrap(), "alice\n");
        assert_eq!(store.load(SelectLastUser::PerTty, 3).as_deref(), Some("alice"));
        assert_eq!(store.load(SelectLastUser::Global, 9).as_deref(), Some("bob"));
        assert_eq!(store.load(SelectLastUser::PerTty, 4), None);
        assert_eq!(store.load(SelectLastUser::Off, 3), None);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn last_user_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = LastUserStore::new(dir.path().join("cache"));
        let conf = Config {
            select_last_user: SelectLastUser::Global,
            ..Config::default()
        };
        remember_user_in(&store, &conf, "alice");

        let mode = fs::metadata(dir.path().join("cache/lastuser")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn parses_commands() {
        assert_eq!(LoginCommand::parse(":help"), Some(LoginCommand::Help));
        assert_eq!(LoginCommand::parse(" :shutdown "), Some(LoginCommand::Poweroff));
        assert_eq!(LoginCommand::parse(":suspend"), Some(LoginCommand::Suspend));
        assert_eq!(LoginCommand::parse(":dance"), Some(LoginCommand::Unknown("dance".to_string())));
        assert_eq!(LoginCommand::parse("alice"), None);
    }

    #[test]
    fn commands_never_become_usernames() {
        let conf = Config {
            allow_commands: true,
            ..Config::default()
        };
        let mut read = scripted(&[":help", ":nope", "alice"]);
        assert_eq!(ask_username(&conf, None, &mut read).unwrap(), "alice");
    }

    #[test]
    fn colon_names_are_plain_users_without_commands() {
        let mut read = scripted(&[":help"]);
        assert_eq!(ask_username(&Config::default(), None, &mut read).unwrap(), ":help");
    }

    #[test]
    fn empty_line_takes_last_user() {
        let mut read = scripted(&["", ""]);
        assert_eq!(ask_username(&Config::default(), Some("bob"), &mut read).unwrap(), "bob");

        let mut read = scripted(&["", " carol "]);
        assert_eq!(ask_username(&Config::default(), None, &mut read).unwrap(), "carol");
    }

    #[test]
    fn default_user_skips_prompt() {
        let conf = Config {
            default_user: "alice".to_string(),
            ..Config::default()
        };
        assert_eq!(login_name(&conf).unwrap(), "alice");

        let conf = Config {
            autologin: true,
            ..Config::default()
        };
        assert!(matches!(login_name(&conf), Err(Error::Config(_))));
    }
}
