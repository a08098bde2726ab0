//! emptty - console display manager for X11 and Wayland sessions.
//!
//! Usage:
//!   emptty -d                      # Daemon mode on the configured tty
//!   emptty -t 7 -u alice -a sway   # Autologin alice into sway on tty7

#[cfg(not(target_os = "linux"))]
compile_error!("This program only works on Linux.");

mod accounting;
mod auth;
mod carrier;
mod config;
mod dbus;
mod desktop;
mod error;
mod logging;
mod motd;
mod props;
mod supervisor;
mod sysuser;
mod terminal;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{debug, error, info};

use crate::config::{Config, DEFAULT_CONFIG_PATH};
use crate::error::{Error, Result};
use crate::supervisor::Supervisor;

#[derive(Parser, Debug)]
#[command(name = "emptty")]
#[command(about = "Dead simple CLI display manager on TTY", version, disable_version_flag = true)]
struct Args {
    /// Print version and exit
    #[arg(short = 'v', long, action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// Run in daemon mode: open the tty and redirect stdio to it
    #[arg(short, long)]
    daemon: bool,

    /// Use this tty instead of TTY_NUMBER
    #[arg(short, long, value_name = "N")]
    tty: Option<u32>,

    /// Default user
    #[arg(short, long, value_name = "NAME")]
    user: Option<String>,

    /// Log in automatically, optionally into SESSION
    #[arg(short, long, value_name = "SESSION", num_args = 0..=1, default_missing_value = "")]
    autologin: Option<String>,

    /// Load configuration from PATH
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Do not load any configuration file
    #[arg(short, long)]
    ignore_config: bool,
}

impl Args {
    /// Load the configuration file (unless ignored) and apply the command line on top.
    fn load_config(&self) -> Result<Config> {
        let mut conf = if self.ignore_config {
            Config::default()
        } else {
            let path = self
                .config
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
            if path.exists() || self.config.is_some() {
                Config::load(&path)?
            } else {
                Config::default()
            }
        };
        self.overlay(&mut conf);
        Ok(conf)
    }

    fn overlay(&self, conf: &mut Config) {
        if self.daemon {
            conf.daemon_mode = true;
        }
        if let Some(tty) = self.tty {
            conf.tty = tty;
        }
        if let Some(user) = &self.user {
            conf.default_user = user.clone();
        }
        if let Some(session) = &self.autologin {
            conf.autologin = true;
            if !session.is_empty() {
                conf.autologin_session = session.clone();
            }
        }
        if conf.tty == 0 {
            if let Some(tty) = terminal::current_tty() {
                conf.tty = tty;
            }
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Must be root
    if !nix::unistd::geteuid().is_root() {
        eprintln!("Error: emptty must be run as root");
        return ExitCode::FAILURE;
    }

    let conf = match args.load_config() {
        Ok(conf) => conf,
        Err(e) => return fatal(e),
    };
    logging::init(&conf);
    info!(tty = conf.tty, daemon = conf.daemon_mode, autologin = conf.autologin, "emptty starting");
    debug!("Effective configuration:\n{}", conf.to_properties());

    match Supervisor::new(conf).run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => fatal(e),
    }
}

fn fatal(e: Error) -> ExitCode {
    error!("{}", e);
    eprintln!("Error: {}", e);
    terminal::press_enter();
    ExitCode::FAILURE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("emptty").chain(argv.iter().copied())).unwrap()
    }

    #[test]
    fn autologin_with_and_without_session() {
        let args = parse(&["-a"]);
        assert_eq!(args.autologin.as_deref(), Some(""));

        let args = parse(&["--autologin", "sway", "-t", "3"]);
        assert_eq!(args.autologin.as_deref(), Some("sway"));

        let mut conf = Config {
            autologin_session: "awesome".to_string(),
            ..Config::default()
        };
        parse(&["-a", "-t", "2"]).overlay(&mut conf);
        assert!(conf.autologin);
        assert_eq!(conf.autologin_session, "awesome");
        assert_eq!(conf.tty, 2);
    }

    #[test]
    fn overlay_applies_cli_values() {
        let mut conf = Config::default();
        parse(&["-d", "-t", "7", "-u", "alice", "-a", "i3"]).overlay(&mut conf);
        assert!(conf.daemon_mode);
        assert_eq!(conf.tty, 7);
        assert_eq!(conf.default_user, "alice");
        assert_eq!(conf.autologin_session, "i3");
    }

    #[test]
    fn ignore_config_wins_over_config_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf");
        std::fs::write(&path, "TTY_NUMBER=5\nDEFAULT_USER=bob\n").unwrap();
        let path = path.to_str().unwrap();

        let conf = parse(&["-c", path, "-t", "1"]).load_config().unwrap();
        assert_eq!(conf.default_user, "bob");
        assert_eq!(conf.tty, 1);

        for argv in [["-i", "-c", path], ["-c", path, "-i"]] {
            let conf = parse(&argv).load_config().unwrap();
            assert_eq!(conf.default_user, "");
        }
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        assert!(parse(&["-c", "/nonexistent/emptty.conf"]).load_config().is_err());
    }

    #[test]
    fn version_flag_is_short_v() {
        let err = Args::try_parse_from(["emptty", "-v"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }
}
