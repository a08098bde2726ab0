//! Log sinks for the supervisor and for the session's stderr.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// How an existing log file is treated when a sink is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogPolicy {
    /// Move the previous file to `<file>.old` and start fresh.
    Rotate,
    Appending,
    Disabled,
}

impl FromStr for LogPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rotate" => Ok(LogPolicy::Rotate),
            "appending" => Ok(LogPolicy::Appending),
            "disabled" => Ok(LogPolicy::Disabled),
            other => Err(format!("unknown logging policy '{}'", other)),
        }
    }
}

impl fmt::Display for LogPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogPolicy::Rotate => "rotate",
            LogPolicy::Appending => "appending",
            LogPolicy::Disabled => "disabled",
        })
    }
}

/// Open a log file according to `policy`. `Ok(None)` when logging is disabled.
pub fn open_sink(path: &Path, policy: LogPolicy) -> io::Result<Option<File>> {
    if policy == LogPolicy::Disabled {
        return Ok(None);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut options = OpenOptions::new();
    options.create(true);
    match policy {
        LogPolicy::Rotate => {
            if path.exists() {
                fs::rename(path, rotated_path(path))?;
            }
            options.write(true).truncate(true);
        }
        LogPolicy::Appending => {
            options.append(true);
        }
        LogPolicy::Disabled => unreachable!(),
    }
    options.open(path).map(Some)
}

fn rotated_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".old");
    PathBuf::from(name)
}

/// Install the global tracing subscriber writing into the configured log file.
///
/// Failures to open the file leave logging disabled; the program keeps running.
pub fn init(conf: &Config) {
    let path = conf.log_file();
    let file = match open_sink(&path, conf.logging) {
        Ok(Some(file)) => file,
        Ok(None) => return,
        Err(e) => {
            eprintln!("Warning: cannot open log file {}: {}", path.display(), e);
            return;
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init();
}
