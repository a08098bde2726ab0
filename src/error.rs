//! Error types shared by every stage of the login pipeline.

use thiserror::Error;

/// Result type used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or unreadable configuration
    #[error("configuration: {0}")]
    Config(String),

    /// Authentication was refused or could not be performed
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Credential or ownership changes failed (setfsuid, chown, mkdir, ...)
    #[error("privilege: {0}")]
    Privilege(String),

    /// The display server did not come up
    #[error("display server: {0}")]
    Carrier(String),

    /// The session command could not be started or failed
    #[error("session: {0}")]
    Session(String),

    /// No usable session descriptor
    #[error("no session: {0}")]
    NoSession(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sys(#[from] nix::errno::Errno),
}

impl Error {
    /// Authentication failures are retried under autologin, everything else is final.
    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Auth(_))
    }
}
