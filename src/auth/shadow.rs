//! Password check against shadow(5) with crypt(3), for builds without PAM.

use std::ffi::{CStr, CString};

use libc::c_char;
use tracing::{debug, error, info};

use super::{login_name, password_prompt, Authenticator};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::sysuser::Sysuser;
use crate::terminal;

#[link(name = "crypt")]
extern "C" {
    fn crypt(key: *const c_char, salt: *const c_char) -> *mut c_char;
}

#[derive(Default)]
pub struct ShadowAuthenticator {
    claimed: String,
}

impl ShadowAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Stored hash from the shadow database, falling back to the passwd entry.
fn stored_hash(username: &str) -> Result<String> {
    let name = CString::new(username).map_err(|_| Error::Auth("invalid username".into()))?;

    let spwd = unsafe { libc::getspnam(name.as_ptr()) };
    if !spwd.is_null() {
        let hash = unsafe { (*spwd).sp_pwdp };
        if !hash.is_null() {
            return Ok(unsafe { CStr::from_ptr(hash) }.to_string_lossy().into_owned());
        }
    }

    debug!(user = username, "no shadow entry, trying passwd");
    let pwd = unsafe { libc::getpwnam(name.as_ptr()) };
    if pwd.is_null() || unsafe { (*pwd).pw_passwd }.is_null() {
        return Err(Error::Auth(format!("unknown user '{}'", username)));
    }
    Ok(unsafe { CStr::from_ptr((*pwd).pw_passwd) }
        .to_string_lossy()
        .into_owned())
}

fn verify_password(password: &str, hash: &str) -> Result<bool> {
    // Locked and disabled accounts.
    if hash.is_empty() || hash.starts_with('!') || hash.starts_with('*') {
        return Ok(false);
    }
    let key = CString::new(password).map_err(|_| Error::Auth("invalid password".into()))?;
    let salt = CString::new(hash).map_err(|_| Error::Auth("invalid hash".into()))?;

    let out = unsafe { crypt(key.as_ptr(), salt.as_ptr()) };
    if out.is_null() {
        return Ok(false);
    }
    let computed = unsafe { CStr::from_ptr(out) }.to_bytes();
    Ok(computed == hash.as_bytes())
}

impl Authenticator for ShadowAuthenticator {
    fn authenticate(&mut self, conf: &Config) -> Result<Sysuser> {
        let username = login_name(conf)?;
        self.claimed = username.clone();

        if !conf.autologin {
            let password = terminal::read_password(password_prompt(conf))?;
            let hash = stored_hash(&username)?;
            if !verify_password(&password, &hash)? {
                error!(user = %username, "authentication failed");
                return Err(Error::Auth("wrong username or password".to_string()));
            }
        }

        let user = Sysuser::lookup(&username)?;
        info!(user = %user.username, uid = %user.uid, "Authorized");
        Ok(user)
    }

    fn open_session(&mut self, session_type: &str) -> Result<()> {
        debug!(session_type, "No session module without PAM");
        Ok(())
    }

    fn export_env(&self, _user: &mut Sysuser) {}

    fn close(&mut self) {}

    fn claimed_user(&self) -> &str {
        &self.claimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locked_accounts_never_verify() {
        assert!(!verify_password("secret", "!$6$salt$hash").unwrap());
        assert!(!verify_password("secret", "*").unwrap());
        assert!(!verify_password("", "").unwrap());
    }

    #[test]
    fn sha512_crypt_round_trip() {
        let hash = unsafe {
            let key = CString::new("secret").unwrap();
            let salt = CString::new("$6$saltsalt$").unwrap();
            CStr::from_ptr(crypt(key.as_ptr(), salt.as_ptr()))
                .to_string_lossy()
                .into_owned()
        };
        assert!(verify_password("secret", &hash).unwrap());
        assert!(!verify_password("guess", &hash).unwrap());
    }
}
