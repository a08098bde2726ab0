//! PAM back-end over the libpam C ABI.

use std::ffi::{CStr, CString};
use std::ptr;

use libc::{c_char, c_int, c_void};
use pam_sys::raw::{
    pam_acct_mgmt, pam_authenticate, pam_close_session, pam_end, pam_get_item, pam_getenvlist,
    pam_open_session, pam_putenv, pam_set_item, pam_setcred, pam_start, pam_strerror,
};
use pam_sys::{
    PamConversation, PamFlag, PamHandle, PamItemType, PamMessage, PamMessageStyle, PamResponse,
    PamReturnCode,
};
use tracing::{debug, error, info, warn};

use super::{login_name, password_prompt, Authenticator};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::sysuser::Sysuser;
use crate::terminal;

const SERVICE: &str = "emptty";

const PAM_SUCCESS: c_int = PamReturnCode::SUCCESS as c_int;
const PAM_BUF_ERR: c_int = PamReturnCode::BUF_ERR as c_int;
const PAM_CONV_ERR: c_int = PamReturnCode::CONV_ERR as c_int;

const PROMPT_ECHO_OFF: c_int = PamMessageStyle::PROMPT_ECHO_OFF as c_int;
const PROMPT_ECHO_ON: c_int = PamMessageStyle::PROMPT_ECHO_ON as c_int;
const ERROR_MSG: c_int = PamMessageStyle::ERROR_MSG as c_int;
const TEXT_INFO: c_int = PamMessageStyle::TEXT_INFO as c_int;

/// What the conversation needs to answer PAM's prompts.
struct ConvState {
    autologin: bool,
    password_prompt: &'static str,
}

impl ConvState {
    fn answer(&self, style: c_int, text: &str) -> std::io::Result<Option<String>> {
        match style {
            // Autologin answers every prompt with an empty string; the auth
            // stack decides whether that is enough.
            PROMPT_ECHO_OFF | PROMPT_ECHO_ON if self.autologin => Ok(Some(String::new())),
            PROMPT_ECHO_OFF => terminal::read_password(self.password_prompt).map(Some),
            PROMPT_ECHO_ON => terminal::read_line(text).map(Some),
            ERROR_MSG => {
                eprintln!("{}", text);
                Ok(None)
            }
            TEXT_INFO => {
                println!("{}", text);
                Ok(None)
            }
            other => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unknown PAM message style {}", other),
            )),
        }
    }
}

extern "C" fn converse(
    num_msg: c_int,
    msg: *mut *mut PamMessage,
    resp: *mut *mut PamResponse,
    appdata_ptr: *mut c_void,
) -> c_int {
    if num_msg <= 0 || msg.is_null() || resp.is_null() || appdata_ptr.is_null() {
        return PAM_CONV_ERR;
    }
    let state = unsafe { &*(appdata_ptr as *const ConvState) };
    let count = num_msg as usize;

    let replies =
        unsafe { libc::calloc(count, std::mem::size_of::<PamResponse>()) } as *mut PamResponse;
    if replies.is_null() {
        return PAM_BUF_ERR;
    }

    for i in 0..count {
        let message = unsafe { &**msg.add(i) };
        let text = if message.msg.is_null() {
            String::new()
        } else {
            unsafe { CStr::from_ptr(message.msg) }.to_string_lossy().into_owned()
        };

        match state.answer(message.msg_style, &text) {
            Ok(Some(answer)) => {
                let Ok(answer) = CString::new(answer) else {
                    free_replies(replies, count);
                    return PAM_CONV_ERR;
                };
                let copy = unsafe { libc::strdup(answer.as_ptr()) };
                if copy.is_null() {
                    free_replies(replies, count);
                    return PAM_BUF_ERR;
                }
                unsafe { (*replies.add(i)).resp = copy };
            }
            Ok(None) => {}
            Err(e) => {
                warn!("PAM conversation failed: {}", e);
                free_replies(replies, count);
                return PAM_CONV_ERR;
            }
        }
    }

    unsafe { *resp = replies };
    PAM_SUCCESS
}

fn free_replies(replies: *mut PamResponse, count: usize) {
    unsafe {
        for i in 0..count {
            let reply = &mut *replies.add(i);
            if !reply.resp.is_null() {
                libc::free(reply.resp as *mut c_void);
            }
        }
        libc::free(replies as *mut c_void);
    }
}

/// PAM transaction for the `emptty` service.
pub struct PamAuthenticator {
    handle: *mut PamHandle,
    // Both referenced by libpam while the handle lives.
    conv: Box<ConvState>,
    pam_conv: Option<Box<PamConversation>>,
    last_status: c_int,
    cred_established: bool,
    session_open: bool,
    claimed: String,
}

impl PamAuthenticator {
    pub fn new() -> Self {
        Self {
            handle: ptr::null_mut(),
            conv: Box::new(ConvState {
                autologin: false,
                password_prompt: "Password: ",
            }),
            pam_conv: None,
            last_status: PAM_SUCCESS,
            cred_established: false,
            session_open: false,
            claimed: String::new(),
        }
    }

    fn start(&mut self, username: &str) -> Result<()> {
        let service = CString::new(SERVICE).map_err(|_| Error::Auth("invalid service".into()))?;
        let user = CString::new(username).map_err(|_| Error::Auth("invalid username".into()))?;
        let conv = self.pam_conv.insert(Box::new(PamConversation {
            conv: Some(converse),
            data_ptr: &*self.conv as *const ConvState as *mut c_void,
        }));

        let mut handle: *mut PamHandle = ptr::null_mut();
        let rc = unsafe {
            pam_start(service.as_ptr(), user.as_ptr(), &**conv, &mut handle as *mut *mut PamHandle as *mut *const PamHandle)
        };
        if rc != PAM_SUCCESS || handle.is_null() {
            return Err(Error::Auth(format!("pam_start failed ({})", rc)));
        }
        self.handle = handle;
        debug!(user = username, "Started PAM transaction");
        Ok(())
    }

    fn strerror(&self, rc: c_int) -> String {
        let msg = unsafe { pam_strerror(self.handle, rc) };
        if msg.is_null() {
            return format!("PAM error {}", rc);
        }
        unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
    }

    fn check(&mut self, rc: c_int, step: &str) -> Result<()> {
        self.last_status = rc;
        if rc == PAM_SUCCESS {
            return Ok(());
        }
        Err(Error::Auth(format!("{}: {}", step, self.strerror(rc))))
    }

    fn set_item(&mut self, item: PamItemType, value: &str) -> Result<()> {
        let value = CString::new(value).map_err(|_| Error::Auth("invalid PAM item".into()))?;
        let rc = unsafe { pam_set_item(self.handle, item as c_int, value.as_ptr() as *const c_void) };
        self.check(rc, "pam_set_item")
    }

    /// PAM modules may map the login name; ask for the final one.
    fn user(&self) -> Option<String> {
        let mut item: *const c_void = ptr::null();
        let rc = unsafe { pam_get_item(self.handle, PamItemType::USER as c_int, &mut item) };
        if rc != PAM_SUCCESS || item.is_null() {
            return None;
        }
        Some(
            unsafe { CStr::from_ptr(item as *const c_char) }
                .to_string_lossy()
                .into_owned(),
        )
    }

    fn putenv(&mut self, entry: &str) -> Result<()> {
        let entry = CString::new(entry).map_err(|_| Error::Auth("invalid PAM env".into()))?;
        let rc = unsafe { pam_putenv(self.handle, entry.as_ptr()) };
        self.check(rc, "pam_putenv")
    }

    fn try_authenticate(&mut self, conf: &Config, username: &str) -> Result<Sysuser> {
        self.start(username)?;

        let rc = unsafe { pam_authenticate(self.handle, PamFlag::NONE as c_int) };
        self.check(rc, "pam_authenticate")?;
        let rc = unsafe { pam_acct_mgmt(self.handle, PamFlag::NONE as c_int) };
        self.check(rc, "pam_acct_mgmt")?;
        self.set_item(PamItemType::TTY, &conf.tty_line())?;
        let rc = unsafe { pam_setcred(self.handle, PamFlag::ESTABLISH_CRED as c_int) };
        self.check(rc, "pam_setcred")?;
        self.cred_established = true;

        let name = self.user().unwrap_or_else(|| username.to_string());
        Sysuser::lookup(&name)
    }

    fn end(&mut self) {
        if self.handle.is_null() {
            return;
        }
        unsafe { pam_end(self.handle, self.last_status) };
        self.handle = ptr::null_mut();
        self.cred_established = false;
        self.session_open = false;
    }
}

impl Authenticator for PamAuthenticator {
    fn authenticate(&mut self, conf: &Config) -> Result<Sysuser> {
        self.end();
        self.conv.autologin = conf.autologin;
        self.conv.password_prompt = password_prompt(conf);

        let username = login_name(conf)?;
        self.claimed = username.clone();

        match self.try_authenticate(conf, &username) {
            Ok(user) => {
                info!(user = %user.username, uid = %user.uid, "Authorized");
                Ok(user)
            }
            Err(e) => {
                error!(user = %username, "authentication failed: {}", e);
                self.end();
                Err(e)
            }
        }
    }

    fn open_session(&mut self, session_type: &str) -> Result<()> {
        self.putenv(&format!("XDG_SESSION_TYPE={}", session_type))?;
        let rc = unsafe { pam_open_session(self.handle, PamFlag::NONE as c_int) };
        self.check(rc, "pam_open_session")?;
        self.session_open = true;
        debug!(session_type, "Opened PAM session");
        Ok(())
    }

    fn export_env(&self, user: &mut Sysuser) {
        if self.handle.is_null() {
            return;
        }
        let list = unsafe { pam_getenvlist(self.handle) };
        if list.is_null() {
            return;
        }
        unsafe {
            let mut cursor = list;
            while !(*cursor).is_null() {
                let entry = CStr::from_ptr(*cursor).to_string_lossy().into_owned();
                if let Some((key, value)) = entry.split_once('=') {
                    user.setenv(key, value);
                }
                libc::free(*cursor as *mut c_void);
                cursor = cursor.add(1);
            }
            libc::free(list as *mut c_void);
        }
    }

    fn close(&mut self) {
        if self.handle.is_null() {
            return;
        }
        if self.session_open {
            let rc = unsafe { pam_close_session(self.handle, PamFlag::NONE as c_int) };
            if rc != PAM_SUCCESS {
                warn!("pam_close_session: {}", self.strerror(rc));
            }
        }
        if self.cred_established {
            let rc = unsafe { pam_setcred(self.handle, PamFlag::DELETE_CRED as c_int) };
            if rc != PAM_SUCCESS {
                warn!("pam_setcred(DELETE_CRED): {}", self.strerror(rc));
            }
        }
        self.end();
        debug!("Closed PAM transaction");
    }

    fn claimed_user(&self) -> &str {
        &self.claimed
    }
}

impl Drop for PamAuthenticator {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn autologin_answers_prompts_with_empty_strings() {
        let state = ConvState {
            autologin: true,
            password_prompt: "Password: ",
        };
        assert_eq!(state.answer(PROMPT_ECHO_OFF, "Password: ").unwrap(), Some(String::new()));
        assert_eq!(state.answer(PROMPT_ECHO_ON, "login: ").unwrap(), Some(String::new()));
        assert_eq!(state.answer(TEXT_INFO, "Welcome").unwrap(), None);
    }

    #[test]
    fn unknown_message_style_is_a_conversation_error() {
        let state = ConvState {
            autologin: true,
            password_prompt: "",
        };
        assert!(state.answer(99, "?").is_err());
    }
}
