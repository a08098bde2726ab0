//! Session accounting in utmp, wtmp and btmp.
//!
//! Records go through the libc `utmpx` API; wtmp and btmp are appended with
//! `updwtmpx`. Targets without that API get no-ops.

use std::path::Path;

use tracing::{debug, info, warn};

const WTMP_PATH: &str = "/var/log/wtmp";
pub const BTMP_PATH: &str = "/var/log/btmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// A running session.
    User,
    /// The session ended.
    Dead,
    /// A failed login attempt (btmp).
    Login,
}

/// One utmp line, independent of the C layout.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountingRecord {
    pub kind: RecordKind,
    pub pid: i32,
    pub id: String,
    pub line: String,
    pub user: String,
    pub host: String,
}

impl AccountingRecord {
    /// `id` is the display name when there is one, else the tty number.
    pub fn new(kind: RecordKind, pid: i32, tty: u32, user: &str, display: Option<&str>) -> Self {
        Self {
            kind,
            pid,
            id: display.map(str::to_string).unwrap_or_else(|| tty.to_string()),
            line: format!("tty{}", tty),
            user: user.to_string(),
            host: display.unwrap_or_default().to_string(),
        }
    }
}

/// A USER_PROCESS entry that is turned into DEAD_PROCESS when closed or dropped.
pub struct UtmpSession {
    record: AccountingRecord,
    closed: bool,
}

impl UtmpSession {
    /// Write the record to utmp and wtmp. Failures are logged only.
    pub fn open(user: &str, pid: i32, tty: u32, display: Option<&str>) -> Self {
        let record = AccountingRecord::new(RecordKind::User, pid, tty, user, display);
        match sys::write_utmp(&record) {
            Ok(()) => info!(user, pid, line = %record.line, host = %record.host, "Added utmp entry"),
            Err(e) => warn!(user, "cannot write utmp entry: {}", e),
        }
        sys::append(Path::new(WTMP_PATH), &record);
        Self {
            record,
            closed: false,
        }
    }

    pub fn close(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.record.kind = RecordKind::Dead;
        if let Err(e) = sys::write_utmp(&self.record) {
            warn!(user = %self.record.user, "cannot close utmp entry: {}", e);
        }
        sys::append(Path::new(WTMP_PATH), &self.record);
        debug!(line = %self.record.line, "Closed utmp entry");
    }
}

impl Drop for UtmpSession {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Record a failed login for the claimed `user` in the btmp file at `path`.
pub fn add_btmp_entry(path: &Path, user: &str, pid: i32, tty: u32) {
    let record = AccountingRecord::new(RecordKind::Login, pid, tty, user, None);
    sys::append(path, &record);
    info!(user, line = %record.line, "Recorded failed login");
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
mod sys {
    use std::ffi::CString;
    use std::io;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    use libc::{c_char, utmpx};
    use tracing::warn;

    use super::{AccountingRecord, RecordKind};

    extern "C" {
        fn updwtmpx(wtmpx_file: *const c_char, utmpx: *const utmpx);
    }

    fn fill(dst: &mut [c_char], src: &str) {
        for (d, s) in dst.iter_mut().zip(src.bytes()) {
            *d = s as c_char;
        }
    }

    /// Take the last bytes of `id`, the way getty derives ids from tty names.
    fn fill_id(dst: &mut [c_char], id: &str) {
        let start = id.len().saturating_sub(dst.len());
        fill(dst, &id[start..]);
    }

    pub(super) fn to_utmpx(record: &AccountingRecord) -> utmpx {
        let mut ut: utmpx = unsafe { std::mem::zeroed() };
        ut.ut_type = match record.kind {
            RecordKind::User => libc::USER_PROCESS,
            RecordKind::Dead => libc::DEAD_PROCESS,
            RecordKind::Login => libc::LOGIN_PROCESS,
        };
        ut.ut_pid = record.pid;
        fill(&mut ut.ut_line, &record.line);
        fill_id(&mut ut.ut_id, &record.id);
        fill(&mut ut.ut_user, &record.user);
        fill(&mut ut.ut_host, &record.host);

        let mut tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        unsafe {
            libc::gettimeofday(&mut tv, std::ptr::null_mut());
        }
        // utmpx keeps a 32-bit timeval on 64-bit glibc.
        ut.ut_tv.tv_sec = tv.tv_sec as _;
        ut.ut_tv.tv_usec = tv.tv_usec as _;
        ut
    }

    pub(super) fn write_utmp(record: &AccountingRecord) -> io::Result<()> {
        let ut = to_utmpx(record);
        let failed = unsafe {
            libc::setutxent();
            let failed = libc::pututxline(&ut).is_null();
            libc::endutxent();
            failed
        };
        if failed {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(super) fn append(path: &Path, record: &AccountingRecord) {
        let Ok(cpath) = CString::new(path.as_os_str().as_bytes()) else {
            warn!(path = %path.display(), "invalid accounting path");
            return;
        };
        let ut = to_utmpx(record);
        unsafe { updwtmpx(cpath.as_ptr(), &ut) };
    }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
mod sys {
    use std::io;
    use std::path::Path;

    use super::AccountingRecord;

    pub(super) fn write_utmp(_record: &AccountingRecord) -> io::Result<()> {
        Ok(())
    }

    pub(super) fn append(_path: &Path, _record: &AccountingRecord) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_for_xorg_session() {
        let rec = AccountingRecord::new(RecordKind::User, 4242, 7, "alice", Some(":1"));
        assert_eq!(rec.line, "tty7");
        assert_eq!(rec.id, ":1");
        assert_eq!(rec.host, ":1");
        assert_eq!(rec.user, "alice");
    }

    #[test]
    fn record_without_display_uses_tty_number() {
        let rec = AccountingRecord::new(RecordKind::Login, 1, 12, "bob", None);
        assert_eq!(rec.id, "12");
        assert_eq!(rec.host, "");
        assert_eq!(rec.line, "tty12");
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn utmpx_layout_is_filled() {
        let rec = AccountingRecord::new(RecordKind::Dead, 99, 3, "carol", Some(":0"));
        let ut = sys::to_utmpx(&rec);
        let text = |field: &[libc::c_char]| -> String {
            field
                .iter()
                .take_while(|c| **c != 0)
                .map(|c| *c as u8 as char)
                .collect()
        };

        assert_eq!(ut.ut_type, libc::DEAD_PROCESS);
        assert_eq!(ut.ut_pid, 99);
        assert_eq!(text(&ut.ut_line), "tty3");
        assert_eq!(text(&ut.ut_user), "carol");
        assert_eq!(text(&ut.ut_host), ":0");
        assert_eq!(text(&ut.ut_id), ":0");
    }
}
