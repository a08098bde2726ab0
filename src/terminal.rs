//! Controlling tty: ownership, clearing, colors, vt switching, leds and prompts.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::PathBuf;
use std::process::Command;

use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg, Termios};
use tracing::{debug, warn};

use crate::error::{Error, Result};

const KDSETLED: u32 = 0x4B32;
const LED_NUM: u8 = 0x02;

nix::ioctl_write_int_bad!(kd_set_led, KDSETLED);

pub fn tty_path(tty: u32) -> PathBuf {
    PathBuf::from(format!("/dev/tty{}", tty))
}

/// The tty behind stdin, e.g. `3` for `/dev/tty3`.
pub fn current_tty() -> Option<u32> {
    let target = fs::read_link("/proc/self/fd/0").ok()?;
    target
        .to_str()?
        .strip_prefix("/dev/tty")?
        .parse()
        .ok()
}

/// `/dev/tty<N>` opened read/write by the supervisor in daemon mode.
pub struct Terminal {
    file: File,
    tty: u32,
}

impl Terminal {
    pub fn open(tty: u32) -> Result<Self> {
        let path = tty_path(tty);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::Config(format!("cannot open {}: {}", path.display(), e)))?;
        debug!(path = %path.display(), "Opened terminal");
        Ok(Self { file, tty })
    }

    /// Point stdin, stdout and stderr at this terminal.
    pub fn redirect_stdio(&self) -> Result<()> {
        let fd = self.file.as_raw_fd();
        for target in 0..=2 {
            if unsafe { libc::dup2(fd, target) } < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    pub fn path(&self) -> PathBuf {
        tty_path(self.tty)
    }
}

impl AsFd for Terminal {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

/// Activate vt `tty` through `chvt`.
pub fn switch_vt(tty: u32) {
    match Command::new("chvt").arg(tty.to_string()).status() {
        Ok(status) if status.success() => debug!(tty, "Switched vt"),
        Ok(status) => warn!(tty, %status, "chvt failed"),
        Err(e) => warn!(tty, "cannot run chvt: {}", e),
    }
}

/// Turn the numlock led on.
pub fn set_numlock(fd: BorrowedFd<'_>) -> Result<()> {
    unsafe { kd_set_led(fd.as_raw_fd(), LED_NUM as _) }?;
    Ok(())
}

pub fn clear_screen() {
    print!("\x1b[H\x1b[2J");
    let _ = io::stdout().flush();
}

/// ANSI foreground code for a named color, e.g. `LIGHT_BLUE` -> 94.
pub fn color_code(name: &str) -> Option<u8> {
    let name = name.trim().to_ascii_uppercase();
    let (base, light) = match name.strip_prefix("LIGHT_") {
        Some(rest) => (rest.to_string(), true),
        None => (name, false),
    };
    let code = match base.as_str() {
        "BLACK" => 30,
        "RED" => 31,
        "GREEN" => 32,
        "YELLOW" => 33,
        "BLUE" => 34,
        "PURPLE" => 35,
        "CYAN" => 36,
        "WHITE" => 37,
        _ => return None,
    };
    Some(if light { code + 60 } else { code })
}

/// Escape sequence for the configured colors, `None` when neither is set.
pub fn color_sequence(fg: &str, bg: &str) -> Option<String> {
    let lookup = |name: &str| {
        if name.is_empty() {
            return None;
        }
        let code = color_code(name);
        if code.is_none() {
            warn!(color = name, "unknown color");
        }
        code
    };

    let fg = lookup(fg);
    let bg = lookup(bg).map(|c| c + 10);
    let codes: Vec<String> = [fg, bg].iter().flatten().map(|c| c.to_string()).collect();
    if codes.is_empty() {
        return None;
    }
    Some(format!("\x1b[0;{}m", codes.join(";")))
}

pub fn set_colors(fg: &str, bg: &str) {
    if let Some(seq) = color_sequence(fg, bg) {
        print!("{}", seq);
        let _ = io::stdout().flush();
    }
}

pub fn reset_colors() {
    print!("\x1b[0m");
    let _ = io::stdout().flush();
}

/// Print `prompt` and read one line from stdin, without the trailing newline.
pub fn read_line(prompt: &str) -> io::Result<String> {
    print!("{}", prompt);
    io::stdout().flush()?;

    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "stdin closed"));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Like [`read_line`] with terminal echo switched off for the duration of the read.
pub fn read_password(prompt: &str) -> io::Result<String> {
    let guard = EchoGuard::disable()?;
    let line = read_line(prompt);
    drop(guard);
    println!();
    line
}

/// Block until the user presses enter.
pub fn press_enter() {
    let _ = read_line("Press Enter to continue...");
}

/// Restores the saved termios settings of stdin when dropped.
struct EchoGuard {
    saved: Option<Termios>,
}

impl EchoGuard {
    fn disable() -> io::Result<Self> {
        let stdin = io::stdin();
        let saved = match tcgetattr(&stdin) {
            Ok(termios) => termios,
            // Not a terminal: nothing to hide.
            Err(_) => return Ok(Self { saved: None }),
        };
        let mut quiet = saved.clone();
        quiet.local_flags.remove(LocalFlags::ECHO);
        tcsetattr(&stdin, SetArg::TCSANOW, &quiet).map_err(io::Error::from)?;
        Ok(Self { saved: Some(saved) })
    }
}

impl Drop for EchoGuard {
    fn drop(&mut self) {
        if let Some(saved) = &self.saved {
            let _ = tcsetattr(io::stdin(), SetArg::TCSANOW, saved);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_colors() {
        assert_eq!(color_code("black"), Some(30));
        assert_eq!(color_code("WHITE"), Some(37));
        assert_eq!(color_code("LIGHT_BLUE"), Some(94));
        assert_eq!(color_code("MAGENTA"), None);
    }

    #[test]
    fn color_sequences() {
        assert_eq!(color_sequence("RED", "BLACK").as_deref(), Some("\x1b[0;31;40m"));
        assert_eq!(color_sequence("", "LIGHT_CYAN").as_deref(), Some("\x1b[0;106m"));
        assert_eq!(color_sequence("LIGHT_GREEN", "").as_deref(), Some("\x1b[0;92m"));
        assert_eq!(color_sequence("", ""), None);
        assert_eq!(color_sequence("NOPE", ""), None);
    }

    #[test]
    fn tty_paths() {
        assert_eq!(tty_path(7), PathBuf::from("/dev/tty7"));
    }
}
