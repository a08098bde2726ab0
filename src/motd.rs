//! `/etc/issue` rendering and the message of the day.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;

use tracing::{debug, warn};

use crate::config::Config;

const ISSUE_PATH: &str = "/etc/issue";

const BANNER: &str = "┌─┐┌┬┐┌─┐┌┬┐┌┬┐┬ ┬\n├┤ │││├─┘ │  │ └┬┘\n└─┘┴ ┴┴   ┴  ┴  ┴ \n";

pub fn print_issue(conf: &Config) {
    match fs::read_to_string(ISSUE_PATH) {
        Ok(raw) => print!("{}", render_issue(&raw, conf.tty, run_for_output)),
        Err(e) => debug!("no issue file: {}", e),
    }
}

/// Expand issue escapes. `eval` runs a command and returns its trimmed stdout.
pub fn render_issue(raw: &str, tty: u32, eval: impl Fn(&str, &[&str]) -> String) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some('d') => {
                chars.next();
                out.push_str(&eval("date", &["+%a %b %_d %Y"]));
            }
            Some('t') => {
                chars.next();
                out.push_str(&eval("date", &["+%T"]));
            }
            Some('l') => {
                chars.next();
                out.push_str(&format!("tty{}", tty));
            }
            Some(flag @ ('m' | 'n' | 'r' | 's')) => {
                chars.next();
                out.push_str(&eval("uname", &[&format!("-{}", flag)]));
            }
            Some('\\') => {
                chars.next();
                out.push('\\');
            }
            Some('x') => {
                chars.next();
                let mut hex = String::new();
                while hex.len() < 2 {
                    match chars.peek() {
                        Some(h) if h.is_ascii_hexdigit() => {
                            hex.push(*h);
                            chars.next();
                        }
                        _ => break,
                    }
                }
                // Only ASCII maps to a single output byte; others stay literal.
                match u8::from_str_radix(&hex, 16) {
                    Ok(byte) if byte.is_ascii() => out.push(byte as char),
                    _ => {
                        out.push_str("\\x");
                        out.push_str(&hex);
                    }
                }
            }
            Some('0') => {
                let rest: String = chars.clone().take(3).collect();
                if rest == "033" {
                    chars.nth(2);
                    out.push('\x1b');
                } else {
                    out.push('\\');
                }
            }
            _ => out.push('\\'),
        }
    }
    out
}

fn run_for_output(program: &str, args: &[&str]) -> String {
    match Command::new(program).args(args).output() {
        Ok(output) => String::from_utf8_lossy(&output.stdout).trim().to_string(),
        Err(e) => {
            warn!(program, "cannot evaluate issue escape: {}", e);
            String::new()
        }
    }
}

/// Dynamic motd when configured and executable, else the static file, else the banner.
pub fn print_motd(conf: &Config) {
    print!("{}", motd_text(conf));
}

fn motd_text(conf: &Config) -> String {
    if conf.dynamic_motd && is_executable(&conf.dynamic_motd_path) {
        match Command::new(&conf.dynamic_motd_path).output() {
            Ok(output) => return String::from_utf8_lossy(&output.stdout).into_owned(),
            Err(e) => warn!(path = %conf.dynamic_motd_path.display(), "dynamic motd failed: {}", e),
        }
    }
    match fs::read_to_string(&conf.motd_path) {
        Ok(text) => text,
        Err(e) => {
            debug!(path = %conf.motd_path.display(), "no motd: {}", e);
            BANNER.to_string()
        }
    }
}

pub fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
