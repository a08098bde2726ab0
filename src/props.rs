//! `KEY=VALUE` property files.
//!
//! Used for `/etc/emptty/conf`, the user override in `$HOME/.config/emptty`
//! and the `[Desktop Entry]` group of `.desktop` files.

use std::fs;
use std::io;
use std::path::Path;

/// Ordered list of key/value pairs read from a property file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    entries: Vec<(String, String)>,
}

impl Properties {
    /// Parse every `KEY=VALUE` line, ignoring `[group]` headers.
    pub fn parse(content: &str) -> Self {
        Self::parse_filtered(content, None)
    }

    /// Parse only the lines that belong to `[group]`.
    pub fn parse_group(content: &str, group: &str) -> Self {
        Self::parse_filtered(content, Some(group))
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        Ok(Self::parse(&fs::read_to_string(path)?))
    }

    fn parse_filtered(content: &str, group: Option<&str>) -> Self {
        let mut entries = Vec::new();
        let mut current_group: Option<&str> = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                current_group = Some(&line[1..line.len() - 1]);
                continue;
            }
            if let Some(wanted) = group {
                if current_group != Some(wanted) {
                    continue;
                }
            }

            let line = line.strip_prefix("export ").unwrap_or(line);
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            if key.is_empty() || key.contains(char::is_whitespace) {
                continue;
            }
            entries.push((key.to_string(), unquote(value.trim()).to_string()));
        }

        Self { entries }
    }

    /// Last value for `key`, compared case-insensitively.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// First present key out of several aliases.
    pub fn get_any(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|k| self.get(k))
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(parse_bool)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Render pairs back into property syntax, quoting values that need it.
pub fn render<'a>(entries: impl IntoIterator<Item = (&'a str, String)>) -> String {
    let mut out = String::new();
    for (key, value) in entries {
        let quoted_edge = |c: char| c == '"' || c == '\'';
        if value.is_empty()
            || value.contains(char::is_whitespace)
            || value.contains('#')
            || value.starts_with(quoted_edge)
            || value.ends_with(quoted_edge)
        {
            out.push_str(&format!("{}=\"{}\"\n", key, value));
        } else {
            out.push_str(&format!("{}={}\n", key, value));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_exports_quotes_and_comments() {
        let props = Properties::parse(
            "# comment\n\nexport TTY_NUMBER=7\nLANG=\"cs_CZ.UTF-8\"\nXORG_ARGS='-nolisten tcp'\nnot a property\n",
        );
        assert_eq!(props.get("TTY_NUMBER"), Some("7"));
        assert_eq!(props.get("lang"), Some("cs_CZ.UTF-8"));
        assert_eq!(props.get("XORG_ARGS"), Some("-nolisten tcp"));
        assert_eq!(props.iter().count(), 3);
    }

    #[test]
    fn later_keys_override_earlier_ones() {
        let props = Properties::parse("A=1\nA=2\n");
        assert_eq!(props.get("A"), Some("2"));
    }

    #[test]
    fn group_filter_skips_other_sections() {
        let content = "[Desktop Entry]\nName=Sway\nExec=sway\n[Desktop Action new]\nExec=other\n";
        let props = Properties::parse_group(content, "Desktop Entry");
        assert_eq!(props.get("Exec"), Some("sway"));
        assert_eq!(props.iter().count(), 2);
    }

    #[test]
    fn bool_values() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("no"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn render_quotes_when_needed() {
        let out = render([("A", "x".to_string()), ("B", "a b".to_string()), ("C", String::new())]);
        assert_eq!(out, "A=x\nB=\"a b\"\nC=\"\"\n");
        let back = Properties::parse(&out);
        assert_eq!(back.get("B"), Some("a b"));
        assert_eq!(back.get("C"), Some(""));
    }

    #[test]
    fn render_keeps_values_wrapped_in_quotes() {
        let out = render([
            ("A", "\"x\"".to_string()),
            ("B", "'y'".to_string()),
            ("C", "'z\"".to_string()),
            ("D", "w'".to_string()),
        ]);
        let back = Properties::parse(&out);
        assert_eq!(back.get("A"), Some("\"x\""));
        assert_eq!(back.get("B"), Some("'y'"));
        assert_eq!(back.get("C"), Some("'z\""));
        assert_eq!(back.get("D"), Some("w'"));
    }
}
