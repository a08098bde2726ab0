//! Session descriptors: discovery from `.desktop` directories, the user
//! override file, the last-session memory and the selection procedure.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::props::{self, Properties};
use crate::sysuser::{self, Sysuser};

const CUSTOM_SESSIONS_PATH: &str = "/etc/emptty/custom-sessions/";
const DESKTOP_GROUP: &str = "Desktop Entry";

/// The kind of graphical environment a session runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnv {
    Xorg,
    Wayland,
    /// System custom session without a display server of its own.
    Custom,
    /// User-provided session without a display server of its own.
    UserCustom,
}

impl SessionEnv {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEnv::Xorg => "xorg",
            SessionEnv::Wayland => "wayland",
            SessionEnv::Custom => "custom",
            SessionEnv::UserCustom => "user-custom",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "xorg" | "x11" => Some(SessionEnv::Xorg),
            "wayland" => Some(SessionEnv::Wayland),
            "custom" => Some(SessionEnv::Custom),
            "user-custom" | "usercustom" => Some(SessionEnv::UserCustom),
            _ => None,
        }
    }

    /// Value for `XDG_SESSION_TYPE`.
    pub fn session_type(&self) -> &'static str {
        match self {
            SessionEnv::Xorg => "x11",
            SessionEnv::Wayland => "wayland",
            SessionEnv::Custom | SessionEnv::UserCustom => "tty",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            SessionEnv::Xorg => "Xorg",
            SessionEnv::Wayland => "Wayland",
            SessionEnv::Custom => "Custom",
            SessionEnv::UserCustom => "User",
        }
    }

    /// Xorg and Wayland sessions may be prefixed with dbus-launch.
    pub fn is_graphical(&self) -> bool {
        matches!(self, SessionEnv::Xorg | SessionEnv::Wayland)
    }
}

impl fmt::Display for SessionEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `SELECTION` in the user override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    Off,
    Always,
    /// Prompt only when more than one session is available.
    Auto,
}

impl SelectionMode {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => SelectionMode::Auto,
            other => match props::parse_bool(other) {
                Some(true) => SelectionMode::Always,
                _ => SelectionMode::Off,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionDescriptor {
    pub name: String,
    pub exec: String,
    pub env: SessionEnv,
    pub origin: PathBuf,
    pub desktop_names: Vec<String>,
    pub selection: SelectionMode,
    pub login_shell: Option<String>,
    pub no_display: bool,
    pub hidden: bool,
    /// Session picked through the user override's selection; this
    /// descriptor then wraps it and `exec` is the override script.
    pub child: Option<Box<SessionDescriptor>>,
}

impl SessionDescriptor {
    pub fn new(
        name: impl Into<String>,
        exec: impl Into<String>,
        env: SessionEnv,
        origin: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            exec: exec.into(),
            env,
            origin: origin.into(),
            desktop_names: Vec::new(),
            selection: SelectionMode::Off,
            login_shell: None,
            no_display: false,
            hidden: false,
            child: None,
        }
    }

    /// Parse the `[Desktop Entry]` group of a `.desktop` file. Entries without
    /// a group header are accepted as a whole (custom sessions).
    pub fn parse_desktop(content: &str, env: SessionEnv, origin: &Path) -> Option<Self> {
        let mut props = Properties::parse_group(content, DESKTOP_GROUP);
        if props.is_empty() {
            props = Properties::parse(content);
        }

        let exec = props.get("Exec")?.trim().to_string();
        if exec.is_empty() {
            return None;
        }
        let name = props
            .get("Name")
            .map(str::to_string)
            .unwrap_or_else(|| file_stem(origin));
        let env = props
            .get_any(&["Environment", "ENV"])
            .and_then(SessionEnv::parse)
            .unwrap_or(env);

        let mut desc = Self::new(name, exec, env, origin);
        desc.desktop_names = props
            .get("DesktopNames")
            .map(|v| {
                v.split(';')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        desc.no_display = props.get_bool("NoDisplay").unwrap_or(false);
        desc.hidden = props.get_bool("Hidden").unwrap_or(false);
        Some(desc)
    }

    pub fn load_desktop(path: &Path, env: SessionEnv) -> Option<Self> {
        match fs::read_to_string(path) {
            Ok(content) => Self::parse_desktop(&content, env, path),
            Err(e) => {
                warn!(path = %path.display(), "cannot read desktop file: {}", e);
                None
            }
        }
    }

    /// The descriptor that actually runs: the selected child, or this one.
    pub fn effective(&self) -> &SessionDescriptor {
        self.child.as_deref().unwrap_or(self)
    }

    /// Last path segment of the first word of `exec`.
    pub fn exec_base(&self) -> &str {
        base_name(self.exec.split_whitespace().next().unwrap_or(""))
    }

    /// Value for `DESKTOP_SESSION` and `XDG_SESSION_DESKTOP`.
    pub fn desktop_name(&self) -> String {
        if self.origin.extension().is_some_and(|e| e == "desktop") {
            return file_stem(&self.origin);
        }
        if let Some(first) = self.desktop_names.first() {
            return first.to_ascii_lowercase();
        }
        self.name.to_ascii_lowercase()
    }

    fn list_name(&self, identify_envs: bool) -> String {
        if identify_envs {
            format!("{} ({})", self.name, self.env.label())
        } else {
            self.name.clone()
        }
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// `$HOME/.config/emptty` or `$HOME/.emptty`.
#[derive(Debug, Clone, PartialEq)]
pub struct UserOverride {
    pub path: PathBuf,
    pub name: Option<String>,
    pub exec: Option<String>,
    pub env: Option<SessionEnv>,
    pub lang: Option<String>,
    pub selection: SelectionMode,
    pub desktop_names: Vec<String>,
    pub login_shell: Option<String>,
}

impl UserOverride {
    pub fn load(home: &Path) -> Option<Self> {
        let candidates = [home.join(".config").join("emptty"), home.join(".emptty")];
        let path = candidates.into_iter().find(|p| p.is_file())?;
        match fs::read_to_string(&path) {
            Ok(content) => Some(Self::parse(&path, &content)),
            Err(e) => {
                warn!(path = %path.display(), "cannot read user config: {}", e);
                None
            }
        }
    }

    pub fn parse(path: &Path, content: &str) -> Self {
        let props = Properties::parse(content);
        let non_empty = |key: &[&str]| {
            props
                .get_any(key)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        Self {
            path: path.to_path_buf(),
            name: non_empty(&["NAME"]),
            exec: non_empty(&["EXEC"]),
            env: props.get("ENVIRONMENT").and_then(SessionEnv::parse),
            lang: non_empty(&["LANG"]),
            selection: props
                .get("SELECTION")
                .map(SelectionMode::parse)
                .unwrap_or(SelectionMode::Off),
            desktop_names: non_empty(&["DESKTOP_NAMES", "XDG_SESSION_DESKTOP"])
                .map(|v| v.split([';', ':']).map(str::to_string).collect())
                .unwrap_or_default(),
            login_shell: non_empty(&["LOGIN_SHELL", "LOGINSHELL"]),
        }
    }

    /// The override's own session, used directly when selection is off.
    pub fn descriptor(&self) -> Option<SessionDescriptor> {
        if self.selection != SelectionMode::Off {
            return None;
        }
        let exec = self.exec.clone()?;
        let mut desc = SessionDescriptor::new(
            self.name.clone().unwrap_or_else(|| "User session".to_string()),
            exec,
            self.env.unwrap_or(SessionEnv::Xorg),
            &self.path,
        );
        desc.desktop_names = self.desktop_names.clone();
        desc.login_shell = self.login_shell.clone();
        Some(desc)
    }

    /// Wrap a selected session so that it runs through the override script.
    pub fn wrap(&self, child: SessionDescriptor) -> SessionDescriptor {
        let mut desc = SessionDescriptor::new(
            child.name.clone(),
            self.path.to_string_lossy().into_owned(),
            child.env,
            &self.path,
        );
        desc.selection = self.selection;
        desc.login_shell = self.login_shell.clone();
        desc.child = Some(Box::new(child));
        desc
    }

    pub fn forces_selection(&self) -> bool {
        self.selection == SelectionMode::Always
    }
}

/// Every session descriptor offered on this system, in discovery order.
#[derive(Debug, Clone, Default)]
pub struct DesktopCatalog {
    descriptors: Vec<SessionDescriptor>,
}

impl DesktopCatalog {
    pub fn scan(conf: &Config, home: &Path) -> Self {
        let dirs = [
            (conf.xorg_sessions_path.clone(), SessionEnv::Xorg),
            (home.join(".local/share/xsessions"), SessionEnv::Xorg),
            (conf.wayland_sessions_path.clone(), SessionEnv::Wayland),
            (home.join(".local/share/wayland-sessions"), SessionEnv::Wayland),
            (PathBuf::from(CUSTOM_SESSIONS_PATH), SessionEnv::Custom),
            (home.join(".config/emptty-custom-sessions"), SessionEnv::UserCustom),
        ];
        Self::scan_dirs(&dirs)
    }

    /// Read `.desktop` files from each directory (sorted by file name) and
    /// drop entries marked `NoDisplay` or `Hidden`.
    pub fn scan_dirs(dirs: &[(PathBuf, SessionEnv)]) -> Self {
        let mut descriptors = Vec::new();
        for (dir, env) in dirs {
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) => {
                    debug!(dir = %dir.display(), "skipping session directory: {}", e);
                    continue;
                }
            };
            let mut paths: Vec<PathBuf> = entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|e| e == "desktop"))
                .collect();
            paths.sort();

            for path in paths {
                match SessionDescriptor::load_desktop(&path, *env) {
                    Some(desc) if desc.no_display || desc.hidden => {
                        debug!(path = %path.display(), "hidden session");
                    }
                    Some(desc) => descriptors.push(desc),
                    None => debug!(path = %path.display(), "desktop file without Exec"),
                }
            }
        }
        Self { descriptors }
    }

    #[cfg(test)]
    pub fn from_descriptors(descriptors: Vec<SessionDescriptor>) -> Self {
        Self { descriptors }
    }

    pub fn descriptors(&self) -> &[SessionDescriptor] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Find a session by exec base name or case-insensitive display name.
    /// Arguments after the first word of `wanted` are appended to the
    /// chosen descriptor's exec when it matched by exec name.
    pub fn find(&self, wanted: &str, filter: Option<SessionEnv>) -> Option<SessionDescriptor> {
        let wanted = wanted.trim();
        if wanted.is_empty() {
            return None;
        }
        let (head, extra) = match wanted.split_once(char::is_whitespace) {
            Some((head, extra)) => (head, extra.trim()),
            None => (wanted, ""),
        };

        let candidates = self
            .descriptors
            .iter()
            .filter(|d| filter.map_or(true, |f| d.env == f));

        for desc in candidates {
            if desc.name.eq_ignore_ascii_case(wanted) {
                return Some(desc.clone());
            }
            if desc.exec_base() == base_name(head) || desc.name.eq_ignore_ascii_case(head) {
                let mut chosen = desc.clone();
                if !extra.is_empty() {
                    chosen.exec = format!("{} {}", chosen.exec, extra);
                }
                return Some(chosen);
            }
        }
        None
    }

    fn index_of(&self, last: &LastSession) -> Option<usize> {
        self.descriptors
            .iter()
            .position(|d| d.exec == last.exec && d.env == last.env)
    }

    pub fn render_list(&self, conf: &Config) -> String {
        let indent = " ".repeat(conf.indent_selection);
        let items: Vec<String> = self
            .descriptors
            .iter()
            .enumerate()
            .map(|(i, d)| format!("[{}] {}", i, d.list_name(conf.identify_envs)))
            .collect();

        if conf.vertical_selection {
            items
                .iter()
                .map(|item| format!("{}{}\n", indent, item))
                .collect()
        } else {
            format!("{}{}\n", indent, items.join(", "))
        }
    }
}

/// `$HOME/.cache/emptty/last-session`: `<exec>;<env>`.
#[derive(Debug, Clone, PartialEq)]
pub struct LastSession {
    pub exec: String,
    pub env: SessionEnv,
}

impl LastSession {
    pub fn path(home: &Path) -> PathBuf {
        home.join(".cache").join("emptty").join("last-session")
    }

    pub fn load(home: &Path) -> Option<Self> {
        fs::read_to_string(Self::path(home))
            .ok()
            .and_then(|c| Self::parse(&c))
    }

    pub fn parse(content: &str) -> Option<Self> {
        let line = content.lines().next()?.trim();
        let (exec, env) = line.rsplit_once(';')?;
        Some(Self {
            exec: exec.to_string(),
            env: SessionEnv::parse(env)?,
        })
    }

    /// Record the session that actually ran, without any wrapping.
    pub fn of(desc: &SessionDescriptor) -> Self {
        let session = desc.effective();
        Self {
            exec: session.exec.clone(),
            env: session.env,
        }
    }

    pub fn render(&self) -> String {
        format!("{};{}\n", self.exec, self.env)
    }

    /// Write the file as the user unless it already holds this session.
    pub fn save(&self, user: &Sysuser) -> Result<()> {
        let path = Self::path(&user.homedir);
        if Self::load(&user.homedir).as_ref() == Some(self) {
            return Ok(());
        }
        sysuser::write_as_user(user, &path, &self.render())?;
        info!(path = %path.display(), exec = %self.exec, "Saved last session");
        Ok(())
    }
}

/// Resolve the session to run.
///
/// Order: the override's own session, the autologin session, the default
/// session, a sole descriptor under auto-selection, then an interactive
/// prompt read through `read`.
pub fn choose(
    conf: &Config,
    catalog: &DesktopCatalog,
    user_override: Option<&UserOverride>,
    last: Option<&LastSession>,
    read: &mut dyn FnMut(&str) -> io::Result<String>,
) -> Result<SessionDescriptor> {
    if let Some(desc) = user_override.and_then(UserOverride::descriptor) {
        info!(exec = %desc.exec, "Using session from user config");
        return Ok(desc);
    }
    if catalog.is_empty() {
        return Err(Error::NoSession("no session descriptors found".to_string()));
    }

    let wrap = |desc: SessionDescriptor| match user_override {
        Some(o) if o.selection != SelectionMode::Off => o.wrap(desc),
        _ => desc,
    };

    if conf.autologin && !conf.autologin_session.is_empty() {
        match catalog.find(&conf.autologin_session, conf.autologin_session_env) {
            Some(desc) => return Ok(wrap(desc)),
            None => warn!(session = %conf.autologin_session, "autologin session not found"),
        }
    }

    let forced = user_override.is_some_and(UserOverride::forces_selection);
    if !conf.default_session.is_empty() && !forced {
        match catalog.find(&conf.default_session, conf.default_session_env) {
            Some(desc) => return Ok(wrap(desc)),
            None => warn!(session = %conf.default_session, "default session not found"),
        }
    }

    let auto = conf.auto_selection
        || user_override.is_some_and(|o| o.selection == SelectionMode::Auto);
    if catalog.len() == 1 && auto {
        return Ok(wrap(catalog.descriptors()[0].clone()));
    }

    let default = last.and_then(|l| catalog.index_of(l));
    let prompt = match default {
        Some(i) => format!("{}Select [{}]: ", catalog.render_list(conf), i),
        None => format!("{}Select: ", catalog.render_list(conf)),
    };
    loop {
        let input = read(&prompt)?;
        match parse_selection(&input, default, catalog.len()) {
            Some(i) => return Ok(wrap(catalog.descriptors()[i].clone())),
            None => debug!(input = %input, "invalid selection"),
        }
    }
}

fn parse_selection(input: &str, default: Option<usize>, len: usize) -> Option<usize> {
    let input = input.trim();
    if input.is_empty() {
        return default;
    }
    input.parse::<usize>().ok().filter(|i| *i < len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desktop(dir: &Path, file: &str, content: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(file), content).unwrap();
    }

    fn catalog() -> DesktopCatalog {
        DesktopCatalog::from_descriptors(vec![
            SessionDescriptor::new("Awesome", "awesome", SessionEnv::Xorg, "/x/awesome.desktop"),
            SessionDescriptor::new("Sway", "/usr/bin/sway", SessionEnv::Wayland, "/w/sway.desktop"),
            SessionDescriptor::new("Plasma (X11)", "startplasma-x11", SessionEnv::Xorg, "/x/plasma.desktop"),
        ])
    }

    /// Feeds scripted answers, failing once they run out.
    fn scripted(answers: &[&str]) -> impl FnMut(&str) -> io::Result<String> {
        let mut answers: Vec<String> = answers.iter().rev().map(|s| s.to_string()).collect();
        move |_prompt: &str| {
            answers
                .pop()
                .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "no more input"))
        }
    }

    #[test]
    fn parses_desktop_entry_group() {
        let content = "[Desktop Entry]\nName=Sway\nExec=sway --debug\nDesktopNames=sway;wlroots\n\
                       [Desktop Action other]\nExec=nope\n";
        let desc = SessionDescriptor::parse_desktop(content, SessionEnv::Wayland, Path::new("/w/sway.desktop")).unwrap();
        assert_eq!(desc.name, "Sway");
        assert_eq!(desc.exec, "sway --debug");
        assert_eq!(desc.env, SessionEnv::Wayland);
        assert_eq!(desc.desktop_names, vec!["sway", "wlroots"]);
        assert_eq!(desc.exec_base(), "sway");
        assert_eq!(desc.desktop_name(), "sway");
    }

    #[test]
    fn custom_session_environment_key() {
        let desc = SessionDescriptor::parse_desktop(
            "Name=Kodi\nExec=kodi-standalone\nEnvironment=wayland\n",
            SessionEnv::Custom,
            Path::new("/etc/emptty/custom-sessions/kodi.desktop"),
        )
        .unwrap();
        assert_eq!(desc.env, SessionEnv::Wayland);

        let bare = SessionDescriptor::parse_desktop("Name=Shell\nExec=bash\n", SessionEnv::Custom, Path::new("s.desktop")).unwrap();
        assert_eq!(bare.env, SessionEnv::Custom);
        assert!(SessionDescriptor::parse_desktop("Name=NoExec\n", SessionEnv::Xorg, Path::new("n.desktop")).is_none());
    }

    #[test]
    fn scan_orders_and_skips_hidden_entries() {
        let dir = tempfile::tempdir().unwrap();
        let x = dir.path().join("xsessions");
        let w = dir.path().join("wayland-sessions");
        desktop(&x, "i3.desktop", "[Desktop Entry]\nName=i3\nExec=i3\n");
        desktop(&x, "awesome.desktop", "[Desktop Entry]\nName=Awesome\nExec=awesome\n");
        desktop(&x, "hidden.desktop", "[Desktop Entry]\nName=Hidden\nExec=hidden\nNoDisplay=true\n");
        desktop(&x, "readme.txt", "not a session");
        desktop(&w, "sway.desktop", "[Desktop Entry]\nName=Sway\nExec=sway\nHidden=true\n");
        desktop(&w, "river.desktop", "[Desktop Entry]\nName=River\nExec=river\n");

        let catalog = DesktopCatalog::scan_dirs(&[
            (x, SessionEnv::Xorg),
            (dir.path().join("missing"), SessionEnv::Xorg),
            (w, SessionEnv::Wayland),
        ]);
        let names: Vec<&str> = catalog.descriptors().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["Awesome", "i3", "River"]);
        assert_eq!(catalog.descriptors()[2].env, SessionEnv::Wayland);
    }

    #[test]
    fn find_by_exec_base_or_name() {
        let catalog = catalog();
        assert_eq!(catalog.find("sway", None).unwrap().name, "Sway");
        assert_eq!(catalog.find("/opt/bin/awesome", None).unwrap().name, "Awesome");
        assert_eq!(catalog.find("plasma (x11)", None).unwrap().exec, "startplasma-x11");
        assert!(catalog.find("sway", Some(SessionEnv::Xorg)).is_none());
        assert!(catalog.find("gnome", None).is_none());
        assert!(catalog.find("   ", None).is_none());
    }

    #[test]
    fn find_appends_extra_arguments() {
        let found = catalog().find("sway --unsupported-gpu", Some(SessionEnv::Wayland)).unwrap();
        assert_eq!(found.exec, "/usr/bin/sway --unsupported-gpu");
    }

    #[test]
    fn render_list_layouts() {
        let catalog = catalog();
        let conf = Config {
            identify_envs: true,
            ..Config::default()
        };
        assert_eq!(
            catalog.render_list(&conf),
            "[0] Awesome (Xorg), [1] Sway (Wayland), [2] Plasma (X11) (Xorg)\n"
        );

        let conf = Config {
            vertical_selection: true,
            indent_selection: 2,
            ..Config::default()
        };
        assert_eq!(catalog.render_list(&conf), "  [0] Awesome\n  [1] Sway\n  [2] Plasma (X11)\n");
    }

    #[test]
    fn autologin_session_is_selected_without_prompt() {
        let conf = Config {
            autologin: true,
            autologin_session: "awesome".to_string(),
            ..Config::default()
        };
        let mut read = scripted(&[]);
        let desc = choose(&conf, &catalog(), None, None, &mut read).unwrap();
        assert_eq!(desc.exec, "awesome");
    }

    #[test]
    fn default_session_respects_env_filter() {
        let conf = Config {
            default_session: "sway".to_string(),
            default_session_env: Some(SessionEnv::Wayland),
            ..Config::default()
        };
        let mut read = scripted(&[]);
        let desc = choose(&conf, &catalog(), None, None, &mut read).unwrap();
        assert_eq!(desc.env, SessionEnv::Wayland);
    }

    #[test]
    fn single_descriptor_auto_selection() {
        let only = DesktopCatalog::from_descriptors(vec![SessionDescriptor::new(
            "Sway",
            "sway",
            SessionEnv::Wayland,
            "/w/sway.desktop",
        )]);
        let conf = Config {
            auto_selection: true,
            ..Config::default()
        };
        let mut read = scripted(&[]);
        assert_eq!(choose(&conf, &only, None, None, &mut read).unwrap().exec, "sway");
    }

    #[test]
    fn prompt_reprompts_on_bad_input_and_defaults_to_last() {
        let last = LastSession {
            exec: "/usr/bin/sway".to_string(),
            env: SessionEnv::Wayland,
        };
        let mut read = scripted(&["x", "7", ""]);
        let desc = choose(&Config::default(), &catalog(), None, Some(&last), &mut read).unwrap();
        assert_eq!(desc.name, "Sway");

        let mut read = scripted(&["2"]);
        let desc = choose(&Config::default(), &catalog(), None, Some(&last), &mut read).unwrap();
        assert_eq!(desc.name, "Plasma (X11)");
    }

    #[test]
    fn empty_input_without_last_session_reprompts() {
        let mut read = scripted(&["", "0"]);
        let desc = choose(&Config::default(), &catalog(), None, None, &mut read).unwrap();
        assert_eq!(desc.name, "Awesome");
    }

    #[test]
    fn override_with_exec_and_no_selection_is_used_directly() {
        let ov = UserOverride::parse(
            Path::new("/home/alice/.config/emptty"),
            "#!/bin/sh\nNAME=My i3\nEXEC=i3 -c /tmp/cfg\nENVIRONMENT=xorg\nLANG=cs_CZ.UTF-8\n",
        );
        let mut read = scripted(&[]);
        let desc = choose(&Config::default(), &catalog(), Some(&ov), None, &mut read).unwrap();
        assert_eq!(desc.name, "My i3");
        assert_eq!(desc.exec, "i3 -c /tmp/cfg");
        assert_eq!(desc.env, SessionEnv::Xorg);
        assert_eq!(ov.lang.as_deref(), Some("cs_CZ.UTF-8"));
    }

    #[test]
    fn override_without_environment_defaults_to_xorg() {
        let ov = UserOverride::parse(Path::new("/home/a/.emptty"), "EXEC=startxfce4\n");
        assert_eq!(ov.descriptor().unwrap().env, SessionEnv::Xorg);
    }

    #[test]
    fn override_selection_wraps_the_chosen_session() {
        let ov = UserOverride::parse(
            Path::new("/home/alice/.config/emptty"),
            "SELECTION=true\nLOGIN_SHELL=/bin/bash\n",
        );
        let conf = Config {
            default_session: "awesome".to_string(),
            ..Config::default()
        };
        let mut read = scripted(&["1"]);
        let desc = choose(&conf, &catalog(), Some(&ov), None, &mut read).unwrap();

        assert_eq!(desc.exec, "/home/alice/.config/emptty");
        assert_eq!(desc.env, SessionEnv::Wayland);
        assert_eq!(desc.login_shell.as_deref(), Some("/bin/bash"));
        assert_eq!(desc.effective().exec, "/usr/bin/sway");
    }

    #[test]
    fn no_descriptors_is_an_error() {
        let mut read = scripted(&[]);
        let err = choose(&Config::default(), &DesktopCatalog::default(), None, None, &mut read).unwrap_err();
        assert!(matches!(err, Error::NoSession(_)));
    }

    #[test]
    fn last_session_format() {
        let last = LastSession::parse("awesome;xorg\n").unwrap();
        assert_eq!(last.exec, "awesome");
        assert_eq!(last.env, SessionEnv::Xorg);
        assert_eq!(last.render(), "awesome;xorg\n");
        assert!(LastSession::parse("garbage").is_none());
        assert!(LastSession::parse("x;unknown").is_none());

        let ov = UserOverride::parse(Path::new("/h/.emptty"), "SELECTION=auto\n");
        let wrapped = ov.wrap(SessionDescriptor::new("Sway", "sway", SessionEnv::Wayland, "/w/sway.desktop"));
        assert_eq!(LastSession::of(&wrapped).render(), "sway;wayland\n");
    }
}
