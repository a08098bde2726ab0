//! Runs one login end to end: tty, authentication, session selection,
//! environment, carrier, the session itself and the teardown that follows.

use std::io;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, Signal as SignalStream, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::accounting::{self, UtmpSession};
use crate::auth::{self, Authenticator};
use crate::carrier::Carrier;
use crate::config::Config;
use crate::dbus::DBusLauncher;
use crate::desktop::{self, DesktopCatalog, LastSession, SessionDescriptor, SessionEnv, UserOverride};
use crate::error::{Error, Result};
use crate::logging;
use crate::motd;
use crate::sysuser::Sysuser;
use crate::terminal::{self, Terminal};

const DEFAULT_SHELL: &str = "/bin/sh";
const RETRY_PAUSE: Duration = Duration::from_secs(1);

/// How the session command is started.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandPlan {
    /// Program and arguments, or a single script when `shell` is set.
    pub argv: Vec<String>,
    /// Run `argv[0]` through `<shell> -c`.
    pub shell: Option<String>,
    /// Start a session bus first.
    pub dbus: bool,
}

impl CommandPlan {
    pub fn build(conf: &Config, desc: &SessionDescriptor, user: &Sysuser) -> Result<Self> {
        if let Some(child) = &desc.child {
            let shell = desc
                .login_shell
                .clone()
                .unwrap_or_else(|| DEFAULT_SHELL.to_string());
            return Ok(Self {
                argv: vec![format!("{} {}", desc.exec, child.exec)],
                shell: Some(shell),
                dbus: false,
            });
        }

        let exec = desc.exec.trim();
        if exec.is_empty() {
            return Err(Error::Session(format!("session '{}' has no command", desc.name)));
        }

        let xinitrc = user.homedir.join(".xinitrc");
        if desc.env == SessionEnv::Xorg
            && conf.xinitrc_launch
            && !exec.contains(".xinitrc")
            && xinitrc.is_file()
        {
            return Ok(Self {
                argv: vec![format!("{} {}", xinitrc.display(), exec)],
                shell: Some(DEFAULT_SHELL.to_string()),
                dbus: false,
            });
        }

        Ok(Self {
            argv: exec.split_whitespace().map(str::to_string).collect(),
            shell: None,
            dbus: conf.dbus_launch && !exec.contains("dbus-launch") && desc.env.is_graphical(),
        })
    }

    /// Human readable command line, e.g. `dbus-launch awesome`.
    pub fn literal(&self) -> String {
        let cmd = self.argv.join(" ");
        if self.dbus {
            format!("dbus-launch {}", cmd)
        } else {
            cmd
        }
    }

    /// The session command with the user's credentials, environment and home directory.
    pub fn command(&self, user: &Sysuser) -> std::process::Command {
        match &self.shell {
            Some(shell) => {
                let mut words = shell.split_whitespace();
                let mut cmd = user.command(words.next().unwrap_or(DEFAULT_SHELL));
                cmd.args(words).arg("-c").args(&self.argv);
                cmd
            }
            None => {
                let mut cmd = user.command(&self.argv[0]);
                cmd.args(&self.argv[1..]);
                cmd
            }
        }
    }
}

fn termination_signals() -> [(SignalKind, Signal); 4] {
    [
        (SignalKind::interrupt(), Signal::SIGINT),
        (SignalKind::terminate(), Signal::SIGTERM),
        (SignalKind::hangup(), Signal::SIGHUP),
        (SignalKind::quit(), Signal::SIGQUIT),
    ]
}

/// Termination signals caught by this process.
///
/// While it lives, the listened signals no longer kill the process: each one
/// sets the interrupted flag and is queued for the supervisor.
struct Interrupts {
    rx: mpsc::Receiver<Signal>,
    listeners: Vec<JoinHandle<()>>,
}

impl Interrupts {
    fn listen(interrupted: Arc<AtomicBool>) -> io::Result<Self> {
        Self::listen_to(&termination_signals(), interrupted)
    }

    fn listen_to(kinds: &[(SignalKind, Signal)], interrupted: Arc<AtomicBool>) -> io::Result<Self> {
        let mut streams = Vec::with_capacity(kinds.len());
        for &(kind, sig) in kinds {
            streams.push((signal(kind)?, sig));
        }

        let (tx, rx) = mpsc::channel(4);
        let listeners = streams
            .into_iter()
            .map(|(stream, sig)| {
                tokio::spawn(forward_signal(stream, sig, Arc::clone(&interrupted), tx.clone()))
            })
            .collect();
        Ok(Self { rx, listeners })
    }

    async fn recv(&mut self) -> Option<Signal> {
        self.rx.recv().await
    }
}

impl Drop for Interrupts {
    fn drop(&mut self) {
        for listener in &self.listeners {
            listener.abort();
        }
    }
}

pub struct Supervisor {
    conf: Config,
    interrupted: Arc<AtomicBool>,
    btmp_path: PathBuf,
    retry_pause: Duration,
}

impl Supervisor {
    pub fn new(conf: Config) -> Self {
        Self {
            conf,
            interrupted: Arc::new(AtomicBool::new(false)),
            btmp_path: PathBuf::from(accounting::BTMP_PATH),
            retry_pause: RETRY_PAUSE,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let terminal = self.acquire_terminal()?;
        let mut auth = auth::new_authenticator();
        let result = self.login_and_run(auth.as_mut()).await;
        self.release_terminal(terminal);
        result
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    fn acquire_terminal(&self) -> Result<Option<Terminal>> {
        let terminal = if self.conf.daemon_mode {
            let terminal = Terminal::open(self.conf.tty)?;
            terminal.redirect_stdio()?;
            if self.conf.switch_tty && self.conf.tty > 0 {
                terminal::switch_vt(self.conf.tty);
            }
            Some(terminal)
        } else {
            None
        };

        terminal::set_colors(&self.conf.fg_color, &self.conf.bg_color);
        terminal::clear_screen();
        if self.conf.print_issue {
            motd::print_issue(&self.conf);
        }
        if self.conf.print_motd {
            motd::print_motd(&self.conf);
        }
        if self.conf.enable_numlock {
            let stdin = io::stdin();
            let result = match &terminal {
                Some(t) => terminal::set_numlock(t.as_fd()),
                None => terminal::set_numlock(stdin.as_fd()),
            };
            if let Err(e) = result {
                warn!("cannot enable numlock: {}", e);
            }
        }
        Ok(terminal)
    }

    fn release_terminal(&self, terminal: Option<Terminal>) {
        terminal::clear_screen();
        terminal::reset_colors();
        if let Some(t) = terminal {
            debug!(path = %t.path().display(), "Closing terminal");
        }
    }

    /// Everything between the terminal setup and its release. A successful
    /// `authenticate` is paired with exactly one `auth.close()`.
    async fn login_and_run(&self, auth: &mut dyn Authenticator) -> Result<()> {
        let mut user = self.authenticate(auth).await?;
        auth::remember_user(&self.conf, &user.username);

        let (desc, lang) = match self.choose_session(&user) {
            Ok(chosen) => chosen,
            Err(e) => {
                auth.close();
                return Err(e);
            }
        };

        // No more prompts from here on, so signals can be caught until teardown.
        let mut interrupts = match Interrupts::listen(Arc::clone(&self.interrupted)) {
            Ok(interrupts) => interrupts,
            Err(e) => {
                auth.close();
                return Err(Error::Io(e));
            }
        };
        if let Err(e) = self.stage(auth, &mut user, &desc, &lang) {
            auth.close();
            return Err(e);
        }

        run_display_script(&self.conf.display_start_script, &user);
        let result = self.run_session(&mut user, &desc, &mut interrupts).await;
        auth.close();

        if result.is_ok() && !self.is_interrupted() {
            if let Err(e) = LastSession::of(&desc).save(&user) {
                warn!(user = %user.username, "cannot save last session: {}", e);
            }
        }
        run_display_script(&self.conf.display_stop_script, &user);
        result
    }

    /// Authenticate, recording failures in btmp. Autologin retries up to
    /// `AUTOLOGIN_MAX_RETRY` times (negative means forever).
    async fn authenticate(&self, auth: &mut dyn Authenticator) -> Result<Sysuser> {
        let mut attempt: i32 = 0;
        loop {
            match auth.authenticate(&self.conf) {
                Ok(user) => return Ok(user),
                Err(e) if e.is_auth() => {
                    accounting::add_btmp_entry(
                        &self.btmp_path,
                        auth.claimed_user(),
                        std::process::id() as i32,
                        self.conf.tty,
                    );
                    let max = self.conf.autologin_max_retry;
                    if !self.conf.autologin || (max >= 0 && attempt >= max) {
                        return Err(e);
                    }
                    attempt += 1;
                    warn!(attempt, "autologin failed, retrying: {}", e);
                    tokio::time::sleep(self.retry_pause).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn choose_session(&self, user: &Sysuser) -> Result<(SessionDescriptor, String)> {
        let (user_override, catalog, last) = {
            let _identity = user.assume_fs_identity()?;
            (
                UserOverride::load(&user.homedir),
                DesktopCatalog::scan(&self.conf, &user.homedir),
                LastSession::load(&user.homedir),
            )
        };
        debug!(sessions = catalog.len(), has_override = user_override.is_some(), "Loaded sessions");

        let desc = desktop::choose(
            &self.conf,
            &catalog,
            user_override.as_ref(),
            last.as_ref(),
            &mut terminal::read_line,
        )?;
        let lang = user_override
            .and_then(|o| o.lang)
            .unwrap_or_else(|| self.conf.lang.clone());
        info!(
            session = %desc.name,
            exec = %desc.exec,
            env = %desc.effective().env,
            selection = ?desc.selection,
            "Selected session"
        );
        Ok((desc, lang))
    }

    fn stage(
        &self,
        auth: &mut dyn Authenticator,
        user: &mut Sysuser,
        desc: &SessionDescriptor,
        lang: &str,
    ) -> Result<()> {
        auth.open_session(desc.effective().env.session_type())?;
        auth.export_env(user);
        user.stage_environment(&self.conf, desc, lang);
        user.ensure_runtime_dir()
    }

    async fn run_session(
        &self,
        user: &mut Sysuser,
        desc: &SessionDescriptor,
        interrupts: &mut Interrupts,
    ) -> Result<()> {
        if self.is_interrupted() {
            info!("Interrupted before the session started");
            return Ok(());
        }

        let mut carrier = Carrier::for_env(desc.effective().env, &self.conf);
        let started = tokio::select! {
            result = carrier.start(user) => result,
            Some(sig) = interrupts.recv() => {
                warn!(signal = ?sig, "Interrupted while starting the display server");
                Ok(())
            }
        };
        if let Err(e) = started {
            carrier.stop().await;
            return Err(e);
        }
        if self.is_interrupted() {
            carrier.stop().await;
            info!("Interrupted before the session started");
            return Ok(());
        }
        debug!(state = ?carrier.state(), display = ?carrier.display(), "Carrier started");

        let plan = match CommandPlan::build(&self.conf, desc, user) {
            Ok(plan) => plan,
            Err(e) => {
                carrier.stop().await;
                return Err(e);
            }
        };
        let bus = if plan.dbus {
            match DBusLauncher::launch(user) {
                Ok(bus) => Some(bus),
                Err(e) => {
                    warn!("continuing without session bus: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let mut cmd = Command::from(plan.command(user));
        cmd.stderr(self.session_error_sink());
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                if let Some(bus) = bus {
                    bus.stop();
                }
                carrier.stop().await;
                return Err(Error::Session(format!("cannot start '{}': {}", plan.literal(), e)));
            }
        };
        let session_pid = child.id().map(|id| Pid::from_raw(id as i32));
        info!(pid = ?session_pid, command = %plan.literal(), user = %user.username, "Session started");

        let record_pid = carrier.pid().or(session_pid).map(Pid::as_raw).unwrap_or(-1);
        let utmp = UtmpSession::open(&user.username, record_pid, self.conf.tty, carrier.display());

        let status = self.supervise(&mut child, carrier.pid(), interrupts).await;

        if let Some(bus) = bus {
            bus.stop();
        }
        carrier.stop().await;
        utmp.close();

        self.session_outcome(status)
    }

    fn session_outcome(&self, status: io::Result<ExitStatus>) -> Result<()> {
        let interrupted = self.is_interrupted();
        match status {
            Ok(status) if status.success() => {
                info!("Session finished");
                Ok(())
            }
            Ok(status) if interrupted => {
                info!(%status, "Session ended after interrupt");
                Ok(())
            }
            Ok(status) => {
                error!(%status, "Session failed");
                Err(Error::Session(format!(
                    "session exited with {}, please check logs",
                    status
                )))
            }
            Err(e) if interrupted => {
                warn!("waiting for session after interrupt: {}", e);
                Ok(())
            }
            Err(e) => Err(Error::Session(format!("waiting for session: {}", e))),
        }
    }

    /// Wait for the session while forwarding termination signals to it and
    /// to the carrier.
    async fn supervise(
        &self,
        child: &mut Child,
        carrier_pid: Option<Pid>,
        interrupts: &mut Interrupts,
    ) -> io::Result<ExitStatus> {
        let session_pid = child.id().map(|id| Pid::from_raw(id as i32));

        loop {
            tokio::select! {
                status = child.wait() => return status,
                Some(sig) = interrupts.recv() => {
                    warn!(signal = ?sig, "Interrupted, stopping session");
                    for pid in [session_pid, carrier_pid].into_iter().flatten() {
                        if let Err(e) = kill(pid, Signal::SIGINT) {
                            debug!(%pid, "cannot forward signal: {}", e);
                        }
                    }
                }
            }
        }
    }

    fn session_error_sink(&self) -> Stdio {
        let path = self.conf.session_error_log_file();
        match logging::open_sink(&path, self.conf.session_error_logging) {
            Ok(Some(file)) => Stdio::from(file),
            Ok(None) => Stdio::null(),
            Err(e) => {
                warn!(path = %path.display(), "cannot open session error log: {}", e);
                Stdio::null()
            }
        }
    }
}

async fn forward_signal(
    mut stream: SignalStream,
    sig: Signal,
    interrupted: Arc<AtomicBool>,
    tx: mpsc::Sender<Signal>,
) {
    while stream.recv().await.is_some() {
        interrupted.store(true, Ordering::SeqCst);
        if tx.send(sig).await.is_err() {
            return;
        }
    }
}

/// Run a display start/stop script as root with the session environment.
fn run_display_script(path: &str, user: &Sysuser) {
    if path.is_empty() {
        return;
    }
    let path = Path::new(path);
    if !motd::is_executable(path) {
        warn!(path = %path.display(), "display script missing or not executable");
        return;
    }
    match user.root_command(path).status() {
        Ok(status) if status.success() => debug!(path = %path.display(), "Display script finished"),
        Ok(status) => warn!(path = %path.display(), %status, "display script failed"),
        Err(e) => warn!(path = %path.display(), "cannot run display script: {}", e),
    }
}
