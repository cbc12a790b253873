//! Privilege elevation and reboot-resume for host preparation.
//!
//! Installing a backend may need administrator rights and a reboot. The
//! elevated work runs in a relaunched copy of this process whose output is
//! captured in a log file the unprivileged parent replays on failure; a
//! reboot is bridged by persisting our command line and registering it to run
//! once at the next logon.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Command, ExitStatus, Stdio};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::{
    eyre::{eyre, Context},
    Report, Result,
};
use tracing::debug;

mod cmdline;
#[cfg(unix)]
mod unix;
mod windows;

pub(crate) use cmdline::{Invocation, REEXEC_FLAG};

/// Installer exit status: success, and the installer rebooted the host.
pub(crate) const ERROR_SUCCESS_REBOOT_INITIATED: i32 = 1641;
/// Installer exit status: success, but a reboot is required.
pub(crate) const ERROR_SUCCESS_REBOOT_REQUIRED: i32 = 3010;

const OUTPUT_LOG: &str = "elevated-output.log";

/// Whether an installer exit status counts as success.
pub(crate) fn is_msi_success(code: Option<i32>) -> bool {
    matches!(
        code,
        Some(0 | ERROR_SUCCESS_REBOOT_INITIATED | ERROR_SUCCESS_REBOOT_REQUIRED)
    )
}

/// Why an operation stopped early without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeferReason {
    /// The host must be rebooted by the user before retrying.
    RebootRequired,
    /// A reboot was started; the operation resumes after logon.
    RebootInitiated,
    /// An elevated copy of this process did (or will do) the work.
    Elevated,
    /// This is the elevated copy and its part is done.
    ElevatedChildDone,
}

impl std::fmt::Display for DeferReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DeferReason::RebootRequired => "reboot the host, then run the command again",
            DeferReason::RebootInitiated => "the host is rebooting, the command resumes after logon",
            DeferReason::Elevated => "installation was handed to an elevated process",
            DeferReason::ElevatedChildDone => "elevated installation step finished",
        })
    }
}

/// Outcome of preparing the host for a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    Ready,
    Deferred(DeferReason),
}

/// Result of a successful elevated child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ElevatedResult {
    Completed,
    RebootRequired,
}

/// Host facilities needed to elevate, reboot and resume.
pub(crate) trait HostPrivileges {
    /// Whether this process already holds administrator rights.
    fn is_elevated(&self) -> bool;

    /// Ask the user to approve `message`.
    fn confirm(&self, message: &str) -> Result<bool> {
        crate::utils::confirm(message)
    }

    /// Relaunch `inv` with administrator rights, wait for it and return its
    /// exit status.
    fn relaunch_elevated_wait(&self, inv: &Invocation) -> Result<i32>;

    /// Whether a terminal host is available to run the resume hook in.
    fn has_terminal(&self) -> bool {
        false
    }

    /// Register `command` to run once at the next logon.
    fn register_resume(&self, command: &str) -> Result<()>;

    /// Reboot the host.
    fn reboot(&self) -> Result<()>;
}

/// The host's implementation of [`HostPrivileges`].
pub(crate) fn host_privileges() -> Box<dyn HostPrivileges> {
    cfg_if::cfg_if! {
        if #[cfg(windows)] {
            Box::new(windows::WindowsHost)
        } else {
            Box::new(unix::UnixHost)
        }
    }
}

/// Output captured from an elevated child for the parent to replay.
#[derive(Debug, Clone)]
pub(crate) struct ElevatedOutputLog {
    path: Utf8PathBuf,
}

impl ElevatedOutputLog {
    pub(crate) fn new(data_home: &Utf8Path) -> Self {
        Self {
            path: data_home.join(OUTPUT_LOG),
        }
    }

    pub(crate) fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Start a fresh log.
    pub(crate) fn truncate(&self) -> Result<()> {
        self.ensure_parent()?;
        File::create(&self.path).with_context(|| format!("Truncating {}", self.path))?;
        Ok(())
    }

    fn ensure_parent(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("Creating {parent}"))?;
        }
        Ok(())
    }

    pub(crate) fn open_append(&self) -> Result<File> {
        self.ensure_parent()?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Opening {}", self.path))
    }

    /// Record a failure of the elevated child for the parent to see.
    pub(crate) fn append_error(&self, err: &Report) {
        match self.open_append() {
            Ok(mut f) => {
                let _ = writeln!(f, "Error: {err:#}");
            }
            Err(e) => debug!("Could not record elevated error: {e}"),
        }
    }

    /// Copy the log to `out`.
    pub(crate) fn dump(&self, out: &mut dyn Write) {
        match File::open(&self.path) {
            Ok(mut f) => {
                let _ = std::io::copy(&mut f, out);
            }
            Err(_) => debug!("Could not find elevated child output file"),
        }
    }
}

/// Guidance printed when an installation step fails.
pub(crate) fn install_failure_hint(operation: &str) -> String {
    indoc::formatdoc! {"
        Could not {operation}. See previous output for any potential failure details.
        If you can not resolve the issue, and rerunning fails, try the \"wsl --install\" process
        outlined in the following article:

        http://docs.microsoft.com/en-us/windows/wsl/install

    "}
}

/// Run `operation` in an elevated copy of this process and wait for it.
pub(crate) fn launch_elevated(
    host: &dyn HostPrivileges,
    inv: &Invocation,
    log: &ElevatedOutputLog,
    operation: &str,
) -> Result<ElevatedResult> {
    log.truncate()?;
    let code = host
        .relaunch_elevated_wait(inv)
        .with_context(|| format!("Relaunching elevated to {operation}"))?;
    match code {
        0 => Ok(ElevatedResult::Completed),
        ERROR_SUCCESS_REBOOT_REQUIRED => {
            println!("Reboot is required to continue installation, please reboot at your convenience");
            Ok(ElevatedResult::RebootRequired)
        }
        code => {
            eprintln!("Elevated process failed with exit code {code}\n");
            log.dump(&mut std::io::stdout());
            eprint!("{}", install_failure_hint(operation));
            Err(eyre!("Elevated process failed with exit code {code}"))
        }
    }
}

/// Persist the relaunch command, register it for the next logon and reboot.
pub(crate) fn reboot_and_resume(
    host: &dyn HostPrivileges,
    inv: &Invocation,
    data_home: &Utf8Path,
) -> Result<DeferReason> {
    let resume = cmdline::persist_resume_command(data_home, inv)?;
    let hook = cmdline::resume_hook_command(&resume, host.has_terminal());
    host.register_resume(&hook)
        .context("Could not register the resume command")?;
    host.reboot().context("Reboot failed")?;
    Ok(DeferReason::RebootInitiated)
}

/// Run `cmd`, copying its output both to our console and to `log`.
pub(crate) fn run_tee(cmd: &mut Command, log: &File) -> Result<ExitStatus> {
    debug!("Running command: {cmd:?}");
    let mut child = cmd
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Spawning {:?}", cmd.get_program()))?;
    let stdout = child.stdout.take().ok_or_else(|| eyre!("stdout not captured"))?;
    let stderr = child.stderr.take().ok_or_else(|| eyre!("stderr not captured"))?;
    std::thread::scope(|s| {
        s.spawn(|| copy_lines(stdout, &mut std::io::stdout(), log));
        s.spawn(|| copy_lines(stderr, &mut std::io::stderr(), log));
    });
    Ok(child.wait()?)
}

fn copy_lines(src: impl Read, console: &mut dyn Write, mut log: &File) {
    for line in BufReader::new(src).split(b'\n') {
        let Ok(mut line) = line else { break };
        line.push(b'\n');
        let _ = console.write_all(&line);
        let _ = log.write_all(&line);
    }
}
