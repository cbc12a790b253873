//! Windows host actions, driven through the stock command-line tools.

use std::process::Command;

use bootc_utils::CommandRunExt;
use color_eyre::{eyre::eyre, Result};

use super::{HostPrivileges, Invocation};

const RUN_ONCE_KEY: &str = r"HKCU\Software\Microsoft\Windows\CurrentVersion\RunOnce";
const RUN_ONCE_VALUE: &str = "machinekit";

const IS_ADMIN_SCRIPT: &str = "([Security.Principal.WindowsPrincipal][Security.Principal.WindowsIdentity]::GetCurrent()).IsInRole([Security.Principal.WindowsBuiltInRole]::Administrator)";

fn powershell(script: &str) -> Command {
    let mut c = Command::new("powershell");
    c.args(["-NoProfile", "-NonInteractive", "-Command", script]);
    c
}

/// Quote for a single-quoted PowerShell string.
fn ps_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Script starting `inv` through UAC and propagating its exit status.
pub(super) fn elevate_script(inv: &Invocation) -> String {
    format!(
        "$p = Start-Process -FilePath {} -ArgumentList {} -WorkingDirectory {} -Verb RunAs -Wait -PassThru; exit $p.ExitCode",
        ps_quote(inv.exe.as_str()),
        ps_quote(&inv.relaunch_args()),
        ps_quote(inv.cwd.as_str()),
    )
}

pub(super) fn run_once_args(command: &str) -> Vec<String> {
    [
        "add",
        RUN_ONCE_KEY,
        "/v",
        RUN_ONCE_VALUE,
        "/t",
        "REG_SZ",
        "/d",
        command,
        "/f",
    ]
    .into_iter()
    .map(ToOwned::to_owned)
    .collect()
}

/// Restart, reopening registered applications; reason: planned application
/// installation.
const REBOOT_ARGS: &[&str] = &["/g", "/t", "0", "/d", "p:4:2"];

#[derive(Debug)]
pub(crate) struct WindowsHost;

impl HostPrivileges for WindowsHost {
    fn is_elevated(&self) -> bool {
        match powershell(IS_ADMIN_SCRIPT).run_get_string() {
            Ok(s) => s.trim().eq_ignore_ascii_case("true"),
            Err(e) => {
                tracing::warn!("Could not determine administrator rights: {e}");
                false
            }
        }
    }

    fn relaunch_elevated_wait(&self, inv: &Invocation) -> Result<i32> {
        let status = powershell(&elevate_script(inv)).status()?;
        status
            .code()
            .ok_or_else(|| eyre!("Elevated process terminated without an exit code"))
    }

    fn has_terminal(&self) -> bool {
        which::which("wt.exe").is_ok()
    }

    fn register_resume(&self, command: &str) -> Result<()> {
        Command::new("reg")
            .args(run_once_args(command))
            .run()
            .map_err(|e| eyre!("Could not open RunOnce registry entry: {e}"))
    }

    fn reboot(&self) -> Result<()> {
        Command::new("shutdown")
            .args(REBOOT_ARGS)
            .run()
            .map_err(|e| eyre!("{e}"))
    }
}
