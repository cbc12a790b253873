//! Thin wrappers over `wsl.exe` for one guest distribution.

use std::io::Write;
use std::process::{Command, Stdio};

use camino::Utf8Path;
use color_eyre::{eyre::Context, Result};
use tracing::debug;

use super::guest::SYSDPID;
use crate::errors::MachineError;

pub(crate) const WSL: &str = "wsl";

const DIST_PREFIX: &str = "podman";

/// Distribution name for a machine name.
pub(crate) fn to_dist(name: &str) -> String {
    if name.starts_with(DIST_PREFIX) {
        name.to_owned()
    } else {
        format!("{DIST_PREFIX}-{name}")
    }
}

/// `wsl.exe` writes UTF-16LE to pipes; tolerate a BOM and fall back to
/// UTF-8 for output that is not.
pub(crate) fn decode_wsl_output(buf: &[u8]) -> String {
    let buf = buf.strip_prefix(&[0xff, 0xfe]).unwrap_or(buf);
    let looks_utf16 = buf.len() >= 2 && buf.len() % 2 == 0 && buf[1] == 0;
    if !looks_utf16 {
        return String::from_utf8_lossy(buf).into_owned();
    }
    let units: Vec<u16> = buf
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// First column of each non-empty line of a `wsl --list` listing.
fn parse_dist_list(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|l| l.trim_matches('\0').split_whitespace().next())
        .map(ToOwned::to_owned)
        .collect()
}

fn list(args: &[&str]) -> Result<Vec<String>> {
    let out = Command::new(WSL)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .context("Running wsl --list")?;
    // With nothing registered the listing exits non-zero.
    if !out.status.success() {
        return Ok(Vec::new());
    }
    Ok(parse_dist_list(&decode_wsl_output(&out.stdout)))
}

pub(crate) fn registered_dists() -> Result<Vec<String>> {
    list(&["--list", "--quiet"])
}

pub(crate) fn running_dists() -> Result<Vec<String>> {
    list(&["--list", "--running", "--quiet"])
}

fn guest_failure(intent: &str, detail: impl Into<String>) -> color_eyre::Report {
    MachineError::GuestCommandFailed {
        intent: intent.to_owned(),
        detail: detail.into(),
    }
    .into()
}

/// A registered (or about to be registered) guest distribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Distribution {
    name: String,
}

impl Distribution {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
        }
    }

    pub(crate) fn for_machine(machine: &str) -> Self {
        Self::new(&to_dist(machine))
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_registered(&self) -> Result<bool> {
        Ok(registered_dists()?.iter().any(|d| *d == self.name))
    }

    /// PID of the nested systemd, if one is running.
    pub(crate) fn systemd_pid(&self) -> Result<Option<u32>> {
        let mut child = self
            .command(&["sh"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("Probing systemd")?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(format!("{SYSDPID}\necho $SYSDPID\n").as_bytes())?;
        }
        let out = child.wait_with_output()?;
        let text = String::from_utf8_lossy(&out.stdout);
        Ok(text
            .lines()
            .next()
            .and_then(|l| l.trim().parse::<u32>().ok())
            .filter(|pid| *pid > 0))
    }

    /// Running means the distribution is up and its systemd is alive.
    pub(crate) fn is_running(&self) -> Result<bool> {
        if !running_dists()?.iter().any(|d| *d == self.name) {
            return Ok(false);
        }
        Ok(self.systemd_pid()?.is_some())
    }

    /// `wsl -u root -d <name> <args>`
    pub(crate) fn command(&self, args: &[&str]) -> Command {
        let mut c = Command::new(WSL);
        c.args(["-u", "root", "-d", &self.name]);
        c.args(args);
        c
    }

    /// Run a command in the guest with our stdio attached.
    pub(crate) fn run(&self, intent: &str, args: &[&str]) -> Result<()> {
        let mut c = self.command(args);
        debug!("Running command: {c:?}");
        let st = c.status().map_err(|e| guest_failure(intent, e.to_string()))?;
        if !st.success() {
            return Err(guest_failure(intent, st.to_string()));
        }
        Ok(())
    }

    /// Run a command in the guest with `input` on its stdin.
    pub(crate) fn pipe(&self, intent: &str, input: &str, args: &[&str]) -> Result<()> {
        let mut c = self.command(args);
        debug!("Running command: {c:?}");
        let mut child = c
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| guest_failure(intent, e.to_string()))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .map_err(|e| guest_failure(intent, e.to_string()))?;
        }
        let st = child.wait()?;
        if !st.success() {
            return Err(guest_failure(intent, st.to_string()));
        }
        Ok(())
    }

    /// Write `content` to `path` in the guest, then run `then` if given.
    pub(crate) fn write_file(
        &self,
        intent: &str,
        content: &str,
        path: &str,
        then: Option<&str>,
    ) -> Result<()> {
        let script = match then {
            Some(t) => format!("cat > {path}; {t}"),
            None => format!("cat > {path}"),
        };
        self.pipe(intent, content, &["sh", "-c", &script])
    }

    /// Register the distribution from a root filesystem archive.
    pub(crate) fn import(&self, install_dir: &Utf8Path, image: &Utf8Path) -> Result<()> {
        std::fs::create_dir_all(install_dir).with_context(|| format!("Creating {install_dir}"))?;
        let mut c = Command::new(WSL);
        c.args(["--import", &self.name, install_dir.as_str(), image.as_str(), "--version", "2"]);
        debug!("Running command: {c:?}");
        let st = c.status().context("Running wsl --import")?;
        if !st.success() {
            return Err(guest_failure("WSL import of guest OS", st.to_string()));
        }
        Ok(())
    }

    pub(crate) fn terminate(&self) -> Result<()> {
        let st = Command::new(WSL)
            .args(["--terminate", &self.name])
            .status()
            .context("Running wsl --terminate")?;
        if !st.success() {
            return Err(guest_failure("terminating distribution", st.to_string()));
        }
        Ok(())
    }

    pub(crate) fn unregister(&self) -> Result<()> {
        let st = Command::new(WSL)
            .args(["--unregister", &self.name])
            .status()
            .context("Running wsl --unregister")?;
        if !st.success() {
            return Err(guest_failure("unregistering distribution", st.to_string()));
        }
        Ok(())
    }
}
