//! Capturing and re-encoding our own command line for a later relaunch.

use base64::Engine as _;
use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::{
    eyre::{eyre, Context},
    Result,
};

/// Marks a process started by the elevation or resume machinery. It
/// suppresses the interactive confirmation on the second run.
pub(crate) const REEXEC_FLAG: &str = "--reexec";

/// Subcommand after which [`REEXEC_FLAG`] is inserted.
const REEXEC_SUBCOMMAND: &str = "init";

const RESUME_FILE: &str = "relaunch-command.dat";

/// How this process was started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Invocation {
    pub(crate) exe: Utf8PathBuf,
    pub(crate) args: Vec<String>,
    pub(crate) cwd: Utf8PathBuf,
}

impl Invocation {
    pub(crate) fn current() -> Result<Self> {
        let exe = std::env::current_exe().context("Locating our executable")?;
        let exe = Utf8PathBuf::try_from(exe).map_err(|e| eyre!("Non-UTF-8 executable path: {e}"))?;
        let cwd = std::env::current_dir().context("Querying working directory")?;
        let cwd = Utf8PathBuf::try_from(cwd).map_err(|e| eyre!("Non-UTF-8 working directory: {e}"))?;
        let args = std::env::args().skip(1).collect();
        Ok(Self { exe, args, cwd })
    }

    /// Arguments for a relaunch, escaped for the Windows command line, with
    /// the relaunch marker placed after the subcommand exactly once.
    pub(crate) fn relaunch_args(&self) -> String {
        let mut out = Vec::with_capacity(self.args.len() + 1);
        let mut marked = false;
        for arg in self.args.iter().filter(|a| a.as_str() != REEXEC_FLAG) {
            out.push(escape_arg(arg));
            if !marked && arg == REEXEC_SUBCOMMAND {
                out.push(REEXEC_FLAG.to_owned());
                marked = true;
            }
        }
        if !marked {
            out.push(REEXEC_FLAG.to_owned());
        }
        out.join(" ")
    }

    /// A PowerShell statement re-running this invocation.
    pub(crate) fn relaunch_command(&self) -> String {
        let exe = self.exe.as_str().replace('\'', "''");
        format!("& '{exe}' {}", self.relaunch_args())
    }
}

/// Quote one argument following the Windows `CommandLineToArgvW` rules.
pub(crate) fn escape_arg(s: &str) -> String {
    if s.is_empty() {
        return "\"\"".to_owned();
    }
    let needs_quotes = s.contains([' ', '\t']);
    if !needs_quotes && !s.contains(['"', '\\']) {
        return s.to_owned();
    }
    let mut r = String::with_capacity(s.len() + 2);
    if needs_quotes {
        r.push('"');
    }
    let mut slashes = 0usize;
    for c in s.chars() {
        match c {
            '\\' => {
                slashes += 1;
                r.push(c);
            }
            '"' => {
                // Backslashes preceding a quote are doubled, then the quote escaped.
                r.extend(std::iter::repeat('\\').take(slashes + 1));
                r.push(c);
                slashes = 0;
            }
            _ => {
                slashes = 0;
                r.push(c);
            }
        }
    }
    if needs_quotes {
        r.extend(std::iter::repeat('\\').take(slashes));
        r.push('"');
    }
    r
}

/// Base64 of the UTF-16LE form, as taken by `powershell -EncodedCommand`.
pub(crate) fn encode_utf16_base64(s: &str) -> String {
    let bytes: Vec<u8> = s.encode_utf16().flat_map(u16::to_le_bytes).collect();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[cfg(test)]
pub(crate) fn decode_utf16_base64(s: &str) -> Result<String> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(s.trim())?;
    if bytes.len() % 2 != 0 {
        return Err(eyre!("Odd number of bytes in UTF-16 payload"));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    Ok(String::from_utf16(&units)?)
}

pub(crate) fn resume_file(data_home: &Utf8Path) -> Utf8PathBuf {
    data_home.join(RESUME_FILE)
}

/// Persist the encoded relaunch command readable only by the owner.
pub(crate) fn persist_resume_command(data_home: &Utf8Path, inv: &Invocation) -> Result<Utf8PathBuf> {
    std::fs::create_dir_all(data_home).with_context(|| format!("Creating {data_home}"))?;
    let path = resume_file(data_home);
    let encoded = encode_utf16_base64(&inv.relaunch_command());
    write_private(&path, encoded.as_bytes()).context("Could not serialize command state")?;
    Ok(path)
}

#[cfg(unix)]
fn write_private(path: &Utf8Path, buf: &[u8]) -> std::io::Result<()> {
    use std::io::Write as _;
    use std::os::unix::fs::OpenOptionsExt as _;
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    f.write_all(buf)
}

#[cfg(not(unix))]
fn write_private(path: &Utf8Path, buf: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, buf)
}

/// Shell command run at next logon to pick up a deferred operation.
pub(crate) fn resume_hook_command(resume_file: &Utf8Path, have_terminal: bool) -> String {
    let command = format!("powershell -noexit -EncodedCommand (Get-Content '{resume_file}' -Raw)");
    if have_terminal {
        format!("wt -p \"Windows PowerShell\" {command}")
    } else {
        command
    }
}
