//! Host-wide user-mode networking relay.
//!
//! Any number of machines may use the relay at once. It is started by the
//! first machine that needs it and stopped by the last one to let go, at
//! which point native networking is put back. The reference count lives on
//! disk, one marker file per holder, so it is shared by every process.

use std::io::ErrorKind;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::{eyre::Context, Result};
use tracing::{debug, info};

use crate::lock::FileLock;

const MARKER_SUFFIX: &str = ".ref";

/// Starts and stops the relay process.
pub(crate) trait RelayControl {
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    /// Put back the networking configuration the relay replaced.
    fn restore_native(&self) -> Result<()>;
}

/// Reference-counted owner of the relay.
pub(crate) struct RelayService {
    dir: Utf8PathBuf,
    control: Box<dyn RelayControl>,
}

impl std::fmt::Debug for RelayService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayService")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl RelayService {
    /// Open the service whose state lives in `dir`.
    pub(crate) fn init(dir: &Utf8Path, control: Box<dyn RelayControl>) -> Result<Self> {
        std::fs::create_dir_all(dir).with_context(|| format!("Creating {dir}"))?;
        Ok(Self {
            dir: dir.to_owned(),
            control,
        })
    }

    fn lock(&self) -> Result<FileLock> {
        FileLock::acquire(&self.dir.join("relay.lock"))
    }

    fn marker(&self, machine: &str) -> Utf8PathBuf {
        self.dir.join(format!("{machine}{MARKER_SUFFIX}"))
    }

    fn holders(&self) -> Result<Vec<String>> {
        let mut r = Vec::new();
        for ent in std::fs::read_dir(&self.dir).with_context(|| format!("Listing {}", self.dir))? {
            let ent = ent?;
            if let Some(name) = ent
                .file_name()
                .to_str()
                .and_then(|n| n.strip_suffix(MARKER_SUFFIX))
            {
                r.push(name.to_owned());
            }
        }
        r.sort();
        Ok(r)
    }

    /// Machines currently holding the relay.
    #[cfg(test)]
    pub(crate) fn active(&self) -> Result<Vec<String>> {
        let _lock = self.lock()?;
        self.holders()
    }

    /// Take a reference for `machine`, starting the relay if it is the first.
    /// Acquiring twice for the same machine counts once.
    pub(crate) fn acquire(&self, machine: &str) -> Result<()> {
        let _lock = self.lock()?;
        let marker = self.marker(machine);
        if marker.exists() {
            debug!("{machine} already holds the relay");
            return Ok(());
        }
        if self.holders()?.is_empty() {
            info!("Starting user-mode networking relay");
            self.control.start()?;
        }
        std::fs::write(&marker, b"").with_context(|| format!("Writing {marker}"))?;
        Ok(())
    }

    /// Drop the reference of `machine`; the last release stops the relay
    /// and restores native networking.
    pub(crate) fn release(&self, machine: &str) -> Result<()> {
        let _lock = self.lock()?;
        let marker = self.marker(machine);
        match std::fs::remove_file(&marker) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("Removing {marker}")),
        }
        if self.holders()?.is_empty() {
            info!("Stopping user-mode networking relay");
            self.control.stop()?;
            self.control.restore_native()?;
        }
        Ok(())
    }
}
