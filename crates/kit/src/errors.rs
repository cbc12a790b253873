//! Error taxonomy for machine lifecycle operations.
//!
//! Everything is surfaced to callers as a `color_eyre::Report`; the variants
//! here exist so that callers (and tests) can tell the failure classes apart
//! with `Report::downcast_ref::<MachineError>()` after context has been added.

use thiserror::Error;

/// Distinguished failures of the machine lifecycle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MachineError {
    /// A machine with this name is already registered.
    #[error("machine {0:?} already exists")]
    AlreadyExists(String),
    /// The operation requires the machine to be stopped.
    #[error("machine {0:?} is already running")]
    AlreadyRunning(String),
    /// The operation requires the machine to be running.
    #[error("machine {0:?} is not running")]
    NotRunning(String),
    /// No machine with this name is registered.
    #[error("no such machine: {0:?}")]
    NoSuchVm(String),
    /// The backend cannot change the requested setting.
    #[error("changing {attribute} is not supported for {backend} machines")]
    UnsupportedAttribute {
        /// Attribute that was requested
        attribute: &'static str,
        /// Backend that refused it
        backend: String,
    },
    /// Elevation was needed but the user declined it.
    #[error("{0}: installation aborted")]
    PrivilegeRequired(String),
    /// The host must reboot before the operation can continue.
    #[error("a reboot is required to continue: {0}")]
    RebootRequired(String),
    /// Fetching a remote artifact failed.
    #[error("download of {url} failed: {reason}")]
    DownloadFailed {
        /// The artifact location
        url: String,
        /// What went wrong
        reason: String,
    },
    /// An image stream could not be resolved to an artifact.
    #[error("image not found: {0}")]
    ImageNotFound(String),
    /// A command run inside the guest exited unsuccessfully.
    #[error("{intent}: guest command failed: {detail}")]
    GuestCommandFailed {
        /// What the command was trying to achieve
        intent: String,
        /// Exit status and captured stderr
        detail: String,
    },
    /// The requested backend is not available on this host.
    #[error("virtualization provider {0:?} is not supported on this host")]
    UnsupportedProvider(String),
}

/// Look through a report's chain for a [`MachineError`].
#[cfg(test)]
pub fn machine_error(err: &color_eyre::Report) -> Option<&MachineError> {
    err.chain().find_map(|e| e.downcast_ref::<MachineError>())
}

#[cfg(test)]
mod tests {
    use color_eyre::eyre::WrapErr;

    use super::*;

    #[test]
    fn test_machine_error_survives_context() {
        let r: color_eyre::Result<()> =
            Err(MachineError::NoSuchVm("dev".into())).wrap_err("Loading machine");
        let err = r.unwrap_err();
        assert_eq!(
            machine_error(&err),
            Some(&MachineError::NoSuchVm("dev".into()))
        );
        assert_eq!(err.to_string(), "Loading machine");
    }

    #[test]
    fn test_display() {
        let e = MachineError::UnsupportedAttribute {
            attribute: "memory",
            backend: "wsl".into(),
        };
        assert_eq!(
            e.to_string(),
            "changing memory is not supported for wsl machines"
        );
        let e = MachineError::PrivilegeRequired("WSL".into());
        assert_eq!(e.to_string(), "WSL: installation aborted");
    }
}
