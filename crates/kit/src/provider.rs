//! The backend abstraction every virtualization provider implements.

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::config::{MachineConfig, MachineDirs};
use crate::download::ImageStream;
use crate::elevate::{Invocation, Readiness};
use crate::errors::MachineError;
use crate::ports::PortPublishing;
use crate::provision::Provisioner;

/// Selects the default backend.
pub(crate) const PROVIDER_ENV: &str = "MACHINEKIT_PROVIDER";

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    clap::ValueEnum,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub(crate) enum VmType {
    Wsl,
    Qemu,
}

impl VmType {
    /// The backend native to this host.
    pub(crate) fn host_default() -> Self {
        if cfg!(windows) {
            VmType::Wsl
        } else {
            VmType::Qemu
        }
    }

    /// Backend from [`PROVIDER_ENV`], else the host default.
    pub(crate) fn from_env() -> Result<Self> {
        match std::env::var(PROVIDER_ENV) {
            Ok(v) if !v.is_empty() => v
                .parse()
                .map_err(|_| MachineError::UnsupportedProvider(v).into()),
            _ => Ok(Self::host_default()),
        }
    }
}

/// Observed machine state; always queried, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub(crate) enum MachineState {
    Running,
    Stopped,
}

/// Inputs to [`Provider::create_vm`].
#[derive(Debug, Clone, Default)]
pub(crate) struct CreateOpts {
    pub(crate) user_mode_networking: bool,
}

/// Requested attribute changes; `None` leaves an attribute alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SetOptions {
    pub(crate) cpus: Option<u64>,
    /// MiB
    pub(crate) memory: Option<u64>,
    /// GiB
    pub(crate) disk_size: Option<u64>,
    pub(crate) user_mode_networking: Option<bool>,
    pub(crate) rootful: Option<bool>,
}

/// Context for preparing the host before any machine exists.
#[derive(Debug)]
pub(crate) struct HostContext<'a> {
    /// Set when this process was relaunched by the elevation machinery
    pub(crate) reexec: bool,
    pub(crate) invocation: &'a Invocation,
    pub(crate) data_home: &'a Utf8Path,
}

pub(crate) type Action = Box<dyn FnOnce() -> Result<()>>;

/// What [`Provider::start_vm`] hands back.
pub(crate) struct StartHandles {
    /// Undo for a start whose readiness check failed
    pub(crate) cleanup: Option<Action>,
    /// Blocks until the guest is usable
    pub(crate) ready: Action,
}

impl std::fmt::Debug for StartHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartHandles")
            .field("cleanup", &self.cleanup.is_some())
            .finish_non_exhaustive()
    }
}

/// Backend-owned part of a removal.
pub(crate) struct Removal {
    /// Files the backend will delete, for confirmation
    pub(crate) files: Vec<Utf8PathBuf>,
    /// Tears down backend state; errors are logged by the caller
    pub(crate) destroy: Action,
}

impl std::fmt::Debug for Removal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Removal")
            .field("files", &self.files)
            .finish_non_exhaustive()
    }
}

/// Lifecycle of machines on one virtualization backend.
///
/// Methods taking a [`MachineConfig`] expect the caller to hold that
/// machine's lock when they mutate anything.
pub(crate) trait Provider {
    fn vm_type(&self) -> VmType;

    fn dirs(&self) -> &MachineDirs;

    /// Make sure the host can run this backend, installing it if needed.
    fn prepare_host(&self, _ctx: &HostContext<'_>) -> Result<Readiness> {
        Ok(Readiness::Ready)
    }

    /// Whether the backend already knows a machine called `name`.
    fn exists(&self, name: &str) -> Result<bool>;

    /// Where the disk image of `name` lives.
    fn image_path(&self, name: &str) -> Utf8PathBuf;

    /// Produce the machine's disk image from `stream`.
    fn get_disk(&self, stream: &ImageStream, cfg: &MachineConfig) -> Result<()>;

    /// Turn an acquired image into a registered machine. Each step that
    /// leaves state behind registers its undo with `p`.
    fn create_vm(
        &self,
        p: &mut Provisioner,
        opts: &CreateOpts,
        cfg: &mut MachineConfig,
    ) -> Result<()>;

    fn start_vm(&self, cfg: &MachineConfig) -> Result<StartHandles>;

    /// Stop a running machine. `hard` skips the graceful shutdown.
    fn stop_vm(&self, cfg: &MachineConfig, hard: bool) -> Result<()>;

    fn state(&self, cfg: &MachineConfig) -> Result<MachineState>;

    fn remove(&self, cfg: &MachineConfig) -> Result<Removal>;

    /// Apply backend attributes. Validates every requested change before
    /// mutating anything.
    fn set_provider_attrs(&self, cfg: &mut MachineConfig, opts: &SetOptions) -> Result<()>;

    /// Rewrite a host volume source into what the guest sees.
    fn translate_mount_source(&self, source: &str) -> Result<String> {
        Ok(source.to_owned())
    }

    fn mount_volumes_to_vm(&self, cfg: &MachineConfig) -> Result<()>;

    fn start_networking(&self, cfg: &MachineConfig) -> Result<()>;

    fn stop_host_networking(&self, cfg: &MachineConfig) -> Result<()>;

    fn user_mode_networking_enabled(&self, cfg: &MachineConfig) -> bool;

    fn port_publishing(&self) -> PortPublishing;
}

/// Instantiate the provider for `vm_type`.
pub(crate) fn get_provider(vm_type: VmType) -> Result<Box<dyn Provider>> {
    let dirs = MachineDirs::for_vm_type(vm_type)?;
    provider_with_dirs(vm_type, dirs)
}

pub(crate) fn provider_with_dirs(vm_type: VmType, dirs: MachineDirs) -> Result<Box<dyn Provider>> {
    match vm_type {
        VmType::Wsl => Ok(Box::new(crate::wsl::WslProvider::new(dirs))),
        #[cfg(unix)]
        VmType::Qemu => Ok(Box::new(crate::qemu::QemuProvider::new(dirs)?)),
        #[cfg(not(unix))]
        VmType::Qemu => Err(MachineError::UnsupportedProvider(vm_type.to_string()).into()),
    }
}

/// Reject an attribute the backend cannot change.
pub(crate) fn unsupported(attribute: &'static str, vm_type: VmType) -> color_eyre::Report {
    MachineError::UnsupportedAttribute {
        attribute,
        backend: vm_type.to_string(),
    }
    .into()
}

/// Fail unless the machine is stopped.
pub(crate) fn require_stopped(provider: &dyn Provider, cfg: &MachineConfig) -> Result<()> {
    match provider.state(cfg)? {
        MachineState::Stopped => Ok(()),
        MachineState::Running => Err(MachineError::AlreadyRunning(cfg.name().to_owned()).into()),
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn test_vm_type_names() {
        assert_eq!(VmType::Wsl.to_string(), "wsl");
        assert_eq!("qemu".parse::<VmType>().unwrap(), VmType::Qemu);
        assert!("hyperv".parse::<VmType>().is_err());
        assert_eq!(VmType::iter().count(), 2);
        assert_eq!(MachineState::Running.to_string(), "running");
    }
}
