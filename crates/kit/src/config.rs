//! Persistent machine configuration.
//!
//! Each machine is one JSON document under the per-backend configuration
//! directory, written atomically so a crash never leaves a torn file behind.
//! Field names are PascalCase to stay readable next to the container
//! runtime's own configuration.

use std::io::ErrorKind;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::{self, fs::Dir};
use cap_std_ext::dirext::CapStdExtDirExt;
use chrono::{DateTime, Utc};
use color_eyre::{
    eyre::{eyre, Context},
    Result,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::MachineError;
use crate::lock::FileLock;
use crate::provider::VmType;

/// Overrides every host directory used by this tool.
pub(crate) const HOME_ENV: &str = "MACHINEKIT_HOME";

const APP_DIR: &str = "machinekit";

/// How to reach the guest over SSH.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct SshConfig {
    /// Host port forwarded to the guest's sshd
    pub(crate) port: u16,
    /// Private key; the public half sits next to it with a `.pub` suffix
    pub(crate) identity_path: Utf8PathBuf,
    /// Unprivileged guest account
    pub(crate) remote_username: String,
}

impl SshConfig {
    pub(crate) fn public_key_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{}.pub", self.identity_path))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct HostUser {
    /// Whether the default connection talks to the rootful runtime
    pub(crate) rootful: bool,
}

/// Sizing; memory is in MiB and disk in GiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ResourceConfig {
    #[serde(rename = "CPUs")]
    pub(crate) cpus: u64,
    pub(crate) memory: u64,
    pub(crate) disk_size: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            cpus: 2,
            memory: 2048,
            disk_size: 100,
        }
    }
}

/// A host directory shared into the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct Mount {
    pub(crate) source: String,
    pub(crate) target: String,
    #[serde(default)]
    pub(crate) read_only: bool,
}

impl Mount {
    /// Parse `SOURCE:TARGET[:ro]`. Drive-letter sources such as `C:\src`
    /// keep their first colon.
    pub(crate) fn parse(volume: &str) -> Result<Self> {
        let (volume, read_only) = match volume.strip_suffix(":ro") {
            Some(s) => (s, true),
            None => (volume.strip_suffix(":rw").unwrap_or(volume), false),
        };
        let (source, target) = volume
            .rsplit_once(':')
            .filter(|(s, t)| !s.is_empty() && t.starts_with('/'))
            .ok_or_else(|| eyre!("Invalid volume {volume:?}, expected SOURCE:TARGET[:ro]"))?;
        Ok(Self {
            source: source.to_owned(),
            target: target.to_owned(),
            read_only,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct WslConfig {
    pub(crate) user_mode_networking: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct QemuConfig {
    /// QMP control socket
    pub(crate) qmp_socket: Utf8PathBuf,
    /// Written by the emulator once it has daemonized
    pub(crate) pid_file: Utf8PathBuf,
}

/// Backend-specific settings, tagged with the backend that owns the machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "VMType", rename_all = "lowercase")]
pub(crate) enum BackendConfig {
    Wsl(WslConfig),
    Qemu(QemuConfig),
}

impl BackendConfig {
    /// Defaults for a new machine `name` on the backend of `dirs`.
    pub(crate) fn for_machine(dirs: &MachineDirs, name: &str) -> Self {
        match dirs.vm_type {
            VmType::Wsl => BackendConfig::Wsl(WslConfig::default()),
            VmType::Qemu => BackendConfig::Qemu(QemuConfig {
                qmp_socket: dirs.runtime_dir.join(format!("{name}-qmp.sock")),
                pid_file: dirs.runtime_dir.join(format!("{name}.pid")),
            }),
        }
    }

    pub(crate) fn vm_type(&self) -> VmType {
        match self {
            BackendConfig::Wsl(_) => VmType::Wsl,
            BackendConfig::Qemu(_) => VmType::Qemu,
        }
    }
}

/// Persistent record of one machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct MachineConfig {
    name: String,
    #[serde(rename = "SSH")]
    pub(crate) ssh: SshConfig,
    pub(crate) image_path: Utf8PathBuf,
    pub(crate) image_stream: String,
    pub(crate) host_user: HostUser,
    pub(crate) resources: ResourceConfig,
    pub(crate) backend: BackendConfig,
    #[serde(default)]
    pub(crate) mounts: Vec<Mount>,
    pub(crate) created: DateTime<Utc>,
    #[serde(default)]
    pub(crate) last_up: Option<DateTime<Utc>>,
}

impl MachineConfig {
    pub(crate) fn new(
        name: &str,
        ssh: SshConfig,
        image_path: Utf8PathBuf,
        resources: ResourceConfig,
        backend: BackendConfig,
    ) -> Self {
        Self {
            name: name.to_owned(),
            ssh,
            image_path,
            image_stream: String::new(),
            host_user: HostUser::default(),
            resources,
            backend,
            mounts: Vec::new(),
            created: Utc::now(),
            last_up: None,
        }
    }

    /// The machine name, fixed at creation.
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn vm_type(&self) -> VmType {
        self.backend.vm_type()
    }
}

/// Host directories for one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MachineDirs {
    pub(crate) vm_type: VmType,
    /// Machine configuration documents and lock files
    pub(crate) config_dir: Utf8PathBuf,
    /// Disk images and the download cache
    pub(crate) data_dir: Utf8PathBuf,
    /// Sockets, pid files and relay markers
    pub(crate) runtime_dir: Utf8PathBuf,
    /// Generated SSH identities
    pub(crate) ssh_dir: Utf8PathBuf,
    /// Backend-independent data: elevation log, resume command
    pub(crate) data_home: Utf8PathBuf,
    /// Connection registry document
    pub(crate) connections_file: Utf8PathBuf,
}

fn utf8(p: std::path::PathBuf) -> Result<Utf8PathBuf> {
    Utf8PathBuf::try_from(p).map_err(|e| eyre!("Non-UTF-8 path: {e}"))
}

impl MachineDirs {
    /// Directories for `vm_type`, honoring the [`HOME_ENV`] override.
    pub(crate) fn for_vm_type(vm_type: VmType) -> Result<Self> {
        if let Some(base) = std::env::var_os(HOME_ENV) {
            let base = utf8(base.into())?;
            return Ok(Self::under(&base, vm_type));
        }
        let config_home = utf8(dirs::config_dir().ok_or_else(|| eyre!("No config directory"))?)?
            .join(APP_DIR);
        let data_home =
            utf8(dirs::data_dir().ok_or_else(|| eyre!("No data directory"))?)?.join(APP_DIR);
        let runtime_home = match dirs::runtime_dir() {
            Some(d) => utf8(d)?.join(APP_DIR),
            None => utf8(std::env::temp_dir())?.join(APP_DIR),
        };
        let ssh_dir = utf8(dirs::home_dir().ok_or_else(|| eyre!("No home directory"))?)?
            .join(".ssh");
        Ok(Self {
            vm_type,
            config_dir: config_home.join(vm_type.to_string()),
            data_dir: data_home.join(vm_type.to_string()),
            runtime_dir: runtime_home.join(vm_type.to_string()),
            ssh_dir,
            connections_file: config_home.join("connections.json"),
            data_home,
        })
    }

    /// Everything below a single base directory.
    pub(crate) fn under(base: &Utf8Path, vm_type: VmType) -> Self {
        let sub = vm_type.to_string();
        Self {
            vm_type,
            config_dir: base.join("config").join(&sub),
            data_dir: base.join("data").join(&sub),
            runtime_dir: base.join("run").join(&sub),
            ssh_dir: base.join("ssh"),
            data_home: base.join("data"),
            connections_file: base.join("config").join("connections.json"),
        }
    }

    /// Create every directory that does not exist yet.
    pub(crate) fn ensure(&self) -> Result<()> {
        for d in [
            &self.config_dir,
            &self.data_dir,
            &self.runtime_dir,
            &self.ssh_dir,
            &self.data_home,
        ] {
            std::fs::create_dir_all(d).with_context(|| format!("Creating {d}"))?;
        }
        Ok(())
    }

    /// Cache for downloaded (still compressed) images.
    pub(crate) fn cache_dir(&self) -> Utf8PathBuf {
        self.data_dir.join("cache")
    }

    pub(crate) fn store(&self) -> ConfigStore {
        ConfigStore {
            dir: self.config_dir.clone(),
        }
    }
}

/// Machine configuration documents for one backend.
#[derive(Debug, Clone)]
pub(crate) struct ConfigStore {
    dir: Utf8PathBuf,
}

impl ConfigStore {
    fn path(&self, name: &str) -> Utf8PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    pub(crate) fn config_path(&self, cfg: &MachineConfig) -> Utf8PathBuf {
        self.path(cfg.name())
    }

    pub(crate) fn exists(&self, name: &str) -> bool {
        self.path(name).exists()
    }

    pub(crate) fn load(&self, name: &str) -> Result<MachineConfig> {
        let path = self.path(name);
        let buf = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(MachineError::NoSuchVm(name.to_owned()).into())
            }
            Err(e) => return Err(e).with_context(|| format!("Reading {path}")),
        };
        serde_json::from_slice(&buf).with_context(|| format!("Parsing {path}"))
    }

    /// Atomically replace the stored document.
    pub(crate) fn save(&self, cfg: &MachineConfig) -> Result<()> {
        std::fs::create_dir_all(&self.dir).with_context(|| format!("Creating {}", self.dir))?;
        let dir = Dir::open_ambient_dir(&self.dir, cap_std::ambient_authority())
            .with_context(|| format!("Opening {}", self.dir))?;
        let buf = serde_json::to_vec_pretty(cfg)?;
        dir.atomic_write(format!("{}.json", cfg.name()), buf)
            .with_context(|| format!("Writing configuration for {}", cfg.name()))?;
        debug!("Saved {}", self.path(cfg.name()));
        Ok(())
    }

    pub(crate) fn remove(&self, name: &str) -> Result<()> {
        for p in [self.path(name), self.lock_path(name)] {
            match std::fs::remove_file(&p) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("Removing {p}")),
            }
        }
        Ok(())
    }

    /// All stored machines, sorted by name.
    pub(crate) fn list(&self) -> Result<Vec<MachineConfig>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("Listing {}", self.dir)),
        };
        let mut r = Vec::new();
        for ent in entries {
            let ent = ent?;
            let fname = ent.file_name();
            let Some(name) = fname.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            r.push(self.load(name)?);
        }
        r.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(r)
    }

    fn lock_path(&self, name: &str) -> Utf8PathBuf {
        self.dir.join(format!("{name}.lock"))
    }

    /// Take the exclusive lock guarding mutations of `name`.
    pub(crate) fn lock(&self, name: &str) -> Result<FileLock> {
        std::fs::create_dir_all(&self.dir).with_context(|| format!("Creating {}", self.dir))?;
        FileLock::acquire(&self.lock_path(name))
    }
}
