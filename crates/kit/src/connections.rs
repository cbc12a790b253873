//! Registry of client connections to machine runtimes.
//!
//! Every machine contributes a rootless connection named after it and a
//! rootful one with a `-root` suffix. The registry is a single JSON document
//! shared by all backends; updates hold an adjacent lock file so that
//! concurrent processes do not lose each other's changes.

use std::io::ErrorKind;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::{self, fs::Dir};
use cap_std_ext::dirext::CapStdExtDirExt;
use color_eyre::{
    eyre::{eyre, Context},
    Result,
};
use serde::{Deserialize, Serialize};

use crate::config::MachineConfig;
use crate::lock::FileLock;

const ROOTLESS_SOCKET: &str = "/run/user/1000/podman/podman.sock";
const ROOTFUL_SOCKET: &str = "/run/podman/podman.sock";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct Connection {
    pub(crate) name: String,
    #[serde(rename = "URI")]
    pub(crate) uri: String,
    pub(crate) identity: Utf8PathBuf,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Registry {
    #[serde(default)]
    default: Option<String>,
    #[serde(default)]
    connections: Vec<Connection>,
}

/// Name of the rootful connection for a machine.
pub(crate) fn root_connection_name(name: &str) -> String {
    format!("{name}-root")
}

/// The two connections a machine registers.
pub(crate) fn machine_connections(cfg: &MachineConfig) -> [Connection; 2] {
    let ssh = &cfg.ssh;
    [
        Connection {
            name: cfg.name().to_owned(),
            uri: format!(
                "ssh://{}@localhost:{}{ROOTLESS_SOCKET}",
                ssh.remote_username, ssh.port
            ),
            identity: ssh.identity_path.clone(),
        },
        Connection {
            name: root_connection_name(cfg.name()),
            uri: format!("ssh://root@localhost:{}{ROOTFUL_SOCKET}", ssh.port),
            identity: ssh.identity_path.clone(),
        },
    ]
}

/// File-backed connection registry.
#[derive(Debug, Clone)]
pub(crate) struct Connections {
    path: Utf8PathBuf,
}

impl Connections {
    pub(crate) fn new(path: &Utf8Path) -> Self {
        Self {
            path: path.to_owned(),
        }
    }

    fn lock(&self) -> Result<FileLock> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| eyre!("Invalid registry path {}", self.path))?;
        std::fs::create_dir_all(dir).with_context(|| format!("Creating {dir}"))?;
        FileLock::acquire(&self.path.with_extension("lock"))
    }

    fn read(&self) -> Result<Registry> {
        match std::fs::read(&self.path) {
            Ok(buf) => serde_json::from_slice(&buf).with_context(|| format!("Parsing {}", self.path)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Registry::default()),
            Err(e) => Err(e).with_context(|| format!("Reading {}", self.path)),
        }
    }

    fn write(&self, reg: &Registry) -> Result<()> {
        let (dir, fname) = match (self.path.parent(), self.path.file_name()) {
            (Some(d), Some(f)) => (d, f),
            _ => return Err(eyre!("Invalid registry path {}", self.path)),
        };
        std::fs::create_dir_all(dir).with_context(|| format!("Creating {dir}"))?;
        let d = Dir::open_ambient_dir(dir, cap_std::ambient_authority())?;
        d.atomic_write(fname, serde_json::to_vec_pretty(reg)?)
            .with_context(|| format!("Writing {}", self.path))?;
        Ok(())
    }

    /// Register a machine's connections; the rootful one becomes the
    /// default when `rootful` is set, otherwise the rootless one.
    pub(crate) fn add_machine(&self, cfg: &MachineConfig, make_default: bool) -> Result<()> {
        let _lock = self.lock()?;
        let mut reg = self.read()?;
        let conns = machine_connections(cfg);
        reg.connections
            .retain(|c| !conns.iter().any(|n| n.name == c.name));
        if make_default || reg.default.is_none() {
            reg.default = Some(default_name(cfg.name(), cfg.host_user.rootful));
        }
        reg.connections.extend(conns);
        self.write(&reg)
    }

    /// Point the default at the machine's rootful or rootless connection.
    pub(crate) fn set_rootful(&self, name: &str, rootful: bool) -> Result<()> {
        let _lock = self.lock()?;
        let mut reg = self.read()?;
        let target = default_name(name, rootful);
        if !reg.connections.iter().any(|c| c.name == target) {
            return Err(eyre!("No connection named {target}"));
        }
        reg.default = Some(target);
        self.write(&reg)
    }

    /// Drop both connections of a machine.
    pub(crate) fn remove_machine(&self, name: &str) -> Result<()> {
        let _lock = self.lock()?;
        let mut reg = self.read()?;
        let root = root_connection_name(name);
        reg.connections.retain(|c| c.name != name && c.name != root);
        if reg
            .default
            .as_deref()
            .is_some_and(|d| d == name || d == root)
        {
            reg.default = reg.connections.first().map(|c| c.name.clone());
        }
        self.write(&reg)
    }

    #[cfg(test)]
    pub(crate) fn list(&self) -> Result<Vec<Connection>> {
        Ok(self.read()?.connections)
    }

    pub(crate) fn default_connection(&self) -> Result<Option<String>> {
        Ok(self.read()?.default)
    }
}

fn default_name(name: &str, rootful: bool) -> String {
    if rootful {
        root_connection_name(name)
    } else {
        name.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::config::{tests::sample, MachineDirs};
    use crate::provider::VmType;

    #[test]
    fn test_add_set_remove() {
        let td = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(td.path()).unwrap();
        let dirs = MachineDirs::under(base, VmType::Wsl);
        let conns = Connections::new(&dirs.connections_file);

        let dev = sample("dev", &dirs);
        conns.add_machine(&dev, false).unwrap();
        let names: Vec<_> = conns.list().unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(names, ["dev", "dev-root"]);
        assert_eq!(conns.default_connection().unwrap().as_deref(), Some("dev"));
        let uris: Vec<_> = conns.list().unwrap().into_iter().map(|c| c.uri).collect();
        assert_eq!(
            uris,
            [
                "ssh://user@localhost:40022/run/user/1000/podman/podman.sock",
                "ssh://root@localhost:40022/run/podman/podman.sock",
            ]
        );

        conns.add_machine(&sample("other", &dirs), false).unwrap();
        assert_eq!(conns.default_connection().unwrap().as_deref(), Some("dev"));

        conns.set_rootful("dev", true).unwrap();
        assert_eq!(
            conns.default_connection().unwrap().as_deref(),
            Some("dev-root")
        );
        assert!(conns.set_rootful("missing", true).is_err());

        conns.remove_machine("dev").unwrap();
        let names: Vec<_> = conns.list().unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(names, ["other", "other-root"]);
        assert_eq!(conns.default_connection().unwrap().as_deref(), Some("other"));
    }

    #[test]
    fn test_concurrent_adds_are_kept() {
        let td = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(td.path()).unwrap();
        let dirs = MachineDirs::under(base, VmType::Qemu);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let conns = Connections::new(&dirs.connections_file);
                let cfg = sample(&format!("m{i}"), &dirs);
                std::thread::spawn(move || conns.add_machine(&cfg, false).unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let conns = Connections::new(&dirs.connections_file);
        let mut names: Vec<_> = conns.list().unwrap().into_iter().map(|c| c.name).collect();
        names.sort();
        let mut expected: Vec<_> = (0..8)
            .flat_map(|i| [format!("m{i}"), format!("m{i}-root")])
            .collect();
        expected.sort();
        assert_eq!(names, expected);
    }
}
