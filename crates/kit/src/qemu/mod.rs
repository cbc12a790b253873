//! Machines as QEMU virtual machines.
//!
//! The guest is a Fedora Cloud disk image booted by a daemonized emulator.
//! The remote user and its SSH key are handed over as systemd credentials
//! and the host reaches sshd through a loopback port forward. Creation
//! boots the guest once to install podman. The emulator is controlled over
//! its QMP socket.

use std::io::{ErrorKind, Read};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::process::Command;
use std::time::{Duration, Instant};

use bootc_utils::CommandRunExt;
use camino::Utf8Path;
use color_eyre::{
    eyre::{eyre, Context},
    Result,
};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::arch::ArchConfig;
use crate::config::{BackendConfig, MachineConfig, MachineDirs, QemuConfig};
use crate::download::{self, ImageStream, RemoteIndex};
use crate::ports::PortPublishing;
use crate::provider::{
    require_stopped, unsupported, CreateOpts, MachineState, Provider, Removal, SetOptions,
    StartHandles, VmType,
};
use crate::provision::Provisioner;
use crate::ssh;

mod command;
mod qmp;

use qmp::Qmp;

const READY_TIMEOUT: Duration = Duration::from_secs(120);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const QMP_TIMEOUT: Duration = Duration::from_secs(10);
const POLL: Duration = Duration::from_millis(500);

/// [`Provider`] for QEMU.
#[derive(Debug)]
pub(crate) struct QemuProvider {
    dirs: MachineDirs,
    arch: ArchConfig,
}

impl QemuProvider {
    pub(crate) fn new(dirs: MachineDirs) -> Result<Self> {
        Ok(Self {
            dirs,
            arch: ArchConfig::detect()?,
        })
    }
}

fn qemu_of(cfg: &MachineConfig) -> Result<&QemuConfig> {
    match &cfg.backend {
        BackendConfig::Qemu(q) => Ok(q),
        BackendConfig::Wsl(_) => Err(eyre!("{} is not a QEMU machine", cfg.name())),
    }
}

/// PID from the emulator's pidfile, if it is still alive.
fn running_pid(pid_file: &Utf8Path) -> Result<Option<Pid>> {
    let s = match std::fs::read_to_string(pid_file) {
        Ok(s) => s,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Reading {pid_file}")),
    };
    let Ok(raw) = s.trim().parse::<i32>() else {
        warn!("Ignoring malformed pidfile {pid_file}");
        return Ok(None);
    };
    let pid = Pid::from_raw(raw);
    Ok(kill(pid, None).is_ok().then_some(pid))
}

fn wait_for_exit(pid: Pid, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if kill(pid, None).is_err() {
            return true;
        }
        std::thread::sleep(POLL);
    }
    kill(pid, None).is_err()
}

fn remove_runtime_files(q: &QemuConfig) {
    for p in [&q.pid_file, &q.qmp_socket] {
        if let Err(e) = std::fs::remove_file(p) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Removing {p}: {e}");
            }
        }
    }
}

/// Whether something speaking SSH answers on `addr`.
///
/// The port forward accepts connections before the guest is up, so a bare
/// connect proves nothing; wait for the protocol banner.
fn ssh_banner(addr: SocketAddr, timeout: Duration) -> bool {
    let Ok(mut s) = TcpStream::connect_timeout(&addr, timeout) else {
        return false;
    };
    if s.set_read_timeout(Some(timeout)).is_err() {
        return false;
    }
    let mut buf = [0u8; 4];
    s.read_exact(&mut buf).is_ok() && &buf == b"SSH-"
}

fn wait_for_ssh(port: u16, timeout: Duration) -> Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let deadline = Instant::now() + timeout;
    loop {
        if ssh_banner(addr, Duration::from_secs(2)) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(eyre!(
                "SSH did not come up on port {port} within {}s",
                timeout.as_secs()
            ));
        }
        std::thread::sleep(POLL);
    }
}

fn resize_disk(image: &Utf8Path, size_gib: u64) -> Result<()> {
    Command::new("qemu-img")
        .args(["resize", "-q", image.as_str(), &format!("{size_gib}G")])
        .run()
        .map_err(|e| eyre!("Resizing {image}: {e}"))
}

fn force_kill(q: &QemuConfig) -> Result<()> {
    if let Some(pid) = running_pid(&q.pid_file)? {
        kill(pid, Signal::SIGKILL).with_context(|| format!("Killing {pid}"))?;
        wait_for_exit(pid, SHUTDOWN_TIMEOUT);
    }
    remove_runtime_files(q);
    Ok(())
}

impl Provider for QemuProvider {
    fn vm_type(&self) -> VmType {
        VmType::Qemu
    }

    fn dirs(&self) -> &MachineDirs {
        &self.dirs
    }

    /// A QEMU machine is known to the backend only while an emulator
    /// owns its pidfile; a leftover disk image is just a file.
    fn exists(&self, name: &str) -> Result<bool> {
        let pid_file = self.dirs.runtime_dir.join(format!("{name}.pid"));
        Ok(running_pid(&pid_file)?.is_some())
    }

    fn image_path(&self, name: &str) -> camino::Utf8PathBuf {
        self.dirs.data_dir.join(format!("{name}.qcow2"))
    }

    fn get_disk(&self, stream: &ImageStream, cfg: &MachineConfig) -> Result<()> {
        let index = RemoteIndex::fedora_cloud()?;
        download::acquire(stream, &index, &self.dirs.cache_dir(), &cfg.image_path)
    }

    fn create_vm(
        &self,
        p: &mut Provisioner,
        opts: &CreateOpts,
        cfg: &mut MachineConfig,
    ) -> Result<()> {
        if opts.user_mode_networking {
            return Err(unsupported("user-mode networking", VmType::Qemu));
        }
        self.arch.validate_emulator()?;
        cfg.backend = BackendConfig::for_machine(&self.dirs, cfg.name());
        let cfg = &*cfg;
        // The image itself is undone by whoever acquired it.
        p.run_step("resize disk", || {
            resize_disk(&cfg.image_path, cfg.resources.disk_size)
        })?;
        ssh::provision_keypair(p, &cfg.ssh.identity_path)?;

        // First boot installs the container runtime; the machine is left
        // stopped afterwards.
        let q = qemu_of(cfg)?.clone();
        let handles = p.step("boot guest", || self.start_vm(cfg), move || force_kill(&q))?;
        p.run_step("configure guest", || {
            (handles.ready)()?;
            info!("Configuring guest (this will take awhile)...");
            let script = command::guest_setup_script(&cfg.ssh.remote_username);
            ssh::run_in_guest(&cfg.ssh, "root", &["sh".into(), "-c".into(), script])
                .context("Configuring guest")?;
            self.stop_vm(cfg, false)
        })
    }

    fn start_vm(&self, cfg: &MachineConfig) -> Result<StartHandles> {
        let q = qemu_of(cfg)?.clone();
        std::fs::create_dir_all(&self.dirs.runtime_dir)
            .with_context(|| format!("Creating {}", self.dirs.runtime_dir))?;
        remove_runtime_files(&q);
        let pubkey = ssh::keypair_at(&cfg.ssh.identity_path).public_key()?;
        let mut cmd = command::qemu_command(&self.arch, cfg, &q, &pubkey);
        debug!("Running command: {cmd:?}");
        cmd.run().map_err(|e| eyre!("Starting QEMU: {e}"))?;
        let port = cfg.ssh.port;
        Ok(StartHandles {
            cleanup: Some(Box::new(move || force_kill(&q))),
            ready: Box::new(move || wait_for_ssh(port, READY_TIMEOUT)),
        })
    }

    fn stop_vm(&self, cfg: &MachineConfig, hard: bool) -> Result<()> {
        let q = qemu_of(cfg)?;
        let Some(pid) = running_pid(&q.pid_file)? else {
            debug!("{} is not running", cfg.name());
            remove_runtime_files(q);
            return Ok(());
        };
        let command = if hard { "quit" } else { "system_powerdown" };
        match Qmp::connect(&q.qmp_socket, QMP_TIMEOUT).and_then(|mut m| m.execute(command)) {
            Ok(_) => {}
            // The monitor goes away with the process on quit.
            Err(e) if hard => debug!("QMP quit: {e:#}"),
            Err(e) => warn!("Could not request shutdown of {}: {e:#}", cfg.name()),
        }
        if !wait_for_exit(pid, SHUTDOWN_TIMEOUT) {
            info!("{} did not shut down in time, killing it", cfg.name());
            kill(pid, Signal::SIGKILL).with_context(|| format!("Killing {pid}"))?;
            wait_for_exit(pid, SHUTDOWN_TIMEOUT);
        }
        remove_runtime_files(q);
        Ok(())
    }

    fn state(&self, cfg: &MachineConfig) -> Result<MachineState> {
        Ok(match running_pid(&qemu_of(cfg)?.pid_file)? {
            Some(_) => MachineState::Running,
            None => MachineState::Stopped,
        })
    }

    fn remove(&self, cfg: &MachineConfig) -> Result<Removal> {
        require_stopped(self, cfg)?;
        let q = qemu_of(cfg)?.clone();
        Ok(Removal {
            files: Vec::new(),
            destroy: Box::new(move || {
                remove_runtime_files(&q);
                Ok(())
            }),
        })
    }

    fn set_provider_attrs(&self, cfg: &mut MachineConfig, opts: &SetOptions) -> Result<()> {
        if opts.user_mode_networking == Some(true) {
            return Err(unsupported("user-mode networking", VmType::Qemu));
        }
        if opts.cpus.is_none() && opts.memory.is_none() && opts.disk_size.is_none() {
            return Ok(());
        }
        if let Some(d) = opts.disk_size {
            if d < cfg.resources.disk_size {
                return Err(eyre!(
                    "new disk size must be larger than the current {} GiB",
                    cfg.resources.disk_size
                ));
            }
        }
        require_stopped(self, cfg)?;
        if let Some(d) = opts.disk_size.filter(|d| *d != cfg.resources.disk_size) {
            resize_disk(&cfg.image_path, d)?;
            cfg.resources.disk_size = d;
        }
        if let Some(c) = opts.cpus {
            cfg.resources.cpus = c;
        }
        if let Some(m) = opts.memory {
            cfg.resources.memory = m;
        }
        Ok(())
    }

    fn mount_volumes_to_vm(&self, cfg: &MachineConfig) -> Result<()> {
        for (i, m) in cfg.mounts.iter().enumerate() {
            info!("Mounting volume... {}:{}", m.source, m.target);
            let script = command::guest_mount_script(i, m);
            ssh::run_in_guest(&cfg.ssh, "root", &["sh".into(), "-c".into(), script])
                .with_context(|| format!("Mounting {} in the guest", m.target))?;
        }
        Ok(())
    }

    fn start_networking(&self, _cfg: &MachineConfig) -> Result<()> {
        Ok(())
    }

    fn stop_host_networking(&self, _cfg: &MachineConfig) -> Result<()> {
        Ok(())
    }

    fn user_mode_networking_enabled(&self, _cfg: &MachineConfig) -> bool {
        false
    }

    fn port_publishing(&self) -> PortPublishing {
        PortPublishing::DropHostIp
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::TcpListener;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::config::tests::sample;
    use crate::errors::{machine_error, MachineError};

    fn provider() -> (tempfile::TempDir, QemuProvider) {
        let td = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(td.path()).unwrap().to_owned();
        let p = QemuProvider::new(MachineDirs::under(&base, VmType::Qemu)).unwrap();
        (td, p)
    }

    #[test]
    fn test_stopped_machine() {
        let (_td, p) = provider();
        let cfg = sample("dev", p.dirs());
        assert_eq!(p.state(&cfg).unwrap(), MachineState::Stopped);
        // Stopping twice is fine.
        p.stop_vm(&cfg, false).unwrap();
        p.stop_vm(&cfg, true).unwrap();
        assert!(!p.exists("dev").unwrap());
    }

    #[test]
    fn test_kept_image_is_not_a_machine() {
        let (_td, p) = provider();
        std::fs::create_dir_all(&p.dirs().data_dir).unwrap();
        std::fs::write(p.image_path("dev"), b"qcow2").unwrap();
        assert!(!p.exists("dev").unwrap());

        let cfg = sample("dev", p.dirs());
        let q = qemu_of(&cfg).unwrap();
        std::fs::create_dir_all(&p.dirs().runtime_dir).unwrap();
        std::fs::write(&q.pid_file, std::process::id().to_string()).unwrap();
        assert!(p.exists("dev").unwrap());
        assert!(!p.exists("other").unwrap());
    }

    #[test]
    fn test_running_detected_from_pidfile() {
        let (_td, p) = provider();
        let cfg = sample("dev", p.dirs());
        let q = qemu_of(&cfg).unwrap();
        std::fs::create_dir_all(&p.dirs().runtime_dir).unwrap();
        std::fs::write(&q.pid_file, std::process::id().to_string()).unwrap();
        assert_eq!(p.state(&cfg).unwrap(), MachineState::Running);
        let e = p.remove(&cfg).unwrap_err();
        assert_eq!(
            machine_error(&e),
            Some(&MachineError::AlreadyRunning("dev".into()))
        );
        assert!(q.pid_file.exists());

        std::fs::write(&q.pid_file, "not a pid").unwrap();
        assert_eq!(p.state(&cfg).unwrap(), MachineState::Stopped);
    }

    #[test]
    fn test_set_attrs_validation() {
        let (_td, p) = provider();
        let mut cfg = sample("dev", p.dirs());
        let before = cfg.clone();
        let e = p
            .set_provider_attrs(
                &mut cfg,
                &SetOptions {
                    cpus: Some(8),
                    user_mode_networking: Some(true),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(
            machine_error(&e),
            Some(MachineError::UnsupportedAttribute { .. })
        ));
        assert!(p
            .set_provider_attrs(
                &mut cfg,
                &SetOptions {
                    cpus: Some(8),
                    disk_size: Some(10),
                    ..Default::default()
                },
            )
            .is_err());
        assert_eq!(cfg, before);

        p.set_provider_attrs(
            &mut cfg,
            &SetOptions {
                cpus: Some(8),
                memory: Some(8192),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!((cfg.resources.cpus, cfg.resources.memory), (8, 8192));
        assert_eq!(p.port_publishing(), PortPublishing::DropHostIp);
    }

    #[test]
    fn test_wait_for_ssh() {
        let l = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = l.local_addr().unwrap().port();
        std::thread::spawn(move || {
            // First connection is the forward with nothing behind it.
            drop(l.accept().unwrap());
            let (mut s, _) = l.accept().unwrap();
            s.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").unwrap();
        });
        wait_for_ssh(port, Duration::from_secs(20)).unwrap();
    }

    #[test]
    fn test_wait_for_ssh_times_out() {
        let l = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = l.local_addr().unwrap().port();
        drop(l);
        assert!(wait_for_ssh(port, Duration::ZERO).is_err());
    }
}
