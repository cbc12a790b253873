//! Machines as WSL 2 distributions.
//!
//! The guest is a Fedora root filesystem imported with `wsl --import`. WSL
//! gives every distribution a shared kernel and network namespace, so the
//! guest's systemd runs in its own PID namespace and the container runtime
//! is reached over SSH on a per-machine port.

use std::io::Write;
use std::process::Stdio;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use color_eyre::{
    eyre::{eyre, Context},
    Result,
};
use tracing::{debug, error, info, warn};

use crate::config::{BackendConfig, MachineConfig, MachineDirs, WslConfig};
use crate::download::{self, ImageStream, RemoteIndex, CUSTOM_STREAM};
use crate::elevate::{host_privileges, Readiness};
use crate::ports::PortPublishing;
use crate::provider::{
    require_stopped, unsupported, CreateOpts, HostContext, MachineState, Provider, Removal,
    SetOptions, StartHandles, VmType,
};
use crate::provision::Provisioner;
use crate::relay::RelayService;
use crate::ssh;
use crate::volumes;

pub(crate) mod dist;
mod guest;
mod install;
mod usermode;

use dist::Distribution;

/// How long `ready` waits for the nested systemd.
const READY_TIMEOUT: Duration = Duration::from_secs(30);
const READY_POLL: Duration = Duration::from_millis(250);

/// [`Provider`] for WSL.
#[derive(Debug)]
pub(crate) struct WslProvider {
    dirs: MachineDirs,
}

impl WslProvider {
    pub(crate) fn new(dirs: MachineDirs) -> Self {
        Self { dirs }
    }

    /// Install locations of imported distributions.
    fn wsldist_dir(&self) -> Utf8PathBuf {
        self.dirs.data_dir.join("wsldist")
    }

    fn relay(&self) -> Result<RelayService> {
        RelayService::init(
            &self.dirs.runtime_dir.join("usermode-relay"),
            Box::new(usermode::UserModeRelay::new()),
        )
    }

    fn is_running(&self, cfg: &MachineConfig) -> Result<bool> {
        Distribution::for_machine(cfg.name()).is_running()
    }
}

fn wsl_config(cfg: &MachineConfig) -> WslConfig {
    match &cfg.backend {
        BackendConfig::Wsl(c) => *c,
        BackendConfig::Qemu(_) => WslConfig::default(),
    }
}

fn wait_for_systemd(dist: &Distribution, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(pid) = dist.systemd_pid()? {
            debug!("systemd running in {} as {pid}", dist.name());
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(eyre!(
                "systemd did not start in {} within {}s",
                dist.name(),
                timeout.as_secs()
            ));
        }
        std::thread::sleep(READY_POLL);
    }
}

/// Shut the nested systemd down, waiting for it to exit.
fn stop_systemd(dist: &Distribution) -> Result<()> {
    let mut wait = dist
        .command(&["sh"])
        .stdin(Stdio::piped())
        .spawn()
        .context("Executing wait command")?;
    if let Some(mut stdin) = wait.stdin.take() {
        stdin.write_all(guest::WAIT_TERM.as_bytes())?;
    }
    let exit = dist.run(
        "Stopping systemd",
        &[guest::ENTERNS_PATH, "systemctl", "exit", "0"],
    );
    if let Err(e) = exit {
        let _ = wait.kill();
        let _ = wait.wait();
        return Err(e);
    }
    wait.wait()?;
    Ok(())
}

impl Provider for WslProvider {
    fn vm_type(&self) -> VmType {
        VmType::Wsl
    }

    fn dirs(&self) -> &MachineDirs {
        &self.dirs
    }

    fn prepare_host(&self, ctx: &HostContext<'_>) -> Result<Readiness> {
        install::check_and_install_wsl(
            ctx.reexec,
            host_privileges().as_ref(),
            &install::WslCli,
            ctx.invocation,
            ctx.data_home,
        )
    }

    fn exists(&self, name: &str) -> Result<bool> {
        match Distribution::for_machine(name).is_registered() {
            Ok(v) => Ok(v),
            Err(e) => {
                debug!("Listing distributions: {e}");
                Ok(false)
            }
        }
    }

    fn image_path(&self, name: &str) -> Utf8PathBuf {
        self.dirs.data_dir.join(format!("{name}-rootfs.tar"))
    }

    fn get_disk(&self, stream: &ImageStream, cfg: &MachineConfig) -> Result<()> {
        let index = RemoteIndex::fedora_rootfs()?;
        download::acquire(stream, &index, &self.dirs.cache_dir(), &cfg.image_path)
    }

    fn create_vm(
        &self,
        p: &mut Provisioner,
        opts: &CreateOpts,
        cfg: &mut MachineConfig,
    ) -> Result<()> {
        cfg.backend = BackendConfig::Wsl(WslConfig {
            user_mode_networking: opts.user_mode_networking,
        });
        let cfg = &*cfg;
        let dist = Distribution::for_machine(cfg.name());
        let target = self.wsldist_dir().join(cfg.name());
        let user = cfg.ssh.remote_username.as_str();

        info!("Importing operating system into WSL (this may take a few minutes on a new WSL install)...");
        p.step(
            "import guest OS",
            || {
                let r = dist.import(&target, &cfg.image_path);
                if r.is_err() {
                    let _ = std::fs::remove_dir_all(&target);
                }
                r
            },
            {
                let dist = dist.clone();
                let target = target.clone();
                move || {
                    dist.unregister()?;
                    std::fs::remove_dir_all(&target).with_context(|| format!("Removing {target}"))
                }
            },
        )?;

        if opts.user_mode_networking {
            p.run_step("install user-mode networking", || {
                usermode::install_usermode_dist(&self.wsldist_dir(), &cfg.image_path)?;
                usermode::set_marker(&dist, true)
            })?;
        }

        if cfg.image_stream != CUSTOM_STREAM {
            p.run_step("install packages", || guest::install_packages(&dist))?;
        }
        p.run_step("configure guest", || {
            guest::configure_system(&dist, user, cfg.ssh.port)
        })?;
        p.run_step("install guest scripts", || guest::install_scripts(&dist))?;

        let pair = ssh::provision_keypair(p, &cfg.ssh.identity_path)?;
        p.run_step("authorize SSH key", || {
            guest::install_authorized_key(&dist, user, &pair.public_key()?)
        })?;

        // Recycle so the next start boots with the new configuration.
        p.run_step("terminate", || dist.terminate())
    }

    fn start_vm(&self, cfg: &MachineConfig) -> Result<StartHandles> {
        let dist = Distribution::for_machine(cfg.name());
        guest::configure_proxy(&dist, &guest::host_proxy_vars())?;
        dist.run("the WSL bootstrap script failed", &[guest::BOOTSTRAP_PATH])?;
        let ready_dist = dist.clone();
        Ok(StartHandles {
            cleanup: Some(Box::new(move || dist.terminate())),
            ready: Box::new(move || wait_for_systemd(&ready_dist, READY_TIMEOUT)),
        })
    }

    fn stop_vm(&self, cfg: &MachineConfig, hard: bool) -> Result<()> {
        if !self.is_running(cfg)? {
            debug!("{} is not running", cfg.name());
            return Ok(());
        }
        let dist = Distribution::for_machine(cfg.name());
        if let Err(e) = self.stop_host_networking(cfg) {
            warn!("Could not cleanly stop user-mode networking: {e}");
        }
        if !hard {
            if let Err(e) = stop_systemd(&dist) {
                warn!("Graceful shutdown of {} failed: {e:#}", dist.name());
            }
        }
        dist.terminate()
    }

    fn state(&self, cfg: &MachineConfig) -> Result<MachineState> {
        Ok(if self.is_running(cfg)? {
            MachineState::Running
        } else {
            MachineState::Stopped
        })
    }

    fn remove(&self, cfg: &MachineConfig) -> Result<Removal> {
        require_stopped(self, cfg)?;
        let dist = Distribution::for_machine(cfg.name());
        let target = self.wsldist_dir().join(cfg.name());
        Ok(Removal {
            files: vec![target.clone()],
            destroy: Box::new(move || {
                if let Err(e) = dist.unregister() {
                    error!("{e:#}");
                }
                if let Err(e) = std::fs::remove_dir_all(&target) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        error!("Removing {target}: {e}");
                    }
                }
                Ok(())
            }),
        })
    }

    fn set_provider_attrs(&self, cfg: &mut MachineConfig, opts: &SetOptions) -> Result<()> {
        if opts.cpus.is_some() {
            return Err(unsupported("CPUs", VmType::Wsl));
        }
        if opts.memory.is_some() {
            return Err(unsupported("memory", VmType::Wsl));
        }
        if opts.disk_size.is_some() {
            return Err(unsupported("disk size", VmType::Wsl));
        }
        let Some(enable) = opts.user_mode_networking else {
            return Ok(());
        };
        if enable == wsl_config(cfg).user_mode_networking {
            return Ok(());
        }
        require_stopped(self, cfg)
            .context("user-mode networking can only be changed when the machine is not running")?;
        let dist = Distribution::for_machine(cfg.name());
        if enable {
            usermode::install_usermode_dist(&self.wsldist_dir(), &cfg.image_path)?;
        }
        usermode::set_marker(&dist, enable)
            .context("failure changing state of user-mode networking setting")?;
        cfg.backend = BackendConfig::Wsl(WslConfig {
            user_mode_networking: enable,
        });
        Ok(())
    }

    fn translate_mount_source(&self, source: &str) -> Result<String> {
        volumes::convert_mount_path(source, volumes::drive_exists)
    }

    fn mount_volumes_to_vm(&self, cfg: &MachineConfig) -> Result<()> {
        // Host drives are already visible under /mnt.
        debug!("{}: {} volumes need no mounting", cfg.name(), cfg.mounts.len());
        Ok(())
    }

    fn start_networking(&self, cfg: &MachineConfig) -> Result<()> {
        if wsl_config(cfg).user_mode_networking {
            self.relay()?.acquire(cfg.name())?;
        }
        Ok(())
    }

    fn stop_host_networking(&self, cfg: &MachineConfig) -> Result<()> {
        // Release unconditionally; the setting may have changed since start.
        self.relay()?.release(cfg.name())
    }

    fn user_mode_networking_enabled(&self, cfg: &MachineConfig) -> bool {
        wsl_config(cfg).user_mode_networking
    }

    fn port_publishing(&self) -> PortPublishing {
        PortPublishing::DualStackSplit
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8Path;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::config::tests::sample;
    use crate::errors::{machine_error, MachineError};

    fn provider() -> (tempfile::TempDir, WslProvider) {
        let td = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(td.path()).unwrap().to_owned();
        (td, WslProvider::new(MachineDirs::under(&base, VmType::Wsl)))
    }

    #[test]
    fn test_unsupported_attrs_leave_config_alone() {
        let (_td, p) = provider();
        let mut cfg = sample("dev", p.dirs());
        let before = cfg.clone();
        for (opts, attr) in [
            (
                SetOptions {
                    cpus: Some(4),
                    user_mode_networking: Some(true),
                    ..Default::default()
                },
                "CPUs",
            ),
            (
                SetOptions {
                    memory: Some(4096),
                    ..Default::default()
                },
                "memory",
            ),
            (
                SetOptions {
                    disk_size: Some(200),
                    ..Default::default()
                },
                "disk size",
            ),
        ] {
            let e = p.set_provider_attrs(&mut cfg, &opts).unwrap_err();
            assert_eq!(
                machine_error(&e),
                Some(&MachineError::UnsupportedAttribute {
                    attribute: attr,
                    backend: "wsl".into()
                })
            );
        }
        assert_eq!(cfg, before);
        // Unchanged setting needs no probing.
        p.set_provider_attrs(
            &mut cfg,
            &SetOptions {
                user_mode_networking: Some(false),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(cfg, before);
    }

    #[test]
    fn test_accessors() {
        let (_td, p) = provider();
        let mut cfg = sample("dev", p.dirs());
        assert!(!p.user_mode_networking_enabled(&cfg));
        cfg.backend = BackendConfig::Wsl(WslConfig {
            user_mode_networking: true,
        });
        assert!(p.user_mode_networking_enabled(&cfg));
        assert_eq!(p.port_publishing(), PortPublishing::DualStackSplit);
        assert!(p.image_path("dev").ends_with("wsl/dev-rootfs.tar"));
        assert_eq!(
            p.translate_mount_source("/home/me/src").unwrap(),
            "/home/me/src"
        );
    }
}
