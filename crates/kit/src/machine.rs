//! Machine lifecycle on top of a [`Provider`].
//!
//! Everything here is backend independent: configuration, locking, SSH
//! identities, connections and rollback are handled once, and the backend
//! only sees the calls of the [`Provider`] contract. Each entry point takes
//! the machine's lock itself, so none of them may call another while holding
//! it.

use std::io::ErrorKind;
use std::process::Command;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use color_eyre::{
    eyre::{eyre, Context},
    Result,
};
use comfy_table::{presets, Table};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{BackendConfig, MachineConfig, Mount, ResourceConfig, SshConfig};
use crate::connections::{root_connection_name, Connections};
use crate::download::ImageStream;
use crate::elevate::{DeferReason, ElevatedOutputLog, Invocation, Readiness};
use crate::errors::MachineError;
use crate::provider::{CreateOpts, HostContext, MachineState, Provider, SetOptions, VmType};
use crate::provision::Provisioner;
use crate::ssh;

/// Inputs of [`init`].
#[derive(Debug, Clone)]
pub(crate) struct InitOptions {
    pub(crate) name: String,
    pub(crate) resources: ResourceConfig,
    /// Image stream name, release number or local path
    pub(crate) image: String,
    pub(crate) username: String,
    pub(crate) rootful: bool,
    pub(crate) user_mode_networking: bool,
    /// `SOURCE:TARGET[:ro]` host directories to share
    pub(crate) volumes: Vec<String>,
    /// Set in a process relaunched by the elevation machinery
    pub(crate) reexec: bool,
}

/// How [`init`] ended.
#[derive(Debug)]
pub(crate) enum InitOutcome {
    Created(Box<MachineConfig>),
    /// Nothing was created; the host needs attention first.
    Deferred(DeferReason),
}

/// Inputs of [`remove`].
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RemoveOptions {
    /// Skip the confirmation
    pub(crate) force: bool,
    pub(crate) save_keys: bool,
    pub(crate) save_image: bool,
}

fn remove_file_if_exists(path: &Utf8PathBuf) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Removing {path}")),
    }
}

/// Create and register a new machine.
///
/// A host that first needs an installation, an elevated helper or a reboot
/// yields [`InitOutcome::Deferred`] without creating anything. A failure
/// after the first side effect rolls every completed step back.
#[instrument(skip(provider, invocation), fields(name = %opts.name))]
pub(crate) fn init(
    provider: &dyn Provider,
    opts: &InitOptions,
    invocation: &Invocation,
) -> Result<InitOutcome> {
    let r = init_inner(provider, opts, invocation);
    if opts.reexec {
        if let Err(e) = &r {
            ElevatedOutputLog::new(&provider.dirs().data_home).append_error(e);
        }
    }
    r
}

fn init_inner(
    provider: &dyn Provider,
    opts: &InitOptions,
    invocation: &Invocation,
) -> Result<InitOutcome> {
    let dirs = provider.dirs();
    let store = dirs.store();
    let name = opts.name.as_str();
    if store.exists(name) || provider.exists(name)? {
        return Err(MachineError::AlreadyExists(name.to_owned()).into());
    }

    let ctx = HostContext {
        reexec: opts.reexec,
        invocation,
        data_home: &dirs.data_home,
    };
    if let Readiness::Deferred(reason) = provider.prepare_host(&ctx)? {
        info!("Machine creation deferred: {reason}");
        return Ok(InitOutcome::Deferred(reason));
    }

    dirs.ensure()?;
    let _lock = store.lock(name)?;
    // Another process may have won the race for the name.
    if store.exists(name) {
        return Err(MachineError::AlreadyExists(name.to_owned()).into());
    }

    let stream = ImageStream::parse(&opts.image);
    let mut mounts = Vec::with_capacity(opts.volumes.len());
    for v in &opts.volumes {
        let mut m = Mount::parse(v)?;
        m.source = provider.translate_mount_source(&m.source)?;
        mounts.push(m);
    }

    let mut cfg = MachineConfig::new(
        name,
        SshConfig {
            port: ssh::find_available_port()?,
            identity_path: dirs.ssh_dir.join(name),
            remote_username: opts.username.clone(),
        },
        provider.image_path(name),
        opts.resources,
        BackendConfig::for_machine(dirs, name),
    );
    cfg.image_stream = stream.name().to_owned();
    cfg.host_user.rootful = opts.rootful;
    cfg.mounts = mounts;

    let connections = Connections::new(&dirs.connections_file);
    Provisioner::run(|p| {
        let image = cfg.image_path.clone();
        p.step(
            "acquire image",
            || provider.get_disk(&stream, &cfg),
            move || remove_file_if_exists(&image),
        )?;
        provider.create_vm(
            p,
            &CreateOpts {
                user_mode_networking: opts.user_mode_networking,
            },
            &mut cfg,
        )?;
        let undo = connections.clone();
        let owned_name = name.to_owned();
        p.step(
            "register connections",
            || connections.add_machine(&cfg, opts.rootful),
            move || undo.remove_machine(&owned_name),
        )?;
        p.run_step("save configuration", || store.save(&cfg))
    })?;
    info!("Machine {name} created on {}", provider.vm_type());
    Ok(InitOutcome::Created(Box::new(cfg)))
}

/// Run a started machine's readiness check, undoing the start on failure.
fn await_ready(provider: &dyn Provider, cfg: &MachineConfig) -> Result<()> {
    let handles = provider.start_vm(cfg)?;
    if let Err(e) = (handles.ready)() {
        if let Some(cleanup) = handles.cleanup {
            if let Err(ce) = cleanup() {
                warn!("Cleaning up failed start of {}: {ce:#}", cfg.name());
            }
        }
        return Err(e);
    }
    Ok(())
}

/// Boot a stopped machine and wait until it is usable.
#[instrument(skip(provider))]
pub(crate) fn start(provider: &dyn Provider, name: &str) -> Result<()> {
    let store = provider.dirs().store();
    let _lock = store.lock(name)?;
    let mut cfg = store.load(name)?;
    if provider.state(&cfg)? == MachineState::Running {
        return Err(MachineError::AlreadyRunning(name.to_owned()).into());
    }

    info!("Starting machine {name}");
    provider.start_networking(&cfg)?;
    if let Err(e) = await_ready(provider, &cfg) {
        if let Err(ne) = provider.stop_host_networking(&cfg) {
            warn!("Releasing networking of {name}: {ne:#}");
        }
        return Err(e).wrap_err_with(|| format!("Starting machine {name}"));
    }

    cfg.last_up = Some(Utc::now());
    store.save(&cfg)?;
    provider.mount_volumes_to_vm(&cfg)?;
    info!("Machine {name} started successfully");
    Ok(())
}

/// Stop a machine; stopping a stopped machine does nothing.
#[instrument(skip(provider))]
pub(crate) fn stop(provider: &dyn Provider, name: &str, hard: bool) -> Result<()> {
    let store = provider.dirs().store();
    let _lock = store.lock(name)?;
    let cfg = store.load(name)?;
    if provider.state(&cfg)? == MachineState::Stopped {
        info!("Machine {name} is not running");
    } else {
        provider.stop_vm(&cfg, hard)?;
        info!("Machine {name} stopped");
    }
    // A machine that died on its own may still hold a networking reference.
    if let Err(e) = provider.stop_host_networking(&cfg) {
        warn!("Releasing networking of {name}: {e:#}");
    }
    Ok(())
}

/// Delete a stopped machine and everything it owns on the host.
///
/// Without `force`, the files to be deleted are listed and `confirm` decides.
/// Once confirmed, every deletion is attempted and failures are only
/// logged. Returns whether the machine was removed.
#[instrument(skip(provider, confirm))]
pub(crate) fn remove(
    provider: &dyn Provider,
    name: &str,
    opts: RemoveOptions,
    confirm: impl FnOnce(&str) -> Result<bool>,
) -> Result<bool> {
    let dirs = provider.dirs();
    let store = dirs.store();
    let lock = store.lock(name)?;
    let cfg = store.load(name)?;
    let removal = provider.remove(&cfg)?;

    let mut files = Vec::new();
    if !opts.save_keys {
        files.push(cfg.ssh.identity_path.clone());
        files.push(cfg.ssh.public_key_path());
    }
    if !opts.save_image {
        files.push(cfg.image_path.clone());
    }
    files.push(store.config_path(&cfg));

    if !opts.force {
        let mut msg = String::from("The following files will be deleted:\n\n");
        for f in files.iter().chain(&removal.files) {
            msg.push_str(&format!("{f}\n"));
        }
        msg.push_str(&format!("\nRemove machine {name}?"));
        if !confirm(&msg)? {
            info!("Not removing {name}");
            return Ok(false);
        }
    }

    for f in &files {
        if let Err(e) = remove_file_if_exists(f) {
            error!("{e:#}");
        }
    }
    if let Err(e) = Connections::new(&dirs.connections_file).remove_machine(name) {
        error!("Removing connections of {name}: {e:#}");
    }
    if let Err(e) = (removal.destroy)() {
        error!("Removing {name}: {e:#}");
    }
    drop(lock);
    if let Err(e) = store.remove(name) {
        error!("{e:#}");
    }
    info!("Machine {name} removed");
    Ok(true)
}

/// Change machine settings. Backend attributes are validated as a whole
/// before any of them is applied.
#[instrument(skip(provider))]
pub(crate) fn set(provider: &dyn Provider, name: &str, opts: &SetOptions) -> Result<()> {
    let store = provider.dirs().store();
    let _lock = store.lock(name)?;
    let mut cfg = store.load(name)?;
    provider.set_provider_attrs(&mut cfg, opts)?;
    if let Some(rootful) = opts.rootful.filter(|r| *r != cfg.host_user.rootful) {
        Connections::new(&provider.dirs().connections_file).set_rootful(name, rootful)?;
        cfg.host_user.rootful = rootful;
    }
    store.save(&cfg)
}

/// One row of `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ListEntry {
    pub(crate) name: String,
    /// Whether one of the machine's connections is the default
    pub(crate) default: bool,
    #[serde(rename = "VMType")]
    pub(crate) vm_type: VmType,
    pub(crate) image: String,
    pub(crate) created: DateTime<Utc>,
    pub(crate) last_up: Option<DateTime<Utc>>,
    pub(crate) running: bool,
    #[serde(rename = "CPUs")]
    pub(crate) cpus: u64,
    pub(crate) memory: u64,
    pub(crate) disk_size: u64,
}

/// Every machine of the provider, with its current state.
pub(crate) fn list(provider: &dyn Provider) -> Result<Vec<ListEntry>> {
    let default = Connections::new(&provider.dirs().connections_file).default_connection()?;
    provider
        .dirs()
        .store()
        .list()?
        .into_iter()
        .map(|cfg| {
            let running = provider.state(&cfg)? == MachineState::Running;
            let default = default
                .as_deref()
                .is_some_and(|d| d == cfg.name() || d == root_connection_name(cfg.name()));
            Ok(ListEntry {
                name: cfg.name().to_owned(),
                default,
                vm_type: cfg.vm_type(),
                image: cfg.image_stream.clone(),
                created: cfg.created,
                last_up: cfg.last_up,
                running,
                cpus: cfg.resources.cpus,
                memory: cfg.resources.memory,
                disk_size: cfg.resources.disk_size,
            })
        })
        .collect()
}

fn format_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M").to_string()
}

/// Render `list` output for a terminal.
pub(crate) fn list_table(entries: &[ListEntry]) -> Table {
    let mut table = Table::new();
    table.load_preset(presets::NOTHING).set_header([
        "NAME", "VM TYPE", "IMAGE", "CREATED", "LAST UP", "CPUS", "MEMORY", "DISK SIZE",
    ]);
    for e in entries {
        let name = if e.default {
            format!("{}*", e.name)
        } else {
            e.name.clone()
        };
        let last_up = match (e.running, e.last_up) {
            (true, _) => "Currently running".to_owned(),
            (false, Some(t)) => format_time(t),
            (false, None) => "Never".to_owned(),
        };
        table.add_row([
            name,
            e.vm_type.to_string(),
            e.image.clone(),
            format_time(e.created),
            last_up,
            e.cpus.to_string(),
            format!("{}MiB", e.memory),
            format!("{}GiB", e.disk_size),
        ]);
    }
    table
}

/// `inspect` output for one machine.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct MachineInfo {
    #[serde(flatten)]
    pub(crate) config: MachineConfig,
    pub(crate) state: MachineState,
    pub(crate) config_path: Utf8PathBuf,
    pub(crate) user_mode_networking: bool,
}

pub(crate) fn inspect(provider: &dyn Provider, name: &str) -> Result<MachineInfo> {
    let store = provider.dirs().store();
    let config = store.load(name)?;
    Ok(MachineInfo {
        state: provider.state(&config)?,
        config_path: store.config_path(&config),
        user_mode_networking: provider.user_mode_networking_enabled(&config),
        config,
    })
}

fn running_config(provider: &dyn Provider, name: &str) -> Result<MachineConfig> {
    let cfg = provider.dirs().store().load(name)?;
    if provider.state(&cfg)? != MachineState::Running {
        return Err(MachineError::NotRunning(name.to_owned()).into());
    }
    Ok(cfg)
}

/// Open an SSH session to a running machine. Returns the remote exit code.
#[instrument(skip(provider))]
pub(crate) fn ssh(
    provider: &dyn Provider,
    name: &str,
    user: Option<&str>,
    args: &[String],
) -> Result<i32> {
    let cfg = running_config(provider, name)?;
    let user = match user {
        Some(u) => u,
        None if cfg.host_user.rootful => "root",
        None => cfg.ssh.remote_username.as_str(),
    };
    let mut cmd: Command = ssh::ssh_command(&cfg.ssh, user, args);
    debug!("Executing: {cmd:?}");
    let status = cmd
        .status()
        .map_err(|e| eyre!("Failed to execute ssh: {e}"))?;
    Ok(status.code().unwrap_or(255))
}

/// An `ssh_config` stanza for the machine.
pub(crate) fn ssh_config(provider: &dyn Provider, name: &str) -> Result<String> {
    let cfg = provider.dirs().store().load(name)?;
    Ok(ssh::ssh_config_stanza(name, &cfg.ssh))
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::sync::{Arc, Mutex};

    use camino::Utf8Path;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::config::MachineDirs;
    use crate::elevate::tests::invocation;
    use crate::errors::machine_error;
    use crate::ports::PortPublishing;
    use crate::provider::{Removal, StartHandles};

    type Log = Arc<Mutex<Vec<String>>>;

    /// Records the contract calls; the guest "runs" while `running` is set.
    struct FakeProvider {
        dirs: MachineDirs,
        log: Log,
        running: Arc<Mutex<bool>>,
        defer: Option<DeferReason>,
        fail_create: bool,
        fail_ready: Cell<bool>,
        /// Names the backend reports as existing without a stored config
        known: Vec<String>,
    }

    impl FakeProvider {
        fn new(base: &Utf8Path) -> Self {
            Self {
                dirs: MachineDirs::under(base, VmType::Qemu),
                log: Log::default(),
                running: Default::default(),
                defer: None,
                fail_create: false,
                fail_ready: Cell::new(false),
                known: Vec::new(),
            }
        }

        fn record(&self, s: &str) {
            self.log.lock().unwrap().push(s.to_owned());
        }

        fn calls(&self) -> Vec<String> {
            std::mem::take(&mut *self.log.lock().unwrap())
        }

        fn is_running(&self) -> bool {
            *self.running.lock().unwrap()
        }
    }

    impl Provider for FakeProvider {
        fn vm_type(&self) -> VmType {
            VmType::Qemu
        }

        fn dirs(&self) -> &MachineDirs {
            &self.dirs
        }

        fn prepare_host(&self, _ctx: &HostContext<'_>) -> Result<Readiness> {
            Ok(self.defer.map_or(Readiness::Ready, Readiness::Deferred))
        }

        fn exists(&self, name: &str) -> Result<bool> {
            Ok(self.known.iter().any(|k| k == name))
        }

        fn image_path(&self, name: &str) -> Utf8PathBuf {
            self.dirs.data_dir.join(format!("{name}.img"))
        }

        fn get_disk(&self, _stream: &ImageStream, cfg: &MachineConfig) -> Result<()> {
            std::fs::write(&cfg.image_path, "disk")?;
            self.record("get_disk");
            Ok(())
        }

        fn create_vm(
            &self,
            p: &mut Provisioner,
            _opts: &CreateOpts,
            cfg: &mut MachineConfig,
        ) -> Result<()> {
            let log = self.log.clone();
            p.step(
                "register",
                || Ok(()),
                move || {
                    log.lock().unwrap().push("unregister".into());
                    Ok(())
                },
            )?;
            let id = cfg.ssh.identity_path.clone();
            std::fs::write(&id, "private")?;
            std::fs::write(cfg.ssh.public_key_path(), "public")?;
            self.record("create_vm");
            if self.fail_create {
                return Err(eyre!("create failed"));
            }
            Ok(())
        }

        fn start_vm(&self, _cfg: &MachineConfig) -> Result<StartHandles> {
            self.record("start_vm");
            *self.running.lock().unwrap() = true;
            let fail = self.fail_ready.get();
            let (log, running) = (self.log.clone(), self.running.clone());
            Ok(StartHandles {
                cleanup: Some(Box::new(move || {
                    log.lock().unwrap().push("cleanup".into());
                    *running.lock().unwrap() = false;
                    Ok(())
                })),
                ready: Box::new(move || {
                    if fail {
                        Err(eyre!("guest never came up"))
                    } else {
                        Ok(())
                    }
                }),
            })
        }

        fn stop_vm(&self, _cfg: &MachineConfig, hard: bool) -> Result<()> {
            self.record(if hard { "kill" } else { "stop_vm" });
            *self.running.lock().unwrap() = false;
            Ok(())
        }

        fn state(&self, _cfg: &MachineConfig) -> Result<MachineState> {
            Ok(if self.is_running() {
                MachineState::Running
            } else {
                MachineState::Stopped
            })
        }

        fn remove(&self, cfg: &MachineConfig) -> Result<Removal> {
            crate::provider::require_stopped(self, cfg)?;
            let log = self.log.clone();
            Ok(Removal {
                files: vec![self.dirs.data_dir.join("backend-state")],
                destroy: Box::new(move || {
                    log.lock().unwrap().push("destroy".into());
                    Ok(())
                }),
            })
        }

        fn set_provider_attrs(&self, cfg: &mut MachineConfig, opts: &SetOptions) -> Result<()> {
            if let Some(c) = opts.cpus {
                cfg.resources.cpus = c;
            }
            Ok(())
        }

        fn mount_volumes_to_vm(&self, _cfg: &MachineConfig) -> Result<()> {
            self.record("mount");
            Ok(())
        }

        fn start_networking(&self, _cfg: &MachineConfig) -> Result<()> {
            self.record("start_networking");
            Ok(())
        }

        fn stop_host_networking(&self, _cfg: &MachineConfig) -> Result<()> {
            self.record("stop_networking");
            Ok(())
        }

        fn user_mode_networking_enabled(&self, _cfg: &MachineConfig) -> bool {
            false
        }

        fn port_publishing(&self) -> PortPublishing {
            PortPublishing::Passthrough
        }
    }

    fn opts(name: &str) -> InitOptions {
        InitOptions {
            name: name.to_owned(),
            resources: ResourceConfig::default(),
            image: String::new(),
            username: "user".into(),
            rootful: false,
            user_mode_networking: false,
            volumes: vec!["/srv/src:/src:ro".into()],
            reexec: false,
        }
    }

    fn fixture() -> (tempfile::TempDir, FakeProvider) {
        let td = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(td.path()).unwrap().to_owned();
        (td, FakeProvider::new(&base))
    }

    fn created(p: &FakeProvider, name: &str) -> MachineConfig {
        match init(p, &opts(name), &invocation()).unwrap() {
            InitOutcome::Created(cfg) => *cfg,
            InitOutcome::Deferred(r) => panic!("unexpected deferral: {r}"),
        }
    }

    #[test]
    fn test_init_registers_machine() {
        let (_td, p) = fixture();
        let cfg = created(&p, "dev");
        assert_eq!(p.calls(), ["get_disk", "create_vm"]);
        assert_eq!(p.dirs.store().load("dev").unwrap(), cfg);
        assert_eq!(cfg.mounts[0].target, "/src");
        assert!(cfg.image_path.exists());
        let conns = Connections::new(&p.dirs.connections_file);
        assert_eq!(conns.list().unwrap().len(), 2);
        assert_eq!(conns.default_connection().unwrap().as_deref(), Some("dev"));

        let e = init(&p, &opts("dev"), &invocation()).unwrap_err();
        assert_eq!(
            machine_error(&e),
            Some(&MachineError::AlreadyExists("dev".into()))
        );
        assert!(p.calls().is_empty());
    }

    #[test]
    fn test_init_refuses_name_known_to_backend() {
        let (_td, mut p) = fixture();
        p.known.push("dev".into());
        let e = init(&p, &opts("dev"), &invocation()).unwrap_err();
        assert_eq!(
            machine_error(&e),
            Some(&MachineError::AlreadyExists("dev".into()))
        );
        assert!(p.calls().is_empty());
        assert!(!p.dirs.config_dir.exists());
        assert!(!p.image_path("dev").exists());

        created(&p, "other");
    }

    #[test]
    fn test_init_failure_rolls_back() {
        let (_td, mut p) = fixture();
        p.fail_create = true;
        let e = init(&p, &opts("dev"), &invocation()).unwrap_err();
        assert_eq!(e.to_string(), "create failed");
        assert_eq!(p.calls(), ["get_disk", "create_vm", "unregister"]);
        assert!(!p.dirs.store().exists("dev"));
        assert!(!p.image_path("dev").exists());
        assert!(Connections::new(&p.dirs.connections_file)
            .list()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_init_deferred_creates_nothing() {
        let (_td, mut p) = fixture();
        p.defer = Some(DeferReason::RebootRequired);
        let r = init(&p, &opts("dev"), &invocation()).unwrap();
        assert!(matches!(
            r,
            InitOutcome::Deferred(DeferReason::RebootRequired)
        ));
        assert!(p.calls().is_empty());
        assert!(!p.dirs.config_dir.exists());
    }

    #[test]
    fn test_reexec_error_is_recorded() {
        let (_td, mut p) = fixture();
        p.fail_create = true;
        let o = InitOptions {
            reexec: true,
            ..opts("dev")
        };
        let e = init(&p, &o, &invocation()).unwrap_err();
        assert_eq!(e.to_string(), "create failed");
        let mut out = Vec::new();
        ElevatedOutputLog::new(&p.dirs.data_home).dump(&mut out);
        assert!(String::from_utf8(out).unwrap().contains("create failed"));
    }

    #[test]
    fn test_start_stop() {
        let (_td, p) = fixture();
        created(&p, "dev");
        p.calls();

        start(&p, "dev").unwrap();
        assert_eq!(p.calls(), ["start_networking", "start_vm", "mount"]);
        assert!(p.dirs.store().load("dev").unwrap().last_up.is_some());
        let e = start(&p, "dev").unwrap_err();
        assert_eq!(
            machine_error(&e),
            Some(&MachineError::AlreadyRunning("dev".into()))
        );
        let e = remove(&p, "dev", RemoveOptions::default(), |_| Ok(true)).unwrap_err();
        assert_eq!(
            machine_error(&e),
            Some(&MachineError::AlreadyRunning("dev".into()))
        );

        p.calls();
        stop(&p, "dev", false).unwrap();
        stop(&p, "dev", false).unwrap();
        assert_eq!(p.calls(), ["stop_vm", "stop_networking", "stop_networking"]);
    }

    #[test]
    fn test_failed_readiness_is_undone() {
        let (_td, p) = fixture();
        created(&p, "dev");
        p.calls();
        p.fail_ready.set(true);
        let e = start(&p, "dev").unwrap_err();
        assert!(format!("{e:#}").contains("guest never came up"));
        assert_eq!(
            p.calls(),
            ["start_networking", "start_vm", "cleanup", "stop_networking"]
        );
        assert!(!p.is_running());
        assert!(p.dirs.store().load("dev").unwrap().last_up.is_none());
    }

    #[test]
    fn test_remove() {
        let (_td, p) = fixture();
        let cfg = created(&p, "dev");
        p.calls();

        let mut prompt = String::new();
        let removed = remove(&p, "dev", RemoveOptions::default(), |m| {
            prompt = m.to_owned();
            Ok(false)
        })
        .unwrap();
        assert!(!removed);
        assert!(prompt.contains(cfg.image_path.as_str()));
        assert!(prompt.contains("backend-state"));
        assert!(p.dirs.store().exists("dev"));

        let o = RemoveOptions {
            force: true,
            save_image: true,
            ..Default::default()
        };
        assert!(remove(&p, "dev", o, |_| unreachable!()).unwrap());
        assert_eq!(p.calls(), ["destroy"]);
        assert!(!p.dirs.store().exists("dev"));
        assert!(cfg.image_path.exists());
        assert!(!cfg.ssh.identity_path.exists());
        assert!(Connections::new(&p.dirs.connections_file)
            .list()
            .unwrap()
            .is_empty());
        let e = remove(&p, "dev", o, |_| Ok(true)).unwrap_err();
        assert_eq!(machine_error(&e), Some(&MachineError::NoSuchVm("dev".into())));

        // A kept image does not hold on to the name.
        p.calls();
        created(&p, "dev");
        assert_eq!(p.calls(), ["get_disk", "create_vm"]);
    }

    #[test]
    fn test_set_and_list() {
        let (_td, p) = fixture();
        created(&p, "dev");
        created(&p, "alt");
        set(
            &p,
            "dev",
            &SetOptions {
                cpus: Some(6),
                rootful: Some(true),
                ..Default::default()
            },
        )
        .unwrap();
        let cfg = p.dirs.store().load("dev").unwrap();
        assert_eq!(cfg.resources.cpus, 6);
        assert!(cfg.host_user.rootful);
        assert_eq!(
            Connections::new(&p.dirs.connections_file)
                .default_connection()
                .unwrap()
                .as_deref(),
            Some("dev-root")
        );

        let entries = list(&p).unwrap();
        let summary: Vec<_> = entries
            .iter()
            .map(|e| (e.name.as_str(), e.default, e.cpus, e.running))
            .collect();
        assert_eq!(summary, [("alt", false, 2, false), ("dev", true, 6, false)]);
        let table = list_table(&entries).to_string();
        assert!(table.contains("dev*"));
        assert!(table.contains("Never"));

        let e = ssh(&p, "dev", None, &[]).unwrap_err();
        assert_eq!(machine_error(&e), Some(&MachineError::NotRunning("dev".into())));
        assert!(ssh_config(&p, "dev").unwrap().starts_with("Host dev\n"));
        let info = inspect(&p, "dev").unwrap();
        let v = serde_json::to_value(&info).unwrap();
        assert_eq!(v["Name"], "dev");
        assert_eq!(v["State"], "stopped");
    }
}
