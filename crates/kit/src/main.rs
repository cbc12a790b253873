use clap::{Parser, Subcommand};
use color_eyre::{eyre::Context, Report, Result};

#[cfg(unix)]
mod arch;
mod cleanup;
mod config;
mod connections;
mod download;
mod elevate;
mod errors;
mod lock;
mod machine;
mod ports;
mod provider;
mod provision;
#[cfg(unix)]
mod qemu;
mod relay;
mod ssh;
#[cfg(unix)]
mod sshcred;
mod utils;
mod volumes;
mod wsl;

use elevate::{DeferReason, Invocation};
use machine::{InitOptions, InitOutcome, RemoveOptions};
use provider::{Provider, SetOptions, VmType};

/// Name used when a command is given none.
const DEFAULT_MACHINE: &str = "podman-machine-default";

/// Manage the Linux virtual machines that run containers for this host.
///
/// Machines are backed by WSL 2 on Windows and by QEMU elsewhere; set
/// MACHINEKIT_PROVIDER to pick another backend.
#[derive(Parser)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Options for creating a machine
#[derive(Debug, Parser)]
struct InitOpts {
    /// Machine name
    #[clap(default_value = DEFAULT_MACHINE)]
    name: String,

    /// Number of virtual CPUs
    #[clap(long, default_value_t = 2)]
    cpus: u64,

    /// Memory size (e.g. 2G, 4096M, plain numbers are MiB)
    #[clap(long, default_value = "2048")]
    memory: String,

    /// Disk size (e.g. 100G, plain numbers are GiB)
    #[clap(long, default_value = "100")]
    disk_size: String,

    /// Image: a release number, a stream name, or a local file
    #[clap(long, default_value = "")]
    image: String,

    /// Unprivileged user created in the guest
    #[clap(long, default_value = "user")]
    username: String,

    /// Make the rootful connection the default
    #[clap(long)]
    rootful: bool,

    /// Relay guest traffic through a host user-space process
    #[clap(long)]
    user_mode_networking: bool,

    /// Share a host directory, SOURCE:TARGET[:ro]
    #[clap(long = "volume", short = 'v')]
    volumes: Vec<String>,

    /// Start the machine once it is created
    #[clap(long)]
    now: bool,

    /// Set when relaunched for elevation or after a reboot
    #[clap(long, hide = true)]
    reexec: bool,
}

#[derive(Debug, Parser)]
struct NameOpt {
    /// Machine name
    #[clap(default_value = DEFAULT_MACHINE)]
    name: String,
}

#[derive(Debug, Parser)]
struct StopOpts {
    /// Machine name
    #[clap(default_value = DEFAULT_MACHINE)]
    name: String,

    /// Skip the graceful guest shutdown
    #[clap(long)]
    hard: bool,
}

#[derive(Debug, Parser)]
struct RmOpts {
    /// Machine name
    #[clap(default_value = DEFAULT_MACHINE)]
    name: String,

    /// Remove without confirmation
    #[clap(long, short = 'f')]
    force: bool,

    /// Keep the SSH identity
    #[clap(long)]
    save_keys: bool,

    /// Keep the disk image
    #[clap(long)]
    save_image: bool,
}

#[derive(Debug, Parser)]
struct SetOpts {
    /// Machine name
    #[clap(default_value = DEFAULT_MACHINE)]
    name: String,

    #[clap(long)]
    cpus: Option<u64>,

    /// Memory size (e.g. 2G, 4096M)
    #[clap(long)]
    memory: Option<String>,

    /// Disk size (e.g. 200G); disks only grow
    #[clap(long)]
    disk_size: Option<String>,

    /// Whether the rootful connection is the default
    #[clap(long)]
    rootful: Option<bool>,

    #[clap(long)]
    user_mode_networking: Option<bool>,
}

#[derive(Debug, Parser)]
struct ListOpts {
    /// Output as JSON
    #[clap(long)]
    json: bool,
}

#[derive(Debug, Parser)]
struct InspectOpts {
    /// Machines to inspect
    #[clap(default_values_t = [DEFAULT_MACHINE.to_owned()])]
    names: Vec<String>,
}

#[derive(Debug, Parser)]
struct SshOpts {
    /// Machine name
    name: String,

    /// Guest user; defaults to root for rootful machines
    #[clap(long)]
    username: Option<String>,

    /// Command to run instead of a login shell
    #[clap(allow_hyphen_values = true, trailing_var_arg = true)]
    args: Vec<String>,
}

/// Internal diagnostic and tooling commands for development
#[derive(Parser)]
struct InternalsOpts {
    #[command(subcommand)]
    command: InternalsCmds,
}

#[derive(Subcommand)]
enum InternalsCmds {
    /// Normalize port mappings read as JSON from stdin for a backend
    Ports {
        #[clap(long, value_enum)]
        vm_type: Option<VmType>,
        /// Publication rule to apply instead of the backend's own
        #[clap(long, value_enum)]
        mode: Option<ports::PortPublishing>,
    },
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new machine
    Init(InitOpts),

    /// Start a machine
    Start(NameOpt),

    /// Stop a machine
    Stop(StopOpts),

    /// Remove a machine and its files
    Rm(RmOpts),

    /// Change machine settings
    Set(SetOpts),

    /// List machines
    #[clap(alias = "ls")]
    List(ListOpts),

    /// Show machine details as JSON
    Inspect(InspectOpts),

    /// Connect to a machine over SSH
    Ssh(SshOpts),

    /// Print an ssh_config stanza for a machine
    SshConfig(NameOpt),

    /// Internal diagnostic and tooling commands for development
    #[clap(hide = true)]
    Internals(InternalsOpts),
}

/// Install and configure the tracing/logging system.
///
/// Logs are filtered by the RUST_LOG environment variable, defaulting to
/// 'info', and written to stderr with span traces for error reports.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn default_provider() -> Result<Box<dyn Provider>> {
    provider::get_provider(VmType::from_env()?)
}

fn run_init(opts: InitOpts) -> Result<()> {
    let provider = default_provider()?;
    let resources = config::ResourceConfig {
        cpus: opts.cpus,
        memory: utils::parse_memory_to_mb(&opts.memory)?,
        disk_size: utils::parse_disk_to_gb(&opts.disk_size)?,
    };
    let init_opts = InitOptions {
        name: opts.name,
        resources,
        image: opts.image,
        username: opts.username,
        rootful: opts.rootful,
        user_mode_networking: opts.user_mode_networking,
        volumes: opts.volumes,
        reexec: opts.reexec,
    };
    let invocation = Invocation::current()?;
    match machine::init(provider.as_ref(), &init_opts, &invocation)? {
        InitOutcome::Created(cfg) => {
            println!("Machine init complete");
            if opts.now {
                machine::start(provider.as_ref(), cfg.name())?;
            } else {
                println!("To start your machine run:\n\n\tmachinekit start {}", cfg.name());
            }
        }
        InitOutcome::Deferred(DeferReason::ElevatedChildDone) => {}
        InitOutcome::Deferred(reason) => println!("{reason}"),
    }
    Ok(())
}

fn run_set(opts: SetOpts) -> Result<()> {
    let set = SetOptions {
        cpus: opts.cpus,
        memory: opts
            .memory
            .as_deref()
            .map(utils::parse_memory_to_mb)
            .transpose()?,
        disk_size: opts
            .disk_size
            .as_deref()
            .map(utils::parse_disk_to_gb)
            .transpose()?,
        user_mode_networking: opts.user_mode_networking,
        rootful: opts.rootful,
    };
    machine::set(default_provider()?.as_ref(), &opts.name, &set)
}

fn run_ports(vm_type: Option<VmType>, mode: Option<ports::PortPublishing>) -> Result<()> {
    let mode = match (mode, vm_type) {
        (Some(m), _) => m,
        (None, Some(v)) => provider::get_provider(v)?.port_publishing(),
        (None, None) => provider::get_provider(VmType::from_env()?)?.port_publishing(),
    };
    let input: Vec<ports::SinglePortMapping> =
        serde_json::from_reader(std::io::stdin().lock()).context("Parsing port mappings")?;
    let merged = ports::coalesce(input).unwrap_or_default();
    let out = ports::publish_for(mode, &merged);
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

/// Main entry point for the machinekit CLI application.
fn main() -> Result<(), Report> {
    install_tracing();
    color_eyre::install()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Init(opts) => run_init(opts)?,
        Commands::Start(opts) => machine::start(default_provider()?.as_ref(), &opts.name)?,
        Commands::Stop(opts) => {
            machine::stop(default_provider()?.as_ref(), &opts.name, opts.hard)?
        }
        Commands::Rm(opts) => {
            let rm = RemoveOptions {
                force: opts.force,
                save_keys: opts.save_keys,
                save_image: opts.save_image,
            };
            machine::remove(default_provider()?.as_ref(), &opts.name, rm, |msg| {
                utils::confirm(msg)
            })?;
        }
        Commands::Set(opts) => run_set(opts)?,
        Commands::List(opts) => {
            let entries = machine::list(default_provider()?.as_ref())?;
            if opts.json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                println!("{}", machine::list_table(&entries));
            }
        }
        Commands::Inspect(opts) => {
            let provider = default_provider()?;
            let infos = opts
                .names
                .iter()
                .map(|n| machine::inspect(provider.as_ref(), n))
                .collect::<Result<Vec<_>>>()?;
            println!("{}", serde_json::to_string_pretty(&infos)?);
        }
        Commands::Ssh(opts) => {
            let code = machine::ssh(
                default_provider()?.as_ref(),
                &opts.name,
                opts.username.as_deref(),
                &opts.args,
            )?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::SshConfig(opts) => {
            print!("{}", machine::ssh_config(default_provider()?.as_ref(), &opts.name)?);
        }
        Commands::Internals(opts) => match opts.command {
            InternalsCmds::Ports { vm_type, mode } => run_ports(vm_type, mode)?,
        },
    }
    Ok(())
}
