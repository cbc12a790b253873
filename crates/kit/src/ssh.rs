//! SSH integration for machines

use std::fs;
use std::net::{Ipv4Addr, TcpListener};
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::{eyre::eyre, Result};
use rand::Rng;
use tracing::{debug, info};

use crate::config::SshConfig;
use crate::provision::Provisioner;

/// Represents an SSH keypair with file paths and public key content
#[derive(Debug, Clone)]
pub(crate) struct SshKeyPair {
    /// Path to the private key file
    pub(crate) private_key_path: Utf8PathBuf,
    /// Path to the public key file (private_key_path + ".pub")
    pub(crate) public_key_path: Utf8PathBuf,
}

impl SshKeyPair {
    /// Read the public key, trimmed of its trailing newline.
    pub(crate) fn public_key(&self) -> Result<String> {
        let k = fs::read_to_string(&self.public_key_path)
            .map_err(|e| eyre!("Reading {}: {e}", self.public_key_path))?;
        Ok(k.trim().to_owned())
    }

    /// Remove both halves, ignoring files that are already gone.
    pub(crate) fn remove(&self) -> Result<()> {
        for p in [&self.private_key_path, &self.public_key_path] {
            match fs::remove_file(p) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(eyre!("Removing {p}: {e}")),
            }
        }
        Ok(())
    }
}

/// The key pair stored at `identity_path`.
pub(crate) fn keypair_at(identity_path: &Utf8Path) -> SshKeyPair {
    SshKeyPair {
        private_key_path: identity_path.to_owned(),
        public_key_path: Utf8PathBuf::from(format!("{identity_path}.pub")),
    }
}

/// Generate a new ed25519 SSH keypair in the specified directory
///
/// Uses the system's `ssh-keygen`; the private key has no passphrase so that
/// the machine can be reached non-interactively.
pub(crate) fn generate_ssh_keypair(output_dir: &Utf8Path, key_name: &str) -> Result<SshKeyPair> {
    fs::create_dir_all(output_dir)?;

    let pair = keypair_at(&output_dir.join(key_name));
    debug!("Generating SSH keypair at {}", pair.private_key_path);

    let output = Command::new("ssh-keygen")
        .args(["-t", "ed25519", "-q", "-N", ""])
        .arg("-f")
        .arg(pair.private_key_path.as_str())
        .args(["-C", &format!("machinekit-{key_name}")])
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(eyre!("ssh-keygen failed: {}", stderr));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut permissions = fs::metadata(&pair.private_key_path)?.permissions();
        permissions.set_mode(0o600);
        fs::set_permissions(&pair.private_key_path, permissions)?;
    }

    Ok(pair)
}

/// Make sure a key pair exists at `identity_path` as a provisioning step.
///
/// An existing pair is reused and left in place on rollback; a generated one
/// is removed.
pub(crate) fn provision_keypair(p: &mut Provisioner, identity_path: &Utf8Path) -> Result<SshKeyPair> {
    if identity_path.exists() {
        info!("Reusing SSH key {identity_path}");
        return Ok(keypair_at(identity_path));
    }
    let (dir, name) = identity_path
        .parent()
        .zip(identity_path.file_name())
        .ok_or_else(|| eyre!("Invalid identity path {identity_path}"))?;
    let undo = keypair_at(identity_path);
    p.step(
        "generate SSH keys",
        || generate_ssh_keypair(dir, name),
        move || undo.remove(),
    )
}

/// Pick a random local port nobody is listening on.
pub(crate) fn find_available_port() -> Result<u16> {
    let mut rng = rand::rng();
    for _ in 0..100 {
        let port = rng.random_range(30000..60000);
        if TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok() {
            return Ok(port);
        }
    }
    // Fall back to letting the kernel choose.
    let l = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(l.local_addr()?.port())
}

/// Options every connection to a machine uses.
const SSH_OPTIONS: &[&str] = &[
    "IdentitiesOnly=yes",
    "PasswordAuthentication=no",
    "KbdInteractiveAuthentication=no",
    "GSSAPIAuthentication=no",
    "StrictHostKeyChecking=no",
    "UserKnownHostsFile=/dev/null",
    "LogLevel=ERROR",
];

/// Build an `ssh` invocation reaching `user` on the machine.
pub(crate) fn ssh_command(ssh: &SshConfig, user: &str, args: &[String]) -> Command {
    let mut cmd = Command::new("ssh");
    cmd.args(["-i", ssh.identity_path.as_str()]);
    for o in SSH_OPTIONS {
        cmd.args(["-o", o]);
    }
    cmd.args(["-p", &ssh.port.to_string()]);
    cmd.arg(format!("{user}@localhost"));
    if !args.is_empty() {
        cmd.arg("--");
        cmd.args(args);
    }
    cmd
}

/// Run `args` as `user` in the machine, failing on a non-zero exit.
pub(crate) fn run_in_guest(ssh: &SshConfig, user: &str, args: &[String]) -> Result<()> {
    let mut cmd = ssh_command(ssh, user, args);
    debug!("Executing: {cmd:?}");
    let status = cmd
        .status()
        .map_err(|e| eyre!("Failed to execute SSH command: {}", e))?;
    if !status.success() {
        return Err(eyre!(
            "SSH connection failed with exit code: {:?}",
            status.code()
        ));
    }
    Ok(())
}

/// An `ssh_config(5)` stanza for reaching the machine.
pub(crate) fn ssh_config_stanza(name: &str, ssh: &SshConfig) -> String {
    let mut s = format!(
        "Host {name}\n  HostName localhost\n  Port {}\n  User {}\n  IdentityFile {}\n",
        ssh.port, ssh.remote_username, ssh.identity_path
    );
    for o in SSH_OPTIONS {
        if let Some((k, v)) = o.split_once('=') {
            s.push_str(&format!("  {k} {v}\n"));
        }
    }
    s
}
