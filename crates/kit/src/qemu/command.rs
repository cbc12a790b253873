//! Emulator command line for a machine.

use std::process::Command;

use indoc::formatdoc;

use crate::arch::ArchConfig;
use crate::config::{MachineConfig, Mount, QemuConfig};
use crate::sshcred::{smbios_cred_for_ssh, smbios_cred_for_user, GUEST_UID};

/// 9p tag of the `index`th volume.
pub(crate) fn mount_tag(index: usize) -> String {
    format!("vol{index}")
}

/// Guest command mounting the `index`th volume.
pub(crate) fn guest_mount_script(index: usize, mount: &Mount) -> String {
    let ro = if mount.read_only { ",ro" } else { "" };
    format!(
        "mkdir -p {target} && mount -t 9p -o trans=virtio,version=9p2000.L,msize=131072{ro} {tag} {target}",
        target = mount.target,
        tag = mount_tag(index),
    )
}

/// Root script run once over SSH on the first boot of a new machine.
///
/// Installs the container runtime and enables the API socket for root and,
/// with lingering, for the remote user.
pub(crate) fn guest_setup_script(user: &str) -> String {
    let mut s = formatdoc! {"
        set -eu
        dnf install -y podman
        echo '%wheel ALL=(ALL) NOPASSWD: ALL' > /etc/sudoers.d/wheel-nopasswd
        chmod 0440 /etc/sudoers.d/wheel-nopasswd
        systemctl enable podman.socket
    "};
    if user != "root" {
        s.push_str(&formatdoc! {"
            id {user} >/dev/null 2>&1 || useradd -m -u {GUEST_UID} -G wheel {user}
            systemctl --global enable podman.socket
            loginctl enable-linger {user}
        "});
    }
    s
}

/// Build the daemonizing emulator invocation.
///
/// The guest learns the remote user and the SSH key from `pubkey` through
/// SMBIOS credentials; the host reaches its sshd through a loopback forward
/// of the configured port.
pub(crate) fn qemu_command(
    arch: &ArchConfig,
    cfg: &MachineConfig,
    qemu: &QemuConfig,
    pubkey: &str,
) -> Command {
    let mut cmd = Command::new(arch.emulator);
    cmd.args(["-machine", arch.machine]);
    for accel in arch.accelerators() {
        cmd.args(["-accel", *accel]);
    }
    cmd.args([
        "-cpu",
        "max",
        "-m",
        &format!("{}M", cfg.resources.memory),
        "-smp",
        &cfg.resources.cpus.to_string(),
    ]);
    if let Some(fw) = arch.firmware {
        cmd.args(["-bios", fw]);
    }
    cmd.args([
        "-drive",
        &format!("if=virtio,format=qcow2,file={}", cfg.image_path),
        "-netdev",
        &format!(
            "user,id=net0,hostfwd=tcp:127.0.0.1:{}-:22",
            cfg.ssh.port
        ),
        "-device",
        "virtio-net-pci,netdev=net0",
        "-smbios",
        &format!(
            "type=11,value={}",
            smbios_cred_for_ssh(pubkey, &cfg.ssh.remote_username)
        ),
    ]);
    if let Some(cred) = smbios_cred_for_user(&cfg.ssh.remote_username) {
        cmd.args(["-smbios", &format!("type=11,value={cred}")]);
    }
    for (i, m) in cfg.mounts.iter().enumerate() {
        let mut v = format!(
            "local,path={},mount_tag={},security_model=mapped-xattr",
            m.source,
            mount_tag(i)
        );
        if m.read_only {
            v.push_str(",readonly=on");
        }
        cmd.args(["-virtfs", &v]);
    }
    cmd.args([
        "-qmp",
        &format!("unix:{},server=on,wait=off", qemu.qmp_socket),
        "-pidfile",
        qemu.pid_file.as_str(),
        "-display",
        "none",
        "-daemonize",
    ]);
    cmd
}
