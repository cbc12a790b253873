//! Guest configuration for WSL distributions.
//!
//! WSL does not boot the distribution's init system, so the guest gets a
//! small set of scripts that start systemd in a private PID namespace and
//! route login shells into it.

use const_format::concatcp;
use indoc::{formatdoc, indoc};
use tracing::info;

use super::dist::Distribution;
use color_eyre::Result;

const CONTAINERS_CONF: &str = indoc! {r#"
    [containers]
    netns="slirp4netns"

    [engine]
    cgroup_manager = "cgroupfs"
    events_logger = "file"
"#};

const SUDOERS: &str = "%wheel        ALL=(ALL)       NOPASSWD: ALL\n";

const BOOTSTRAP: &str = indoc! {"
    #!/bin/bash
    ps -ef | grep -v grep | grep -q systemd && exit 0
    nohup unshare --kill-child --fork --pid --mount --mount-proc --propagation shared /lib/systemd/systemd >/dev/null 2>&1 &
    sleep 0.1
"};

const WSL_MOTD: &str = indoc! {"

    You will be automatically entered into a nested process namespace where
    systemd is running. If you need to access the root namespace, hit ctrl-d
    or type exit. This also means to log out you need to exit twice.

"};

/// Sets `SYSDPID` to the PID of the nested systemd, if any.
pub(crate) const SYSDPID: &str =
    "SYSDPID=`ps -eo cmd,pid | grep -m 1 ^/lib/systemd/systemd | awk '{print $2}'`";

const PROFILE: &str = concatcp!(
    SYSDPID,
    indoc! {r#"

        if [ ! -z "$SYSDPID" ] && [ "$SYSDPID" != "1" ]; then
            cat /etc/wslmotd
            /usr/local/bin/podman-enterns
        fi
    "#}
);

pub(crate) const ENTERNS_PATH: &str = "/usr/local/bin/podman-enterns";

const ENTERNS: &str = concatcp!(
    "#!/bin/bash\n",
    SYSDPID,
    indoc! {r#"

        if [ ! -z "$SYSDPID" ] && [ "$SYSDPID" != "1" ]; then
            nsenter -m -p -t $SYSDPID "$@"
        fi
    "#}
);

/// Blocks until the nested systemd exits, for at most 60 seconds.
pub(crate) const WAIT_TERM: &str = concatcp!(
    SYSDPID,
    indoc! {r#"

        if [ ! -z "$SYSDPID" ]; then
            timeout 60 tail -f /dev/null --pid $SYSDPID
        fi
    "#}
);

// The WSL kernel lacks the sg and crypto_user modules.
const OVERRIDE_SYSUSERS: &str = indoc! {"
    [Service]
    LoadCredential=
"};

const LINGER_SERVICE: &str = indoc! {"
    [Unit]
    Description=A systemd user unit demo
    After=network-online.target
    Wants=network-online.target podman.socket
    [Service]
    ExecStart=/usr/bin/sleep infinity
"};

const PACKAGES: &[&str] = &["podman", "podman-docker", "openssh-server", "procps-ng"];

pub(crate) const BOOTSTRAP_PATH: &str = "/root/bootstrap";

/// Proxy variables carried from the host into the guest.
const PROXY_VARS: &[&str] = &["HTTP_PROXY", "HTTPS_PROXY", "NO_PROXY"];

const PROXY_PROFILE: &str = "/etc/profile.d/default-proxy.sh";
const PROXY_ENVIRONMENT: &str = "/etc/environment.d/default-proxy.conf";

fn append_port(port: u16) -> String {
    format!(r"grep -q Port\ {port} /etc/ssh/sshd_config || echo Port {port} >> /etc/ssh/sshd_config")
}

fn configure_services(user: &str) -> String {
    formatdoc! {"
        ln -fs /usr/lib/systemd/system/sshd.service /etc/systemd/system/multi-user.target.wants/sshd.service
        ln -fs /usr/lib/systemd/system/podman.socket /etc/systemd/system/sockets.target.wants/podman.socket
        rm -f /etc/systemd/system/getty.target.wants/console-getty.service
        rm -f /etc/systemd/system/getty.target.wants/getty@tty1.service
        rm -f /etc/systemd/system/multi-user.target.wants/systemd-resolved.service
        rm -f /etc/systemd/system/dbus-org.freedesktop.resolve1.service
        ln -fs /dev/null /etc/systemd/system/console-getty.service
        mkdir -p /etc/systemd/system/systemd-sysusers.service.d/
        adduser -m {user} -G wheel
        mkdir -p /home/{user}/.config/systemd/user/
        chown {user}:{user} /home/{user}/.config
    "}
}

fn linger_setup(user: &str) -> String {
    formatdoc! {r"
        mkdir -p /home/{user}/.config/systemd/user/default.target.wants
        ln -fs /home/{user}/.config/systemd/user/linger-example.service \
               /home/{user}/.config/systemd/user/default.target.wants/linger-example.service
    "}
}

/// Upgrade the guest and install the container runtime.
pub(crate) fn install_packages(dist: &Distribution) -> Result<()> {
    info!("Installing packages (this will take awhile)...");
    dist.run("Package upgrade on guest OS", &["dnf", "upgrade", "-y"])?;
    let mut install = vec!["dnf", "install"];
    install.extend_from_slice(PACKAGES);
    install.push("-y");
    dist.run("Package installation on guest OS", &install)?;
    // Fixes newuidmap
    dist.run(
        "Package reinstallation of shadow-utils on guest OS",
        &["dnf", "reinstall", "shadow-utils", "-y"],
    )
}

/// Services, accounts and the runtime configuration.
pub(crate) fn configure_system(dist: &Distribution, user: &str, ssh_port: u16) -> Result<()> {
    info!("Configuring system...");
    dist.run(
        "Could not configure SSH port for guest OS",
        &["sh", "-c", &append_port(ssh_port)],
    )?;
    dist.pipe(
        "Could not configure systemd settings for guest OS",
        &configure_services(user),
        &["sh"],
    )?;
    dist.pipe(
        "Could not add wheel to sudoers",
        SUDOERS,
        &["sh", "-c", "cat >> /etc/sudoers"],
    )?;
    dist.write_file(
        "Could not generate systemd-sysusers override for guest OS",
        OVERRIDE_SYSUSERS,
        "/etc/systemd/system/systemd-sysusers.service.d/override.conf",
        None,
    )?;
    dist.write_file(
        "Could not generate linger service for guest OS",
        LINGER_SERVICE,
        &format!("/home/{user}/.config/systemd/user/linger-example.service"),
        None,
    )?;
    dist.pipe(
        "Could not configure linger for guest OS",
        &linger_setup(user),
        &["sh"],
    )?;
    dist.write_file(
        "Could not create containers.conf for guest OS",
        CONTAINERS_CONF,
        "/etc/containers.conf",
        None,
    )
}

/// The namespace entry helpers and the systemd bootstrap.
pub(crate) fn install_scripts(dist: &Distribution) -> Result<()> {
    dist.write_file(
        "Could not create enterns script for guest OS",
        ENTERNS,
        ENTERNS_PATH,
        Some(&format!("chmod 755 {ENTERNS_PATH}")),
    )?;
    dist.write_file(
        "Could not create motd profile script for guest OS",
        PROFILE,
        "/etc/profile.d/enterns.sh",
        None,
    )?;
    dist.write_file(
        "Could not create a WSL MOTD for guest OS",
        WSL_MOTD,
        "/etc/wslmotd",
        None,
    )?;
    dist.write_file(
        "Could not create bootstrap script for guest OS",
        BOOTSTRAP,
        BOOTSTRAP_PATH,
        Some(&format!("chmod 755 {BOOTSTRAP_PATH}")),
    )
}

fn authorized_keys_script(home: &str, owner: Option<&str>) -> String {
    let mut s = format!("mkdir -p {home}/.ssh; cat >> {home}/.ssh/authorized_keys; ");
    if let Some(o) = owner {
        s.push_str(&format!("chown -R {o}:{o} {home}/.ssh; "));
    }
    s.push_str(&format!("chmod 600 {home}/.ssh/authorized_keys"));
    s
}

/// Authorize `pubkey` for root and `user`.
pub(crate) fn install_authorized_key(dist: &Distribution, user: &str, pubkey: &str) -> Result<()> {
    let key = format!("{}\n", pubkey.trim_end());
    dist.pipe(
        "Could not create root authorized keys on guest OS",
        &key,
        &["sh", "-c", &authorized_keys_script("/root", None)],
    )?;
    dist.pipe(
        &format!("Could not create '{user}' authorized keys on guest OS"),
        &key,
        &["sh", "-c", &authorized_keys_script(&format!("/home/{user}"), Some(user))],
    )
}

/// Proxy settings of the host, upper-case names, in a fixed order.
pub(crate) fn host_proxy_vars() -> Vec<(String, String)> {
    PROXY_VARS
        .iter()
        .filter_map(|k| {
            std::env::var(k)
                .or_else(|_| std::env::var(k.to_ascii_lowercase()))
                .ok()
                .filter(|v| !v.is_empty())
                .map(|v| ((*k).to_owned(), v))
        })
        .collect()
}

/// Contents of the profile script and the environment.d snippet.
fn proxy_files(vars: &[(String, String)]) -> (String, String) {
    let mut profile = String::new();
    let mut envd = String::new();
    for (k, v) in vars {
        let quoted = v.replace('"', "\\\"");
        profile.push_str(&format!("export {k}=\"{quoted}\"\n"));
        profile.push_str(&format!("export {}=\"{quoted}\"\n", k.to_ascii_lowercase()));
        envd.push_str(&format!("{k}={v}\n{}={v}\n", k.to_ascii_lowercase()));
    }
    (profile, envd)
}

/// Mirror the host proxy settings into the guest, removing stale ones.
pub(crate) fn configure_proxy(dist: &Distribution, vars: &[(String, String)]) -> Result<()> {
    if vars.is_empty() {
        return dist.run(
            "Could not clear proxy settings",
            &["rm", "-f", PROXY_PROFILE, PROXY_ENVIRONMENT],
        );
    }
    let (profile, envd) = proxy_files(vars);
    dist.write_file(
        "Could not write proxy profile",
        &profile,
        PROXY_PROFILE,
        None,
    )?;
    dist.run(
        "Could not create environment.d",
        &["mkdir", "-p", "/etc/environment.d"],
    )?;
    dist.write_file(
        "Could not write proxy environment",
        &envd,
        PROXY_ENVIRONMENT,
        None,
    )
}
