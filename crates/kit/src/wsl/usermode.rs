//! User-mode networking for WSL machines.
//!
//! A dedicated distribution hosts the relay, which replaces the shared WSL
//! network namespace's default route and resolver while it runs.

use camino::Utf8Path;
use color_eyre::Result;
use indoc::indoc;
use tracing::info;

use super::dist::Distribution;
use crate::relay::RelayControl;

pub(crate) const USERMODE_DIST: &str = "podman-net-usermode";

/// Present in a machine's guest when it routes through the relay.
const MARKER: &str = "/etc/containers/podman-machine-usermode";

const RELAY_PACKAGES: &[&str] = &["gvisor-tap-vsock-gvforwarder", "iproute"];

const START: &str = indoc! {r#"
    set -e
    STATE=/mnt/wsl/podman-usermodenet
    mkdir -p $STATE
    cp -f /mnt/wsl/resolv.conf $STATE/resolv.orig
    ip route show default > $STATE/route.dat
    ROUTE=$(<$STATE/route.dat)
    if [[ $ROUTE =~ default\ via ]]; then
        echo $ROUTE | cut -d ' ' -f3 > $STATE/gateway.dat
    fi
    nohup /usr/libexec/podman/gvforwarder -iface podman-usermode -stop-if-exist ignore \
        -pid-file /run/podman-usermode.pid > /var/log/vm.log 2> /var/log/vm.err < /dev/null &
"#};

const STOP: &str = indoc! {r#"
    if [ -f /run/podman-usermode.pid ]; then
        kill $(cat /run/podman-usermode.pid) || true
        rm -f /run/podman-usermode.pid
    fi
"#};

const RESTORE: &str = indoc! {r#"
    STATE=/mnt/wsl/podman-usermodenet
    if [[ ! -f "$STATE/gateway.dat" || ! -f "$STATE/route.dat" ]]; then
        echo "Could not restore gateway, no gateway backup present"
        exit 0
    fi
    ip route del default || true
    ip route add default via $(<$STATE/gateway.dat) || true
    cp -f $STATE/resolv.orig /mnt/wsl/resolv.conf
    rm -f $STATE/gateway.dat $STATE/route.dat
"#};

/// [`RelayControl`] running the forwarder in [`USERMODE_DIST`].
#[derive(Debug)]
pub(crate) struct UserModeRelay {
    dist: Distribution,
}

impl UserModeRelay {
    pub(crate) fn new() -> Self {
        Self {
            dist: Distribution::new(USERMODE_DIST),
        }
    }
}

impl RelayControl for UserModeRelay {
    fn start(&self) -> Result<()> {
        self.dist
            .pipe("Could not start user-mode networking", START, &["bash"])
    }

    fn stop(&self) -> Result<()> {
        self.dist
            .pipe("Could not stop user-mode networking", STOP, &["bash"])
    }

    fn restore_native(&self) -> Result<()> {
        self.dist
            .pipe("Could not restore native networking", RESTORE, &["bash"])
    }
}

/// Import the relay distribution from `image` unless it already exists.
pub(crate) fn install_usermode_dist(wsldist_dir: &Utf8Path, image: &Utf8Path) -> Result<()> {
    let dist = Distribution::new(USERMODE_DIST);
    if dist.is_registered()? {
        return Ok(());
    }
    info!("Installing user-mode networking distribution...");
    dist.import(&wsldist_dir.join(USERMODE_DIST), image)?;
    let mut install = vec!["dnf", "install", "-y"];
    install.extend_from_slice(RELAY_PACKAGES);
    if let Err(e) = dist.run("Could not install the user-mode networking relay", &install) {
        let _ = dist.unregister();
        return Err(e);
    }
    Ok(())
}

/// Record in the guest whether it uses the relay.
pub(crate) fn set_marker(dist: &Distribution, enabled: bool) -> Result<()> {
    let script = if enabled {
        format!("mkdir -p /etc/containers; touch {MARKER}")
    } else {
        format!("rm -f {MARKER}")
    };
    dist.run(
        "Could not change user-mode networking setting",
        &["sh", "-c", &script],
    )
}
