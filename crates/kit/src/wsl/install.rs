//! Detecting and installing WSL itself.

use std::process::{Command, Stdio};
use std::time::Duration;

use bootc_utils::CommandRunExt;
use camino::Utf8Path;
use color_eyre::{
    eyre::{eyre, Context},
    Result,
};
use indoc::indoc;
use regex::Regex;
use tracing::{debug, info, warn};

use super::dist::{decode_wsl_output, WSL};
use crate::elevate::{
    install_failure_hint, is_msi_success, launch_elevated, reboot_and_resume, run_tee,
    DeferReason, ElevatedOutputLog, ElevatedResult, HostPrivileges, Invocation, Readiness,
};
use crate::errors::MachineError;

/// Oldest build that can run WSL 2 at all.
const MIN_SUPPORTED_BUILD: (u32, u32, u32) = (10, 0, 18362);
/// Oldest build where the features can be enabled unattended.
const MIN_AUTOMATIC_BUILD: (u32, u32, u32) = (10, 0, 19041);

const FEATURES: &[(&str, &str)] = &[
    ("Microsoft-Windows-Subsystem-Linux", "Could not enable WSL Feature"),
    ("VirtualMachinePlatform", "Could not enable Virtual Machine Feature"),
];

const INSTALL_FEATURES: &str = "install the Windows WSL Features";
const INSTALL_KERNEL: &str = "install the WSL Kernel";

const KERNEL_ATTEMPTS: u32 = 5;
const KERNEL_BACKOFF: Duration = Duration::from_millis(500);

const MANUAL_INSTALL: &str = indoc! {"
    Automatic installation of WSL can not be performed on this version of Windows.
    Either update to Build 19041 (or later), or perform the manual installation steps
    outlined in the following article:

    http://docs.microsoft.com/en-us/windows/wsl/install

"};

/// What we need to know about, and do to, the host's WSL installation.
pub(crate) trait WslHost {
    /// WSL and its kernel are usable.
    fn is_installed(&self) -> bool;
    /// The optional Windows features are enabled.
    fn feature_enabled(&self) -> bool;
    /// `(major, minor, build)` of the running Windows.
    fn windows_version(&self) -> Result<(u32, u32, u32)>;
    fn enable_features(&self, log: &ElevatedOutputLog) -> Result<()>;
    fn install_kernel(&self, log: &ElevatedOutputLog) -> Result<()>;
}

/// [`WslHost`] backed by `wsl.exe`, `dism` and `ver`.
#[derive(Debug)]
pub(crate) struct WslCli;

fn reports_missing_kernel(status_output: &str) -> bool {
    status_output
        .lines()
        .any(|l| l.contains("kernel file is not found"))
}

fn parse_windows_version(ver: &str) -> Option<(u32, u32, u32)> {
    let re = Regex::new(r"(\d+)\.(\d+)\.(\d+)").ok()?;
    let c = re.captures(ver)?;
    Some((c[1].parse().ok()?, c[2].parse().ok()?, c[3].parse().ok()?))
}

/// Call `f` up to `attempts` times, doubling the pause after each failure.
fn retry_with_backoff<T>(
    attempts: u32,
    initial: Duration,
    mut f: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut backoff = initial;
    let mut attempt = 1;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                warn!("An error occurred attempting the WSL Kernel update, retrying: {e}");
                std::thread::sleep(backoff);
                backoff *= 2;
                attempt += 1;
            }
        }
    }
}

impl WslHost for WslCli {
    fn is_installed(&self) -> bool {
        let out = Command::new(WSL)
            .arg("--status")
            .stdin(Stdio::null())
            .output();
        match out {
            Ok(o) if o.status.success() => !reports_missing_kernel(&decode_wsl_output(&o.stdout)),
            Ok(o) => {
                debug!("wsl --status: {}", o.status);
                false
            }
            Err(e) => {
                debug!("wsl --status: {e}");
                false
            }
        }
    }

    fn feature_enabled(&self) -> bool {
        Command::new(WSL)
            .args(["--set-default-version", "2"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|s| s.success())
    }

    fn windows_version(&self) -> Result<(u32, u32, u32)> {
        let ver = Command::new("cmd")
            .args(["/c", "ver"])
            .run_get_string()
            .map_err(|e| eyre!("Querying the Windows version: {e}"))?;
        parse_windows_version(&ver).ok_or_else(|| eyre!("Unrecognized Windows version {ver:?}"))
    }

    fn enable_features(&self, log: &ElevatedOutputLog) -> Result<()> {
        let f = log.open_append()?;
        for (feature, failure) in FEATURES {
            let st = run_tee(
                Command::new("dism").args([
                    "/online",
                    "/enable-feature",
                    &format!("/featurename:{feature}"),
                    "/all",
                    "/norestart",
                ]),
                &f,
            )?;
            if !is_msi_success(st.code()) {
                return Err(eyre!("{failure}: {st}"));
            }
        }
        Ok(())
    }

    fn install_kernel(&self, log: &ElevatedOutputLog) -> Result<()> {
        let f = log.open_append()?;
        info!("Installing WSL Kernel Update");
        retry_with_backoff(KERNEL_ATTEMPTS, KERNEL_BACKOFF, || {
            let st = run_tee(Command::new(WSL).arg("--update"), &f)?;
            if !st.success() {
                return Err(eyre!("wsl --update: {st}"));
            }
            Ok(())
        })
        .context("Could not install WSL Kernel")
    }
}

fn install_prompt(admin: bool) -> String {
    let mut message = String::from("WSL is not installed on this system, installing it.\n\n");
    if !admin {
        message.push_str(
            "Since you are not running as admin, a new window will open and \
             require you to approve administrator privileges.\n\n",
        );
    }
    message.push_str(
        "NOTE: A system reboot will be required as part of this process. \
         If you prefer, you may abort now, and perform a manual installation using the \"wsl --install\" command.",
    );
    message
}

/// Make sure WSL is installed, elevating and rebooting as needed.
///
/// `reexec` is set in a process relaunched by this very routine, either
/// elevated or after the reboot. Returns [`Readiness::Deferred`] whenever
/// the rest of the operation must happen in another process.
pub(crate) fn check_and_install_wsl(
    reexec: bool,
    host: &dyn HostPrivileges,
    wsl: &dyn WslHost,
    inv: &Invocation,
    data_home: &Utf8Path,
) -> Result<Readiness> {
    if wsl.is_installed() {
        return Ok(Readiness::Ready);
    }
    let admin = host.is_elevated();
    let log = ElevatedOutputLog::new(data_home);

    if !wsl.feature_enabled() {
        let version = wsl.windows_version()?;
        if version < MIN_SUPPORTED_BUILD {
            return Err(eyre!(
                "Your version of Windows does not support WSL. Update to Windows 10 Build 19041 or later"
            ));
        }
        if version < MIN_AUTOMATIC_BUILD {
            eprint!("{MANUAL_INSTALL}");
            return Err(eyre!("WSL can not be automatically installed"));
        }
        if !reexec && !host.confirm(&install_prompt(admin))? {
            return Err(MachineError::PrivilegeRequired("WSL".into()).into());
        }
        if !reexec && !admin {
            return Ok(match launch_elevated(host, inv, &log, INSTALL_FEATURES)? {
                ElevatedResult::Completed => Readiness::Deferred(DeferReason::Elevated),
                ElevatedResult::RebootRequired => Readiness::Deferred(DeferReason::RebootRequired),
            });
        }
        wsl.enable_features(&log)?;
        return reboot_and_resume(host, inv, data_home).map(Readiness::Deferred);
    }

    if !reexec && !admin {
        return Ok(match launch_elevated(host, inv, &log, INSTALL_KERNEL)? {
            ElevatedResult::Completed => Readiness::Ready,
            ElevatedResult::RebootRequired => Readiness::Deferred(DeferReason::RebootRequired),
        });
    }
    if let Err(e) = wsl.install_kernel(&log) {
        eprint!("{}", install_failure_hint(INSTALL_KERNEL));
        return Err(e);
    }
    if reexec {
        return Ok(Readiness::Deferred(DeferReason::ElevatedChildDone));
    }
    Ok(Readiness::Ready)
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use similar_asserts::assert_eq;

    use super::*;
    use crate::elevate::tests::{invocation, FakeHost};
    use crate::errors::machine_error;

    struct Attempts(Cell<u32>);

    #[derive(Debug)]
    struct FakeWsl {
        installed: bool,
        feature: bool,
        version: (u32, u32, u32),
        calls: RefCell<Vec<&'static str>>,
    }

    impl Default for FakeWsl {
        fn default() -> Self {
            Self {
                installed: false,
                feature: false,
                version: (10, 0, 19045),
                calls: RefCell::default(),
            }
        }
    }

    impl WslHost for FakeWsl {
        fn is_installed(&self) -> bool {
            self.installed
        }
        fn feature_enabled(&self) -> bool {
            self.feature
        }
        fn windows_version(&self) -> Result<(u32, u32, u32)> {
            Ok(self.version)
        }
        fn enable_features(&self, _log: &ElevatedOutputLog) -> Result<()> {
            self.calls.borrow_mut().push("enable_features");
            Ok(())
        }
        fn install_kernel(&self, _log: &ElevatedOutputLog) -> Result<()> {
            self.calls.borrow_mut().push("install_kernel");
            Ok(())
        }
    }

    fn check(reexec: bool, host: &FakeHost, wsl: &FakeWsl) -> Result<Readiness> {
        let td = tempfile::tempdir().unwrap();
        let home = Utf8Path::from_path(td.path()).unwrap();
        check_and_install_wsl(reexec, host, wsl, &invocation(), home)
    }

    #[test]
    fn test_parse_windows_version() {
        assert_eq!(
            parse_windows_version("\r\nMicrosoft Windows [Version 10.0.19045.3570]\r\n"),
            Some((10, 0, 19045))
        );
        assert_eq!(parse_windows_version("garbage"), None);
        assert!((10, 0, 18363) < MIN_AUTOMATIC_BUILD);
        assert!((10, 0, 22631) >= MIN_AUTOMATIC_BUILD);
    }

    #[test]
    fn test_reports_missing_kernel() {
        assert!(reports_missing_kernel(
            "Default Version: 2\r\nThe WSL 2 kernel file is not found. To update...\r\n"
        ));
        assert!(!reports_missing_kernel("Default Version: 2\r\n"));
    }

    #[test]
    fn test_retry_with_backoff() {
        let n = Attempts(Cell::new(0));
        let r: Result<()> = retry_with_backoff(5, Duration::ZERO, || {
            n.0.set(n.0.get() + 1);
            Err(eyre!("nope"))
        });
        assert!(r.is_err());
        assert_eq!(n.0.get(), 5);

        n.0.set(0);
        let r = retry_with_backoff(5, Duration::ZERO, || {
            n.0.set(n.0.get() + 1);
            if n.0.get() < 3 {
                Err(eyre!("not yet"))
            } else {
                Ok(n.0.get())
            }
        });
        assert_eq!(r.unwrap(), 3);
    }

    #[test]
    fn test_installed_is_ready() {
        let host = FakeHost::default();
        let wsl = FakeWsl {
            installed: true,
            ..Default::default()
        };
        assert_eq!(check(false, &host, &wsl).unwrap(), Readiness::Ready);
        assert!(host.calls.borrow().is_empty());
    }

    #[test]
    fn test_old_windows() {
        let host = FakeHost::default();
        let mut wsl = FakeWsl {
            version: (10, 0, 17763),
            ..Default::default()
        };
        let e = check(false, &host, &wsl).unwrap_err();
        assert!(e.to_string().contains("does not support WSL"));
        wsl.version = (10, 0, 18363);
        let e = check(false, &host, &wsl).unwrap_err();
        assert_eq!(e.to_string(), "WSL can not be automatically installed");
        assert!(host.calls.borrow().is_empty());
    }

    #[test]
    fn test_declined() {
        let host = FakeHost::default();
        let wsl = FakeWsl::default();
        let e = check(false, &host, &wsl).unwrap_err();
        assert_eq!(
            machine_error(&e),
            Some(&MachineError::PrivilegeRequired("WSL".into()))
        );
        assert_eq!(*host.calls.borrow(), ["confirm"]);
        assert!(wsl.calls.borrow().is_empty());
    }

    #[test]
    fn test_features_via_elevated_child() {
        let host = FakeHost {
            accept: true,
            ..Default::default()
        };
        let wsl = FakeWsl::default();
        assert_eq!(
            check(false, &host, &wsl).unwrap(),
            Readiness::Deferred(DeferReason::Elevated)
        );
        assert_eq!(
            *host.calls.borrow(),
            ["confirm", "relaunch init --reexec dev"]
        );
        assert!(wsl.calls.borrow().is_empty());
    }

    #[test]
    fn test_features_in_elevated_child_reboots() {
        let host = FakeHost {
            elevated: true,
            ..Default::default()
        };
        let wsl = FakeWsl::default();
        assert_eq!(
            check(true, &host, &wsl).unwrap(),
            Readiness::Deferred(DeferReason::RebootInitiated)
        );
        assert_eq!(*wsl.calls.borrow(), ["enable_features"]);
        let calls = host.calls.borrow();
        assert!(calls[0].starts_with("register "), "{calls:?}");
        assert_eq!(calls[1], "reboot");
    }

    #[test]
    fn test_kernel_via_elevated_child() {
        let mut host = FakeHost::default();
        let wsl = FakeWsl {
            feature: true,
            ..Default::default()
        };
        assert_eq!(check(false, &host, &wsl).unwrap(), Readiness::Ready);
        host.child_exit = crate::elevate::ERROR_SUCCESS_REBOOT_REQUIRED;
        assert_eq!(
            check(false, &host, &wsl).unwrap(),
            Readiness::Deferred(DeferReason::RebootRequired)
        );
        host.child_exit = 1;
        assert!(check(false, &host, &wsl).is_err());
        assert!(wsl.calls.borrow().is_empty());
    }

    #[test]
    fn test_kernel_installed_directly() {
        let host = FakeHost {
            elevated: true,
            ..Default::default()
        };
        let wsl = FakeWsl {
            feature: true,
            ..Default::default()
        };
        assert_eq!(check(false, &host, &wsl).unwrap(), Readiness::Ready);
        assert_eq!(
            check(true, &host, &wsl).unwrap(),
            Readiness::Deferred(DeferReason::ElevatedChildDone)
        );
        assert_eq!(*wsl.calls.borrow(), ["install_kernel", "install_kernel"]);
        assert!(host.calls.borrow().is_empty());
    }
}
