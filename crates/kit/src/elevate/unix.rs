//! Unix hosts: elevation through sudo, no reboot-resume.

use std::process::Command;

use color_eyre::{eyre::eyre, Result};

use super::{HostPrivileges, Invocation, REEXEC_FLAG};
use crate::errors::MachineError;

#[derive(Debug)]
pub(crate) struct UnixHost;

impl HostPrivileges for UnixHost {
    fn is_elevated(&self) -> bool {
        rustix::process::geteuid().is_root()
    }

    fn relaunch_elevated_wait(&self, inv: &Invocation) -> Result<i32> {
        let mut args: Vec<&str> = inv
            .args
            .iter()
            .map(String::as_str)
            .filter(|a| *a != REEXEC_FLAG)
            .collect();
        let at = args.iter().position(|a| *a == "init").map_or(args.len(), |i| i + 1);
        args.insert(at, REEXEC_FLAG);
        let status = Command::new("sudo")
            .arg(inv.exe.as_str())
            .args(args)
            .current_dir(&inv.cwd)
            .status()?;
        status
            .code()
            .ok_or_else(|| eyre!("Elevated process terminated by a signal"))
    }

    fn register_resume(&self, _command: &str) -> Result<()> {
        Err(eyre!("Resuming after reboot is not supported on this host"))
    }

    fn reboot(&self) -> Result<()> {
        Err(MachineError::RebootRequired("this host must be rebooted manually".into()).into())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::errors::machine_error;

    #[test]
    fn test_reboot_is_left_to_the_user() {
        let e = UnixHost.reboot().unwrap_err();
        assert_eq!(
            machine_error(&e),
            Some(&MachineError::RebootRequired(
                "this host must be rebooted manually".into()
            ))
        );
    }
}
