//! Full machine lifecycle against the host's real backend.
//!
//! Only run when explicitly requested; it downloads an image and boots it.

use color_eyre::Result;
use serde_json::Value;
use xshell::cmd;

use crate::{get_machinekit_command, isolated_shell};

pub fn test_machine_lifecycle() -> Result<()> {
    let (sh, _home) = isolated_shell()?;
    let mk = get_machinekit_command()?;
    let name = format!("it-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);

    cmd!(sh, "{mk} init {name} --cpus 2 --memory 2G --disk-size 20").run()?;
    let r = (|| -> Result<()> {
        cmd!(sh, "{mk} start {name}").run()?;
        let info: Value = serde_json::from_str(&cmd!(sh, "{mk} inspect {name}").read()?)?;
        assert_eq!(info[0]["State"], "running");

        let out = cmd!(sh, "{mk} ssh {name} -- echo hello").read()?;
        assert_eq!(out.trim(), "hello");

        // Starting twice is an error, stopping twice is not.
        let again = cmd!(sh, "{mk} start {name}").ignore_status().output()?;
        assert!(!again.status.success());
        cmd!(sh, "{mk} stop {name}").run()?;
        cmd!(sh, "{mk} stop {name}").run()?;

        let list: Value = serde_json::from_str(&cmd!(sh, "{mk} list --json").read()?)?;
        assert_eq!(list[0]["Name"], name.as_str());
        assert_eq!(list[0]["Running"], false);
        assert!(list[0]["LastUp"].is_string());
        Ok(())
    })();
    cmd!(sh, "{mk} rm -f {name}").run()?;
    r?;

    let list: Value = serde_json::from_str(&cmd!(sh, "{mk} list --json").read()?)?;
    assert_eq!(list, Value::Array(vec![]));
    Ok(())
}
