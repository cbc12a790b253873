//! Command line behavior that needs no backend.

use color_eyre::eyre::eyre;
use color_eyre::Result;
use serde_json::Value;
use xshell::cmd;

use crate::{get_machinekit_command, isolated_shell};

pub fn test_list_json_empty() -> Result<()> {
    let (sh, _home) = isolated_shell()?;
    let mk = get_machinekit_command()?;
    let stdout = cmd!(sh, "{mk} list --json").read()?;
    let v: Value = serde_json::from_str(&stdout)?;
    assert_eq!(v, Value::Array(vec![]), "unexpected output: {stdout}");
    Ok(())
}

pub fn test_missing_machine_errors() -> Result<()> {
    let (sh, _home) = isolated_shell()?;
    let mk = get_machinekit_command()?;
    for verb in ["start", "stop", "inspect", "ssh-config"] {
        let output = cmd!(sh, "{mk} {verb} nosuch").ignore_status().output()?;
        assert!(!output.status.success(), "{verb} succeeded");
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(
            stderr.contains(r#"no such machine: "nosuch""#),
            "{verb}: {stderr}"
        );
    }
    Ok(())
}

pub fn test_unsupported_provider() -> Result<()> {
    let (sh, _home) = isolated_shell()?;
    let mk = get_machinekit_command()?;
    let output = cmd!(sh, "{mk} list")
        .env("MACHINEKIT_PROVIDER", "hyperv")
        .ignore_status()
        .output()?;
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains(r#"provider "hyperv" is not supported"#), "{stderr}");
    Ok(())
}

pub fn test_ports_normalization() -> Result<()> {
    let (sh, _home) = isolated_shell()?;
    let mk = get_machinekit_command()?;
    let input = r#"[{"HostIP": "0.0.0.0", "HostPort": 8080, "ContainerPort": 80, "Protocol": "tcp"}]"#;

    let split = cmd!(sh, "{mk} internals ports --vm-type wsl")
        .stdin(input)
        .read()?;
    let split: Value = serde_json::from_str(&split)?;
    let hosts: Vec<_> = split
        .as_array()
        .ok_or_else(|| eyre!("expected an array: {split}"))?
        .iter()
        .map(|p| (p["HostIP"].clone(), p["Protocol"].clone()))
        .collect();
    assert_eq!(
        hosts,
        [
            (Value::from("0.0.0.0"), Value::from("tcp4")),
            (Value::from("::"), Value::from("tcp6")),
        ]
    );

    let dropped = cmd!(sh, "{mk} internals ports --vm-type qemu")
        .stdin(input)
        .read()?;
    let dropped: Value = serde_json::from_str(&dropped)?;
    assert_eq!(dropped[0]["HostIP"], "");
    assert_eq!(dropped[0]["Range"], 1);
    Ok(())
}
