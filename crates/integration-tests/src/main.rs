use std::path::Path;

use color_eyre::eyre::eyre;
use color_eyre::Result;
use libtest_mimic::{Arguments, Trial};
use xshell::Shell;

mod tests {
    pub mod cli;
    pub mod lifecycle;
}

/// Opts into tests that create real machines (downloads an image, needs
/// the backend installed).
pub(crate) const LIFECYCLE_ENV: &str = "MACHINEKIT_IT_LIFECYCLE";

/// Get the path to the machinekit binary, checking MACHINEKIT_PATH first,
/// then falling back to "machinekit"
pub(crate) fn get_machinekit_command() -> Result<String> {
    if let Ok(path) = std::env::var("MACHINEKIT_PATH") {
        return Ok(path);
    }
    // Force the user to set this if we're running from the project dir
    if let Some(path) = ["target/debug/machinekit", "target/release/machinekit"]
        .into_iter()
        .find(|p| Path::new(p).exists())
    {
        return Err(eyre!(
            "Detected {path} - set MACHINEKIT_PATH={path} to run using this binary"
        ));
    }
    Ok("machinekit".to_owned())
}

/// A shell whose machinekit state lives in a fresh temporary home.
pub(crate) fn isolated_shell() -> Result<(Shell, tempfile::TempDir)> {
    let home = tempfile::tempdir()?;
    let sh = Shell::new()?;
    sh.set_var("MACHINEKIT_HOME", home.path());
    Ok((sh, home))
}

fn main() {
    let args = Arguments::from_args();
    let lifecycle = std::env::var_os(LIFECYCLE_ENV).is_none();

    let tests = vec![
        Trial::test("list_json_empty", || {
            tests::cli::test_list_json_empty()?;
            Ok(())
        }),
        Trial::test("missing_machine_errors", || {
            tests::cli::test_missing_machine_errors()?;
            Ok(())
        }),
        Trial::test("unsupported_provider", || {
            tests::cli::test_unsupported_provider()?;
            Ok(())
        }),
        Trial::test("ports_normalization", || {
            tests::cli::test_ports_normalization()?;
            Ok(())
        }),
        Trial::test("machine_lifecycle", || {
            tests::lifecycle::test_machine_lifecycle()?;
            Ok(())
        })
        .with_ignored_flag(lifecycle),
    ];

    libtest_mimic::run(&args, tests).exit();
}
