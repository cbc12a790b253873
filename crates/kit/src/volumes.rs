//! Translating host volume paths into WSL guest paths.

use std::path::Path;

use color_eyre::{eyre::eyre, Result};

/// Convert a host path to where a WSL guest sees it.
///
/// `exists` reports whether a drive root such as `C:\` is present; it
/// decides whether a `/c/...` path names a drive or a plain Unix path.
pub(crate) fn convert_mount_path(path: &str, exists: impl Fn(&str) -> bool) -> Result<String> {
    if path.starts_with(r"\\?\") || (path.starts_with(r"\\") && !path.starts_with(r"\\.\")) {
        return Err(eyre!("UNC paths are not supported: {path}"));
    }
    if let Some(rest) = path.strip_prefix(r"\\.\") {
        return Ok(format!("/mnt/wsl/{}", rest.replace('\\', "/")));
    }
    if let Some((drive, rest)) = split_drive(path) {
        return Ok(drive_path(drive, rest));
    }
    if let Some((drive, rest)) = split_unix_drive(path) {
        if exists(&format!("{}:\\", drive.to_ascii_uppercase())) {
            return Ok(drive_path(drive, rest));
        }
    }
    Ok(path.to_owned())
}

/// The host's own drive check.
pub(crate) fn drive_exists(root: &str) -> bool {
    Path::new(root).exists()
}

fn drive_path(drive: char, rest: &str) -> String {
    let rest = rest.replace('\\', "/");
    let rest = rest.trim_start_matches('/');
    let mut r = format!("/mnt/{}", drive.to_ascii_lowercase());
    if !rest.is_empty() {
        r.push('/');
        r.push_str(rest);
    }
    r
}

/// `C:\x` or `C:/x`
fn split_drive(path: &str) -> Option<(char, &str)> {
    let mut chars = path.chars();
    let drive = chars.next().filter(char::is_ascii_alphabetic)?;
    if chars.next() != Some(':') {
        return None;
    }
    let rest = &path[2..];
    if rest.is_empty() || rest.starts_with(['\\', '/']) {
        Some((drive, rest))
    } else {
        None
    }
}

/// `/c/x` as written by MSYS-style shells
fn split_unix_drive(path: &str) -> Option<(char, &str)> {
    let rest = path.strip_prefix('/')?;
    let mut chars = rest.chars();
    let drive = chars.next().filter(char::is_ascii_alphabetic)?;
    let after = &rest[1..];
    if after.is_empty() || after.starts_with('/') {
        Some((drive, after))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn only_c(root: &str) -> bool {
        root == r"C:\"
    }

    #[test]
    fn test_convert_mount_path() {
        let cases = [
            (r"C:\Users\me\src", "/mnt/c/Users/me/src"),
            ("d:/data", "/mnt/d/data"),
            (r"C:\", "/mnt/c"),
            ("/c/Users/me", "/mnt/c/Users/me"),
            ("/d/data", "/d/data"),
            ("/home/me/src", "/home/me/src"),
            ("/c", "/mnt/c"),
            (r"\\.\podman-dev\etc", "/mnt/wsl/podman-dev/etc"),
            ("relative/dir", "relative/dir"),
        ];
        for (input, expected) in cases {
            assert_eq!(convert_mount_path(input, only_c).unwrap(), expected, "{input}");
        }
    }

    #[test]
    fn test_unc_rejected() {
        for p in [r"\\server\share\x", r"\\?\C:\x"] {
            assert!(convert_mount_path(p, only_c).is_err(), "{p}");
        }
    }
}
