//! SSH credential injection for QEMU machines
//!
//! The public key reaches the guest as a systemd credential carried in an
//! SMBIOS OEM string; `systemd-tmpfiles` turns it into `authorized_keys`
//! entries for root and the remote user on every boot. A second
//! credential has `systemd-sysusers` create the remote user itself.

use data_encoding::BASE64;

/// SMBIOS credential string installing `pubkey` for root and `user`.
///
/// Returns a value for `qemu -smbios type=11,value=...`.
pub(crate) fn smbios_cred_for_ssh(pubkey: &str, user: &str) -> String {
    let k = key_to_tmpfiles_d(pubkey, user);
    let encoded = BASE64.encode(k.as_bytes());
    format!("io.systemd.credential.binary:tmpfiles.extra={encoded}")
}

/// UID given to the remote user inside the guest.
pub(crate) const GUEST_UID: u32 = 1000;

/// SMBIOS credential creating `user` in the guest, or `None` for root.
pub(crate) fn smbios_cred_for_user(user: &str) -> Option<String> {
    if user == "root" {
        return None;
    }
    let encoded = BASE64.encode(user_to_sysusers_d(user).as_bytes());
    Some(format!(
        "io.systemd.credential.binary:sysusers.extra={encoded}"
    ))
}

/// sysusers.d lines for a login user in `wheel`.
pub(crate) fn user_to_sysusers_d(user: &str) -> String {
    format!("u {user} {GUEST_UID} \"{user}\" /home/{user} /bin/bash\nm {user} wheel")
}

/// tmpfiles.d lines creating `~/.ssh/authorized_keys` for root and `user`.
///
/// Uses `f+~` so that the Base64 payload is decoded and appended to an
/// existing file.
pub(crate) fn key_to_tmpfiles_d(pubkey: &str, user: &str) -> String {
    let buf = BASE64.encode(pubkey.as_bytes());
    let mut r = String::from("d /root/.ssh 0750 - - -\n");
    r.push_str(&format!("f+~ /root/.ssh/authorized_keys 700 - - - {buf}"));
    if user != "root" {
        r.push_str(&format!(
            "\nd /home/{user} 0700 {user} {user} -\nd /home/{user}/.ssh 0750 {user} {user} -\nf+~ /home/{user}/.ssh/authorized_keys 700 {user} {user} - {buf}"
        ));
    }
    r
}
