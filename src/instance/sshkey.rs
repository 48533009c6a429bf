// SPDX-License-Identifier: GPL-2.0-or-later

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use ssh_key::private::Ed25519Keypair;
use ssh_key::rand_core::OsRng;
use ssh_key::{LineEnding, PrivateKey};

/// Generate the per-instance Ed25519 identity. The private key is written
/// PEM-armored with mode 0600, the public key as a single OpenSSH line with
/// comment `qemu-compose-<vmid>`. Returns the public key line bytes for
/// SMBIOS credential injection.
pub fn prepare_ssh_key(instance_dir: impl AsRef<Path>, vmid: &str) -> io::Result<Vec<u8>> {
    let instance_dir = instance_dir.as_ref();
    let priv_path = instance_dir.join("ssh-key");
    let pub_path = instance_dir.join("ssh-key.pub");

    let keypair = Ed25519Keypair::random(&mut OsRng);
    let private = PrivateKey::from(keypair);

    let priv_pem = private
        .to_openssh(LineEnding::LF)
        .map_err(io::Error::other)?;
    fs::write(&priv_path, priv_pem.as_bytes())?;
    fs::set_permissions(&priv_path, fs::Permissions::from_mode(0o600))?;

    let pub_line = private
        .public_key()
        .to_openssh()
        .map_err(io::Error::other)?;
    let pub_with_comment = format!("{} qemu-compose-{}\n", pub_line.trim_end(), vmid);
    fs::write(&pub_path, pub_with_comment.as_bytes())?;

    Ok(pub_with_comment.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_files_and_comment() {
        let tmp = tempfile::tempdir().unwrap();
        let pub_bytes = prepare_ssh_key(tmp.path(), "abc123def456").unwrap();

        let pub_line = String::from_utf8(pub_bytes).unwrap();
        assert!(pub_line.starts_with("ssh-ed25519 "));
        assert!(pub_line.ends_with("qemu-compose-abc123def456\n"));

        let priv_content = fs::read_to_string(tmp.path().join("ssh-key")).unwrap();
        assert!(priv_content.contains("BEGIN OPENSSH PRIVATE KEY"));

        let mode = fs::metadata(tmp.path().join("ssh-key"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);

        let on_disk = fs::read_to_string(tmp.path().join("ssh-key.pub")).unwrap();
        assert_eq!(on_disk, pub_line);
    }

    #[test]
    fn fresh_keys_differ() {
        let tmp = tempfile::tempdir().unwrap();
        let a = prepare_ssh_key(tmp.path(), "one").unwrap();
        let b = prepare_ssh_key(tmp.path(), "two").unwrap();
        assert_ne!(a, b);
    }
}
