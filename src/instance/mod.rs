// SPDX-License-Identifier: GPL-2.0-or-later

pub mod lock;
pub mod names;
pub mod runner;
pub mod sshkey;
pub mod virtiofs;

use std::collections::BTreeMap;
use std::path::Path;

use rand::seq::SliceRandom;

use crate::error::{Error, IdentKind, Result};
use crate::image::list_subdirs;
use crate::util::safe_read;

/// Unambiguous alphabet for instance ids: no `0/O/1/l/I`.
pub const VMID_ALPHABET: &[u8] = b"23456789abcdefghjkmnpqrstuvwxyzABCDEFGHJKMNPQRSTUVWXYZ";
pub const VMID_LEN: usize = 12;

/// Draw a fresh vmid, redrawing on the (negligible, but checked) chance that
/// a directory with that name already exists.
pub fn new_random_vmid(instance_root: impl AsRef<Path>) -> String {
    let mut rng = rand::thread_rng();
    loop {
        let vmid: String = (0..VMID_LEN)
            .map(|_| *VMID_ALPHABET.choose(&mut rng).unwrap_or(&b'q') as char)
            .collect();
        if !instance_root.as_ref().join(&vmid).exists() {
            return vmid;
        }
    }
}

pub fn list_instance_ids(instance_root: impl AsRef<Path>) -> Vec<String> {
    list_subdirs(instance_root)
}

/// `name -> vmid` index built from the `name` file of every instance.
pub fn build_name_index(instance_root: impl AsRef<Path>) -> BTreeMap<String, String> {
    let instance_root = instance_root.as_ref();
    let mut index = BTreeMap::new();
    for vmid in list_instance_ids(instance_root) {
        if let Some(name) = safe_read(instance_root.join(&vmid).join("name")) {
            index.insert(name, vmid);
        }
    }
    index
}

/// Resolve an instance token: exact id, then exact name, then unique id
/// prefix.
pub fn resolve_instance(instance_root: impl AsRef<Path>, token: &str) -> Result<String> {
    let instance_root = instance_root.as_ref();
    let ids = list_instance_ids(instance_root);

    if ids.iter().any(|i| i == token) {
        return Ok(token.to_string());
    }

    let name_index = build_name_index(instance_root);
    if let Some(vmid) = name_index.get(token) {
        return Ok(vmid.clone());
    }

    let matches: Vec<String> = ids.into_iter().filter(|i| i.starts_with(token)).collect();
    match matches.len() {
        1 => Ok(matches.into_iter().next().unwrap_or_default()),
        0 => Err(Error::InstanceNotFound {
            token: token.to_string(),
        }),
        _ => Err(Error::Ambiguous {
            kind: IdentKind::Instance,
            token: token.to_string(),
            matches,
        }),
    }
}

/// Per-instance metadata snapshot used by `ps` and the `ssh` helper.
#[derive(Debug, Clone)]
pub struct InstanceMeta {
    pub instance_id: String,
    pub name: Option<String>,
    pub image: Option<String>,
    pub cid: Option<u32>,
    pub pid: Option<i32>,
}

impl InstanceMeta {
    pub fn read(instance_root: impl AsRef<Path>, instance_id: &str) -> InstanceMeta {
        let base = instance_root.as_ref().join(instance_id);
        InstanceMeta {
            instance_id: instance_id.to_string(),
            name: safe_read(base.join("name")),
            image: safe_read(base.join("image")),
            cid: safe_read(base.join("cid")).and_then(|s| s.parse().ok()),
            pid: safe_read(base.join("qemu.pid")).and_then(|s| s.parse().ok()),
        }
    }

    pub fn is_running(&self) -> bool {
        match self.pid {
            Some(pid) if pid > 0 => {
                nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
            }
            _ => false,
        }
    }
}

pub fn collect_instances(instance_root: impl AsRef<Path>) -> Vec<InstanceMeta> {
    let instance_root = instance_root.as_ref();
    list_instance_ids(instance_root)
        .into_iter()
        .map(|iid| InstanceMeta::read(instance_root, &iid))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn vmid_uses_unambiguous_alphabet() {
        let tmp = tempfile::tempdir().unwrap();
        for _ in 0..32 {
            let vmid = new_random_vmid(tmp.path());
            assert_eq!(vmid.len(), VMID_LEN);
            assert!(vmid.bytes().all(|b| VMID_ALPHABET.contains(&b)));
            for forbidden in ['0', 'O', '1', 'l', 'I'] {
                assert!(!vmid.contains(forbidden));
            }
        }
    }

    #[test]
    fn vmid_avoids_existing_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let taken = new_random_vmid(tmp.path());
        fs::create_dir(tmp.path().join(&taken)).unwrap();
        for _ in 0..16 {
            assert_ne!(new_random_vmid(tmp.path()), taken);
        }
    }

    fn seed_instance(root: &Path, vmid: &str, name: Option<&str>) {
        let dir = root.join(vmid);
        fs::create_dir_all(&dir).unwrap();
        if let Some(name) = name {
            fs::write(dir.join("name"), name).unwrap();
        }
    }

    #[test]
    fn resolve_exact_then_name_then_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        seed_instance(tmp.path(), "abc123def456", Some("web"));
        seed_instance(tmp.path(), "xyz999xyz999", Some("db"));

        assert_eq!(
            resolve_instance(tmp.path(), "abc123def456").unwrap(),
            "abc123def456"
        );
        assert_eq!(resolve_instance(tmp.path(), "db").unwrap(), "xyz999xyz999");
        assert_eq!(resolve_instance(tmp.path(), "abc").unwrap(), "abc123def456");
    }

    #[test]
    fn resolve_reports_ambiguity_and_absence() {
        let tmp = tempfile::tempdir().unwrap();
        seed_instance(tmp.path(), "abc111111111", None);
        seed_instance(tmp.path(), "abc222222222", None);

        match resolve_instance(tmp.path(), "abc") {
            Err(Error::Ambiguous { matches, .. }) => assert_eq!(matches.len(), 2),
            other => panic!("expected ambiguity, got {:?}", other.map(|_| ())),
        }

        assert!(matches!(
            resolve_instance(tmp.path(), "zzz"),
            Err(Error::InstanceNotFound { .. })
        ));
    }
}
