// SPDX-License-Identifier: GPL-2.0-or-later

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// On-disk layout under the per-user data root:
/// `${XDG_DATA_HOME:-$HOME/.local/share}/qemu-compose/{image,instance}/`.
#[derive(Debug, Clone)]
pub struct LocalStore {
    data_dir: PathBuf,
}

impl LocalStore {
    pub fn new() -> io::Result<Self> {
        Self::with_name("qemu-compose")
    }

    pub fn with_name(name: &str) -> io::Result<Self> {
        let base = match std::env::var_os("XDG_DATA_HOME") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => home::home_dir()
                .ok_or_else(|| io::Error::other("could not determine home directory"))?
                .join(".local/share"),
        };

        let data_dir = base.join(name);
        fs::create_dir_all(&data_dir)?;

        Ok(LocalStore { data_dir })
    }

    /// Build a store rooted at an explicit directory, without touching the
    /// user's data root.
    #[cfg(test)]
    pub fn at(data_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;
        Ok(LocalStore { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn image_root(&self) -> io::Result<PathBuf> {
        let path = self.data_dir.join("image");
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    pub fn instance_root(&self) -> io::Result<PathBuf> {
        let path = self.data_dir.join("instance");
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    pub fn image_dir(&self, image_id: &str) -> io::Result<PathBuf> {
        Ok(self.image_root()?.join(image_id))
    }

    /// Instance directory path; created with parents.
    pub fn instance_dir(&self, vmid: &str) -> io::Result<PathBuf> {
        let path = self.instance_root()?.join(vmid);
        fs::create_dir_all(&path)?;
        Ok(path)
    }
}
